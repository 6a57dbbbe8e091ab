/*
Copyright 2017 Takashi Ogura

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use graspi::{
    ActuatorKind, ActuatorTarget, ClosingSpec, GraspCandidate, GripperDescriptor, JointLimit,
    JointState, SteppableWorld,
};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::GraspTrialConfig,
    contact::{ContactMonitor, ContactSample, ContactTrace},
    error::PhaseError,
    scene::SimulationHandle,
    stability::PoseSample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Approach,
    Align,
    Close,
    Lift,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Approach, Phase::Align, Phase::Close, Phase::Lift];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Approach => "approach",
            Phase::Align => "align",
            Phase::Close => "close",
            Phase::Lift => "lift",
        })
    }
}

/// How a phase ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    PoseReached,
    Grasped { contact_links: Vec<String> },
    Missed { contact_links: Vec<String> },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub completed: bool,
    pub steps_used: u64,
    pub terminal_state: TerminalState,
}

/// Cooperative cancellation flag checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Poses and closing motion of one candidate, in the world frame.
#[derive(Debug, Clone)]
pub struct GraspPlan {
    pub pregrasp_pose: Isometry3<f64>,
    pub grasp_pose: Isometry3<f64>,
    pub closing: ClosingSpec,
}

impl GraspPlan {
    pub fn new(candidate: &GraspCandidate, object_pose: &Isometry3<f64>) -> Self {
        Self {
            pregrasp_pose: object_pose * candidate.pregrasp_pose(),
            grasp_pose: object_pose * candidate.target_pose,
            closing: candidate.closing.clone(),
        }
    }
}

/// Trapezoidal velocity profile over a straight segment.
///
/// Degenerates to a triangular profile when the segment is too short to
/// reach the cruise velocity.
#[derive(Debug, Clone, Copy)]
pub struct TrapezoidalProfile {
    distance: f64,
    acceleration: f64,
    peak_velocity: f64,
    accel_time: f64,
    cruise_time: f64,
}

impl TrapezoidalProfile {
    pub fn new(distance: f64, velocity: f64, acceleration: f64) -> Self {
        let peak_velocity = velocity.min((distance * acceleration).sqrt());
        let accel_time = peak_velocity / acceleration;
        let accel_distance = 0.5 * acceleration * accel_time * accel_time;
        let cruise_time = if peak_velocity > 0.0 {
            (distance - 2.0 * accel_distance).max(0.0) / peak_velocity
        } else {
            0.0
        };
        Self {
            distance,
            acceleration,
            peak_velocity,
            accel_time,
            cruise_time,
        }
    }

    pub fn duration(&self) -> f64 {
        2.0 * self.accel_time + self.cruise_time
    }

    /// Travelled distance at `t`.
    pub fn position(&self, t: f64) -> f64 {
        let a = self.acceleration;
        let t = t.clamp(0.0, self.duration());
        let accel_distance = 0.5 * a * self.accel_time * self.accel_time;
        if t < self.accel_time {
            0.5 * a * t * t
        } else if t < self.accel_time + self.cruise_time {
            accel_distance + self.peak_velocity * (t - self.accel_time)
        } else {
            let remaining = self.duration() - t;
            self.distance - 0.5 * a * remaining * remaining
        }
    }
}

/// Constant speed interpolation between two poses.
#[derive(Debug, Clone, Copy)]
struct PoseInterpolation {
    start: Isometry3<f64>,
    translation: Vector3<f64>,
    rotation: Vector3<f64>,
    steps: u64,
}

impl PoseInterpolation {
    fn new(
        start: Isometry3<f64>,
        goal: &Isometry3<f64>,
        speed: f64,
        angular_speed: f64,
        dt: f64,
    ) -> Self {
        let translation = goal.translation.vector - start.translation.vector;
        let rotation = (goal.rotation * start.rotation.inverse()).scaled_axis();
        let duration = (translation.norm() / speed).max(rotation.norm() / angular_speed);
        Self {
            start,
            translation,
            rotation,
            steps: ((duration / dt).ceil() as u64).max(1),
        }
    }

    fn at(&self, step: u64) -> Isometry3<f64> {
        let s = (step as f64 / self.steps as f64).min(1.0);
        Isometry3::from_parts(
            Translation3::from(self.start.translation.vector + self.translation * s),
            UnitQuaternion::from_scaled_axis(self.rotation * s) * self.start.rotation,
        )
    }
}

fn pose_error(current: &Isometry3<f64>, goal: &Isometry3<f64>) -> (f64, f64) {
    (
        (goal.translation.vector - current.translation.vector).norm(),
        (goal.rotation * current.rotation.inverse()).angle(),
    )
}

/// What the controller records while driving Close and Lift.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub contacts: ContactTrace,
    pub poses: Vec<PoseSample>,
}

impl Recorder {
    fn record_pose<W: SteppableWorld>(
        &mut self,
        handle: &SimulationHandle<W>,
    ) -> Result<(), graspi::Error> {
        self.poses.push(PoseSample {
            step: handle.step_count(),
            object: handle.object_state()?,
            gripper: handle.gripper_state()?,
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ClosingState {
    waypoints: Vec<Vec<f64>>,
    efforts: Option<Vec<f64>>,
    index: usize,
    /// Positions guarded fingers are held at.
    guards: Vec<Option<f64>>,
}

impl ClosingState {
    fn new(closing: &ClosingSpec, dof: usize) -> Self {
        let efforts = match closing {
            ClosingSpec::Efforts(efforts) => Some(efforts.clone()),
            _ => None,
        };
        Self {
            waypoints: closing.waypoints(),
            efforts,
            index: 0,
            guards: vec![None; dof],
        }
    }

    fn goal(&self, joint: usize) -> Option<f64> {
        self.waypoints.get(self.index).map(|w| w[joint])
    }

    fn is_last_waypoint(&self) -> bool {
        self.index + 1 >= self.waypoints.len()
    }
}

/// Converts grasp phases into per-step actuator targets.
#[derive(Debug)]
pub struct MotionController {
    config: Arc<GraspTrialConfig>,
    monitor: ContactMonitor,
    actuator: ActuatorKind,
    joint_names: Vec<String>,
    joint_links: Vec<String>,
    limits: Vec<JointLimit>,
    open_positions: Vec<f64>,
    cancel: CancelToken,
    deadline: Option<(Instant, Duration)>,
    closing: Option<ClosingState>,
}

impl MotionController {
    pub fn new(config: Arc<GraspTrialConfig>, gripper: &GripperDescriptor) -> Self {
        Self {
            monitor: ContactMonitor::new(config.contact.force_noise_floor),
            config,
            actuator: gripper.actuator,
            joint_names: gripper.joint_names(),
            joint_links: gripper.actuated_joints().map(|j| j.child.clone()).collect(),
            limits: gripper.limits(),
            open_positions: gripper.open_positions(),
            cancel: CancelToken::default(),
            deadline: None,
            closing: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fails every later step once `timeout` has passed since `start`.
    pub fn with_deadline(mut self, start: Instant, timeout: Duration) -> Self {
        self.deadline = Some((start, timeout));
        self
    }

    pub fn monitor(&self) -> &ContactMonitor {
        &self.monitor
    }

    /// Drives one phase until it completes or `max_steps` steps are used.
    ///
    /// Close and Lift record a contact sample per step, Lift also records the
    /// object and gripper poses.
    pub fn drive<W: SteppableWorld>(
        &mut self,
        handle: &mut SimulationHandle<W>,
        phase: Phase,
        plan: &GraspPlan,
        max_steps: u64,
        recorder: &mut Recorder,
    ) -> Result<PhaseOutcome, PhaseError> {
        debug!(%phase, max_steps, step = handle.step_count(), "start phase");
        let outcome = match phase {
            Phase::Approach => self.move_base(handle, phase, &plan.pregrasp_pose, max_steps)?,
            Phase::Align => self.move_base(handle, phase, &plan.grasp_pose, max_steps)?,
            Phase::Close => self.close(handle, plan, max_steps, recorder)?,
            Phase::Lift => self.lift(handle, max_steps, recorder)?,
        };
        debug!(
            %phase,
            completed = outcome.completed,
            steps_used = outcome.steps_used,
            terminal_state = ?outcome.terminal_state,
            "end phase"
        );
        Ok(outcome)
    }

    fn check_interrupt(&self) -> Result<(), PhaseError> {
        if self.cancel.is_canceled() {
            return Err(PhaseError::Canceled);
        }
        if let Some((start, timeout)) = self.deadline {
            if start.elapsed() > timeout {
                return Err(PhaseError::WallClockTimeout(timeout));
            }
        }
        Ok(())
    }

    /// Steps the world once and samples the contacts.
    fn step<W: SteppableWorld>(
        &self,
        handle: &mut SimulationHandle<W>,
        phase: Phase,
    ) -> Result<ContactSample, PhaseError> {
        handle.step()?;
        if let Some(reason) = handle.check_divergence(&self.config.divergence)? {
            warn!(%phase, step = handle.step_count(), %reason, "simulation diverged");
            return Err(PhaseError::Diverged(reason));
        }
        Ok(self.monitor.sample(handle)?)
    }

    /// Actuator targets that drive every joint toward `goals`.
    fn track(&self, goals: &[f64], joints: &[JointState]) -> Vec<ActuatorTarget> {
        let close = &self.config.close;
        goals
            .iter()
            .zip(joints)
            .zip(&self.limits)
            .map(|((goal, joint), limit)| {
                let error = goal - joint.position;
                match self.actuator {
                    ActuatorKind::Position => ActuatorTarget::Position(*goal),
                    ActuatorKind::Velocity => ActuatorTarget::Velocity(
                        (close.velocity_gain * error)
                            .clamp(-close.max_joint_velocity, close.max_joint_velocity),
                    ),
                    ActuatorKind::Torque => ActuatorTarget::Torque(
                        (close.torque_gain * error).clamp(-limit.effort, limit.effort),
                    ),
                }
            })
            .collect()
    }

    fn closing_targets(&self, state: &ClosingState, joints: &[JointState]) -> Vec<ActuatorTarget> {
        let goals: Vec<f64> = (0..joints.len())
            .map(|i| {
                state.guards[i]
                    .or_else(|| state.goal(i))
                    .unwrap_or(joints[i].position)
            })
            .collect();
        let mut targets = self.track(&goals, joints);
        if let Some(efforts) = &state.efforts {
            for (i, (target, effort)) in targets.iter_mut().zip(efforts).enumerate() {
                if state.guards[i].is_none() {
                    let limit = self.limits[i].effort;
                    *target = ActuatorTarget::Torque(effort.clamp(-limit, limit));
                }
            }
        }
        targets
    }

    fn move_base<W: SteppableWorld>(
        &mut self,
        handle: &mut SimulationHandle<W>,
        phase: Phase,
        goal: &Isometry3<f64>,
        max_steps: u64,
    ) -> Result<PhaseOutcome, PhaseError> {
        let motion = &self.config.motion;
        let path = PoseInterpolation::new(
            handle.gripper_state()?.pose,
            goal,
            motion.approach_speed,
            motion.angular_speed,
            handle.timestep(),
        );
        let gripper = handle.gripper();
        for i in 1..=max_steps {
            self.check_interrupt()?;
            let joints = handle.joint_states()?;
            let targets = self.track(&self.open_positions, &joints);
            let world = handle.world_mut();
            world.set_base_target(gripper, &path.at(i))?;
            world.set_joint_targets(gripper, &targets)?;

            let sample = self.step(handle, phase)?;
            if !sample.contacts.is_empty() {
                let links = sample.contact_links();
                debug!(%phase, ?links, step = sample.step, "unexpected contact");
                return Err(PhaseError::UnexpectedCollision { phase, links });
            }
            let (translation, rotation) = pose_error(&handle.gripper_state()?.pose, goal);
            if translation <= motion.translation_tolerance && rotation <= motion.rotation_tolerance
            {
                return Ok(PhaseOutcome {
                    completed: true,
                    steps_used: i,
                    terminal_state: TerminalState::PoseReached,
                });
            }
        }
        Ok(timed_out(max_steps))
    }

    fn check_start_state(&self, joints: &[JointState]) -> Result<(), PhaseError> {
        let tolerance = self.config.close.start_tolerance;
        for (i, joint) in joints.iter().enumerate() {
            let expected = self.open_positions[i];
            if (joint.position - expected).abs() > tolerance {
                return Err(PhaseError::StartStateMismatch {
                    joint: self.joint_names[i].clone(),
                    position: joint.position,
                    expected,
                    tolerance,
                });
            }
        }
        Ok(())
    }

    /// Fails when a free, position-driven joint is farther from its current
    /// waypoint than `close.max_tracking_error`.
    fn check_tracking(&self, state: &ClosingState, joints: &[JointState]) -> Result<(), PhaseError> {
        if state.efforts.is_some() {
            return Ok(());
        }
        let max = self.config.close.max_tracking_error;
        for (i, joint) in joints.iter().enumerate() {
            if state.guards[i].is_some() {
                continue;
            }
            let Some(goal) = state.goal(i) else {
                continue;
            };
            if (joint.position - goal).abs() > max {
                warn!(
                    joint = %self.joint_names[i],
                    position = joint.position,
                    goal,
                    "joint is off its waypoint"
                );
                return Err(PhaseError::TrackingError {
                    joint: self.joint_names[i].clone(),
                    position: joint.position,
                    goal,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Holds guarded fingers that touched the object.
    fn update_guards(&self, state: &mut ClosingState, sample: &ContactSample, joints: &[JointState]) {
        let preload = self.config.close.guard_preload;
        for (i, joint) in joints.iter().enumerate() {
            if state.guards[i].is_some() || !sample.is_in_contact(&self.joint_links[i]) {
                continue;
            }
            let direction = match &state.efforts {
                Some(efforts) => efforts[i].signum(),
                None => state
                    .goal(i)
                    .map_or(0.0, |goal| (goal - joint.position).signum()),
            };
            let hold = self.limits[i].clamp(joint.position + direction * preload);
            debug!(joint = %self.joint_names[i], position = joint.position, hold, "finger is guarded");
            state.guards[i] = Some(hold);
        }
    }

    fn close<W: SteppableWorld>(
        &mut self,
        handle: &mut SimulationHandle<W>,
        plan: &GraspPlan,
        max_steps: u64,
        recorder: &mut Recorder,
    ) -> Result<PhaseOutcome, PhaseError> {
        self.check_start_state(&handle.joint_states()?)?;
        let close = &self.config.close;
        let gripper = handle.gripper();
        let mut state = ClosingState::new(&plan.closing, self.joint_names.len());
        let mut stopped_count = 0;
        let mut outcome = timed_out(max_steps);
        for i in 1..=max_steps {
            self.check_interrupt()?;
            let joints = handle.joint_states()?;
            if !state.is_last_waypoint()
                && (0..joints.len()).all(|j| {
                    state.goal(j).map_or(true, |goal| {
                        (joints[j].position - goal).abs() <= close.waypoint_tolerance
                    })
                })
            {
                state.index += 1;
                debug!(index = state.index, "closing waypoint reached");
            }
            self.check_tracking(&state, &joints)?;
            let targets = self.closing_targets(&state, &joints);
            let world = handle.world_mut();
            world.set_base_target(gripper, &plan.grasp_pose)?;
            world.set_joint_targets(gripper, &targets)?;

            let sample = self.step(handle, Phase::Close)?;
            let joints = handle.joint_states()?;
            if close.guarded {
                self.update_guards(&mut state, &sample, &joints);
            }
            recorder.contacts.push(sample.clone())?;

            if joints.iter().all(|j| j.velocity.abs() < close.stall_velocity) {
                stopped_count += 1;
            } else {
                stopped_count = 0;
            }
            let stalled = stopped_count >= close.stall_steps;
            let goal_reached = state.efforts.is_none()
                && state.is_last_waypoint()
                && (0..joints.len()).all(|j| {
                    state.goal(j).map_or(true, |goal| {
                        (joints[j].position - goal).abs() <= close.final_waypoint_tolerance
                    })
                });
            if stalled || goal_reached {
                let contact_links = sample.contact_links();
                debug!(stalled, goal_reached, ?contact_links, "fingers stopped");
                let terminal_state = if contact_links.len() >= self.config.contact.min_contact_links
                {
                    TerminalState::Grasped { contact_links }
                } else {
                    TerminalState::Missed { contact_links }
                };
                outcome = PhaseOutcome {
                    completed: true,
                    steps_used: i,
                    terminal_state,
                };
                break;
            }
        }
        self.closing = Some(state);
        Ok(outcome)
    }

    fn lift<W: SteppableWorld>(
        &mut self,
        handle: &mut SimulationHandle<W>,
        max_steps: u64,
        recorder: &mut Recorder,
    ) -> Result<PhaseOutcome, PhaseError> {
        let motion = &self.config.motion;
        let dt = handle.timestep();
        let gripper = handle.gripper();
        let start = handle.gripper_state()?.pose;
        let goal = Translation3::new(0.0, 0.0, motion.lift_height) * start;
        let profile = TrapezoidalProfile::new(
            motion.lift_height,
            motion.lift_velocity,
            motion.lift_acceleration,
        );
        let state = self
            .closing
            .clone()
            .unwrap_or_else(|| ClosingState::new(&ClosingSpec::Waypoints(vec![]), self.joint_names.len()));
        recorder.record_pose(handle)?;
        for i in 1..=max_steps {
            self.check_interrupt()?;
            let elapsed = i as f64 * dt;
            let setpoint = Translation3::new(0.0, 0.0, profile.position(elapsed)) * start;
            let joints = handle.joint_states()?;
            let targets = self.closing_targets(&state, &joints);
            let world = handle.world_mut();
            world.set_base_target(gripper, &setpoint)?;
            world.set_joint_targets(gripper, &targets)?;

            let sample = self.step(handle, Phase::Lift)?;
            recorder.contacts.push(sample)?;
            recorder.record_pose(handle)?;

            let (translation, rotation) = pose_error(&handle.gripper_state()?.pose, &goal);
            if elapsed >= profile.duration()
                && translation <= motion.translation_tolerance
                && rotation <= motion.rotation_tolerance
            {
                return Ok(PhaseOutcome {
                    completed: true,
                    steps_used: i,
                    terminal_state: TerminalState::PoseReached,
                });
            }
        }
        Ok(timed_out(max_steps))
    }
}

fn timed_out(max_steps: u64) -> PhaseOutcome {
    PhaseOutcome {
        completed: false,
        steps_used: max_steps,
        terminal_state: TerminalState::TimedOut,
    }
}
