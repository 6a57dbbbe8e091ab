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
    sync::Arc,
    time::{Duration, Instant},
};

use graspi::{GraspCandidate, GripperDescriptor, ObjectDescriptor, WorldFactory};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    config::GraspTrialConfig,
    contact::ContactTrace,
    error::{Error, PhaseError, SceneBuildError},
    motion::{CancelToken, GraspPlan, MotionController, Phase, Recorder, TerminalState},
    scene::SceneBuilder,
    stability::{
        EvaluationContext, ForceClosureCheck, PoseSample, QualityMetrics, StabilityEvaluator,
        Verdict, Violation,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Idle,
    Building,
    Approaching,
    Aligning,
    Closing,
    Lifting,
    Scoring,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialEvent {
    Start,
    SceneBuilt,
    BuildFailed,
    PoseReached,
    Grasped,
    Missed,
    PrematureContact,
    LiftEnded,
    Passed,
    Rejected,
    Abort,
}

#[derive(Debug, Error)]
#[error("openrr-grasp: Invalid transition from {:?} on {:?}", state, event)]
pub struct InvalidTransition {
    pub state: TrialState,
    pub event: TrialEvent,
}

impl TrialState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrialState::Succeeded | TrialState::Failed | TrialState::Aborted
        )
    }

    /// The state after `event`.
    pub fn on(self, event: TrialEvent) -> Result<TrialState, InvalidTransition> {
        use TrialEvent as E;
        use TrialState as S;
        let next = match (self, event) {
            (S::Idle, E::Start) => S::Building,
            (S::Building, E::SceneBuilt) => S::Approaching,
            (S::Building, E::BuildFailed) => S::Aborted,
            (S::Approaching, E::PoseReached) => S::Aligning,
            (S::Aligning, E::PoseReached) => S::Closing,
            (S::Approaching | S::Aligning, E::PrematureContact) => S::Failed,
            (S::Closing, E::Grasped) => S::Lifting,
            (S::Closing, E::Missed) => S::Failed,
            (S::Lifting, E::LiftEnded) => S::Scoring,
            (S::Scoring, E::Passed) => S::Succeeded,
            (S::Scoring, E::Rejected) => S::Failed,
            (state, E::Abort) if !state.is_terminal() && state != S::Idle => S::Aborted,
            (state, event) => return Err(InvalidTransition { state, event }),
        };
        Ok(next)
    }

    fn phase(self) -> Option<Phase> {
        match self {
            TrialState::Approaching => Some(Phase::Approach),
            TrialState::Aligning => Some(Phase::Align),
            TrialState::Closing => Some(Phase::Close),
            TrialState::Lifting => Some(Phase::Lift),
            _ => None,
        }
    }
}

/// Machine readable reason of a non-successful trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MissedGrasp,
    PrematureContact,
    Diverged,
    PhaseTimeout(Phase),
    Canceled,
    WallClockTimeout,
    StartStateMismatch,
    TrackingError,
    SimulationError(String),
    Unstable(Vec<Violation>),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::MissedGrasp => f.write_str("missed grasp"),
            FailureReason::PrematureContact => f.write_str("premature contact"),
            FailureReason::Diverged => f.write_str("diverged"),
            FailureReason::PhaseTimeout(phase) => write!(f, "phase timeout: {phase}"),
            FailureReason::Canceled => f.write_str("canceled"),
            FailureReason::WallClockTimeout => f.write_str("wall clock timeout"),
            FailureReason::StartStateMismatch => f.write_str("start state mismatch"),
            FailureReason::TrackingError => f.write_str("tracking error"),
            FailureReason::SimulationError(e) => write!(f, "simulation error: {e}"),
            FailureReason::Unstable(violations) => {
                f.write_str("unstable grasp")?;
                for (i, v) in violations.iter().enumerate() {
                    write!(f, "{}{v}", if i == 0 { ": " } else { ", " })?;
                }
                Ok(())
            }
        }
    }
}

impl From<&PhaseError> for FailureReason {
    fn from(e: &PhaseError) -> Self {
        match e {
            PhaseError::StartStateMismatch { .. } => FailureReason::StartStateMismatch,
            PhaseError::TrackingError { .. } => FailureReason::TrackingError,
            PhaseError::UnexpectedCollision { .. } => FailureReason::PrematureContact,
            PhaseError::Diverged(_) => FailureReason::Diverged,
            PhaseError::Canceled => FailureReason::Canceled,
            PhaseError::WallClockTimeout(_) => FailureReason::WallClockTimeout,
            e => FailureReason::SimulationError(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub steps_used: u64,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub verdict: Verdict,
    /// Present when the lift was scored.
    pub metrics: Option<QualityMetrics>,
    pub failure_reason: Option<FailureReason>,
    /// Contacts of every Close and Lift step.
    pub contacts: ContactTrace,
    /// Object and gripper poses of the lift, starting with the pose before the
    /// first lift step.
    pub lift_trajectory: Vec<PoseSample>,
    pub phases: Vec<PhaseRecord>,
    pub final_state: TrialState,
    /// Simulated steps including the pre-roll.
    pub total_steps: u64,
}

impl TrialResult {
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }
}

struct Trial {
    state: TrialState,
    failure_reason: Option<FailureReason>,
    metrics: Option<QualityMetrics>,
    phases: Vec<PhaseRecord>,
}

impl Trial {
    fn apply(&mut self, event: TrialEvent) {
        match self.state.on(event) {
            Ok(next) => {
                debug!(from = ?self.state, to = ?next, ?event, "trial state");
                self.state = next;
            }
            Err(e) => {
                error!("{e}");
                self.failure_reason
                    .get_or_insert_with(|| FailureReason::SimulationError(e.to_string()));
                self.state = TrialState::Aborted;
            }
        }
    }

    fn fail(&mut self, event: TrialEvent, reason: FailureReason) {
        self.failure_reason = Some(reason);
        self.apply(event);
    }
}

/// Runs grasp trials, each in its own fresh world.
#[derive(Clone)]
pub struct GraspTrialRunner<F>
where
    F: WorldFactory,
{
    factory: F,
    config: Arc<GraspTrialConfig>,
    force_closure: Option<Arc<dyn ForceClosureCheck>>,
}

impl<F> fmt::Debug for GraspTrialRunner<F>
where
    F: WorldFactory + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraspTrialRunner")
            .field("factory", &self.factory)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F> GraspTrialRunner<F>
where
    F: WorldFactory,
{
    /// Fails with [`Error::InvalidConfig`] when `config` does not validate.
    pub fn new(factory: F, config: GraspTrialConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            factory,
            config: Arc::new(config),
            force_closure: None,
        })
    }

    pub fn with_force_closure_check(mut self, check: Arc<dyn ForceClosureCheck>) -> Self {
        self.force_closure = Some(check);
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn config(&self) -> &GraspTrialConfig {
        &self.config
    }

    pub fn run(
        &self,
        object: &ObjectDescriptor,
        gripper: &GripperDescriptor,
        candidate: &GraspCandidate,
    ) -> Result<TrialResult, SceneBuildError> {
        self.run_with_cancel(object, gripper, candidate, &CancelToken::default())
    }

    /// Runs one trial, aborting it between steps once `cancel` is set.
    pub fn run_with_cancel(
        &self,
        object: &ObjectDescriptor,
        gripper: &GripperDescriptor,
        candidate: &GraspCandidate,
        cancel: &CancelToken,
    ) -> Result<TrialResult, SceneBuildError> {
        let started = Instant::now();
        let config = &self.config;
        let mut trial = Trial {
            state: TrialState::Idle,
            failure_reason: None,
            metrics: None,
            phases: vec![],
        };
        trial.apply(TrialEvent::Start);

        let builder = SceneBuilder::new(config.scene.clone(), config.divergence.clone());
        let built = candidate
            .validate(gripper)
            .map_err(SceneBuildError::InvalidDescriptor)
            .and_then(|()| builder.build(&self.factory, object, gripper))
            .and_then(|handle| {
                builder.check_candidate(&handle, candidate)?;
                Ok(handle)
            });
        let mut handle = match built {
            Ok(handle) => handle,
            Err(e) => {
                trial.apply(TrialEvent::BuildFailed);
                info!(object = %object.name, "failed to build the scene: {e}");
                return Err(e);
            }
        };
        match builder.settle(&mut handle) {
            Ok(()) => trial.apply(TrialEvent::SceneBuilt),
            Err(e) => {
                info!(object = %object.name, "failed to settle the scene: {e}");
                trial.fail(TrialEvent::BuildFailed, FailureReason::from(&e));
            }
        }

        let mut controller = MotionController::new(config.clone(), gripper)
            .with_cancel_token(cancel.clone());
        if let Some(timeout) = config
            .wall_clock_timeout_sec
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
        {
            controller = controller.with_deadline(started, timeout);
        }
        let mut recorder = Recorder::default();
        let mut lift_start = None;
        let plan = if trial.state.is_terminal() {
            None
        } else {
            match handle.object_state() {
                Ok(state) => Some(GraspPlan::new(candidate, &state.pose)),
                Err(e) => {
                    trial.fail(
                        TrialEvent::Abort,
                        FailureReason::SimulationError(e.to_string()),
                    );
                    None
                }
            }
        };

        while let (Some(phase), Some(plan)) = (trial.state.phase(), &plan) {
            let limits = &config.phase_limits;
            let max_steps = match phase {
                Phase::Approach => limits.approach,
                Phase::Align => limits.align,
                Phase::Close => limits.close,
                Phase::Lift => limits.lift,
            };
            let start_step = handle.step_count();
            if phase == Phase::Lift {
                lift_start = Some(start_step);
            }
            let outcome = controller.drive(&mut handle, phase, plan, max_steps, &mut recorder);
            trial.phases.push(PhaseRecord {
                phase,
                steps_used: handle.step_count() - start_step,
                completed: matches!(&outcome, Ok(o) if o.completed),
            });
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    info!(%phase, "phase is interrupted: {e}");
                    let event = match e {
                        PhaseError::UnexpectedCollision { .. } => TrialEvent::PrematureContact,
                        _ => TrialEvent::Abort,
                    };
                    trial.fail(event, FailureReason::from(&e));
                    break;
                }
            };
            match (phase, outcome.terminal_state) {
                (Phase::Lift, TerminalState::TimedOut) => {
                    trial.failure_reason = Some(FailureReason::PhaseTimeout(Phase::Lift));
                    trial.apply(TrialEvent::LiftEnded);
                }
                (Phase::Lift, _) => trial.apply(TrialEvent::LiftEnded),
                (phase, TerminalState::TimedOut) => {
                    trial.fail(TrialEvent::Abort, FailureReason::PhaseTimeout(phase));
                }
                (_, TerminalState::Grasped { .. }) => trial.apply(TrialEvent::Grasped),
                (_, TerminalState::Missed { .. }) => {
                    trial.fail(TrialEvent::Missed, FailureReason::MissedGrasp);
                }
                (_, TerminalState::PoseReached) => trial.apply(TrialEvent::PoseReached),
            }
        }

        if trial.state == TrialState::Scoring {
            let mut evaluator = StabilityEvaluator::new(
                config.stability.clone(),
                config.contact.min_contact_links,
            );
            if let Some(check) = &self.force_closure {
                evaluator = evaluator.with_force_closure_check(check.clone());
            }
            let friction = config
                .stability
                .friction_coefficient
                .unwrap_or(object.friction * gripper.friction);
            let context = EvaluationContext::new(object.mass, friction, config.stability.gravity);
            let samples = recorder.contacts.since(lift_start.unwrap_or_default());
            let evaluation = evaluator.evaluate(samples, &recorder.poses, &context);
            trial.metrics = Some(evaluation.metrics);
            if trial.failure_reason.is_some() {
                trial.apply(TrialEvent::Abort);
            } else if evaluation.verdict == Verdict::Success {
                trial.apply(TrialEvent::Passed);
            } else {
                trial.fail(
                    TrialEvent::Rejected,
                    FailureReason::Unstable(evaluation.violations),
                );
            }
        }

        let verdict = match trial.state {
            TrialState::Succeeded => Verdict::Success,
            TrialState::Failed => Verdict::Failure,
            _ => Verdict::Aborted,
        };
        let result = TrialResult {
            verdict,
            metrics: trial.metrics,
            failure_reason: trial.failure_reason,
            contacts: recorder.contacts,
            lift_trajectory: recorder.poses,
            phases: trial.phases,
            final_state: trial.state,
            total_steps: handle.step_count(),
        };
        drop(handle);
        info!(
            object = %object.name,
            verdict = ?result.verdict,
            reason = %result
                .failure_reason
                .as_ref()
                .map_or_else(String::new, ToString::to_string),
            steps = result.total_steps,
            "trial finished"
        );
        Ok(result)
    }

    /// Runs the candidates in parallel, one fresh world per trial.
    ///
    /// Results are in the order of `candidates`.
    pub fn run_batch(
        &self,
        object: &ObjectDescriptor,
        gripper: &GripperDescriptor,
        candidates: &[GraspCandidate],
    ) -> Vec<Result<TrialResult, SceneBuildError>> {
        self.run_batch_with_cancel(object, gripper, candidates, &CancelToken::default())
    }

    pub fn run_batch_with_cancel(
        &self,
        object: &ObjectDescriptor,
        gripper: &GripperDescriptor,
        candidates: &[GraspCandidate],
        cancel: &CancelToken,
    ) -> Vec<Result<TrialResult, SceneBuildError>> {
        candidates
            .par_iter()
            .map(|candidate| self.run_with_cancel(object, gripper, candidate, cancel))
            .collect()
    }
}
