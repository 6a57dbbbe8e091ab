use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    error::Error,
    traits::{SteppableWorld, WorldFactory},
    types::{
        ActuatorKind, ActuatorTarget, BodyHandle, BodyState, ContactPoint, Geometry,
        GripperDescriptor, JointKind, JointLimit, JointState, ObjectDescriptor,
    },
};

/// Parameters of [`DummyWorld`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyWorldConfig {
    pub timestep: f64,
    pub gravity: f64,
    /// Speed limit of the gripper base [m/s].
    pub base_max_speed: f64,
    /// Angular speed limit of the gripper base [rad/s].
    pub base_max_angular_speed: f64,
    pub finger_pad_radius: f64,
    pub palm_radius: f64,
    /// Height of the palm above the tool centre point.
    pub palm_offset: f64,
    /// Contact force per penetration depth of a passive contact [N/m].
    pub contact_stiffness: f64,
    /// Penetration a pad may reach before it pushes the object or stops.
    pub compliance: f64,
    /// Stiffness of position actuators [N/m].
    pub position_gain: f64,
    /// Relative amplitude of the uniform noise applied to contact forces.
    pub force_noise: f64,
    pub seed: u64,
    /// Half extents of the meshes this world can resolve.
    pub meshes: HashMap<String, Vector3<f64>>,
    /// Blows up every object at this step.
    pub diverge_at_step: Option<u64>,
    /// Makes `step` fail at this step.
    pub fail_at_step: Option<u64>,
}

impl Default for DummyWorldConfig {
    fn default() -> Self {
        Self {
            timestep: 1.0 / 240.0,
            gravity: 9.81,
            base_max_speed: 0.5,
            base_max_angular_speed: 3.0,
            finger_pad_radius: 0.008,
            palm_radius: 0.02,
            palm_offset: 0.06,
            contact_stiffness: 2000.0,
            compliance: 0.001,
            position_gain: 2000.0,
            force_noise: 0.0,
            seed: 0,
            meshes: HashMap::new(),
            diverge_at_step: None,
            fail_at_step: None,
        }
    }
}

impl DummyWorldConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_force_noise(mut self, force_noise: f64) -> Self {
        self.force_noise = force_noise;
        self
    }

    pub fn with_mesh(mut self, uri: impl Into<String>, half_extents: Vector3<f64>) -> Self {
        self.meshes.insert(uri.into(), half_extents);
        self
    }

    pub fn with_divergence_at(mut self, step: u64) -> Self {
        self.diverge_at_step = Some(step);
        self
    }

    pub fn with_failure_at(mut self, step: u64) -> Self {
        self.fail_at_step = Some(step);
        self
    }
}

#[derive(Debug)]
struct DummyObject {
    mass: f64,
    friction: f64,
    restitution: f64,
    half_extents: Vector3<f64>,
    state: BodyState,
    held_by: Option<BodyHandle>,
}

impl DummyObject {
    fn floor_height(&self) -> f64 {
        self.half_extents.z
    }
}

#[derive(Debug)]
struct DummyJoint {
    link: String,
    /// +1.0 or -1.0, the side of the gripper y axis the pad sits on.
    side: f64,
    limit: JointLimit,
    position: f64,
    velocity: f64,
    effort: f64,
    target: ActuatorTarget,
    pressing_force: f64,
    noise: f64,
}

impl DummyJoint {
    /// Returns the commanded displacement for one step and whether the command
    /// closes the finger.
    fn commanded_motion(&self, dt: f64) -> (f64, bool) {
        let max_step = self.limit.velocity * dt;
        match self.target {
            ActuatorTarget::Position(target) => {
                let diff = target - self.position;
                (diff.clamp(-max_step, max_step), diff < 0.0)
            }
            ActuatorTarget::Velocity(velocity) => (
                velocity.clamp(-self.limit.velocity, self.limit.velocity) * dt,
                velocity < 0.0,
            ),
            ActuatorTarget::Torque(torque) => {
                if torque == 0.0 {
                    return (0.0, false);
                }
                let ratio = if self.limit.effort > 0.0 {
                    (torque.abs() / self.limit.effort).min(1.0)
                } else {
                    1.0
                };
                (torque.signum() * max_step * ratio, torque < 0.0)
            }
        }
    }

    /// Force the actuator applies when the pad is pushed against an object.
    fn actuator_force(&self, position_gain: f64) -> f64 {
        let force = match self.target {
            ActuatorTarget::Position(target) => position_gain * (self.position - target).max(0.0),
            ActuatorTarget::Velocity(velocity) if velocity < 0.0 => self.limit.effort,
            ActuatorTarget::Velocity(_) => 0.0,
            ActuatorTarget::Torque(torque) => (-torque).max(0.0),
        };
        force.min(self.limit.effort)
    }
}

#[derive(Debug)]
struct DummyGripper {
    palm_link: String,
    friction: f64,
    actuator: ActuatorKind,
    base: BodyState,
    base_target: Isometry3<f64>,
    joints: Vec<DummyJoint>,
}

impl DummyGripper {
    fn pad_center(&self, side: f64, position: f64) -> Point3<f64> {
        self.base.pose * Point3::new(0.0, side * position, 0.0)
    }
}

/// Penetration of a sphere into a box, and the unit normal pointing from the
/// sphere into the box.
fn sphere_box_contact(
    center: &Point3<f64>,
    radius: f64,
    box_pose: &Isometry3<f64>,
    half_extents: &Vector3<f64>,
) -> Option<(f64, Vector3<f64>)> {
    let p = box_pose.inverse_transform_point(center);
    let mut depth = f64::INFINITY;
    let mut axis = 0;
    for i in 0..3 {
        let d = half_extents[i] + radius - p[i].abs();
        if d <= 0.0 {
            return None;
        }
        if d < depth {
            depth = d;
            axis = i;
        }
    }
    let mut normal = Vector3::zeros();
    normal[axis] = if p[axis] >= 0.0 { -1.0 } else { 1.0 };
    Some((depth, box_pose.rotation * normal))
}

fn move_toward(
    current: &Isometry3<f64>,
    target: &Isometry3<f64>,
    max_translation: f64,
    max_rotation: f64,
) -> Isometry3<f64> {
    let diff = target.translation.vector - current.translation.vector;
    let distance = diff.norm();
    let translation = if distance <= max_translation {
        target.translation.vector
    } else {
        current.translation.vector + diff * (max_translation / distance)
    };
    let delta = target.rotation * current.rotation.inverse();
    let angle = delta.angle();
    let rotation = if angle <= max_rotation {
        target.rotation
    } else {
        UnitQuaternion::from_scaled_axis(delta.scaled_axis() * (max_rotation / angle))
            * current.rotation
    };
    Isometry3::from_parts(Translation3::from(translation), rotation)
}

fn velocities(old: &Isometry3<f64>, new: &Isometry3<f64>, dt: f64) -> (Vector3<f64>, Vector3<f64>) {
    let linear = (new.translation.vector - old.translation.vector) / dt;
    let angular = (new.rotation * old.rotation.inverse()).scaled_axis() / dt;
    (linear, angular)
}

/// Deterministic kinematic stand-in for a physics engine.
///
/// The gripper is a parallel-jaw hand: every actuated joint is a finger whose
/// pad sits at `±position` along the gripper y axis (even joints on the
/// positive side), and the palm sits `palm_offset` above the tool centre
/// point. Objects are approximated by their bounding boxes and rest on a
/// support plane at `z = 0`. An object pinched by pressing pads whose friction
/// carries its weight moves with the gripper; otherwise it falls.
#[derive(Debug)]
pub struct DummyWorld {
    config: DummyWorldConfig,
    objects: BTreeMap<BodyHandle, DummyObject>,
    grippers: BTreeMap<BodyHandle, DummyGripper>,
    next_id: u64,
    step_count: u64,
    rng: StdRng,
    closed: bool,
    live_worlds: Option<Arc<AtomicUsize>>,
}

impl DummyWorld {
    pub fn new(config: DummyWorldConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            objects: BTreeMap::new(),
            grippers: BTreeMap::new(),
            next_id: 0,
            step_count: 0,
            rng,
            closed: false,
            live_worlds: None,
        }
    }

    fn with_counter(config: DummyWorldConfig, live_worlds: Arc<AtomicUsize>) -> Self {
        live_worlds.fetch_add(1, Ordering::SeqCst);
        let mut world = Self::new(config);
        world.live_worlds = Some(live_worlds);
        world
    }

    pub fn config(&self) -> &DummyWorldConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            Err(Error::WorldClosed)
        } else {
            Ok(())
        }
    }

    fn next_handle(&mut self) -> BodyHandle {
        let handle = BodyHandle(self.next_id);
        self.next_id += 1;
        handle
    }

    fn gripper(&self, handle: BodyHandle) -> Result<&DummyGripper, Error> {
        self.grippers.get(&handle).ok_or_else(|| {
            if self.objects.contains_key(&handle) {
                Error::NotGripper(handle)
            } else {
                Error::NoBody(handle)
            }
        })
    }

    /// Contacts of `gripper` with the object `b` with the gripper base at `base`.
    fn contacts_at(
        &self,
        a: BodyHandle,
        gripper: &DummyGripper,
        base: &Isometry3<f64>,
        b: BodyHandle,
    ) -> Result<Vec<ContactPoint>, Error> {
        let object = self.objects.get(&b).ok_or(Error::NoBody(b))?;
        let stiffness = self.config.contact_stiffness;
        let pad_radius = self.config.finger_pad_radius;
        let gravity = self.config.gravity;

        let mut contacts = Vec::new();
        let palm = base * Point3::new(0.0, 0.0, self.config.palm_offset);
        if let Some((depth, normal)) = sphere_box_contact(
            &palm,
            self.config.palm_radius,
            &object.state.pose,
            &object.half_extents,
        ) {
            contacts.push(ContactPoint {
                link: gripper.palm_link.clone(),
                position: palm + normal * self.config.palm_radius,
                normal,
                depth,
                normal_force: stiffness * depth,
                tangential_force: 0.0,
            });
        }
        let held = object.held_by == Some(a);
        let num_pressing = gripper
            .joints
            .iter()
            .filter(|j| j.pressing_force > 0.0)
            .count()
            .max(1);
        for joint in &gripper.joints {
            let center = base * Point3::new(0.0, joint.side * joint.position, 0.0);
            let Some((depth, normal)) =
                sphere_box_contact(&center, pad_radius, &object.state.pose, &object.half_extents)
            else {
                continue;
            };
            let tangential_force = if held && joint.pressing_force > 0.0 {
                object.mass * gravity / num_pressing as f64
            } else {
                0.0
            };
            contacts.push(ContactPoint {
                link: joint.link.clone(),
                position: center + normal * pad_radius,
                normal,
                depth,
                normal_force: (stiffness * depth).max(joint.pressing_force) * joint.noise,
                tangential_force,
            });
        }
        Ok(contacts)
    }

    fn move_bases(&mut self, dt: f64) -> BTreeMap<BodyHandle, Isometry3<f64>> {
        let max_translation = self.config.base_max_speed * dt;
        let max_rotation = self.config.base_max_angular_speed * dt;
        let mut deltas = BTreeMap::new();
        for (handle, gripper) in &mut self.grippers {
            let old = gripper.base.pose;
            let new = move_toward(&old, &gripper.base_target, max_translation, max_rotation);
            let (linear, angular) = velocities(&old, &new, dt);
            gripper.base = BodyState {
                pose: new,
                linear_velocity: linear,
                angular_velocity: angular,
            };
            deltas.insert(*handle, new * old.inverse());
        }
        deltas
    }

    fn move_objects(&mut self, deltas: &BTreeMap<BodyHandle, Isometry3<f64>>, dt: f64) {
        let gravity = self.config.gravity;
        for object in self.objects.values_mut() {
            let old = object.state.pose;
            match object.held_by.and_then(|h| deltas.get(&h)) {
                Some(delta) => {
                    let new = delta * old;
                    let (linear, angular) = velocities(&old, &new, dt);
                    object.state = BodyState {
                        pose: new,
                        linear_velocity: linear,
                        angular_velocity: angular,
                    };
                }
                None => {
                    let mut velocity = Vector3::new(0.0, 0.0, object.state.linear_velocity.z);
                    velocity.z -= gravity * dt;
                    let mut pose = old;
                    pose.translation.vector.z += velocity.z * dt;
                    let floor = object.floor_height();
                    if pose.translation.vector.z <= floor {
                        pose.translation.vector.z = floor;
                        velocity.z = -velocity.z * object.restitution;
                        if velocity.z < gravity * dt {
                            velocity.z = 0.0;
                        }
                    }
                    object.state = BodyState {
                        pose,
                        linear_velocity: velocity,
                        angular_velocity: Vector3::zeros(),
                    };
                }
            }
        }
    }

    fn move_joints(&mut self, dt: f64) {
        let pad_radius = self.config.finger_pad_radius;
        let compliance = self.config.compliance;
        let position_gain = self.config.position_gain;
        for (gripper_handle, gripper) in &mut self.grippers {
            for i in 0..gripper.joints.len() {
                let (step, closing) = gripper.joints[i].commanded_motion(dt);
                let side = gripper.joints[i].side;
                let old = gripper.joints[i].position;
                let new = gripper.joints[i].limit.clamp(old + step);
                let center = gripper.pad_center(side, new);
                let mut blocked = false;
                for object in self.objects.values_mut() {
                    let Some((depth, normal)) =
                        sphere_box_contact(&center, pad_radius, &object.state.pose, &object.half_extents)
                    else {
                        continue;
                    };
                    if depth <= compliance {
                        continue;
                    }
                    let pinched = object.held_by == Some(*gripper_handle)
                        || gripper.joints.iter().enumerate().any(|(j, other)| {
                            j != i
                                && sphere_box_contact(
                                    &gripper.pad_center(other.side, other.position),
                                    pad_radius,
                                    &object.state.pose,
                                    &object.half_extents,
                                )
                                .is_some_and(|(_, n)| n.dot(&normal) < -0.5)
                        });
                    if pinched {
                        blocked = true;
                    } else {
                        let pose = &mut object.state.pose;
                        pose.translation.vector += normal * (depth - compliance);
                        let floor = object.half_extents.z;
                        if pose.translation.vector.z < floor {
                            pose.translation.vector.z = floor;
                        }
                    }
                }
                let joint = &mut gripper.joints[i];
                let position = if blocked { old } else { new };
                joint.velocity = (position - old) / dt;
                joint.position = position;
                let in_contact = self.objects.values().any(|object| {
                    sphere_box_contact(
                        &gripper.pad_center(side, position),
                        pad_radius,
                        &object.state.pose,
                        &object.half_extents,
                    )
                    .is_some()
                });
                let joint = &mut gripper.joints[i];
                let force = joint.actuator_force(position_gain);
                joint.effort = force;
                joint.pressing_force = if in_contact && closing { force } else { 0.0 };
            }
        }
    }

    /// Decides which objects are held for the next step.
    fn update_holding(&mut self) {
        let pad_radius = self.config.finger_pad_radius;
        let gravity = self.config.gravity;
        for object in self.objects.values_mut() {
            object.held_by = None;
            for (handle, gripper) in &self.grippers {
                let pressing: Vec<(f64, Vector3<f64>)> = gripper
                    .joints
                    .iter()
                    .filter(|joint| joint.pressing_force > 0.0)
                    .filter_map(|joint| {
                        sphere_box_contact(
                            &gripper.pad_center(joint.side, joint.position),
                            pad_radius,
                            &object.state.pose,
                            &object.half_extents,
                        )
                        .map(|(_, normal)| (joint.pressing_force * joint.noise, normal))
                    })
                    .collect();
                let opposing = pressing.iter().enumerate().any(|(i, (_, a))| {
                    pressing[i + 1..].iter().any(|(_, b)| a.dot(b) < -0.5)
                });
                let mu = object.friction * gripper.friction;
                let capacity: f64 = pressing.iter().map(|(force, _)| mu * force).sum();
                if opposing && capacity >= object.mass * gravity {
                    object.held_by = Some(*handle);
                    break;
                }
            }
        }
    }

    fn diverge(&mut self, dt: f64) {
        debug!(step = self.step_count, "injecting divergence");
        for object in self.objects.values_mut() {
            object.held_by = None;
            object.state.linear_velocity = Vector3::new(0.0, 0.0, 1.0e9);
            object.state.pose.translation.vector.z += 1.0e9 * dt;
        }
    }
}

impl Drop for DummyWorld {
    fn drop(&mut self) {
        if !self.closed {
            debug!("DummyWorld is dropped without teardown");
        }
    }
}

impl SteppableWorld for DummyWorld {
    fn load_object(&mut self, object: &ObjectDescriptor) -> Result<BodyHandle, Error> {
        self.ensure_open()?;
        object.validate()?;
        let half_extents = match &object.geometry {
            Geometry::Mesh { uri } => *self
                .config
                .meshes
                .get(uri)
                .ok_or_else(|| Error::InvalidGeometry(format!("unknown mesh {uri}")))?,
            geometry => geometry
                .half_extents()
                .ok_or_else(|| Error::InvalidGeometry(object.name.clone()))?,
        };
        let handle = self.next_handle();
        self.objects.insert(
            handle,
            DummyObject {
                mass: object.mass,
                friction: object.friction,
                restitution: object.restitution,
                half_extents,
                state: BodyState::at_rest(object.initial_pose),
                held_by: None,
            },
        );
        debug!(name = %object.name, ?handle, "loaded object");
        Ok(handle)
    }

    fn load_gripper(&mut self, gripper: &GripperDescriptor) -> Result<BodyHandle, Error> {
        self.ensure_open()?;
        gripper.validate()?;
        let palm_link = gripper
            .links
            .iter()
            .find(|link| !gripper.joints.iter().any(|j| j.child == link.name))
            .map(|link| link.name.clone())
            .unwrap_or_else(|| gripper.name.clone());
        let joints = gripper
            .joints
            .iter()
            .filter(|j| j.kind != JointKind::Fixed)
            .enumerate()
            .map(|(i, j)| DummyJoint {
                link: j.child.clone(),
                side: if i % 2 == 0 { 1.0 } else { -1.0 },
                limit: j.limit,
                position: j.initial_position,
                velocity: 0.0,
                effort: 0.0,
                target: match gripper.actuator {
                    ActuatorKind::Position => ActuatorTarget::Position(j.initial_position),
                    ActuatorKind::Velocity => ActuatorTarget::Velocity(0.0),
                    ActuatorKind::Torque => ActuatorTarget::Torque(0.0),
                },
                pressing_force: 0.0,
                noise: 1.0,
            })
            .collect();
        let handle = self.next_handle();
        self.grippers.insert(
            handle,
            DummyGripper {
                palm_link,
                friction: gripper.friction,
                actuator: gripper.actuator,
                base: BodyState::at_rest(gripper.initial_pose),
                base_target: gripper.initial_pose,
                joints,
            },
        );
        debug!(name = %gripper.name, ?handle, "loaded gripper");
        Ok(handle)
    }

    fn set_base_target(
        &mut self,
        gripper: BodyHandle,
        pose: &Isometry3<f64>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.gripper(gripper)?;
        if let Some(g) = self.grippers.get_mut(&gripper) {
            g.base_target = *pose;
        }
        Ok(())
    }

    fn set_joint_targets(
        &mut self,
        gripper: BodyHandle,
        targets: &[ActuatorTarget],
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let g = self.gripper(gripper)?;
        if targets.len() != g.joints.len() {
            return Err(Error::LengthMismatch {
                model: g.joints.len(),
                input: targets.len(),
            });
        }
        if let Some(target) = targets.iter().find(|t| t.kind() != g.actuator) {
            return Err(Error::ActuatorMismatch {
                name: g.palm_link.clone(),
                expected: g.actuator,
                actual: target.kind(),
            });
        }
        if let Some(g) = self.grippers.get_mut(&gripper) {
            for (joint, target) in g.joints.iter_mut().zip(targets) {
                joint.target = *target;
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        let step = self.step_count + 1;
        if self.config.fail_at_step == Some(step) {
            return Err(Error::StepFailed {
                step,
                message: "injected failure".to_owned(),
            });
        }
        let dt = self.config.timestep;
        let force_noise = self.config.force_noise;
        for gripper in self.grippers.values_mut() {
            for joint in &mut gripper.joints {
                let u: f64 = self.rng.gen_range(-1.0..=1.0);
                joint.noise = 1.0 + force_noise * u;
            }
        }

        let deltas = self.move_bases(dt);
        self.move_objects(&deltas, dt);
        self.move_joints(dt);
        self.update_holding();
        self.step_count = step;
        if self.config.diverge_at_step == Some(step) {
            self.diverge(dt);
        }
        trace!(step, "stepped");
        Ok(())
    }

    fn step_count(&self) -> u64 {
        self.step_count
    }

    fn timestep(&self) -> f64 {
        self.config.timestep
    }

    fn body_state(&self, body: BodyHandle) -> Result<BodyState, Error> {
        self.ensure_open()?;
        if let Some(object) = self.objects.get(&body) {
            return Ok(object.state);
        }
        self.gripper(body).map(|g| g.base)
    }

    fn joint_states(&self, gripper: BodyHandle) -> Result<Vec<JointState>, Error> {
        self.ensure_open()?;
        Ok(self
            .gripper(gripper)?
            .joints
            .iter()
            .map(|j| JointState {
                position: j.position,
                velocity: j.velocity,
                effort: j.effort,
            })
            .collect())
    }

    fn contact_points(&self, a: BodyHandle, b: BodyHandle) -> Result<Vec<ContactPoint>, Error> {
        self.ensure_open()?;
        let gripper = self.gripper(a)?;
        self.contacts_at(a, gripper, &gripper.base.pose, b)
    }

    fn contact_points_at(
        &self,
        a: BodyHandle,
        pose: &Isometry3<f64>,
        b: BodyHandle,
    ) -> Result<Vec<ContactPoint>, Error> {
        self.ensure_open()?;
        let gripper = self.gripper(a)?;
        self.contacts_at(a, gripper, pose, b)
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.closed = true;
        self.objects.clear();
        self.grippers.clear();
        if let Some(live_worlds) = &self.live_worlds {
            live_worlds.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(steps = self.step_count, "DummyWorld is torn down");
        Ok(())
    }
}

/// Creates [`DummyWorld`]s and counts the ones that are not torn down.
#[derive(Debug, Clone, Default)]
pub struct DummyWorldFactory {
    config: DummyWorldConfig,
    live_worlds: Arc<AtomicUsize>,
    created_worlds: Arc<AtomicUsize>,
}

impl DummyWorldFactory {
    pub fn new(config: DummyWorldConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Number of worlds created and not torn down yet.
    pub fn live_worlds(&self) -> usize {
        self.live_worlds.load(Ordering::SeqCst)
    }

    pub fn created_worlds(&self) -> usize {
        self.created_worlds.load(Ordering::SeqCst)
    }
}

impl WorldFactory for DummyWorldFactory {
    type World = DummyWorld;

    fn create_world(&self) -> Result<DummyWorld, Error> {
        self.created_worlds.fetch_add(1, Ordering::SeqCst);
        Ok(DummyWorld::with_counter(
            self.config.clone(),
            self.live_worlds.clone(),
        ))
    }
}
