use auto_impl::auto_impl;
use nalgebra::Isometry3;

use crate::{
    error::Error,
    types::{
        ActuatorTarget, BodyHandle, BodyState, ContactPoint, GripperDescriptor, JointState,
        ObjectDescriptor,
    },
};

/// Capability set of a physics engine world.
///
/// One world is driven by one caller at a time; implementations are not
/// expected to support concurrent stepping.
#[auto_impl(&mut, Box)]
pub trait SteppableWorld {
    /// Loads a rigid object at its initial pose.
    fn load_object(&mut self, object: &ObjectDescriptor) -> Result<BodyHandle, Error>;

    /// Loads a gripper at its initial pose with its joints at their initial
    /// positions.
    fn load_gripper(&mut self, gripper: &GripperDescriptor) -> Result<BodyHandle, Error>;

    /// Sets the pose the gripper base is driven toward from the next step.
    fn set_base_target(&mut self, gripper: BodyHandle, pose: &Isometry3<f64>)
        -> Result<(), Error>;

    /// Sets one actuator target per actuated joint of the gripper.
    fn set_joint_targets(
        &mut self,
        gripper: BodyHandle,
        targets: &[ActuatorTarget],
    ) -> Result<(), Error>;

    /// Advances the world by one tick.
    fn step(&mut self) -> Result<(), Error>;

    /// Number of ticks since the world was created.
    fn step_count(&self) -> u64;

    /// Duration of one tick in seconds.
    fn timestep(&self) -> f64;

    fn body_state(&self, body: BodyHandle) -> Result<BodyState, Error>;

    fn joint_states(&self, gripper: BodyHandle) -> Result<Vec<JointState>, Error>;

    /// Returns the contacts between links of `a` and the body `b`.
    fn contact_points(&self, a: BodyHandle, b: BodyHandle) -> Result<Vec<ContactPoint>, Error>;

    /// Returns the contacts the gripper `a` would have with the body `b` if
    /// its base were at `pose`, with its joints where they are.
    ///
    /// Nothing in the world is moved.
    fn contact_points_at(
        &self,
        a: BodyHandle,
        pose: &Isometry3<f64>,
        b: BodyHandle,
    ) -> Result<Vec<ContactPoint>, Error>;

    /// Releases the world. Any later call returns [`Error::WorldClosed`].
    fn teardown(&mut self) -> Result<(), Error>;
}
