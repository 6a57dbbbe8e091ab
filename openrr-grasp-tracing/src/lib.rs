#![doc = include_str!("../README.md")]

pub mod de;

use graspi::{
    ActuatorTarget, BodyHandle, BodyState, ContactPoint, Error, GripperDescriptor, Isometry3,
    JointState, ObjectDescriptor,
};
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct Tracing<T>(T);

impl<T> Tracing<T> {
    pub fn new(v: T) -> Self {
        Self(v)
    }

    pub fn get_ref(&self) -> &T {
        &self.0
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Tracing<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: graspi::WorldFactory> graspi::WorldFactory for Tracing<T> {
    type World = Tracing<T::World>;

    fn create_world(&self) -> Result<Self::World, Error> {
        let world = self.0.create_world()?;
        trace!(method = "graspi::WorldFactory::create_world");
        Ok(Tracing(world))
    }
}

impl<T: graspi::SteppableWorld> graspi::SteppableWorld for Tracing<T> {
    fn load_object(&mut self, object: &ObjectDescriptor) -> Result<BodyHandle, Error> {
        let body = self.0.load_object(object)?;
        trace!(
            method = "graspi::SteppableWorld::load_object",
            name = %object.name,
            body = body.0,
        );
        Ok(body)
    }

    fn load_gripper(&mut self, gripper: &GripperDescriptor) -> Result<BodyHandle, Error> {
        let body = self.0.load_gripper(gripper)?;
        trace!(
            method = "graspi::SteppableWorld::load_gripper",
            name = %gripper.name,
            body = body.0,
        );
        Ok(body)
    }

    fn set_base_target(&mut self, gripper: BodyHandle, pose: &Isometry3<f64>) -> Result<(), Error> {
        let t = &pose.translation;
        let r = pose.rotation.coords;
        trace!(
            method = "graspi::SteppableWorld::set_base_target",
            gripper = gripper.0,
            pose_translation_x = t.x,
            pose_translation_y = t.y,
            pose_translation_z = t.z,
            pose_rotation_i = r.x,
            pose_rotation_j = r.y,
            pose_rotation_k = r.z,
            pose_rotation_w = r.w,
        );
        self.0.set_base_target(gripper, pose)
    }

    fn set_joint_targets(
        &mut self,
        gripper: BodyHandle,
        targets: &[ActuatorTarget],
    ) -> Result<(), Error> {
        // non finite values are written as null
        let targets_json = serde_json::to_string(targets).unwrap_or_default();
        trace!(
            method = "graspi::SteppableWorld::set_joint_targets",
            gripper = gripper.0,
            targets = %targets_json,
        );
        self.0.set_joint_targets(gripper, targets)
    }

    fn step(&mut self) -> Result<(), Error> {
        self.0.step()?;
        trace!(
            method = "graspi::SteppableWorld::step",
            step = self.0.step_count(),
        );
        Ok(())
    }

    fn step_count(&self) -> u64 {
        self.0.step_count()
    }

    fn timestep(&self) -> f64 {
        self.0.timestep()
    }

    fn body_state(&self, body: BodyHandle) -> Result<BodyState, Error> {
        let state = self.0.body_state(body)?;
        let t = &state.pose.translation;
        let r = state.pose.rotation.coords;
        let v = &state.linear_velocity;
        trace!(
            method = "graspi::SteppableWorld::body_state",
            body = body.0,
            pose_translation_x = t.x,
            pose_translation_y = t.y,
            pose_translation_z = t.z,
            pose_rotation_i = r.x,
            pose_rotation_j = r.y,
            pose_rotation_k = r.z,
            pose_rotation_w = r.w,
            linear_velocity_x = v.x,
            linear_velocity_y = v.y,
            linear_velocity_z = v.z,
        );
        Ok(state)
    }

    fn joint_states(&self, gripper: BodyHandle) -> Result<Vec<JointState>, Error> {
        let states = self.0.joint_states(gripper)?;
        let positions: Vec<f64> = states.iter().map(|s| s.position).collect();
        trace!(
            method = "graspi::SteppableWorld::joint_states",
            gripper = gripper.0,
            ?positions,
        );
        Ok(states)
    }

    fn contact_points(&self, a: BodyHandle, b: BodyHandle) -> Result<Vec<ContactPoint>, Error> {
        let points = self.0.contact_points(a, b)?;
        let links: Vec<&str> = points.iter().map(|p| p.link.as_str()).collect();
        let total_normal_force: f64 = points.iter().map(|p| p.normal_force).sum();
        trace!(
            method = "graspi::SteppableWorld::contact_points",
            a = a.0,
            b = b.0,
            ?links,
            total_normal_force,
        );
        Ok(points)
    }

    fn contact_points_at(
        &self,
        a: BodyHandle,
        pose: &Isometry3<f64>,
        b: BodyHandle,
    ) -> Result<Vec<ContactPoint>, Error> {
        let points = self.0.contact_points_at(a, pose, b)?;
        let links: Vec<&str> = points.iter().map(|p| p.link.as_str()).collect();
        let max_depth = points.iter().map(|p| p.depth).fold(0.0, f64::max);
        let t = &pose.translation;
        let r = pose.rotation.coords;
        trace!(
            method = "graspi::SteppableWorld::contact_points_at",
            a = a.0,
            pose_translation_x = t.x,
            pose_translation_y = t.y,
            pose_translation_z = t.z,
            pose_rotation_i = r.x,
            pose_rotation_j = r.y,
            pose_rotation_k = r.z,
            pose_rotation_w = r.w,
            b = b.0,
            ?links,
            max_depth,
        );
        Ok(points)
    }

    fn teardown(&mut self) -> Result<(), Error> {
        trace!(method = "graspi::SteppableWorld::teardown");
        self.0.teardown()
    }
}
