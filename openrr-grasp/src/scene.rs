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

use graspi::{
    BodyHandle, BodyState, ContactPoint, GraspCandidate, GripperDescriptor, Isometry3,
    JointState, ObjectDescriptor, SteppableWorld, WorldFactory,
};
use tracing::{debug, warn};

use crate::{
    config::{DivergenceConfig, SceneConfig},
    error::{PhaseError, SceneBuildError},
};

/// Exclusive owner of one world and the bodies of a trial.
///
/// The world is torn down when the handle is dropped.
#[derive(Debug)]
pub struct SimulationHandle<W>
where
    W: SteppableWorld,
{
    world: W,
    object: BodyHandle,
    gripper: BodyHandle,
    torn_down: bool,
}

impl<W> SimulationHandle<W>
where
    W: SteppableWorld,
{
    pub fn object(&self) -> BodyHandle {
        self.object
    }

    pub fn gripper(&self) -> BodyHandle {
        self.gripper
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn step(&mut self) -> Result<(), graspi::Error> {
        self.world.step()
    }

    pub fn step_count(&self) -> u64 {
        self.world.step_count()
    }

    pub fn timestep(&self) -> f64 {
        self.world.timestep()
    }

    pub fn object_state(&self) -> Result<BodyState, graspi::Error> {
        self.world.body_state(self.object)
    }

    pub fn gripper_state(&self) -> Result<BodyState, graspi::Error> {
        self.world.body_state(self.gripper)
    }

    pub fn joint_states(&self) -> Result<Vec<JointState>, graspi::Error> {
        self.world.joint_states(self.gripper)
    }

    /// Raw contacts between gripper links and the object.
    pub fn contact_points(&self) -> Result<Vec<ContactPoint>, graspi::Error> {
        self.world.contact_points(self.gripper, self.object)
    }

    /// Contacts the gripper would have with the object with its base at `pose`.
    pub fn contact_points_at(
        &self,
        pose: &Isometry3<f64>,
    ) -> Result<Vec<ContactPoint>, graspi::Error> {
        self.world.contact_points_at(self.gripper, pose, self.object)
    }

    /// Returns a description of the first body state past the ceilings.
    pub fn check_divergence(&self, config: &DivergenceConfig) -> Result<Option<String>, graspi::Error> {
        for (name, body) in [("object", self.object), ("gripper", self.gripper)] {
            let state = self.world.body_state(body)?;
            if !state.is_finite() {
                return Ok(Some(format!("{name} state is not finite")));
            }
            let position = state.pose.translation.vector.norm();
            if position > config.max_position {
                return Ok(Some(format!("{name} is {position} m away from the origin")));
            }
            let speed = state.linear_velocity.norm();
            if speed > config.max_linear_velocity {
                return Ok(Some(format!("{name} moves at {speed} m/s")));
            }
            let angular_speed = state.angular_velocity.norm();
            if angular_speed > config.max_angular_velocity {
                return Ok(Some(format!("{name} rotates at {angular_speed} rad/s")));
            }
        }
        if let Some(joint) = self
            .world
            .joint_states(self.gripper)?
            .iter()
            .position(|j| !(j.position.is_finite() && j.velocity.is_finite()))
        {
            return Ok(Some(format!("joint {joint} state is not finite")));
        }
        Ok(None)
    }

    /// Tears the world down now instead of on drop.
    pub fn teardown(mut self) -> Result<(), graspi::Error> {
        self.torn_down = true;
        self.world.teardown()
    }
}

impl<W> Drop for SimulationHandle<W>
where
    W: SteppableWorld,
{
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        match self.world.teardown() {
            Ok(()) => debug!(steps = self.world.step_count(), "world is torn down"),
            Err(e) => warn!("failed to tear down the world: {e}"),
        }
    }
}

/// Builds the scene of a trial in a fresh world.
#[derive(Debug, Clone, Default)]
pub struct SceneBuilder {
    config: SceneConfig,
    divergence: DivergenceConfig,
}

impl SceneBuilder {
    pub fn new(config: SceneConfig, divergence: DivergenceConfig) -> Self {
        Self { config, divergence }
    }

    /// Loads the object and the gripper at their initial poses.
    pub fn build<F>(
        &self,
        factory: &F,
        object: &ObjectDescriptor,
        gripper: &GripperDescriptor,
    ) -> Result<SimulationHandle<F::World>, SceneBuildError>
    where
        F: WorldFactory,
    {
        object.validate().map_err(SceneBuildError::InvalidDescriptor)?;
        gripper.validate().map_err(SceneBuildError::InvalidDescriptor)?;

        let mut world = factory.create_world().map_err(SceneBuildError::World)?;
        let bodies = world
            .load_object(object)
            .and_then(|o| Ok((o, world.load_gripper(gripper)?)));
        let (object_handle, gripper_handle) = match bodies {
            Ok(bodies) => bodies,
            Err(e) => {
                if let Err(te) = world.teardown() {
                    warn!("failed to tear down the world: {te}");
                }
                return Err(match e {
                    e @ graspi::Error::InvalidGeometry(_) => SceneBuildError::InvalidDescriptor(e),
                    e => SceneBuildError::World(e),
                });
            }
        };
        let handle = SimulationHandle {
            world,
            object: object_handle,
            gripper: gripper_handle,
            torn_down: false,
        };

        let contacts = handle.contact_points().map_err(SceneBuildError::World)?;
        self.check_penetration(&contacts)?;
        debug!(
            object = %object.name,
            gripper = %gripper.name,
            "scene is built"
        );
        Ok(handle)
    }

    /// Rejects a candidate whose grasp pose puts the gripper inside the object.
    ///
    /// The gripper is not moved; its joints stay where they are.
    pub fn check_candidate<W>(
        &self,
        handle: &SimulationHandle<W>,
        candidate: &GraspCandidate,
    ) -> Result<(), SceneBuildError>
    where
        W: SteppableWorld,
    {
        let object = handle.object_state().map_err(SceneBuildError::World)?;
        let grasp_pose = object.pose * candidate.target_pose;
        let contacts = handle
            .contact_points_at(&grasp_pose)
            .map_err(SceneBuildError::World)?;
        self.check_penetration(&contacts)
    }

    fn check_penetration(&self, contacts: &[ContactPoint]) -> Result<(), SceneBuildError> {
        let max = self.config.max_initial_penetration;
        match contacts
            .iter()
            .max_by(|a, b| a.depth.total_cmp(&b.depth))
            .filter(|c| c.depth > max)
        {
            Some(deepest) => {
                debug!(link = %deepest.link, depth = deepest.depth, "interpenetration");
                Err(SceneBuildError::InitialPenetration {
                    link: deepest.link.clone(),
                    depth: deepest.depth,
                    max,
                })
            }
            None => Ok(()),
        }
    }

    /// Lets the object settle with the gripper held still.
    pub fn settle<W>(&self, handle: &mut SimulationHandle<W>) -> Result<(), PhaseError>
    where
        W: SteppableWorld,
    {
        for _ in 0..self.config.pre_roll_steps {
            handle.step()?;
            if let Some(reason) = handle.check_divergence(&self.divergence)? {
                warn!(step = handle.step_count(), %reason, "simulation diverged while settling");
                return Err(PhaseError::Diverged(reason));
            }
        }
        debug!(steps = handle.step_count(), "scene is settled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use graspi::{
        ActuatorKind, ClosingSpec, DummyWorldConfig, DummyWorldFactory, Geometry,
        JointDescriptor, JointKind, JointLimit, LinkDescriptor, Vector3,
    };

    use super::*;

    fn cube() -> ObjectDescriptor {
        ObjectDescriptor::new(
            "cube",
            Geometry::Box {
                half_extents: Vector3::new(0.02, 0.02, 0.02),
            },
            0.1,
        )
        .with_initial_pose(Isometry3::translation(0.0, 0.0, 0.05))
    }

    fn gripper(z: f64) -> GripperDescriptor {
        let finger = |name: &str| JointDescriptor {
            name: format!("{name}_joint"),
            kind: JointKind::Prismatic,
            parent: "palm".to_owned(),
            child: format!("{name}_finger"),
            limit: JointLimit::new(0.0, 0.05, 40.0, 0.05),
            initial_position: 0.05,
        };
        GripperDescriptor {
            name: "two_finger".to_owned(),
            links: ["palm", "left_finger", "right_finger"]
                .iter()
                .map(|n| LinkDescriptor {
                    name: (*n).to_owned(),
                })
                .collect(),
            joints: vec![finger("left"), finger("right")],
            actuator: ActuatorKind::Position,
            friction: 1.0,
            initial_pose: Isometry3::translation(0.0, 0.0, z),
        }
    }

    #[test]
    fn build_settles_object() {
        let factory = DummyWorldFactory::new(DummyWorldConfig::default());
        let builder = SceneBuilder::default();
        let mut handle = builder.build(&factory, &cube(), &gripper(0.3)).unwrap();
        assert_eq!(handle.step_count(), 0);
        builder.settle(&mut handle).unwrap();
        assert_eq!(handle.step_count(), 60);
        let z = handle.object_state().unwrap().pose.translation.vector.z;
        assert!((z - 0.02).abs() < 1e-9, "{z}");
        assert_eq!(factory.live_worlds(), 1);
        drop(handle);
        assert_eq!(factory.live_worlds(), 0);
    }

    #[test]
    fn explicit_teardown() {
        let factory = DummyWorldFactory::new(DummyWorldConfig::default());
        let handle = SceneBuilder::default()
            .build(&factory, &cube(), &gripper(0.3))
            .unwrap();
        handle.teardown().unwrap();
        assert_eq!(factory.live_worlds(), 0);
    }

    #[test]
    fn interpenetration_is_rejected() {
        let factory = DummyWorldFactory::new(DummyWorldConfig::default());
        let err = SceneBuilder::default()
            .build(&factory, &cube(), &gripper(0.0))
            .unwrap_err();
        assert!(
            matches!(err, SceneBuildError::InitialPenetration { ref link, .. } if link == "palm"),
            "{err:?}"
        );
        assert_eq!(factory.live_worlds(), 0);
    }

    #[test]
    fn settling_stops_on_divergence() {
        let factory = DummyWorldFactory::new(DummyWorldConfig::default().with_divergence_at(30));
        let builder = SceneBuilder::default();
        let mut handle = builder.build(&factory, &cube(), &gripper(0.3)).unwrap();
        let err = builder.settle(&mut handle).unwrap_err();
        assert!(matches!(err, PhaseError::Diverged(_)), "{err:?}");
        assert_eq!(handle.step_count(), 30);

        let factory = DummyWorldFactory::new(DummyWorldConfig::default().with_failure_at(30));
        let mut handle = builder.build(&factory, &cube(), &gripper(0.3)).unwrap();
        let err = builder.settle(&mut handle).unwrap_err();
        assert!(
            matches!(err, PhaseError::Simulation(graspi::Error::StepFailed { step: 30, .. })),
            "{err:?}"
        );
    }

    #[test]
    fn candidate_inside_object_is_rejected() {
        let factory = DummyWorldFactory::new(DummyWorldConfig::default());
        let builder = SceneBuilder::default();
        let handle = builder.build(&factory, &cube(), &gripper(0.3)).unwrap();
        let closing = ClosingSpec::Positions(vec![0.0, 0.0]);

        let centred = GraspCandidate::new(Isometry3::identity(), closing.clone());
        builder.check_candidate(&handle, &centred).unwrap();
        // the palm sits 0.06 above the grasp pose, so it reaches into the
        // cube 0.01 deep once the pose is lowered by 0.03
        let low = GraspCandidate::new(Isometry3::translation(0.0, 0.0, -0.03), closing);
        let err = builder.check_candidate(&handle, &low).unwrap_err();
        match err {
            SceneBuildError::InitialPenetration { link, depth, .. } => {
                assert_eq!(link, "palm");
                assert!((depth - 0.01).abs() < 1e-9, "{depth}");
            }
            err => panic!("{err:?}"),
        }
        // the gripper has not moved
        let z = handle.gripper_state().unwrap().pose.translation.vector.z;
        assert!((z - 0.3).abs() < 1e-9, "{z}");
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        let factory = DummyWorldFactory::new(DummyWorldConfig::default());
        let mut mug = cube();
        mug.geometry = Geometry::Mesh {
            uri: "package://objects/mug.stl".to_owned(),
        };
        assert!(matches!(
            SceneBuilder::default().build(&factory, &mug, &gripper(0.3)),
            Err(SceneBuildError::InvalidDescriptor(_))
        ));
        let mut broken = gripper(0.3);
        broken.joints.clear();
        assert!(matches!(
            SceneBuilder::default().build(&factory, &cube(), &broken),
            Err(SceneBuildError::InvalidDescriptor(_))
        ));
        assert_eq!(factory.created_worlds(), 1);
        assert_eq!(factory.live_worlds(), 0);
    }
}
