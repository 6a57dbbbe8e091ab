use std::{
    io,
    sync::{Arc, Mutex},
};

use assert_approx_eq::assert_approx_eq;
use graspi::{
    ActuatorKind, ActuatorTarget, ClosingSpec, DummyWorldConfig, DummyWorldFactory, Geometry,
    GraspCandidate, GripperDescriptor, Isometry3, ObjectDescriptor, SteppableWorld, Vector3,
    WorldFactory,
};
use openrr_grasp::{GraspTrialConfig, GraspTrialRunner, Verdict};
use openrr_grasp_tracing::{de, Tracing};

#[derive(Clone, Default)]
struct Buffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Buffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Runs `f` with a JSON subscriber and returns the parsed logs.
fn capture(f: impl FnOnce()) -> Vec<de::TracingLog> {
    let buffer = Buffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    de::from_str(&buffer.contents()).unwrap()
}

const TWO_FINGER_URDF: &str = r#"<robot name="two_finger">
  <link name="palm"/>
  <link name="left_finger"/>
  <link name="right_finger"/>
  <joint name="left_joint" type="prismatic">
    <parent link="palm"/>
    <child link="left_finger"/>
    <axis xyz="0 1 0"/>
    <limit lower="0.0" upper="0.05" effort="40.0" velocity="0.05"/>
  </joint>
  <joint name="right_joint" type="prismatic">
    <parent link="palm"/>
    <child link="right_finger"/>
    <axis xyz="0 -1 0"/>
    <limit lower="0.0" upper="0.05" effort="40.0" velocity="0.05"/>
  </joint>
</robot>"#;

fn gripper() -> GripperDescriptor {
    let robot = urdf_rs::read_from_string(TWO_FINGER_URDF).unwrap();
    GripperDescriptor::from_urdf_robot(&robot, ActuatorKind::Position, 1.0)
        .unwrap()
        .with_initial_pose(Isometry3::translation(0.0, 0.0, 0.3))
}

fn cube() -> ObjectDescriptor {
    ObjectDescriptor::new(
        "cube",
        Geometry::Box {
            half_extents: Vector3::new(0.02, 0.02, 0.02),
        },
        0.1,
    )
    .with_friction(1.0)
    .with_initial_pose(Isometry3::translation(0.0, 0.0, 0.02))
}

#[test]
fn test_world_calls() {
    let factory = Tracing::new(DummyWorldFactory::new(DummyWorldConfig::default()));
    let logs = capture(|| {
        let mut world = factory.create_world().unwrap();
        let object = world.load_object(&cube()).unwrap();
        let gripper = world.load_gripper(&gripper()).unwrap();
        world
            .set_base_target(gripper, &Isometry3::translation(0.0, 0.0, 0.25))
            .unwrap();
        world
            .set_joint_targets(
                gripper,
                &[ActuatorTarget::Position(0.04), ActuatorTarget::Position(0.04)],
            )
            .unwrap();
        world.step().unwrap();
        world.step().unwrap();
        world.body_state(object).unwrap();
        world.joint_states(gripper).unwrap();
        world.contact_points(gripper, object).unwrap();
        world.teardown().unwrap();
    });
    assert_eq!(factory.get_ref().live_worlds(), 0);

    assert_eq!(logs.len(), 11);
    assert!(matches!(logs[0], de::TracingLog::CreateWorld(_)));
    match &logs[1] {
        de::TracingLog::LoadObject(log) => assert_eq!(log.name, "cube"),
        log => panic!("{log:?}"),
    }
    let gripper_handle = match &logs[2] {
        de::TracingLog::LoadGripper(log) => {
            assert_eq!(log.name, "two_finger");
            log.body
        }
        log => panic!("{log:?}"),
    };
    match &logs[3] {
        de::TracingLog::SetBaseTarget(log) => {
            assert_eq!(log.gripper, gripper_handle);
            assert_approx_eq!(log.pose.translation.vector.z, 0.25);
            assert_approx_eq!(log.pose.rotation.angle(), 0.0);
        }
        log => panic!("{log:?}"),
    }
    match &logs[4] {
        de::TracingLog::SetJointTargets(log) => {
            assert_eq!(
                log.targets,
                vec![ActuatorTarget::Position(0.04), ActuatorTarget::Position(0.04)]
            );
        }
        log => panic!("{log:?}"),
    }
    let steps: Vec<u64> = logs
        .iter()
        .filter_map(|log| match log {
            de::TracingLog::Step(log) => Some(log.step),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![1, 2]);
    match &logs[7] {
        de::TracingLog::BodyState(log) => {
            assert_approx_eq!(log.pose.translation.vector.z, 0.02);
            assert_approx_eq!(log.linear_velocity.norm(), 0.0);
        }
        log => panic!("{log:?}"),
    }
    match &logs[8] {
        de::TracingLog::JointStates(log) => {
            assert_eq!(log.gripper, gripper_handle);
            assert_eq!(log.positions.len(), 2);
        }
        log => panic!("{log:?}"),
    }
    match &logs[9] {
        de::TracingLog::ContactPoints(log) => {
            assert!(log.links.is_empty());
            assert_approx_eq!(log.total_normal_force, 0.0);
        }
        log => panic!("{log:?}"),
    }
    assert!(matches!(logs[10], de::TracingLog::Teardown(_)));
}

#[test]
fn test_unrelated_lines_are_skipped() {
    let lines = r#"{"timestamp":"2024-01-01T00:00:00.000000Z","level":"INFO","fields":{"message":"hello"},"target":"openrr_grasp"}

{"timestamp":"2024-01-01T00:00:00.000000Z","level":"TRACE","fields":{"method":"graspi::SteppableWorld::step","step":3},"target":"openrr_grasp_tracing"}
{"timestamp":"2024-01-01T00:00:00.000000Z","level":"TRACE","fields":{"method":"graspi::SteppableWorld::timestep"},"target":"openrr_grasp_tracing"}"#;
    let logs = de::from_str(lines).unwrap();
    assert_eq!(logs.len(), 1);
    match &logs[0] {
        de::TracingLog::Step(log) => assert_eq!(log.step, 3),
        log => panic!("{log:?}"),
    }
    assert!(de::from_str("not json").is_err());
}

#[test]
fn test_traced_trial() {
    let runner = GraspTrialRunner::new(
        Tracing::new(DummyWorldFactory::new(DummyWorldConfig::default())),
        GraspTrialConfig::default(),
    )
    .unwrap();
    let candidate = GraspCandidate::new(
        Isometry3::identity(),
        ClosingSpec::Positions(vec![0.0, 0.0]),
    );
    let mut result = None;
    let logs = capture(|| {
        result = Some(runner.run(&cube(), &gripper(), &candidate).unwrap());
    });
    let result = result.unwrap();
    assert_eq!(result.verdict, Verdict::Success);
    assert_eq!(runner.factory().get_ref().live_worlds(), 0);

    let steps = logs
        .iter()
        .filter(|log| matches!(log, de::TracingLog::Step(_)))
        .count() as u64;
    assert_eq!(steps, result.total_steps);
    assert_eq!(
        logs.iter()
            .filter(|log| matches!(log, de::TracingLog::Teardown(_)))
            .count(),
        1
    );
    let checked: Vec<_> = logs
        .iter()
        .filter_map(|log| match log {
            de::TracingLog::ContactPointsAt(log) => Some(log),
            _ => None,
        })
        .collect();
    assert_eq!(checked.len(), 1);
    assert_approx_eq!(checked[0].pose.translation.vector.z, 0.02);
    assert!(checked[0].links.is_empty());
}

#[test]
fn test_contact_points_at() {
    let factory = Tracing::new(DummyWorldFactory::new(DummyWorldConfig::default()));
    let logs = capture(|| {
        let mut world = factory.create_world().unwrap();
        let object = world.load_object(&cube()).unwrap();
        let gripper = world.load_gripper(&gripper()).unwrap();
        let contacts = world
            .contact_points_at(gripper, &Isometry3::translation(0.0, 0.0, -0.01), object)
            .unwrap();
        assert_eq!(contacts.len(), 1);
    });
    match logs.last() {
        Some(de::TracingLog::ContactPointsAt(log)) => {
            assert_approx_eq!(log.pose.translation.vector.z, -0.01);
            assert_eq!(log.links, vec!["palm".to_owned()]);
            assert_approx_eq!(log.max_depth, 0.01);
        }
        log => panic!("{log:?}"),
    }
}
