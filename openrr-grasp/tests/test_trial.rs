use std::sync::Arc;

use assert_approx_eq::assert_approx_eq;
use graspi::{
    ActuatorKind, ClosingSpec, DummyWorldConfig, DummyWorldFactory, Geometry, GraspCandidate,
    GripperDescriptor, Isometry3, ObjectDescriptor, Vector3,
};
use openrr_grasp::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
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

fn gripper(actuator: ActuatorKind) -> GripperDescriptor {
    let robot = urdf_rs::read_from_string(TWO_FINGER_URDF).unwrap();
    GripperDescriptor::from_urdf_robot(&robot, actuator, 1.0)
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

fn centred_candidate() -> GraspCandidate {
    GraspCandidate::new(
        Isometry3::identity(),
        ClosingSpec::Positions(vec![0.0, 0.0]),
    )
}

fn runner(config: GraspTrialConfig) -> GraspTrialRunner<DummyWorldFactory> {
    runner_with_world(DummyWorldConfig::default(), config)
}

fn runner_with_world(
    world: DummyWorldConfig,
    config: GraspTrialConfig,
) -> GraspTrialRunner<DummyWorldFactory> {
    init_tracing();
    GraspTrialRunner::new(DummyWorldFactory::new(world), config).unwrap()
}

fn assert_monotonic(result: &TrialResult) {
    let samples = result.contacts.samples();
    assert!(samples.windows(2).all(|w| w[0].step < w[1].step));
}

#[test]
fn test_centred_grasp_succeeds() {
    let runner = runner(GraspTrialConfig::default());
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Success, "{:?}", result.failure_reason);
    assert_eq!(result.final_state, TrialState::Succeeded);
    assert!(result.failure_reason.is_none());
    let metrics = result.metrics.as_ref().unwrap();
    assert!(metrics.max_translation_deviation < 1e-6);
    assert!(metrics.max_relative_speed < 1e-6);
    assert_approx_eq!(metrics.contact_persistence, 1.0);
    assert!(metrics.force_closure);

    let phases: Vec<_> = result.phases.iter().map(|p| p.phase).collect();
    assert_eq!(phases, Phase::ALL);
    assert!(result.phases.iter().all(|p| p.completed));

    // the object is carried up with the gripper
    let last = result.lift_trajectory.last().unwrap();
    assert_approx_eq!(last.object.pose.translation.vector.z, 0.12, 1e-3);
    assert_monotonic(&result);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_offset_candidate_misses() {
    let runner = runner(GraspTrialConfig::default());
    let candidate = GraspCandidate::new(
        Isometry3::translation(0.1, 0.0, 0.0),
        ClosingSpec::Positions(vec![0.0, 0.0]),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &candidate)
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failure);
    assert_eq!(result.final_state, TrialState::Failed);
    assert_eq!(result.failure_reason, Some(FailureReason::MissedGrasp));
    assert_eq!(
        result.failure_reason.as_ref().unwrap().to_string(),
        "missed grasp"
    );
    assert!(result.metrics.is_none());
    assert_eq!(result.phases.len(), 3);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_interpenetrating_gripper_is_rejected() {
    let runner = runner(GraspTrialConfig::default());
    let gripper = gripper(ActuatorKind::Position)
        .with_initial_pose(Isometry3::translation(0.0, 0.0, -0.02));
    let err = runner
        .run(&cube(), &gripper, &centred_candidate())
        .unwrap_err();
    assert!(
        matches!(err, SceneBuildError::InitialPenetration { .. }),
        "{err:?}"
    );
    assert_eq!(runner.factory().created_worlds(), 1);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_short_lift_budget_aborts() {
    let mut config = GraspTrialConfig::default();
    config.phase_limits.lift = 100;
    let runner = runner(config);
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    assert_eq!(result.final_state, TrialState::Aborted);
    assert_eq!(
        result.failure_reason.as_ref().unwrap().to_string(),
        "phase timeout: lift"
    );
    // partial lifts are still scored
    assert!(result.metrics.is_some());
    let lift = result.phases.last().unwrap();
    assert_eq!(lift.phase, Phase::Lift);
    assert_eq!(lift.steps_used, 100);
    assert!(!lift.completed);
    assert_eq!(result.lift_trajectory.len(), 101);
    let lift_start = result.lift_trajectory[0].step;
    assert_eq!(result.contacts.since(lift_start).len(), 100);
    assert!(result.contacts.len() > 100);
    assert_monotonic(&result);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let cases: [(&str, fn(&mut GraspTrialConfig)); 3] = [
        ("motion.lift_acceleration", |c| c.motion.lift_acceleration = 0.0),
        ("close.max_joint_velocity", |c| c.close.max_joint_velocity = -0.5),
        ("close.max_tracking_error", |c| c.close.max_tracking_error = f64::NAN),
    ];
    for (field, update) in cases {
        let mut config = GraspTrialConfig::default();
        update(&mut config);
        let factory = DummyWorldFactory::new(DummyWorldConfig::default());
        match GraspTrialRunner::new(factory.clone(), config) {
            Err(Error::InvalidConfig { field: f, .. }) => assert_eq!(f, field),
            other => panic!("{field}: {other:?}"),
        }
        assert_eq!(factory.created_worlds(), 0);
    }
}

#[test]
fn test_interpenetrating_candidate_is_rejected() {
    let runner = runner(GraspTrialConfig::default());
    // the gripper spawns clear of the cube, but at the grasp pose the palm
    // is 0.01 deep in its top face
    let candidate = GraspCandidate::new(
        Isometry3::translation(0.0, 0.0, -0.03),
        ClosingSpec::Positions(vec![0.0, 0.0]),
    );
    let err = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &candidate)
        .unwrap_err();
    match err {
        SceneBuildError::InitialPenetration { link, depth, .. } => {
            assert_eq!(link, "palm");
            assert_approx_eq!(depth, 0.01);
        }
        err => panic!("{err:?}"),
    }
    assert_eq!(runner.factory().created_worlds(), 1);
    assert_eq!(runner.factory().live_worlds(), 0);

    // touching without penetrating is accepted
    let candidate = GraspCandidate::new(
        Isometry3::translation(0.0, 0.0, -0.02),
        ClosingSpec::Positions(vec![0.0, 0.0]),
    );
    assert!(runner
        .run(&cube(), &gripper(ActuatorKind::Position), &candidate)
        .is_ok());
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_premature_contact_fails() {
    let runner = runner(GraspTrialConfig::default());
    // approaching sideways, the left finger runs into the cube while aligning
    let candidate = centred_candidate().with_approach(Vector3::y(), 0.1);
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &candidate)
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failure);
    assert_eq!(result.final_state, TrialState::Failed);
    assert_eq!(result.failure_reason, Some(FailureReason::PrematureContact));
    let phases: Vec<_> = result.phases.iter().map(|p| p.phase).collect();
    assert_eq!(phases, vec![Phase::Approach, Phase::Align]);
    assert!(result.phases[0].completed);
    assert!(!result.phases[1].completed);
    assert!(result.contacts.is_empty());
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_divergence_while_settling_aborts() {
    let runner = runner_with_world(
        DummyWorldConfig::default().with_divergence_at(30),
        GraspTrialConfig::default(),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    assert_eq!(result.final_state, TrialState::Aborted);
    assert_eq!(result.failure_reason, Some(FailureReason::Diverged));
    assert!(result.phases.is_empty());
    assert_eq!(result.total_steps, 30);
    assert_eq!(runner.factory().created_worlds(), 1);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_engine_failure_while_settling_aborts() {
    let runner = runner_with_world(
        DummyWorldConfig::default().with_failure_at(30),
        GraspTrialConfig::default(),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    let reason = result.failure_reason.unwrap().to_string();
    assert!(reason.starts_with("simulation error: "), "{reason}");
    assert!(result.phases.is_empty());
    assert_eq!(result.total_steps, 29);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_divergence_aborts() {
    let runner = runner_with_world(
        DummyWorldConfig::default().with_divergence_at(100),
        GraspTrialConfig::default(),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    assert_eq!(result.failure_reason, Some(FailureReason::Diverged));
    assert_eq!(result.phases[0].phase, Phase::Approach);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_engine_failure_aborts() {
    let runner = runner_with_world(
        DummyWorldConfig::default().with_failure_at(200),
        GraspTrialConfig::default(),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    let reason = result.failure_reason.unwrap().to_string();
    assert!(reason.starts_with("simulation error: "), "{reason}");
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_approach_timeout_aborts() {
    let mut config = GraspTrialConfig::default();
    config.phase_limits.approach = 10;
    let runner = runner(config);
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    assert_eq!(
        result.failure_reason,
        Some(FailureReason::PhaseTimeout(Phase::Approach))
    );
    assert_eq!(result.phases.len(), 1);
}

#[test]
fn test_canceled_trial_aborts() {
    let runner = runner(GraspTrialConfig::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    let result = runner
        .run_with_cancel(
            &cube(),
            &gripper(ActuatorKind::Position),
            &centred_candidate(),
            &cancel,
        )
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    assert_eq!(result.failure_reason, Some(FailureReason::Canceled));
    assert_eq!(result.phases[0].steps_used, 0);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_wall_clock_ceiling_aborts() {
    let config = GraspTrialConfig {
        wall_clock_timeout_sec: Some(1e-9),
        ..Default::default()
    };
    let runner = runner(config);
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    assert_eq!(result.failure_reason, Some(FailureReason::WallClockTimeout));
}

#[test]
fn test_slippery_object_is_unstable() {
    let runner = runner(GraspTrialConfig::default());
    let result = runner
        .run(
            &cube().with_friction(0.001),
            &gripper(ActuatorKind::Position),
            &centred_candidate(),
        )
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failure);
    match result.failure_reason.unwrap() {
        FailureReason::Unstable(violations) => {
            assert!(violations.contains(&Violation::TranslationDeviation));
        }
        reason => panic!("{reason}"),
    }
    assert!(result.metrics.unwrap().max_translation_deviation > 0.05);
}

#[test]
fn test_velocity_actuated_gripper() {
    let runner = runner(GraspTrialConfig::default());
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Velocity), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Success, "{:?}", result.failure_reason);
}

#[test]
fn test_torque_actuated_gripper_with_efforts() {
    let runner = runner(GraspTrialConfig::default());
    let candidate = GraspCandidate::new(
        Isometry3::identity(),
        ClosingSpec::Efforts(vec![-20.0, -20.0]),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Torque), &candidate)
        .unwrap();
    assert_eq!(result.verdict, Verdict::Success, "{:?}", result.failure_reason);
    let last = result.contacts.last().unwrap();
    for contact in &last.contacts {
        assert_approx_eq!(contact.normal_force, 20.0);
    }
}

#[test]
fn test_efforts_need_torque_actuators() {
    let runner = runner(GraspTrialConfig::default());
    let candidate = GraspCandidate::new(
        Isometry3::identity(),
        ClosingSpec::Efforts(vec![-20.0, -20.0]),
    );
    let err = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &candidate)
        .unwrap_err();
    assert!(matches!(err, SceneBuildError::InvalidDescriptor(_)));
    assert_eq!(runner.factory().created_worlds(), 0);
}

#[test]
fn test_guarded_close_squeezes_gently() {
    let mut config = GraspTrialConfig::default();
    config.close.guarded = true;
    let runner = runner(config);
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Success, "{:?}", result.failure_reason);
    let last = result.contacts.last().unwrap();
    assert_eq!(last.contacts.len(), 2);
    for contact in &last.contacts {
        assert!(contact.normal_force < 5.0, "{contact:?}");
    }
}

#[test]
fn test_waypoint_closing() {
    let runner = runner(GraspTrialConfig::default());
    let candidate = GraspCandidate::new(
        Isometry3::identity(),
        ClosingSpec::Waypoints(vec![vec![0.04, 0.04], vec![0.0, 0.0]]),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &candidate)
        .unwrap();
    assert_eq!(result.verdict, Verdict::Success, "{:?}", result.failure_reason);
}

#[test]
fn test_tracking_error_aborts() {
    let mut config = GraspTrialConfig::default();
    config.close.max_tracking_error = 0.02;
    let runner = runner(config);

    // dense waypoints keep every finger close to the one it is heading for
    let candidate = GraspCandidate::new(
        Isometry3::identity(),
        ClosingSpec::Waypoints(
            [0.04, 0.03, 0.02, 0.01, 0.0]
                .iter()
                .map(|&q| vec![q, q])
                .collect(),
        ),
    );
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &candidate)
        .unwrap();
    assert_eq!(result.verdict, Verdict::Success, "{:?}", result.failure_reason);

    // closing straight to 0.0 leaves the fingers 0.05 behind
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Aborted);
    assert_eq!(result.final_state, TrialState::Aborted);
    assert_eq!(result.failure_reason, Some(FailureReason::TrackingError));
    assert_eq!(
        result.failure_reason.as_ref().unwrap().to_string(),
        "tracking error"
    );
    let close = result.phases.last().unwrap();
    assert_eq!(close.phase, Phase::Close);
    assert!(!close.completed);
    assert_eq!(close.steps_used, 0);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_force_noise_floor_hides_weak_contacts() {
    // the fingers squeeze with 40 N
    let mut config = GraspTrialConfig::default();
    config.contact.force_noise_floor = 100.0;
    let runner = runner(config);
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failure);
    assert_eq!(result.failure_reason, Some(FailureReason::MissedGrasp));
    assert!(result.contacts.samples().iter().all(|s| s.contacts.is_empty()));

    let mut config = GraspTrialConfig::default();
    config.contact.force_noise_floor = 40.0;
    let result = self::runner(config)
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Success, "{:?}", result.failure_reason);
}

#[test]
fn test_seeded_trials_are_deterministic() {
    let world = DummyWorldConfig::default()
        .with_seed(42)
        .with_force_noise(0.05);
    let a = runner_with_world(world.clone(), GraspTrialConfig::default())
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    let b = runner_with_world(world, GraspTrialConfig::default())
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.verdict, Verdict::Success);
}

#[test]
fn test_batch_runs_each_trial_in_its_own_world() {
    let runner = runner(GraspTrialConfig::default());
    let candidates = vec![
        centred_candidate(),
        GraspCandidate::new(
            Isometry3::translation(0.1, 0.0, 0.0),
            ClosingSpec::Positions(vec![0.0, 0.0]),
        ),
        centred_candidate(),
    ];
    let results = runner.run_batch(&cube(), &gripper(ActuatorKind::Position), &candidates);
    let verdicts: Vec<_> = results.iter().map(|r| r.as_ref().unwrap().verdict).collect();
    assert_eq!(
        verdicts,
        vec![Verdict::Success, Verdict::Failure, Verdict::Success]
    );
    assert_eq!(runner.factory().created_worlds(), 3);
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[test]
fn test_canceled_batch() {
    let runner = runner(GraspTrialConfig::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    let candidates = vec![centred_candidate(); 4];
    let results = runner.run_batch_with_cancel(
        &cube(),
        &gripper(ActuatorKind::Position),
        &candidates,
        &cancel,
    );
    assert!(results
        .iter()
        .all(|r| r.as_ref().unwrap().failure_reason == Some(FailureReason::Canceled)));
    assert_eq!(runner.factory().live_worlds(), 0);
}

#[derive(Debug)]
struct NeverHolds;

impl ForceClosureCheck for NeverHolds {
    fn holds(&self, _: &[Contact], _: &EvaluationContext) -> bool {
        false
    }
}

#[test]
fn test_custom_force_closure_check() {
    let runner =
        runner(GraspTrialConfig::default()).with_force_closure_check(Arc::new(NeverHolds));
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    assert_eq!(
        result.failure_reason,
        Some(FailureReason::Unstable(vec![Violation::ForceClosure]))
    );
}

#[test]
fn test_result_serialization() {
    let runner = runner(GraspTrialConfig::default());
    let result = runner
        .run(&cube(), &gripper(ActuatorKind::Position), &centred_candidate())
        .unwrap();
    let json = serde_json::to_string(&result).unwrap();
    let back: TrialResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back.verdict, result.verdict);
    assert_eq!(back.final_state, result.final_state);
    assert_eq!(back.phases, result.phases);
    assert_eq!(back.contacts.len(), result.contacts.len());
    assert_eq!(back.lift_trajectory.len(), result.lift_trajectory.len());
}

#[test]
fn test_config_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grasp.toml");
    std::fs::write(
        &path,
        r#"
[phase_limits]
lift = 100

[stability]
friction_cone_edges = 6
"#,
    )
    .unwrap();
    let config = GraspTrialConfig::from_path(&path).unwrap();
    assert_eq!(config.phase_limits.lift, 100);
    assert_eq!(config.stability.friction_cone_edges, 6);

    assert!(matches!(
        GraspTrialConfig::from_path(dir.path().join("missing.toml")),
        Err(Error::NoFile(..))
    ));
    std::fs::write(&path, "phase_limits = 3").unwrap();
    assert!(matches!(
        GraspTrialConfig::from_path(&path),
        Err(Error::TomlParseFailure(..))
    ));
}
