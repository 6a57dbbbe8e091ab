//! Deserialize tracing log in JSON format

use graspi::{nalgebra, ActuatorTarget, BodyHandle, Isometry3, Vector3};
use serde::Deserialize;

pub type Timestamp = chrono::DateTime<chrono::Utc>;

pub fn from_str(lines: &str) -> Result<Vec<TracingLog>, graspi::Error> {
    let mut res = vec![];
    for line in lines.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| graspi::Error::Other(e.into()))?;
        // ignore unrelated line and log for other target (library/binary/module).
        if !matches!(value.get("target"), Some(target) if target == "openrr_grasp_tracing") {
            continue;
        }
        let Some(method) = value
            .get("fields")
            .and_then(|fields| fields.get("method"))
            .and_then(|method| method.as_str())
        else {
            continue;
        };
        let log = match method {
            "graspi::WorldFactory::create_world" => TracingLog::CreateWorld(parse(value)?),
            "graspi::SteppableWorld::load_object" => TracingLog::LoadObject(parse(value)?),
            "graspi::SteppableWorld::load_gripper" => TracingLog::LoadGripper(parse(value)?),
            "graspi::SteppableWorld::set_base_target" => TracingLog::SetBaseTarget(parse(value)?),
            "graspi::SteppableWorld::set_joint_targets" => {
                TracingLog::SetJointTargets(parse(value)?)
            }
            "graspi::SteppableWorld::step" => TracingLog::Step(parse(value)?),
            "graspi::SteppableWorld::body_state" => TracingLog::BodyState(parse(value)?),
            "graspi::SteppableWorld::joint_states" => TracingLog::JointStates(parse(value)?),
            "graspi::SteppableWorld::contact_points" => TracingLog::ContactPoints(parse(value)?),
            "graspi::SteppableWorld::contact_points_at" => {
                TracingLog::ContactPointsAt(parse(value)?)
            }
            "graspi::SteppableWorld::teardown" => TracingLog::Teardown(parse(value)?),
            _ => continue,
        };
        res.push(log);
    }
    Ok(res)
}

fn parse<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, graspi::Error> {
    serde_json::from_value(value).map_err(|e| graspi::Error::Other(e.into()))
}

#[derive(Debug)]
#[non_exhaustive]
pub enum TracingLog {
    /// [`graspi::WorldFactory::create_world`]
    CreateWorld(CreateWorldLog),

    /// [`graspi::SteppableWorld::load_object`]
    LoadObject(LoadObjectLog),
    /// [`graspi::SteppableWorld::load_gripper`]
    LoadGripper(LoadGripperLog),

    /// [`graspi::SteppableWorld::set_base_target`]
    SetBaseTarget(SetBaseTargetLog),
    /// [`graspi::SteppableWorld::set_joint_targets`]
    SetJointTargets(SetJointTargetsLog),

    /// [`graspi::SteppableWorld::step`]
    Step(StepLog),

    /// [`graspi::SteppableWorld::body_state`]
    BodyState(BodyStateLog),
    /// [`graspi::SteppableWorld::joint_states`]
    JointStates(JointStatesLog),
    /// [`graspi::SteppableWorld::contact_points`]
    ContactPoints(ContactPointsLog),
    /// [`graspi::SteppableWorld::contact_points_at`]
    ContactPointsAt(ContactPointsAtLog),

    /// [`graspi::SteppableWorld::teardown`]
    Teardown(TeardownLog),
}

#[derive(Deserialize)]
struct RawTracingLog<Fields> {
    timestamp: Timestamp,
    fields: Fields,
}

#[derive(Deserialize)]
struct PoseFields {
    pose_translation_x: f64,
    pose_translation_y: f64,
    pose_translation_z: f64,
    pose_rotation_i: f64,
    pose_rotation_j: f64,
    pose_rotation_k: f64,
    pose_rotation_w: f64,
}

impl PoseFields {
    fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            nalgebra::Translation3::new(
                self.pose_translation_x,
                self.pose_translation_y,
                self.pose_translation_z,
            ),
            nalgebra::UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                self.pose_rotation_w,
                self.pose_rotation_i,
                self.pose_rotation_j,
                self.pose_rotation_k,
            )),
        )
    }
}

// =============================================================================
// graspi::WorldFactory

#[derive(Debug)]
#[non_exhaustive]
pub struct CreateWorldLog {
    pub timestamp: Timestamp,
}

impl<'de> Deserialize<'de> for CreateWorldLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {}
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
        })
    }
}

// =============================================================================
// graspi::SteppableWorld loading

// Currently, both LoadObjectLog and LoadGripperLog are the same.
#[derive(Debug)]
#[non_exhaustive]
pub struct LoadObjectLog {
    pub timestamp: Timestamp,
    pub name: String,
    pub body: BodyHandle,
}
#[derive(Debug)]
#[non_exhaustive]
pub struct LoadGripperLog {
    pub timestamp: Timestamp,
    pub name: String,
    pub body: BodyHandle,
}

#[derive(Deserialize)]
struct LoadLogFields {
    name: String,
    body: u64,
}
impl<'de> Deserialize<'de> for LoadObjectLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = RawTracingLog::<LoadLogFields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            name: v.fields.name,
            body: BodyHandle(v.fields.body),
        })
    }
}
impl<'de> Deserialize<'de> for LoadGripperLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = RawTracingLog::<LoadLogFields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            name: v.fields.name,
            body: BodyHandle(v.fields.body),
        })
    }
}

// =============================================================================
// graspi::SteppableWorld targets

#[derive(Debug)]
#[non_exhaustive]
pub struct SetBaseTargetLog {
    pub timestamp: Timestamp,
    pub gripper: BodyHandle,
    pub pose: Isometry3<f64>,
}
#[derive(Debug)]
#[non_exhaustive]
pub struct SetJointTargetsLog {
    pub timestamp: Timestamp,
    pub gripper: BodyHandle,
    pub targets: Vec<ActuatorTarget>,
}

impl<'de> Deserialize<'de> for SetBaseTargetLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {
            gripper: u64,
            #[serde(flatten)]
            pose: PoseFields,
        }
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            gripper: BodyHandle(v.fields.gripper),
            pose: v.fields.pose.to_isometry(),
        })
    }
}
impl<'de> Deserialize<'de> for SetJointTargetsLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {
            gripper: u64,
            targets: String,
        }
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            gripper: BodyHandle(v.fields.gripper),
            targets: serde_json::from_str(&v.fields.targets).map_err(serde::de::Error::custom)?,
        })
    }
}

// =============================================================================
// graspi::SteppableWorld::step

#[derive(Debug)]
#[non_exhaustive]
pub struct StepLog {
    pub timestamp: Timestamp,
    /// Step count after the step.
    pub step: u64,
}

impl<'de> Deserialize<'de> for StepLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {
            step: u64,
        }
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            step: v.fields.step,
        })
    }
}

// =============================================================================
// graspi::SteppableWorld queries

#[derive(Debug)]
#[non_exhaustive]
pub struct BodyStateLog {
    pub timestamp: Timestamp,
    pub body: BodyHandle,
    pub pose: Isometry3<f64>,
    pub linear_velocity: Vector3<f64>,
}
#[derive(Debug)]
#[non_exhaustive]
pub struct JointStatesLog {
    pub timestamp: Timestamp,
    pub gripper: BodyHandle,
    pub positions: Vec<f64>,
}
#[derive(Debug)]
#[non_exhaustive]
pub struct ContactPointsLog {
    pub timestamp: Timestamp,
    pub a: BodyHandle,
    pub b: BodyHandle,
    pub links: Vec<String>,
    pub total_normal_force: f64,
}
#[derive(Debug)]
#[non_exhaustive]
pub struct ContactPointsAtLog {
    pub timestamp: Timestamp,
    pub a: BodyHandle,
    pub pose: Isometry3<f64>,
    pub b: BodyHandle,
    pub links: Vec<String>,
    pub max_depth: f64,
}

impl<'de> Deserialize<'de> for BodyStateLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {
            body: u64,
            #[serde(flatten)]
            pose: PoseFields,
            linear_velocity_x: f64,
            linear_velocity_y: f64,
            linear_velocity_z: f64,
        }
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            body: BodyHandle(v.fields.body),
            pose: v.fields.pose.to_isometry(),
            linear_velocity: Vector3::new(
                v.fields.linear_velocity_x,
                v.fields.linear_velocity_y,
                v.fields.linear_velocity_z,
            ),
        })
    }
}
impl<'de> Deserialize<'de> for JointStatesLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {
            gripper: u64,
            positions: String,
        }
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            gripper: BodyHandle(v.fields.gripper),
            // recorded with `?`, whose output is JSON for finite values
            positions: serde_json::from_str(&v.fields.positions).map_err(serde::de::Error::custom)?,
        })
    }
}
impl<'de> Deserialize<'de> for ContactPointsLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {
            a: u64,
            b: u64,
            links: String,
            total_normal_force: f64,
        }
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            a: BodyHandle(v.fields.a),
            b: BodyHandle(v.fields.b),
            links: serde_json::from_str(&v.fields.links).map_err(serde::de::Error::custom)?,
            total_normal_force: v.fields.total_normal_force,
        })
    }
}

impl<'de> Deserialize<'de> for ContactPointsAtLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {
            a: u64,
            #[serde(flatten)]
            pose: PoseFields,
            b: u64,
            links: String,
            max_depth: f64,
        }
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
            a: BodyHandle(v.fields.a),
            pose: v.fields.pose.to_isometry(),
            b: BodyHandle(v.fields.b),
            links: serde_json::from_str(&v.fields.links).map_err(serde::de::Error::custom)?,
            max_depth: v.fields.max_depth,
        })
    }
}

// =============================================================================
// graspi::SteppableWorld::teardown

#[derive(Debug)]
#[non_exhaustive]
pub struct TeardownLog {
    pub timestamp: Timestamp,
}

impl<'de> Deserialize<'de> for TeardownLog {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Fields {}
        let v = RawTracingLog::<Fields>::deserialize(deserializer)?;
        Ok(Self {
            timestamp: v.timestamp,
        })
    }
}
