use std::f64;

use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use urdf_rs::JointType;

use crate::error::Error;

/// Opaque handle of a body inside one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BodyHandle(pub u64);

fn default_pose() -> Isometry3<f64> {
    Isometry3::identity()
}

/// Geometry reference of a rigid object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    Box { half_extents: Vector3<f64> },
    Sphere { radius: f64 },
    Cylinder { radius: f64, half_height: f64 },
    /// Resolved by the world; an unknown uri is an invalid reference.
    Mesh { uri: String },
}

impl Geometry {
    /// Half extents of the axis aligned bounding box in the body frame.
    ///
    /// Returns `None` for meshes, whose size is only known to the world.
    pub fn half_extents(&self) -> Option<Vector3<f64>> {
        match self {
            Geometry::Box { half_extents } => Some(*half_extents),
            Geometry::Sphere { radius } => Some(Vector3::new(*radius, *radius, *radius)),
            Geometry::Cylinder {
                radius,
                half_height,
            } => Some(Vector3::new(*radius, *radius, *half_height)),
            Geometry::Mesh { .. } => None,
        }
    }

    fn validate(&self, name: &str) -> Result<(), Error> {
        let invalid = |message: &str| {
            Err(Error::InvalidGeometry(format!("{name}: {message}")))
        };
        match self {
            Geometry::Mesh { uri } if uri.trim().is_empty() => invalid("empty mesh uri"),
            Geometry::Mesh { .. } => Ok(()),
            _ => match self.half_extents() {
                Some(h) if h.iter().all(|v| v.is_finite() && *v > 0.0) => Ok(()),
                _ => invalid("extents must be finite and positive"),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub name: String,
    pub geometry: Geometry,
    pub mass: f64,
    pub friction: f64,
    pub restitution: f64,
    #[serde(default = "default_pose")]
    pub initial_pose: Isometry3<f64>,
}

impl ObjectDescriptor {
    pub fn new(name: impl Into<String>, geometry: Geometry, mass: f64) -> Self {
        Self {
            name: name.into(),
            geometry,
            mass,
            friction: 0.5,
            restitution: 0.0,
            initial_pose: Isometry3::identity(),
        }
    }

    pub fn with_friction(mut self, friction: f64) -> Self {
        self.friction = friction;
        self
    }

    pub fn with_initial_pose(mut self, pose: Isometry3<f64>) -> Self {
        self.initial_pose = pose;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.geometry.validate(&self.name)?;
        let invalid = |message: String| {
            Err(Error::InvalidDescriptor {
                name: self.name.clone(),
                message,
            })
        };
        if !(self.mass.is_finite() && self.mass > 0.0) {
            return invalid(format!("mass must be positive but {}", self.mass));
        }
        if !(self.friction.is_finite() && self.friction >= 0.0) {
            return invalid(format!("friction must be >= 0 but {}", self.friction));
        }
        if !(0.0..=1.0).contains(&self.restitution) {
            return invalid(format!(
                "restitution must be 0.0~1.0 but {}",
                self.restitution
            ));
        }
        if !is_finite_pose(&self.initial_pose) {
            return invalid("initial pose is not finite".to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    Position,
    Velocity,
    Torque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointKind {
    Revolute,
    Prismatic,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimit {
    pub lower: f64,
    pub upper: f64,
    pub effort: f64,
    pub velocity: f64,
}

impl JointLimit {
    pub fn new(lower: f64, upper: f64, effort: f64, velocity: f64) -> Self {
        Self {
            lower,
            upper,
            effort,
            velocity,
        }
    }

    pub fn contains(&self, position: f64) -> bool {
        (self.lower..=self.upper).contains(&position)
    }

    pub fn clamp(&self, position: f64) -> f64 {
        position.clamp(self.lower, self.upper)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointDescriptor {
    pub name: String,
    pub kind: JointKind,
    pub parent: String,
    pub child: String,
    pub limit: JointLimit,
    #[serde(default)]
    pub initial_position: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GripperDescriptor {
    pub name: String,
    pub links: Vec<LinkDescriptor>,
    pub joints: Vec<JointDescriptor>,
    pub actuator: ActuatorKind,
    /// Friction coefficient of the finger pads.
    pub friction: f64,
    #[serde(default = "default_pose")]
    pub initial_pose: Isometry3<f64>,
}

impl GripperDescriptor {
    /// Joints that receive actuator targets, in descriptor order.
    pub fn actuated_joints(&self) -> impl Iterator<Item = &JointDescriptor> {
        self.joints.iter().filter(|j| j.kind != JointKind::Fixed)
    }

    pub fn joint_names(&self) -> Vec<String> {
        self.actuated_joints().map(|j| j.name.clone()).collect()
    }

    pub fn dof(&self) -> usize {
        self.actuated_joints().count()
    }

    /// Initial positions of the actuated joints, i.e. the open configuration.
    pub fn open_positions(&self) -> Vec<f64> {
        self.actuated_joints().map(|j| j.initial_position).collect()
    }

    pub fn limits(&self) -> Vec<JointLimit> {
        self.actuated_joints().map(|j| j.limit).collect()
    }

    pub fn with_initial_pose(mut self, pose: Isometry3<f64>) -> Self {
        self.initial_pose = pose;
        self
    }

    /// Builds a descriptor from a parsed URDF.
    ///
    /// Continuous joints are limited to `-PI..=PI`. The initial position of
    /// each joint is the upper limit, which is the open configuration for
    /// grippers whose joints close toward the lower limit.
    pub fn from_urdf_robot(
        robot: &urdf_rs::Robot,
        actuator: ActuatorKind,
        friction: f64,
    ) -> Result<Self, Error> {
        let links = robot
            .links
            .iter()
            .map(|l| LinkDescriptor {
                name: l.name.clone(),
            })
            .collect();
        let mut joints = Vec::with_capacity(robot.joints.len());
        for joint in &robot.joints {
            let (kind, limit) = match joint.joint_type {
                JointType::Revolute => (
                    JointKind::Revolute,
                    JointLimit::new(
                        joint.limit.lower,
                        joint.limit.upper,
                        joint.limit.effort,
                        joint.limit.velocity,
                    ),
                ),
                // If limit is not specified, urdf-rs assigns f64::default.
                JointType::Continuous => (
                    JointKind::Revolute,
                    JointLimit::new(
                        -f64::consts::PI,
                        f64::consts::PI,
                        joint.limit.effort,
                        joint.limit.velocity,
                    ),
                ),
                JointType::Prismatic => (
                    JointKind::Prismatic,
                    JointLimit::new(
                        joint.limit.lower,
                        joint.limit.upper,
                        joint.limit.effort,
                        joint.limit.velocity,
                    ),
                ),
                JointType::Fixed => (JointKind::Fixed, JointLimit::new(0.0, 0.0, 0.0, 0.0)),
                ref other => {
                    return Err(Error::InvalidDescriptor {
                        name: joint.name.clone(),
                        message: format!("unsupported joint type {other:?}"),
                    })
                }
            };
            joints.push(JointDescriptor {
                name: joint.name.clone(),
                kind,
                parent: joint.parent.link.clone(),
                child: joint.child.link.clone(),
                limit,
                initial_position: limit.upper,
            });
        }
        Ok(Self {
            name: robot.name.clone(),
            links,
            joints,
            actuator,
            friction,
            initial_pose: Isometry3::identity(),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| {
            Err(Error::InvalidDescriptor {
                name: self.name.clone(),
                message,
            })
        };
        if self.dof() == 0 {
            return invalid("gripper has no actuated joint".to_owned());
        }
        if !(self.friction.is_finite() && self.friction >= 0.0) {
            return invalid(format!("friction must be >= 0 but {}", self.friction));
        }
        if !is_finite_pose(&self.initial_pose) {
            return invalid("initial pose is not finite".to_owned());
        }
        for (i, link) in self.links.iter().enumerate() {
            if self.links[..i].iter().any(|l| l.name == link.name) {
                return invalid(format!("duplicated link {}", link.name));
            }
        }
        let has_link = |name: &str| self.links.iter().any(|l| l.name == name);
        for joint in &self.joints {
            if !has_link(&joint.parent) || !has_link(&joint.child) {
                return invalid(format!(
                    "joint {} refers to unknown link ({} -> {})",
                    joint.name, joint.parent, joint.child
                ));
            }
            if joint.kind == JointKind::Fixed {
                continue;
            }
            let limit = &joint.limit;
            if !(limit.lower <= limit.upper) || limit.effort < 0.0 || limit.velocity <= 0.0 {
                return invalid(format!("joint {} has invalid limit {limit:?}", joint.name));
            }
            if !limit.contains(joint.initial_position) {
                return Err(Error::OutOfLimit {
                    name: joint.name.clone(),
                    position: joint.initial_position,
                    limit: limit.lower..=limit.upper,
                });
            }
        }
        Ok(())
    }
}

/// Command for one actuated joint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorTarget {
    Position(f64),
    Velocity(f64),
    Torque(f64),
}

impl ActuatorTarget {
    pub fn kind(&self) -> ActuatorKind {
        match self {
            ActuatorTarget::Position(_) => ActuatorKind::Position,
            ActuatorTarget::Velocity(_) => ActuatorKind::Velocity,
            ActuatorTarget::Torque(_) => ActuatorKind::Torque,
        }
    }

    pub fn value(&self) -> f64 {
        match *self {
            ActuatorTarget::Position(v)
            | ActuatorTarget::Velocity(v)
            | ActuatorTarget::Torque(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyState {
    pub pose: Isometry3<f64>,
    pub linear_velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

impl BodyState {
    pub fn at_rest(pose: Isometry3<f64>) -> Self {
        Self {
            pose,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
        }
    }

    pub fn is_finite(&self) -> bool {
        is_finite_pose(&self.pose)
            && self.linear_velocity.iter().all(|v| v.is_finite())
            && self.angular_velocity.iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JointState {
    pub position: f64,
    pub velocity: f64,
    pub effort: f64,
}

/// One contact between a link of the first body and the second body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub link: String,
    pub position: Point3<f64>,
    /// Unit normal pointing from the link into the other body.
    pub normal: Vector3<f64>,
    pub depth: f64,
    pub normal_force: f64,
    pub tangential_force: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingSpec {
    /// Target position of every actuated joint.
    Positions(Vec<f64>),
    /// Sequence of joint position waypoints, the last one being the goal.
    Waypoints(Vec<Vec<f64>>),
    /// Target effort of every actuated joint. Torque actuators only.
    Efforts(Vec<f64>),
}

impl ClosingSpec {
    pub fn waypoints(&self) -> Vec<Vec<f64>> {
        match self {
            ClosingSpec::Positions(p) => vec![p.clone()],
            ClosingSpec::Waypoints(w) => w.clone(),
            ClosingSpec::Efforts(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraspCandidate {
    /// Target pose of the gripper in the object frame.
    pub target_pose: Isometry3<f64>,
    pub closing: ClosingSpec,
    /// Direction of travel toward the object, in the object frame.
    pub approach_direction: Vector3<f64>,
    pub approach_offset: f64,
}

impl GraspCandidate {
    pub fn new(target_pose: Isometry3<f64>, closing: ClosingSpec) -> Self {
        Self {
            target_pose,
            closing,
            approach_direction: -Vector3::z(),
            approach_offset: 0.1,
        }
    }

    pub fn with_approach(mut self, direction: Vector3<f64>, offset: f64) -> Self {
        self.approach_direction = direction;
        self.approach_offset = offset;
        self
    }

    /// The target pose backed off against the approach direction, in the
    /// object frame.
    pub fn pregrasp_pose(&self) -> Isometry3<f64> {
        let direction = self.approach_direction.normalize();
        let mut pose = self.target_pose;
        pose.translation.vector -= direction * self.approach_offset;
        pose
    }

    pub fn validate(&self, gripper: &GripperDescriptor) -> Result<(), Error> {
        let invalid = |message: String| {
            Err(Error::InvalidDescriptor {
                name: "grasp candidate".to_owned(),
                message,
            })
        };
        if !is_finite_pose(&self.target_pose) {
            return invalid("target pose is not finite".to_owned());
        }
        let norm = self.approach_direction.norm();
        if !norm.is_finite() || norm < 1e-9 {
            return invalid("approach direction must be a non zero vector".to_owned());
        }
        if !(self.approach_offset.is_finite() && self.approach_offset >= 0.0) {
            return invalid(format!(
                "approach offset must be >= 0 but {}",
                self.approach_offset
            ));
        }
        let dof = gripper.dof();
        match &self.closing {
            ClosingSpec::Efforts(efforts) => {
                if gripper.actuator != ActuatorKind::Torque {
                    return Err(Error::ActuatorMismatch {
                        name: gripper.name.clone(),
                        expected: gripper.actuator,
                        actual: ActuatorKind::Torque,
                    });
                }
                if efforts.len() != dof {
                    return Err(Error::LengthMismatch {
                        model: dof,
                        input: efforts.len(),
                    });
                }
            }
            closing => {
                let waypoints = closing.waypoints();
                if waypoints.is_empty() {
                    return invalid("closing trajectory has no waypoint".to_owned());
                }
                for waypoint in &waypoints {
                    if waypoint.len() != dof {
                        return Err(Error::LengthMismatch {
                            model: dof,
                            input: waypoint.len(),
                        });
                    }
                    for (joint, position) in gripper.actuated_joints().zip(waypoint) {
                        if !joint.limit.contains(*position) {
                            return Err(Error::OutOfLimit {
                                name: joint.name.clone(),
                                position: *position,
                                limit: joint.limit.lower..=joint.limit.upper,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn is_finite_pose(pose: &Isometry3<f64>) -> bool {
    pose.translation.vector.iter().all(|v| v.is_finite())
        && pose.rotation.coords.iter().all(|v| v.is_finite())
}
