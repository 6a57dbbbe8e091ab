use std::ops::RangeInclusive;

use thiserror::Error;

use crate::types::{ActuatorKind, BodyHandle};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("graspi: Invalid geometry reference: {}", .0)]
    InvalidGeometry(String),
    #[error("graspi: Invalid descriptor {}: {}", name, message)]
    InvalidDescriptor { name: String, message: String },
    #[error("graspi: No body {:?} in this world.", .0)]
    NoBody(BodyHandle),
    #[error("graspi: Body {:?} is not a gripper.", .0)]
    NotGripper(BodyHandle),
    #[error("graspi: No Joint={} is found.", .0)]
    NoJoint(String),
    #[error("graspi: Length mismatch (model = {}, input = {})", model, input)]
    LengthMismatch { model: usize, input: usize },
    #[error(
        "graspi: Actuator mismatch: joint={} expects {:?} but got {:?}",
        name,
        expected,
        actual
    )]
    ActuatorMismatch {
        name: String,
        expected: ActuatorKind,
        actual: ActuatorKind,
    },
    #[error(
        "graspi: Out of limit: joint={}, position={}, limit={:?}",
        name,
        position,
        limit
    )]
    OutOfLimit {
        name: String,
        position: f64,
        limit: RangeInclusive<f64>,
    },
    #[error("graspi: World is already torn down.")]
    WorldClosed,
    #[error("graspi: Step {} failed: {}", step, message)]
    StepFailed { step: u64, message: String },
    #[error("graspi: Other: {:?}", .0)]
    Other(#[from] anyhow::Error),
}
