//! Grasp Simulation Interface.
//!
//! Descriptors of the bodies taking part in a grasp trial and the capability
//! traits a physics engine implements to run one.

mod error;
mod traits;
mod types;
mod worlds;

pub use error::*;
pub use traits::*;
pub use types::*;
pub use worlds::*;

// re-export
pub use nalgebra::{self, Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
