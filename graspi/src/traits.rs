mod steppable_world;
mod world_factory;

pub use steppable_world::*;
pub use world_factory::*;
