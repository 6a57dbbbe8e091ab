mod dummy_world;

pub use dummy_world::*;
