use auto_impl::auto_impl;

use crate::{error::Error, traits::SteppableWorld};

/// Creates fresh, empty worlds.
#[auto_impl(&, Box, Arc)]
pub trait WorldFactory: Send + Sync {
    type World: SteppableWorld;

    fn create_world(&self) -> Result<Self::World, Error>;
}

/// A factory built from a closure.
pub struct WorldFactoryFn<F> {
    f: F,
}

impl<F> std::fmt::Debug for WorldFactoryFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldFactoryFn").finish_non_exhaustive()
    }
}

impl<F, W> WorldFactoryFn<F>
where
    F: Fn() -> Result<W, Error> + Send + Sync,
    W: SteppableWorld,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, W> WorldFactory for WorldFactoryFn<F>
where
    F: Fn() -> Result<W, Error> + Send + Sync,
    W: SteppableWorld,
{
    type World = W;

    fn create_world(&self) -> Result<W, Error> {
        (self.f)()
    }
}
