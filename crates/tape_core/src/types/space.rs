//! Function space descriptors.

use super::ids::SpaceId;
use std::sync::Arc;

/// Descriptor of the space a value lives in.
///
/// The tape treats spaces as opaque: it only needs the dimension to allocate
/// zero values and the id to rebuild fields read back from the slow tier.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FunctionSpace {
    id: SpaceId,
    name: String,
    dim: usize,
}

impl FunctionSpace {
    /// Creates a new, uniquely identified space.
    pub fn new(name: impl Into<String>, dim: usize) -> Arc<Self> {
        Arc::new(Self {
            id: SpaceId::next(),
            name: name.into(),
            dim,
        })
    }

    /// Single-component space, used for scalar functionals.
    pub fn scalar() -> Arc<Self> {
        Self::new("R", 1)
    }

    #[inline]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }
}
