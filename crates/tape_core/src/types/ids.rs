//! Identifiers.
//!
//! Variable, space and equation ids are process-unique and allocated from
//! monotonic counters. A [`VersionKey`] names one particular value taken by
//! a variable: the pair of its id and the number of times an equation has
//! overwritten it within the current store epoch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_EQUATION_ID: AtomicU64 = AtomicU64::new(0);

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Allocates a fresh id.
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Raw integer value.
            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Unique id of a [`Variable`](super::Variable).
    VarId,
    NEXT_VAR_ID,
    "v"
);
define_id!(
    /// Unique id of a [`FunctionSpace`](super::FunctionSpace).
    SpaceId,
    NEXT_SPACE_ID,
    "s"
);
define_id!(
    /// Unique id of an [`Equation`](crate::Equation).
    EquationId,
    NEXT_EQUATION_ID,
    "eq"
);

/// A (variable id, overwrite count) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionKey {
    /// Variable id
    pub id: VarId,
    /// Number of overwrites seen in the current epoch
    pub version: u64,
}

impl VersionKey {
    pub fn new(id: VarId, version: u64) -> Self {
        Self { id, version }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.id, self.version)
    }
}

/// Position of an equation on the tape: block index and index within the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EquationKey {
    pub block: usize,
    pub index: usize,
}

impl EquationKey {
    pub fn new(block: usize, index: usize) -> Self {
        Self { block, index }
    }
}

impl fmt::Display for EquationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} equation {}", self.block, self.index)
    }
}
