//! Variable handles.

use super::ids::VarId;
use super::space::FunctionSpace;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Handle naming a value that equations read and write.
///
/// Handles compare and hash by id. The flags drive checkpointing:
///
/// - `is_static`: the value never changes after creation.
/// - `checkpointable`: a replay needs an owned copy of the value. When
///   false the checkpoint store keeps a shared reference instead. Static
///   handles default to non-checkpointable.
///
/// A *placeholder* carries the id, space and flags of the original handle
/// but signals that the domain has released the underlying object. The
/// tape keeps using the id; values come from checkpoint storage.
#[derive(Clone)]
pub struct Variable {
    id: VarId,
    name: Arc<str>,
    space: Arc<FunctionSpace>,
    is_static: bool,
    checkpointable: bool,
    placeholder: bool,
}

impl Variable {
    /// Creates a new checkpointable, non-static handle.
    pub fn new(space: &Arc<FunctionSpace>, name: &str) -> Self {
        Self {
            id: VarId::next(),
            name: Arc::from(name),
            space: Arc::clone(space),
            is_static: false,
            checkpointable: true,
            placeholder: false,
        }
    }

    /// Marks the handle static. Also sets `checkpointable` to `!is_static`;
    /// call [`with_checkpointable`](Self::with_checkpointable) afterwards to
    /// override.
    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self.checkpointable = !is_static;
        self
    }

    pub fn with_checkpointable(mut self, checkpointable: bool) -> Self {
        self.checkpointable = checkpointable;
        self
    }

    /// Placeholder standing in for this handle after release.
    pub fn placeholder(&self) -> Self {
        Self {
            placeholder: true,
            ..self.clone()
        }
    }

    #[inline]
    pub fn id(&self) -> VarId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn space(&self) -> &Arc<FunctionSpace> {
        &self.space
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    #[inline]
    pub fn is_checkpointable(&self) -> bool {
        self.checkpointable
    }

    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("space", &self.space.name())
            .field("is_static", &self.is_static)
            .field("checkpointable", &self.checkpointable)
            .field("placeholder", &self.placeholder)
            .finish()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_defaults_to_reference() {
        let space = FunctionSpace::new("R", 1);
        let v = Variable::new(&space, "k");
        assert!(v.is_checkpointable());

        let s = Variable::new(&space, "k").with_static(true);
        assert!(s.is_static());
        assert!(!s.is_checkpointable());

        let s = s.with_checkpointable(true);
        assert!(s.is_checkpointable());
    }

    #[test]
    fn test_placeholder_keeps_identity() {
        let space = FunctionSpace::new("R", 1);
        let v = Variable::new(&space, "u");
        let p = v.placeholder();
        assert_eq!(v, p);
        assert!(p.is_placeholder());
        assert!(!v.is_placeholder());
        assert_eq!(p.name(), "u");
    }
}
