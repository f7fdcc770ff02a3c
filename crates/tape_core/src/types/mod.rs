//! Core value types.
//!
//! - [`ids`]: identifiers and version keys
//! - [`space`]: domain-supplied [`FunctionSpace`] descriptors
//! - [`field`]: shared, copy-on-write value buffers
//! - [`variable`]: [`Variable`] handles referenced by equations
//! - [`workspace`]: the domain's map of current values

pub mod field;
pub mod ids;
pub mod space;
pub mod variable;
pub mod workspace;

pub use field::Field;
pub use ids::{EquationId, EquationKey, SpaceId, VarId, VersionKey};
pub use space::FunctionSpace;
pub use variable::Variable;
pub use workspace::Workspace;
