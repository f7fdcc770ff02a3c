//! # tape_core: Value Model and Equation Interface
//!
//! Foundation crate for the checkpointed adjoint tape. Everything that the
//! checkpointing and reverse-sweep layers need to know about the domain is
//! expressed here, and nothing more.
//!
//! # Key Components
//!
//! - [`types`]: identifiers, version keys, function spaces, fields,
//!   variable handles and the workspace of current values
//! - [`equation`]: the [`Equation`] trait implemented by domain operations
//! - [`tangent`]: tangent-linear companion variables
//! - [`comm`]: the [`Communicator`] abstraction for SPMD execution
//! - [`error`]: the [`TapeError`] taxonomy shared by all layers
//!
//! # Example
//!
//! ```
//! use tape_core::types::{Field, FunctionSpace, Variable, Workspace};
//!
//! let space = FunctionSpace::new("R3", 3);
//! let u = Variable::new(&space, "u");
//! let mut ws = Workspace::new();
//! ws.set(&u, Field::constant(&space, 1.5)).unwrap();
//! assert_eq!(ws.get(&u).unwrap().sum(), 4.5);
//! ```

pub mod comm;
pub mod equation;
pub mod error;
pub mod tangent;
pub mod types;

pub use comm::{check_synchronized, Communicator, SelfComm};
pub use equation::{Equation, EquationBase};
pub use error::{ErrorKind, TapeError, TapeResult};
pub use tangent::TangentLinearMap;
pub use types::{
    EquationId, EquationKey, Field, FunctionSpace, SpaceId, VarId, Variable, VersionKey,
    Workspace,
};
