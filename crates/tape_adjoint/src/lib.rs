//! # tape_adjoint: Equation Tape and Checkpointed Reverse Sweep
//!
//! Records equations block by block, hands block boundaries to the
//! configured snapshot schedule, and runs the reverse (adjoint) sweep that
//! turns a recorded forward computation into derivatives.
//!
//! # Key Components
//!
//! - [`EquationManager`]: annotation and tangent-linear state, block
//!   boundaries, finalisation and [`EquationManager::compute_gradient`]
//! - [`DependencyTransposer`]: routes adjoint contributions to the equation
//!   that last wrote each dependency
//! - [`AdjointRhs`]: pending adjoint right-hand sides
//! - [`equations`]: reference equations used by tests and the CLI demo
//! - [`verify`]: Taylor remainder and finite-difference checks
//!
//! # Example
//!
//! ```
//! use tape_adjoint::equations::{Pointwise, PointwiseOp};
//! use tape_adjoint::EquationManager;
//! use tape_core::{Field, FunctionSpace, Variable, Workspace};
//!
//! let space = FunctionSpace::scalar();
//! let a = Variable::new(&space, "a");
//! let b = Variable::new(&space, "b");
//!
//! let mut manager = EquationManager::new();
//! let mut ws = Workspace::new();
//! ws.set(&a, Field::constant(&space, 3.0)).unwrap();
//!
//! manager
//!     .solve(Box::new(Pointwise::new(&b, &a, PointwiseOp::Square).unwrap()), &mut ws)
//!     .unwrap();
//! let dj = manager.compute_gradient(&[b], &[a]).unwrap();
//! assert_eq!(dj[0][0].values(), &[6.0]);
//! ```

pub mod equations;
pub mod manager;
pub mod markers;
pub mod rhs;
pub mod tape;
pub mod transpose;
pub mod verify;

pub use manager::{
    AdjointEvent, AnnotationState, EquationManager, ManagerInfo, TlmState,
};
pub use rhs::AdjointRhs;
pub use tape::{ReplayStats, Tape};
pub use transpose::{DependencyTransposer, Use};
