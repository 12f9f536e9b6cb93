//! Parses and evaluates the RSE-expression grammar (spec.md §4.2, §6):
//! boolean/set expressions over RSE attributes, resolving to a concrete
//! set of RSE ids. Pure and cacheable by expression string.

pub mod ast;
pub mod error;
pub mod evaluator;

pub use ast::{parse, Atom, Expr};
pub use error::RseExprError;
pub use evaluator::Evaluator;
