//! # Grammar Abstract Syntax Tree
//!
//! The input to the bytecode compiler (`node`) and the values the
//! interpreter manipulates at parse time (`value`).
//!
//! The tree is produced and validated upstream: rule names are unique and
//! every `RuleRef` resolves. See [`crate::passes`] for those checks.

pub mod node;
pub mod value;
