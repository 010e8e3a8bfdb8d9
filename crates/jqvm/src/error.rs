//! The error sum type shared by the VM and the tree-walk interpreter.
//!
//! Errors are sticky inside the VM's dispatch loop: once set, only a
//! `forkopt` backtrack (try/catch on an optional path) or a `forklabel`
//! backtrack with a matching label clears them. Catch sites discriminate
//! by variant.

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Object indexing was applied to a non-object.
    #[error("expected an object but got: {} ({})", .0.type_name(), .0)]
    ExpectedObject(Value),

    /// Array indexing or slicing was applied to a non-array.
    #[error("expected an array but got: {} ({})", .0.type_name(), .0)]
    ExpectedArray(Value),

    /// Iteration was applied to a value that is not a collection.
    #[error("cannot iterate over: {} ({})", .0.type_name(), .0)]
    Iterator(Value),

    /// The `object` opcode saw a key that is not a string.
    #[error("object key must be a string but got: {} ({})", .0.type_name(), .0)]
    ObjectKeyNotString(Value),

    /// Non-local exit carrying the label it is heading for. Swallowed by
    /// the matching `forklabel` backtrack, propagated by everything else.
    #[error("break {0}")]
    Break(String),

    /// The tree-walk interpreter met a malformed query fragment.
    #[error("unexpected query")]
    UnexpectedQuery,

    /// An error returned by a native callable, propagated as-is.
    #[error("{0}")]
    Native(String),

    /// A jump, call, or fork target points outside the program.
    /// Reported by [`crate::Program::validate`], never at run time.
    #[error("instruction {pc} targets invalid address {target}")]
    InvalidTarget { pc: usize, target: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
