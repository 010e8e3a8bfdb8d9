//! jqvm - A lightweight bytecode VM for a jq-style JSON query language
//!
//! Queries in this language are multi-valued: a single program may emit
//! zero, one, or many outputs from one input. jqvm executes pre-compiled
//! bytecode against an input [`Value`] and exposes the results as a lazy
//! iterator, backtracking over choice points to enumerate alternatives in
//! depth-first, left-to-right order.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use jqvm::{Env, Op, Program, Value};
//!
//! // The bytecode for `.[]`: iterate the input collection.
//! let program = Arc::new(Program::new(vec![
//!     Op::Scope { id: 0, locals: 0 },
//!     Op::Each,
//!     Op::Ret,
//! ]));
//!
//! let input = Value::from(serde_json::json!([1, 2, 3]));
//! let outputs: Vec<Value> = Env::new(program)
//!     .execute(input)
//!     .collect::<jqvm::Result<_>>()
//!     .unwrap();
//! assert_eq!(outputs.len(), 3);
//! ```
//!
//! # What's Inside
//!
//! - The **virtual machine** ([`Env`], [`Iter`]): an instruction dispatch
//!   loop over an operand stack, a scope stack with indexed local slots,
//!   and a LIFO list of forks (choice points) driving backtracking.
//! - The **bytecode model** ([`Program`], [`Op`]): a flat instruction
//!   array indexed by program counter, with typed operands, optional
//!   debug records, a well-formedness check, and a disassembly listing.
//! - The **tree-walk interpreter** ([`run`], [`outputs`]): an independent
//!   evaluator for the identity/index/array subset of the language,
//!   usable as an oracle when testing compiled programs.
//!
//! # What's Outside
//!
//! Parsing query text, compiling it to bytecode, and the built-in
//! function library all live in front-end crates. The VM invokes
//! built-ins through the opaque [`NativeCall`] ABI and consumes programs
//! as plain data, so tests (and compilers) construct [`Program`]s
//! directly.

mod bytecode;
mod error;
mod eval;
mod query;
mod slice;
mod stack;
mod value;
mod vm;

pub use bytecode::{CodeInfo, NativeCall, NativeFn, Op, Program, ScopedSlot, Span};
pub use error::{Error, Result};
pub use eval::{outputs, run};
pub use query::{ArrayIndex, Comma, Expr, Pipe, Query, Suffix, Term, TermKind};
pub use value::Value;
pub use vm::{Env, Iter};
