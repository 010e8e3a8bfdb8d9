//! Bytecode instruction set and compiled program representation.
//!
//! This module defines the instructions a compiler produces and the VM
//! executes. The compiler itself lives outside this crate; tests build
//! [`Program`]s directly, which the in-memory format is designed to allow.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::Value;

/// Address of a local: the id of the scope that owns it and the slot
/// offset within that scope's frame.
///
/// The VM resolves this to an absolute index into the locals array by
/// scanning the scope stack for the live frame with the matching id and
/// adding the frame's base offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopedSlot {
    pub scope: usize,
    pub slot: usize,
}

impl ScopedSlot {
    pub fn new(scope: usize, slot: usize) -> Self {
        Self { scope, slot }
    }
}

/// Signature of a native callable: the current input value plus the
/// popped arguments, producing a value or an error.
pub type NativeFn = Arc<dyn Fn(Value, Vec<Value>) -> Result<Value> + Send + Sync>;

/// A native function operand for [`Op::CallNative`].
///
/// The VM treats the callable as opaque; built-in libraries are supplied
/// by the embedder through this type. An `Err` return propagates through
/// the VM's normal error path.
#[derive(Clone)]
pub struct NativeCall {
    pub name: String,
    /// Number of arguments popped from the stack (the input value is
    /// popped separately and always passed).
    pub argc: usize,
    pub func: NativeFn,
}

impl NativeCall {
    pub fn new(
        name: impl Into<String>,
        argc: usize,
        func: impl Fn(Value, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            argc,
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for NativeCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCall")
            .field("name", &self.name)
            .field("argc", &self.argc)
            .finish_non_exhaustive()
    }
}

/// A single bytecode instruction.
///
/// The VM interprets these with a `loop { match op { ... } }` dispatch.
/// Jump, call, and fork targets are instruction indices (PCs) into the
/// containing [`Program`].
#[derive(Debug, Clone)]
pub enum Op {
    /// No effect.
    Nop,

    /// Push the constant onto the operand stack.
    Push(Value),

    /// Discard the top of the stack.
    Pop,

    /// Push a copy of the top of the stack.
    Dup,

    /// Exchange the two topmost entries.
    Swap,

    /// Replace the top of the stack with the constant. Equivalent to
    /// `pop; push v`, used where a value must be produced regardless of
    /// the input.
    Const(Value),

    /// Resolve the local and push its value.
    Load(ScopedSlot),

    /// Pop the top of the stack and write it to the local, growing the
    /// locals array as needed.
    Store(ScopedSlot),

    /// Pop `2n` entries as alternating value/key pairs (value on top) and
    /// push a single object. Fails with an object-key error if any key is
    /// not a string.
    Object(usize),

    /// Pop the top of the stack and append it to the array held in the
    /// named local, updating the slot in place. Accumulator for array
    /// construction; deliberately not restored by fork backtracking.
    Append(ScopedSlot),

    /// Choice point. Forward execution records a fork resuming at this
    /// instruction; on backtrack without a pending error, jump to the
    /// target. A pending error propagates past it.
    Fork(usize),

    /// As `Fork`, but a backtrack with a pending error pushes the error's
    /// message as a string, jumps to the target, and clears the error
    /// (try/catch on an optional path). A backtrack without an error
    /// propagates.
    ForkOpt(usize),

    /// As `Fork`, but the backtrack arm only swallows a pending
    /// `break` error carrying this label; it never resumes execution
    /// itself.
    ForkLabel(String),

    /// Unconditionally leave the dispatch loop, forcing the next fork to
    /// be popped (or iteration to finish).
    Backtrack,

    /// Set the PC to the target.
    Jump(usize),

    /// Pop the top of the stack; if it is `null` or `false`, jump to the
    /// target, otherwise fall through.
    JumpIfNot(usize),

    /// Call the compiled function at the target PC. Records the current
    /// PC and scope index for the paired `Scope` instruction at the
    /// callee entry.
    Call(usize),

    /// Pop the input value and `argc` arguments and invoke the native
    /// callable, pushing its result.
    CallNative(NativeCall),

    /// Push a first-class compiled function reference: the target PC
    /// paired with the current scope index.
    PushPc(usize),

    /// Pop a function reference and jump into it, adopting its recorded
    /// scope index as the caller scope.
    CallPc,

    /// Allocate an activation frame with the given function id and
    /// reserve `locals` slots in the locals array. Emitted by the
    /// compiler as the first instruction of every function body.
    Scope { id: usize, locals: usize },

    /// Return from the topmost frame. Returning from the last frame
    /// yields the top of the stack to the iterator, or signals
    /// exhaustion when the stack is empty too.
    Ret,

    /// Pop a collection and iterate it: push its first element and fork
    /// over the rest. An empty collection backtracks immediately; a
    /// non-collection raises an iterator error.
    Each,
}

impl Op {
    /// The jump/call/fork target carried by this instruction, if any.
    fn target(&self) -> Option<usize> {
        match self {
            Op::Fork(t)
            | Op::ForkOpt(t)
            | Op::Jump(t)
            | Op::JumpIfNot(t)
            | Op::Call(t)
            | Op::PushPc(t) => Some(*t),
            _ => None,
        }
    }
}

/// A byte span in the original query text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Debug metadata for one instruction: the name of the function whose
/// body contains it and the span of the originating query fragment.
///
/// Consumed only by the disassembly listing; execution never reads it.
#[derive(Debug, Clone, Default)]
pub struct CodeInfo {
    pub name: String,
    pub span: Span,
}

impl CodeInfo {
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

/// A compiled program: the instruction sequence indexed by PC, plus an
/// optional parallel sequence of [`CodeInfo`] records.
///
/// Programs are read-only after construction and may be shared across
/// concurrent executions behind an `Arc`; each execution owns its own
/// [`crate::Env`].
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub codes: Vec<Op>,
    /// Parallel to `codes` when present; may be empty when the compiler
    /// did not emit debug info.
    pub infos: Vec<CodeInfo>,
}

impl Program {
    pub fn new(codes: Vec<Op>) -> Self {
        Self {
            codes,
            infos: Vec::new(),
        }
    }

    pub fn with_infos(codes: Vec<Op>, infos: Vec<CodeInfo>) -> Self {
        Self { codes, infos }
    }

    /// Check the well-formedness invariant: every jump, call, and fork
    /// target is a valid PC.
    pub fn validate(&self) -> Result<()> {
        for (pc, op) in self.codes.iter().enumerate() {
            if let Some(target) = op.target()
                && target >= self.codes.len()
            {
                return Err(Error::InvalidTarget { pc, target });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    /// A disassembly listing, one instruction per line, annotated with
    /// the function names from the code-info records when present.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, op) in self.codes.iter().enumerate() {
            write!(f, "{:04}\t{:?}", pc, op)?;
            if let Some(info) = self.infos.get(pc)
                && !info.name.is_empty()
            {
                write!(f, "\t; {}", info.name)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
