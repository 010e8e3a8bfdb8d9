//! The bytecode execution engine.
//!
//! This module executes [`Program`]s. Queries are multi-valued, so the
//! engine does not return a single result: it exposes a lazy [`Iter`]
//! whose every `next()` call runs the dispatch loop until the program
//! yields a value, fails, or exhausts its choice points.
//!
//! Alternative results are explored through *forks*. A fork records a
//! resume PC together with savepoints of the operand and scope stacks;
//! leaving the dispatch loop pops the newest fork, restores both stacks,
//! and re-dispatches the instruction at the fork's PC with the backtrack
//! flag set. Forks are explored LIFO, which yields depth-first
//! left-to-right enumeration; the output order is deterministic and part
//! of the contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bytecode::{Op, Program, ScopedSlot};
use crate::error::{Error, Result};
use crate::stack::{Savepoint, Stack};
use crate::value::Value;

/// An entry of the operand stack or the locals array.
///
/// Compiled function references travel the same channels as data values
/// (they are stored into locals when passed as function arguments) but
/// are never yielded as results.
#[derive(Debug, Clone)]
enum Operand {
    Value(Value),
    Closure(Closure),
}

/// A first-class compiled function reference: the entry PC paired with
/// the scope stack position captured when the reference was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Closure {
    pc: usize,
    scope: isize,
}

/// One activation frame on the scope stack.
#[derive(Debug, Clone, Copy)]
struct ScopeFrame {
    /// Function id; `load`/`store` resolve locals by scanning for it.
    id: usize,
    /// Base offset of this frame's slots in the locals array.
    offset: usize,
    /// PC of the call instruction to resume after `ret`.
    pc: usize,
    /// Scope stack position to restore on return, for callers that
    /// entered through a non-ambient scope index.
    save_scope: isize,
}

/// A saved choice point. The instruction at `pc` determines the
/// backtrack semantics when the fork is resumed.
#[derive(Debug, Clone, Copy)]
struct Fork {
    pc: usize,
    stack: Savepoint,
    scopes: Savepoint,
}

/// The execution environment of one query run.
///
/// Owns all mutable runtime state: the operand stack, the scope stack,
/// the locals array, and the fork list. The compiled program is shared
/// and read-only; create one `Env` per execution.
pub struct Env {
    program: Arc<Program>,
    pc: usize,
    stack: Stack<Operand>,
    scopes: Stack<ScopeFrame>,
    locals: Vec<Operand>,
    /// Allocation cursor into `locals`; advanced by `scope`.
    offset: usize,
    forks: Vec<Fork>,
    /// Whether the next dispatch is a resumption rather than forward
    /// execution.
    backtrack: bool,
}

impl Env {
    pub fn new(program: Arc<Program>) -> Self {
        Self {
            program,
            pc: 0,
            stack: Stack::new(),
            scopes: Stack::new(),
            locals: Vec::new(),
            offset: 0,
            forks: Vec::new(),
            backtrack: false,
        }
    }

    /// Start executing against an input value.
    pub fn execute(mut self, input: Value) -> Iter {
        self.stack.push(Operand::Value(input));
        Iter { env: self }
    }

    /// Run the dispatch loop until the next yield point.
    ///
    /// Returns `Some(Ok(value))` for an output, `Some(Err(error))` when an
    /// error surfaced past every fork handler, and `None` on exhaustion.
    fn next_value(&mut self) -> Option<Result<Value>> {
        let program = Arc::clone(&self.program);
        let codes = &program.codes;
        if codes.is_empty() {
            return None;
        }
        let mut err: Option<Error> = None;
        let mut pc = self.pc;
        // Registers carried between `call`-family instructions and the
        // `scope` at the callee entry. The initial call PC points at the
        // final `ret`, so the top-level frame returns there.
        let mut call_pc = codes.len() - 1;
        let mut scope_index: isize = -1;
        let mut backtrack = self.backtrack;

        loop {
            'execute: while pc < codes.len() {
                match &codes[pc] {
                    Op::Nop => {}
                    Op::Push(v) => self.stack.push(Operand::Value(v.clone())),
                    Op::Pop => {
                        self.stack.pop();
                    }
                    Op::Dup => {
                        let x = self.pop_cell();
                        self.stack.push(x.clone());
                        self.stack.push(x);
                    }
                    Op::Swap => {
                        let x = self.pop_cell();
                        let y = self.pop_cell();
                        self.stack.push(x);
                        self.stack.push(y);
                    }
                    Op::Const(v) => {
                        self.stack.pop();
                        self.stack.push(Operand::Value(v.clone()));
                    }
                    Op::Load(slot) => {
                        let i = self.local_index(*slot);
                        let cell = self
                            .locals
                            .get(i)
                            .cloned()
                            .unwrap_or(Operand::Value(Value::Null));
                        self.stack.push(cell);
                    }
                    Op::Store(slot) => {
                        let i = self.local_index(*slot);
                        if i >= self.locals.len() {
                            self.locals.resize((i + 1) * 2, Operand::Value(Value::Null));
                        }
                        self.locals[i] = self.pop_cell();
                    }
                    Op::Object(n) => {
                        let mut map = BTreeMap::new();
                        let mut bad_key = None;
                        for _ in 0..*n {
                            let v = self.pop_value();
                            let k = self.pop_value();
                            match k {
                                Value::Str(s) => {
                                    map.insert(s, v);
                                }
                                other => {
                                    bad_key = Some(other);
                                    break;
                                }
                            }
                        }
                        if let Some(key) = bad_key {
                            err = Some(Error::ObjectKeyNotString(key));
                            break 'execute;
                        }
                        self.stack.push(Operand::Value(Value::Object(map)));
                    }
                    Op::Append(slot) => {
                        let i = self.local_index(*slot);
                        let v = self.pop_value();
                        match self.locals.get_mut(i) {
                            Some(Operand::Value(Value::Array(items))) => items.push(v),
                            _ => unreachable!("append target is not an array"),
                        }
                    }
                    Op::Fork(target) => {
                        if backtrack {
                            if err.is_some() {
                                break 'execute;
                            }
                            pc = *target;
                            backtrack = false;
                            continue 'execute;
                        }
                        self.push_fork(pc);
                    }
                    Op::ForkOpt(target) => {
                        if backtrack {
                            match err.take() {
                                Some(e) => {
                                    self.stack.push(Operand::Value(Value::Str(e.to_string())));
                                    pc = *target;
                                    backtrack = false;
                                    continue 'execute;
                                }
                                None => break 'execute,
                            }
                        }
                        self.push_fork(pc);
                    }
                    Op::ForkLabel(label) => {
                        if backtrack {
                            if matches!(&err, Some(Error::Break(name)) if name == label) {
                                err = None;
                            }
                            break 'execute;
                        }
                        self.push_fork(pc);
                    }
                    Op::Backtrack => break 'execute,
                    Op::Jump(target) => {
                        pc = *target;
                        continue 'execute;
                    }
                    Op::JumpIfNot(target) => {
                        let v = self.pop_value();
                        if !v.is_truthy() {
                            pc = *target;
                            continue 'execute;
                        }
                    }
                    Op::Call(target) => {
                        call_pc = pc;
                        scope_index = self.scopes.index;
                        pc = *target;
                        continue 'execute;
                    }
                    Op::CallNative(call) => {
                        let input = self.pop_value();
                        let mut args = Vec::with_capacity(call.argc);
                        for _ in 0..call.argc {
                            args.push(self.pop_value());
                        }
                        match (call.func)(input, args) {
                            Ok(v) => self.stack.push(Operand::Value(v)),
                            Err(e) => {
                                err = Some(e);
                                break 'execute;
                            }
                        }
                    }
                    Op::PushPc(target) => {
                        self.stack.push(Operand::Closure(Closure {
                            pc: *target,
                            scope: self.scopes.index,
                        }));
                    }
                    Op::CallPc => {
                        let Operand::Closure(closure) = self.pop_cell() else {
                            unreachable!("callpc expects a function reference on the stack");
                        };
                        call_pc = pc;
                        scope_index = closure.scope;
                        pc = closure.pc;
                        continue 'execute;
                    }
                    Op::Scope { id, locals } => {
                        let saved = if scope_index == self.scopes.index {
                            scope_index
                        } else {
                            // The caller supplied a different scope view
                            // (callpc into a closure): switch to it and
                            // remember where to come back.
                            let savepoint = self.scopes.save();
                            self.scopes.index = scope_index;
                            savepoint.index
                        };
                        self.scopes.push(ScopeFrame {
                            id: *id,
                            offset: self.offset,
                            pc: call_pc,
                            save_scope: saved,
                        });
                        self.offset += *locals;
                    }
                    Op::Ret => {
                        if backtrack || err.is_some() {
                            break 'execute;
                        }
                        let Some(frame) = self.scopes.pop() else {
                            break 'execute;
                        };
                        pc = frame.pc;
                        self.scopes.index = frame.save_scope;
                        if self.scopes.is_empty() {
                            self.pc = pc;
                            self.backtrack = true;
                            return match self.stack.pop() {
                                Some(Operand::Value(v)) => Some(Ok(v)),
                                Some(Operand::Closure(_)) => {
                                    unreachable!("function reference yielded as a result")
                                }
                                None => None,
                            };
                        }
                    }
                    Op::Each => {
                        if err.is_some() {
                            break 'execute;
                        }
                        backtrack = false;
                        match self.pop_value() {
                            Value::Array(items) => {
                                let mut items = items.into_iter();
                                let Some(head) = items.next() else {
                                    break 'execute;
                                };
                                self.iterate(pc, head, items.collect());
                            }
                            Value::Object(map) => {
                                let mut values = map.into_values();
                                let Some(head) = values.next() else {
                                    break 'execute;
                                };
                                self.iterate(pc, head, values.collect());
                            }
                            other => {
                                err = Some(Error::Iterator(other));
                                break 'execute;
                            }
                        }
                    }
                }
                pc += 1;
            }

            // Left the dispatch loop: resume the newest fork, or finish.
            if let Some(fork) = self.forks.pop() {
                self.stack.restore(fork.stack);
                self.scopes.restore(fork.scopes);
                pc = fork.pc;
                backtrack = true;
                continue;
            }
            self.pc = pc;
            self.backtrack = true;
            return err.map(Err);
        }
    }

    /// Push the head of a collection, forking over the tail so a later
    /// backtrack re-enters `each` with the remainder.
    fn iterate(&mut self, pc: usize, head: Value, tail: Vec<Value>) {
        if !tail.is_empty() {
            // The fork's savepoint must capture the tail on top of the
            // stack; the forward path then discards it again.
            self.stack.push(Operand::Value(Value::Array(tail)));
            self.push_fork(pc);
            self.stack.pop();
        }
        self.stack.push(Operand::Value(head));
    }

    fn push_fork(&mut self, pc: usize) {
        let fork = Fork {
            pc,
            stack: self.stack.save(),
            scopes: self.scopes.save(),
        };
        self.forks.push(fork);
    }

    fn pop_cell(&mut self) -> Operand {
        self.stack.pop().unwrap_or(Operand::Value(Value::Null))
    }

    fn pop_value(&mut self) -> Value {
        match self.pop_cell() {
            Operand::Value(v) => v,
            Operand::Closure(_) => unreachable!("expected a value on the operand stack"),
        }
    }

    /// Absolute locals index of a scoped slot. The compiler guarantees a
    /// live frame with the matching id at every reachable load/store.
    fn local_index(&self, slot: ScopedSlot) -> usize {
        let frame = self
            .scopes
            .find(|frame| frame.id == slot.scope)
            .expect("local refers to a scope that is not live");
        frame.offset + slot.slot
    }
}

/// Lazy iterator over the outputs of one execution.
///
/// `Some(Ok(value))` is the next output. `Some(Err(error))` surfaces a
/// failure that no fork handler caught; iteration may continue, though
/// callers typically stop. `None` means the sequence is exhausted.
pub struct Iter {
    env: Env,
}

impl Iterator for Iter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.env.next_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::NativeCall;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn value(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    fn program(codes: Vec<Op>) -> Arc<Program> {
        let program = Program::new(codes);
        program.validate().unwrap();
        Arc::new(program)
    }

    fn outputs(program: &Arc<Program>, input: Value) -> Vec<Result<Value>> {
        Env::new(Arc::clone(program)).execute(input).collect()
    }

    fn ok_outputs(program: &Arc<Program>, input: Value) -> Vec<Value> {
        outputs(program, input)
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    /// Native for `.name`; the VM itself has no indexing opcode.
    fn field(name: &str) -> Op {
        let name = name.to_string();
        Op::CallNative(NativeCall::new("field", 0, move |input, _args| {
            match input {
                Value::Object(map) => Ok(map.get(&name).cloned().unwrap_or(Value::Null)),
                other => Err(Error::ExpectedObject(other)),
            }
        }))
    }

    fn failing(message: &str) -> Op {
        let message = message.to_string();
        Op::CallNative(NativeCall::new("failing", 0, move |_input, _args| {
            Err(Error::Native(message.clone()))
        }))
    }

    fn breaking(label: &str) -> Op {
        let label = label.to_string();
        Op::CallNative(NativeCall::new("breaking", 0, move |_input, _args| {
            Err(Error::Break(label.clone()))
        }))
    }

    #[test]
    fn test_identity() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Ret]);
        assert_eq!(
            ok_outputs(&p, value(json!({"a": 1}))),
            vec![value(json!({"a": 1}))]
        );
    }

    #[test]
    fn test_empty_program_is_exhausted() {
        let p = Arc::new(Program::new(Vec::new()));
        assert!(outputs(&p, Value::Null).is_empty());
    }

    #[test]
    fn test_determinism_across_environments() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Each, Op::Ret]);
        let input = value(json!({"b": 2, "a": 1, "c": 3}));
        assert_eq!(outputs(&p, input.clone()), outputs(&p, input));
    }

    #[test]
    fn test_stack_hygiene_after_exhaustion() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Ret]);
        let mut iter = Env::new(Arc::clone(&p)).execute(value(json!(1)));
        let collected: Vec<_> = iter.by_ref().collect();
        assert_eq!(collected.len(), 1);
        assert!(iter.next().is_none());
        assert!(iter.env.forks.is_empty());
        assert!(iter.env.scopes.is_empty());
    }

    #[test]
    fn test_each_yields_array_elements_in_order() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Each, Op::Ret]);
        assert_eq!(
            ok_outputs(&p, value(json!([10, 20, 30]))),
            vec![value(json!(10)), value(json!(20)), value(json!(30))]
        );
    }

    #[test]
    fn test_each_yields_object_values_once_each() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Each, Op::Ret]);
        assert_eq!(
            ok_outputs(&p, value(json!({"b": 2, "a": 1}))),
            vec![value(json!(1)), value(json!(2))]
        );
    }

    #[test]
    fn test_each_on_empty_collection_yields_nothing() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Each, Op::Ret]);
        assert!(outputs(&p, value(json!([]))).is_empty());
        assert!(outputs(&p, value(json!({}))).is_empty());
    }

    #[test]
    fn test_each_on_scalar_reports_iterator_error() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Each, Op::Ret]);
        let mut iter = Env::new(Arc::clone(&p)).execute(value(json!(5)));
        assert_eq!(iter.next(), Some(Err(Error::Iterator(value(json!(5))))));
    }

    #[test]
    fn test_fork_enumerates_branches_left_to_right() {
        // `.a, .b`
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Fork(4),
            field("a"),
            Op::Jump(5),
            field("b"),
            Op::Ret,
        ]);
        assert_eq!(
            ok_outputs(&p, value(json!({"a": 1, "b": 2}))),
            vec![value(json!(1)), value(json!(2))]
        );
    }

    #[test]
    fn test_backtrack_abandons_current_branch() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Fork(3),
            Op::Backtrack,
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, value(json!(7))), vec![value(json!(7))]);
    }

    #[test]
    fn test_fork_restores_operand_stack_for_the_next_branch() {
        // The first branch consumes the input; the second still sees it.
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Fork(6),
            Op::Pop,
            Op::Push(value(json!("garbage"))),
            Op::Const(value(json!("first"))),
            Op::Jump(6),
            Op::Ret,
        ]);
        assert_eq!(
            ok_outputs(&p, value(json!(41))),
            vec![value(json!("first")), value(json!(41))]
        );
    }

    #[test]
    fn test_error_propagates_past_plain_fork() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Fork(3),
            failing("boom"),
            Op::Ret,
        ]);
        let mut iter = Env::new(Arc::clone(&p)).execute(Value::Null);
        assert_eq!(iter.next(), Some(Err(Error::Native("boom".to_string()))));
    }

    #[test]
    fn test_forkopt_catches_error_and_pushes_its_message() {
        // `try f catch .`
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::ForkOpt(4),
            failing("boom"),
            Op::Jump(6),
            Op::Swap,
            Op::Pop,
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, Value::Null), vec![value(json!("boom"))]);
    }

    #[test]
    fn test_forkopt_without_error_propagates_exhaustion() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::ForkOpt(4),
            Op::Nop,
            Op::Jump(6),
            Op::Swap,
            Op::Pop,
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, value(json!(5))), vec![value(json!(5))]);
    }

    #[test]
    fn test_forklabel_swallows_matching_break() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::ForkLabel("out".to_string()),
            Op::Fork(5),
            Op::Nop,
            Op::Jump(6),
            breaking("out"),
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, value(json!(1))), vec![value(json!(1))]);
    }

    #[test]
    fn test_forklabel_propagates_mismatched_break() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::ForkLabel("out".to_string()),
            Op::Fork(5),
            Op::Nop,
            Op::Jump(6),
            breaking("other"),
            Op::Ret,
        ]);
        let results = outputs(&p, value(json!(1)));
        assert_eq!(
            results,
            vec![
                Ok(value(json!(1))),
                Err(Error::Break("other".to_string())),
            ]
        );
    }

    #[test]
    fn test_jumpifnot_takes_the_false_branch_on_null_and_false() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Dup,
            Op::JumpIfNot(5),
            Op::Const(value(json!("yes"))),
            Op::Jump(6),
            Op::Const(value(json!("no"))),
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, value(json!(true))), vec![value(json!("yes"))]);
        assert_eq!(ok_outputs(&p, value(json!(0))), vec![value(json!("yes"))]);
        assert_eq!(ok_outputs(&p, value(json!(false))), vec![value(json!("no"))]);
        assert_eq!(ok_outputs(&p, Value::Null), vec![value(json!("no"))]);
    }

    #[test]
    fn test_object_builds_from_key_value_pairs() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Pop,
            Op::Push(value(json!("k"))),
            Op::Push(value(json!(1))),
            Op::Push(value(json!("j"))),
            Op::Push(value(json!(2))),
            Op::Object(2),
            Op::Ret,
        ]);
        assert_eq!(
            ok_outputs(&p, Value::Null),
            vec![value(json!({"k": 1, "j": 2}))]
        );
    }

    #[test]
    fn test_object_rejects_non_string_key() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Pop,
            Op::Push(value(json!(5))),
            Op::Push(value(json!(1))),
            Op::Object(1),
            Op::Ret,
        ]);
        let mut iter = Env::new(Arc::clone(&p)).execute(Value::Null);
        assert_eq!(
            iter.next(),
            Some(Err(Error::ObjectKeyNotString(value(json!(5)))))
        );
    }

    #[test]
    fn test_store_grows_locals_and_load_reads_back() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 3 },
            Op::Push(value(json!(1))),
            Op::Store(ScopedSlot::new(0, 2)),
            Op::Load(ScopedSlot::new(0, 2)),
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, Value::Null), vec![value(json!(1))]);
    }

    #[test]
    fn test_array_construction_with_append_survives_backtracking() {
        // `[.[]]`
        let p = program(vec![
            Op::Scope { id: 0, locals: 1 },
            Op::Push(value(json!([]))),
            Op::Store(ScopedSlot::new(0, 0)),
            Op::Fork(7),
            Op::Each,
            Op::Append(ScopedSlot::new(0, 0)),
            Op::Backtrack,
            Op::Pop,
            Op::Load(ScopedSlot::new(0, 0)),
            Op::Ret,
        ]);
        assert_eq!(
            ok_outputs(&p, value(json!([1, 2, 3]))),
            vec![value(json!([1, 2, 3]))]
        );
        assert_eq!(
            ok_outputs(&p, value(json!({"a": 1, "b": 2}))),
            vec![value(json!([1, 2]))]
        );
        assert_eq!(ok_outputs(&p, value(json!([]))), vec![value(json!([]))]);
    }

    #[test]
    fn test_call_enters_function_and_ret_resumes_after_it() {
        let p = program(vec![
            Op::Scope { id: 0, locals: 0 },
            Op::Call(3),
            Op::Ret,
            Op::Scope { id: 1, locals: 0 },
            Op::Const(value(json!(7))),
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, Value::Null), vec![value(json!(7))]);
    }

    #[test]
    fn test_function_reference_calls_back_into_defining_scope() {
        // A reference captured at the top level is invoked from inside
        // another function; the callee resolves a top-level local through
        // its recorded scope index, skipping the intervening frame.
        let p = program(vec![
            Op::Scope { id: 0, locals: 1 },
            Op::Push(value(json!(10))),
            Op::Store(ScopedSlot::new(0, 0)),
            Op::PushPc(9),
            Op::Call(6),
            Op::Ret,
            Op::Scope { id: 1, locals: 0 },
            Op::CallPc,
            Op::Ret,
            Op::Scope { id: 2, locals: 0 },
            Op::Load(ScopedSlot::new(0, 0)),
            Op::Ret,
        ]);
        assert_eq!(ok_outputs(&p, Value::Null), vec![value(json!(10))]);
    }

    #[test]
    fn test_each_forks_are_drained_before_exhaustion() {
        let p = program(vec![Op::Scope { id: 0, locals: 0 }, Op::Each, Op::Ret]);
        let mut iter = Env::new(Arc::clone(&p)).execute(value(json!([1, 2])));
        assert_eq!(iter.next(), Some(Ok(value(json!(1)))));
        assert_eq!(iter.env.forks.len(), 1);
        assert_eq!(iter.next(), Some(Ok(value(json!(2)))));
        assert!(iter.next().is_none());
        assert!(iter.env.forks.is_empty());
    }
}
