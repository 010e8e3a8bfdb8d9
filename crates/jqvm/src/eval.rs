//! Tree-walking interpreter for the query subset.
//!
//! Executes [`Query`] nodes directly, without bytecode. The interpreter
//! shares no state with the VM and never observes its forks; the test
//! suite uses it as an independent oracle for the covered fragment.
//!
//! Multi-valued intermediates are modeled by [`Flow`]: each stage hands
//! zero, one, or many values to the next, and sequence-valued
//! intermediates are flattened when they cross a pipe or comma boundary.
//! The observable output order matches the VM's depth-first order.

use crate::error::{Error, Result};
use crate::query::{ArrayIndex, Comma, Expr, Pipe, Query, Suffix, Term, TermKind};
use crate::slice;
use crate::value::Value;

/// Intermediate result of a query stage.
///
/// `Halted` marks an optional suffix that swallowed an error. It
/// propagates through the remaining suffixes unchanged and is dropped
/// wherever a sequence is materialized, so it never becomes a
/// user-visible result.
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    One(Value),
    Many(Vec<Value>),
    Halted,
}

impl Flow {
    fn outputs(self) -> Vec<Value> {
        match self {
            Flow::One(v) => vec![v],
            Flow::Many(vs) => vs,
            Flow::Halted => Vec::new(),
        }
    }
}

/// Evaluate a query and return all of its outputs in order.
///
/// This is the oracle interface: for every query in the covered subset
/// the returned sequence equals what the VM yields for the equivalent
/// bytecode.
pub fn outputs(query: &Query, input: &Value) -> Result<Vec<Value>> {
    Ok(apply_pipe(&query.pipe, Flow::One(input.clone()))?.outputs())
}

/// Evaluate a query to a single value.
///
/// A multi-valued result is materialized into an array. `None` means the
/// query's only output was swallowed by an optional suffix.
pub fn run(query: &Query, input: &Value) -> Result<Option<Value>> {
    match apply_pipe(&query.pipe, Flow::One(input.clone()))? {
        Flow::One(v) => Ok(Some(v)),
        Flow::Many(vs) => Ok(Some(Value::Array(vs))),
        Flow::Halted => Ok(None),
    }
}

fn apply_pipe(pipe: &Pipe, mut v: Flow) -> Result<Flow> {
    for comma in &pipe.commas {
        v = apply_comma(comma, v)?;
    }
    Ok(v)
}

fn apply_comma(comma: &Comma, v: Flow) -> Result<Flow> {
    if comma.terms.is_empty() {
        return Err(Error::UnexpectedQuery);
    }
    match v {
        Flow::Halted => Ok(Flow::Halted),
        // A sequence entering a pipe stage: thread each value through and
        // flatten.
        Flow::Many(vs) => {
            let mut out = Vec::new();
            for e in vs {
                out.extend(apply_comma(comma, Flow::One(e))?.outputs());
            }
            Ok(Flow::Many(out))
        }
        Flow::One(v) => {
            if let [term] = comma.terms.as_slice() {
                return apply_term(term, &v);
            }
            let mut out = Vec::new();
            for term in &comma.terms {
                out.extend(apply_term(term, &v)?.outputs());
            }
            Ok(Flow::Many(out))
        }
    }
}

fn apply_term(term: &Term, v: &Value) -> Result<Flow> {
    let mut result = match &term.kind {
        TermKind::Identity => Ok(Flow::One(v.clone())),
        TermKind::ObjectIndex(name) => apply_object_index(name, v).map(Flow::One),
        TermKind::ArrayIndex(idx) => apply_array_index(idx, v).map(Flow::One),
        TermKind::Expression(expr) => apply_expression(expr, v),
    };
    // Suffixes see the error of the stage before them; that is how the
    // optional suffix catches it.
    for suffix in &term.suffixes {
        result = apply_suffix(suffix, result);
    }
    result
}

fn apply_object_index(name: &str, v: &Value) -> Result<Value> {
    let Value::Object(map) = v else {
        return Err(Error::ExpectedObject(v.clone()));
    };
    Ok(map.get(name).cloned().unwrap_or(Value::Null))
}

fn apply_array_index(idx: &ArrayIndex, v: &Value) -> Result<Value> {
    let Value::Array(items) = v else {
        return Err(Error::ExpectedArray(v.clone()));
    };
    match idx {
        ArrayIndex::Index(i) => Ok(slice::index(items, *i)),
        ArrayIndex::Slice { start, end } => Ok(slice::slice(items, *start, *end)),
    }
}

fn apply_expression(expr: &Expr, v: &Value) -> Result<Flow> {
    match expr {
        Expr::Null => Ok(Flow::One(Value::Null)),
        Expr::True => Ok(Flow::One(Value::Bool(true))),
        Expr::False => Ok(Flow::One(Value::Bool(false))),
        Expr::Array(None) => Ok(Flow::One(Value::Array(Vec::new()))),
        Expr::Array(Some(pipe)) => {
            let flow = apply_pipe(pipe, Flow::One(v.clone()))?;
            Ok(Flow::One(Value::Array(flow.outputs())))
        }
    }
}

fn apply_suffix(suffix: &Suffix, r: Result<Flow>) -> Result<Flow> {
    if let Ok(Flow::Halted) = r {
        return Ok(Flow::Halted);
    }
    match suffix {
        Suffix::Optional => match r {
            Err(Error::ExpectedObject(_))
            | Err(Error::ExpectedArray(_))
            | Err(Error::Iterator(_)) => Ok(Flow::Halted),
            other => other,
        },
        Suffix::ObjectIndex(name) => {
            map_values(r?, |v| apply_object_index(name, v).map(Flow::One))
        }
        Suffix::ArrayIndex(idx) => map_values(r?, |v| apply_array_index(idx, v).map(Flow::One)),
        Suffix::Iterate => map_values(r?, iterate),
    }
}

/// Apply a stage to each value of a flow, flattening the results.
fn map_values(flow: Flow, f: impl Fn(&Value) -> Result<Flow>) -> Result<Flow> {
    match flow {
        Flow::One(v) => f(&v),
        Flow::Many(vs) => {
            let mut out = Vec::new();
            for v in &vs {
                out.extend(f(v)?.outputs());
            }
            Ok(Flow::Many(out))
        }
        Flow::Halted => Ok(Flow::Halted),
    }
}

fn iterate(v: &Value) -> Result<Flow> {
    match v {
        Value::Array(items) => Ok(Flow::Many(items.clone())),
        Value::Object(map) => Ok(Flow::Many(map.values().cloned().collect())),
        other => Err(Error::Iterator(other.clone())),
    }
}
