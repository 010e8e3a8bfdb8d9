//! Array indexing and slicing.

use crate::value::Value;

/// Index an array. Out-of-range and negative indices produce `null`.
pub(crate) fn index(items: &[Value], i: i64) -> Value {
    if i < 0 || i as usize >= items.len() {
        return Value::Null;
    }
    items[i as usize].clone()
}

/// Slice an array. Negative bounds count from the end; bounds are clamped
/// to the array, and an empty range yields an empty array.
pub(crate) fn slice(items: &[Value], start: Option<i64>, end: Option<i64>) -> Value {
    let len = items.len() as i64;
    let resolve = |i: i64| -> usize {
        if i < 0 {
            (len + i).max(0) as usize
        } else {
            i.min(len) as usize
        }
    };
    let start = start.map_or(0, resolve);
    let end = end.map_or(items.len(), resolve);
    if start >= end {
        return Value::Array(Vec::new());
    }
    Value::Array(items[start..end].to_vec())
}
