//! Best-effort size estimation for budget accounting
//!
//! Not an exact heap measurement. Strings count their UTF-8 length, numbers
//! eight bytes, and containers the sum of their parts (object keys included).

use serde_json::Value;

const NUMBER_SIZE: usize = 8;
const BOOL_SIZE: usize = 1;

pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => BOOL_SIZE,
        Value::Number(_) => NUMBER_SIZE,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(estimate_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| key.len() + estimate_size(value))
            .sum(),
    }
}
