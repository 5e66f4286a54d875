pub mod demonstration;
pub mod example;
pub mod prediction;

pub use demonstration::*;
pub use example::*;
pub use prediction::*;

use serde_json::Value;

/// Renders a field value the way prompts and comparisons want it: strings
/// without their JSON quotes, everything else as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
