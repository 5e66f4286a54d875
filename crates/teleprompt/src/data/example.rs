use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A labeled training example.
///
/// `input_keys` name the fields a pipeline receives; `output_keys` name the
/// labels. Keys listed in neither are carried along but never rendered.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub data: IndexMap<String, Value>,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
}

impl Example {
    pub fn new(
        data: IndexMap<String, Value>,
        input_keys: Vec<String>,
        output_keys: Vec<String>,
    ) -> Self {
        Self {
            data,
            input_keys,
            output_keys,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Marks `keys` as inputs; every other key becomes a label.
    pub fn with_inputs(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| k.to_string()).collect();
        self.output_keys = self
            .data
            .keys()
            .filter(|k| !self.input_keys.contains(*k))
            .cloned()
            .collect();
        self
    }

    /// The input fields, in input-key order. Missing keys are skipped.
    pub fn inputs(&self) -> IndexMap<String, Value> {
        self.input_keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// The label fields. When no output keys were declared, every non-input
    /// key counts as a label.
    pub fn labels(&self) -> IndexMap<String, Value> {
        if self.output_keys.is_empty() {
            return self
                .data
                .iter()
                .filter(|(k, _)| !self.input_keys.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        self.output_keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

/// Builds an [`Example`] from `"key": "input" | "output" => value` entries.
///
/// ```
/// use teleprompt::example;
///
/// let ex = example! {
///     "question": "input" => "What is 2+2?",
///     "answer": "output" => "4",
/// };
/// assert_eq!(ex.input_keys, vec!["question".to_string()]);
/// ```
#[macro_export]
macro_rules! example {
    ($($key:literal : $role:literal => $value:expr),* $(,)?) => {{
        let mut data = $crate::IndexMap::new();
        let mut input_keys: Vec<String> = Vec::new();
        let mut output_keys: Vec<String> = Vec::new();
        $(
            data.insert($key.to_string(), $crate::Value::from($value));
            if $role == "input" {
                input_keys.push($key.to_string());
            } else {
                output_keys.push($key.to_string());
            }
        )*
        $crate::Example::new(data, input_keys, output_keys)
    }};
}

/// `IndexMap` literal with string keys and JSON values.
#[macro_export]
macro_rules! fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map: $crate::IndexMap<String, $crate::Value> = $crate::IndexMap::new();
        $(
            map.insert($key.to_string(), $crate::Value::from($value));
        )*
        map
    }};
}
