use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LmUsage;

/// Output of a predictor or of a whole pipeline run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub data: IndexMap<String, Value>,
    #[serde(default)]
    pub lm_usage: LmUsage,
}

impl Prediction {
    pub fn new(data: IndexMap<String, Value>, lm_usage: LmUsage) -> Self {
        Self { data, lm_usage }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.get(key).is_some_and(|v| !v.is_null())
    }
}
