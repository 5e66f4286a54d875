use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Example;

/// Where a demonstration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoOrigin {
    /// Copied straight from a training example.
    Labeled,
    /// Harvested from a successful teacher trace.
    Bootstrapped,
}

/// One input/output pair attached to a predictor as a few-shot example.
///
/// Fields are private: a demonstration does not change once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    inputs: IndexMap<String, Value>,
    outputs: IndexMap<String, Value>,
    origin: DemoOrigin,
}

impl Demonstration {
    pub fn labeled(example: &Example) -> Self {
        Self {
            inputs: example.inputs(),
            outputs: example.labels(),
            origin: DemoOrigin::Labeled,
        }
    }

    pub fn bootstrapped(inputs: IndexMap<String, Value>, outputs: IndexMap<String, Value>) -> Self {
        Self {
            inputs,
            outputs,
            origin: DemoOrigin::Bootstrapped,
        }
    }

    pub fn inputs(&self) -> &IndexMap<String, Value> {
        &self.inputs
    }

    pub fn outputs(&self) -> &IndexMap<String, Value> {
        &self.outputs
    }

    pub fn origin(&self) -> DemoOrigin {
        self.origin
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.origin == DemoOrigin::Bootstrapped
    }

    /// True when this demonstration was built from exactly these inputs.
    pub fn has_inputs(&self, inputs: &IndexMap<String, Value>) -> bool {
        &self.inputs == inputs
    }
}
