//! Execution traces: which predictor ran, on what, producing what.

pub mod context;
pub mod recorder;

pub use context::*;
pub use recorder::*;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Prediction;

/// One predictor invocation during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub predictor_position: usize,
    /// Exactly the fields the predictor received.
    pub inputs: IndexMap<String, Value>,
    pub outputs: IndexMap<String, Value>,
}

impl TraceStep {
    pub fn new(
        predictor_position: usize,
        inputs: IndexMap<String, Value>,
        outputs: IndexMap<String, Value>,
    ) -> Self {
        Self {
            predictor_position,
            inputs,
            outputs,
        }
    }
}

/// The ordered calls of one pipeline execution, plus its final output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
    pub output: Prediction,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps_for(&self, position: usize) -> impl Iterator<Item = &TraceStep> {
        self.steps
            .iter()
            .filter(move |s| s.predictor_position == position)
    }
}
