use std::sync::Arc;
use tracing::debug;

use super::{Trace, TraceStep, context};
use crate::{Example, GenerativeModel, Pipeline, Prediction};

/// Executes a pipeline on one example and captures its call trace.
///
/// Holds only the model handle; nothing carries over between captures.
#[derive(Clone)]
pub struct TraceRecorder {
    lm: Arc<dyn GenerativeModel>,
}

impl TraceRecorder {
    pub fn new(lm: Arc<dyn GenerativeModel>) -> Self {
        Self { lm }
    }

    /// Returns `None` when the run fails or produces incomplete output.
    pub async fn capture(&self, pipeline: &Pipeline, example: &Example) -> Option<Trace> {
        let (result, steps) = context::scope(pipeline.run(self.lm.as_ref(), example)).await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                debug!(pipeline = pipeline.name(), error = %err, "trace capture failed");
                return None;
            }
        };

        if let Some(problem) = incomplete(pipeline, &steps, &output) {
            debug!(pipeline = pipeline.name(), %problem, "trace capture incomplete");
            return None;
        }

        Some(Trace { steps, output })
    }
}

fn incomplete(pipeline: &Pipeline, steps: &[TraceStep], output: &Prediction) -> Option<String> {
    if output.data.is_empty() {
        return Some("pipeline produced no output".to_string());
    }
    for step in steps {
        let Some(predictor) = pipeline.predictor(step.predictor_position) else {
            return Some(format!("unknown predictor position {}", step.predictor_position));
        };
        for field in predictor.signature().output_fields().filter(|f| !f.optional) {
            if step.outputs.get(&field.name).is_none_or(|v| v.is_null()) {
                return Some(format!(
                    "predictor {} did not produce `{}`",
                    step.predictor_position, field.name
                ));
            }
        }
    }
    None
}
