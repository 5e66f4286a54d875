use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::value_text;
use crate::trace::Trace;
use crate::{Example, Prediction};

/// Result of scoring one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricScore {
    Pass(bool),
    Value(f32),
}

impl MetricScore {
    /// Numeric view: a pass is 1.0, a fail 0.0.
    pub fn value(&self) -> f32 {
        match self {
            MetricScore::Pass(true) => 1.0,
            MetricScore::Pass(false) => 0.0,
            MetricScore::Value(v) => *v,
        }
    }

    /// Acceptance test used by bootstrapping.
    ///
    /// With a threshold the numeric value must reach it. Without one a
    /// boolean must be true and a number must be positive.
    pub fn passes(&self, threshold: Option<f32>) -> bool {
        match (threshold, self) {
            (Some(threshold), score) => score.value() >= threshold,
            (None, MetricScore::Pass(pass)) => *pass,
            (None, MetricScore::Value(v)) => *v > 0.0,
        }
    }
}

impl From<bool> for MetricScore {
    fn from(pass: bool) -> Self {
        MetricScore::Pass(pass)
    }
}

impl From<f32> for MetricScore {
    fn from(value: f32) -> Self {
        MetricScore::Value(value)
    }
}

/// Caller-supplied scoring function over (example, prediction) pairs.
///
/// `trace` is present while bootstrapping, so a metric can be stricter about
/// what it admits as a demonstration than about what it scores.
#[async_trait]
pub trait Metric: Send + Sync {
    async fn score(
        &self,
        example: &Example,
        prediction: &Prediction,
        trace: Option<&Trace>,
    ) -> Result<MetricScore>;
}

/// Adapts a synchronous closure into a [`Metric`]. See [`metric_fn`].
pub struct FnMetric<F>(F);

#[async_trait]
impl<F> Metric for FnMetric<F>
where
    F: Fn(&Example, &Prediction, Option<&Trace>) -> Result<MetricScore> + Send + Sync,
{
    async fn score(
        &self,
        example: &Example,
        prediction: &Prediction,
        trace: Option<&Trace>,
    ) -> Result<MetricScore> {
        (self.0)(example, prediction, trace)
    }
}

pub fn metric_fn<F>(f: F) -> FnMetric<F>
where
    F: Fn(&Example, &Prediction, Option<&Trace>) -> Result<MetricScore> + Send + Sync,
{
    FnMetric(f)
}

/// Passes when the predicted field equals the example's label, ignoring
/// case and runs of whitespace.
#[derive(Debug, Clone)]
pub struct ExactMatch {
    field: String,
}

impl ExactMatch {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl Metric for ExactMatch {
    async fn score(
        &self,
        example: &Example,
        prediction: &Prediction,
        _trace: Option<&Trace>,
    ) -> Result<MetricScore> {
        let expected = example
            .get(&self.field)
            .ok_or_else(|| anyhow::anyhow!("example has no label `{}`", self.field))?;
        let Some(actual) = prediction.get(&self.field) else {
            return Ok(MetricScore::Pass(false));
        };
        Ok(MetricScore::Pass(
            normalize(&value_text(expected)) == normalize(&value_text(actual)),
        ))
    }
}
