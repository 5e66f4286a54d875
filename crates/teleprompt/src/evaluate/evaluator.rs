use bon::Builder;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::Metric;
use crate::{Example, GenerativeModel, Pipeline};

/// Scores a pipeline over a set of examples with a caller-supplied metric.
///
/// Borrows the pipeline immutably, so evaluations of different clones may
/// run at the same time.
#[derive(Builder, Debug, Clone)]
pub struct Evaluator {
    /// Examples in flight at once.
    #[builder(default = 8)]
    pub max_concurrency: usize,

    /// Score given to an example whose run or metric failed.
    #[builder(default = 0.0)]
    pub failure_score: f32,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    /// Mean of `scores`; 0.0 for an empty example set.
    pub score: f32,
    /// One score per example, in example order.
    pub scores: Vec<f32>,
    /// Examples that scored `failure_score` because something failed.
    pub failures: usize,
}

impl EvaluationResult {
    /// True when every example failed.
    pub fn all_failed(&self) -> bool {
        !self.scores.is_empty() && self.failures == self.scores.len()
    }
}

impl Evaluator {
    pub async fn evaluate(
        &self,
        pipeline: &Pipeline,
        lm: &dyn GenerativeModel,
        examples: &[Example],
        metric: &dyn Metric,
    ) -> EvaluationResult {
        let outcomes: Vec<Option<f32>> = stream::iter(0..examples.len())
            .map(|idx| {
                let example = &examples[idx];
                async move {
                    let prediction = match pipeline.run(lm, example).await {
                        Ok(prediction) => prediction,
                        Err(err) => {
                            debug!(pipeline = pipeline.name(), example = idx, error = %err, "run failed");
                            return None;
                        }
                    };
                    match metric.score(example, &prediction, None).await {
                        Ok(score) => Some(score.value()),
                        Err(err) => {
                            warn!(pipeline = pipeline.name(), example = idx, error = %err, "metric failed");
                            None
                        }
                    }
                }
            })
            .buffered(self.max_concurrency.max(1))
            .collect()
            .await;

        let failures = outcomes.iter().filter(|o| o.is_none()).count();
        let scores: Vec<f32> = outcomes
            .into_iter()
            .map(|o| o.unwrap_or(self.failure_score))
            .collect();
        let score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f32>() / scores.len() as f32
        };

        EvaluationResult {
            score,
            scores,
            failures,
        }
    }

    /// Mean score only.
    pub async fn score(
        &self,
        pipeline: &Pipeline,
        lm: &dyn GenerativeModel,
        examples: &[Example],
        metric: &dyn Metric,
    ) -> f32 {
        self.evaluate(pipeline, lm, examples, metric).await.score
    }
}
