use async_trait::async_trait;
use bon::Builder;
use futures::stream::{self, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{LabeledFewShot, Optimizer, seeded_order};
use crate::trace::TraceRecorder;
use crate::{
    CompileResult, DemoOrigin, Demonstration, Example, GenerativeModel, Metric, Pipeline,
};

/// Harvests demonstrations for a student pipeline from successful runs of a
/// teacher pipeline.
///
/// Every predictor call in an accepted teacher trace becomes a
/// `bootstrapped` demonstration for the student predictor at the same
/// position. Remaining room is filled with `labeled` demonstrations taken
/// from trainset examples no trace was accepted for.
///
/// ```ignore
/// let optimizer = BootstrapFewShot::builder()
///     .lm(lm)
///     .metric(Arc::new(ExactMatch::new("answer")))
///     .max_bootstrapped_demos(3)
///     .max_labeled_demos(2)
///     .build();
/// let report = optimizer.bootstrap(&mut student, &trainset).await?;
/// ```
#[derive(Builder)]
pub struct BootstrapFewShot {
    /// Model the teacher runs on.
    pub lm: Arc<dyn GenerativeModel>,

    /// Decides which teacher traces are good enough to keep.
    pub metric: Arc<dyn Metric>,

    /// Minimum metric value for acceptance. Without one, a boolean must pass
    /// and a number must be positive.
    pub metric_threshold: Option<f32>,

    /// Reference pipeline to trace. Defaults to a copy of the student.
    pub teacher: Option<Pipeline>,

    #[builder(default = 4)]
    pub max_bootstrapped_demos: usize,

    #[builder(default = 16)]
    pub max_labeled_demos: usize,

    /// Passes over the still-unused examples. Later rounds raise the
    /// teacher's temperature slightly.
    #[builder(default = 1)]
    pub max_rounds: usize,

    /// Shuffle the trainset with this seed; `None` keeps the given order.
    pub shuffle_seed: Option<u64>,

    /// Shuffle each predictor's final demonstration list.
    #[builder(default = false)]
    pub shuffle_demos: bool,

    /// Teacher traces captured at once. Results are still consumed in
    /// trainset order.
    #[builder(default = 1)]
    pub max_concurrency: usize,
}

/// What one bootstrap run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    /// Examples run through the teacher.
    pub attempted: usize,
    pub accepted: usize,
    /// Traces the metric scored below the bar.
    pub rejected: usize,
    pub trace_failures: usize,
    pub metric_failures: usize,
    /// Per position.
    pub bootstrapped: Vec<usize>,
    /// Per position.
    pub labeled: Vec<usize>,
}

/// Teacher temperature for a retry round.
fn round_temperature(round: usize) -> f32 {
    0.7 + 0.001 * round as f32
}

fn is_full(harvested: &[Vec<Demonstration>], max_bootstrapped: usize) -> bool {
    harvested.iter().all(|demos| demos.len() >= max_bootstrapped)
}

/// The teacher without the labeled demo built from `example` itself, so a
/// trace never succeeds by copying its own answer.
fn without_own_demo<'a>(teacher: &'a Pipeline, example: &Example) -> Cow<'a, Pipeline> {
    let inputs = example.inputs();
    let is_own = |d: &Demonstration| d.origin() == DemoOrigin::Labeled && d.has_inputs(&inputs);

    if !teacher
        .predictors()
        .iter()
        .any(|p| p.demos().iter().any(is_own))
    {
        return Cow::Borrowed(teacher);
    }

    let mut hidden = teacher.clone();
    for predictor in hidden.predictors_mut() {
        predictor.retain_demos(|d| !is_own(d));
    }
    Cow::Owned(hidden)
}

impl BootstrapFewShot {
    /// Bootstraps demonstrations into `student`.
    ///
    /// Teacher and student must have the same shape; on mismatch the student
    /// is left untouched. Otherwise the student's demonstrations are
    /// replaced in a single assignment once harvesting is done.
    pub async fn bootstrap(
        &self,
        student: &mut Pipeline,
        trainset: &[Example],
    ) -> CompileResult<BootstrapReport> {
        let mut teacher = match &self.teacher {
            Some(teacher) => teacher.clone(),
            None => student.clone(),
        };
        student.ensure_same_shape(&teacher)?;

        if teacher.demo_count() == 0 && self.max_labeled_demos > 0 {
            LabeledFewShot::builder()
                .k(self.max_labeled_demos)
                .build()
                .assign(&mut teacher, trainset);
        }

        let positions = student.len();
        let max_bootstrapped = self.max_bootstrapped_demos;
        let order = seeded_order(trainset, self.shuffle_seed);
        let recorder = TraceRecorder::new(self.lm.clone());

        let mut harvested: Vec<Vec<Demonstration>> = vec![Vec::new(); positions];
        let mut used = vec![false; order.len()];
        let mut report = BootstrapReport::default();

        info!(
            pipeline = student.name(),
            examples = order.len(),
            max_bootstrapped,
            max_labeled = self.max_labeled_demos,
            "bootstrapping demonstrations"
        );

        for round in 0..self.max_rounds.max(1) {
            if is_full(&harvested, max_bootstrapped) {
                break;
            }

            let mut round_teacher = Cow::Borrowed(&teacher);
            if round > 0 {
                let mut warmer = teacher.clone();
                for predictor in warmer.predictors_mut() {
                    predictor.set_temperature(Some(round_temperature(round)));
                }
                round_teacher = Cow::Owned(warmer);
            }

            let pending: Vec<usize> = (0..order.len()).filter(|&idx| !used[idx]).collect();
            debug!(round, pending = pending.len(), "bootstrap round");

            let teacher_ref: &Pipeline = &round_teacher;
            let recorder_ref = &recorder;
            let order_ref = &order;
            let mut captures = stream::iter(pending)
                .map(move |idx| async move {
                    let example = &order_ref[idx];
                    let teacher = without_own_demo(teacher_ref, example);
                    (idx, recorder_ref.capture(&teacher, example).await)
                })
                .buffered(self.max_concurrency.max(1));

            while let Some((idx, trace)) = captures.next().await {
                report.attempted += 1;
                let example = &order[idx];

                let Some(trace) = trace else {
                    report.trace_failures += 1;
                    continue;
                };

                match self.metric.score(example, &trace.output, Some(&trace)).await {
                    Ok(score) if score.passes(self.metric_threshold) => {}
                    Ok(score) => {
                        debug!(example = idx, score = score.value(), "trace rejected");
                        report.rejected += 1;
                        continue;
                    }
                    Err(err) => {
                        warn!(example = idx, error = %err, "metric failed; treating trace as rejected");
                        report.metric_failures += 1;
                        continue;
                    }
                }

                report.accepted += 1;
                used[idx] = true;
                for step in trace.steps {
                    if let Some(demos) = harvested.get_mut(step.predictor_position)
                        && demos.len() < max_bootstrapped
                    {
                        demos.push(Demonstration::bootstrapped(step.inputs, step.outputs));
                    }
                }

                if is_full(&harvested, max_bootstrapped) {
                    // in-flight captures are dropped with the stream
                    break;
                }
            }
        }

        let labeled: Vec<Demonstration> = order
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .take(self.max_labeled_demos)
            .map(|(example, _)| Demonstration::labeled(example))
            .collect();

        let mut rng = StdRng::seed_from_u64(self.shuffle_seed.unwrap_or(0));
        let mut compiled = student.clone();
        for (predictor, bootstrapped) in compiled.predictors_mut().zip(harvested) {
            report.bootstrapped.push(bootstrapped.len());
            report.labeled.push(labeled.len());

            let mut demos = bootstrapped;
            demos.extend(labeled.iter().cloned());
            if self.shuffle_demos {
                demos.shuffle(&mut rng);
            }
            predictor.set_demo_capacity(Some(self.max_bootstrapped_demos + self.max_labeled_demos));
            predictor.set_demos(demos);
        }
        *student = compiled;

        info!(
            accepted = report.accepted,
            attempted = report.attempted,
            trace_failures = report.trace_failures,
            bootstrapped = ?report.bootstrapped,
            labeled = labeled.len(),
            "bootstrap complete"
        );
        Ok(report)
    }
}

#[async_trait]
impl Optimizer for BootstrapFewShot {
    async fn compile(&self, student: &Pipeline, trainset: &[Example]) -> CompileResult<Pipeline> {
        let mut compiled = student.clone();
        self.bootstrap(&mut compiled, trainset).await?;
        Ok(compiled)
    }
}
