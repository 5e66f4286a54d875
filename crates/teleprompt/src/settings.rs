//! File-backed optimizer settings.
//!
//! ```no_run
//! use teleprompt::load_settings;
//!
//! let settings = load_settings("teleprompt.toml").unwrap();
//! println!("breadth: {}", settings.copro.breadth);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::{
    BootstrapFewShot, COPRO, CompileError, CompileResult, Evaluator, GenerativeModel, Metric,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileSettings {
    #[serde(default)]
    pub bootstrap: BootstrapSettings,

    #[serde(default)]
    pub copro: CoproSettings,

    #[serde(default)]
    pub evaluation: EvaluationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSettings {
    #[serde(default = "default_max_bootstrapped")]
    pub max_bootstrapped_demos: usize,

    #[serde(default = "default_max_labeled")]
    pub max_labeled_demos: usize,

    #[serde(default = "default_one")]
    pub max_rounds: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_threshold: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,

    #[serde(default)]
    pub shuffle_demos: bool,

    #[serde(default = "default_one")]
    pub max_concurrency: usize,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            max_bootstrapped_demos: 4,
            max_labeled_demos: 16,
            max_rounds: 1,
            metric_threshold: None,
            shuffle_seed: None,
            shuffle_demos: false,
            max_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoproSettings {
    #[serde(default = "default_breadth")]
    pub breadth: usize,

    #[serde(default = "default_depth")]
    pub depth: usize,

    #[serde(default = "default_init_temperature")]
    pub init_temperature: f32,

    #[serde(default)]
    pub track_stats: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_subset: Option<usize>,

    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_retries")]
    pub retries_per_slot: usize,

    #[serde(default = "default_consecutive_failures")]
    pub max_consecutive_failures: usize,
}

impl Default for CoproSettings {
    fn default() -> Self {
        Self {
            breadth: 10,
            depth: 3,
            init_temperature: 1.4,
            track_stats: false,
            eval_subset: None,
            max_concurrency: 8,
            retries_per_slot: 2,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationSettings {
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub failure_score: f32,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            failure_score: 0.0,
        }
    }
}

fn default_max_bootstrapped() -> usize {
    4
}

fn default_max_labeled() -> usize {
    16
}

fn default_one() -> usize {
    1
}

fn default_breadth() -> usize {
    10
}

fn default_depth() -> usize {
    3
}

fn default_init_temperature() -> f32 {
    1.4
}

fn default_concurrency() -> usize {
    8
}

fn default_retries() -> usize {
    2
}

fn default_consecutive_failures() -> usize {
    3
}

impl CompileSettings {
    pub fn validate(&self) -> CompileResult<()> {
        let invalid = |msg: &str| Err(CompileError::InvalidConfig(msg.to_string()));
        if self.copro.breadth == 0 {
            return invalid("copro.breadth must be at least 1");
        }
        if self.bootstrap.max_concurrency == 0 || self.copro.max_concurrency == 0 {
            return invalid("maxConcurrency must be at least 1");
        }
        if self.evaluation.max_concurrency == 0 {
            return invalid("evaluation.maxConcurrency must be at least 1");
        }
        if !self.copro.init_temperature.is_finite() || self.copro.init_temperature < 0.0 {
            return invalid("copro.initTemperature must be a non-negative number");
        }
        Ok(())
    }
}

/// Reads settings from a `.json` or `.toml` file and validates them.
pub fn load_settings(path: impl AsRef<Path>) -> CompileResult<CompileSettings> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;

    let settings: CompileSettings = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)?,
        Some("toml") => toml::from_str(&text)?,
        other => {
            return Err(CompileError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            ));
        }
    };
    settings.validate()?;
    Ok(settings)
}

impl BootstrapFewShot {
    pub fn from_settings(
        settings: &BootstrapSettings,
        lm: Arc<dyn GenerativeModel>,
        metric: Arc<dyn Metric>,
    ) -> Self {
        BootstrapFewShot::builder()
            .lm(lm)
            .metric(metric)
            .maybe_metric_threshold(settings.metric_threshold)
            .max_bootstrapped_demos(settings.max_bootstrapped_demos)
            .max_labeled_demos(settings.max_labeled_demos)
            .max_rounds(settings.max_rounds)
            .maybe_shuffle_seed(settings.shuffle_seed)
            .shuffle_demos(settings.shuffle_demos)
            .max_concurrency(settings.max_concurrency)
            .build()
    }
}

impl COPRO {
    /// Candidates are scored with an evaluator built from `evaluation`.
    pub fn from_settings(
        settings: &CoproSettings,
        evaluation: &EvaluationSettings,
        lm: Arc<dyn GenerativeModel>,
        metric: Arc<dyn Metric>,
    ) -> Self {
        COPRO::builder()
            .lm(lm)
            .metric(metric)
            .evaluator(Evaluator::from(evaluation))
            .breadth(settings.breadth)
            .depth(settings.depth)
            .init_temperature(settings.init_temperature)
            .track_stats(settings.track_stats)
            .maybe_eval_subset(settings.eval_subset)
            .max_concurrency(settings.max_concurrency)
            .retries_per_slot(settings.retries_per_slot)
            .max_consecutive_failures(settings.max_consecutive_failures)
            .build()
    }
}

impl From<&EvaluationSettings> for Evaluator {
    fn from(settings: &EvaluationSettings) -> Self {
        Evaluator::builder()
            .max_concurrency(settings.max_concurrency)
            .failure_score(settings.failure_score)
            .build()
    }
}
