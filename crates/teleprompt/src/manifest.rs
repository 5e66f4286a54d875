//! Persisted pipeline configuration.
//!
//! A [`PipelineState`] captures everything the optimizers tune (per-position
//! instruction, output prefixes and demonstrations) together with the
//! signature shape each position had, so that it can only be loaded back
//! into a structurally identical pipeline.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::pipeline::check_shapes;
use crate::{CompileError, CompileResult, Demonstration, Pipeline, SignatureShape};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorState {
    pub signature: SignatureShape,
    pub instruction: String,
    /// Output field -> prefix.
    pub prefixes: IndexMap<String, String>,
    #[serde(default)]
    pub demos: Vec<Demonstration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Name of the pipeline the state was taken from.
    pub pipeline: String,

    /// SHA-256 over the tuned state; see [`PipelineState::compute_compiled_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_id: Option<String>,

    /// Keyed by predictor position.
    pub predictors: BTreeMap<usize, PredictorState>,

    /// Optimizer that produced this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<String>,

    /// Score the optimizer measured for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,

    /// Unix timestamp when taken.
    #[serde(default)]
    pub created_at: u64,
}

impl PipelineState {
    pub fn with_optimizer(mut self, optimizer: impl Into<String>) -> Self {
        self.optimizer = Some(optimizer.into());
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    /// Deterministic hash of the shapes, instructions, prefixes and demos.
    ///
    /// Metadata (optimizer, score, timestamp) does not take part, so the
    /// same tuned configuration always hashes the same.
    pub fn compute_compiled_id(&self) -> CompileResult<String> {
        #[derive(Serialize)]
        struct HashInput<'a> {
            pipeline: &'a str,
            predictors: &'a BTreeMap<usize, PredictorState>,
        }

        let bytes = serde_json::to_vec(&HashInput {
            pipeline: &self.pipeline,
            predictors: &self.predictors,
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Fills in `compiled_id`.
    pub fn finalize(mut self) -> CompileResult<Self> {
        self.compiled_id = Some(self.compute_compiled_id()?);
        Ok(self)
    }

    pub fn shapes(&self) -> Vec<SignatureShape> {
        self.predictors.values().map(|p| p.signature.clone()).collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> CompileResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> CompileResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Pipeline {
    /// Snapshot of every predictor's tuned state.
    pub fn state(&self) -> PipelineState {
        let predictors = self
            .predictors()
            .iter()
            .enumerate()
            .map(|(position, predictor)| {
                let state = PredictorState {
                    signature: predictor.signature().shape(),
                    instruction: predictor.instruction().to_string(),
                    prefixes: predictor.prefixes().clone(),
                    demos: predictor.demos().to_vec(),
                };
                (position, state)
            })
            .collect();

        PipelineState {
            pipeline: self.name().to_string(),
            compiled_id: None,
            predictors,
            optimizer: None,
            score: None,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Applies a saved state.
    ///
    /// Positions must be `0..n` with the same signature shapes as this
    /// pipeline. Everything is checked before anything is applied: on error
    /// the pipeline is unchanged.
    pub fn load_state(&mut self, state: &PipelineState) -> CompileResult<()> {
        if let Some((index, position)) = state
            .predictors
            .keys()
            .enumerate()
            .find(|(index, position)| index != *position)
        {
            return Err(CompileError::StructuralMismatch(format!(
                "saved state has no predictor at position {index} (next is {position})"
            )));
        }
        check_shapes(&self.shape(), &state.shapes())?;

        let mut updated = self.clone();
        for (predictor, saved) in updated.predictors_mut().zip(state.predictors.values()) {
            predictor.set_instruction(&saved.instruction);
            for (field, prefix) in &saved.prefixes {
                predictor.set_prefix(field, prefix)?;
            }
            predictor.set_demos(saved.demos.clone());
        }
        *self = updated;
        Ok(())
    }
}
