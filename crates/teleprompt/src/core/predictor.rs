use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

use crate::adapter::ChatAdapter;
use crate::{
    CompileError, CompileResult, Demonstration, GenerativeModel, LmConfig, Prediction, Signature,
};

/// A single prompt-driven step: a signature plus the mutable state the
/// optimizers tune (instruction, output prefixes, demonstrations).
///
/// Cloning a predictor copies its mutable state and shares the immutable
/// signature.
#[derive(Debug, Clone)]
pub struct Predictor {
    signature: Arc<Signature>,
    instruction: String,
    prefixes: IndexMap<String, String>,
    demos: Vec<Demonstration>,
    demo_capacity: Option<usize>,
    config: LmConfig,
}

impl Predictor {
    pub fn new(signature: Signature) -> Self {
        let instruction = signature.instruction();
        let prefixes = signature
            .output_fields()
            .map(|f| (f.name.clone(), f.prefix.clone().unwrap_or_default()))
            .collect();

        Self {
            signature: Arc::new(signature),
            instruction,
            prefixes,
            demos: Vec::new(),
            demo_capacity: None,
            config: LmConfig::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn set_instruction(&mut self, instruction: impl Into<String>) {
        self.instruction = instruction.into();
    }

    pub fn prefix(&self, field: &str) -> Option<&str> {
        self.prefixes.get(field).map(String::as_str)
    }

    pub fn prefixes(&self) -> &IndexMap<String, String> {
        &self.prefixes
    }

    /// Prefix of the first output field, the one instruction search tunes.
    pub fn first_prefix(&self) -> &str {
        self.prefix(&self.signature.first_output().name)
            .unwrap_or_default()
    }

    pub fn set_prefix(&mut self, field: &str, prefix: impl Into<String>) -> CompileResult<()> {
        if !self.signature.is_output(field) {
            return Err(CompileError::UnknownField {
                signature: self.signature.name().to_string(),
                field: field.to_string(),
            });
        }
        self.prefixes.insert(field.to_string(), prefix.into());
        Ok(())
    }

    pub fn demos(&self) -> &[Demonstration] {
        &self.demos
    }

    pub fn demo_capacity(&self) -> Option<usize> {
        self.demo_capacity
    }

    /// Caps the demonstration list. Existing demos beyond the cap are dropped
    /// from the end.
    pub fn set_demo_capacity(&mut self, capacity: Option<usize>) {
        self.demo_capacity = capacity;
        if let Some(cap) = capacity {
            self.demos.truncate(cap);
        }
    }

    /// Appends a demonstration unless the list is already at capacity.
    /// Returns whether it was added.
    pub fn push_demo(&mut self, demo: Demonstration) -> bool {
        if self.demo_capacity.is_some_and(|cap| self.demos.len() >= cap) {
            return false;
        }
        self.demos.push(demo);
        true
    }

    pub fn set_demos(&mut self, demos: Vec<Demonstration>) {
        self.demos = demos;
        if let Some(cap) = self.demo_capacity {
            self.demos.truncate(cap);
        }
    }

    pub fn clear_demos(&mut self) {
        self.demos.clear();
    }

    pub fn retain_demos(&mut self, keep: impl FnMut(&Demonstration) -> bool) {
        self.demos.retain(keep);
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    pub fn set_temperature(&mut self, temperature: Option<f32>) {
        self.config.temperature = temperature;
    }

    /// Picks this predictor's input fields out of `available`.
    pub fn select_inputs(&self, available: &IndexMap<String, Value>) -> Result<IndexMap<String, Value>> {
        self.signature
            .input_fields()
            .map(|field| {
                available
                    .get(&field.name)
                    .map(|v| (field.name.clone(), v.clone()))
                    .ok_or_else(|| {
                        anyhow!(
                            "missing input field `{}` for signature `{}`",
                            field.name,
                            self.signature.name()
                        )
                    })
            })
            .collect()
    }

    /// Runs one model call mapping `inputs` to this signature's outputs.
    ///
    /// Fails when an input field is missing, when the model call fails, or
    /// when the response lacks an output field.
    pub async fn forward(
        &self,
        lm: &dyn GenerativeModel,
        inputs: &IndexMap<String, Value>,
    ) -> Result<Prediction> {
        let inputs = self.select_inputs(inputs)?;
        let request = ChatAdapter.format(self, &inputs);

        let response = lm
            .invoke(request)
            .await
            .with_context(|| format!("model call failed for `{}`", self.signature.name()))?;

        let outputs = ChatAdapter.parse(self, &response.content)?;
        Ok(Prediction::new(outputs, response.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Example, MockLm};

    fn qa() -> Signature {
        Signature::builder("QA")
            .instruction("Answer the question.")
            .input("question", "")
            .output("answer", "")
            .build()
            .unwrap()
    }

    #[test]
    fn test_capacity_bounds_demos() {
        let mut predictor = Predictor::new(qa());
        predictor.set_demo_capacity(Some(2));
        let ex = crate::example! { "question": "input" => "q", "answer": "output" => "a" };

        assert!(predictor.push_demo(Demonstration::labeled(&ex)));
        assert!(predictor.push_demo(Demonstration::labeled(&ex)));
        assert!(!predictor.push_demo(Demonstration::labeled(&ex)));
        assert_eq!(predictor.demos().len(), 2);
    }

    #[test]
    fn test_set_prefix_rejects_inputs() {
        let mut predictor = Predictor::new(qa());
        assert_eq!(predictor.first_prefix(), "Answer:");
        assert!(predictor.set_prefix("question", "Q:").is_err());
        predictor.set_prefix("answer", "Final Answer:").unwrap();
        assert_eq!(predictor.first_prefix(), "Final Answer:");
    }

    #[test]
    fn test_clone_is_independent() {
        let original = Predictor::new(qa());
        let mut copy = original.clone();
        copy.set_instruction("Something else.");
        assert_eq!(original.instruction(), "Answer the question.");
        assert_eq!(copy.instruction(), "Something else.");
    }

    #[tokio::test]
    async fn test_forward_parses_outputs() {
        let lm = MockLm::new("qa").with_fields(|_| Ok(crate::fields! { "answer" => "4" }));
        let predictor = Predictor::new(qa());
        let ex: Example = crate::example! { "question": "input" => "What is 2+2?" };

        let prediction = predictor.forward(&lm, &ex.inputs()).await.unwrap();
        assert_eq!(prediction.get_str("answer"), Some("4"));
    }

    #[tokio::test]
    async fn test_forward_missing_input() {
        let lm = MockLm::new("qa").with_fields(|_| Ok(crate::fields! { "answer" => "4" }));
        let predictor = Predictor::new(qa());

        let err = predictor.forward(&lm, &IndexMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("missing input field `question`"));
        assert_eq!(lm.calls(), 0);
    }
}
