use anyhow::{Result, anyhow};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::trace::{self, TraceStep};
use crate::{
    CompileError, CompileResult, Example, GenerativeModel, Prediction, Predictor, Signature,
    SignatureShape,
};

/// Handle a [`Flow`] uses to invoke the pipeline's predictors by position.
///
/// Every successful call is recorded as a trace step when a trace scope is
/// active.
pub struct Stages<'a> {
    predictors: &'a [Predictor],
    lm: &'a dyn GenerativeModel,
}

impl Stages<'_> {
    pub fn len(&self) -> usize {
        self.predictors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictors.is_empty()
    }

    pub fn signature(&self, position: usize) -> Option<&Signature> {
        self.predictors.get(position).map(Predictor::signature)
    }

    pub async fn call(&self, position: usize, inputs: &IndexMap<String, Value>) -> Result<Prediction> {
        let predictor = self
            .predictors
            .get(position)
            .ok_or_else(|| anyhow!("no predictor at position {position}"))?;

        let inputs = predictor.select_inputs(inputs)?;
        let prediction = predictor.forward(self.lm, &inputs).await?;

        trace::record_step(TraceStep::new(position, inputs, prediction.data.clone()));
        Ok(prediction)
    }
}

/// Call order of a pipeline's predictors.
///
/// A flow holds no mutable state: clones of a pipeline share it.
#[async_trait]
pub trait Flow: Send + Sync {
    async fn run(&self, stages: &Stages<'_>, inputs: IndexMap<String, Value>) -> Result<Prediction>;
}

/// Runs every predictor once, in position order.
///
/// Each stage reads its inputs from the example inputs plus all earlier
/// outputs; the result holds every stage's outputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

#[async_trait]
impl Flow for Sequential {
    async fn run(&self, stages: &Stages<'_>, inputs: IndexMap<String, Value>) -> Result<Prediction> {
        let mut state = inputs;
        let mut output = Prediction::default();

        for position in 0..stages.len() {
            let prediction = stages.call(position, &state).await?;
            for (key, value) in prediction.data {
                state.insert(key.clone(), value.clone());
                output.data.insert(key, value);
            }
            output.lm_usage += prediction.lm_usage;
        }

        Ok(output)
    }
}

/// An ordered, fixed-shape composition of predictors.
///
/// `clone()` is a deep copy of all predictor state, so teacher/student pairs
/// and candidate evaluations never share anything mutable. Predictors are
/// identified by position.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    predictors: Vec<Predictor>,
    flow: Arc<dyn Flow>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("predictors", &self.predictors)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// A sequential pipeline.
    pub fn new(name: impl Into<String>, predictors: Vec<Predictor>) -> Self {
        Self::with_flow(name, predictors, Sequential)
    }

    pub fn single(name: impl Into<String>, predictor: Predictor) -> Self {
        Self::new(name, vec![predictor])
    }

    pub fn with_flow(name: impl Into<String>, predictors: Vec<Predictor>, flow: impl Flow + 'static) -> Self {
        Self {
            name: name.into(),
            predictors,
            flow: Arc::new(flow),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predictors(&self) -> &[Predictor] {
        &self.predictors
    }

    pub fn predictors_mut(&mut self) -> impl Iterator<Item = &mut Predictor> {
        self.predictors.iter_mut()
    }

    pub fn predictor(&self, position: usize) -> Option<&Predictor> {
        self.predictors.get(position)
    }

    pub fn predictor_mut(&mut self, position: usize) -> Option<&mut Predictor> {
        self.predictors.get_mut(position)
    }

    pub fn len(&self) -> usize {
        self.predictors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictors.is_empty()
    }

    pub fn shape(&self) -> Vec<SignatureShape> {
        self.predictors.iter().map(|p| p.signature().shape()).collect()
    }

    /// Fails unless `other` has the same predictor count and per-position
    /// signature shape.
    pub fn ensure_same_shape(&self, other: &Pipeline) -> CompileResult<()> {
        check_shapes(&self.shape(), &other.shape())
    }

    pub fn demo_count(&self) -> usize {
        self.predictors.iter().map(|p| p.demos().len()).sum()
    }

    pub fn clear_demos(&mut self) {
        for predictor in &mut self.predictors {
            predictor.clear_demos();
        }
    }

    /// Runs the pipeline on an example's input fields.
    pub async fn run(&self, lm: &dyn GenerativeModel, example: &Example) -> Result<Prediction> {
        let stages = Stages {
            predictors: &self.predictors,
            lm,
        };
        self.flow.run(&stages, example.inputs()).await
    }
}

pub(crate) fn check_shapes(expected: &[SignatureShape], actual: &[SignatureShape]) -> CompileResult<()> {
    if expected.len() != actual.len() {
        return Err(CompileError::StructuralMismatch(format!(
            "expected {} predictors, found {}",
            expected.len(),
            actual.len()
        )));
    }
    for (position, (want, got)) in expected.iter().zip(actual).enumerate() {
        if want != got {
            return Err(CompileError::StructuralMismatch(format!(
                "predictor {position}: expected signature `{}` {:?} -> {:?}, found `{}` {:?} -> {:?}",
                want.name, want.inputs, want.outputs, got.name, got.inputs, got.outputs
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockLm;

    fn two_stage() -> Pipeline {
        let rewrite = Signature::builder("Rewrite")
            .input("question", "")
            .output("query", "")
            .build()
            .unwrap();
        let answer = Signature::builder("Answer")
            .input("question", "")
            .input("query", "")
            .output("answer", "")
            .build()
            .unwrap();
        Pipeline::new("rag", vec![Predictor::new(rewrite), Predictor::new(answer)])
    }

    #[tokio::test]
    async fn test_sequential_chains_outputs() {
        let lm = MockLm::new("chain").with_fields(|req| match req.signature.as_str() {
            "Rewrite" => Ok(crate::fields! { "query" => "capital france" }),
            _ => Ok(crate::fields! {
                "answer" => format!("answer for {}", req.input_str("query").unwrap_or_default())
            }),
        });
        let ex = crate::example! { "question": "input" => "What is the capital of France?" };

        let prediction = two_stage().run(&lm, &ex).await.unwrap();
        assert_eq!(prediction.get_str("query"), Some("capital france"));
        assert_eq!(prediction.get_str("answer"), Some("answer for capital france"));
        assert!(prediction.lm_usage.total_tokens > 0);
    }

    #[test]
    fn test_shape_mismatch() {
        let pipeline = two_stage();
        let single = Pipeline::single(
            "qa",
            Predictor::new(
                Signature::builder("Answer")
                    .input("question", "")
                    .output("answer", "")
                    .build()
                    .unwrap(),
            ),
        );

        assert!(pipeline.ensure_same_shape(&pipeline.clone()).is_ok());
        assert!(matches!(
            pipeline.ensure_same_shape(&single),
            Err(CompileError::StructuralMismatch(_))
        ));
    }

    #[test]
    fn test_clone_is_deep() {
        let original = two_stage();
        let mut copy = original.clone();
        copy.predictor_mut(1).unwrap().set_instruction("Be terse.");

        assert_ne!(original.predictors()[1].instruction(), "Be terse.");
        assert_eq!(copy.predictors()[1].instruction(), "Be terse.");
    }
}
