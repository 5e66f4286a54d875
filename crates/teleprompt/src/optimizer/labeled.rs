use async_trait::async_trait;
use bon::Builder;

use super::{Optimizer, seeded_order};
use crate::{CompileResult, Demonstration, Example, Pipeline};

/// Attaches up to `k` raw training examples to every predictor as labeled
/// demonstrations.
#[derive(Builder, Debug, Clone)]
pub struct LabeledFewShot {
    #[builder(default = 16)]
    pub k: usize,

    /// Shuffle the trainset before picking; `None` keeps the given order.
    pub seed: Option<u64>,
}

impl LabeledFewShot {
    /// Replaces every predictor's demonstrations. Returns how many each got.
    pub fn assign(&self, pipeline: &mut Pipeline, trainset: &[Example]) -> usize {
        let demos: Vec<Demonstration> = seeded_order(trainset, self.seed)
            .iter()
            .take(self.k)
            .map(Demonstration::labeled)
            .collect();

        for predictor in pipeline.predictors_mut() {
            predictor.set_demos(demos.clone());
        }
        demos.len()
    }
}

#[async_trait]
impl Optimizer for LabeledFewShot {
    async fn compile(&self, student: &Pipeline, trainset: &[Example]) -> CompileResult<Pipeline> {
        let mut compiled = student.clone();
        self.assign(&mut compiled, trainset);
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DemoOrigin, Predictor, Signature};

    fn trainset(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| crate::example! { "question": "input" => format!("q{i}"), "answer": "output" => format!("a{i}") })
            .collect()
    }

    fn pipeline() -> Pipeline {
        let sig = Signature::builder("QA")
            .input("question", "")
            .output("answer", "")
            .build()
            .unwrap();
        Pipeline::single("qa", Predictor::new(sig))
    }

    #[tokio::test]
    async fn test_takes_first_k_in_order() {
        let student = pipeline();
        let compiled = LabeledFewShot::builder()
            .k(3)
            .build()
            .compile(&student, &trainset(5))
            .await
            .unwrap();

        let demos = compiled.predictors()[0].demos();
        assert_eq!(demos.len(), 3);
        assert!(demos.iter().all(|d| d.origin() == DemoOrigin::Labeled));
        assert_eq!(demos[2].inputs()["question"], "q2");
        assert_eq!(student.demo_count(), 0);
    }

    fn questions(pipeline: &Pipeline) -> Vec<String> {
        pipeline.predictors()[0]
            .demos()
            .iter()
            .map(|d| d.inputs()["question"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn assigned(seed: Option<u64>) -> Vec<String> {
        let mut p = pipeline();
        LabeledFewShot::builder()
            .k(10)
            .maybe_seed(seed)
            .build()
            .assign(&mut p, &trainset(10));
        questions(&p)
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let optimizer = LabeledFewShot::builder().k(4).seed(7).build();
        let mut a = pipeline();
        let mut b = pipeline();
        optimizer.assign(&mut a, &trainset(10));
        optimizer.assign(&mut b, &trainset(10));
        assert_eq!(a.predictors()[0].demos(), b.predictors()[0].demos());
    }

    #[test]
    fn test_seed_changes_order() {
        let given = assigned(None);
        let seven = assigned(Some(7));
        let eight = assigned(Some(8));

        assert_eq!(given, (0..10).map(|i| format!("q{i}")).collect::<Vec<_>>());
        assert_ne!(seven, given);
        assert_ne!(seven, eight);

        // same examples, different order
        let mut sorted = seven.clone();
        sorted.sort();
        assert_eq!(sorted, given);
    }

    #[test]
    fn test_short_trainset() {
        let mut p = pipeline();
        assert_eq!(LabeledFewShot::builder().build().assign(&mut p, &trainset(2)), 2);
    }
}
