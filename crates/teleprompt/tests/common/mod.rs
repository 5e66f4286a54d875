#![allow(dead_code)]

use std::sync::Arc;
use teleprompt::{Example, LmRequest, MockLm, Pipeline, Predictor, Signature, example};

pub fn qa_signature() -> Signature {
    Signature::builder("QA")
        .instruction("Answer the question.")
        .input("question", "A short question")
        .output("answer", "A short answer")
        .build()
        .unwrap()
}

pub fn qa_pipeline() -> Pipeline {
    Pipeline::single("qa", Predictor::new(qa_signature()))
}

/// question -> query, then (question, query) -> answer.
pub fn rag_pipeline() -> Pipeline {
    let rewrite = Signature::builder("Rewrite")
        .instruction("Rewrite the question as a search query.")
        .input("question", "")
        .output("query", "")
        .build()
        .unwrap();
    let answer = Signature::builder("Answer")
        .instruction("Answer using the query.")
        .input("question", "")
        .input("query", "")
        .output("answer", "")
        .build()
        .unwrap();
    Pipeline::new("rag", vec![Predictor::new(rewrite), Predictor::new(answer)])
}

/// Examples `q1 -> a1`, `q2 -> a2`, ...
pub fn trainset(n: usize) -> Vec<Example> {
    (1..=n)
        .map(|i| {
            example! {
                "question": "input" => format!("q{i}"),
                "answer": "output" => format!("a{i}"),
            }
        })
        .collect()
}

/// The number in `q7` / `a7`.
pub fn number(text: &str) -> usize {
    text.trim_start_matches(['q', 'a']).parse().unwrap_or(0)
}

pub fn question_number(request: &LmRequest) -> usize {
    number(request.input_str("question").unwrap_or_default())
}

/// Answers every question correctly; in the two-stage pipeline the rewrite
/// step produces `search qN`.
pub fn oracle_lm() -> Arc<MockLm> {
    Arc::new(MockLm::new("oracle").with_fields(|request| {
        let n = question_number(request);
        Ok(match request.signature.as_str() {
            "Rewrite" => teleprompt::fields! { "query" => format!("search q{n}") },
            _ => teleprompt::fields! { "answer" => format!("a{n}") },
        })
    }))
}

pub fn example_number(example: &Example) -> usize {
    example
        .get("question")
        .and_then(|v| v.as_str())
        .map(number)
        .unwrap_or(0)
}
