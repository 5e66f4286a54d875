mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use teleprompt::{
    BootstrapFewShot, CompileError, ExactMatch, PipelineState, Predictor, Pipeline, Signature,
};

async fn compiled_rag() -> Pipeline {
    let mut pipeline = rag_pipeline();
    BootstrapFewShot::builder()
        .lm(oracle_lm())
        .metric(Arc::new(ExactMatch::new("answer")))
        .max_bootstrapped_demos(2)
        .max_labeled_demos(1)
        .build()
        .bootstrap(&mut pipeline, &trainset(5))
        .await
        .unwrap();

    let answer = pipeline.predictor_mut(1).unwrap();
    answer.set_instruction("Answer from the query only.");
    answer.set_prefix("answer", "Final Answer:").unwrap();
    pipeline
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_save_and_load_round_trip() {
    let compiled = compiled_rag().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rag.json");

    let state = compiled
        .state()
        .with_optimizer("BootstrapFewShot")
        .finalize()
        .unwrap();
    state.save(&path).unwrap();

    let loaded = PipelineState::load(&path).unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.compiled_id, Some(loaded.compute_compiled_id().unwrap()));

    let mut fresh = rag_pipeline();
    fresh.load_state(&loaded).unwrap();

    for (restored, original) in fresh.predictors().iter().zip(compiled.predictors()) {
        assert_eq!(restored.instruction(), original.instruction());
        assert_eq!(restored.prefixes(), original.prefixes());
        assert_eq!(restored.demos(), original.demos());
    }
    assert_eq!(fresh.predictors()[1].first_prefix(), "Final Answer:");
    assert_eq!(fresh.demo_count(), 6);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_mismatched_shape_leaves_target() {
    let state = compiled_rag().await.state();

    let mut single = qa_pipeline();
    let err = single.load_state(&state).unwrap_err();
    assert!(matches!(err, CompileError::StructuralMismatch(_)));
    assert_eq!(single.demo_count(), 0);
    assert_eq!(single.predictors()[0].instruction(), "Answer the question.");

    // same count, different field names
    let renamed = Signature::builder("Rewrite")
        .input("prompt", "")
        .output("query", "")
        .build()
        .unwrap();
    let mut other = Pipeline::new(
        "rag",
        vec![Predictor::new(renamed), rag_pipeline().predictors()[1].clone()],
    );
    assert!(matches!(
        other.load_state(&state),
        Err(CompileError::StructuralMismatch(_))
    ));
    assert_eq!(other.demo_count(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn test_demo_origins_survive_json() {
    let state = compiled_rag().await.state();
    let json = serde_json::to_value(&state).unwrap();

    let demos = json["predictors"]["0"]["demos"].as_array().unwrap();
    assert_eq!(demos.len(), 3);
    assert_eq!(demos[0]["origin"], "bootstrapped");
    assert_eq!(demos[2]["origin"], "labeled");
    assert_eq!(json["predictors"]["1"]["signature"]["inputs"][1], "query");
}
