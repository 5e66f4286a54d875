//! Bootstraps demonstrations and then searches instructions for a one-step
//! QA pipeline, entirely against deterministic mock models.
//!
//! ```sh
//! RUST_LOG=teleprompt=info cargo run -p teleprompt --example compile_qa
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use teleprompt::{
    BootstrapFewShot, COPRO, CompileSettings, Evaluator, ExactMatch, Example, GenerativeModel,
    Metric, MockLm, Pipeline, Predictor, Signature, example, fields,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CAPITALS: &[(&str, &str)] = &[
    ("France", "Paris"),
    ("Japan", "Tokyo"),
    ("Kenya", "Nairobi"),
    ("Peru", "Lima"),
    ("Norway", "Oslo"),
    ("Egypt", "Cairo"),
    ("Chile", "Santiago"),
    ("Canada", "Ottawa"),
];

fn trainset() -> Vec<Example> {
    CAPITALS
        .iter()
        .map(|(country, capital)| {
            example! {
                "question": "input" => format!("What is the capital of {country}?"),
                "answer": "output" => *capital,
            }
        })
        .collect()
}

/// Knows every capital, but only names it when the prompt is specific or
/// carries worked examples; otherwise it answers with the country.
fn task_model() -> MockLm {
    MockLm::new("mock-task").with_fields(|request| {
        let question = request.input_str("question").unwrap_or_default();
        let (country, capital) = CAPITALS
            .iter()
            .find(|(country, _)| question.contains(country))
            .copied()
            .unwrap_or(("somewhere", "unknown"));

        let has_demos = request.chat.len() > 2;
        let specific = request.instruction.to_lowercase().contains("city");
        let answer = if has_demos || specific { capital } else { country };
        Ok(fields! { "answer" => answer })
    })
}

fn proposal_model() -> MockLm {
    const PROPOSALS: &[&str] = &[
        "Reply with the country's name.",
        "Name the capital city of the country in the question.",
        "Answer in one word.",
    ];
    let next = AtomicUsize::new(0);
    MockLm::new("mock-proposer").with_fields(move |_| {
        let i = next.fetch_add(1, Ordering::SeqCst);
        Ok(fields! {
            "proposed_instruction" => PROPOSALS[i % PROPOSALS.len()],
            "proposed_prefix_for_output_field" => "Capital:",
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("teleprompt=info")),
        )
        .init();

    let settings = CompileSettings::default();
    let lm: Arc<dyn GenerativeModel> = Arc::new(task_model());
    let metric: Arc<dyn Metric> = Arc::new(ExactMatch::new("answer"));
    let trainset = trainset();
    let (train, dev) = trainset.split_at(5);

    let signature = Signature::builder("CapitalQA")
        .instruction("Answer the question.")
        .input("question", "A question about a country")
        .output("answer", "The capital city")
        .build()?;
    let pipeline = Pipeline::single("capitals", Predictor::new(signature));

    let evaluator = Evaluator::from(&settings.evaluation);
    let before = evaluator.score(&pipeline, lm.as_ref(), dev, metric.as_ref()).await;

    // the student's demos start the search; the search only sees instructions
    let mut bootstrapped = pipeline.clone();
    let mut bootstrap_settings = settings.bootstrap.clone();
    bootstrap_settings.max_bootstrapped_demos = 2;
    bootstrap_settings.max_labeled_demos = 2;
    let report = BootstrapFewShot::from_settings(&bootstrap_settings, lm.clone(), metric.clone())
        .bootstrap(&mut bootstrapped, train)
        .await?;
    info!(?report, "bootstrap report");
    let after_bootstrap = evaluator
        .score(&bootstrapped, lm.as_ref(), dev, metric.as_ref())
        .await;

    let mut copro_settings = settings.copro.clone();
    copro_settings.breadth = 3;
    copro_settings.depth = 1;
    let mut copro = COPRO::from_settings(
        &copro_settings,
        &settings.evaluation,
        lm.clone(),
        metric.clone(),
    );
    copro.prompt_model = Some(Arc::new(proposal_model()));
    let (searched, search_report) = copro.search(&pipeline, train).await?;
    let after_search = evaluator
        .score(&searched, lm.as_ref(), dev, metric.as_ref())
        .await;

    info!(
        before,
        after_bootstrap,
        after_search,
        instruction = searched.predictors()[0].instruction(),
        evaluations = search_report.evaluations,
        "done"
    );

    let dir = std::env::temp_dir().join("teleprompt-demo");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("capitals.json");
    bootstrapped
        .state()
        .with_optimizer("BootstrapFewShot")
        .with_score(after_bootstrap)
        .finalize()?
        .save(&path)?;
    info!(path = %path.display(), "saved compiled state");

    Ok(())
}
