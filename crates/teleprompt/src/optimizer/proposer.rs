use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{CompileResult, GenerativeModel, Predictor, Signature};

/// An alternative instruction (and first-output prefix) for one predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub instruction: String,
    pub prefix: String,
    /// `None` until evaluated.
    pub score: Option<f32>,
    /// 0 for seed proposals and the baseline, `n` for the n-th refine round.
    pub round: usize,
    /// Generation order within the predictor's search; breaks score ties.
    pub seq: usize,
    /// The predictor's configuration before the search started.
    pub baseline: bool,
}

impl Candidate {
    pub fn baseline(instruction: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            prefix: prefix.into(),
            score: None,
            round: 0,
            seq: 0,
            baseline: true,
        }
    }

    /// Best first: higher score, then earlier generation. Unscored and
    /// non-finite scores sort last.
    pub fn rank(&self, other: &Candidate) -> Ordering {
        let score = |c: &Candidate| {
            c.score
                .filter(|s| s.is_finite())
                .unwrap_or(f32::NEG_INFINITY)
        };
        score(other)
            .total_cmp(&score(self))
            .then(self.seq.cmp(&other.seq))
    }
}

/// What a proposal round starts from.
#[derive(Debug, Clone, Copy)]
pub enum ProposalSeed<'a> {
    /// The predictor's current instruction.
    Instruction(&'a str),
    /// Previously evaluated candidates, sorted ascending by score.
    History(&'a [Candidate]),
}

fn seed_signature() -> CompileResult<Signature> {
    Signature::builder("BasicGenerateInstruction")
        .instruction(
            "You are an instruction optimizer for large language models. I will give you a task \
             description and the fields it works on. Propose an improved instruction that will lead \
             a good language model to perform the task well. Keep it self-contained and specific.",
        )
        .input("basic_instruction", "The initial instruction before optimization")
        .input("task_fields", "The input and output fields of the task")
        .output_with_prefix(
            "proposed_instruction",
            "The improved instruction for the language model",
            "Proposed Instruction:",
        )
        .optional_output_with_prefix(
            "proposed_prefix_for_output_field",
            "The string at the end of the prompt that helps the model start its answer",
            "Output Prefix:",
        )
        .build()
}

fn history_signature() -> CompileResult<Signature> {
    Signature::builder("GenerateInstructionGivenAttempts")
        .instruction(
            "You are an instruction optimizer for large language models. I will give you the \
             fields of a task and several instructions that were tried for it, each with the \
             score it achieved. Attempts are listed in increasing order of score. Propose a new \
             instruction, different from all of them, that will score higher.",
        )
        .input("attempted_instructions", "Earlier instructions, prefixes and their scores")
        .input("task_fields", "The input and output fields of the task")
        .output_with_prefix(
            "proposed_instruction",
            "The improved instruction for the language model",
            "Proposed Instruction:",
        )
        .optional_output_with_prefix(
            "proposed_prefix_for_output_field",
            "The string at the end of the prompt that helps the model start its answer",
            "Output Prefix:",
        )
        .build()
}

fn render_task_fields(signature: &Signature) -> String {
    let mut out = String::new();
    for (label, fields) in [
        ("Input fields", signature.input_fields().collect::<Vec<_>>()),
        ("Output fields", signature.output_fields().collect::<Vec<_>>()),
    ] {
        out.push_str(label);
        out.push_str(":\n");
        for field in fields {
            if field.description.is_empty() {
                out.push_str(&format!("- {}\n", field.name));
            } else {
                out.push_str(&format!("- {}: {}\n", field.name, field.description));
            }
        }
    }
    out
}

fn render_history(history: &[Candidate]) -> String {
    history
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "Instruction #{n}: {}\nPrefix #{n}: {}\nResulting Score #{n}: {:.3}",
                c.instruction,
                c.prefix,
                c.score.unwrap_or(0.0),
                n = i + 1
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Asks a model for new instruction/prefix candidates.
///
/// Keeps nothing between calls beyond the model handle and its settings.
#[derive(Clone)]
pub struct CandidateProposer {
    lm: Arc<dyn GenerativeModel>,
    seed_generator: Predictor,
    history_generator: Predictor,
    retries_per_slot: usize,
    max_consecutive_failures: usize,
}

impl CandidateProposer {
    pub fn new(
        lm: Arc<dyn GenerativeModel>,
        temperature: f32,
        retries_per_slot: usize,
        max_consecutive_failures: usize,
    ) -> CompileResult<Self> {
        Ok(Self {
            lm,
            seed_generator: Predictor::new(seed_signature()?).with_temperature(temperature),
            history_generator: Predictor::new(history_signature()?).with_temperature(temperature),
            retries_per_slot,
            max_consecutive_failures: max_consecutive_failures.max(1),
        })
    }

    /// Proposes up to `breadth` candidates for `predictor`.
    ///
    /// Candidates get consecutive `seq` numbers starting at `*next_seq`,
    /// which is advanced past them. Slots whose calls keep failing are
    /// omitted; after too many failures in a row the round ends early.
    pub async fn propose(
        &self,
        predictor: &Predictor,
        seed: ProposalSeed<'_>,
        breadth: usize,
        round: usize,
        next_seq: &mut usize,
    ) -> Vec<Candidate> {
        let task_fields = render_task_fields(predictor.signature());
        let (generator, inputs) = match seed {
            ProposalSeed::Instruction(instruction) => (
                &self.seed_generator,
                crate::fields! {
                    "basic_instruction" => instruction,
                    "task_fields" => task_fields,
                },
            ),
            ProposalSeed::History(history) => (
                &self.history_generator,
                crate::fields! {
                    "attempted_instructions" => render_history(history),
                    "task_fields" => task_fields,
                },
            ),
        };
        let current_prefix = predictor.first_prefix();

        let mut candidates = Vec::with_capacity(breadth);
        let mut consecutive_failures = 0;

        'slots: for slot in 0..breadth {
            for attempt in 0..=self.retries_per_slot {
                match self.generate(generator, &inputs, current_prefix).await {
                    Ok((instruction, prefix)) => {
                        consecutive_failures = 0;
                        candidates.push(Candidate {
                            instruction,
                            prefix,
                            score: None,
                            round,
                            seq: *next_seq,
                            baseline: false,
                        });
                        *next_seq += 1;
                        continue 'slots;
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!(
                            signature = predictor.signature().name(),
                            slot,
                            attempt,
                            error = %err,
                            "candidate generation failed"
                        );
                        if consecutive_failures >= self.max_consecutive_failures {
                            warn!(
                                signature = predictor.signature().name(),
                                proposed = candidates.len(),
                                "too many consecutive generation failures; ending round early"
                            );
                            break 'slots;
                        }
                    }
                }
            }
            debug!(slot, "candidate slot omitted after retries");
        }

        candidates
    }

    async fn generate(
        &self,
        generator: &Predictor,
        inputs: &indexmap::IndexMap<String, serde_json::Value>,
        current_prefix: &str,
    ) -> Result<(String, String)> {
        let prediction = generator.forward(self.lm.as_ref(), inputs).await?;

        let instruction = prediction
            .get_str("proposed_instruction")
            .map(str::trim)
            .unwrap_or_default();
        if instruction.is_empty() {
            bail!("model proposed an empty instruction");
        }
        let prefix = prediction
            .get_str("proposed_prefix_for_output_field")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(current_prefix);

        Ok((instruction.to_string(), prefix.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockLm;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn predictor() -> Predictor {
        Predictor::new(
            Signature::builder("QA")
                .instruction("Answer the question.")
                .input("question", "A trivia question")
                .output("answer", "")
                .build()
                .unwrap(),
        )
    }

    fn candidate(score: f32, seq: usize) -> Candidate {
        Candidate {
            instruction: format!("i{seq}"),
            prefix: "Answer:".to_string(),
            score: Some(score),
            round: 0,
            seq,
            baseline: false,
        }
    }

    #[test]
    fn test_rank_ties_go_to_earliest() {
        let mut pool = vec![candidate(0.5, 3), candidate(0.9, 2), candidate(0.9, 1), candidate(0.1, 0)];
        pool.sort_by(Candidate::rank);
        let seqs: Vec<usize> = pool.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_rank_puts_nan_last() {
        let mut nan_baseline = Candidate::baseline("start", "Answer:");
        nan_baseline.score = Some(f32::NAN);
        let mut pool = vec![nan_baseline, candidate(1.0, 1), candidate(0.0, 2)];

        let best = pool.iter().min_by(|a, b| a.rank(b)).unwrap();
        assert_eq!(best.seq, 1);

        pool.sort_by(Candidate::rank);
        let seqs: Vec<usize> = pool.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_seed_proposals_are_numbered() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let lm = Arc::new(MockLm::new("proposer").with_fields(move |req| {
            assert_eq!(req.signature, "BasicGenerateInstruction");
            assert_eq!(req.input_str("basic_instruction"), Some("Answer the question."));
            let n = seen.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(crate::fields! {
                "proposed_instruction" => format!("Instruction {n}"),
                "proposed_prefix_for_output_field" => "",
            })
        }));
        let proposer = CandidateProposer::new(lm, 1.4, 2, 3).unwrap();
        let predictor = predictor();

        let mut next_seq = 1;
        let candidates = proposer
            .propose(&predictor, ProposalSeed::Instruction(predictor.instruction()), 3, 0, &mut next_seq)
            .await;

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[2].instruction, "Instruction 2");
        assert_eq!(candidates[0].prefix, "Answer:");
        assert_eq!(candidates.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(next_seq, 4);
    }

    #[tokio::test]
    async fn test_history_is_rendered_ascending() {
        let lm = Arc::new(MockLm::new("refiner").with_fields(|req| {
            let history = req.input_str("attempted_instructions").unwrap_or_default();
            assert!(history.starts_with("Instruction #1: i1"));
            assert!(history.contains("Resulting Score #2: 0.900"));
            Ok(crate::fields! {
                "proposed_instruction" => "Better",
                "proposed_prefix_for_output_field" => "Final Answer:",
            })
        }));
        let proposer = CandidateProposer::new(lm, 1.4, 0, 3).unwrap();
        let history = vec![candidate(0.2, 1), candidate(0.9, 2)];

        let mut next_seq = 5;
        let candidates = proposer
            .propose(&predictor(), ProposalSeed::History(&history), 1, 1, &mut next_seq)
            .await;

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].prefix, "Final Answer:");
        assert_eq!(candidates[0].round, 1);
        assert_eq!(candidates[0].seq, 5);
    }

    #[tokio::test]
    async fn test_failed_slots_are_omitted() {
        // every other call fails: each slot succeeds on its retry
        let lm = Arc::new(MockLm::new("flaky").with_responses(vec![
            "garbage".to_string(),
            "[[ ## proposed_instruction ## ]]\nTry harder.\n\n[[ ## proposed_prefix_for_output_field ## ]]\nAnswer:\n\n[[ ## completed ## ]]".to_string(),
        ]));
        let proposer = CandidateProposer::new(lm.clone(), 1.0, 1, 5).unwrap();
        let predictor = predictor();

        let mut next_seq = 1;
        let candidates = proposer
            .propose(&predictor, ProposalSeed::Instruction("x"), 2, 0, &mut next_seq)
            .await;
        assert_eq!(candidates.len(), 2);
        assert_eq!(lm.calls(), 4);
    }

    #[tokio::test]
    async fn test_consecutive_failures_end_round() {
        let lm = Arc::new(MockLm::new("down").with_responder(|_| anyhow::bail!("503")));
        let proposer = CandidateProposer::new(lm.clone(), 1.0, 2, 3).unwrap();
        let predictor = predictor();

        let mut next_seq = 1;
        let candidates = proposer
            .propose(&predictor, ProposalSeed::Instruction("x"), 10, 0, &mut next_seq)
            .await;
        assert!(candidates.is_empty());
        assert_eq!(lm.calls(), 3);
        assert_eq!(next_seq, 1);
    }

    #[tokio::test]
    async fn test_missing_prefix_keeps_current() {
        let lm = Arc::new(MockLm::new("terse").with_responses(vec![
            "[[ ## proposed_instruction ## ]]\nAnswer precisely.\n\n[[ ## completed ## ]]".to_string(),
        ]));
        let proposer = CandidateProposer::new(lm.clone(), 1.0, 2, 3).unwrap();

        let candidates = proposer
            .propose(&predictor(), ProposalSeed::Instruction("x"), 3, 0, &mut 1)
            .await;

        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.instruction == "Answer precisely."));
        assert!(candidates.iter().all(|c| c.prefix == "Answer:"));
        assert_eq!(lm.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_instruction_is_failure() {
        let lm = Arc::new(MockLm::new("blank").with_fields(|_| {
            Ok(crate::fields! {
                "proposed_instruction" => "   ",
                "proposed_prefix_for_output_field" => "Answer:",
            })
        }));
        let proposer = CandidateProposer::new(lm, 1.0, 0, 10).unwrap();
        let candidates = proposer
            .propose(&predictor(), ProposalSeed::Instruction("x"), 2, 0, &mut 1)
            .await;
        assert!(candidates.is_empty());
    }
}
