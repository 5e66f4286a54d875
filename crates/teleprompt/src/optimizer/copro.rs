use async_trait::async_trait;
use bon::Builder;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Candidate, CandidateProposer, Optimizer, ProposalSeed};
use crate::{
    CompileError, CompileResult, Evaluator, Example, GenerativeModel, Metric, Pipeline,
};

/// Per-predictor instruction search.
///
/// For every predictor, a model proposes alternative instructions and
/// first-output prefixes. Each candidate is scored on a copy of the input
/// pipeline where only that predictor carries it; other predictors keep
/// their starting configuration throughout, and winners are not compounded
/// between predictors. The best candidate per predictor is applied to the
/// output pipeline at the end, all at once. The predictor's starting
/// configuration stays in the pool, so a search never selects something
/// that measured worse than where it began in isolation.
#[allow(clippy::upper_case_acronyms)]
#[derive(Builder)]
pub struct COPRO {
    /// Model the pipeline runs on during evaluation.
    pub lm: Arc<dyn GenerativeModel>,

    /// Model that proposes candidates. Defaults to `lm`.
    pub prompt_model: Option<Arc<dyn GenerativeModel>>,

    pub metric: Arc<dyn Metric>,

    /// Candidates proposed per predictor per round.
    #[builder(default = 10)]
    pub breadth: usize,

    /// Refinement rounds after the seed round.
    #[builder(default = 3)]
    pub depth: usize,

    /// Sampling temperature of the proposer.
    #[builder(default = 1.4)]
    pub init_temperature: f32,

    /// Keep every candidate and record per-round score statistics instead
    /// of pruning the pool back to `breadth` after each round.
    #[builder(default = false)]
    pub track_stats: bool,

    /// Evaluate on the first `n` trainset examples only.
    pub eval_subset: Option<usize>,

    /// Candidate evaluations in flight at once.
    #[builder(default = 8)]
    pub max_concurrency: usize,

    /// Scores each candidate. Its own `max_concurrency` bounds the examples
    /// in flight per candidate, so up to `max_concurrency *
    /// evaluator.max_concurrency` runs overlap.
    #[builder(default)]
    pub evaluator: Evaluator,

    #[builder(default = 2)]
    pub retries_per_slot: usize,

    #[builder(default = 3)]
    pub max_consecutive_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Init,
    Seed,
    Refine(usize),
    Select,
    Done,
}

impl SearchPhase {
    fn round(self) -> usize {
        match self {
            SearchPhase::Refine(round) => round,
            _ => 0,
        }
    }
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchPhase::Init => write!(f, "init"),
            SearchPhase::Seed => write!(f, "seed"),
            SearchPhase::Refine(round) => write!(f, "refine {round}"),
            SearchPhase::Select => write!(f, "select"),
            SearchPhase::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub max: f32,
    pub min: f32,
    pub mean: f32,
    /// Population standard deviation.
    pub std: f32,
}

impl ScoreSummary {
    pub fn from_scores(scores: &[f32]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as f32;
        let mean = scores.iter().sum::<f32>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
        Some(Self {
            max: scores.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            min: scores.iter().copied().fold(f32::INFINITY, f32::min),
            mean,
            std: variance.sqrt(),
        })
    }
}

/// Scores of the candidates one round added for one predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStats {
    pub position: usize,
    pub round: usize,
    pub scores: ScoreSummary,
    pub best_so_far: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoproReport {
    /// Candidates the proposer returned, baselines excluded.
    pub generated: usize,
    /// Pipeline evaluations actually run.
    pub evaluations: usize,
    /// Candidates scored from an earlier identical evaluation.
    pub cache_hits: usize,
    /// Measured score of each predictor's starting configuration.
    pub baseline_scores: Vec<f32>,
    /// Final candidate pool per position.
    pub pools: Vec<Vec<Candidate>>,
    /// Winning candidate per position.
    pub selected: Vec<Candidate>,
    /// Only filled when `track_stats` is on.
    pub stats: Vec<RoundStats>,
}

type ScoreKey = (usize, String, String);

#[derive(Debug, Clone, Copy)]
struct CachedScore {
    score: f32,
    all_failed: bool,
}

fn score_key(position: usize, candidate: &Candidate) -> ScoreKey {
    (
        position,
        candidate.instruction.clone(),
        candidate.prefix.clone(),
    )
}

/// One predictor's candidate pool.
struct SearchState {
    pool: Vec<Candidate>,
    next_seq: usize,
}

impl SearchState {
    fn new(baseline: Candidate) -> Self {
        Self {
            next_seq: baseline.seq + 1,
            pool: vec![baseline],
        }
    }

    fn best(&self) -> Option<&Candidate> {
        self.pool.iter().min_by(|a, b| a.rank(b))
    }

    /// Worst first, best last.
    fn ascending(&self) -> Vec<Candidate> {
        let mut pool = self.pool.clone();
        pool.sort_by(|a, b| b.rank(a));
        pool
    }

    /// Keeps the baseline plus the `breadth` best other candidates.
    fn prune(&mut self, breadth: usize) {
        let (mut kept, mut rest): (Vec<_>, Vec<_>) =
            self.pool.drain(..).partition(|c| c.baseline);
        rest.sort_by(Candidate::rank);
        rest.truncate(breadth);
        kept.extend(rest);
        self.pool = kept;
    }
}

/// The input pipeline with only `position` changed to `candidate`.
fn candidate_pipeline(
    init: &Pipeline,
    position: usize,
    candidate: &Candidate,
) -> CompileResult<Pipeline> {
    let mut pipeline = init.clone();
    if let Some(predictor) = pipeline.predictor_mut(position) {
        let field = predictor.signature().first_output().name.clone();
        predictor.set_instruction(&candidate.instruction);
        predictor.set_prefix(&field, &candidate.prefix)?;
    }
    Ok(pipeline)
}

struct Round<'a> {
    init: &'a Pipeline,
    proposer: &'a CandidateProposer,
    evalset: &'a [Example],
}

impl COPRO {
    /// Runs the search and returns the optimized pipeline with a report.
    ///
    /// `student` is not modified.
    pub async fn search(
        &self,
        student: &Pipeline,
        trainset: &[Example],
    ) -> CompileResult<(Pipeline, CoproReport)> {
        if self.breadth == 0 {
            return Err(CompileError::InvalidConfig(
                "breadth must be at least 1".to_string(),
            ));
        }

        let evalset = match self.eval_subset {
            Some(n) => &trainset[..n.min(trainset.len())],
            None => trainset,
        };
        let proposer = CandidateProposer::new(
            self.prompt_model.clone().unwrap_or_else(|| self.lm.clone()),
            self.init_temperature,
            self.retries_per_slot,
            self.max_consecutive_failures,
        )?;

        info!(
            phase = %SearchPhase::Init,
            pipeline = student.name(),
            predictors = student.len(),
            breadth = self.breadth,
            depth = self.depth,
            examples = evalset.len(),
            "instruction search"
        );
        let init = student.clone();
        let mut states: Vec<SearchState> = init
            .predictors()
            .iter()
            .map(|p| SearchState::new(Candidate::baseline(p.instruction(), p.first_prefix())))
            .collect();
        let mut cache: HashMap<ScoreKey, CachedScore> = HashMap::new();
        let mut report = CoproReport::default();

        let round = Round {
            init: &init,
            proposer: &proposer,
            evalset,
        };
        self.run_round(SearchPhase::Seed, &round, &mut states, &mut cache, &mut report)
            .await?;
        report.baseline_scores = states
            .iter()
            .map(|s| {
                s.pool
                    .iter()
                    .find(|c| c.baseline)
                    .and_then(|c| c.score)
                    .unwrap_or_default()
            })
            .collect();

        for depth in 1..=self.depth {
            self.run_round(SearchPhase::Refine(depth), &round, &mut states, &mut cache, &mut report)
                .await?;
        }

        info!(phase = %SearchPhase::Select, "selecting best candidates");
        let mut optimized = init.clone();
        for (position, state) in states.iter().enumerate() {
            let Some(best) = state.best() else {
                continue;
            };
            if let Some(predictor) = optimized.predictor_mut(position) {
                let field = predictor.signature().first_output().name.clone();
                predictor.set_instruction(&best.instruction);
                predictor.set_prefix(&field, &best.prefix)?;
            }
            info!(
                position,
                score = best.score.unwrap_or_default(),
                baseline = best.baseline,
                instruction = %best.instruction,
                "selected"
            );
            report.selected.push(best.clone());
        }
        report.pools = states.into_iter().map(|s| s.pool).collect();

        info!(
            phase = %SearchPhase::Done,
            generated = report.generated,
            evaluations = report.evaluations,
            cache_hits = report.cache_hits,
            "instruction search complete"
        );
        Ok((optimized, report))
    }

    async fn run_round(
        &self,
        phase: SearchPhase,
        round: &Round<'_>,
        states: &mut [SearchState],
        cache: &mut HashMap<ScoreKey, CachedScore>,
        report: &mut CoproReport,
    ) -> CompileResult<()> {
        info!(phase = %phase, "entering phase");

        let mut proposed: Vec<Vec<Candidate>> = Vec::with_capacity(states.len());
        for (predictor, state) in round.init.predictors().iter().zip(states.iter_mut()) {
            let history = state.ascending();
            let seed = match phase {
                SearchPhase::Seed => ProposalSeed::Instruction(predictor.instruction()),
                _ => ProposalSeed::History(&history),
            };
            let candidates = round
                .proposer
                .propose(predictor, seed, self.breadth, phase.round(), &mut state.next_seq)
                .await;
            report.generated += candidates.len();
            proposed.push(candidates);
        }

        // Everything without a score: new proposals plus, on the seed
        // round, the baselines.
        let mut queued = HashSet::new();
        let mut jobs = Vec::new();
        for (position, state) in states.iter().enumerate() {
            let unscored = state.pool.iter().filter(|c| c.score.is_none());
            for candidate in unscored.chain(&proposed[position]) {
                let key = score_key(position, candidate);
                if cache.contains_key(&key) || !queued.insert(key.clone()) {
                    report.cache_hits += 1;
                    continue;
                }
                jobs.push((key, candidate_pipeline(round.init, position, candidate)?));
            }
        }

        let evaluator = &self.evaluator;
        let lm: &dyn GenerativeModel = self.lm.as_ref();
        let metric: &dyn Metric = self.metric.as_ref();
        let evalset = round.evalset;

        let results: Vec<(ScoreKey, CachedScore)> = stream::iter(jobs)
            .map(|(key, pipeline)| async move {
                let result = evaluator.evaluate(&pipeline, lm, evalset, metric).await;
                debug!(
                    position = key.0,
                    score = result.score,
                    failures = result.failures,
                    "candidate evaluated"
                );
                let cached = CachedScore {
                    score: result.score,
                    all_failed: result.all_failed(),
                };
                (key, cached)
            })
            .buffer_unordered(self.max_concurrency.max(1))
            .collect()
            .await;
        report.evaluations += results.len();
        cache.extend(results);

        for ((position, state), candidates) in states.iter_mut().enumerate().zip(proposed) {
            for candidate in state.pool.iter_mut().filter(|c| c.score.is_none()) {
                candidate.score = cache.get(&score_key(position, candidate)).map(|c| c.score);
            }

            let mut round_scores = Vec::with_capacity(candidates.len());
            for mut candidate in candidates {
                match cache.get(&score_key(position, &candidate)) {
                    Some(cached) if !cached.all_failed => {
                        candidate.score = Some(cached.score);
                        round_scores.push(cached.score);
                        state.pool.push(candidate);
                    }
                    _ => debug!(
                        position,
                        seq = candidate.seq,
                        "dropping candidate that failed on every example"
                    ),
                }
            }

            if self.track_stats {
                if let Some(scores) = ScoreSummary::from_scores(&round_scores) {
                    let best_so_far = state.best().and_then(|c| c.score).unwrap_or_default();
                    info!(
                        position,
                        round = phase.round(),
                        max = scores.max,
                        min = scores.min,
                        mean = scores.mean,
                        std = scores.std,
                        best_so_far,
                        "round statistics"
                    );
                    report.stats.push(RoundStats {
                        position,
                        round: phase.round(),
                        scores,
                        best_so_far,
                    });
                }
            } else {
                state.prune(self.breadth);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Optimizer for COPRO {
    async fn compile(&self, student: &Pipeline, trainset: &[Example]) -> CompileResult<Pipeline> {
        let (optimized, _) = self.search(student, trainset).await?;
        Ok(optimized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExactMatch, MockLm, Predictor, Signature};

    fn scored(score: f32, seq: usize) -> Candidate {
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
    fn test_prune_keeps_baseline() {
        let mut baseline = Candidate::baseline("start", "Answer:");
        baseline.score = Some(0.0);
        let mut state = SearchState::new(baseline);
        state.pool.extend([scored(0.4, 1), scored(0.9, 2), scored(0.6, 3)]);

        state.prune(2);

        let seqs: Vec<usize> = state.pool.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 2, 3]);
        assert_eq!(state.best().map(|c| c.seq), Some(2));
    }

    #[test]
    fn test_ascending_puts_best_last() {
        let mut state = SearchState::new(Candidate::baseline("start", "Answer:"));
        state.pool.extend([scored(0.4, 1), scored(0.9, 2)]);
        let ordered = state.ascending();
        // the unscored baseline ranks last, so it comes first here
        assert_eq!(ordered.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_score_summary() {
        let summary = ScoreSummary::from_scores(&[1.0, 0.0, 0.5, 0.5]).unwrap();
        assert_eq!(summary.max, 1.0);
        assert_eq!(summary.min, 0.0);
        assert_eq!(summary.mean, 0.5);
        assert!((summary.std - 0.353_553_4).abs() < 1e-5);
        assert!(ScoreSummary::from_scores(&[]).is_none());
    }

    #[tokio::test]
    async fn test_zero_breadth_rejected() {
        let sig = Signature::builder("QA")
            .input("question", "")
            .output("answer", "")
            .build()
            .unwrap();
        let copro = COPRO::builder()
            .lm(Arc::new(MockLm::new("lm")))
            .metric(Arc::new(ExactMatch::new("answer")))
            .breadth(0)
            .build();

        let err = copro
            .search(&Pipeline::single("qa", Predictor::new(sig)), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidConfig(_)));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(SearchPhase::Refine(2).to_string(), "refine 2");
        assert_eq!(SearchPhase::Seed.round(), 0);
    }
}
