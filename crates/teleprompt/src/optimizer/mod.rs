pub mod bootstrap;
pub mod copro;
pub mod labeled;
pub mod proposer;

pub use bootstrap::*;
pub use copro::*;
pub use labeled::*;
pub use proposer::*;

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::{CompileResult, Example, Pipeline};

/// A strategy that produces an optimized copy of a pipeline.
///
/// The input pipeline is never modified; per-example and per-candidate
/// failures are contained, so only configuration and structural problems
/// come back as errors.
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn compile(&self, student: &Pipeline, trainset: &[Example]) -> CompileResult<Pipeline>;
}

/// `items` in seeded shuffled order, or as given when `seed` is `None`.
pub(crate) fn seeded_order<T: Clone>(items: &[T], seed: Option<u64>) -> Vec<T> {
    let mut ordered = items.to_vec();
    if let Some(seed) = seed {
        ordered.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    ordered
}
