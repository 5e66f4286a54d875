pub mod lm;
pub mod pipeline;
pub mod predictor;
pub mod signature;

pub use lm::*;
pub use pipeline::*;
pub use predictor::*;
pub use signature::*;
