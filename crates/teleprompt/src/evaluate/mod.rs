pub mod evaluator;
pub mod metric;

pub use evaluator::*;
pub use metric::*;
