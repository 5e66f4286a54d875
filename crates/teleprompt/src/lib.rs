//! Demonstration bootstrapping and instruction search for pipelines of
//! prompt-driven predictors.
//!
//! A [`Pipeline`] is an ordered, fixed-shape composition of [`Predictor`]s.
//! The optimizers never change that shape; they tune each predictor's
//! few-shot demonstrations ([`BootstrapFewShot`], [`LabeledFewShot`]) and its
//! instruction and output prefix ([`COPRO`]), scoring with a caller-supplied
//! [`Metric`]. The model is always passed in explicitly.
//!
//! ```no_run
//! use std::sync::Arc;
//! use teleprompt::*;
//!
//! # async fn run(lm: Arc<dyn GenerativeModel>, trainset: Vec<Example>) -> CompileResult<()> {
//! let signature = Signature::builder("QA")
//!     .input("question", "")
//!     .output("answer", "")
//!     .build()?;
//! let mut pipeline = Pipeline::single("qa", Predictor::new(signature));
//! let metric: Arc<dyn Metric> = Arc::new(ExactMatch::new("answer"));
//!
//! BootstrapFewShot::builder()
//!     .lm(lm.clone())
//!     .metric(metric.clone())
//!     .build()
//!     .bootstrap(&mut pipeline, &trainset)
//!     .await?;
//! let (pipeline, _report) = COPRO::builder()
//!     .lm(lm)
//!     .metric(metric)
//!     .build()
//!     .search(&pipeline, &trainset)
//!     .await?;
//! pipeline.state().finalize()?.save("qa.json")?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod core;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod manifest;
pub mod optimizer;
pub mod settings;
pub mod trace;

pub use adapter::ChatAdapter;
pub use self::core::*;
pub use data::*;
pub use error::*;
pub use evaluate::*;
pub use manifest::*;
pub use optimizer::*;
pub use settings::*;
pub use trace::{Trace, TraceRecorder, TraceStep};

pub use indexmap::IndexMap;
pub use serde_json::Value;
