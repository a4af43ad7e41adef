//! Funnel stage model and the LLM-backed stage classifier.

pub mod classifier;
pub mod model;

pub use classifier::{ClassifierConfig, StageClassification, StageClassifier, StageSource};
pub use model::FunnelStage;
