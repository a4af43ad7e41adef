//! Event pipeline: ledger append, reprojection, classification, drafting.
//!
//! Events for different conversations run in parallel. Events for the same
//! conversation are serialized by [`ConversationLocks`] up to the point where
//! generation starts.

pub mod coordinator;
pub mod locks;

pub use coordinator::{
    ConversationDetail, GenerationOutcome, IngestOutcome, PipelineConfig, PipelineCoordinator, RetryReport,
    WebhookKind,
};
pub use locks::{ConversationGuard, ConversationLocks};
