//! Drafts: the record, the generator and the review-surface contract.

pub mod generator;
pub mod model;
pub mod review;

pub use generator::{DraftGenerator, GeneratedReply};
pub use model::{Draft, DraftStatus, QaAnnotation};
pub use review::{DraftNotification, HttpReviewSurface, LogReviewSurface, ReviewEvent, ReviewSurface};
