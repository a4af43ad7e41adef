//! Webhook ingestion boundary: payload shapes and the event normalizer.

pub mod normalizer;
pub mod webhook;

pub use normalizer::{WebhookEvent, normalize};
