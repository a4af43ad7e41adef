//! Conversations and the leads they belong to.

pub mod model;

pub use model::{Conversation, Lead};
