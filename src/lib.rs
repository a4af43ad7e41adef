//! Speed-to-lead: conversation reconciliation and stage-conditioned reply drafts.

pub mod config;
pub mod context;
pub mod conversation;
pub mod drafts;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod llm;
pub mod pipeline;
pub mod server;
pub mod stage;
pub mod store;
pub mod transcript;
