//! Resource library read contract.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::stage::FunnelStage;
use crate::store::Database;

/// A titled, stage-tagged snippet of reference material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDoc {
    pub id: String,
    pub title: String,
    pub category: String,
    pub content: String,
    pub priority: i32,
    #[serde(default)]
    pub stages: Vec<FunnelStage>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Priority descending, then id ascending.
pub fn rank(a: &ResourceDoc, b: &ResourceDoc) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}

/// Knowledge-base collaborator, seen only through fetch-by-stage.
#[async_trait]
pub trait ResourceLibrary: Send + Sync {
    /// Active documents for `stage`, ranked by [`rank`].
    async fn fetch_for_stage(&self, stage: FunnelStage) -> Result<Vec<ResourceDoc>, DatabaseError>;
}

/// Library backed by the local `resource_docs` table.
pub struct DbResourceLibrary {
    db: Arc<dyn Database>,
}

impl DbResourceLibrary {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResourceLibrary for DbResourceLibrary {
    async fn fetch_for_stage(&self, stage: FunnelStage) -> Result<Vec<ResourceDoc>, DatabaseError> {
        let mut docs = self.db.resources_for_stage(stage).await?;
        docs.sort_by(rank);
        Ok(docs)
    }
}
