//! Storage seams consumed by the engine.
//!
//! The attempt log is append-only and the engine only ever reads it. Model
//! artifacts are the one thing the engine writes, through [`ModelArtifactStore::save`],
//! which must swap the active version atomically.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{ExerciseAttempt, LearnerProfile, SkillProficiency, TrainedModel};

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptQuery {
    pub user_id: String,
    pub skill_domain: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl AttemptQuery {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            skill_domain: None,
            since: None,
            limit: None,
            order: SortOrder::NewestFirst,
        }
    }

    pub fn domain(mut self, skill_domain: &str) -> Self {
        self.skill_domain = Some(skill_domain.to_string());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn matches(&self, attempt: &ExerciseAttempt) -> bool {
        attempt.user_id == self.user_id
            && self
                .skill_domain
                .as_deref()
                .map_or(true, |domain| attempt.skill_domain == domain)
            && self.since.map_or(true, |since| attempt.timestamp >= since)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttemptTotals {
    pub total: u64,
    pub correct: u64,
}

impl AttemptTotals {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

#[async_trait]
pub trait AttemptHistoryStore: Send + Sync {
    async fn append(&self, attempt: ExerciseAttempt) -> Result<(), StoreError>;

    async fn query(&self, query: &AttemptQuery) -> Result<Vec<ExerciseAttempt>, StoreError>;

    async fn totals(&self, user_id: &str) -> Result<AttemptTotals, StoreError> {
        let attempts = self.query(&AttemptQuery::for_user(user_id)).await?;
        Ok(AttemptTotals {
            total: attempts.len() as u64,
            correct: attempts.iter().filter(|a| a.is_correct).count() as u64,
        })
    }
}

#[async_trait]
pub trait SkillProficiencyStore: Send + Sync {
    async fn get(
        &self,
        user_id: &str,
        skill_domain: &str,
    ) -> Result<Option<SkillProficiency>, StoreError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SkillProficiency>, StoreError>;

    async fn upsert(&self, proficiency: SkillProficiency) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LearnerProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<LearnerProfile>, StoreError>;

    async fn upsert_profile(&self, profile: LearnerProfile) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ModelArtifactStore: Send + Sync {
    /// Deactivates every record sharing `record.name` and stores `record` as the
    /// active version. Readers never observe zero or two active versions.
    async fn save(&self, record: &TrainedModel, blob: &[u8]) -> Result<(), StoreError>;

    async fn load_active(&self, name: &str)
        -> Result<Option<(Vec<u8>, TrainedModel)>, StoreError>;

    /// Every stored version for `name`, newest registration first.
    async fn list(&self, name: &str) -> Result<Vec<TrainedModel>, StoreError>;
}

/// Read-side collaborators of the feature pipeline.
#[derive(Clone)]
pub struct DataSources {
    pub attempts: Arc<dyn AttemptHistoryStore>,
    pub proficiency: Arc<dyn SkillProficiencyStore>,
    pub profiles: Arc<dyn LearnerProfileStore>,
}

impl DataSources {
    pub fn new(
        attempts: Arc<dyn AttemptHistoryStore>,
        proficiency: Arc<dyn SkillProficiencyStore>,
        profiles: Arc<dyn LearnerProfileStore>,
    ) -> Self {
        Self {
            attempts,
            proficiency,
            profiles,
        }
    }

    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: AttemptHistoryStore + SkillProficiencyStore + LearnerProfileStore + 'static,
    {
        Self {
            attempts: store.clone(),
            proficiency: store.clone(),
            profiles: store,
        }
    }
}
