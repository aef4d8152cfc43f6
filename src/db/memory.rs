use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{
    AttemptHistoryStore, AttemptQuery, AttemptTotals, LearnerProfileStore, ModelArtifactStore,
    SkillProficiencyStore, SortOrder, StoreError,
};
use crate::types::{ExerciseAttempt, LearnerProfile, SkillProficiency, TrainedModel};

struct StoredArtifact {
    record: TrainedModel,
    blob: Vec<u8>,
}

/// Process-local store backing every collaborator seam. Used by tests and by
/// embedders that keep history elsewhere and replay it in.
#[derive(Default)]
pub struct InMemoryStore {
    attempts: RwLock<HashMap<String, Vec<ExerciseAttempt>>>,
    proficiencies: RwLock<HashMap<(String, String), SkillProficiency>>,
    profiles: RwLock<HashMap<String, LearnerProfile>>,
    artifacts: Mutex<HashMap<String, Vec<StoredArtifact>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_count(&self, user_id: &str) -> usize {
        self.attempts
            .read()
            .get(user_id)
            .map(|attempts| attempts.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl AttemptHistoryStore for InMemoryStore {
    async fn append(&self, attempt: ExerciseAttempt) -> Result<(), StoreError> {
        if attempt.user_id.trim().is_empty() {
            return Err(StoreError::InvalidRecord("attempt without user id".to_string()));
        }
        let mut guard = self.attempts.write();
        let log = guard.entry(attempt.user_id.clone()).or_default();
        // chronological, equal timestamps keep submission order
        let pos = log.partition_point(|existing| existing.timestamp <= attempt.timestamp);
        log.insert(pos, attempt);
        Ok(())
    }

    async fn query(&self, query: &AttemptQuery) -> Result<Vec<ExerciseAttempt>, StoreError> {
        let guard = self.attempts.read();
        let Some(log) = guard.get(&query.user_id) else {
            return Ok(Vec::new());
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        let matching = log.iter().filter(|attempt| query.matches(attempt));
        let result = match query.order {
            SortOrder::NewestFirst => matching.rev().take(limit).cloned().collect(),
            SortOrder::OldestFirst => matching.take(limit).cloned().collect(),
        };
        Ok(result)
    }

    async fn totals(&self, user_id: &str) -> Result<AttemptTotals, StoreError> {
        let guard = self.attempts.read();
        let totals = guard
            .get(user_id)
            .map(|log| AttemptTotals {
                total: log.len() as u64,
                correct: log.iter().filter(|a| a.is_correct).count() as u64,
            })
            .unwrap_or_default();
        Ok(totals)
    }
}

#[async_trait]
impl SkillProficiencyStore for InMemoryStore {
    async fn get(
        &self,
        user_id: &str,
        skill_domain: &str,
    ) -> Result<Option<SkillProficiency>, StoreError> {
        let key = (user_id.to_string(), skill_domain.to_string());
        Ok(self.proficiencies.read().get(&key).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SkillProficiency>, StoreError> {
        let mut records: Vec<SkillProficiency> = self
            .proficiencies
            .read()
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.skill_domain.cmp(&b.skill_domain));
        Ok(records)
    }

    async fn upsert(&self, proficiency: SkillProficiency) -> Result<(), StoreError> {
        if !(0.0..=1.0).contains(&proficiency.proficiency) {
            return Err(StoreError::InvalidRecord(format!(
                "proficiency {} outside [0, 1]",
                proficiency.proficiency
            )));
        }
        let key = (proficiency.user_id.clone(), proficiency.skill_domain.clone());
        self.proficiencies.write().insert(key, proficiency);
        Ok(())
    }
}

#[async_trait]
impl LearnerProfileStore for InMemoryStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<LearnerProfile>, StoreError> {
        Ok(self.profiles.read().get(user_id).cloned())
    }

    async fn upsert_profile(&self, profile: LearnerProfile) -> Result<(), StoreError> {
        self.profiles.write().insert(profile.user_id.clone(), profile);
        Ok(())
    }
}

#[async_trait]
impl ModelArtifactStore for InMemoryStore {
    async fn save(&self, record: &TrainedModel, blob: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.artifacts.lock();
        let versions = guard.entry(record.name.clone()).or_default();
        for stored in versions.iter_mut() {
            stored.record.is_active = false;
        }
        let mut record = record.clone();
        record.is_active = true;
        versions.push(StoredArtifact {
            record,
            blob: blob.to_vec(),
        });
        Ok(())
    }

    async fn load_active(
        &self,
        name: &str,
    ) -> Result<Option<(Vec<u8>, TrainedModel)>, StoreError> {
        let guard = self.artifacts.lock();
        let active = guard.get(name).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|stored| stored.record.is_active)
                .map(|stored| (stored.blob.clone(), stored.record.clone()))
        });
        Ok(active)
    }

    async fn list(&self, name: &str) -> Result<Vec<TrainedModel>, StoreError> {
        let guard = self.artifacts.lock();
        Ok(guard
            .get(name)
            .map(|versions| versions.iter().rev().map(|s| s.record.clone()).collect())
            .unwrap_or_default())
    }
}
