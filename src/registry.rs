//! Versioned storage and activation of trained models.
//!
//! Registration is the only write path. It delegates the deactivate-then-insert
//! swap to the artifact store, which performs it atomically, and then
//! broadcasts a [`RegistrationEvent`] so holders of a cached snapshot know to
//! re-load.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::{InMemoryStore, ModelArtifactStore, StoreError};
use crate::ml::{GradientBoostedRegressor, RandomForestClassifier};
use crate::types::{ModelKind, TrainedModel};

pub const DIFFICULTY_MODEL_NAME: &str = "difficulty_regressor";
pub const SUCCESS_MODEL_NAME: &str = "success_classifier";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no active model named {0}")]
    NotFound(String),
    #[error("model {name} is a {found} artifact, expected {expected}")]
    KindMismatch {
        name: String,
        expected: ModelKind,
        found: ModelKind,
    },
    #[error("invalid registration: {0}")]
    Invalid(String),
    #[error("artifact encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", content = "model", rename_all = "snake_case")]
pub enum ModelArtifact {
    GradientBoosting(GradientBoostedRegressor),
    RandomForest(RandomForestClassifier),
}

impl ModelArtifact {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::GradientBoosting(_) => ModelKind::GradientBoosting,
            Self::RandomForest(_) => ModelKind::RandomForest,
        }
    }

    pub fn n_features(&self) -> usize {
        match self {
            Self::GradientBoosting(model) => model.n_features(),
            Self::RandomForest(model) => model.n_features(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(blob: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(blob)
    }
}

/// Descriptive fields recorded alongside an artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub hyperparameters: serde_json::Value,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEvent {
    pub name: String,
    pub version: String,
    pub model_id: String,
}

pub struct ModelRegistry {
    store: Arc<dyn ModelArtifactStore>,
    events: broadcast::Sender<RegistrationEvent>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ModelArtifactStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { store, events }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.events.subscribe()
    }

    pub async fn register(
        &self,
        name: &str,
        version: &str,
        artifact: &ModelArtifact,
        metadata: ModelMetadata,
    ) -> Result<TrainedModel, RegistryError> {
        if name.trim().is_empty() || version.trim().is_empty() {
            return Err(RegistryError::Invalid(
                "model name and version must be non-empty".to_string(),
            ));
        }

        let blob = artifact.encode()?;
        let record = TrainedModel {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            version: version.to_string(),
            model_type: artifact.kind(),
            hyperparameters: metadata.hyperparameters,
            training_date: Utc::now(),
            metrics: metadata.metrics,
            artifact_reference: format!("{name}/{version}"),
            is_active: true,
        };

        self.store.save(&record, &blob).await?;
        tracing::info!(
            model = name,
            version,
            kind = %record.model_type,
            bytes = blob.len(),
            "model registered"
        );

        // no subscribers is fine
        let _ = self.events.send(RegistrationEvent {
            name: record.name.clone(),
            version: record.version.clone(),
            model_id: record.id.clone(),
        });

        Ok(record)
    }

    pub async fn load_active(&self, name: &str) -> Result<(ModelArtifact, TrainedModel), RegistryError> {
        let (blob, record) = self
            .store
            .load_active(name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let artifact = ModelArtifact::decode(&blob)?;
        if artifact.kind() != record.model_type {
            return Err(RegistryError::KindMismatch {
                name: name.to_string(),
                expected: record.model_type,
                found: artifact.kind(),
            });
        }
        Ok((artifact, record))
    }

    /// Active artifact for `name`, which must belong to the `expected` family.
    pub async fn load_kind(
        &self,
        name: &str,
        expected: ModelKind,
    ) -> Result<(ModelArtifact, TrainedModel), RegistryError> {
        let (artifact, record) = self.load_active(name).await?;
        if artifact.kind() != expected {
            return Err(RegistryError::KindMismatch {
                name: name.to_string(),
                expected,
                found: artifact.kind(),
            });
        }
        Ok((artifact, record))
    }

    /// Every version ever registered under `name`, newest first.
    pub async fn history(&self, name: &str) -> Result<Vec<TrainedModel>, RegistryError> {
        Ok(self.store.list(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForestParams, GbtParams};

    fn tiny_regressor() -> ModelArtifact {
        let x: Vec<Vec<f64>> = (0..12).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..12).map(|i| (i % 4) as f64).collect();
        let params = GbtParams {
            n_estimators: 3,
            ..GbtParams::default()
        };
        ModelArtifact::GradientBoosting(GradientBoostedRegressor::fit(&x, &y, &params).unwrap())
    }

    fn tiny_classifier() -> ModelArtifact {
        let x: Vec<Vec<f64>> = (0..12).map(|i| vec![i as f64]).collect();
        let y: Vec<bool> = (0..12).map(|i| i > 5).collect();
        let params = ForestParams {
            n_estimators: 3,
            ..ForestParams::default()
        };
        ModelArtifact::RandomForest(RandomForestClassifier::fit(&x, &y, &params).unwrap())
    }

    #[tokio::test]
    async fn test_register_swaps_active_version() {
        let registry = ModelRegistry::in_memory();
        let v1 = registry
            .register("m", "v1", &tiny_regressor(), ModelMetadata::default())
            .await
            .unwrap();
        let v2 = registry
            .register("m", "v2", &tiny_regressor(), ModelMetadata::default())
            .await
            .unwrap();

        let (_, active) = registry.load_active("m").await.unwrap();
        assert_eq!(active.id, v2.id);

        let history = registry.history("m").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, "v2");
        assert!(history[0].is_active);
        assert_eq!(history[1].id, v1.id);
        assert!(!history[1].is_active);
    }

    #[tokio::test]
    async fn test_artifact_survives_round_trip() {
        let registry = ModelRegistry::in_memory();
        let artifact = tiny_classifier();
        registry
            .register("clf", "1", &artifact, ModelMetadata::default())
            .await
            .unwrap();
        let (loaded, record) = registry.load_active("clf").await.unwrap();
        assert_eq!(loaded, artifact);
        assert_eq!(record.model_type, ModelKind::RandomForest);
        assert_eq!(record.artifact_reference, "clf/1");
    }

    #[tokio::test]
    async fn test_missing_and_mismatched_models() {
        let registry = ModelRegistry::in_memory();
        assert!(matches!(
            registry.load_active("absent").await,
            Err(RegistryError::NotFound(_))
        ));

        registry
            .register("m", "v1", &tiny_classifier(), ModelMetadata::default())
            .await
            .unwrap();
        assert!(matches!(
            registry.load_kind("m", ModelKind::GradientBoosting).await,
            Err(RegistryError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_registration_is_broadcast() {
        let registry = ModelRegistry::in_memory();
        let mut events = registry.subscribe();
        let record = registry
            .register("m", "v7", &tiny_regressor(), ModelMetadata::default())
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "m");
        assert_eq!(event.version, "v7");
        assert_eq!(event.model_id, record.id);
    }

    #[tokio::test]
    async fn test_blank_version_rejected() {
        let registry = ModelRegistry::in_memory();
        assert!(matches!(
            registry
                .register("m", " ", &tiny_regressor(), ModelMetadata::default())
                .await,
            Err(RegistryError::Invalid(_))
        ));
    }
}
