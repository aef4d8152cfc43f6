//! Prediction services built on the registry's active models.
//!
//! Each predictor keeps an `Arc` snapshot of its model behind a
//! `tokio::sync::RwLock`. Inference clones the snapshot out and never holds
//! the lock across feature extraction, so a concurrent `reload` only affects
//! requests that start after it.

pub mod difficulty;
pub mod explainability;
pub mod success;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::db::StoreError;
use crate::ml::{GradientBoostedRegressor, RandomForestClassifier, WidthMismatch};
use crate::registry::{ModelArtifact, ModelRegistry, RegistryError};
use crate::types::{ModelKind, TrainedModel};

pub use difficulty::{DifficultyExplanation, DifficultyRegressor, FlowZone};
pub use explainability::{
    AuditError, BiasReport, Demographics, Direction, ExplanationEngine, Explainer,
    FairnessAssessment, FairnessReport, FeatureContribution, FeatureImportance, PredictionContext,
    PredictionExplanation,
};
pub use success::{
    AtRiskLearner, ConfidenceLevel, DailyForecast, MasteryTimeline, RiskLevel, SuccessClassifier,
    SuccessExplanation, SuccessForecast, TrendDirection,
};

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("no active model named {0}")]
    NoModelAvailable(String),
    #[error("prediction exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("feature width mismatch: {0}")]
    FeatureWidthMismatch(#[from] WidthMismatch),
    #[error("model produced a non-finite output")]
    InvalidOutput,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("fairness audit failed: {0}")]
    Audit(#[from] AuditError),
}

pub type PredictionResult<T> = Result<T, PredictionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    MlModel,
    Default,
}

/// Why a public `predict*` call returned its fallback value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NoModelAvailable,
    DeadlineExceeded,
    ModelError,
}

impl FallbackReason {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoModelAvailable => "No ML model available",
            Self::DeadlineExceeded => "Prediction deadline exceeded",
            Self::ModelError => "Model prediction failed",
        }
    }
}

impl From<&PredictionError> for FallbackReason {
    fn from(err: &PredictionError) -> Self {
        match err {
            PredictionError::NoModelAvailable(_)
            | PredictionError::Registry(RegistryError::NotFound(_)) => Self::NoModelAvailable,
            PredictionError::DeadlineExceeded(_) => Self::DeadlineExceeded,
            _ => Self::ModelError,
        }
    }
}

/// Logs the error unless it is the expected "nothing trained yet" case.
pub(crate) fn log_fallback(err: &PredictionError, user_id: &str, skill_domain: &str) -> FallbackReason {
    let reason = FallbackReason::from(err);
    if reason == FallbackReason::NoModelAvailable {
        tracing::debug!(user_id, skill_domain, "no active model, using fallback");
    } else {
        tracing::warn!(error = %err, user_id, skill_domain, "prediction failed, using fallback");
    }
    reason
}

/// A model family that can be pulled out of a registry artifact.
pub trait FromArtifact: Sized + Send + Sync + 'static {
    const KIND: ModelKind;

    fn from_artifact(artifact: ModelArtifact) -> Option<Self>;
}

impl FromArtifact for GradientBoostedRegressor {
    const KIND: ModelKind = ModelKind::GradientBoosting;

    fn from_artifact(artifact: ModelArtifact) -> Option<Self> {
        match artifact {
            ModelArtifact::GradientBoosting(model) => Some(model),
            _ => None,
        }
    }
}

impl FromArtifact for RandomForestClassifier {
    const KIND: ModelKind = ModelKind::RandomForest;

    fn from_artifact(artifact: ModelArtifact) -> Option<Self> {
        match artifact {
            ModelArtifact::RandomForest(model) => Some(model),
            _ => None,
        }
    }
}

/// The exact model and registry record a prediction was made with.
#[derive(Debug)]
pub struct ModelSnapshot<M> {
    pub model: M,
    pub record: TrainedModel,
}

pub(crate) struct ModelSlot<M> {
    name: &'static str,
    current: RwLock<Option<Arc<ModelSnapshot<M>>>>,
}

impl<M: FromArtifact> ModelSlot<M> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            current: RwLock::new(None),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Replaces the snapshot with the registry's active version. A missing
    /// model clears the slot; any other failure leaves it untouched.
    pub(crate) async fn reload(&self, registry: &ModelRegistry) -> PredictionResult<Option<TrainedModel>> {
        match registry.load_kind(self.name, M::KIND).await {
            Ok((artifact, record)) => {
                let found = artifact.kind();
                let model = M::from_artifact(artifact).ok_or_else(|| RegistryError::KindMismatch {
                    name: self.name.to_string(),
                    expected: M::KIND,
                    found,
                })?;
                tracing::info!(model = self.name, version = %record.version, "model snapshot loaded");
                let snapshot = Arc::new(ModelSnapshot {
                    model,
                    record: record.clone(),
                });
                *self.current.write().await = Some(snapshot);
                Ok(Some(record))
            }
            Err(RegistryError::NotFound(_)) => {
                *self.current.write().await = None;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn snapshot(&self) -> Option<Arc<ModelSnapshot<M>>> {
        self.current.read().await.clone()
    }

    pub(crate) async fn require(&self) -> PredictionResult<Arc<ModelSnapshot<M>>> {
        self.snapshot()
            .await
            .ok_or_else(|| PredictionError::NoModelAvailable(self.name.to_string()))
    }
}

/// Half-up rounding, so `x.5` always goes up.
pub(crate) fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}
