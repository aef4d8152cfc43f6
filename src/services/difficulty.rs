use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::explainability::{rank_importances, FeatureImportance};
use super::{
    log_fallback, round_half_up, FallbackReason, ModelSlot, ModelSnapshot, PredictionError,
    PredictionResult, PredictionSource,
};
use crate::config::{FlowParams, GbtParams};
use crate::ml::{fit_regressor, GradientBoostedRegressor, RegressionMetrics, TrainOptions, TrainingError};
use crate::modeling::{Feature, FeatureVector, FeatureVectorBuilder, FEATURE_DIM};
use crate::registry::{ModelArtifact, ModelMetadata, ModelRegistry, RegistryError, DIFFICULTY_MODEL_NAME};
use crate::types::{TrainedModel, DEFAULT_DIFFICULTY, MAX_DIFFICULTY, MIN_DIFFICULTY};

/// Where a recent success rate sits relative to the flow target band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowZone {
    TooHard,
    InZone,
    TooEasy,
}

impl FlowZone {
    pub fn classify(success_rate: f64, flow: &FlowParams) -> Self {
        if success_rate > flow.upper_bound() {
            Self::TooEasy
        } else if success_rate < flow.lower_bound() {
            Self::TooHard
        } else {
            Self::InZone
        }
    }
}

/// Nudges a continuous difficulty one step up when the learner succeeds too
/// often and one step down when they fail too often.
pub fn apply_flow_adjustment(raw: f64, success_rate: f64, flow: &FlowParams) -> f64 {
    match FlowZone::classify(success_rate, flow) {
        FlowZone::TooEasy => raw + flow.step,
        FlowZone::TooHard => raw - flow.step,
        FlowZone::InZone => raw,
    }
}

/// Clips to the difficulty scale and rounds half up.
pub fn discretize_difficulty(value: f64) -> u8 {
    let min = f64::from(MIN_DIFFICULTY);
    let max = f64::from(MAX_DIFFICULTY);
    round_half_up(value.clamp(min, max)) as u8
}

/// Rule-based reasons in a fixed order. The success band is only reported
/// when the flow adjustment was applied.
pub fn difficulty_reasons(features: &FeatureVector, success_rate: Option<f64>) -> Vec<String> {
    let mut reasons = Vec::new();

    if let Some(rate) = success_rate {
        if rate > 0.85 {
            reasons.push("You are doing very well (85%+)".to_string());
        } else if rate > 0.70 {
            reasons.push("You are doing well (70%+)".to_string());
        } else if rate < 0.55 {
            reasons.push("This is a bit hard for you".to_string());
        }
    }

    let trend = features.get(Feature::Trend7d);
    if trend > 0.1 {
        reasons.push("You are improving".to_string());
    } else if trend < -0.1 {
        reasons.push("Some difficulty recently".to_string());
    }

    if features.get(Feature::FatigueLevel) > 0.3 {
        reasons.push("You seem a little tired".to_string());
    }

    if features.get(Feature::PrerequisiteMastery) > 0.8 {
        reasons.push("Prerequisites well mastered".to_string());
    }

    let streak = features.get(Feature::Streak);
    if streak >= 3.0 {
        reasons.push(format!("Streak of {} successes!", streak as u32));
    }

    reasons
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyExplanation {
    pub difficulty: u8,
    pub source: PredictionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_prediction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_prediction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_zone: Option<FlowZone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
}

impl DifficultyExplanation {
    pub fn fallback(reason: FallbackReason) -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            source: PredictionSource::Default,
            raw_prediction: None,
            adjusted_prediction: None,
            recent_success_rate: None,
            flow_zone: None,
            model_version: None,
            reasons: vec![reason.message().to_string()],
            fallback_reason: Some(reason),
        }
    }
}

/// A model-backed recommendation together with the inputs that produced it.
#[derive(Debug, Clone)]
pub struct DifficultyOutcome {
    pub difficulty: u8,
    pub explanation: DifficultyExplanation,
    pub features: FeatureVector,
    pub snapshot: Arc<ModelSnapshot<GradientBoostedRegressor>>,
}

pub struct DifficultyRegressor {
    builder: FeatureVectorBuilder,
    registry: Arc<ModelRegistry>,
    slot: ModelSlot<GradientBoostedRegressor>,
    flow: FlowParams,
    params: GbtParams,
}

impl DifficultyRegressor {
    pub fn new(
        builder: FeatureVectorBuilder,
        registry: Arc<ModelRegistry>,
        flow: FlowParams,
        params: GbtParams,
    ) -> Self {
        Self {
            builder,
            registry,
            slot: ModelSlot::new(DIFFICULTY_MODEL_NAME),
            flow,
            params,
        }
    }

    pub fn model_name(&self) -> &'static str {
        self.slot.name()
    }

    pub fn flow(&self) -> &FlowParams {
        &self.flow
    }

    pub async fn reload(&self) -> PredictionResult<Option<TrainedModel>> {
        self.slot.reload(&self.registry).await
    }

    pub async fn snapshot(&self) -> Option<Arc<ModelSnapshot<GradientBoostedRegressor>>> {
        self.slot.snapshot().await
    }

    /// Fits a candidate model on canonical feature rows. Nothing is registered.
    pub fn train(
        &self,
        x: &[Vec<f64>],
        y: &[f64],
        options: &TrainOptions,
    ) -> Result<(GradientBoostedRegressor, RegressionMetrics), TrainingError> {
        fit_regressor(x, y, FEATURE_DIM, options, &self.params)
    }

    /// Trains, registers the result under `version` and swaps it in. A failed
    /// fit leaves the active model untouched.
    pub async fn train_and_register(
        &self,
        x: &[Vec<f64>],
        y: &[f64],
        version: &str,
        options: &TrainOptions,
    ) -> Result<(TrainedModel, RegressionMetrics), TrainingError> {
        let (model, metrics) = self.train(x, y, options)?;
        let metadata = ModelMetadata {
            hyperparameters: serde_json::to_value(&self.params).map_err(RegistryError::from)?,
            metrics: serde_json::to_value(&metrics).map_err(RegistryError::from)?,
        };
        let record = self
            .registry
            .register(
                DIFFICULTY_MODEL_NAME,
                version,
                &ModelArtifact::GradientBoosting(model),
                metadata,
            )
            .await?;

        if let Err(err) = self.reload().await {
            tracing::warn!(error = %err, version, "registered difficulty model could not be loaded");
        }
        Ok((record, metrics))
    }

    pub async fn evaluate(
        &self,
        user_id: &str,
        skill_domain: &str,
        apply_flow: bool,
    ) -> PredictionResult<DifficultyOutcome> {
        let snapshot = self.slot.require().await?;
        let features = self.builder.extract_features(user_id, skill_domain).await;

        let raw = snapshot.model.predict(features.as_slice())?;
        if !raw.is_finite() {
            return Err(PredictionError::InvalidOutput);
        }

        let success_rate = features.get(Feature::RecentSuccessRate);
        let (adjusted, zone) = if apply_flow {
            (
                apply_flow_adjustment(raw, success_rate, &self.flow),
                Some(FlowZone::classify(success_rate, &self.flow)),
            )
        } else {
            (raw, None)
        };
        let difficulty = discretize_difficulty(adjusted);
        let reported_rate = apply_flow.then_some(success_rate);

        let explanation = DifficultyExplanation {
            difficulty,
            source: PredictionSource::MlModel,
            raw_prediction: Some(raw),
            adjusted_prediction: Some(adjusted),
            recent_success_rate: reported_rate,
            flow_zone: zone,
            model_version: Some(snapshot.record.version.clone()),
            reasons: difficulty_reasons(&features, reported_rate),
            fallback_reason: None,
        };

        Ok(DifficultyOutcome {
            difficulty,
            explanation,
            features,
            snapshot,
        })
    }

    pub async fn try_predict(
        &self,
        user_id: &str,
        skill_domain: &str,
        apply_flow: bool,
    ) -> PredictionResult<(u8, DifficultyExplanation)> {
        let outcome = self.evaluate(user_id, skill_domain, apply_flow).await?;
        Ok((outcome.difficulty, outcome.explanation))
    }

    /// Never fails: any error yields the default difficulty.
    pub async fn predict(
        &self,
        user_id: &str,
        skill_domain: &str,
        apply_flow: bool,
    ) -> (u8, DifficultyExplanation) {
        match self.try_predict(user_id, skill_domain, apply_flow).await {
            Ok(result) => result,
            Err(err) => {
                let reason = log_fallback(&err, user_id, skill_domain);
                (DEFAULT_DIFFICULTY, DifficultyExplanation::fallback(reason))
            }
        }
    }

    pub async fn feature_importances(&self) -> PredictionResult<Vec<FeatureImportance>> {
        let snapshot = self.slot.require().await?;
        Ok(rank_importances(&snapshot.model.feature_importances()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureParams;
    use crate::db::{AttemptHistoryStore, DataSources, InMemoryStore};
    use crate::types::ExerciseAttempt;
    use chrono::{Duration, Utc};

    fn regressor(store: Arc<InMemoryStore>, registry: Arc<ModelRegistry>) -> DifficultyRegressor {
        let builder = FeatureVectorBuilder::new(DataSources::from_store(store), FeatureParams::default());
        let params = GbtParams {
            n_estimators: 20,
            max_depth: 3,
            ..GbtParams::default()
        };
        DifficultyRegressor::new(builder, registry, FlowParams::default(), params)
    }

    fn training_rows(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let rate = (i % 11) as f64 / 10.0;
            let mut row = vec![0.0; FEATURE_DIM];
            row[Feature::RecentSuccessRate.index()] = rate;
            row[Feature::TotalExercises.index()] = (i % 7) as f64;
            x.push(row);
            y.push(1.0 + 4.0 * rate);
        }
        (x, y)
    }

    #[test]
    fn test_flow_adjustment_bands() {
        let flow = FlowParams::default();
        assert_eq!(apply_flow_adjustment(2.0, 0.9, &flow), 2.5);
        assert_eq!(apply_flow_adjustment(2.0, 0.5, &flow), 1.5);
        assert_eq!(apply_flow_adjustment(2.0, 0.7, &flow), 2.0);
        assert_eq!(apply_flow_adjustment(2.0, 0.8, &flow), 2.0);
        assert_eq!(FlowZone::classify(0.95, &flow), FlowZone::TooEasy);
    }

    #[test]
    fn test_discretize_clips_and_rounds_half_up() {
        assert_eq!(discretize_difficulty(-4.0), 1);
        assert_eq!(discretize_difficulty(2.5), 3);
        assert_eq!(discretize_difficulty(2.49), 2);
        assert_eq!(discretize_difficulty(4.6), 5);
        assert_eq!(discretize_difficulty(9.0), 5);
    }

    #[test]
    fn test_reasons_follow_fixed_order() {
        let features = FeatureVector::zeros()
            .with(Feature::Trend7d, 0.2)
            .with(Feature::FatigueLevel, 0.4)
            .with(Feature::PrerequisiteMastery, 0.9)
            .with(Feature::Streak, 4.0);
        let reasons = difficulty_reasons(&features, Some(0.9));
        assert_eq!(
            reasons,
            vec![
                "You are doing very well (85%+)",
                "You are improving",
                "You seem a little tired",
                "Prerequisites well mastered",
                "Streak of 4 successes!",
            ]
        );
        assert!(difficulty_reasons(&FeatureVector::zeros(), None).is_empty());
        assert_eq!(
            difficulty_reasons(&FeatureVector::zeros(), Some(0.3)),
            vec!["This is a bit hard for you"]
        );
    }

    #[tokio::test]
    async fn test_no_model_falls_back_to_default() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ModelRegistry::in_memory());
        let service = regressor(store, registry);

        let (difficulty, explanation) = service.predict("u1", "addition", true).await;
        assert_eq!(difficulty, 3);
        assert_eq!(explanation.source, PredictionSource::Default);
        assert_eq!(explanation.fallback_reason, Some(FallbackReason::NoModelAvailable));
        assert!(matches!(
            service.try_predict("u1", "addition", true).await,
            Err(PredictionError::NoModelAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_trained_model_applies_flow_step() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ModelRegistry::in_memory());
        let service = regressor(store.clone(), registry);

        let now = Utc::now();
        for i in 0..10 {
            let attempt = ExerciseAttempt::new("u1", "addition", 3, i != 4, now - Duration::minutes(i));
            store.append(attempt).await.unwrap();
        }

        let (x, y) = training_rows(60);
        let (record, metrics) = service
            .train_and_register(&x, &y, "v1", &TrainOptions::default())
            .await
            .unwrap();
        assert_eq!(record.name, DIFFICULTY_MODEL_NAME);
        assert_eq!(metrics.n_features, FEATURE_DIM);

        let (difficulty, explanation) = service.predict("u1", "addition", true).await;
        assert!((1..=5).contains(&difficulty));
        assert_eq!(explanation.source, PredictionSource::MlModel);
        assert_eq!(explanation.model_version.as_deref(), Some("v1"));
        assert_eq!(explanation.flow_zone, Some(FlowZone::TooEasy));
        let raw = explanation.raw_prediction.unwrap();
        let adjusted = explanation.adjusted_prediction.unwrap();
        assert!((adjusted - raw - 0.5).abs() < 1e-12);

        let (_, unadjusted) = service.predict("u1", "addition", false).await;
        assert_eq!(unadjusted.adjusted_prediction, Some(raw));
        assert!(unadjusted.flow_zone.is_none());
    }

    #[tokio::test]
    async fn test_failed_training_keeps_active_model() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ModelRegistry::in_memory());
        let service = regressor(store, registry.clone());

        let (x, y) = training_rows(40);
        service
            .train_and_register(&x, &y, "v1", &TrainOptions::default())
            .await
            .unwrap();

        let constant = vec![2.0; x.len()];
        let err = service
            .train_and_register(&x, &constant, "v2", &TrainOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientTrainingData(_)));

        let active = service.snapshot().await.unwrap();
        assert_eq!(active.record.version, "v1");
        assert_eq!(registry.history(DIFFICULTY_MODEL_NAME).await.unwrap().len(), 1);

        let ranked = service.feature_importances().await.unwrap();
        assert_eq!(ranked.len(), FEATURE_DIM);
        assert_eq!(ranked[0].feature, Feature::RecentSuccessRate.name());
    }
}
