//! The engine facade: one entry point per exposed operation, each with an
//! optional deadline and a documented fallback.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::db::{DataSources, InMemoryStore, StoreError};
use crate::ml::{
    ClassificationMetrics, GradientBoostedRegressor, RandomForestClassifier, RegressionMetrics,
    TrainOptions, TrainingError,
};
use crate::modeling::{Clock, FeatureVector, FeatureVectorBuilder};
use crate::registry::ModelRegistry;
use crate::services::explainability::{detect_bias, fairness_audit};
use crate::services::{
    log_fallback, AtRiskLearner, BiasReport, Demographics, DifficultyExplanation,
    DifficultyRegressor, ExplanationEngine, FairnessReport, FeatureImportance, MasteryTimeline,
    ModelSnapshot, PredictionContext, PredictionError, PredictionExplanation, PredictionResult,
    SuccessClassifier, SuccessExplanation, SuccessForecast,
};
use crate::types::{ExerciseAttempt, TrainedModel, DEFAULT_DIFFICULTY};

async fn within<T, F>(deadline: Option<Duration>, fut: F) -> PredictionResult<T>
where
    F: Future<Output = PredictionResult<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PredictionError::DeadlineExceeded(limit))?,
        None => fut.await,
    }
}

pub struct AdaptiveEngine {
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
    builder: FeatureVectorBuilder,
    difficulty: DifficultyRegressor,
    success: SuccessClassifier,
    explainer: ExplanationEngine,
}

impl AdaptiveEngine {
    pub fn new(sources: DataSources, registry: Arc<ModelRegistry>, config: EngineConfig) -> Self {
        let builder = FeatureVectorBuilder::new(sources, config.features.clone());
        Self::with_builder(builder, registry, config)
    }

    pub fn with_builder(
        builder: FeatureVectorBuilder,
        registry: Arc<ModelRegistry>,
        config: EngineConfig,
    ) -> Self {
        let difficulty = DifficultyRegressor::new(
            builder.clone(),
            Arc::clone(&registry),
            config.flow.clone(),
            config.difficulty_model.clone(),
        );
        let success = SuccessClassifier::new(
            builder.clone(),
            Arc::clone(&registry),
            config.success_model.clone(),
            config.risk.clone(),
            config.timeline.clone(),
            config.forecast.clone(),
        );

        Self {
            config,
            registry,
            builder,
            difficulty,
            success,
            explainer: ExplanationEngine::default(),
        }
    }

    /// Engine over a single in-memory store that also holds the model artifacts.
    pub fn in_memory(store: Arc<InMemoryStore>, config: EngineConfig) -> Self {
        let registry = Arc::new(ModelRegistry::new(store.clone()));
        Self::new(DataSources::from_store(store), registry, config)
    }

    /// Replaces the wall clock used for feature windows and projected dates.
    pub fn with_clock(self, clock: Clock) -> Self {
        let builder = self.builder.clone().with_clock(clock);
        Self::with_builder(builder, self.registry, self.config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn difficulty(&self) -> &DifficultyRegressor {
        &self.difficulty
    }

    pub fn success(&self) -> &SuccessClassifier {
        &self.success
    }

    /// Loads both active models. Either one missing is not an error.
    pub async fn reload_models(&self) -> PredictionResult<()> {
        let difficulty = self.difficulty.reload().await?;
        let success = self.success.reload().await?;
        tracing::info!(
            difficulty_version = difficulty.as_ref().map(|m| m.version.as_str()),
            success_version = success.as_ref().map(|m| m.version.as_str()),
            "engine models reloaded"
        );
        Ok(())
    }

    /// Re-loads the affected predictor whenever a model is registered. The
    /// task ends when the engine is dropped or the registry closes.
    pub fn spawn_reload_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let engine: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let reload_all = match events.recv().await {
                    Ok(event) => {
                        let Some(engine) = engine.upgrade() else { break };
                        let result = if event.name == engine.difficulty.model_name() {
                            engine.difficulty.reload().await.map(|_| ())
                        } else if event.name == engine.success.model_name() {
                            engine.success.reload().await.map(|_| ())
                        } else {
                            Ok(())
                        };
                        if let Err(err) = result {
                            tracing::warn!(error = %err, model = %event.name, version = %event.version, "reload after registration failed");
                        }
                        false
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "registration listener lagged");
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("registration channel closed, stopping reload listener");
                        break;
                    }
                };

                if reload_all {
                    let Some(engine) = engine.upgrade() else { break };
                    if let Err(err) = engine.reload_models().await {
                        tracing::warn!(error = %err, "full reload after lag failed");
                    }
                }
            }
        })
    }

    pub async fn record_attempt(&self, attempt: ExerciseAttempt) -> Result<(), StoreError> {
        self.builder.sources().attempts.append(attempt).await
    }

    pub async fn extract_features(&self, user_id: &str, skill_domain: &str) -> FeatureVector {
        self.builder.extract_features(user_id, skill_domain).await
    }

    pub async fn recommend_difficulty(&self, user_id: &str, skill_domain: &str) -> (u8, DifficultyExplanation) {
        self.recommend_difficulty_with_deadline(user_id, skill_domain, self.config.inference.deadline())
            .await
    }

    pub async fn recommend_difficulty_with_deadline(
        &self,
        user_id: &str,
        skill_domain: &str,
        deadline: Option<Duration>,
    ) -> (u8, DifficultyExplanation) {
        let attempt = self.difficulty.try_predict(user_id, skill_domain, true);
        match within(deadline, attempt).await {
            Ok(result) => result,
            Err(err) => {
                let reason = log_fallback(&err, user_id, skill_domain);
                (DEFAULT_DIFFICULTY, DifficultyExplanation::fallback(reason))
            }
        }
    }

    pub async fn success_probability(&self, user_id: &str, skill_domain: &str) -> (f64, SuccessExplanation) {
        self.success_probability_with_deadline(user_id, skill_domain, self.config.inference.deadline())
            .await
    }

    pub async fn success_probability_with_deadline(
        &self,
        user_id: &str,
        skill_domain: &str,
        deadline: Option<Duration>,
    ) -> (f64, SuccessExplanation) {
        let attempt = self.success.try_predict_success_probability(user_id, skill_domain);
        match within(deadline, attempt).await {
            Ok(result) => result,
            Err(err) => {
                let reason = log_fallback(&err, user_id, skill_domain);
                let explanation = SuccessExplanation::fallback(reason);
                (explanation.success_probability, explanation)
            }
        }
    }

    /// `threshold` defaults to the configured at-risk threshold. A scan that
    /// overruns the deadline yields an empty list.
    pub async fn at_risk(
        &self,
        user_ids: &[String],
        skill_domain: &str,
        threshold: Option<f64>,
    ) -> Vec<AtRiskLearner> {
        let threshold = threshold.unwrap_or_else(|| self.success.default_threshold());
        let scan = async {
            Ok::<_, PredictionError>(self
                .success
                .identify_at_risk_learners(user_ids, skill_domain, threshold)
                .await)
        };
        match within(self.config.inference.deadline(), scan).await {
            Ok(learners) => learners,
            Err(err) => {
                tracing::warn!(error = %err, skill_domain, learners = user_ids.len(), "at-risk scan abandoned");
                Vec::new()
            }
        }
    }

    pub async fn mastery_timeline(
        &self,
        user_id: &str,
        skill_domain: &str,
        target: Option<f64>,
    ) -> PredictionResult<MasteryTimeline> {
        let target = target.unwrap_or_else(|| self.success.default_target());
        within(
            self.config.inference.deadline(),
            self.success.predict_mastery_timeline(user_id, skill_domain, target),
        )
        .await
    }

    pub async fn forecast(
        &self,
        user_id: &str,
        skill_domain: &str,
        days_ahead: u32,
    ) -> PredictionResult<SuccessForecast> {
        self.forecast_with_deadline(user_id, skill_domain, days_ahead, self.config.inference.deadline())
            .await
    }

    /// A missing model still yields a forecast from the default probability;
    /// only an overrun deadline is an error.
    pub async fn forecast_with_deadline(
        &self,
        user_id: &str,
        skill_domain: &str,
        days_ahead: u32,
        deadline: Option<Duration>,
    ) -> PredictionResult<SuccessForecast> {
        let projection = async {
            Ok::<_, PredictionError>(
                self.success
                    .forecast_success(user_id, skill_domain, days_ahead)
                    .await,
            )
        };
        within(deadline, projection).await
    }

    /// Recommendation plus a per-feature attribution of the raw model output,
    /// both computed from the same model snapshot and feature vector.
    pub async fn explain_difficulty(
        &self,
        user_id: &str,
        skill_domain: &str,
        top_n: Option<usize>,
    ) -> PredictionResult<(DifficultyExplanation, PredictionExplanation)> {
        let outcome = self.difficulty.evaluate(user_id, skill_domain, true).await?;
        let attribution = self.explainer.explain(
            PredictionContext::Difficulty,
            &outcome.snapshot.model,
            &outcome.features,
            top_n,
        )?;
        Ok((outcome.explanation, attribution))
    }

    pub async fn explain_success(
        &self,
        user_id: &str,
        skill_domain: &str,
        top_n: Option<usize>,
    ) -> PredictionResult<(SuccessExplanation, PredictionExplanation)> {
        let outcome = self.success.evaluate(user_id, skill_domain).await?;
        let attribution = self.explainer.explain(
            PredictionContext::Success,
            &outcome.snapshot.model,
            &outcome.features,
            top_n,
        )?;
        Ok((outcome.explanation, attribution))
    }

    pub async fn fairness_audit(
        &self,
        context: PredictionContext,
        test_set: &[Vec<f64>],
        demographics: &[Demographics],
    ) -> PredictionResult<FairnessReport> {
        let report = match context {
            PredictionContext::Difficulty => {
                let snapshot = self.require_difficulty().await?;
                fairness_audit(test_set, demographics, &snapshot.model)?
            }
            PredictionContext::Success => {
                let snapshot = self.require_success().await?;
                fairness_audit(test_set, demographics, &snapshot.model)?
            }
        };
        Ok(report)
    }

    /// Checks the active models' importances for the given feature indices.
    /// Models that are not loaded are skipped.
    pub async fn detect_bias(&self, sensitive_features: &[usize]) -> BiasReport {
        let mut models = Vec::with_capacity(2);
        if let Some(snapshot) = self.difficulty.snapshot().await {
            models.push((PredictionContext::Difficulty, snapshot.model.feature_importances()));
        }
        if let Some(snapshot) = self.success.snapshot().await {
            models.push((PredictionContext::Success, snapshot.model.feature_importances()));
        }
        detect_bias(&models, sensitive_features)
    }

    pub async fn feature_importances(&self, context: PredictionContext) -> PredictionResult<Vec<FeatureImportance>> {
        match context {
            PredictionContext::Difficulty => self.difficulty.feature_importances().await,
            PredictionContext::Success => self.success.feature_importances().await,
        }
    }

    pub async fn train_difficulty_model(
        &self,
        x: &[Vec<f64>],
        y: &[f64],
        version: &str,
        options: &TrainOptions,
    ) -> Result<(TrainedModel, RegressionMetrics), TrainingError> {
        self.difficulty.train_and_register(x, y, version, options).await
    }

    pub async fn train_success_model(
        &self,
        x: &[Vec<f64>],
        y: &[bool],
        version: &str,
        options: &TrainOptions,
    ) -> Result<(TrainedModel, ClassificationMetrics), TrainingError> {
        self.success.train_and_register(x, y, version, options).await
    }

    async fn require_difficulty(
        &self,
    ) -> PredictionResult<Arc<ModelSnapshot<GradientBoostedRegressor>>> {
        self.difficulty
            .snapshot()
            .await
            .ok_or_else(|| PredictionError::NoModelAvailable(self.difficulty.model_name().to_string()))
    }

    async fn require_success(
        &self,
    ) -> PredictionResult<Arc<ModelSnapshot<RandomForestClassifier>>> {
        self.success
            .snapshot()
            .await
            .ok_or_else(|| PredictionError::NoModelAvailable(self.success.model_name().to_string()))
    }
}
