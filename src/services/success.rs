use std::sync::Arc;

use chrono::{Days, NaiveDate};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::explainability::{rank_importances, FeatureImportance};
use super::{
    log_fallback, FallbackReason, ModelSlot, ModelSnapshot, PredictionError, PredictionResult,
    PredictionSource,
};
use crate::config::{ForecastParams, ForestParams, RiskParams, TimelineParams};
use crate::ml::{
    fit_classifier, ClassificationMetrics, RandomForestClassifier, TrainOptions, TrainingError,
};
use crate::modeling::{Feature, FeatureVector, FeatureVectorBuilder, FEATURE_DIM};
use crate::registry::{ModelArtifact, ModelMetadata, ModelRegistry, RegistryError, SUCCESS_MODEL_NAME};
use crate::types::TrainedModel;

pub const DEFAULT_SUCCESS_PROBABILITY: f64 = 0.5;

/// Per-day multiplier applied to forecast confidence.
pub const FORECAST_CONFIDENCE_DECAY: f64 = 0.95;

/// Quotients this close to a whole number count as that number.
const EXERCISE_COUNT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    /// Probabilities far from 0.5 are the ones the model is sure about.
    pub fn from_probability(p: f64) -> Self {
        if p > 0.8 || p < 0.2 {
            Self::High
        } else if p > 0.6 || p < 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

pub fn interpret_probability(p: f64) -> &'static str {
    if p >= 0.85 {
        "very likely to succeed"
    } else if p >= 0.70 {
        "likely to succeed"
    } else if p >= 0.50 {
        "even chances"
    } else if p >= 0.30 {
        "failure risk"
    } else {
        "high failure risk"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(risk: f64) -> Self {
        if risk >= 0.8 {
            Self::Critical
        } else if risk >= 0.6 {
            Self::High
        } else if risk >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn intervention(&self) -> &'static str {
        match self {
            Self::Critical => "Immediate intervention recommended - review the fundamentals",
            Self::High => "Close follow-up and reinforcement exercises",
            Self::Medium => "Review exercises advised",
            Self::Low => "Continue with regular follow-up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessExplanation {
    pub success_probability: f64,
    pub source: PredictionSource,
    pub confidence_level: ConfidenceLevel,
    pub interpretation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
}

impl SuccessExplanation {
    fn from_model(p: f64, version: &str) -> Self {
        Self {
            success_probability: p,
            source: PredictionSource::MlModel,
            confidence_level: ConfidenceLevel::from_probability(p),
            interpretation: interpret_probability(p).to_string(),
            model_version: Some(version.to_string()),
            fallback_reason: None,
        }
    }

    pub fn fallback(reason: FallbackReason) -> Self {
        let p = DEFAULT_SUCCESS_PROBABILITY;
        Self {
            success_probability: p,
            source: PredictionSource::Default,
            confidence_level: ConfidenceLevel::from_probability(p),
            interpretation: interpret_probability(p).to_string(),
            model_version: None,
            fallback_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuccessOutcome {
    pub probability: f64,
    pub explanation: SuccessExplanation,
    pub features: FeatureVector,
    pub snapshot: Arc<ModelSnapshot<RandomForestClassifier>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtRiskLearner {
    pub user_id: String,
    pub skill_domain: String,
    pub risk_score: f64,
    pub success_probability: f64,
    pub risk_level: RiskLevel,
    pub intervention: String,
}

/// Keeps learners whose risk `1 - p` reaches `threshold`, highest risk first.
/// Equal risks are ordered by user id.
pub fn rank_at_risk(scored: Vec<(String, f64)>, skill_domain: &str, threshold: f64) -> Vec<AtRiskLearner> {
    let mut learners: Vec<AtRiskLearner> = scored
        .into_iter()
        .filter_map(|(user_id, p)| {
            let risk_score = 1.0 - p;
            if risk_score < threshold {
                return None;
            }
            let risk_level = RiskLevel::from_score(risk_score);
            Some(AtRiskLearner {
                user_id,
                skill_domain: skill_domain.to_string(),
                risk_score,
                success_probability: p,
                risk_level,
                intervention: risk_level.intervention().to_string(),
            })
        })
        .collect();
    learners.sort_by(|a, b| {
        b.risk_score
            .total_cmp(&a.risk_score)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    learners
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MasteryTimeline {
    NoData,
    #[serde(rename_all = "camelCase")]
    Mastered {
        current_proficiency: f64,
        target_proficiency: f64,
    },
    #[serde(rename_all = "camelCase")]
    Predicted {
        current_proficiency: f64,
        target_proficiency: f64,
        exercises_needed: u64,
        estimated_days: u64,
        estimated_date: NaiveDate,
        learning_velocity: f64,
        confidence: ConfidenceLevel,
    },
}

impl MasteryTimeline {
    pub fn status(&self) -> &'static str {
        match self {
            Self::NoData => "no_data",
            Self::Mastered { .. } => "mastered",
            Self::Predicted { .. } => "predicted",
        }
    }
}

/// Whole exercises needed to cover `gap` at `velocity` per exercise. Gaps that
/// are an exact multiple of the velocity are not rounded up by float noise.
fn exercises_to_close(gap: f64, velocity: f64) -> u64 {
    let quotient = gap / velocity;
    let nearest = quotient.round();
    let quotient = if (quotient - nearest).abs() < EXERCISE_COUNT_TOLERANCE {
        nearest
    } else {
        quotient
    };
    quotient.ceil() as u64
}

/// Projects the exercises and days left until `target` at the given
/// per-exercise velocity.
pub fn project_timeline(
    current: f64,
    target: f64,
    velocity: f64,
    today: NaiveDate,
    params: &TimelineParams,
) -> MasteryTimeline {
    if current >= target {
        return MasteryTimeline::Mastered {
            current_proficiency: current,
            target_proficiency: target,
        };
    }

    let velocity = if velocity.is_finite() {
        velocity.max(params.min_velocity)
    } else {
        params.min_velocity
    };
    let exercises_needed = exercises_to_close(target - current, velocity);
    let estimated_days = exercises_needed / u64::from(params.exercises_per_day.max(1));
    let estimated_date = today
        .checked_add_days(Days::new(estimated_days))
        .unwrap_or(NaiveDate::MAX);

    MasteryTimeline::Predicted {
        current_proficiency: current,
        target_proficiency: target,
        exercises_needed,
        estimated_days,
        estimated_date,
        learning_velocity: velocity,
        confidence: ConfidenceLevel::Medium,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

impl TrendDirection {
    pub fn classify(trend_7d: f64, params: &ForecastParams) -> Self {
        if trend_7d > params.improving_threshold {
            Self::Improving
        } else if trend_7d < params.declining_threshold {
            Self::Declining
        } else {
            Self::Stable
        }
    }

    fn daily_change(&self, params: &ForecastParams) -> f64 {
        match self {
            Self::Improving => params.improving_daily_gain,
            Self::Stable => 0.0,
            Self::Declining => -params.declining_daily_loss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyForecast {
    pub day: u32,
    pub date: NaiveDate,
    pub projected_success_probability: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessForecast {
    pub current_success_probability: f64,
    pub source: PredictionSource,
    pub trend: TrendDirection,
    pub risk_level: RiskLevel,
    pub recommendation: String,
    pub forecast: Vec<DailyForecast>,
}

pub fn project_forecast(
    current: f64,
    trend: TrendDirection,
    days_ahead: u32,
    today: NaiveDate,
    params: &ForecastParams,
) -> Vec<DailyForecast> {
    let change = trend.daily_change(params);
    (1..=days_ahead)
        .map(|day| DailyForecast {
            day,
            date: today
                .checked_add_days(Days::new(u64::from(day)))
                .unwrap_or(NaiveDate::MAX),
            projected_success_probability: (current + change * f64::from(day)).clamp(0.0, 1.0),
            confidence: params.base_confidence * FORECAST_CONFIDENCE_DECAY.powi(day as i32),
        })
        .collect()
}

pub struct SuccessClassifier {
    builder: FeatureVectorBuilder,
    registry: Arc<ModelRegistry>,
    slot: ModelSlot<RandomForestClassifier>,
    params: ForestParams,
    risk: RiskParams,
    timeline: TimelineParams,
    forecast: ForecastParams,
}

impl SuccessClassifier {
    pub fn new(
        builder: FeatureVectorBuilder,
        registry: Arc<ModelRegistry>,
        params: ForestParams,
        risk: RiskParams,
        timeline: TimelineParams,
        forecast: ForecastParams,
    ) -> Self {
        Self {
            builder,
            registry,
            slot: ModelSlot::new(SUCCESS_MODEL_NAME),
            params,
            risk,
            timeline,
            forecast,
        }
    }

    pub fn model_name(&self) -> &'static str {
        self.slot.name()
    }

    pub async fn reload(&self) -> PredictionResult<Option<TrainedModel>> {
        self.slot.reload(&self.registry).await
    }

    pub async fn snapshot(&self) -> Option<Arc<ModelSnapshot<RandomForestClassifier>>> {
        self.slot.snapshot().await
    }

    pub fn train(
        &self,
        x: &[Vec<f64>],
        y: &[bool],
        options: &TrainOptions,
    ) -> Result<(RandomForestClassifier, ClassificationMetrics), TrainingError> {
        fit_classifier(x, y, FEATURE_DIM, options, &self.params)
    }

    pub async fn train_and_register(
        &self,
        x: &[Vec<f64>],
        y: &[bool],
        version: &str,
        options: &TrainOptions,
    ) -> Result<(TrainedModel, ClassificationMetrics), TrainingError> {
        let (model, metrics) = self.train(x, y, options)?;
        let metadata = ModelMetadata {
            hyperparameters: serde_json::to_value(&self.params).map_err(RegistryError::from)?,
            metrics: serde_json::to_value(&metrics).map_err(RegistryError::from)?,
        };
        let record = self
            .registry
            .register(
                SUCCESS_MODEL_NAME,
                version,
                &ModelArtifact::RandomForest(model),
                metadata,
            )
            .await?;

        if let Err(err) = self.reload().await {
            tracing::warn!(error = %err, version, "registered success model could not be loaded");
        }
        Ok((record, metrics))
    }

    async fn probability_with(
        &self,
        snapshot: &ModelSnapshot<RandomForestClassifier>,
        user_id: &str,
        skill_domain: &str,
    ) -> PredictionResult<(f64, FeatureVector)> {
        let features = self.builder.extract_features(user_id, skill_domain).await;
        let p = snapshot.model.predict_proba(features.as_slice())?;
        if !p.is_finite() {
            return Err(PredictionError::InvalidOutput);
        }
        Ok((p.clamp(0.0, 1.0), features))
    }

    pub async fn evaluate(&self, user_id: &str, skill_domain: &str) -> PredictionResult<SuccessOutcome> {
        let snapshot = self.slot.require().await?;
        let (probability, features) = self.probability_with(&snapshot, user_id, skill_domain).await?;
        Ok(SuccessOutcome {
            probability,
            explanation: SuccessExplanation::from_model(probability, &snapshot.record.version),
            features,
            snapshot,
        })
    }

    pub async fn try_predict_success_probability(
        &self,
        user_id: &str,
        skill_domain: &str,
    ) -> PredictionResult<(f64, SuccessExplanation)> {
        let outcome = self.evaluate(user_id, skill_domain).await?;
        Ok((outcome.probability, outcome.explanation))
    }

    pub async fn predict_success_probability(
        &self,
        user_id: &str,
        skill_domain: &str,
    ) -> (f64, SuccessExplanation) {
        match self.try_predict_success_probability(user_id, skill_domain).await {
            Ok(result) => result,
            Err(err) => {
                let reason = log_fallback(&err, user_id, skill_domain);
                (DEFAULT_SUCCESS_PROBABILITY, SuccessExplanation::fallback(reason))
            }
        }
    }

    /// Scores every learner against one model snapshot. Learners whose
    /// prediction fails are logged and left out.
    pub async fn identify_at_risk_learners(
        &self,
        user_ids: &[String],
        skill_domain: &str,
        threshold: f64,
    ) -> Vec<AtRiskLearner> {
        let snapshot = match self.slot.require().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, skill_domain, learners = user_ids.len(), "at-risk scan skipped");
                return Vec::new();
            }
        };

        let concurrency = self.risk.max_concurrency.max(1);
        let results: Vec<(String, PredictionResult<(f64, FeatureVector)>)> = stream::iter(user_ids)
            .map(|user_id| {
                let snapshot = Arc::clone(&snapshot);
                async move {
                    let result = self.probability_with(&snapshot, user_id, skill_domain).await;
                    (user_id.clone(), result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let scored: Vec<(String, f64)> = results
            .into_iter()
            .filter_map(|(user_id, result)| match result {
                Ok((p, _)) => Some((user_id, p)),
                Err(err) => {
                    tracing::warn!(error = %err, user_id = %user_id, skill_domain, "learner omitted from at-risk scan");
                    None
                }
            })
            .collect();

        let ranked = rank_at_risk(scored, skill_domain, threshold);
        tracing::info!(
            skill_domain,
            scanned = user_ids.len(),
            at_risk = ranked.len(),
            threshold,
            "at-risk scan completed"
        );
        ranked
    }

    pub fn default_threshold(&self) -> f64 {
        self.risk.at_risk_threshold
    }

    pub fn default_target(&self) -> f64 {
        self.timeline.target_proficiency
    }

    /// Needs a proficiency record but no trained model.
    pub async fn predict_mastery_timeline(
        &self,
        user_id: &str,
        skill_domain: &str,
        target: f64,
    ) -> PredictionResult<MasteryTimeline> {
        let Some(record) = self.builder.sources().proficiency.get(user_id, skill_domain).await? else {
            return Ok(MasteryTimeline::NoData);
        };
        if record.proficiency >= target {
            return Ok(MasteryTimeline::Mastered {
                current_proficiency: record.proficiency,
                target_proficiency: target,
            });
        }

        let features = self.builder.extract_features(user_id, skill_domain).await;
        let today = self.builder.now().date_naive();
        Ok(project_timeline(
            record.proficiency,
            target,
            features.get(Feature::LearningVelocity),
            today,
            &self.timeline,
        ))
    }

    pub async fn forecast_success(
        &self,
        user_id: &str,
        skill_domain: &str,
        days_ahead: u32,
    ) -> SuccessForecast {
        let (current, features, source) = match self.evaluate(user_id, skill_domain).await {
            Ok(outcome) => (outcome.probability, outcome.features, PredictionSource::MlModel),
            Err(err) => {
                log_fallback(&err, user_id, skill_domain);
                let features = self.builder.extract_features(user_id, skill_domain).await;
                (DEFAULT_SUCCESS_PROBABILITY, features, PredictionSource::Default)
            }
        };

        let trend = TrendDirection::classify(features.get(Feature::Trend7d), &self.forecast);
        let risk_level = RiskLevel::from_score(1.0 - current);
        let today = self.builder.now().date_naive();

        SuccessForecast {
            current_success_probability: current,
            source,
            trend,
            risk_level,
            recommendation: risk_level.intervention().to_string(),
            forecast: project_forecast(current, trend, days_ahead, today, &self.forecast),
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
    use crate::db::{AttemptHistoryStore, DataSources, InMemoryStore, SkillProficiencyStore};
    use crate::types::{ExerciseAttempt, SkillProficiency};
    use chrono::{Duration, TimeZone, Utc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn classifier(store: Arc<InMemoryStore>) -> SuccessClassifier {
        let builder = FeatureVectorBuilder::new(DataSources::from_store(store), FeatureParams::default());
        let params = ForestParams {
            n_estimators: 20,
            ..ForestParams::default()
        };
        SuccessClassifier::new(
            builder,
            Arc::new(ModelRegistry::in_memory()),
            params,
            RiskParams::default(),
            TimelineParams::default(),
            ForecastParams::default(),
        )
    }

    fn training_rows(n: usize) -> (Vec<Vec<f64>>, Vec<bool>) {
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let rate = (i % 10) as f64 / 10.0 + 0.05;
            let mut row = vec![0.0; FEATURE_DIM];
            row[Feature::RecentSuccessRate.index()] = rate;
            row[Feature::OverallSuccessRate.index()] = rate;
            x.push(row);
            y.push(rate > 0.5);
        }
        (x, y)
    }

    async fn record_outcomes(store: &InMemoryStore, user_id: &str, outcomes: &[bool]) {
        let now = Utc::now();
        for (i, ok) in outcomes.iter().enumerate() {
            let attempt = ExerciseAttempt::new(user_id, "fractions", 3, *ok, now - Duration::minutes(i as i64));
            store.append(attempt).await.unwrap();
        }
    }

    #[test]
    fn test_confidence_and_interpretation_bands() {
        assert_eq!(ConfidenceLevel::from_probability(0.9), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_probability(0.1), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_probability(0.7), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_probability(0.3), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_probability(0.5), ConfidenceLevel::Low);

        assert_eq!(interpret_probability(0.9), "very likely to succeed");
        assert_eq!(interpret_probability(0.7), "likely to succeed");
        assert_eq!(interpret_probability(0.5), "even chances");
        assert_eq!(interpret_probability(0.3), "failure risk");
        assert_eq!(interpret_probability(0.1), "high failure risk");
    }

    #[test]
    fn test_rank_at_risk_filters_and_orders() {
        let scored = vec![
            ("a".to_string(), 0.9),
            ("b".to_string(), 0.1),
            ("c".to_string(), 0.3),
            ("d".to_string(), 0.35),
        ];
        let ranked = rank_at_risk(scored, "fractions", 0.6);
        let ids: Vec<&str> = ranked.iter().map(|l| l.user_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
        assert_eq!(ranked[0].risk_level, RiskLevel::Critical);
        assert_eq!(ranked[1].risk_level, RiskLevel::High);
        assert_eq!(ranked[0].intervention, RiskLevel::Critical.intervention());
        assert!(ranked.iter().all(|l| l.risk_score >= 0.6));
        assert!(ranked.iter().all(|l| l.skill_domain == "fractions"));
        let json = serde_json::to_value(&ranked[0]).unwrap();
        assert_eq!(json["skillDomain"], "fractions");
    }

    #[test]
    fn test_risk_levels() {
        assert_eq!(RiskLevel::from_score(0.85), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(0.65), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.45), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.2), RiskLevel::Low);
    }

    #[test]
    fn test_timeline_projection() {
        let params = TimelineParams::default();
        let timeline = project_timeline(0.5, 0.75, 0.0625, today(), &params);
        match timeline {
            MasteryTimeline::Predicted {
                exercises_needed,
                estimated_days,
                estimated_date,
                ..
            } => {
                assert_eq!(exercises_needed, 4);
                assert_eq!(estimated_days, 2);
                assert_eq!(estimated_date, NaiveDate::from_ymd_opt(2024, 3, 3).unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }

        // odd exercise counts round the day count down
        let odd = project_timeline(0.5, 0.75, 0.0625 + 1e-9, today(), &params);
        assert!(matches!(
            odd,
            MasteryTimeline::Predicted { exercises_needed: 4, estimated_days: 2, .. }
        ));
        let three = project_timeline(0.5, 0.6875, 0.0625, today(), &params);
        assert!(matches!(
            three,
            MasteryTimeline::Predicted { exercises_needed: 3, estimated_days: 1, .. }
        ));

        // non-positive velocity is floored
        let expected = 25;
        match project_timeline(0.5, 0.75, -0.2, today(), &params) {
            MasteryTimeline::Predicted {
                exercises_needed,
                estimated_days,
                learning_velocity,
                ..
            } => {
                assert_eq!(exercises_needed, expected);
                assert_eq!(estimated_days, expected / 2);
                assert_eq!(learning_velocity, params.min_velocity);
            }
            other => panic!("unexpected {other:?}"),
        }

        // gaps that divide evenly are not inflated by float error
        for (current, target, velocity, needed) in [(0.6, 0.8, 0.01, 20), (0.5, 0.8, 0.1, 3)] {
            match project_timeline(current, target, velocity, today(), &params) {
                MasteryTimeline::Predicted {
                    exercises_needed,
                    estimated_days,
                    ..
                } => {
                    assert_eq!(exercises_needed, needed);
                    assert_eq!(estimated_days, needed / 2);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        let done = project_timeline(0.85, 0.8, 0.0, today(), &params);
        assert_eq!(done.status(), "mastered");
        let json = serde_json::to_value(&done).unwrap();
        assert!(json.get("exercisesNeeded").is_none());
        assert_eq!(json["status"], "mastered");
    }

    #[test]
    fn test_forecast_projection() {
        let params = ForecastParams::default();
        let days = project_forecast(0.99, TrendDirection::Improving, 3, today(), &params);
        assert_eq!(days.len(), 3);
        assert_eq!(days[2].projected_success_probability, 1.0);
        assert!((days[0].confidence - 0.85 * 0.95).abs() < 1e-12);
        assert!(days[1].confidence < days[0].confidence);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());

        let falling = project_forecast(0.5, TrendDirection::Declining, 2, today(), &params);
        assert!((falling[1].projected_success_probability - 0.48).abs() < 1e-12);

        assert_eq!(TrendDirection::classify(0.2, &params), TrendDirection::Improving);
        assert_eq!(TrendDirection::classify(-0.2, &params), TrendDirection::Declining);
        assert_eq!(TrendDirection::classify(0.0, &params), TrendDirection::Stable);
    }

    #[tokio::test]
    async fn test_no_model_defaults() {
        let store = Arc::new(InMemoryStore::new());
        let service = classifier(store);
        let (p, explanation) = service.predict_success_probability("u1", "fractions").await;
        assert_eq!(p, 0.5);
        assert_eq!(explanation.source, PredictionSource::Default);
        assert!(service
            .identify_at_risk_learners(&["u1".to_string()], "fractions", 0.6)
            .await
            .is_empty());

        let forecast = service.forecast_success("u1", "fractions", 2).await;
        assert_eq!(forecast.source, PredictionSource::Default);
        assert_eq!(forecast.current_success_probability, 0.5);
        assert_eq!(forecast.forecast.len(), 2);
    }

    #[tokio::test]
    async fn test_trained_model_ranks_struggling_learner() {
        let store = Arc::new(InMemoryStore::new());
        let service = classifier(store.clone());
        record_outcomes(&store, "strong", &[true; 10]).await;
        record_outcomes(&store, "weak", &[false; 10]).await;

        let (x, y) = training_rows(80);
        let (_, metrics) = service
            .train_and_register(&x, &y, "v1", &TrainOptions::default())
            .await
            .unwrap();
        assert!(metrics.accuracy > 0.8);

        let (p_strong, explanation) = service.predict_success_probability("strong", "fractions").await;
        let (p_weak, _) = service.predict_success_probability("weak", "fractions").await;
        assert!((0.0..=1.0).contains(&p_strong));
        assert!(p_strong > p_weak);
        assert_eq!(explanation.source, PredictionSource::MlModel);

        let users = vec!["strong".to_string(), "weak".to_string(), "ghost".to_string()];
        let ranked = service.identify_at_risk_learners(&users, "fractions", 0.0).await;
        assert_eq!(ranked.len(), 3);
        for pair in ranked.windows(2) {
            assert!(pair[0].risk_score >= pair[1].risk_score);
        }
        let weak_pos = ranked.iter().position(|l| l.user_id == "weak").unwrap();
        let strong_pos = ranked.iter().position(|l| l.user_id == "strong").unwrap();
        assert!(weak_pos < strong_pos);
    }

    #[tokio::test]
    async fn test_mastery_timeline_states() {
        let store = Arc::new(InMemoryStore::new());
        let service = classifier(store.clone());

        assert_eq!(
            service.predict_mastery_timeline("u1", "fractions", 0.8).await.unwrap(),
            MasteryTimeline::NoData
        );

        store
            .upsert(SkillProficiency::new("u1", "fractions", 0.9))
            .await
            .unwrap();
        let mastered = service.predict_mastery_timeline("u1", "fractions", 0.8).await.unwrap();
        assert_eq!(mastered.status(), "mastered");

        store
            .upsert(SkillProficiency::new("u2", "fractions", 0.6))
            .await
            .unwrap();
        let predicted = service.predict_mastery_timeline("u2", "fractions", 0.8).await.unwrap();
        // no attempts means zero velocity, floored at 0.01
        let expected = 20;
        match predicted {
            MasteryTimeline::Predicted {
                exercises_needed,
                estimated_days,
                ..
            } => {
                assert_eq!(exercises_needed, expected);
                assert_eq!(estimated_days, expected / 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fixed_clock_dates_forecast() {
        let store = Arc::new(InMemoryStore::new());
        let fixed = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let builder = FeatureVectorBuilder::new(DataSources::from_store(store), FeatureParams::default())
            .with_clock(Arc::new(move || fixed));
        let service = SuccessClassifier::new(
            builder,
            Arc::new(ModelRegistry::in_memory()),
            ForestParams::default(),
            RiskParams::default(),
            TimelineParams::default(),
            ForecastParams::default(),
        );
        let forecast = service.forecast_success("u1", "fractions", 1).await;
        assert_eq!(forecast.forecast[0].date, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(forecast.trend, TrendDirection::Stable);
        assert_eq!(forecast.risk_level, RiskLevel::Medium);
    }
}
