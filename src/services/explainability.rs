//! Per-prediction attribution, fairness auditing and bias detection.
//!
//! Attributions come from the trees themselves: walking a row's decision
//! path and crediting each split feature with the change in node value gives
//! contributions that add up exactly to the model output minus its expected
//! value. The explainer is always handed the snapshot that produced the
//! prediction, never a freshly loaded model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ml::metrics;
use crate::ml::{GradientBoostedRegressor, RandomForestClassifier, WidthMismatch};
use crate::modeling::{Feature, FeatureVector};
use crate::registry::ModelArtifact;
use crate::types::ModelKind;

pub const DEFAULT_TOP_N: usize = 5;
pub const BIAS_IMPORTANCE_THRESHOLD: f64 = 0.1;

/// Additive attribution for one model family.
pub trait Explainer: Send + Sync {
    fn model_kind(&self) -> ModelKind;

    /// Model output with every contribution at zero.
    fn expected_value(&self) -> f64;

    fn output(&self, row: &[f64]) -> Result<f64, WidthMismatch>;

    /// One entry per feature; `expected_value() + sum == output(row)`.
    fn contributions(&self, row: &[f64]) -> Result<Vec<f64>, WidthMismatch>;

    fn feature_importances(&self) -> Vec<f64>;
}

impl Explainer for GradientBoostedRegressor {
    fn model_kind(&self) -> ModelKind {
        ModelKind::GradientBoosting
    }

    fn expected_value(&self) -> f64 {
        GradientBoostedRegressor::expected_value(self)
    }

    fn output(&self, row: &[f64]) -> Result<f64, WidthMismatch> {
        self.predict(row)
    }

    fn contributions(&self, row: &[f64]) -> Result<Vec<f64>, WidthMismatch> {
        GradientBoostedRegressor::contributions(self, row)
    }

    fn feature_importances(&self) -> Vec<f64> {
        GradientBoostedRegressor::feature_importances(self)
    }
}

impl Explainer for RandomForestClassifier {
    fn model_kind(&self) -> ModelKind {
        ModelKind::RandomForest
    }

    fn expected_value(&self) -> f64 {
        RandomForestClassifier::expected_value(self)
    }

    /// Positive-class probability.
    fn output(&self, row: &[f64]) -> Result<f64, WidthMismatch> {
        self.predict_proba(row)
    }

    fn contributions(&self, row: &[f64]) -> Result<Vec<f64>, WidthMismatch> {
        RandomForestClassifier::contributions(self, row)
    }

    fn feature_importances(&self) -> Vec<f64> {
        RandomForestClassifier::feature_importances(self)
    }
}

impl Explainer for ModelArtifact {
    fn model_kind(&self) -> ModelKind {
        self.kind()
    }

    fn expected_value(&self) -> f64 {
        match self {
            Self::GradientBoosting(model) => Explainer::expected_value(model),
            Self::RandomForest(model) => Explainer::expected_value(model),
        }
    }

    fn output(&self, row: &[f64]) -> Result<f64, WidthMismatch> {
        match self {
            Self::GradientBoosting(model) => model.output(row),
            Self::RandomForest(model) => model.output(row),
        }
    }

    fn contributions(&self, row: &[f64]) -> Result<Vec<f64>, WidthMismatch> {
        match self {
            Self::GradientBoosting(model) => Explainer::contributions(model, row),
            Self::RandomForest(model) => Explainer::contributions(model, row),
        }
    }

    fn feature_importances(&self) -> Vec<f64> {
        match self {
            Self::GradientBoosting(model) => Explainer::feature_importances(model),
            Self::RandomForest(model) => Explainer::feature_importances(model),
        }
    }
}

/// Which prediction is being explained. Selects the phrasing of reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionContext {
    Difficulty,
    Success,
}

impl PredictionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Difficulty => "difficulty",
            Self::Success => "success",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    fn of(contribution: f64) -> Self {
        if contribution > 0.0 {
            Self::Positive
        } else {
            Self::Negative
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureContribution {
    pub feature: String,
    pub value: f64,
    pub contribution: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionExplanation {
    pub context: PredictionContext,
    pub prediction: f64,
    pub expected_value: f64,
    pub top_contributors: Vec<FeatureContribution>,
    pub human_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Pairs importances with canonical feature names, highest first.
pub fn rank_importances(importances: &[f64]) -> Vec<FeatureImportance> {
    let mut ranked: Vec<FeatureImportance> = importances
        .iter()
        .enumerate()
        .map(|(index, importance)| FeatureImportance {
            feature: Feature::from_index(index)
                .map(|f| f.name().to_string())
                .unwrap_or_else(|| format!("feature_{index}")),
            importance: *importance,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ranked
}

fn percent(value: f64) -> String {
    format!("{:.0}%", value * 100.0)
}

fn difficulty_phrase(feature: Feature, value: f64) -> Option<String> {
    match feature {
        Feature::RecentSuccessRate if value > 0.8 => {
            Some(format!("Excellent success rate ({})", percent(value)))
        }
        Feature::RecentSuccessRate if value > 0.6 => {
            Some(format!("Good success rate ({})", percent(value)))
        }
        Feature::RecentSuccessRate => Some(format!("Success rate to improve ({})", percent(value))),
        Feature::Trend7d if value > 0.1 => Some("Positive recent progress".to_string()),
        Feature::Trend7d if value < -0.1 => Some("Recent difficulty".to_string()),
        Feature::Streak if value >= 3.0 => Some(format!("Streak of {} successes!", value as u32)),
        Feature::FatigueLevel if value > 0.3 => Some("Signs of fatigue detected".to_string()),
        Feature::LearningVelocity if value > 0.05 => Some("Learning quickly".to_string()),
        Feature::DomainProficiency if value > 0.8 => {
            Some(format!("Domain mastered ({})", percent(value)))
        }
        Feature::DomainProficiency if value < 0.3 => {
            Some(format!("Domain needs reinforcement ({})", percent(value)))
        }
        _ => None,
    }
}

fn success_phrase(feature: Feature, value: f64, direction: Direction) -> Option<String> {
    let effect = match direction {
        Direction::Positive => "favours",
        Direction::Negative => "works against",
    };
    match feature {
        Feature::RecentSuccessRate => Some(format!(
            "Recent success rate ({}) {effect} success",
            percent(value)
        )),
        Feature::Trend7d if value.abs() > 0.1 => {
            Some(format!("Weekly trend ({value:+.2}) {effect} success"))
        }
        Feature::Streak if value >= 3.0 => Some(format!(
            "Streak of {} successes {effect} confidence",
            value as u32
        )),
        Feature::FatigueLevel if value > 0.3 => Some(format!("Fatigue {effect} success")),
        Feature::LearningVelocity if value > 0.05 => {
            Some(format!("Fast learning pace {effect} success"))
        }
        Feature::DomainProficiency => Some(format!(
            "Domain proficiency ({}) {effect} performance",
            percent(value)
        )),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExplanationEngine {
    top_n: usize,
}

impl Default for ExplanationEngine {
    fn default() -> Self {
        Self { top_n: DEFAULT_TOP_N }
    }
}

impl ExplanationEngine {
    pub fn new(top_n: usize) -> Self {
        Self { top_n }
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// `top_n` overrides the engine's default for this call.
    pub fn explain<E: Explainer + ?Sized>(
        &self,
        context: PredictionContext,
        model: &E,
        features: &FeatureVector,
        top_n: Option<usize>,
    ) -> Result<PredictionExplanation, WidthMismatch> {
        let row = features.as_slice();
        let prediction = model.output(row)?;
        let contributions = model.contributions(row)?;

        let mut ranked: Vec<FeatureContribution> = features
            .iter()
            .zip(contributions)
            .map(|((name, value), contribution)| FeatureContribution {
                feature: name.to_string(),
                value,
                contribution,
                direction: Direction::of(contribution),
            })
            .collect();
        ranked.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));
        ranked.truncate(top_n.unwrap_or(self.top_n));

        let human_reasons = ranked
            .iter()
            .filter_map(|c| {
                let feature = Feature::from_name(&c.feature)?;
                match context {
                    PredictionContext::Difficulty => difficulty_phrase(feature, c.value),
                    PredictionContext::Success => success_phrase(feature, c.value, c.direction),
                }
            })
            .collect();

        Ok(PredictionExplanation {
            context,
            prediction,
            expected_value: model.expected_value(),
            top_contributors: ranked,
            human_reasons,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit needs at least one test row")]
    EmptyTestSet,
    #[error("{rows} test rows but {demographics} demographic records")]
    LengthMismatch { rows: usize, demographics: usize },
    #[error("feature width mismatch: {0}")]
    FeatureWidthMismatch(#[from] WidthMismatch),
}

/// Group labels of one audited row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Demographics {
    pub grade_level: String,
    pub learning_style: String,
}

impl Demographics {
    pub fn new(grade_level: &str, learning_style: &str) -> Self {
        Self {
            grade_level: grade_level.to_string(),
            learning_style: learning_style.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetrics {
    pub count: usize,
    pub mean_prediction: f64,
    pub std_prediction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessAssessment {
    Excellent,
    Good,
    Acceptable,
    Flagged,
}

impl FairnessAssessment {
    pub fn from_score(score: f64) -> Self {
        if score > 0.9 {
            Self::Excellent
        } else if score > 0.7 {
            Self::Good
        } else if score > 0.5 {
            Self::Acceptable
        } else {
            Self::Flagged
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Excellent => "Excellent - predictions are even across groups",
            Self::Good => "Good - slight differences between groups",
            Self::Acceptable => "Acceptable - noticeable differences between groups",
            Self::Flagged => "Warning - potential bias detected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FairnessReport {
    pub fairness_score: f64,
    pub grade_level_metrics: BTreeMap<String, GroupMetrics>,
    pub learning_style_metrics: BTreeMap<String, GroupMetrics>,
    pub assessment: FairnessAssessment,
}

fn group_metrics<'a>(
    predictions: &[f64],
    keys: impl Iterator<Item = &'a str>,
) -> BTreeMap<String, GroupMetrics> {
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (key, prediction) in keys.zip(predictions) {
        groups.entry(key.to_string()).or_default().push(*prediction);
    }
    groups
        .into_iter()
        .map(|(key, values)| {
            let metrics = GroupMetrics {
                count: values.len(),
                mean_prediction: metrics::mean(&values),
                std_prediction: metrics::sample_std(&values),
            };
            (key, metrics)
        })
        .collect()
}

/// Compares model outputs across demographic groups. The score is
/// `1 / (1 + variance of the grade-level group means)`.
pub fn fairness_audit<E: Explainer + ?Sized>(
    test_set: &[Vec<f64>],
    demographics: &[Demographics],
    model: &E,
) -> Result<FairnessReport, AuditError> {
    if test_set.is_empty() {
        return Err(AuditError::EmptyTestSet);
    }
    if test_set.len() != demographics.len() {
        return Err(AuditError::LengthMismatch {
            rows: test_set.len(),
            demographics: demographics.len(),
        });
    }

    let predictions = test_set
        .iter()
        .map(|row| model.output(row))
        .collect::<Result<Vec<f64>, WidthMismatch>>()?;

    let grade_level_metrics = group_metrics(&predictions, demographics.iter().map(|d| d.grade_level.as_str()));
    let learning_style_metrics =
        group_metrics(&predictions, demographics.iter().map(|d| d.learning_style.as_str()));

    let grade_means: Vec<f64> = grade_level_metrics.values().map(|m| m.mean_prediction).collect();
    let fairness_score = 1.0 / (1.0 + metrics::variance(&grade_means));
    let assessment = FairnessAssessment::from_score(fairness_score);

    tracing::info!(
        fairness_score,
        groups = grade_level_metrics.len(),
        ?assessment,
        "fairness audit completed"
    );

    Ok(FairnessReport {
        fairness_score,
        grade_level_metrics,
        learning_style_metrics,
        assessment,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasFlag {
    pub feature: String,
    pub model: PredictionContext,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiasReport {
    pub sensitive_features: Vec<BiasFlag>,
    pub recommendations: Vec<String>,
}

impl BiasReport {
    pub fn is_clear(&self) -> bool {
        self.sensitive_features.is_empty()
    }
}

/// Flags sensitive features whose learned importance exceeds
/// [`BIAS_IMPORTANCE_THRESHOLD`] in any of the given models.
pub fn detect_bias(models: &[(PredictionContext, Vec<f64>)], sensitive_features: &[usize]) -> BiasReport {
    let mut flags = Vec::new();
    for &index in sensitive_features {
        let Some(feature) = Feature::from_index(index) else {
            tracing::warn!(index, "sensitive feature index out of range");
            continue;
        };
        for (context, importances) in models {
            if let Some(&importance) = importances.get(index) {
                if importance > BIAS_IMPORTANCE_THRESHOLD {
                    flags.push(BiasFlag {
                        feature: feature.name().to_string(),
                        model: *context,
                        importance,
                    });
                }
            }
        }
    }

    let recommendations = if flags.is_empty() {
        vec!["No obvious bias detected in sensitive features".to_string()]
    } else {
        vec![
            "Monitor predictions for potential bias".to_string(),
            "Consider reweighting sensitive features".to_string(),
        ]
    };

    BiasReport {
        sensitive_features: flags,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForestParams, GbtParams};
    use crate::modeling::FEATURE_DIM;

    fn rows(n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| {
                let mut row = vec![0.0; FEATURE_DIM];
                row[Feature::RecentSuccessRate.index()] = (i % 10) as f64 / 10.0;
                row[Feature::Streak.index()] = (i % 4) as f64;
                row[Feature::GradeLevelEncoded.index()] = (i % 4 + 1) as f64;
                row
            })
            .collect()
    }

    fn regressor() -> GradientBoostedRegressor {
        let x = rows(50);
        let y: Vec<f64> = x
            .iter()
            .map(|r| 1.0 + 3.0 * r[Feature::RecentSuccessRate.index()] + 0.2 * r[Feature::Streak.index()])
            .collect();
        let params = GbtParams {
            n_estimators: 15,
            ..GbtParams::default()
        };
        GradientBoostedRegressor::fit(&x, &y, &params).unwrap()
    }

    fn classifier() -> RandomForestClassifier {
        let x = rows(60);
        let y: Vec<bool> = x.iter().map(|r| r[Feature::RecentSuccessRate.index()] >= 0.5).collect();
        let params = ForestParams {
            n_estimators: 15,
            ..ForestParams::default()
        };
        RandomForestClassifier::fit(&x, &y, &params).unwrap()
    }

    #[test]
    fn test_explanation_is_additive_and_ranked() {
        let model = regressor();
        let features = FeatureVector::from_values(rows(10)[7].clone()).unwrap();
        let engine = ExplanationEngine::new(FEATURE_DIM);
        let explanation = engine
            .explain(PredictionContext::Difficulty, &model, &features, None)
            .unwrap();

        let total: f64 = explanation.top_contributors.iter().map(|c| c.contribution).sum();
        assert!((explanation.expected_value + total - explanation.prediction).abs() < 1e-9);
        for pair in explanation.top_contributors.windows(2) {
            assert!(pair[0].contribution.abs() >= pair[1].contribution.abs());
        }
    }

    #[test]
    fn test_top_n_and_context_phrasing() {
        let model = classifier();
        let features = FeatureVector::from_values(rows(10)[9].clone()).unwrap();
        let engine = ExplanationEngine::default();

        let success = engine.explain(PredictionContext::Success, &model, &features, None).unwrap();
        assert!(success.top_contributors.len() <= DEFAULT_TOP_N);
        assert_eq!(success.top_contributors[0].feature, "recent_success_rate");
        assert!(success.human_reasons[0].starts_with("Recent success rate (90%)"));

        let artifact = ModelArtifact::RandomForest(model);
        let difficulty = engine
            .explain(PredictionContext::Difficulty, &artifact, &features, None)
            .unwrap();
        assert_eq!(difficulty.human_reasons[0], "Excellent success rate (90%)");
        assert_eq!(difficulty.prediction, success.prediction);

        let single = engine
            .explain(PredictionContext::Success, &artifact, &features, Some(1))
            .unwrap();
        assert_eq!(single.top_contributors.len(), 1);
        assert_eq!(single.top_contributors[0], success.top_contributors[0]);
        assert_eq!(engine.top_n(), DEFAULT_TOP_N);
    }

    #[test]
    fn test_width_mismatch_is_reported() {
        let model = regressor();
        let mut features = FeatureVector::zeros();
        features.values.pop();
        features.labels.pop();
        assert!(ExplanationEngine::default()
            .explain(PredictionContext::Difficulty, &model, &features, None)
            .is_err());
    }

    #[test]
    fn test_fairness_audit_groups_and_score() {
        let model = classifier();
        let test_set = rows(8);
        let demographics: Vec<Demographics> = (0..8)
            .map(|i| Demographics::new(if i % 2 == 0 { "CE1" } else { "CM2" }, "visual"))
            .collect();

        let report = fairness_audit(&test_set, &demographics, &model).unwrap();
        assert_eq!(report.grade_level_metrics.len(), 2);
        assert_eq!(report.grade_level_metrics["CE1"].count, 4);
        assert_eq!(report.learning_style_metrics["visual"].count, 8);
        assert!(report.fairness_score > 0.0 && report.fairness_score <= 1.0);
        // probabilities lie in [0, 1], so group means differ by at most 1
        assert!(report.fairness_score >= 0.8);

        assert!(matches!(
            fairness_audit(&test_set, &demographics[..3], &model),
            Err(AuditError::LengthMismatch { .. })
        ));
        assert!(matches!(
            fairness_audit(&[], &[], &model),
            Err(AuditError::EmptyTestSet)
        ));
    }

    #[test]
    fn test_single_group_is_perfectly_fair() {
        let model = regressor();
        let test_set = rows(5);
        let demographics = vec![Demographics::new("CE2", "logical"); 5];
        let report = fairness_audit(&test_set, &demographics, &model).unwrap();
        assert_eq!(report.fairness_score, 1.0);
        assert_eq!(report.assessment, FairnessAssessment::Excellent);
    }

    #[test]
    fn test_assessment_bands() {
        assert_eq!(FairnessAssessment::from_score(0.95), FairnessAssessment::Excellent);
        assert_eq!(FairnessAssessment::from_score(0.8), FairnessAssessment::Good);
        assert_eq!(FairnessAssessment::from_score(0.6), FairnessAssessment::Acceptable);
        assert_eq!(FairnessAssessment::from_score(0.5), FairnessAssessment::Flagged);
    }

    #[test]
    fn test_detect_bias_flags_important_sensitive_features() {
        let grade = Feature::GradeLevelEncoded.index();
        let style = Feature::LearningStyleEncoded.index();
        let mut importances = vec![0.0; FEATURE_DIM];
        importances[grade] = 0.25;
        importances[style] = 0.05;

        let report = detect_bias(
            &[
                (PredictionContext::Difficulty, importances.clone()),
                (PredictionContext::Success, vec![0.0; FEATURE_DIM]),
            ],
            &[grade, style],
        );
        assert_eq!(report.sensitive_features.len(), 1);
        assert_eq!(report.sensitive_features[0].feature, "grade_level_encoded");
        assert_eq!(report.sensitive_features[0].model, PredictionContext::Difficulty);
        assert_eq!(report.recommendations.len(), 2);

        let clear = detect_bias(&[(PredictionContext::Success, vec![0.0; FEATURE_DIM])], &[grade, 99]);
        assert!(clear.is_clear());
        assert_eq!(clear.recommendations.len(), 1);
    }

    #[test]
    fn test_rank_importances_orders_descending() {
        let mut raw = vec![0.0; FEATURE_DIM];
        raw[Feature::Streak.index()] = 0.7;
        raw[Feature::Trend7d.index()] = 0.3;
        let ranked = rank_importances(&raw);
        assert_eq!(ranked[0].feature, "streak");
        assert_eq!(ranked[1].feature, "trend_7d");
    }
}
