use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_DIFFICULTY: u8 = 1;
pub const MAX_DIFFICULTY: u8 = 5;
pub const DEFAULT_DIFFICULTY: u8 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseAttempt {
    pub user_id: String,
    pub skill_domain: String,
    pub difficulty: u8,
    pub is_correct: bool,
    pub time_taken_seconds: Option<f64>,
    pub strategy_used: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExerciseAttempt {
    pub fn new(
        user_id: &str,
        skill_domain: &str,
        difficulty: u8,
        is_correct: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            skill_domain: skill_domain.to_string(),
            difficulty,
            is_correct,
            time_taken_seconds: None,
            strategy_used: None,
            timestamp,
        }
    }

    pub fn with_time(mut self, seconds: f64) -> Self {
        self.time_taken_seconds = Some(seconds);
        self
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.strategy_used = Some(strategy.to_string());
        self
    }

    /// Duration usable for averaging; zero, negative and non-finite values are
    /// treated as not recorded.
    pub fn recorded_duration(&self) -> Option<f64> {
        self.time_taken_seconds
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
    }

    pub fn strategy(&self) -> Option<&str> {
        self.strategy_used
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillProficiency {
    pub user_id: String,
    pub skill_domain: String,
    pub proficiency: f64,
    pub exercises_completed: u32,
    pub success_rate: Option<f64>,
    pub last_practiced: Option<DateTime<Utc>>,
    pub mastery_date: Option<DateTime<Utc>>,
}

impl SkillProficiency {
    pub fn new(user_id: &str, skill_domain: &str, proficiency: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            skill_domain: skill_domain.to_string(),
            proficiency: proficiency.clamp(0.0, 1.0),
            exercises_completed: 0,
            success_rate: None,
            last_practiced: None,
            mastery_date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerProfile {
    pub user_id: String,
    pub grade_level: Option<String>,
    pub learning_style: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GradeLevel {
    CE1,
    CE2,
    CM1,
    CM2,
}

impl GradeLevel {
    /// Midpoint used when the grade is missing or unrecognised.
    pub const UNKNOWN_ENCODING: f64 = 2.5;

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "CE1" => Some(Self::CE1),
            "CE2" => Some(Self::CE2),
            "CM1" => Some(Self::CM1),
            "CM2" => Some(Self::CM2),
            _ => None,
        }
    }

    pub fn encode(&self) -> f64 {
        match self {
            Self::CE1 => 1.0,
            Self::CE2 => 2.0,
            Self::CM1 => 3.0,
            Self::CM2 => 4.0,
        }
    }

    pub fn encode_raw(value: Option<&str>) -> f64 {
        value
            .and_then(Self::parse)
            .map(|grade| grade.encode())
            .unwrap_or(Self::UNKNOWN_ENCODING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStyle {
    Visual,
    Auditory,
    Kinesthetic,
    Logical,
    Narrative,
}

impl LearningStyle {
    pub const UNKNOWN_ENCODING: f64 = 3.0;

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "visual" => Some(Self::Visual),
            "auditory" => Some(Self::Auditory),
            "kinesthetic" => Some(Self::Kinesthetic),
            "logical" => Some(Self::Logical),
            "narrative" => Some(Self::Narrative),
            _ => None,
        }
    }

    pub fn encode(&self) -> f64 {
        match self {
            Self::Visual => 1.0,
            Self::Auditory => 2.0,
            Self::Kinesthetic => 3.0,
            Self::Logical => 4.0,
            Self::Narrative => 5.0,
        }
    }

    pub fn encode_raw(value: Option<&str>) -> f64 {
        value
            .and_then(Self::parse)
            .map(|style| style.encode())
            .unwrap_or(Self::UNKNOWN_ENCODING)
    }
}

/// Trained model family. Each family has its own artifact layout and explainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    GradientBoosting,
    RandomForest,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GradientBoosting => "gradient_boosting",
            Self::RandomForest => "random_forest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gradient_boosting" => Some(Self::GradientBoosting),
            "random_forest" => Some(Self::RandomForest),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainedModel {
    pub id: String,
    pub name: String,
    pub version: String,
    pub model_type: ModelKind,
    pub hyperparameters: serde_json::Value,
    pub training_date: DateTime<Utc>,
    pub metrics: serde_json::Value,
    pub artifact_reference: String,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_level_encoding() {
        assert_eq!(GradeLevel::encode_raw(Some("CE1")), 1.0);
        assert_eq!(GradeLevel::encode_raw(Some("cm2")), 4.0);
        assert_eq!(GradeLevel::encode_raw(Some("6e")), 2.5);
        assert_eq!(GradeLevel::encode_raw(None), 2.5);
    }

    #[test]
    fn test_learning_style_encoding() {
        assert_eq!(LearningStyle::encode_raw(Some("visual")), 1.0);
        assert_eq!(LearningStyle::encode_raw(Some("Narrative")), 5.0);
        assert_eq!(LearningStyle::encode_raw(Some("musical")), 3.0);
        assert_eq!(LearningStyle::encode_raw(None), 3.0);
    }

    #[test]
    fn test_recorded_duration_filters_invalid() {
        let ts = Utc::now();
        let attempt = ExerciseAttempt::new("u1", "addition", 2, true, ts);
        assert_eq!(attempt.recorded_duration(), None);
        assert_eq!(attempt.clone().with_time(0.0).recorded_duration(), None);
        assert_eq!(attempt.clone().with_time(-3.0).recorded_duration(), None);
        assert_eq!(attempt.clone().with_time(f64::NAN).recorded_duration(), None);
        assert_eq!(attempt.with_time(12.5).recorded_duration(), Some(12.5));
    }

    #[test]
    fn test_model_kind_round_trip_str() {
        for kind in [ModelKind::GradientBoosting, ModelKind::RandomForest] {
            assert_eq!(ModelKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ModelKind::parse("xgboost"), None);
    }
}
