use serde::{Deserialize, Serialize};

/// Canonical feature order. Every trained model is fitted against exactly this
/// layout and rejects rows of any other width.
pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "recent_success_rate",
    "recent_avg_time",
    "streak",
    "recent_exercises_count",
    "trend_7d",
    "trend_30d",
    "learning_velocity",
    "hour_of_day",
    "day_of_week",
    "session_length",
    "fatigue_level",
    "prerequisite_mastery",
    "domain_proficiency",
    "cross_domain_avg",
    "self_reported_difficulty",
    "strategy_effectiveness",
    "grade_level_encoded",
    "learning_style_encoded",
    "total_exercises",
    "total_correct",
    "overall_success_rate",
];

pub const FEATURE_DIM: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    RecentSuccessRate,
    RecentAvgTime,
    Streak,
    RecentExercisesCount,
    Trend7d,
    Trend30d,
    LearningVelocity,
    HourOfDay,
    DayOfWeek,
    SessionLength,
    FatigueLevel,
    PrerequisiteMastery,
    DomainProficiency,
    CrossDomainAvg,
    SelfReportedDifficulty,
    StrategyEffectiveness,
    GradeLevelEncoded,
    LearningStyleEncoded,
    TotalExercises,
    TotalCorrect,
    OverallSuccessRate,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_DIM] = [
        Feature::RecentSuccessRate,
        Feature::RecentAvgTime,
        Feature::Streak,
        Feature::RecentExercisesCount,
        Feature::Trend7d,
        Feature::Trend30d,
        Feature::LearningVelocity,
        Feature::HourOfDay,
        Feature::DayOfWeek,
        Feature::SessionLength,
        Feature::FatigueLevel,
        Feature::PrerequisiteMastery,
        Feature::DomainProficiency,
        Feature::CrossDomainAvg,
        Feature::SelfReportedDifficulty,
        Feature::StrategyEffectiveness,
        Feature::GradeLevelEncoded,
        Feature::LearningStyleEncoded,
        Feature::TotalExercises,
        Feature::TotalCorrect,
        Feature::OverallSuccessRate,
    ];

    /// Grade level and learning style, the attributes audited for bias.
    pub const SENSITIVE: [Feature; 2] = [Feature::GradeLevelEncoded, Feature::LearningStyleEncoded];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        FEATURE_NAMES[self.index()]
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        FEATURE_NAMES
            .iter()
            .position(|candidate| *candidate == name)
            .and_then(Self::from_index)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f64>,
    pub labels: Vec<String>,
}

impl FeatureVector {
    pub fn zeros() -> Self {
        Self {
            values: vec![0.0; FEATURE_DIM],
            labels: FEATURE_NAMES.iter().map(|name| name.to_string()).collect(),
        }
    }

    /// Wraps a raw row in canonical order. Returns `None` on a width mismatch.
    pub fn from_values(values: Vec<f64>) -> Option<Self> {
        if values.len() != FEATURE_DIM {
            return None;
        }
        let mut vector = Self::zeros();
        vector.values = values;
        Some(vector)
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.values.get(feature.index()).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, feature: Feature, value: f64) {
        if let Some(slot) = self.values.get_mut(feature.index()) {
            *slot = if value.is_finite() { value } else { 0.0 };
        }
    }

    pub fn with(mut self, feature: Feature, value: f64) -> Self {
        self.set(feature, value);
        self
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.labels
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    pub fn is_all_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::zeros()
    }
}
