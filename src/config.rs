use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-level settings for the command-line binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let database_path = std::env::var("ENGINE_DB_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Self {
            database_path,
            log_level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureParams {
    pub recent_window: usize,
    pub domain_window: usize,
    pub min_trend_attempts: usize,
    pub velocity_window: usize,
    pub session_gap_minutes: i64,
    pub min_fatigue_attempts: usize,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            recent_window: 10,
            domain_window: 50,
            min_trend_attempts: 7,
            velocity_window: 10,
            session_gap_minutes: 30,
            min_fatigue_attempts: 5,
        }
    }
}

/// Flow Theory target zone around the recent success rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowParams {
    pub target_success_rate: f64,
    pub tolerance: f64,
    pub step: f64,
}

impl FlowParams {
    pub fn upper_bound(&self) -> f64 {
        self.target_success_rate + self.tolerance
    }

    pub fn lower_bound(&self) -> f64 {
        self.target_success_rate - self.tolerance
    }
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            target_success_rate: 0.70,
            tolerance: 0.15,
            step: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    pub at_risk_threshold: f64,
    pub max_concurrency: usize,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            at_risk_threshold: 0.60,
            max_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineParams {
    pub target_proficiency: f64,
    pub exercises_per_day: u32,
    pub min_velocity: f64,
}

impl Default for TimelineParams {
    fn default() -> Self {
        Self {
            target_proficiency: 0.8,
            exercises_per_day: 2,
            min_velocity: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastParams {
    pub base_confidence: f64,
    pub improving_threshold: f64,
    pub declining_threshold: f64,
    pub improving_daily_gain: f64,
    pub declining_daily_loss: f64,
}

impl Default for ForecastParams {
    fn default() -> Self {
        Self {
            base_confidence: 0.85,
            improving_threshold: 0.05,
            declining_threshold: -0.05,
            improving_daily_gain: 0.02,
            declining_daily_loss: 0.01,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceParams {
    pub deadline_ms: Option<u64>,
}

impl InferenceParams {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbtParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub subsample: f64,
    pub colsample_bytree: f64,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for GbtParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 5,
            learning_rate: 0.1,
            subsample: 0.8,
            colsample_bytree: 0.8,
            min_samples_split: 2,
            min_samples_leaf: 1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    Sqrt,
    All,
    Count(usize),
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let k = match self {
            Self::Sqrt => (n_features as f64).sqrt().floor() as usize,
            Self::All => n_features,
            Self::Count(k) => *k,
        };
        k.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub features: FeatureParams,
    pub flow: FlowParams,
    pub risk: RiskParams,
    pub timeline: TimelineParams,
    pub forecast: ForecastParams,
    pub inference: InferenceParams,
    pub difficulty_model: GbtParams,
    pub success_model: ForestParams,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = env_parse::<usize>("ENGINE_RECENT_WINDOW") {
            config.features.recent_window = val.max(1);
        }
        if let Some(val) = env_parse::<usize>("ENGINE_DOMAIN_WINDOW") {
            config.features.domain_window = val.max(1);
        }
        if let Some(val) = env_parse::<f64>("ENGINE_FLOW_TARGET") {
            config.flow.target_success_rate = val.clamp(0.0, 1.0);
        }
        if let Some(val) = env_parse::<f64>("ENGINE_FLOW_TOLERANCE") {
            config.flow.tolerance = val.clamp(0.0, 0.5);
        }
        if let Some(val) = env_parse::<f64>("ENGINE_AT_RISK_THRESHOLD") {
            config.risk.at_risk_threshold = val.clamp(0.0, 1.0);
        }
        if let Some(val) = env_parse::<f64>("ENGINE_MASTERY_TARGET") {
            config.timeline.target_proficiency = val.clamp(0.0, 1.0);
        }
        if let Some(val) = env_parse::<u64>("ENGINE_PREDICT_DEADLINE_MS") {
            config.inference.deadline_ms = Some(val);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_bounds() {
        let flow = FlowParams::default();
        assert!((flow.upper_bound() - 0.85).abs() < 1e-12);
        assert!((flow.lower_bound() - 0.55).abs() < 1e-12);
    }

    #[test]
    fn test_max_features_resolve() {
        assert_eq!(MaxFeatures::Sqrt.resolve(21), 4);
        assert_eq!(MaxFeatures::All.resolve(21), 21);
        assert_eq!(MaxFeatures::Count(50).resolve(21), 21);
        assert_eq!(MaxFeatures::Count(0).resolve(21), 1);
    }

    #[test]
    fn test_defaults_match_documented_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.features.recent_window, 10);
        assert_eq!(config.features.domain_window, 50);
        assert_eq!(config.risk.at_risk_threshold, 0.60);
        assert_eq!(config.timeline.exercises_per_day, 2);
        assert!(config.inference.deadline().is_none());
    }
}
