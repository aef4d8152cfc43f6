//! Adaptive difficulty and performance prediction for exercise-based learning.
//!
//! The crate turns a learner's attempt history into a recommended next
//! difficulty, a probability of success, an at-risk ranking and a mastery
//! projection, each with a feature-level explanation.

pub mod config;
pub mod db;
pub mod engine;
pub mod logging;
pub mod ml;
pub mod modeling;
pub mod registry;
pub mod services;
pub mod types;

pub use config::{Config, EngineConfig};
pub use engine::AdaptiveEngine;
pub use registry::ModelRegistry;
