//! Tree ensembles fitted in-process.
//!
//! Both model families are built from the same CART regression tree. The
//! classifier fits its trees on 0/1 targets so a leaf value is the positive
//! class share, which keeps every prediction decomposable along its path.

pub mod evaluation;
pub mod forest;
pub mod gbt;
pub mod metrics;
pub mod sampling;
pub mod tree;

use serde::{Deserialize, Serialize};

pub use evaluation::{
    fit_classifier, fit_regressor, ClassDistribution, ClassificationMetrics, RegressionMetrics,
};
pub use forest::RandomForestClassifier;
pub use gbt::GradientBoostedRegressor;
pub use tree::{FeatureSubset, RegressionTree, TreeParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} features, got {found}")]
pub struct WidthMismatch {
    pub expected: usize,
    pub found: usize,
}

pub fn check_width(row: &[f64], expected: usize) -> Result<(), WidthMismatch> {
    if row.len() == expected {
        Ok(())
    } else {
        Err(WidthMismatch {
            expected,
            found: row.len(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("insufficient training data: {0}")]
    InsufficientTrainingData(String),
    #[error("feature width mismatch: {0}")]
    FeatureWidthMismatch(#[from] WidthMismatch),
    #[error("{rows} rows but {targets} targets")]
    LengthMismatch { rows: usize, targets: usize },
    #[error("non-finite value in training data at row {row}")]
    NonFiniteInput { row: usize },
    #[error("invalid training options: {0}")]
    InvalidOptions(String),
    #[error("model registration failed: {0}")]
    Registry(#[from] crate::registry::RegistryError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOptions {
    pub test_size: f64,
    pub cv_folds: usize,
    pub balance_classes: bool,
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            cv_folds: 5,
            balance_classes: true,
            seed: 42,
        }
    }
}

impl TrainOptions {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(TrainingError::InvalidOptions(format!(
                "test_size must be in (0, 1), got {}",
                self.test_size
            )));
        }
        if self.cv_folds < 2 {
            return Err(TrainingError::InvalidOptions(format!(
                "cv_folds must be at least 2, got {}",
                self.cv_folds
            )));
        }
        Ok(())
    }
}

/// Shape and finiteness checks shared by both learners.
pub fn validate_matrix(x: &[Vec<f64>], n_targets: usize, width: usize) -> Result<(), TrainingError> {
    if x.len() != n_targets {
        return Err(TrainingError::LengthMismatch {
            rows: x.len(),
            targets: n_targets,
        });
    }
    if x.is_empty() {
        return Err(TrainingError::InsufficientTrainingData(
            "no training rows".to_string(),
        ));
    }
    for (i, row) in x.iter().enumerate() {
        check_width(row, width)?;
        if row.iter().any(|v| !v.is_finite()) {
            return Err(TrainingError::NonFiniteInput { row: i });
        }
    }
    Ok(())
}

/// Normalises raw gain totals so they sum to one. All-zero input stays zero.
pub(crate) fn normalize(mut values: Vec<f64>) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        for v in values.iter_mut() {
            *v /= total;
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        assert!(TrainOptions::default().validate().is_ok());
        let bad = TrainOptions {
            test_size: 1.0,
            ..TrainOptions::default()
        };
        assert!(matches!(bad.validate(), Err(TrainingError::InvalidOptions(_))));
        let bad = TrainOptions {
            cv_folds: 1,
            ..TrainOptions::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validate_matrix_reports_width() {
        let x = vec![vec![1.0, 2.0], vec![1.0]];
        match validate_matrix(&x, 2, 2) {
            Err(TrainingError::FeatureWidthMismatch(err)) => {
                assert_eq!(err, WidthMismatch { expected: 2, found: 1 })
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            validate_matrix(&x, 3, 2),
            Err(TrainingError::LengthMismatch { rows: 2, targets: 3 })
        ));
        let x = vec![vec![f64::INFINITY, 0.0]];
        assert!(matches!(
            validate_matrix(&x, 1, 2),
            Err(TrainingError::NonFiniteInput { row: 0 })
        ));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(vec![1.0, 3.0]), vec![0.25, 0.75]);
        assert_eq!(normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
