use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::tree::{FeatureSubset, RegressionTree, TreeParams};
use super::{check_width, normalize, validate_matrix, TrainingError, WidthMismatch};
use crate::config::GbtParams;

/// Least-squares gradient boosting over CART trees with row and column
/// subsampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedRegressor {
    params: GbtParams,
    base_score: f64,
    trees: Vec<RegressionTree>,
    n_features: usize,
}

fn check_params(params: &GbtParams) -> Result<(), TrainingError> {
    if params.n_estimators == 0 {
        return Err(TrainingError::InvalidOptions("n_estimators must be positive".into()));
    }
    if !(params.learning_rate > 0.0 && params.learning_rate.is_finite()) {
        return Err(TrainingError::InvalidOptions(format!(
            "learning_rate must be positive, got {}",
            params.learning_rate
        )));
    }
    for (name, fraction) in [
        ("subsample", params.subsample),
        ("colsample_bytree", params.colsample_bytree),
    ] {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(TrainingError::InvalidOptions(format!(
                "{name} must be in (0, 1], got {fraction}"
            )));
        }
    }
    Ok(())
}

fn fraction_of(n: usize, fraction: f64) -> usize {
    ((n as f64 * fraction).round() as usize).clamp(1, n.max(1))
}

impl GradientBoostedRegressor {
    pub fn fit(x: &[Vec<f64>], y: &[f64], params: &GbtParams) -> Result<Self, TrainingError> {
        check_params(params)?;
        let width = x.first().map(Vec::len).unwrap_or(0);
        validate_matrix(x, y.len(), width)?;
        if let Some(row) = y.iter().position(|v| !v.is_finite()) {
            return Err(TrainingError::NonFiniteInput { row });
        }

        let n = x.len();
        let base_score = y.iter().sum::<f64>() / n as f64;
        let mut predictions = vec![base_score; n];
        let mut residuals = vec![0.0; n];
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            min_samples_leaf: params.min_samples_leaf,
        };
        let n_rows = fraction_of(n, params.subsample);
        let n_cols = fraction_of(width, params.colsample_bytree);

        let mut trees = Vec::with_capacity(params.n_estimators);
        for _ in 0..params.n_estimators {
            for i in 0..n {
                residuals[i] = y[i] - predictions[i];
            }

            let mut rows = sample(&mut rng, n, n_rows).into_vec();
            rows.sort_unstable();
            let mut cols = sample(&mut rng, width, n_cols.min(width)).into_vec();
            cols.sort_unstable();

            let tree = RegressionTree::fit(
                x,
                &residuals,
                &rows,
                &FeatureSubset::Fixed(cols),
                &tree_params,
                &mut rng,
            );
            for (pred, row) in predictions.iter_mut().zip(x) {
                *pred += params.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }

        tracing::debug!(n_samples = n, n_trees = trees.len(), "gradient boosting fitted");
        Ok(Self {
            params: params.clone(),
            base_score,
            trees,
            n_features: width,
        })
    }

    pub fn predict(&self, row: &[f64]) -> Result<f64, WidthMismatch> {
        check_width(row, self.n_features)?;
        Ok(self.base_score
            + self.params.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>())
    }

    /// Model output for an input carrying no information beyond the training
    /// distribution: the base score plus every tree's root value.
    pub fn expected_value(&self) -> f64 {
        self.base_score
            + self.params.learning_rate * self.trees.iter().map(RegressionTree::root_value).sum::<f64>()
    }

    /// Per-feature path attribution; `expected_value() + sum == predict(row)`.
    pub fn contributions(&self, row: &[f64]) -> Result<Vec<f64>, WidthMismatch> {
        check_width(row, self.n_features)?;
        let mut out = vec![0.0; self.n_features];
        for tree in &self.trees {
            tree.accumulate_contributions(row, self.params.learning_rate, &mut out);
        }
        Ok(out)
    }

    pub fn feature_importances(&self) -> Vec<f64> {
        let mut total = vec![0.0; self.n_features];
        for tree in &self.trees {
            for (slot, value) in total.iter_mut().zip(tree.feature_importances()) {
                *slot += value;
            }
        }
        normalize(total)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn params(&self) -> &GbtParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_data(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..n)
            .map(|i| vec![(i % 10) as f64 / 10.0, ((i * 7) % 13) as f64])
            .collect();
        let y: Vec<f64> = x.iter().map(|row| 1.0 + 4.0 * row[0]).collect();
        (x, y)
    }

    fn small_params() -> GbtParams {
        GbtParams {
            n_estimators: 30,
            colsample_bytree: 1.0,
            ..GbtParams::default()
        }
    }

    #[test]
    fn test_fit_reduces_error() {
        let (x, y) = linear_data(80);
        let model = GradientBoostedRegressor::fit(&x, &y, &small_params()).unwrap();
        let mae: f64 = x
            .iter()
            .zip(&y)
            .map(|(row, target)| (model.predict(row).unwrap() - target).abs())
            .sum::<f64>()
            / y.len() as f64;
        assert!(mae < 0.3, "mae {mae}");
        assert_eq!(model.n_trees(), 30);
    }

    #[test]
    fn test_contributions_are_additive() {
        let (x, y) = linear_data(60);
        let model = GradientBoostedRegressor::fit(&x, &y, &GbtParams::default()).unwrap();
        for row in x.iter().take(10) {
            let total = model.expected_value() + model.contributions(row).unwrap().iter().sum::<f64>();
            assert!((total - model.predict(row).unwrap()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_importances_favour_signal() {
        let (x, y) = linear_data(80);
        let model = GradientBoostedRegressor::fit(&x, &y, &small_params()).unwrap();
        let importances = model.feature_importances();
        assert!((importances.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(importances[0] > importances[1]);
    }

    #[test]
    fn test_same_seed_same_model() {
        let (x, y) = linear_data(40);
        let a = GradientBoostedRegressor::fit(&x, &y, &small_params()).unwrap();
        let b = GradientBoostedRegressor::fit(&x, &y, &small_params()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_predict_rejects_wrong_width() {
        let (x, y) = linear_data(20);
        let model = GradientBoostedRegressor::fit(&x, &y, &small_params()).unwrap();
        assert_eq!(
            model.predict(&[1.0]),
            Err(WidthMismatch { expected: 2, found: 1 })
        );
    }

    #[test]
    fn test_invalid_params_rejected() {
        let (x, y) = linear_data(20);
        let params = GbtParams {
            subsample: 0.0,
            ..GbtParams::default()
        };
        assert!(matches!(
            GradientBoostedRegressor::fit(&x, &y, &params),
            Err(TrainingError::InvalidOptions(_))
        ));
    }
}
