use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::tree::{FeatureSubset, RegressionTree, TreeParams};
use super::{check_width, normalize, validate_matrix, TrainingError, WidthMismatch};
use crate::config::ForestParams;

/// Bagged binary classifier. Each tree is fitted on 0/1 targets, so leaves
/// hold the positive share and the forest probability is their mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestClassifier {
    params: ForestParams,
    trees: Vec<RegressionTree>,
    n_features: usize,
}

impl RandomForestClassifier {
    pub fn fit(x: &[Vec<f64>], y: &[bool], params: &ForestParams) -> Result<Self, TrainingError> {
        if params.n_estimators == 0 {
            return Err(TrainingError::InvalidOptions("n_estimators must be positive".into()));
        }
        let width = x.first().map(Vec::len).unwrap_or(0);
        validate_matrix(x, y.len(), width)?;

        let n = x.len();
        let targets: Vec<f64> = y.iter().map(|&label| if label { 1.0 } else { 0.0 }).collect();
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            min_samples_leaf: params.min_samples_leaf,
        };
        let subset = FeatureSubset::PerSplit(params.max_features.resolve(width));

        // one independent stream per tree keeps the result independent of scheduling
        let trees: Vec<RegressionTree> = (0..params.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = ChaCha8Rng::seed_from_u64(params.seed.wrapping_add(t as u64));
                let rows: Vec<usize> = if params.bootstrap {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                RegressionTree::fit(x, &targets, &rows, &subset, &tree_params, &mut rng)
            })
            .collect();

        tracing::debug!(n_samples = n, n_trees = trees.len(), "random forest fitted");
        Ok(Self {
            params: params.clone(),
            trees,
            n_features: width,
        })
    }

    pub fn predict_proba(&self, row: &[f64]) -> Result<f64, WidthMismatch> {
        check_width(row, self.n_features)?;
        if self.trees.is_empty() {
            return Ok(0.5);
        }
        let sum: f64 = self.trees.iter().map(|t| t.predict(row)).sum();
        Ok((sum / self.trees.len() as f64).clamp(0.0, 1.0))
    }

    pub fn predict(&self, row: &[f64]) -> Result<bool, WidthMismatch> {
        Ok(self.predict_proba(row)? >= 0.5)
    }

    /// Mean root value across trees: the bootstrap positive rate.
    pub fn expected_value(&self) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        self.trees.iter().map(RegressionTree::root_value).sum::<f64>() / self.trees.len() as f64
    }

    /// Per-feature path attribution averaged over trees;
    /// `expected_value() + sum == predict_proba(row)`.
    pub fn contributions(&self, row: &[f64]) -> Result<Vec<f64>, WidthMismatch> {
        check_width(row, self.n_features)?;
        let mut out = vec![0.0; self.n_features];
        if self.trees.is_empty() {
            return Ok(out);
        }
        let scale = 1.0 / self.trees.len() as f64;
        for tree in &self.trees {
            tree.accumulate_contributions(row, scale, &mut out);
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

    pub fn params(&self) -> &ForestParams {
        &self.params
    }
}
