//! Hold-out and cross-validated fitting for both model families.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::forest::RandomForestClassifier;
use super::gbt::GradientBoostedRegressor;
use super::metrics::{self, Confusion};
use super::sampling;
use super::{validate_matrix, TrainOptions, TrainingError};
use crate::config::{ForestParams, GbtParams};

const MIN_TARGET_VARIANCE: f64 = 1e-9;
const MIN_MINORITY_COUNT: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub train_mae: f64,
    pub test_mae: f64,
    pub train_r2: f64,
    pub test_r2: f64,
    pub cv_mae_mean: f64,
    pub cv_mae_std: f64,
    pub n_samples: usize,
    pub n_features: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub positive: usize,
    pub negative: usize,
}

impl ClassCounts {
    fn of(rows: &[usize], labels: &[bool]) -> Self {
        let positive = rows.iter().filter(|&&i| labels[i]).count();
        Self {
            positive,
            negative: rows.len() - positive,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDistribution {
    /// Rows the final model was fitted on, after any rebalancing.
    pub train: ClassCounts,
    pub test: ClassCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Absent when the held-out split holds a single class.
    pub auc: Option<f64>,
    pub cv_auc_mean: Option<f64>,
    pub cv_auc_std: Option<f64>,
    pub class_distribution: ClassDistribution,
    pub n_samples: usize,
    pub n_features: usize,
}

fn select<T: Clone>(values: &[T], rows: &[usize]) -> Vec<T> {
    rows.iter().map(|&i| values[i].clone()).collect()
}

fn predict_all(model: &GradientBoostedRegressor, x: &[Vec<f64>]) -> Result<Vec<f64>, TrainingError> {
    x.iter()
        .map(|row| model.predict(row).map_err(TrainingError::from))
        .collect()
}

fn proba_all(model: &RandomForestClassifier, x: &[Vec<f64>]) -> Result<Vec<f64>, TrainingError> {
    x.iter()
        .map(|row| model.predict_proba(row).map_err(TrainingError::from))
        .collect()
}

/// Fits the difficulty regressor on the training split and reports hold-out
/// and k-fold scores. The returned model is the training-split fit.
pub fn fit_regressor(
    x: &[Vec<f64>],
    y: &[f64],
    width: usize,
    options: &TrainOptions,
    params: &GbtParams,
) -> Result<(GradientBoostedRegressor, RegressionMetrics), TrainingError> {
    options.validate()?;
    validate_matrix(x, y.len(), width)?;
    if x.len() < options.cv_folds {
        return Err(TrainingError::InsufficientTrainingData(format!(
            "{} samples for {} folds",
            x.len(),
            options.cv_folds
        )));
    }
    if let Some(row) = y.iter().position(|v| !v.is_finite()) {
        return Err(TrainingError::NonFiniteInput { row });
    }
    if metrics::variance(y) < MIN_TARGET_VARIANCE {
        return Err(TrainingError::InsufficientTrainingData(
            "target has near-zero variance".to_string(),
        ));
    }

    let (train, test) = sampling::train_test_split(x.len(), options.test_size, options.seed);
    let (x_train, y_train) = (select(x, &train), select(y, &train));
    let (x_test, y_test) = (select(x, &test), select(y, &test));

    let model = GradientBoostedRegressor::fit(&x_train, &y_train, params)?;
    let train_pred = predict_all(&model, &x_train)?;
    let test_pred = predict_all(&model, &x_test)?;

    let folds = sampling::kfold(x.len(), options.cv_folds, options.seed);
    let cv_scores = folds
        .par_iter()
        .map(|(fold_train, fold_test)| -> Result<f64, TrainingError> {
            let fold_model = GradientBoostedRegressor::fit(&select(x, fold_train), &select(y, fold_train), params)?;
            let pred = predict_all(&fold_model, &select(x, fold_test))?;
            Ok(metrics::mae(&select(y, fold_test), &pred))
        })
        .collect::<Result<Vec<f64>, TrainingError>>()?;
    let (cv_mae_mean, cv_mae_std) = metrics::mean_std(&cv_scores);

    let report = RegressionMetrics {
        train_mae: metrics::mae(&y_train, &train_pred),
        test_mae: metrics::mae(&y_test, &test_pred),
        train_r2: metrics::r2(&y_train, &train_pred),
        test_r2: metrics::r2(&y_test, &test_pred),
        cv_mae_mean,
        cv_mae_std,
        n_samples: x.len(),
        n_features: width,
    };
    tracing::info!(
        test_mae = report.test_mae,
        test_r2 = report.test_r2,
        cv_mae_mean,
        "difficulty regressor trained"
    );
    Ok((model, report))
}

fn training_rows(rows: &[usize], labels: &[bool], options: &TrainOptions, salt: u64) -> Vec<usize> {
    if options.balance_classes {
        let mut rng = ChaCha8Rng::seed_from_u64(options.seed.wrapping_add(salt));
        sampling::oversample_minority(rows, labels, &mut rng)
    } else {
        rows.to_vec()
    }
}

/// Fits the success classifier on a stratified training split, rebalancing
/// only that split, and reports hold-out and stratified k-fold scores.
pub fn fit_classifier(
    x: &[Vec<f64>],
    y: &[bool],
    width: usize,
    options: &TrainOptions,
    params: &ForestParams,
) -> Result<(RandomForestClassifier, ClassificationMetrics), TrainingError> {
    options.validate()?;
    validate_matrix(x, y.len(), width)?;
    if x.len() < options.cv_folds {
        return Err(TrainingError::InsufficientTrainingData(format!(
            "{} samples for {} folds",
            x.len(),
            options.cv_folds
        )));
    }
    let positives = y.iter().filter(|&&l| l).count();
    let minority = positives.min(y.len() - positives);
    if minority == 0 {
        return Err(TrainingError::InsufficientTrainingData(
            "target holds a single class".to_string(),
        ));
    }
    if minority < MIN_MINORITY_COUNT {
        return Err(TrainingError::InsufficientTrainingData(format!(
            "minority class has {minority} sample(s)"
        )));
    }

    let (train, test) = sampling::stratified_split(y, options.test_size, options.seed);
    let fit_rows = training_rows(&train, y, options, 0);
    let model = RandomForestClassifier::fit(&select(x, &fit_rows), &select(y, &fit_rows), params)?;

    let y_test = select(y, &test);
    let scores = proba_all(&model, &select(x, &test))?;
    let predicted: Vec<bool> = scores.iter().map(|p| *p >= 0.5).collect();
    let confusion = Confusion::from_labels(&y_test, &predicted);

    let folds = sampling::stratified_kfold(y, options.cv_folds, options.seed);
    let fold_aucs = folds
        .par_iter()
        .enumerate()
        .map(|(i, (fold_train, fold_test))| -> Result<Option<f64>, TrainingError> {
            let rows = training_rows(fold_train, y, options, i as u64 + 1);
            let fold_model = RandomForestClassifier::fit(&select(x, &rows), &select(y, &rows), params)?;
            let fold_scores = proba_all(&fold_model, &select(x, fold_test))?;
            Ok(metrics::roc_auc(&fold_scores, &select(y, fold_test)))
        })
        .collect::<Result<Vec<Option<f64>>, TrainingError>>()?;
    let fold_aucs: Vec<f64> = fold_aucs.into_iter().flatten().collect();
    let (cv_auc_mean, cv_auc_std) = if fold_aucs.is_empty() {
        (None, None)
    } else {
        let (m, s) = metrics::mean_std(&fold_aucs);
        (Some(m), Some(s))
    };

    let report = ClassificationMetrics {
        accuracy: confusion.accuracy(),
        precision: confusion.precision(),
        recall: confusion.recall(),
        f1: confusion.f1(),
        auc: metrics::roc_auc(&scores, &y_test),
        cv_auc_mean,
        cv_auc_std,
        class_distribution: ClassDistribution {
            train: ClassCounts::of(&fit_rows, y),
            test: ClassCounts::of(&test, y),
        },
        n_samples: x.len(),
        n_features: width,
    };
    tracing::info!(
        accuracy = report.accuracy,
        auc = ?report.auc,
        cv_auc_mean = ?report.cv_auc_mean,
        "success classifier trained"
    );
    Ok((model, report))
}
