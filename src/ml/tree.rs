use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::normalize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 5,
            min_samples_split: 2,
            min_samples_leaf: 1,
        }
    }
}

/// Features a tree may split on.
#[derive(Debug, Clone)]
pub enum FeatureSubset {
    All,
    /// Drawn once per tree (column subsampling).
    Fixed(Vec<usize>),
    /// `k` features drawn afresh at every split.
    PerSplit(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
        samples: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        value: f64,
        samples: usize,
    },
}

impl Node {
    /// Mean target of the training rows that reached this node.
    pub fn value(&self) -> f64 {
        match self {
            Node::Leaf { value, .. } | Node::Split { value, .. } => *value,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// CART regression tree over a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    n_features: usize,
    gains: Vec<f64>,
}

struct GrowContext<'a, R> {
    x: &'a [Vec<f64>],
    y: &'a [f64],
    subset: &'a FeatureSubset,
    params: &'a TreeParams,
    rng: &'a mut R,
}

impl RegressionTree {
    /// Fits on `rows` (indices into `x`/`y`, repeats allowed for bootstrap
    /// samples). Inputs must already be validated.
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        y: &[f64],
        rows: &[usize],
        subset: &FeatureSubset,
        params: &TreeParams,
        rng: &mut R,
    ) -> Self {
        let n_features = x.first().map(|row| row.len()).unwrap_or(0);
        let mut tree = Self {
            nodes: Vec::new(),
            n_features,
            gains: vec![0.0; n_features],
        };

        if rows.is_empty() {
            tree.nodes.push(Node::Leaf {
                value: 0.0,
                samples: 0,
            });
            return tree;
        }

        let mut ctx = GrowContext {
            x,
            y,
            subset,
            params,
            rng,
        };
        tree.grow(&mut ctx, rows.to_vec(), 0);
        tree
    }

    fn grow<R: Rng>(&mut self, ctx: &mut GrowContext<'_, R>, rows: Vec<usize>, depth: usize) -> usize {
        let n = rows.len();
        let mean = rows.iter().map(|&r| ctx.y[r]).sum::<f64>() / n as f64;
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: mean,
            samples: n,
        });

        let min_leaf = ctx.params.min_samples_leaf.max(1);
        if depth >= ctx.params.max_depth
            || n < ctx.params.min_samples_split.max(2)
            || n < 2 * min_leaf
        {
            return idx;
        }

        let features = self.candidate_features(ctx);
        let best = best_split(ctx.x, ctx.y, &rows, &features, min_leaf).or_else(|| {
            // a sampled subset of constant columns falls through to the rest
            if !matches!(ctx.subset, FeatureSubset::PerSplit(_)) {
                return None;
            }
            let rest: Vec<usize> = (0..self.n_features).filter(|f| !features.contains(f)).collect();
            best_split(ctx.x, ctx.y, &rows, &rest, min_leaf)
        });
        let Some(best) = best else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| ctx.x[r][best.feature] <= best.threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return idx;
        }

        self.gains[best.feature] += best.gain;
        let left = self.grow(ctx, left_rows, depth + 1);
        let right = self.grow(ctx, right_rows, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
            value: mean,
            samples: n,
        };
        idx
    }

    fn candidate_features<R: Rng>(&self, ctx: &mut GrowContext<'_, R>) -> Vec<usize> {
        match ctx.subset {
            FeatureSubset::All => (0..self.n_features).collect(),
            FeatureSubset::Fixed(features) => features.clone(),
            FeatureSubset::PerSplit(k) => {
                let k = (*k).clamp(1, self.n_features.max(1)).min(self.n_features);
                let mut picked = sample(&mut *ctx.rng, self.n_features, k).into_vec();
                picked.sort_unstable();
                picked
            }
        }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.nodes
            .get(self.leaf_index(row))
            .map(Node::value)
            .unwrap_or(0.0)
    }

    fn leaf_index(&self, row: &[f64]) -> usize {
        let mut idx = 0;
        while let Some(Node::Split {
            feature,
            threshold,
            left,
            right,
            ..
        }) = self.nodes.get(idx)
        {
            let value = row.get(*feature).copied().unwrap_or(0.0);
            idx = if value <= *threshold { *left } else { *right };
        }
        idx
    }

    /// Adds `scale * (child - parent)` to `out[feature]` for every split on the
    /// decision path of `row`. Returns the leaf value, which equals the root
    /// value plus the sum of the added terms (before scaling).
    pub fn accumulate_contributions(&self, row: &[f64], scale: f64, out: &mut [f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    value,
                    ..
                }) => {
                    let x = row.get(*feature).copied().unwrap_or(0.0);
                    let next = if x <= *threshold { *left } else { *right };
                    let child = self.nodes.get(next).map(Node::value).unwrap_or(*value);
                    if let Some(slot) = out.get_mut(*feature) {
                        *slot += scale * (child - value);
                    }
                    idx = next;
                }
                Some(Node::Leaf { value, .. }) => return *value,
                None => return 0.0,
            }
        }
    }

    pub fn root_value(&self) -> f64 {
        self.nodes.first().map(Node::value).unwrap_or(0.0)
    }

    /// Split gain per feature, normalised to sum to one.
    pub fn feature_importances(&self) -> Vec<f64> {
        normalize(self.gains.clone())
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Best variance-reducing split over `features`, scanning each sorted column
/// with prefix sums. Returns `None` when no split improves the parent.
fn best_split(
    x: &[Vec<f64>],
    y: &[f64],
    rows: &[usize],
    features: &[usize],
    min_leaf: usize,
) -> Option<Candidate> {
    let n = rows.len();
    let total_sum: f64 = rows.iter().map(|&r| y[r]).sum();
    let total_sq: f64 = rows.iter().map(|&r| y[r] * y[r]).sum();
    let parent_sse = total_sq - total_sum * total_sum / n as f64;

    let mut best: Option<Candidate> = None;
    let mut sorted: Vec<(f64, f64)> = Vec::with_capacity(n);

    for &feature in features {
        sorted.clear();
        sorted.extend(rows.iter().map(|&r| (x[r][feature], y[r])));
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut left_sum = 0.0;
        let mut left_sq = 0.0;
        for i in 1..n {
            let (prev_x, prev_y) = sorted[i - 1];
            left_sum += prev_y;
            left_sq += prev_y * prev_y;

            if i < min_leaf || n - i < min_leaf || prev_x == sorted[i].0 {
                continue;
            }

            let right_n = (n - i) as f64;
            let right_sum = total_sum - left_sum;
            let right_sq = total_sq - left_sq;
            let left_sse = left_sq - left_sum * left_sum / i as f64;
            let right_sse = right_sq - right_sum * right_sum / right_n;
            let gain = parent_sse - left_sse - right_sse;

            if gain > 1e-12 && best.map_or(true, |b| gain > b.gain) {
                let mut threshold = (prev_x + sorted[i].0) / 2.0;
                if threshold >= sorted[i].0 {
                    threshold = prev_x;
                }
                best = Some(Candidate {
                    feature,
                    threshold,
                    gain,
                });
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn step_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let y: Vec<f64> = (0..20).map(|i| if i < 10 { 1.0 } else { 4.0 }).collect();
        (x, y)
    }

    #[test]
    fn test_fits_step_function() {
        let (x, y) = step_data();
        let rows: Vec<usize> = (0..x.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let tree = RegressionTree::fit(&x, &y, &rows, &FeatureSubset::All, &TreeParams::default(), &mut rng);

        assert_eq!(tree.predict(&[3.0, 0.0]), 1.0);
        assert_eq!(tree.predict(&[15.0, 0.0]), 4.0);
        assert_eq!(tree.depth(), 1);
        let importances = tree.feature_importances();
        assert_eq!(importances, vec![1.0, 0.0]);
    }

    #[test]
    fn test_respects_max_depth_and_min_leaf() {
        let x: Vec<Vec<f64>> = (0..32).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..32).map(|i| (i * i) as f64).collect();
        let rows: Vec<usize> = (0..32).collect();
        let params = TreeParams {
            max_depth: 2,
            min_samples_split: 2,
            min_samples_leaf: 5,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let tree = RegressionTree::fit(&x, &y, &rows, &FeatureSubset::All, &params, &mut rng);

        assert!(tree.depth() <= 2);
        for node in &tree.nodes {
            if let Node::Leaf { samples, .. } = node {
                assert!(*samples >= 5);
            }
        }
    }

    #[test]
    fn test_contributions_decompose_prediction() {
        let (x, y) = step_data();
        let rows: Vec<usize> = (0..x.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let tree = RegressionTree::fit(&x, &y, &rows, &FeatureSubset::All, &TreeParams::default(), &mut rng);

        for row in &x {
            let mut out = vec![0.0; 2];
            let leaf = tree.accumulate_contributions(row, 1.0, &mut out);
            assert!((tree.root_value() + out.iter().sum::<f64>() - leaf).abs() < 1e-9);
            assert_eq!(leaf, tree.predict(row));
        }
    }

    #[test]
    fn test_constant_target_is_single_leaf() {
        let x: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let y = vec![2.0; 10];
        let rows: Vec<usize> = (0..10).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let tree = RegressionTree::fit(&x, &y, &rows, &FeatureSubset::PerSplit(1), &TreeParams::default(), &mut rng);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.predict(&[100.0]), 2.0);
        assert_eq!(tree.feature_importances(), vec![0.0]);
    }
}
