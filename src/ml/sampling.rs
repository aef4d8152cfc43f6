use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub type Fold = (Vec<usize>, Vec<usize>);

fn shuffled(n: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    indices
}

/// Held-out size, rounded up and kept strictly between 0 and `n`.
fn test_count(n: usize, test_size: f64) -> usize {
    if n < 2 {
        return 0;
    }
    ((n as f64 * test_size).ceil() as usize).clamp(1, n - 1)
}

/// Shuffled split into `(train, test)` index sets.
pub fn train_test_split(n: usize, test_size: f64, seed: u64) -> Fold {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let indices = shuffled(n, &mut rng);
    let n_test = test_count(n, test_size);
    let test = indices[..n_test].to_vec();
    let train = indices[n_test..].to_vec();
    (train, test)
}

/// Split that keeps each class's share in both halves. Every class with at
/// least two members contributes at least one row to each side.
pub fn stratified_split(labels: &[bool], test_size: f64, seed: u64) -> Fold {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in [false, true] {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        let n_test = test_count(members.len(), test_size);
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// `k` shuffled folds of near-equal size; the first `n % k` folds get one extra row.
pub fn kfold(n: usize, k: usize, seed: u64) -> Vec<Fold> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let indices = shuffled(n, &mut rng);
    let k = k.clamp(1, n.max(1));

    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = n / k + usize::from(fold < n % k);
        let test = indices[start..start + size].to_vec();
        let train = indices[..start]
            .iter()
            .chain(&indices[start + size..])
            .copied()
            .collect();
        folds.push((train, test));
        start += size;
    }
    folds
}

/// Folds dealt round-robin per class so every fold sees both classes when
/// the class has at least `k` members.
pub fn stratified_kfold(labels: &[bool], k: usize, seed: u64) -> Vec<Fold> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let k = k.clamp(1, labels.len().max(1));
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); k];

    let mut offset = 0;
    for class in [false, true] {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        for (pos, idx) in members.into_iter().enumerate() {
            buckets[(pos + offset) % k].push(idx);
        }
        offset += labels.iter().filter(|&&l| l == class).count();
    }

    (0..k)
        .map(|fold| {
            let mut test = buckets[fold].clone();
            test.sort_unstable();
            let mut train: Vec<usize> = buckets
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != fold)
                .flat_map(|(_, bucket)| bucket.iter().copied())
                .collect();
            train.sort_unstable();
            (train, test)
        })
        .collect()
}

/// Random oversampling of the minority class among `indices` until both
/// classes are equally represented. Returns the indices unchanged when one
/// class is absent.
pub fn oversample_minority<R: Rng>(indices: &[usize], labels: &[bool], rng: &mut R) -> Vec<usize> {
    let (positives, negatives): (Vec<usize>, Vec<usize>) =
        indices.iter().copied().partition(|&i| labels[i]);
    let (minority, majority_len) = if positives.len() < negatives.len() {
        (positives, negatives.len())
    } else {
        (negatives, positives.len())
    };
    if minority.is_empty() {
        return indices.to_vec();
    }

    let mut balanced = indices.to_vec();
    for _ in minority.len()..majority_len {
        balanced.push(minority[rng.gen_range(0..minority.len())]);
    }
    balanced
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_split_partitions_indices() {
        let (train, test) = train_test_split(10, 0.2, 42);
        assert_eq!(test.len(), 2);
        assert_eq!(train.len(), 8);
        let all: HashSet<usize> = train.iter().chain(&test).copied().collect();
        assert_eq!(all.len(), 10);
        assert_eq!(train_test_split(10, 0.2, 42), (train, test));
    }

    #[test]
    fn test_stratified_split_keeps_both_classes() {
        let labels: Vec<bool> = (0..20).map(|i| i < 4).collect();
        let (train, test) = stratified_split(&labels, 0.2, 42);
        assert!(test.iter().any(|&i| labels[i]));
        assert!(train.iter().any(|&i| labels[i]));
        assert_eq!(train.len() + test.len(), 20);
    }

    #[test]
    fn test_kfold_covers_every_row_once() {
        let folds = kfold(11, 5, 1);
        assert_eq!(folds.len(), 5);
        let mut seen: Vec<usize> = folds.iter().flat_map(|(_, test)| test.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());
        for (train, test) in &folds {
            assert_eq!(train.len() + test.len(), 11);
        }
    }

    #[test]
    fn test_stratified_kfold_spreads_minority() {
        let labels: Vec<bool> = (0..25).map(|i| i % 5 == 0).collect();
        let folds = stratified_kfold(&labels, 5, 3);
        for (_, test) in &folds {
            assert_eq!(test.iter().filter(|&&i| labels[i]).count(), 1);
        }
    }

    #[test]
    fn test_oversample_balances_only_given_rows() {
        let labels = vec![true, false, false, false, false, true];
        let train = vec![0, 1, 2, 3, 4];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let balanced = oversample_minority(&train, &labels, &mut rng);
        assert_eq!(balanced.iter().filter(|&&i| labels[i]).count(), 4);
        assert_eq!(balanced.iter().filter(|&&i| !labels[i]).count(), 4);
        assert!(!balanced.contains(&5));
    }
}
