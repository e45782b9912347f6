//! Disjoint partition of judged queries for cross-validation.

use rand::seq::SliceRandom;
use rand::Rng;

use rw_types::{config_error, Judgments, RwResult};

/// Judged queries split into `n` disjoint folds.
#[derive(Debug, Clone)]
pub struct Folds<'a> {
    folds: Vec<Vec<&'a Judgments>>,
}

impl<'a> Folds<'a> {
    /// Shuffle, then deal round-robin. Needs at least two folds.
    pub fn partition<R: Rng + ?Sized>(judgments: &'a [Judgments], n_folds: usize, rng: &mut R) -> RwResult<Self> {
        if n_folds < 2 {
            return Err(config_error!("nFolds must be at least 2, got {n_folds}"));
        }
        let mut shuffled: Vec<&Judgments> = judgments.iter().collect();
        shuffled.shuffle(rng);

        let mut folds = vec![Vec::new(); n_folds];
        for (i, j) in shuffled.into_iter().enumerate() {
            folds[i % n_folds].push(j);
        }
        Ok(Self { folds })
    }

    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }

    /// Fold held out in `generation`.
    pub fn held_out(&self, generation: usize) -> usize {
        generation % self.folds.len()
    }

    pub fn test(&self, fold: usize) -> &[&'a Judgments] {
        &self.folds[fold]
    }

    /// Every fold except `fold`.
    pub fn train(&self, fold: usize) -> Vec<&'a Judgments> {
        self.folds
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != fold)
            .flat_map(|(_, f)| f.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rw_types::{QueryInfo, RwError};
    use std::collections::HashSet;

    fn queries(n: usize) -> Vec<Judgments> {
        (0..n)
            .map(|i| Judgments::new(QueryInfo::for_query(format!("q{i}"))).with_judgment("d", 1.0))
            .collect()
    }

    #[test]
    fn folds_are_disjoint_and_balanced() {
        let all = queries(10);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let folds = Folds::partition(&all, 3, &mut rng).unwrap();
        assert_eq!(folds.len(), 3);

        let sizes: Vec<usize> = (0..3).map(|f| folds.test(f).len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);

        let mut seen = HashSet::new();
        for f in 0..3 {
            for j in folds.test(f) {
                assert!(seen.insert(j.query_info.query_id.clone()));
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn train_is_complement_of_held_out() {
        let all = queries(7);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let folds = Folds::partition(&all, 2, &mut rng).unwrap();
        for generation in 0..4 {
            let fold = folds.held_out(generation);
            assert_eq!(fold, generation % 2);
            assert_eq!(folds.train(fold).len() + folds.test(fold).len(), 7);
        }
    }

    #[test]
    fn single_fold_is_rejected() {
        let all = queries(3);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(Folds::partition(&all, 1, &mut rng), Err(RwError::Config(_))));
    }
}
