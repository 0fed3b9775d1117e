use rand::Rng;
use rand_distr::{weighted::WeightedIndex, Distribution};

use crate::error::{CoreError, CoreResult};

/// Draw one token id from a categorical distribution.
///
/// `weights` may be unnormalised (probabilities or any non-negative scores);
/// only their ratios matter.  Non-finite or negative entries are treated as
/// zero so a single bad logit cannot poison the draw.  An all-zero vector is
/// an error: there is nothing to sample from.
pub fn sample_categorical<R: Rng + ?Sized>(weights: &[f32], rng: &mut R) -> CoreResult<u32> {
    let cleaned: Vec<f32> = weights
        .iter()
        .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
        .collect();

    let dist = WeightedIndex::new(&cleaned)
        .map_err(|e| CoreError::Sampling(format!("invalid distribution over {} tokens: {e}", weights.len())))?;
    Ok(dist.sample(rng) as u32)
}

/// Index of the largest finite weight, first one on ties.
pub fn argmax(weights: &[f32]) -> Option<u32> {
    weights
        .iter()
        .enumerate()
        .filter(|(_, w)| w.is_finite())
        .fold(None::<(usize, f32)>, |best, (i, &w)| match best {
            Some((_, bw)) if bw >= w => best,
            _ => Some((i, w)),
        })
        .map(|(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_one_hot_always_selects_hot_index() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut weights = vec![0.0f32; 16];
        weights[11] = 1.0;
        for _ in 0..50 {
            assert_eq!(sample_categorical(&weights, &mut rng).unwrap(), 11);
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let weights = vec![1.0f32; 10];
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let xs: Vec<u32> = (0..20).map(|_| sample_categorical(&weights, &mut a).unwrap()).collect();
        let ys: Vec<u32> = (0..20).map(|_| sample_categorical(&weights, &mut b).unwrap()).collect();
        assert_eq!(xs, ys, "Same seed must produce same tokens");
    }

    #[test]
    fn test_nan_and_negative_weights_are_ignored() {
        let mut rng = StdRng::seed_from_u64(1);
        let weights = [f32::NAN, -3.0, 2.0, f32::INFINITY];
        for _ in 0..20 {
            assert_eq!(sample_categorical(&weights, &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn test_all_zero_distribution_errors() {
        let mut rng = StdRng::seed_from_u64(1);
        let result = sample_categorical(&[0.0, 0.0, 0.0], &mut rng);
        assert!(matches!(result, Err(CoreError::Sampling(_))));
    }

    #[test]
    fn test_argmax_first_max_wins() {
        assert_eq!(argmax(&[1.0, 5.0, 5.0, 2.0]), Some(1));
        assert_eq!(argmax(&[f32::NAN, 0.5]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
