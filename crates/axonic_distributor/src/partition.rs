/// Splits `total` items into contiguous shares proportional to `weights`.
///
/// When `total` is at least the number of weights every share is non-empty;
/// otherwise the first `total` entries get one item each. Non-finite or
/// non-positive weights count as the mean of the valid ones.
pub fn partition(total: usize, weights: &[f64]) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return vec![];
    }
    if total <= n {
        return (0..n).map(|i| usize::from(i < total)).collect();
    }

    let valid: Vec<f64> = weights.iter().copied().filter(|w| w.is_finite() && *w > 0.0).collect();
    let fallback = if valid.is_empty() {
        1.0
    } else {
        valid.iter().sum::<f64>() / valid.len() as f64
    };
    let weights: Vec<f64> = weights
        .iter()
        .map(|&w| if w.is_finite() && w > 0.0 { w } else { fallback })
        .collect();
    let sum: f64 = weights.iter().sum();

    // One item each up front, the rest by largest remainder.
    let spare = total - n;
    let exact: Vec<f64> = weights.iter().map(|w| w / sum * spare as f64).collect();
    let mut shares: Vec<usize> = exact.iter().map(|e| 1 + e.floor() as usize).collect();

    let assigned: usize = shares.iter().sum();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let (fa, fb) = (exact[a] - exact[a].floor(), exact[b] - exact[b].floor());
        fb.total_cmp(&fa).then(a.cmp(&b))
    });
    for &i in order.iter().cycle().take(total.saturating_sub(assigned)) {
        shares[i] += 1;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_weights_split_evenly() {
        assert_eq!(partition(10, &[1.0, 1.0]), vec![5, 5]);
        assert_eq!(partition(7, &[1.0, 1.0, 1.0]), vec![3, 2, 2]);
    }

    #[test]
    fn every_share_is_non_empty() {
        let shares = partition(5, &[1000.0, 1.0, 1.0]);
        assert_eq!(shares.iter().sum::<usize>(), 5);
        assert!(shares.iter().all(|s| *s >= 1));
        assert_eq!(shares[0], 3);
    }

    #[test]
    fn fewer_items_than_devices() {
        assert_eq!(partition(2, &[1.0, 5.0, 1.0]), vec![1, 1, 0]);
        assert_eq!(partition(0, &[1.0]), vec![0]);
        assert!(partition(3, &[]).is_empty());
    }

    #[test]
    fn invalid_weights_use_the_mean() {
        assert_eq!(partition(8, &[f64::NAN, 2.0, 0.0, 2.0]), vec![2, 2, 2, 2]);
    }
}
