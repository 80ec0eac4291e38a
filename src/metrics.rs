//! Metrics.
//!
//! Evaluation helpers; nothing here participates in backprop.

/// Index of the largest value; ties resolve to the first occurrence.
///
/// Returns `None` for an empty slice.
pub fn argmax<T: PartialOrd + Copy>(values: &[T]) -> Option<usize> {
    let mut best: Option<(usize, T)> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.is_none_or(|(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

/// Fraction of predictions equal to the labels.
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> f32 {
    assert_eq!(
        predictions.len(),
        labels.len(),
        "predictions len {} does not match labels len {}",
        predictions.len(),
        labels.len()
    );
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions.iter().zip(labels).filter(|(p, y)| p == y).count();
    correct as f32 / labels.len() as f32
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Round to two decimal places.
#[inline]
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Mean of fractional accuracies expressed as a percentage with two decimals.
pub fn percent(accuracies: &[f32]) -> f64 {
    let values: Vec<f64> = accuracies.iter().map(|&a| f64::from(a)).collect();
    round2(100.0 * mean(&values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_breaks_ties_by_first_occurrence() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), Some(1));
        assert_eq!(argmax(&[5.0_f64, 5.0]), Some(0));
        assert_eq!(argmax::<f32>(&[]), None);
    }

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[0, 1, 1, 0], &[0, 1, 0, 0]), 0.75);
    }

    #[test]
    fn percent_rounds_to_two_decimals() {
        assert_eq!(percent(&[1.0, 0.5, 0.5]), 66.67);
        assert_eq!(round2(12.344_9), 12.34);
    }
}
