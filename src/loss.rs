//! Softmax cross-entropy over class logits.
//!
//! Losses are *summed* over the batch (not averaged). The gradient handed to
//! backprop is therefore `softmax(logits) - onehot(label)` per row with no `1/B`
//! factor, which scales the effective learning rate with the batch size.

/// Summed cross-entropy over a batch of logits.
///
/// Shape contract: `logits.len() == labels.len() * nclasses`.
pub fn cross_entropy_sum(logits: &[f32], labels: &[usize], nclasses: usize) -> f32 {
    assert_eq!(
        logits.len(),
        labels.len() * nclasses,
        "logits len {} does not match batch * nclasses ({} * {nclasses})",
        logits.len(),
        labels.len()
    );

    let mut total = 0.0_f32;
    for (row, &label) in logits.chunks_exact(nclasses).zip(labels) {
        let (log_sum_exp, _max) = log_sum_exp_and_max(row);
        total += log_sum_exp - row[label];
    }
    total
}

/// Summed cross-entropy + gradient w.r.t. the logits.
///
/// Writes `d_logits = softmax(logits) - onehot(label)` row by row and returns the
/// summed loss.
pub fn cross_entropy_sum_backward(
    logits: &[f32],
    labels: &[usize],
    nclasses: usize,
    d_logits: &mut [f32],
) -> f32 {
    assert_eq!(
        logits.len(),
        labels.len() * nclasses,
        "logits len {} does not match batch * nclasses ({} * {nclasses})",
        logits.len(),
        labels.len()
    );
    assert_eq!(
        logits.len(),
        d_logits.len(),
        "logits len {} does not match d_logits len {}",
        logits.len(),
        d_logits.len()
    );

    let mut total = 0.0_f32;
    for ((row, d_row), &label) in logits
        .chunks_exact(nclasses)
        .zip(d_logits.chunks_exact_mut(nclasses))
        .zip(labels)
    {
        let (log_sum_exp, _max) = log_sum_exp_and_max(row);
        total += log_sum_exp - row[label];

        for (d, &x) in d_row.iter_mut().zip(row) {
            *d = (x - log_sum_exp).exp();
        }
        d_row[label] -= 1.0;
    }
    total
}

/// Row-wise softmax of a batch of logits, written into `probs`.
pub fn softmax_rows(logits: &[f32], nclasses: usize, probs: &mut [f32]) {
    assert_eq!(logits.len(), probs.len(), "softmax output shape mismatch");
    for (row, out) in logits
        .chunks_exact(nclasses)
        .zip(probs.chunks_exact_mut(nclasses))
    {
        let (log_sum_exp, _max) = log_sum_exp_and_max(row);
        for (p, &x) in out.iter_mut().zip(row) {
            *p = (x - log_sum_exp).exp();
        }
    }
}

#[inline]
fn log_sum_exp_and_max(xs: &[f32]) -> (f32, f32) {
    let mut max_x = xs[0];
    for &x in xs.iter().skip(1) {
        if x > max_x {
            max_x = x;
        }
    }
    let mut sum_exp = 0.0_f32;
    for &x in xs {
        sum_exp += (x - max_x).exp();
    }
    (max_x + sum_exp.ln(), max_x)
}
