//! Early stopping on held-out accuracy.
//!
//! [`EarlyStopping`] tracks the best score and the number of consecutive
//! non-improving rounds. [`train_with_early_stopping`] drives a training round
//! closure, snapshots the model (by value) whenever the score strictly improves,
//! and swaps the best snapshot back in when training ends.

use tracing::debug;

use crate::{Error, Result};

/// What a policy decided after observing one round's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Strictly better than every previous round.
    Improved,
    /// Not better, but still within tenacity.
    Stalled,
    /// Tenacity exhausted.
    Stop,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    tenacity: usize,
    enabled: bool,
    best: Option<f32>,
    stalls: usize,
}

impl EarlyStopping {
    /// `tenacity` is the number of consecutive non-improving rounds tolerated.
    /// When `enabled` is false the policy never asks to stop.
    pub fn new(tenacity: usize, enabled: bool) -> Self {
        Self {
            tenacity,
            enabled,
            best: None,
            stalls: 0,
        }
    }

    pub fn observe(&mut self, score: f32) -> Verdict {
        if self.best.is_none_or(|best| score > best) {
            self.best = Some(score);
            self.stalls = 0;
            return Verdict::Improved;
        }
        if !self.enabled {
            return Verdict::Stalled;
        }
        self.stalls += 1;
        if self.stalls >= self.tenacity {
            Verdict::Stop
        } else {
            Verdict::Stalled
        }
    }

    /// Best score observed so far.
    #[inline]
    pub fn best(&self) -> Option<f32> {
        self.best
    }
}

/// Outcome of [`train_with_early_stopping`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopReport {
    pub best_score: f32,
    /// 1-based round whose snapshot was kept.
    pub best_round: usize,
    /// Number of rounds actually run.
    pub rounds: usize,
}

/// Run `round` until the policy stops or `max_rounds` rounds have run.
///
/// `round` trains `model` for one round and returns its held-out score. At
/// least one round always runs. On return `model` holds the snapshot from the
/// best round, not the last one.
pub fn train_with_early_stopping<M, F>(
    model: &mut M,
    mut policy: EarlyStopping,
    max_rounds: usize,
    mut round: F,
) -> Result<StopReport>
where
    M: Clone,
    F: FnMut(&mut M) -> Result<f32>,
{
    let mut best: Option<(M, usize)> = None;
    let mut rounds = 0;

    loop {
        let score = round(model)?;
        rounds += 1;

        let verdict = policy.observe(score);
        debug!(round = rounds, score, ?verdict, "validation round");
        if verdict == Verdict::Improved {
            best = Some((model.clone(), rounds));
        }
        if verdict == Verdict::Stop || rounds >= max_rounds {
            break;
        }
    }

    let (snapshot, best_round) = best.ok_or_else(|| {
        Error::Diverged("no validation round produced a comparable score".to_owned())
    })?;
    *model = snapshot;

    Ok(StopReport {
        best_score: policy.best().unwrap_or_default(),
        best_round,
        rounds,
    })
}
