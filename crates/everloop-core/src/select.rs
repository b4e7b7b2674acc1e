//! Weighted random selection.
//!
//! Two primitives drive all nondeterminism in the engine:
//!
//! - [`Selector::select_element`] - pick from a weighted candidate list
//! - [`Selector::select_integer`] - pick an integer from a stepped range
//!
//! The entropy source is injected so tests can run with a seeded generator.

use crate::composition::WeightedEntry;
use crate::errors::{EngineError, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Explicit probabilities may exceed 100 by this much before the list is
/// rejected, to absorb floating-point noise in hand-written compositions.
const SUM_TOLERANCE: f64 = 1.0;

/// Validate the explicit probabilities of a weighted list.
///
/// Fails when any explicit probability is negative or when the explicit
/// sum exceeds 101.
pub fn validate_weights<T>(candidates: &[WeightedEntry<T>]) -> Result<()> {
    let mut sum = 0.0;
    for entry in candidates {
        if let Some(p) = entry.probability() {
            if p < 0.0 {
                return Err(EngineError::config(format!("negative probability {p}")));
            }
            sum += p;
        }
    }
    if sum > 100.0 + SUM_TOLERANCE {
        return Err(EngineError::config(format!(
            "explicit probabilities sum to {sum}, exceeding 100"
        )));
    }
    Ok(())
}

/// Random selection engine with an injectable entropy source.
pub struct Selector {
    rng: Box<dyn RngCore + Send>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    /// Create a selector seeded from the operating system.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Create a deterministically seeded selector.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Create a selector around an arbitrary generator.
    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self { rng: Box::new(rng) }
    }

    /// Pick one element from a weighted candidate list.
    ///
    /// Returns `None` for an empty list. Explicit probabilities are taken
    /// as given; elements without one split the remaining budget evenly.
    /// A uniform draw over `[0, 100)` walks the cumulative probabilities
    /// in list order, and the last element absorbs any remainder left by
    /// rounding or an under-100 explicit sum.
    pub fn select_element<'a, T>(
        &mut self,
        candidates: &'a [WeightedEntry<T>],
    ) -> Result<Option<&'a T>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        validate_weights(candidates)?;

        let explicit_sum: f64 = candidates.iter().filter_map(WeightedEntry::probability).sum();
        let implicit_count = candidates
            .iter()
            .filter(|e| e.probability().is_none())
            .count();
        let implicit_share = if implicit_count > 0 {
            (100.0 - explicit_sum).max(0.0) / implicit_count as f64
        } else {
            0.0
        };

        let draw: f64 = (&mut *self.rng).random_range(0.0..100.0);
        let mut cumulative = 0.0;
        for entry in candidates {
            cumulative += entry.probability().unwrap_or(implicit_share);
            if draw < cumulative {
                return Ok(Some(entry.value()));
            }
        }
        // Rounding left part of [0, 100) unconsumed; the last element is
        // the fallback.
        Ok(candidates.last().map(WeightedEntry::value))
    }

    /// Pick an integer of the form `low + k * step` within `[low, high]`,
    /// uniformly over the valid values of `k`.
    ///
    /// When `high < low` the single valid value is `low`. A zero step is
    /// a configuration error.
    pub fn select_integer(&mut self, low: u32, high: u32, step: u32) -> Result<u32> {
        if step == 0 {
            return Err(EngineError::config("selection step must be positive"));
        }
        if high <= low {
            return Ok(low);
        }
        let count = (high - low) / step + 1;
        let k = (&mut *self.rng).random_range(0..count);
        Ok(low + k * step)
    }
}
