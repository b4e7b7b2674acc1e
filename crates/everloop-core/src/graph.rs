//! Sequence graph traversal.
//!
//! The [`GraphWalker`] decides which sequence plays next and for how many
//! revolutions, honoring three sources of intent:
//!
//! - the composition's weighted `start` and `next` edges,
//! - per-sequence revolution bounds and divisibility,
//! - deadline cues (`nextAfter`), which override graph edges outright.
//!
//! Deadline cues are kept as a stack sorted descending by time, so the
//! nearest upcoming cue is always on top. Cues fire at most once.

use crate::composition::{CompositionIndex, Sequence};
use crate::errors::{EngineError, Result};
use crate::select::Selector;

/// Bound on consecutive zero-revolution redraws before traversal is
/// declared stuck. A well-formed graph resolves in one or two draws.
const MAX_ZERO_REVOLUTION_RETRIES: usize = 128;

/// An absolute time by which a specific sequence must begin.
#[derive(Clone, Debug, PartialEq)]
pub struct DeadlineCue {
    /// Seconds from composition start.
    pub time: f64,
    /// Name of the sequence forced at this time.
    pub sequence: String,
}

/// Traversal position of the walker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkerState {
    /// No sequence has been selected yet.
    AwaitingStart,
    /// A sequence is playing; `next` edges apply.
    InSequence,
    /// The graph has run out of material.
    Terminal,
}

/// The walker's verdict: which sequence plays next, and how often.
#[derive(Clone, Debug, PartialEq)]
pub struct NextLoop {
    /// Name of the selected sequence.
    pub sequence: String,
    /// Committed consecutive revolutions. Never zero.
    pub revolutions: u32,
}

/// Walks the probabilistic sequence graph.
pub struct GraphWalker {
    state: WalkerState,
    /// Pending cues, sorted descending by time; the nearest is last.
    cues: Vec<DeadlineCue>,
}

impl GraphWalker {
    /// Create a walker for a composition, deriving its cue stack from all
    /// sequences with `nextAfter` set.
    pub fn new(index: &CompositionIndex) -> Self {
        let mut cues: Vec<DeadlineCue> = index
            .composition()
            .sequences
            .iter()
            .filter_map(|s| {
                s.next_after.map(|time| DeadlineCue {
                    time,
                    sequence: s.name.clone(),
                })
            })
            .collect();
        cues.sort_by(|a, b| b.time.total_cmp(&a.time));
        Self {
            state: WalkerState::AwaitingStart,
            cues,
        }
    }

    /// Current traversal state.
    pub fn state(&self) -> WalkerState {
        self.state
    }

    /// The nearest pending deadline cue, if any.
    pub fn next_cue(&self) -> Option<&DeadlineCue> {
        self.cues.last()
    }

    /// Decide the next loop given the current playback offset and the
    /// sequence that just finished (`None` before the first).
    ///
    /// Returns `Ok(None)` once the graph is exhausted. Sequences that
    /// would run zero revolutions are skipped and a fresh edge is drawn
    /// from them, mirroring the cascading skip of the source graph.
    pub fn advance(
        &mut self,
        index: &CompositionIndex,
        selector: &mut Selector,
        current_offset: f64,
        previous: Option<&str>,
    ) -> Result<Option<NextLoop>> {
        if self.state == WalkerState::Terminal {
            return Ok(None);
        }

        let mut previous = previous.map(str::to_string);
        for _ in 0..MAX_ZERO_REVOLUTION_RETRIES {
            let name = match self.pop_due_cue(current_offset) {
                Some(cue) => cue.sequence,
                None => {
                    let candidates = match previous.as_deref() {
                        None => &index.composition().start,
                        Some(prev) => &index.resolve(prev)?.next,
                    };
                    match selector.select_element(candidates)? {
                        Some(name) => name.clone(),
                        None => {
                            self.state = WalkerState::Terminal;
                            return Ok(None);
                        }
                    }
                }
            };

            let sequence = index.resolve(&name)?;
            let revolutions = self.draw_revolutions(selector, current_offset, sequence)?;
            if revolutions == 0 {
                log::debug!("sequence '{name}' drew zero revolutions, redrawing");
                previous = Some(name);
                continue;
            }

            self.state = WalkerState::InSequence;
            return Ok(Some(NextLoop {
                sequence: name,
                revolutions,
            }));
        }

        Err(EngineError::graph(format!(
            "traversal stuck: {MAX_ZERO_REVOLUTION_RETRIES} consecutive zero-revolution draws"
        )))
    }

    fn pop_due_cue(&mut self, current_offset: f64) -> Option<DeadlineCue> {
        match self.cues.last() {
            Some(cue) if cue.time <= current_offset => self.cues.pop(),
            _ => None,
        }
    }

    /// Draw a revolution count for `sequence`, capped so the traversal
    /// cannot overshoot the next pending deadline's entry point.
    fn draw_revolutions(
        &self,
        selector: &mut Selector,
        current_offset: f64,
        sequence: &Sequence,
    ) -> Result<u32> {
        let remaining = self.cues.last().map(|cue| cue.time - current_offset);

        if let Some(remaining) = remaining {
            if remaining <= 0.0 {
                // The deadline boundary is already upon us; consume exactly
                // one divisible block.
                return Ok(sequence.divisible_by);
            }
        }

        let drawn = selector.select_integer(
            sequence.min_revolutions,
            sequence.max_revolutions,
            sequence.divisible_by,
        )?;

        match remaining {
            None => Ok(drawn),
            Some(remaining) => {
                let blocks = (remaining / sequence.duration()).floor().max(0.0) as u64 + 1;
                let cap = blocks.saturating_mul(u64::from(sequence.divisible_by));
                let cap = u32::try_from(cap).unwrap_or(u32::MAX);
                Ok(drawn.min(cap))
            }
        }
    }
}
