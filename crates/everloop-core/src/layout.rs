//! Layout building: turning one sequence instance into trigger events.
//!
//! [`lay_out`] converts a sequence at a given base offset into concrete
//! [`TriggerEvent`]s, one per group, picking one sample per group from its
//! weighted list. Output follows group declaration order, not time order;
//! the scheduler dispatches each event independently.
//!
//! [`render_arrangement`] walks the whole graph offline and produces a
//! normalized, time-sorted layout of the piece up to a length limit.

use crate::composition::{CompositionIndex, Sequence};
use crate::errors::Result;
use crate::graph::GraphWalker;
use crate::select::Selector;

/// A single concrete sample trigger.
///
/// Ephemeral: produced by the layout builder, consumed once by the
/// scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerEvent {
    /// Absolute trigger time in seconds from composition start. May be
    /// negative for pickup groups laid out at offset zero.
    pub time: f64,
    /// Name of the owning sequence.
    pub sequence: String,
    /// Name of the owning group.
    pub group: String,
    /// The chosen sample identifier.
    pub sample: String,
    /// Linear gain of the owning group's bus.
    pub gain: f32,
}

/// Lay out one revolution of a sequence starting at `base_offset`.
///
/// Normal beats are 1-based: beat 1 lands exactly on `base_offset`.
/// Pickup beats (at or below zero) keep their value and land before it.
/// Groups whose sample list is empty are skipped.
pub fn lay_out(
    sequence: &Sequence,
    base_offset: f64,
    selector: &mut Selector,
) -> Result<Vec<TriggerEvent>> {
    let mut layout = Vec::with_capacity(sequence.groups.len());
    for group in &sequence.groups {
        let sample = match selector.select_element(&group.samples)? {
            Some(sample) => sample.clone(),
            None => {
                log::debug!(
                    "group '{}' in sequence '{}' has no samples, skipping",
                    group.name.as_deref().unwrap_or_default(),
                    sequence.name
                );
                continue;
            }
        };
        layout.push(TriggerEvent {
            time: base_offset + group.effective_beat() * 60.0 / sequence.bpm,
            sequence: sequence.name.clone(),
            group: group.name.clone().unwrap_or_default(),
            sample,
            gain: group.gain,
        });
    }
    Ok(layout)
}

/// Walk the graph offline and lay out the whole piece.
///
/// Useful for previews and tests: no clock, no sink, just the arrangement
/// a playback run could produce. Traversal stops at the terminal state or
/// once the insertion point passes `limit_seconds`, whichever comes
/// first. The result is sorted by time and shifted so the earliest event
/// sits at exactly 0.0.
pub fn render_arrangement(
    index: &CompositionIndex,
    selector: &mut Selector,
    limit_seconds: f64,
) -> Result<Vec<TriggerEvent>> {
    let mut walker = GraphWalker::new(index);
    let mut layout = Vec::new();
    let mut insertion_point = 0.0;
    let mut previous: Option<String> = None;

    while insertion_point <= limit_seconds {
        let next = match walker.advance(index, selector, insertion_point, previous.as_deref())? {
            Some(next) => next,
            None => break,
        };
        let sequence = index.resolve(&next.sequence)?;
        for _ in 0..next.revolutions {
            layout.extend(lay_out(sequence, insertion_point, selector)?);
            insertion_point += sequence.duration();
        }
        previous = Some(next.sequence);
    }

    Ok(normalize(layout))
}

/// Sort a layout by time and shift it so it starts at exactly 0.0.
fn normalize(mut layout: Vec<TriggerEvent>) -> Vec<TriggerEvent> {
    layout.sort_by(|a, b| a.time.total_cmp(&b.time));
    if let Some(first) = layout.first() {
        let offset = first.time;
        for event in &mut layout {
            event.time -= offset;
        }
    }
    layout
}
