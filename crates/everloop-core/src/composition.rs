//! Composition data model.
//!
//! A composition is a declarative description of a piece:
//!
//! - [`Composition`] - the root object (sequences, start list, compressor)
//! - [`Sequence`] - a named, fixed-tempo block of beats that can repeat
//! - [`Group`] - a beat-positioned voice inside a sequence
//! - [`WeightedEntry`] - an element of a weighted candidate list
//!
//! Compositions are deserialized from JSON, normalized, validated once at
//! load time, and are read-only afterwards. [`CompositionIndex`] is the
//! derived by-name lookup built alongside validation.

use crate::errors::{EngineError, Result};
use crate::select::validate_weights;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One element of a weighted candidate list.
///
/// Entries are either a bare value or a value with an explicit probability
/// in percent. Elements without an explicit probability split the remainder
/// of the 100% budget evenly.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum WeightedEntry<T> {
    /// A value with an explicit probability in percent.
    Weighted { value: T, probability: f64 },
    /// A bare value sharing the implicit remainder.
    Bare(T),
}

impl<T> WeightedEntry<T> {
    /// The candidate value.
    pub fn value(&self) -> &T {
        match self {
            WeightedEntry::Weighted { value, .. } => value,
            WeightedEntry::Bare(value) => value,
        }
    }

    /// The explicit probability, if one was given.
    pub fn probability(&self) -> Option<f64> {
        match self {
            WeightedEntry::Weighted { probability, .. } => Some(*probability),
            WeightedEntry::Bare(_) => None,
        }
    }
}

impl<T> From<T> for WeightedEntry<T> {
    fn from(value: T) -> Self {
        WeightedEntry::Bare(value)
    }
}

/// Dynamics compressor settings, passed through to the audio sink.
///
/// Defaults match the common hardware-style compressor curve.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressorParams {
    pub threshold: f32,
    pub knee: f32,
    pub ratio: f32,
    pub attack: f32,
    pub release: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold: -24.0,
            knee: 30.0,
            ratio: 12.0,
            attack: 0.003,
            release: 0.25,
        }
    }
}

/// A beat-positioned voice within a sequence.
///
/// Each play, one sample is chosen from the weighted `samples` list.
/// `beat` is 1-based for normal beats; values at or below zero are
/// pickup positions sounding before beat 1.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group name, unique within its sequence. Defaults to the group's
    /// index (stringified) when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Beat position within the sequence.
    pub beat: f64,
    /// Candidate sample identifiers.
    #[serde(default)]
    pub samples: Vec<WeightedEntry<String>>,
    /// Linear gain applied to this group's mix bus.
    #[serde(default = "default_gain")]
    pub gain: f32,
}

fn default_gain() -> f32 {
    1.0
}

impl Group {
    /// Beat position converted to a 0-based offset.
    ///
    /// Normal (positive) beats are 1-based and shift down by one; pickup
    /// beats at or below zero stay as given, yielding a negative offset.
    pub fn effective_beat(&self) -> f64 {
        if self.beat > 0.0 {
            self.beat - 1.0
        } else {
            self.beat
        }
    }
}

/// A named, fixed-tempo block of beats that can repeat and link to
/// successor sequences.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    /// Unique name within the composition.
    pub name: String,
    /// Tempo in beats per minute. Must be positive.
    pub bpm: f64,
    /// Length of one revolution, in beats. Must be positive.
    pub num_beats: f64,
    /// Inclusive lower bound on consecutive revolutions.
    pub min_revolutions: u32,
    /// Inclusive upper bound on consecutive revolutions.
    pub max_revolutions: u32,
    /// The revolution count must be a multiple of this. Must be at least 1.
    #[serde(default = "default_divisible_by")]
    pub divisible_by: u32,
    /// Weighted candidate successors. Empty means terminal.
    #[serde(default)]
    pub next: Vec<WeightedEntry<String>>,
    /// Absolute time (seconds from composition start) by which this
    /// sequence must be forced to begin.
    #[serde(default)]
    pub next_after: Option<f64>,
    /// Voices of this sequence, in declaration order.
    #[serde(default)]
    pub groups: Vec<Group>,
}

fn default_divisible_by() -> u32 {
    1
}

impl Sequence {
    /// Duration of one revolution in seconds.
    pub fn duration(&self) -> f64 {
        60.0 * self.num_beats / self.bpm
    }

    /// The largest pre-roll any group of this sequence needs, in seconds.
    ///
    /// Zero when no group sounds before beat 1.
    pub fn pickup_preroll(&self) -> f64 {
        self.groups
            .iter()
            .map(|g| (-g.effective_beat()).max(0.0) * 60.0 / self.bpm)
            .fold(0.0, f64::max)
    }
}

/// Root composition object.
///
/// Immutable once loaded; replacing it requires rebuilding the derived
/// [`CompositionIndex`].
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    /// Weighted candidates for the first sequence of the piece.
    #[serde(default)]
    pub start: Vec<WeightedEntry<String>>,
    /// Dynamics compressor settings, passed through to the sink.
    #[serde(default)]
    pub compressor: Option<CompressorParams>,
    /// All sequences, in declaration order. Names must be unique.
    pub sequences: Vec<Sequence>,
}

impl Composition {
    /// Parse a composition from its JSON input format.
    ///
    /// Group names default to the group's index. The result is not yet
    /// validated; that happens in [`CompositionIndex::build`].
    pub fn from_json(input: &str) -> Result<Self> {
        let mut composition: Composition = serde_json::from_str(input)
            .map_err(|e| EngineError::config(format!("malformed composition: {e}")))?;
        composition.assign_default_group_names();
        Ok(composition)
    }

    fn assign_default_group_names(&mut self) {
        for sequence in &mut self.sequences {
            for (i, group) in sequence.groups.iter_mut().enumerate() {
                if group.name.is_none() {
                    group.name = Some(i.to_string());
                }
            }
        }
    }
}

/// Read-only by-name index over a validated composition.
///
/// Built once at load time; shares the composition via `Arc` so the
/// walker, layout builder, and scheduler can all hold it cheaply.
#[derive(Clone, Debug)]
pub struct CompositionIndex {
    composition: Arc<Composition>,
    by_name: HashMap<String, usize>,
}

impl CompositionIndex {
    /// Validate a composition and build its index.
    ///
    /// Checks all load-time invariants: positive bpm and beat counts,
    /// `divisible_by >= 1`, unique sequence names, unique group names per
    /// sequence, and well-formed probability sums on every weighted list.
    pub fn build(mut composition: Composition) -> Result<Self> {
        composition.assign_default_group_names();

        let mut by_name = HashMap::new();
        for (i, sequence) in composition.sequences.iter().enumerate() {
            if by_name.insert(sequence.name.clone(), i).is_some() {
                return Err(EngineError::config(format!(
                    "duplicate sequence name '{}'",
                    sequence.name
                )));
            }
            if sequence.bpm <= 0.0 {
                return Err(EngineError::config(format!(
                    "sequence '{}' has non-positive bpm {}",
                    sequence.name, sequence.bpm
                )));
            }
            if sequence.num_beats <= 0.0 {
                return Err(EngineError::config(format!(
                    "sequence '{}' has non-positive numBeats {}",
                    sequence.name, sequence.num_beats
                )));
            }
            if sequence.divisible_by == 0 {
                return Err(EngineError::config(format!(
                    "sequence '{}' has divisibleBy 0",
                    sequence.name
                )));
            }
            validate_weights(&sequence.next).map_err(|e| {
                EngineError::config(format!("sequence '{}' next list: {e}", sequence.name))
            })?;

            let mut group_names = HashSet::new();
            for group in &sequence.groups {
                let name = group.name.as_deref().unwrap_or_default();
                if !group_names.insert(name.to_string()) {
                    return Err(EngineError::config(format!(
                        "duplicate group name '{}' in sequence '{}'",
                        name, sequence.name
                    )));
                }
                validate_weights(&group.samples).map_err(|e| {
                    EngineError::config(format!(
                        "group '{}' in sequence '{}': {e}",
                        name, sequence.name
                    ))
                })?;
            }
        }
        validate_weights(&composition.start)
            .map_err(|e| EngineError::config(format!("start list: {e}")))?;

        Ok(Self {
            composition: Arc::new(composition),
            by_name,
        })
    }

    /// The underlying composition.
    pub fn composition(&self) -> &Composition {
        &self.composition
    }

    /// Look up a sequence by name.
    pub fn sequence(&self, name: &str) -> Option<&Sequence> {
        self.by_name
            .get(name)
            .map(|&i| &self.composition.sequences[i])
    }

    /// Look up a sequence by name, failing with a graph error on a
    /// dangling reference.
    pub fn resolve(&self, name: &str) -> Result<&Sequence> {
        self.sequence(name)
            .ok_or_else(|| EngineError::graph(format!("unknown sequence '{name}'")))
    }

    /// The largest pickup pre-roll any group in the composition needs,
    /// in seconds.
    pub fn max_pickup_preroll(&self) -> f64 {
        self.composition
            .sequences
            .iter()
            .map(Sequence::pickup_preroll)
            .fold(0.0, f64::max)
    }
}
