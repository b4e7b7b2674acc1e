//! Audio sink abstraction.
//!
//! The engine never renders audio itself. The host supplies an
//! [`AudioSink`] that can start decoded samples at precise times, route
//! them through named mix buses, and run scheduled one-shot callbacks on
//! its own timeline. All times handed to the sink are in the host clock's
//! timebase (see [`crate::clock::Clock`]).

use crate::composition::CompressorParams;
use crate::loader::DecodedBuffer;

/// Handle to a started voice, for host-side bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u64);

/// A one-shot callback run by the sink once its scheduled time arrives.
pub type TriggerCallback = Box<dyn FnOnce() + Send>;

/// The mix bus key for a group: `"<sequence>/<group>"`.
pub fn bus_key(sequence: &str, group: &str) -> String {
    format!("{sequence}/{group}")
}

/// Host-provided audio output.
pub trait AudioSink {
    /// Halt the output timeline (playback pauses, the clock keeps going).
    fn suspend(&mut self);

    /// Resume the output timeline.
    fn resume(&mut self);

    /// Run `callback` once `at` is reached on the sink timeline.
    fn schedule_trigger(&mut self, at: f64, callback: TriggerCallback);

    /// Drop every scheduled trigger and release all voices.
    ///
    /// Called on teardown; nothing scheduled before `clear` may fire
    /// afterwards.
    fn clear(&mut self);

    /// Begin playback of a decoded sample at an absolute time, routed
    /// through the named mix bus.
    fn play_sample(&mut self, buffer: &DecodedBuffer, at: f64, bus: &str) -> VoiceId;

    /// Set the linear gain of a mix bus.
    fn set_bus_gain(&mut self, bus: &str, gain: f32);

    /// Apply dynamics compressor settings to the master bus.
    fn set_compressor(&mut self, params: &CompressorParams);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// A sample submission recorded by [`RecordingSink`].
    #[derive(Clone, Debug)]
    pub struct PlayedSample {
        pub sample: String,
        pub at: f64,
        pub bus: String,
    }

    /// Sink double that records submissions and fires scheduled triggers
    /// on demand.
    #[derive(Default)]
    pub struct RecordingSink {
        pub suspended: bool,
        pub suspend_calls: u32,
        pub resume_calls: u32,
        pub played: Vec<PlayedSample>,
        pub gains: HashMap<String, f32>,
        pub compressor: Option<CompressorParams>,
        triggers: Vec<(f64, Option<TriggerCallback>)>,
        next_voice: u64,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Run all scheduled trigger callbacks due at or before `now`,
        /// in time order.
        pub fn fire_due(&mut self, now: f64) {
            self.triggers
                .sort_by(|a, b| a.0.total_cmp(&b.0));
            for (at, callback) in &mut self.triggers {
                if *at <= now {
                    if let Some(callback) = callback.take() {
                        callback();
                    }
                }
            }
            self.triggers.retain(|(_, cb)| cb.is_some());
        }

        /// Number of callbacks still waiting to fire.
        pub fn pending_triggers(&self) -> usize {
            self.triggers.len()
        }
    }

    impl AudioSink for RecordingSink {
        fn suspend(&mut self) {
            self.suspended = true;
            self.suspend_calls += 1;
        }

        fn resume(&mut self) {
            self.suspended = false;
            self.resume_calls += 1;
        }

        fn schedule_trigger(&mut self, at: f64, callback: TriggerCallback) {
            self.triggers.push((at, Some(callback)));
        }

        fn clear(&mut self) {
            self.triggers.clear();
        }

        fn play_sample(&mut self, buffer: &DecodedBuffer, at: f64, bus: &str) -> VoiceId {
            self.played.push(PlayedSample {
                sample: buffer.id.clone(),
                at,
                bus: bus.to_string(),
            });
            self.next_voice += 1;
            VoiceId(self.next_voice)
        }

        fn set_bus_gain(&mut self, bus: &str, gain: f32) {
            self.gains.insert(bus.to_string(), gain);
        }

        fn set_compressor(&mut self, params: &CompressorParams) {
            self.compressor = Some(params.clone());
        }
    }
}
