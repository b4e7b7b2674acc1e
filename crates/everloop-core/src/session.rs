//! Playback session: the public control surface.
//!
//! A [`PlaybackSession`] composes the whole engine: it owns the sink, the
//! clock, the asset broker, and the scheduler of the current run. The
//! host drives it cooperatively:
//!
//! ```ignore
//! let mut session = PlaybackSession::new(sink, SystemClock::new(), WavFileLoader);
//! session.load(composition, "assets")?;
//! let events = session.events();
//! session.play()?;
//! loop {
//!     session.tick()?;
//!     std::thread::sleep(Duration::from_millis(100));
//! }
//! ```
//!
//! Notifications arrive on the receiver returned by
//! [`PlaybackSession::events`]; calling [`PlaybackSession::stop`] while
//! handling one is always safe.

use crate::clock::Clock;
use crate::composition::{Composition, CompositionIndex, CompressorParams};
use crate::errors::{EngineError, Result};
use crate::events::PlayerEvent;
use crate::layout::{render_arrangement, TriggerEvent};
use crate::loader::{AssetBroker, AssetLoader};
use crate::scheduler::{CurrentLoop, CurrentLoopHandle, LookaheadScheduler, SchedulerConfig};
use crate::select::Selector;
use crate::sink::{bus_key, AudioSink};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;

/// Owns one playback timeline over a loaded composition.
pub struct PlaybackSession<S: AudioSink, C: Clock> {
    sink: S,
    clock: C,
    assets: AssetBroker,
    index: Option<CompositionIndex>,
    scheduler: Option<LookaheadScheduler>,
    config: SchedulerConfig,
    seed: Option<u64>,
    /// Host-clock time of the current run's composition time zero.
    start_time: f64,
    paused: bool,
    events_tx: Sender<PlayerEvent>,
    events_rx: Receiver<PlayerEvent>,
    current: CurrentLoopHandle,
}

impl<S: AudioSink, C: Clock> PlaybackSession<S, C> {
    /// Create a session around the host collaborators.
    pub fn new(sink: S, clock: C, loader: impl AssetLoader + 'static) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            sink,
            clock,
            assets: AssetBroker::new(loader),
            index: None,
            scheduler: None,
            config: SchedulerConfig::default(),
            seed: None,
            start_time: 0.0,
            paused: false,
            events_tx,
            events_rx,
            current: Arc::default(),
        }
    }

    /// Override the look-ahead watermarks.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Pin the entropy source for deterministic runs.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    /// A receiver for playback notifications.
    ///
    /// All receivers share one queue: each event is delivered to exactly
    /// one of them. Hand the receiver to a single consumer.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events_rx.clone()
    }

    /// Access to the asset broker, e.g. for warming the cache.
    pub fn assets_mut(&mut self) -> &mut AssetBroker {
        &mut self.assets
    }

    /// Validate and install a composition, stopping any current run.
    pub fn load(&mut self, composition: Composition, base_url: &str) -> Result<()> {
        self.stop();
        self.index = Some(CompositionIndex::build(composition)?);
        self.assets.set_base_url(base_url);
        Ok(())
    }

    /// Parse and [`PlaybackSession::load`] a composition from JSON.
    pub fn load_json(&mut self, json: &str, base_url: &str) -> Result<()> {
        self.load(Composition::from_json(json)?, base_url)
    }

    /// Start playback from composition time zero.
    ///
    /// Resets all runtime state of any earlier run, applies group gains
    /// and compressor settings to the sink, and primes the first
    /// look-ahead window.
    pub fn play(&mut self) -> Result<()> {
        let index = self
            .index
            .clone()
            .ok_or_else(|| EngineError::config("no composition loaded"))?;
        self.teardown();
        self.paused = false;
        self.start_time = self.clock.now();
        self.apply_mix_params(&index);

        let selector = match self.seed {
            Some(seed) => Selector::seeded(seed),
            None => Selector::new(),
        };
        let mut scheduler = LookaheadScheduler::new(
            index,
            selector,
            self.events_tx.clone(),
            self.current.clone(),
            self.config,
            self.start_time,
        );
        scheduler.start(&mut self.sink);
        self.scheduler = Some(scheduler);
        self.tick()
    }

    /// One cooperative cycle; call this periodically (around 100ms).
    ///
    /// A graph error aborts the run: an `Ended` notification with the
    /// error description is raised and the session returns to idle.
    pub fn tick(&mut self) -> Result<()> {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Ok(());
        };
        let now = self.clock.now() - self.start_time;
        match scheduler.tick(now, &mut self.sink, &mut self.assets) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.events_tx.send(PlayerEvent::Ended {
                    error: Some(e.to_string()),
                });
                self.teardown();
                Err(e)
            }
        }
    }

    /// Suspend the sink without losing any committed state.
    pub fn pause(&mut self) {
        if self.scheduler.is_none() || self.paused {
            return;
        }
        self.paused = true;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.set_user_paused(true);
        }
        self.sink.suspend();
    }

    /// Resume after [`PlaybackSession::pause`].
    ///
    /// When the scheduler is itself waiting on assets, actual resumption
    /// is deferred to its buffering check.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        let mut waiting = false;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.set_user_paused(false);
            waiting = scheduler.is_waiting();
        }
        if !waiting {
            self.sink.resume();
        }
    }

    /// Tear down the current run unconditionally. Idempotent, and safe
    /// to call while handling a notification.
    ///
    /// In-flight asset loads are discarded (their results can only warm
    /// the cache, never reach the sink) and group gains are reset.
    pub fn stop(&mut self) {
        if self.scheduler.is_some() {
            self.sink.suspend();
            if let Some(index) = &self.index {
                for sequence in &index.composition().sequences {
                    for group in &sequence.groups {
                        let name = group.name.as_deref().unwrap_or_default();
                        self.sink.set_bus_gain(&bus_key(&sequence.name, name), 1.0);
                    }
                }
            }
        }
        self.teardown();
        self.paused = false;
    }

    /// Seconds of playback since `play()`, or zero when idle.
    pub fn current_time(&self) -> f64 {
        if self.scheduler.is_some() {
            self.clock.now() - self.start_time
        } else {
            0.0
        }
    }

    /// Whether a run is active (possibly paused or buffering).
    pub fn is_playing(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Snapshot of the revolution currently sounding.
    pub fn current_loop(&self) -> CurrentLoop {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Live-adjust one group's bus gain. Touches only the sink, never
    /// the composition.
    pub fn set_group_gain(&mut self, sequence: &str, group: &str, gain: f32) -> Result<()> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| EngineError::config("no composition loaded"))?;
        let seq = index.resolve(sequence)?;
        if !seq
            .groups
            .iter()
            .any(|g| g.name.as_deref() == Some(group))
        {
            return Err(EngineError::graph(format!(
                "unknown group '{group}' in sequence '{sequence}'"
            )));
        }
        self.sink.set_bus_gain(&bus_key(sequence, group), gain);
        Ok(())
    }

    /// Live-refresh the compressor settings on the sink.
    pub fn set_compressor(&mut self, params: &CompressorParams) {
        self.sink.set_compressor(params);
    }

    /// Lay out the whole piece offline, up to `limit_seconds`.
    ///
    /// Uses a fresh selector (seeded when a seed is pinned), so it never
    /// perturbs a running playback's draws.
    pub fn render_arrangement(&self, limit_seconds: f64) -> Result<Vec<TriggerEvent>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| EngineError::config("no composition loaded"))?;
        let mut selector = match self.seed {
            Some(seed) => Selector::seeded(seed),
            None => Selector::new(),
        };
        render_arrangement(index, &mut selector, limit_seconds)
    }

    fn apply_mix_params(&mut self, index: &CompositionIndex) {
        for sequence in &index.composition().sequences {
            for group in &sequence.groups {
                let name = group.name.as_deref().unwrap_or_default();
                self.sink
                    .set_bus_gain(&bus_key(&sequence.name, name), group.gain);
            }
        }
        if let Some(compressor) = &index.composition().compressor {
            self.sink.set_compressor(compressor);
        }
    }

    fn teardown(&mut self) {
        // Triggers already handed to the sink hold the old run's event
        // sender and epoch; none of them may fire into the next run.
        self.sink.clear();
        self.scheduler = None;
        *self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = CurrentLoop::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::loader::testing::{GatedLoader, ScriptedLoader};
    use crate::loader::DecodedBuffer;
    use crate::sink::testing::RecordingSink;

    fn single_sequence_json() -> &'static str {
        r#"{
            "start": ["A"],
            "compressor": { "threshold": -30 },
            "sequences": [
                { "name": "A", "bpm": 60, "numBeats": 2,
                  "minRevolutions": 1, "maxRevolutions": 1,
                  "groups": [
                    { "name": "kick", "beat": 1, "gain": 0.8,
                      "samples": ["kick.wav"] }
                  ] }
            ]
        }"#
    }

    fn session() -> (PlaybackSession<RecordingSink, ManualClock>, ManualClock) {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = ManualClock::new();
        let session = PlaybackSession::new(RecordingSink::new(), clock.clone(), ScriptedLoader::new());
        (session, clock)
    }

    #[test]
    fn test_play_without_load_is_a_config_error() {
        let (mut session, _clock) = session();
        assert!(matches!(session.play(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_end_to_end_single_sequence() {
        let (mut session, clock) = session();
        session.set_seed(1);
        session.load_json(single_sequence_json(), "assets").unwrap();
        session
            .assets_mut()
            .preload(DecodedBuffer::silent("kick.wav", 0.5));
        let events = session.events();

        session.play().unwrap();
        assert!(session.is_playing());

        // The one trigger went out at composition time zero.
        assert_eq!(session.sink.played.len(), 1);
        assert!((session.sink.played[0].at - 0.0).abs() < 1e-9);
        assert_eq!(session.sink.played[0].bus, "A/kick");

        // Gains and compressor reached the sink at play().
        assert!((session.sink.gains["A/kick"] - 0.8).abs() < 1e-6);
        assert!((session.sink.compressor.as_ref().unwrap().threshold + 30.0).abs() < 1e-6);

        // Run the piece to its end: 2 beats at 60 BPM is 2 seconds.
        for _ in 0..25 {
            clock.advance(0.1);
            session.tick().unwrap();
            let now = clock.now();
            session.sink.fire_due(now);
        }

        let received: Vec<PlayerEvent> = events.try_iter().collect();
        assert!(received.contains(&PlayerEvent::Waiting));
        assert!(received.contains(&PlayerEvent::Playing));
        assert!(received.iter().any(
            |e| matches!(e, PlayerEvent::SequenceStart { sequence, .. } if sequence == "A")
        ));
        assert!(received
            .iter()
            .any(|e| matches!(e, PlayerEvent::SampleStart { sample, .. } if sample == "kick.wav")));
        assert!(received.contains(&PlayerEvent::Ended { error: None }));
    }

    #[test]
    fn test_stop_is_idempotent_and_tears_down() {
        let (mut session, _clock) = session();
        session.set_seed(1);
        session.load_json(single_sequence_json(), "").unwrap();
        session
            .assets_mut()
            .preload(DecodedBuffer::silent("kick.wav", 0.5));
        session.play().unwrap();
        assert!(session.is_playing());

        session.stop();
        assert!(!session.is_playing());
        assert!((session.current_time() - 0.0).abs() < 1e-9);
        assert_eq!(session.current_loop(), CurrentLoop::default());
        // Gain parameters were reset.
        assert!((session.sink.gains["A/kick"] - 1.0).abs() < 1e-6);

        session.stop();
        assert!(!session.is_playing());
    }

    #[test]
    fn test_stop_discards_triggers_scheduled_by_the_old_run() {
        let (mut session, clock) = session();
        session.set_seed(1);
        session.load_json(single_sequence_json(), "").unwrap();
        session
            .assets_mut()
            .preload(DecodedBuffer::silent("kick.wav", 0.5));
        let events = session.events();

        session.play().unwrap();
        session.stop();
        let _ = events.try_iter().count();

        clock.advance(5.0);
        session.play().unwrap();
        session.sink.fire_due(clock.now());

        // Only the new run's due triggers fire: its start marker and
        // sample notification sit at the new epoch; nothing from the
        // stopped run (whose times are all past-due) leaks through.
        let received: Vec<PlayerEvent> = events.try_iter().collect();
        assert!(!received
            .iter()
            .any(|e| matches!(e, PlayerEvent::Ended { .. })));
        let starts = received
            .iter()
            .filter(|e| matches!(e, PlayerEvent::SequenceStart { .. }))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(session.sink.pending_triggers(), 4);
    }

    #[test]
    fn test_stop_discards_in_flight_load_submissions() {
        let (loader, gate) = GatedLoader::new();
        let clock = ManualClock::new();
        let mut session = PlaybackSession::new(RecordingSink::new(), clock.clone(), loader);
        session.set_seed(1);
        session.load_json(single_sequence_json(), "").unwrap();
        session.play().unwrap();

        // The fetch is still blocked, so nothing reached the sink yet.
        assert!(session.sink.played.is_empty());
        session.stop();
        assert_eq!(session.sink.pending_triggers(), 0);

        gate.send(()).unwrap();
        let mut results = Vec::new();
        for _ in 0..100 {
            results.extend(session.assets_mut().poll());
            if !results.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        // The late result only warmed the cache.
        assert_eq!(results.len(), 1);
        assert!(session.sink.played.is_empty());

        // A restart finds the buffer cached and submits immediately.
        session.play().unwrap();
        assert_eq!(session.sink.played.len(), 1);
    }

    #[test]
    fn test_pause_and_resume_drive_the_sink() {
        let (mut session, clock) = session();
        session.set_seed(1);
        session.load_json(single_sequence_json(), "").unwrap();
        session
            .assets_mut()
            .preload(DecodedBuffer::silent("kick.wav", 0.5));
        session.play().unwrap();
        session.tick().unwrap();
        assert!(!session.sink.suspended);

        session.pause();
        assert!(session.sink.suspended);
        clock.advance(0.5);
        session.tick().unwrap();
        // The buffering check does not fight a user pause.
        assert!(session.sink.suspended);

        session.resume();
        assert!(!session.sink.suspended);
    }

    #[test]
    fn test_graph_error_raises_ended_with_reason() {
        let (mut session, _clock) = session();
        session.set_seed(1);
        session
            .load_json(
                r#"{
                    "start": ["ghost"],
                    "sequences": [
                        { "name": "A", "bpm": 60, "numBeats": 2,
                          "minRevolutions": 1, "maxRevolutions": 1 }
                    ]
                }"#,
                "",
            )
            .unwrap();
        let events = session.events();
        assert!(session.play().is_err());
        assert!(!session.is_playing());

        let received: Vec<PlayerEvent> = events.try_iter().collect();
        assert!(received
            .iter()
            .any(|e| matches!(e, PlayerEvent::Ended { error: Some(_) })));
    }

    #[test]
    fn test_play_restarts_from_zero() {
        let (mut session, clock) = session();
        session.set_seed(1);
        session.load_json(single_sequence_json(), "").unwrap();
        session
            .assets_mut()
            .preload(DecodedBuffer::silent("kick.wav", 0.5));
        session.play().unwrap();
        clock.advance(1.0);
        session.tick().unwrap();
        assert!((session.current_time() - 1.0).abs() < 1e-9);

        session.play().unwrap();
        assert!((session.current_time() - 0.0).abs() < 1e-9);
        // The restarted run re-submitted its trigger.
        assert_eq!(session.sink.played.len(), 2);
    }

    #[test]
    fn test_set_group_gain_validates_references() {
        let (mut session, _clock) = session();
        session.load_json(single_sequence_json(), "").unwrap();
        session.set_group_gain("A", "kick", 0.3).unwrap();
        assert!((session.sink.gains["A/kick"] - 0.3).abs() < 1e-6);
        assert!(matches!(
            session.set_group_gain("A", "snare", 0.3),
            Err(EngineError::Graph(_))
        ));
        assert!(matches!(
            session.set_group_gain("Z", "kick", 0.3),
            Err(EngineError::Graph(_))
        ));
    }

    #[test]
    fn test_render_arrangement_requires_a_composition() {
        let (session, _clock) = session();
        assert!(matches!(
            session.render_arrangement(10.0),
            Err(EngineError::Config(_))
        ));
    }
}
