//! Look-ahead scheduling.
//!
//! The [`LookaheadScheduler`] is the engine's control loop. On every tick
//! it keeps a rolling window of committed trigger events ahead of the
//! playback clock:
//!
//! - **extend** - walk the graph and lay out sequence instances until the
//!   committed watermark is `max_lookahead` seconds ahead of the clock,
//! - **gate on assets** - an instance whose samples are still loading
//!   holds the watermark until every trigger has been handed to the sink,
//! - **starvation** - when the window shrinks below `min_lookahead` the
//!   sink is suspended and a single `Waiting` notification is raised;
//!   once the window recovers the sink resumes with a single `Playing`.
//!
//! The committed watermark never decreases and no trigger is submitted
//! twice.

use crate::composition::CompositionIndex;
use crate::errors::Result;
use crate::events::PlayerEvent;
use crate::graph::GraphWalker;
use crate::layout::{lay_out, TriggerEvent};
use crate::loader::{AssetBroker, DecodedBuffer};
use crate::select::Selector;
use crate::sink::{bus_key, AudioSink};
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};

/// Look-ahead watermarks in seconds.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Extend the committed window until it is this far ahead.
    pub max_lookahead: f64,
    /// Suspend playback when the window shrinks below this.
    pub min_lookahead: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_lookahead: 10.0,
            min_lookahead: 2.0,
        }
    }
}

/// Introspection snapshot of the revolution currently sounding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CurrentLoop {
    /// Name of the sequence, `None` between pieces.
    pub sequence: Option<String>,
    /// 0-based repeat index.
    pub counter: u32,
    /// Total committed revolutions for this visit.
    pub revolutions: u32,
}

/// Shared handle to the current-loop snapshot, updated from sink-timeline
/// callbacks.
pub type CurrentLoopHandle = Arc<Mutex<CurrentLoop>>;

fn set_current(handle: &CurrentLoopHandle, value: CurrentLoop) {
    *handle.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Traversal state of the loop being laid out. `counter` counts instances
/// already laid out, so `counter == revolutions` means exhausted.
struct ActiveLoop {
    sequence: String,
    revolutions: u32,
    counter: u32,
}

/// An instance whose triggers are not all handed to the sink yet.
struct PendingInstance {
    end_time: f64,
    awaiting: Vec<TriggerEvent>,
}

/// The rolling look-ahead control loop for one playback run.
pub struct LookaheadScheduler {
    index: CompositionIndex,
    walker: GraphWalker,
    selector: Selector,
    events: Sender<PlayerEvent>,
    current_info: CurrentLoopHandle,
    config: SchedulerConfig,
    /// Host-clock time corresponding to composition time zero.
    epoch: f64,
    committed_until: f64,
    current: Option<ActiveLoop>,
    previous_sequence: Option<String>,
    pending: Option<PendingInstance>,
    waiting: bool,
    user_paused: bool,
    load_complete: bool,
    end_scheduled: bool,
    duration: f64,
    first_instance: bool,
}

impl LookaheadScheduler {
    /// Create a scheduler for one playback run starting at `epoch` on the
    /// host clock.
    ///
    /// The minimum look-ahead is raised to cover the largest pickup
    /// pre-roll in the composition, so pickups never sound before their
    /// buffers are committed.
    pub fn new(
        index: CompositionIndex,
        selector: Selector,
        events: Sender<PlayerEvent>,
        current_info: CurrentLoopHandle,
        config: SchedulerConfig,
        epoch: f64,
    ) -> Self {
        let mut config = config;
        config.min_lookahead = config.min_lookahead.max(index.max_pickup_preroll());
        let walker = GraphWalker::new(&index);
        Self {
            index,
            walker,
            selector,
            events,
            current_info,
            config,
            epoch,
            committed_until: 0.0,
            current: None,
            previous_sequence: None,
            pending: None,
            waiting: false,
            user_paused: false,
            load_complete: false,
            end_scheduled: false,
            duration: 0.0,
            first_instance: true,
        }
    }

    /// Begin the run: suspend the sink until the first window is filled.
    pub fn start(&mut self, sink: &mut dyn AudioSink) {
        sink.suspend();
        self.waiting = true;
        let _ = self.events.send(PlayerEvent::Waiting);
    }

    /// The offset through which trigger events are fully committed.
    pub fn committed_until(&self) -> f64 {
        self.committed_until
    }

    /// Whether playback is currently suspended for buffering.
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Whether the whole piece has been laid out and committed.
    pub fn is_load_complete(&self) -> bool {
        self.load_complete
    }

    /// End of the last sample committed so far, in seconds.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Inform the scheduler of a host-requested pause, so the resume
    /// check does not fight the user.
    pub fn set_user_paused(&mut self, paused: bool) {
        self.user_paused = paused;
    }

    /// One cycle of the control loop at composition time `now`.
    pub fn tick(
        &mut self,
        now: f64,
        sink: &mut dyn AudioSink,
        assets: &mut AssetBroker,
    ) -> Result<()> {
        self.absorb_fetches(sink, assets);
        self.extend(now, sink, assets)?;

        if !self.load_complete
            && !self.waiting
            && self.committed_until - now < self.config.min_lookahead
        {
            log::debug!(
                "look-ahead starved: committed {:.2}s, clock {now:.2}s",
                self.committed_until
            );
            sink.suspend();
            self.waiting = true;
            let _ = self.events.send(PlayerEvent::Waiting);
        }

        if self.waiting
            && !self.user_paused
            && (self.load_complete || self.committed_until - now >= self.config.min_lookahead)
        {
            sink.resume();
            self.waiting = false;
            let _ = self.events.send(PlayerEvent::Playing);
        }

        Ok(())
    }

    /// Hand finished fetches to the sink and commit the gated instance
    /// once nothing is awaited anymore.
    fn absorb_fetches(&mut self, sink: &mut dyn AudioSink, assets: &mut AssetBroker) {
        let results = assets.poll();
        if results.is_empty() {
            return;
        }
        let Some(mut pending) = self.pending.take() else {
            // Late results from a torn-down run only warm the cache.
            return;
        };
        for result in &results {
            match &result.result {
                Ok(buffer) => {
                    let (ready, rest): (Vec<_>, Vec<_>) = pending
                        .awaiting
                        .drain(..)
                        .partition(|e| e.sample == result.id);
                    pending.awaiting = rest;
                    for event in ready {
                        self.submit_trigger(sink, &event, buffer);
                    }
                }
                Err(e) => {
                    let before = pending.awaiting.len();
                    pending.awaiting.retain(|e| e.sample != result.id);
                    let dropped = before - pending.awaiting.len();
                    if dropped > 0 {
                        log::warn!(
                            "dropping {dropped} trigger(s) for sample '{}': {e}",
                            result.id
                        );
                    }
                }
            }
        }
        if pending.awaiting.is_empty() {
            self.commit(pending.end_time);
        } else {
            self.pending = Some(pending);
        }
    }

    /// Lay out and submit instances until the window is full, the piece
    /// ends, or an instance is gated on asset loads.
    fn extend(&mut self, now: f64, sink: &mut dyn AudioSink, assets: &mut AssetBroker) -> Result<()> {
        while !self.load_complete
            && self.pending.is_none()
            && self.committed_until - now < self.config.max_lookahead
        {
            if !self.schedule_next_instance(sink, assets)? {
                self.finish(sink);
                break;
            }
        }
        Ok(())
    }

    /// Lay out the next sequence instance at the committed watermark.
    ///
    /// Returns `false` when the graph is exhausted.
    fn schedule_next_instance(
        &mut self,
        sink: &mut dyn AudioSink,
        assets: &mut AssetBroker,
    ) -> Result<bool> {
        let exhausted = match &self.current {
            None => true,
            Some(active) => active.counter >= active.revolutions,
        };
        if exhausted {
            match self.walker.advance(
                &self.index,
                &mut self.selector,
                self.committed_until,
                self.previous_sequence.as_deref(),
            )? {
                Some(next) => {
                    self.previous_sequence = Some(next.sequence.clone());
                    self.current = Some(ActiveLoop {
                        sequence: next.sequence,
                        revolutions: next.revolutions,
                        counter: 0,
                    });
                }
                None => return Ok(false),
            }
        }

        let Some(active) = self.current.as_mut() else {
            return Ok(false);
        };
        let name = active.sequence.clone();
        let counter = active.counter;
        let revolutions = active.revolutions;
        active.counter += 1;

        let sequence = self.index.resolve(&name)?.clone();
        let mut base = self.committed_until;
        let mut layout = lay_out(&sequence, base, &mut self.selector)?;

        if self.first_instance {
            // A pickup before the nominal start shifts the whole piece
            // forward so nothing is scheduled before time zero.
            let min_time = layout.iter().map(|e| e.time).fold(f64::INFINITY, f64::min);
            if min_time < 0.0 {
                let shift = -min_time;
                for event in &mut layout {
                    event.time += shift;
                }
                base += shift;
            }
            self.first_instance = false;
        }
        let end_time = base + sequence.duration();

        self.schedule_loop_markers(sink, &name, counter, revolutions, base, end_time);

        let mut awaiting = Vec::new();
        for event in layout {
            let cached = assets.get(&event.sample).cloned();
            match cached {
                Some(buffer) => self.submit_trigger(sink, &event, &buffer),
                None => {
                    assets.request(&event.sample);
                    awaiting.push(event);
                }
            }
        }

        if awaiting.is_empty() {
            self.commit(end_time);
        } else {
            self.pending = Some(PendingInstance { end_time, awaiting });
        }
        Ok(true)
    }

    /// Schedule the sequence start/end notifications and the
    /// current-loop snapshot update on the sink timeline.
    fn schedule_loop_markers(
        &mut self,
        sink: &mut dyn AudioSink,
        name: &str,
        counter: u32,
        revolutions: u32,
        base: f64,
        end_time: f64,
    ) {
        let events = self.events.clone();
        let info = self.current_info.clone();
        let sequence = name.to_string();
        sink.schedule_trigger(
            self.epoch + base,
            Box::new(move || {
                set_current(
                    &info,
                    CurrentLoop {
                        sequence: Some(sequence.clone()),
                        counter,
                        revolutions,
                    },
                );
                let _ = events.send(PlayerEvent::SequenceStart {
                    offset: base,
                    sequence,
                    counter,
                    revolutions,
                });
            }),
        );
        let events = self.events.clone();
        let sequence = name.to_string();
        sink.schedule_trigger(
            self.epoch + end_time,
            Box::new(move || {
                let _ = events.send(PlayerEvent::SequenceEnd {
                    offset: end_time,
                    sequence,
                    counter,
                    revolutions,
                });
            }),
        );
    }

    /// Hand one trigger to the sink and schedule its notifications.
    fn submit_trigger(
        &mut self,
        sink: &mut dyn AudioSink,
        event: &TriggerEvent,
        buffer: &DecodedBuffer,
    ) {
        let bus = bus_key(&event.sequence, &event.group);
        sink.play_sample(buffer, self.epoch + event.time, &bus);
        self.duration = self.duration.max(event.time + buffer.duration);

        let events = self.events.clone();
        let sample = event.sample.clone();
        let time = event.time;
        sink.schedule_trigger(
            self.epoch + time,
            Box::new(move || {
                let _ = events.send(PlayerEvent::SampleStart { time, sample });
            }),
        );
        let events = self.events.clone();
        let sample = event.sample.clone();
        let end = time + buffer.duration;
        sink.schedule_trigger(
            self.epoch + end,
            Box::new(move || {
                let _ = events.send(PlayerEvent::SampleEnd { time: end, sample });
            }),
        );
    }

    /// Advance the committed watermark. It never moves backwards.
    fn commit(&mut self, end_time: f64) {
        self.committed_until = self.committed_until.max(end_time);
        self.pending = None;
    }

    /// The graph is exhausted: schedule the end-of-piece markers.
    fn finish(&mut self, sink: &mut dyn AudioSink) {
        self.load_complete = true;
        if self.end_scheduled {
            return;
        }
        self.end_scheduled = true;

        let info = self.current_info.clone();
        sink.schedule_trigger(
            self.epoch + self.committed_until,
            Box::new(move || set_current(&info, CurrentLoop::default())),
        );
        let events = self.events.clone();
        let end = self.duration.max(self.committed_until);
        sink.schedule_trigger(
            self.epoch + end,
            Box::new(move || {
                let _ = events.send(PlayerEvent::Ended { error: None });
            }),
        );
        log::debug!("piece fully committed, ends at {end:.2}s");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::Composition;
    use crate::loader::testing::{NeverLoader, ScriptedLoader};
    use crate::loader::AssetBroker;
    use crate::sink::testing::RecordingSink;
    use crossbeam_channel::{unbounded, Receiver};

    fn build(json: &str) -> CompositionIndex {
        CompositionIndex::build(Composition::from_json(json).unwrap()).unwrap()
    }

    fn single_sequence_json() -> &'static str {
        r#"{
            "start": ["A"],
            "sequences": [
                { "name": "A", "bpm": 60, "numBeats": 2,
                  "minRevolutions": 1, "maxRevolutions": 1,
                  "groups": [ { "beat": 1, "samples": ["kick.wav"] } ] }
            ]
        }"#
    }

    struct Fixture {
        scheduler: LookaheadScheduler,
        sink: RecordingSink,
        assets: AssetBroker,
        events: Receiver<PlayerEvent>,
        info: CurrentLoopHandle,
    }

    fn fixture(json: &str, seed: u64) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let index = build(json);
        let (tx, rx) = unbounded();
        let info: CurrentLoopHandle = Arc::default();
        let scheduler = LookaheadScheduler::new(
            index,
            Selector::seeded(seed),
            tx,
            info.clone(),
            SchedulerConfig::default(),
            0.0,
        );
        Fixture {
            scheduler,
            sink: RecordingSink::new(),
            assets: AssetBroker::new(ScriptedLoader::new()),
            events: rx,
            info,
        }
    }

    fn preload(assets: &mut AssetBroker, id: &str, duration: f64) {
        assets.preload(DecodedBuffer::silent(id, duration));
    }

    fn drain(events: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn test_single_sequence_produces_one_trigger_at_zero() {
        let mut f = fixture(single_sequence_json(), 1);
        preload(&mut f.assets, "kick.wav", 0.5);
        f.scheduler.start(&mut f.sink);
        f.scheduler.tick(0.0, &mut f.sink, &mut f.assets).unwrap();

        assert_eq!(f.sink.played.len(), 1);
        assert!((f.sink.played[0].at - 0.0).abs() < 1e-9);
        assert_eq!(f.sink.played[0].bus, "A/0");
        assert!(f.scheduler.is_load_complete());

        // One sequence of 2 beats at 60 BPM is 2 seconds; the ended
        // marker sits at the later of watermark and sample tail.
        f.sink.fire_due(2.5);
        let events = drain(&f.events);
        assert!(events.contains(&PlayerEvent::Ended { error: None }));
    }

    #[test]
    fn test_committed_until_is_monotone() {
        let json = r#"{
            "start": ["A"],
            "sequences": [
                { "name": "A", "bpm": 120, "numBeats": 2,
                  "minRevolutions": 1, "maxRevolutions": 3,
                  "next": ["A"],
                  "groups": [ { "beat": 1, "samples": ["a.wav"] } ] }
            ]
        }"#;
        let mut f = fixture(json, 17);
        preload(&mut f.assets, "a.wav", 0.25);
        f.scheduler.start(&mut f.sink);

        let mut last = 0.0;
        for step in 0..200 {
            let now = step as f64 * 0.1;
            f.scheduler.tick(now, &mut f.sink, &mut f.assets).unwrap();
            let committed = f.scheduler.committed_until();
            assert!(committed >= last, "watermark regressed at step {step}");
            last = committed;
        }
        // An endless self-loop keeps the window ahead of the clock.
        assert!(last >= 19.0 + SchedulerConfig::default().max_lookahead - 1.0);
    }

    #[test]
    fn test_window_fills_then_playing_is_emitted_once() {
        let json = r#"{
            "start": ["A"],
            "sequences": [
                { "name": "A", "bpm": 60, "numBeats": 4,
                  "minRevolutions": 1, "maxRevolutions": 1,
                  "next": ["A"],
                  "groups": [ { "beat": 1, "samples": ["a.wav"] } ] }
            ]
        }"#;
        let mut f = fixture(json, 3);
        preload(&mut f.assets, "a.wav", 1.0);
        f.scheduler.start(&mut f.sink);
        assert!(f.sink.suspended);

        f.scheduler.tick(0.0, &mut f.sink, &mut f.assets).unwrap();
        f.scheduler.tick(0.1, &mut f.sink, &mut f.assets).unwrap();
        assert!(!f.sink.suspended);
        assert!(!f.scheduler.is_waiting());

        let events = drain(&f.events);
        let waiting = events.iter().filter(|e| **e == PlayerEvent::Waiting).count();
        let playing = events.iter().filter(|e| **e == PlayerEvent::Playing).count();
        assert_eq!(waiting, 1);
        assert_eq!(playing, 1);
        assert_eq!(f.sink.suspend_calls, 1);
        assert_eq!(f.sink.resume_calls, 1);
    }

    #[test]
    fn test_stalled_loader_keeps_waiting_and_submits_nothing() {
        let mut f = fixture(single_sequence_json(), 1);
        f.assets = AssetBroker::new(NeverLoader::new());
        f.scheduler.start(&mut f.sink);

        for step in 0..50 {
            let now = step as f64 * 0.1;
            f.scheduler.tick(now, &mut f.sink, &mut f.assets).unwrap();
        }

        assert!(f.sink.played.is_empty());
        assert!(f.sink.suspended);
        assert!(f.scheduler.is_waiting());
        assert!((f.scheduler.committed_until() - 0.0).abs() < 1e-9);

        let events = drain(&f.events);
        let waiting = events.iter().filter(|e| **e == PlayerEvent::Waiting).count();
        assert_eq!(waiting, 1);
        assert!(!events.contains(&PlayerEvent::Playing));
    }

    #[test]
    fn test_failed_asset_drops_trigger_but_playback_continues() {
        let json = r#"{
            "start": ["A"],
            "sequences": [
                { "name": "A", "bpm": 60, "numBeats": 2,
                  "minRevolutions": 1, "maxRevolutions": 1,
                  "groups": [
                    { "name": "good", "beat": 1, "samples": ["good.wav"] },
                    { "name": "bad", "beat": 2, "samples": ["bad.wav"] }
                  ] }
            ]
        }"#;
        let mut f = fixture(json, 1);
        f.assets = AssetBroker::new(ScriptedLoader::new().with_failure("bad.wav"));
        preload(&mut f.assets, "good.wav", 0.5);
        f.scheduler.start(&mut f.sink);
        f.scheduler.tick(0.0, &mut f.sink, &mut f.assets).unwrap();

        // The good trigger went out immediately; the bad one is awaited.
        assert_eq!(f.sink.played.len(), 1);
        assert!(!f.scheduler.is_load_complete());

        // Keep ticking until the failing fetch comes back from the
        // worker thread.
        for _ in 0..100 {
            f.scheduler.tick(0.1, &mut f.sink, &mut f.assets).unwrap();
            if f.scheduler.is_load_complete() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        // The instance committed despite the dropped trigger.
        assert!((f.scheduler.committed_until() - 2.0).abs() < 1e-9);
        assert!(f.scheduler.is_load_complete());
        assert_eq!(f.sink.played.len(), 1);
    }

    #[test]
    fn test_first_instance_pickup_shifts_piece_forward() {
        let json = r#"{
            "start": ["A"],
            "sequences": [
                { "name": "A", "bpm": 60, "numBeats": 2,
                  "minRevolutions": 1, "maxRevolutions": 1,
                  "groups": [
                    { "name": "pre", "beat": -1, "samples": ["pre.wav"] },
                    { "name": "down", "beat": 1, "samples": ["down.wav"] }
                  ] }
            ]
        }"#;
        let mut f = fixture(json, 1);
        preload(&mut f.assets, "pre.wav", 0.2);
        preload(&mut f.assets, "down.wav", 0.2);
        f.scheduler.start(&mut f.sink);
        f.scheduler.tick(0.0, &mut f.sink, &mut f.assets).unwrap();

        // The beat -1 pickup needed one second, so the whole instance
        // shifted: pickup at 0, downbeat at 1, watermark at 3.
        assert!(f.sink.played.iter().all(|p| p.at >= 0.0));
        let pre = f.sink.played.iter().find(|p| p.sample == "pre.wav").unwrap();
        let down = f.sink.played.iter().find(|p| p.sample == "down.wav").unwrap();
        assert!((pre.at - 0.0).abs() < 1e-9);
        assert!((down.at - 1.0).abs() < 1e-9);
        assert!((f.scheduler.committed_until() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sequence_markers_update_current_loop() {
        let mut f = fixture(single_sequence_json(), 1);
        preload(&mut f.assets, "kick.wav", 0.5);
        f.scheduler.start(&mut f.sink);
        f.scheduler.tick(0.0, &mut f.sink, &mut f.assets).unwrap();

        f.sink.fire_due(0.0);
        {
            let info = f.info.lock().unwrap();
            assert_eq!(info.sequence.as_deref(), Some("A"));
            assert_eq!(info.counter, 0);
            assert_eq!(info.revolutions, 1);
        }

        f.sink.fire_due(10.0);
        let info = f.info.lock().unwrap();
        assert_eq!(info.sequence, None);
    }
}
