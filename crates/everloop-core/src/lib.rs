//! Everloop Core - generative audio sequencing with look-ahead scheduling.
//!
//! Given a declarative composition (a probabilistic graph of beat-based
//! sequences built from sample groups), this crate produces an endless,
//! non-repeating arrangement of sample playback events against a shared
//! clock, buffering far enough ahead that audio never underruns while
//! assets stream in.
//!
//! The building blocks, leaf first:
//!
//! - **Composition** - the immutable data model and its validated index
//! - **Select** - weighted random selection with an injectable rng
//! - **Graph** - the sequence walker: edges, revolution counts, deadline cues
//! - **Layout** - beat-to-time conversion of one sequence instance
//! - **Scheduler** - the rolling look-ahead window and starvation handling
//! - **Session** - the public load/play/pause/resume/stop surface
//!
//! Audio rendering, sample fetching, and the clock are host concerns
//! behind the [`AudioSink`], [`AssetLoader`], and [`Clock`] traits.
//!
//! # Architecture
//!
//! The engine is single-threaded and cooperative: the host calls
//! [`PlaybackSession::tick`] periodically, and asset loads run on one
//! background thread whose results come back over a channel. All
//! notifications are delivered through a channel receiver, so handling
//! them can never re-enter the engine.

pub mod clock;
pub mod composition;
pub mod errors;
pub mod events;
pub mod graph;
pub mod layout;
pub mod loader;
pub mod scheduler;
pub mod select;
pub mod session;
pub mod sink;

// Re-export the main types for convenience.
pub use clock::{Clock, ManualClock, SystemClock};
pub use composition::{
    Composition, CompositionIndex, CompressorParams, Group, Sequence, WeightedEntry,
};
pub use errors::{EngineError, Result};
pub use events::PlayerEvent;
pub use graph::{DeadlineCue, GraphWalker, NextLoop, WalkerState};
pub use layout::{lay_out, render_arrangement, TriggerEvent};
pub use loader::{
    AssetBroker, AssetLoader, DecodedBuffer, FetchResult, FetchService, WavFileLoader,
};
pub use scheduler::{CurrentLoop, LookaheadScheduler, SchedulerConfig};
pub use select::Selector;
pub use session::PlaybackSession;
pub use sink::{bus_key, AudioSink, TriggerCallback, VoiceId};
