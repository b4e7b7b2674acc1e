//! Playback notifications.
//!
//! The session hands out a receiver for [`PlayerEvent`]s. Delivery is
//! fire-and-forget: events are sent as their moment passes on the sink
//! timeline, and an unread channel never blocks the engine.

/// A notification emitted during playback.
///
/// Times and offsets are in seconds from composition start.
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    /// A sequence revolution begins.
    SequenceStart {
        offset: f64,
        sequence: String,
        /// 0-based repeat index within the committed revolutions.
        counter: u32,
        revolutions: u32,
    },
    /// A sequence revolution ends.
    SequenceEnd {
        offset: f64,
        sequence: String,
        counter: u32,
        revolutions: u32,
    },
    /// A sample starts sounding.
    SampleStart { time: f64, sample: String },
    /// A sample finishes sounding.
    SampleEnd { time: f64, sample: String },
    /// The look-ahead window fell below the safety margin; playback is
    /// suspended until enough material is buffered.
    Waiting,
    /// Enough material is buffered; playback is running.
    Playing,
    /// The piece is over. Carries an error description when traversal
    /// was aborted rather than completed.
    Ended { error: Option<String> },
}
