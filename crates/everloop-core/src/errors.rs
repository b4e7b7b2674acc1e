//! Error types for the everloop-core crate.

use thiserror::Error;

/// Errors that can occur while loading a composition or driving playback.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A composition value is out of bounds or malformed.
    ///
    /// Fatal at load or at first selection; playback does not start.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A graph edge or start entry names a sequence that does not exist,
    /// or traversal cannot make progress.
    ///
    /// Fatal; the current traversal is aborted.
    #[error("graph error: {0}")]
    Graph(String),

    /// A sample could not be fetched or decoded.
    ///
    /// The affected trigger is dropped and playback continues.
    #[error("asset error for '{id}': {reason}")]
    Asset { id: String, reason: String },
}

impl EngineError {
    /// Shorthand for a [`EngineError::Config`] with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    /// Shorthand for a [`EngineError::Graph`] with a formatted message.
    pub fn graph(msg: impl Into<String>) -> Self {
        EngineError::Graph(msg.into())
    }

    /// Shorthand for an [`EngineError::Asset`].
    pub fn asset(id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Asset {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;
