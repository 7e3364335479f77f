//! Error taxonomy shared by the audio devices, the conversation link and the
//! session controller.

use thiserror::Error;

/// Errors raised by audio capture and playback devices.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The device could not be opened or died while streaming.
    #[error("audio device '{device}' unavailable: {reason}")]
    Device { device: String, reason: String },

    /// Playback queue is full; the frame was dropped.
    #[error("playback buffer overrun, frame dropped")]
    Overrun,
}

impl AudioError {
    pub fn device(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::Device {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by the conversation link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("not connected")]
    NotConnected,

    /// Outbound frame did not have the configured chunk length.
    #[error("frame of {actual} bytes rejected, expected {expected}")]
    PartialFrame { expected: usize, actual: usize },

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed: {0}")]
    Closed(String),

    /// The service reported an error through the turn signal channel.
    #[error("remote error: {0}")]
    Remote(String),
}

impl LinkError {
    /// Whether this error invalidates the connection and calls for a reconnect.
    pub fn is_connection_level(&self) -> bool {
        !matches!(self, Self::PartialFrame { .. })
    }
}

/// Fatal outcomes of a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] AudioError),

    #[error("giving up after {attempts} reconnect attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: LinkError,
    },
}
