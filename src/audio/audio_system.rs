//! Capture/playback seams used by the session, and the ALSA backend that
//! implements them.
//!
//! Real-time device I/O stays on std threads (NOT tokio tasks) so it never
//! contends with the async network loops.

use async_trait::async_trait;

use super::frame::AudioFrame;
use super::play::AlsaPlayback;
use super::record::AlsaCapture;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// A lazy, infinite sequence of fixed-size microphone frames.
#[async_trait]
pub trait CaptureSource: Send {
    /// Wait for the next full frame.
    async fn next_frame(&mut self) -> Result<AudioFrame, AudioError>;

    /// Drop frames captured but not yet consumed, returning how many.
    /// Used to restart the sequence after a reconnect.
    fn discard_pending(&mut self) -> usize {
        0
    }
}

/// Speaker output absorbing network jitter in an internal buffer.
pub trait PlaybackSink: Send + Sync {
    /// Queue a frame without blocking. Fails with [`AudioError::Overrun`]
    /// when the buffer is full.
    fn enqueue(&self, frame: AudioFrame) -> Result<(), AudioError>;
}

/// Opens the microphone and speaker for a session.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, config: &AudioConfig) -> Result<Box<dyn CaptureSource>, AudioError>;
    fn open_playback(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackSink>, AudioError>;
}

/// ALSA devices selected by name (`default`, `plughw:1,0`, ...).
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaBackend;

impl AudioBackend for AlsaBackend {
    fn open_capture(&self, config: &AudioConfig) -> Result<Box<dyn CaptureSource>, AudioError> {
        tracing::info!(
            "Opening capture \"{}\" at {}Hz/{}ch, chunk {} samples",
            config.input_device,
            config.input_sample_rate,
            config.channels,
            config.chunk_size,
        );
        Ok(Box::new(AlsaCapture::open(config)?))
    }

    fn open_playback(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackSink>, AudioError> {
        tracing::info!(
            "Opening playback \"{}\" at {}Hz/{}ch",
            config.output_device,
            config.output_sample_rate,
            config.channels,
        );
        Ok(Box::new(AlsaPlayback::open(config)?))
    }
}
