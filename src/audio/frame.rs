//! PCM frame types and the accumulator that cuts device reads into frames.

use bytes::Bytes;
use std::time::Duration;

/// Sample layout of a PCM stream. Samples are always signed 16-bit
/// little-endian, interleaved when `channels > 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes occupied by one sample of every channel.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * Self::BYTES_PER_SAMPLE
    }

    /// Byte length of a capture chunk of `chunk_size` samples per channel.
    pub fn chunk_bytes(&self, chunk_size: usize) -> usize {
        chunk_size * self.bytes_per_frame()
    }

    /// Mime type used by the service for raw PCM at this rate.
    pub fn pcm_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// An immutable buffer of PCM samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
    format: AudioFormat,
}

impl AudioFrame {
    pub fn from_bytes(data: impl Into<Bytes>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            format,
        }
    }

    pub fn from_samples(samples: &[i16], format: AudioFormat) -> Self {
        let mut data = Vec::with_capacity(samples.len() * AudioFormat::BYTES_PER_SAMPLE);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self::from_bytes(data, format)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Samples per channel held by this frame.
    pub fn frames(&self) -> usize {
        self.data.len() / self.format.bytes_per_frame()
    }

    pub fn duration(&self) -> Duration {
        let nanos = self.frames() as u64 * 1_000_000_000 / u64::from(self.format.sample_rate.max(1));
        Duration::from_nanos(nanos)
    }

    /// Decode to interleaved i16 samples. A dangling odd byte is ignored.
    pub fn to_samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(AudioFormat::BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }
}

/// Accumulates interleaved samples of arbitrary read sizes and emits frames
/// of exactly `chunk_size` samples per channel. Leftover samples stay
/// buffered until the next push completes them; partial frames are never
/// emitted.
#[derive(Debug)]
pub struct FrameAssembler {
    format: AudioFormat,
    frame_samples: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(format: AudioFormat, chunk_size: usize) -> Self {
        let frame_samples = chunk_size * format.channels as usize;
        Self {
            format,
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and return every frame completed by them, oldest first.
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_samples.max(1));
        while self.frame_samples > 0 && self.pending.len() >= self.frame_samples {
            frames.push(AudioFrame::from_samples(
                &self.pending[..self.frame_samples],
                self.format,
            ));
            self.pending.drain(..self.frame_samples);
        }
        frames
    }

    /// Interleaved samples waiting for the next frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
