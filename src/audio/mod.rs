//! audio - Microphone capture, speaker playback and PCM framing
//!
//! Uses ALSA for audio I/O. Frames are raw S16LE PCM, which is what the
//! conversation service consumes and produces, so there is no codec stage.

mod alsa_device;
mod audio_system;
pub mod frame;
mod play;
mod record;

pub use alsa_device::{DeviceInfo, list_devices};
pub use audio_system::{AlsaBackend, AudioBackend, CaptureSource, PlaybackSink};
pub use frame::{AudioFormat, AudioFrame, FrameAssembler};
pub use play::AlsaPlayback;
pub use record::AlsaCapture;
