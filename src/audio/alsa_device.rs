//! ALSA PCM device wrappers for audio capture and playback.

use alsa::device_name::HintIter;
use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::error::AudioError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

/// A PCM device reported by the ALSA name hints.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub description: String,
    pub capture: bool,
    pub playback: bool,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
) -> Result<(PCM, AlsaParams), AudioError> {
    open_pcm(
        device,
        Direction::Capture,
        sample_rate,
        channels,
        Some(period_size),
        "Capture",
    )
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
) -> Result<(PCM, AlsaParams), AudioError> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        channels,
        None,
        "Playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams), AudioError> {
    let fail = |e: alsa::Error| AudioError::device(device, format!("{dir_name}: {e}"));

    let pcm = PCM::new(device, direction, false).map_err(fail)?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).map_err(fail)?;
        hwp.set_access(Access::RWInterleaved).map_err(fail)?;
        hwp.set_format(Format::S16LE).map_err(fail)?;
        hwp.set_channels(channels).map_err(fail)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest).map_err(fail)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)
                .map_err(fail)?;
        }
        pcm.hw_params(&hwp).map_err(fail)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current().map_err(fail)?;
        AlsaParams {
            sample_rate: hwp.get_rate().map_err(fail)?,
            channels: hwp.get_channels().map_err(fail)?,
            period_size: hwp.get_period_size().map_err(fail)? as usize,
        }
    };

    // The service expects exactly the configured format, there is no
    // resampler in the pipeline.
    if params.sample_rate != sample_rate || params.channels != channels {
        return Err(AudioError::device(
            device,
            format!(
                "{dir_name}: hardware negotiated {}Hz/{}ch, requested {}Hz/{}ch",
                params.sample_rate, params.channels, sample_rate, channels
            ),
        ));
    }

    tracing::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

/// Enumerate PCM devices known to ALSA.
pub fn list_devices() -> Result<Vec<DeviceInfo>, AudioError> {
    let hints =
        HintIter::new_str(None, "pcm").map_err(|e| AudioError::device("pcm hints", e))?;

    Ok(hints
        .filter_map(|hint| {
            let name = hint.name?;
            // A missing direction means the device supports both.
            let (capture, playback) = match hint.direction {
                Some(Direction::Capture) => (true, false),
                Some(Direction::Playback) => (false, true),
                None => (true, true),
            };
            Some(DeviceInfo {
                name,
                description: hint.desc.unwrap_or_default().replace('\n', " "),
                capture,
                playback,
            })
        })
        .collect())
}
