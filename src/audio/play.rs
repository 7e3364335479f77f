//! Speaker playback on a dedicated OS thread.

use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::alsa_device::{self, AlsaParams};
use super::audio_system::PlaybackSink;
use super::frame::{AudioFormat, AudioFrame};
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Consecutive failed XRUN recoveries before the rest of a frame is dropped.
const MAX_RECOVERY_RETRIES: u32 = 3;

/// ALSA playback sink.
///
/// `enqueue` never blocks: frames go into a bounded queue drained by the
/// playback thread. Dropping the sink closes the queue, lets the thread play
/// what is already queued and drains the device.
pub struct AlsaPlayback {
    device: String,
    tx: Option<mpsc::Sender<AudioFrame>>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaPlayback {
    pub fn open(config: &AudioConfig) -> Result<Self, AudioError> {
        let (pcm, params) = alsa_device::open_playback(
            &config.output_device,
            config.output_sample_rate,
            u32::from(config.channels),
        )?;

        let format = config.output_format();
        let (tx, rx) = mpsc::channel(config.playback_queue_frames);

        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                if let Err(e) = play_thread(pcm, params, format, rx) {
                    tracing::error!("Playback thread error: {}", e);
                }
            })
            .map_err(|e| AudioError::device(&config.output_device, e))?;

        Ok(Self {
            device: config.output_device.clone(),
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl PlaybackSink for AlsaPlayback {
    fn enqueue(&self, frame: AudioFrame) -> Result<(), AudioError> {
        let Some(tx) = &self.tx else {
            return Err(AudioError::device(&self.device, "playback closed"));
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AudioError::Overrun),
            Err(TrySendError::Closed(_)) => {
                Err(AudioError::device(&self.device, "playback stream ended"))
            }
        }
    }
}

impl Drop for AlsaPlayback {
    fn drop(&mut self) {
        // Closing the queue ends the thread once it has played the backlog.
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn play_thread(
    pcm: PCM,
    params: AlsaParams,
    format: AudioFormat,
    mut rx: mpsc::Receiver<AudioFrame>,
) -> Result<(), alsa::Error> {
    let channels = params.channels as usize;
    let io = pcm.io_i16()?;
    let mut warned_format = false;

    tracing::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    // Block until we receive a frame (or the queue closes)
    while let Some(frame) = rx.blocking_recv() {
        if frame.format() != format && !warned_format {
            tracing::warn!(
                "Inbound audio is {}Hz/{}ch but the device plays {}Hz/{}ch",
                frame.format().sample_rate,
                frame.format().channels,
                format.sample_rate,
                format.channels,
            );
            warned_format = true;
        }

        let pcm_data = frame.to_samples();
        let total_frames = pcm_data.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        // Short writes and XRUNs are retried without losing frames.
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&pcm_data[offset..total_frames * channels]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    tracing::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare()?;

                    if retry_count >= MAX_RECOVERY_RETRIES {
                        tracing::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Playback queue closed, draining device");
    pcm.drain()?;
    tracing::info!("Playback stopped");
    Ok(())
}
