//! Microphone capture on a dedicated OS thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::alsa_device::{self, AlsaParams};
use super::audio_system::CaptureSource;
use super::frame::{AudioFrame, FrameAssembler};
use crate::config::AudioConfig;
use crate::error::AudioError;

/// ALSA capture source.
///
/// The recording thread reads one period at a time, cuts the samples into
/// `chunk_size` frames and hands them to the session through a bounded
/// queue. When the session falls behind, new frames are dropped rather than
/// stalling the device.
pub struct AlsaCapture {
    device: String,
    rx: mpsc::Receiver<AudioFrame>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaCapture {
    pub fn open(config: &AudioConfig) -> Result<Self, AudioError> {
        let (pcm, params) = alsa_device::open_capture(
            &config.input_device,
            config.input_sample_rate,
            u32::from(config.channels),
            config.chunk_size,
        )?;

        let assembler = FrameAssembler::new(config.input_format(), config.chunk_size);
        let (tx, rx) = mpsc::channel(config.capture_queue_frames);
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) = record_thread(pcm, params, assembler, tx, &running) {
                        tracing::error!("Recording thread error: {}", e);
                    }
                })
                .map_err(|e| AudioError::device(&config.input_device, e))?
        };

        Ok(Self {
            device: config.input_device.clone(),
            rx,
            running,
            handle: Some(handle),
        })
    }
}

#[async_trait]
impl CaptureSource for AlsaCapture {
    async fn next_frame(&mut self) -> Result<AudioFrame, AudioError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| AudioError::device(&self.device, "capture stream ended"))
    }

    fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.rx.close();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn record_thread(
    pcm: PCM,
    params: AlsaParams,
    mut assembler: FrameAssembler,
    tx: mpsc::Sender<AudioFrame>,
    running: &AtomicBool,
) -> Result<(), alsa::Error> {
    let channels = params.channels as usize;
    let io = pcm.io_i16()?;

    // ALSA read buffer (interleaved i16, one period)
    let mut read_buf = vec![0i16; params.period_size * channels];
    let mut dropped: u64 = 0;

    tracing::info!(
        "Recording started: rate={}, ch={}, period={}",
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                for frame in assembler.push(&read_buf[..frames * channels]) {
                    match tx.try_send(frame) {
                        Ok(()) => {
                            if dropped > 0 {
                                tracing::warn!("Capture queue recovered after dropping {} frames", dropped);
                                dropped = 0;
                            }
                        }
                        Err(TrySendError::Full(_)) => {
                            if dropped == 0 {
                                tracing::warn!("Capture queue full, dropping microphone frames");
                            }
                            dropped += 1;
                        }
                        Err(TrySendError::Closed(_)) => {
                            tracing::info!("Capture receiver dropped");
                            return Ok(());
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("ALSA capture error: {}, recovering...", e);
                // Samples around an XRUN are not contiguous.
                assembler.clear();
                pcm.prepare()?;
            }
        }
    }

    tracing::info!("Recording stopped");
    Ok(())
}
