use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::audio::{AudioBackend, CaptureSource, PlaybackSink};
use crate::config::{AudioConfig, SessionConfig};
use crate::error::{AudioError, LinkError, SessionError};
use crate::net_link::{Connection, Connector, InboundStream, OutboundLink, SessionSetup};
use crate::protocol::{InboundMessage, Role, TurnSignal};
use crate::state_machine::{LinkState, Reconnector, RetryPolicy, TurnStatus, TurnTracker};

/// Upper bound on the polite close handshake at teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Observable milestones of a session, for UIs, LEDs and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting { attempt: u32 },
    Connected { connection_id: Uuid },
    PlaybackEnqueued { bytes: usize },
    PlaybackOverrun,
    SendPaused,
    SendResumed { discarded: usize },
    Transcript { role: Role, text: String },
    TurnComplete,
    UserSpeaking,
    Disconnected { reason: String },
    BackingOff { attempt: u32, delay: Duration },
    Failed,
    Stopped,
}

/// Why one connection's loops stopped.
enum ConnectionEnd {
    Shutdown,
    Link(LinkError),
    Device(AudioError),
}

/// Runs a conversation: microphone -> service -> speaker, with turn-taking
/// and reconnection.
pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn AudioBackend>,
    show_transcription: bool,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        Self {
            config,
            connector,
            backend,
            show_transcription: true,
            events: None,
        }
    }

    pub fn with_transcription(mut self, show: bool) -> Self {
        self.show_transcription = show;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run until `shutdown` resolves (Ok) or a fatal error occurs.
    ///
    /// Devices are opened before anything else: if either is unavailable the
    /// call fails without connecting.
    pub async fn run<F>(
        &self,
        persona: &str,
        audio: &AudioConfig,
        shutdown: F,
    ) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        let mut capture = self.backend.open_capture(audio).inspect_err(|e| {
            tracing::error!("✗ Error initializing microphone: {}", e);
        })?;
        let playback = self.backend.open_playback(audio).inspect_err(|e| {
            tracing::error!("✗ Error initializing speaker: {}", e);
        })?;
        tracing::info!("✓ Audio streams initialized");

        let result = self
            .drive(persona, audio, capture.as_mut(), playback.as_ref(), shutdown)
            .await;

        // Dropping the devices joins their threads, and playback first plays
        // out its queue, so keep that off the async workers.
        let release = tokio::task::spawn_blocking(move || drop((capture, playback)));
        if let Err(e) = release.await {
            tracing::warn!("Audio release failed: {}", e);
        }
        result
    }

    async fn drive<F>(
        &self,
        persona: &str,
        audio: &AudioConfig,
        capture: &mut dyn CaptureSource,
        playback: &dyn PlaybackSink,
        shutdown: F,
    ) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        let setup = SessionSetup::new(persona, audio);
        let policy = RetryPolicy::from(&self.config);
        let max_attempts = policy.max_attempts;
        let mut reconnector = Reconnector::new(policy);

        tokio::pin!(shutdown);

        loop {
            if let LinkState::Connecting { attempt } = reconnector.begin_connect() {
                if attempt > 0 {
                    tracing::info!("🔄 Attempting to reconnect...");
                }
                self.emit(SessionEvent::Connecting { attempt });
            }

            let connected = tokio::select! {
                biased;
                _ = &mut shutdown => return self.stop(&mut reconnector),
                result = self.connector.connect(&setup) => result,
            };

            let err = match connected {
                Ok(conn) => {
                    reconnector.connected();
                    let stale = capture.discard_pending();
                    if stale > 0 {
                        tracing::debug!("Discarded {} stale microphone frames", stale);
                    }
                    tracing::info!(connection_id = %conn.id, "✓ Connected, listening...");
                    self.emit(SessionEvent::Connected {
                        connection_id: conn.id,
                    });

                    match self
                        .run_connection(conn, &mut *capture, playback, &mut shutdown)
                        .await
                    {
                        ConnectionEnd::Shutdown => return self.stop(&mut reconnector),
                        ConnectionEnd::Device(e) => {
                            tracing::error!("✗ Audio device failed: {}", e);
                            self.emit(SessionEvent::Failed);
                            return Err(e.into());
                        }
                        ConnectionEnd::Link(e) => e,
                    }
                }
                Err(e) => e,
            };

            tracing::warn!("✗ Connection error: {}", err);
            self.emit(SessionEvent::Disconnected {
                reason: err.to_string(),
            });

            match reconnector.failed() {
                LinkState::BackingOff { attempt, delay } => {
                    tracing::warn!(
                        "🔄 Reconnecting in {:?}... (attempt {}/{})",
                        delay,
                        attempt,
                        max_attempts
                    );
                    self.emit(SessionEvent::BackingOff { attempt, delay });
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => return self.stop(&mut reconnector),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                _ => {
                    let attempts = reconnector.failures().saturating_sub(1);
                    tracing::error!("✗ Max reconnection attempts ({}) reached", max_attempts);
                    self.emit(SessionEvent::Failed);
                    return Err(SessionError::RetriesExhausted {
                        attempts,
                        last: err,
                    });
                }
            }
        }
    }

    fn stop(&self, reconnector: &mut Reconnector) -> Result<(), SessionError> {
        reconnector.disconnect();
        tracing::info!("👋 Shutting down gracefully...");
        self.emit(SessionEvent::Stopped);
        Ok(())
    }

    /// Drive the send and receive loops of one connection until one of them
    /// ends or shutdown is requested, then close the connection.
    async fn run_connection<S>(
        &self,
        conn: Connection,
        capture: &mut dyn CaptureSource,
        playback: &dyn PlaybackSink,
        shutdown: &mut S,
    ) -> ConnectionEnd
    where
        S: Future<Output = ()> + Unpin,
    {
        let Connection {
            id,
            mut outbound,
            inbound,
        } = conn;
        let (turns, turn_rx) = TurnTracker::new();

        let end = {
            let send = self.send_loop(outbound.as_mut(), capture, turn_rx);
            let receive = self.receive_loop(inbound, playback, &turns);
            tokio::select! {
                _ = &mut *shutdown => ConnectionEnd::Shutdown,
                end = send => end,
                end = receive => end,
            }
        };

        // Both loops are dropped at this point.
        match tokio::time::timeout(CLOSE_TIMEOUT, outbound.close()).await {
            Ok(Ok(())) => tracing::debug!(connection_id = %id, "Connection closed"),
            Ok(Err(e)) => tracing::debug!(connection_id = %id, "Close failed: {}", e),
            Err(_) => tracing::debug!(connection_id = %id, "Close timed out"),
        }
        end
    }

    async fn send_loop(
        &self,
        outbound: &mut dyn OutboundLink,
        capture: &mut dyn CaptureSource,
        mut turns: watch::Receiver<TurnStatus>,
    ) -> ConnectionEnd {
        let send_delay = self.config.send_delay();
        let mut seen_turns = turns.borrow_and_update().completed_turns;
        let mut flag_open = true;

        loop {
            tokio::select! {
                biased;
                changed = turns.changed(), if flag_open => {
                    if changed.is_err() {
                        flag_open = false;
                        continue;
                    }
                    let status = *turns.borrow_and_update();
                    if status.completed_turns > seen_turns {
                        seen_turns = status.completed_turns;
                        if let Err(e) = self.pause_sending(&mut *capture).await {
                            return ConnectionEnd::Device(e);
                        }
                    }
                }
                frame = capture.next_frame() => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => return ConnectionEnd::Device(e),
                    };
                    match outbound.send(&frame).await {
                        Ok(()) => {}
                        Err(e) if !e.is_connection_level() => {
                            tracing::warn!("Dropping outbound frame: {}", e);
                        }
                        Err(e) => return ConnectionEnd::Link(e),
                    }
                    if !send_delay.is_zero() {
                        tokio::time::sleep(send_delay).await;
                    }
                }
            }
        }
    }

    /// Hold the microphone back after the service finished a turn, so the
    /// tail of the response is not sent back as user speech.
    async fn pause_sending(&self, capture: &mut dyn CaptureSource) -> Result<(), AudioError> {
        let delay = self.config.turn_resume_delay();
        tracing::debug!("Turn complete, pausing microphone for {:?}", delay);
        self.emit(SessionEvent::SendPaused);

        let resume_at = Instant::now() + delay;
        let mut discarded = 0;
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(resume_at) => break,
                frame = capture.next_frame() => {
                    frame?;
                    discarded += 1;
                }
            }
        }

        if discarded > 0 {
            tracing::debug!("Discarded {} microphone frames during the pause", discarded);
        }
        tracing::debug!("🎤 Listening...");
        self.emit(SessionEvent::SendResumed { discarded });
        Ok(())
    }

    async fn receive_loop(
        &self,
        mut inbound: InboundStream,
        playback: &dyn PlaybackSink,
        turns: &TurnTracker,
    ) -> ConnectionEnd {
        while let Some(item) = inbound.next().await {
            let msg = match item {
                Ok(msg) => msg,
                Err(e) => return ConnectionEnd::Link(e),
            };

            match msg {
                InboundMessage::Audio(frame) => {
                    if turns.resume() {
                        tracing::debug!("New response turn");
                    }
                    let bytes = frame.byte_len();
                    let duration = frame.duration();
                    match playback.enqueue(frame) {
                        Ok(()) => self.emit(SessionEvent::PlaybackEnqueued { bytes }),
                        Err(AudioError::Overrun) => {
                            tracing::warn!("⚠️  Playback buffer overrun, dropped {:?} of audio", duration);
                            self.emit(SessionEvent::PlaybackOverrun);
                        }
                        Err(e) => return ConnectionEnd::Device(e),
                    }
                }
                InboundMessage::Text { role, text } => {
                    let who = match role {
                        Role::User => "🗣",
                        Role::Model => "💬",
                    };
                    if self.show_transcription {
                        tracing::info!("{} {}", who, text);
                    } else {
                        tracing::debug!("{} {}", who, text);
                    }
                    self.emit(SessionEvent::Transcript { role, text });
                }
                InboundMessage::Turn(TurnSignal::TurnComplete) => {
                    if turns.complete_turn() {
                        tracing::debug!("✓ Turn complete");
                        self.emit(SessionEvent::TurnComplete);
                    } else {
                        tracing::debug!("Repeated turn-complete ignored");
                    }
                }
                InboundMessage::Turn(TurnSignal::UserSpeaking) => {
                    tracing::debug!("User interrupted the response");
                    turns.resume();
                    self.emit(SessionEvent::UserSpeaking);
                }
                InboundMessage::Turn(TurnSignal::Error(msg)) => {
                    tracing::warn!("⚠️  Service reported an error: {}", msg);
                    return ConnectionEnd::Link(LinkError::Remote(msg));
                }
            }
        }

        ConnectionEnd::Link(LinkError::Closed("inbound stream ended".to_string()))
    }
}
