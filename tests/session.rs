//! Session controller integration tests
//!
//! Drives the controller against scripted connections and in-memory audio
//! devices, with tokio's clock paused.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use hebrew_doll::audio::{AudioBackend, AudioFormat, AudioFrame, CaptureSource, PlaybackSink};
use hebrew_doll::config::{AudioConfig, SessionConfig};
use hebrew_doll::net_link::{Connection, Connector, OutboundLink, SessionSetup, check_frame_len};
use hebrew_doll::protocol::{InboundMessage, Role, TurnSignal};
use hebrew_doll::{AudioError, LinkError, SessionController, SessionError, SessionEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Microphone producing a full frame every chunk period.
struct MockCapture {
    format: AudioFormat,
    chunk_size: usize,
}

#[async_trait]
impl CaptureSource for MockCapture {
    async fn next_frame(&mut self) -> Result<AudioFrame, AudioError> {
        let period = Duration::from_secs_f64(self.chunk_size as f64 / self.format.sample_rate as f64);
        tokio::time::sleep(period).await;
        Ok(AudioFrame::from_samples(&vec![7; self.chunk_size], self.format))
    }
}

/// Speaker that records what it played and which thread released it.
struct MockPlayback {
    full: bool,
    played: Arc<Mutex<Vec<AudioFrame>>>,
    released_on: Arc<Mutex<Option<ThreadId>>>,
}

impl PlaybackSink for MockPlayback {
    fn enqueue(&self, frame: AudioFrame) -> Result<(), AudioError> {
        if self.full {
            return Err(AudioError::Overrun);
        }
        self.played.lock().unwrap().push(frame);
        Ok(())
    }
}

impl Drop for MockPlayback {
    fn drop(&mut self) {
        *self.released_on.lock().unwrap() = Some(thread::current().id());
    }
}

#[derive(Default)]
struct MockBackend {
    capture_missing: bool,
    playback_missing: bool,
    playback_full: bool,
    played: Arc<Mutex<Vec<AudioFrame>>>,
    released_on: Arc<Mutex<Option<ThreadId>>>,
}

impl AudioBackend for MockBackend {
    fn open_capture(&self, config: &AudioConfig) -> Result<Box<dyn CaptureSource>, AudioError> {
        if self.capture_missing {
            return Err(AudioError::device(&config.input_device, "no such device"));
        }
        Ok(Box::new(MockCapture {
            format: config.input_format(),
            chunk_size: config.chunk_size,
        }))
    }

    fn open_playback(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackSink>, AudioError> {
        if self.playback_missing {
            return Err(AudioError::device(&config.output_device, "no such device"));
        }
        Ok(Box::new(MockPlayback {
            full: self.playback_full,
            played: self.played.clone(),
            released_on: self.released_on.clone(),
        }))
    }
}

#[derive(Clone, Default)]
struct OutboundLog {
    sent: Arc<Mutex<Vec<usize>>>,
    sent_at: Arc<Mutex<Vec<Instant>>>,
    closed: Arc<AtomicBool>,
}

struct MockOutbound {
    log: OutboundLog,
    chunk_bytes: usize,
}

#[async_trait]
impl OutboundLink for MockOutbound {
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), LinkError> {
        if self.log.closed.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        check_frame_len(frame, self.chunk_bytes)?;
        self.log.sent.lock().unwrap().push(frame.byte_len());
        self.log.sent_at.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.log.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What one connect attempt does.
enum Script {
    Refuse,
    /// Deliver the messages, then keep the connection open.
    Serve(Vec<InboundMessage>),
    /// Like `Serve`, with the messages arriving after a delay.
    ServeAfter(Duration, Vec<InboundMessage>),
    /// Deliver the messages, then drop the connection.
    ServeThenDrop(Vec<InboundMessage>),
}

/// Plays one script per connect; refuses once the scripts run out.
#[derive(Default)]
struct MockConnector {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicU32,
    outbound: OutboundLog,
}

impl MockConnector {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, setup: &SessionSetup) -> Result<Connection, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Refuse);

        let inbound = match script {
            Script::Refuse => return Err(LinkError::Connection("refused".to_string())),
            Script::Serve(msgs) => stream::iter(msgs.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            Script::ServeAfter(delay, msgs) => stream::once(async move {
                tokio::time::sleep(delay).await;
                stream::iter(msgs.into_iter().map(Ok))
            })
            .flatten()
            .chain(stream::pending())
            .boxed(),
            Script::ServeThenDrop(msgs) => stream::iter(msgs.into_iter().map(Ok))
                .chain(stream::once(async {
                    Err(LinkError::Receive("connection reset".to_string()))
                }))
                .boxed(),
        };

        Ok(Connection {
            id: Uuid::new_v4(),
            outbound: Box::new(MockOutbound {
                log: self.outbound.clone(),
                chunk_bytes: setup.chunk_bytes(),
            }),
            inbound,
        })
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        reconnect_delay_ms: 100,
        max_reconnect_attempts: 2,
        ..Default::default()
    }
}

fn response_audio(samples: usize) -> InboundMessage {
    InboundMessage::Audio(AudioFrame::from_samples(
        &vec![1; samples],
        AudioFormat::new(24000, 1),
    ))
}

fn turn_complete() -> InboundMessage {
    InboundMessage::Turn(TurnSignal::TurnComplete)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count(events: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

fn position(events: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
    events.iter().position(pred).expect("event not emitted")
}

#[tokio::test(start_paused = true)]
async fn test_response_audio_is_played_and_turn_complete_pauses_sending() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(vec![
        response_audio(480),
        response_audio(480),
        turn_complete(),
    ])]));
    let backend = Arc::new(MockBackend::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller =
        SessionController::new(session_config(), connector.clone(), backend.clone()).with_events(tx);

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;
    assert!(result.is_ok());

    let events = drain(&mut rx);
    assert_eq!(backend.played.lock().unwrap().len(), 2);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::PlaybackEnqueued { bytes: 960 })), 2);
    assert_eq!(count(&events, |e| *e == SessionEvent::TurnComplete), 1);
    assert_eq!(count(&events, |e| *e == SessionEvent::SendPaused), 1);

    let paused = position(&events, |e| *e == SessionEvent::SendPaused);
    let resumed = position(&events, |e| matches!(e, SessionEvent::SendResumed { .. }));
    assert!(position(&events, |e| *e == SessionEvent::TurnComplete) < paused);
    assert!(paused < resumed);
    assert_eq!(events.last(), Some(&SessionEvent::Stopped));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_turn_complete_is_ignored() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(vec![
        response_audio(240),
        turn_complete(),
        turn_complete(),
    ])]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        session_config(),
        connector,
        Arc::new(MockBackend::default()),
    )
    .with_events(tx);

    controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_millis(500)),
        )
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert_eq!(count(&events, |e| *e == SessionEvent::TurnComplete), 1);
    assert_eq!(count(&events, |e| *e == SessionEvent::SendPaused), 1);
}

#[tokio::test(start_paused = true)]
async fn test_microphone_frames_are_sent_whole_and_link_closed_on_shutdown() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(Vec::new())]));
    let controller = SessionController::new(
        session_config(),
        connector.clone(),
        Arc::new(MockBackend::default()),
    );

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;
    assert!(result.is_ok());

    let sent = connector.outbound.sent.lock().unwrap().clone();
    assert!(!sent.is_empty());
    assert!(sent.iter().all(|&len| len == 2048));
    assert!(connector.outbound.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_transcripts_are_reported() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(vec![
        InboundMessage::Text {
            role: Role::User,
            text: "מה שלומך?".to_string(),
        },
        InboundMessage::Text {
            role: Role::Model,
            text: "מצוין!".to_string(),
        },
    ])]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        session_config(),
        connector,
        Arc::new(MockBackend::default()),
    )
    .with_events(tx);

    controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    let transcripts: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Transcript { role, text } => Some((role, text)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transcripts,
        vec![
            (Role::User, "מה שלומך?".to_string()),
            (Role::Model, "מצוין!".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_retries_until_budget_is_exhausted() {
    let connector = Arc::new(MockConnector::new(vec![Script::ServeThenDrop(vec![
        response_audio(240),
    ])]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        session_config(),
        connector.clone(),
        Arc::new(MockBackend::default()),
    )
    .with_events(tx);

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(3600)),
        )
        .await;

    match result {
        Err(SessionError::RetriesExhausted { attempts, last }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(last, LinkError::Connection(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    // The first connection plus two reconnects.
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

    let events = drain(&mut rx);
    let backoffs: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::BackingOff { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        backoffs,
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
        ]
    );
    assert_eq!(events.last(), Some(&SessionEvent::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_successful_reconnect_resets_the_budget() {
    let connector = Arc::new(MockConnector::new(vec![
        Script::ServeThenDrop(Vec::new()),
        Script::Refuse,
        Script::ServeThenDrop(Vec::new()),
        Script::Refuse,
        Script::Serve(Vec::new()),
    ]));
    let controller = SessionController::new(
        session_config(),
        connector.clone(),
        Arc::new(MockBackend::default()),
    );

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(10)),
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_remote_error_triggers_reconnect() {
    let connector = Arc::new(MockConnector::new(vec![
        Script::Serve(vec![InboundMessage::Turn(TurnSignal::Error(
            "quota exceeded".to_string(),
        ))]),
        Script::Serve(Vec::new()),
    ]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        session_config(),
        connector.clone(),
        Arc::new(MockBackend::default()),
    )
    .with_events(tx);

    controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    let events = drain(&mut rx);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Connected { .. })), 2);
    assert!(events.iter().any(
        |e| matches!(e, SessionEvent::Disconnected { reason } if reason.contains("quota exceeded"))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_when_reconnect_is_disabled() {
    let connector = Arc::new(MockConnector::new(vec![Script::Refuse]));
    let config = SessionConfig {
        auto_reconnect: false,
        ..session_config()
    };
    let controller =
        SessionController::new(config, connector.clone(), Arc::new(MockBackend::default()));

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(3600)),
        )
        .await;

    assert!(matches!(
        result,
        Err(SessionError::RetriesExhausted { attempts: 0, .. })
    ));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_device_fails_before_connecting() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(Vec::new())]));
    let backend = Arc::new(MockBackend {
        capture_missing: true,
        ..Default::default()
    });
    let controller = SessionController::new(session_config(), connector.clone(), backend);

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;

    assert!(matches!(
        result,
        Err(SessionError::Device(AudioError::Device { .. }))
    ));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_backing_off_is_clean() {
    let connector = Arc::new(MockConnector::new(vec![Script::Refuse]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        SessionConfig {
            reconnect_delay_ms: 60_000,
            ..session_config()
        },
        connector.clone(),
        Arc::new(MockBackend::default()),
    )
    .with_events(tx);

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::BackingOff { attempt: 1, .. })));
    assert_eq!(events.last(), Some(&SessionEvent::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_no_audio_is_sent_until_the_turn_resume_delay_expires() {
    let turn_at = Duration::from_millis(300);
    let resume_delay = Duration::from_millis(1000);
    let connector = Arc::new(MockConnector::new(vec![Script::ServeAfter(
        turn_at,
        vec![response_audio(240), turn_complete()],
    )]));
    let config = SessionConfig {
        turn_resume_delay_ms: resume_delay.as_millis() as u64,
        ..session_config()
    };
    let controller =
        SessionController::new(config, connector.clone(), Arc::new(MockBackend::default()));

    let start = Instant::now();
    controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    let sent_at: Vec<Duration> = connector
        .outbound
        .sent_at
        .lock()
        .unwrap()
        .iter()
        .map(|t| t.duration_since(start))
        .collect();

    assert!(sent_at.iter().any(|&t| t < turn_at), "nothing sent before the turn: {sent_at:?}");
    assert!(
        !sent_at.iter().any(|&t| t >= turn_at && t < turn_at + resume_delay),
        "audio sent during the pause: {sent_at:?}"
    );
    assert!(
        sent_at.iter().any(|&t| t >= turn_at + resume_delay),
        "sending never resumed: {sent_at:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_playback_overrun_drops_audio_but_keeps_the_session() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(vec![
        response_audio(240),
        response_audio(240),
        turn_complete(),
    ])]));
    let backend = Arc::new(MockBackend {
        playback_full: true,
        ..Default::default()
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(session_config(), connector.clone(), backend.clone())
        .with_events(tx);

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_millis(500)),
        )
        .await;
    assert!(result.is_ok());

    let events = drain(&mut rx);
    assert_eq!(count(&events, |e| *e == SessionEvent::PlaybackOverrun), 2);
    assert_eq!(count(&events, |e| *e == SessionEvent::TurnComplete), 1);
    assert_eq!(count(&events, |e| matches!(e, SessionEvent::Disconnected { .. })), 0);
    assert!(backend.played.lock().unwrap().is_empty());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert!(!connector.outbound.sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_speaker_fails_before_connecting() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(Vec::new())]));
    let backend = Arc::new(MockBackend {
        playback_missing: true,
        ..Default::default()
    });
    let controller = SessionController::new(session_config(), connector.clone(), backend);

    let result = controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;

    assert!(matches!(
        result,
        Err(SessionError::Device(AudioError::Device { .. }))
    ));
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_speaker_is_released_off_the_runtime_thread() {
    let connector = Arc::new(MockConnector::new(vec![Script::Serve(Vec::new())]));
    let backend = Arc::new(MockBackend::default());
    let controller = SessionController::new(session_config(), connector, backend.clone());

    controller
        .run(
            "persona",
            &AudioConfig::default(),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let released_on = *backend.released_on.lock().unwrap();
    assert!(released_on.is_some(), "speaker was not released");
    assert_ne!(released_on, Some(thread::current().id()));
}
