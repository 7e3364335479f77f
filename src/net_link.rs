//! Conversation link: a persistent WebSocket to the speech-to-speech service.
//!
//! The link never retries on its own; reconnection is the session
//! controller's job.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;
use uuid::Uuid;

use crate::audio::{AudioFormat, AudioFrame};
use crate::config::{ApiConfig, AudioConfig};
use crate::error::LinkError;
use crate::protocol::{self, InboundMessage, ServerMessage, SetupParams};

/// Lazy sequence of inbound messages. Ends (or yields an error) when the
/// connection closes.
pub type InboundStream = BoxStream<'static, Result<InboundMessage, LinkError>>;

/// Write half of a connection.
#[async_trait]
pub trait OutboundLink: Send {
    /// Forward one capture frame. Frames whose length differs from the
    /// configured chunk are rejected with [`LinkError::PartialFrame`].
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), LinkError>;

    /// Close the connection; later sends fail with [`LinkError::NotConnected`].
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// A live connection, split so the send and receive loops can run
/// concurrently.
pub struct Connection {
    pub id: Uuid,
    pub outbound: Box<dyn OutboundLink>,
    pub inbound: InboundStream,
}

/// What the session negotiates at connect time.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// Persona / system instruction
    pub system_instruction: String,
    pub input_format: AudioFormat,
    pub output_format: AudioFormat,
    /// Samples per channel in every outbound frame
    pub chunk_size: usize,
}

impl SessionSetup {
    pub fn new(system_instruction: impl Into<String>, audio: &AudioConfig) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            input_format: audio.input_format(),
            output_format: audio.output_format(),
            chunk_size: audio.chunk_size,
        }
    }

    pub fn chunk_bytes(&self) -> usize {
        self.input_format.chunk_bytes(self.chunk_size)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, setup: &SessionSetup) -> Result<Connection, LinkError>;
}

/// Open a connection, wait for the service to accept the setup, then close
/// it again. Used to verify the API key and endpoint without audio.
pub async fn check_connection(
    connector: &dyn Connector,
    setup: &SessionSetup,
) -> Result<Uuid, LinkError> {
    let mut conn = connector.connect(setup).await?;
    conn.outbound.close().await?;
    Ok(conn.id)
}

/// Reject anything but a full capture chunk.
pub fn check_frame_len(frame: &AudioFrame, expected: usize) -> Result<(), LinkError> {
    if frame.byte_len() != expected {
        return Err(LinkError::PartialFrame {
            expected,
            actual: frame.byte_len(),
        });
    }
    Ok(())
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the Gemini Live `BidiGenerateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    api: ApiConfig,
    transcribe: bool,
    opening_turn: Option<String>,
}

impl GeminiConnector {
    pub fn new(api: ApiConfig) -> Self {
        Self {
            api,
            transcribe: false,
            opening_turn: None,
        }
    }

    /// Ask the service for transcripts of both sides of the conversation.
    pub fn with_transcription(mut self, enabled: bool) -> Self {
        self.transcribe = enabled;
        self
    }

    /// Send `text` as a complete user turn right after setup, so the model
    /// speaks first.
    pub fn with_opening_turn(mut self, text: Option<String>) -> Self {
        self.opening_turn = text;
        self
    }

    fn endpoint_url(&self) -> Result<Url, LinkError> {
        let mut url = Url::parse(&self.api.endpoint)
            .map_err(|e| LinkError::Connection(format!("bad endpoint {}: {}", self.api.endpoint, e)))?;
        if !self.api.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.api.api_key);
        }
        Ok(url)
    }

    async fn handshake(&self, setup: &SessionSetup) -> Result<WsStream, LinkError> {
        let url = self.endpoint_url()?;

        // The key is in the query string, only log the endpoint.
        tracing::info!("Connecting to {}...", self.api.endpoint);
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))?;

        let setup_msg = protocol::setup_message(&SetupParams {
            model: &self.api.model,
            voice_name: &self.api.voice_name,
            response_modalities: &self.api.response_modalities,
            system_instruction: &setup.system_instruction,
            transcribe: self.transcribe,
        });
        let setup_json =
            serde_json::to_string(&setup_msg).map_err(|e| LinkError::Connection(e.to_string()))?;
        tracing::debug!("Sending setup for model {}", self.api.model);
        ws.send(Message::Text(setup_json.into()))
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))?;

        wait_for_setup_complete(&mut ws).await?;

        if let Some(text) = &self.opening_turn {
            let json = serde_json::to_string(&protocol::user_text_message(text))
                .map_err(|e| LinkError::Connection(e.to_string()))?;
            ws.send(Message::Text(json.into()))
                .await
                .map_err(|e| LinkError::Connection(e.to_string()))?;
        }

        Ok(ws)
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(&self, setup: &SessionSetup) -> Result<Connection, LinkError> {
        let timeout = self.api.setup_timeout();
        let ws = tokio::time::timeout(timeout, self.handshake(setup))
            .await
            .map_err(|_| LinkError::Connection(format!("setup not completed within {timeout:?}")))??;

        let id = Uuid::new_v4();
        tracing::info!(connection_id = %id, "Connected!");

        let (write, read) = ws.split();
        Ok(Connection {
            id,
            outbound: Box::new(GeminiOutbound {
                write,
                chunk_bytes: setup.chunk_bytes(),
                open: true,
            }),
            inbound: inbound_stream(read, setup.output_format),
        })
    }
}

async fn wait_for_setup_complete(ws: &mut WsStream) -> Result<(), LinkError> {
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| LinkError::Connection(e.to_string()))?;
        let raw = match &msg {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => &data[..],
            Message::Close(frame) => {
                return Err(LinkError::Connection(format!(
                    "closed during setup: {}",
                    close_reason(frame.as_ref())
                )));
            }
            _ => continue,
        };
        match ServerMessage::parse(raw) {
            Ok(server_msg) if server_msg.is_setup_complete() => {
                tracing::debug!("Setup complete");
                return Ok(());
            }
            Ok(_) => tracing::debug!("Ignoring message received before setupComplete"),
            Err(e) => tracing::warn!("Unreadable message during setup: {}", e),
        }
    }
    Err(LinkError::Connection("connection closed during setup".to_string()))
}

struct GeminiOutbound {
    write: SplitSink<WsStream, Message>,
    chunk_bytes: usize,
    open: bool,
}

#[async_trait]
impl OutboundLink for GeminiOutbound {
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        check_frame_len(frame, self.chunk_bytes)?;

        let json = serde_json::to_string(&protocol::audio_message(frame))
            .map_err(|e| LinkError::Send(e.to_string()))?;
        if let Err(e) = self.write.send(Message::Text(json.into())).await {
            self.open = false;
            return Err(LinkError::Send(e.to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        // Closing the sink sends the close frame.
        self.write
            .close()
            .await
            .map_err(|e| LinkError::Send(e.to_string()))
    }
}

fn inbound_stream(read: SplitStream<WsStream>, fallback: AudioFormat) -> InboundStream {
    read.map(move |msg| {
        let decoded = match msg {
            Ok(Message::Text(text)) => decode_payload(text.as_str().as_bytes(), fallback),
            Ok(Message::Binary(data)) => decode_payload(&data, fallback),
            Ok(Message::Close(frame)) => {
                vec![Err(LinkError::Closed(close_reason(frame.as_ref())))]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![Err(LinkError::Receive(e.to_string()))],
        };
        stream::iter(decoded)
    })
    .flatten()
    .boxed()
}

fn decode_payload(raw: &[u8], fallback: AudioFormat) -> Vec<Result<InboundMessage, LinkError>> {
    let msg = match ServerMessage::parse(raw) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Skipping server message: {}", e);
            return Vec::new();
        }
    };

    if let Some(go_away) = &msg.go_away {
        tracing::warn!(
            "Server is going away (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }

    msg.into_inbound(fallback).into_iter().map(Ok).collect()
}

fn close_reason(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(f) if !f.reason.as_str().is_empty() => format!("{} ({})", f.reason.as_str(), u16::from(f.code)),
        Some(f) => format!("code {}", u16::from(f.code)),
        None => "no close frame".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_must_match_the_chunk() {
        let format = AudioFormat::new(16000, 1);
        let full = AudioFrame::from_samples(&vec![0; 1024], format);
        let short = AudioFrame::from_samples(&vec![0; 1000], format);

        assert!(check_frame_len(&full, format.chunk_bytes(1024)).is_ok());
        match check_frame_len(&short, format.chunk_bytes(1024)) {
            Err(LinkError::PartialFrame { expected, actual }) => {
                assert_eq!(expected, 2048);
                assert_eq!(actual, 2000);
            }
            other => panic!("expected PartialFrame, got {other:?}"),
        }
    }

    #[test]
    fn api_key_goes_into_the_query() {
        let mut api = ApiConfig::default();
        api.endpoint = "wss://example.test/ws".to_string();
        api.api_key = "k&y".to_string();
        let url = GeminiConnector::new(api).endpoint_url().unwrap();
        assert_eq!(url.as_str(), "wss://example.test/ws?key=k%26y");
    }

    #[test]
    fn bad_endpoint_is_a_connection_error() {
        let mut api = ApiConfig::default();
        api.endpoint = "not a url".to_string();
        let err = GeminiConnector::new(api).endpoint_url().unwrap_err();
        assert!(matches!(err, LinkError::Connection(_)));
    }
}
