use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::audio::AudioFormat;

/// File looked up in the working directory when no `--config` is given
/// (any extension the `config` crate understands, normally `config.toml`).
pub const DEFAULT_CONFIG_FILE: &str = "config";

/// Prefix of environment overrides, e.g. `HEBREW_DOLL__AUDIO__CHUNK_SIZE=2048`.
pub const ENV_PREFIX: &str = "HEBREW_DOLL";

/// Fallback environment variables for the API key, in lookup order.
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable application configuration, built once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub app: AppConfig,
}

/// Conversation service settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// WebSocket endpoint of the BidiGenerateContent service
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// Prebuilt voice: Puck, Charon, Kore, Fenrir, Aoede
    pub voice_name: String,
    /// `["AUDIO"]` or `["TEXT", "AUDIO"]`
    pub response_modalities: Vec<String>,
    /// How long to wait for `setupComplete` after connecting
    pub setup_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key: String::new(),
            model: "gemini-2.0-flash-exp".to_string(),
            voice_name: "Puck".to_string(),
            response_modalities: vec!["AUDIO".to_string()],
            setup_timeout_ms: 10_000,
        }
    }
}

impl ApiConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

// Keeps the key out of logs.
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("response_modalities", &self.response_modalities)
            .field("setup_timeout_ms", &self.setup_timeout_ms)
            .finish()
    }
}

/// Audio device settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:1,0")
    pub input_device: String,
    /// ALSA playback device name
    pub output_device: String,
    /// Microphone sample rate sent to the service
    pub input_sample_rate: u32,
    /// Sample rate of the audio the service returns
    pub output_sample_rate: u32,
    /// 1 = mono, 2 = stereo
    pub channels: u16,
    /// Samples per channel in one capture frame.
    /// Smaller = lower latency, larger = more stable. Common: 512, 1024, 2048
    pub chunk_size: usize,
    /// Captured frames buffered between the recording thread and the session
    pub capture_queue_frames: usize,
    /// Inbound frames buffered ahead of the speaker
    pub playback_queue_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: "default".to_string(),
            output_device: "default".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            channels: 1,
            chunk_size: 1024,
            capture_queue_frames: 32,
            playback_queue_frames: 256,
        }
    }
}

impl AudioConfig {
    pub fn input_format(&self) -> AudioFormat {
        AudioFormat::new(self.input_sample_rate, self.channels)
    }

    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::new(self.output_sample_rate, self.channels)
    }

    /// Byte length every outbound frame must have.
    pub fn chunk_bytes(&self) -> usize {
        self.input_format().chunk_bytes(self.chunk_size)
    }
}

/// Turn-taking and reconnection tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pause of the send loop after the service completes a turn
    pub turn_resume_delay_ms: u64,
    /// Sleep after each outbound frame (0 disables)
    pub send_delay_ms: u64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// First backoff interval
    pub reconnect_delay_ms: u64,
    /// Growth of the backoff interval per consecutive failure
    pub reconnect_backoff_factor: f64,
    pub max_reconnect_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_resume_delay_ms: 50,
            send_delay_ms: 10,
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 5_000,
            reconnect_backoff_factor: 2.0,
            max_reconnect_delay_ms: 60_000,
        }
    }
}

impl SessionConfig {
    pub fn turn_resume_delay(&self) -> Duration {
        Duration::from_millis(self.turn_resume_delay_ms)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }
}

/// Persona and console behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Built-in persona preset name
    pub persona: String,
    /// Custom system instruction, overrides `persona` when set
    pub system_instruction: Option<String>,
    pub greeting: String,
    /// Ask the model to greet the user as soon as the session is up
    pub greet_on_connect: bool,
    pub show_transcription: bool,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            persona: "doll".to_string(),
            system_instruction: None,
            greeting: "שלום! אני כאן לדבר איתך בעברית. במה אוכל לעזור?".to_string(),
            greet_on_connect: false,
            show_transcription: true,
            debug: false,
        }
    }
}

impl Config {
    /// Layer defaults, the config file and `HEBREW_DOLL__*` environment
    /// variables. An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Config = settings.try_deserialize()?;

        if cfg.api.api_key.is_empty() {
            if let Some(key) = API_KEY_ENV_VARS
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
            {
                cfg.api.api_key = key.trim().to_string();
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return invalid("audio sample rates must be positive");
        }
        if self.audio.channels == 0 {
            return invalid("audio.channels must be at least 1");
        }
        if self.audio.chunk_size == 0 {
            return invalid("audio.chunk_size must be positive");
        }
        if self.audio.capture_queue_frames == 0 || self.audio.playback_queue_frames == 0 {
            return invalid("audio queue sizes must be positive");
        }
        if !(self.session.reconnect_backoff_factor >= 1.0) {
            return invalid("session.reconnect_backoff_factor must be >= 1");
        }
        if self.api.response_modalities.is_empty() {
            return invalid("api.response_modalities must not be empty");
        }
        Ok(())
    }

    /// The key is only needed to open a session, not to list devices.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        if self.api.api_key.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "API key missing: set api.api_key or one of {}",
                API_KEY_ENV_VARS.join(", ")
            )));
        }
        Ok(&self.api.api_key)
    }
}
