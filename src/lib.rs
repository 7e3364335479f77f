//! Hebrew-speaking conversational doll: streams the microphone to the Gemini
//! Live speech-to-speech API and plays the spoken answers back.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod net_link;
pub mod persona;
pub mod protocol;
pub mod state_machine;

pub use config::Config;
pub use controller::{SessionController, SessionEvent};
pub use error::{AudioError, LinkError, SessionError};
