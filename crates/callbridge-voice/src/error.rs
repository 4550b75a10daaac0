use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Text generation error: {0}")]
    Generation(String),

    #[error("Carrier error: {0}")]
    Carrier(String),

    #[error("Transcode error: {0}")]
    Transcode(String),

    #[error("{operation} timed out after {} ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl VoiceError {
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<callbridge_types::FormatError> for VoiceError {
    fn from(e: callbridge_types::FormatError) -> Self {
        Self::Transcode(e.to_string())
    }
}
