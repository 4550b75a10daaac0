//! Conversation-level records: utterances, replies and turn history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of recognized speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
    /// Set when the utterance was produced locally instead of by a recognizer.
    #[serde(default)]
    pub synthetic: bool,
}

impl Utterance {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: None,
            timestamp: Utc::now(),
            synthetic: false,
        }
    }

    pub fn final_text(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence,
            timestamp: Utc::now(),
            synthetic: false,
        }
    }

    pub fn synthetic(text: impl Into<String>) -> Self {
        Self {
            synthetic: true,
            ..Self::final_text(text, None)
        }
    }
}

/// How a reply's audio was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// The first provider in the preference list produced the audio.
    Primary,
    /// A later provider produced the audio after earlier ones failed.
    Fallback,
    /// No provider produced audio.
    Failed,
}

impl ReplyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of trying one synthesis provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    /// `None` on success, the failure description otherwise.
    pub error: Option<String>,
}

impl ProviderAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// One completed exchange between the caller and the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub utterance: String,
    pub reply: String,
}
