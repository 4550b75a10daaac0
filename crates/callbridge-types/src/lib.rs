//! Shared types for the callbridge workspace.
//!
//! This crate holds the data model that flows between the media-stream
//! server and the voice pipeline: audio formats and frames, utterances,
//! reply outcomes, turn history, and the session events published for
//! observability.
//!
//! Nothing in here performs I/O. Keeping the model separate lets
//! `callbridge-voice` and `callbridge-server` agree on types without
//! depending on each other.

pub mod audio;
pub mod conversation;

pub use audio::{
    AudioEncoding, AudioFormat, AudioFrame, FormatError, CARRIER_FRAME_MS, CARRIER_SAMPLE_RATE,
};
pub use conversation::{ProviderAttempt, ReplyOutcome, TurnRecord, Utterance};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Turn-taking state of a live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Collecting caller speech.
    #[default]
    Listening,
    /// Waiting for the reply text.
    Thinking,
    /// Streaming the reply audio to the carrier.
    Speaking,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The carrier sent a `stop` frame.
    Stopped,
    /// The connection closed or failed.
    Disconnected,
    /// Too many unreadable frames in a short window.
    CorruptStream,
    /// The conversation finished on its own (single-turn mode).
    Completed,
    /// An error the session could not recover from.
    Failed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Disconnected => "disconnected",
            Self::CorruptStream => "corrupt_stream",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle and turn events published by each call session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        call_id: String,
        from: CallState,
        to: CallState,
    },
    TurnCompleted {
        call_id: String,
        turn: u32,
        outcome: ReplyOutcome,
    },
    SessionClosed {
        call_id: String,
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn call_id(&self) -> &str {
        match self {
            Self::StateChanged { call_id, .. }
            | Self::TurnCompleted { call_id, .. }
            | Self::SessionClosed { call_id, .. } => call_id,
        }
    }
}
