//! Carrier media stream framing.
//!
//! Every WebSocket text message is a JSON object with an `event` field.
//! Audio travels base64-encoded in `media.payload`.

use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Name of the mark sent after the last frame of every reply.
pub const END_OF_SPEECH_MARK: &str = "end_of_bot_speech";

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlEvent),
    Audio(AudioChunk),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Connected,
    Start {
        stream_id: String,
        call_sid: Option<String>,
    },
    Stop,
    /// The carrier finished playing everything up to this mark.
    Mark {
        name: String,
    },
    Dtmf {
        digit: String,
    },
}

/// Raw µ-law audio from one `media` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid media payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("start event without a stream id")]
    MissingStreamId,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum Frame {
    Connected {},
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: Option<String>,
        start: StartBody,
    },
    Media {
        media: MediaBody,
    },
    Stop {},
    Mark {
        mark: MarkBody,
    },
    Dtmf {
        dtmf: DtmfBody,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    stream_sid: Option<String>,
    call_sid: Option<String>,
}

#[derive(Deserialize)]
struct MediaBody {
    payload: String,
}

#[derive(Deserialize)]
struct MarkBody {
    name: String,
}

#[derive(Deserialize)]
struct DtmfBody {
    digit: String,
}

/// Parses one inbound text message.
pub fn decode(raw: &str) -> Result<Inbound, CodecError> {
    let frame = match serde_json::from_str(raw)? {
        Frame::Connected {} => Inbound::Control(ControlEvent::Connected),
        Frame::Start { stream_sid, start } => {
            let stream_id = start
                .stream_sid
                .or(stream_sid)
                .filter(|id| !id.is_empty())
                .ok_or(CodecError::MissingStreamId)?;
            Inbound::Control(ControlEvent::Start {
                stream_id,
                call_sid: start.call_sid,
            })
        }
        Frame::Media { media } => Inbound::Audio(AudioChunk {
            data: base64::engine::general_purpose::STANDARD.decode(media.payload.as_bytes())?,
        }),
        Frame::Stop {} => Inbound::Control(ControlEvent::Stop),
        Frame::Mark { mark } => Inbound::Control(ControlEvent::Mark { name: mark.name }),
        Frame::Dtmf { dtmf } => Inbound::Control(ControlEvent::Dtmf { digit: dtmf.digit }),
    };
    Ok(frame)
}

/// Serializes one outbound audio chunk for `call_id`.
pub fn encode(chunk: &[u8], call_id: &str) -> String {
    json!({
        "event": "media",
        "streamSid": call_id,
        "media": {
            "payload": base64::engine::general_purpose::STANDARD.encode(chunk),
        },
    })
    .to_string()
}

pub fn encode_mark(call_id: &str, name: &str) -> String {
    json!({
        "event": "mark",
        "streamSid": call_id,
        "mark": { "name": name },
    })
    .to_string()
}

/// Counts malformed frames in a sliding time window.
#[derive(Debug)]
pub struct ErrorBudget {
    threshold: u32,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl ErrorBudget {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            hits: VecDeque::new(),
        }
    }

    /// Records one error at `now`. Returns true once more than `threshold`
    /// errors fall inside the window.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        self.hits.len() > self.threshold as usize
    }
}
