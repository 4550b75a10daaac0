//! Voice pipeline for callbridge.
//!
//! Converts carrier audio into recognition input, drives speech
//! recognition one utterance at a time, generates reply text, and
//! synthesizes replies through an ordered list of speech providers with
//! the carrier's own text-to-speech as the last resort.
//!
//! Providers are modeled as traits ([`SpeechRecognizer`],
//! [`SpeechSynthesizer`], [`TextGenerator`], [`CarrierFallbackSpeaker`])
//! so the server can be wired to hosted APIs, local binaries or test
//! doubles.

pub mod error;
pub mod fallback;
pub mod generate;
pub mod stt;
pub mod transcode;
pub mod tts;
pub mod vad;

pub use error::VoiceError;
pub use fallback::{CarrierCall, CarrierFallbackSpeaker, TwilioSayFallback};
pub use generate::{OpenAiChatGenerator, ScriptRule, ScriptedGenerator, TextGenerator};
pub use stt::{
    DriverTimeouts, RecognitionConfig, RecognitionEvent, RecognitionRequest, RecognitionResults,
    SpeechRecognizer, TranscriptionDriver, TranscriptionHandle, WhisperRecognizer,
};
pub use transcode::{FrameAssembler, Transcoder};
pub use tts::{
    single_buffer, AudioStream, ElevenLabsSynthesizer, PiperSynthesizer, Reply, ReplyAudio,
    SpeechSynthesizer, SynthesisDriver, SystemSynthesizer, VoiceSettings,
};
pub use vad::VadConfig;
