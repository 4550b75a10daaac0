//! Streaming speech recognition.
//!
//! A [`SpeechRecognizer`] is handed the receiving end of a request channel
//! whose first element is always the configuration handshake, and answers
//! with a channel of recognition results. [`TranscriptionDriver`] owns that
//! ordering: audio can only reach the provider through a
//! [`TranscriptionHandle`], and a handle only exists after the handshake has
//! been queued.

use crate::error::VoiceError;
use crate::transcode::mulaw_to_linear;
use crate::vad::{Endpointer, VadConfig};
use async_trait::async_trait;
use callbridge_types::{AudioEncoding, AudioFrame, Utterance};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bounded depth of the audio request channel. Provides backpressure when a
/// recognizer falls behind the wire clock.
const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// Maximum audio handed to the STT binary for one utterance (10 MiB).
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Handshake sent before any audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionConfig {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub language: String,
    pub interim_results: bool,
    pub single_utterance: bool,
}

/// Messages flowing from the driver to a recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionRequest {
    Configure(RecognitionConfig),
    Audio(Vec<u8>),
}

/// Messages flowing from a recognizer to the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// The caller stopped talking and the provider is working on a transcript.
    SpeechEnded,
    Transcript(Utterance),
}

/// Results flowing from a recognizer to the driver.
pub type RecognitionResults = mpsc::Receiver<Result<RecognitionEvent, VoiceError>>;

/// A streaming speech-to-text backend.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Opens a recognition stream fed by `requests`.
    ///
    /// The first request is guaranteed to be [`RecognitionRequest::Configure`].
    /// The stream ends when `requests` closes or the returned receiver is
    /// dropped.
    async fn open(
        &self,
        requests: mpsc::Receiver<RecognitionRequest>,
    ) -> Result<RecognitionResults, VoiceError>;
}

/// Timeouts applied by the driver around a recognizer.
#[derive(Debug, Clone, Copy)]
pub struct DriverTimeouts {
    /// Bound on opening a stream.
    pub open: Duration,
    /// Bound on waiting for the next result once the provider has heard
    /// speech (an end-of-speech signal or an interim transcript).
    pub result: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(10),
            result: Duration::from_secs(30),
        }
    }
}

/// Opens single-utterance transcription streams against one recognizer.
#[derive(Debug, Clone)]
pub struct TranscriptionDriver {
    recognizer: Arc<dyn SpeechRecognizer>,
    config: RecognitionConfig,
    timeouts: DriverTimeouts,
}

impl TranscriptionDriver {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        config: RecognitionConfig,
        timeouts: DriverTimeouts,
    ) -> Self {
        Self {
            recognizer,
            config,
            timeouts,
        }
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    /// Starts a new stream for `call_id`. The handshake is queued before the
    /// recognizer ever sees the channel.
    pub async fn start(&self, call_id: &str) -> Result<TranscriptionHandle, VoiceError> {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        tx.try_send(RecognitionRequest::Configure(self.config.clone()))
            .map_err(|e| VoiceError::Stt(format!("failed to queue handshake: {}", e)))?;

        let results = tokio::time::timeout(self.timeouts.open, self.recognizer.open(rx))
            .await
            .map_err(|_| VoiceError::timeout("recognition stream open", self.timeouts.open))??;

        debug!(
            call_id,
            recognizer = self.recognizer.name(),
            language = %self.config.language,
            "transcription stream opened"
        );

        Ok(TranscriptionHandle {
            call_id: call_id.to_string(),
            requests: Some(tx),
            results,
            result_timeout: self.timeouts.result,
            deadline: None,
            interim: Vec::new(),
            exhausted: false,
        })
    }

    /// Releases the provider side of a stream.
    pub fn stop(&self, mut handle: TranscriptionHandle) {
        handle.close();
    }
}

/// One live recognition stream.
///
/// Single-utterance: after the first final result the handle is exhausted and
/// a new one must be started for the next turn.
#[derive(Debug)]
pub struct TranscriptionHandle {
    call_id: String,
    requests: Option<mpsc::Sender<RecognitionRequest>>,
    results: RecognitionResults,
    result_timeout: Duration,
    deadline: Option<Instant>,
    interim: Vec<String>,
    exhausted: bool,
}

impl TranscriptionHandle {
    /// Forwards one frame (already in the recognition format).
    ///
    /// Once the recognizer stops reading, audio is dropped so that a queued
    /// result can still be collected with [`Self::next_utterance`].
    pub async fn push_audio(&mut self, frame: AudioFrame) -> Result<(), VoiceError> {
        let Some(requests) = self.requests.as_ref() else {
            return Ok(());
        };
        if requests
            .send(RecognitionRequest::Audio(frame.data))
            .await
            .is_err()
        {
            debug!(call_id = %self.call_id, "recognizer stopped reading audio");
            self.close();
        }
        Ok(())
    }

    /// Waits for the final utterance of this stream.
    ///
    /// Interim results are collected into [`Self::interim_transcript`]. Once a
    /// final result has been returned, further calls return `Ok(None)`.
    ///
    /// No deadline runs while the caller is silent. The result timeout is
    /// armed when the provider reports the end of speech and refreshed by
    /// every interim. Safe to cancel: the deadline survives across calls.
    pub async fn next_utterance(&mut self) -> Result<Option<Utterance>, VoiceError> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let received = match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.results.recv())
                    .await
                    .map_err(|_| VoiceError::timeout("recognition result", self.result_timeout))?,
                None => self.results.recv().await,
            };

            match received {
                None => {
                    return Err(VoiceError::Stt(
                        "recognition stream ended without a final result".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(RecognitionEvent::SpeechEnded)) => {
                    debug!(call_id = %self.call_id, "end of speech, awaiting transcript");
                    self.deadline = Some(Instant::now() + self.result_timeout);
                }
                Some(Ok(RecognitionEvent::Transcript(utterance))) if !utterance.is_final => {
                    debug!(call_id = %self.call_id, text = %utterance.text, "interim transcript");
                    self.interim.push(utterance.text);
                    self.deadline = Some(Instant::now() + self.result_timeout);
                }
                Some(Ok(RecognitionEvent::Transcript(utterance))) => {
                    self.exhausted = true;
                    self.close();
                    return Ok(Some(utterance));
                }
            }
        }
    }

    /// Interim fragments received so far, in order.
    pub fn interim_transcript(&self) -> &[String] {
        &self.interim
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Ends the audio input. The recognizer sees its request channel close.
    pub fn close(&mut self) {
        self.requests.take();
    }
}

/// Recognizer that endpoints speech locally and transcribes each utterance
/// with a whisper.cpp compatible binary.
#[derive(Debug, Clone)]
pub struct WhisperRecognizer {
    model_path: PathBuf,
    binary_path: PathBuf,
    vad: VadConfig,
    timeout: Duration,
}

impl WhisperRecognizer {
    pub fn new(model_path: impl Into<PathBuf>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            binary_path: binary_path.into(),
            vad: VadConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the binary over one utterance of mono PCM.
    pub async fn transcribe(
        &self,
        samples: &[i16],
        sample_rate: u32,
        language: &str,
    ) -> Result<String, VoiceError> {
        let wav = wav_bytes(samples, sample_rate);
        if wav.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                wav.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        // whisper.cpp wants the bare language ("he"), not the locale ("he-IL").
        let language = language.split(['-', '_']).next().unwrap_or(language);

        let mut child = Command::new(&self.binary_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-l")
            .arg(language)
            .arg("-nt")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Stt(format!("Failed to spawn STT binary: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Stt("Failed to open stdin".to_string()))?;
        let write_task = tokio::spawn(async move { stdin.write_all(&wav).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VoiceError::timeout("STT process", self.timeout))?
            .map_err(|e| VoiceError::Stt(format!("Failed to read stdout: {}", e)))?;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("STT binary closed stdin early: {}", e),
            Err(e) => return Err(VoiceError::Stt(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Stt(format!("STT binary failed: {}", stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_stream(
        self,
        config: RecognitionConfig,
        mut requests: mpsc::Receiver<RecognitionRequest>,
        results: mpsc::Sender<Result<RecognitionEvent, VoiceError>>,
    ) {
        let mut endpointer = Endpointer::new(&self.vad, config.sample_rate);

        let segment = loop {
            let request = tokio::select! {
                request = requests.recv() => request,
                () = results.closed() => return,
            };
            match request {
                Some(RecognitionRequest::Audio(bytes)) => {
                    let samples = match decode_input(&bytes, config.encoding) {
                        Some(samples) => samples,
                        None => {
                            warn!(len = bytes.len(), "ignoring misaligned PCM chunk");
                            continue;
                        }
                    };
                    if let Some(segment) = endpointer.push(&samples) {
                        break segment;
                    }
                }
                Some(RecognitionRequest::Configure(_)) => {
                    warn!("ignoring repeated recognition handshake");
                }
                None => match endpointer.flush() {
                    Some(segment) => break segment,
                    None => return,
                },
            }
        };

        if results.send(Ok(RecognitionEvent::SpeechEnded)).await.is_err() {
            return;
        }

        // Audio keeps arriving while the binary runs. It belongs to no
        // utterance, but the channel must keep draining so the sender never
        // blocks behind a full queue.
        let transcription = self.transcribe(&segment, config.sample_rate, &config.language);
        tokio::pin!(transcription);
        let mut reading = true;
        let outcome = loop {
            tokio::select! {
                outcome = &mut transcription => break outcome,
                request = requests.recv(), if reading => {
                    if request.is_none() {
                        reading = false;
                    }
                }
                () = results.closed() => return,
            }
        };

        let message = outcome.map(|text| {
            info!(chars = text.chars().count(), "utterance transcribed");
            RecognitionEvent::Transcript(Utterance::final_text(text, None))
        });
        let _ = results.send(message).await;
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperRecognizer {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn open(
        &self,
        mut requests: mpsc::Receiver<RecognitionRequest>,
    ) -> Result<RecognitionResults, VoiceError> {
        let config = match requests.recv().await {
            Some(RecognitionRequest::Configure(config)) => config,
            Some(RecognitionRequest::Audio(_)) => {
                return Err(VoiceError::Stt(
                    "audio received before the recognition handshake".to_string(),
                ))
            }
            None => {
                return Err(VoiceError::Stt(
                    "request stream closed before the handshake".to_string(),
                ))
            }
        };
        if config.sample_rate == 0 {
            return Err(VoiceError::Config(
                "recognition sample rate must be non-zero".to_string(),
            ));
        }
        if !config.single_utterance {
            return Err(VoiceError::Config(
                "whisper recognizer only supports single-utterance streams".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(self.clone().run_stream(config, requests, tx));
        Ok(rx)
    }
}

fn decode_input(bytes: &[u8], encoding: AudioEncoding) -> Option<Vec<i16>> {
    match encoding {
        AudioEncoding::Mulaw => Some(bytes.iter().copied().map(mulaw_to_linear).collect()),
        AudioEncoding::Pcm16 if bytes.len() % 2 == 0 => Some(
            bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        ),
        AudioEncoding::Pcm16 => None,
    }
}

/// Wraps mono PCM16 in a canonical 44-byte WAV header.
pub fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
