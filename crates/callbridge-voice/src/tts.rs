use crate::error::VoiceError;
use async_trait::async_trait;
use callbridge_types::{AudioFormat, ProviderAttempt, ReplyOutcome};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Audio produced by a provider, in the provider's own [`AudioFormat`].
pub type AudioStream = BoxStream<'static, Result<Vec<u8>, VoiceError>>;

/// Audio of a finished [`Reply`]. Errors have already been handled.
pub type ReplyAudio = BoxStream<'static, Vec<u8>>;

/// Per-call voice parameters passed to every provider.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSettings {
    /// Locale of the reply text, e.g. `he-IL`.
    pub language: String,
    /// Speech speed multiplier (1.0 is normal).
    pub speed: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            language: "he-IL".to_string(),
            speed: 1.0,
        }
    }
}

/// A text-to-speech backend.
///
/// Streaming providers yield chunks as they arrive; blocking providers wrap
/// their single buffer with [`single_buffer`].
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn output_format(&self) -> AudioFormat;

    async fn synthesize(&self, text: &str, voice: &VoiceSettings)
        -> Result<AudioStream, VoiceError>;
}

/// Wraps a complete buffer as a one-chunk [`AudioStream`].
pub fn single_buffer(bytes: Vec<u8>) -> AudioStream {
    stream::once(async move { Ok(bytes) }).boxed()
}

/// The outcome of one synthesis request.
pub struct Reply {
    pub text: String,
    pub audio: ReplyAudio,
    /// Format of `audio`; `None` when no provider succeeded.
    pub format: Option<AudioFormat>,
    pub provider: Option<String>,
    pub outcome: ReplyOutcome,
    pub attempts: Vec<ProviderAttempt>,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("text", &self.text)
            .field("format", &self.format)
            .field("provider", &self.provider)
            .field("outcome", &self.outcome)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Tries synthesis providers in preference order.
#[derive(Debug, Clone)]
pub struct SynthesisDriver {
    providers: Vec<Arc<dyn SpeechSynthesizer>>,
    voice: VoiceSettings,
    timeout: Duration,
}

impl SynthesisDriver {
    pub fn new(
        providers: Vec<Arc<dyn SpeechSynthesizer>>,
        voice: VoiceSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            providers,
            voice,
            timeout,
        }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Returns the first provider's audio that starts within the timeout.
    ///
    /// A provider counts as successful once it has produced its first
    /// non-empty chunk. When every provider fails the reply carries
    /// [`ReplyOutcome::Failed`], the original text and no audio.
    pub async fn synthesize(&self, text: &str) -> Reply {
        let mut attempts = Vec::with_capacity(self.providers.len());

        for (index, provider) in self.providers.iter().enumerate() {
            match self.first_chunk(provider.as_ref(), text).await {
                Ok((first, rest)) => {
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        error: None,
                    });
                    let outcome = if index == 0 {
                        ReplyOutcome::Primary
                    } else {
                        ReplyOutcome::Fallback
                    };
                    info!(
                        provider = provider.name(),
                        outcome = %outcome,
                        attempts = attempts.len(),
                        "synthesis provider selected"
                    );
                    let audio = stream::once(async move { first })
                        .chain(guard_stream(rest, provider.name().to_string(), self.timeout))
                        .boxed();
                    return Reply {
                        text: text.to_string(),
                        audio,
                        format: Some(provider.output_format()),
                        provider: Some(provider.name().to_string()),
                        outcome,
                        attempts,
                    };
                }
                Err(e) => {
                    warn!(provider = provider.name(), "synthesis provider failed: {}", e);
                    attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        warn!(attempts = attempts.len(), "every synthesis provider failed");
        Reply {
            text: text.to_string(),
            audio: stream::empty().boxed(),
            format: None,
            provider: None,
            outcome: ReplyOutcome::Failed,
            attempts,
        }
    }

    async fn first_chunk(
        &self,
        provider: &dyn SpeechSynthesizer,
        text: &str,
    ) -> Result<(Vec<u8>, AudioStream), VoiceError> {
        let attempt = async {
            let mut audio = provider.synthesize(text, &self.voice).await?;
            loop {
                match audio.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => return Ok((chunk, audio)),
                    Some(Err(e)) => return Err(e),
                    None => return Err(VoiceError::Tts("provider returned no audio".to_string())),
                }
            }
        };
        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| VoiceError::timeout("synthesis", self.timeout))?
    }
}

/// Ends the stream at the first error or stalled chunk instead of failing.
fn guard_stream(audio: AudioStream, provider: String, chunk_timeout: Duration) -> ReplyAudio {
    stream::unfold(Some(audio), move |state| {
        let provider = provider.clone();
        async move {
            let mut audio = state?;
            loop {
                match tokio::time::timeout(chunk_timeout, audio.next()).await {
                    Ok(Some(Ok(chunk))) if chunk.is_empty() => continue,
                    Ok(Some(Ok(chunk))) => return Some((chunk, Some(audio))),
                    Ok(Some(Err(e))) => {
                        warn!(provider = %provider, "synthesis stream failed mid-reply: {}", e);
                        return None;
                    }
                    Ok(None) => {
                        debug!(provider = %provider, "synthesis stream finished");
                        return None;
                    }
                    Err(_) => {
                        warn!(provider = %provider, "synthesis stream stalled; truncating reply");
                        return None;
                    }
                }
            }
        }
    })
    .boxed()
}

fn check_text_len(text: &str) -> Result<(), VoiceError> {
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Tts(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

/// Hosted streaming TTS that returns carrier-ready µ-law directly.
#[derive(Clone)]
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    voice_id: String,
    model_id: String,
}

impl fmt::Debug for ElevenLabsSynthesizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsSynthesizer")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl ElevenLabsSynthesizer {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        voice_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::carrier()
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSettings,
    ) -> Result<AudioStream, VoiceError> {
        check_text_len(text)?;
        let url = format!(
            "{}/v1/text-to-speech/{}/stream",
            self.base_url.trim_end_matches('/'),
            self.voice_id
        );
        let response = self
            .client
            .post(&url)
            .query(&[("output_format", "ulaw_8000")])
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model_id,
                "voice_settings": { "speed": voice.speed },
            }))
            .send()
            .await
            .map_err(|e| VoiceError::Tts(format!("ElevenLabs request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!(
                "ElevenLabs returned {}: {}",
                status, body
            )));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| VoiceError::Tts(format!("ElevenLabs stream error: {}", e)))
            })
            .boxed())
    }
}

/// Local Piper voice, run as a subprocess producing raw PCM.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    binary_path: PathBuf,
    model_path: PathBuf,
    sample_rate: u32,
    speaker_id: Option<u32>,
    timeout: Duration,
}

impl PiperSynthesizer {
    pub fn new(
        binary_path: impl AsRef<Path>,
        model_path: impl AsRef<Path>,
        sample_rate: u32,
    ) -> Self {
        Self {
            binary_path: binary_path.as_ref().to_path_buf(),
            model_path: model_path.as_ref().to_path_buf(),
            sample_rate,
            speaker_id: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_speaker(mut self, speaker_id: u32) -> Self {
        self.speaker_id = Some(speaker_id);
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for PiperSynthesizer {
    fn name(&self) -> &str {
        "piper"
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.sample_rate)
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSettings,
    ) -> Result<AudioStream, VoiceError> {
        check_text_len(text)?;
        if !self.model_path.exists() {
            return Err(VoiceError::Tts(format!(
                "Model file not found: {:?}",
                self.model_path
            )));
        }
        if voice.speed < 0.1 || voice.speed > 10.0 {
            return Err(VoiceError::Config(
                "Speed must be between 0.1 and 10.0".to_string(),
            ));
        }

        let mut command = Command::new(&self.binary_path);
        command
            .arg("--model")
            .arg(&self.model_path)
            .arg("--output_raw")
            // Length scale is the inverse of speed.
            .arg("--length_scale")
            .arg((1.0 / voice.speed).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(speaker) = self.speaker_id {
            command.arg("--speaker").arg(speaker.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
        let text_owned = text.to_string();

        // Write from a separate task so a full stdout pipe cannot deadlock us.
        let write_task = tokio::spawn(async move { stdin.write_all(text_owned.as_bytes()).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VoiceError::timeout("piper process", self.timeout))?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for piper: {}", e)))?;

        match write_task.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to piper stdin: {}",
                    e
                )))
            }
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr)));
        }

        Ok(single_buffer(output.stdout))
    }
}

/// `espeak-ng` sample rate.
const ESPEAK_SAMPLE_RATE: u32 = 22_050;

/// The system's native TTS engine (`espeak-ng`), the last local resort.
#[derive(Debug, Clone)]
pub struct SystemSynthesizer {
    binary_path: PathBuf,
    timeout: Duration,
}

impl SystemSynthesizer {
    pub fn new(binary_path: impl AsRef<Path>) -> Self {
        Self {
            binary_path: binary_path.as_ref().to_path_buf(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for SystemSynthesizer {
    fn default() -> Self {
        Self::new("espeak-ng")
    }
}

#[async_trait]
impl SpeechSynthesizer for SystemSynthesizer {
    fn name(&self) -> &str {
        "system"
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::pcm16(ESPEAK_SAMPLE_RATE)
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSettings,
    ) -> Result<AudioStream, VoiceError> {
        check_text_len(text)?;
        let language = voice.language.split(['-', '_']).next().unwrap_or("en");
        // espeak-ng's default rate is 175 words per minute.
        let words_per_minute = (175.0 * voice.speed.clamp(0.5, 3.0)).round() as u32;

        let child = Command::new(&self.binary_path)
            .arg("--stdout")
            .arg("-v")
            .arg(language)
            .arg("-s")
            .arg(words_per_minute.to_string())
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn espeak-ng: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VoiceError::timeout("espeak-ng process", self.timeout))?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for espeak-ng: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("espeak-ng failed: {}", stderr)));
        }

        Ok(single_buffer(strip_wav_header(output.stdout)))
    }
}

/// Returns the PCM payload of a RIFF/WAVE buffer.
///
/// Looks for the `data` chunk; buffers without a RIFF header are returned
/// unchanged.
pub fn strip_wav_header(wav: Vec<u8>) -> Vec<u8> {
    if wav.len() < 12 || &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
        return wav;
    }
    let mut offset = 12;
    while offset + 8 <= wav.len() {
        let id = &wav[offset..offset + 4];
        let size = u32::from_le_bytes([
            wav[offset + 4],
            wav[offset + 5],
            wav[offset + 6],
            wav[offset + 7],
        ]) as usize;
        let body = offset + 8;
        if id == b"data" {
            // Streaming writers leave the size at 0 or 0xffffffff.
            let end = body.saturating_add(size).min(wav.len());
            let end = if size == 0 { wav.len() } else { end };
            return wav[body..end].to_vec();
        }
        offset = body + size + (size & 1);
    }
    Vec::new()
}
