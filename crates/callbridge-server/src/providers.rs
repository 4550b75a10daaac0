//! Builds the provider clients from configuration, once, at startup.

use crate::config::{Config, ConfigError, ConversationMode};
use crate::turn::VoicePipeline;
use callbridge_types::AudioFormat;
use callbridge_voice::{
    CarrierFallbackSpeaker, DriverTimeouts, ElevenLabsSynthesizer, OpenAiChatGenerator,
    PiperSynthesizer, RecognitionConfig, ScriptedGenerator, SpeechSynthesizer, SynthesisDriver,
    SystemSynthesizer, TextGenerator, Transcoder, TranscriptionDriver, TwilioSayFallback,
    VadConfig, VoiceSettings, WhisperRecognizer,
};
use std::sync::Arc;
use std::time::Duration;

/// Recognition input format for a configured sample rate. The carrier rate
/// keeps µ-law untouched; any other rate means PCM16.
pub fn recognition_format(sample_rate: u32) -> AudioFormat {
    if sample_rate == AudioFormat::carrier().sample_rate {
        AudioFormat::carrier()
    } else {
        AudioFormat::pcm16(sample_rate)
    }
}

/// Recognition handshake for the configured language and format.
pub fn recognition_config(config: &Config) -> RecognitionConfig {
    let format = recognition_format(config.recognition.sample_rate);
    RecognitionConfig {
        encoding: format.encoding,
        sample_rate: format.sample_rate,
        language: config.conversation.language.clone(),
        interim_results: config.recognition.interim_results,
        single_utterance: true,
    }
}

pub fn driver_timeouts(config: &Config) -> DriverTimeouts {
    DriverTimeouts {
        open: Duration::from_secs(config.recognition.open_timeout_secs),
        result: Duration::from_secs(config.recognition.result_timeout_secs),
    }
}

pub fn voice_settings(config: &Config) -> VoiceSettings {
    VoiceSettings {
        language: config.conversation.language.clone(),
        speed: config.synthesis.speed,
    }
}

/// Constructs every provider named in `config`.
///
/// Expects a validated config.
pub fn build_pipeline(config: &Config) -> Result<VoicePipeline, ConfigError> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| ConfigError::Invalid {
            key: "http client",
            reason: e.to_string(),
        })?;

    let whisper = &config.recognition.whisper;
    let recognizer = WhisperRecognizer::new(&whisper.model, &whisper.binary)
        .with_vad(VadConfig {
            threshold: whisper.vad_threshold,
            min_silence_ms: whisper.min_silence_ms,
            max_utterance_ms: whisper.max_utterance_secs.saturating_mul(1_000),
            ..VadConfig::default()
        })
        .with_timeout(Duration::from_secs(whisper.timeout_secs));

    let mut synthesizers: Vec<Arc<dyn SpeechSynthesizer>> = Vec::new();
    for name in &config.synthesis.providers {
        let synthesizer: Arc<dyn SpeechSynthesizer> = match name.as_str() {
            "elevenlabs" => {
                let el = &config.synthesis.elevenlabs;
                Arc::new(ElevenLabsSynthesizer::new(
                    client.clone(),
                    &el.base_url,
                    &el.api_key,
                    &el.voice_id,
                    &el.model_id,
                ))
            }
            "piper" => {
                let piper = &config.synthesis.piper;
                let mut synthesizer =
                    PiperSynthesizer::new(&piper.binary, &piper.model, piper.sample_rate);
                if let Some(speaker) = piper.speaker {
                    synthesizer = synthesizer.with_speaker(speaker);
                }
                Arc::new(synthesizer)
            }
            "system" => Arc::new(SystemSynthesizer::new(&config.synthesis.espeak_binary)),
            other => {
                return Err(ConfigError::Invalid {
                    key: "synthesis.providers",
                    reason: format!("unknown provider `{}`", other),
                })
            }
        };
        synthesizers.push(synthesizer);
    }

    let generator: Arc<dyn TextGenerator> = match config.generation.provider.as_str() {
        "openai" => {
            let openai = &config.generation.openai;
            Arc::new(
                OpenAiChatGenerator::new(
                    client.clone(),
                    &openai.base_url,
                    &openai.api_key,
                    &openai.model,
                    &openai.system_prompt,
                )
                .with_timeout(Duration::from_secs(config.generation.timeout_secs)),
            )
        }
        _ => Arc::new(ScriptedGenerator::hebrew()),
    };

    let mut fallback = TwilioSayFallback::new(
        client,
        &config.carrier.api_base,
        &config.carrier.account_sid,
        &config.carrier.auth_token,
        &config.conversation.language,
    );
    if config.conversation.mode == ConversationMode::Continuous {
        fallback = fallback.with_reconnect(config.server.stream_url());
    }
    let fallback: Arc<dyn CarrierFallbackSpeaker> = Arc::new(fallback);

    Ok(VoicePipeline {
        transcoder: Transcoder::new(
            AudioFormat::carrier(),
            recognition_format(config.recognition.sample_rate),
        ),
        transcription: TranscriptionDriver::new(
            Arc::new(recognizer),
            recognition_config(config),
            driver_timeouts(config),
        ),
        synthesis: SynthesisDriver::new(
            synthesizers,
            voice_settings(config),
            Duration::from_secs(config.synthesis.timeout_secs),
        ),
        generator,
        fallback,
    })
}
