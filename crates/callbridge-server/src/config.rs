//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Carrier account and media stream handling.
    #[serde(default)]
    pub carrier: CarrierConfig,

    #[serde(default)]
    pub recognition: RecognitionSettings,

    #[serde(default)]
    pub synthesis: SynthesisSettings,

    #[serde(default)]
    pub generation: GenerationSettings,

    /// Turn-taking behavior.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Fixed phrases spoken by the bridge itself.
    #[serde(default)]
    pub prompts: PromptConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL the carrier reaches us on, e.g. `https://bot.example.com`.
    #[serde(default)]
    pub public_url: String,
}

impl ServerConfig {
    /// WebSocket URL of the media stream endpoint.
    pub fn stream_url(&self) -> String {
        let base = self.public_url.trim_end_matches('/');
        let host = base
            .strip_prefix("https://")
            .or_else(|| base.strip_prefix("http://"))
            .or_else(|| base.strip_prefix("wss://"))
            .or_else(|| base.strip_prefix("ws://"))
            .unwrap_or(base);
        format!("wss://{}/stream", host)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "callbridge_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Clone, Deserialize)]
pub struct CarrierConfig {
    #[serde(default)]
    pub account_sid: String,

    #[serde(default)]
    pub auth_token: String,

    /// Base URL of the carrier REST API.
    #[serde(default = "default_carrier_api_base")]
    pub api_base: String,

    /// Spoken by the carrier before the media stream connects. Empty
    /// disables it.
    #[serde(default = "default_greeting")]
    pub greeting: String,

    /// Malformed frames tolerated within `parse_error_window_ms`.
    #[serde(default = "default_parse_error_threshold")]
    pub parse_error_threshold: u32,

    #[serde(default = "default_parse_error_window_ms")]
    pub parse_error_window_ms: u64,
}

impl fmt::Debug for CarrierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarrierConfig")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &redact(&self.auth_token))
            .field("api_base", &self.api_base)
            .field("greeting", &self.greeting)
            .field("parse_error_threshold", &self.parse_error_threshold)
            .field("parse_error_window_ms", &self.parse_error_window_ms)
            .finish()
    }
}

/// Speech recognition settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionSettings {
    /// Sample rate of the PCM16 handed to the recognizer. 8000 keeps µ-law.
    #[serde(default = "default_recognition_rate")]
    pub sample_rate: u32,

    #[serde(default)]
    pub interim_results: bool,

    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    #[serde(default = "default_result_timeout_secs")]
    pub result_timeout_secs: u64,

    /// Wait before the single retry of a failed recognition stream.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub whisper: WhisperConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperConfig {
    #[serde(default = "default_whisper_binary")]
    pub binary: String,

    #[serde(default)]
    pub model: String,

    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,

    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u32,

    #[serde(default = "default_max_utterance_secs")]
    pub max_utterance_secs: u32,

    #[serde(default = "default_whisper_timeout_secs")]
    pub timeout_secs: u64,
}

/// Speech synthesis settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisSettings {
    /// Providers in preference order: `elevenlabs`, `piper`, `system`.
    #[serde(default = "default_synthesis_providers")]
    pub providers: Vec<String>,

    /// Time a provider has to produce its first audio chunk.
    #[serde(default = "default_synthesis_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_speed")]
    pub speed: f32,

    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,

    #[serde(default)]
    pub piper: PiperConfig,

    #[serde(default = "default_espeak_binary")]
    pub espeak_binary: String,
}

#[derive(Clone, Deserialize)]
pub struct ElevenLabsConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub voice_id: String,

    #[serde(default = "default_elevenlabs_model")]
    pub model_id: String,

    #[serde(default = "default_elevenlabs_base_url")]
    pub base_url: String,
}

impl fmt::Debug for ElevenLabsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsConfig")
            .field("api_key", &redact(&self.api_key))
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PiperConfig {
    #[serde(default = "default_piper_binary")]
    pub binary: String,

    #[serde(default)]
    pub model: String,

    #[serde(default = "default_piper_rate")]
    pub sample_rate: u32,

    #[serde(default)]
    pub speaker: Option<u32>,
}

/// Reply text generation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSettings {
    /// `scripted` or `openai`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,

    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub openai: OpenAiConfig,
}

#[derive(Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default = "default_openai_model")]
    pub model: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// What happens after a reply has been spoken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Go back to listening for the next turn.
    #[default]
    Continuous,
    /// Hang up the media stream after the first reply.
    SingleTurn,
}

/// What happens to caller audio that arrives while the bot is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInPolicy {
    #[default]
    Discard,
    /// Keep the most recent frames and replay them into the next turn.
    Buffer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Locale of the call, e.g. `he-IL`.
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default)]
    pub mode: ConversationMode,

    #[serde(default)]
    pub barge_in: BargeInPolicy,

    #[serde(default = "default_barge_in_buffer_frames")]
    pub barge_in_buffer_frames: usize,

    /// Completed turns remembered for generation; oldest are dropped.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_didnt_catch_prompt")]
    pub didnt_catch: String,

    #[serde(default = "default_apology_prompt")]
    pub apology: String,

    #[serde(default = "default_generation_fallback_prompt")]
    pub generation_fallback: String,
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "[REDACTED]"
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_carrier_api_base() -> String {
    "https://api.twilio.com".to_string()
}

fn default_greeting() -> String {
    "שלום, אני מחבר אותך.".to_string()
}

fn default_parse_error_threshold() -> u32 {
    20
}

fn default_parse_error_window_ms() -> u64 {
    1_000
}

fn default_recognition_rate() -> u32 {
    16_000
}

fn default_open_timeout_secs() -> u64 {
    10
}

fn default_result_timeout_secs() -> u64 {
    30
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_whisper_binary() -> String {
    "whisper-cli".to_string()
}

fn default_vad_threshold() -> f32 {
    0.02
}

fn default_min_silence_ms() -> u32 {
    700
}

fn default_max_utterance_secs() -> u32 {
    15
}

fn default_whisper_timeout_secs() -> u64 {
    30
}

fn default_synthesis_providers() -> Vec<String> {
    vec![
        "elevenlabs".to_string(),
        "piper".to_string(),
        "system".to_string(),
    ]
}

fn default_synthesis_timeout_secs() -> u64 {
    8
}

fn default_speed() -> f32 {
    1.0
}

fn default_espeak_binary() -> String {
    "espeak-ng".to_string()
}

fn default_elevenlabs_model() -> String {
    "eleven_multilingual_v2".to_string()
}

fn default_elevenlabs_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_piper_binary() -> String {
    "piper".to_string()
}

fn default_piper_rate() -> u32 {
    22_050
}

fn default_generation_provider() -> String {
    "scripted".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    15
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly phone assistant. Answer in one or two short spoken sentences, \
     in the caller's language."
        .to_string()
}

fn default_language() -> String {
    "he-IL".to_string()
}

fn default_barge_in_buffer_frames() -> usize {
    50
}

fn default_max_history() -> usize {
    20
}

fn default_didnt_catch_prompt() -> String {
    "סליחה, לא שמעתי. אפשר לחזור על זה?".to_string()
}

fn default_apology_prompt() -> String {
    "סליחה, משהו השתבש. בוא ננסה שוב.".to_string()
}

fn default_generation_fallback_prompt() -> String {
    "לא כל כך הבנתי. אפשר לנסות שוב בבקשה?".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            api_base: default_carrier_api_base(),
            greeting: default_greeting(),
            parse_error_threshold: default_parse_error_threshold(),
            parse_error_window_ms: default_parse_error_window_ms(),
        }
    }
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_recognition_rate(),
            interim_results: false,
            open_timeout_secs: default_open_timeout_secs(),
            result_timeout_secs: default_result_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            whisper: WhisperConfig::default(),
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            binary: default_whisper_binary(),
            model: String::new(),
            vad_threshold: default_vad_threshold(),
            min_silence_ms: default_min_silence_ms(),
            max_utterance_secs: default_max_utterance_secs(),
            timeout_secs: default_whisper_timeout_secs(),
        }
    }
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            providers: default_synthesis_providers(),
            timeout_secs: default_synthesis_timeout_secs(),
            speed: default_speed(),
            elevenlabs: ElevenLabsConfig::default(),
            piper: PiperConfig::default(),
            espeak_binary: default_espeak_binary(),
        }
    }
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice_id: String::new(),
            model_id: default_elevenlabs_model(),
            base_url: default_elevenlabs_base_url(),
        }
    }
}

impl Default for PiperConfig {
    fn default() -> Self {
        Self {
            binary: default_piper_binary(),
            model: String::new(),
            sample_rate: default_piper_rate(),
            speaker: None,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            timeout_secs: default_generation_timeout_secs(),
            openai: OpenAiConfig::default(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            mode: ConversationMode::default(),
            barge_in: BargeInPolicy::default(),
            barge_in_buffer_frames: default_barge_in_buffer_frames(),
            max_history: default_max_history(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            didnt_catch: default_didnt_catch_prompt(),
            apology: default_apology_prompt(),
            generation_fallback: default_generation_fallback_prompt(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required setting has no value.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A setting has a value the server cannot use.
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

const KNOWN_SYNTHESIZERS: [&str; 3] = ["elevenlabs", "piper", "system"];

impl Config {
    /// Checks that every setting the configured providers need is present.
    ///
    /// Reports the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.public_url.trim().is_empty() {
            return Err(ConfigError::Missing("server.public_url"));
        }
        if self.carrier.account_sid.is_empty() {
            return Err(ConfigError::Missing("carrier.account_sid"));
        }
        if self.carrier.auth_token.is_empty() {
            return Err(ConfigError::Missing("carrier.auth_token"));
        }
        if self.conversation.language.trim().is_empty() {
            return Err(ConfigError::Missing("conversation.language"));
        }
        if self.recognition.whisper.model.is_empty() {
            return Err(ConfigError::Missing("recognition.whisper.model"));
        }
        if self.recognition.sample_rate == 0 {
            return Err(invalid("recognition.sample_rate", "must be non-zero"));
        }
        if self.recognition.open_timeout_secs == 0 || self.recognition.result_timeout_secs == 0 {
            return Err(invalid("recognition", "timeouts must be non-zero"));
        }

        if self.synthesis.providers.is_empty() {
            return Err(ConfigError::Missing("synthesis.providers"));
        }
        for provider in &self.synthesis.providers {
            if !KNOWN_SYNTHESIZERS.contains(&provider.as_str()) {
                return Err(invalid(
                    "synthesis.providers",
                    format!("unknown provider `{}`", provider),
                ));
            }
        }
        if self.synthesis.timeout_secs == 0 {
            return Err(invalid("synthesis.timeout_secs", "must be non-zero"));
        }
        if !(0.1..=10.0).contains(&self.synthesis.speed) {
            return Err(invalid("synthesis.speed", "must be between 0.1 and 10.0"));
        }
        if self.uses_synthesizer("elevenlabs") {
            if self.synthesis.elevenlabs.api_key.is_empty() {
                return Err(ConfigError::Missing("synthesis.elevenlabs.api_key"));
            }
            if self.synthesis.elevenlabs.voice_id.is_empty() {
                return Err(ConfigError::Missing("synthesis.elevenlabs.voice_id"));
            }
        }
        if self.uses_synthesizer("piper") && self.synthesis.piper.model.is_empty() {
            return Err(ConfigError::Missing("synthesis.piper.model"));
        }

        match self.generation.provider.as_str() {
            "scripted" => {}
            "openai" => {
                if self.generation.openai.api_key.is_empty() {
                    return Err(ConfigError::Missing("generation.openai.api_key"));
                }
            }
            other => {
                return Err(invalid(
                    "generation.provider",
                    format!("unknown provider `{}`", other),
                ))
            }
        }
        if self.generation.timeout_secs == 0 {
            return Err(invalid("generation.timeout_secs", "must be non-zero"));
        }

        if self.conversation.barge_in == BargeInPolicy::Buffer
            && self.conversation.barge_in_buffer_frames == 0
        {
            return Err(invalid(
                "conversation.barge_in_buffer_frames",
                "must be non-zero when barge_in = \"buffer\"",
            ));
        }
        if self.carrier.parse_error_window_ms == 0 {
            return Err(invalid("carrier.parse_error_window_ms", "must be non-zero"));
        }

        Ok(())
    }

    pub fn uses_synthesizer(&self, name: &str) -> bool {
        self.synthesis.providers.iter().any(|p| p == name)
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CALLBRIDGE_HOST` overrides `server.host`
/// - `PORT` or `CALLBRIDGE_PORT` overrides `server.port` (the latter wins)
/// - `CALLBRIDGE_PUBLIC_URL` overrides `server.public_url`
/// - `CALLBRIDGE_LANGUAGE` overrides `conversation.language`
/// - `CALLBRIDGE_LOG_LEVEL` overrides `logging.level`
/// - `CALLBRIDGE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `TWILIO_ACCOUNT_SID`, `TWILIO_AUTH_TOKEN` override the carrier credentials
/// - `ELEVENLABS_API_KEY`, `ELEVENLABS_VOICE_ID` override `synthesis.elevenlabs`
/// - `CALLBRIDGE_WHISPER_BINARY`, `CALLBRIDGE_WHISPER_MODEL` override
///   `recognition.whisper`
/// - `OPENAI_API_KEY` overrides `generation.openai.api_key`
///
/// The result is not validated; call [`Config::validate`] before use.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies environment overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("CALLBRIDGE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    for key in ["PORT", "CALLBRIDGE_PORT"] {
        if let Some(port) = lookup(key) {
            if let Ok(parsed) = port.parse() {
                config.server.port = parsed;
            }
        }
    }
    if let Some(url) = lookup("CALLBRIDGE_PUBLIC_URL") {
        config.server.public_url = url;
    }
    if let Some(language) = lookup("CALLBRIDGE_LANGUAGE") {
        config.conversation.language = language;
    }
    if let Some(level) = lookup("CALLBRIDGE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("CALLBRIDGE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(sid) = lookup("TWILIO_ACCOUNT_SID") {
        config.carrier.account_sid = sid;
    }
    if let Some(token) = lookup("TWILIO_AUTH_TOKEN") {
        config.carrier.auth_token = token;
    }
    if let Some(key) = lookup("ELEVENLABS_API_KEY") {
        config.synthesis.elevenlabs.api_key = key;
    }
    if let Some(voice) = lookup("ELEVENLABS_VOICE_ID") {
        config.synthesis.elevenlabs.voice_id = voice;
    }
    if let Some(binary) = lookup("CALLBRIDGE_WHISPER_BINARY") {
        config.recognition.whisper.binary = binary;
    }
    if let Some(model) = lookup("CALLBRIDGE_WHISPER_MODEL") {
        config.recognition.whisper.model = model;
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.generation.openai.api_key = key;
    }
}
