//! Text generation: turning a caller utterance into the bot's reply text.

use crate::error::VoiceError;
use async_trait::async_trait;
use callbridge_types::{TurnRecord, Utterance};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Produces the reply text for one turn.
#[async_trait]
pub trait TextGenerator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// `history` holds earlier turns of this call, oldest first.
    async fn reply(&self, history: &[TurnRecord], utterance: &Utterance)
        -> Result<String, VoiceError>;
}

/// A keyword rule: if any keyword occurs in the utterance, answer with `reply`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptRule {
    pub keywords: Vec<String>,
    pub reply: String,
}

/// Rule-based generator. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct ScriptedGenerator {
    rules: Vec<ScriptRule>,
    default_reply: String,
}

impl ScriptedGenerator {
    pub fn new(rules: Vec<ScriptRule>, default_reply: impl Into<String>) -> Self {
        Self {
            rules,
            default_reply: default_reply.into(),
        }
    }

    /// The stock Hebrew script: greeting, name, and a "didn't understand" reply.
    pub fn hebrew() -> Self {
        Self::new(
            vec![
                ScriptRule {
                    keywords: vec!["שלום".to_string(), "היי".to_string()],
                    reply: "שלום גם לך! אני בוט שיחה. איך אני יכול לעזור?".to_string(),
                },
                ScriptRule {
                    keywords: vec!["שם".to_string()],
                    reply: "השם שלי הוא בוט, ואני שמח לדבר איתך.".to_string(),
                },
            ],
            "לא כל כך הבנתי. אפשר לנסות שוב בבקשה?",
        )
    }

    fn answer(&self, text: &str) -> &str {
        let text = text.trim().to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|keyword| text.contains(&keyword.to_lowercase()))
            })
            .map(|rule| rule.reply.as_str())
            .unwrap_or(&self.default_reply)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn reply(
        &self,
        _history: &[TurnRecord],
        utterance: &Utterance,
    ) -> Result<String, VoiceError> {
        Ok(self.answer(&utterance.text).to_string())
    }
}

/// Generator backed by an OpenAI-compatible `/v1/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiChatGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    timeout: Duration,
}

impl fmt::Debug for OpenAiChatGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiChatGenerator")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiChatGenerator {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn messages(&self, history: &[TurnRecord], utterance: &Utterance) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(serde_json::json!({ "role": "system", "content": self.system_prompt }));
        for record in history {
            messages.push(serde_json::json!({ "role": "user", "content": record.utterance }));
            messages.push(serde_json::json!({ "role": "assistant", "content": record.reply }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": utterance.text }));
        messages
    }
}

#[async_trait]
impl TextGenerator for OpenAiChatGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn reply(
        &self,
        history: &[TurnRecord],
        utterance: &Utterance,
    ) -> Result<String, VoiceError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": self.messages(history, utterance),
            }))
            .send()
            .await
            .map_err(|e| VoiceError::Generation(format!("chat request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!(
                "chat endpoint returned {}: {}",
                status, body
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Generation(format!("invalid chat response: {}", e)))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| VoiceError::Generation("chat response had no content".to_string()))?;

        debug!(model = %self.model, chars = text.chars().count(), "chat reply received");
        Ok(text)
    }
}
