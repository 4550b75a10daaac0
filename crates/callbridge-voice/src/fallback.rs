//! Last-resort speech through the carrier's own text-to-speech.

use crate::error::VoiceError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Identifies the live call a fallback utterance is spoken on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierCall {
    /// Media stream id (`streamSid`).
    pub stream_id: String,
    /// Carrier call id (`callSid`), when the stream's `start` carried one.
    pub call_sid: Option<String>,
}

/// Speaks text on a call without going through the media stream.
#[async_trait]
pub trait CarrierFallbackSpeaker: Send + Sync + fmt::Debug {
    async fn speak(&self, call: &CarrierCall, text: &str) -> Result<(), VoiceError>;
}

/// Updates the live Twilio call with `<Say>` markup.
#[derive(Clone)]
pub struct TwilioSayFallback {
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    language: String,
    reconnect_url: Option<String>,
    timeout: Duration,
}

impl fmt::Debug for TwilioSayFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioSayFallback")
            .field("api_base", &self.api_base)
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("language", &self.language)
            .field("reconnect_url", &self.reconnect_url)
            .finish()
    }
}

impl TwilioSayFallback {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            language: language.into(),
            reconnect_url: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// After speaking, reconnect the call to this media stream URL.
    pub fn with_reconnect(mut self, stream_url: impl Into<String>) -> Self {
        self.reconnect_url = Some(stream_url.into());
        self
    }

    /// Markup replacing the call's current instructions.
    pub fn twiml(&self, text: &str) -> String {
        let mut twiml = format!(
            "<Response><Say language=\"{}\">{}</Say>",
            xml_escape(&self.language),
            xml_escape(text)
        );
        if let Some(url) = &self.reconnect_url {
            twiml.push_str(&format!(
                "<Connect><Stream url=\"{}\"/></Connect><Pause length=\"60\"/>",
                xml_escape(url)
            ));
        }
        twiml.push_str("</Response>");
        twiml
    }
}

#[async_trait]
impl CarrierFallbackSpeaker for TwilioSayFallback {
    async fn speak(&self, call: &CarrierCall, text: &str) -> Result<(), VoiceError> {
        let call_sid = call.call_sid.as_deref().ok_or_else(|| {
            VoiceError::Carrier(format!("stream {} has no call sid", call.stream_id))
        })?;
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.api_base.trim_end_matches('/'),
            self.account_sid,
            call_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .timeout(self.timeout)
            .form(&[("Twiml", self.twiml(text))])
            .send()
            .await
            .map_err(|e| VoiceError::Carrier(format!("call update failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Carrier(format!(
                "call update returned {}: {}",
                status, body
            )));
        }

        info!(call_id = %call.stream_id, call_sid, "reply spoken by carrier fallback");
        Ok(())
    }
}

pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
