//! Carrier voice webhook: tells the carrier to open the media stream.

use crate::AppState;
use axum::{extract::Extension, http::header, response::IntoResponse};
use callbridge_voice::fallback::xml_escape;
use std::sync::Arc;

/// Call instructions: optional greeting, media stream, then a pause that
/// keeps the call up while the stream runs.
pub fn connect_twiml(stream_url: &str, language: &str, greeting: &str) -> String {
    let mut twiml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>");
    if !greeting.trim().is_empty() {
        twiml.push_str(&format!(
            "<Say language=\"{}\">{}</Say>",
            xml_escape(language),
            xml_escape(greeting)
        ));
    }
    twiml.push_str(&format!(
        "<Connect><Stream url=\"{}\"/></Connect><Pause length=\"60\"/></Response>",
        xml_escape(stream_url)
    ));
    twiml
}

/// Handler for `POST /voice`.
pub async fn voice_webhook_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let stream_url = state.config.server.stream_url();
    tracing::info!(stream_url = %stream_url, "incoming call, connecting media stream");
    (
        [(header::CONTENT_TYPE, "application/xml")],
        connect_twiml(
            &stream_url,
            &state.config.conversation.language,
            &state.config.carrier.greeting,
        ),
    )
}
