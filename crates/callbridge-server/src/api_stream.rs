//! Media stream WebSocket handler.
//!
//! The reader loop below owns the socket's receiving half. Audio goes to the
//! call's turn controller over a bounded channel; everything the controller
//! sends back is written by a dedicated sender task.

use crate::codec::{self, ControlEvent, ErrorBudget, Inbound};
use crate::turn::TurnController;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use callbridge_types::{AudioFormat, AudioFrame, CloseReason, SessionEvent};
use callbridge_voice::CarrierCall;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Outbound messages buffered per connection. The controller waits when the
/// carrier reads slower than we synthesize.
const OUTBOUND_CAPACITY: usize = 256;

/// Caller audio frames buffered between the reader and the controller
/// (about five seconds at 20 ms per frame). Frames beyond it are dropped so
/// the reader never stalls behind a busy controller.
const INBOUND_CAPACITY: usize = 256;

/// Time given to the sender task to flush queued messages at teardown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Handler for `GET /stream`.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The connection's view of its call.
struct LiveSession {
    call_id: String,
    session_id: Uuid,
    audio_tx: mpsc::Sender<AudioFrame>,
    controller: JoinHandle<CloseReason>,
    next_sequence: u64,
    dropped_frames: u64,
}

fn call_id_of(session: &Option<LiveSession>) -> &str {
    session.as_ref().map(|s| s.call_id.as_str()).unwrap_or("-")
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let carrier = &state.config.carrier;
    let mut parse_errors = ErrorBudget::new(
        carrier.parse_error_threshold,
        Duration::from_millis(carrier.parse_error_window_ms),
    );
    let mut session: Option<LiveSession> = None;

    let reason = loop {
        tokio::select! {
            message = receiver.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break CloseReason::Disconnected,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(call_id = call_id_of(&session), "media stream socket error: {}", e);
                        break CloseReason::Disconnected;
                    }
                };

                match codec::decode(text.as_str()) {
                    Ok(Inbound::Audio(chunk)) => match session.as_mut() {
                        Some(live) => {
                            let frame =
                                AudioFrame::new(chunk.data, AudioFormat::carrier(), live.next_sequence);
                            live.next_sequence += 1;
                            match live.audio_tx.try_send(frame) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    live.dropped_frames += 1;
                                    if live.dropped_frames == 1 {
                                        tracing::warn!(
                                            call_id = %live.call_id,
                                            "controller is behind, dropping caller audio"
                                        );
                                    }
                                }
                                // The controller has exited; the other branch
                                // picks that up.
                                Err(mpsc::error::TrySendError::Closed(_)) => {}
                            }
                        }
                        None => tracing::debug!("media before start, dropping"),
                    },
                    Ok(Inbound::Control(ControlEvent::Start { stream_id, call_sid })) => {
                        if let Some(live) = &session {
                            tracing::warn!(
                                call_id = %live.call_id,
                                repeated = %stream_id,
                                "ignoring repeated start on a live stream"
                            );
                            continue;
                        }
                        match start_session(&state, stream_id, call_sid, tx.clone()).await {
                            Some(live) => session = Some(live),
                            None => break CloseReason::Failed,
                        }
                    }
                    Ok(Inbound::Control(ControlEvent::Stop)) => break CloseReason::Stopped,
                    Ok(Inbound::Control(ControlEvent::Mark { name })) => {
                        tracing::debug!(call_id = call_id_of(&session), mark = %name, "carrier reached mark");
                    }
                    Ok(Inbound::Control(ControlEvent::Connected)) => {
                        tracing::debug!("media stream connected");
                    }
                    Ok(Inbound::Control(ControlEvent::Dtmf { digit })) => {
                        tracing::debug!(call_id = call_id_of(&session), %digit, "ignoring DTMF");
                    }
                    Err(e) => {
                        tracing::warn!(call_id = call_id_of(&session), "dropping malformed frame: {}", e);
                        if parse_errors.record(Instant::now()) {
                            tracing::error!(
                                call_id = call_id_of(&session),
                                threshold = carrier.parse_error_threshold,
                                window_ms = carrier.parse_error_window_ms,
                                "too many malformed frames, closing stream"
                            );
                            break CloseReason::CorruptStream;
                        }
                    }
                }
            }
            reason = controller_exit(&mut session) => break reason,
        }
    };

    if let Some(live) = session {
        live.controller.abort();
        state.registry.remove(&live.call_id, live.session_id).await;
        tracing::info!(
            call_id = %live.call_id,
            session_id = %live.session_id,
            reason = reason.as_str(),
            dropped_frames = live.dropped_frames,
            "call session closed"
        );
        let _ = state.events_tx.send(SessionEvent::SessionClosed {
            call_id: live.call_id,
            reason,
        });
    }

    drop(tx);
    match reason {
        // The carrier is gone; nothing queued may be sent after its stop.
        CloseReason::Stopped | CloseReason::Disconnected => send_task.abort(),
        // Queued frames and the final mark still go out before the close frame.
        _ => {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task)
                .await
                .is_err()
            {
                send_task.abort();
            }
        }
    }
}

/// Spawns the turn controller for a new call and registers it.
///
/// Returns `None` if the call id already has a live session.
async fn start_session(
    state: &Arc<AppState>,
    stream_id: String,
    call_sid: Option<String>,
    outbound: mpsc::Sender<String>,
) -> Option<LiveSession> {
    let (audio_tx, audio_rx) = mpsc::channel(INBOUND_CAPACITY);
    let call = CarrierCall {
        stream_id: stream_id.clone(),
        call_sid: call_sid.clone(),
    };
    let controller = TurnController::new(
        call,
        state.pipeline.clone(),
        state.settings.clone(),
        audio_rx,
        outbound,
        state.events_tx.clone(),
    );
    let handle = tokio::spawn(controller.run());

    match state.registry.register(&stream_id, handle.abort_handle()).await {
        Ok(session_id) => {
            tracing::info!(
                call_id = %stream_id,
                session_id = %session_id,
                call_sid = call_sid.as_deref().unwrap_or("-"),
                "call session started"
            );
            Some(LiveSession {
                call_id: stream_id,
                session_id,
                audio_tx,
                controller: handle,
                next_sequence: 0,
                dropped_frames: 0,
            })
        }
        Err(e) => {
            handle.abort();
            tracing::warn!("rejecting media stream: {}", e);
            None
        }
    }
}

/// Resolves when the call's controller exits on its own.
async fn controller_exit(session: &mut Option<LiveSession>) -> CloseReason {
    match session {
        Some(live) => match (&mut live.controller).await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::error!(call_id = %live.call_id, "turn controller task failed: {}", e);
                CloseReason::Failed
            }
        },
        None => std::future::pending().await,
    }
}
