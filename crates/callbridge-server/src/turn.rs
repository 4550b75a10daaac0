//! Per-call turn-taking: listen, think, speak, repeat.
//!
//! One [`TurnController`] runs per call in its own task and exclusively owns
//! the [`CallSession`]. Caller audio arrives in order on a bounded channel;
//! everything sent back to the carrier goes through the connection's
//! outbound channel, so the frames of one reply always precede the next
//! reply.

use crate::codec::{self, END_OF_SPEECH_MARK};
use crate::config::{BargeInPolicy, Config, ConversationMode, PromptConfig};
use callbridge_types::{
    AudioFrame, CallState, CloseReason, ReplyOutcome, SessionEvent, TurnRecord, Utterance,
};
use callbridge_voice::{
    CarrierCall, CarrierFallbackSpeaker, FrameAssembler, SynthesisDriver, TextGenerator,
    Transcoder, TranscriptionDriver, TranscriptionHandle, VoiceError,
};
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Consecutive recognition failures before the caller is asked to repeat.
const RECOGNITION_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("carrier connection closed")]
    Disconnected,

    #[error(transparent)]
    Voice(#[from] VoiceError),
}

/// The providers a call talks to. Built once at startup and shared.
#[derive(Debug, Clone)]
pub struct VoicePipeline {
    pub transcoder: Transcoder,
    pub transcription: TranscriptionDriver,
    pub synthesis: SynthesisDriver,
    pub generator: Arc<dyn TextGenerator>,
    pub fallback: Arc<dyn CarrierFallbackSpeaker>,
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub mode: ConversationMode,
    pub barge_in: BargeInPolicy,
    pub barge_in_buffer_frames: usize,
    pub max_history: usize,
    pub retry_backoff: Duration,
    pub generation_timeout: Duration,
    pub prompts: PromptConfig,
}

impl TurnSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.conversation.mode,
            barge_in: config.conversation.barge_in,
            barge_in_buffer_frames: config.conversation.barge_in_buffer_frames,
            max_history: config.conversation.max_history,
            retry_backoff: Duration::from_millis(config.recognition.retry_backoff_ms),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
            prompts: config.prompts.clone(),
        }
    }
}

/// State of one call.
#[derive(Debug)]
pub struct CallSession {
    pub call: CarrierCall,
    pub state: CallState,
    /// Interim fragments of the current turn.
    pub interim: Vec<String>,
    pub turn: u32,
    /// Completed turns, oldest first.
    pub history: Vec<TurnRecord>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl CallSession {
    pub fn new(call: CarrierCall) -> Self {
        let now = Utc::now();
        Self {
            call,
            state: CallState::Listening,
            interim: Vec::new(),
            turn: 0,
            history: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call.stream_id
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    fn remember(&mut self, record: TurnRecord, max_history: usize) {
        self.history.push(record);
        if self.history.len() > max_history {
            let excess = self.history.len() - max_history;
            self.history.drain(..excess);
        }
    }
}

/// Caller audio that arrives while the bot is thinking or speaking.
#[derive(Debug)]
struct BargeIn {
    policy: BargeInPolicy,
    capacity: usize,
    frames: VecDeque<AudioFrame>,
    dropped: u64,
}

impl BargeIn {
    fn new(policy: BargeInPolicy, capacity: usize) -> Self {
        Self {
            policy,
            capacity,
            frames: VecDeque::new(),
            dropped: 0,
        }
    }

    fn hold(&mut self, frame: AudioFrame) {
        match self.policy {
            BargeInPolicy::Discard => self.dropped += 1,
            BargeInPolicy::Buffer => {
                self.frames.push_back(frame);
                if self.frames.len() > self.capacity {
                    self.frames.pop_front();
                    self.dropped += 1;
                }
            }
        }
    }

    /// Buffered frames in arrival order, plus the number dropped since the
    /// last call.
    fn take(&mut self) -> (Vec<AudioFrame>, u64) {
        let dropped = std::mem::take(&mut self.dropped);
        (self.frames.drain(..).collect(), dropped)
    }
}

/// Polls `work` to completion while draining caller audio into `barge_in`.
///
/// Returns `None` if the caller's audio channel closed first.
async fn while_busy<F: Future>(
    inbound: &mut mpsc::Receiver<AudioFrame>,
    barge_in: &mut BargeIn,
    work: F,
) -> Option<F::Output> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return Some(output),
            frame = inbound.recv() => match frame {
                Some(frame) => barge_in.hold(frame),
                None => return None,
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Everything a turn needs besides the session and the inbound audio.
struct TurnContext {
    pipeline: VoicePipeline,
    settings: TurnSettings,
    outbound: mpsc::Sender<String>,
    events: broadcast::Sender<SessionEvent>,
}

impl TurnContext {
    fn set_state(&self, session: &mut CallSession, to: CallState) {
        let from = session.state;
        if from == to {
            return;
        }
        session.state = to;
        debug!(call_id = %session.call_id(), turn = session.turn, %from, %to, "state changed");
        let _ = self.events.send(SessionEvent::StateChanged {
            call_id: session.call_id().to_string(),
            from,
            to,
        });
    }

    async fn send(&self, message: String) -> Result<(), TurnError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TurnError::Disconnected)
    }

    async fn forward(
        &self,
        handle: &mut TranscriptionHandle,
        frame: &AudioFrame,
    ) -> Result<(), VoiceError> {
        match self.pipeline.transcoder.to_recognition_format(frame) {
            Some(converted) => handle.push_audio(converted).await,
            None => Ok(()),
        }
    }

    /// Thinking and Speaking for one final utterance.
    async fn respond(
        &self,
        session: &mut CallSession,
        utterance: Utterance,
    ) -> Result<ReplyOutcome, TurnError> {
        self.set_state(session, CallState::Thinking);
        let reply = self.generate(session, &utterance).await;
        let outcome = self.speak(session, &reply).await?;
        let record = TurnRecord {
            turn: session.turn,
            utterance: utterance.text,
            reply,
        };
        session.remember(record, self.settings.max_history);
        Ok(outcome)
    }

    async fn generate(&self, session: &CallSession, utterance: &Utterance) -> String {
        let generator = &self.pipeline.generator;
        let result = tokio::time::timeout(
            self.settings.generation_timeout,
            generator.reply(&session.history, utterance),
        )
        .await
        .unwrap_or_else(|_| {
            Err(VoiceError::timeout(
                "text generation",
                self.settings.generation_timeout,
            ))
        });

        match result {
            Ok(text) if !text.trim().is_empty() => {
                debug!(
                    call_id = %session.call_id(),
                    turn = session.turn,
                    generator = generator.name(),
                    "reply generated"
                );
                text
            }
            Ok(_) => {
                warn!(call_id = %session.call_id(), turn = session.turn, "generator returned an empty reply");
                self.settings.prompts.generation_fallback.clone()
            }
            Err(e) => {
                warn!(
                    call_id = %session.call_id(),
                    turn = session.turn,
                    generator = generator.name(),
                    "text generation failed: {}",
                    e
                );
                self.settings.prompts.generation_fallback.clone()
            }
        }
    }

    /// Synthesizes `text`, streams it to the carrier, then sends the mark.
    async fn speak(&self, session: &mut CallSession, text: &str) -> Result<ReplyOutcome, TurnError> {
        self.set_state(session, CallState::Speaking);
        let call_id = session.call_id().to_string();
        let reply = self.pipeline.synthesis.synthesize(text).await;

        match reply.format {
            Some(format) => {
                let mut assembler =
                    FrameAssembler::new(format, self.pipeline.transcoder.carrier_format())?;
                let mut audio = reply.audio;
                let mut frames = 0usize;
                while let Some(chunk) = audio.next().await {
                    for frame in assembler.push(&chunk) {
                        self.send(codec::encode(&frame.data, &call_id)).await?;
                        frames += 1;
                    }
                }
                for frame in assembler.finish() {
                    self.send(codec::encode(&frame.data, &call_id)).await?;
                    frames += 1;
                }
                info!(
                    call_id = %call_id,
                    turn = session.turn,
                    provider = reply.provider.as_deref().unwrap_or_default(),
                    outcome = %reply.outcome,
                    frames,
                    "reply streamed"
                );
            }
            None => {
                warn!(
                    call_id = %call_id,
                    turn = session.turn,
                    attempts = reply.attempts.len(),
                    "no synthesis provider succeeded; using carrier speech"
                );
                self.pipeline.fallback.speak(&session.call, text).await?;
            }
        }

        self.send(codec::encode_mark(&call_id, END_OF_SPEECH_MARK)).await?;
        Ok(reply.outcome)
    }
}

enum Heard {
    Utterance(Utterance),
    Empty,
    Closed,
}

/// Drives one call from `start` until the caller leaves.
pub struct TurnController {
    ctx: TurnContext,
    session: CallSession,
    inbound: mpsc::Receiver<AudioFrame>,
    barge_in: BargeIn,
}

impl TurnController {
    pub fn new(
        call: CarrierCall,
        pipeline: VoicePipeline,
        settings: TurnSettings,
        inbound: mpsc::Receiver<AudioFrame>,
        outbound: mpsc::Sender<String>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let barge_in = BargeIn::new(settings.barge_in, settings.barge_in_buffer_frames);
        Self {
            ctx: TurnContext {
                pipeline,
                settings,
                outbound,
                events,
            },
            session: CallSession::new(call),
            inbound,
            barge_in,
        }
    }

    /// Runs turns until the caller's audio ends or, in single-turn mode, the
    /// first reply has been sent.
    pub async fn run(mut self) -> CloseReason {
        info!(call_id = %self.session.call_id(), "turn controller started");
        let reason = self.converse().await;
        let elapsed = Utc::now() - self.session.created_at;
        info!(
            call_id = %self.session.call_id(),
            turns = self.session.turn,
            duration_secs = elapsed.num_seconds(),
            reason = reason.as_str(),
            "turn controller finished"
        );
        reason
    }

    async fn converse(&mut self) -> CloseReason {
        loop {
            let Some(utterance) = self.listen().await else {
                return CloseReason::Disconnected;
            };

            self.session.turn += 1;
            let turn = self.session.turn;
            info!(
                call_id = %self.session.call_id(),
                turn,
                chars = utterance.text.chars().count(),
                interim_fragments = self.session.interim.len(),
                "caller finished speaking"
            );

            let work = AssertUnwindSafe(self.ctx.respond(&mut self.session, utterance)).catch_unwind();
            let outcome = match while_busy(&mut self.inbound, &mut self.barge_in, work).await {
                None | Some(Ok(Err(TurnError::Disconnected))) => return CloseReason::Disconnected,
                Some(Ok(Ok(outcome))) => outcome,
                Some(Ok(Err(e))) => {
                    error!(call_id = %self.session.call_id(), turn, "turn failed: {}", e);
                    if !self.apologize().await {
                        return CloseReason::Disconnected;
                    }
                    ReplyOutcome::Failed
                }
                Some(Err(panic)) => {
                    error!(
                        call_id = %self.session.call_id(),
                        turn,
                        panic = panic_message(panic.as_ref()),
                        "turn panicked"
                    );
                    if !self.apologize().await {
                        return CloseReason::Disconnected;
                    }
                    ReplyOutcome::Failed
                }
            };

            let _ = self.ctx.events.send(SessionEvent::TurnCompleted {
                call_id: self.session.call_id().to_string(),
                turn,
                outcome,
            });

            if self.ctx.settings.mode == ConversationMode::SingleTurn {
                return CloseReason::Completed;
            }
        }
    }

    /// Waits for the caller's next final utterance. `None` means the call
    /// ended.
    async fn listen(&mut self) -> Option<Utterance> {
        let mut failures = 0;
        loop {
            self.ctx.set_state(&mut self.session, CallState::Listening);
            match self.recognize().await {
                Ok(Heard::Utterance(utterance)) => return Some(utterance),
                Ok(Heard::Empty) => {
                    debug!(call_id = %self.session.call_id(), "ignoring empty transcript");
                    failures = 0;
                }
                Ok(Heard::Closed) => return None,
                Err(e) => {
                    failures += 1;
                    if failures < RECOGNITION_ATTEMPTS {
                        warn!(
                            call_id = %self.session.call_id(),
                            turn = self.session.turn,
                            backoff_ms = self.ctx.settings.retry_backoff.as_millis() as u64,
                            "recognition failed, retrying: {}",
                            e
                        );
                        tokio::time::sleep(self.ctx.settings.retry_backoff).await;
                    } else {
                        warn!(
                            call_id = %self.session.call_id(),
                            turn = self.session.turn,
                            "recognition failed again, asking caller to repeat: {}",
                            e
                        );
                        failures = 0;
                        let prompt = self.ctx.settings.prompts.didnt_catch.clone();
                        if !self.speak_prompt(&prompt).await {
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Runs one single-utterance transcription stream.
    async fn recognize(&mut self) -> Result<Heard, VoiceError> {
        let call_id = self.session.call_id().to_string();
        let mut handle = self.ctx.pipeline.transcription.start(&call_id).await?;
        self.session.interim.clear();

        let (buffered, dropped) = self.barge_in.take();
        if dropped > 0 || !buffered.is_empty() {
            debug!(
                call_id = %call_id,
                replayed = buffered.len(),
                dropped,
                "caller audio received while speaking"
            );
        }
        for frame in &buffered {
            self.ctx.forward(&mut handle, frame).await?;
        }

        loop {
            tokio::select! {
                frame = self.inbound.recv() => match frame {
                    Some(frame) => {
                        self.session.touch();
                        self.ctx.forward(&mut handle, &frame).await?;
                    }
                    None => {
                        self.ctx.pipeline.transcription.stop(handle);
                        return Ok(Heard::Closed);
                    }
                },
                result = handle.next_utterance() => {
                    self.session.interim = handle.interim_transcript().to_vec();
                    return match result? {
                        Some(utterance) if utterance.text.trim().is_empty() => Ok(Heard::Empty),
                        Some(utterance) => Ok(Heard::Utterance(utterance)),
                        None => Err(VoiceError::Stt(
                            "transcription stream already exhausted".to_string(),
                        )),
                    };
                }
            }
        }
    }

    /// Speaks a fixed prompt. Returns false if the call ended meanwhile.
    async fn speak_prompt(&mut self, text: &str) -> bool {
        let work = AssertUnwindSafe(self.ctx.speak(&mut self.session, text)).catch_unwind();
        match while_busy(&mut self.inbound, &mut self.barge_in, work).await {
            None | Some(Ok(Err(TurnError::Disconnected))) => false,
            Some(Ok(Ok(_))) => true,
            Some(Ok(Err(e))) => {
                error!(call_id = %self.session.call_id(), "prompt could not be spoken: {}", e);
                true
            }
            Some(Err(panic)) => {
                error!(
                    call_id = %self.session.call_id(),
                    panic = panic_message(panic.as_ref()),
                    "prompt panicked"
                );
                true
            }
        }
    }

    async fn apologize(&mut self) -> bool {
        let prompt = self.ctx.settings.prompts.apology.clone();
        self.speak_prompt(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_types::AudioFormat;

    fn frame(sequence: u64) -> AudioFrame {
        AudioFrame::new(vec![0xff; 160], AudioFormat::carrier(), sequence)
    }

    #[test]
    fn discard_policy_keeps_nothing() {
        let mut barge_in = BargeIn::new(BargeInPolicy::Discard, 10);
        barge_in.hold(frame(0));
        barge_in.hold(frame(1));
        let (frames, dropped) = barge_in.take();
        assert!(frames.is_empty());
        assert_eq!(dropped, 2);
        assert_eq!(barge_in.take().1, 0);
    }

    #[test]
    fn buffer_policy_keeps_most_recent_frames() {
        let mut barge_in = BargeIn::new(BargeInPolicy::Buffer, 2);
        for sequence in 0..5 {
            barge_in.hold(frame(sequence));
        }
        let (frames, dropped) = barge_in.take();
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert_eq!(dropped, 3);
    }

    #[test]
    fn history_is_bounded() {
        let mut session = CallSession::new(CarrierCall {
            stream_id: "MZ1".to_string(),
            call_sid: None,
        });
        for turn in 1..=5 {
            session.remember(
                TurnRecord {
                    turn,
                    utterance: format!("u{}", turn),
                    reply: format!("r{}", turn),
                },
                3,
            );
        }
        let turns: Vec<u32> = session.history.iter().map(|r| r.turn).collect();
        assert_eq!(turns, vec![3, 4, 5]);
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }

    #[tokio::test]
    async fn while_busy_drains_audio_until_work_finishes() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut barge_in = BargeIn::new(BargeInPolicy::Buffer, 8);
        tx.send(frame(0)).await.unwrap();
        tx.send(frame(1)).await.unwrap();

        let work = async {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            42
        };
        assert_eq!(while_busy(&mut rx, &mut barge_in, work).await, Some(42));
        assert_eq!(barge_in.take().0.len(), 2);

        drop(tx);
        let pending = std::future::pending::<()>();
        assert!(while_busy(&mut rx, &mut barge_in, pending).await.is_none());
    }
}
