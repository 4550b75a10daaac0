//! Shared harness for the media stream tests: scripted providers, a server
//! on an ephemeral port and a few carrier-side WebSocket helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use callbridge_server::config::Config;
use callbridge_server::registry::SessionRegistry;
use callbridge_server::turn::VoicePipeline;
use callbridge_server::{app, AppState};
use callbridge_types::{AudioFormat, SessionEvent, TurnRecord, Utterance};
use callbridge_voice::transcode::{linear_to_mulaw, mulaw_to_linear};
use callbridge_voice::{
    AudioStream, CarrierCall, CarrierFallbackSpeaker, DriverTimeouts, RecognitionConfig,
    RecognitionEvent, RecognitionRequest, RecognitionResults, SpeechRecognizer, SpeechSynthesizer,
    SynthesisDriver, TextGenerator, Transcoder, TranscriptionDriver, VoiceError, VoiceSettings,
};
use futures_util::stream::{self, SplitSink};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Bound on every single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

// --- recognition ---

/// What one recognition stream does once it hears audio.
#[derive(Debug, Clone)]
pub enum Step {
    Final(&'static str),
    Interims(Vec<&'static str>, Option<&'static str>),
    Fail,
    /// Hears the end of speech but never transcribes it; the driver's result
    /// timeout ends the stream.
    Hang,
}

fn transcript(utterance: Utterance) -> Result<RecognitionEvent, VoiceError> {
    Ok(RecognitionEvent::Transcript(utterance))
}

impl Step {
    fn results(&self) -> Vec<Result<RecognitionEvent, VoiceError>> {
        match self {
            Step::Final(text) => vec![
                Ok(RecognitionEvent::SpeechEnded),
                transcript(Utterance::final_text(*text, Some(0.9))),
            ],
            Step::Interims(parts, last) => parts
                .iter()
                .map(|part| transcript(Utterance::interim(*part)))
                .chain(last.map(|text| transcript(Utterance::final_text(text, Some(0.9)))))
                .collect(),
            Step::Fail => vec![Err(VoiceError::Stt("recognizer unavailable".to_string()))],
            Step::Hang => vec![Ok(RecognitionEvent::SpeechEnded)],
        }
    }
}

/// Recognizer that plays one [`Step`] per opened stream, then `otherwise`.
#[derive(Debug)]
pub struct ScriptedRecognizer {
    steps: Mutex<VecDeque<Step>>,
    otherwise: Step,
    /// Audio received, one list per opened stream.
    audio: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    handshake_violations: Arc<AtomicUsize>,
}

impl ScriptedRecognizer {
    pub fn new(steps: Vec<Step>, otherwise: Step) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            otherwise,
            audio: Arc::new(Mutex::new(Vec::new())),
            handshake_violations: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn opens(&self) -> usize {
        self.audio.lock().unwrap().len()
    }

    pub fn audio_of(&self, stream: usize) -> Vec<Vec<u8>> {
        self.audio
            .lock()
            .unwrap()
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handshake_violations(&self) -> usize {
        self.handshake_violations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(
        &self,
        mut requests: mpsc::Receiver<RecognitionRequest>,
    ) -> Result<RecognitionResults, VoiceError> {
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());
        let index = {
            let mut audio = self.audio.lock().unwrap();
            audio.push(Vec::new());
            audio.len() - 1
        };
        let audio = self.audio.clone();
        let violations = self.handshake_violations.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            if !matches!(requests.recv().await, Some(RecognitionRequest::Configure(_))) {
                violations.fetch_add(1, Ordering::SeqCst);
            }
            let mut answered = false;
            loop {
                tokio::select! {
                    request = requests.recv() => match request {
                        Some(RecognitionRequest::Audio(data)) => {
                            audio.lock().unwrap()[index].push(data);
                            if !answered {
                                answered = true;
                                for result in step.results() {
                                    if tx.send(result).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Some(RecognitionRequest::Configure(_)) => {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(rx)
    }
}

// --- synthesis ---

#[derive(Debug, Clone)]
pub enum Voice {
    Audio(Vec<Vec<u8>>),
    /// `chunks` frames of 160 bytes, one every `every`.
    Paced { chunks: usize, every: Duration },
    /// Never ends on its own.
    Endless(Duration),
    Fail,
}

struct DropGuard(Arc<AtomicBool>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockSynth {
    name: &'static str,
    voice: Voice,
    texts: Mutex<Vec<String>>,
    dropped: Arc<AtomicBool>,
    chunks_sent: Arc<AtomicUsize>,
}

impl MockSynth {
    pub fn new(name: &'static str, voice: Voice) -> Arc<Self> {
        Arc::new(Self {
            name,
            voice,
            texts: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicBool::new(false)),
            chunks_sent: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Texts this provider was asked to speak, in order.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    /// True once an endless stream has been dropped.
    pub fn stream_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynth {
    fn name(&self) -> &str {
        self.name
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::carrier()
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceSettings) -> Result<AudioStream, VoiceError> {
        self.texts.lock().unwrap().push(text.to_string());
        match &self.voice {
            Voice::Fail => Err(VoiceError::Tts(format!("{} is down", self.name))),
            Voice::Audio(chunks) => Ok(stream::iter(chunks.clone().into_iter().map(Ok)).boxed()),
            Voice::Paced { chunks, every } => {
                let every = *every;
                Ok(stream::unfold(*chunks, move |left| async move {
                    if left == 0 {
                        return None;
                    }
                    tokio::time::sleep(every).await;
                    Some((Ok(vec![0x55; 160]), left - 1))
                })
                .boxed())
            }
            Voice::Endless(every) => {
                let every = *every;
                let guard = DropGuard(self.dropped.clone());
                let sent = self.chunks_sent.clone();
                Ok(stream::unfold((guard, sent), move |(guard, sent)| async move {
                    tokio::time::sleep(every).await;
                    sent.fetch_add(1, Ordering::SeqCst);
                    Some((Ok(vec![0x55; 160]), (guard, sent)))
                })
                .boxed())
            }
        }
    }
}

// --- generation and carrier fallback ---

/// Echoes the caller and remembers what it heard.
#[derive(Debug, Default)]
pub struct EchoGenerator {
    heard: Mutex<Vec<String>>,
    panic_first: bool,
    calls: AtomicUsize,
}

impl EchoGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Panics on the first turn, echoes afterwards.
    pub fn panicking_once() -> Arc<Self> {
        Arc::new(Self {
            panic_first: true,
            ..Self::default()
        })
    }

    pub fn heard(&self) -> Vec<String> {
        self.heard.lock().unwrap().clone()
    }
}

pub fn echo(text: &str) -> String {
    format!("שמעתי: {}", text)
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn reply(&self, _history: &[TurnRecord], utterance: &Utterance) -> Result<String, VoiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_first && call == 0 {
            panic!("generator exploded");
        }
        self.heard.lock().unwrap().push(utterance.text.clone());
        Ok(echo(&utterance.text))
    }
}

/// Generator that never produces a usable reply.
#[derive(Debug, Clone, Copy)]
pub enum BrokenGenerator {
    Failing,
    Hanging,
    Empty,
}

#[async_trait]
impl TextGenerator for BrokenGenerator {
    fn name(&self) -> &str {
        "broken"
    }

    async fn reply(&self, _history: &[TurnRecord], _utterance: &Utterance) -> Result<String, VoiceError> {
        match self {
            BrokenGenerator::Failing => {
                Err(VoiceError::Generation("upstream returned 503".to_string()))
            }
            BrokenGenerator::Hanging => std::future::pending().await,
            BrokenGenerator::Empty => Ok("  ".to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingFallback {
    spoken: Mutex<Vec<(String, String)>>,
}

impl RecordingFallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(stream id, text)` pairs spoken through the carrier.
    pub fn spoken(&self) -> Vec<(String, String)> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl CarrierFallbackSpeaker for RecordingFallback {
    async fn speak(&self, call: &CarrierCall, text: &str) -> Result<(), VoiceError> {
        self.spoken
            .lock()
            .unwrap()
            .push((call.stream_id.clone(), text.to_string()));
        Ok(())
    }
}

// --- server ---

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.public_url = "https://bot.example.com".to_string();
    config.recognition.retry_backoff_ms = 20;
    config
}

pub fn pipeline(
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizers: Vec<Arc<MockSynth>>,
    generator: Arc<dyn TextGenerator>,
    fallback: Arc<RecordingFallback>,
) -> VoicePipeline {
    let timeouts = DriverTimeouts {
        open: Duration::from_secs(2),
        result: Duration::from_millis(300),
    };
    pipeline_with_timeouts(recognizer, timeouts, synthesizers, generator, fallback)
}

pub fn pipeline_with_timeouts(
    recognizer: Arc<dyn SpeechRecognizer>,
    timeouts: DriverTimeouts,
    synthesizers: Vec<Arc<MockSynth>>,
    generator: Arc<dyn TextGenerator>,
    fallback: Arc<RecordingFallback>,
) -> VoicePipeline {
    let carrier = AudioFormat::carrier();
    let recognition = RecognitionConfig {
        encoding: carrier.encoding,
        sample_rate: carrier.sample_rate,
        language: "he-IL".to_string(),
        interim_results: true,
        single_utterance: true,
    };
    VoicePipeline {
        transcoder: Transcoder::new(carrier, carrier),
        transcription: TranscriptionDriver::new(recognizer, recognition, timeouts),
        synthesis: SynthesisDriver::new(
            synthesizers
                .into_iter()
                .map(|s| s as Arc<dyn SpeechSynthesizer>)
                .collect(),
            VoiceSettings::default(),
            Duration::from_secs(2),
        ),
        generator,
        fallback,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub events: broadcast::Receiver<SessionEvent>,
    pub registry: SessionRegistry,
}

pub async fn spawn_server(config: Config, pipeline: VoicePipeline) -> TestServer {
    let state = AppState::new(config, pipeline);
    let registry = state.registry.clone();
    let events = state.events_tx.subscribe();
    let app = app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        events,
        registry,
    }
}

impl TestServer {
    pub async fn connect(&self) -> Socket {
        let url = format!("ws://{}/stream", self.addr);
        let (socket, _) = connect_async(url).await.expect("Failed to connect WS");
        socket
    }

    /// Waits for the first event matching `wanted`, skipping the rest.
    pub async fn wait_for_event(&mut self, wanted: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if wanted(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    /// Events up to and including the first one matching `last`.
    pub async fn events_until(&mut self, last: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.wait_for_event(|_| true).await;
            let done = last(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    pub async fn wait_until_registered(&self, call_id: &str) {
        tokio::time::timeout(WAIT, async {
            while !self.registry.contains(call_id).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was never registered");
    }

    pub async fn wait_until_idle(&self) {
        tokio::time::timeout(WAIT, async {
            while !self.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions were never removed");
    }
}

// --- carrier side ---

pub fn start_frame(stream_id: &str) -> String {
    json!({
        "event": "start",
        "sequenceNumber": "1",
        "start": {
            "streamSid": stream_id,
            "callSid": format!("CA-{}", stream_id),
            "tracks": ["inbound"],
            "mediaFormat": { "encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1 },
        },
        "streamSid": stream_id,
    })
    .to_string()
}

pub fn media_frame(stream_id: &str, audio: &[u8]) -> String {
    json!({
        "event": "media",
        "streamSid": stream_id,
        "media": {
            "track": "inbound",
            "payload": base64::engine::general_purpose::STANDARD.encode(audio),
        },
    })
    .to_string()
}

pub fn stop_frame(stream_id: &str) -> String {
    json!({ "event": "stop", "streamSid": stream_id, "stop": {} }).to_string()
}

pub async fn send<S>(sink: &mut S, text: String)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    sink.send(Message::Text(text.into())).await.unwrap();
}

/// Sends `count` frames of caller audio filled with `byte`.
pub async fn send_audio<S>(sink: &mut S, stream_id: &str, count: usize, byte: u8)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    for _ in 0..count {
        send(sink, media_frame(stream_id, &[byte; 160])).await;
    }
}

/// One 20 ms µ-law frame of a loud 1 kHz tone.
pub fn tone_frame() -> Vec<u8> {
    (0..160)
        .map(|i| {
            let phase = i as f32 * 2.0 * std::f32::consts::PI / 8.0;
            linear_to_mulaw((phase.sin() * 12_000.0) as i16)
        })
        .collect()
}

/// One 20 ms µ-law frame of digital silence.
pub fn silent_frame() -> Vec<u8> {
    vec![linear_to_mulaw(0); 160]
}

/// Keeps caller audio flowing every 20 ms until aborted or the socket fails.
pub fn pump_audio(mut sink: SplitSink<Socket, Message>, stream_id: &str) -> JoinHandle<()> {
    let frame = media_frame(stream_id, &[0x10; 160]);
    tokio::spawn(async move {
        loop {
            if sink.send(Message::Text(frame.clone().into())).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
}

/// Next JSON message from the server; `None` once the socket is closed.
pub async fn next_json<S>(stream: &mut S) -> Option<Value>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap())
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for the server")
}

/// Reads one reply: the decoded media payloads, then the closing mark.
pub async fn collect_reply<S>(stream: &mut S) -> (Vec<Vec<u8>>, Value)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut frames = Vec::new();
    loop {
        let message = next_json(stream).await.expect("socket closed mid-reply");
        match message["event"].as_str() {
            Some("media") => frames.push(decode_payload(&message)),
            Some("mark") => return (frames, message),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

pub fn decode_payload(message: &Value) -> Vec<u8> {
    let payload = message["media"]["payload"].as_str().unwrap();
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .unwrap()
}

/// Reads until the socket closes. Returns the number of messages skipped.
pub async fn drain_until_closed<S>(stream: &mut S) -> usize
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut skipped = 0;
    while next_json(stream).await.is_some() {
        skipped += 1;
    }
    skipped
}

/// What the carrier hears for µ-law `bytes` after decoding and re-encoding.
pub fn through_codec(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .map(|&b| linear_to_mulaw(mulaw_to_linear(b)))
        .collect()
}
