mod common;

use callbridge_types::{CallState, ReplyOutcome, SessionEvent};
use common::*;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_reply_is_streamed_in_order_then_marked() {
    let recognizer = ScriptedRecognizer::new(vec![Step::Final("שלום")], Step::Hang);
    let chunks = vec![
        (0..200).map(|i| (i % 120) as u8).collect::<Vec<u8>>(),
        (0..280).map(|i| 0x80 + (i % 100) as u8).collect::<Vec<u8>>(),
    ];
    let synth = MockSynth::new("primary", Voice::Audio(chunks.clone()));
    let generator = EchoGenerator::new();
    let fallback = RecordingFallback::new();
    let mut server = spawn_server(
        test_config(),
        pipeline(recognizer.clone(), vec![synth.clone()], generator.clone(), fallback.clone()),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-a")).await;
    send_audio(&mut socket, "MZ-a", 3, 0x10).await;

    let mut messages = Vec::new();
    let mark = loop {
        let message = next_json(&mut socket).await.expect("socket closed mid-reply");
        if message["event"] == "mark" {
            break message;
        }
        messages.push(message);
    };

    // 480 bytes of µ-law make exactly three 20 ms frames.
    assert_eq!(messages.len(), 3);
    let mut streamed = Vec::new();
    for message in &messages {
        assert_eq!(message["event"], "media");
        assert_eq!(message["streamSid"], "MZ-a");
        let frame = decode_payload(message);
        assert_eq!(frame.len(), 160);
        streamed.extend(frame);
    }
    assert_eq!(streamed, through_codec(&chunks.concat()));

    assert_eq!(mark["streamSid"], "MZ-a");
    assert_eq!(mark["mark"]["name"], "end_of_bot_speech");

    // Nothing else until the caller speaks again.
    let quiet = tokio::time::timeout(Duration::from_millis(300), socket.next()).await;
    assert!(quiet.is_err(), "unexpected message after the mark: {:?}", quiet);

    let events = server
        .events_until(|e| matches!(e, SessionEvent::TurnCompleted { .. }))
        .await;
    assert_eq!(
        events,
        vec![
            SessionEvent::StateChanged {
                call_id: "MZ-a".to_string(),
                from: CallState::Listening,
                to: CallState::Thinking,
            },
            SessionEvent::StateChanged {
                call_id: "MZ-a".to_string(),
                from: CallState::Thinking,
                to: CallState::Speaking,
            },
            SessionEvent::TurnCompleted {
                call_id: "MZ-a".to_string(),
                turn: 1,
                outcome: ReplyOutcome::Primary,
            },
        ]
    );

    assert_eq!(generator.heard(), vec!["שלום"]);
    assert_eq!(synth.texts(), vec![echo("שלום")]);
    assert!(fallback.spoken().is_empty());
    assert_eq!(recognizer.handshake_violations(), 0);
}

#[tokio::test]
async fn test_recognition_timeouts_ask_caller_to_repeat() {
    let recognizer = ScriptedRecognizer::new(vec![Step::Hang, Step::Hang], Step::Hang);
    let synth = MockSynth::new("primary", Voice::Audio(vec![vec![0x20; 320]]));
    let generator = EchoGenerator::new();
    let config = test_config();
    let prompt = config.prompts.didnt_catch.clone();
    let mut server = spawn_server(
        config,
        pipeline(recognizer.clone(), vec![synth.clone()], generator.clone(), RecordingFallback::new()),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-b")).await;
    let (sink, mut stream) = socket.split();
    let pump = pump_audio(sink, "MZ-b");

    let (frames, mark) = collect_reply(&mut stream).await;
    pump.abort();

    assert_eq!(frames.len(), 2);
    assert_eq!(mark["mark"]["name"], "end_of_bot_speech");
    assert_eq!(synth.texts()[0], prompt);
    assert!(generator.heard().is_empty());
    assert!(recognizer.opens() >= 2);

    // The prompt is not a turn; the call goes back to listening.
    server
        .wait_for_event(|e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    from: CallState::Speaking,
                    to: CallState::Listening,
                    ..
                }
            )
        })
        .await;
}

#[tokio::test]
async fn test_all_synthesizers_failing_falls_back_to_carrier_speech() {
    let recognizer = ScriptedRecognizer::new(vec![Step::Final("מה השעה")], Step::Hang);
    let primary = MockSynth::new("primary", Voice::Fail);
    let secondary = MockSynth::new("secondary", Voice::Fail);
    let fallback = RecordingFallback::new();
    let mut server = spawn_server(
        test_config(),
        pipeline(
            recognizer,
            vec![primary.clone(), secondary.clone()],
            EchoGenerator::new(),
            fallback.clone(),
        ),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-c")).await;
    send_audio(&mut socket, "MZ-c", 2, 0x10).await;

    let (frames, mark) = collect_reply(&mut socket).await;
    assert!(frames.is_empty());
    assert_eq!(mark["mark"]["name"], "end_of_bot_speech");

    assert_eq!(
        fallback.spoken(),
        vec![("MZ-c".to_string(), echo("מה השעה"))]
    );
    assert_eq!(primary.texts(), vec![echo("מה השעה")]);
    assert_eq!(secondary.texts(), vec![echo("מה השעה")]);

    let completed = server
        .wait_for_event(|e| matches!(e, SessionEvent::TurnCompleted { .. }))
        .await;
    assert_eq!(
        completed,
        SessionEvent::TurnCompleted {
            call_id: "MZ-c".to_string(),
            turn: 1,
            outcome: ReplyOutcome::Failed,
        }
    );
}

#[tokio::test]
async fn test_secondary_synthesizer_covers_for_primary() {
    let recognizer = ScriptedRecognizer::new(vec![Step::Final("שלום")], Step::Hang);
    let primary = MockSynth::new("primary", Voice::Fail);
    let secondary = MockSynth::new("secondary", Voice::Audio(vec![vec![0x30; 160]]));
    let fallback = RecordingFallback::new();
    let mut server = spawn_server(
        test_config(),
        pipeline(
            recognizer,
            vec![primary, secondary],
            EchoGenerator::new(),
            fallback.clone(),
        ),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-f")).await;
    send_audio(&mut socket, "MZ-f", 1, 0x10).await;

    let (frames, _) = collect_reply(&mut socket).await;
    assert_eq!(frames, vec![through_codec(&[0x30; 160])]);
    assert!(fallback.spoken().is_empty());

    let completed = server
        .wait_for_event(|e| matches!(e, SessionEvent::TurnCompleted { .. }))
        .await;
    assert!(matches!(
        completed,
        SessionEvent::TurnCompleted {
            outcome: ReplyOutcome::Fallback,
            ..
        }
    ));
}

#[tokio::test]
async fn test_interim_results_never_reach_the_generator() {
    let recognizer = ScriptedRecognizer::new(
        vec![Step::Interims(vec!["של", "שלו"], None)],
        Step::Hang,
    );
    let synth = MockSynth::new("primary", Voice::Audio(vec![vec![0x20; 160]]));
    let generator = EchoGenerator::new();
    let config = test_config();
    let prompt = config.prompts.didnt_catch.clone();
    let server = spawn_server(
        config,
        pipeline(recognizer, vec![synth.clone()], generator.clone(), RecordingFallback::new()),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-i")).await;
    let (sink, mut stream) = socket.split();
    let pump = pump_audio(sink, "MZ-i");

    // Interims alone end in a timeout, so the caller is asked to repeat.
    collect_reply(&mut stream).await;
    pump.abort();

    assert!(generator.heard().is_empty());
    assert_eq!(synth.texts(), vec![prompt]);
}

#[tokio::test]
async fn test_final_after_interims_is_answered_once() {
    let recognizer = ScriptedRecognizer::new(
        vec![Step::Interims(vec!["של", "שלו"], Some("שלום"))],
        Step::Hang,
    );
    let synth = MockSynth::new("primary", Voice::Audio(vec![vec![0x20; 160]]));
    let generator = EchoGenerator::new();
    let server = spawn_server(
        test_config(),
        pipeline(recognizer, vec![synth.clone()], generator.clone(), RecordingFallback::new()),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-j")).await;
    send_audio(&mut socket, "MZ-j", 2, 0x10).await;

    collect_reply(&mut socket).await;
    assert_eq!(generator.heard(), vec!["שלום"]);
    assert_eq!(synth.texts(), vec![echo("שלום")]);
}

#[tokio::test]
async fn test_recognizer_error_is_retried() {
    let recognizer = ScriptedRecognizer::new(vec![Step::Fail, Step::Final("כן")], Step::Hang);
    let generator = EchoGenerator::new();
    let server = spawn_server(
        test_config(),
        pipeline(
            recognizer.clone(),
            vec![MockSynth::new("primary", Voice::Audio(vec![vec![0x20; 160]]))],
            generator.clone(),
            RecordingFallback::new(),
        ),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-r")).await;
    let (sink, mut stream) = socket.split();
    let pump = pump_audio(sink, "MZ-r");

    collect_reply(&mut stream).await;
    pump.abort();

    assert_eq!(generator.heard(), vec!["כן"]);
    assert!(recognizer.opens() >= 2);
}

#[tokio::test]
async fn test_generator_panic_is_contained_to_its_turn() {
    let recognizer = ScriptedRecognizer::new(
        vec![Step::Final("ראשון"), Step::Final("שני")],
        Step::Hang,
    );
    let synth = MockSynth::new("primary", Voice::Audio(vec![vec![0x20; 160]]));
    let generator = EchoGenerator::panicking_once();
    let config = test_config();
    let apology = config.prompts.apology.clone();
    let mut server = spawn_server(
        config,
        pipeline(recognizer, vec![synth.clone()], generator.clone(), RecordingFallback::new()),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame("MZ-p")).await;
    let (sink, mut stream) = socket.split();
    let pump = pump_audio(sink, "MZ-p");

    collect_reply(&mut stream).await;
    collect_reply(&mut stream).await;
    pump.abort();

    let texts = synth.texts();
    assert_eq!(texts[0], apology);
    assert_eq!(texts[1], echo("שני"));
    assert_eq!(generator.heard(), vec!["שני"]);

    let first = server
        .wait_for_event(|e| matches!(e, SessionEvent::TurnCompleted { .. }))
        .await;
    assert!(matches!(
        first,
        SessionEvent::TurnCompleted {
            turn: 1,
            outcome: ReplyOutcome::Failed,
            ..
        }
    ));
    let second = server
        .wait_for_event(|e| matches!(e, SessionEvent::TurnCompleted { .. }))
        .await;
    assert!(matches!(
        second,
        SessionEvent::TurnCompleted {
            turn: 2,
            outcome: ReplyOutcome::Primary,
            ..
        }
    ));
    assert!(server.registry.contains("MZ-p").await);
}

/// Runs one turn against a generator that cannot answer and checks the caller
/// hears the canned apology exactly once before the call listens again.
async fn assert_generation_fallback(generator: BrokenGenerator, call_id: &'static str) {
    let recognizer = ScriptedRecognizer::new(vec![Step::Final("מה המצב")], Step::Hang);
    let synth = MockSynth::new("primary", Voice::Audio(vec![vec![0x20; 160]]));
    let mut config = test_config();
    config.generation.timeout_secs = 1;
    let apology = config.prompts.generation_fallback.clone();
    let mut server = spawn_server(
        config,
        pipeline(recognizer, vec![synth.clone()], Arc::new(generator), RecordingFallback::new()),
    )
    .await;

    let mut socket = server.connect().await;
    send(&mut socket, start_frame(call_id)).await;
    send_audio(&mut socket, call_id, 1, 0x10).await;

    let (frames, mark) = collect_reply(&mut socket).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(mark["mark"]["name"], "end_of_bot_speech");
    let quiet = tokio::time::timeout(Duration::from_millis(300), socket.next()).await;
    assert!(quiet.is_err(), "unexpected message after the mark: {:?}", quiet);

    assert_eq!(synth.texts(), vec![apology]);

    let events = server
        .events_until(|e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    from: CallState::Speaking,
                    to: CallState::Listening,
                    ..
                }
            )
        })
        .await;
    assert!(events.contains(&SessionEvent::TurnCompleted {
        call_id: call_id.to_string(),
        turn: 1,
        outcome: ReplyOutcome::Primary,
    }));
    assert!(server.registry.contains(call_id).await);
}

#[tokio::test]
async fn test_generator_error_speaks_generation_fallback() {
    assert_generation_fallback(BrokenGenerator::Failing, "MZ-ge").await;
}

#[tokio::test]
async fn test_generator_timeout_speaks_generation_fallback() {
    assert_generation_fallback(BrokenGenerator::Hanging, "MZ-gt").await;
}

#[tokio::test]
async fn test_empty_reply_speaks_generation_fallback() {
    assert_generation_fallback(BrokenGenerator::Empty, "MZ-gx").await;
}
