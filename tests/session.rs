//! Session controller integration tests
//!
//! Drives the controller against in-process fakes; timer-driven behavior runs
//! on a paused clock.

use std::time::Duration;

use neural_link::canvas::BoardCommand;
use neural_link::session::{
    AvatarState, BRIDGE_FAILURE, CRITICAL_FAILURE, Command, ConnectionState, LINK_DISTURBANCE,
    REBOOTING_LINK, Speaker,
};
use neural_link::Error;
use serde_json::json;

mod common;
use common::{ConnectOutcome, FakeCredentials, FakeInput, Harness, audio_message};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

// -- lifecycle ----------------------------------------------------------------

#[tokio::test]
async fn open_sets_listening_and_binds_capture() {
    let mut h = Harness::new();
    h.controller.start().await;
    h.settle().await;

    assert_eq!(h.controller.snapshot().connection, ConnectionState::Connecting);
    assert!(h.controller.snapshot().processing);

    h.connector.open();
    h.settle().await;

    let snapshot = h.controller.snapshot();
    assert!(snapshot.started);
    assert_eq!(snapshot.connection, ConnectionState::Open);
    assert_eq!(snapshot.avatar, AvatarState::Listening);
    assert!(!snapshot.processing);
    assert_eq!(snapshot.status, None);

    h.input.capture(0.1);
    h.settle().await;

    let sent = h.connector.session().audio.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "audio/pcm;rate=16000");
}

#[tokio::test]
async fn setup_declares_tools_and_voice() {
    let mut h = Harness::new();
    h.open().await;

    let setup = h.connector.last_setup().unwrap();
    assert_eq!(setup.voice, "Kore");
    assert!(setup.model.starts_with("models/"));
    let names: Vec<_> = setup.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["display_content", "hide_content"]);
}

#[tokio::test]
async fn start_twice_connects_once() {
    let mut h = Harness::new();
    h.open().await;

    assert!(h.controller.handle_command(Command::Start).await);
    h.settle().await;

    assert_eq!(h.connector.connect_count(), 1);
    assert_eq!(h.input.open_count(), 1);
}

#[tokio::test]
async fn frames_before_open_are_not_sent() {
    let mut h = Harness::new();
    h.controller.start().await;
    h.settle().await;

    h.input.capture(0.2);
    h.settle().await;
    h.connector.open();
    h.settle().await;

    assert_eq!(h.connector.session().audio_count(), 0);
}

// -- inbound messages -----------------------------------------------------------

#[tokio::test]
async fn transcript_then_gapless_chunks() {
    let mut h = Harness::new();
    h.open().await;

    h.deliver(json!({ "serverContent": { "inputTranscription": { "text": "hello" } } }))
        .await;
    let snapshot = h.controller.snapshot();
    let transcript = snapshot.transcript.clone().unwrap();
    assert_eq!(transcript.speaker, Speaker::User);
    assert_eq!(transcript.text, "hello");
    assert_eq!(snapshot.avatar, AvatarState::Thinking);
    assert!(snapshot.processing);

    // 1.0s chunk at clock 0.0
    h.deliver(audio_message(1.0)).await;
    assert!(approx(h.controller.playback().cursor(), 1.0));
    assert_eq!(h.controller.snapshot().avatar, AvatarState::Speaking);
    assert!(!h.controller.snapshot().processing);

    // 0.5s chunk at clock 0.3 starts at 1.0, not 0.3
    h.render(0.3);
    assert!(approx(h.controller.playback().now(), 0.3));
    h.deliver(audio_message(0.5)).await;
    assert!(approx(h.controller.playback().cursor(), 1.5));
    assert_eq!(h.controller.playback().active_count(), 2);
}

#[tokio::test]
async fn last_chunk_finishing_returns_to_listening() {
    let mut h = Harness::new();
    h.open().await;

    h.deliver(audio_message(0.5)).await;
    h.deliver(audio_message(0.5)).await;

    h.render(0.6);
    h.settle().await;
    assert_eq!(h.controller.snapshot().avatar, AvatarState::Speaking);

    h.render(0.5);
    h.settle().await;
    assert_eq!(h.controller.playback().active_count(), 0);
    assert_eq!(h.controller.snapshot().avatar, AvatarState::Listening);
}

#[tokio::test]
async fn chunk_after_late_arrival_starts_at_clock() {
    let mut h = Harness::new();
    h.open().await;

    h.deliver(audio_message(0.2)).await;
    h.render(1.0);
    h.settle().await;

    h.deliver(audio_message(0.5)).await;
    assert!(approx(h.controller.playback().cursor(), 1.5));
}

#[tokio::test]
async fn two_tool_calls_get_two_acks() {
    let mut h = Harness::new();
    h.open().await;
    let mut board_rx = h.board.lock().await.subscribe();

    h.deliver(json!({
        "toolCall": {
            "functionCalls": [
                {
                    "id": "1",
                    "name": "display_content",
                    "args": { "title": "Plan", "html": "<p>x</p>" }
                },
                { "id": "2", "name": "hide_content", "args": {} }
            ]
        }
    }))
    .await;

    let responses = h.connector.session().responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].id, "1");
    assert_eq!(responses[0].result_text(), Some("Engaged."));
    assert_eq!(responses[1].id, "2");
    assert_eq!(responses[1].result_text(), Some("Disengaged."));

    assert!(matches!(board_rx.recv().await.unwrap(), BoardCommand::Show { .. }));
    assert_eq!(board_rx.recv().await.unwrap(), BoardCommand::Hide);
    assert!(!h.controller.snapshot().board_visible);
}

#[tokio::test]
async fn unknown_tool_gets_no_ack() {
    let mut h = Harness::new();
    h.open().await;

    h.deliver(json!({
        "toolCall": { "functionCalls": [ { "id": "7", "name": "self_destruct", "args": {} } ] }
    }))
    .await;

    assert!(h.connector.session().responses().is_empty());
    assert_eq!(h.controller.snapshot().connection, ConnectionState::Open);
}

#[tokio::test]
async fn interruption_stops_everything_at_once() {
    let mut h = Harness::new();
    h.open().await;

    h.deliver(json!({ "serverContent": { "outputTranscription": { "text": "Let me" } } }))
        .await;
    h.deliver(audio_message(1.0)).await;
    h.deliver(audio_message(1.0)).await;
    assert_eq!(h.controller.playback().active_count(), 2);

    h.deliver(json!({ "serverContent": { "interrupted": true } }))
        .await;

    let snapshot = h.controller.snapshot();
    assert_eq!(h.controller.playback().active_count(), 0);
    assert_eq!(
        neural_link::voice::lock_graph(h.controller.playback().graph()).source_count(),
        0
    );
    assert_eq!(snapshot.avatar, AvatarState::Listening);
    assert_eq!(snapshot.transcript, None);
}

#[tokio::test]
async fn malformed_audio_is_dropped() {
    let mut h = Harness::new();
    h.open().await;

    h.deliver(json!({
        "serverContent": {
            "modelTurn": { "parts": [{ "inlineData": { "data": "@@not base64@@" } }] }
        }
    }))
    .await;
    // Odd byte count cannot be 16-bit PCM
    h.deliver(json!({
        "serverContent": { "modelTurn": { "parts": [ { "inlineData": { "data": "AAAA" } } ] } }
    }))
    .await;

    assert_eq!(h.controller.playback().active_count(), 0);
    assert_eq!(h.controller.snapshot().avatar, AvatarState::Listening);
    assert_eq!(h.controller.snapshot().connection, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn transcript_lingers_after_turn_complete() {
    let mut h = Harness::new();
    h.open().await;

    h.deliver(json!({ "serverContent": { "outputTranscription": { "text": "Hello" } } }))
        .await;
    h.deliver(json!({ "serverContent": { "outputTranscription": { "text": "there" } } }))
        .await;
    h.deliver(json!({ "serverContent": { "turnComplete": true } }))
        .await;

    assert_eq!(
        h.controller.snapshot().transcript.as_ref().map(|t| t.text.as_str()),
        Some("Hello there")
    );

    tokio::time::sleep(Duration::from_millis(2900)).await;
    h.settle().await;
    assert!(h.controller.snapshot().transcript.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.settle().await;
    assert_eq!(h.controller.snapshot().transcript, None);
}

// -- mute and volume ------------------------------------------------------------

#[tokio::test]
async fn muted_frames_are_never_sent() {
    let mut h = Harness::new();
    h.open().await;

    h.input.capture(0.1);
    h.settle().await;
    assert_eq!(h.connector.session().audio_count(), 1);

    h.controller.handle_command(Command::ToggleMute).await;
    assert!(h.controller.snapshot().muted);
    h.input.capture(0.2);
    h.input.capture(0.3);
    h.settle().await;
    assert_eq!(h.connector.session().audio_count(), 1);

    h.controller.handle_command(Command::SetMuted(false)).await;
    h.input.capture(0.4);
    h.settle().await;
    assert_eq!(h.connector.session().audio_count(), 2);
}

#[tokio::test]
async fn volume_is_clamped_and_applied_live() {
    let mut h = Harness::new();
    h.open().await;

    h.controller.handle_command(Command::SetVolume(1.7)).await;
    assert!((h.controller.snapshot().volume - 1.0).abs() < f32::EPSILON);
    let gain = neural_link::voice::lock_graph(h.controller.playback().graph()).gain();
    assert!((gain - 1.0).abs() < f32::EPSILON);

    h.controller.handle_command(Command::SetVolume(-1.0)).await;
    assert!(h.controller.snapshot().volume.abs() < f32::EPSILON);
}

#[tokio::test]
async fn level_reads_zero_unless_speaking() {
    let mut h = Harness::new();
    h.open().await;

    h.controller.refresh_level();
    assert!(h.controller.snapshot().level.abs() < f32::EPSILON);
}

// -- failures and retry -------------------------------------------------------------

#[tokio::test]
async fn denied_microphone_is_fatal() {
    let mut h = Harness::with(FakeInput::denied(), FakeCredentials::with_key());
    h.controller.start().await;
    h.settle().await;

    let snapshot = h.controller.snapshot();
    assert!(!snapshot.started);
    assert_eq!(snapshot.connection, ConnectionState::Idle);
    assert!(snapshot.status.as_deref().unwrap().contains("media access"));
    assert_eq!(h.connector.connect_count(), 0);
    assert!(!h.controller.retry_pending());
}

#[tokio::test]
async fn missing_credential_prompts_then_refuses() {
    let mut h = Harness::with(FakeInput::default(), FakeCredentials::missing());
    h.controller.start().await;

    assert_eq!(h.credentials.prompts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!h.controller.snapshot().started);
    assert!(h.controller.snapshot().status.is_some());
    assert_eq!(h.connector.connect_count(), 0);
}

#[tokio::test]
async fn prompted_credential_starts_call() {
    let mut h = Harness::with(FakeInput::default(), FakeCredentials::prompted("fresh"));
    h.open().await;

    assert_eq!(h.controller.snapshot().connection, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn link_error_schedules_reconnect() {
    let mut h = Harness::new();
    h.open().await;
    let first = h.connector.session();

    assert!(h.connector.link().error("socket reset"));
    h.settle().await;

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.connection, ConnectionState::Errored);
    assert_eq!(snapshot.avatar, AvatarState::Idle);
    assert_eq!(snapshot.status.as_deref(), Some("Link disturbance. [1/5]"));
    assert_eq!(snapshot.retry_attempt, 1);
    assert!(h.controller.retry_pending());
    assert_eq!(first.close_count(), 1);

    tokio::time::sleep(Duration::from_millis(2999)).await;
    h.settle().await;
    assert_eq!(h.connector.connect_count(), 1);

    tokio::time::sleep(Duration::from_millis(2)).await;
    h.settle().await;
    assert_eq!(h.connector.connect_count(), 2);
    assert_eq!(h.controller.snapshot().connection, ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn remote_close_uses_reboot_banner() {
    let mut h = Harness::new();
    h.open().await;

    assert!(h.connector.link().closed(Some("going away".to_string())));
    h.settle().await;

    assert_eq!(h.controller.snapshot().connection, ConnectionState::Closed);
    assert_eq!(
        h.controller.snapshot().status.as_deref(),
        Some(format!("{REBOOTING_LINK} [1/5]").as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded() {
    let mut h = Harness::new();
    for _ in 0..6 {
        h.connector
            .push_outcome(ConnectOutcome::Fail(Error::Connection("refused".to_string())));
    }

    h.controller.start().await;
    h.settle().await;

    let delays = [3000u64, 6000, 12000, 15000, 15000];
    for (i, delay) in delays.iter().enumerate() {
        let attempt = i + 1;
        assert_eq!(
            h.controller.snapshot().status,
            Some(format!("{BRIDGE_FAILURE} [{attempt}/5]"))
        );
        tokio::time::sleep(Duration::from_millis(*delay)).await;
        h.settle().await;
    }

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.status.as_deref(), Some(CRITICAL_FAILURE));
    assert!(!snapshot.started);
    assert!(!h.controller.retry_pending());
    assert_eq!(h.connector.connect_count(), 6);

    tokio::time::sleep(Duration::from_secs(60)).await;
    h.settle().await;
    assert_eq!(h.connector.connect_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_attempts() {
    let mut h = Harness::new();
    h.connector
        .push_outcome(ConnectOutcome::Fail(Error::Connection("refused".to_string())));
    h.connector
        .push_outcome(ConnectOutcome::Fail(Error::Connection("refused".to_string())));

    h.controller.start().await;
    h.settle().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.settle().await;
    assert_eq!(h.controller.snapshot().retry_attempt, 2);

    tokio::time::sleep(Duration::from_secs(6)).await;
    h.settle().await;
    h.connector.open();
    h.settle().await;

    assert_eq!(h.controller.snapshot().retry_attempt, 0);
    assert_eq!(h.controller.snapshot().status, None);

    assert!(h.connector.link().error("blip"));
    h.settle().await;
    assert_eq!(
        h.controller.snapshot().status,
        Some(format!("{LINK_DISTURBANCE} [1/5]"))
    );
}

#[tokio::test(start_paused = true)]
async fn end_cancels_pending_retry() {
    let mut h = Harness::new();
    h.connector
        .push_outcome(ConnectOutcome::Fail(Error::Connection("refused".to_string())));

    h.controller.start().await;
    h.settle().await;
    assert!(h.controller.retry_pending());

    h.controller.end().await;
    assert!(!h.controller.retry_pending());
    assert_eq!(h.controller.snapshot().retry_attempt, 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    h.settle().await;
    assert_eq!(h.connector.connect_count(), 1);
    assert!(!h.controller.snapshot().started);
}

#[tokio::test]
async fn explicit_end_never_reconnects() {
    let mut h = Harness::new();
    h.open().await;
    let link = h.connector.link();
    let session = h.connector.session();

    h.board.lock().await.show(neural_link::DisplayContent {
        title: None,
        html: "<p>left over</p>".to_string(),
    });

    h.controller.handle_command(Command::End).await;

    // The transport reports the close after the fact
    assert!(link.closed(None));
    h.settle().await;

    let snapshot = h.controller.snapshot();
    assert!(!snapshot.started);
    assert_eq!(snapshot.connection, ConnectionState::Idle);
    assert_eq!(snapshot.avatar, AvatarState::Idle);
    assert_eq!(snapshot.status, None);
    assert!(!snapshot.board_visible);
    assert!(!h.board.lock().await.is_visible());
    assert!(!h.controller.retry_pending());
    assert_eq!(session.close_count(), 1);
    assert_eq!(h.connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn end_releases_mic_when_close_stalls() {
    let mut h = Harness::new();
    h.connector.stall_closes();
    h.open().await;
    assert_eq!(h.input.open_count(), 1);
    assert_eq!(h.input.release_count(), 0);

    tokio::time::timeout(Duration::from_secs(30), h.controller.end())
        .await
        .expect("end hung on a session that never closes");

    assert_eq!(h.input.release_count(), 1);
    assert_eq!(h.connector.session().close_count(), 1);
    let snapshot = h.controller.snapshot();
    assert!(!snapshot.started);
    assert_eq!(snapshot.connection, ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn shutdown_completes_when_close_stalls() {
    let mut h = Harness::new();
    h.connector.stall_closes();
    h.open().await;

    let keep_running = tokio::time::timeout(
        Duration::from_secs(30),
        h.controller.handle_command(Command::Shutdown),
    )
    .await
    .expect("shutdown hung on a session that never closes");

    assert!(!keep_running);
    assert_eq!(h.input.release_count(), 1);
}

#[tokio::test]
async fn restart_after_end_opens_new_session() {
    let mut h = Harness::new();
    h.open().await;
    h.controller.end().await;

    h.open().await;
    assert_eq!(h.connector.connect_count(), 2);
    assert_eq!(h.controller.snapshot().connection, ConnectionState::Open);
}

// -- event loop -------------------------------------------------------------------

#[tokio::test]
async fn run_loop_handles_commands_until_shutdown() {
    let h = Harness::new();
    let connector = h.connector.clone();
    let mut snapshots = h.controller.subscribe();
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let task = tokio::spawn(h.controller.run(rx));

    tx.send(Command::Start).await.unwrap();
    snapshots
        .wait_for(|s| s.connection == ConnectionState::Connecting)
        .await
        .unwrap();

    while connector.connect_count() == 0 {
        tokio::task::yield_now().await;
    }
    connector.open();
    snapshots
        .wait_for(|s| s.connection == ConnectionState::Open)
        .await
        .unwrap();

    tx.send(Command::Shutdown).await.unwrap();
    tokio_test::assert_ok!(task.await);
    assert_eq!(connector.session().close_count(), 1);
}
