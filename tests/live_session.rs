//! End-to-end session behaviour against in-memory devices and service.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use marta_live::audio::codec::decode_pcm16_base64;
use marta_live::config::ServiceConfig;
use marta_live::test_utils::{
    ChannelConnector, FakeAudioBackend, FakeService, ManualClockOutput, ScriptedMicrophone,
    audio_message, pcm_base64,
};
use marta_live::transport::{VoiceChannel, VoiceConnector};
use marta_live::{
    FailureReason, LiveConfig, LiveError, SessionBackends, SessionController, SessionState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const OUTPUT_RATE: u32 = 24_000;

struct Session {
    controller: SessionController,
    service: FakeService,
    output: Arc<ManualClockOutput>,
    mic: ScriptedMicrophone,
    feeder: mpsc::Sender<Vec<f32>>,
}

fn session_with(config: LiveConfig, connector: ChannelConnector, service: FakeService) -> Session {
    let (mic, feeder) = ScriptedMicrophone::new(16_000);
    let output = ManualClockOutput::new(OUTPUT_RATE);
    let backends = SessionBackends {
        audio: Arc::new(FakeAudioBackend::new(mic.clone(), Arc::clone(&output))),
        connector: Arc::new(connector),
    };
    Session {
        controller: SessionController::new(config, backends).unwrap(),
        service,
        output,
        mic,
        feeder,
    }
}

fn session() -> Session {
    let (connector, service) = ChannelConnector::new();
    session_with(LiveConfig::default(), connector, service)
}

/// Poll `cond` until it holds or two seconds pass.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("never reached {want}"))
        .unwrap();
}

/// Record every state the session publishes.
fn record_states(controller: &SessionController) -> Arc<Mutex<Vec<SessionState>>> {
    let seen = Arc::new(Mutex::new(vec![controller.state()]));
    let mut rx = controller.status();
    let sink = Arc::clone(&seen);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            let done = state.is_terminal();
            sink.lock().unwrap().push(state);
            if done {
                break;
            }
        }
    });
    seen
}

fn secs(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[tokio::test]
async fn chunks_arriving_faster_than_real_time_play_gaplessly() {
    let s = session();
    s.controller.start().await.unwrap();

    for _ in 0..3 {
        s.service
            .push_json(audio_message(&[&pcm_base64(1.0, OUTPUT_RATE)], false, false));
    }
    eventually("three clips scheduled", || s.output.scheduled().len() == 3).await;

    let starts: Vec<_> = s.output.scheduled().iter().map(|v| v.start).collect();
    assert_eq!(starts, vec![secs(0), secs(1000), secs(2000)]);
    assert!(s.output.scheduled().iter().all(|v| v.duration == secs(1000)));

    s.controller.close().await;
}

#[tokio::test]
async fn barge_in_cuts_playback_and_reschedules_from_now() {
    let s = session();
    let mut status = s.controller.status();
    s.controller.start().await.unwrap();

    for _ in 0..3 {
        s.service
            .push_json(audio_message(&[&pcm_base64(1.0, OUTPUT_RATE)], false, false));
    }
    eventually("three clips scheduled", || s.output.scheduled().len() == 3).await;

    // Clip 0 has played out, clip 1 is mid-way.
    s.output.advance(secs(1400));
    s.service
        .push_json(serde_json::json!({"serverContent": {"interrupted": true}}));
    wait_state(&mut status, SessionState::Interrupted).await;

    let voices = s.output.scheduled();
    assert!(!voices[0].stopped, "finished clip is not stopped again");
    assert!(voices[1].stopped && voices[2].stopped);

    s.service
        .push_json(audio_message(&[&pcm_base64(1.0, OUTPUT_RATE)], false, false));
    wait_state(&mut status, SessionState::Active).await;
    eventually("fourth clip scheduled", || s.output.scheduled().len() == 4).await;
    assert_eq!(s.output.scheduled()[3].start, secs(1400));

    s.controller.close().await;
}

#[tokio::test]
async fn permission_denied_never_reaches_active() {
    let mic = ScriptedMicrophone::failing(LiveError::PermissionDenied);
    let output = ManualClockOutput::new(OUTPUT_RATE);
    let (connector, mut service) = ChannelConnector::new();
    let controller = SessionController::new(
        LiveConfig::default(),
        SessionBackends {
            audio: Arc::new(FakeAudioBackend::new(mic, Arc::clone(&output))),
            connector: Arc::new(connector),
        },
    )
    .unwrap();
    let seen = record_states(&controller);

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, LiveError::PermissionDenied));
    assert_eq!(
        controller.state(),
        SessionState::Failed(FailureReason::PermissionDenied)
    );

    eventually("terminal state recorded", || {
        seen.lock().unwrap().last().is_some_and(SessionState::is_terminal)
    })
    .await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&SessionState::Connecting));
    assert!(!seen.contains(&SessionState::Active));
    assert_eq!(output.close_count(), 1, "output acquired before the mic is released");

    // The service was never contacted.
    assert!(service.drain_client_messages().is_empty());
}

#[tokio::test]
async fn meter_reports_scaled_mean_amplitude() {
    let s = session();
    let mut volume = s.controller.volume();
    s.controller.start().await.unwrap();

    s.feeder.send(vec![0.02; 4096]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), volume.wait_for(|v| v.value() > 0.0))
        .await
        .unwrap()
        .unwrap();
    assert!((volume.borrow().value() - 0.1).abs() < 1e-3);

    s.feeder.send(vec![0.9; 4096]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), volume.wait_for(|v| v.value() >= 1.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume.borrow().value(), 1.0);

    s.controller.close().await;
}

#[tokio::test]
async fn concurrent_double_close_tears_down_once() {
    let s = session();
    s.controller.start().await.unwrap();
    let seen = record_states(&s.controller);

    let (first, second) = tokio::join!(s.controller.close(), s.controller.close());
    assert_eq!(first, SessionState::Closed);
    assert_eq!(second, SessionState::Closed);

    assert_eq!(s.mic.close_count(), 1);
    assert_eq!(s.service.close_count(), 1);
    assert_eq!(s.output.close_count(), 1);

    assert_eq!(s.controller.close().await, SessionState::Closed);
    assert_eq!(s.output.close_count(), 1);

    eventually("closed recorded", || {
        seen.lock().unwrap().last() == Some(&SessionState::Closed)
    })
    .await;
    let closing = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|state| **state == SessionState::Closing)
        .count();
    assert!(closing <= 1);
}

#[tokio::test]
async fn frames_keep_capture_order_under_backpressure() {
    let mut config = LiveConfig::default();
    config.audio.frame_samples = 160;
    config.capture.queue_capacity = 256;
    let (connector, service) = ChannelConnector::with_send_delay(Duration::from_millis(3));
    let mut s = session_with(config, connector, service);
    s.controller.start().await.unwrap();

    for i in 0..20_u16 {
        let level = f32::from(i + 1) / 100.0;
        s.feeder.send(vec![level; 160]).await.unwrap();
    }
    assert_eq!(s.controller.close().await, SessionState::Closed);

    let mut levels = Vec::new();
    while let Some(msg) = s.service.next_client_message().await {
        let Some(data) = msg["realtimeInput"]["mediaChunks"][0]["data"].as_str() else {
            continue;
        };
        let samples = decode_pcm16_base64(data.as_bytes()).unwrap();
        assert_eq!(samples.len(), 160);
        levels.push((samples[0] * 100.0).round() as i32);
    }
    assert_eq!(levels, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn undecodable_chunk_is_skipped_silently() {
    let s = session();
    let mut status = s.controller.status();
    s.controller.start().await.unwrap();

    s.service.push_json(audio_message(
        &["!!not base64!!", &pcm_base64(0.5, OUTPUT_RATE)],
        false,
        false,
    ));
    eventually("valid clip scheduled", || s.output.scheduled().len() == 1).await;
    assert_eq!(s.output.scheduled()[0].start, secs(0));
    assert_eq!(*status.borrow_and_update(), SessionState::Active);

    s.controller.close().await;
}

#[tokio::test]
async fn transport_failure_fails_the_session() {
    let s = session();
    let mut status = s.controller.status();
    s.controller.start().await.unwrap();

    s.service.push_error("connection reset by peer");
    wait_state(
        &mut status,
        SessionState::Failed(FailureReason::Transport("connection reset by peer".into())),
    )
    .await;
    assert!(s.mic.is_closed());
    assert_eq!(s.output.close_count(), 1);
}

/// A connector whose connection attempt never completes.
struct StalledConnector;

#[async_trait::async_trait]
impl VoiceConnector for StalledConnector {
    async fn connect(&self, _config: &ServiceConfig) -> marta_live::Result<VoiceChannel> {
        futures_util::future::pending().await
    }
}

#[tokio::test]
async fn close_during_start_releases_what_was_acquired() {
    let (mic, _feeder) = ScriptedMicrophone::new(16_000);
    let output = ManualClockOutput::new(OUTPUT_RATE);
    let controller = SessionController::new(
        LiveConfig::default(),
        SessionBackends {
            audio: Arc::new(FakeAudioBackend::new(mic.clone(), Arc::clone(&output))),
            connector: Arc::new(StalledConnector),
        },
    )
    .unwrap();

    let starter = controller.clone();
    let start = tokio::spawn(async move { starter.start().await });
    eventually("microphone opened", || mic.open_count() == 1).await;

    assert_eq!(controller.close().await, SessionState::Closed);
    let result = tokio::time::timeout(Duration::from_secs(2), start)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(LiveError::SessionClosed)));
    assert!(mic.is_closed());
    assert_eq!(output.close_count(), 1);
    assert!(matches!(
        controller.start().await,
        Err(LiveError::SessionClosed)
    ));
}

#[tokio::test]
async fn close_completes_when_the_service_stops_reading() {
    let mut config = LiveConfig::default();
    config.audio.frame_samples = 160;
    let (connector, service) = ChannelConnector::stalling();
    let s = session_with(config, connector, service);
    s.controller.start().await.unwrap();

    s.service
        .push_json(audio_message(&[&pcm_base64(1.0, OUTPUT_RATE)], false, false));
    eventually("clip scheduled", || s.output.scheduled().len() == 1).await;
    for _ in 0..4 {
        s.feeder.send(vec![0.1; 160]).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let state = tokio::time::timeout(Duration::from_secs(3), s.controller.close())
        .await
        .expect("close must not hang on a stalled service");
    assert_eq!(state, SessionState::Closed);
    assert!(s.mic.is_closed());
    assert_eq!(s.output.close_count(), 1);
    assert!(s.output.scheduled()[0].stopped, "queued reply is silenced");
}
