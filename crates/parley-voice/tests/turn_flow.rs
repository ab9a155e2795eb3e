//! End-to-end tests of the turn-taking cycle with scripted devices and a
//! gated assistant backend: full state sequences, cancellation from every
//! state, staleness discard, and the capture/playback exclusion invariant.

use async_trait::async_trait;
use chrono::Utc;
use parley_voice::{
    AssistantBackend, AudioChunk, AudioConfig, CaptureConfig, CaptureDevice, CaptureHandle,
    ConversationHandle, ConversationState, Exchange, GateKind, PlaybackSink, RoundTripMetrics,
    SessionEvent, TurnController, Utterance, VoiceConfig, VoiceError, VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Scripted devices that record open/active windows
// ---------------------------------------------------------------------------

/// Microphone that plays one script per open (then silence until closed) and
/// flags a violation if opened while the speaker is active.
struct TrackingMicrophone {
    scripts: Mutex<VecDeque<Vec<Vec<f32>>>>,
    interval: Duration,
    mic_open: Arc<AtomicBool>,
    speaker_active: Arc<AtomicBool>,
    violations: Arc<AtomicUsize>,
}

struct TrackingHandle {
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    mic_open: Arc<AtomicBool>,
}

impl CaptureHandle for TrackingHandle {
    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.mic_open.store(false, Ordering::SeqCst);
    }
}

impl CaptureDevice for TrackingMicrophone {
    fn open(
        &self,
        config: &AudioConfig,
        chunks: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureHandle>> {
        if self.speaker_active.load(Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.mic_open.store(true, Ordering::SeqCst);

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_worker = Arc::clone(&stop);
        let interval = self.interval;
        let chunk_size = config.chunk_size;

        let worker = thread::spawn(move || {
            for frame in script {
                if stop_worker.load(Ordering::SeqCst) {
                    return;
                }
                if chunks
                    .send(AudioChunk {
                        samples: frame,
                        captured_at: Instant::now(),
                    })
                    .is_err()
                {
                    return;
                }
                thread::sleep(interval);
            }
            while !stop_worker.load(Ordering::SeqCst) {
                if chunks
                    .send(AudioChunk {
                        samples: vec![0.0; chunk_size],
                        captured_at: Instant::now(),
                    })
                    .is_err()
                {
                    return;
                }
                thread::sleep(interval);
            }
        });

        Ok(Box::new(TrackingHandle {
            stop,
            worker: Some(worker),
            mic_open: Arc::clone(&self.mic_open),
        }))
    }
}

/// Speaker that flags a violation if started while the microphone is open.
struct TrackingSpeaker {
    latency: Duration,
    fail: bool,
    active: Arc<AtomicBool>,
    mic_open: Arc<AtomicBool>,
    violations: Arc<AtomicUsize>,
}

impl PlaybackSink for TrackingSpeaker {
    fn play(&self, _audio: Vec<u8>, done: oneshot::Sender<VoiceResult<()>>) -> VoiceResult<()> {
        if self.mic_open.load(Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.active.store(true, Ordering::SeqCst);
        let latency = self.latency;
        let fail = self.fail;
        let active = Arc::clone(&self.active);
        thread::spawn(move || {
            thread::sleep(latency);
            active.store(false, Ordering::SeqCst);
            let _ = done.send(if fail {
                Err(VoiceError::PlaybackFailed("scripted failure".to_string()))
            } else {
                Ok(())
            });
        });
        Ok(())
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Microphone whose open always fails.
struct DeadMicrophone;

impl CaptureDevice for DeadMicrophone {
    fn open(
        &self,
        _config: &AudioConfig,
        _chunks: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureHandle>> {
        Err(VoiceError::DeviceUnavailable("unplugged".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Gated assistant: each round-trip resolves when the test says so
// ---------------------------------------------------------------------------

type ReplySpec = VoiceResult<(String, Option<Vec<u8>>)>;

struct GatedAssistant {
    gates: Mutex<VecDeque<oneshot::Receiver<ReplySpec>>>,
    calls: Arc<AtomicUsize>,
}

impl GatedAssistant {
    fn with_gates(n: usize) -> (Arc<Self>, Vec<oneshot::Sender<ReplySpec>>, Arc<AtomicUsize>) {
        let mut senders = Vec::with_capacity(n);
        let mut receivers = VecDeque::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = oneshot::channel();
            senders.push(tx);
            receivers.push_back(rx);
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let assistant = Arc::new(Self {
            gates: Mutex::new(receivers),
            calls: Arc::clone(&calls),
        });
        (assistant, senders, calls)
    }
}

#[async_trait]
impl AssistantBackend for GatedAssistant {
    async fn round_trip(&self, request_id: u64, utterance: Utterance) -> VoiceResult<Exchange> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().pop_front();
        let user_text = match utterance {
            Utterance::Text(text) => text,
            Utterance::Voice(recording) => {
                format!("[voice {:.2}s]", recording.duration().as_secs_f32())
            }
        };
        let gate = match gate {
            Some(gate) => gate,
            None => return Err(VoiceError::RoundTripFailed("unexpected call".to_string())),
        };
        match gate.await {
            Ok(Ok((assistant_text, assistant_audio))) => Ok(Exchange {
                request_id,
                user_text,
                assistant_text,
                assistant_audio,
                started_at: Utc::now(),
                completed_at: Utc::now(),
                metrics: RoundTripMetrics::default(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Rig and event collection helpers
// ---------------------------------------------------------------------------

struct Rig {
    handle: ConversationHandle,
    events: broadcast::Receiver<SessionEvent>,
    mic_open: Arc<AtomicBool>,
    speaker_active: Arc<AtomicBool>,
    violations: Arc<AtomicUsize>,
}

fn voiced_script(frames: usize) -> Vec<Vec<f32>> {
    (0..frames).map(|_| vec![0.5f32; 480]).collect()
}

fn fast_config() -> VoiceConfig {
    VoiceConfig {
        capture: CaptureConfig {
            silence_gap: Duration::from_millis(40),
            min_speech: Duration::from_millis(5),
            max_utterance: Duration::from_secs(2),
            gate: GateKind::Energy { threshold: 0.01 },
        },
        ..VoiceConfig::default()
    }
}

fn rig(
    config: VoiceConfig,
    scripts: Vec<Vec<Vec<f32>>>,
    assistant: Arc<dyn AssistantBackend>,
    playback_latency: Duration,
    playback_fails: bool,
) -> Rig {
    let mic_open = Arc::new(AtomicBool::new(false));
    let speaker_active = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));

    let microphone = Arc::new(TrackingMicrophone {
        scripts: Mutex::new(scripts.into_iter().collect()),
        interval: Duration::from_millis(1),
        mic_open: Arc::clone(&mic_open),
        speaker_active: Arc::clone(&speaker_active),
        violations: Arc::clone(&violations),
    });
    let speaker = Arc::new(TrackingSpeaker {
        latency: playback_latency,
        fail: playback_fails,
        active: Arc::clone(&speaker_active),
        mic_open: Arc::clone(&mic_open),
        violations: Arc::clone(&violations),
    });

    let handle = TurnController::spawn(config, microphone, speaker, assistant);
    let events = handle.subscribe();
    Rig {
        handle,
        events,
        mic_open,
        speaker_active,
        violations,
    }
}

/// Accumulate events (nothing is discarded) until a transition into `want`
/// arrives; the matching event is included.
async fn collect_until_state(
    events: &mut broadcast::Receiver<SessionEvent>,
    want: ConversationState,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for state {:?}, saw {:?}", want, seen))
            .expect("event stream closed");
        let hit = matches!(event, SessionEvent::StateChanged { to, .. } if to == want);
        seen.push(event);
        if hit {
            return seen;
        }
    }
}

/// Collect every event arriving within `window`.
async fn drain_events(
    events: &mut broadcast::Receiver<SessionEvent>,
    window: Duration,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return seen;
        }
        match timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => seen.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return seen,
        }
    }
}

fn exchanges(events: &[SessionEvent]) -> Vec<&Exchange> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ExchangeCompleted(exchange) => Some(exchange),
            _ => None,
        })
        .collect()
}

fn errors(events: &[SessionEvent]) -> Vec<&VoiceError> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Error(error) => Some(error),
            _ => None,
        })
        .collect()
}

fn states(events: &[SessionEvent]) -> Vec<ConversationState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn voice_turn_full_cycle_rearms_capture() {
    let (assistant, mut gates, _) = GatedAssistant::with_gates(1);
    let mut rig = rig(
        fast_config(),
        vec![voiced_script(10)],
        assistant,
        Duration::from_millis(20),
        false,
    );

    rig.handle.enable_voice_mode().await.unwrap();
    let mut seen = collect_until_state(&mut rig.events, ConversationState::Transcribing).await;
    gates
        .remove(0)
        .send(Ok(("hello".to_string(), Some(vec![0u8; 64]))))
        .unwrap();
    seen.extend(collect_until_state(&mut rig.events, ConversationState::Capturing).await);
    rig.handle.disable_voice_mode().await.unwrap();

    // Exactly the contract's sequence, with exactly one exchange appended.
    assert_eq!(
        states(&seen),
        vec![
            ConversationState::Capturing,
            ConversationState::Transcribing,
            ConversationState::Speaking,
            ConversationState::Capturing,
        ]
    );
    let completed = exchanges(&seen);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].assistant_text, "hello");
    assert!(errors(&seen).is_empty());
    assert_eq!(rig.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn round_trip_failure_rearms_without_exchange() {
    let (assistant, mut gates, _) = GatedAssistant::with_gates(1);
    let mut rig = rig(
        fast_config(),
        vec![voiced_script(10)],
        assistant,
        Duration::from_millis(10),
        false,
    );

    rig.handle.enable_voice_mode().await.unwrap();
    let mut seen = collect_until_state(&mut rig.events, ConversationState::Transcribing).await;
    gates
        .remove(0)
        .send(Err(VoiceError::RoundTripFailed("503".to_string())))
        .unwrap();
    seen.extend(collect_until_state(&mut rig.events, ConversationState::Capturing).await);
    rig.handle.disable_voice_mode().await.unwrap();

    assert!(exchanges(&seen).is_empty(), "failures never become exchanges");
    let surfaced = errors(&seen);
    assert_eq!(surfaced.len(), 1);
    assert!(matches!(surfaced[0], VoiceError::RoundTripFailed(_)));
    assert!(!rig.speaker_active.load(Ordering::SeqCst));
    assert_eq!(rig.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disable_during_capture_closes_device_without_exchange() {
    let mut config = fast_config();
    config.capture.max_utterance = Duration::from_secs(10);
    let (assistant, _gates, calls) = GatedAssistant::with_gates(0);
    let mut rig = rig(config, vec![], assistant, Duration::from_millis(10), false);

    rig.handle.enable_voice_mode().await.unwrap();
    let seen = collect_until_state(&mut rig.events, ConversationState::Capturing).await;
    assert!(rig.mic_open.load(Ordering::SeqCst));

    rig.handle.disable_voice_mode().await.unwrap();
    let rest = collect_until_state(&mut rig.events, ConversationState::Idle).await;

    assert_eq!(states(&rest), vec![ConversationState::Stopping, ConversationState::Idle]);
    assert!(!rig.mic_open.load(Ordering::SeqCst), "device must be closed");
    assert!(exchanges(&seen).is_empty() && exchanges(&rest).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_result_after_disable_changes_nothing() {
    let (assistant, mut gates, _) = GatedAssistant::with_gates(1);
    let mut rig = rig(
        fast_config(),
        vec![],
        assistant,
        Duration::from_millis(10),
        false,
    );

    rig.handle.send_text("are you there?").await.unwrap();
    rig.handle.disable_voice_mode().await.unwrap();
    let _ = collect_until_state(&mut rig.events, ConversationState::Idle).await;

    // The round-trip resolves only now — with reply audio that must never
    // reach the speaker.
    gates
        .remove(0)
        .send(Ok(("too late".to_string(), Some(vec![0u8; 32]))))
        .unwrap();
    let after = drain_events(&mut rig.events, Duration::from_millis(150)).await;

    assert!(
        after.is_empty(),
        "stale result must produce no events, got {:?}",
        after
    );
    assert!(
        !rig.speaker_active.load(Ordering::SeqCst),
        "no playback for stale results"
    );
}

#[tokio::test]
async fn out_of_order_resolution_discards_older_request() {
    let (assistant, mut gates, _) = GatedAssistant::with_gates(2);
    let mut rig = rig(
        fast_config(),
        vec![],
        assistant,
        Duration::from_millis(5),
        false,
    );

    rig.handle.send_text("first").await.unwrap();
    rig.handle.disable_voice_mode().await.unwrap();
    rig.handle.send_text("second").await.unwrap();

    // Resolve request 1 only after request 2 was dispatched.
    gates
        .remove(0)
        .send(Ok(("reply to first".to_string(), None)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    gates
        .remove(0)
        .send(Ok(("reply to second".to_string(), None)))
        .unwrap();

    let seen = drain_events(&mut rig.events, Duration::from_millis(200)).await;
    let completed = exchanges(&seen);
    assert_eq!(completed.len(), 1, "only the latest request may land");
    assert_eq!(completed[0].user_text, "second");
    assert_eq!(completed[0].assistant_text, "reply to second");
}

#[tokio::test]
async fn empty_captures_never_reach_the_assistant() {
    let mut config = fast_config();
    config.capture.max_utterance = Duration::from_millis(60);
    let (assistant, _gates, calls) = GatedAssistant::with_gates(0);
    let mut rig = rig(config, vec![], assistant, Duration::from_millis(10), false);

    rig.handle.enable_voice_mode().await.unwrap();
    // Several empty captures and re-arms go by.
    let seen = drain_events(&mut rig.events, Duration::from_millis(300)).await;
    rig.handle.disable_voice_mode().await.unwrap();

    assert_eq!(
        calls.load(Ordering::SeqCst),
        0,
        "no round-trips for empty captures"
    );
    assert!(!states(&seen).contains(&ConversationState::Transcribing));
}

#[tokio::test]
async fn playback_failure_continues_the_conversation() {
    let (assistant, mut gates, _) = GatedAssistant::with_gates(1);
    let mut rig = rig(
        fast_config(),
        vec![voiced_script(10)],
        assistant,
        Duration::from_millis(10),
        true, // playback fails
    );

    rig.handle.enable_voice_mode().await.unwrap();
    let mut seen = collect_until_state(&mut rig.events, ConversationState::Transcribing).await;
    gates
        .remove(0)
        .send(Ok(("spoken reply".to_string(), Some(vec![0u8; 64]))))
        .unwrap();
    // Failure must behave like completion: the cycle re-arms.
    seen.extend(collect_until_state(&mut rig.events, ConversationState::Capturing).await);
    rig.handle.disable_voice_mode().await.unwrap();

    assert!(states(&seen).contains(&ConversationState::Speaking));
    assert_eq!(exchanges(&seen).len(), 1, "the exchange still counts");
    let surfaced = errors(&seen);
    assert_eq!(surfaced.len(), 1);
    assert!(matches!(surfaced[0], VoiceError::PlaybackFailed(_)));
    assert_eq!(rig.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn text_turn_with_audio_speaks_then_idles() {
    let (assistant, mut gates, _) = GatedAssistant::with_gates(1);
    let mut rig = rig(
        fast_config(),
        vec![],
        assistant,
        Duration::from_millis(15),
        false,
    );

    rig.handle.send_text("tell me something").await.unwrap();
    gates
        .remove(0)
        .send(Ok(("something".to_string(), Some(vec![0u8; 16]))))
        .unwrap();
    // Voice mode was never enabled: playback completion drops to Idle.
    let seen = collect_until_state(&mut rig.events, ConversationState::Idle).await;

    assert_eq!(
        states(&seen),
        vec![
            ConversationState::AwaitingReply,
            ConversationState::Speaking,
            ConversationState::Idle,
        ]
    );
    assert_eq!(exchanges(&seen).len(), 1);
    assert_eq!(rig.violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dead_device_surfaces_and_stays_idle() {
    let (assistant, mut gates, _) = GatedAssistant::with_gates(1);
    let handle = TurnController::spawn(
        fast_config(),
        Arc::new(DeadMicrophone),
        Arc::new(TrackingSpeaker {
            latency: Duration::from_millis(5),
            fail: false,
            active: Arc::new(AtomicBool::new(false)),
            mic_open: Arc::new(AtomicBool::new(false)),
            violations: Arc::new(AtomicUsize::new(0)),
        }),
        assistant,
    );
    let mut events = handle.subscribe();

    let result = handle.enable_voice_mode().await;
    assert_eq!(
        result,
        Err(VoiceError::DeviceUnavailable("unplugged".to_string()))
    );
    let seen = drain_events(&mut events, Duration::from_millis(50)).await;
    assert_eq!(errors(&seen).len(), 1);
    assert!(states(&seen).is_empty(), "state must stay Idle");

    // Still usable: a text turn goes through.
    handle.send_text("fallback").await.unwrap();
    gates.remove(0).send(Ok(("ok".to_string(), None))).unwrap();
    let seen = drain_events(&mut events, Duration::from_millis(200)).await;
    assert_eq!(exchanges(&seen).len(), 1);
}

#[tokio::test]
async fn enable_disable_churn_never_overlaps_devices() {
    let mut config = fast_config();
    config.capture.max_utterance = Duration::from_millis(120);
    // Every other capture has speech; replies carry audio so playback runs.
    let scripts = (0..12)
        .map(|i| if i % 2 == 0 { voiced_script(8) } else { Vec::new() })
        .collect();
    let (assistant, gates, _) = GatedAssistant::with_gates(12);
    // Resolve every gate up front: round-trips complete as soon as they run.
    for gate in gates {
        let _ = gate.send(Ok(("ack".to_string(), Some(vec![0u8; 32]))));
    }
    let mut rig = rig(config, scripts, assistant, Duration::from_millis(8), false);

    for _ in 0..6 {
        rig.handle.enable_voice_mode().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        rig.handle.disable_voice_mode().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let _ = drain_events(&mut rig.events, Duration::from_millis(50)).await;

    assert_eq!(
        rig.violations.load(Ordering::SeqCst),
        0,
        "capture and playback must never overlap"
    );
    assert!(!rig.mic_open.load(Ordering::SeqCst));
}
