//! **CaptureSession** — one microphone-open-to-microphone-close cycle.
//!
//! A dedicated endpointer thread consumes 30ms chunks and runs the gap state
//! machine: waiting → voiced → gap, committing the turn after `silence_gap`
//! of post-speech silence, force-committing at `max_utterance` with whatever
//! was gathered. Exactly one terminal event per opened session — a
//! `Recording` (possibly empty), an error, or `Cancelled` when closed early.
//! The wall-clock bound holds even if the device goes quiet: the thread polls
//! with `recv_timeout`, never a bare blocking receive.

use crate::audio::{AudioChunk, AudioConfig, CaptureDevice, CaptureHandle};
use crate::conversation::Recording;
use crate::error::{VoiceError, VoiceResult};
use crate::vad::GateKind;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Endpointer configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Silence after speech that commits the turn (default 800ms).
    pub silence_gap: Duration,
    /// Minimum voiced span for a valid turn (default 200ms); shorter blips
    /// are dropped and listening continues.
    pub min_speech: Duration,
    /// Hard bound on one capture (default 30s). Reaching it force-completes
    /// the session with whatever audio was gathered — the cycle never stalls
    /// on a user who does not stop talking.
    pub max_utterance: Duration,
    /// Which voiced/silent gate to run (default WebRTC VAD, mode 2).
    pub gate: GateKind,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            silence_gap: Duration::from_millis(800),
            min_speech: Duration::from_millis(200),
            max_utterance: Duration::from_secs(30),
            gate: GateKind::default(),
        }
    }
}

/// Terminal event of a capture session, tagged with the session generation
/// so the controller can drop events from superseded sessions.
#[derive(Debug)]
pub struct CaptureEnd {
    pub generation: u64,
    pub result: VoiceResult<Recording>,
}

/// A running capture. Owns the device handle and the endpointer thread;
/// `close()` releases both unconditionally and is idempotent.
pub struct CaptureSession {
    generation: u64,
    device_handle: Option<Box<dyn CaptureHandle>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CaptureSession {
    /// Acquire the device and start endpointing. Device acquisition errors
    /// (`DeviceUnavailable`, `PermissionDenied`) surface here, before any
    /// state changes.
    pub fn start(
        device: &dyn CaptureDevice,
        audio: &AudioConfig,
        config: &CaptureConfig,
        generation: u64,
        done: UnboundedSender<CaptureEnd>,
    ) -> VoiceResult<Self> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>();
        let device_handle = device.open(audio, chunk_tx)?;

        let config = config.clone();
        let sample_rate = audio.sample_rate;
        let chunk_size = audio.chunk_size;
        let worker = thread::Builder::new()
            .name("parley-endpoint".to_string())
            .spawn(move || {
                let result = run_endpointer(&chunk_rx, &config, sample_rate, chunk_size);
                if done.send(CaptureEnd { generation, result }).is_err() {
                    debug!(generation, "capture terminal event had no listener");
                }
            })
            .map_err(|e| VoiceError::Io(e.to_string()))?;

        info!(generation, "capture session open");
        Ok(Self {
            generation,
            device_handle: Some(device_handle),
            worker: Some(worker),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Release the device and join the endpointer. Idempotent; closing an
    /// already-closed session is a no-op.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.device_handle.take() {
            handle.close();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            info!(generation = self.generation, "capture session closed");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    /// No speech yet.
    Waiting,
    /// Speech in progress; chunks are buffered.
    Voiced,
    /// Speech paused; counting silence toward the gap threshold.
    Gap,
}

fn run_endpointer(
    chunks: &mpsc::Receiver<AudioChunk>,
    config: &CaptureConfig,
    sample_rate: u32,
    chunk_size: usize,
) -> VoiceResult<Recording> {
    let mut gate = config.gate.build(sample_rate, chunk_size)?;
    let chunk_duration = Duration::from_secs_f64(chunk_size as f64 / sample_rate as f64);
    let opened_at = Instant::now();

    let mut state = EndpointState::Waiting;
    let mut buffer: Vec<f32> = Vec::new();
    let mut speech_started: Option<Instant> = None;
    let mut last_voiced: Option<Instant> = None;

    loop {
        let elapsed = opened_at.elapsed();
        if elapsed >= config.max_utterance {
            debug!(
                buffered = buffer.len(),
                "max utterance reached, force-completing"
            );
            return Recording::from_samples(&buffer, sample_rate);
        }
        let poll = (config.max_utterance - elapsed).min(Duration::from_millis(30));

        match chunks.recv_timeout(poll) {
            Ok(chunk) => {
                let voiced = match gate.is_voiced(&chunk.samples) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("gate error, treating frame as silence: {}", e);
                        false
                    }
                };
                let now = Instant::now();
                match (state, voiced) {
                    (EndpointState::Waiting, true) => {
                        debug!("speech started");
                        state = EndpointState::Voiced;
                        speech_started = Some(now);
                        last_voiced = Some(now);
                        buffer.extend_from_slice(&chunk.samples);
                    }
                    (EndpointState::Waiting, false) => {}
                    (EndpointState::Voiced, true) => {
                        last_voiced = Some(now);
                        buffer.extend_from_slice(&chunk.samples);
                    }
                    (EndpointState::Voiced, false) => {
                        // Keep the buffer; silence is not recorded.
                        state = EndpointState::Gap;
                    }
                    (EndpointState::Gap, true) => {
                        state = EndpointState::Voiced;
                        last_voiced = Some(now);
                        buffer.extend_from_slice(&chunk.samples);
                    }
                    (EndpointState::Gap, false) => {}
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // Device closed under us: the session was superseded.
                return Err(VoiceError::Cancelled);
            }
        }

        if state == EndpointState::Gap {
            if let (Some(started), Some(last)) = (speech_started, last_voiced) {
                if last.elapsed() >= config.silence_gap {
                    let voiced_span = last.duration_since(started) + chunk_duration;
                    if voiced_span < config.min_speech {
                        debug!(?voiced_span, "speech too short, ignoring");
                        state = EndpointState::Waiting;
                        buffer.clear();
                        speech_started = None;
                        last_voiced = None;
                    } else {
                        debug!(
                            ?voiced_span,
                            samples = buffer.len(),
                            "silence gap reached, committing turn"
                        );
                        return Recording::from_samples(&buffer, sample_rate);
                    }
                }
            }
        }
    }
}
