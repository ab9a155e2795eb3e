//! Conversation data model: states, recordings, utterances, exchanges.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Cursor;
use std::time::Duration;

/// State of one conversation. Owned by the `TurnController`; mutated only by
/// its transition function. `Idle` is both the initial state and the state of
/// a disabled conversation, and is always re-enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConversationState {
    /// Nothing in flight; voice mode disabled.
    Idle,
    /// Microphone open, endpointer running.
    Capturing,
    /// A round-trip for a captured recording is in flight.
    Transcribing,
    /// A round-trip for a text turn is in flight (no capture involved).
    AwaitingReply,
    /// Reply audio owns the output device.
    Speaking,
    /// Cancellation requested; resources being released.
    Stopping,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Capturing => "capturing",
            ConversationState::Transcribing => "transcribing",
            ConversationState::AwaitingReply => "awaiting_reply",
            ConversationState::Speaking => "speaking",
            ConversationState::Stopping => "stopping",
        }
    }
}

/// Declared encoding of a `Recording`'s byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// RIFF WAV, 16-bit PCM, mono.
    WavPcm16,
}

impl AudioEncoding {
    pub fn mime(&self) -> &'static str {
        match self {
            AudioEncoding::WavPcm16 => "audio/wav",
        }
    }
}

/// One finished capture: an immutable encoded byte sequence plus its declared
/// encoding and duration. Produced by `CaptureSession` on its terminal event
/// and consumed exactly once by the round-trip; never retained afterwards.
#[derive(Debug, Clone)]
pub struct Recording {
    bytes: Vec<u8>,
    encoding: AudioEncoding,
    duration: Duration,
    sample_rate: u32,
}

impl Recording {
    /// Encode captured PCM (f32, -1.0..1.0, mono) as 16-bit WAV.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> VoiceResult<Self> {
        let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);
        let mut bytes = Vec::with_capacity(44 + samples.len() * 2);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| VoiceError::Io(e.to_string()))?;
        for &s in samples {
            let clamped = s.clamp(-1.0, 1.0);
            writer
                .write_sample((clamped * 32767.0).round() as i16)
                .map_err(|e| VoiceError::Io(e.to_string()))?;
        }
        writer.finalize().map_err(|e| VoiceError::Io(e.to_string()))?;
        Ok(Self {
            bytes,
            encoding: AudioEncoding::WavPcm16,
            duration,
            sample_rate,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// True when no voiced audio was gathered. Empty recordings never
    /// trigger a round-trip.
    pub fn is_empty(&self) -> bool {
        self.duration.is_zero()
    }
}

/// What a round-trip carries to the remote capability.
#[derive(Debug, Clone)]
pub enum Utterance {
    Voice(Recording),
    Text(String),
}

/// Per-phase round-trip latency, for the presentation layer's diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundTripMetrics {
    pub transcribe_ms: u64,
    pub chat_ms: u64,
    pub synthesize_ms: u64,
    pub total_ms: u64,
}

/// One completed request/response exchange with the assistant. Appended to
/// the presentation layer's history on success; failed round-trips are
/// surfaced as errors and never recorded as exchanges.
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    /// Monotonic id assigned at dispatch; results with an id other than the
    /// latest dispatched one are stale and discarded.
    pub request_id: u64,
    /// The user's side: transcript of the captured turn, or the text sent.
    pub user_text: String,
    pub assistant_text: String,
    /// Synthesized reply audio, when synthesis is enabled and produced any.
    #[serde(skip)]
    pub assistant_audio: Option<Vec<u8>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub metrics: RoundTripMetrics,
}
