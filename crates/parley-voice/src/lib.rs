//! # Parley Voice — turn-taking core for a conversational voice interface
//!
//! The user speaks, the turn is captured and sent to a remote assistant,
//! the reply is played back, and (in continuous mode) the cycle re-arms for
//! hands-free dialog. The heart of the crate is the [`TurnController`]: a
//! single state-machine actor per conversation that decides when the
//! microphone is open, when a round-trip is in flight, when playback owns
//! the output device, and how the cycle restarts.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TurnController                          │
//! │  ┌───────────────┐   ┌────────────────┐   ┌───────────────┐ │
//! │  │ CaptureSession│ → │ RemoteAssistant │ → │PlaybackSession│ │
//! │  │ (cpal + VAD)  │   │ (reqwest, STT/  │   │    (rodio)    │ │
//! │  │               │   │  chat/TTS)      │   │               │ │
//! │  └───────────────┘   └────────────────┘   └───────────────┘ │
//! │          ▲                                        │          │
//! │          └──────── continuous-mode re-arm ────────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Capture and playback are never active at the same time, at most one
//! exchange is in flight, and `disable_voice_mode` cancels from any state
//! with stale results discarded by request id.

pub mod assistant;
pub mod audio;
pub mod capture;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod playback;
pub mod vad;

pub use assistant::{AssistantBackend, AssistantConfig, PlaceholderAssistant, RemoteAssistant};
pub use audio::{
    list_input_devices, AudioChunk, AudioConfig, CaptureDevice, CaptureHandle, MicrophoneInput,
    PlaceholderMicrophone, PlaceholderSpeaker, PlaybackSink, SpeakerOutput,
};
pub use capture::{CaptureConfig, CaptureSession};
pub use config::VoiceConfig;
pub use controller::{ConversationHandle, SessionEvent, TurnController};
pub use conversation::{
    AudioEncoding, ConversationState, Exchange, Recording, RoundTripMetrics, Utterance,
};
pub use error::{VoiceError, VoiceResult};
pub use playback::PlaybackSession;
pub use vad::{EnergyGate, GateKind, SpeechGate, WebRtcGate};
