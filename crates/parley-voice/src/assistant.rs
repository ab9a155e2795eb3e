//! **Assistant round-trip** — one request/response exchange with the remote
//! assistant capability.
//!
//! `RemoteAssistant` talks to any OpenAI-compatible API: captured turns go
//! through `/audio/transcriptions`, the transcript (or typed text) through
//! `/chat/completions`, and the reply optionally through `/audio/speech` for
//! synthesized audio. Every failure along the way maps to `RoundTripFailed` —
//! the caller recovers identically no matter which leg broke. Calls are
//! tagged with the monotonic request id the controller assigned, so stale
//! results can be discarded after cancellation or supersession.

use crate::conversation::{Exchange, Recording, RoundTripMetrics, Utterance};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Remote capability configuration. One base URL + bearer key covers all
/// three endpoints.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Base URL without trailing slash (default `https://api.openai.com/v1`).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Chat model (default `gpt-4o-mini`).
    pub chat_model: String,
    /// Transcription model (default `whisper-1`).
    pub stt_model: String,
    /// Synthesis model (default `tts-1`).
    pub tts_model: String,
    /// Synthesis voice (default `alloy`).
    pub tts_voice: String,
    /// When false, replies are text-only and playback is skipped.
    pub synthesize: bool,
    /// System prompt for the chat leg.
    pub system_prompt: String,
    /// Per-request timeout (default 60s).
    pub request_timeout: Duration,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            chat_model: "gpt-4o-mini".to_string(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            synthesize: true,
            system_prompt: "You are a helpful voice assistant. Keep replies short and \
                            conversational; they will be spoken aloud."
                .to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl AssistantConfig {
    /// Build from environment: `ASSISTANT_API_URL`, `ASSISTANT_API_KEY`
    /// (falls back to `OPENAI_API_KEY`), `CHAT_MODEL`, `STT_MODEL`,
    /// `TTS_MODEL`, `TTS_VOICE`, `PARLEY_SYNTHESIZE`.
    pub fn from_env() -> VoiceResult<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("ASSISTANT_API_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        let api_key = std::env::var("ASSISTANT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config(
                    "assistant requires ASSISTANT_API_KEY or OPENAI_API_KEY".to_string(),
                )
            })?;
        let api_key = api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(VoiceError::Config("assistant API key is empty".to_string()));
        }
        config.api_key = api_key;
        if let Ok(model) = std::env::var("CHAT_MODEL") {
            config.chat_model = model;
        }
        if let Ok(model) = std::env::var("STT_MODEL") {
            config.stt_model = model;
        }
        if let Ok(model) = std::env::var("TTS_MODEL") {
            config.tts_model = model;
        }
        if let Ok(voice) = std::env::var("TTS_VOICE") {
            config.tts_voice = voice;
        }
        if let Ok(v) = std::env::var("PARLEY_SYNTHESIZE") {
            config.synthesize = !matches!(v.trim(), "0" | "false" | "no");
        }
        Ok(config)
    }
}

/// One full round-trip: utterance in, finalized `Exchange` out. Asynchronous
/// and non-blocking; abandonment is handled by the caller's staleness check,
/// not by tearing the connection down.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn round_trip(&self, request_id: u64, utterance: Utterance) -> VoiceResult<Exchange>;
}

// OpenAI-compatible chat request/response wire types.
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Serialize)]
struct SpeechRequest {
    model: String,
    input: String,
    voice: String,
}

/// Production backend against an OpenAI-compatible API.
pub struct RemoteAssistant {
    config: AssistantConfig,
    client: reqwest::Client,
}

impl RemoteAssistant {
    pub fn new(config: AssistantConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Build from environment (see `AssistantConfig::from_env`).
    pub fn from_env() -> VoiceResult<Self> {
        Self::new(AssistantConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn transcribe(&self, recording: &Recording) -> VoiceResult<String> {
        let part = reqwest::multipart::Part::bytes(recording.bytes().to_vec())
            .file_name("turn.wav")
            .mime_str(recording.encoding().mime())
            .map_err(|e| VoiceError::RoundTripFailed(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.stt_model.clone());

        let response = self
            .client
            .post(self.endpoint("audio/transcriptions"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::RoundTripFailed(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::RoundTripFailed(format!(
                "transcription API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VoiceError::RoundTripFailed(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }

    async fn chat(&self, user_text: &str) -> VoiceResult<String> {
        let body = ChatRequest {
            model: self.config.chat_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.config.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_text.to_string(),
                },
            ],
        };
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::RoundTripFailed(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::RoundTripFailed(format!(
                "chat API error {}: {}",
                status, body
            )));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::RoundTripFailed(format!("malformed chat response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| VoiceError::RoundTripFailed("chat response had no choices".to_string()))
    }

    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let body = SpeechRequest {
            model: self.config.tts_model.clone(),
            input: text.to_string(),
            voice: self.config.tts_voice.clone(),
        };
        let response = self
            .client
            .post(self.endpoint("audio/speech"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::RoundTripFailed(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::RoundTripFailed(format!(
                "speech API error {}: {}",
                status, body
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VoiceError::RoundTripFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl AssistantBackend for RemoteAssistant {
    async fn round_trip(&self, request_id: u64, utterance: Utterance) -> VoiceResult<Exchange> {
        let started_at = Utc::now();
        let t_total = Instant::now();
        let mut metrics = RoundTripMetrics::default();

        let user_text = match utterance {
            Utterance::Voice(recording) => {
                let t = Instant::now();
                let text = self.transcribe(&recording).await?;
                metrics.transcribe_ms = t.elapsed().as_millis() as u64;
                debug!(request_id, transcript = %text, "transcription done");
                text
            }
            Utterance::Text(text) => text,
        };

        let t = Instant::now();
        let assistant_text = self.chat(&user_text).await?;
        metrics.chat_ms = t.elapsed().as_millis() as u64;

        let assistant_audio = if self.config.synthesize && !assistant_text.is_empty() {
            let t = Instant::now();
            let bytes = self.synthesize(&assistant_text).await?;
            metrics.synthesize_ms = t.elapsed().as_millis() as u64;
            if bytes.is_empty() {
                None
            } else {
                Some(bytes)
            }
        } else {
            None
        };

        metrics.total_ms = t_total.elapsed().as_millis() as u64;
        Ok(Exchange {
            request_id,
            user_text,
            assistant_text,
            assistant_audio,
            started_at,
            completed_at: Utc::now(),
            metrics,
        })
    }
}

/// Placeholder backend: echoes the utterance with no audio. Use for demos
/// without API keys and for testing the turn cycle offline.
#[derive(Debug, Default)]
pub struct PlaceholderAssistant {
    /// If set, reply with this instead of the echo.
    pub reply: Option<String>,
    /// If set, attach these bytes as reply audio.
    pub audio: Option<Vec<u8>>,
}

impl PlaceholderAssistant {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssistantBackend for PlaceholderAssistant {
    async fn round_trip(&self, request_id: u64, utterance: Utterance) -> VoiceResult<Exchange> {
        let started_at = Utc::now();
        let user_text = match utterance {
            Utterance::Voice(recording) => format!(
                "[voice turn: {:.1}s of audio]",
                recording.duration().as_secs_f32()
            ),
            Utterance::Text(text) => text,
        };
        let assistant_text = self
            .reply
            .clone()
            .unwrap_or_else(|| format!("You said: {}", user_text.trim()));
        Ok(Exchange {
            request_id,
            user_text,
            assistant_text,
            assistant_audio: self.audio.clone(),
            started_at,
            completed_at: Utc::now(),
            metrics: RoundTripMetrics::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_echoes_text() {
        let assistant = PlaceholderAssistant::new();
        let exchange = assistant
            .round_trip(3, Utterance::Text("hello there".to_string()))
            .await
            .unwrap();
        assert_eq!(exchange.request_id, 3);
        assert_eq!(exchange.user_text, "hello there");
        assert_eq!(exchange.assistant_text, "You said: hello there");
        assert!(exchange.assistant_audio.is_none());
    }

    #[tokio::test]
    async fn placeholder_describes_voice_turns() {
        let assistant = PlaceholderAssistant::new();
        let recording = Recording::from_samples(&vec![0.1; 16000], 16000).unwrap();
        let exchange = assistant
            .round_trip(1, Utterance::Voice(recording))
            .await
            .unwrap();
        assert!(exchange.user_text.contains("1.0s"));
    }

    #[test]
    fn config_defaults() {
        let config = AssistantConfig::default();
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.stt_model, "whisper-1");
        assert!(config.synthesize);
    }
}
