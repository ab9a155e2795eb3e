//! Top-level voice configuration.
//!
//! Defaults work out of the box; `from_env()` layers environment overrides
//! on top. `.env` loading stays in binaries (dotenvy), not here.

use crate::assistant::AssistantConfig;
use crate::audio::AudioConfig;
use crate::capture::CaptureConfig;
use crate::error::VoiceResult;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for one conversation.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
    pub assistant: AssistantConfig,
    /// Continuous mode: automatically re-open capture after a reply
    /// finishes, enabling hands-free multi-turn dialog (default true).
    /// When false, one enable yields one turn and the conversation halts.
    pub continuous: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            capture: CaptureConfig::default(),
            assistant: AssistantConfig::default(),
            continuous: true,
        }
    }
}

impl VoiceConfig {
    /// Build from environment. Requires an assistant API key (see
    /// `AssistantConfig::from_env`); tuning knobs are optional:
    /// `PARLEY_CONTINUOUS`, `PARLEY_MAX_UTTERANCE_SECS`,
    /// `PARLEY_SILENCE_GAP_MS`.
    pub fn from_env() -> VoiceResult<Self> {
        let mut config = Self {
            assistant: AssistantConfig::from_env()?,
            ..Self::default()
        };
        config.continuous = env_flag("PARLEY_CONTINUOUS", true);
        if let Some(secs) = env_parse::<u64>("PARLEY_MAX_UTTERANCE_SECS") {
            config.capture.max_utterance = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_parse::<u64>("PARLEY_SILENCE_GAP_MS") {
            config.capture.silence_gap = Duration::from_millis(ms.max(100));
        }
        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_continuous() {
        let config = VoiceConfig::default();
        assert!(config.continuous);
        assert_eq!(config.capture.silence_gap, Duration::from_millis(800));
        assert_eq!(config.capture.max_utterance, Duration::from_secs(30));
    }

    #[test]
    fn env_flag_parses_negations() {
        std::env::set_var("PARLEY_TEST_FLAG_OFF", "false");
        assert!(!env_flag("PARLEY_TEST_FLAG_OFF", true));
        std::env::set_var("PARLEY_TEST_FLAG_ON", "1");
        assert!(env_flag("PARLEY_TEST_FLAG_ON", false));
        assert!(env_flag("PARLEY_TEST_FLAG_MISSING", true));
    }
}
