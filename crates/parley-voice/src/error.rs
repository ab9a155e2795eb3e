//! Error types for the Parley voice core.

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice turn-taking core.
///
/// `Clone + PartialEq` because errors are published to the presentation
/// layer on a broadcast channel and asserted on in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    /// The platform refused access to the microphone.
    #[error("microphone access denied")]
    PermissionDenied,

    /// No usable audio device, or the device went away mid-session.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Network failure, timeout, or malformed response from the remote
    /// assistant capability. One kind on purpose: the caller recovers the
    /// same way regardless of which leg of the round-trip broke.
    #[error("round-trip failed: {0}")]
    RoundTripFailed(String),

    /// Reply audio could not be decoded or played.
    #[error("playback failed: {0}")]
    PlaybackFailed(String),

    /// Internal tag for results that arrived after their request or session
    /// was abandoned. Dropped silently, never surfaced to the user.
    #[error("cancelled")]
    Cancelled,

    /// A command was rejected because an exchange is already in flight.
    #[error("conversation busy: an exchange is already in flight")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl VoiceError {
    /// Map a device-layer error message to `PermissionDenied` or
    /// `DeviceUnavailable`. cpal reports permission problems as
    /// backend-specific errors, so the message is all there is to go on.
    pub(crate) fn from_device_message(msg: String) -> Self {
        let lower = msg.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
            VoiceError::PermissionDenied
        } else {
            VoiceError::DeviceUnavailable(msg)
        }
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Io(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::from_device_message(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable("input device not available".to_string())
            }
            other => VoiceError::from_device_message(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_messages_map_to_permission_denied() {
        let e = VoiceError::from_device_message("Operation not permitted: permission denied".into());
        assert_eq!(e, VoiceError::PermissionDenied);
    }

    #[test]
    fn other_device_messages_map_to_unavailable() {
        let e = VoiceError::from_device_message("no such device".into());
        assert!(matches!(e, VoiceError::DeviceUnavailable(_)));
    }
}
