//! **PlaybackSession** — plays one synthesized reply to completion or
//! interruption.
//!
//! Thin lifecycle wrapper over a `PlaybackSink`: exactly one terminal event
//! per `start`, tagged with a generation so the controller can drop events
//! from a playback it has already abandoned. A playback failure is reported
//! like a completion — the conversation must continue rather than hang
//! waiting for an event that will never fire.

use crate::audio::PlaybackSink;
use crate::error::{VoiceError, VoiceResult};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Terminal event of one playback, tagged with its generation.
#[derive(Debug)]
pub struct PlaybackEnd {
    pub generation: u64,
    pub result: VoiceResult<()>,
}

/// One running playback.
pub struct PlaybackSession {
    generation: u64,
    sink: Arc<dyn PlaybackSink>,
}

impl PlaybackSession {
    /// Hand `audio` to the sink and forward its single terminal event onto
    /// `done`. Starting a new session implicitly stops anything the sink was
    /// still playing (the controller never overlaps two by construction).
    pub fn start(
        sink: Arc<dyn PlaybackSink>,
        audio: Vec<u8>,
        generation: u64,
        done: UnboundedSender<PlaybackEnd>,
    ) -> VoiceResult<Self> {
        let (end_tx, end_rx) = oneshot::channel::<VoiceResult<()>>();
        sink.play(audio, end_tx)?;
        info!(generation, "playback started");

        tokio::spawn(async move {
            let result = end_rx
                .await
                .unwrap_or_else(|_| Err(VoiceError::ChannelClosed("playback sink dropped".to_string())));
            if done.send(PlaybackEnd { generation, result }).is_err() {
                debug!(generation, "playback terminal event had no listener");
            }
        });

        Ok(Self { generation, sink })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop immediately; no further audio is emitted after this returns.
    /// Idempotent.
    pub fn stop(&self) {
        self.sink.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PlaceholderSpeaker;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn forwards_single_terminal_event() {
        let sink: Arc<dyn PlaybackSink> = Arc::new(PlaceholderSpeaker::new());
        let (done_tx, mut done_rx) = unbounded_channel();

        let session = PlaybackSession::start(sink, vec![0u8; 16], 5, done_tx).unwrap();
        let end = done_rx.recv().await.unwrap();
        assert_eq!(end.generation, 5);
        assert_eq!(end.result, Ok(()));
        session.stop();
        session.stop(); // idempotent
    }
}
