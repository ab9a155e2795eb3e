//! Voice demo — full hands-free loop on real devices.
//!
//! Speak into the default microphone; the turn is transcribed, answered, and
//! the reply is played back, then capture re-arms. Set `ASSISTANT_API_KEY`
//! (or `OPENAI_API_KEY`) in `.env` for real replies; without keys the
//! placeholder assistant echoes the turn as text.

use parley_voice::{
    AssistantBackend, MicrophoneInput, PlaceholderAssistant, RemoteAssistant, SessionEvent,
    SpeakerOutput, TurnController, VoiceConfig,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Parley voice demo — capture → round-trip → playback, hands-free");
    info!("Press Ctrl+C to stop.");

    let config = VoiceConfig::from_env().unwrap_or_default();
    let assistant: Arc<dyn AssistantBackend> = match RemoteAssistant::from_env() {
        Ok(remote) => {
            info!("using remote assistant (transcription + chat + synthesis)");
            Arc::new(remote)
        }
        Err(e) => {
            info!("no API key ({}), using placeholder echo assistant", e);
            Arc::new(PlaceholderAssistant::new())
        }
    };

    let handle = TurnController::spawn(
        config,
        Arc::new(MicrophoneInput::new()),
        Arc::new(SpeakerOutput::new()?),
        assistant,
    );
    let mut events = handle.subscribe();

    handle.enable_voice_mode().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { to, .. }) => info!("state: {}", to.as_str()),
                Ok(SessionEvent::ExchangeCompleted(exchange)) => {
                    info!("you: {}", exchange.user_text);
                    info!("assistant: {}", exchange.assistant_text);
                }
                Ok(SessionEvent::Error(error)) => info!("error: {}", error),
                Err(_) => continue,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.disable_voice_mode().await?;
    Ok(())
}
