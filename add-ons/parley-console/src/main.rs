//! Parley console — terminal chat client over the voice core.
//!
//! Usage:
//!   cargo run -p parley-console [-- --placeholder] [--once] [--devices]
//!
//! Type a line to send a text turn. `/voice` toggles hands-free voice mode,
//! `/history` prints the conversation so far, `/quit` exits. Set
//! `ASSISTANT_API_KEY` (or `OPENAI_API_KEY`) in `.env` for real replies;
//! without keys a placeholder assistant echoes you.

use anyhow::Result;
use parley_voice::{
    list_input_devices, AssistantBackend, CaptureDevice, ConversationHandle, ConversationState,
    Exchange, MicrophoneInput, PlaceholderAssistant, PlaceholderMicrophone, PlaceholderSpeaker,
    PlaybackSink, RemoteAssistant, SessionEvent, SpeakerOutput, TurnController, VoiceConfig,
    VoiceError,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn usage() {
    eprintln!("Parley — conversational voice console");
    eprintln!("  --placeholder     No audio hardware or API keys required");
    eprintln!("  --once            One turn per /voice (no hands-free loop)");
    eprintln!("  --devices         List input devices and exit");
    eprintln!();
    eprintln!("Commands: /voice toggles voice mode, /history prints the");
    eprintln!("conversation, /quit exits. Anything else is sent as text.");
    eprintln!();
    eprintln!("Env: ASSISTANT_API_KEY or OPENAI_API_KEY for real replies;");
    eprintln!("ASSISTANT_API_URL, CHAT_MODEL, STT_MODEL, TTS_MODEL, TTS_VOICE,");
    eprintln!("PARLEY_CONTINUOUS, PARLEY_SILENCE_GAP_MS, PARLEY_MAX_UTTERANCE_SECS.");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut placeholder = false;
    let mut once = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--placeholder" => placeholder = true,
            "--once" => once = true,
            "--devices" => {
                match list_input_devices() {
                    Ok(devices) if devices.is_empty() => println!("no input devices found"),
                    Ok(devices) => {
                        for name in devices {
                            println!("{}", name);
                        }
                    }
                    Err(e) => println!("device enumeration failed: {}", e),
                }
                return Ok(());
            }
            _ => {
                usage();
                return Ok(());
            }
        }
    }

    let mut config = match VoiceConfig::from_env() {
        Ok(config) => config,
        Err(_) => {
            println!("(no API key found — using placeholder assistant; set ASSISTANT_API_KEY for real replies)");
            placeholder = true;
            VoiceConfig::default()
        }
    };
    if once {
        config.continuous = false;
    }

    let assistant: Arc<dyn AssistantBackend> = if placeholder {
        Arc::new(PlaceholderAssistant::new())
    } else {
        match RemoteAssistant::new(config.assistant.clone()) {
            Ok(remote) => Arc::new(remote),
            Err(e) => {
                info!("falling back to placeholder assistant: {}", e);
                Arc::new(PlaceholderAssistant::new())
            }
        }
    };

    let microphone: Arc<dyn CaptureDevice> = if placeholder {
        Arc::new(PlaceholderMicrophone::mute())
    } else {
        Arc::new(MicrophoneInput::new())
    };
    let speaker: Arc<dyn PlaybackSink> = if placeholder {
        Arc::new(PlaceholderSpeaker::new())
    } else {
        match SpeakerOutput::new() {
            Ok(speaker) => Arc::new(speaker),
            Err(e) => {
                println!("(no output device: {} — replies will be text-only)", e);
                Arc::new(PlaceholderSpeaker::new())
            }
        }
    };

    let handle = TurnController::spawn(config, microphone, speaker, assistant);
    let mut events = handle.subscribe();

    println!("parley ready — /voice for hands-free mode, /quit to exit");

    // The console owns the append-only history; the core only emits
    // exchanges.
    let mut history: Vec<Exchange> = Vec::new();
    let mut voice_on = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { to, .. }) => {
                    if to == ConversationState::Idle {
                        // Idle always means voice mode is off (one-shot mode
                        // drops back here by itself).
                        voice_on = false;
                    }
                    println!("  [{}]", to.as_str());
                }
                Ok(SessionEvent::ExchangeCompleted(exchange)) => {
                    println!("you: {}", exchange.user_text);
                    println!("parley: {}", exchange.assistant_text);
                    history.push(exchange);
                }
                Ok(SessionEvent::Error(error)) => {
                    println!("  [error: {}]", error);
                }
                Err(_) => continue,
            },
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break, // stdin closed
                };
                match line.trim() {
                    "" => {}
                    "/quit" | "/q" => break,
                    "/history" => print_history(&history),
                    "/voice" => {
                        if voice_on {
                            handle.disable_voice_mode().await.ok();
                            voice_on = false;
                            println!("  [voice mode off]");
                        } else {
                            match handle.enable_voice_mode().await {
                                Ok(()) => {
                                    voice_on = true;
                                    println!("  [voice mode on — speak, pause to send]");
                                }
                                Err(e) => println!("  [cannot enable voice mode: {}]", e),
                            }
                        }
                    }
                    text => match handle.send_text(text).await {
                        Ok(()) => {}
                        Err(VoiceError::Busy) => {
                            println!("  [still working on the previous turn]");
                        }
                        Err(e) => println!("  [send failed: {}]", e),
                    },
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    disable_and_exit(&handle).await;
    Ok(())
}

fn print_history(history: &[Exchange]) {
    if history.is_empty() {
        println!("  (no exchanges yet)");
        return;
    }
    for exchange in history {
        println!(
            "  #{} [{}] you: {}",
            exchange.request_id,
            exchange.started_at.format("%H:%M:%S"),
            exchange.user_text
        );
        println!("      parley: {}", exchange.assistant_text);
        if let Ok(metrics) = serde_json::to_string(&exchange.metrics) {
            println!("      {}", metrics);
        }
    }
}

async fn disable_and_exit(handle: &ConversationHandle) {
    let _ = handle.disable_voice_mode().await;
    println!("bye");
}
