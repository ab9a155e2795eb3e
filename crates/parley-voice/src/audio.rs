//! Device layer: microphone capture and speaker playback.
//!
//! The `CaptureDevice` / `PlaybackSink` traits are the replaceable-backend
//! seams; `MicrophoneInput` (cpal) and `SpeakerOutput` (rodio) are the real
//! devices, and the `Placeholder*` types stand in on machines without audio
//! hardware. cpal streams and rodio output streams are not `Send`, so each
//! real device runs on a dedicated thread and talks over channels.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Audio capture configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate chunks are delivered at (default 16000). Hardware running
    /// at another rate is resampled.
    pub sample_rate: u32,
    /// Chunk size in samples (default 480 = 30ms at 16kHz, the frame size
    /// WebRTC VAD expects).
    pub chunk_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            chunk_size: 480,
        }
    }
}

/// One fixed-size block of mono PCM from the capture device.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Samples (f32, -1.0..1.0), always `chunk_size` long.
    pub samples: Vec<f32>,
    /// When the chunk was assembled.
    pub captured_at: Instant,
}

/// A source of microphone audio. `open` acquires exclusive access to the
/// device and starts delivering fixed-size chunks; the returned handle keeps
/// the device open until closed.
pub trait CaptureDevice: Send + Sync {
    fn open(
        &self,
        config: &AudioConfig,
        chunks: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureHandle>>;
}

/// Keeps a capture stream alive. `close` releases the device unconditionally
/// and is idempotent; dropping the handle closes too.
pub trait CaptureHandle: Send {
    fn close(&mut self);
}

/// A sink for encoded reply audio. `play` starts asynchronously and `done`
/// receives exactly one terminal event per invocation; `stop` is idempotent
/// and guarantees no further audio after it returns.
pub trait PlaybackSink: Send + Sync {
    fn play(&self, audio: Vec<u8>, done: oneshot::Sender<VoiceResult<()>>) -> VoiceResult<()>;
    fn stop(&self);
    fn is_active(&self) -> bool;
}

/// List available input device names (diagnostics).
pub fn list_input_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices()?;
    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

// ---------------------------------------------------------------------------
// Microphone (cpal)
// ---------------------------------------------------------------------------

/// The default host microphone. Captures at whatever format the hardware
/// offers and downmixes/resamples to mono at the configured rate.
#[derive(Debug, Default)]
pub struct MicrophoneInput;

impl MicrophoneInput {
    pub fn new() -> Self {
        Self
    }
}

struct MicrophoneHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle for MicrophoneHandle {
    fn close(&mut self) {
        // Dropping the stop sender unparks the stream thread, which drops
        // the cpal stream and with it the chunk sender.
        self.stop_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MicrophoneHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl CaptureDevice for MicrophoneInput {
    fn open(
        &self,
        config: &AudioConfig,
        chunks: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureHandle>> {
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let config = config.clone();

        // The stream must be built and owned on one thread: cpal streams are
        // not Send on every backend.
        let worker = thread::Builder::new()
            .name("parley-mic".to_string())
            .spawn(move || {
                let stream = match build_mic_stream(&config, chunks) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until the handle is closed or dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| VoiceError::Io(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(MicrophoneHandle {
                stop_tx: Some(stop_tx),
                worker: Some(worker),
            })),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(VoiceError::ChannelClosed("microphone thread died".to_string()))
            }
        }
    }
}

fn build_mic_stream(
    config: &AudioConfig,
    chunks: mpsc::Sender<AudioChunk>,
) -> VoiceResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("no input device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device.default_input_config()?;
    let source_rate = supported.sample_rate().0;
    let source_channels = supported.channels() as usize;
    let stream_config: StreamConfig = supported.clone().into();

    info!(
        device = %name,
        source_rate,
        source_channels,
        target_rate = config.sample_rate,
        "microphone open"
    );

    let target_rate = config.sample_rate;
    let chunk_size = config.chunk_size;
    let mut pending: Vec<f32> = Vec::with_capacity(chunk_size * 2);

    let mut on_samples = move |data: &[f32]| {
        pending.extend(downmix_resample(data, source_channels, source_rate, target_rate));
        while pending.len() >= chunk_size {
            let chunk: Vec<f32> = pending.drain(..chunk_size).collect();
            if chunks
                .send(AudioChunk {
                    samples: chunk,
                    captured_at: Instant::now(),
                })
                .is_err()
            {
                // Receiver gone: the session is over, keep the stream quiet.
                pending.clear();
                break;
            }
        }
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
            |err| warn!("microphone stream error: {}", err),
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let f32_samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                on_samples(&f32_samples);
            },
            |err| warn!("microphone stream error: {}", err),
            None,
        )?,
        other => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "unsupported sample format {:?} (need F32 or I16)",
                other
            )))
        }
    };

    stream.play()?;
    Ok(stream)
}

/// Convert interleaved multi-channel audio at any rate to mono at `to_rate`
/// (nearest-sample pick; endpointing does not need band-limited resampling).
fn downmix_resample(samples: &[f32], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if channels == 0 || samples.is_empty() {
        return Vec::new();
    }
    let mono: Vec<f32> = if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    if from_rate == to_rate {
        return mono;
    }
    let out_len = (mono.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = (i as f64 * from_rate as f64 / to_rate as f64) as usize;
        if src >= mono.len() {
            break;
        }
        out.push(mono[src]);
    }
    out
}

// ---------------------------------------------------------------------------
// Speaker (rodio)
// ---------------------------------------------------------------------------

enum SpeakerCommand {
    Play {
        bytes: Vec<u8>,
        done: oneshot::Sender<VoiceResult<()>>,
    },
}

/// The default host output device. A worker thread owns the rodio output
/// stream; the current sink is shared so `stop` works from any thread.
pub struct SpeakerOutput {
    cmd_tx: mpsc::Sender<SpeakerCommand>,
    current: Arc<Mutex<Option<Arc<rodio::Sink>>>>,
}

impl SpeakerOutput {
    pub fn new() -> VoiceResult<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<SpeakerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<VoiceResult<()>>();
        let current: Arc<Mutex<Option<Arc<rodio::Sink>>>> = Arc::new(Mutex::new(None));
        let current_worker = Arc::clone(&current);

        thread::Builder::new()
            .name("parley-speaker".to_string())
            .spawn(move || {
                let (stream, handle) = match rodio::OutputStream::try_default() {
                    Ok(pair) => {
                        let _ = ready_tx.send(Ok(()));
                        pair
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::PlaybackFailed(e.to_string())));
                        return;
                    }
                };
                let _stream = stream; // keep the output stream alive
                while let Ok(SpeakerCommand::Play { bytes, done }) = cmd_rx.recv() {
                    let outcome = play_one(&handle, bytes, &current_worker);
                    let _ = done.send(outcome);
                }
                debug!("speaker worker exiting");
            })
            .map_err(|e| VoiceError::Io(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { cmd_tx, current }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::ChannelClosed("speaker thread died".to_string())),
        }
    }
}

fn play_one(
    handle: &rodio::OutputStreamHandle,
    bytes: Vec<u8>,
    current: &Arc<Mutex<Option<Arc<rodio::Sink>>>>,
) -> VoiceResult<()> {
    use rodio::Source;

    let sink = rodio::Sink::try_new(handle)
        .map_err(|e| VoiceError::PlaybackFailed(e.to_string()))?;
    let source = rodio::Decoder::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::PlaybackFailed(format!("decode failed: {}", e)))?;
    let sink = Arc::new(sink);
    sink.append(source.convert_samples::<f32>());
    *current.lock().unwrap() = Some(Arc::clone(&sink));
    // Blocks until the queue drains — naturally, or because stop() cleared it.
    sink.sleep_until_end();
    *current.lock().unwrap() = None;
    Ok(())
}

impl PlaybackSink for SpeakerOutput {
    fn play(&self, audio: Vec<u8>, done: oneshot::Sender<VoiceResult<()>>) -> VoiceResult<()> {
        // A superseding play stops whatever is still queued.
        self.stop();
        self.cmd_tx
            .send(SpeakerCommand::Play { bytes: audio, done })
            .map_err(|_| VoiceError::ChannelClosed("speaker worker gone".to_string()))
    }

    fn stop(&self) {
        if let Some(sink) = self.current.lock().unwrap().as_ref() {
            sink.stop();
        }
    }

    fn is_active(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|sink| !sink.empty())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Placeholders (no audio hardware required)
// ---------------------------------------------------------------------------

/// Capture device for machines without a microphone: feeds a scripted
/// sequence of chunks into the endpointer, then silence (or nothing at all
/// for `mute()`), until closed.
pub struct PlaceholderMicrophone {
    frames: Vec<Vec<f32>>,
    interval: Duration,
    silence_after: bool,
}

impl PlaceholderMicrophone {
    /// Play `frames` once, then emit silence until closed.
    pub fn new(frames: Vec<Vec<f32>>) -> Self {
        Self {
            frames,
            interval: Duration::from_millis(30),
            silence_after: true,
        }
    }

    /// Emit nothing at all: the capture only ends via its duration bound.
    pub fn mute() -> Self {
        Self {
            frames: Vec::new(),
            interval: Duration::from_millis(30),
            silence_after: false,
        }
    }

    /// Delivery interval between chunks (default 30ms; tests shrink this).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

struct PlaceholderHandle {
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle for PlaceholderHandle {
    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl CaptureDevice for PlaceholderMicrophone {
    fn open(
        &self,
        config: &AudioConfig,
        chunks: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<Box<dyn CaptureHandle>> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_worker = Arc::clone(&stop);
        let frames = self.frames.clone();
        let interval = self.interval;
        let silence_after = self.silence_after;
        let chunk_size = config.chunk_size;

        let worker = thread::Builder::new()
            .name("parley-placeholder-mic".to_string())
            .spawn(move || {
                for frame in frames {
                    if stop_worker.load(Ordering::Relaxed) {
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
                while !stop_worker.load(Ordering::Relaxed) {
                    if silence_after {
                        if chunks
                            .send(AudioChunk {
                                samples: vec![0.0; chunk_size],
                                captured_at: Instant::now(),
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(|e| VoiceError::Io(e.to_string()))?;

        Ok(Box::new(PlaceholderHandle {
            stop,
            worker: Some(worker),
        }))
    }
}

/// Playback sink that plays nothing: reports completion after an optional
/// artificial latency. Stands in for `SpeakerOutput` in tests and demos.
#[derive(Clone)]
pub struct PlaceholderSpeaker {
    latency: Duration,
    active: Arc<AtomicBool>,
}

impl Default for PlaceholderSpeaker {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderSpeaker {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pretend each reply takes this long to play out.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl PlaybackSink for PlaceholderSpeaker {
    fn play(&self, _audio: Vec<u8>, done: oneshot::Sender<VoiceResult<()>>) -> VoiceResult<()> {
        self.active.store(true, Ordering::Relaxed);
        let latency = self.latency;
        let active = Arc::clone(&self.active);
        thread::spawn(move || {
            if !latency.is_zero() {
                thread::sleep(latency);
            }
            active.store(false, Ordering::Relaxed);
            let _ = done.send(Ok(()));
        });
        Ok(())
    }

    fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.chunk_size, 480);
    }

    #[test]
    fn downmix_stereo_to_mono() {
        let stereo = vec![1.0, 0.0, 1.0, 0.0];
        let mono = downmix_resample(&stereo, 2, 16000, 16000);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn resample_halves_sample_count() {
        let samples = vec![0.1f32; 320];
        let out = downmix_resample(&samples, 1, 32000, 16000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn placeholder_microphone_delivers_script_then_silence() {
        let config = AudioConfig::default();
        let (tx, rx) = mpsc::channel();
        let mic = PlaceholderMicrophone::new(vec![vec![0.5; 480], vec![0.5; 480]])
            .with_interval(Duration::from_millis(1));
        let mut handle = mic.open(&config, tx).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.samples.len(), 480);
        assert!(first.samples.iter().any(|&s| s != 0.0));

        // Drain past the script; eventually silence chunks arrive.
        let mut saw_silence = false;
        for _ in 0..16 {
            let chunk = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            if chunk.samples.iter().all(|&s| s == 0.0) {
                saw_silence = true;
                break;
            }
        }
        assert!(saw_silence);
        handle.close();
        handle.close(); // idempotent
    }

    #[tokio::test]
    async fn placeholder_speaker_reports_completion() {
        let speaker = PlaceholderSpeaker::new();
        let (done_tx, done_rx) = oneshot::channel();
        speaker.play(vec![1, 2, 3], done_tx).unwrap();
        assert_eq!(done_rx.await.unwrap(), Ok(()));
        assert!(!speaker.is_active());
    }
}
