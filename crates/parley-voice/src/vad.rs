//! Voiced/silent frame classification for the capture endpointer.
//!
//! Two gates: `WebRtcGate` wraps WebRTC VAD (the default for real
//! microphones), `EnergyGate` is a plain RMS threshold (deterministic, no
//! model — the right gate for scripted and placeholder audio).

use crate::error::{VoiceError, VoiceResult};
use tracing::debug;
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Decides whether one fixed-size frame contains speech. Deliberately not
/// `Send`: WebRTC VAD holds a raw handle, so gates are built and used inside
/// the endpointer thread, never moved across threads.
pub trait SpeechGate {
    fn is_voiced(&mut self, frame: &[f32]) -> VoiceResult<bool>;
}

/// Which gate a capture session should build. The gate itself is constructed
/// inside the endpointer thread: WebRTC VAD is not `Send`.
#[derive(Debug, Clone)]
pub enum GateKind {
    /// WebRTC VAD; `mode` 0-3, 3 most aggressive.
    WebRtc { mode: u8 },
    /// RMS energy above `threshold` counts as speech.
    Energy { threshold: f32 },
}

impl Default for GateKind {
    fn default() -> Self {
        GateKind::WebRtc { mode: 2 }
    }
}

impl GateKind {
    pub(crate) fn build(
        &self,
        sample_rate: u32,
        frame_size: usize,
    ) -> VoiceResult<Box<dyn SpeechGate>> {
        match *self {
            GateKind::WebRtc { mode } => {
                Ok(Box::new(WebRtcGate::new(sample_rate, frame_size, mode)?))
            }
            GateKind::Energy { threshold } => Ok(Box::new(EnergyGate::new(threshold))),
        }
    }
}

/// RMS energy gate. Matches the frame decision to a fixed threshold
/// (default 0.01 works for normalized f32 microphone input).
pub struct EnergyGate {
    threshold: f32,
}

impl EnergyGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl SpeechGate for EnergyGate {
    fn is_voiced(&mut self, frame: &[f32]) -> VoiceResult<bool> {
        Ok(rms_energy(frame) > self.threshold)
    }
}

/// RMS energy of a frame of normalized samples.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// WebRTC VAD gate. Frames must be 10, 20, or 30ms at 8/16/32/48 kHz.
pub struct WebRtcGate {
    vad: Vad,
    frame_size: usize,
}

impl WebRtcGate {
    pub fn new(sample_rate: u32, frame_size: usize, mode: u8) -> VoiceResult<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD supports 8/16/32/48 kHz, got {}",
                    other
                )))
            }
        };
        // Valid frame lengths are 10/20/30ms worth of samples.
        let per_ms = sample_rate as usize / 1000;
        if ![10 * per_ms, 20 * per_ms, 30 * per_ms].contains(&frame_size) {
            return Err(VoiceError::Config(format!(
                "WebRTC VAD needs 10/20/30ms frames at {} Hz, got {} samples",
                sample_rate, frame_size
            )));
        }
        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(VoiceError::Config(format!(
                    "VAD mode must be 0-3, got {}",
                    other
                )))
            }
        };
        let mut vad = Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(rate);
        Ok(Self { vad, frame_size })
    }
}

impl SpeechGate for WebRtcGate {
    fn is_voiced(&mut self, frame: &[f32]) -> VoiceResult<bool> {
        if frame.len() != self.frame_size {
            return Err(VoiceError::Config(format!(
                "expected {} samples, got {}",
                self.frame_size,
                frame.len()
            )));
        }
        let frame_i16: Vec<i16> = frame
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        let voiced = self
            .vad
            .is_voice_segment(&frame_i16)
            .map_err(|e| VoiceError::Config(format!("VAD processing failed: {:?}", e)))?;
        debug!(voiced, "vad frame");
        Ok(voiced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_gate_splits_loud_from_silent() {
        let mut gate = EnergyGate::new(0.01);
        assert!(!gate.is_voiced(&vec![0.0; 480]).unwrap());
        assert!(gate.is_voiced(&vec![0.5; 480]).unwrap());
    }

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(rms_energy(&[]), 0.0);
    }

    #[test]
    fn webrtc_gate_rejects_odd_rates() {
        assert!(WebRtcGate::new(44100, 480, 2).is_err());
    }

    #[test]
    fn webrtc_gate_rejects_odd_frames() {
        assert!(WebRtcGate::new(16000, 100, 2).is_err());
    }

    #[test]
    fn webrtc_gate_rejects_bad_mode() {
        assert!(WebRtcGate::new(16000, 480, 7).is_err());
    }

    #[test]
    fn webrtc_gate_calls_silence_silent() {
        let mut gate = WebRtcGate::new(16000, 480, 2).unwrap();
        assert!(!gate.is_voiced(&vec![0.0; 480]).unwrap());
    }

    #[test]
    fn webrtc_gate_checks_frame_size() {
        let mut gate = WebRtcGate::new(16000, 480, 2).unwrap();
        assert!(gate.is_voiced(&vec![0.0; 100]).is_err());
    }
}
