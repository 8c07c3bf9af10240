//! Voice Activity Detection (VAD) module
//!
//! Energy and zero-crossing rate analysis. This is the detector frontend:
//! it decides whether a frame is silence or sound, and gates keyword matching
//! when the frontend is enabled. Parameters come from the resource bundle.

use crate::audio_buffer::{AudioSample, FRAME_SAMPLES};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum VadError {
    #[error("Insufficient audio data: need at least {0} samples")]
    InsufficientData(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// VAD configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS threshold for speech detection (0.0 - 1.0)
    pub energy_threshold: f32,

    /// Zero-crossing rate threshold for speech detection
    pub zcr_threshold: f32,

    /// Minimum frame size in samples for analysis
    pub frame_size: usize,

    /// Number of consecutive frames needed to confirm speech
    pub speech_frames_required: usize,

    /// Number of consecutive silence frames to end speech
    pub silence_frames_required: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,        // 2% of full scale
            zcr_threshold: 0.15,           // 15% zero crossings
            frame_size: FRAME_SAMPLES,     // 32ms at 16kHz
            speech_frames_required: 3,     // ~96ms of speech to trigger
            silence_frames_required: 10,   // ~320ms of silence to end
        }
    }
}

impl VadConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), VadError> {
        if !(0.0..=1.0).contains(&self.energy_threshold) {
            return Err(VadError::InvalidConfig(
                "energy_threshold must be between 0.0 and 1.0".to_string()
            ));
        }

        if !(0.0..=1.0).contains(&self.zcr_threshold) {
            return Err(VadError::InvalidConfig(
                "zcr_threshold must be between 0.0 and 1.0".to_string()
            ));
        }

        if self.frame_size == 0 || self.frame_size > FRAME_SAMPLES {
            return Err(VadError::InvalidConfig(format!(
                "frame_size must be between 1 and {} samples",
                FRAME_SAMPLES
            )));
        }

        if self.speech_frames_required == 0 || self.silence_frames_required == 0 {
            return Err(VadError::InvalidConfig(
                "frame counts must be greater than 0".to_string()
            ));
        }

        Ok(())
    }
}

/// Voice Activity Detector state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Currently detecting silence
    Silence,

    /// Potential speech detected (waiting for confirmation)
    MaybeSpeech,

    /// Active speech confirmed
    Speech,

    /// Speech ending (waiting for confirmation)
    MaybeSilence,
}

/// Root-mean-square level of a frame, normalized to full scale
pub fn rms(samples: &[AudioSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Zero-crossing rate (ZCR)
///
/// Voiced audio has moderate ZCR; digital silence has none.
pub fn zero_crossing_rate(samples: &[AudioSample]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count();

    crossings as f32 / (samples.len() - 1) as f32
}

/// Voice Activity Detector
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
    speech_frame_count: usize,
    silence_frame_count: usize,
}

impl VoiceActivityDetector {
    /// Create a new VAD with default configuration
    pub fn new() -> Self {
        Self::with_config(VadConfig::default())
    }

    /// Create a new VAD with custom configuration
    pub fn with_config(config: VadConfig) -> Self {
        debug!("Initializing VAD with config: {:?}", config);

        Self {
            config,
            state: VadState::Silence,
            speech_frame_count: 0,
            silence_frame_count: 0,
        }
    }

    /// Process audio frame and return whether speech is active
    pub fn process_frame(&mut self, samples: &[AudioSample]) -> Result<bool, VadError> {
        if samples.len() < self.config.frame_size {
            return Err(VadError::InsufficientData(self.config.frame_size));
        }

        let energy = rms(samples);
        let zcr = zero_crossing_rate(samples);

        trace!(
            "Frame analysis: energy={:.4}, zcr={:.4}, state={:?}",
            energy, zcr, self.state
        );

        let is_speech_frame = energy > self.config.energy_threshold
                           && zcr > self.config.zcr_threshold;

        self.update_state(is_speech_frame);

        Ok(self.is_speech_active())
    }

    /// Update VAD state machine based on speech detection
    fn update_state(&mut self, is_speech_frame: bool) {
        match self.state {
            VadState::Silence => {
                if is_speech_frame {
                    self.speech_frame_count = 1;
                    self.silence_frame_count = 0;
                    self.state = if self.config.speech_frames_required <= 1 {
                        VadState::Speech
                    } else {
                        VadState::MaybeSpeech
                    };
                    trace!("State: Silence -> {:?}", self.state);
                }
            }

            VadState::MaybeSpeech => {
                if is_speech_frame {
                    self.speech_frame_count += 1;
                    if self.speech_frame_count >= self.config.speech_frames_required {
                        self.state = VadState::Speech;
                        trace!("State: MaybeSpeech -> Speech (confirmed)");
                    }
                } else {
                    self.state = VadState::Silence;
                    self.speech_frame_count = 0;
                    trace!("State: MaybeSpeech -> Silence (false alarm)");
                }
            }

            VadState::Speech => {
                if !is_speech_frame {
                    self.silence_frame_count = 1;
                    self.speech_frame_count = 0;
                    self.state = VadState::MaybeSilence;
                    trace!("State: Speech -> MaybeSilence");
                } else {
                    self.silence_frame_count = 0;
                }
            }

            VadState::MaybeSilence => {
                if !is_speech_frame {
                    self.silence_frame_count += 1;
                    if self.silence_frame_count >= self.config.silence_frames_required {
                        self.state = VadState::Silence;
                        trace!("State: MaybeSilence -> Silence (speech ended)");
                    }
                } else {
                    self.state = VadState::Speech;
                    self.silence_frame_count = 0;
                    trace!("State: MaybeSilence -> Speech (continued)");
                }
            }
        }
    }

    /// Check if speech is currently active
    pub fn is_speech_active(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::MaybeSilence)
    }

    /// Get current VAD state
    pub fn state(&self) -> VadState {
        self.state
    }

    /// Reset VAD to initial state
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_frame_count = 0;
        self.silence_frame_count = 0;
    }

    /// Get current configuration
    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new()
    }
}
