//! Acoustic engine seam
//!
//! `WakeWordEngine` is the opaque capability that classifies frames. The
//! bundled `EnvelopeEngine` is a lightweight stand-in: it matches the RMS
//! contour of recent frames against a per-language keyword envelope. Swap in
//! a real keyword-spotting model by implementing the trait.

use crate::audio_buffer::{AudioSample, FRAME_SAMPLES};
use crate::vad::{self, VadConfig, VadError, VoiceActivityDetector};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

/// Per-frame classification produced by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Silence,
    Sound,
    /// Keyword matched; value is the index of the model that matched
    Keyword(usize),
}

#[derive(Error, Debug)]
pub enum EngineFault {
    #[error("frame has {actual} samples, engine expects {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("frontend error: {0}")]
    Frontend(#[from] VadError),

    #[error("{0}")]
    Internal(String),
}

/// Streaming keyword classifier
///
/// Called once per frame, in capture order. A fault on one frame must leave
/// the engine usable for the next.
pub trait WakeWordEngine: Send {
    fn process(&mut self, samples: &[AudioSample]) -> Result<Verdict, EngineFault>;

    /// Drop any partial evidence
    fn reset(&mut self);
}

/// Keyword model file contents: RMS level per frame across the keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordTemplate {
    pub envelope: Vec<f32>,
}

impl KeywordTemplate {
    pub fn validate(&self) -> Result<(), String> {
        if self.envelope.len() < 2 {
            return Err("envelope needs at least 2 frames".to_string());
        }

        if self.envelope.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err("envelope levels must be finite and non-negative".to_string());
        }

        Ok(())
    }
}

/// Engine tuning that is fixed at construction
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 0.0 - 1.0, higher = more sensitive, more false positives
    pub sensitivity: f32,

    /// Linear gain applied before analysis
    pub audio_gain: f32,

    /// Gate keyword matching on the VAD frontend
    pub apply_frontend: bool,
}

/// Envelope-correlation keyword spotter
pub struct EnvelopeEngine {
    template: Vec<f32>,
    window: VecDeque<f32>,
    vad: VoiceActivityDetector,
    settings: EngineSettings,
    match_threshold: f32,
    refractory: usize,
}

impl EnvelopeEngine {
    pub fn new(template: KeywordTemplate, frontend: VadConfig, settings: EngineSettings) -> Self {
        let match_threshold = Self::threshold_for(settings.sensitivity);

        debug!(
            frames = template.envelope.len(),
            match_threshold,
            apply_frontend = settings.apply_frontend,
            "Envelope engine ready"
        );

        Self {
            window: VecDeque::with_capacity(template.envelope.len()),
            template: template.envelope,
            vad: VoiceActivityDetector::with_config(frontend),
            settings,
            match_threshold,
            refractory: 0,
        }
    }

    /// Correlation required for a match at the given sensitivity
    pub fn threshold_for(sensitivity: f32) -> f32 {
        0.95 - 0.4 * sensitivity.clamp(0.0, 1.0)
    }

    fn amplify(&self, samples: &[AudioSample]) -> Vec<AudioSample> {
        let gain = self.settings.audio_gain;
        samples
            .iter()
            .map(|&s| (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect()
    }
}

impl WakeWordEngine for EnvelopeEngine {
    fn process(&mut self, samples: &[AudioSample]) -> Result<Verdict, EngineFault> {
        if samples.len() != FRAME_SAMPLES {
            return Err(EngineFault::FrameSize {
                expected: FRAME_SAMPLES,
                actual: samples.len(),
            });
        }

        let boosted = self.amplify(samples);
        let level = vad::rms(&boosted);

        let speech = if self.settings.apply_frontend {
            self.vad.process_frame(&boosted)?
        } else {
            level > self.vad.config().energy_threshold
        };

        if self.window.len() == self.template.len() {
            self.window.pop_front();
        }
        self.window.push_back(level);

        if self.refractory > 0 {
            self.refractory -= 1;
        } else if speech && self.window.len() == self.template.len() {
            let score = correlation(self.window.iter().copied(), &self.template);
            if score >= self.match_threshold {
                debug!(score, "Keyword envelope matched");
                self.refractory = self.template.len();
                return Ok(Verdict::Keyword(0));
            }
        }

        Ok(if speech { Verdict::Sound } else { Verdict::Silence })
    }

    fn reset(&mut self) {
        self.window.clear();
        self.vad.reset();
        self.refractory = 0;
    }
}

/// Pearson correlation; 0.0 when either side is flat
fn correlation(window: impl Iterator<Item = f32> + Clone, template: &[f32]) -> f32 {
    let n = template.len() as f32;
    let mean_w = window.clone().sum::<f32>() / n;
    let mean_t = template.iter().sum::<f32>() / n;

    let (mut cov, mut var_w, mut var_t) = (0.0f32, 0.0f32, 0.0f32);
    for (w, &t) in window.zip(template) {
        let (dw, dt) = (w - mean_w, t - mean_t);
        cov += dw * dt;
        var_w += dw * dw;
        var_t += dt * dt;
    }

    let denom = (var_w * var_t).sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        cov / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ENVELOPE: [f32; 6] = [0.1, 0.2, 0.4, 0.6, 0.4, 0.2];

    fn buzz(level: f32) -> Vec<AudioSample> {
        let amplitude = (level * i16::MAX as f32) as i16;
        (0..FRAME_SAMPLES)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn engine(apply_frontend: bool) -> EnvelopeEngine {
        EnvelopeEngine::new(
            KeywordTemplate { envelope: ENVELOPE.to_vec() },
            VadConfig::default(),
            EngineSettings {
                sensitivity: 0.5,
                audio_gain: 1.0,
                apply_frontend,
            },
        )
    }

    fn run(engine: &mut EnvelopeEngine, frames: &[Vec<AudioSample>]) -> Vec<Verdict> {
        frames.iter().map(|f| engine.process(f).unwrap()).collect()
    }

    fn utterance(scale: f32) -> Vec<Vec<AudioSample>> {
        ENVELOPE.iter().map(|&v| buzz(v * scale)).collect()
    }

    #[test]
    fn test_threshold_mapping() {
        assert_relative_eq!(EnvelopeEngine::threshold_for(0.5), 0.75);
        assert_relative_eq!(EnvelopeEngine::threshold_for(0.0), 0.95);
        assert_relative_eq!(EnvelopeEngine::threshold_for(7.0), 0.55);
    }

    #[test]
    fn test_correlation() {
        let t = [1.0, 2.0, 3.0];
        assert_relative_eq!(correlation([2.0, 4.0, 6.0].into_iter(), &t), 1.0, epsilon = 1e-5);
        assert_relative_eq!(correlation([3.0, 2.0, 1.0].into_iter(), &t), -1.0, epsilon = 1e-5);
        assert_relative_eq!(correlation([5.0, 5.0, 5.0].into_iter(), &t), 0.0);
    }

    #[test]
    fn test_silence_stays_silent() {
        let mut engine = engine(true);
        let verdicts = run(&mut engine, &vec![vec![0; FRAME_SAMPLES]; 20]);
        assert!(verdicts.iter().all(|v| *v == Verdict::Silence));
    }

    #[test]
    fn test_keyword_matches_on_last_frame_of_utterance() {
        let mut engine = engine(false);
        let mut frames = vec![vec![0; FRAME_SAMPLES]; 4];
        frames.extend(utterance(0.5));

        let verdicts = run(&mut engine, &frames);

        assert_eq!(verdicts[..4], [Verdict::Silence; 4]);
        assert!(verdicts[4..9].iter().all(|v| *v == Verdict::Sound));
        assert_eq!(verdicts[9], Verdict::Keyword(0));
    }

    #[test]
    fn test_refractory_suppresses_immediate_repeat() {
        let mut engine = engine(false);
        let mut frames = utterance(0.5);
        frames.extend(utterance(0.5));

        let hits = run(&mut engine, &frames)
            .into_iter()
            .filter(|v| matches!(v, Verdict::Keyword(_)))
            .count();

        // The second copy completes while the first one's refractory runs
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_gain_does_not_change_shape() {
        let mut engine = EnvelopeEngine::new(
            KeywordTemplate { envelope: ENVELOPE.to_vec() },
            VadConfig::default(),
            EngineSettings { sensitivity: 0.5, audio_gain: 2.0, apply_frontend: false },
        );

        let verdicts = run(&mut engine, &utterance(0.25));
        assert_eq!(verdicts.last(), Some(&Verdict::Keyword(0)));
    }

    #[test]
    fn test_frontend_gates_matching() {
        // Frontend needs 3 speech frames before it reports sound
        let mut engine = engine(true);
        let verdicts = run(&mut engine, &utterance(0.5));

        assert_eq!(verdicts[0], Verdict::Silence);
        assert_eq!(verdicts[2], Verdict::Sound);
        assert_eq!(verdicts[5], Verdict::Keyword(0));
    }

    #[test]
    fn test_wrong_frame_size_is_a_fault_and_recoverable() {
        let mut engine = engine(false);

        match engine.process(&[0; 10]) {
            Err(EngineFault::FrameSize { expected, actual }) => {
                assert_eq!(expected, FRAME_SAMPLES);
                assert_eq!(actual, 10);
            }
            other => panic!("Expected FrameSize fault, got {:?}", other),
        }

        assert_eq!(engine.process(&buzz(0.3)).unwrap(), Verdict::Sound);
    }

    #[test]
    fn test_template_validation() {
        assert!(KeywordTemplate { envelope: vec![0.1] }.validate().is_err());
        assert!(KeywordTemplate { envelope: vec![0.1, f32::NAN] }.validate().is_err());
        assert!(KeywordTemplate { envelope: vec![0.1, -0.2] }.validate().is_err());
        assert!(KeywordTemplate { envelope: ENVELOPE.to_vec() }.validate().is_ok());
    }
}
