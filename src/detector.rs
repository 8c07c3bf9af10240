//! Wake-word detector main module
//!
//! Wraps a `WakeWordEngine` loaded for exactly one model/language and turns
//! its per-frame verdicts into `DetectionEvent`s, strictly in frame order.

use crate::audio_buffer::AudioFrame;
use crate::engine::{EngineSettings, EnvelopeEngine, KeywordTemplate, Verdict, WakeWordEngine};
use crate::error::NodeError;
use crate::vad::VadConfig;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Identifies the loaded acoustic model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Language tag, e.g. "en"
    pub language: String,

    /// Keyword model file for the language
    pub model_path: PathBuf,

    /// Shared frontend resource bundle
    pub resource_path: PathBuf,

    /// Sensitivity (0.0 - 1.0, higher = more sensitive, more false positives)
    pub sensitivity: f32,

    /// Label reported with every hotword, e.g. "leon-en"
    pub label: String,

    /// Linear input gain
    pub audio_gain: f32,

    /// Run the VAD frontend ahead of keyword matching
    pub apply_frontend: bool,
}

impl ModelConfig {
    /// Model layout: `<models_dir>/leon-<language>.json`
    pub fn for_language(language: &str, models_dir: &Path, resource_path: &Path) -> Self {
        let label = format!("leon-{}", language);

        Self {
            language: language.to_string(),
            model_path: models_dir.join(format!("{}.json", label)),
            resource_path: resource_path.to_path_buf(),
            sensitivity: 0.5,
            label,
            audio_gain: 2.0,
            apply_frontend: true,
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.language.is_empty() {
            return Err(NodeError::Config("language must not be empty".to_string()));
        }

        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(NodeError::Config(
                "sensitivity must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(self.audio_gain.is_finite() && self.audio_gain > 0.0) {
            return Err(NodeError::Config("audio gain must be positive".to_string()));
        }

        Ok(())
    }

    fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            sensitivity: self.sensitivity,
            audio_gain: self.audio_gain,
            apply_frontend: self.apply_frontend,
        }
    }
}

/// What the detector observed on one frame
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionEvent {
    Silence {
        frame_index: u64,
    },

    /// Audible energy; carries the frame for downstream consumers
    Sound {
        frame: AudioFrame,
    },

    /// Positive wake-word match with the audio tail that triggered it
    Hotword {
        model_index: usize,
        label: String,
        frame: AudioFrame,
    },

    /// Engine fault on this frame; detection continues with the next one
    Error {
        frame_index: u64,
        cause: String,
    },
}

impl DetectionEvent {
    /// Index of the frame that produced this event
    pub fn frame_index(&self) -> u64 {
        match self {
            DetectionEvent::Silence { frame_index } | DetectionEvent::Error { frame_index, .. } => {
                *frame_index
            }
            DetectionEvent::Sound { frame } | DetectionEvent::Hotword { frame, .. } => frame.index,
        }
    }
}

/// Detector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub frames_consumed: u64,
    pub hotwords_detected: u64,
    pub faults: u64,
    /// Frames the source produced but never delivered
    pub frames_missing: u64,
}

/// Main wake-word detector
pub struct WakeWordDetector {
    model: ModelConfig,
    engine: Box<dyn WakeWordEngine>,
    next_index: Option<u64>,
    stats: DetectorStats,
}

impl WakeWordDetector {
    /// Create a detector around an already constructed engine
    pub fn new(model: ModelConfig, engine: Box<dyn WakeWordEngine>) -> Result<Self, NodeError> {
        model.validate()?;

        info!("Initializing wake-word detector");
        info!("Model: {}", model.model_path.display());
        info!("Hotword: {}", model.label);
        info!("Sensitivity: {}", model.sensitivity);

        Ok(Self {
            model,
            engine,
            next_index: None,
            stats: DetectorStats::default(),
        })
    }

    /// Load the bundled envelope engine from the model and resource files
    pub fn load(model: ModelConfig) -> Result<Self, NodeError> {
        model.validate()?;

        let template: KeywordTemplate = read_json(&model.model_path)
            .map_err(|e| e.into_node_error(NodeError::ModelNotFound(model.model_path.clone())))?;
        template.validate().map_err(|reason| NodeError::InvalidModel {
            path: model.model_path.clone(),
            reason,
        })?;

        let frontend: VadConfig = read_json(&model.resource_path).map_err(|e| {
            e.into_node_error(NodeError::ResourceBundleMissing(model.resource_path.clone()))
        })?;
        frontend.validate().map_err(|e| NodeError::InvalidModel {
            path: model.resource_path.clone(),
            reason: e.to_string(),
        })?;

        let engine = EnvelopeEngine::new(template, frontend, model.engine_settings());
        Self::new(model, Box::new(engine))
    }

    /// Feed one frame; returns exactly one event for it
    pub fn consume(&mut self, frame: AudioFrame) -> DetectionEvent {
        self.track_order(frame.index);
        self.stats.frames_consumed += 1;

        match self.engine.process(&frame.samples) {
            Ok(Verdict::Silence) => DetectionEvent::Silence { frame_index: frame.index },
            Ok(Verdict::Sound) => DetectionEvent::Sound { frame },
            Ok(Verdict::Keyword(model_index)) => {
                self.stats.hotwords_detected += 1;
                DetectionEvent::Hotword {
                    model_index,
                    label: self.model.label.clone(),
                    frame,
                }
            }
            Err(fault) => {
                self.stats.faults += 1;
                DetectionEvent::Error {
                    frame_index: frame.index,
                    cause: fault.to_string(),
                }
            }
        }
    }

    fn track_order(&mut self, index: u64) {
        if let Some(expected) = self.next_index {
            if index > expected {
                let missing = index - expected;
                self.stats.frames_missing += missing;
                warn!(
                    missing,
                    total_missing = self.stats.frames_missing,
                    "Frames dropped before reaching the detector"
                );
                // Engine history would otherwise span the gap
                self.engine.reset();
            } else if index < expected {
                warn!(index, expected, "Frame index went backwards");
            }
        }
        self.next_index = match self.next_index {
            Some(expected) if index < expected => Some(expected),
            _ => Some(index + 1),
        };
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats.clone()
    }
}

enum ReadError {
    Missing,
    Io(std::io::Error),
    Parse(PathBuf, serde_json::Error),
}

impl ReadError {
    fn into_node_error(self, missing: NodeError) -> NodeError {
        match self {
            ReadError::Missing => missing,
            ReadError::Io(e) => NodeError::Config(e.to_string()),
            ReadError::Parse(path, e) => NodeError::InvalidModel {
                path,
                reason: e.to_string(),
            },
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ReadError> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ReadError::Missing,
        _ => ReadError::Io(e),
    })?;

    serde_json::from_str(&text).map_err(|e| ReadError::Parse(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineFault;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Engine that replays a fixed script of verdicts
    struct Scripted(VecDeque<Result<Verdict, EngineFault>>);

    impl WakeWordEngine for Scripted {
        fn process(&mut self, _samples: &[i16]) -> Result<Verdict, EngineFault> {
            self.0.pop_front().unwrap_or(Ok(Verdict::Silence))
        }

        fn reset(&mut self) {}
    }

    fn model() -> ModelConfig {
        ModelConfig::for_language("en", Path::new("models"), Path::new("resources/common.json"))
    }

    fn frame(index: u64) -> AudioFrame {
        AudioFrame::new(index, vec![0; 4])
    }

    #[test]
    fn test_model_layout() {
        let model = model();
        assert_eq!(model.label, "leon-en");
        assert_eq!(model.model_path, PathBuf::from("models/leon-en.json"));
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_model_validation() {
        let mut model = model();
        model.sensitivity = 1.5;
        assert!(matches!(model.validate(), Err(NodeError::Config(_))));

        model.sensitivity = 0.5;
        model.audio_gain = 0.0;
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_verdicts_map_to_events() {
        let engine = Scripted(VecDeque::from(vec![
            Ok(Verdict::Silence),
            Ok(Verdict::Sound),
            Err(EngineFault::Internal("tick".into())),
            Ok(Verdict::Keyword(0)),
        ]));
        let mut detector = WakeWordDetector::new(model(), Box::new(engine)).unwrap();

        assert_eq!(detector.consume(frame(0)), DetectionEvent::Silence { frame_index: 0 });
        assert_eq!(detector.consume(frame(1)), DetectionEvent::Sound { frame: frame(1) });
        assert_eq!(
            detector.consume(frame(2)),
            DetectionEvent::Error { frame_index: 2, cause: "tick".into() }
        );
        assert_eq!(
            detector.consume(frame(3)),
            DetectionEvent::Hotword { model_index: 0, label: "leon-en".into(), frame: frame(3) }
        );

        let stats = detector.stats();
        assert_eq!(stats.frames_consumed, 4);
        assert_eq!(stats.hotwords_detected, 1);
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.frames_missing, 0);
    }

    #[test]
    fn test_gaps_are_counted() {
        let mut detector =
            WakeWordDetector::new(model(), Box::new(Scripted(VecDeque::new()))).unwrap();

        detector.consume(frame(0));
        detector.consume(frame(1));
        detector.consume(frame(5));
        detector.consume(frame(6));

        assert_eq!(detector.stats().frames_missing, 3);
    }

    /// Counts engine resets, then replays a script
    struct Resets(Arc<AtomicUsize>);

    impl WakeWordEngine for Resets {
        fn process(&mut self, _samples: &[i16]) -> Result<Verdict, EngineFault> {
            Ok(Verdict::Silence)
        }

        fn reset(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_gap_resets_engine_history() {
        let resets = Arc::new(AtomicUsize::new(0));
        let mut detector =
            WakeWordDetector::new(model(), Box::new(Resets(Arc::clone(&resets)))).unwrap();

        detector.consume(frame(0));
        detector.consume(frame(1));
        assert_eq!(resets.load(Ordering::SeqCst), 0);

        detector.consume(frame(4));
        detector.consume(frame(5));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_reports_missing_files() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("common.json");
        let model = ModelConfig::for_language("fr", dir.path(), &resource);

        assert!(matches!(
            WakeWordDetector::load(model.clone()),
            Err(NodeError::ModelNotFound(path)) if path.ends_with("leon-fr.json")
        ));

        std::fs::write(&model.model_path, r#"{ "envelope": [0.1, 0.5, 0.2] }"#).unwrap();
        assert!(matches!(
            WakeWordDetector::load(model.clone()),
            Err(NodeError::ResourceBundleMissing(_))
        ));

        std::fs::write(&resource, "{}").unwrap();
        let detector = WakeWordDetector::load(model).unwrap();
        assert_eq!(detector.model().label, "leon-fr");
    }

    #[test]
    fn test_load_rejects_malformed_model() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("common.json");
        std::fs::write(&resource, "{}").unwrap();
        let model = ModelConfig::for_language("en", dir.path(), &resource);

        std::fs::write(&model.model_path, "not json").unwrap();
        assert!(matches!(
            WakeWordDetector::load(model.clone()),
            Err(NodeError::InvalidModel { .. })
        ));

        std::fs::write(&model.model_path, r#"{ "envelope": [0.3] }"#).unwrap();
        assert!(matches!(
            WakeWordDetector::load(model),
            Err(NodeError::InvalidModel { .. })
        ));
    }

    #[test]
    fn test_load_rejects_frontend_wider_than_a_frame() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("common.json");
        std::fs::write(&resource, r#"{ "frame_size": 1024 }"#).unwrap();
        let model = ModelConfig::for_language("en", dir.path(), &resource);
        std::fs::write(&model.model_path, r#"{ "envelope": [0.1, 0.5, 0.2] }"#).unwrap();

        assert!(matches!(
            WakeWordDetector::load(model),
            Err(NodeError::InvalidModel { path, .. }) if path.ends_with("common.json")
        ));
    }
}
