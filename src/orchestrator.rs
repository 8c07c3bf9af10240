//! Pipeline orchestration
//!
//! Preflight first, then detector, channel and microphone, in that order.
//! The pump moves frames from the source through the detector and relays
//! hotwords to the sink. It never waits on the network.

use crate::audio_source::{AudioSource, CaptureOptions, FrameSource};
use crate::channel::{ChannelConfig, ConnectionState, EventSink, SocketChannel};
use crate::config::{Endpoint, NodeConfig};
use crate::detector::{DetectionEvent, ModelConfig, WakeWordDetector};
use crate::error::NodeError;
use crate::preflight::{HostProbe, PreflightValidator, SystemProbe};
use crate::protocol::HotwordPayload;
use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

/// Acquires the streaming components
///
/// Separated from the orchestrator so the startup sequence can run against
/// scripted components.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn load_detector(&self, model: &ModelConfig) -> Result<WakeWordDetector, NodeError>;

    fn open_channel(&self, endpoint: &Endpoint) -> Result<Box<dyn EventSink>, NodeError>;

    async fn start_source(&self, options: &CaptureOptions)
        -> Result<Box<dyn FrameSource>, NodeError>;
}

/// Real microphone, envelope engine and Socket.IO channel
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher {
    pub channel: ChannelConfig,
}

#[async_trait]
impl Launcher for SystemLauncher {
    fn load_detector(&self, model: &ModelConfig) -> Result<WakeWordDetector, NodeError> {
        WakeWordDetector::load(model.clone())
    }

    fn open_channel(&self, endpoint: &Endpoint) -> Result<Box<dyn EventSink>, NodeError> {
        let url = endpoint.socket_url()?;
        let channel = SocketChannel::open(url, self.channel.clone());

        let mut state = channel.subscribe();
        tokio::spawn(async move {
            let mut previous = *state.borrow();
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                match (previous, current) {
                    (_, ConnectionState::Connected) => info!("Server connection established"),
                    (ConnectionState::Connected, _) => warn!("Server connection lost, reconnecting"),
                    _ => debug!(state = ?current, "Server connection state changed"),
                }
                previous = current;
            }
        });

        Ok(Box::new(channel))
    }

    async fn start_source(
        &self,
        options: &CaptureOptions,
    ) -> Result<Box<dyn FrameSource>, NodeError> {
        Ok(Box::new(AudioSource::start(options.clone()).await?))
    }
}

/// Counters for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_consumed: u64,
    pub silence: u64,
    pub sound: u64,
    pub hotwords: u64,
    pub errors: u64,
    /// Index gaps seen by the detector
    pub frames_missing: u64,
}

pub struct Orchestrator<P, L> {
    config: NodeConfig,
    validator: PreflightValidator<P>,
    launcher: L,
}

impl Orchestrator<SystemProbe, SystemLauncher> {
    /// Orchestrator wired to the real host
    pub fn system(config: NodeConfig) -> Result<Self, NodeError> {
        Ok(Self::new(config, SystemProbe::new()?, SystemLauncher::default()))
    }
}

impl<P: HostProbe, L: Launcher> Orchestrator<P, L> {
    pub fn new(config: NodeConfig, probe: P, launcher: L) -> Self {
        Self {
            config,
            validator: PreflightValidator::new(probe),
            launcher,
        }
    }

    /// Run the startup checks only
    pub async fn preflight(&self) -> Result<(), NodeError> {
        self.validator
            .validate(&self.config)
            .await
            .into_result()
            .map(|_| ())
    }

    /// Validate, start every component and pump until the source ends
    pub async fn run(&self) -> Result<PipelineStats, NodeError> {
        self.preflight().await?;

        let mut detector = self.launcher.load_detector(&self.config.model)?;
        let sink = self.launcher.open_channel(&self.config.endpoint)?;
        let mut source = self.launcher.start_source(&self.config.capture).await?;

        info!(hotword = %self.config.model.label, "Waiting for hotword...");
        let stats = pump(source.as_mut(), &mut detector, sink.as_ref()).await;

        let capture = source.capture_stats().unwrap_or_default();
        info!(
            frames = stats.frames_consumed,
            hotwords = stats.hotwords,
            errors = stats.errors,
            missing = stats.frames_missing,
            dropped = capture.frames_dropped,
            gated = capture.frames_gated,
            "Audio source ended"
        );
        Ok(stats)
    }
}

/// Feed every frame to the detector and relay hotwords, in frame order
pub async fn pump<S>(
    source: &mut S,
    detector: &mut WakeWordDetector,
    sink: &dyn EventSink,
) -> PipelineStats
where
    S: FrameSource + ?Sized,
{
    let mut stats = PipelineStats::default();

    while let Some(frame) = source.next_frame().await {
        stats.frames_consumed += 1;

        match detector.consume(frame) {
            DetectionEvent::Silence { frame_index } => {
                stats.silence += 1;
                trace!(frame = frame_index, "Silence");
            }
            DetectionEvent::Sound { frame } => {
                stats.sound += 1;
                debug!(frame = frame.index, peak = frame.peak_percent(), "Sound");
            }
            DetectionEvent::Hotword {
                model_index,
                label,
                frame,
            } => {
                stats.hotwords += 1;
                info!(
                    hotword = %label,
                    model_index,
                    frame = frame.index,
                    audio_ms = frame.duration_ms(),
                    "Hotword detected"
                );

                if sink.state() != ConnectionState::Connected {
                    debug!("Server not connected, hotword event queued");
                }
                sink.dispatch(HotwordPayload {
                    hotword: label,
                    buffer: frame.to_le_bytes(),
                });
            }
            DetectionEvent::Error { frame_index, cause } => {
                stats.errors += 1;
                warn!(frame = frame_index, cause = %cause, "Detector error, continuing");
            }
        }
    }

    stats.frames_missing = detector.stats().frames_missing;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::{AudioFrame, FRAME_SAMPLES};
    use crate::engine::{EngineFault, Verdict, WakeWordEngine};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    struct Scripted(VecDeque<Result<Verdict, EngineFault>>);

    impl WakeWordEngine for Scripted {
        fn process(&mut self, _samples: &[i16]) -> Result<Verdict, EngineFault> {
            self.0.pop_front().unwrap_or(Ok(Verdict::Silence))
        }

        fn reset(&mut self) {}
    }

    struct Frames(VecDeque<AudioFrame>);

    #[async_trait]
    impl FrameSource for Frames {
        async fn next_frame(&mut self) -> Option<AudioFrame> {
            self.0.pop_front()
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<HotwordPayload>>);

    impl EventSink for Recorder {
        fn dispatch(&self, payload: HotwordPayload) {
            self.0.lock().unwrap().push(payload);
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    fn detector(script: Vec<Result<Verdict, EngineFault>>) -> WakeWordDetector {
        let model = ModelConfig::for_language("en", Path::new("models"), Path::new("common.json"));
        WakeWordDetector::new(model, Box::new(Scripted(script.into()))).unwrap()
    }

    fn frames(indices: &[u64]) -> Frames {
        Frames(
            indices
                .iter()
                .map(|&i| AudioFrame::new(i, vec![i as i16; FRAME_SAMPLES]))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_pump_counts_every_event_kind() {
        let mut detector = detector(vec![
            Ok(Verdict::Silence),
            Ok(Verdict::Sound),
            Ok(Verdict::Keyword(0)),
            Err(EngineFault::Internal("glitch".to_string())),
            Ok(Verdict::Silence),
        ]);
        let sink = Recorder::default();

        let stats = pump(&mut frames(&[0, 1, 2, 3, 4]), &mut detector, &sink).await;

        assert_eq!(
            stats,
            PipelineStats {
                frames_consumed: 5,
                silence: 2,
                sound: 1,
                hotwords: 1,
                errors: 1,
                frames_missing: 0,
            }
        );

        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].hotword, "leon-en");
        assert_eq!(sent[0].buffer.len(), FRAME_SAMPLES * 2);
        assert_eq!(&sent[0].buffer[..2], &[2, 0]);
    }

    #[tokio::test]
    async fn test_pump_reports_index_gaps() {
        let mut detector = detector(vec![]);
        let sink = Recorder::default();

        let stats = pump(&mut frames(&[0, 1, 5, 6]), &mut detector, &sink).await;

        assert_eq!(stats.frames_consumed, 4);
        assert_eq!(stats.frames_missing, 3);
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
