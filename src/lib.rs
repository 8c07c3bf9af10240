//! Offline hotword node
//!
//! Always-on edge client for the Leon assistant:
//! - Microphone capture resampled to 16kHz mono frames
//! - Wake-word detection with a VAD frontend
//! - Socket.IO relay of detections to the Leon server
//! - Preflight checks with actionable remediation

pub mod audio_buffer;
pub mod audio_source;
pub mod channel;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod preflight;
pub mod protocol;
pub mod vad;

// Re-export main types
pub use audio_buffer::{AudioBuffer, AudioFrame, AudioSample, FRAME_SAMPLES, SAMPLE_RATE};
pub use audio_source::{AudioSource, CaptureOptions, FrameSource};
pub use channel::{ChannelConfig, ConnectionState, EventSink, SocketChannel};
pub use config::{Cli, Endpoint, NodeConfig};
pub use detector::{DetectionEvent, ModelConfig, WakeWordDetector};
pub use engine::{EnvelopeEngine, Verdict, WakeWordEngine};
pub use error::{NodeError, ProbeFailure, SETUP_COMMAND};
pub use orchestrator::{pump, Launcher, Orchestrator, PipelineStats, SystemLauncher};
pub use platform::Platform;
pub use preflight::{Check, HostProbe, PreflightValidator, SystemProbe, ValidationResult};
pub use protocol::HotwordPayload;
pub use vad::{VadConfig, VadError, VadState, VoiceActivityDetector};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the global subscriber; `RUST_LOG` directives extend the default
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("hotword_node={level}").parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
