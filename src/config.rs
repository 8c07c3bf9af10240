//! Node configuration
//!
//! Command line flags with environment fallbacks, resolved into one
//! `NodeConfig` that is handed to the orchestrator.

use crate::audio_source::CaptureOptions;
use crate::detector::ModelConfig;
use crate::error::NodeError;
use crate::protocol;
use clap::Parser;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_HOST: &str = "http://localhost";
pub const DEFAULT_PORT: u16 = 1337;
pub const DEFAULT_LANGUAGE: &str = "en";

/// Health endpoint probed before streaming starts
const HEALTH_PATH: &str = "/api/v1/info";

/// Install-relative locations of the provisioned assets
const MODELS_DIR: &str = "models";
const RESOURCE_BUNDLE: &str = "resources/common.json";

/// Directory of the running executable, so assets are found from any working directory
pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Parser, Debug, Clone)]
#[command(name = "hotword-node", version)]
#[command(about = "Offline hotword node: listens for the wake word and notifies the Leon server", long_about = None)]
pub struct Cli {
    /// Hotword language; selects <models-dir>/leon-<LANGUAGE>.json
    #[arg(default_value = DEFAULT_LANGUAGE)]
    pub language: String,

    /// Leon server host
    #[arg(long, env = "LEON_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Leon server port
    #[arg(long, env = "LEON_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding the per-language keyword models [default: <install dir>/models]
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// Shared detector frontend resources [default: <install dir>/resources/common.json]
    #[arg(long)]
    pub resource_bundle: Option<PathBuf>,

    /// Detection sensitivity (0.0 - 1.0)
    #[arg(long, default_value_t = 0.5)]
    pub sensitivity: f32,

    /// Input gain applied before detection
    #[arg(long, default_value_t = 2.0)]
    pub audio_gain: f32,

    /// Skip the VAD frontend
    #[arg(long)]
    pub no_frontend: bool,

    /// Silence gate in percent of full scale (0 disables it)
    #[arg(long, default_value_t = 0.0)]
    pub threshold: f32,

    /// Verbose logging, including every captured frame
    #[arg(short, long)]
    pub verbose: bool,

    /// Run the preflight checks and exit
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<NodeConfig, NodeError> {
        if !(0.0..=100.0).contains(&self.threshold) {
            return Err(NodeError::Config(
                "threshold must be between 0 and 100".to_string(),
            ));
        }

        let models_dir = self
            .models_dir
            .unwrap_or_else(|| install_dir().join(MODELS_DIR));
        let resource_bundle = self
            .resource_bundle
            .unwrap_or_else(|| install_dir().join(RESOURCE_BUNDLE));

        let mut model = ModelConfig::for_language(&self.language, &models_dir, &resource_bundle);
        model.sensitivity = self.sensitivity;
        model.audio_gain = self.audio_gain;
        model.apply_frontend = !self.no_frontend;
        model.validate()?;

        Ok(NodeConfig {
            endpoint: Endpoint::new(&self.host, self.port)?,
            model,
            capture: CaptureOptions {
                threshold: self.threshold,
                verbose: self.verbose,
                ..Default::default()
            },
        })
    }
}

/// Where the Leon server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Accepts `http://host`, `https://host` or a bare host name
    pub fn new(host: &str, port: u16) -> Result<Self, NodeError> {
        let host = host.trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(NodeError::Config("server host must not be empty".to_string()));
        }

        let host = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };

        let endpoint = Self { host, port };
        Url::parse(&endpoint.base_url())
            .map_err(|e| NodeError::Config(format!("invalid server address: {e}")))?;

        Ok(endpoint)
    }

    /// `<host>:<port>`
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), HEALTH_PATH)
    }

    pub fn socket_url(&self) -> Result<Url, NodeError> {
        protocol::socket_url(&self.base_url()).map_err(|e| NodeError::Config(e.to_string()))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Everything the orchestrator needs
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub endpoint: Endpoint,
    pub model: ModelConfig,
    pub capture: CaptureOptions,
}
