//! Error taxonomy for the hotword node
//!
//! Startup failures are fatal and carry remediation text for the operator.
//! Detector and transport faults are absorbed by the pipeline.

use crate::platform::Platform;
use std::path::PathBuf;
use thiserror::Error;

/// Command that provisions models, resources and native audio packages
pub const SETUP_COMMAND: &str = "npm run setup:offline-hotword";

/// Why the server health probe failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// No HTTP response at all (refused, DNS, timeout)
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server answered, but not with a success status
    #[error("server answered with HTTP {0}")]
    Status(u16),
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Offline hotword is not available on {0}")]
    UnsupportedPlatform(String),

    #[error("Failed to load native audio capture: {0}")]
    NativeDependencyMissing(String),

    #[error("Hotword model not found at {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Hotword resources are missing at {}", .0.display())]
    ResourceBundleMissing(PathBuf),

    #[error("Failed to reach the server at {url}: {cause}")]
    ServerUnreachable { url: String, cause: ProbeFailure },

    #[error("Audio capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Detector fault: {0}")]
    DetectorFault(String),

    #[error("Transport fault: {0}")]
    TransportFault(String),

    #[error("Invalid model data in {}: {reason}", .path.display())]
    InvalidModel { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl NodeError {
    /// Fatal errors stop the process; the rest are logged and absorbed
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NodeError::DetectorFault(_) | NodeError::TransportFault(_))
    }

    /// Human-actionable next step printed alongside fatal diagnostics
    pub fn remediation(&self) -> Option<String> {
        match self {
            NodeError::UnsupportedPlatform(_) => Some(format!(
                "To regain hotword functionality:\n\
                 - Use macOS or Linux, then run \"{SETUP_COMMAND}\"\n\
                 - Or use WSL2 Ubuntu for the hotword node (then run the setup inside WSL)\n\
                 - Or skip offline hotword and trigger Leon from the UI microphone"
            )),
            NodeError::NativeDependencyMissing(_) => Some(format!(
                "To fix:\n\
                 - Ensure system deps are installed ({})\n\
                 - Then run: {SETUP_COMMAND}",
                Platform::install_hints()
            )),
            NodeError::ModelNotFound(_) => Some(format!(
                "Make sure you selected a supported language and the model files are present. \
                 Try re-running: {SETUP_COMMAND}"
            )),
            NodeError::ResourceBundleMissing(_) | NodeError::InvalidModel { .. } => {
                Some(format!("Try re-running: {SETUP_COMMAND}"))
            }
            NodeError::ServerUnreachable { url, .. } => Some(format!(
                "Make sure the Leon server is running at {url} \
                 (override with LEON_HOST and LEON_PORT)"
            )),
            NodeError::DeviceUnavailable(_) => Some(
                "Check that a microphone is connected and not held by another application"
                    .to_string(),
            ),
            NodeError::Config(_) => Some("Run with --help to list the accepted options".to_string()),
            NodeError::DetectorFault(_) | NodeError::TransportFault(_) => None,
        }
    }

    /// Operator-facing diagnostic: the error line, then remediation if any
    pub fn report(&self) -> String {
        match self.remediation() {
            Some(remediation) => format!("Error: {self}\n{remediation}"),
            None => format!("Error: {self}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(NodeError::ModelNotFound(PathBuf::from("models/leon-en.json")).is_fatal());
        assert!(NodeError::DeviceUnavailable("busy".into()).is_fatal());
        assert!(!NodeError::DetectorFault("tick".into()).is_fatal());
        assert!(!NodeError::TransportFault("reset".into()).is_fatal());
    }

    #[test]
    fn test_remediation_mentions_setup_command() {
        let err = NodeError::ModelNotFound(PathBuf::from("models/leon-fr.json"));
        assert!(err.remediation().unwrap().contains(SETUP_COMMAND));
        assert!(err.to_string().contains("leon-fr.json"));

        let err = NodeError::UnsupportedPlatform("windows".into());
        let text = err.remediation().unwrap();
        assert!(text.contains("WSL2"));
        assert!(text.contains("macOS or Linux"));
    }

    #[test]
    fn test_server_unreachable_display() {
        let err = NodeError::ServerUnreachable {
            url: "http://localhost:1337".into(),
            cause: ProbeFailure::Status(503),
        };
        assert_eq!(
            err.to_string(),
            "Failed to reach the server at http://localhost:1337: server answered with HTTP 503"
        );
        assert!(err.remediation().unwrap().contains("LEON_HOST"));
    }

    #[test]
    fn test_report_states_the_diagnostic_once() {
        let err = NodeError::ModelNotFound(PathBuf::from("models/leon-en.json"));
        let report = err.report();

        assert_eq!(report.matches("leon-en.json").count(), 1);
        assert!(report.starts_with("Error: Hotword model not found"));
        assert!(report.ends_with(&err.remediation().unwrap()));

        let err = NodeError::TransportFault("reset".into());
        assert_eq!(err.report(), "Error: Transport fault: reset");
    }

    #[test]
    fn test_absorbed_errors_have_no_remediation() {
        assert!(NodeError::DetectorFault("x".into()).remediation().is_none());
    }
}
