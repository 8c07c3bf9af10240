//! Preflight validation
//!
//! Runs before any streaming resource is acquired. Checks run in a fixed
//! order and stop at the first failure.

use crate::config::NodeConfig;
use crate::error::{NodeError, ProbeFailure};
use crate::platform::Platform;
use async_trait::async_trait;
use cpal::traits::HostTrait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Health probe request timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Individual startup checks, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    PlatformSupported,
    NativeDepsPresent,
    ModelFilePresent,
    ResourceBundlePresent,
    ServerReachable,
}

impl Check {
    pub const ORDER: [Check; 5] = [
        Check::PlatformSupported,
        Check::NativeDepsPresent,
        Check::ModelFilePresent,
        Check::ResourceBundlePresent,
        Check::ServerReachable,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Check::PlatformSupported => "platform supported",
            Check::NativeDepsPresent => "native audio capture",
            Check::ModelFilePresent => "model file present",
            Check::ResourceBundlePresent => "resource bundle present",
            Check::ServerReachable => "server reachable",
        }
    }
}

/// Host facts the checks depend on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostProbe: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether the native capture backend loads and can enumerate devices
    fn native_capture(&self) -> Result<(), String>;

    fn file_exists(&self, path: &Path) -> bool;

    async fn server_health(&self, url: &str) -> Result<(), ProbeFailure>;
}

/// Outcome of a preflight run
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Checks that passed, in order
    pub passed: Vec<Check>,

    /// First failing check; nothing after it ran
    pub failure: Option<(Check, NodeError)>,
}

impl ValidationResult {
    pub fn into_result(self) -> Result<Vec<Check>, NodeError> {
        match self.failure {
            None => Ok(self.passed),
            Some((_, err)) => Err(err),
        }
    }
}

pub struct PreflightValidator<P> {
    probe: P,
}

impl<P: HostProbe> PreflightValidator<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    pub async fn validate(&self, config: &NodeConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        for check in Check::ORDER {
            match self.run(check, config).await {
                Ok(()) => {
                    debug!(check = check.name(), "Preflight check passed");
                    result.passed.push(check);
                }
                Err(e) => {
                    debug!(check = check.name(), error = %e, "Preflight check failed");
                    result.failure = Some((check, e));
                    return result;
                }
            }
        }

        info!("All preflight checks passed");
        result
    }

    async fn run(&self, check: Check, config: &NodeConfig) -> Result<(), NodeError> {
        match check {
            Check::PlatformSupported => {
                let platform = self.probe.platform();
                if platform.is_supported() {
                    Ok(())
                } else {
                    Err(NodeError::UnsupportedPlatform(platform.name().to_string()))
                }
            }
            Check::NativeDepsPresent => self
                .probe
                .native_capture()
                .map_err(NodeError::NativeDependencyMissing),
            Check::ModelFilePresent => {
                let path = &config.model.model_path;
                if self.probe.file_exists(path) {
                    Ok(())
                } else {
                    Err(NodeError::ModelNotFound(path.clone()))
                }
            }
            Check::ResourceBundlePresent => {
                let path = &config.model.resource_path;
                if self.probe.file_exists(path) {
                    Ok(())
                } else {
                    Err(NodeError::ResourceBundleMissing(path.clone()))
                }
            }
            Check::ServerReachable => self
                .probe
                .server_health(&config.endpoint.health_url())
                .await
                .map_err(|cause| NodeError::ServerUnreachable {
                    url: config.endpoint.base_url(),
                    cause,
                }),
        }
    }
}

/// Probe backed by the real host
pub struct SystemProbe {
    client: reqwest::Client,
}

impl SystemProbe {
    pub fn new() -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent(format!("hotword-node/{}", crate::VERSION))
            .build()
            .map_err(|e| NodeError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    fn platform(&self) -> Platform {
        Platform::current()
    }

    fn native_capture(&self) -> Result<(), String> {
        let host = cpal::default_host();
        host.input_devices()
            .map(|_| ())
            .map_err(|e| format!("{} audio host unavailable: {}", host.id().name(), e))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    async fn server_health(&self, url: &str) -> Result<(), ProbeFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeFailure::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeFailure::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_source::CaptureOptions;
    use crate::config::Endpoint;
    use crate::detector::ModelConfig;
    use mockall::Sequence;

    fn config() -> NodeConfig {
        NodeConfig {
            endpoint: Endpoint::default(),
            model: ModelConfig::for_language(
                "en",
                Path::new("models"),
                Path::new("resources/common.json"),
            ),
            capture: CaptureOptions::default(),
        }
    }

    /// Expect each check in order; the last one fails with `failing`
    fn probe_failing_at(failing: Option<Check>) -> MockHostProbe {
        let mut probe = MockHostProbe::new();
        let mut seq = Sequence::new();
        let fails = |c: Check| failing == Some(c);

        let stop = failing
            .map(|f| Check::ORDER.iter().position(|c| *c == f).unwrap())
            .unwrap_or(Check::ORDER.len() - 1);

        for check in &Check::ORDER[..=stop] {
            match check {
                Check::PlatformSupported => {
                    let platform = if fails(*check) { Platform::Windows } else { Platform::Linux };
                    probe
                        .expect_platform()
                        .times(1)
                        .in_sequence(&mut seq)
                        .return_const(platform);
                }
                Check::NativeDepsPresent => {
                    let outcome = if fails(*check) { Err("no ALSA".to_string()) } else { Ok(()) };
                    probe
                        .expect_native_capture()
                        .times(1)
                        .in_sequence(&mut seq)
                        .return_const(outcome);
                }
                Check::ModelFilePresent => {
                    let exists = !fails(*check);
                    probe
                        .expect_file_exists()
                        .withf(|p| p.ends_with("leon-en.json"))
                        .times(1)
                        .in_sequence(&mut seq)
                        .return_const(exists);
                }
                Check::ResourceBundlePresent => {
                    let exists = !fails(*check);
                    probe
                        .expect_file_exists()
                        .withf(|p| p.ends_with("common.json"))
                        .times(1)
                        .in_sequence(&mut seq)
                        .return_const(exists);
                }
                Check::ServerReachable => {
                    let outcome = if fails(*check) {
                        Err(ProbeFailure::Connection("refused".to_string()))
                    } else {
                        Ok(())
                    };
                    probe
                        .expect_server_health()
                        .withf(|url| url == "http://localhost:1337/api/v1/info")
                        .times(1)
                        .in_sequence(&mut seq)
                        .return_const(outcome);
                }
            }
        }

        probe
    }

    #[tokio::test]
    async fn test_all_checks_pass_in_order() {
        let validator = PreflightValidator::new(probe_failing_at(None));

        let result = validator.validate(&config()).await;

        assert!(result.failure.is_none());
        assert_eq!(result.passed, Check::ORDER.to_vec());
    }

    #[tokio::test]
    async fn test_each_failure_short_circuits() {
        for (i, failing) in Check::ORDER.iter().enumerate() {
            // Any call past the failing check would panic: no expectation set
            let validator = PreflightValidator::new(probe_failing_at(Some(*failing)));

            let result = validator.validate(&config()).await;

            assert_eq!(result.passed, Check::ORDER[..i].to_vec());
            let (check, _) = result.failure.as_ref().unwrap();
            assert_eq!(check, failing);
        }
    }

    #[tokio::test]
    async fn test_failures_map_to_error_kinds() {
        let err = |c: Check| async move {
            PreflightValidator::new(probe_failing_at(Some(c)))
                .validate(&config())
                .await
                .into_result()
                .unwrap_err()
        };

        assert!(matches!(
            err(Check::PlatformSupported).await,
            NodeError::UnsupportedPlatform(p) if p == "windows"
        ));
        assert!(matches!(
            err(Check::NativeDepsPresent).await,
            NodeError::NativeDependencyMissing(_)
        ));
        assert!(matches!(err(Check::ModelFilePresent).await, NodeError::ModelNotFound(_)));
        assert!(matches!(
            err(Check::ResourceBundlePresent).await,
            NodeError::ResourceBundleMissing(_)
        ));
        assert!(matches!(
            err(Check::ServerReachable).await,
            NodeError::ServerUnreachable { cause: ProbeFailure::Connection(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_system_probe_reports_refused_connection() {
        let probe = SystemProbe::new().unwrap();

        let outcome = probe.server_health("http://127.0.0.1:9/api/v1/info").await;

        assert!(matches!(outcome, Err(ProbeFailure::Connection(_))));
    }
}
