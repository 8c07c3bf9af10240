//! Platform detection for the preflight checks

use serde::{Deserialize, Serialize};

/// Platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    MacOS,
    Windows,
    Unknown,
}

impl Platform {
    /// Get current platform
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Unknown
        }
    }

    /// Whether the offline hotword node can run here
    pub fn is_supported(&self) -> bool {
        matches!(self, Platform::Linux | Platform::MacOS)
    }

    /// Get platform name as string
    pub fn name(&self) -> &str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOS => "macos",
            Platform::Windows => "windows",
            Platform::Unknown => "unknown",
        }
    }

    /// Command installing the native audio stack, if the platform has one
    pub fn install_command(&self) -> Option<&'static str> {
        match self {
            Platform::Linux => Some("sudo apt-get install libasound2 alsa-utils -y"),
            Platform::MacOS => Some("brew install portaudio"),
            Platform::Windows | Platform::Unknown => None,
        }
    }

    /// Install hints for every supported platform, for diagnostics
    pub fn install_hints() -> String {
        [Platform::Linux, Platform::MacOS]
            .iter()
            .filter_map(|p| p.install_command().map(|cmd| format!("{}: {}", p.label(), cmd)))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn label(&self) -> &str {
        match self {
            Platform::Linux => "Linux",
            Platform::MacOS => "macOS",
            Platform::Windows => "Windows",
            Platform::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let platform = Platform::current();
        assert_ne!(platform, Platform::Unknown);
    }

    #[test]
    fn test_supported_set() {
        assert!(Platform::Linux.is_supported());
        assert!(Platform::MacOS.is_supported());
        assert!(!Platform::Windows.is_supported());
        assert!(!Platform::Unknown.is_supported());
    }

    #[test]
    fn test_install_hints() {
        let hints = Platform::install_hints();
        assert!(hints.contains("apt-get"));
        assert!(hints.contains("brew"));
        assert!(Platform::Windows.install_command().is_none());
    }
}
