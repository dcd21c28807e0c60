//! Host platform detection
//!
//! Cache keys embed the operating system and CPU architecture of the machine
//! that produced an artifact, so that a toolchain or binary built on one
//! platform is never restored onto another. Detection happens once at the edge
//! of the program; everything below receives a [`HostPlatform`] value.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument};

/// Operating system and CPU architecture pair used as a cache-key discriminator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPlatform {
    /// Operating system, as reported by `std::env::consts::OS` (e.g. "linux")
    pub os: String,
    /// CPU architecture, as reported by `std::env::consts::ARCH` (e.g. "x86_64")
    pub arch: String,
}

impl HostPlatform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Detect the platform this binary is running on
    #[instrument]
    pub fn current() -> Self {
        let platform = Self::new(std::env::consts::OS, std::env::consts::ARCH);
        debug!("Detected host platform {}", platform);
        platform
    }

    /// Whether executables on this platform carry an `.exe` suffix
    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// File name of an executable called `name` on this platform
    pub fn executable_name(&self, name: &str) -> String {
        if self.is_windows() && !name.ends_with(".exe") {
            format!("{}.exe", name)
        } else {
            name.to_string()
        }
    }

    /// The `{os}-{arch}` discriminator embedded in cache keys
    pub fn discriminator(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}
