//! Engine Version Model
//!
//! Parsing, comparison and supportability rules for the storage engine
//! version that an image carries or a running cluster reports.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// =============================================================================
// Engine Version
// =============================================================================

/// Storage engine version `major.minor.patch-build`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Build number; ignored by every comparison
    #[serde(default)]
    pub build: u32,
}

/// Oldest release the controller will deploy
pub const MINIMUM_VERSION: EngineVersion = EngineVersion::new(13, 2, 4, 0);

/// Major releases the controller supports without `allowUnsupported`
pub const SUPPORTED_MAJORS: &[u32] = &[13, 14, 15];

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Extract a version from free text such as
    /// `ceph version 14.2.1-12-g1a2b3c (1a2b3c) nautilus (stable)`.
    ///
    /// The first whitespace-separated token shaped like `X.Y.Z[-B]` wins.
    pub fn extract(text: &str) -> Result<Self> {
        text.split_whitespace()
            .find_map(Self::parse_token)
            .ok_or_else(|| Error::VersionParse(format!("no version found in {:?}", text.trim())))
    }

    fn parse_token(token: &str) -> Option<Self> {
        let token = token.trim_start_matches('v');
        let mut dash = token.splitn(2, '-');
        let core = dash.next()?;
        let build = dash
            .next()
            .and_then(|rest| {
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().ok()
            })
            .unwrap_or(0);

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return None;
        }
        let major = parts[0].parse().ok()?;
        let minor = parts[1].parse().ok()?;
        let patch = parts[2].parse().ok()?;
        Some(Self::new(major, minor, patch, build))
    }

    /// Release name of the major version
    pub fn release_name(&self) -> &'static str {
        match self.major {
            12 => "luminous",
            13 => "mimic",
            14 => "nautilus",
            15 => "octopus",
            16 => "pacific",
            _ => "unknown",
        }
    }

    fn core(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// Equal in major, minor and patch; build numbers are ignored
    pub fn is_identical(&self, other: &EngineVersion) -> bool {
        self.core() == other.core()
    }

    /// Strictly newer than `other`
    pub fn is_superior(&self, other: &EngineVersion) -> bool {
        self.core() > other.core()
    }

    /// Strictly older than `other`
    pub fn is_inferior(&self, other: &EngineVersion) -> bool {
        self.core() < other.core()
    }

    pub fn is_at_least(&self, other: &EngineVersion) -> bool {
        self.core() >= other.core()
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_MAJORS.contains(&self.major)
    }

    /// Reject versions below the minimum, and unsupported releases unless
    /// explicitly allowed.
    pub fn validate(&self, allow_unsupported: bool) -> Result<()> {
        if !self.is_at_least(&MINIMUM_VERSION) {
            return Err(Error::UnsupportedVersion {
                version: self.to_string(),
                reason: format!("does not meet the minimum version {}", MINIMUM_VERSION),
            });
        }
        if !self.is_supported() {
            if !allow_unsupported {
                return Err(Error::UnsupportedVersion {
                    version: self.to_string(),
                    reason: "allowUnsupported must be set to run this version".to_string(),
                });
            }
            warn!("Unsupported engine version {} detected, continuing", self);
        }
        Ok(())
    }
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}-{} {}",
            self.major,
            self.minor,
            self.patch,
            self.build,
            self.release_name()
        )
    }
}

// =============================================================================
// Running Daemon Versions
// =============================================================================

/// Versions reported by the running daemons, keyed by the raw version
/// string with the number of daemons running it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonVersions {
    #[serde(default)]
    pub mon: BTreeMap<String, u32>,
    #[serde(default)]
    pub mgr: BTreeMap<String, u32>,
    #[serde(default)]
    pub osd: BTreeMap<String, u32>,
    #[serde(default)]
    pub overall: BTreeMap<String, u32>,
}

/// What an image change means for the running cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeDecision {
    /// Image and cluster run the same version
    NoChange,
    /// Image is newer than the running cluster
    Upgrade,
    /// Several versions are running; an upgrade is already under way
    InProgress,
}

impl UpgradeDecision {
    /// Whether the cluster's health must be checked before proceeding
    pub fn requires_healthy_cluster(&self) -> bool {
        !matches!(self, UpgradeDecision::NoChange)
    }
}

/// Compare the image version against the versions running in the cluster.
pub fn diff_image_and_running(
    image: &EngineVersion,
    running: &DaemonVersions,
) -> Result<UpgradeDecision> {
    match running.overall.len() {
        0 => Err(Error::CommandFailed {
            command: "versions".to_string(),
            reason: "no 'overall' section in the running daemon versions".to_string(),
        }),
        1 => {
            let raw = running.overall.keys().next().map(String::as_str).unwrap_or_default();
            let running_version = EngineVersion::extract(raw)?;

            if running_version.is_identical(image) {
                debug!("Cluster and image versions are identical ({})", image);
                Ok(UpgradeDecision::NoChange)
            } else if image.is_superior(&running_version) {
                info!(
                    "Image version {} is higher than the running cluster version {}, upgrading",
                    image, running_version
                );
                Ok(UpgradeDecision::Upgrade)
            } else {
                Err(Error::DowngradeRefused {
                    image: image.to_string(),
                    running: running_version.to_string(),
                })
            }
        }
        _ => {
            warn!(
                "More than one engine version is running, treating as upgrade in progress: {:?}",
                running.overall
            );
            Ok(UpgradeDecision::InProgress)
        }
    }
}
