//! Firmware/bootloader release manifest and the gating checks derived from it.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::blocking_actions::BlockingAction;
use crate::error::ConfigError;
use crate::features::DeviceFeatures;

/// Contents of `releases.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareReleases {
    pub latest: LatestVersions,
    #[serde(default)]
    pub hashes: HashMappings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestVersions {
    pub firmware: VersionReleaseInfo,
    pub bootloader: VersionReleaseInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionReleaseInfo {
    pub version: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub hash: String,
}

/// hex hash -> version, for both images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashMappings {
    #[serde(default)]
    pub bootloader: HashMap<String, String>,
    #[serde(default)]
    pub firmware: HashMap<String, String>,
}

impl FirmwareReleases {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let releases = Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            "Loaded releases from {:?}: firmware v{}, bootloader v{}",
            path,
            releases.latest_firmware_version(),
            releases.latest_bootloader_version()
        );
        Ok(releases)
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn latest_firmware_version(&self) -> &str {
        self.latest.firmware.version.trim_start_matches('v')
    }

    pub fn latest_bootloader_version(&self) -> &str {
        self.latest.bootloader.version.trim_start_matches('v')
    }

    /// Look up a bootloader version from its hex-encoded hash.
    pub fn bootloader_version_for_hash(&self, hash: &str) -> Option<String> {
        match self.hashes.bootloader.get(hash) {
            Some(version) => Some(version.trim_start_matches('v').to_string()),
            None => {
                warn!("No bootloader version found for hash {}", hash);
                None
            }
        }
    }

    /// Gating actions for one device, in no particular order.
    ///
    /// A device in (or detected as being in) the bootloader gets a mandatory
    /// bootloader update when its version is older than the latest release
    /// or cannot be determined. A device running firmware only gets the
    /// bootloader update when its bootloader hash maps to a known, older
    /// release; unknown hashes there are left alone.
    pub fn evaluate_device(&self, device_id: &str, features: &DeviceFeatures) -> Vec<BlockingAction> {
        let mut actions = Vec::new();
        let latest_bootloader = self.latest_bootloader_version();
        let in_bootloader = features.is_oob_bootloader();

        if in_bootloader {
            let current = features
                .bootloader_version
                .clone()
                .unwrap_or_else(|| features.version.clone());
            match is_version_older(&current, latest_bootloader) {
                Ok(false) => {}
                Ok(true) => actions.push(BlockingAction::new_bootloader_update(device_id, &current, latest_bootloader)),
                Err(e) => {
                    warn!("{}: treating bootloader as outdated: {}", device_id, e);
                    actions.push(BlockingAction::new_bootloader_update(device_id, &current, latest_bootloader));
                }
            }
        } else if let Some(current) = features.bootloader_version.as_deref() {
            if let Ok(true) = is_version_older(current, latest_bootloader) {
                actions.push(BlockingAction::new_bootloader_update(device_id, current, latest_bootloader));
            }
        }

        if !in_bootloader {
            let latest_firmware = self.latest_firmware_version();
            match is_version_older(&features.version, latest_firmware) {
                Ok(true) => actions.push(BlockingAction::new_firmware_update(
                    device_id,
                    &features.version,
                    latest_firmware,
                )),
                Ok(false) => {}
                Err(e) => warn!("{}: cannot compare firmware versions: {}", device_id, e),
            }
        }

        actions.extend(baseline_actions(device_id, features));
        actions
    }
}

/// Gating that needs no release manifest: an uninitialized device running firmware.
pub fn baseline_actions(device_id: &str, features: &DeviceFeatures) -> Vec<BlockingAction> {
    if !features.initialized && !features.is_oob_bootloader() {
        vec![BlockingAction::new_device_initialization(device_id)]
    } else {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionComparison {
    Current,
    PatchBehind,
    MinorBehind,
    MajorBehind,
}

/// Returns `Ok(true)` if `current` < `required`; `Err` if either fails to parse.
pub fn is_version_older(current: &str, required: &str) -> Result<bool, String> {
    let current_version = parse_version(current)?;
    let required_version = parse_version(required)?;
    Ok(current_version < required_version)
}

pub fn compare_versions(current: &str, latest: &str) -> Result<VersionComparison, String> {
    let current_ver = parse_version(current)?;
    let latest_ver = parse_version(latest)?;

    Ok(match current_ver.cmp(&latest_ver) {
        Ordering::Less if current_ver.major < latest_ver.major => VersionComparison::MajorBehind,
        Ordering::Less if current_ver.minor < latest_ver.minor => VersionComparison::MinorBehind,
        Ordering::Less => VersionComparison::PatchBehind,
        Ordering::Equal => VersionComparison::Current,
        Ordering::Greater => {
            warn!("Device version {} is newer than latest known version {}", current, latest);
            VersionComparison::Current
        }
    })
}

fn parse_version(version: &str) -> Result<Version, String> {
    let trimmed = version.trim().trim_start_matches('v');
    Version::parse(trimmed).map_err(|e| format!("Failed to parse version '{}': {}", version, e))
}
