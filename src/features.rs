use serde::{Deserialize, Serialize};

use crate::messages::Features;
use crate::updates::FirmwareReleases;

/// Snapshot of the device's `Features` reply.
///
/// Owned by the registry and replaced as a whole on refresh; nothing mutates
/// a snapshot in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFeatures {
    /// Device label or name
    pub label: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    /// Firmware variant (if any)
    pub firmware_variant: Option<String>,
    /// Unique device identifier reported by the firmware
    pub device_id: Option<String>,
    pub language: Option<String>,
    /// Whether the device is in bootloader mode
    pub bootloader_mode: bool,
    /// `major.minor.patch`; the bootloader version when in bootloader mode
    pub version: String,
    /// Firmware hash (hex encoded)
    pub firmware_hash: Option<String>,
    /// Bootloader hash (hex encoded)
    pub bootloader_hash: Option<String>,
    /// Bootloader version derived from hash
    pub bootloader_version: Option<String>,
    pub initialized: bool,
    /// Whether keys were imported from a computer
    pub imported: Option<bool>,
    /// Whether keys were not backed up during setup
    pub no_backup: bool,
    pub pin_protection: bool,
    /// Whether the PIN is currently cached (device unlocked)
    pub pin_cached: bool,
    pub passphrase_protection: bool,
    pub passphrase_cached: bool,
    pub wipe_code_protection: bool,
    pub auto_lock_delay_ms: Option<u64>,
    /// Enabled policies
    pub policies: Vec<String>,
}

impl DeviceFeatures {
    /// Convert a `Features` reply, resolving the bootloader version from the
    /// release manifest's hash table when one is available.
    pub fn from_message(features: Features, releases: Option<&FirmwareReleases>) -> Self {
        let bootloader_hash = features.bootloader_hash.as_deref().map(hex::encode);
        let bootloader_version = bootloader_hash
            .as_deref()
            .and_then(|hash| releases.and_then(|r| r.bootloader_version_for_hash(hash)));

        DeviceFeatures {
            bootloader_mode: features.bootloader_mode.unwrap_or(false),
            version: format!(
                "{}.{}.{}",
                features.major_version.unwrap_or(0),
                features.minor_version.unwrap_or(0),
                features.patch_version.unwrap_or(0)
            ),
            firmware_hash: features.firmware_hash.as_deref().map(hex::encode),
            bootloader_hash,
            bootloader_version,
            initialized: features.initialized.unwrap_or(false),
            imported: features.imported,
            no_backup: features.no_backup.unwrap_or(false),
            pin_protection: features.pin_protection.unwrap_or(false),
            pin_cached: features.pin_cached.unwrap_or(false),
            passphrase_protection: features.passphrase_protection.unwrap_or(false),
            passphrase_cached: features.passphrase_cached.unwrap_or(false),
            wipe_code_protection: features.wipe_code_protection.unwrap_or(false),
            auto_lock_delay_ms: features.auto_lock_delay_ms.map(u64::from),
            policies: features
                .policies
                .iter()
                .filter(|p| p.enabled())
                .map(|p| p.policy_name().to_string())
                .collect(),
            label: features.label,
            vendor: features.vendor,
            model: features.model,
            firmware_variant: features.firmware_variant,
            device_id: features.device_id,
            language: features.language,
        }
    }

    /// Out-of-box / legacy bootloader heuristic.
    ///
    /// Old bootloaders do not set `bootloader_mode` reliably, so a device is
    /// also treated as being in the bootloader when it reports the legacy
    /// version markers, or is uninitialized while claiming a 1.x version.
    pub fn is_oob_bootloader(&self) -> bool {
        self.bootloader_mode
            || self.version == "Legacy Bootloader"
            || self.version == "0.0.0"
            || (!self.initialized && self.version.starts_with("1."))
    }

    /// Whether an unlock is needed before signing.
    pub fn needs_pin(&self) -> bool {
        self.pin_protection && !self.pin_cached
    }

    pub fn needs_passphrase(&self) -> bool {
        self.passphrase_protection && !self.passphrase_cached
    }
}
