//! Command-line interface configuration
//!
//! [dfuflash] reads an optional `dfuflash.toml`; the [Config] type handles
//! locating and loading it. Each `[[usb_device]]` entry names a USB identity
//! and, optionally, overrides for the target profile used to flash it.
//!
//! [dfuflash]: https://crates.io/crates/dfuflash

use std::{fs::read_to_string, path::PathBuf};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    image_format::ImageFormat,
    targets::{Chip, ProfileRegistry, TargetProfile},
};

/// A configured, known USB device
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
    /// Treat the device as this chip instead of resolving its identity
    /// against the built-in profiles
    #[serde(default)]
    pub chip: Option<Chip>,
    /// Block size for DFU_DNLOAD transfers, in bytes
    #[serde(default)]
    pub transfer_size: Option<u16>,
    /// Largest firmware payload the device accepts, in bytes
    #[serde(default)]
    pub max_image_size: Option<usize>,
    /// Whether run-time firmware must be detached before flashing
    #[serde(default)]
    pub requires_detach: Option<bool>,
    /// Whether the device leaves the bus once manifestation starts
    #[serde(default)]
    pub disappears_after_manifest: Option<bool>,
    /// Container format wrapped around payloads for this device
    #[serde(default)]
    pub format: Option<ImageFormat>,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    let int = u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)?;

    Ok(int)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let hex_string = format!("{decimal:04x}");
    serializer.serialize_str(&hex_string)
}

impl UsbDevice {
    /// Build the target profile for this entry, layering the configured
    /// overrides over the chip profile or the built-in lookup.
    fn profile(&self, registry: &ProfileRegistry) -> Result<TargetProfile, Error> {
        if self.transfer_size == Some(0) {
            return Err(Error::Config(format!(
                "transfer_size must not be zero for device {:04x}:{:04x}",
                self.vid, self.pid
            )));
        }

        let mut profile = match self.chip {
            Some(chip) => chip.profile(),
            None => match registry.lookup(self.vid, self.pid) {
                Some(profile) => *profile,
                None => TargetProfile::generic(self.vid, self.pid),
            },
        };
        profile.vendor_id = self.vid;
        profile.product_id = self.pid;

        if let Some(transfer_size) = self.transfer_size {
            profile.transfer_size = transfer_size;
        }
        if let Some(max_image_size) = self.max_image_size {
            profile.max_image_size = Some(max_image_size);
        }
        if let Some(requires_detach) = self.requires_detach {
            profile.requires_detach = requires_detach;
        }
        if let Some(disappears) = self.disappears_after_manifest {
            profile.disappears_after_manifest = disappears;
        }
        if let Some(format) = self.format {
            profile.format = format;
        }

        Ok(profile)
    }
}

/// Configuration for the command-line frontend
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Known USB devices and their flashing overrides
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

impl Config {
    /// Load configuration from the configuration file, if one exists.
    pub fn load() -> Result<Self, Error> {
        let Some(path) = Self::config_path() else {
            return Ok(Self::default());
        };
        let Ok(raw) = read_to_string(&path) else {
            return Ok(Self::default());
        };

        let config = toml::from_str::<Self>(&raw)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    /// Register a profile for every configured device, shadowing built-in
    /// profiles with the same identity.
    pub fn extend_registry(&self, registry: &mut ProfileRegistry) -> Result<(), Error> {
        for device in &self.usb_device {
            let profile = device.profile(registry)?;
            registry.register(profile);
        }

        Ok(())
    }

    fn config_path() -> Option<PathBuf> {
        let local_config = std::env::current_dir().ok()?.join("dfuflash.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let project_dirs = ProjectDirs::from("", "", "dfuflash")?;
        Some(project_dirs.config_dir().join("dfuflash.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_identities_with_and_without_prefix() {
        let config: Config = toml::from_str(
            r#"
            [[usb_device]]
            vid = "0x1fc9"
            pid = "000c"
            "#,
        )
        .unwrap();

        assert_eq!(config.usb_device[0].vid, 0x1fc9);
        assert_eq!(config.usb_device[0].pid, 0x000c);
    }

    #[test]
    fn rejects_unknown_keys() {
        let result = toml::from_str::<Config>(
            r#"
            [[usb_device]]
            vid = "1fc9"
            pid = "000c"
            transfersize = 64
            "#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn overrides_layer_over_built_in_profiles() {
        let config: Config = toml::from_str(
            r#"
            [[usb_device]]
            vid = "1fc9"
            pid = "000c"
            transfer_size = 64
            "#,
        )
        .unwrap();

        let mut registry = ProfileRegistry::new();
        config.extend_registry(&mut registry).unwrap();

        let profile = registry.lookup(0x1fc9, 0x000c).unwrap();
        assert_eq!(profile.chip, Some(Chip::Lpc43xx));
        assert_eq!(profile.transfer_size, 64);
        assert_eq!(profile.format, ImageFormat::Lpc);
    }

    #[test]
    fn unknown_identities_start_from_the_generic_profile() {
        let config: Config = toml::from_str(
            r#"
            [[usb_device]]
            vid = "1209"
            pid = "4742"
            disappears_after_manifest = true
            "#,
        )
        .unwrap();

        let mut registry = ProfileRegistry::new();
        config.extend_registry(&mut registry).unwrap();

        let profile = registry.lookup(0x1209, 0x4742).unwrap();
        assert_eq!(profile.chip, None);
        assert!(profile.disappears_after_manifest);
        assert_eq!(profile.format, ImageFormat::Raw);
    }

    #[test]
    fn chip_entries_start_from_the_chip_profile() {
        let config: Config = toml::from_str(
            r#"
            [[usb_device]]
            vid = "cafe"
            pid = "0001"
            chip = "lpc43xx"
            "#,
        )
        .unwrap();

        let mut registry = ProfileRegistry::new();
        config.extend_registry(&mut registry).unwrap();

        let profile = registry.lookup(0xcafe, 0x0001).unwrap();
        assert_eq!(profile.chip, Some(Chip::Lpc43xx));
        assert_eq!(profile.format, ImageFormat::Lpc);
        assert_eq!(profile.vendor_id, 0xcafe);
    }

    #[test]
    fn zero_transfer_size_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[usb_device]]
            vid = "1fc9"
            pid = "000c"
            transfer_size = 0
            "#,
        )
        .unwrap();

        let mut registry = ProfileRegistry::new();
        assert!(config.extend_registry(&mut registry).is_err());
    }

    #[test]
    fn identities_survive_a_serialize_round_trip() {
        let config = Config {
            usb_device: vec![UsbDevice {
                vid: 0x1fc9,
                pid: 0x000c,
                transfer_size: Some(64),
                ..UsbDevice::default()
            }],
        };

        let rendered = toml::to_string(&config).unwrap();
        // Identities are written as zero-padded hex, matching what the
        // deserializer accepts.
        assert!(rendered.contains(r#"vid = "1fc9""#));
        assert!(rendered.contains(r#"pid = "000c""#));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.usb_device[0].vid, 0x1fc9);
        assert_eq!(parsed.usb_device[0].pid, 0x000c);
        assert_eq!(parsed.usb_device[0].transfer_size, Some(64));
    }
}
