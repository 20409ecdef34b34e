//! Flashable target devices
//!
//! Every DFU device can be flashed with the generic profile, which sends the
//! binary as-is and trusts the device's own descriptors. Targets listed here
//! additionally get vendor quirks applied: container headers their boot ROMs
//! expect, size ceilings, and how they behave around detach and manifest.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, VariantNames};

use crate::{image_format::ImageFormat, transport::DeviceIdentity};

mod lpc43xx;

/// Bytes per DFU_DNLOAD block for devices that do not advertise a usable
/// transfer size of their own.
pub const DEFAULT_TRANSFER_SIZE: u16 = 2048;

/// All supported devices
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames, Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// LPC43xx series running the NXP on-chip DFU boot ROM
    Lpc43xx,
}

impl Chip {
    /// The flashing parameters of this chip.
    pub fn profile(&self) -> TargetProfile {
        match self {
            Chip::Lpc43xx => lpc43xx::PROFILE,
        }
    }
}

/// Device-specific flashing parameters
#[derive(Debug, Clone, Copy)]
pub struct TargetProfile {
    /// USB identity the profile is keyed on.
    pub vendor_id: u16,
    pub product_id: u16,
    /// The chip this profile belongs to, when it is a built-in one.
    pub chip: Option<Chip>,
    /// Bytes per DFU_DNLOAD block when the device's functional descriptor
    /// does not advertise a transfer size.
    pub transfer_size: u16,
    /// Ceiling on the firmware payload accepted by the device.
    pub max_image_size: Option<usize>,
    /// Whether a device found in run-time mode must be detached into its
    /// bootloader before it accepts transfers.
    pub requires_detach: bool,
    /// Whether the device drops off the bus once manifestation starts,
    /// making a disconnect at that point the expected outcome.
    pub disappears_after_manifest: bool,
    /// Container wrapped around the payload before download.
    pub format: ImageFormat,
}

impl TargetProfile {
    /// Conservative profile for devices without a dedicated entry.
    pub const fn generic(vendor_id: u16, product_id: u16) -> Self {
        TargetProfile {
            vendor_id,
            product_id,
            chip: None,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            max_image_size: None,
            requires_detach: true,
            disappears_after_manifest: false,
            format: ImageFormat::Raw,
        }
    }

    /// Human-readable name for listings.
    pub fn name(&self) -> &'static str {
        match self.chip {
            Some(Chip::Lpc43xx) => "lpc43xx",
            None => "generic",
        }
    }
}

/// Maps USB identities to the flashing parameters of known targets.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<TargetProfile>,
}

impl ProfileRegistry {
    /// A registry holding the built-in targets.
    pub fn new() -> Self {
        ProfileRegistry {
            profiles: Chip::iter().map(|chip| chip.profile()).collect(),
        }
    }

    /// Add an entry. Entries registered later shadow earlier ones with the
    /// same identity, letting user configuration override the built-ins.
    pub fn register(&mut self, profile: TargetProfile) {
        self.profiles.push(profile);
    }

    /// All registered profiles, in registration order.
    pub fn profiles(&self) -> impl Iterator<Item = &TargetProfile> {
        self.profiles.iter()
    }

    /// Find the profile registered for a USB identity.
    pub fn lookup(&self, vendor_id: u16, product_id: u16) -> Option<&TargetProfile> {
        self.profiles
            .iter()
            .rev()
            .find(|profile| profile.vendor_id == vendor_id && profile.product_id == product_id)
    }

    /// The profile to flash `device` with, falling back to the generic one
    /// for identities not in the registry.
    pub fn resolve(&self, device: &DeviceIdentity) -> TargetProfile {
        self.lookup(device.vendor_id, device.product_id)
            .copied()
            .unwrap_or_else(|| TargetProfile::generic(device.vendor_id, device.product_id))
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lpc43xx_is_registered_under_the_nxp_identity() {
        let registry = ProfileRegistry::new();
        let profile = registry.lookup(0x1fc9, 0x000c).unwrap();

        assert_eq!(profile.chip, Some(Chip::Lpc43xx));
        assert_eq!(profile.format, ImageFormat::Lpc);
        assert!(!profile.requires_detach);
        assert!(profile.disappears_after_manifest);
    }

    #[test]
    fn unknown_identities_resolve_to_the_generic_profile() {
        let registry = ProfileRegistry::new();
        let device = DeviceIdentity {
            vendor_id: 0x1209,
            product_id: 0x0001,
            bus: 1,
            address: 4,
            serial: None,
            product: None,
        };

        let profile = registry.resolve(&device);
        assert_eq!(profile.chip, None);
        assert_eq!(profile.format, ImageFormat::Raw);
        assert!(profile.requires_detach);
    }

    #[test]
    fn later_registrations_shadow_built_ins() {
        let mut registry = ProfileRegistry::new();

        let mut profile = Chip::Lpc43xx.profile();
        profile.transfer_size = 512;
        registry.register(profile);

        let resolved = registry.lookup(0x1fc9, 0x000c).unwrap();
        assert_eq!(resolved.transfer_size, 512);
    }
}
