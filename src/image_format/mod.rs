//! Firmware image containers
//!
//! Some boot ROMs expect the firmware binary wrapped in a vendor container
//! before it travels over DFU; this module builds those containers. The
//! payload itself is opaque to us.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

use crate::{error::Error, targets::TargetProfile};

pub(crate) mod lpc;

/// A raw firmware payload, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>) -> Self {
        FirmwareImage { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for FirmwareImage {
    fn from(data: Vec<u8>) -> Self {
        FirmwareImage::new(data)
    }
}

/// The encoded container actually sent to the device: any vendor header the
/// target's boot ROM expects, followed by the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImageContainer {
    data: Vec<u8>,
}

impl FlashImageContainer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Build the container `profile` mandates around `image`.
pub fn encode(
    image: &FirmwareImage,
    profile: &TargetProfile,
) -> Result<FlashImageContainer, Error> {
    let data = profile
        .format
        .encode(image.data(), profile.max_image_size)?;

    Ok(FlashImageContainer { data })
}

/// Container layouts understood by the encoder.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames, Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Send the binary exactly as supplied
    #[default]
    Raw,
    /// Prefix the binary with the LPC43xx boot ROM header
    Lpc,
}

impl ImageFormat {
    /// Wrap `payload` in this container, enforcing the target's size ceiling.
    ///
    /// The ceiling applies to the payload as supplied, before any container
    /// bytes are added.
    pub fn encode(&self, payload: &[u8], max_size: Option<usize>) -> Result<Vec<u8>, Error> {
        if payload.is_empty() {
            return Err(Error::ImageEmpty);
        }

        if let Some(max_size) = max_size {
            if payload.len() > max_size {
                return Err(Error::ImageTooLarge(payload.len(), max_size));
            }
        }

        match self {
            ImageFormat::Raw => Ok(payload.to_vec()),
            ImageFormat::Lpc => lpc::encode(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::ProfileRegistry;

    #[test]
    fn every_registered_profile_rejects_empty_and_oversized_images() {
        let registry = ProfileRegistry::new();

        for profile in registry.profiles() {
            let empty = FirmwareImage::new(Vec::new());
            assert!(matches!(encode(&empty, profile), Err(Error::ImageEmpty)));

            if let Some(max) = profile.max_image_size {
                let oversized = FirmwareImage::new(vec![0u8; max + 1]);
                assert!(matches!(
                    encode(&oversized, profile),
                    Err(Error::ImageTooLarge(_, _))
                ));
            }
        }
    }

    #[test]
    fn containers_end_with_the_exact_payload() {
        let registry = ProfileRegistry::new();
        let payload: Vec<u8> = (0u8..=63).collect();

        for profile in registry.profiles() {
            let image = FirmwareImage::new(payload.clone());
            let container = encode(&image, profile).unwrap();

            assert!(container.data().ends_with(&payload));
            assert!(container.len() >= payload.len());
        }
    }

    #[test]
    fn raw_format_passes_payload_through() {
        let payload = [0x01, 0x02, 0x03];
        let image = ImageFormat::Raw.encode(&payload, None).unwrap();

        assert_eq!(image, payload);
    }

    #[test]
    fn empty_payloads_are_rejected() {
        let err = ImageFormat::Raw.encode(&[], None).unwrap_err();

        assert!(matches!(err, Error::ImageEmpty));
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let payload = vec![0u8; 32];
        let err = ImageFormat::Raw.encode(&payload, Some(16)).unwrap_err();

        assert!(matches!(err, Error::ImageTooLarge(32, 16)));
    }

    #[test]
    fn size_ceiling_counts_payload_not_container() {
        let payload = vec![0u8; 16];

        // The LPC container adds 16 header bytes; they must not count
        // against the ceiling.
        let image = ImageFormat::Lpc.encode(&payload, Some(16)).unwrap();
        assert_eq!(image.len(), 32);
    }
}
