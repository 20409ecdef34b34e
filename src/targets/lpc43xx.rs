use super::{Chip, TargetProfile};
use crate::image_format::ImageFormat;

const VENDOR_ID: u16 = 0x1fc9;
const PRODUCT_ID: u16 = 0x000c;

/// The boot ROM loads into RAM, so the image ceiling is what the container's
/// 16-bit length field can express.
const MAX_IMAGE_SIZE: usize = u16::MAX as usize;

/// The LPC43xx boot ROM enumerates straight in DFU mode and leaves the bus
/// as soon as the uploaded program is started, so no detach is needed and a
/// disconnect during manifestation means the firmware is running.
pub(crate) const PROFILE: TargetProfile = TargetProfile {
    vendor_id: VENDOR_ID,
    product_id: PRODUCT_ID,
    chip: Some(Chip::Lpc43xx),
    transfer_size: 2048,
    max_image_size: Some(MAX_IMAGE_SIZE),
    requires_detach: false,
    disappears_after_manifest: true,
    format: ImageFormat::Lpc,
};
