//! Device transport abstraction
//!
//! The flashing core never talks to the USB stack directly. Everything it
//! needs from the bus is behind the [`Transport`] trait: listing DFU-capable
//! devices, claiming an interface, asking a device to detach into its
//! bootloader, and issuing class control transfers. The `usb` feature
//! provides [`usb::UsbTransport`], the nusb-backed implementation used by the
//! command-line tool; test suites substitute scripted implementations.

use std::{
    fmt::{self, Display, Formatter},
    io,
    time::Duration,
};

use bitflags::bitflags;
use thiserror::Error;

#[cfg(feature = "usb")]
#[cfg_attr(docsrs, doc(cfg(feature = "usb")))]
pub mod usb;

/// Interface class of a DFU-capable interface (application specific).
pub const DFU_INTERFACE_CLASS: u8 = 0xfe;
/// Interface subclass identifying DFU within the application-specific class.
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
/// `bInterfaceProtocol` of an interface in run-time mode.
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
/// `bInterfaceProtocol` of an interface in DFU (bootloader) mode.
pub const DFU_PROTOCOL_DFU: u8 = 0x02;

/// Errors produced by a [`Transport`] implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The device is no longer on the bus.
    #[error("Device disconnected")]
    Disconnected,

    /// The device stalled the control request.
    #[error("Control request stalled by the device")]
    Stall,

    /// The control request did not complete within its timeout.
    #[error("Control request timed out")]
    TimedOut,

    /// The device exposes no DFU interface.
    #[error("No DFU interface found on the device")]
    NoDfuInterface,

    /// Opening or claiming the device failed.
    #[error("USB I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Identity of one device on the bus, as reported by [`Transport::enumerate`].
///
/// The vendor/product pair keys the target profile registry; bus and address
/// pin down one physical device when several share an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub serial: Option<String>,
    pub product: Option<String>,
}

impl DeviceIdentity {
    /// Whether this device matches a `vid:pid` selector.
    pub fn matches_id(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {}, device {})",
            self.vendor_id, self.product_id, self.bus, self.address
        )?;
        if let Some(product) = &self.product {
            write!(f, " {product}")?;
        }
        Ok(())
    }
}

/// Mode of a claimed DFU interface, from `bInterfaceProtocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DfuMode {
    /// The device is running its application and must detach before it can
    /// accept firmware.
    #[strum(serialize = "run-time")]
    Runtime,
    /// The device is in its bootloader, ready for transfers.
    #[strum(serialize = "DFU")]
    Dfu,
}

impl DfuMode {
    /// Decode the interface protocol byte. Devices that leave it zero are
    /// treated as already being in DFU mode, matching how ROM bootloaders
    /// without a run-time personality report themselves.
    pub fn from_protocol(protocol: u8) -> Self {
        match protocol {
            DFU_PROTOCOL_RUNTIME => DfuMode::Runtime,
            _ => DfuMode::Dfu,
        }
    }
}

bitflags! {
    /// `bmAttributes` of the DFU functional descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DfuAttributes: u8 {
        /// Device accepts DFU_DNLOAD (`bitCanDnload`).
        const CAN_DOWNLOAD = 1 << 0;
        /// Device answers DFU_UPLOAD (`bitCanUpload`).
        const CAN_UPLOAD = 1 << 1;
        /// Device stays on the bus after manifestation
        /// (`bitManifestationTolerant`).
        const MANIFESTATION_TOLERANT = 1 << 2;
        /// Device detaches itself after DFU_DETACH, without a host-side USB
        /// reset (`bitWillDetach`).
        const WILL_DETACH = 1 << 3;
    }
}

/// Parsed DFU functional descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub attributes: DfuAttributes,
    /// Longest the device will wait for a reset after DFU_DETACH, in
    /// milliseconds (`wDetachTimeOut`).
    pub detach_timeout: u16,
    /// Largest block the device accepts per DFU_DNLOAD (`wTransferSize`).
    pub transfer_size: u16,
    /// BCD protocol revision (`bcdDFUVersion`).
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    /// `bDescriptorType` of the DFU functional descriptor.
    pub const TYPE: u8 = 0x21;
    /// Descriptor length in bytes.
    pub const LENGTH: usize = 9;

    /// Decode the raw descriptor, starting at its `bLength` byte.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::LENGTH || raw[1] != Self::TYPE {
            return None;
        }

        Some(Self {
            attributes: DfuAttributes::from_bits_truncate(raw[2]),
            detach_timeout: u16::from_le_bytes([raw[3], raw[4]]),
            transfer_size: u16::from_le_bytes([raw[5], raw[6]]),
            dfu_version: u16::from_le_bytes([raw[7], raw[8]]),
        })
    }

    pub fn can_download(&self) -> bool {
        self.attributes.contains(DfuAttributes::CAN_DOWNLOAD)
    }

    pub fn can_upload(&self) -> bool {
        self.attributes.contains(DfuAttributes::CAN_UPLOAD)
    }

    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes.contains(DfuAttributes::MANIFESTATION_TOLERANT)
    }

    pub fn will_detach(&self) -> bool {
        self.attributes.contains(DfuAttributes::WILL_DETACH)
    }
}

/// One claimed DFU interface on one device.
///
/// Returned by [`Transport::claim`]; passed back into every subsequent
/// transport operation. A successful [`Transport::detach`] invalidates the
/// handle, since the device leaves the bus to re-enumerate.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub device: DeviceIdentity,
    /// `bInterfaceNumber` of the claimed DFU interface.
    pub interface: u8,
    pub mode: DfuMode,
    /// The DFU functional descriptor, when the device publishes one.
    pub descriptor: Option<FunctionalDescriptor>,
}

/// Direction of the data stage of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirection {
    /// Host to device; the payload travels with the request.
    Out,
    /// Device to host; up to `length` bytes come back.
    In { length: u16 },
}

/// A class control request addressed to the claimed interface.
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest {
    pub direction: ControlDirection,
    /// `bRequest`.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`; the flashing core always sets this to the interface number.
    pub index: u16,
}

/// Control-transfer surface the flashing core runs on.
///
/// One instance serves one upload session; implementations only need to
/// support sequential calls. Claiming must select the device configuration
/// and displace any kernel driver bound to the interface before the claim,
/// so that the first control transfer the core issues cannot race a
/// competing driver.
pub trait Transport {
    /// List DFU-capable devices currently on the bus.
    fn enumerate(&mut self) -> Result<Vec<DeviceIdentity>, TransportError>;

    /// Open `device` and claim its DFU interface.
    fn claim(&mut self, device: &DeviceIdentity) -> Result<DeviceHandle, TransportError>;

    /// Issue a DFU_DETACH request asking the device to enter its bootloader
    /// within `timeout`. The handle is spent afterwards; callers re-claim
    /// once the device has re-enumerated.
    fn detach(&mut self, handle: &DeviceHandle, timeout: Duration) -> Result<(), TransportError>;

    /// Perform one synchronous control transfer on the claimed interface.
    ///
    /// `data` is the OUT payload and must be empty for IN requests; the
    /// returned bytes are the IN response and empty for OUT requests.
    fn control_transfer(
        &mut self,
        handle: &DeviceHandle,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_functional_descriptor() {
        // bLength, bDescriptorType, bmAttributes, wDetachTimeOut,
        // wTransferSize, bcdDFUVersion
        let raw = [0x09, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x08, 0x1a, 0x01];
        let desc = FunctionalDescriptor::parse(&raw).unwrap();

        assert!(desc.can_download());
        assert!(desc.can_upload());
        assert!(!desc.manifestation_tolerant());
        assert!(desc.will_detach());
        assert_eq!(desc.detach_timeout, 255);
        assert_eq!(desc.transfer_size, 2048);
        assert_eq!(desc.dfu_version, 0x011a);
    }

    #[test]
    fn rejects_short_or_foreign_descriptors() {
        assert!(FunctionalDescriptor::parse(&[0x09, 0x21, 0x0f]).is_none());

        let endpoint = [0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x01, 0x00, 0x00];
        assert!(FunctionalDescriptor::parse(&endpoint).is_none());
    }

    #[test]
    fn protocol_byte_maps_to_mode() {
        assert_eq!(DfuMode::from_protocol(1), DfuMode::Runtime);
        assert_eq!(DfuMode::from_protocol(2), DfuMode::Dfu);
        assert_eq!(DfuMode::from_protocol(0), DfuMode::Dfu);
    }
}
