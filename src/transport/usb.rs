//! nusb-backed transport

use std::{collections::HashMap, io, time::Duration};

use log::debug;
use nusb::transfer::{Control, ControlType, Recipient, TransferError};

use crate::{
    command::{DfuRequest, DfuRequestKind},
    transport::{
        ControlDirection, ControlRequest, DeviceHandle, DeviceIdentity, DfuMode,
        FunctionalDescriptor, Transport, TransportError, DFU_INTERFACE_CLASS,
        DFU_INTERFACE_SUBCLASS,
    },
};

/// [`Transport`] implementation over the nusb blocking API.
///
/// Claimed interfaces are kept per device until the device detaches or the
/// transport is dropped, so one instance can follow a device across the
/// detach/re-enumerate cycle of a firmware upload.
#[derive(Default)]
pub struct UsbTransport {
    claimed: HashMap<(u8, u8), nusb::Interface>,
}

impl UsbTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn interface(&self, handle: &DeviceHandle) -> Result<&nusb::Interface, TransportError> {
        self.claimed
            .get(&(handle.device.bus, handle.device.address))
            .ok_or(TransportError::Disconnected)
    }
}

fn identity_of(info: &nusb::DeviceInfo) -> DeviceIdentity {
    DeviceIdentity {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        bus: info.bus_number(),
        address: info.device_address(),
        serial: info.serial_number().map(str::to_string),
        product: info.product_string().map(str::to_string),
    }
}

fn is_dfu_capable(info: &nusb::DeviceInfo) -> bool {
    // The OS caches interface classes, so no device needs to be opened to
    // answer this.
    info.interfaces().any(|interface| {
        interface.class() == DFU_INTERFACE_CLASS && interface.subclass() == DFU_INTERFACE_SUBCLASS
    })
}

fn map_transfer_error(err: TransferError) -> TransportError {
    match err {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        // The blocking API cancels the transfer once the deadline passes.
        TransferError::Cancelled => TransportError::TimedOut,
        other => TransportError::Io(io::Error::other(other)),
    }
}

impl Transport for UsbTransport {
    fn enumerate(&mut self) -> Result<Vec<DeviceIdentity>, TransportError> {
        let devices = nusb::list_devices()?
            .filter(is_dfu_capable)
            .map(|info| identity_of(&info))
            .collect();

        Ok(devices)
    }

    fn claim(&mut self, device: &DeviceIdentity) -> Result<DeviceHandle, TransportError> {
        let info = nusb::list_devices()?
            .find(|info| {
                info.bus_number() == device.bus && info.device_address() == device.address
            })
            .ok_or(TransportError::Disconnected)?;

        let usb_device = info.open()?;
        let configuration = usb_device
            .active_configuration()
            .map_err(io::Error::other)?;

        let group = configuration
            .interfaces()
            .find(|group| {
                group.alt_settings().any(|alt| {
                    alt.class() == DFU_INTERFACE_CLASS && alt.subclass() == DFU_INTERFACE_SUBCLASS
                })
            })
            .ok_or(TransportError::NoDfuInterface)?;
        let alt = group
            .alt_settings()
            .next()
            .ok_or(TransportError::NoDfuInterface)?;

        let interface_number = alt.interface_number();
        let mode = DfuMode::from_protocol(alt.protocol());
        let descriptor = alt
            .descriptors()
            .find(|desc| desc.descriptor_type() == FunctionalDescriptor::TYPE)
            .and_then(|desc| FunctionalDescriptor::parse(&desc));

        // Displaces a bound kernel driver (usbfs on Linux) before claiming,
        // so the interface is ours once this returns.
        let interface = usb_device.detach_and_claim_interface(interface_number)?;
        debug!(
            "Claimed interface {} on {} ({} mode)",
            interface_number, device, mode
        );

        self.claimed.insert((device.bus, device.address), interface);

        Ok(DeviceHandle {
            device: device.clone(),
            interface: interface_number,
            mode,
            descriptor,
        })
    }

    fn detach(&mut self, handle: &DeviceHandle, timeout: Duration) -> Result<(), TransportError> {
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let (request, data) = DfuRequest::Detach { timeout_ms }.control(handle.interface);

        let result = self.control_transfer(handle, request, data, DfuRequestKind::Detach.timeout());

        // The handle is spent either way; the device leaves the bus to
        // re-enumerate in its other mode.
        self.claimed.remove(&(handle.device.bus, handle.device.address));

        match result {
            Ok(_) => Ok(()),
            // Will-detach devices can drop off the bus before the request
            // completes; that is the detach succeeding.
            Err(TransportError::Disconnected) => {
                debug!("Device {} left the bus during detach", handle.device);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn control_transfer(
        &mut self,
        handle: &DeviceHandle,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let interface = self.interface(handle)?;
        let control = Control {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: request.request,
            value: request.value,
            index: request.index,
        };

        match request.direction {
            ControlDirection::Out => {
                let written = interface
                    .control_out_blocking(control, data, timeout)
                    .map_err(map_transfer_error)?;
                if written != data.len() {
                    return Err(TransportError::Io(io::Error::other("short control write")));
                }

                Ok(Vec::new())
            }
            ControlDirection::In { length } => {
                let mut buffer = vec![0; length as usize];
                let read = interface
                    .control_in_blocking(control, &mut buffer, timeout)
                    .map_err(map_transfer_error)?;
                buffer.truncate(read);

                Ok(buffer)
            }
        }
    }
}
