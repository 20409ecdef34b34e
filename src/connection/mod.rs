//! Establish a DFU session with a target device
//!
//! The [Connection] struct abstracts over the transport and the
//! sending/decoding of DFU class requests, and provides higher-level
//! operations on the device's status register and block pipeline.

use std::thread::sleep;

use log::{debug, trace};

use self::status::{DfuState, DfuStatus};
use crate::{
    command::{DfuRequest, DfuRequestKind},
    error::{ConnectionError, DeviceError, Error, ResultExt},
    transport::{DeviceHandle, Transport},
};

pub mod status;

const MAX_BUSY_POLLS: usize = 100;

/// An established DFU session with a target device
pub struct Connection {
    transport: Box<dyn Transport>,
    handle: DeviceHandle,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, handle: DeviceHandle) -> Self {
        debug!("Opened {} session with {}", handle.mode, handle.device);

        Connection { transport, handle }
    }

    /// The device this session is bound to.
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Largest number of payload bytes one DFU_DNLOAD block may carry,
    /// as advertised by the device's functional descriptor.
    pub fn transfer_size(&self) -> Option<usize> {
        self.handle
            .descriptor
            .map(|descriptor| descriptor.transfer_size as usize)
    }

    /// Give the transport back, releasing the claimed interface.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    /// Run a single DFU request and return the bytes of its data stage.
    pub fn send_request(&mut self, request: DfuRequest<'_>) -> Result<Vec<u8>, Error> {
        let kind = request.kind();
        trace!("Sending {:?} request", kind);

        let (control, data) = request.control(self.handle.interface);
        self.transport
            .control_transfer(&self.handle, control, data, kind.timeout())
            .map_err(|err| Error::Connection(err.into()))
            .for_request(kind)
    }

    /// Read and decode the device's status register.
    pub fn status(&mut self) -> Result<DfuStatus, Error> {
        let raw = self.send_request(DfuRequest::GetStatus)?;
        let status = DfuStatus::try_from(raw.as_slice())?;
        trace!("Device status: {:?}", status);

        Ok(status)
    }

    /// Read the device's current state without side effects.
    pub fn state(&mut self) -> Result<DfuState, Error> {
        let raw = self.send_request(DfuRequest::GetState)?;
        let byte = *raw.first().ok_or(ConnectionError::MalformedStatus(0))?;

        DfuState::from_repr(byte)
            .ok_or_else(|| ConnectionError::InvalidState(byte).into())
    }

    /// Clear a dfuERROR condition, returning the interface to dfuIDLE.
    pub fn clear_status(&mut self) -> Result<(), Error> {
        self.send_request(DfuRequest::ClrStatus)?;
        Ok(())
    }

    /// Abort a transfer in progress, returning the interface to dfuIDLE.
    pub fn abort(&mut self) -> Result<(), Error> {
        self.send_request(DfuRequest::Abort)?;
        Ok(())
    }

    /// Drive the interface to dfuIDLE, whatever state a previous session
    /// left it in.
    pub fn ensure_idle(&mut self) -> Result<(), Error> {
        let status = self.status()?;

        match status.state {
            DfuState::DfuIdle => Ok(()),
            DfuState::Error => {
                debug!("Clearing error state left by a previous session");
                self.clear_status()
            }
            state => {
                debug!("Aborting out of {} to reach dfuIDLE", state);
                self.abort()
            }
        }
    }

    /// Send one firmware block to the device.
    pub fn download_block(&mut self, block: u16, data: &[u8]) -> Result<(), Error> {
        self.send_request(DfuRequest::Dnload { block, data })?;
        Ok(())
    }

    /// Read one firmware block back from the device.
    pub fn upload_block(&mut self, block: u16, length: u16) -> Result<Vec<u8>, Error> {
        self.send_request(DfuRequest::Upload { block, length })
    }

    /// Poll the status register until the block sent by the last
    /// [download_block](Self::download_block) call has been programmed.
    ///
    /// The device names its own polling cadence: each busy response carries a
    /// `bwPollTimeout` hint which is honored before asking again.
    pub fn wait_block_complete(&mut self) -> Result<DfuStatus, Error> {
        for _ in 0..MAX_BUSY_POLLS {
            let status = self.status()?;

            if !status.is_ok() || status.state == DfuState::Error {
                return Err(self.reject(DfuRequestKind::Dnload, status));
            }

            match status.state {
                DfuState::DnloadSync | DfuState::DnBusy => {
                    trace!("Device busy, honoring {:?} poll hint", status.poll_timeout);
                    sleep(status.poll_timeout);
                }
                _ => return Ok(status),
            }
        }

        Err(Error::Timeout)
    }

    /// Poll the device through its manifestation phase after the final
    /// zero-length block has been acknowledged.
    ///
    /// Devices that drop off the bus while manifesting surface as a
    /// disconnect here; whether that counts as success is the caller's call.
    pub fn wait_manifest(&mut self) -> Result<DfuState, Error> {
        for _ in 0..MAX_BUSY_POLLS {
            let status = self.status()?;

            if !status.is_ok() || status.state == DfuState::Error {
                return Err(self.reject(DfuRequestKind::Dnload, status));
            }

            match status.state {
                DfuState::ManifestSync | DfuState::Manifest | DfuState::DnloadSync => {
                    trace!("Device manifesting, honoring {:?} poll hint", status.poll_timeout);
                    sleep(status.poll_timeout);
                }
                state => return Ok(state),
            }
        }

        Err(Error::Timeout)
    }

    /// Turn an error status into the corresponding [Error], clearing the
    /// device's error state along the way so it remains usable.
    fn reject(&mut self, request: DfuRequestKind, status: DfuStatus) -> Error {
        debug!(
            "Device rejected {:?} with {:?} in state {}",
            request, status.status, status.state
        );

        if let Err(err) = self.clear_status() {
            debug!("Could not clear the device's error state: {}", err);
        }

        DeviceError::new(request, status.status).into()
    }
}
