//! Write a firmware image to a target device
//!
//! The [Flasher] struct abstracts over a DFU session and provides the
//! download, read-back and detach operations, applying the quirks carried
//! by the target's profile.

use std::{
    fmt,
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    connection::{
        status::{DfuState, DfuStatus, DfuStatusCode},
        Connection,
    },
    error::{ConnectionError, Error, ResultExt as _},
    image_format::{self, FirmwareImage},
    progress::{CancelToken, ProgressCallbacks},
    targets::{Chip, ProfileRegistry, TargetProfile},
    transport::{DeviceHandle, DeviceIdentity, DfuMode, FunctionalDescriptor, Transport},
};

/// Re-enumeration after a detach is polled at this interval.
const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a detached device gets to reappear before we give up.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Detach window granted to devices whose descriptor does not name one.
const DEFAULT_DETACH_WINDOW: Duration = Duration::from_secs(1);

/// Information about the device a [Flasher] is connected to
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// USB identity
    pub device: DeviceIdentity,
    /// Run-time or DFU mode
    pub mode: DfuMode,
    /// Current protocol state
    pub state: DfuState,
    /// Current status code
    pub status: DfuStatusCode,
    /// The DFU functional descriptor, when the device publishes one
    pub descriptor: Option<FunctionalDescriptor>,
}

/// Bookkeeping for one firmware download.
#[derive(Debug)]
struct UploadSession {
    /// Next DFU_DNLOAD block number. Wraps, as the protocol allows.
    block: u16,
    /// Bytes acknowledged by the device so far.
    sent: usize,
    total: usize,
    /// Status the device returned for the most recent block.
    last_status: Option<DfuStatus>,
    started: Instant,
}

impl UploadSession {
    fn new(total: usize) -> Self {
        UploadSession {
            block: 0,
            sent: 0,
            total,
            last_status: None,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, bytes: usize, status: DfuStatus) {
        self.block = self.block.wrapping_add(1);
        self.sent += bytes;
        self.last_status = Some(status);
    }

    fn remaining(&self) -> usize {
        self.total - self.sent
    }
}

/// Connect to and flash a target device
pub struct Flasher {
    /// DFU session used for all transfers
    connection: Connection,
    /// Parameters of the device being flashed
    profile: TargetProfile,
    /// Indicate verifying flash contents after flashing
    verify: bool,
}

// The transport trait object has no Debug bound, so the session is elided.
impl fmt::Debug for Flasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flasher")
            .field("profile", &self.profile)
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl Flasher {
    /// Claim `device` and, when its profile asks for it, detach it out of
    /// run-time mode and wait for the bootloader to re-enumerate.
    ///
    /// The interface is always claimed before any detach request goes out,
    /// so a failing claim can never leave the device half-detached.
    pub fn connect(
        mut transport: Box<dyn Transport>,
        device: &DeviceIdentity,
        chip: Option<Chip>,
        registry: &ProfileRegistry,
        verify: bool,
    ) -> Result<Self, Error> {
        let profile = match chip {
            Some(chip) => chip.profile(),
            None => registry.resolve(device),
        };
        debug!("Using the {} profile for {}", profile.name(), device);

        let mut handle = transport.claim(device)?;

        if handle.mode == DfuMode::Runtime {
            if profile.requires_detach {
                handle = detach_and_reconnect(transport.as_mut(), handle, device)?;
            } else {
                warn!("Device is in run-time mode but its profile expects no detach");
            }
        }

        Ok(Flasher {
            connection: Connection::new(transport, handle),
            profile,
            verify,
        })
    }

    /// Switch a run-time device into its bootloader without flashing
    /// anything.
    pub fn detach_only(
        mut transport: Box<dyn Transport>,
        device: &DeviceIdentity,
    ) -> Result<(), Error> {
        let handle = transport.claim(device)?;

        if handle.mode == DfuMode::Dfu {
            info!("Device is already in DFU mode");
            return Ok(());
        }

        detach_and_reconnect(transport.as_mut(), handle, device)?;

        Ok(())
    }

    /// The session underlying this flasher.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// The profile the device is being flashed with.
    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    /// Identity, mode and live DFU status of the connected device.
    pub fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let handle = self.connection.handle().clone();
        let status = self.connection.status()?;

        Ok(DeviceInfo {
            device: handle.device,
            mode: handle.mode,
            state: status.state,
            status: status.status,
            descriptor: handle.descriptor,
        })
    }

    /// Encode `image` for the target and download it block by block,
    /// then drive the device through manifestation.
    pub fn upload_firmware(
        &mut self,
        image: &FirmwareImage,
        mut progress: Option<&mut dyn ProgressCallbacks>,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        if let Some(descriptor) = self.connection.handle().descriptor {
            if !descriptor.can_download() {
                return Err(Error::DownloadNotSupported);
            }
        }

        let container = image_format::encode(image, &self.profile)?;
        let chunk_size = self.transfer_size();
        let total = container.len();

        info!("Flashing {}B in blocks of up to {}B", total, chunk_size);

        self.connection.ensure_idle().flashing()?;

        let mut session = UploadSession::new(total);
        if let Some(progress) = progress.as_mut() {
            progress.init(total);
        }

        for chunk in container.data().chunks(chunk_size) {
            if cancel.is_cancelled() {
                info!("Cancelled with {}B left to send", session.remaining());
                return Err(Error::Cancelled);
            }

            let block = session.block;
            self.connection.download_block(block, chunk).flashing()?;
            let status = self.connection.wait_block_complete().flashing()?;

            session.advance(chunk.len(), status);
            debug!(
                "Block {} acknowledged in {} ({}B remaining)",
                block,
                status.state,
                session.remaining()
            );

            if let Some(progress) = progress.as_mut() {
                progress.update(session.sent);
            }
        }

        if let Some(progress) = progress.as_mut() {
            progress.finish();
        }

        // An empty block tells the device the download is complete. Devices
        // that reset on manifest often drop off the bus right here, so a
        // disconnect is not a failure for them.
        let device_gone = match self
            .connection
            .download_block(session.block, &[])
            .flashing()
        {
            Ok(()) => false,
            Err(err) if self.profile.disappears_after_manifest && is_disconnect(&err) => {
                debug!(
                    "Device left the bus on the final block (last status: {:?})",
                    session.last_status
                );
                true
            }
            Err(err) => return Err(err),
        };

        if !device_gone {
            match self.connection.wait_manifest().flashing() {
                Ok(state) => debug!("Manifestation finished in {} state", state),
                Err(err) if self.profile.disappears_after_manifest && is_disconnect(&err) => {
                    debug!("Device left the bus while manifesting");
                }
                Err(err) => return Err(err),
            }
        }

        debug!("Flashed {}B in {:?}", session.sent, session.started.elapsed());
        info!("Flashing has completed!");

        if self.verify {
            if self.profile.disappears_after_manifest {
                warn!("Cannot verify: the device leaves the bus after flashing");
            } else {
                info!("Verifying flash contents");

                let readback = self.read_firmware()?;
                if readback.len() < container.len()
                    || &readback[..container.len()] != container.data()
                {
                    return Err(Error::VerifyFailed);
                }

                info!("Verification complete");
            }
        }

        Ok(())
    }

    /// Read the device's current firmware back, draining DFU_UPLOAD blocks
    /// until the device sends a short one.
    ///
    /// Fails with [Error::Timeout] after a full block-number cycle, for
    /// devices that never send one.
    pub fn read_firmware(&mut self) -> Result<Vec<u8>, Error> {
        if let Some(descriptor) = self.connection.handle().descriptor {
            if !descriptor.can_upload() {
                return Err(Error::UploadNotSupported);
            }
        }

        let chunk_size = self.transfer_size();

        self.connection.ensure_idle().flashing()?;
        info!("Reading firmware back in blocks of up to {}B", chunk_size);

        let mut firmware = Vec::new();
        let mut block: u16 = 0;

        loop {
            let data = self
                .connection
                .upload_block(block, chunk_size as u16)
                .flashing()?;
            let done = data.len() < chunk_size;

            firmware.extend_from_slice(&data);
            block = block.wrapping_add(1);

            if done {
                break;
            }

            // A device that never sends a short block would keep us reading
            // forever; give up once the 16-bit block counter wraps.
            if block == 0 {
                return Err(Error::Timeout);
            }
        }

        info!("Read {}B", firmware.len());

        Ok(firmware)
    }

    /// Give the transport back, releasing the claimed interface.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.connection.into_transport()
    }

    /// Effective DFU_DNLOAD block size: the device's advertised transfer
    /// size capped by the profile's, or the profile's alone when the
    /// descriptor is silent.
    fn transfer_size(&self) -> usize {
        let profile_size = self.profile.transfer_size as usize;

        match self.connection.transfer_size() {
            Some(size) if size > 0 => profile_size.min(size),
            _ => profile_size,
        }
    }
}

fn is_disconnect(err: &Error) -> bool {
    matches!(
        err,
        Error::Connection(ConnectionError::Disconnected)
            | Error::Flashing(ConnectionError::Disconnected)
    )
}

/// Ask a run-time device to detach, then poll the bus until its bootloader
/// comes back. Stops as soon as the device reappears in DFU mode rather
/// than waiting out a fixed delay.
fn detach_and_reconnect(
    transport: &mut dyn Transport,
    handle: DeviceHandle,
    device: &DeviceIdentity,
) -> Result<DeviceHandle, Error> {
    let detach_window = handle
        .descriptor
        .filter(|descriptor| descriptor.detach_timeout > 0)
        .map(|descriptor| Duration::from_millis(descriptor.detach_timeout as u64))
        .unwrap_or(DEFAULT_DETACH_WINDOW);

    if let Some(descriptor) = handle.descriptor {
        if !descriptor.will_detach() {
            warn!("Device does not advertise self-detach; a manual reset may be needed");
        }
    }

    info!("Detaching device into its bootloader");
    transport.detach(&handle, detach_window)?;

    let deadline = Instant::now() + RECONNECT_TIMEOUT;

    loop {
        if let Ok(devices) = transport.enumerate() {
            let candidate = devices
                .into_iter()
                .find(|candidate| candidate.matches_id(device.vendor_id, device.product_id));

            if let Some(candidate) = candidate {
                // Claim failures here just mean the device is still
                // settling; keep polling until the deadline.
                match transport.claim(&candidate) {
                    Ok(reclaimed) if reclaimed.mode == DfuMode::Dfu => {
                        info!("Device re-enumerated as {}", reclaimed.device);
                        return Ok(reclaimed);
                    }
                    Ok(_) => debug!("Device is back but still in run-time mode"),
                    Err(err) => debug!("Device not claimable yet: {}", err),
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(Error::ReconnectTimeout);
        }

        sleep(RECONNECT_POLL_INTERVAL);
    }
}
