//! Decoding of the DFU status register

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::error::ConnectionError;

/// Interface states of the DFU 1.1 protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum DfuState {
    #[strum(serialize = "appIDLE")]
    AppIdle = 0x00,
    #[strum(serialize = "appDETACH")]
    AppDetach = 0x01,
    #[strum(serialize = "dfuIDLE")]
    DfuIdle = 0x02,
    #[strum(serialize = "dfuDNLOAD-SYNC")]
    DnloadSync = 0x03,
    #[strum(serialize = "dfuDNBUSY")]
    DnBusy = 0x04,
    #[strum(serialize = "dfuDNLOAD-IDLE")]
    DnloadIdle = 0x05,
    #[strum(serialize = "dfuMANIFEST-SYNC")]
    ManifestSync = 0x06,
    #[strum(serialize = "dfuMANIFEST")]
    Manifest = 0x07,
    #[strum(serialize = "dfuMANIFEST-WAIT-RESET")]
    ManifestWaitReset = 0x08,
    #[strum(serialize = "dfuUPLOAD-IDLE")]
    UploadIdle = 0x09,
    #[strum(serialize = "dfuERROR")]
    Error = 0x0a,
}

/// Status codes a device reports in its DFU_GETSTATUS response.
///
/// The messages are the conditions the DFU 1.1 specification assigns to each
/// code; devices report them verbatim and so do we.
#[derive(Copy, Clone, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum DfuStatusCode {
    #[error("No error condition is present")]
    Ok = 0x00,

    #[error("File is not targeted for use by this device")]
    ErrTarget = 0x01,

    #[error("File fails a vendor-specific verification test")]
    ErrFile = 0x02,

    #[error("Device is unable to write memory")]
    ErrWrite = 0x03,

    #[error("Memory erase function failed")]
    ErrErase = 0x04,

    #[error("Memory erase check failed")]
    ErrCheckErased = 0x05,

    #[error("Program memory function failed")]
    ErrProg = 0x06,

    #[error("Programmed memory failed verification")]
    ErrVerify = 0x07,

    #[error("Received address is out of range")]
    ErrAddress = 0x08,

    #[error("Received a final block but the device expects more data")]
    ErrNotdone = 0x09,

    #[error("Device firmware is corrupt; it cannot return to run-time operation")]
    ErrFirmware = 0x0a,

    #[error("Vendor-specific error")]
    ErrVendor = 0x0b,

    #[error("Device detected an unexpected USB reset")]
    ErrUsbr = 0x0c,

    #[error("Device detected an unexpected power-on reset")]
    ErrPor = 0x0d,

    #[default]
    #[error("Something went wrong, but the device does not know what")]
    ErrUnknown = 0x0e,

    #[error("Device stalled an unexpected request")]
    ErrStalledPkt = 0x0f,
}

impl From<u8> for DfuStatusCode {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// One decoded DFU_GETSTATUS response.
///
/// Read fresh from the device on every poll; the poll timeout is the wait
/// the device asks for before it is queried again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    pub poll_timeout: Duration,
    pub state: DfuState,
}

impl DfuStatus {
    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::Ok
    }
}

impl TryFrom<&[u8]> for DfuStatus {
    type Error = ConnectionError;

    fn try_from(raw: &[u8]) -> Result<Self, ConnectionError> {
        if raw.len() < 6 {
            return Err(ConnectionError::MalformedStatus(raw.len()));
        }

        // bStatus, 24-bit little-endian bwPollTimeout, bState, iString
        let poll_ms = u32::from(raw[1]) | (u32::from(raw[2]) << 8) | (u32::from(raw[3]) << 16);
        let state = DfuState::from_repr(raw[4]).ok_or(ConnectionError::InvalidState(raw[4]))?;

        Ok(Self {
            status: DfuStatusCode::from(raw[0]),
            poll_timeout: Duration::from_millis(poll_ms as u64),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_busy_poll_hint() {
        // dfuDNBUSY with a 0x000320 (800 ms) poll timeout
        let raw = [0x00, 0x20, 0x03, 0x00, 0x04, 0x00];
        let status = DfuStatus::try_from(raw.as_slice()).unwrap();

        assert!(status.is_ok());
        assert_eq!(status.state, DfuState::DnBusy);
        assert_eq!(status.poll_timeout, Duration::from_millis(800));
    }

    #[test]
    fn decodes_an_error_report() {
        let raw = [0x03, 0x00, 0x00, 0x00, 0x0a, 0x00];
        let status = DfuStatus::try_from(raw.as_slice()).unwrap();

        assert_eq!(status.status, DfuStatusCode::ErrWrite);
        assert_eq!(status.state, DfuState::Error);
    }

    #[test]
    fn short_responses_are_rejected() {
        let raw = [0x00, 0x00, 0x00];
        assert!(matches!(
            DfuStatus::try_from(raw.as_slice()),
            Err(ConnectionError::MalformedStatus(3))
        ));
    }

    #[test]
    fn unknown_state_bytes_are_rejected() {
        let raw = [0x00, 0x00, 0x00, 0x00, 0x42, 0x00];
        assert!(matches!(
            DfuStatus::try_from(raw.as_slice()),
            Err(ConnectionError::InvalidState(0x42))
        ));
    }

    #[test]
    fn unknown_status_codes_collapse_to_unknown() {
        assert_eq!(DfuStatusCode::from(0x7f), DfuStatusCode::ErrUnknown);
        assert_eq!(DfuStatusCode::from(0x03), DfuStatusCode::ErrWrite);
    }

    #[test]
    fn states_render_their_protocol_names() {
        assert_eq!(DfuState::DfuIdle.to_string(), "dfuIDLE");
        assert_eq!(DfuState::ManifestSync.to_string(), "dfuMANIFEST-SYNC");
    }
}
