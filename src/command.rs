//! DFU class requests and their timeouts

use std::time::Duration;

use strum::Display;

use crate::transport::{ControlDirection, ControlRequest};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DETACH_TIMEOUT: Duration = Duration::from_secs(1);
const DNLOAD_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Expected length of a DFU_GETSTATUS response.
pub const GET_STATUS_LENGTH: u16 = 6;
/// Expected length of a DFU_GETSTATE response.
pub const GET_STATE_LENGTH: u16 = 1;

/// The request codes of the DFU 1.1 class protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum DfuRequestKind {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

impl DfuRequestKind {
    /// Timeout applied to one control transfer carrying this request.
    ///
    /// Downloads and uploads get longer to breathe since a block can trigger
    /// a flash erase on the device; everything else is bookkeeping.
    pub fn timeout(&self) -> Duration {
        match self {
            DfuRequestKind::Detach => DETACH_TIMEOUT,
            DfuRequestKind::Dnload => DNLOAD_TIMEOUT,
            DfuRequestKind::Upload => UPLOAD_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// One DFU request with its parameters, ready to be put on the wire.
#[derive(Copy, Clone, Debug)]
pub enum DfuRequest<'a> {
    Detach {
        /// Maximum time the device should wait for the host, in milliseconds
        /// (`wValue`).
        timeout_ms: u16,
    },
    Dnload {
        block: u16,
        data: &'a [u8],
    },
    Upload {
        block: u16,
        length: u16,
    },
    GetStatus,
    ClrStatus,
    GetState,
    Abort,
}

impl<'a> DfuRequest<'a> {
    pub fn kind(&self) -> DfuRequestKind {
        match self {
            DfuRequest::Detach { .. } => DfuRequestKind::Detach,
            DfuRequest::Dnload { .. } => DfuRequestKind::Dnload,
            DfuRequest::Upload { .. } => DfuRequestKind::Upload,
            DfuRequest::GetStatus => DfuRequestKind::GetStatus,
            DfuRequest::ClrStatus => DfuRequestKind::ClrStatus,
            DfuRequest::GetState => DfuRequestKind::GetState,
            DfuRequest::Abort => DfuRequestKind::Abort,
        }
    }

    /// Lower the request into a control transfer addressed to `interface`,
    /// plus the bytes of its data stage.
    pub fn control(&self, interface: u8) -> (ControlRequest, &'a [u8]) {
        let kind = self.kind();
        let (direction, value, data): (_, u16, &[u8]) = match *self {
            DfuRequest::Detach { timeout_ms } => (ControlDirection::Out, timeout_ms, &[]),
            DfuRequest::Dnload { block, data } => (ControlDirection::Out, block, data),
            DfuRequest::Upload { block, length } => (ControlDirection::In { length }, block, &[]),
            DfuRequest::GetStatus => (
                ControlDirection::In {
                    length: GET_STATUS_LENGTH,
                },
                0,
                &[],
            ),
            DfuRequest::ClrStatus => (ControlDirection::Out, 0, &[]),
            DfuRequest::GetState => (
                ControlDirection::In {
                    length: GET_STATE_LENGTH,
                },
                0,
                &[],
            ),
            DfuRequest::Abort => (ControlDirection::Out, 0, &[]),
        };

        let request = ControlRequest {
            direction,
            request: kind as u8,
            value,
            index: interface as u16,
        };

        (request, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_block_carries_block_number_in_value() {
        let payload = [0xaa, 0xbb];
        let request = DfuRequest::Dnload {
            block: 7,
            data: &payload,
        };
        let (control, data) = request.control(2);

        assert_eq!(control.request, 1);
        assert_eq!(control.value, 7);
        assert_eq!(control.index, 2);
        assert_eq!(control.direction, ControlDirection::Out);
        assert_eq!(data, &payload);
    }

    #[test]
    fn get_status_reads_six_bytes() {
        let (control, data) = DfuRequest::GetStatus.control(0);

        assert_eq!(control.request, 3);
        assert_eq!(control.direction, ControlDirection::In { length: 6 });
        assert!(data.is_empty());
    }

    #[test]
    fn detach_carries_timeout_in_value() {
        let (control, data) = DfuRequest::Detach { timeout_ms: 250 }.control(0);

        assert_eq!(control.request, 0);
        assert_eq!(control.value, 250);
        assert_eq!(control.direction, ControlDirection::Out);
        assert!(data.is_empty());
    }
}
