//! Library and application errors

use std::fmt::{Display, Formatter};

use miette::Diagnostic;
use thiserror::Error;

use crate::{command::DfuRequestKind, connection::status::DfuStatusCode, transport::TransportError};

/// All possible errors returned by dfuflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Supplied firmware image is empty")]
    #[diagnostic(
        code(dfuflash::image_empty),
        help("Provide a non-empty firmware binary")
    )]
    ImageEmpty,

    #[error("Supplied firmware image of {0}B does not fit the target's maximum of {1}B")]
    #[diagnostic(
        code(dfuflash::image_too_large),
        help("Reduce the size of the binary, or check that the right target profile is selected")
    )]
    ImageTooLarge(usize, usize),

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(dfuflash::cancelled))]
    Cancelled,

    #[error("The device reported an error")]
    #[diagnostic(transparent)]
    DeviceRejected(#[from] DeviceError),

    #[error("Device did not settle within the polling limit")]
    #[diagnostic(
        code(dfuflash::timeout),
        help("The device kept reporting a busy state; power-cycle it and try again")
    )]
    Timeout,

    #[error("The device does not accept firmware downloads")]
    #[diagnostic(code(dfuflash::download_not_supported))]
    DownloadNotSupported,

    #[error("The device does not support reading firmware back")]
    #[diagnostic(code(dfuflash::upload_not_supported))]
    UploadNotSupported,

    #[error("Verification of flash content failed")]
    #[diagnostic(
        code(dfuflash::verify_failed),
        help("The device returned different bytes than were written; retry the flash")
    )]
    VerifyFailed,

    #[error("No DFU devices could be detected")]
    #[diagnostic(
        code(dfuflash::no_device),
        help("Make sure a device is connected and exposes a DFU interface. On Linux, missing udev rules can hide claimable devices.")
    )]
    NoDevice,

    #[error("No device matches '{0}'")]
    #[diagnostic(
        code(dfuflash::device_not_found),
        help("Run `dfuflash list` to see the devices detected on this host")
    )]
    DeviceNotFound(String),

    #[error("{0} devices match; select one with `--device VID:PID`")]
    #[diagnostic(code(dfuflash::ambiguous_device))]
    AmbiguousDevice(usize),

    #[error("Device did not re-enumerate after detach")]
    #[diagnostic(
        code(dfuflash::reconnect_timeout),
        help("Some devices need a manual reset or a button held to enter their bootloader")
    )]
    ReconnectTimeout,

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[cfg(feature = "cli")]
    #[error("Invalid configuration entry: {0}")]
    #[diagnostic(code(dfuflash::config))]
    Config(String),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(dfuflash::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("The device disconnected")]
    #[diagnostic(
        code(dfuflash::disconnected),
        help("Check the cable, then run `dfuflash list` to see whether the device re-enumerated")
    )]
    Disconnected,

    #[error("Timeout while running {0}request")]
    #[diagnostic(code(dfuflash::request_timeout))]
    Timeout(TimedOutRequest),

    #[error("Status response too short: {0} bytes")]
    #[diagnostic(
        code(dfuflash::malformed_status),
        help("The device answered DFU_GETSTATUS with a truncated response")
    )]
    MalformedStatus(usize),

    #[error("Unknown DFU state value: {0:#04x}")]
    #[diagnostic(code(dfuflash::invalid_state))]
    InvalidState(u8),

    #[error("Transport error: {0}")]
    #[diagnostic(code(dfuflash::transport))]
    Transport(#[source] TransportError),
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => ConnectionError::Disconnected,
            TransportError::TimedOut => ConnectionError::Timeout(TimedOutRequest::default()),
            other => ConnectionError::Transport(other),
        }
    }
}

/// An executed request which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutRequest {
    request: Option<DfuRequestKind>,
}

impl Display for TimedOutRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.request {
            Some(request) => write!(f, "{} ", request),
            None => Ok(()),
        }
    }
}

impl From<DfuRequestKind> for TimedOutRequest {
    fn from(request: DfuRequestKind) -> Self {
        TimedOutRequest {
            request: Some(request),
        }
    }
}

/// An error status reported by the device
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {request} request")]
#[diagnostic(code(dfuflash::device_rejected))]
#[non_exhaustive]
pub struct DeviceError {
    request: DfuRequestKind,
    #[source]
    code: DfuStatusCode,
}

impl DeviceError {
    pub fn new(request: DfuRequestKind, code: DfuStatusCode) -> DeviceError {
        DeviceError { request, code }
    }

    /// The status code the device reported, verbatim.
    pub fn status_code(&self) -> DfuStatusCode {
        self.code
    }

    pub fn request(&self) -> DfuRequestKind {
        self.request
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the request from which this error originates
    fn for_request(self, request: DfuRequestKind) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_request(self, request: DfuRequestKind) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(request.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(request.into())))
            }
            res => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use miette::Diagnostic as _;

    use super::*;

    #[test]
    fn device_rejections_delegate_their_diagnostic_code() {
        let err = Error::from(DeviceError::new(
            DfuRequestKind::Dnload,
            DfuStatusCode::ErrWrite,
        ));

        let code = err.code().map(|code| code.to_string());
        assert_eq!(code.as_deref(), Some("dfuflash::device_rejected"));
    }
}
