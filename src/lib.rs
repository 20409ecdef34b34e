//! A library and command-line tool for flashing USB devices that speak the
//! standard DFU protocol.
//!
//! [`Flasher`] drives a whole firmware upload: it claims a device through a
//! [`transport::Transport`], detaches run-time firmware into the bootloader
//! when the target needs it, downloads the image block by block and sees the
//! device through manifestation. Device-specific behavior lives in
//! [`targets`] as [`targets::TargetProfile`]s; [`image_format`] wraps
//! payloads in the container a target's boot ROM expects.

#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod image_format;
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging;
pub mod progress;
pub mod targets;
pub mod transport;

pub use error::Error;
pub use flasher::Flasher;
pub use image_format::FirmwareImage;
pub use targets::Chip;
