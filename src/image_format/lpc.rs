//! LPC43xx boot image container
//!
//! The DFU boot ROM of the LPC43xx family loads firmware into RAM and
//! expects it prefixed with a 16-byte vendor header carrying the payload
//! length. Everything after the header is executed as-is.

use std::mem::size_of;

use bytemuck::{bytes_of, Pod, Zeroable};

use crate::error::Error;

const LPC_HEADER_MAGIC: [u8; 2] = [0xda, 0xff];

/// The header's length field is 16 bits, capping what the ROM will load.
const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Header the LPC43xx boot ROM expects in front of a DFU download.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct LpcBootHeader {
    magic: [u8; 2],
    /// Payload length in bytes, big endian.
    length: [u8; 2],
    reserved: [u8; 12],
}

/// Prepend the LPC boot header to `payload`.
pub(crate) fn encode(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::ImageTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
    }

    let header = LpcBootHeader {
        magic: LPC_HEADER_MAGIC,
        length: (payload.len() as u16).to_be_bytes(),
        reserved: [0xff; 12],
    };

    let mut image = Vec::with_capacity(size_of::<LpcBootHeader>() + payload.len());
    image.extend_from_slice(bytes_of(&header));
    image.extend_from_slice(payload);

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_big_endian_payload_length() {
        let payload = vec![0x90; 0x1234];
        let image = encode(&payload).unwrap();

        assert_eq!(image.len(), 16 + payload.len());
        assert_eq!(&image[..4], &[0xda, 0xff, 0x12, 0x34]);
        assert_eq!(&image[4..16], &[0xff; 12]);
        assert_eq!(&image[16..], &payload[..]);
    }

    #[test]
    fn payload_longer_than_length_field_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = encode(&payload).unwrap_err();

        assert!(matches!(err, Error::ImageTooLarge(_, MAX_PAYLOAD_SIZE)));
    }
}
