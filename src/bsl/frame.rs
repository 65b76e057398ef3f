//! MSP430 BSL frame encoding.
//!
//! Frame layout:
//!
//! ```text
//! 0x80 | CMD | L1 | L2 | AL | AH | LL | LH | data.. [0xFF] | CKL | CKH
//! ```
//!
//! `L1 == L2 == 4 + padded data length`. The checksum is the XOR of all
//! 16-bit words of the frame, low byte first, inverted. CKL is sent first.

use crate::config::{BSL_HDR, BSL_MAX_DATA, BSL_PAD};
use crate::error::{DriverError, DriverResult};

/// Bytes in front of the data: header, command, two length bytes,
/// address word and length word.
pub const FRAME_HEADER_LEN: usize = 8;

/// A decoded command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub address: u16,
    pub length: u16,
    pub data: Vec<u8>,
}

/// Calculate the BSL checksum of `bytes`.
///
/// An odd trailing byte is paired with the pad byte, which is what the
/// sender transmits for odd payloads.
pub fn checksum(bytes: &[u8]) -> u16 {
    let folded = bytes.chunks(2).fold(0u16, |acc, pair| {
        let low = pair[0] as u16;
        let high = pair.get(1).copied().unwrap_or(BSL_PAD) as u16;
        acc ^ (low | (high << 8))
    });
    !folded
}

/// Build a command frame.
///
/// `length` is the nominal length word; for data blocks it equals
/// `data.len()`, for reads it is the number of bytes requested.
pub fn build_frame(command: u8, address: u16, length: u16, data: &[u8]) -> DriverResult<Vec<u8>> {
    if data.len() > BSL_MAX_DATA {
        return Err(DriverError::invalid_argument(format!(
            "frame data is {} bytes, at most {} allowed",
            data.len(),
            BSL_MAX_DATA
        )));
    }

    let padded = data.len() + data.len() % 2;
    let frame_length = (4 + padded) as u8;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + padded + 2);
    frame.extend_from_slice(&[BSL_HDR, command, frame_length, frame_length]);
    frame.extend_from_slice(&address.to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(data);
    if data.len() % 2 == 1 {
        frame.push(BSL_PAD);
    }

    let ck = checksum(&frame);
    frame.extend_from_slice(&ck.to_le_bytes());
    Ok(frame)
}

/// Decode and validate a command frame.
///
/// Trailing padding is stripped when the length word says the data is odd.
pub fn parse_frame(bytes: &[u8]) -> DriverResult<Frame> {
    if bytes.len() < FRAME_HEADER_LEN + 2 {
        return Err(DriverError::incorrect_data(format!(
            "frame is only {} bytes",
            bytes.len()
        )));
    }
    if bytes[0] != BSL_HDR {
        return Err(DriverError::UnexpectedResponse {
            expected: BSL_HDR,
            received: bytes[0],
            context: "frame header".into(),
        });
    }
    if bytes[2] != bytes[3] {
        return Err(DriverError::incorrect_data(format!(
            "length bytes differ (0x{:02X} / 0x{:02X})",
            bytes[2], bytes[3]
        )));
    }

    let frame_length = bytes[2] as usize;
    if frame_length < 4 || bytes.len() != frame_length + 6 {
        return Err(DriverError::incorrect_data(format!(
            "frame announces {} bytes but {} were received",
            frame_length + 6,
            bytes.len()
        )));
    }

    let (body, ck) = bytes.split_at(bytes.len() - 2);
    let expected = checksum(body);
    let actual = u16::from_le_bytes([ck[0], ck[1]]);
    if expected != actual {
        return Err(DriverError::InvalidChecksum { expected, actual });
    }

    let address = u16::from_le_bytes([body[4], body[5]]);
    let length = u16::from_le_bytes([body[6], body[7]]);
    let mut data = body[FRAME_HEADER_LEN..].to_vec();
    if data.len() == length as usize + 1 && data.last() == Some(&BSL_PAD) {
        data.pop();
    }

    Ok(Frame {
        command: body[1],
        address,
        length,
        data,
    })
}
