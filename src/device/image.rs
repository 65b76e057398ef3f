//! Firmware images.
//!
//! TelosB firmware ships as Intel HEX, Jennic firmware as a raw binary with
//! a chip tag at offset 0 and a vendor flash header that is replaced by the
//! header found on the device before writing.

use log::debug;
use sha2::{Digest, Sha256};

use super::ChipType;
use crate::error::{DriverError, DriverResult};

/// Contiguous run of bytes at a flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Image split into blocks no larger than what one write command carries.
#[derive(Debug, Clone)]
pub struct BinaryImage {
    blocks: Vec<ImageBlock>,
    fingerprint: String,
}

/// One past the highest byte address an image may cover.
const ADDRESS_LIMIT: u64 = 1 << 32;

fn fingerprint(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

fn invalid(reason: impl Into<String>) -> DriverError {
    DriverError::InvalidImage {
        reason: reason.into(),
    }
}

impl BinaryImage {
    /// Parse Intel HEX text.
    ///
    /// Data records are merged into contiguous runs and split into blocks of
    /// at most `max_block` bytes. Extended segment and extended linear
    /// address records move the base address; start address records are
    /// ignored.
    pub fn from_intel_hex(raw: &[u8], max_block: usize) -> DriverResult<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| invalid("Intel HEX is not text"))?;
        let mut runs: Vec<ImageBlock> = Vec::new();
        let mut base: u32 = 0;
        let mut saw_eof = false;

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let line_no = index + 1;
            let payload = line
                .strip_prefix(':')
                .ok_or_else(|| invalid(format!("line {} does not start with ':'", line_no)))?;
            let bytes = hex::decode(payload)
                .map_err(|e| invalid(format!("line {}: {}", line_no, e)))?;
            if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
                return Err(invalid(format!("line {}: bad record length", line_no)));
            }
            let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            if sum != 0 {
                return Err(invalid(format!("line {}: checksum mismatch", line_no)));
            }

            let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
            let data = &bytes[4..bytes.len() - 1];
            match bytes[3] {
                0x00 => {
                    let address = base.wrapping_add(offset);
                    if address as u64 + data.len() as u64 > ADDRESS_LIMIT {
                        return Err(invalid(format!(
                            "line {}: data at 0x{:X} runs past the 32-bit address space",
                            line_no, address
                        )));
                    }
                    push_data(&mut runs, address, data);
                }
                0x01 => {
                    saw_eof = true;
                    break;
                }
                0x02 if data.len() == 2 => {
                    base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
                }
                0x04 if data.len() == 2 => {
                    base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
                }
                0x02 | 0x04 => {
                    return Err(invalid(format!(
                        "line {}: extended address record carries {} bytes, expected 2",
                        line_no,
                        data.len()
                    )))
                }
                0x03 | 0x05 => {}
                other => {
                    return Err(invalid(format!(
                        "line {}: unsupported record type 0x{:02X}",
                        line_no, other
                    )))
                }
            }
        }

        if !saw_eof {
            return Err(invalid("missing end-of-file record"));
        }
        if runs.is_empty() {
            return Err(invalid("image contains no data"));
        }

        let image = Self {
            blocks: split_runs(runs, max_block),
            fingerprint: fingerprint(raw),
        };
        debug!(
            "Parsed Intel HEX image: {} bytes in {} blocks (sha256 {})",
            image.len(),
            image.block_count(),
            image.fingerprint
        );
        Ok(image)
    }

    /// Split a flat binary starting at `base` into blocks.
    pub fn from_binary(base: u32, data: &[u8], max_block: usize) -> Self {
        let blocks = data
            .chunks(max_block.max(1))
            .enumerate()
            .map(|(index, chunk)| ImageBlock {
                address: base + (index * max_block.max(1)) as u32,
                data: chunk.to_vec(),
            })
            .collect();
        Self {
            blocks,
            fingerprint: fingerprint(data),
        }
    }

    pub fn blocks(&self) -> &[ImageBlock] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total number of data bytes.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|block| block.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// SHA-256 of the raw image, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn push_data(runs: &mut Vec<ImageBlock>, address: u32, data: &[u8]) {
    if let Some(last) = runs.last_mut() {
        if last.address as u64 + last.data.len() as u64 == address as u64 {
            last.data.extend_from_slice(data);
            return;
        }
    }
    runs.push(ImageBlock {
        address,
        data: data.to_vec(),
    });
}

fn split_runs(runs: Vec<ImageBlock>, max_block: usize) -> Vec<ImageBlock> {
    let max_block = max_block.max(1);
    runs.into_iter()
        .flat_map(|run| {
            run.data
                .chunks(max_block)
                .enumerate()
                .map(|(index, chunk)| ImageBlock {
                    address: run.address + (index * max_block) as u32,
                    data: chunk.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Raw Jennic firmware image.
#[derive(Debug, Clone)]
pub struct JennicImage {
    chip_type: ChipType,
    data: Vec<u8>,
}

impl JennicImage {
    pub fn parse(data: Vec<u8>) -> DriverResult<Self> {
        if data.len() < 4 {
            return Err(invalid("image is shorter than its chip tag"));
        }
        let tag = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let chip_type = ChipType::from_image_tag(tag)
            .ok_or_else(|| invalid(format!("unknown chip tag 0x{:08X}", tag)))?;
        Ok(Self { chip_type, data })
    }

    pub fn chip_type(&self) -> ChipType {
        self.chip_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the image's flash header with `header`.
    pub fn insert_header(&mut self, header: &[u8]) -> DriverResult<()> {
        let (start, length) = match (self.chip_type.header_start(), self.chip_type.header_length()) {
            (Some(start), Some(length)) => (start as usize, length as usize),
            _ => return Err(invalid(format!("{} images carry no flash header", self.chip_type))),
        };
        if header.len() != length {
            return Err(invalid(format!(
                "flash header has {} bytes, {} expected",
                header.len(),
                length
            )));
        }
        if self.data.len() < start + length {
            return Err(invalid("image is shorter than its flash header"));
        }
        self.data[start..start + length].copy_from_slice(header);
        Ok(())
    }

    /// Blocks to write, starting at flash address 0.
    pub fn to_binary_image(&self, block_size: usize) -> BinaryImage {
        BinaryImage::from_binary(0, &self.data, block_size)
    }
}
