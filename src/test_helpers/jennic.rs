use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{
    ERASED_CELL, JENNIC_CHIP_ID_RAM_ADDRESS, JENNIC_SECTOR_COUNT, JENNIC_SECTOR_SIZE,
};
use crate::connection::MemoryConnection;
use crate::device::jennic::{
    encode_message, CHIP_ID_REQUEST, CHIP_ID_RESPONSE, FLASH_ID_REQUEST, FLASH_ID_RESPONSE,
    PROGRAM_REQUEST, PROGRAM_RESPONSE, RAM_READ_REQUEST, RAM_READ_RESPONSE, READ_REQUEST,
    READ_RESPONSE, SECTOR_ERASE_REQUEST, SECTOR_ERASE_RESPONSE, SELECT_FLASH_REQUEST,
    SELECT_FLASH_RESPONSE, WRITE_SR_REQUEST, WRITE_SR_RESPONSE,
};

/// Reply type of a bootloader that does not know a request.
const UNKNOWN_REQUEST: u8 = 0xFF;

/// Behaviour and memory of a simulated Jennic ROM bootloader.
pub struct JennicState {
    pub flash: Vec<u8>,
    /// Answer to the chip id command; `None` for bootloaders without it.
    pub chip_id: Option<[u8; 4]>,
    /// Identification word in RAM.
    pub ram_id: [u8; 4],
    pub flash_id: (u8, u8),
    /// Request types answered with a failure status.
    pub failing_requests: Vec<u8>,
    /// Flip the checksum of every reply.
    pub corrupt_replies: bool,
    /// Every request received: (type, payload).
    pub requests: Vec<(u8, Vec<u8>)>,
}

impl JennicState {
    pub fn requests_of(&self, message_type: u8) -> usize {
        self.requests
            .iter()
            .filter(|(kind, _)| *kind == message_type)
            .count()
    }

    fn respond(&mut self, data: &[u8]) -> Vec<u8> {
        if data.len() < 3 || data[0] as usize + 1 != data.len() {
            return Vec::new();
        }
        let kind = data[1];
        let payload = data[2..data.len() - 1].to_vec();
        self.requests.push((kind, payload.clone()));

        let (response, body) = self.handle(kind, &payload);
        let mut reply = encode_message(response, &body).unwrap_or_default();
        if self.corrupt_replies {
            if let Some(last) = reply.last_mut() {
                *last ^= 0xFF;
            }
        }
        reply
    }

    fn handle(&mut self, kind: u8, payload: &[u8]) -> (u8, Vec<u8>) {
        let response = match kind {
            CHIP_ID_REQUEST => CHIP_ID_RESPONSE,
            RAM_READ_REQUEST => RAM_READ_RESPONSE,
            FLASH_ID_REQUEST => FLASH_ID_RESPONSE,
            SELECT_FLASH_REQUEST => SELECT_FLASH_RESPONSE,
            WRITE_SR_REQUEST => WRITE_SR_RESPONSE,
            SECTOR_ERASE_REQUEST => SECTOR_ERASE_RESPONSE,
            PROGRAM_REQUEST => PROGRAM_RESPONSE,
            READ_REQUEST => READ_RESPONSE,
            _ => return (UNKNOWN_REQUEST, vec![0xFF]),
        };
        if self.failing_requests.contains(&kind) {
            return (response, vec![0x01]);
        }

        let address = || u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let length = || u16::from_le_bytes([payload[4], payload[5]]) as usize;

        let body = match kind {
            CHIP_ID_REQUEST => match self.chip_id {
                Some(id) => [&[0x00][..], &id[..]].concat(),
                None => return (UNKNOWN_REQUEST, vec![0xFF]),
            },
            RAM_READ_REQUEST => {
                let mut body = vec![0x00];
                if address() == JENNIC_CHIP_ID_RAM_ADDRESS {
                    body.extend(self.ram_id.iter().take(length()));
                } else {
                    body.extend(std::iter::repeat(0).take(length()));
                }
                body
            }
            FLASH_ID_REQUEST => vec![0x00, self.flash_id.0, self.flash_id.1],
            SECTOR_ERASE_REQUEST => {
                let start = payload[0] as usize * JENNIC_SECTOR_SIZE;
                self.flash[start..start + JENNIC_SECTOR_SIZE].fill(ERASED_CELL);
                vec![0x00]
            }
            PROGRAM_REQUEST => {
                let start = address() as usize;
                let data = &payload[4..];
                match self.flash.get_mut(start..start + data.len()) {
                    Some(cells) => cells.copy_from_slice(data),
                    None => return (response, vec![0x01]),
                }
                vec![0x00]
            }
            READ_REQUEST => {
                let start = address() as usize;
                match self.flash.get(start..start + length()) {
                    Some(cells) => [&[0x00][..], cells].concat(),
                    None => return (response, vec![0x01]),
                }
            }
            _ => vec![0x00],
        };
        (response, body)
    }
}

/// A Jennic bootloader living behind a [`MemoryConnection`].
#[derive(Clone)]
pub struct SimulatedJennic {
    state: Arc<Mutex<JennicState>>,
}

impl SimulatedJennic {
    fn build(chip_id: Option<[u8; 4]>, ram_id: [u8; 4], flash_id: (u8, u8)) -> Self {
        Self {
            state: Arc::new(Mutex::new(JennicState {
                flash: vec![ERASED_CELL; JENNIC_SECTOR_SIZE * JENNIC_SECTOR_COUNT],
                chip_id,
                ram_id,
                flash_id,
                failing_requests: Vec::new(),
                corrupt_replies: false,
                requests: Vec::new(),
            })),
        }
    }

    /// A JN5148 with its internal flash.
    pub fn jn5148() -> Self {
        Self::build(Some([0x10, 0x40, 0x46, 0x86]), [0; 4], (0xCC, 0xEE))
    }

    /// An older module that only reports its id through RAM.
    pub fn with_ram_id(ram_id: [u8; 4]) -> Self {
        Self::build(None, ram_id, (0x10, 0x10))
    }

    pub fn connection(&self) -> MemoryConnection {
        let state = Arc::clone(&self.state);
        MemoryConnection::with_responder(move |data| {
            state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .respond(data)
        })
    }

    pub fn state(&self) -> MutexGuard<'_, JennicState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
