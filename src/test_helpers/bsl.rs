use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bsl::{checksum, parse_frame, Frame};
use crate::config::{
    BSL_HDR, BSL_SYNC, CMD_CHANGEBAUD, CMD_LOADPC, CMD_MASSERASE, CMD_RXDATABLOCK,
    CMD_TXDATABLOCK, CMD_TXPASSWORD, DATA_ACK, DATA_NACK, ERASED_CELL, SYNC_ACK,
};
use crate::connection::MemoryConnection;

/// Behaviour and memory of a simulated MSP430 bootloader.
pub struct BslState {
    /// 64 KiB address space, erased.
    pub flash: Vec<u8>,
    /// Answers to the next sync bytes; `None` stays silent. Empty means ACK.
    pub sync_replies: VecDeque<Option<u8>>,
    /// Commands answered with NACK.
    pub nack_commands: Vec<u8>,
    /// Commands never answered.
    pub mute_commands: Vec<u8>,
    /// Flip a payload bit after checksumming data replies.
    pub corrupt_replies: bool,
    /// Data replies carry one byte less than requested.
    pub short_replies: bool,
    /// Data replies carry a non-zero reserved header byte.
    pub malformed_replies: bool,
    /// Every command frame received, in order.
    pub frames: Vec<Frame>,
    pub sync_count: usize,
}

impl BslState {
    fn new() -> Self {
        Self {
            flash: vec![ERASED_CELL; 0x1_0000],
            sync_replies: VecDeque::new(),
            nack_commands: Vec::new(),
            mute_commands: Vec::new(),
            corrupt_replies: false,
            short_replies: false,
            malformed_replies: false,
            frames: Vec::new(),
            sync_count: 0,
        }
    }

    pub fn frames_with(&self, command: u8) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.command == command)
            .count()
    }

    fn respond(&mut self, data: &[u8]) -> Vec<u8> {
        if data == [BSL_SYNC] {
            self.sync_count += 1;
            return match self.sync_replies.pop_front() {
                Some(Some(reply)) => vec![reply],
                Some(None) => Vec::new(),
                None => vec![SYNC_ACK],
            };
        }

        let frame = match parse_frame(data) {
            Ok(frame) => frame,
            Err(_) => return vec![DATA_NACK],
        };
        self.frames.push(frame.clone());

        if self.mute_commands.contains(&frame.command) {
            return Vec::new();
        }
        if self.nack_commands.contains(&frame.command) {
            return vec![DATA_NACK];
        }

        match frame.command {
            CMD_TXDATABLOCK => {
                let start = frame.address as usize;
                let end = (start + frame.data.len()).min(self.flash.len());
                self.flash[start..end].copy_from_slice(&frame.data[..end - start]);
                vec![DATA_ACK]
            }
            CMD_RXDATABLOCK => {
                let start = frame.address as usize;
                let end = (start + frame.length as usize).min(self.flash.len());
                let mut payload = self.flash[start..end].to_vec();
                if self.short_replies {
                    payload.pop();
                }
                self.data_reply(&payload)
            }
            CMD_MASSERASE => {
                self.flash.fill(ERASED_CELL);
                vec![DATA_ACK]
            }
            CMD_TXPASSWORD | CMD_LOADPC | CMD_CHANGEBAUD => vec![DATA_ACK],
            _ => vec![DATA_NACK],
        }
    }

    fn data_reply(&self, payload: &[u8]) -> Vec<u8> {
        let length = payload.len() as u8;
        let reserved = if self.malformed_replies { 1 } else { 0 };
        let mut reply = vec![BSL_HDR, reserved, length, length];
        reply.extend_from_slice(payload);
        let ck = checksum(&reply);
        reply.extend_from_slice(&ck.to_le_bytes());
        if self.corrupt_replies && !payload.is_empty() {
            reply[4] ^= 0x01;
        }
        reply
    }
}

/// A bootloader living behind a [`MemoryConnection`].
#[derive(Clone)]
pub struct SimulatedBsl {
    state: Arc<Mutex<BslState>>,
}

impl SimulatedBsl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BslState::new())),
        }
    }

    /// A connection whose peer is this bootloader.
    pub fn connection(&self) -> MemoryConnection {
        let state = Arc::clone(&self.state);
        MemoryConnection::with_responder(move |data| {
            state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .respond(data)
        })
    }

    pub fn state(&self) -> MutexGuard<'_, BslState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SimulatedBsl {
    fn default() -> Self {
        Self::new()
    }
}
