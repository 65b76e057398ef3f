use crate::config::{BSL_BAUD_TABLE, BSL_INITIAL_BAUD};
use crate::error::{DriverError, DriverResult};

/// Logical channel state owned by one BSL engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    bsl_baud_rate: u32,
    saved_baud_rate: Option<u32>,
    patch_loaded: bool,
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self {
            bsl_baud_rate: BSL_INITIAL_BAUD,
            saved_baud_rate: None,
            patch_loaded: false,
        }
    }
}

impl ConnectionSession {
    /// Baud rate the bootloader currently talks at.
    pub fn bsl_baud_rate(&self) -> u32 {
        self.bsl_baud_rate
    }

    /// Whether the port runs at a BSL baud rate with the prior one saved.
    pub fn is_bsl_baud_applied(&self) -> bool {
        self.saved_baud_rate.is_some()
    }

    /// Port baud rate to restore once the bootloader is left.
    pub fn saved_baud_rate(&self) -> Option<u32> {
        self.saved_baud_rate
    }

    pub fn is_patch_loaded(&self) -> bool {
        self.patch_loaded
    }

    pub(crate) fn set_bsl_baud_rate(&mut self, baud_rate: u32) {
        self.bsl_baud_rate = baud_rate;
    }

    /// Remember `baud_rate` unless a previous one is already saved.
    pub(crate) fn save_baud_rate(&mut self, baud_rate: u32) {
        self.saved_baud_rate.get_or_insert(baud_rate);
    }

    pub(crate) fn take_saved_baud_rate(&mut self) -> Option<u32> {
        self.saved_baud_rate.take()
    }

    pub(crate) fn set_patch_loaded(&mut self, loaded: bool) {
        self.patch_loaded = loaded;
    }

    /// The bootloader restarted: it talks at its initial rate again and
    /// forgot any patch.
    pub(crate) fn bootloader_restarted(&mut self) {
        self.bsl_baud_rate = BSL_INITIAL_BAUD;
        self.patch_loaded = false;
    }
}

/// CHANGEBAUD address and length words for `baud_rate`.
pub fn baud_rate_parameters(baud_rate: u32) -> DriverResult<(u16, u16)> {
    BSL_BAUD_TABLE
        .iter()
        .find(|(rate, _, _)| *rate == baud_rate)
        .map(|(_, address, length)| (*address, *length))
        .ok_or_else(|| {
            DriverError::invalid_argument(format!(
                "baud rate {} is not supported by the bootloader",
                baud_rate
            ))
        })
}
