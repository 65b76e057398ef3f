use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

/// 64-bit IEEE 802.15.4 extended address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress([u8; 8]);

impl MacAddress {
    pub const LENGTH: usize = 8;

    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Build from up to 8 bytes, left-padding short input with zeros.
    pub fn from_slice(bytes: &[u8]) -> DriverResult<Self> {
        if bytes.len() > Self::LENGTH {
            return Err(DriverError::invalid_argument(format!(
                "MAC address has {} bytes, at most {} allowed",
                bytes.len(),
                Self::LENGTH
            )));
        }
        let mut mac = [0u8; 8];
        mac[Self::LENGTH - bytes.len()..].copy_from_slice(bytes);
        Ok(Self(mac))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl From<u64> for MacAddress {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|byte| format!("{:02x}", byte)).collect();
        f.write_str(&parts.join(":"))
    }
}

impl FromStr for MacAddress {
    type Err = DriverError;

    /// Accepts `00:15:8d:00:00:0a:bc:de`, `0x158d00000abcde`, spaced bytes
    /// and short forms like `0x1234`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let without_prefix = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let mut digits: String = without_prefix
            .chars()
            .filter(|c| !matches!(c, ':' | ' ' | '-'))
            .collect();
        if digits.is_empty() {
            return Err(DriverError::invalid_argument("empty MAC address"));
        }
        if digits.len() % 2 == 1 {
            digits.insert(0, '0');
        }

        let bytes = hex::decode(&digits).map_err(|e| {
            DriverError::invalid_argument(format!("invalid MAC address '{}': {}", s, e))
        })?;
        Self::from_slice(&bytes)
    }
}
