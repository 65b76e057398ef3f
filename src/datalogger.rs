//! Filtered logging of the messages a node sends.
//!
//! Every chunk read from the device stream is one message. Messages that
//! pass the filters are written as a line holding a local timestamp and the
//! payload in hex.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use log::{debug, info};
use regex::Regex;

use crate::error::{DriverError, DriverResult};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Matches messages whose first byte is `data_type` and whose byte at
/// `offset` equals `value`.
///
/// Written as `(type,offset,value)` with type and value in hex and the
/// offset in decimal, e.g. `(0a,3,ff)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketFilter {
    pub data_type: u8,
    pub offset: usize,
    pub value: u8,
}

impl BracketFilter {
    pub fn matches(&self, message: &[u8]) -> bool {
        message.first() == Some(&self.data_type) && message.get(self.offset) == Some(&self.value)
    }

    /// Parse a sequence such as `(0a,1,54)(0b,2,ff)`.
    pub fn parse_list(input: &str) -> DriverResult<Vec<Self>> {
        let re = Regex::new(
            r"\(\s*([0-9A-Fa-f]{1,2})\s*,\s*(\d+)\s*,\s*([0-9A-Fa-f]{1,2})\s*\)",
        )?;
        let filters: Vec<Self> = re
            .captures_iter(input)
            .map(|caps| Self::from_captures(&caps[1], &caps[2], &caps[3]))
            .collect::<DriverResult<_>>()?;

        let leftover = re.replace_all(input, "");
        if !leftover.trim().trim_matches(',').trim().is_empty() {
            return Err(DriverError::invalid_argument(format!(
                "cannot parse bracket filter {:?}",
                leftover.trim()
            )));
        }
        Ok(filters)
    }

    fn from_captures(data_type: &str, offset: &str, value: &str) -> DriverResult<Self> {
        let invalid = |what: &str| {
            DriverError::invalid_argument(format!("invalid {} in bracket filter", what))
        };
        Ok(Self {
            data_type: u8::from_str_radix(data_type, 16).map_err(|_| invalid("type"))?,
            offset: offset.parse().map_err(|_| invalid("offset"))?,
            value: u8::from_str_radix(value, 16).map_err(|_| invalid("value"))?,
        })
    }
}

impl FromStr for BracketFilter {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse_list(s)?.as_slice() {
            [filter] => Ok(*filter),
            _ => Err(DriverError::invalid_argument(format!(
                "expected exactly one bracket filter in {:?}",
                s
            ))),
        }
    }
}

/// Logs device messages to stdout or a file.
pub struct DataLogger {
    regex: Option<Regex>,
    brackets: Vec<BracketFilter>,
    output: Box<dyn Write + Send>,
    location: Option<PathBuf>,
    paused: bool,
    written: u64,
}

impl Default for DataLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLogger {
    /// Logger writing every message to stdout.
    pub fn new() -> Self {
        Self {
            regex: None,
            brackets: Vec::new(),
            output: Box::new(io::stdout()),
            location: None,
            paused: false,
            written: 0,
        }
    }

    /// Only log messages whose text matches `pattern`.
    pub fn set_regex_filter(&mut self, pattern: &str) -> DriverResult<()> {
        self.regex = Some(Regex::new(pattern)?);
        Ok(())
    }

    /// Add bracket filters, OR-combined with every other filter.
    pub fn add_bracket_filters(&mut self, filters: &str) -> DriverResult<()> {
        self.brackets.extend(BracketFilter::parse_list(filters)?);
        Ok(())
    }

    /// Send output to `path`, appending if the file exists.
    pub fn set_location(&mut self, path: &Path) -> DriverResult<()> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        self.output.flush()?;
        self.output = Box::new(file);
        self.location = Some(path.to_path_buf());
        info!("Logging to {}", path.display());
        Ok(())
    }

    /// Current output file, `None` for stdout.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Drop messages until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        debug!("Data logger paused");
        self.paused = true;
    }

    pub fn resume(&mut self) {
        debug!("Data logger resumed");
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Number of messages written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Whether `message` passes the filters. No filters lets everything pass.
    pub fn accepts(&self, message: &[u8]) -> bool {
        if self.regex.is_none() && self.brackets.is_empty() {
            return true;
        }
        let by_regex = self
            .regex
            .as_ref()
            .map_or(false, |re| re.is_match(&String::from_utf8_lossy(message)));
        by_regex || self.brackets.iter().any(|filter| filter.matches(message))
    }

    /// Log one message.
    ///
    /// # Returns
    /// Whether a line was written.
    pub fn log(&mut self, message: &[u8]) -> DriverResult<bool> {
        if self.paused || message.is_empty() || !self.accepts(message) {
            return Ok(false);
        }
        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        writeln!(self.output, "{} {}", timestamp, hex::encode(message))?;
        self.output.flush()?;
        self.written += 1;
        Ok(true)
    }

    /// Log everything read from `source` until it ends.
    pub fn run<R: Read>(&mut self, source: &mut R) -> DriverResult<u64> {
        let mut buffer = [0u8; 1024];
        let before = self.written;
        loop {
            let read = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.log(&buffer[..read])?;
        }
        Ok(self.written - before)
    }
}
