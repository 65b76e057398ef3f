//! MSP430 bootstrap loader protocol used by TelosB boards.
//!
//! [`frame`] encodes and validates frames, [`ConnectionSession`] tracks the
//! baud and patch state of one link, and [`BslTelosb`] drives the
//! request/reply cycle over a [`Connection`](crate::connection::Connection).

mod engine;
pub mod frame;
mod i2c;
mod session;

pub use engine::{BslReply, BslTelosb};
pub use frame::{build_frame, checksum, parse_frame, Frame};
pub use session::{baud_rate_parameters, ConnectionSession};
