//! Shared test utilities: simulated bootloaders, image fixtures and
//! temporary directories.

mod bsl;
mod fixtures;
mod jennic;
mod temp;

pub use bsl::SimulatedBsl;
pub use fixtures::{fast_config, init_logging, intel_hex, jennic_image};
pub use jennic::SimulatedJennic;
pub use temp::TestContext;
