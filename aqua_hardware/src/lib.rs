#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Device links for the tank controller: the Raspberry Pi UART (behind the
//! `hardware` feature) and an in-process simulator.
pub mod error;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod serial;
pub mod simulator;

pub use error::HwError;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub use serial::SerialLink;
pub use simulator::{SimulatedDevice, SimulatorCfg};
