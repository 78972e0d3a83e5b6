//! Core, headless HTR Ledger library – no wallet or UI code.

pub mod apdu;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod operations;
pub mod path;
pub mod payload;
pub mod queue;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use operations::BatchFailure;
pub use session::{DeviceSession, SessionNotification};
pub use transport::{Connector, DeviceEvent, Transport, TransportError};
