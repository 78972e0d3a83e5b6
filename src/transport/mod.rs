pub mod framing;
#[cfg(feature = "hid")]
pub mod hid;

#[cfg(feature = "hid")]
pub use hid::*;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::apdu::APDUCommand;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device answered with a status word other than 0x9000.
    #[error("Ledger returned status {0:#06x}")]
    Status(u16),
    #[error("Ledger disconnected")]
    Disconnected,
    #[error("Ledger transport closed")]
    Closed,
    #[error("No Ledger device found")]
    NoDevice,
    #[error("I/O error: {0}")]
    Io(String),
    /// Command data does not fit the one-byte length of a short APDU.
    #[error("APDU data of {0} bytes exceeds the 255-byte limit")]
    DataTooLong(usize),
}

/// One physical channel to the device.
///
/// Implementations are not expected to cope with overlapping exchanges; the
/// command queue guarantees at most one is in flight.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one command. A successful response still ends with its 2-byte
    /// status word; any other status comes back as [`TransportError::Status`].
    async fn exchange(&self, command: &APDUCommand) -> Result<Vec<u8>, TransportError>;

    /// Release the OS-level device handle.
    async fn close(&self);
}

/// Creates transports on demand.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Attach/detach notifications coming from the USB layer.
///
/// The device re-enumerates whenever an app is opened or closed on it, so a
/// `Removed` followed by `Attached` is also what switching apps looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached,
    Removed,
}
