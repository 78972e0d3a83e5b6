use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::apdu::StatusWord;
use crate::transport::TransportError;

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

/// Errors surfaced to callers of the device operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The device holder rejected the request on the device.
    #[error("Request denied by user on Ledger")]
    Denied,
    /// The device answered with a non-success status word.
    #[error("Error communicating with Ledger (status {code:#06x})")]
    Communication {
        code: u16,
        status: Option<StatusWord>,
    },
    /// Transport failure without a status word, passed through as is.
    #[error(transparent)]
    Transport(TransportError),
    /// The exchange succeeded but the foreground app is not the companion app.
    #[error("Invalid companion app")]
    InvalidApp { response: Vec<u8> },
    #[error("Unsupported companion app version {found} (supported: >= {min}, < {max})")]
    UnsupportedAppVersion {
        found: semver::Version,
        min: semver::Version,
        max: semver::Version,
    },
    #[error("Timed out after {0:?} waiting for Ledger connection")]
    ConnectTimeout(Duration),
    #[error("Payload of {len} bytes needs more than {max_chunks} chunks")]
    PayloadTooLarge { len: usize, max_chunks: usize },
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    /// A configuration file or value could not be used.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LedgerError {
    /// True when the device holder explicitly rejected the operation.
    /// Callers must not retry these.
    pub fn is_user_denial(&self) -> bool {
        matches!(self, LedgerError::Denied)
    }

    /// Raw status word behind the error, if the device produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LedgerError::Denied => Some(StatusWord::Deny as u16),
            LedgerError::Communication { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Map a transport failure onto the domain taxonomy.
///
/// Only 0x6985 is singled out; every other status word, known or not, becomes
/// a generic communication error carrying the raw code.
pub fn translate(error: TransportError) -> LedgerError {
    match error {
        TransportError::Status(code) if code == StatusWord::Deny as u16 => LedgerError::Denied,
        TransportError::Status(code) => {
            let status = StatusWord::try_from(code).ok();
            match status {
                Some(status) => warn!("Ledger returned status {:#06x} ({:?})", code, status),
                None => warn!("Ledger returned unrecognized status {:#06x}", code),
            }
            LedgerError::Communication { code, status }
        }
        other => LedgerError::Transport(other),
    }
}

impl From<TransportError> for LedgerError {
    fn from(error: TransportError) -> Self {
        translate(error)
    }
}
