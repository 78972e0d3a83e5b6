//! BIP32 path encoding for the companion app.
//!
//! Every account lives under `m/44'/280'/0'/0`; the only caller-controlled part
//! is the optional address index appended as a fifth, non-hardened level.

use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Bit set on hardened derivation levels.
pub const HARDENED: u32 = 0x8000_0000;

/// BIP44 purpose level.
pub const PURPOSE: u32 = 44;
/// SLIP-44 coin type of the HTR network.
pub const COIN_TYPE: u32 = 280;
/// The only account the companion app derives from.
pub const ACCOUNT: u32 = 0;
/// External chain.
pub const CHAIN: u32 = 0;

/// A derivation path, stored as raw levels (hardened levels carry [`HARDENED`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bip32Path {
    levels: Vec<u32>,
}

impl Bip32Path {
    /// The fixed account path, optionally extended with an address index.
    pub fn account(address_index: Option<u32>) -> Self {
        let mut levels = vec![
            PURPOSE | HARDENED,
            COIN_TYPE | HARDENED,
            ACCOUNT | HARDENED,
            CHAIN,
        ];
        if let Some(index) = address_index {
            levels.push(index);
        }
        Self { levels }
    }

    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    /// Level count byte followed by one big-endian u32 per level.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(1 + 4 * self.levels.len());
        buffer.push(self.levels.len() as u8);
        for level in &self.levels {
            buffer.extend_from_slice(&level.to_be_bytes());
        }
        buffer
    }
}

/// Encode the account path, with `address_index` as the optional fifth level.
pub fn encode(address_index: Option<u32>) -> Vec<u8> {
    Bip32Path::account(address_index).encode()
}

impl fmt::Display for Bip32Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for level in &self.levels {
            if level & HARDENED != 0 {
                write!(f, "/{}'", level & !HARDENED)?;
            } else {
                write!(f, "/{}", level)?;
            }
        }
        Ok(())
    }
}

/// Parse a derivation path string like "m/44'/280'/0'/0/5".
/// Both `'` and `h` mark a hardened level.
impl FromStr for Bip32Path {
    type Err = LedgerError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| LedgerError::InvalidPayload(reason);

        let rest = path
            .strip_prefix('m')
            .ok_or_else(|| invalid("derivation path must start with 'm'".to_string()))?;
        if rest.is_empty() {
            return Ok(Self { levels: Vec::new() });
        }
        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| invalid(format!("invalid derivation path format: '{}'", path)))?;

        let mut levels = Vec::new();
        for component in rest.split('/') {
            if component.is_empty() {
                return Err(invalid(format!("empty level in derivation path: '{}'", path)));
            }
            let (hardened, number) = match component
                .strip_suffix('\'')
                .or_else(|| component.strip_suffix('h'))
            {
                Some(number) => (true, number),
                None => (false, component),
            };
            let value: u32 = number
                .parse()
                .map_err(|_| invalid(format!("invalid number in derivation path: '{}'", component)))?;
            if value & HARDENED != 0 {
                return Err(invalid(format!("derivation level out of range: '{}'", component)));
            }
            levels.push(if hardened { value | HARDENED } else { value });
        }

        Ok(Self { levels })
    }
}
