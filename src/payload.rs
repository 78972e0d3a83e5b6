//! Byte layouts the caller needs around the device operations: the version
//! and public key responses, the transaction header, and token descriptors.

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::apdu::{VERSION_MAGIC, VERSION_RESPONSE_LEN};
use crate::error::{LedgerError, Result};
use crate::path::Bip32Path;

const TOKEN_INFO_VERSION: u8 = 1;
const TOKEN_UID_LEN: usize = 32;
const TOKEN_SIGNATURE_LEN: usize = 32;

const PUBLIC_KEY_LEN: usize = 65;
const CHAIN_CODE_LEN: usize = 32;
const FINGERPRINT_LEN: usize = 4;

/// Companion app version carried in bytes 3..6 of the version response.
pub fn parse_app_version(response: &[u8]) -> Result<Version> {
    if response.len() != VERSION_RESPONSE_LEN || response[..3] != VERSION_MAGIC {
        return Err(LedgerError::InvalidApp {
            response: response.to_vec(),
        });
    }
    Ok(Version::new(
        response[3] as u64,
        response[4] as u64,
        response[5] as u64,
    ))
}

/// Material the wallet needs to build the account xpub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyData {
    /// Uncompressed SEC1 public key.
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub chain_code: [u8; CHAIN_CODE_LEN],
    /// Fingerprint of the parent key.
    pub fingerprint: [u8; FINGERPRINT_LEN],
}

impl PublicKeyData {
    /// Split a public key response. Trailing bytes (the status word) are ignored.
    pub fn parse(response: &[u8]) -> Result<Self> {
        let needed = PUBLIC_KEY_LEN + CHAIN_CODE_LEN + FINGERPRINT_LEN;
        if response.len() < needed {
            return Err(LedgerError::InvalidPayload(format!(
                "public key data is {} bytes, expected at least {}",
                response.len(),
                needed
            )));
        }

        let (public_key, rest) = response.split_at(PUBLIC_KEY_LEN);
        let (chain_code, rest) = rest.split_at(CHAIN_CODE_LEN);
        let fingerprint = &rest[..FINGERPRINT_LEN];

        let mut data = Self {
            public_key: [0u8; PUBLIC_KEY_LEN],
            chain_code: [0u8; CHAIN_CODE_LEN],
            fingerprint: [0u8; FINGERPRINT_LEN],
        };
        data.public_key.copy_from_slice(public_key);
        data.chain_code.copy_from_slice(chain_code);
        data.fingerprint.copy_from_slice(fingerprint);
        Ok(data)
    }
}

/// The change output the device should recognize as going back to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeOutput {
    /// Position of the change output in the transaction.
    pub output_index: u8,
    /// Address index of the change key.
    pub key_index: u32,
}

/// Prefix sent ahead of the sighash data.
///
/// Without change it is a single zero byte. With change, the first byte has
/// the high bit set and the path level count in the low bits, followed by the
/// change output index and the path levels.
pub fn tx_header(change: Option<ChangeOutput>) -> Vec<u8> {
    match change {
        None => vec![0],
        Some(change) => {
            let path = Bip32Path::account(Some(change.key_index)).encode();
            let mut header = Vec::with_capacity(1 + path.len());
            header.push(0x80 | path[0]);
            header.push(change.output_index);
            header.extend_from_slice(&path[1..]);
            header
        }
    }
}

/// Full payload for [`DeviceSession::send_tx`](crate::session::DeviceSession::send_tx).
pub fn tx_payload(change: Option<ChangeOutput>, data_to_sign: &[u8]) -> Vec<u8> {
    let mut payload = tx_header(change);
    payload.extend_from_slice(data_to_sign);
    payload
}

/// Token metadata as the wallet stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Token uid, hex encoded.
    pub uid: String,
    pub symbol: String,
    pub name: String,
    /// Signature returned by the device for this token, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl TokenInfo {
    /// Descriptor to have the device sign: version, uid, symbol and name.
    pub fn to_sign_payload(&self) -> Result<Vec<u8>> {
        self.encode(false)
    }

    /// Descriptor with the device signature appended, for sending or verifying.
    pub fn to_signed_payload(&self) -> Result<Vec<u8>> {
        self.encode(true)
    }

    fn encode(&self, with_signature: bool) -> Result<Vec<u8>> {
        let uid = decode_fixed(&self.uid, TOKEN_UID_LEN, "token uid")?;

        let mut out = vec![TOKEN_INFO_VERSION];
        out.extend_from_slice(&uid);
        push_short_string(&mut out, &self.symbol, "token symbol")?;
        push_short_string(&mut out, &self.name, "token name")?;

        if with_signature {
            let signature = self.signature.as_deref().ok_or_else(|| {
                LedgerError::InvalidPayload(format!("token {} has no signature", self.uid))
            })?;
            out.extend_from_slice(&decode_fixed(signature, TOKEN_SIGNATURE_LEN, "token signature")?);
        }
        Ok(out)
    }
}

fn decode_fixed(value: &str, len: usize, what: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(value)
        .map_err(|e| LedgerError::InvalidPayload(format!("{} is not hex: {}", what, e)))?;
    if bytes.len() != len {
        return Err(LedgerError::InvalidPayload(format!(
            "{} must be {} bytes, got {}",
            what,
            len,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn push_short_string(out: &mut Vec<u8>, value: &str, what: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let len = u8::try_from(bytes.len())
        .map_err(|_| LedgerError::InvalidPayload(format!("{} longer than 255 bytes", what)))?;
    out.push(len);
    out.extend_from_slice(bytes);
    Ok(())
}
