//! High-level companion app operations, each a sequence of queued commands.

use std::future::Future;

use semver::Version;
use tracing::{debug, info, instrument, warn};

use crate::apdu::{
    apdu_address, apdu_public_key_data, apdu_reset_token_signatures, apdu_send_tx_chunk,
    apdu_sign_token, apdu_signature_finalize, apdu_signature_round, apdu_version, status_of,
    strip_status, APDUCommand, Instruction, MAX_CHUNK_LEN, STATUS_OK, VERSION_MAGIC,
    VERSION_RESPONSE_LEN,
};
use crate::error::{translate, LedgerError, Result};
use crate::lifecycle::LifecycleEvent;
use crate::path;
use crate::payload::parse_app_version;
use crate::session::DeviceSession;
use crate::transport::TransportError;

/// Chunk indices travel in p2, so a transfer has at most this many chunks.
pub const MAX_TX_CHUNKS: usize = u8::MAX as usize + 1;

/// A batch item the device did not answer with a bare success status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub descriptor: Vec<u8>,
    /// Status word of the rejection, when the device produced one.
    pub status: Option<u16>,
}

impl DeviceSession {
    /// Version handshake. Succeeds only if the companion app is in the
    /// foreground, in which case the session records it as open.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_version(&self) -> Result<Vec<u8>> {
        let response = self.exchange(apdu_version()).await?;

        if response.len() == VERSION_RESPONSE_LEN && response[..3] == VERSION_MAGIC {
            self.apply(LifecycleEvent::VersionConfirmed);
            Ok(response)
        } else {
            warn!("foreground app is not the companion app: {}", hex::encode(&response));
            Err(LedgerError::InvalidApp { response })
        }
    }

    /// Version handshake plus a check against the configured supported range.
    pub async fn app_version(&self) -> Result<Version> {
        let response = self.get_version().await?;
        let found = parse_app_version(&response)?;
        let (min, max) = self.config().supported_versions()?;

        if found < min || found >= max {
            return Err(LedgerError::UnsupportedAppVersion { found, min, max });
        }
        info!("companion app version {}", found);
        Ok(found)
    }

    /// Raw public key material for the account path, status word included.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_public_key_data(&self) -> Result<Vec<u8>> {
        self.exchange(apdu_public_key_data(path::encode(None))).await
    }

    /// Show the address at `index` on the device screen. Resolves once the
    /// device acknowledges, whatever the holder concludes from the screen.
    #[instrument(level = "debug", skip(self))]
    pub async fn check_address(&self, index: u32) -> Result<Vec<u8>> {
        self.exchange(apdu_address(path::encode(Some(index)))).await
    }

    /// Stream the transaction payload in chunks of at most 255 bytes,
    /// waiting for each chunk to be acknowledged before sending the next.
    #[instrument(level = "debug", skip(self, payload), fields(len = payload.len()))]
    pub async fn send_tx(&self, payload: &[u8]) -> Result<()> {
        let chunk_count = payload.len().div_ceil(MAX_CHUNK_LEN);
        if chunk_count > MAX_TX_CHUNKS {
            return Err(LedgerError::PayloadTooLarge {
                len: payload.len(),
                max_chunks: MAX_TX_CHUNKS,
            });
        }

        let transport = self.transport().await?;
        for (index, chunk) in payload.chunks(MAX_CHUNK_LEN).enumerate() {
            debug!("sending tx chunk {}/{} ({} bytes)", index + 1, chunk_count, chunk.len());
            self.exchange_on(&transport, apdu_send_tx_chunk(index as u8, chunk.to_vec()))
                .await?;
        }
        Ok(())
    }

    /// Collect one signature per input index, in order. The signing session on
    /// the device is always finalized afterwards, even if a round failed or
    /// the caller stopped waiting.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_signatures(&self, indexes: &[u32]) -> Result<Vec<Vec<u8>>> {
        let session = self.shared()?;
        let indexes = indexes.to_vec();

        // Runs detached: dropping this future must not skip the finalize.
        let signing = tokio::spawn(async move {
            session
                .signing_session(session.signature_rounds(&indexes))
                .await
        });
        signing.await.map_err(|e| {
            LedgerError::Transport(TransportError::Io(format!("signing task failed: {}", e)))
        })?
    }

    async fn signature_rounds(&self, indexes: &[u32]) -> Result<Vec<Vec<u8>>> {
        let transport = self.transport().await?;
        let mut signatures = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let response = self
                .exchange_on(&transport, apdu_signature_round(path::encode(Some(index))))
                .await?;
            signatures.push(strip_status(&response));
        }
        Ok(signatures)
    }

    /// Run `rounds`, then end the signing session whatever the outcome.
    /// A failed finalize is reported only when the rounds themselves succeeded.
    async fn signing_session<T>(&self, rounds: impl Future<Output = Result<T>>) -> Result<T> {
        let outcome = rounds.await;
        let finalized = self.exchange(apdu_signature_finalize()).await;

        match (outcome, finalized) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!("finalizing signing session after failure also failed: {}", cleanup);
                Err(e)
            }
        }
    }

    /// Have the device sign a serialized token descriptor.
    #[instrument(level = "debug", skip(self, descriptor))]
    pub async fn sign_token(&self, descriptor: &[u8]) -> Result<Vec<u8>> {
        check_fits_one_command(descriptor)?;
        let response = self.exchange(apdu_sign_token(descriptor.to_vec())).await?;
        Ok(strip_status(&response))
    }

    /// Load signed token descriptors into the device ahead of signing a
    /// transaction. Returns the items the device did not accept.
    pub async fn send_tokens(&self, descriptors: &[Vec<u8>]) -> Result<Vec<BatchFailure>> {
        self.batch_collect_failures(Instruction::SendToken, descriptors)
            .await
    }

    /// Check signed token descriptors against the device. Returns the items
    /// whose signature the device did not confirm.
    pub async fn verify_token_signatures(
        &self,
        descriptors: &[Vec<u8>],
    ) -> Result<Vec<BatchFailure>> {
        self.batch_collect_failures(Instruction::VerifyTokenSignature, descriptors)
            .await
    }

    /// Forget every token signature stored on the device.
    #[instrument(level = "debug", skip(self))]
    pub async fn reset_token_signatures(&self) -> Result<()> {
        self.exchange(apdu_reset_token_signatures()).await?;
        Ok(())
    }

    /// One command per descriptor, in order. Anything other than a bare
    /// success status is a per-item failure; only errors without a status
    /// word (lost device, closed queue) abort the batch.
    #[instrument(level = "debug", skip(self, descriptors), fields(items = descriptors.len()))]
    async fn batch_collect_failures(
        &self,
        ins: Instruction,
        descriptors: &[Vec<u8>],
    ) -> Result<Vec<BatchFailure>> {
        for descriptor in descriptors {
            check_fits_one_command(descriptor)?;
        }
        let transport = self.transport().await?;
        let mut failures = Vec::new();

        for (index, descriptor) in descriptors.iter().enumerate() {
            let command = APDUCommand::new(ins, 0, 0, descriptor.clone());
            let status = match self.queue().submit(transport.clone(), command).await {
                Ok(response) if response == STATUS_OK => continue,
                Ok(response) => status_of(&response),
                Err(TransportError::Status(code)) => Some(code),
                Err(e) => return Err(translate(e)),
            };

            debug!("{} rejected item {} (status {:?})", ins.name(), index, status);
            failures.push(BatchFailure {
                index,
                descriptor: descriptor.clone(),
                status,
            });
        }

        if !failures.is_empty() {
            warn!("{}: {} of {} items failed", ins.name(), failures.len(), descriptors.len());
        }
        Ok(failures)
    }
}

/// Short-form APDUs carry a one-byte data length.
fn check_fits_one_command(data: &[u8]) -> Result<()> {
    if data.len() > MAX_CHUNK_LEN {
        return Err(LedgerError::InvalidPayload(format!(
            "descriptor of {} bytes does not fit in one command",
            data.len()
        )));
    }
    Ok(())
}
