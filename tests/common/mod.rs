#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use htr_ledger::apdu::{APDUCommand, Instruction, STATUS_OK};
use htr_ledger::{Connector, Transport, TransportError};

/// In-memory stand-in for a device running the companion app 1.2.3.
///
/// Transactions are buffered by `SEND_TX` chunks and signed per input index.
/// Token signatures are the uid bytes reversed.
#[derive(Default)]
pub struct SimulatedDevice {
    pub log: Mutex<Vec<APDUCommand>>,
    tx_buffer: Mutex<Vec<u8>>,
    other_app: AtomicBool,
    closed: AtomicBool,
    busy: AtomicBool,
    pub overlaps: AtomicUsize,
}

impl SimulatedDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put an app other than the companion app in the foreground.
    pub fn switch_to_other_app(&self, other: bool) {
        self.other_app.store(other, Ordering::SeqCst);
    }

    pub fn instructions(&self) -> Vec<u8> {
        self.log.lock().unwrap().iter().map(|c| c.ins).collect()
    }

    pub fn token_signature(uid: &[u8]) -> Vec<u8> {
        uid.iter().rev().copied().collect()
    }

    fn ok(mut data: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        data.extend_from_slice(&STATUS_OK);
        Ok(data)
    }

    fn respond(&self, command: &APDUCommand) -> Result<Vec<u8>, TransportError> {
        const VERSION: u8 = Instruction::Version as u8;
        const PUBLIC_KEY_DATA: u8 = Instruction::PublicKeyData as u8;
        const SEND_TX: u8 = Instruction::SendTx as u8;
        const SIGN_TOKEN: u8 = Instruction::SignToken as u8;
        const SEND_TOKEN: u8 = Instruction::SendToken as u8;
        const VERIFY_TOKEN: u8 = Instruction::VerifyTokenSignature as u8;

        match command.ins {
            VERSION if self.other_app.load(Ordering::SeqCst) => Ok(b"BTC\x02\x00\x00\x90\x00".to_vec()),
            VERSION => Self::ok(b"HTR\x01\x02\x03".to_vec()),
            PUBLIC_KEY_DATA => Self::ok((0..101u8).collect()),
            SEND_TX => match command.p1 {
                0 => {
                    self.tx_buffer.lock().unwrap().extend_from_slice(&command.data);
                    Self::ok(Vec::new())
                }
                1 if self.tx_buffer.lock().unwrap().is_empty() => Err(TransportError::Status(0xb007)),
                1 => {
                    let index = command.data[command.data.len() - 1];
                    Self::ok(vec![0x30, 0x44, index])
                }
                _ => {
                    self.tx_buffer.lock().unwrap().clear();
                    Self::ok(Vec::new())
                }
            },
            SIGN_TOKEN => Self::ok(Self::token_signature(&command.data[1..33])),
            SEND_TOKEN | VERIFY_TOKEN => {
                let data = &command.data;
                let (descriptor, signature) = data.split_at(data.len().saturating_sub(32));
                if descriptor.len() > 33 && signature == Self::token_signature(&descriptor[1..33]) {
                    Ok(STATUS_OK.to_vec())
                } else {
                    Err(TransportError::Status(0xb00a))
                }
            }
            _ => Ok(STATUS_OK.to_vec()),
        }
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn exchange(&self, command: &APDUCommand) -> Result<Vec<u8>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.log.lock().unwrap().push(command.clone());
        tokio::task::yield_now().await;

        let response = self.respond(command);
        self.busy.store(false, Ordering::SeqCst);
        response
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out the simulated device, reopening it every time.
pub struct SimulatedConnector(pub Arc<SimulatedDevice>);

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.0.closed.store(false, Ordering::SeqCst);
        let transport: Arc<dyn Transport> = self.0.clone();
        Ok(transport)
    }
}
