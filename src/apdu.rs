//! APDU command frames and the companion app's wire constants.

use std::fmt;

use crate::transport::TransportError;

/// Class byte of every command sent to the companion app.
pub const CLA: u8 = 0xE0;

/// Largest payload a single command frame may carry.
pub const MAX_CHUNK_LEN: usize = 255;

/// Status trailer of a successful exchange.
pub const STATUS_OK: [u8; 2] = [0x90, 0x00];

/// First bytes of the version response, identifying the companion app.
pub const VERSION_MAGIC: [u8; 3] = *b"HTR";

/// Exact length of a valid version response: magic, 3 version bytes, status.
pub const VERSION_RESPONSE_LEN: usize = 8;

/// Instructions understood by the companion app.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    Version = 0x03,
    Address = 0x04,
    PublicKeyData = 0x05,
    SendTx = 0x06,
    SignToken = 0x07,
    SendToken = 0x08,
    VerifyTokenSignature = 0x09,
    ResetTokenSignatures = 0x0a,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Version => "version",
            Instruction::Address => "address",
            Instruction::PublicKeyData => "public_key_data",
            Instruction::SendTx => "send_tx",
            Instruction::SignToken => "sign_token",
            Instruction::SendToken => "send_token",
            Instruction::VerifyTokenSignature => "verify_token_signature",
            Instruction::ResetTokenSignatures => "reset_token_signatures",
        }
    }
}

/// Status words the device firmware may answer with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusWord {
    /// Rejected by user
    Deny = 0x6985,
    /// Wrong P1P2
    WrongP1P2 = 0x6A86,
    /// Wrong DataLength
    WrongDataLength = 0x6A87,
    /// Ins not supported
    InsNotSupported = 0x6D00,
    /// Cla not supported
    ClaNotSupported = 0x6E00,
    WrongResponseLength = 0xB000,
    DisplayBip32PathFail = 0xB001,
    DisplayAddressFail = 0xB002,
    DisplayAmountFail = 0xB003,
    WrongTxLength = 0xB004,
    TxParsingFail = 0xB005,
    TxHashFail = 0xB006,
    /// Bad state
    BadState = 0xB007,
    /// Signature fail
    SignatureFail = 0xB008,
    InvalidTx = 0xB009,
    /// Token signature did not match the token info
    InvalidSignature = 0xB00A,
    /// Success
    OK = 0x9000,
}

impl TryFrom<u16> for StatusWord {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x6985 => Ok(StatusWord::Deny),
            0x6A86 => Ok(StatusWord::WrongP1P2),
            0x6A87 => Ok(StatusWord::WrongDataLength),
            0x6D00 => Ok(StatusWord::InsNotSupported),
            0x6E00 => Ok(StatusWord::ClaNotSupported),
            0xB000 => Ok(StatusWord::WrongResponseLength),
            0xB001 => Ok(StatusWord::DisplayBip32PathFail),
            0xB002 => Ok(StatusWord::DisplayAddressFail),
            0xB003 => Ok(StatusWord::DisplayAmountFail),
            0xB004 => Ok(StatusWord::WrongTxLength),
            0xB005 => Ok(StatusWord::TxParsingFail),
            0xB006 => Ok(StatusWord::TxHashFail),
            0xB007 => Ok(StatusWord::BadState),
            0xB008 => Ok(StatusWord::SignatureFail),
            0xB009 => Ok(StatusWord::InvalidTx),
            0xB00A => Ok(StatusWord::InvalidSignature),
            0x9000 => Ok(StatusWord::OK),
            _ => Err(()),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct APDUCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl APDUCommand {
    pub fn new(ins: Instruction, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla: CLA,
            ins: ins as u8,
            p1,
            p2,
            data,
        }
    }

    /// Short-form encoding: header, one length byte, data.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let len = u8::try_from(self.data.len())
            .map_err(|_| TransportError::DataTooLong(self.data.len()))?;
        let mut vec = vec![self.cla, self.ins, self.p1, self.p2, len];
        vec.extend(self.data.iter());
        Ok(vec)
    }
}

impl fmt::Debug for APDUCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "APDU(cla={:#04x} ins={:#04x} p1={} p2={} len={})",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len()
        )
    }
}

/// Drop the 2-byte status trailer from a response.
pub fn strip_status(response: &[u8]) -> Vec<u8> {
    response[..response.len().saturating_sub(2)].to_vec()
}

/// Status word carried by the last two bytes of a response, if any.
pub fn status_of(response: &[u8]) -> Option<u16> {
    match response {
        [.., hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

pub fn apdu_version() -> APDUCommand {
    APDUCommand::new(Instruction::Version, 0, 0, Vec::new())
}

pub fn apdu_public_key_data(path: Vec<u8>) -> APDUCommand {
    APDUCommand::new(Instruction::PublicKeyData, 0, 0, path)
}

pub fn apdu_address(path: Vec<u8>) -> APDUCommand {
    APDUCommand::new(Instruction::Address, 0, 0, path)
}

/// One chunk of the transaction payload; p2 carries the chunk index.
pub fn apdu_send_tx_chunk(index: u8, chunk: Vec<u8>) -> APDUCommand {
    APDUCommand::new(Instruction::SendTx, 0, index, chunk)
}

/// Signature round for one input; p1=1 keeps the signing session open.
pub fn apdu_signature_round(path: Vec<u8>) -> APDUCommand {
    APDUCommand::new(Instruction::SendTx, 1, 0, path)
}

/// Ends the multi-round signing session on the device.
pub fn apdu_signature_finalize() -> APDUCommand {
    APDUCommand::new(Instruction::SendTx, 2, 0, Vec::new())
}

pub fn apdu_sign_token(descriptor: Vec<u8>) -> APDUCommand {
    APDUCommand::new(Instruction::SignToken, 0, 0, descriptor)
}

pub fn apdu_reset_token_signatures() -> APDUCommand {
    APDUCommand::new(Instruction::ResetTokenSignatures, 0, 0, Vec::new())
}
