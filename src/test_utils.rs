//! Scripted transport and connector used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::apdu::{APDUCommand, Instruction, STATUS_OK, VERSION_MAGIC};
use crate::transport::{Connector, Transport, TransportError};

type Responder = Box<dyn FnMut(&APDUCommand) -> Result<Vec<u8>, TransportError> + Send>;
type StallPredicate = Box<dyn Fn(&APDUCommand) -> bool + Send>;

/// How long a stalled exchange takes before answering.
pub const STALL: Duration = Duration::from_secs(3600);

/// Version response of companion app 1.0.0.
pub fn version_response() -> Vec<u8> {
    let mut response = VERSION_MAGIC.to_vec();
    response.extend_from_slice(&[1, 0, 0]);
    response.extend_from_slice(&STATUS_OK);
    response
}

/// Transport answering version checks like the companion app and every other
/// command through a configurable responder. Records every command it sees.
pub struct ScriptedTransport {
    commands: Mutex<Vec<APDUCommand>>,
    closed: AtomicBool,
    foreground_app: AtomicBool,
    responder: Mutex<Option<Responder>>,
    stall: Mutex<Option<StallPredicate>>,
}

impl ScriptedTransport {
    pub fn app_open() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            foreground_app: AtomicBool::new(true),
            responder: Mutex::new(None),
            stall: Mutex::new(None),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&APDUCommand) -> Result<Vec<u8>, TransportError> + Send + 'static,
    {
        let transport = Self::app_open();
        *transport.responder.lock().unwrap() = Some(Box::new(responder));
        transport
    }

    /// Matching commands take [`STALL`] before they are answered.
    pub fn stall_when<F>(&self, predicate: F)
    where
        F: Fn(&APDUCommand) -> bool + Send + 'static,
    {
        *self.stall.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn commands(&self) -> Vec<APDUCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Whether the companion app (rather than some other app) is in the foreground.
    pub fn set_foreground_app(&self, open: bool) {
        self.foreground_app.store(open, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exchange(&self, command: &APDUCommand) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        self.commands.lock().unwrap().push(command.clone());
        let stalled = self.stall.lock().unwrap().as_ref().is_some_and(|stall| stall(command));
        if stalled {
            tokio::time::sleep(STALL).await;
        }
        tokio::task::yield_now().await;

        if command.ins == Instruction::Version as u8 {
            return if self.foreground_app.load(Ordering::SeqCst) {
                Ok(version_response())
            } else {
                Err(TransportError::Status(0x6e00))
            };
        }

        match self.responder.lock().unwrap().as_mut() {
            Some(responder) => responder(command),
            None => Ok(STATUS_OK.to_vec()),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector that always hands out the same scripted transport.
pub struct StaticConnector {
    transport: Arc<ScriptedTransport>,
    opens: AtomicUsize,
}

impl StaticConnector {
    pub fn new(transport: Arc<ScriptedTransport>) -> Self {
        Self {
            transport,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn open(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.transport.reopen();
        let transport: Arc<dyn Transport> = self.transport.clone();
        Ok(transport)
    }
}
