//! Single-flight FIFO admission of commands onto the shared transport.
//!
//! Callers hold a cheap [`CommandQueue`] handle; one worker task owns the
//! receiving end of the channel and dispatches requests strictly one at a time
//! in the order they were submitted. A failed exchange never stops the worker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::apdu::APDUCommand;
use crate::transport::{Transport, TransportError};

const METRICS_WINDOW: usize = 100;

/// A command waiting for (or undergoing) its exchange.
pub struct CommandRequest {
    transport: Arc<dyn Transport>,
    command: APDUCommand,
    respond_to: oneshot::Sender<Result<Vec<u8>, TransportError>>,
    enqueued_at: Instant,
}

/// Metrics for monitoring queue performance
#[derive(Debug, Default, Clone)]
pub struct QueueMetrics {
    pub queue_wait_ms: Vec<u64>,
    pub device_rtt_ms: Vec<u64>,
    pub dispatched: u64,
    pub failed: u64,
}

impl QueueMetrics {
    fn record_operation(&mut self, queue_wait: Duration, device_rtt: Duration, ok: bool) {
        self.queue_wait_ms.push(queue_wait.as_millis() as u64);
        self.device_rtt_ms.push(device_rtt.as_millis() as u64);
        self.dispatched += 1;
        if !ok {
            self.failed += 1;
        }

        // Keep only the last measurements
        if self.queue_wait_ms.len() > METRICS_WINDOW {
            self.queue_wait_ms.remove(0);
            self.device_rtt_ms.remove(0);
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: AtomicUsize,
    in_flight: AtomicBool,
    metrics: Mutex<QueueMetrics>,
}

impl QueueState {
    fn metrics(&self) -> MutexGuard<'_, QueueMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Worker task that drains the queue
struct QueueWorker {
    cmd_rx: mpsc::Receiver<CommandRequest>,
    state: Arc<QueueState>,
}

impl QueueWorker {
    async fn run(mut self) {
        debug!("command queue worker started");

        while let Some(request) = self.cmd_rx.recv().await {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            self.state.in_flight.store(true, Ordering::SeqCst);
            self.dispatch(request).await;
            self.state.in_flight.store(false, Ordering::SeqCst);
        }

        info!("command queue worker shutting down");
    }

    async fn dispatch(&self, request: CommandRequest) {
        let CommandRequest {
            transport,
            command,
            respond_to,
            enqueued_at,
        } = request;

        let started = Instant::now();
        let queue_wait = started.duration_since(enqueued_at);
        debug!("dispatching {:?} (queue wait: {:?})", command, queue_wait);

        let result = transport.exchange(&command).await;

        let device_rtt = started.elapsed();
        if let Err(ref e) = result {
            warn!("{:?} failed after {:?}: {}", command, device_rtt, e);
        }
        self.state
            .metrics()
            .record_operation(queue_wait, device_rtt, result.is_ok());

        // The caller may have given up waiting; the exchange still happened.
        let _ = respond_to.send(result);
    }
}

/// Handle for submitting commands to the queue worker
#[derive(Clone)]
pub struct CommandQueue {
    cmd_tx: mpsc::Sender<CommandRequest>,
    state: Arc<QueueState>,
}

impl CommandQueue {
    /// Spawn the worker on the current runtime and return a handle to it.
    pub fn spawn(capacity: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(QueueState::default());

        let worker = QueueWorker {
            cmd_rx,
            state: Arc::clone(&state),
        };
        tokio::spawn(worker.run());

        Self { cmd_tx, state }
    }

    /// Queue `command` for `transport` and wait for its response.
    ///
    /// Completes in submission order relative to every other caller of this
    /// queue; the exchange itself is never overlapped with another one.
    #[instrument(level = "debug", skip(self, transport), fields(ins = command.ins))]
    pub async fn submit(
        &self,
        transport: Arc<dyn Transport>,
        command: APDUCommand,
    ) -> Result<Vec<u8>, TransportError> {
        let (tx, rx) = oneshot::channel();
        let request = CommandRequest {
            transport,
            command,
            respond_to: tx,
            enqueued_at: Instant::now(),
        };

        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self.cmd_tx.send(request).await.is_err() {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }

        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Requests accepted but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// True while an exchange is in flight or requests are waiting.
    pub fn is_busy(&self) -> bool {
        self.state.in_flight.load(Ordering::SeqCst) || self.pending() > 0
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.state.metrics().clone()
    }
}
