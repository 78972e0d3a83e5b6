use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use hidapi::{DeviceInfo, HidApi, HidDevice};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::framing::{check_status, wrap_command, ResponseReader, HID_PACKET_SIZE};
use super::{Connector, DeviceEvent, Transport, TransportError};
use crate::apdu::APDUCommand;

pub const LEDGER_VID: u16 = 0x2c97;
pub const LEDGER_USAGE_PAGE: u16 = 0xffa0;

// Reads poll in short slices so a pending confirmation can be abandoned on close.
const READ_POLL_MS: i32 = 250;
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn is_ledger(info: &DeviceInfo) -> bool {
    info.vendor_id() == LEDGER_VID
        && (info.usage_page() == LEDGER_USAGE_PAGE || info.interface_number() == 0)
}

fn join_error(e: tokio::task::JoinError) -> TransportError {
    TransportError::Io(format!("HID worker failed: {}", e))
}

struct HidHandle {
    device: Mutex<Option<HidDevice>>,
    closed: AtomicBool,
}

impl HidHandle {
    fn device(&self) -> MutexGuard<'_, Option<HidDevice>> {
        self.device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn exchange_blocking(&self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let guard = self.device();
        let device = guard.as_ref().ok_or(TransportError::Closed)?;

        for packet in wrap_command(apdu) {
            // hidapi expects the report id in front of every write
            let mut report = [0u8; HID_PACKET_SIZE + 1];
            report[1..].copy_from_slice(&packet);
            device.write(&report).map_err(|e| {
                warn!("HID write failed: {}", e);
                TransportError::Disconnected
            })?;
        }

        let mut reader = ResponseReader::new();
        let mut packet = [0u8; HID_PACKET_SIZE];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let read = device.read_timeout(&mut packet, READ_POLL_MS).map_err(|e| {
                warn!("HID read failed: {}", e);
                TransportError::Disconnected
            })?;
            if read == 0 {
                // still waiting, possibly on the holder confirming on screen
                continue;
            }
            if let Some(response) = reader.push(&packet[..read])? {
                return check_status(response);
            }
        }
    }
}

/// USB HID channel to a Ledger device.
pub struct HidTransport {
    handle: Arc<HidHandle>,
}

impl HidTransport {
    pub fn new(device: HidDevice) -> Self {
        Self {
            handle: Arc::new(HidHandle {
                device: Mutex::new(Some(device)),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl Transport for HidTransport {
    async fn exchange(&self, command: &APDUCommand) -> Result<Vec<u8>, TransportError> {
        let apdu = command.encode()?;
        debug!("HID exchange: {}", hex::encode(&apdu));

        let handle = Arc::clone(&self.handle);
        let response = tokio::task::spawn_blocking(move || handle.exchange_blocking(&apdu))
            .await
            .map_err(join_error)?;

        if let Ok(bytes) = &response {
            debug!("HID response: {}", hex::encode(bytes));
        }
        response
    }

    async fn close(&self) {
        self.handle.closed.store(true, Ordering::SeqCst);
        let handle = Arc::clone(&self.handle);
        // Taking the device waits for an in-flight exchange to notice the flag.
        let dropped = tokio::task::spawn_blocking(move || handle.device().take()).await;
        match dropped {
            Ok(Some(_)) => info!("🔌 HID device closed"),
            Ok(None) => {}
            Err(e) => error!("Failed to close HID device: {}", e),
        }
    }
}

/// Opens the first Ledger found on the USB bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct HidConnector;

impl HidConnector {
    fn open_blocking() -> Result<Arc<dyn Transport>, TransportError> {
        let api = HidApi::new().map_err(|e| TransportError::Io(e.to_string()))?;

        let candidates: Vec<&DeviceInfo> = api.device_list().filter(|d| is_ledger(d)).collect();
        if candidates.is_empty() {
            return Err(TransportError::NoDevice);
        }
        info!("Found {} Ledger interface(s)", candidates.len());

        for info in &candidates {
            debug!(
                "Trying Ledger PID {:04x}, usage page {:04x}, path {}",
                info.product_id(),
                info.usage_page(),
                info.path().to_string_lossy()
            );
            match info.open_device(&api) {
                Ok(device) => {
                    info!("✅ Opened Ledger {:?}", info.product_string());
                    let transport: Arc<dyn Transport> = Arc::new(HidTransport::new(device));
                    return Ok(transport);
                }
                Err(e) => warn!("Failed to open Ledger interface: {}", e),
            }
        }

        Err(TransportError::Io(format!(
            "found {} Ledger interface(s) but could not open any; is another application using the device?",
            candidates.len()
        )))
    }
}

#[async_trait]
impl Connector for HidConnector {
    async fn open(&self) -> Result<Arc<dyn Transport>, TransportError> {
        tokio::task::spawn_blocking(Self::open_blocking)
            .await
            .map_err(join_error)?
    }
}

/// Polls the HID bus and reports Ledger attach/remove transitions.
///
/// A device already plugged in when the monitor starts is reported as
/// attached on the first poll.
pub struct HidMonitor {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HidMonitor {
    pub fn start(events: mpsc::Sender<DeviceEvent>) -> Result<Self, TransportError> {
        Self::with_interval(events, MONITOR_POLL_INTERVAL)
    }

    pub fn with_interval(
        events: mpsc::Sender<DeviceEvent>,
        interval: Duration,
    ) -> Result<Self, TransportError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name("ledger-hid-monitor".to_string())
            .spawn(move || Self::poll(events, running_clone, interval))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    fn poll(events: mpsc::Sender<DeviceEvent>, running: Arc<AtomicBool>, interval: Duration) {
        info!("HID monitor started");
        let mut api = match HidApi::new() {
            Ok(api) => api,
            Err(e) => {
                error!("HID monitor could not initialize hidapi: {}", e);
                return;
            }
        };

        let mut present = false;
        while running.load(Ordering::SeqCst) {
            match api.refresh_devices() {
                Ok(()) => {
                    let now = api.device_list().any(is_ledger);
                    if now != present {
                        present = now;
                        let event = if now {
                            DeviceEvent::Attached
                        } else {
                            DeviceEvent::Removed
                        };
                        info!("🔌 Ledger {:?}", event);
                        if events.blocking_send(event).is_err() {
                            debug!("device event receiver dropped");
                            break;
                        }
                    }
                }
                Err(e) => warn!("HID device poll failed: {}", e),
            }
            std::thread::sleep(interval);
        }
        info!("HID monitor stopped");
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("HID monitor thread panicked");
            }
        }
    }
}

impl Drop for HidMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
