//! Device session: owns the transport, the command queue and the
//! companion-app lifecycle, and reacts to attach/remove events.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::apdu::APDUCommand;
use crate::config::LedgerConfig;
use crate::error::{translate, LedgerError, Result};
use crate::lifecycle::{Lifecycle, LifecycleAction, LifecycleEvent};
use crate::queue::CommandQueue;
use crate::transport::{Connector, DeviceEvent, Transport, TransportError};

const NOTIFICATION_CAPACITY: usize = 16;

/// Signals raised towards the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotification {
    /// A version handshake found the companion app in the foreground.
    AppOpened,
    /// The companion app went away and did not come back within the grace period.
    DeviceLocked,
}

pub struct DeviceSession {
    me: Weak<DeviceSession>,
    config: LedgerConfig,
    connector: Arc<dyn Connector>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    // Serializes transport creation so concurrent callers share one handle.
    connect_lock: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    queue: CommandQueue,
    notifications: broadcast::Sender<SessionNotification>,
}

impl DeviceSession {
    /// Create a session on the current tokio runtime. No device is touched
    /// until the first operation or attach event.
    pub fn new(connector: Arc<dyn Connector>, config: LedgerConfig) -> Arc<Self> {
        let queue = CommandQueue::spawn(config.queue_capacity);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            connector,
            transport: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::new()),
            queue,
            notifications,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    pub fn is_app_open(&self) -> bool {
        self.lifecycle().is_app_open()
    }

    /// True while a transport handle is held.
    pub fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    /// Return the current transport, opening one if none is held.
    #[instrument(level = "debug", skip(self))]
    pub async fn transport(&self) -> Result<Arc<dyn Transport>> {
        let current = self.slot().clone();
        if let Some(transport) = current {
            return Ok(transport);
        }

        let _connecting = self.connect_lock.lock().await;
        // Another caller may have connected while we waited.
        let current = self.slot().clone();
        if let Some(transport) = current {
            return Ok(transport);
        }

        let timeout = self.config.connect_timeout();
        info!("🔗 Opening Ledger transport (timeout {:?})", timeout);
        let transport = tokio::time::timeout(timeout, self.connector.open())
            .await
            .map_err(|_| LedgerError::ConnectTimeout(timeout))?
            .map_err(translate)?;

        *self.slot() = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Owning handle to this session, for work that must outlive the caller.
    pub(crate) fn shared(&self) -> Result<Arc<Self>> {
        self.me
            .upgrade()
            .ok_or(LedgerError::Transport(TransportError::Closed))
    }

    /// Acquire the transport and run one queued exchange on it.
    pub(crate) async fn exchange(&self, command: APDUCommand) -> Result<Vec<u8>> {
        let transport = self.transport().await?;
        self.exchange_on(&transport, command).await
    }

    /// Run one queued exchange on an already acquired transport.
    pub(crate) async fn exchange_on(
        &self,
        transport: &Arc<dyn Transport>,
        command: APDUCommand,
    ) -> Result<Vec<u8>> {
        self.queue
            .submit(Arc::clone(transport), command)
            .await
            .map_err(translate)
    }

    /// React to an attach/remove notification from the USB layer.
    #[instrument(level = "info", skip(self))]
    pub async fn handle_event(&self, event: DeviceEvent) {
        let lifecycle_event = match event {
            DeviceEvent::Attached => LifecycleEvent::Attached,
            DeviceEvent::Removed => LifecycleEvent::Removed,
        };

        let actions = self.apply(lifecycle_event);
        if actions.contains(&LifecycleAction::ReleaseTransport) {
            self.release_transport().await;
        }
    }

    /// Drive the session from a stream of device events until the stream
    /// ends or the session is dropped.
    pub fn spawn_event_loop(&self, mut events: mpsc::Receiver<DeviceEvent>) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = me.upgrade() else {
                    break;
                };
                session.handle_event(event).await;
            }
            debug!("device event stream ended");
        })
    }

    /// Feed one event to the lifecycle machine and carry out everything that
    /// does not need to wait. Transport release is left to the caller.
    pub(crate) fn apply(&self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        let actions = self.lifecycle().handle(event);

        for action in &actions {
            match *action {
                LifecycleAction::CheckVersion => self.spawn_version_check(),
                LifecycleAction::StartGraceTimer { generation } => {
                    self.spawn_grace_timer(generation)
                }
                LifecycleAction::NotifyAppOpened => self.notify(SessionNotification::AppOpened),
                LifecycleAction::NotifyLocked => self.notify(SessionNotification::DeviceLocked),
                LifecycleAction::ReleaseTransport => {}
            }
        }
        actions
    }

    async fn release_transport(&self) {
        let released = self.slot().take();
        if let Some(transport) = released {
            info!("🔌 Releasing Ledger transport");
            transport.close().await;
        }
    }

    fn spawn_version_check(&self) {
        let me = self.me.clone();
        tokio::spawn(async move {
            let Some(session) = me.upgrade() else {
                return;
            };
            // Any other app (or none) may be in the foreground; that is not an error.
            if let Err(e) = session.get_version().await {
                debug!("version check after attach failed: {}", e);
            }
        });
    }

    fn spawn_grace_timer(&self, generation: u64) {
        let me = self.me.clone();
        let grace = self.config.lock_grace_period();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(session) = me.upgrade() {
                session.apply(LifecycleEvent::GraceElapsed(generation));
            }
        });
    }

    fn notify(&self, notification: SessionNotification) {
        info!("📣 {:?}", notification);
        if self.notifications.send(notification).is_err() {
            debug!("no subscribers for {:?}", notification);
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
