//! Connection manager
//!
//! Owns the single logical connection and drives
//! `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
//!
//! The current connection is an `Arc<Connection>` that is only ever replaced
//! whole under the state lock. Each connection carries an epoch from a
//! monotonic counter; pollers compare epochs, not device ids, so a poller
//! from an earlier session with the same device can never act on the new one.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hidlink_transport::{
    BoxedHidService, ConnectionHandle, Criteria, DeviceDescriptor, DeviceId, TransportError,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HidLinkConfig, PollerConfig};
use crate::error::SessionError;
use crate::matcher::DeviceMatcher;
use crate::poller::{Poller, ReportHandler};

/// Session event broadcast capacity
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Enumerating / opening a device
    Connecting,
    /// Connection stored and poller running
    Connected,
    /// Tearing down; never observable outside the state lock
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// A live device session
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    device: DeviceDescriptor,
    epoch: u64,
}

impl Connection {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.device_id
    }

    /// Monotonic session number
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called (explicitly or by hot-plug removal)
    Requested,
    /// A new `connect` replaced the connection
    Superseded,
    /// The poller's receive failed
    ReceiveFailed,
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        device: DeviceDescriptor,
        epoch: u64,
    },
    Disconnected {
        device_id: DeviceId,
        epoch: u64,
        reason: DisconnectReason,
    },
    /// The poller for `epoch` hit a receive error and stopped
    PollerStopped { epoch: u64, error: TransportError },
}

/// Success callback for [`ConnectionManager::disconnect_with`]
pub type SuccessCallback = Box<dyn FnOnce() + Send + 'static>;

/// Failure callback for [`ConnectionManager::disconnect_with`]
pub type FailureCallback = Box<dyn FnOnce(SessionError) + Send + 'static>;

#[derive(Default)]
struct SessionState {
    phase: ConnectionState,
    current: Option<Arc<Connection>>,
    /// Device-side clocking flag; only meaningful while connected
    on_board_clocking: bool,
}

impl SessionState {
    /// Clear the current connection if `accept` says so
    fn teardown_if(
        &mut self,
        accept: impl FnOnce(&Connection) -> bool,
    ) -> Option<Arc<Connection>> {
        if !self.current.as_deref().is_some_and(accept) {
            return None;
        }
        self.phase = ConnectionState::Disconnecting;
        let connection = self.current.take();
        self.on_board_clocking = false;
        self.phase = ConnectionState::Disconnected;
        connection
    }
}

/// State shared between manager handles and pollers
pub(crate) struct Shared<H> {
    service: BoxedHidService,
    pub(crate) handler: H,
    poller: PollerConfig,
    criteria: RwLock<Criteria>,
    state: Mutex<SessionState>,
    next_epoch: AtomicU64,
    /// Serializes connect attempts and criteria changes
    connect_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
    active_pollers: Arc<AtomicUsize>,
}

impl<H> Shared<H> {
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_some_and(|c| c.epoch == epoch)
    }

    fn set_phase(&self, phase: ConnectionState) {
        self.state.lock().phase = phase;
    }

    fn emit(&self, event: SessionEvent) {
        // Ignores if no subscribers
        let _ = self.events.send(event);
    }

    /// Poller for `epoch` could not receive; drop the connection if it is still current
    pub(crate) fn poller_failed(&self, epoch: u64, error: TransportError) {
        let Some(connection) = self.state.lock().teardown_if(|c| c.epoch == epoch) else {
            debug!("Ignoring receive failure from stale epoch {}", epoch);
            return;
        };

        warn!(
            "Connection to {} lost: {} (epoch {})",
            connection.device, error, epoch
        );
        self.emit(SessionEvent::PollerStopped { epoch, error });
        self.emit(SessionEvent::Disconnected {
            device_id: connection.device_id(),
            epoch,
            reason: DisconnectReason::ReceiveFailed,
        });
        self.release_later(connection.handle);
    }

    /// Hand an abandoned handle back to the transport without waiting
    fn release_later(&self, handle: ConnectionHandle) {
        let service = Arc::clone(&self.service);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = service.disconnect(handle).await {
                        debug!("Release of connection {} failed: {}", handle, e);
                    }
                });
            }
            Err(_) => warn!(
                "No tokio runtime; connection {} left open in the transport",
                handle
            ),
        }
    }
}

impl<H> Drop for Shared<H> {
    fn drop(&mut self) {
        if let Some(connection) = self.state.get_mut().current.take() {
            debug!(
                "Connection manager dropped while connected to {}",
                connection.device
            );
            self.release_later(connection.handle);
        }
    }
}

/// Resets `Connecting` if a connect attempt ends without success (error or cancellation)
struct AttemptGuard<'a, H> {
    shared: &'a Shared<H>,
    armed: bool,
}

impl<H> Drop for AttemptGuard<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state.lock();
            if state.phase == ConnectionState::Connecting {
                state.phase = ConnectionState::Disconnected;
            }
        }
    }
}

/// Single-device connection manager
///
/// Cheap to clone; all clones drive the same connection.
pub struct ConnectionManager<H: ReportHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: ReportHandler> Clone for ConnectionManager<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: ReportHandler> ConnectionManager<H> {
    /// Manager with default criteria and poller settings
    pub fn new(service: BoxedHidService, handler: H) -> Self {
        Self::with_settings(service, handler, Criteria::default(), PollerConfig::default())
    }

    pub fn from_config(service: BoxedHidService, handler: H, config: &HidLinkConfig) -> Self {
        Self::with_settings(service, handler, config.criteria, config.poller)
    }

    pub fn with_settings(
        service: BoxedHidService,
        handler: H,
        criteria: Criteria,
        poller: PollerConfig,
    ) -> Self {
        if let Err(e) = poller.validate() {
            warn!("{}; clamping poller settings to at least 1", e);
        }
        let poller = poller.clamped();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                service,
                handler,
                poller,
                criteria: RwLock::new(criteria),
                state: Mutex::new(SessionState::default()),
                next_epoch: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                events,
                active_pollers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Connect to a device matching the criteria
    ///
    /// Any existing connection is torn down first and its handle released
    /// to the transport (awaited) before enumerating. With `preferred`, the
    /// device with that id is chosen; without it exactly one device must
    /// match. On success the poller is running when this returns.
    pub async fn connect(
        &self,
        preferred: Option<&DeviceDescriptor>,
    ) -> Result<DeviceDescriptor, SessionError> {
        let shared = &*self.shared;
        let _attempt_lock = shared.connect_lock.lock().await;

        let previous = {
            let mut state = shared.state.lock();
            let previous = state.teardown_if(|_| true);
            state.phase = ConnectionState::Connecting;
            previous
        };
        let mut guard = AttemptGuard {
            shared,
            armed: true,
        };

        if let Some(old) = previous {
            info!(
                "Reconnect supersedes connection to {} (epoch {})",
                old.device, old.epoch
            );
            if let Err(e) = shared.service.disconnect(old.handle).await {
                warn!("Failed to release superseded connection {}: {}", old.handle, e);
            }
            shared.emit(SessionEvent::Disconnected {
                device_id: old.device_id(),
                epoch: old.epoch,
                reason: DisconnectReason::Superseded,
            });
        }

        let criteria = *shared.criteria.read();
        let device = DeviceMatcher::new(shared.service.as_ref())
            .find(&criteria, preferred.map(|d| d.device_id))
            .await
            .inspect_err(|e| warn!("Connect failed: {}", e))?;

        let handle = match shared.service.connect(device.device_id).await {
            Ok(handle) => handle,
            Err(source) => {
                warn!("Transport failed to connect {}: {}", device, source);
                return Err(SessionError::TransportConnectFailed {
                    device_id: device.device_id,
                    source,
                });
            }
        };

        let epoch = shared.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(Connection {
            handle,
            device: device.clone(),
            epoch,
        });
        {
            let mut state = shared.state.lock();
            state.current = Some(Arc::clone(&connection));
            state.phase = ConnectionState::Connected;
        }
        guard.armed = false;

        Poller::new(
            Arc::downgrade(&self.shared),
            Arc::clone(&shared.service),
            connection,
            shared.poller,
        )
        .spawn(Arc::clone(&shared.active_pollers));

        info!("Connected to {} and polling (epoch {})", device, epoch);
        shared.emit(SessionEvent::Connected {
            device: device.clone(),
            epoch,
        });
        Ok(device)
    }

    /// Callback form of [`connect`](Self::connect)
    ///
    /// Runs the attempt on a spawned task and calls exactly one of the
    /// callbacks. Must be called within a tokio runtime.
    pub fn connect_with<S, F>(
        &self,
        preferred: Option<DeviceDescriptor>,
        on_success: S,
        on_failure: F,
    ) -> JoinHandle<()>
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(SessionError) + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.connect(preferred.as_ref()).await {
                Ok(_) => on_success(),
                Err(e) => on_failure(e),
            }
        })
    }

    /// Drop the connection to `device_id`
    ///
    /// Fails with `UnrecognizedDevice`, leaving state untouched, unless
    /// `device_id` is the current connection's device. State is cleared
    /// before returning; the transport handle is released in the background
    /// and a receive still in flight on it is discarded by the poller.
    pub fn disconnect(&self, device_id: DeviceId) -> Result<DeviceDescriptor, SessionError> {
        let shared = &*self.shared;
        let Some(connection) = shared
            .state
            .lock()
            .teardown_if(|c| c.device_id() == device_id)
        else {
            debug!("Don't recognize device {} to be removed", device_id);
            return Err(SessionError::UnrecognizedDevice(device_id));
        };

        info!(
            "Currently connected device {} removed (epoch {})",
            device_id, connection.epoch
        );
        shared.emit(SessionEvent::Disconnected {
            device_id,
            epoch: connection.epoch,
            reason: DisconnectReason::Requested,
        });
        shared.release_later(connection.handle);
        Ok(connection.device.clone())
    }

    /// Callback form of [`disconnect`](Self::disconnect); returns whether it succeeded
    pub fn disconnect_with(
        &self,
        device_id: DeviceId,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> bool {
        match self.disconnect(device_id) {
            Ok(_) => {
                if let Some(cb) = on_success {
                    cb();
                }
                true
            }
            Err(e) => {
                if let Some(cb) = on_failure {
                    cb(e);
                }
                false
            }
        }
    }

    /// Send an output report on the current connection
    pub async fn send_report(&self, report_id: u8, data: &[u8]) -> Result<(), SessionError> {
        let connection = self.current().ok_or(SessionError::NotConnected)?;
        self.shared
            .service
            .send(connection.handle, report_id, data)
            .await?;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().phase
    }

    pub fn current(&self) -> Option<Arc<Connection>> {
        self.shared.state.lock().current.clone()
    }

    pub fn current_device_id(&self) -> Option<DeviceId> {
        self.current().map(|c| c.device_id())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn criteria(&self) -> Criteria {
        *self.shared.criteria.read()
    }

    /// Change the matching criteria; waits for any connect in progress
    pub async fn set_criteria(&self, criteria: Criteria) {
        let _attempt_lock = self.shared.connect_lock.lock().await;
        *self.shared.criteria.write() = criteria;
        debug!("Criteria set to {}", criteria);
    }

    pub fn poller_config(&self) -> PollerConfig {
        self.shared.poller
    }

    pub fn on_board_clocking(&self) -> bool {
        self.shared.state.lock().on_board_clocking
    }

    /// Record that the device keeps its own clock; cleared on disconnect
    pub fn set_on_board_clocking(&self, enabled: bool) -> Result<(), SessionError> {
        let mut state = self.shared.state.lock();
        if state.current.is_none() {
            return Err(SessionError::NotConnected);
        }
        state.on_board_clocking = enabled;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Number of poller tasks still running (including ones winding down)
    pub fn active_pollers(&self) -> usize {
        self.shared.active_pollers.load(Ordering::SeqCst)
    }

    pub fn service(&self) -> &BoxedHidService {
        &self.shared.service
    }
}
