//! Hot-plug listener
//!
//! Subscribes once to the transport's add/remove notifications and forwards
//! them to the connection manager. Events are handled one at a time, in the
//! order the transport reported them.
//!
//! The default add handling awaits its connect before the next event is
//! taken, so a removal that arrives mid-connect is applied to the finished
//! attempt and cannot be overtaken by it. Connect and disconnect failures
//! are logged and go no further.

use std::sync::Arc;

use hidlink_transport::{DeviceDescriptor, DeviceId, HotplugEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manager::ConnectionManager;
use crate::poller::ReportHandler;

/// Caller-supplied replacement for the default add behaviour
pub type AddCallback = Arc<dyn Fn(DeviceDescriptor) + Send + Sync + 'static>;

/// Caller-supplied replacement for the default remove behaviour
pub type RemoveCallback = Arc<dyn Fn(DeviceId) + Send + Sync + 'static>;

/// Builds a [`HotplugListener`]
pub struct HotplugListenerBuilder<H: ReportHandler> {
    manager: ConnectionManager<H>,
    on_added: Option<AddCallback>,
    on_removed: Option<RemoveCallback>,
}

impl<H: ReportHandler> HotplugListenerBuilder<H> {
    /// Replace the default add handling (connect to the added device)
    pub fn on_added<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceDescriptor) + Send + Sync + 'static,
    {
        self.on_added = Some(Arc::new(f));
        self
    }

    /// Replace the default remove handling (disconnect the removed device)
    pub fn on_removed<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceId) + Send + Sync + 'static,
    {
        self.on_removed = Some(Arc::new(f));
        self
    }

    /// Subscribe to the transport and start handling events
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(self) -> HotplugListener {
        let events = self.manager.service().watch();
        self.spawn_with(events)
    }

    /// Like [`spawn`](Self::spawn) with an existing subscription
    pub fn spawn_with(self, events: broadcast::Receiver<HotplugEvent>) -> HotplugListener {
        let task = tokio::spawn(run(self, events));
        HotplugListener { task }
    }
}

/// Running hot-plug listener; stops when dropped or when the transport closes its channel
pub struct HotplugListener {
    task: JoinHandle<()>,
}

impl HotplugListener {
    pub fn builder<H: ReportHandler>(manager: ConnectionManager<H>) -> HotplugListenerBuilder<H> {
        HotplugListenerBuilder {
            manager,
            on_added: None,
            on_removed: None,
        }
    }

    /// Listener with the default handlers
    pub fn spawn<H: ReportHandler>(manager: ConnectionManager<H>) -> Self {
        Self::builder(manager).spawn()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HotplugListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<H: ReportHandler>(
    listener: HotplugListenerBuilder<H>,
    mut events: broadcast::Receiver<HotplugEvent>,
) {
    debug!("Hotplug listener started");
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Hotplug listener lagged by {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            HotplugEvent::Added(device) => match &listener.on_added {
                Some(cb) => cb(device),
                None => device_added(&listener.manager, device).await,
            },
            HotplugEvent::Removed(device_id) => match &listener.on_removed {
                Some(cb) => cb(device_id),
                None => device_removed(&listener.manager, device_id),
            },
        }
    }
    debug!("Hotplug listener stopped: transport event channel closed");
}

/// Default add handling: connect, preferring the added device
async fn device_added<H: ReportHandler>(manager: &ConnectionManager<H>, device: DeviceDescriptor) {
    // The platform watch reports every HID device, not just ours
    if !manager.criteria().matches(&device) {
        debug!("Ignoring added {}: does not match {}", device, manager.criteria());
        return;
    }
    info!("Device added: {}", device);
    if let Err(e) = manager.connect(Some(&device)).await {
        debug!("Connect after hotplug add failed: {}", e);
    }
}

/// Default remove handling: disconnect if it is ours
fn device_removed<H: ReportHandler>(manager: &ConnectionManager<H>, device_id: DeviceId) {
    match manager.disconnect(device_id) {
        Ok(device) => info!("Device removed: {}", device),
        Err(e) => debug!("Hotplug remove of device {}: {}", device_id, e),
    }
}
