//! Hot-plug monitoring
//!
//! Both strategies work the same way: something triggers a rescan, and the
//! rescan is diffed against the previous snapshot to produce add/remove
//! events. On Linux with the `hotplug` feature a udev `hidraw` monitor
//! provides the trigger; otherwise a periodic timer does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device_registry::DeviceRegistry;
use crate::discovery::Backend;
use crate::types::{DeviceDescriptor, DeviceId, HotplugEvent};

/// Snapshot of attached devices between rescans
pub(crate) struct Rescanner {
    known: BTreeMap<DeviceId, DeviceDescriptor>,
}

impl Rescanner {
    pub(crate) fn new(initial: Vec<DeviceDescriptor>) -> Self {
        Self {
            known: initial.into_iter().map(|d| (d.device_id, d)).collect(),
        }
    }

    /// Compare a fresh scan with the snapshot
    ///
    /// Removed devices are forgotten by the registry so a re-attached
    /// device gets a new id. Removals are reported before additions.
    pub(crate) fn diff(
        &mut self,
        current: Vec<DeviceDescriptor>,
        registry: &Mutex<DeviceRegistry>,
    ) -> Vec<HotplugEvent> {
        let current: BTreeMap<DeviceId, DeviceDescriptor> =
            current.into_iter().map(|d| (d.device_id, d)).collect();
        let mut events = Vec::new();

        let removed: Vec<DeviceId> = self
            .known
            .keys()
            .filter(|id| !current.contains_key(id))
            .copied()
            .collect();
        if !removed.is_empty() {
            let mut registry = registry.lock();
            for id in removed {
                registry.forget(id);
                events.push(HotplugEvent::Removed(id));
            }
        }

        for (id, device) in &current {
            if !self.known.contains_key(id) {
                events.push(HotplugEvent::Added(device.clone()));
            }
        }

        self.known = current;
        events
    }
}

fn publish(tx: &broadcast::Sender<HotplugEvent>, events: Vec<HotplugEvent>) {
    for event in events {
        match &event {
            HotplugEvent::Added(d) => info!("Hot-plug: {} attached", d),
            HotplugEvent::Removed(id) => info!("Hot-plug: device {} removed", id),
        }
        // Send to all subscribers (ignores if no receivers)
        let _ = tx.send(event);
    }
}

/// Start the best available monitor
pub(crate) fn start(
    backend: Arc<Backend>,
    tx: broadcast::Sender<HotplugEvent>,
    shutdown: Arc<AtomicBool>,
    rescan_interval_ms: u64,
) {
    let initial = match backend.scan(None) {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Initial hot-plug scan failed: {}", e);
            Vec::new()
        }
    };
    let rescanner = Rescanner::new(initial);

    #[cfg(all(target_os = "linux", feature = "hotplug"))]
    let rescanner = match udev::spawn(
        Arc::clone(&backend),
        tx.clone(),
        Arc::clone(&shutdown),
        rescanner,
    ) {
        Ok(()) => return,
        Err(rescanner) => rescanner,
    };

    spawn_rescan_loop(backend, tx, shutdown, rescanner, rescan_interval_ms);
}

/// Timer-driven fallback
fn spawn_rescan_loop(
    backend: Arc<Backend>,
    tx: broadcast::Sender<HotplugEvent>,
    shutdown: Arc<AtomicBool>,
    mut rescanner: Rescanner,
    interval_ms: u64,
) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime; hot-plug events disabled");
        return;
    };

    info!("Hot-plug: rescanning every {} ms", interval_ms);
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let scan_backend = Arc::clone(&backend);
            match tokio::task::spawn_blocking(move || scan_backend.scan(None)).await {
                Ok(Ok(devices)) => publish(&tx, rescanner.diff(devices, &backend.registry)),
                Ok(Err(e)) => warn!("Hot-plug rescan failed: {}", e),
                Err(e) => warn!("Hot-plug rescan task failed: {}", e),
            }
        }

        debug!("Hot-plug rescan loop exiting");
    });
}

#[cfg(all(target_os = "linux", feature = "hotplug"))]
mod udev {
    use super::*;

    use futures::StreamExt;
    use tokio_udev::{AsyncMonitorSocket, EventType, MonitorBuilder};

    /// Run a udev monitor on a dedicated thread
    ///
    /// Hands the rescanner back if the monitor could not be set up.
    pub(super) fn spawn(
        backend: Arc<Backend>,
        tx: broadcast::Sender<HotplugEvent>,
        shutdown: Arc<AtomicBool>,
        rescanner: Rescanner,
    ) -> Result<(), Rescanner> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), Rescanner>>();

        let spawned = std::thread::Builder::new()
            .name("hid-hotplug-udev".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("udev monitor runtime failed: {}", e);
                        let _ = ready_tx.send(Err(rescanner));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let socket = MonitorBuilder::new()
                        .and_then(|b| b.match_subsystem("hidraw"))
                        .and_then(|b| b.listen())
                        .and_then(AsyncMonitorSocket::new);
                    let socket = match socket {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("udev monitor unavailable: {}", e);
                            let _ = ready_tx.send(Err(rescanner));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    info!("Hot-plug: listening for hidraw udev events");
                    run(socket, backend, tx, shutdown, rescanner).await;
                });
            });

        if let Err(e) = spawned {
            warn!("Failed to spawn udev monitor thread: {}", e);
            // The closure (and the rescanner with it) is gone; start over
            return Err(Rescanner::new(Vec::new()));
        }

        match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Rescanner::new(Vec::new())),
        }
    }

    async fn run(
        mut socket: AsyncMonitorSocket,
        backend: Arc<Backend>,
        tx: broadcast::Sender<HotplugEvent>,
        shutdown: Arc<AtomicBool>,
        mut rescanner: Rescanner,
    ) {
        while let Some(event) = socket.next().await {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    warn!("udev monitor error: {}", e);
                    continue;
                }
            };
            if !matches!(event.event_type(), EventType::Add | EventType::Remove) {
                continue;
            }
            debug!(
                "udev {:?} for {:?}",
                event.event_type(),
                event.device().devnode()
            );

            match backend.scan(None) {
                Ok(devices) => publish(&tx, rescanner.diff(devices, &backend.registry)),
                Err(e) => warn!("Hot-plug rescan failed: {}", e),
            }
        }
        debug!("udev monitor exiting");
    }
}
