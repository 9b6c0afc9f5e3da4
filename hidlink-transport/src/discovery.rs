//! hidapi-backed HID service
//!
//! Enumeration, session management and hot-plug wiring for real devices.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hidapi::HidApi;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::device_registry::DeviceRegistry;
use crate::error::TransportError;
use crate::hid_device::OpenDevice;
use crate::monitor;
use crate::types::{
    Collection, ConnectionHandle, Criteria, DeviceDescriptor, DeviceId, HotplugEvent,
    InputReport, ServiceConfig,
};
use crate::HidService;

/// Hot-plug broadcast capacity
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// One hidapi enumeration entry (one per top-level collection)
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: Option<String>,
    pub serial: Option<String>,
    pub collection: Collection,
}

impl From<&hidapi::DeviceInfo> for RawEntry {
    fn from(info: &hidapi::DeviceInfo) -> Self {
        Self {
            path: info.path().to_string_lossy().to_string(),
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            product_name: info.product_string().map(|s| s.to_string()),
            serial: info.serial_number().map(|s| s.to_string()),
            collection: Collection {
                usage_page: info.usage_page(),
                usage: info.usage(),
                interface_number: info.interface_number(),
            },
        }
    }
}

/// Fold per-collection entries into one descriptor per device path
///
/// `entries` must be the complete enumeration: registry paths missing from
/// it are forgotten, so a device that comes back gets a new id. Order
/// follows the first appearance of each path.
pub(crate) fn group_entries(
    entries: Vec<RawEntry>,
    registry: &mut DeviceRegistry,
    criteria: Option<&Criteria>,
) -> Vec<DeviceDescriptor> {
    let gone = registry.retain_present(entries.iter().map(|e| e.path.as_str()));
    if !gone.is_empty() {
        debug!("Devices no longer attached: {:?}", gone);
    }

    let mut devices: Vec<DeviceDescriptor> = Vec::new();

    for entry in entries {
        if let Some(c) = criteria {
            if entry.vendor_id != c.vendor_id || entry.product_id != c.product_id {
                continue;
            }
        }

        if let Some(existing) = devices.iter_mut().find(|d| d.path == entry.path) {
            if !existing.collections.contains(&entry.collection) {
                existing.collections.push(entry.collection);
            }
            continue;
        }

        devices.push(DeviceDescriptor {
            device_id: registry.assign(&entry.path),
            vendor_id: entry.vendor_id,
            product_id: entry.product_id,
            path: entry.path,
            product_name: entry.product_name,
            serial: entry.serial,
            collections: vec![entry.collection],
        });
    }

    devices
}

/// hidapi context plus the id registry, shared with the hot-plug monitor
pub(crate) struct Backend {
    api: Mutex<HidApi>,
    pub(crate) registry: Mutex<DeviceRegistry>,
}

impl Backend {
    /// Refresh hidapi's device list and describe what is attached
    pub(crate) fn scan(
        &self,
        criteria: Option<&Criteria>,
    ) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let mut api = self.api.lock();
        api.refresh_devices()?;
        let entries: Vec<RawEntry> = api.device_list().map(RawEntry::from).collect();
        drop(api);

        let mut registry = self.registry.lock();
        Ok(group_entries(entries, &mut registry, criteria))
    }

    fn open(&self, device_id: DeviceId) -> Result<OpenDevice, TransportError> {
        let path = self
            .registry
            .lock()
            .path_of(device_id)
            .map(|p| p.to_string())
            .ok_or_else(|| TransportError::DeviceNotFound(format!("device {device_id}")))?;

        let c_path = CString::new(path.as_str())
            .map_err(|e| TransportError::Internal(format!("bad device path {path:?}: {e}")))?;

        let device = self.api.lock().open_path(&c_path)?;
        Ok(OpenDevice::new(device, device_id))
    }
}

/// HID service backed by hidapi
pub struct HidApiService {
    backend: Arc<Backend>,
    sessions: Mutex<HashMap<ConnectionHandle, Arc<OpenDevice>>>,
    next_handle: AtomicU32,
    event_tx: broadcast::Sender<HotplugEvent>,
    monitor_started: AtomicBool,
    /// Shutdown flag for the hot-plug monitor
    shutdown: Arc<AtomicBool>,
    config: ServiceConfig,
}

impl HidApiService {
    /// Create a service with default settings
    pub fn new() -> Result<Self, TransportError> {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Result<Self, TransportError> {
        let api = HidApi::new()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            backend: Arc::new(Backend {
                api: Mutex::new(api),
                registry: Mutex::new(DeviceRegistry::new()),
            }),
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            event_tx,
            monitor_started: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn session(&self, handle: ConnectionHandle) -> Result<Arc<OpenDevice>, TransportError> {
        self.sessions
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(TransportError::InvalidHandle(handle.0))
    }
}

#[async_trait]
impl HidService for HidApiService {
    async fn enumerate(
        &self,
        criteria: &Criteria,
    ) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let devices = self.backend.scan(Some(criteria))?;
        for d in &devices {
            debug!("Found {} at {}", d, d.path);
        }
        info!("Found {} devices matching {}", devices.len(), criteria);
        Ok(devices)
    }

    async fn connect(&self, device_id: DeviceId) -> Result<ConnectionHandle, TransportError> {
        let device = self.backend.open(device_id)?;
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().insert(handle, Arc::new(device));
        info!("Opened device {} as connection {}", device_id, handle);
        Ok(handle)
    }

    async fn receive(
        &self,
        handle: ConnectionHandle,
        max_len: usize,
    ) -> Result<InputReport, TransportError> {
        let session = self.session(handle)?;
        let timeout_ms = self.config.read_timeout_ms;
        let numbered = self.config.numbered_reports;
        tokio::task::spawn_blocking(move || session.read_report(max_len, timeout_ms, numbered))
            .await?
    }

    async fn send(
        &self,
        handle: ConnectionHandle,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let session = self.session(handle)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || session.write_report(report_id, &data)).await?
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let session = self
            .sessions
            .lock()
            .remove(&handle)
            .ok_or(TransportError::InvalidHandle(handle.0))?;
        session.release();
        info!(
            "Released connection {} (device {})",
            handle,
            session.device_id()
        );
        // The HidDevice closes once any in-flight read drops its reference
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<HotplugEvent> {
        let rx = self.event_tx.subscribe();
        if !self.monitor_started.swap(true, Ordering::SeqCst) {
            monitor::start(
                Arc::clone(&self.backend),
                self.event_tx.clone(),
                Arc::clone(&self.shutdown),
                self.config.rescan_interval_ms,
            );
        }
        rx
    }
}

impl Drop for HidApiService {
    fn drop(&mut self) {
        // Signal shutdown to the hot-plug monitor and any pending readers
        self.shutdown.store(true, Ordering::SeqCst);
        for session in self.sessions.lock().values() {
            session.release();
        }
        debug!("HidApiService dropped, signaling monitor shutdown");
    }
}
