//! In-memory HID service
//!
//! Devices are plain descriptors. Each open handle gets its own report
//! queue; reports injected for a device go to its most recently opened,
//! still-open handle. Releasing a handle (or unplugging its device) closes
//! the queue, which completes any pending `receive` with `Disconnected`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::TransportError;
use crate::types::{ConnectionHandle, Criteria, DeviceDescriptor, DeviceId, HotplugEvent, InputReport};
use crate::HidService;

type ReportResult = Result<InputReport, TransportError>;

/// Per-operation call log
#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    pub enumerate: usize,
    pub connect: Vec<DeviceId>,
    pub receive: usize,
    pub send: Vec<(ConnectionHandle, u8, Vec<u8>)>,
    pub disconnect: Vec<ConnectionHandle>,
}

struct Session {
    device_id: DeviceId,
    tx: mpsc::UnboundedSender<ReportResult>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ReportResult>>>,
}

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceDescriptor>,
    sessions: HashMap<ConnectionHandle, Session>,
    /// Open order, newest last
    open_order: Vec<ConnectionHandle>,
    next_handle: u32,
    failing_connects: HashSet<DeviceId>,
    /// Simulated enumeration latency
    enumerate_delay: Option<Duration>,
    calls: MockCalls,
}

impl MockState {
    fn latest_session(&self, device_id: DeviceId) -> Option<&Session> {
        self.open_order
            .iter()
            .rev()
            .filter_map(|h| self.sessions.get(h))
            .find(|s| s.device_id == device_id)
    }

    fn close(&mut self, handle: ConnectionHandle) -> bool {
        self.open_order.retain(|h| *h != handle);
        // Dropping the sender ends the session's queue
        self.sessions.remove(&handle).is_some()
    }
}

pub struct MockHidService {
    state: Mutex<MockState>,
    event_tx: broadcast::Sender<HotplugEvent>,
}

impl Default for MockHidService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHidService {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                ..MockState::default()
            }),
            event_tx,
        }
    }

    pub fn with_devices(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let service = Self::new();
        service.state.lock().devices.extend(devices);
        service
    }

    /// Attach a device without a hot-plug notification
    pub fn add_device(&self, device: DeviceDescriptor) {
        self.state.lock().devices.push(device);
    }

    /// Attach a device and broadcast `Added`
    pub fn plug(&self, device: DeviceDescriptor) {
        self.add_device(device.clone());
        let _ = self.event_tx.send(HotplugEvent::Added(device));
    }

    /// Detach a device, close its sessions and broadcast `Removed`
    pub fn unplug(&self, device_id: DeviceId) {
        {
            let mut state = self.state.lock();
            state.devices.retain(|d| d.device_id != device_id);
            let handles: Vec<ConnectionHandle> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.device_id == device_id)
                .map(|(h, _)| *h)
                .collect();
            for h in handles {
                state.close(h);
            }
        }
        let _ = self.event_tx.send(HotplugEvent::Removed(device_id));
    }

    /// Queue a report for the device's newest open session
    ///
    /// Returns false if the device has no open session.
    pub fn inject_report(&self, device_id: DeviceId, report_id: u8, data: &[u8]) -> bool {
        self.inject(device_id, Ok(InputReport::new(report_id, data.to_vec())))
    }

    /// Make the device's newest open session fail its next receive
    pub fn inject_error(&self, device_id: DeviceId, error: TransportError) -> bool {
        self.inject(device_id, Err(error))
    }

    fn inject(&self, device_id: DeviceId, item: ReportResult) -> bool {
        let state = self.state.lock();
        match state.latest_session(device_id) {
            Some(session) => session.tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Make `connect` fail for this device
    pub fn fail_connect(&self, device_id: DeviceId) {
        self.state.lock().failing_connects.insert(device_id);
    }

    /// Make every `enumerate` take this long (snapshot taken before the wait)
    pub fn set_enumerate_delay(&self, delay: Duration) {
        self.state.lock().enumerate_delay = Some(delay);
    }

    pub fn calls(&self) -> MockCalls {
        self.state.lock().calls.clone()
    }

    pub fn open_handles(&self) -> Vec<ConnectionHandle> {
        self.state.lock().open_order.clone()
    }

    /// Number of current hot-plug subscribers
    pub fn watchers(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

#[async_trait]
impl HidService for MockHidService {
    async fn enumerate(
        &self,
        criteria: &Criteria,
    ) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let (devices, delay) = {
            let mut state = self.state.lock();
            state.calls.enumerate += 1;
            let devices: Vec<DeviceDescriptor> = state
                .devices
                .iter()
                .filter(|d| criteria.matches(d))
                .cloned()
                .collect();
            (devices, state.enumerate_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(devices)
    }

    async fn connect(&self, device_id: DeviceId) -> Result<ConnectionHandle, TransportError> {
        let mut state = self.state.lock();
        state.calls.connect.push(device_id);

        if state.failing_connects.contains(&device_id) {
            return Err(TransportError::HidError(format!(
                "mock connect refused for device {device_id}"
            )));
        }
        if !state.devices.iter().any(|d| d.device_id == device_id) {
            return Err(TransportError::DeviceNotFound(format!("device {device_id}")));
        }

        let handle = ConnectionHandle(state.next_handle);
        state.next_handle += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            handle,
            Session {
                device_id,
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
        );
        state.open_order.push(handle);
        debug!("mock: device {} opened as {}", device_id, handle);
        Ok(handle)
    }

    async fn receive(
        &self,
        handle: ConnectionHandle,
        max_len: usize,
    ) -> Result<InputReport, TransportError> {
        let rx = {
            let mut state = self.state.lock();
            state.calls.receive += 1;
            let session = state
                .sessions
                .get(&handle)
                .ok_or(TransportError::InvalidHandle(handle.0))?;
            Arc::clone(&session.rx)
        };

        let next = rx.lock().await.recv().await;
        match next {
            Some(Ok(mut report)) => {
                report.truncate(max_len);
                Ok(report)
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Disconnected),
        }
    }

    async fn send(
        &self,
        handle: ConnectionHandle,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&handle) {
            return Err(TransportError::InvalidHandle(handle.0));
        }
        state.calls.send.push((handle, report_id, data.to_vec()));
        Ok(())
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.calls.disconnect.push(handle);
        if state.close(handle) {
            Ok(())
        } else {
            Err(TransportError::InvalidHandle(handle.0))
        }
    }

    fn watch(&self) -> broadcast::Receiver<HotplugEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: u32) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceId(id), 4617, 1)
    }

    #[tokio::test]
    async fn test_enumerate_filters_by_criteria() {
        let mock = MockHidService::with_devices([
            dev(1),
            DeviceDescriptor::new(DeviceId(2), 0x046D, 0xC52B),
        ]);
        let found = mock.enumerate(&Criteria::default()).await.unwrap();
        assert_eq!(found, vec![dev(1)]);
        assert_eq!(mock.calls().enumerate, 1);
    }

    #[tokio::test]
    async fn test_injected_report_reaches_newest_session() {
        let mock = MockHidService::with_devices([dev(1)]);
        let old = mock.connect(DeviceId(1)).await.unwrap();
        let new = mock.connect(DeviceId(1)).await.unwrap();
        assert!(mock.inject_report(DeviceId(1), 0, &[1, 2, 3, 4]));

        let report = mock.receive(new, 2).await.unwrap();
        assert_eq!(report.data, vec![1, 2]);

        mock.disconnect(old).await.unwrap();
        assert_eq!(
            mock.receive(old, 64).await,
            Err(TransportError::InvalidHandle(old.0))
        );
    }

    #[tokio::test]
    async fn test_release_wakes_pending_receive() {
        let mock = Arc::new(MockHidService::with_devices([dev(1)]));
        let handle = mock.connect(DeviceId(1)).await.unwrap();

        let pending = {
            let mock = Arc::clone(&mock);
            tokio::spawn(async move { mock.receive(handle, 64).await })
        };
        tokio::task::yield_now().await;
        mock.disconnect(handle).await.unwrap();

        assert_eq!(pending.await.unwrap(), Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_unplug_broadcasts_and_closes() {
        let mock = MockHidService::with_devices([dev(1)]);
        let mut events = mock.watch();
        let _handle = mock.connect(DeviceId(1)).await.unwrap();

        mock.unplug(DeviceId(1));
        assert!(mock.open_handles().is_empty());
        assert_eq!(events.recv().await.unwrap(), HotplugEvent::Removed(DeviceId(1)));
        assert!(!mock.inject_report(DeviceId(1), 0, &[0]));
    }

    #[tokio::test]
    async fn test_forced_connect_failure() {
        let mock = MockHidService::with_devices([dev(1)]);
        mock.fail_connect(DeviceId(1));
        assert!(mock.connect(DeviceId(1)).await.is_err());
        assert_eq!(mock.calls().connect, vec![DeviceId(1)]);
    }
}
