//! End-to-end connection lifecycle against the in-memory HID service

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use hidlink::{
    handler_fn, ConnectionManager, ConnectionState, Criteria, DeviceDescriptor, DeviceId,
    DisconnectReason, ErrorKind, HotplugListener, InputReport, PollerConfig, ReportHandler,
    SessionError, SessionEvent, TransportError,
};
use hidlink_transport::MockHidService;

fn dev(id: u32) -> DeviceDescriptor {
    DeviceDescriptor::new(DeviceId(id), 4617, 1)
}

/// Manager whose handler counts reports
fn counting_manager(
    mock: &Arc<MockHidService>,
    poller: PollerConfig,
) -> (ConnectionManager<impl ReportHandler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handler = handler_fn(move |r: &InputReport| {
        seen.fetch_add(1, Ordering::SeqCst);
        Some(r.data.len())
    });
    let manager = ConnectionManager::with_settings(mock.clone(), handler, Criteria::default(), poller);
    (manager, count)
}

async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Yield until `cond` holds, failing after a second
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_single_device_connects() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());
    let mut events = manager.subscribe();

    let (tx, rx) = oneshot::channel();
    manager.connect_with(
        None,
        move || {
            let _ = tx.send(());
        },
        |e| panic!("unexpected failure: {e}"),
    );
    rx.await.unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.current_device_id(), Some(DeviceId(7)));
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Connected {
            device: dev(7),
            epoch: 1
        }
    );
}

#[tokio::test]
async fn test_two_devices_fail_without_target() {
    let mock = Arc::new(MockHidService::with_devices([dev(7), dev(8)]));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());

    let (tx, rx) = oneshot::channel();
    manager.connect_with(
        None,
        || panic!("connect should not succeed"),
        move |e| {
            let _ = tx.send(e);
        },
    );
    let err = rx.await.unwrap();
    assert_eq!(err.kind(), ErrorKind::AmbiguousMatch);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(mock.calls().connect.is_empty());

    // A target picks one of them
    let device = manager.connect(Some(&dev(8))).await.unwrap();
    assert_eq!(device.device_id, DeviceId(8));
}

#[tokio::test]
async fn test_disconnect_other_device_is_rejected() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());
    manager.connect(None).await.unwrap();

    let failed = Arc::new(Mutex::new(None));
    let slot = failed.clone();
    let ok = manager.disconnect_with(
        DeviceId(8),
        Some(Box::new(|| panic!("disconnect of 8 should fail"))),
        Some(Box::new(move |e: SessionError| *slot.lock() = Some(e))),
    );

    assert!(!ok);
    assert_eq!(
        *failed.lock(),
        Some(SessionError::UnrecognizedDevice(DeviceId(8)))
    );
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.current_device_id(), Some(DeviceId(7)));
}

#[tokio::test]
async fn test_disconnect_stops_poller_and_releases_handle() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());
    let mut events = manager.subscribe();

    manager.connect(None).await.unwrap();
    let handle = manager.current().unwrap().handle();
    assert_eq!(manager.active_pollers(), 1);

    let removed = manager.disconnect(DeviceId(7)).unwrap();
    assert_eq!(removed.device_id, DeviceId(7));
    // Cleared before disconnect returns
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current().is_none());

    wait_until(|| manager.active_pollers() == 0).await;
    wait_until(|| mock.open_handles().is_empty()).await;
    assert_eq!(mock.calls().disconnect, vec![handle]);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { .. }));
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Disconnected {
            device_id: DeviceId(7),
            epoch: 1,
            reason: DisconnectReason::Requested
        }
    );
}

#[tokio::test]
async fn test_reconnect_supersedes_previous_connection() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let (manager, count) = counting_manager(&mock, PollerConfig::default());
    let mut events = manager.subscribe();

    manager.connect(None).await.unwrap();
    let first = manager.current().unwrap();
    manager.connect(None).await.unwrap();
    let second = manager.current().unwrap();

    assert_ne!(first.handle(), second.handle());
    assert_eq!(second.epoch(), first.epoch() + 1);
    // The old handle was released before the new one was opened
    assert_eq!(mock.calls().disconnect, vec![first.handle()]);
    assert_eq!(mock.open_handles(), vec![second.handle()]);

    wait_until(|| manager.active_pollers() == 1).await;

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { epoch: 1, .. }));
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Disconnected {
            device_id: DeviceId(7),
            epoch: 1,
            reason: DisconnectReason::Superseded
        }
    );
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { epoch: 2, .. }));

    // Reports reach the handler exactly once
    assert!(mock.inject_report(DeviceId(7), 0, &[1, 2, 3]));
    wait_until(|| count.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_in_flight_receive_after_disconnect_is_discarded() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let (manager, count) = counting_manager(&mock, PollerConfig::default());
    manager.connect(None).await.unwrap();

    // Poller is parked in receive
    wait_until(|| mock.calls().receive >= 1).await;

    manager.disconnect(DeviceId(7)).unwrap();
    // The handle is still open in the transport; the pending receive gets this report
    assert!(mock.inject_report(DeviceId(7), 0, &[0xDE, 0xAD]));

    wait_until(|| manager.active_pollers() == 0).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_receive_failure_tears_down_connection() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let (manager, count) = counting_manager(&mock, PollerConfig::default());
    let mut events = manager.subscribe();

    manager.connect(None).await.unwrap();
    manager.set_on_board_clocking(true).unwrap();
    let handle = manager.current().unwrap().handle();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { .. }));

    let error = TransportError::HidError("read failed".into());
    assert!(mock.inject_error(DeviceId(7), error.clone()));

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::PollerStopped { epoch: 1, error }
    );
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Disconnected {
            device_id: DeviceId(7),
            epoch: 1,
            reason: DisconnectReason::ReceiveFailed
        }
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.on_board_clocking());
    assert_eq!(count.load(Ordering::SeqCst), 0);

    wait_until(|| manager.active_pollers() == 0).await;
    wait_until(|| mock.calls().disconnect == vec![handle]).await;

    // No retry; a later connect works again
    assert_eq!(mock.calls().connect.len(), 1);
    manager.connect(None).await.unwrap();
    assert_eq!(manager.current().unwrap().epoch(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_poll_interval_spacing() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let seen = stamps.clone();
    let handler = handler_fn(move |_: &InputReport| {
        seen.lock().push(Instant::now());
        None::<()>
    });
    let manager = ConnectionManager::with_settings(
        mock.clone(),
        handler,
        Criteria::default(),
        PollerConfig::new(10, 64).unwrap(),
    );
    manager.connect(None).await.unwrap();

    for i in 0..4u8 {
        assert!(mock.inject_report(DeviceId(7), 0, &[i]));
    }
    wait_until(|| stamps.lock().len() == 4).await;

    let stamps = stamps.lock();
    for pair in stamps.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(10));
    }
}

#[tokio::test]
async fn test_report_buffer_size_limits_data() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let lens = Arc::new(Mutex::new(Vec::new()));
    let seen = lens.clone();
    let handler = handler_fn(move |r: &InputReport| {
        seen.lock().push(r.data.len());
        None::<()>
    });
    let manager = ConnectionManager::with_settings(
        mock.clone(),
        handler,
        Criteria::default(),
        PollerConfig::new(1, 4).unwrap(),
    );
    manager.connect(None).await.unwrap();

    assert!(mock.inject_report(DeviceId(7), 0, &[0; 16]));
    assert!(mock.inject_report(DeviceId(7), 0, &[0; 2]));
    wait_until(|| lens.lock().len() == 2).await;
    assert_eq!(*lens.lock(), vec![4, 2]);
}

#[tokio::test]
async fn test_send_report_on_current_connection() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());

    let err = manager.send_report(0, &[1]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    manager.connect(None).await.unwrap();
    let handle = manager.current().unwrap().handle();
    manager.send_report(5, &[1, 2]).await.unwrap();
    assert_eq!(mock.calls().send, vec![(handle, 5, vec![1, 2])]);
}

#[tokio::test]
async fn test_hotplug_drives_connection() {
    let mock = Arc::new(MockHidService::new());
    let (manager, count) = counting_manager(&mock, PollerConfig::default());
    let mut events = manager.subscribe();
    let _listener = HotplugListener::spawn(manager.clone());

    mock.plug(dev(7));
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Connected {
            device: dev(7),
            epoch: 1
        }
    );

    assert!(mock.inject_report(DeviceId(7), 1, &[9]));
    wait_until(|| count.load(Ordering::SeqCst) == 1).await;

    mock.unplug(DeviceId(7));
    match next_event(&mut events).await {
        SessionEvent::PollerStopped { epoch: 1, .. } => {
            assert!(matches!(
                next_event(&mut events).await,
                SessionEvent::Disconnected {
                    reason: DisconnectReason::ReceiveFailed,
                    ..
                }
            ));
        }
        SessionEvent::Disconnected {
            device_id, reason, ..
        } => {
            assert_eq!(device_id, DeviceId(7));
            assert_eq!(reason, DisconnectReason::Requested);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    wait_until(|| manager.active_pollers() == 0).await;

    // Replugged device gets a fresh id and connects again
    mock.plug(dev(9));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { epoch: 2, .. }
    ));
    assert_eq!(manager.current_device_id(), Some(DeviceId(9)));
}

#[tokio::test]
async fn test_set_criteria_applies_on_next_connect() {
    let mock = Arc::new(MockHidService::with_devices([
        dev(7),
        DeviceDescriptor::new(DeviceId(3), 0x04D8, 0x003F),
    ]));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());

    manager.connect(None).await.unwrap();
    manager.set_criteria(Criteria::new(0x04D8, 0x003F)).await;
    assert_eq!(manager.criteria(), Criteria::new(0x04D8, 0x003F));

    // Existing connection is untouched until the next connect
    assert_eq!(manager.current_device_id(), Some(DeviceId(7)));
    manager.connect(None).await.unwrap();
    assert_eq!(manager.current_device_id(), Some(DeviceId(3)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_leave_one_connection() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    mock.set_enumerate_delay(Duration::from_millis(20));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());

    let (a, b) = tokio::join!(manager.connect(None), manager.connect(None));
    assert_eq!(a.unwrap().device_id, DeviceId(7));
    assert_eq!(b.unwrap().device_id, DeviceId(7));

    let current = manager.current().unwrap();
    assert_eq!(current.epoch(), 2);
    assert_eq!(mock.open_handles(), vec![current.handle()]);
    assert_eq!(mock.calls().connect.len(), 2);
    assert_eq!(mock.calls().disconnect.len(), 1);
    wait_until(|| manager.active_pollers() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_set_criteria_waits_for_connect_in_progress() {
    let mock = Arc::new(MockHidService::with_devices([
        dev(7),
        DeviceDescriptor::new(DeviceId(3), 0x04D8, 0x003F),
    ]));
    mock.set_enumerate_delay(Duration::from_millis(50));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(None).await })
    };
    wait_until(|| mock.calls().enumerate == 1).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let setting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.set_criteria(Criteria::new(0x04D8, 0x003F)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!setting.is_finished());
    assert_eq!(manager.criteria(), Criteria::default());

    // The attempt finishes with the criteria it started with
    let device = connecting.await.unwrap().unwrap();
    assert_eq!(device.device_id, DeviceId(7));
    setting.await.unwrap();
    assert_eq!(manager.criteria(), Criteria::new(0x04D8, 0x003F));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_resets_state() {
    let mock = Arc::new(MockHidService::with_devices([dev(7)]));
    mock.set_enumerate_delay(Duration::from_millis(50));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());

    let attempt = tokio::time::timeout(Duration::from_millis(10), manager.connect(None)).await;
    assert!(attempt.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current().is_none());
    assert!(mock.open_handles().is_empty());

    // An aborted task behaves the same
    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(None).await })
    };
    wait_until(|| mock.calls().enumerate == 2).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // The lock was released; a fresh attempt goes through
    manager.connect(None).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_removal_during_slow_hotplug_connect() {
    let mock = Arc::new(MockHidService::new());
    mock.set_enumerate_delay(Duration::from_millis(50));
    let (manager, _) = counting_manager(&mock, PollerConfig::default());
    let _listener = HotplugListener::spawn(manager.clone());

    mock.plug(dev(7));
    wait_until(|| mock.calls().enumerate == 1).await;
    // Removal is queued behind the in-flight connect
    mock.unplug(DeviceId(7));

    wait_until(|| manager.state() == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(mock.open_handles().is_empty());
    assert_eq!(manager.active_pollers(), 0);
}
