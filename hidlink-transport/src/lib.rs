//! Transport layer for hidlink
//!
//! This crate exposes the platform HID service that the connection manager
//! consumes as an opaque collaborator:
//!
//! - enumeration of devices matching a vendor/product pair
//! - opening and releasing device sessions
//! - receiving input reports and sending output reports
//! - hot-plug add/remove notifications
//!
//! `HidApiService` implements it on top of hidapi. With the `mock` feature,
//! `MockHidService` provides an in-memory implementation for tests.

pub mod device_registry;
pub mod error;
pub mod types;

mod discovery;
mod hid_device;
mod monitor;

#[cfg(feature = "mock")]
pub mod mock;

pub use device_registry::DeviceRegistry;
pub use discovery::HidApiService;
pub use error::TransportError;
pub use types::{
    Collection, ConnectionHandle, Criteria, DeviceDescriptor, DeviceId, HotplugEvent,
    InputReport, ServiceConfig, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID,
};

#[cfg(feature = "mock")]
pub use mock::MockHidService;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The platform HID service - all backends implement this
///
/// Every operation is a suspension point for the caller. Implementations
/// must tolerate a handle being released while a `receive` on it is still
/// pending; the pending call then completes with
/// [`TransportError::Disconnected`].
#[async_trait]
pub trait HidService: Send + Sync {
    /// List attached devices matching `criteria`
    async fn enumerate(&self, criteria: &Criteria)
        -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open a session with a previously enumerated device
    async fn connect(&self, device_id: DeviceId) -> Result<ConnectionHandle, TransportError>;

    /// Wait for the next input report
    ///
    /// # Arguments
    /// * `handle` - Session to read from
    /// * `max_len` - Report payload is truncated to this many bytes
    async fn receive(
        &self,
        handle: ConnectionHandle,
        max_len: usize,
    ) -> Result<InputReport, TransportError>;

    /// Send an output report
    async fn send(
        &self,
        handle: ConnectionHandle,
        report_id: u8,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Release a session
    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    /// Subscribe to hot-plug events
    fn watch(&self) -> broadcast::Receiver<HotplugEvent>;
}

/// Type alias for a shared service
pub type BoxedHidService = Arc<dyn HidService>;
