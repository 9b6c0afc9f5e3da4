//! Single-device HID connection management
//!
//! Finds a device matching a vendor/product pair, keeps one connection to
//! it, and polls it for input reports which are handed to a caller-supplied
//! [`ReportHandler`]. Hot-plug notifications from the transport drive
//! connect and disconnect through a [`HotplugListener`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use hidlink::{handler_fn, ConnectionManager, HidApiService, HotplugListener, InputReport};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let service = Arc::new(HidApiService::new()?);
//! let manager = ConnectionManager::new(service, handler_fn(|r: &InputReport| Some(r.data.len())));
//! let _listener = HotplugListener::spawn(manager.clone());
//! manager.connect(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hotplug;
pub mod manager;
pub mod matcher;
pub mod poller;

pub use config::{HidLinkConfig, PollerConfig, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REPORT_BUFFER_SIZE};
pub use error::{ConfigError, ErrorKind, MatchError, SessionError};
pub use hotplug::{HotplugListener, HotplugListenerBuilder};
pub use manager::{
    Connection, ConnectionManager, ConnectionState, DisconnectReason, FailureCallback,
    SessionEvent, SuccessCallback,
};
pub use matcher::DeviceMatcher;
pub use poller::{handler_fn, FnHandler, PollerExit, ReportHandler};

// Re-export transport types callers need
pub use hidlink_transport::{
    BoxedHidService, ConnectionHandle, Criteria, DeviceDescriptor, DeviceId, HidApiService,
    HidService, HotplugEvent, InputReport, ServiceConfig, TransportError,
};
