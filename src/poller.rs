//! Input report poller
//!
//! One poller task per connection. It stops for good as soon as the
//! manager's current connection is no longer the one it was started for,
//! which it checks by epoch both before issuing a receive and after the
//! receive completes. A completion that arrives after a disconnect or a
//! reconnect is dropped without reaching the report handler.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hidlink_transport::{BoxedHidService, InputReport};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PollerConfig;
use crate::manager::{Connection, Shared};

/// Decodes raw input reports into application events
///
/// The returned event is only logged; the manager does not interpret it.
pub trait ReportHandler: Send + Sync + 'static {
    type Event: fmt::Debug + Send;

    fn on_report(&self, report: &InputReport) -> Option<Self::Event>;
}

/// Closure adapter, see [`handler_fn`]
pub struct FnHandler<F, E> {
    f: F,
    _event: PhantomData<fn() -> E>,
}

/// Use a closure as a [`ReportHandler`]
pub fn handler_fn<F, E>(f: F) -> FnHandler<F, E>
where
    F: Fn(&InputReport) -> Option<E> + Send + Sync + 'static,
    E: fmt::Debug + Send + 'static,
{
    FnHandler {
        f,
        _event: PhantomData,
    }
}

impl<F, E> ReportHandler for FnHandler<F, E>
where
    F: Fn(&InputReport) -> Option<E> + Send + Sync + 'static,
    E: fmt::Debug + Send + 'static,
{
    type Event = E;

    fn on_report(&self, report: &InputReport) -> Option<E> {
        (self.f)(report)
    }
}

/// Why a poller stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// The connection was cleared or replaced
    Superseded,
    /// A receive failed; the manager was told
    ReceiveFailed,
    /// Every manager handle was dropped
    ManagerGone,
}

/// Keeps the manager's live-poller count accurate however the task ends
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Poller<H: ReportHandler> {
    shared: Weak<Shared<H>>,
    service: BoxedHidService,
    connection: Arc<Connection>,
    config: PollerConfig,
}

impl<H: ReportHandler> Poller<H> {
    pub(crate) fn new(
        shared: Weak<Shared<H>>,
        service: BoxedHidService,
        connection: Arc<Connection>,
        config: PollerConfig,
    ) -> Self {
        Self {
            shared,
            service,
            connection,
            config,
        }
    }

    /// Start polling on the current runtime
    pub(crate) fn spawn(self, active: Arc<AtomicUsize>) -> JoinHandle<PollerExit> {
        let guard = ActiveGuard::new(active);
        tokio::spawn(async move {
            let _guard = guard;
            self.run().await
        })
    }

    async fn run(self) -> PollerExit {
        let epoch = self.connection.epoch();
        let handle = self.connection.handle();
        let interval = Duration::from_millis(self.config.interval_ms);
        debug!(
            "Poller for connection {} started (epoch {}, every {:?})",
            handle, epoch, interval
        );

        let exit = loop {
            match self.shared.upgrade() {
                None => break PollerExit::ManagerGone,
                Some(shared) if !shared.is_current(epoch) => break PollerExit::Superseded,
                Some(_) => {}
            }

            let received = self
                .service
                .receive(handle, self.config.report_buffer_size)
                .await;

            // A disconnect or reconnect may have landed while the receive was pending
            let Some(shared) = self.shared.upgrade() else {
                break PollerExit::ManagerGone;
            };
            if !shared.is_current(epoch) {
                debug!(
                    "Discarding receive completion for stale epoch {} on {}",
                    epoch, handle
                );
                break PollerExit::Superseded;
            }

            match received {
                Ok(report) => {
                    debug!(
                        "Report {:02X} ({} bytes) on {}: {:02X?}",
                        report.report_id,
                        report.data.len(),
                        handle,
                        &report.data[..report.data.len().min(16)]
                    );
                    if let Some(event) = shared.handler.on_report(&report) {
                        debug!("Event received from handler: {:?}", event);
                    }
                }
                Err(error) => {
                    warn!("Receive on {} failed: {}", handle, error);
                    shared.poller_failed(epoch, error);
                    break PollerExit::ReceiveFailed;
                }
            }

            // Don't keep the manager alive across the delay
            drop(shared);
            tokio::time::sleep(interval).await;
        };

        debug!(
            "Poller for connection {} stopped: {:?} (epoch {})",
            handle, exit, epoch
        );
        exit
    }
}
