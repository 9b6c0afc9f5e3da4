//! Open hidapi device session
//!
//! `HidDevice` calls block, so reads and writes run on tokio's blocking
//! pool. Reads use a short timeout and re-check the release flag between
//! attempts; releasing a session therefore ends a pending read within one
//! timeout window.

use std::sync::atomic::{AtomicBool, Ordering};

use hidapi::HidDevice;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::TransportError;
use crate::types::{DeviceId, InputReport};

/// A device opened through hidapi and owned by one connection handle
pub(crate) struct OpenDevice {
    device: Mutex<HidDevice>,
    device_id: DeviceId,
    /// Set once the handle is released; pending reads bail out
    released: AtomicBool,
}

impl OpenDevice {
    pub(crate) fn new(device: HidDevice, device_id: DeviceId) -> Self {
        Self {
            device: Mutex::new(device),
            device_id,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Block until one input report arrives or the session is released
    ///
    /// # Arguments
    /// * `max_len` - Payload bytes to keep
    /// * `timeout_ms` - Timeout for each underlying read attempt
    /// * `numbered` - Whether the first byte is a report ID
    pub(crate) fn read_report(
        &self,
        max_len: usize,
        timeout_ms: i32,
        numbered: bool,
    ) -> Result<InputReport, TransportError> {
        // One spare byte for the report ID on numbered devices
        let mut buf = vec![0u8; max_len + usize::from(numbered)];

        loop {
            if self.is_released() {
                return Err(TransportError::Disconnected);
            }

            let len = {
                let device = self.device.lock();
                device.read_timeout(&mut buf, timeout_ms)?
            };

            if len == 0 {
                // Timeout, no data - loop to check the release flag
                continue;
            }

            if self.is_released() {
                debug!(
                    "Dropping {} byte read on released device {}",
                    len, self.device_id
                );
                return Err(TransportError::Disconnected);
            }

            let mut report = InputReport::from_raw(&buf[..len], numbered);
            report.truncate(max_len);
            return Ok(report);
        }
    }

    /// Write an output report (report ID prefixed as hidapi expects)
    pub(crate) fn write_report(&self, report_id: u8, data: &[u8]) -> Result<(), TransportError> {
        if self.is_released() {
            return Err(TransportError::Disconnected);
        }
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(report_id);
        buf.extend_from_slice(data);

        let device = self.device.lock();
        let written = device.write(&buf)?;
        debug!(
            "Wrote {} bytes to device {}: {:02X?}",
            written,
            self.device_id,
            &buf[..buf.len().min(16)]
        );
        Ok(())
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        debug!("Device {} session closed", self.device_id);
    }
}
