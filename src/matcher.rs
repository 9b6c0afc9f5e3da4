//! Device selection
//!
//! Every connect attempt enumerates afresh; descriptors are never cached
//! between attempts.

use hidlink_transport::{Criteria, DeviceDescriptor, DeviceId, HidService};
use tracing::{debug, info};

use crate::error::MatchError;

/// Queries the transport and picks one device
pub struct DeviceMatcher<'a> {
    service: &'a dyn HidService,
}

impl<'a> DeviceMatcher<'a> {
    pub fn new(service: &'a dyn HidService) -> Self {
        Self { service }
    }

    /// Enumerate devices matching `criteria` and select one
    ///
    /// # Arguments
    /// * `criteria` - Vendor/product pair to match
    /// * `preferred` - Device to pick when several match
    pub async fn find(
        &self,
        criteria: &Criteria,
        preferred: Option<DeviceId>,
    ) -> Result<DeviceDescriptor, MatchError> {
        let mut candidates = self
            .service
            .enumerate(criteria)
            .await
            .map_err(MatchError::Enumerate)?;

        // The transport filters already; this keeps the policy independent of it
        candidates.retain(|d| criteria.matches(d));

        info!(
            "Found {} HID devices matching criteria {}",
            candidates.len(),
            criteria
        );
        for d in &candidates {
            debug!("  candidate: {}", d);
        }

        select(candidates, criteria, preferred)
    }
}

/// Selection policy over one enumeration result
///
/// - nothing matched: `NoDeviceFound`
/// - a preferred id was given: that device, or `TargetNotFound`
/// - more than one matched: `AmbiguousMatch` (no guessing)
/// - otherwise the single match
pub fn select(
    candidates: Vec<DeviceDescriptor>,
    criteria: &Criteria,
    preferred: Option<DeviceId>,
) -> Result<DeviceDescriptor, MatchError> {
    if candidates.is_empty() {
        return Err(MatchError::NoDeviceFound {
            vendor_id: criteria.vendor_id,
            product_id: criteria.product_id,
        });
    }

    if let Some(id) = preferred {
        return candidates
            .into_iter()
            .find(|d| d.device_id == id)
            .ok_or(MatchError::TargetNotFound(id));
    }

    let count = candidates.len();
    let mut candidates = candidates.into_iter();
    match (candidates.next(), count) {
        (Some(only), 1) => Ok(only),
        _ => Err(MatchError::AmbiguousMatch { count }),
    }
}
