//! Temperature-donor merging.

use crate::hardware::Reading;
use tracing::warn;

/// Enrich a primary reading with the donor's temperature and status.
///
/// Fields the primary already reports are kept. An error reading on either
/// side leaves the primary untouched; a failed donor read is logged and the
/// merge is skipped.
pub fn merge_donor(primary: Reading, donor: &Reading) -> Reading {
    if primary.is_error() {
        return primary;
    }
    if let Some(error) = &donor.error {
        warn!(%error, "Donor reading failed, keeping primary fields only");
        return primary;
    }

    Reading {
        temperature: primary.temperature.or(donor.temperature),
        overcurrent_active: primary.overcurrent_active.or(donor.overcurrent_active),
        status: primary.status.or(donor.status),
        ..primary
    }
}
