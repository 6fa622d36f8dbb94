use chrono::{DateTime, Utc};
use shared::domain::ServiceStatus;
use tracing::{debug, warn};

use crate::transport::StatusProbe;

/// One liveness check. A probe that cannot be completed reports the service offline.
pub async fn check_status(probe: &dyn StatusProbe, now: DateTime<Utc>) -> ServiceStatus {
    match probe.probe().await {
        Ok(state) => {
            debug!(?state, "status: probe answered");
            ServiceStatus::checked(state, now)
        }
        Err(err) => {
            warn!("status: probe failed: {err}");
            ServiceStatus::unreachable(err.to_string(), now)
        }
    }
}
