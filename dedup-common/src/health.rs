use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// Liveness of the consumer loop.
///
/// The loop reports on every delivery and on every idle tick. If it stops reporting for longer
/// than its deadline (stuck on a call that never returns, or gone altogether) the liveness
/// check fails and the orchestrator restarts the process.
#[derive(Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub component: String,
    pub status: ComponentStatus,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise, with the component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy
    Unhealthy,
    /// The HealthyUntil deadline passed without a new report
    Stalled,
}

/// Handed to the consumer so it can report in.
#[derive(Clone)]
pub struct HealthHandle {
    deadline: Duration,
    status: Arc<RwLock<ComponentStatus>>,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.status.write() {
            Ok(mut current) => *current = status,
            // Poisoned lock: the liveness check keeps failing and the process gets restarted
            Err(_) => warn!("poisoned liveness lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    component: String,
    status: Arc<RwLock<ComponentStatus>>,
}

impl HealthRegistry {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            status: Arc::new(RwLock::new(ComponentStatus::Starting)),
        }
    }

    /// Hand out the reporting side, with reports valid for `deadline`.
    pub fn handle(&self, deadline: std::time::Duration) -> HealthHandle {
        HealthHandle {
            deadline: Duration::from_std(deadline).unwrap_or_else(|_| Duration::days(365)),
            status: self.status.clone(),
        }
    }

    pub fn get_status(&self) -> HealthStatus {
        let status = match self.status.read() {
            Ok(status) => match *status {
                ComponentStatus::HealthyUntil(until) if until <= Utc::now() => {
                    ComponentStatus::Stalled
                }
                ref other => other.clone(),
            },
            Err(_) => ComponentStatus::Unhealthy,
        };

        HealthStatus {
            healthy: matches!(status, ComponentStatus::HealthyUntil(_)),
            component: self.component.clone(),
            status,
        }
    }
}
