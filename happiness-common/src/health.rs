//! Liveness of the pipeline's long-running loops, served on `/_liveness`.
//!
//! Every loop registers as a component with a deadline and must report again
//! before that deadline passes. The process is live once every component has
//! reported, as long as none went unhealthy or missed its deadline.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, never reported
    Starting,
    HealthyUntil(OffsetDateTime),
    /// Gave up, for instance a consumer whose subscription kept failing
    Unhealthy,
    /// Missed its deadline
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, format!("{:?}", self.components)).into_response()
    }
}

/// Reports for one component. Reporting never blocks on the runtime, so the
/// handle can be used from rdkafka callbacks as well as from async loops.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Healthy until `now + deadline`.
    pub fn report_healthy(&self) {
        self.set(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ));
    }

    pub fn report_unhealthy(&self) {
        warn!(component = %self.component, "component reported unhealthy");
        self.set(ComponentStatus::Unhealthy);
    }

    fn set(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            // The probe reads the same lock and fails, so the process restarts
            Err(_) => warn!(component = %self.component, "poisoned liveness lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Components::default(),
        }
    }

    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.set(ComponentStatus::Starting);
        handle
    }

    /// Overall status. Unhealthy until at least one component registered.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let components: HashMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if *until <= now => {
                        ComponentStatus::Stalled
                    }
                    status => status.clone(),
                };
                (name.clone(), status)
            })
            .collect();
        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));

        if healthy {
            info!("{} check ok", self.name);
        } else {
            warn!("{} check failed: {:?}", self.name, components);
        }
        HealthStatus {
            healthy,
            components,
        }
    }
}
