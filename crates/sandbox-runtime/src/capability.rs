//! Typed capability traits for long-lived sandbox services.

use async_trait::async_trait;
use serde::Serialize;

/// Health of one component, as reported to the CLI `probe` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub healthy: bool,
    pub detail: String,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            healthy: true,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// Components that can report their own health.
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    async fn health_check(&self) -> ComponentHealth;
}

/// Components that hold host resources and must release them on shutdown.
#[async_trait]
pub trait Closeable: Send + Sync {
    async fn close(&self);
}
