//! Lifecycle interface shared by long-lived engine services.
//!
//! Every registry that owns process-wide state (event bus, state store,
//! connection manager, image queue) implements [`Service`] so the engine can
//! initialise, health-check and shut them down uniformly.

use async_trait::async_trait;

/// Health of a single service as reported by [`Service::health_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Service is operational.
    Healthy {
        /// Human-readable diagnostics.
        details: String,
    },
    /// Service works but with reduced guarantees (e.g. broker unavailable).
    Degraded {
        /// Human-readable diagnostics.
        details: String,
    },
    /// Service cannot do its job.
    Unavailable {
        /// Human-readable diagnostics.
        details: String,
    },
}

impl HealthStatus {
    /// Returns `true` when the service is in a healthy state.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    /// Short label used in status output and health reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy { .. } => "healthy",
            Self::Degraded { .. } => "degraded",
            Self::Unavailable { .. } => "unavailable",
        }
    }

    /// Diagnostics text regardless of state.
    pub fn details(&self) -> &str {
        match self {
            Self::Healthy { details }
            | Self::Degraded { details }
            | Self::Unavailable { details } => details,
        }
    }
}

/// Explicit lifecycle for engine services.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable service name for logs.
    fn name(&self) -> &'static str;

    /// Prepare the service before traffic flows. Defaults to a no-op.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources held by the service. Must be idempotent.
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Report current health.
    async fn health_check(&self) -> HealthStatus;
}
