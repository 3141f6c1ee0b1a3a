//! Health reporting for the resilience layer.
//!
//! A [`HealthReport`] rolls per-component status up into one overall status:
//! the worst component wins.
//!
//! | Component | Degraded when | Unhealthy when |
//! |-----------|---------------|----------------|
//! | queue | utilization at or above the health threshold | never |
//! | circuit | HalfOpen | Open |
//!
//! # Example
//!
//! ```rust
//! use floodgate::health::{ComponentHealth, HealthReport, HealthStatus};
//!
//! let report = HealthReport::from_components([
//!     ("queue".to_string(), ComponentHealth::healthy()),
//!     ("circuit:billing".to_string(), ComponentHealth::degraded("probing")),
//! ]);
//! assert_eq!(report.status, HealthStatus::Degraded);
//! ```

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every component is healthy.
    Healthy,
    /// Some component is under pressure but requests are still served.
    Degraded,
    /// A dependency is cut off.
    Unhealthy,
}

impl HealthStatus {
    /// Check if the status is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if the status is degraded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if the status is unhealthy.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the status as an HTTP status code.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::Healthy | Self::Degraded => 200,
            Self::Unhealthy => 503,
        }
    }

    /// Get the status as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of a single component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    /// Component status.
    pub status: HealthStatus,
    /// Why the component is not healthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Extra key/value details.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl ComponentHealth {
    /// Create a healthy component status.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            details: BTreeMap::new(),
        }
    }

    /// Create a degraded component status.
    #[must_use]
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            details: BTreeMap::new(),
        }
    }

    /// Create an unhealthy component status.
    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            details: BTreeMap::new(),
        }
    }

    /// Add a detail to the health status.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// Health of the whole resilience layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Worst status among the components.
    pub status: HealthStatus,
    /// Per-component health, keyed by component name.
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    /// Build a report, deriving the overall status from the components.
    pub fn from_components(components: impl IntoIterator<Item = (String, ComponentHealth)>) -> Self {
        let components: BTreeMap<_, _> = components.into_iter().collect();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { status, components }
    }

    /// Names of components with the given status.
    #[must_use]
    pub fn components_with(&self, status: HealthStatus) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| c.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
