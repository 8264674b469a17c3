//! Backend server registry, connection pooling, health probing and
//! autoscaling for the SQLGate execution plane.
//!
//! # Architecture
//!
//! - [`ServerRegistry`] holds the set of configured backends and groups.
//! - [`ConnectionPool`] provides a bounded, health-aware, FIFO-fair pool of
//!   connections per backend, with atomic resize and drain.
//! - [`PoolManager`] creates pools on first use and shares them.
//! - [`HealthProber`] pings each pooled backend at a fixed interval and
//!   drives the healthy/unhealthy transitions.
//! - [`AutoScaler`] evaluates scaling policies against live metrics and
//!   resizes pools (or adjusts load-balancing weights) with a cooldown.
//!
//! Connections are produced by a [`BackendConnector`]; the production
//! PostgreSQL connector lives behind the `postgres` feature, and
//! [`mock::MockConnector`] backs tests and local wiring.

pub mod connector;
pub mod health;
pub mod mock;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod scaler;
pub mod server;

pub use connector::{BackendConnection, BackendConnector, StatementOutcome};
pub use health::HealthProber;
pub use pool::{ConnectionPool, PoolManager, PoolStats, PooledConn};
pub use scaler::{
    AutoScaler, MetricsSource, NoMetrics, ScaleDirection, ScalingAction, ScalingEvent,
    ScalingMetric, ScalingPolicy,
};
pub use server::{BackendServer, DatabaseType, ServerGroup, ServerRegistry};
