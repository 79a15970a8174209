//! Observability: latency tracking, gate decision logs, health snapshots.

pub mod health;
pub mod latency;
pub mod observability;

pub use health::HealthMonitor;
pub use latency::LatencyTracker;
