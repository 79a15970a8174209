//! Real-time new-listing detection and trade-decision pipeline for the
//! Korean exchanges (Upbit, Bithumb).
//!
//! WebSocket collectors feed a 1-second OHLCV bucket; a single writer
//! thread serialises all persistence; a catalog-diff monitor detects new
//! listings and drives the gate engine, whose graded decision fans out
//! through the alert router. Decisions are advisory only.

pub mod alerts;
pub mod analysis;
pub mod collectors;
pub mod config;
pub mod metrics;
pub mod models;
pub mod store;
