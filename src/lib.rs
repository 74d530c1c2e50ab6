//! Windowed traffic-statistics aggregation.
//!
//! Turns raw per-vehicle trajectory samples into macroscopic
//! flow/density/speed time series ("fundamental diagram" data), either at a
//! fixed cross-section or over an extended path. Aggregation is incremental,
//! counts every trajectory at most once per bucket, and can rebuild its full
//! history in the background when the aggregation parameters change while
//! readers keep polling.

pub mod config;
pub mod fd;
pub mod sampling;
