//! The fundamental-diagram aggregation engine.
//!
//! [`engine::FdEngine`] owns time-bucketed accumulators per series, fed by
//! trajectory data from a [`crate::sampling::TrajectoryStore`]. Geometry
//! ([`space::Space`]) decides what a series is; the measurement strategy
//! ([`measure::MeasurementStrategy`]) decides what gets accumulated.

pub mod engine;
pub mod ledger;
pub mod measure;
pub mod space;
pub mod state;

pub use engine::FdEngine;
pub use measure::MeasurementStrategy;
pub use space::{Geometry, LaneRef, SeriesDef, Space};
