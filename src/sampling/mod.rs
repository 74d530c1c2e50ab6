//! Trajectory sampling: the data the aggregation engine reads.
//!
//! The store is owned by whatever produces the traffic (a microsimulation,
//! a replay, a test). The engine only ever reads trajectory groups; growth
//! is append-only and safe while readers are active.

pub mod store;
pub mod trajectory;

pub use store::{LaneId, SpaceTimeRegion, TrajectoryStore};
pub use trajectory::{SpaceTimeView, Trajectory, TrajectoryError};
