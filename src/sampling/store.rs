use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use super::trajectory::Trajectory;

/// Identifier of a monitored lane (direction included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId(pub u32);

impl std::fmt::Display for LaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lane-{}", self.0)
    }
}

/// A space-time extent over which trajectory capture was requested.
#[derive(Debug, Clone, Copy)]
pub struct SpaceTimeRegion {
    pub lane: LaneId,
    pub from_position: f64,
    pub to_position: f64,
    pub from_time: f64,
    pub to_time: f64,
}

/// Errors when recording samples into the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No capture region was registered for the lane.
    #[error("no region registered for {0}")]
    UnknownLane(LaneId),

    /// The trajectory index does not exist on the lane.
    #[error("unknown trajectory {index} on {lane}")]
    UnknownTrajectory { lane: LaneId, index: usize },
}

/// Ordered trajectories of one lane, in order of arrival.
#[derive(Debug, Default)]
pub struct TrajectoryGroup {
    trajectories: Vec<Trajectory>,
}

impl TrajectoryGroup {
    /// Number of trajectories recorded so far.
    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    /// Trajectory at arrival index `index`.
    pub fn get(&self, index: usize) -> Option<&Trajectory> {
        self.trajectories.get(index)
    }

    /// Iterates trajectories in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        self.trajectories.iter()
    }
}

/// Per-lane trajectory storage, written by the traffic producer and read by
/// the aggregation engine.
///
/// Each lane's group sits behind its own map shard, so producer appends and
/// engine reads only contend per lane. Trajectories are append-only; the
/// engine never requires stability of an in-flight trajectory, only of
/// settled ones.
#[derive(Debug, Default)]
pub struct TrajectoryStore {
    groups: DashMap<LaneId, TrajectoryGroup>,
    regions: Mutex<Vec<SpaceTimeRegion>>,
}

impl TrajectoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests trajectory capture for a lane over a space-time extent.
    /// Called once per lane when an aggregation engine is constructed.
    pub fn register_region(&self, region: SpaceTimeRegion) {
        debug!(
            lane = %region.lane,
            from_position = region.from_position,
            to_position = region.to_position,
            "capture region registered",
        );
        self.groups.entry(region.lane).or_default();
        self.regions.lock().push(region);
    }

    /// Registered capture regions, in registration order.
    pub fn regions(&self) -> Vec<SpaceTimeRegion> {
        self.regions.lock().clone()
    }

    /// Starts a new trajectory on `lane`, returning its arrival index.
    pub fn begin_trajectory(&self, lane: LaneId, vehicle: u64) -> Result<usize, StoreError> {
        let mut group = self.groups.get_mut(&lane).ok_or(StoreError::UnknownLane(lane))?;
        group.trajectories.push(Trajectory::new(vehicle));
        Ok(group.trajectories.len() - 1)
    }

    /// Appends a sample to the trajectory at `index` on `lane`.
    pub fn append_sample(
        &self,
        lane: LaneId,
        index: usize,
        time: f64,
        position: f64,
        speed: f64,
    ) -> Result<(), StoreError> {
        let mut group = self.groups.get_mut(&lane).ok_or(StoreError::UnknownLane(lane))?;
        let trajectory = group
            .trajectories
            .get_mut(index)
            .ok_or(StoreError::UnknownTrajectory { lane, index })?;
        trajectory.append(time, position, speed);
        Ok(())
    }

    /// Read access to a lane's trajectory group. Holds the lane's shard read
    /// lock for the guard's lifetime; keep it short.
    pub fn group(&self, lane: LaneId) -> Option<Ref<'_, LaneId, TrajectoryGroup>> {
        self.groups.get(&lane)
    }

    /// Number of trajectories recorded on `lane`.
    pub fn trajectory_count(&self, lane: LaneId) -> usize {
        self.groups.get(&lane).map_or(0, |g| g.len())
    }
}
