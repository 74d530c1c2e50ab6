use thiserror::Error;

/// Errors in recorded trajectory data.
///
/// These mark a single trajectory as unusable for aggregation; they are
/// logged and the trajectory is skipped, never propagated out of an update.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrajectoryError {
    /// The trajectory holds no samples yet.
    #[error("trajectory has no samples")]
    Empty,

    /// A sample was recorded out of order.
    #[error("samples are not monotone at index {index}")]
    Unordered {
        /// Index of the first offending sample.
        index: usize,
    },
}

/// Distance and time traveled inside a space-time rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceTimeView {
    /// Distance traveled inside the rectangle, in m.
    pub distance: f64,
    /// Time traveled inside the rectangle, in s.
    pub time: f64,
}

impl SpaceTimeView {
    const ZERO: SpaceTimeView = SpaceTimeView {
        distance: 0.0,
        time: 0.0,
    };

    /// Mean speed over the view, in m/s.
    pub fn mean_speed(&self) -> f64 {
        self.distance / self.time
    }
}

/// Interpolation boundary: a sample index plus a fraction towards the next.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Boundary {
    index: usize,
    fraction: f64,
}

impl Boundary {
    fn min(self, other: Boundary) -> Boundary {
        if (other.index, other.fraction) < (self.index, self.fraction) {
            other
        } else {
            self
        }
    }

    fn max(self, other: Boundary) -> Boundary {
        if (other.index, other.fraction) > (self.index, self.fraction) {
            other
        } else {
            self
        }
    }

    fn precedes(&self, other: &Boundary) -> bool {
        (self.index, self.fraction) < (other.index, other.fraction)
    }

    /// Interpolated value of `values` at this boundary.
    fn value(&self, values: &[f32]) -> f64 {
        if self.fraction > 0.0 {
            let a = f64::from(values[self.index]);
            let b = f64::from(values[self.index + 1]);
            a * (1.0 - self.fraction) + b * self.fraction
        } else {
            f64::from(values[self.index])
        }
    }
}

/// Time-ordered position/speed samples of one vehicle's passage through a
/// monitored lane segment.
///
/// Samples are stored as `f32` arrays; queries interpolate in `f64`.
/// A trajectory is append-only: the producer adds samples as the vehicle
/// moves, readers interpolate over whatever has been recorded so far.
#[derive(Debug, Clone)]
pub struct Trajectory {
    vehicle: u64,
    t: Vec<f32>,
    x: Vec<f32>,
    v: Vec<f32>,
    /// Index of the first out-of-order sample, if any. Latches.
    disorder: Option<usize>,
}

impl Trajectory {
    /// Creates an empty trajectory for the given vehicle.
    pub fn new(vehicle: u64) -> Self {
        Self {
            vehicle,
            t: Vec::new(),
            x: Vec::new(),
            v: Vec::new(),
            disorder: None,
        }
    }

    /// Identifier of the sampled vehicle.
    pub fn vehicle(&self) -> u64 {
        self.vehicle
    }

    /// Number of recorded samples.
    pub fn len(&self) -> usize {
        self.t.len()
    }

    /// Whether no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Appends a sample (time s, position m, speed m/s).
    ///
    /// Out-of-order samples are kept but poison the trajectory: consistency
    /// never recovers, and aggregation will skip it.
    pub fn append(&mut self, time: f64, position: f64, speed: f64) {
        if self.disorder.is_none() {
            if let (Some(&lt), Some(&lx)) = (self.t.last(), self.x.last()) {
                if (time as f32) < lt || (position as f32) < lx {
                    self.disorder = Some(self.t.len());
                }
            }
        }
        self.t.push(time as f32);
        self.x.push(position as f32);
        self.v.push(speed as f32);
    }

    /// Checks that the trajectory is usable for measurement.
    pub fn require_consistent(&self) -> Result<(), TrajectoryError> {
        if self.is_empty() {
            return Err(TrajectoryError::Empty);
        }
        if let Some(index) = self.disorder {
            return Err(TrajectoryError::Unordered { index });
        }
        Ok(())
    }

    /// Time of the first sample, in s.
    pub fn first_time(&self) -> f64 {
        f64::from(self.t[0])
    }

    /// Time of the last sample, in s.
    pub fn last_time(&self) -> f64 {
        f64::from(self.t[self.t.len() - 1])
    }

    /// Position of the first sample, in m.
    pub fn first_position(&self) -> f64 {
        f64::from(self.x[0])
    }

    /// Position of the last sample, in m.
    pub fn last_position(&self) -> f64 {
        f64::from(self.x[self.x.len() - 1])
    }

    /// Whether the recorded time extent intersects the half-open window
    /// `[start, end)`. Cheap pre-filter before interpolating anything.
    pub fn intersects_window(&self, start: f64, end: f64) -> bool {
        !self.is_empty() && self.first_time() < end && self.last_time() >= start
    }

    /// Whether the recorded positions span `position`.
    pub fn crosses(&self, position: f64) -> bool {
        !self.is_empty() && self.first_position() <= position && position <= self.last_position()
    }

    /// Interpolated time at which the vehicle passed `position`, in s.
    pub fn time_at_position(&self, position: f64) -> f64 {
        self.boundary_at(&self.x, position, false).value(&self.t)
    }

    /// Interpolated speed at `position`, in m/s.
    pub fn speed_at_position(&self, position: f64) -> f64 {
        self.boundary_at(&self.x, position, false).value(&self.v)
    }

    /// Distance and time traveled inside the rectangle
    /// `[start_position, end_position] x [start_time, end_time)`.
    ///
    /// Computed by intersecting the spatial and temporal boundary ranges and
    /// interpolating at both ends; no samples are copied. The window end is
    /// treated as open, which for this integral quantity only excludes a
    /// measure-zero instant.
    pub fn space_time_view(
        &self,
        start_position: f64,
        end_position: f64,
        start_time: f64,
        end_time: f64,
    ) -> SpaceTimeView {
        if self.is_empty() {
            return SpaceTimeView::ZERO;
        }
        if start_position > self.last_position() || end_position < self.first_position() {
            return SpaceTimeView::ZERO;
        }
        if start_time > self.last_time() || end_time < self.first_time() {
            return SpaceTimeView::ZERO;
        }

        let from = self
            .boundary_at(&self.x, start_position, false)
            .max(self.boundary_at(&self.t, start_time, false));
        let to = self
            .boundary_at(&self.x, end_position, true)
            .min(self.boundary_at(&self.t, end_time, true));
        if to.precedes(&from) {
            return SpaceTimeView::ZERO;
        }

        SpaceTimeView {
            distance: (to.value(&self.x) - from.value(&self.x)).max(0.0),
            time: (to.value(&self.t) - from.value(&self.t)).max(0.0),
        }
    }

    /// Boundary of `values` at `value`: the last sample at or below it, plus
    /// the interpolation fraction towards the next sample. `end` marks the
    /// end of a range, where a trailing fraction is allowed at equality.
    fn boundary_at(&self, values: &[f32], value: f64, end: bool) -> Boundary {
        let n = values.len();
        let above = values.partition_point(|&a| f64::from(a) <= value);
        let index = above.saturating_sub(1);

        let interpolate = if end {
            index < n - 1
        } else {
            f64::from(values[index]) < value
        };
        let mut fraction = 0.0;
        if interpolate && index < n - 1 {
            let a = f64::from(values[index]);
            let b = f64::from(values[index + 1]);
            if b > a {
                fraction = ((value - a) / (b - a)).clamp(0.0, 1.0);
            }
        }
        Boundary { index, fraction }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_point(t0: f64, x0: f64, t1: f64, x1: f64, v: f64) -> Trajectory {
        let mut traj = Trajectory::new(1);
        traj.append(t0, x0, v);
        traj.append(t1, x1, v);
        traj
    }

    #[test]
    fn test_time_at_position_interpolates() {
        // 300 m -> 1000 m over 35 s at 20 m/s; passes 500 m at t = 10 s.
        let traj = two_point(0.0, 300.0, 35.0, 1000.0, 20.0);
        let t = traj.time_at_position(500.0);
        assert!((t - 10.0).abs() < 1e-9, "t={t}");
    }

    #[test]
    fn test_speed_at_position_interpolates() {
        let mut traj = Trajectory::new(7);
        traj.append(0.0, 0.0, 10.0);
        traj.append(10.0, 150.0, 20.0);
        let v = traj.speed_at_position(75.0);
        assert!((v - 15.0).abs() < 1e-6, "v={v}");
    }

    #[test]
    fn test_crosses_bounds() {
        let traj = two_point(0.0, 300.0, 35.0, 1000.0, 20.0);
        assert!(traj.crosses(300.0));
        assert!(traj.crosses(1000.0));
        assert!(!traj.crosses(299.0));
        assert!(!traj.crosses(1000.5));
    }

    #[test]
    fn test_intersects_window_half_open() {
        let traj = two_point(10.0, 0.0, 20.0, 100.0, 10.0);
        assert!(traj.intersects_window(0.0, 10.5));
        assert!(traj.intersects_window(20.0, 30.0));
        // First sample exactly at the open end does not intersect.
        assert!(!traj.intersects_window(0.0, 10.0));
        assert!(!traj.intersects_window(20.5, 30.0));
    }

    #[test]
    fn test_space_time_view_full_containment() {
        let traj = two_point(0.0, 0.0, 50.0, 1000.0, 20.0);
        let view = traj.space_time_view(0.0, 1000.0, 0.0, 100.0);
        assert!((view.distance - 1000.0).abs() < 1e-6);
        assert!((view.time - 50.0).abs() < 1e-6);
        assert!((view.mean_speed() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_space_time_view_time_clipped() {
        let traj = two_point(0.0, 0.0, 50.0, 1000.0, 20.0);
        // Only the first half of the run falls inside the window.
        let view = traj.space_time_view(0.0, 1000.0, 0.0, 25.0);
        assert!((view.distance - 500.0).abs() < 1e-3, "d={}", view.distance);
        assert!((view.time - 25.0).abs() < 1e-6, "t={}", view.time);
    }

    #[test]
    fn test_space_time_view_space_clipped() {
        let traj = two_point(0.0, 0.0, 50.0, 1000.0, 20.0);
        let view = traj.space_time_view(250.0, 750.0, 0.0, 100.0);
        assert!((view.distance - 500.0).abs() < 1e-3);
        assert!((view.time - 25.0).abs() < 1e-3);
    }

    #[test]
    fn test_space_time_view_disjoint() {
        let traj = two_point(0.0, 0.0, 50.0, 1000.0, 20.0);
        assert_eq!(
            traj.space_time_view(0.0, 1000.0, 60.0, 120.0),
            SpaceTimeView::ZERO,
        );
        assert_eq!(
            traj.space_time_view(2000.0, 3000.0, 0.0, 100.0),
            SpaceTimeView::ZERO,
        );
    }

    #[test]
    fn test_space_time_view_disjoint_intersection() {
        // Spatial range matches the start of the run, temporal range the end;
        // their intersection is empty.
        let traj = two_point(0.0, 0.0, 50.0, 1000.0, 20.0);
        let view = traj.space_time_view(0.0, 100.0, 45.0, 50.0);
        assert_eq!(view, SpaceTimeView::ZERO);
    }

    #[test]
    fn test_unordered_samples_latch() {
        let mut traj = Trajectory::new(3);
        traj.append(0.0, 0.0, 10.0);
        traj.append(2.0, 20.0, 10.0);
        traj.append(1.0, 30.0, 10.0); // time going backwards
        assert_eq!(
            traj.require_consistent(),
            Err(TrajectoryError::Unordered { index: 2 }),
        );
        // Later well-ordered samples do not clear the flag.
        traj.append(3.0, 40.0, 10.0);
        assert!(traj.require_consistent().is_err());
    }

    #[test]
    fn test_empty_trajectory() {
        let traj = Trajectory::new(9);
        assert_eq!(traj.require_consistent(), Err(TrajectoryError::Empty));
        assert!(!traj.crosses(0.0));
        assert!(!traj.intersects_window(0.0, 100.0));
        assert_eq!(
            traj.space_time_view(0.0, 1.0, 0.0, 1.0),
            SpaceTimeView::ZERO,
        );
    }
}
