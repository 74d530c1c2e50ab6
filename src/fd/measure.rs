use anyhow::{bail, Result};

use crate::sampling::Trajectory;

use super::space::{Geometry, Space};

/// How one trajectory turns into a pair of accumulated measurements.
///
/// The two accumulated scalars mean different things per variant:
/// cross-section buckets hold `(count, sum of speeds)` (or sum of inverted
/// speeds for the harmonic mean), path buckets hold `(distance, time)`.
#[derive(Debug, Clone)]
pub enum MeasurementStrategy {
    /// Count vehicles crossing a fixed position per series.
    CrossSection {
        /// Measurement position per series, in m.
        positions: Vec<f64>,
        /// Accumulate `1/v` instead of `v` for the harmonic mean.
        harmonic: bool,
    },
    /// Accumulate distance and time traveled over the whole path.
    Path {
        /// Length of the path, in m.
        total_length: f64,
    },
}

impl MeasurementStrategy {
    /// Builds the strategy matching the space's geometry.
    pub fn for_space(space: &Space, harmonic: bool) -> Result<Self> {
        match space.geometry() {
            Geometry::CrossSection { positions } => Ok(Self::CrossSection {
                positions: positions.clone(),
                harmonic,
            }),
            Geometry::Path { total_length } => {
                if harmonic {
                    bail!("harmonic mean only applies to cross-section aggregation");
                }
                Ok(Self::Path {
                    total_length: *total_length,
                })
            }
        }
    }

    /// Measures one trajectory against the half-open window `[start, end)`.
    ///
    /// Pure: no bookkeeping is touched. Returns `(0, 0)` when the trajectory
    /// does not contribute to the window.
    pub fn measure(
        &self,
        series: usize,
        trajectory: &Trajectory,
        start: f64,
        end: f64,
        lane_length: f64,
    ) -> (f64, f64) {
        match self {
            Self::CrossSection {
                positions,
                harmonic,
            } => {
                let position = positions[series];
                if !trajectory.crosses(position) {
                    return (0.0, 0.0);
                }
                let t = trajectory.time_at_position(position);
                if t < start || t >= end {
                    return (0.0, 0.0);
                }
                let v = trajectory.speed_at_position(position);
                if v <= 0.0 {
                    // A vehicle standing exactly on the section never passes.
                    return (0.0, 0.0);
                }
                (1.0, if *harmonic { 1.0 / v } else { v })
            }
            Self::Path { .. } => {
                let view = trajectory.space_time_view(0.0, lane_length, start, end);
                (view.distance, view.time)
            }
        }
    }

    /// Vehicle count represented by a bucket's accumulated measurements.
    /// Divided by the aggregation period by the caller to obtain flow.
    pub fn vehicle_count(&self, first: f64, _second: f64) -> f64 {
        match self {
            Self::CrossSection { .. } => first,
            Self::Path { total_length } => first / total_length,
        }
    }

    /// Mean speed represented by a bucket's accumulated measurements, in m/s.
    /// Callers must handle the empty bucket (`first == 0`) beforehand.
    pub fn mean_speed(&self, first: f64, second: f64) -> f64 {
        match self {
            Self::CrossSection { harmonic, .. } => {
                if *harmonic {
                    first / second
                } else {
                    second / first
                }
            }
            Self::Path { .. } => first / second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::space::{LaneRef, SeriesDef};
    use crate::sampling::LaneId;

    fn cross_strategy(harmonic: bool) -> MeasurementStrategy {
        MeasurementStrategy::CrossSection {
            positions: vec![500.0],
            harmonic,
        }
    }

    fn crossing_at(t_cross: f64, speed: f64) -> Trajectory {
        // Straight run through 500 m at constant speed, crossing at t_cross.
        let mut traj = Trajectory::new(1);
        let t0 = 0.0;
        let x0 = 500.0 - speed * t_cross;
        let t1 = t_cross + 500.0 / speed;
        traj.append(t0, x0, speed);
        traj.append(t1, 1000.0, speed);
        traj
    }

    #[test]
    fn test_cross_section_counts_crossing_inside_window() {
        let strategy = cross_strategy(false);
        let traj = crossing_at(10.0, 20.0);
        let (first, second) = strategy.measure(0, &traj, 0.0, 60.0, 1000.0);
        assert!((first - 1.0).abs() < 1e-12);
        assert!((second - 20.0).abs() < 1e-6, "second={second}");
    }

    #[test]
    fn test_cross_section_harmonic_inverts_speed() {
        let strategy = cross_strategy(true);
        let traj = crossing_at(10.0, 20.0);
        let (first, second) = strategy.measure(0, &traj, 0.0, 60.0, 1000.0);
        assert!((first - 1.0).abs() < 1e-12);
        assert!((second - 0.05).abs() < 1e-6, "second={second}");
    }

    #[test]
    fn test_cross_section_outside_window() {
        let strategy = cross_strategy(false);
        let traj = crossing_at(70.0, 20.0);
        assert_eq!(strategy.measure(0, &traj, 0.0, 60.0, 1000.0), (0.0, 0.0));
        // Window end is open: a crossing exactly at `end` belongs to the next
        // window. Sampled exactly at the section so the crossing time is exact.
        let mut at_boundary = Trajectory::new(2);
        at_boundary.append(60.0, 500.0, 20.0);
        at_boundary.append(85.0, 1000.0, 20.0);
        assert_eq!(
            strategy.measure(0, &at_boundary, 0.0, 60.0, 1000.0),
            (0.0, 0.0),
        );
        assert_eq!(
            strategy
                .measure(0, &at_boundary, 60.0, 120.0, 1000.0)
                .0
                .round(),
            1.0,
        );
    }

    #[test]
    fn test_cross_section_never_reaches_position() {
        let strategy = cross_strategy(false);
        let mut traj = Trajectory::new(1);
        traj.append(0.0, 0.0, 10.0);
        traj.append(10.0, 100.0, 10.0);
        assert_eq!(strategy.measure(0, &traj, 0.0, 60.0, 1000.0), (0.0, 0.0));
    }

    #[test]
    fn test_path_measures_distance_and_time() {
        let strategy = MeasurementStrategy::Path {
            total_length: 1000.0,
        };
        let mut traj = Trajectory::new(1);
        traj.append(0.0, 0.0, 20.0);
        traj.append(50.0, 1000.0, 20.0);
        let (first, second) = strategy.measure(0, &traj, 0.0, 100.0, 1000.0);
        assert!((first - 1000.0).abs() < 1e-6);
        assert!((second - 50.0).abs() < 1e-6);
        assert!((strategy.vehicle_count(first, second) - 1.0).abs() < 1e-9);
        assert!((strategy.mean_speed(first, second) - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_speed_variants() {
        let arithmetic = cross_strategy(false);
        // Two crossings at 20 and 10 m/s.
        assert!((arithmetic.mean_speed(2.0, 30.0) - 15.0).abs() < 1e-12);

        let harmonic = cross_strategy(true);
        let second = 1.0 / 20.0 + 1.0 / 10.0;
        let expected = 2.0 / second;
        assert!((harmonic.mean_speed(2.0, second) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_for_space_matches_geometry() {
        let space = Space::cross_section(
            vec![SeriesDef::single(
                "Lane 1",
                LaneRef {
                    id: LaneId(0),
                    length: 1000.0,
                },
            )],
            vec![500.0],
        )
        .expect("space");
        match MeasurementStrategy::for_space(&space, true).expect("strategy") {
            MeasurementStrategy::CrossSection {
                positions,
                harmonic,
            } => {
                assert_eq!(positions, vec![500.0]);
                assert!(harmonic);
            }
            other => panic!("unexpected strategy {other:?}"),
        }

        let path = Space::path(vec![SeriesDef::single(
            "Lane 1",
            LaneRef {
                id: LaneId(0),
                length: 1000.0,
            },
        )])
        .expect("space");
        assert!(MeasurementStrategy::for_space(&path, true).is_err());
        assert!(MeasurementStrategy::for_space(&path, false).is_ok());
    }
}
