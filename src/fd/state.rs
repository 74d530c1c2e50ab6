use tracing::warn;

use crate::sampling::TrajectoryStore;

use super::ledger::AssignmentLedger;
use super::measure::MeasurementStrategy;
use super::space::Space;

/// Time-bucketed accumulators plus the trajectory-assignment bookkeeping.
///
/// Buckets fill strictly in increasing period order; one call to
/// [`AggregationState::advance_to`] closes exactly one bucket per series for
/// the window `[time - aggregation_period, time)`. Ledgers only grow, so
/// replaying the same history never counts a settled trajectory twice.
#[derive(Debug)]
pub struct AggregationState {
    aggregation_period: f64,
    update_interval: f64,
    /// Settle margin: a trajectory ending before `window start - delay` can
    /// no longer receive samples that matter and is marked counted.
    delay: f64,
    aggregate_lanes: bool,
    n_series: usize,
    /// Accumulated first measurement, `[series][bucket]`.
    first: Vec<Vec<f64>>,
    /// Accumulated second measurement, `[series][bucket]`.
    second: Vec<Vec<f64>>,
    /// Assignment ledger per lane, flat across series.
    ledgers: Vec<AssignmentLedger>,
    /// Newest time the state was asked to cover.
    last_target: f64,
}

impl AggregationState {
    /// Creates an empty state for `space`.
    pub fn new(
        space: &Space,
        aggregation_period: f64,
        update_interval: f64,
        delay: f64,
        aggregate_lanes: bool,
    ) -> Self {
        let n_series = if aggregate_lanes {
            1
        } else {
            space.number_of_series()
        };
        Self {
            aggregation_period,
            update_interval,
            delay,
            aggregate_lanes,
            n_series,
            first: vec![Vec::new(); n_series],
            second: vec![Vec::new(); n_series],
            ledgers: vec![AssignmentLedger::new(); space.lane_count()],
            last_target: 0.0,
        }
    }

    /// Number of output series (1 when lanes are aggregated).
    pub fn number_of_series(&self) -> usize {
        self.n_series
    }

    /// Number of filled buckets.
    pub fn periods(&self) -> usize {
        self.first[0].len()
    }

    /// Aggregation window length, in s.
    pub fn aggregation_period(&self) -> f64 {
        self.aggregation_period
    }

    /// Bucket stride, in s.
    pub fn update_interval(&self) -> f64 {
        self.update_interval
    }

    /// Newest time this state was asked to cover, across normal advances and
    /// recompute replays.
    pub fn last_target(&self) -> f64 {
        self.last_target
    }

    /// Accumulated `(first, second)` of a bucket, if filled.
    pub fn measurement(&self, series: usize, item: usize) -> Option<(f64, f64)> {
        let first = *self.first.get(series)?.get(item)?;
        let second = *self.second.get(series)?.get(item)?;
        Some((first, second))
    }

    /// Replaces the aggregation parameters. Only meaningful together with
    /// [`AggregationState::reset`]; existing buckets keep their old window.
    pub fn set_params(&mut self, aggregation_period: f64, update_interval: f64, up_to: f64) {
        self.aggregation_period = aggregation_period;
        self.update_interval = update_interval;
        self.last_target = self.last_target.max(up_to);
    }

    /// Clears all buckets and ledgers; the counted history starts over.
    pub fn reset(&mut self) {
        for series in &mut self.first {
            series.clear();
        }
        for series in &mut self.second {
            series.clear();
        }
        for ledger in &mut self.ledgers {
            *ledger = AssignmentLedger::new();
        }
    }

    /// Closes the bucket for `[time - aggregation_period, time)`.
    ///
    /// No-op (returning `false`) before one full aggregation period has
    /// elapsed. Inconsistent trajectories are logged, skipped, and marked
    /// counted so they are not re-examined every update; corrupt recordings
    /// never heal.
    pub fn advance_to(
        &mut self,
        time: f64,
        space: &Space,
        store: &TrajectoryStore,
        strategy: &MeasurementStrategy,
    ) -> bool {
        self.last_target = self.last_target.max(time);
        if time < self.aggregation_period {
            return false;
        }

        let start = time - self.aggregation_period;
        let mut aggregate_first = 0.0;
        let mut aggregate_second = 0.0;
        let mut flat_lane = 0;

        for series in 0..space.number_of_series() {
            let mut first = 0.0;
            let mut second = 0.0;

            for lane in space.lanes(series) {
                let ledger = &mut self.ledgers[flat_lane];
                flat_lane += 1;
                let Some(group) = store.group(lane.id) else {
                    continue;
                };

                for index in ledger.scan_start()..group.len() {
                    if ledger.is_assigned(index) {
                        continue;
                    }
                    // Indices below len() exist; the group is append-only.
                    let Some(trajectory) = group.get(index) else {
                        break;
                    };
                    if trajectory.is_empty() {
                        // Opened but not yet sampled; revisit next update.
                        continue;
                    }
                    if let Err(error) = trajectory.require_consistent() {
                        warn!(
                            lane = %lane.id,
                            vehicle = trajectory.vehicle(),
                            index,
                            %error,
                            "skipping inconsistent trajectory",
                        );
                        ledger.assign(index);
                        continue;
                    }

                    if trajectory.intersects_window(start, time) {
                        let (m1, m2) = strategy.measure(series, trajectory, start, time, lane.length);
                        first += m1;
                        second += m2;
                    }
                    if trajectory.last_time() < start - self.delay {
                        ledger.assign(index);
                    }
                }
            }

            if self.aggregate_lanes {
                aggregate_first += first;
                aggregate_second += second;
            } else {
                self.first[series].push(first);
                self.second[series].push(second);
            }
        }

        if self.aggregate_lanes {
            // Whatever was measured was summed over every lane; normalize to
            // a per-lane figure.
            let lanes = space.lane_count() as f64;
            self.first[0].push(aggregate_first / lanes);
            self.second[0].push(aggregate_second / lanes);
        }
        true
    }
}
