use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::sampling::{SpaceTimeRegion, TrajectoryStore};

use super::measure::MeasurementStrategy;
use super::space::Space;
use super::state::AggregationState;

/// Callback invoked after every processed advance or recompute step.
pub type UpdateFn = Box<dyn Fn() + Send + Sync>;

/// Parameters of a queued full-history recompute.
#[derive(Debug, Clone, Copy)]
struct RecomputeRequest {
    aggregation_period: f64,
    update_interval: f64,
    /// Replay advances up to and including this time.
    up_to: f64,
}

/// State shared between the engine handle and the recompute worker.
struct Core {
    space: Space,
    strategy: MeasurementStrategy,
    store: Arc<TrajectoryStore>,
    aggregate_lanes: bool,
    state: RwLock<AggregationState>,
    /// Set for the duration of a recompute; quantity readers return NaN
    /// without touching the state lock while it holds.
    invalid: AtomicBool,
    /// Set while the worker replays; owner advances become no-ops.
    recomputing: AtomicBool,
    listeners: Mutex<Vec<UpdateFn>>,
}

impl Core {
    fn notify(&self) {
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            listener();
        }
    }

    /// Discards and rebuilds the entire bucket history with the requested
    /// parameters, replaying one bucket per step so readers can observe
    /// progress through `item_count`.
    fn run_recompute(&self, request: RecomputeRequest) {
        info!(
            aggregation_period = request.aggregation_period,
            update_interval = request.update_interval,
            up_to = request.up_to,
            "recomputing series history",
        );
        self.recomputing.store(true, Ordering::SeqCst);
        self.invalid.store(true, Ordering::SeqCst);

        {
            let mut state = self.state.write();
            state.set_params(
                request.aggregation_period,
                request.update_interval,
                request.up_to,
            );
            state.reset();
        }

        loop {
            // Bucket n closes at aggregation_period + n * update_interval.
            let target = {
                let state = self.state.read();
                state.aggregation_period() + state.periods() as f64 * state.update_interval()
            };
            if target > request.up_to {
                break;
            }
            {
                let mut state = self.state.write();
                state.advance_to(target, &self.space, &self.store, &self.strategy);
            }
            self.notify();
        }

        self.invalid.store(false, Ordering::SeqCst);
        self.recomputing.store(false, Ordering::SeqCst);
        self.notify();
        debug!(buckets = self.state.read().periods(), "recompute finished");
    }
}

fn recompute_loop(core: Arc<Core>, requests: mpsc::Receiver<RecomputeRequest>) {
    while let Ok(mut request) = requests.recv() {
        // Coalesce queued changes; only the newest parameters matter.
        while let Ok(newer) = requests.try_recv() {
            request = newer;
        }
        core.run_recompute(request);
    }
    debug!("recompute worker stopped");
}

/// The fundamental-diagram aggregation engine.
///
/// One logical writer drives [`FdEngine::advance`] as simulation time
/// progresses; parameter changes are replayed by a single long-lived worker
/// thread. Readers ([`FdEngine::flow`] and friends) never block: while a
/// recompute is running they read NaN.
pub struct FdEngine {
    core: Arc<Core>,
    recompute_tx: Option<mpsc::Sender<RecomputeRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl FdEngine {
    /// Creates an engine over `space`, registering a capture region for every
    /// lane on `store`.
    pub fn new(cfg: &EngineConfig, space: Space, store: Arc<TrajectoryStore>) -> Result<Self> {
        let aggregation_period = cfg.aggregation_period.as_secs_f64();
        let update_interval = cfg.update_interval.as_secs_f64();
        let delay = cfg.delay.as_secs_f64();
        if aggregation_period <= 0.0 {
            bail!("aggregation period must be positive");
        }
        if update_interval <= 0.0 {
            bail!("update interval must be positive");
        }
        if update_interval > aggregation_period {
            bail!(
                "update interval ({update_interval}s) must not exceed \
                 aggregation period ({aggregation_period}s)",
            );
        }

        let strategy = MeasurementStrategy::for_space(&space, cfg.harmonic)?;
        for lane in space.all_lanes() {
            store.register_region(SpaceTimeRegion {
                lane: lane.id,
                from_position: 0.0,
                to_position: lane.length,
                from_time: 0.0,
                to_time: f64::INFINITY,
            });
        }

        let state = AggregationState::new(
            &space,
            aggregation_period,
            update_interval,
            delay,
            cfg.aggregate_lanes,
        );

        info!(
            aggregation_period,
            update_interval,
            delay,
            series = state.number_of_series(),
            lanes = space.lane_count(),
            "aggregation engine ready",
        );

        let core = Arc::new(Core {
            space,
            strategy,
            store,
            aggregate_lanes: cfg.aggregate_lanes,
            state: RwLock::new(state),
            invalid: AtomicBool::new(false),
            recomputing: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        });

        let (recompute_tx, recompute_rx) = mpsc::channel();
        let worker = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name("fd-recompute".to_string())
                .spawn(move || recompute_loop(core, recompute_rx))
                .context("spawning recompute worker")?
        };

        Ok(Self {
            core,
            recompute_tx: Some(recompute_tx),
            worker: Some(worker),
        })
    }

    /// Registers a change callback, fired once per processed advance and per
    /// recompute step.
    pub fn on_update(&self, callback: UpdateFn) {
        self.core.listeners.lock().push(callback);
    }

    /// Closes the next aggregation bucket at `time`.
    ///
    /// A no-op before one aggregation period has elapsed, and while a
    /// recompute is replaying history (the owner is expected not to call it
    /// then; ignoring beats interleaving with the replay).
    pub fn advance(&self, time: f64) {
        let added = {
            let mut state = self.core.state.write();
            if self.core.recomputing.load(Ordering::SeqCst) {
                debug!(time, "advance ignored while recomputing");
                return;
            }
            state.advance_to(time, &self.core.space, &self.core.store, &self.core.strategy)
        };
        if added {
            self.core.notify();
        }
    }

    /// Changes the aggregation period and rebuilds the whole history in the
    /// background, up to the newest time the engine has been advanced to.
    pub fn set_aggregation_period(&self, period: f64) -> Result<()> {
        if period <= 0.0 {
            bail!("aggregation period must be positive");
        }
        let (current, interval, up_to) = {
            let state = self.core.state.read();
            (
                state.aggregation_period(),
                state.update_interval(),
                state.last_target(),
            )
        };
        if period == current {
            return Ok(());
        }
        if interval > period {
            bail!(
                "update interval ({interval}s) must not exceed \
                 new aggregation period ({period}s)",
            );
        }
        self.request_recompute(RecomputeRequest {
            aggregation_period: period,
            update_interval: interval,
            up_to,
        })
    }

    /// Changes the update interval and rebuilds the whole history in the
    /// background, replaying up to `as_of` with the new stride.
    pub fn set_update_interval(&self, interval: f64, as_of: f64) -> Result<()> {
        if interval <= 0.0 {
            bail!("update interval must be positive");
        }
        let (period, current) = {
            let state = self.core.state.read();
            (state.aggregation_period(), state.update_interval())
        };
        if interval == current {
            return Ok(());
        }
        if interval > period {
            bail!(
                "update interval ({interval}s) must not exceed \
                 aggregation period ({period}s)",
            );
        }
        self.request_recompute(RecomputeRequest {
            aggregation_period: period,
            update_interval: interval,
            up_to: as_of,
        })
    }

    fn request_recompute(&self, request: RecomputeRequest) -> Result<()> {
        let Some(tx) = self.recompute_tx.as_ref() else {
            bail!("recompute worker is gone");
        };
        if tx.send(request).is_err() {
            warn!("recompute worker is gone, parameter change dropped");
            bail!("recompute worker is gone");
        }
        Ok(())
    }

    /// Whether a full-history recompute is currently running or queued.
    pub fn is_recomputing(&self) -> bool {
        self.core.recomputing.load(Ordering::SeqCst)
    }

    /// Number of output series.
    pub fn number_of_series(&self) -> usize {
        self.core.state.read().number_of_series()
    }

    /// Display name of a series.
    pub fn series_name(&self, series: usize) -> String {
        if self.core.aggregate_lanes {
            "Aggregate".to_string()
        } else {
            self.core.space.series_name(series).to_string()
        }
    }

    /// Number of filled buckets. During a recompute this drops to 0 and
    /// grows back as the replay progresses.
    pub fn item_count(&self, series: usize) -> usize {
        let state = self.core.state.read();
        debug_assert!(series < state.number_of_series());
        state.periods()
    }

    /// Current aggregation window length, in s.
    pub fn aggregation_period(&self) -> f64 {
        self.core.state.read().aggregation_period()
    }

    /// Current bucket stride, in s.
    pub fn update_interval(&self) -> f64 {
        self.core.state.read().update_interval()
    }

    /// Flow of a bucket, in veh/s. NaN while a recompute is in progress or
    /// for a bucket that does not (yet) exist; 0 for an empty bucket.
    pub fn flow(&self, series: usize, item: usize) -> f64 {
        match self.bucket(series, item) {
            Some((first, second, period)) => {
                self.core.strategy.vehicle_count(first, second) / period
            }
            None => f64::NAN,
        }
    }

    /// Mean speed of a bucket, in m/s. NaN while a recompute is in progress
    /// or for a missing bucket; 0 for an empty bucket.
    pub fn speed(&self, series: usize, item: usize) -> f64 {
        match self.bucket(series, item) {
            Some((first, second, _)) => {
                if first <= 0.0 || second <= 0.0 {
                    0.0
                } else {
                    self.core.strategy.mean_speed(first, second)
                }
            }
            None => f64::NAN,
        }
    }

    /// Density of a bucket, in veh/m. NaN while a recompute is in progress
    /// or for a missing bucket; 0 for an empty bucket.
    pub fn density(&self, series: usize, item: usize) -> f64 {
        match self.bucket(series, item) {
            Some((first, second, period)) => {
                if first <= 0.0 || second <= 0.0 {
                    return 0.0;
                }
                let flow = self.core.strategy.vehicle_count(first, second) / period;
                let speed = self.core.strategy.mean_speed(first, second);
                if speed <= 0.0 {
                    0.0
                } else {
                    flow / speed
                }
            }
            None => f64::NAN,
        }
    }

    /// Reads a bucket unless the state is invalid. Takes a short read lock.
    fn bucket(&self, series: usize, item: usize) -> Option<(f64, f64, f64)> {
        if self.core.invalid.load(Ordering::SeqCst) {
            return None;
        }
        let state = self.core.state.read();
        let (first, second) = state.measurement(series, item)?;
        Some((first, second, state.aggregation_period()))
    }
}

impl Drop for FdEngine {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.recompute_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("recompute worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::space::{LaneRef, SeriesDef};
    use crate::sampling::LaneId;

    fn one_lane_space() -> Space {
        Space::cross_section(
            vec![SeriesDef::single(
                "Lane 1",
                LaneRef {
                    id: LaneId(0),
                    length: 1000.0,
                },
            )],
            vec![500.0],
        )
        .expect("space")
    }

    fn engine() -> (FdEngine, Arc<TrajectoryStore>) {
        let store = Arc::new(TrajectoryStore::new());
        let engine = FdEngine::new(&EngineConfig::default(), one_lane_space(), Arc::clone(&store))
            .expect("engine");
        (engine, store)
    }

    fn add_crossing(store: &TrajectoryStore, t_cross: f64, speed: f64) {
        let lane = LaneId(0);
        let index = store.begin_trajectory(lane, t_cross as u64).expect("lane");
        let x0 = 500.0 - speed * t_cross;
        let t1 = t_cross + 500.0 / speed;
        store.append_sample(lane, index, 0.0, x0, speed).expect("sample");
        store.append_sample(lane, index, t1, 1000.0, speed).expect("sample");
    }

    #[test]
    fn test_construction_registers_regions() {
        let (_engine, store) = engine();
        let regions = store.regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].lane, LaneId(0));
        assert_eq!(regions[0].to_position, 1000.0);
    }

    #[test]
    fn test_rejects_interval_exceeding_period() {
        let cfg = EngineConfig {
            aggregation_period: std::time::Duration::from_secs(10),
            update_interval: std::time::Duration::from_secs(60),
            ..EngineConfig::default()
        };
        let result = FdEngine::new(&cfg, one_lane_space(), Arc::new(TrajectoryStore::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_readers_return_nan_while_invalid() {
        let (engine, store) = engine();
        add_crossing(&store, 10.0, 20.0);
        engine.advance(60.0);
        assert!(engine.flow(0, 0) > 0.0);

        engine.core.invalid.store(true, Ordering::SeqCst);
        assert!(engine.flow(0, 0).is_nan());
        assert!(engine.speed(0, 0).is_nan());
        assert!(engine.density(0, 0).is_nan());

        engine.core.invalid.store(false, Ordering::SeqCst);
        assert!(engine.flow(0, 0) > 0.0);
    }

    #[test]
    fn test_missing_bucket_reads_nan() {
        let (engine, _store) = engine();
        assert_eq!(engine.item_count(0), 0);
        assert!(engine.flow(0, 0).is_nan());
    }

    #[test]
    fn test_empty_bucket_sentinels() {
        let (engine, _store) = engine();
        engine.advance(60.0);
        assert_eq!(engine.item_count(0), 1);
        assert_eq!(engine.flow(0, 0), 0.0);
        assert_eq!(engine.speed(0, 0), 0.0);
        assert_eq!(engine.density(0, 0), 0.0);
    }

    #[test]
    fn test_advance_fires_update_callback() {
        use std::sync::atomic::AtomicUsize;

        let (engine, _store) = engine();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        engine.on_update(Box::new(move || {
            observer.fetch_add(1, Ordering::Relaxed);
        }));

        engine.advance(30.0); // below one period: no bucket, no callback
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        engine.advance(60.0);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_set_same_parameters_is_noop() {
        let (engine, store) = engine();
        add_crossing(&store, 10.0, 20.0);
        engine.advance(60.0);

        engine.set_aggregation_period(60.0).expect("noop");
        engine.set_update_interval(60.0, 60.0).expect("noop");
        assert!(!engine.is_recomputing());
        assert_eq!(engine.item_count(0), 1);
    }

    #[test]
    fn test_invalid_setter_values_rejected() {
        let (engine, _store) = engine();
        assert!(engine.set_aggregation_period(0.0).is_err());
        assert!(engine.set_update_interval(0.0, 60.0).is_err());
        // Larger than the current aggregation period.
        assert!(engine.set_update_interval(120.0, 60.0).is_err());
    }
}
