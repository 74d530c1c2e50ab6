use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use macroflow::config::{Config, GeometryKind, DEFAULT_AGGREGATION_PERIODS};
use macroflow::fd::space::{LaneRef, SeriesDef, Space};
use macroflow::fd::FdEngine;
use macroflow::sampling::{LaneId, TrajectoryStore};

/// Windowed traffic-statistics aggregation demo driver.
#[derive(Parser)]
#[command(name = "macroflow", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("macroflow {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config from {}", path.display()))?
        }
        None => Config::default(),
    };

    tracing::info!(version = version::RELEASE, "starting macroflow");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

/// One synthetic vehicle currently on a lane.
struct ActiveVehicle {
    lane: LaneId,
    index: usize,
    position: f64,
    speed: f64,
}

async fn run(cfg: Config) -> Result<()> {
    let scenario = &cfg.scenario;
    let series: Vec<SeriesDef> = (0..scenario.lanes)
        .map(|i| {
            SeriesDef::single(
                format!("Lane {}", i + 1),
                LaneRef {
                    id: LaneId(i as u32),
                    length: scenario.lane_length,
                },
            )
        })
        .collect();
    let space = match cfg.engine.geometry {
        GeometryKind::CrossSection => {
            Space::cross_section(series, vec![scenario.measure_position; scenario.lanes])?
        }
        GeometryKind::Path => Space::path(series)?,
    };

    let store = Arc::new(TrajectoryStore::new());
    let engine = FdEngine::new(&cfg.engine, space, Arc::clone(&store))?;

    let updates = Arc::new(AtomicU64::new(0));
    {
        let updates = Arc::clone(&updates);
        engine.on_update(Box::new(move || {
            updates.fetch_add(1, Ordering::Relaxed);
        }));
    }

    tracing::debug!(
        available_periods = ?DEFAULT_AGGREGATION_PERIODS,
        "aggregation period menu",
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, stopping scenario");
                cancel.cancel();
            }
        });
    }

    let dt = scenario.time_step.as_secs_f64();
    let duration = scenario.duration.as_secs_f64();
    let update_interval = cfg.engine.update_interval.as_secs_f64();
    let headway = scenario.vehicle_headway.as_secs_f64();

    let mut sim_time = 0.0;
    let mut next_entry = vec![0.0f64; scenario.lanes];
    let mut next_update = update_interval;
    let mut entries = 0usize;
    let mut active: Vec<ActiveVehicle> = Vec::new();
    let mut vehicle_ids = 0u64;

    // The simulation runs decoupled from wall time; the interval only yields
    // to the runtime so shutdown stays responsive.
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(1));
    while sim_time < duration && !cancel.is_cancelled() {
        ticker.tick().await;

        // Vehicle entries per lane, speeds cycling through the configured set.
        for (lane_no, entry_at) in next_entry.iter_mut().enumerate() {
            if sim_time >= *entry_at {
                let lane = LaneId(lane_no as u32);
                let speed = scenario.speeds[entries % scenario.speeds.len()];
                entries += 1;
                vehicle_ids += 1;
                let index = store
                    .begin_trajectory(lane, vehicle_ids)
                    .context("beginning trajectory")?;
                store
                    .append_sample(lane, index, sim_time, 0.0, speed)
                    .context("recording entry sample")?;
                active.push(ActiveVehicle {
                    lane,
                    index,
                    position: 0.0,
                    speed,
                });
                *entry_at += headway;
            }
        }

        sim_time += dt;

        // Move vehicles and record samples; drop them past the lane end.
        let mut i = 0;
        while i < active.len() {
            let vehicle = &mut active[i];
            vehicle.position += vehicle.speed * dt;
            let clamped = vehicle.position.min(scenario.lane_length);
            store
                .append_sample(vehicle.lane, vehicle.index, sim_time, clamped, vehicle.speed)
                .context("recording sample")?;
            if vehicle.position >= scenario.lane_length {
                active.swap_remove(i);
            } else {
                i += 1;
            }
        }

        while sim_time >= next_update {
            engine.advance(next_update);
            next_update += update_interval;
        }
    }

    summarize(&engine);
    tracing::info!(
        sim_time,
        entries,
        updates = updates.load(Ordering::Relaxed),
        "scenario finished",
    );
    Ok(())
}

/// Logs the tail of each series.
fn summarize(engine: &FdEngine) {
    for series in 0..engine.number_of_series() {
        let items = engine.item_count(series);
        tracing::info!(
            series = %engine.series_name(series),
            buckets = items,
            "series summary",
        );
        for item in items.saturating_sub(5)..items {
            tracing::info!(
                item,
                flow_veh_per_s = engine.flow(series, item),
                speed_m_per_s = engine.speed(series, item),
                density_veh_per_m = engine.density(series, item),
                "bucket",
            );
        }
    }
}
