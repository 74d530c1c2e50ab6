use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Selectable aggregation periods, in s.
pub const DEFAULT_AGGREGATION_PERIODS: [f64; 7] = [5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0];

/// Update frequencies, as a factor on 1 / aggregation period.
pub const DEFAULT_UPDATE_FREQUENCIES: [u32; 5] = [1, 2, 3, 5, 10];

/// Top-level configuration for the macroflow driver.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Aggregation engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Synthetic scenario configuration.
    #[serde(default)]
    pub scenario: ScenarioConfig,
}

/// Which aggregation geometry to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryKind {
    /// Fixed measurement position per lane.
    CrossSection,
    /// Aggregation over the whole lane stretch.
    Path,
}

/// Aggregation engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Aggregation window length. Default: 60s.
    #[serde(default = "default_aggregation_period", with = "humantime_serde")]
    pub aggregation_period: Duration,

    /// Bucket stride; windows overlap when shorter than the aggregation
    /// period. Default: 60s.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,

    /// Settle margin before a trajectory is permanently marked counted.
    /// Default: 1s.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub delay: Duration,

    /// Use the harmonic instead of the arithmetic mean for cross-section
    /// speeds. Default: false.
    #[serde(default)]
    pub harmonic: bool,

    /// Fold all lanes into one "Aggregate" series. Default: false.
    #[serde(default)]
    pub aggregate_lanes: bool,

    /// Aggregation geometry. Default: cross_section.
    #[serde(default = "default_geometry")]
    pub geometry: GeometryKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            aggregation_period: default_aggregation_period(),
            update_interval: default_update_interval(),
            delay: default_settle_delay(),
            harmonic: false,
            aggregate_lanes: false,
            geometry: default_geometry(),
        }
    }
}

impl EngineConfig {
    /// Validates the engine parameters.
    pub fn validate(&self) -> Result<()> {
        if self.aggregation_period.is_zero() {
            bail!("engine.aggregation_period must be positive");
        }
        if self.update_interval.is_zero() {
            bail!("engine.update_interval must be positive");
        }
        if self.update_interval > self.aggregation_period {
            bail!(
                "engine.update_interval ({:?}) must not exceed engine.aggregation_period ({:?})",
                self.update_interval,
                self.aggregation_period,
            );
        }
        Ok(())
    }
}

/// Synthetic scenario configuration for the driver binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConfig {
    /// Number of lanes. Default: 2.
    #[serde(default = "default_lanes")]
    pub lanes: usize,

    /// Monitored lane length, in m. Default: 1000.
    #[serde(default = "default_lane_length")]
    pub lane_length: f64,

    /// Cross-section measurement position, in m. Default: 500.
    #[serde(default = "default_measure_position")]
    pub measure_position: f64,

    /// Headway between vehicle entries per lane. Default: 4s.
    #[serde(default = "default_vehicle_headway", with = "humantime_serde")]
    pub vehicle_headway: Duration,

    /// Vehicle speeds cycled per entry, in m/s. Default: [20, 25, 30, 15].
    #[serde(default = "default_speeds")]
    pub speeds: Vec<f64>,

    /// Simulated duration. Default: 10m.
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Simulation time step. Default: 500ms.
    #[serde(default = "default_time_step", with = "humantime_serde")]
    pub time_step: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            lane_length: default_lane_length(),
            measure_position: default_measure_position(),
            vehicle_headway: default_vehicle_headway(),
            speeds: default_speeds(),
            duration: default_duration(),
            time_step: default_time_step(),
        }
    }
}

impl ScenarioConfig {
    /// Validates the scenario parameters.
    pub fn validate(&self) -> Result<()> {
        if self.lanes == 0 {
            bail!("scenario.lanes must be at least 1");
        }
        if self.lane_length <= 0.0 {
            bail!("scenario.lane_length must be positive");
        }
        if !(0.0..=self.lane_length).contains(&self.measure_position) {
            bail!(
                "scenario.measure_position ({}) outside the lane (0..{})",
                self.measure_position,
                self.lane_length,
            );
        }
        if self.vehicle_headway.is_zero() {
            bail!("scenario.vehicle_headway must be positive");
        }
        if self.speeds.is_empty() {
            bail!("scenario.speeds must not be empty");
        }
        if self.speeds.iter().any(|&v| v <= 0.0) {
            bail!("scenario.speeds must all be positive");
        }
        if self.time_step.is_zero() {
            bail!("scenario.time_step must be positive");
        }
        Ok(())
    }
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Config =
            serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates all sections.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.scenario.validate()?;
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_aggregation_period() -> Duration {
    Duration::from_secs(60)
}

fn default_update_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_geometry() -> GeometryKind {
    GeometryKind::CrossSection
}

fn default_lanes() -> usize {
    2
}

fn default_lane_length() -> f64 {
    1000.0
}

fn default_measure_position() -> f64 {
    500.0
}

fn default_vehicle_headway() -> Duration {
    Duration::from_secs(4)
}

fn default_speeds() -> Vec<f64> {
    vec![20.0, 25.0, 30.0, 15.0]
}

fn default_duration() -> Duration {
    Duration::from_secs(600)
}

fn default_time_step() -> Duration {
    Duration::from_millis(500)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.engine.aggregation_period, Duration::from_secs(60));
        assert_eq!(cfg.engine.update_interval, Duration::from_secs(60));
        assert_eq!(cfg.engine.delay, Duration::from_secs(1));
        assert!(!cfg.engine.harmonic);
        assert_eq!(cfg.engine.geometry, GeometryKind::CrossSection);
        assert_eq!(cfg.scenario.lanes, 2);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
log_level: debug
engine:
  aggregation_period: 30s
  update_interval: 10s
  delay: 2s
  harmonic: true
  aggregate_lanes: true
  geometry: path
scenario:
  lanes: 3
  lane_length: 2000.0
  measure_position: 750.0
  vehicle_headway: 2s
  speeds: [10.0, 15.0]
  duration: 2m
  time_step: 250ms
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.engine.aggregation_period, Duration::from_secs(30));
        assert_eq!(cfg.engine.update_interval, Duration::from_secs(10));
        assert!(cfg.engine.harmonic);
        assert!(cfg.engine.aggregate_lanes);
        assert_eq!(cfg.engine.geometry, GeometryKind::Path);
        assert_eq!(cfg.scenario.lanes, 3);
        assert_eq!(cfg.scenario.speeds, vec![10.0, 15.0]);
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_update_interval_must_not_exceed_period() {
        let yaml = r#"
engine:
  aggregation_period: 10s
  update_interval: 30s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_period_rejected() {
        let yaml = "engine: { aggregation_period: 0s }";
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_measure_position_outside_lane_rejected() {
        let yaml = "scenario: { lane_length: 100.0, measure_position: 150.0 }";
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_period_menu_is_valid() {
        for &period in &DEFAULT_AGGREGATION_PERIODS {
            for &frequency in &DEFAULT_UPDATE_FREQUENCIES {
                let cfg = EngineConfig {
                    aggregation_period: Duration::from_secs_f64(period),
                    update_interval: Duration::from_secs_f64(period / f64::from(frequency)),
                    ..EngineConfig::default()
                };
                cfg.validate().expect("menu entry is valid");
            }
        }
    }
}
