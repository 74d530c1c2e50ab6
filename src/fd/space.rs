use anyhow::{bail, Result};

use crate::sampling::LaneId;

/// One monitored lane inside a series.
#[derive(Debug, Clone, Copy)]
pub struct LaneRef {
    /// Lane identity in the trajectory store.
    pub id: LaneId,
    /// Monitored length of the lane, in m.
    pub length: f64,
}

/// One series of the diagram: a named group of lanes.
#[derive(Debug, Clone)]
pub struct SeriesDef {
    /// Display name of the series.
    pub name: String,
    /// Lanes feeding the series.
    pub lanes: Vec<LaneRef>,
}

impl SeriesDef {
    /// Convenience constructor for a single-lane series.
    pub fn single(name: impl Into<String>, lane: LaneRef) -> Self {
        Self {
            name: name.into(),
            lanes: vec![lane],
        }
    }
}

/// Aggregation geometry of a space.
#[derive(Debug, Clone)]
pub enum Geometry {
    /// Aggregation anchored at one fixed position per series.
    CrossSection {
        /// Measurement position per series, in m.
        positions: Vec<f64>,
    },
    /// Aggregation over an extended stretch.
    Path {
        /// Length of the path, in m.
        total_length: f64,
    },
}

/// The monitored space: the series of the diagram and their geometry.
///
/// Purely descriptive; all mutable aggregation state lives elsewhere.
#[derive(Debug, Clone)]
pub struct Space {
    series: Vec<SeriesDef>,
    geometry: Geometry,
}

impl Space {
    /// Creates a cross-section space with one measurement position per series.
    pub fn cross_section(series: Vec<SeriesDef>, positions: Vec<f64>) -> Result<Self> {
        if series.is_empty() {
            bail!("a space needs at least one series");
        }
        if positions.len() != series.len() {
            bail!(
                "{} series but {} cross-section positions",
                series.len(),
                positions.len(),
            );
        }
        for (def, &position) in series.iter().zip(&positions) {
            if def.lanes.is_empty() {
                bail!("series {:?} has no lanes", def.name);
            }
            for lane in &def.lanes {
                if !(0.0..=lane.length).contains(&position) {
                    bail!(
                        "cross-section position {position} outside {} (length {})",
                        lane.id,
                        lane.length,
                    );
                }
            }
        }
        Ok(Self {
            series,
            geometry: Geometry::CrossSection { positions },
        })
    }

    /// Creates a path space. Every series must cover the same total length.
    pub fn path(series: Vec<SeriesDef>) -> Result<Self> {
        if series.is_empty() {
            bail!("a space needs at least one series");
        }
        let mut total_length = None;
        for def in &series {
            if def.lanes.is_empty() {
                bail!("series {:?} has no lanes", def.name);
            }
            let length: f64 = def.lanes.iter().map(|l| l.length).sum();
            match total_length {
                None => total_length = Some(length),
                Some(existing) if (existing - length).abs() > 1e-6 => {
                    bail!(
                        "series {:?} covers {length} m, expected {existing} m",
                        def.name,
                    );
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            geometry: Geometry::Path {
                // checked non-empty above
                total_length: total_length.unwrap_or(0.0),
            },
            series,
        })
    }

    /// Number of series.
    pub fn number_of_series(&self) -> usize {
        self.series.len()
    }

    /// Display name of a series.
    pub fn series_name(&self, series: usize) -> &str {
        &self.series[series].name
    }

    /// Lanes of a series.
    pub fn lanes(&self, series: usize) -> &[LaneRef] {
        &self.series[series].lanes
    }

    /// Total number of lanes across all series.
    pub fn lane_count(&self) -> usize {
        self.series.iter().map(|s| s.lanes.len()).sum()
    }

    /// Iterates all lanes in series order.
    pub fn all_lanes(&self) -> impl Iterator<Item = &LaneRef> {
        self.series.iter().flat_map(|s| s.lanes.iter())
    }

    /// Geometry of the space.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}
