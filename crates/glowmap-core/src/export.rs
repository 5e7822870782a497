//! Coordinate normalization and position-map export.
//!
//! The exported artifact is the canonical input for downstream animation
//! tooling: a dense `positions` array indexed by LED, normalized so the
//! installation's vertical extent is exactly 1.0 with X/Y recentered on
//! their medians. LEDs that failed triangulation are written as an
//! explicit `[0, 0, 0]` placeholder AND listed in
//! `metadata.missing_led_indices` — a position equal to the origin is
//! ambiguous on its own and consumers must consult the list.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::triangulate::Position3D;

/// Schema version written into position-map files.
pub const POSITION_MAP_VERSION: &str = "0.1.0";

/// Errors from position-map persistence.
#[derive(Debug)]
pub enum ExportError {
    /// File could not be read or written.
    Io { path: PathBuf, msg: String },
    /// File exists but does not parse as a position map.
    Malformed { path: PathBuf, msg: String },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, msg } => write!(f, "position map {}: {}", path.display(), msg),
            Self::Malformed { path, msg } => {
                write!(f, "malformed position map {}: {}", path.display(), msg)
            }
        }
    }
}

impl std::error::Error for ExportError {}

/// How the raw coordinates were mapped into normalized space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizationInfo {
    /// Vertical extent in normalized space (always 1.0 unless degenerate).
    pub height: f64,
    pub x_centered_on: String,
    pub y_centered_on: String,
    pub z_centered_on: String,
    /// Vertical extent of the raw point cloud (meters).
    pub original_height_meters: f64,
    /// Uniform scale applied to all axes.
    pub scale_factor: f64,
}

/// Position-map metadata block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionMapMetadata {
    pub name: String,
    pub led_count: u32,
    pub created: String,
    pub units: String,
    pub coordinate_system: String,
    pub normalization: NormalizationInfo,
    pub method: String,
    pub num_angles: usize,
    pub angles: Vec<u32>,
    pub successful_leds: usize,
    pub failed_leds: usize,
    /// Indices whose `[0,0,0]` entry is a placeholder, not a position.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_led_indices: Vec<u32>,
}

/// The canonical exported artifact: a dense array of `[x, y, z]` triples
/// indexed by LED.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionMap {
    pub version: String,
    pub metadata: PositionMapMetadata,
    pub positions: Vec<[f64; 3]>,
}

/// Per-LED diagnostic entry for the detailed sibling artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailedEntry {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: f64,
    pub num_views: usize,
}

/// Diagnostic sibling of [`PositionMap`], carrying confidence and view
/// counts per triangulated LED (placeholders excluded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailedPositionMap {
    pub version: String,
    pub metadata: PositionMapMetadata,
    pub positions: Vec<DetailedEntry>,
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("finite coordinates"));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Recenter and rescale triangulated positions in place.
///
/// Median X and median Y map to 0, the vertical midpoint maps to 0, and
/// all axes scale uniformly by 1/height so the vertical extent becomes
/// 1.0. A degenerate (near-zero) height range leaves the scale at 1
/// instead of dividing by zero.
pub fn normalize_positions(positions: &mut [Position3D]) -> NormalizationInfo {
    let info_template = |original_height: f64, scale: f64| NormalizationInfo {
        height: 1.0,
        x_centered_on: "median".to_string(),
        y_centered_on: "median".to_string(),
        z_centered_on: "vertical_center".to_string(),
        original_height_meters: original_height,
        scale_factor: scale,
    };

    if positions.is_empty() {
        return info_template(1.0, 1.0);
    }

    let mut xs: Vec<f64> = positions.iter().map(|p| p.x).collect();
    let mut ys: Vec<f64> = positions.iter().map(|p| p.y).collect();
    let median_x = median(&mut xs);
    let median_y = median(&mut ys);

    let z_min = positions.iter().map(|p| p.z).fold(f64::INFINITY, f64::min);
    let z_max = positions
        .iter()
        .map(|p| p.z)
        .fold(f64::NEG_INFINITY, f64::max);
    let z_center = (z_min + z_max) / 2.0;
    let mut z_range = z_max - z_min;
    if z_range < 1e-6 {
        z_range = 1.0;
    }

    for p in positions.iter_mut() {
        p.x = (p.x - median_x) / z_range;
        p.y = (p.y - median_y) / z_range;
        p.z = (p.z - z_center) / z_range;
    }

    tracing::info!(
        "normalized {} positions: offsets ({:.3}, {:.3}, {:.3}), scale {:.3}",
        positions.len(),
        median_x,
        median_y,
        z_center,
        1.0 / z_range
    );

    info_template(z_range, 1.0 / z_range)
}

/// The pair of artifacts one export produces.
#[derive(Debug, Clone)]
pub struct ExportedMaps {
    pub map: PositionMap,
    pub detailed: DetailedPositionMap,
}

/// Normalize positions and build the dense canonical map plus its
/// detailed sibling.
///
/// The positions array spans index 0 through the highest triangulated
/// index; every gap becomes a `[0,0,0]` placeholder listed in
/// `missing_led_indices`.
pub fn export_position_map(
    mut positions: Vec<Position3D>,
    name: &str,
    angles: &[u32],
) -> ExportedMaps {
    let normalization = normalize_positions(&mut positions);
    positions.sort_by_key(|p| p.led_index);

    let led_count = positions.iter().map(|p| p.led_index + 1).max().unwrap_or(0);

    let mut dense = Vec::with_capacity(led_count as usize);
    let mut missing = Vec::new();
    let mut next = positions.iter().peekable();
    for led_index in 0..led_count {
        match next.peek() {
            Some(p) if p.led_index == led_index => {
                let p = next.next().expect("peeked");
                dense.push([p.x, p.y, p.z]);
            }
            _ => {
                dense.push([0.0, 0.0, 0.0]);
                missing.push(led_index);
            }
        }
    }

    if !missing.is_empty() {
        tracing::warn!(
            "{} LEDs exported as [0,0,0] placeholders (first few: {:?})",
            missing.len(),
            &missing[..missing.len().min(10)]
        );
    }

    let metadata = PositionMapMetadata {
        name: name.to_string(),
        led_count,
        created: chrono::Local::now().date_naive().to_string(),
        units: "normalized".to_string(),
        coordinate_system: "X-Y horizontal, Z vertical (up)".to_string(),
        normalization,
        method: "simplified_triangulation".to_string(),
        num_angles: angles.len(),
        angles: angles.to_vec(),
        successful_leds: positions.len(),
        failed_leds: missing.len(),
        missing_led_indices: missing,
    };

    let detailed_positions = positions
        .iter()
        .map(|p| DetailedEntry {
            id: p.led_index,
            x: p.x,
            y: p.y,
            z: p.z,
            confidence: p.confidence,
            num_views: p.num_views,
        })
        .collect();

    ExportedMaps {
        map: PositionMap {
            version: POSITION_MAP_VERSION.to_string(),
            metadata: metadata.clone(),
            positions: dense,
        },
        detailed: DetailedPositionMap {
            version: POSITION_MAP_VERSION.to_string(),
            metadata,
            positions: detailed_positions,
        },
    }
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ExportError::Io {
                path: path.to_path_buf(),
                msg: e.to_string(),
            })?;
        }
    }
    let json = serde_json::to_string_pretty(value).map_err(|e| ExportError::Io {
        path: path.to_path_buf(),
        msg: e.to_string(),
    })?;
    std::fs::write(path, json).map_err(|e| ExportError::Io {
        path: path.to_path_buf(),
        msg: e.to_string(),
    })
}

impl ExportedMaps {
    /// Write the canonical map to `path` and the detailed map to
    /// `<path stem>.detailed.json`.
    pub fn save(&self, path: &Path) -> Result<(), ExportError> {
        write_json(&self.map, path)?;
        let detailed_path = path.with_extension("detailed.json");
        write_json(&self.detailed, &detailed_path)?;
        tracing::info!(
            "position map saved to {} (+ {})",
            path.display(),
            detailed_path.display()
        );
        Ok(())
    }
}

impl PositionMap {
    /// Load a canonical position map; malformed content is fatal.
    pub fn load(path: &Path) -> Result<Self, ExportError> {
        let text = std::fs::read_to_string(path).map_err(|e| ExportError::Io {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ExportError::Malformed {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(led: u32, x: f64, y: f64, z: f64) -> Position3D {
        Position3D {
            led_index: led,
            x,
            y,
            z,
            confidence: 0.9,
            num_views: 3,
            source_detections: Vec::new(),
        }
    }

    #[test]
    fn normalization_sets_unit_height_and_zero_medians() {
        let mut positions = vec![
            pos(0, 1.0, 2.0, 0.5),
            pos(1, 1.2, 2.2, 1.5),
            pos(2, 0.8, 1.8, 2.5),
        ];
        let info = normalize_positions(&mut positions);

        let z_min = positions.iter().map(|p| p.z).fold(f64::INFINITY, f64::min);
        let z_max = positions
            .iter()
            .map(|p| p.z)
            .fold(f64::NEG_INFINITY, f64::max);
        assert!((z_max - z_min - 1.0).abs() < 1e-12);
        assert!((z_max + z_min).abs() < 1e-12, "height not centered");
        // Median point moved to the origin in X/Y.
        assert!(positions[0].x.abs() < 1e-12);
        assert!(positions[0].y.abs() < 1e-12);
        assert!((info.original_height_meters - 2.0).abs() < 1e-12);
        assert!((info.scale_factor - 0.5).abs() < 1e-12);
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut positions = vec![
            pos(0, 0.4, -0.1, 0.2),
            pos(1, -0.3, 0.2, 0.9),
            pos(2, 0.1, 0.05, -0.4),
        ];
        normalize_positions(&mut positions);
        let once = positions.clone();
        normalize_positions(&mut positions);
        for (a, b) in once.iter().zip(&positions) {
            assert!((a.x - b.x).abs() < 1e-12);
            assert!((a.y - b.y).abs() < 1e-12);
            assert!((a.z - b.z).abs() < 1e-12);
        }
    }

    #[test]
    fn degenerate_height_does_not_divide_by_zero() {
        let mut positions = vec![pos(0, 1.0, 1.0, 0.7), pos(1, 2.0, 3.0, 0.7)];
        let info = normalize_positions(&mut positions);
        assert_eq!(info.scale_factor, 1.0);
        assert!(positions.iter().all(|p| p.x.is_finite() && p.z.is_finite()));
    }

    #[test]
    fn gaps_become_placeholders_with_indices() {
        // LEDs 1 and 3 triangulated; 0 and 2 missing.
        let maps = export_position_map(
            vec![pos(3, 0.1, 0.1, 1.0), pos(1, 0.0, 0.0, 0.0)],
            "test",
            &[0, 90],
        );
        assert_eq!(maps.map.positions.len(), 4);
        assert_eq!(maps.map.positions[0], [0.0, 0.0, 0.0]);
        assert_eq!(maps.map.positions[2], [0.0, 0.0, 0.0]);
        assert_eq!(maps.map.metadata.missing_led_indices, vec![0, 2]);
        assert_eq!(maps.map.metadata.successful_leds, 2);
        assert_eq!(maps.map.metadata.failed_leds, 2);
        // Detailed map only lists real positions.
        assert_eq!(maps.detailed.positions.len(), 2);
        assert_eq!(maps.detailed.positions[0].id, 1);
        assert_eq!(maps.detailed.positions[0].num_views, 3);
    }

    #[test]
    fn save_load_roundtrip_preserves_positions_and_missing_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        let maps = export_position_map(
            vec![pos(0, 0.2, 0.3, 0.1), pos(2, -0.2, 0.1, 1.4)],
            "roundtrip",
            &[0, 90, 180, 270],
        );
        maps.save(&path).unwrap();

        let loaded = PositionMap::load(&path).unwrap();
        assert_eq!(loaded.positions, maps.map.positions);
        assert_eq!(
            loaded.metadata.missing_led_indices,
            maps.map.metadata.missing_led_indices
        );
        assert_eq!(loaded, maps.map);

        // Detailed sibling sits next to the canonical file.
        assert!(dir.path().join("map.detailed.json").exists());
    }

    #[test]
    fn float_coordinates_survive_disk_bit_exactly() {
        // Coordinates whose shortest decimal form sits on a rounding
        // boundary; parsing must reproduce the exact f64 bits.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        let maps = export_position_map(
            vec![
                pos(0, -0.21082434750528745, 1.0 / 3.0, 0.1 + 0.2),
                pos(1, std::f64::consts::PI, -std::f64::consts::E, 2.0 / 7.0),
            ],
            "bits",
            &[0, 90],
        );
        maps.save(&path).unwrap();

        let loaded = PositionMap::load(&path).unwrap();
        for (got, want) in loaded.positions.iter().zip(&maps.map.positions) {
            for axis in 0..3 {
                assert_eq!(
                    got[axis].to_bits(),
                    want[axis].to_bits(),
                    "axis {} drifted: {} vs {}",
                    axis,
                    got[axis],
                    want[axis]
                );
            }
        }
    }

    #[test]
    fn malformed_map_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        std::fs::write(&path, "[1, 2").unwrap();
        match PositionMap::load(&path) {
            Err(ExportError::Malformed { .. }) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
