//! Least-squares ray intersection for multi-angle LED triangulation.
//!
//! Each non-occluded detection becomes a world-space ray through the rig
//! model. For a point `p` and a unit direction `d`, the matrix
//! `(I − d·dᵀ)` projects onto the plane perpendicular to the ray, so
//! stacking one such block per ray yields a linear least-squares system
//! whose solution minimizes the sum of squared perpendicular distances to
//! all rays. The residual reported is the RMS perpendicular distance, a
//! ray-consistency metric.

use std::fmt;

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::rig::{CameraRigModel, Ray};
use crate::session::{CaptureSession, Detection2D};

/// Errors from the ray-intersection solver.
#[derive(Debug, Clone, PartialEq)]
pub enum TriangulationError {
    /// Fewer rays than the geometry requires.
    TooFewRays { needed: usize, got: usize },
    /// The least-squares solve failed (degenerate ray bundle).
    NumericalFailure(String),
}

impl fmt::Display for TriangulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewRays { needed, got } => {
                write!(f, "too few rays: need {}, got {}", needed, got)
            }
            Self::NumericalFailure(msg) => write!(f, "numerical failure: {}", msg),
        }
    }
}

impl std::error::Error for TriangulationError {}

/// Triangulated 3D position of one LED.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position3D {
    pub led_index: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// View-coverage and ray-consistency score, non-negative.
    pub confidence: f64,
    /// Number of non-occluded detections the solution used.
    pub num_views: usize,
    /// The detections (occluded included) this LED was triangulated from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_detections: Vec<Detection2D>,
}

impl Position3D {
    /// Position as a nalgebra vector.
    pub fn point(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

/// Find the point minimizing the summed squared perpendicular distance to
/// all rays. Returns the point and the RMS perpendicular distance.
pub fn intersect_rays(rays: &[Ray]) -> Result<(Vector3<f64>, f64), TriangulationError> {
    if rays.len() < 2 {
        return Err(TriangulationError::TooFewRays {
            needed: 2,
            got: rays.len(),
        });
    }

    // Stack one (I − d·dᵀ) block per ray:  A p = A origin  for each ray.
    let n = rays.len();
    let mut a = DMatrix::<f64>::zeros(3 * n, 3);
    let mut b = DVector::<f64>::zeros(3 * n);
    for (i, ray) in rays.iter().enumerate() {
        let d = ray.direction;
        let proj = Matrix3::identity() - d * d.transpose();
        let rhs = proj * ray.origin;
        a.view_mut((3 * i, 0), (3, 3)).copy_from(&proj);
        b.rows_mut(3 * i, 3).copy_from(&rhs);
    }

    let svd = a.svd(true, true);
    let x = svd
        .solve(&b, 1e-12)
        .map_err(|e| TriangulationError::NumericalFailure(e.to_string()))?;
    let point = Vector3::new(x[0], x[1], x[2]);

    let mean_sq = rays
        .iter()
        .map(|r| {
            let d = r.distance_to_point(&point);
            d * d
        })
        .sum::<f64>()
        / n as f64;

    Ok((point, mean_sq.sqrt()))
}

/// Triangulate one LED from its detections across angles.
///
/// Occluded detections are excluded; fewer than 2 usable views means no
/// solution (`None`), never a fabricated point. Confidence is
/// `(valid / total) · exp(−residual)`: it rewards view coverage and decays
/// smoothly as the rays disagree.
pub fn triangulate_led(detections: &[Detection2D], rig: &CameraRigModel) -> Option<Position3D> {
    let valid: Vec<&Detection2D> = detections.iter().filter(|d| !d.occluded).collect();
    if valid.len() < 2 {
        return None;
    }

    let rays: Vec<Ray> = valid
        .iter()
        .map(|d| rig.pixel_to_ray(d.pixel_x, d.pixel_y, d.angle_id as f64))
        .collect();

    let (point, residual) = match intersect_rays(&rays) {
        Ok(solution) => solution,
        Err(e) => {
            tracing::warn!(
                "LED {}: ray intersection failed: {}",
                detections[0].led_index,
                e
            );
            return None;
        }
    };

    let coverage = valid.len() as f64 / detections.len() as f64;
    let confidence = (coverage * (-residual).exp()).max(0.0);

    Some(Position3D {
        led_index: detections[0].led_index,
        x: point.x,
        y: point.y,
        z: point.z,
        confidence,
        num_views: valid.len(),
        source_detections: detections.to_vec(),
    })
}

/// Group detections by LED index across all sessions.
pub fn build_detection_map(
    sessions: &[CaptureSession],
) -> std::collections::BTreeMap<u32, Vec<Detection2D>> {
    let mut map: std::collections::BTreeMap<u32, Vec<Detection2D>> =
        std::collections::BTreeMap::new();
    for session in sessions {
        for det in &session.detections {
            map.entry(det.led_index).or_default().push(det.clone());
        }
    }
    map
}

/// Triangulate every LED seen in the given sessions.
///
/// LEDs that cannot be solved are skipped here; the exporter records them
/// as explicit placeholders.
pub fn triangulate_all(sessions: &[CaptureSession], rig: &CameraRigModel) -> Vec<Position3D> {
    let map = build_detection_map(sessions);
    let total = map.len();
    let mut positions = Vec::new();

    for (led_index, detections) in &map {
        match triangulate_led(detections, rig) {
            Some(position) => positions.push(position),
            None => {
                tracing::warn!("LED {} failed triangulation (insufficient views)", led_index);
            }
        }
    }

    tracing::info!("triangulated {}/{} LEDs", positions.len(), total);
    positions
}
