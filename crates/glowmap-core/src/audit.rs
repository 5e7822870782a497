//! Data-quality audit across capture sessions.
//!
//! Aggregates every angle's detections per LED and separates two failure
//! modes that need different remediation: LEDs seen from too few angles
//! (investigate obstruction, maybe re-shoot some angles) and LEDs with no
//! detection anywhere (re-shoot, or the LED is dead).

use serde::Serialize;

use crate::session::CaptureSession;

/// Audit thresholds.
#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    /// Minimum non-occluded detections for reliable triangulation.
    pub min_detections: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { min_detections: 4 }
    }
}

/// An occlusion reason recorded for one angle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OcclusionNote {
    pub angle_id: u32,
    pub note: String,
}

/// Per-LED view coverage across all angles.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedCoverage {
    pub led_index: u32,
    /// Non-occluded detections.
    pub successful: usize,
    /// Occluded detections.
    pub occluded: usize,
    /// Angles with no detection record at all for this LED.
    pub missing: usize,
    /// Angles where the LED was cleanly seen.
    pub angles_detected: Vec<u32>,
    /// Angles where the LED was occluded.
    pub angles_occluded: Vec<u32>,
    /// Occlusion reasons, where recorded.
    pub occlusion_notes: Vec<OcclusionNote>,
}

/// Result of auditing a set of sessions.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    /// Number of camera angles audited.
    pub num_angles: usize,
    /// The audited azimuths, sorted.
    pub angles: Vec<u32>,
    /// LED index range covered (0..led_count).
    pub led_count: u32,
    /// Threshold the problematic list was built with.
    pub min_detections: usize,
    /// Dense per-LED coverage, indexed by LED.
    pub coverage: Vec<LedCoverage>,
    /// LEDs seen somewhere but with fewer clean views than the minimum.
    pub problematic: Vec<u32>,
    /// LEDs with zero detections across every angle.
    pub fully_missing: Vec<u32>,
}

impl AuditReport {
    /// True when every LED has enough clean views.
    pub fn is_clean(&self) -> bool {
        self.problematic.is_empty() && self.fully_missing.is_empty()
    }
}

/// Audit all sessions for multi-angle coverage.
///
/// The LED range is the largest of the sessions' declared `led_count` and
/// the highest detected index + 1, so trailing LEDs that never produced a
/// detection are still reported as fully missing.
pub fn audit_sessions(sessions: &[CaptureSession], config: &AuditConfig) -> AuditReport {
    let mut angles: Vec<u32> = sessions.iter().map(|s| s.session.angle_id).collect();
    angles.sort_unstable();
    angles.dedup();

    let led_count = sessions
        .iter()
        .flat_map(|s| {
            std::iter::once(s.session.led_count)
                .chain(s.detections.iter().map(|d| d.led_index + 1))
        })
        .max()
        .unwrap_or(0);

    let mut coverage: Vec<LedCoverage> = (0..led_count)
        .map(|led_index| LedCoverage {
            led_index,
            successful: 0,
            occluded: 0,
            missing: angles.len(),
            angles_detected: Vec::new(),
            angles_occluded: Vec::new(),
            occlusion_notes: Vec::new(),
        })
        .collect();

    for session in sessions {
        for det in &session.detections {
            let entry = &mut coverage[det.led_index as usize];
            entry.missing = entry.missing.saturating_sub(1);
            if det.occluded {
                entry.occluded += 1;
                entry.angles_occluded.push(det.angle_id);
                if !det.notes.is_empty() {
                    entry.occlusion_notes.push(OcclusionNote {
                        angle_id: det.angle_id,
                        note: det.notes.clone(),
                    });
                }
            } else {
                entry.successful += 1;
                entry.angles_detected.push(det.angle_id);
            }
        }
    }
    for entry in &mut coverage {
        entry.angles_detected.sort_unstable();
        entry.angles_occluded.sort_unstable();
    }

    let fully_missing: Vec<u32> = coverage
        .iter()
        .filter(|c| c.successful == 0 && c.occluded == 0)
        .map(|c| c.led_index)
        .collect();
    let problematic: Vec<u32> = coverage
        .iter()
        .filter(|c| (c.successful + c.occluded) > 0 && c.successful < config.min_detections)
        .map(|c| c.led_index)
        .collect();

    tracing::info!(
        "audit: {} LEDs over {} angles, {} problematic, {} fully missing",
        led_count,
        angles.len(),
        problematic.len(),
        fully_missing.len()
    );

    AuditReport {
        num_angles: angles.len(),
        angles,
        led_count,
        min_detections: config.min_detections,
        coverage,
        problematic,
        fully_missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CaptureSession, Detection2D, SessionInfo};

    fn det(led: u32, angle: u32, occluded: bool, notes: &str) -> Detection2D {
        Detection2D {
            led_index: led,
            angle_id: angle,
            pixel_x: 1.0,
            pixel_y: 2.0,
            brightness: 250,
            occluded,
            confidence: if occluded { 0.0 } else { 0.9 },
            notes: notes.to_string(),
        }
    }

    fn sessions() -> Vec<CaptureSession> {
        let mut s0 = CaptureSession::new(SessionInfo::new("a", 4, 0));
        s0.push(det(0, 0, false, ""));
        s0.push(det(1, 0, true, "below brightness threshold"));
        s0.push(det(3, 0, false, ""));

        let mut s90 = CaptureSession::new(SessionInfo::new("b", 4, 90));
        s90.push(det(0, 90, false, ""));
        s90.push(det(1, 90, false, ""));
        // LED 2 is absent from both, LED 3 only seen at angle 0.
        vec![s0, s90]
    }

    #[test]
    fn separates_missing_from_insufficient() {
        let report = audit_sessions(&sessions(), &AuditConfig { min_detections: 2 });
        assert_eq!(report.num_angles, 2);
        assert_eq!(report.led_count, 4);
        assert_eq!(report.fully_missing, vec![2]);
        // LED 1 has 1 clean view, LED 3 has 1; LED 2 is missing, not
        // problematic.
        assert_eq!(report.problematic, vec![1, 3]);
        assert!(!report.is_clean());
    }

    #[test]
    fn coverage_counts_per_led() {
        let report = audit_sessions(&sessions(), &AuditConfig::default());
        let led1 = &report.coverage[1];
        assert_eq!(led1.successful, 1);
        assert_eq!(led1.occluded, 1);
        assert_eq!(led1.missing, 0);
        assert_eq!(led1.angles_detected, vec![90]);
        assert_eq!(led1.angles_occluded, vec![0]);
        assert_eq!(led1.occlusion_notes.len(), 1);
        assert_eq!(led1.occlusion_notes[0].angle_id, 0);

        let led3 = &report.coverage[3];
        assert_eq!(led3.successful, 1);
        assert_eq!(led3.missing, 1);
    }

    #[test]
    fn clean_data_yields_clean_report() {
        let mut s0 = CaptureSession::new(SessionInfo::new("a", 1, 0));
        s0.push(det(0, 0, false, ""));
        let mut s90 = CaptureSession::new(SessionInfo::new("b", 1, 90));
        s90.push(det(0, 90, false, ""));

        let report = audit_sessions(&[s0, s90], &AuditConfig { min_detections: 2 });
        assert!(report.is_clean());
    }
}
