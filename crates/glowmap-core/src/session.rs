//! Capture session records and their durable JSON storage.
//!
//! One session per camera angle. The session file
//! `session_angle_<id>.json` is the sole input to triangulation and
//! auditing; any consumer discovers all such files in a directory and
//! reads the angle id from the name.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Schema version written into session files.
pub const SESSION_VERSION: &str = "0.1.0";

/// A single LED detection from one camera angle.
///
/// Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection2D {
    /// Index of the LED that was commanded on.
    pub led_index: u32,
    /// Azimuth (degrees) of the capturing camera on the rig circle.
    pub angle_id: u32,
    /// Detected pixel X (sub-pixel for the enhanced detector).
    pub pixel_x: f64,
    /// Detected pixel Y.
    pub pixel_y: f64,
    /// Peak brightness value in the processed frame.
    pub brightness: u8,
    /// True when the LED was not reliably visible (too dim or ambiguous).
    pub occluded: bool,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
    /// Human-readable detail, e.g. the occlusion reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

/// Session-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    /// Operator-chosen session name.
    pub name: String,
    /// ISO-8601 capture date.
    pub date: String,
    /// Number of LEDs the capture run iterated over.
    pub led_count: u32,
    /// Azimuth (degrees) of this camera angle.
    pub angle_id: u32,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl SessionInfo {
    /// Metadata for a new session started now.
    pub fn new(name: impl Into<String>, led_count: u32, angle_id: u32) -> Self {
        Self {
            name: name.into(),
            date: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            led_count,
            angle_id,
            description: String::new(),
        }
    }
}

/// One angle's worth of detections, append-only during a capture run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureSession {
    /// Schema version.
    pub version: String,
    /// Session metadata.
    pub session: SessionInfo,
    /// Per-LED detections in capture order.
    pub detections: Vec<Detection2D>,
}

/// Errors from session persistence and discovery.
#[derive(Debug)]
pub enum SessionError {
    /// File could not be read or written.
    Io { path: PathBuf, msg: String },
    /// File exists but does not parse as a session record.
    Malformed { path: PathBuf, msg: String },
    /// No `session_angle_*.json` files in the directory.
    NoSessionFiles(PathBuf),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, msg } => write!(f, "session file {}: {}", path.display(), msg),
            Self::Malformed { path, msg } => {
                write!(f, "malformed session file {}: {}", path.display(), msg)
            }
            Self::NoSessionFiles(dir) => write!(
                f,
                "no session_angle_*.json files found in {}",
                dir.display()
            ),
        }
    }
}

impl std::error::Error for SessionError {}

impl CaptureSession {
    /// Start an empty session for the given metadata.
    pub fn new(session: SessionInfo) -> Self {
        Self {
            version: SESSION_VERSION.to_string(),
            session,
            detections: Vec::new(),
        }
    }

    /// Append a detection, replacing any earlier entry for the same LED.
    ///
    /// A completed session holds at most one detection per
    /// (led_index, angle_id) pair; re-shooting an LED overwrites.
    pub fn push(&mut self, detection: Detection2D) {
        if let Some(existing) = self
            .detections
            .iter_mut()
            .find(|d| d.led_index == detection.led_index)
        {
            *existing = detection;
        } else {
            self.detections.push(detection);
        }
    }

    /// Number of non-occluded detections.
    pub fn successful_count(&self) -> usize {
        self.detections.iter().filter(|d| !d.occluded).count()
    }

    /// Number of occluded detections.
    pub fn occluded_count(&self) -> usize {
        self.detections.iter().filter(|d| d.occluded).count()
    }

    /// Canonical file name for this session's angle.
    pub fn file_name(&self) -> String {
        format!("session_angle_{}.json", self.session.angle_id)
    }

    /// Write the session record (and a plain-text summary sibling) into
    /// `dir`. Returns the session file path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, SessionError> {
        std::fs::create_dir_all(dir).map_err(|e| SessionError::Io {
            path: dir.to_path_buf(),
            msg: e.to_string(),
        })?;

        let path = dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self).map_err(|e| SessionError::Io {
            path: path.clone(),
            msg: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| SessionError::Io {
            path: path.clone(),
            msg: e.to_string(),
        })?;

        let summary_path = dir.join(format!(
            "session_angle_{}_summary.txt",
            self.session.angle_id
        ));
        std::fs::write(&summary_path, self.summary_text()).map_err(|e| SessionError::Io {
            path: summary_path,
            msg: e.to_string(),
        })?;

        Ok(path)
    }

    /// Load one session record; malformed content is fatal.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path).map_err(|e| SessionError::Io {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| SessionError::Malformed {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })
    }

    fn summary_text(&self) -> String {
        use fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "Capture Session Summary");
        let _ = writeln!(out, "{}", "=".repeat(60));
        let _ = writeln!(out);
        let _ = writeln!(out, "Session: {}", self.session.name);
        let _ = writeln!(out, "Date: {}", self.session.date);
        let _ = writeln!(out, "Angle: {}", self.session.angle_id);
        let _ = writeln!(out, "LED Count: {}", self.session.led_count);
        let _ = writeln!(out);
        let _ = writeln!(out, "Results:");
        let _ = writeln!(out, "  Successful: {}", self.successful_count());
        let _ = writeln!(out, "  Occluded: {}", self.occluded_count());

        if self.occluded_count() > 0 {
            let _ = writeln!(out);
            let _ = writeln!(out, "Occluded LEDs:");
            for d in self.detections.iter().filter(|d| d.occluded) {
                let _ = writeln!(out, "  LED {}: {}", d.led_index, d.notes);
            }
        }
        out
    }
}

/// Find every `session_angle_*.json` in `dir` and load it.
///
/// Interrupted runs persisted as `session_angle_<id>_partial.json` are
/// discovered too; when both a complete and a partial file exist for the
/// same angle, the complete one wins. Files whose angle id cannot be
/// parsed from the name are skipped with a warning; an empty result is an
/// error. Sessions come back sorted by angle id.
pub fn load_sessions(dir: &Path) -> Result<Vec<CaptureSession>, SessionError> {
    let entries = std::fs::read_dir(dir).map_err(|e| SessionError::Io {
        path: dir.to_path_buf(),
        msg: e.to_string(),
    })?;

    let mut found: Vec<(u32, bool, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("session_angle_") || !name.ends_with(".json") {
            continue;
        }
        let stem = name.trim_end_matches(".json");
        let (stem, partial) = match stem.strip_suffix("_partial") {
            Some(s) => (s, true),
            None => (stem, false),
        };
        match stem.rsplit('_').next().and_then(|s| s.parse::<u32>().ok()) {
            Some(angle) => found.push((angle, partial, path)),
            None => {
                tracing::warn!("could not parse angle id from {}, skipping", name);
            }
        }
    }

    if found.is_empty() {
        return Err(SessionError::NoSessionFiles(dir.to_path_buf()));
    }

    // Complete sessions sort ahead of partials for the same angle.
    found.sort_by_key(|(angle, partial, _)| (*angle, *partial));
    let mut sessions: Vec<CaptureSession> = Vec::with_capacity(found.len());
    let mut last_angle: Option<u32> = None;
    for (angle, partial, path) in found {
        if last_angle == Some(angle) {
            tracing::warn!(
                "{}: angle {} already loaded from a complete session, skipping",
                path.display(),
                angle
            );
            continue;
        }
        last_angle = Some(angle);
        if partial {
            tracing::warn!(
                "angle {} comes from an interrupted session ({})",
                angle,
                path.display()
            );
        }
        let session = CaptureSession::load(&path)?;
        if session.session.angle_id != angle {
            tracing::warn!(
                "{}: file name says angle {} but record says {}",
                path.display(),
                angle,
                session.session.angle_id
            );
        }
        tracing::info!(
            "loaded angle {}: {} detections",
            session.session.angle_id,
            session.detections.len()
        );
        sessions.push(session);
    }
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_detection(led: u32, angle: u32, occluded: bool) -> Detection2D {
        Detection2D {
            led_index: led,
            angle_id: angle,
            pixel_x: 120.5,
            pixel_y: 88.0,
            brightness: 240,
            occluded,
            confidence: if occluded { 0.0 } else { 0.9 },
            notes: String::new(),
        }
    }

    #[test]
    fn push_replaces_same_led() {
        let mut session = CaptureSession::new(SessionInfo::new("test", 10, 0));
        session.push(sample_detection(3, 0, true));
        session.push(sample_detection(3, 0, false));
        assert_eq!(session.detections.len(), 1);
        assert!(!session.detections[0].occluded);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = CaptureSession::new(SessionInfo::new("rt", 4, 90));
        session.push(sample_detection(0, 90, false));
        session.push(sample_detection(1, 90, true));

        let path = session.save(dir.path()).unwrap();
        assert!(path.ends_with("session_angle_90.json"));

        let loaded = CaptureSession::load(&path).unwrap();
        assert_eq!(loaded, session);

        // Summary sibling exists alongside the record.
        assert!(dir.path().join("session_angle_90_summary.txt").exists());
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_angle_0.json");
        std::fs::write(&path, "{not json").unwrap();
        match CaptureSession::load(&path) {
            Err(SessionError::Malformed { .. }) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn discovery_finds_and_sorts_sessions() {
        let dir = tempfile::tempdir().unwrap();
        for angle in [180u32, 0, 90] {
            CaptureSession::new(SessionInfo::new("d", 2, angle))
                .save(dir.path())
                .unwrap();
        }
        // Distractors that must not be picked up.
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();
        std::fs::write(dir.path().join("session_angle_x.json"), "{}").unwrap();

        let sessions = load_sessions(dir.path()).unwrap();
        let angles: Vec<u32> = sessions.iter().map(|s| s.session.angle_id).collect();
        assert_eq!(angles, vec![0, 90, 180]);
    }

    #[test]
    fn discovery_includes_interrupted_sessions() {
        let dir = tempfile::tempdir().unwrap();
        CaptureSession::new(SessionInfo::new("d", 2, 0))
            .save(dir.path())
            .unwrap();
        // An interrupted run, persisted the way the CLI writes it.
        let mut partial = CaptureSession::new(SessionInfo::new("d", 2, 90));
        partial.push(sample_detection(0, 90, false));
        std::fs::write(
            dir.path().join("session_angle_90_partial.json"),
            serde_json::to_string_pretty(&partial).unwrap(),
        )
        .unwrap();

        let sessions = load_sessions(dir.path()).unwrap();
        let angles: Vec<u32> = sessions.iter().map(|s| s.session.angle_id).collect();
        assert_eq!(angles, vec![0, 90]);
        assert_eq!(sessions[1].detections.len(), 1);
    }

    #[test]
    fn complete_session_shadows_partial_for_same_angle() {
        let dir = tempfile::tempdir().unwrap();
        let mut complete = CaptureSession::new(SessionInfo::new("d", 2, 0));
        complete.push(sample_detection(0, 0, false));
        complete.push(sample_detection(1, 0, false));
        complete.save(dir.path()).unwrap();

        let partial = CaptureSession::new(SessionInfo::new("d", 2, 0));
        std::fs::write(
            dir.path().join("session_angle_0_partial.json"),
            serde_json::to_string_pretty(&partial).unwrap(),
        )
        .unwrap();

        let sessions = load_sessions(dir.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].detections.len(), 2);
    }

    #[test]
    fn discovery_of_empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        match load_sessions(dir.path()) {
            Err(SessionError::NoSessionFiles(_)) => {}
            other => panic!("expected NoSessionFiles, got {other:?}"),
        }
    }
}
