//! glowmap-core — algorithms for LED installation 3D position calibration.
//!
//! Maps the physical layout of an addressable LED installation by lighting
//! one LED at a time and photographing it from several known camera
//! azimuths. The pipeline stages are:
//!
//! 1. **Detect** – locate the lit LED in a frame (color-filtered peak, or
//!    background-subtracted blob centroid), with occlusion flagging.
//! 2. **Capture** – orchestrate an LED actuator and a frame source over a
//!    full strand at one azimuth, producing a per-angle session file.
//! 3. **Rig** – camera geometry: pixel to world-space ray, azimuth to
//!    camera position, and the inverse projection used by tests.
//! 4. **Triangulate** – least-squares ray intersection across azimuths.
//! 5. **Audit** – multi-angle coverage report, separating under-observed
//!    LEDs from ones never seen at all.
//! 6. **Export** – normalized dense position map plus a detailed sibling
//!    with per-LED confidence and view counts.

pub mod actuator;
pub mod audit;
pub mod capture;
pub mod detect;
pub mod export;
pub mod rig;
pub mod session;
pub mod triangulate;

pub use actuator::{HttpActuator, LedActuator, Rgb};
pub use audit::{audit_sessions, AuditConfig, AuditReport};
pub use capture::{run_capture, CancelToken, CaptureConfig, CaptureRun, FrameSource};
pub use detect::{detect, detect_enhanced, DetectConfig};
pub use export::{export_position_map, normalize_positions, ExportedMaps, PositionMap};
pub use rig::{CameraRigModel, Ray};
pub use session::{load_sessions, CaptureSession, Detection2D, SessionInfo};
pub use triangulate::{triangulate_all, triangulate_led, Position3D};
