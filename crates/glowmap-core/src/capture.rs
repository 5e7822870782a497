//! Single-angle capture orchestration.
//!
//! For one fixed camera angle the orchestrator walks every LED index
//! through light → settle → capture → detect → record → light-off. The
//! pipeline is strictly sequential: two lit LEDs would corrupt
//! brightest-pixel detection, so there is no overlap between LEDs.
//!
//! Failure tolerance: an actuator or frame failure marks that LED failed
//! and the loop advances — nothing is retried automatically, so one bad
//! link cannot stall the session. Cancellation is cooperative: the token
//! is checked between LEDs and the in-flight LED always finishes its
//! light-off cleanup. `all_off` runs on every exit path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::actuator::{LedActuator, Rgb};
use crate::detect::{brightness_channel, detect, ColorChannel, DetectConfig};
use crate::session::{CaptureSession, SessionInfo};

/// Source of camera frames. Opaque to the orchestrator; a failed capture
/// returns `None` and is handled as a per-LED failure.
pub trait FrameSource {
    fn capture_frame(&mut self) -> Option<RgbImage>;
}

/// Cooperative cancellation flag shared with a signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; honored after the in-flight LED finishes.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settling behavior between lighting an LED and trusting a frame.
#[derive(Debug, Clone, Copy)]
pub struct SettleConfig {
    /// Fixed minimum delay after the light command.
    pub min_delay: Duration,
    /// Additionally poll frames until brightness stabilizes.
    pub poll: bool,
    /// Maximum change between consecutive mean-brightness readings that
    /// still counts as stable.
    pub stable_delta: f64,
    /// Consecutive stable readings required.
    pub stable_samples: u32,
    /// Delay between polling samples, so consecutive readings see the
    /// sensor at different times instead of back-to-back.
    pub poll_interval: Duration,
    /// Give up polling after this long and treat the frame as settled.
    pub timeout: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            poll: false,
            stable_delta: 2.0,
            stable_samples: 3,
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Configuration for one capture run.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Number of LEDs to iterate over.
    pub led_count: u32,
    /// Azimuth (degrees) of this camera angle.
    pub angle_id: u32,
    /// Color each LED is commanded with; also drives the detector's
    /// channel filter.
    pub led_color: Rgb,
    /// Commanded brightness.
    pub led_brightness: u8,
    /// Resume point: first LED index to capture.
    pub start_led: u32,
    /// Frames to capture and discard before the loop, letting exposure
    /// adapt.
    pub warmup_frames: u32,
    /// Settling behavior.
    pub settle: SettleConfig,
    /// When set, persist the raw and color-filtered frame per LED here.
    pub save_images: Option<PathBuf>,
    /// Detector thresholds.
    pub detect: DetectConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            led_count: 200,
            angle_id: 0,
            led_color: Rgb::WHITE,
            led_brightness: 255,
            start_led: 0,
            warmup_frames: 5,
            settle: SettleConfig::default(),
            save_images: None,
            detect: DetectConfig::default(),
        }
    }
}

/// Per-run outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub successful: u32,
    pub occluded: u32,
    pub failed: u32,
    /// True when the run stopped early on a cancellation request.
    pub cancelled: bool,
}

/// A finished (or interrupted) capture run.
#[derive(Debug, Clone)]
pub struct CaptureRun {
    pub session: CaptureSession,
    pub summary: CaptureSummary,
}

/// Errors that abort a capture run before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The actuator did not answer the initial health check.
    ActuatorUnreachable,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActuatorUnreachable => write!(f, "LED actuator is unreachable"),
        }
    }
}

impl std::error::Error for CaptureError {}

fn mean_brightness(frame: &RgbImage) -> f64 {
    let sum: u64 = frame
        .pixels()
        .map(|p| p.0[0] as u64 + p.0[1] as u64 + p.0[2] as u64)
        .sum();
    sum as f64 / (frame.width() as f64 * frame.height() as f64 * 3.0)
}

/// Wait for the LED and exposure to stabilize.
///
/// Always sleeps the fixed minimum delay; with polling enabled, captures
/// frames until several consecutive mean-brightness readings agree within
/// `stable_delta`. A timeout is "settled enough", not a failure.
fn wait_for_settle(frames: &mut dyn FrameSource, cfg: &SettleConfig) {
    std::thread::sleep(cfg.min_delay);
    if !cfg.poll {
        return;
    }

    let deadline = Instant::now() + cfg.timeout;
    let mut last: Option<f64> = None;
    let mut stable: u32 = 0;
    while Instant::now() < deadline {
        let Some(frame) = frames.capture_frame() else {
            return;
        };
        let reading = mean_brightness(&frame);
        if let Some(prev) = last {
            if (reading - prev).abs() <= cfg.stable_delta {
                stable += 1;
                if stable >= cfg.stable_samples {
                    return;
                }
            } else {
                stable = 0;
            }
        }
        last = Some(reading);
        std::thread::sleep(cfg.poll_interval);
    }
    tracing::debug!("settle polling timed out, proceeding anyway");
}

fn save_frames(frame: &RgbImage, color: Rgb, led_index: u32, dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!("cannot create image dir {}: {}", dir.display(), e);
        return;
    }
    let raw_path = dir.join(format!("led_{:03}.png", led_index));
    if let Err(e) = frame.save(&raw_path) {
        tracing::warn!("failed to save {}: {}", raw_path.display(), e);
    }
    let filtered = brightness_channel(frame, ColorChannel::from_rgb(color));
    let filtered_path = dir.join(format!("led_{:03}_filtered.png", led_index));
    if let Err(e) = filtered.save(&filtered_path) {
        tracing::warn!("failed to save {}: {}", filtered_path.display(), e);
    }
}

/// Run one single-angle capture session.
///
/// Returns the session record and outcome counts; on cancellation the
/// record holds everything captured so far and `summary.cancelled` is set
/// so the caller can decide whether to persist the partial session.
pub fn run_capture(
    actuator: &mut dyn LedActuator,
    frames: &mut dyn FrameSource,
    config: &CaptureConfig,
    info: SessionInfo,
    cancel: &CancelToken,
) -> Result<CaptureRun, CaptureError> {
    if !actuator.connect() {
        return Err(CaptureError::ActuatorUnreachable);
    }
    actuator.all_off();

    for _ in 0..config.warmup_frames {
        frames.capture_frame();
        std::thread::sleep(config.settle.min_delay);
    }

    let mut session = CaptureSession::new(info);
    let mut summary = CaptureSummary::default();

    for led_index in config.start_led..config.led_count {
        if cancel.is_cancelled() {
            tracing::warn!("capture cancelled before LED {}", led_index);
            summary.cancelled = true;
            break;
        }

        let progress = (led_index + 1) as f64 / config.led_count as f64 * 100.0;
        if !actuator.light(led_index, config.led_color, config.led_brightness) {
            tracing::warn!("[{:5.1}%] LED {}: light command failed", progress, led_index);
            summary.failed += 1;
            continue;
        }

        wait_for_settle(frames, &config.settle);

        let Some(frame) = frames.capture_frame() else {
            tracing::warn!("[{:5.1}%] LED {}: frame capture failed", progress, led_index);
            summary.failed += 1;
            // Cleanup must not be skipped on a failed capture.
            actuator.turn_off(led_index);
            continue;
        };

        let detection = detect(
            &frame,
            led_index,
            config.angle_id,
            Some(config.led_color),
            &config.detect,
        );

        if let Some(dir) = &config.save_images {
            save_frames(&frame, config.led_color, led_index, dir);
        }

        actuator.turn_off(led_index);

        if detection.occluded {
            tracing::info!(
                "[{:5.1}%] LED {}: occluded ({})",
                progress,
                led_index,
                detection.notes
            );
            summary.occluded += 1;
        } else {
            tracing::info!(
                "[{:5.1}%] LED {}: px({:.1}, {:.1}) conf={:.2}",
                progress,
                led_index,
                detection.pixel_x,
                detection.pixel_y,
                detection.confidence
            );
            summary.successful += 1;
        }
        session.push(detection);
    }

    // Session end always releases the installation, error paths included.
    if !actuator.all_off() {
        tracing::warn!("final all-off command failed");
    }

    tracing::info!(
        "capture complete: {} ok, {} occluded, {} failed{}",
        summary.successful,
        summary.occluded,
        summary.failed,
        if summary.cancelled { " (cancelled)" } else { "" }
    );

    Ok(CaptureRun { session, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    /// Shared "which LED is lit" state between the scripted actuator and
    /// the synthetic frame source.
    type Lit = Rc<RefCell<Option<u32>>>;

    struct ScriptedActuator {
        lit: Lit,
        fail_light: HashSet<u32>,
        calls: Vec<String>,
        reachable: bool,
    }

    impl ScriptedActuator {
        fn new(lit: Lit) -> Self {
            Self {
                lit,
                fail_light: HashSet::new(),
                calls: Vec::new(),
                reachable: true,
            }
        }
    }

    impl LedActuator for ScriptedActuator {
        fn connect(&mut self) -> bool {
            self.calls.push("connect".into());
            self.reachable
        }
        fn light(&mut self, index: u32, _color: Rgb, _brightness: u8) -> bool {
            self.calls.push(format!("light {}", index));
            if self.fail_light.contains(&index) {
                return false;
            }
            *self.lit.borrow_mut() = Some(index);
            true
        }
        fn turn_off(&mut self, index: u32) -> bool {
            self.calls.push(format!("off {}", index));
            *self.lit.borrow_mut() = None;
            true
        }
        fn all_off(&mut self) -> bool {
            self.calls.push("all_off".into());
            *self.lit.borrow_mut() = None;
            true
        }
        fn health(&mut self) -> bool {
            self.reachable
        }
    }

    /// Renders a dark frame with a bright pixel wherever the lit LED is.
    struct SyntheticFrameSource {
        lit: Lit,
        led_pixels: Vec<(u32, u32)>,
        cancel_after: Option<(u32, CancelToken)>,
        captures: u32,
    }

    impl FrameSource for SyntheticFrameSource {
        fn capture_frame(&mut self) -> Option<RgbImage> {
            self.captures += 1;
            if let Some((limit, token)) = &self.cancel_after {
                if self.captures >= *limit {
                    token.cancel();
                }
            }
            let mut frame = RgbImage::from_pixel(64, 48, image::Rgb([5, 5, 5]));
            if let Some(led) = *self.lit.borrow() {
                let (x, y) = self.led_pixels[led as usize];
                frame.put_pixel(x, y, image::Rgb([255, 255, 255]));
            }
            Some(frame)
        }
    }

    fn fast_config(led_count: u32) -> CaptureConfig {
        CaptureConfig {
            led_count,
            warmup_frames: 0,
            settle: SettleConfig {
                min_delay: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn harness(led_count: u32) -> (ScriptedActuator, SyntheticFrameSource) {
        let lit: Lit = Rc::new(RefCell::new(None));
        let actuator = ScriptedActuator::new(lit.clone());
        let frames = SyntheticFrameSource {
            lit,
            led_pixels: (0..led_count).map(|i| (10 + i * 3, 20)).collect(),
            cancel_after: None,
            captures: 0,
        };
        (actuator, frames)
    }

    #[test]
    fn full_run_records_every_led() {
        let (mut actuator, mut frames) = harness(4);
        let run = run_capture(
            &mut actuator,
            &mut frames,
            &fast_config(4),
            SessionInfo::new("t", 4, 0),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(run.summary.successful, 4);
        assert_eq!(run.summary.failed, 0);
        assert!(!run.summary.cancelled);
        assert_eq!(run.session.detections.len(), 4);
        for (i, det) in run.session.detections.iter().enumerate() {
            assert_eq!(det.led_index, i as u32);
            assert_eq!(det.pixel_x, (10 + i as u32 * 3) as f64);
            assert!(!det.occluded);
        }
        // Every lit LED was turned off, and the run ended with all-off.
        assert_eq!(actuator.calls.last().unwrap(), "all_off");
    }

    #[test]
    fn light_failure_skips_without_retry() {
        let (mut actuator, mut frames) = harness(3);
        actuator.fail_light.insert(1);

        let run = run_capture(
            &mut actuator,
            &mut frames,
            &fast_config(3),
            SessionInfo::new("t", 3, 0),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(run.summary.failed, 1);
        assert_eq!(run.summary.successful, 2);
        assert_eq!(run.session.detections.len(), 2);
        // Exactly one attempt for the bad LED.
        let attempts = actuator.calls.iter().filter(|c| *c == "light 1").count();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn unreachable_actuator_aborts() {
        let (mut actuator, mut frames) = harness(2);
        actuator.reachable = false;
        let result = run_capture(
            &mut actuator,
            &mut frames,
            &fast_config(2),
            SessionInfo::new("t", 2, 0),
            &CancelToken::new(),
        );
        assert_eq!(result.unwrap_err(), CaptureError::ActuatorUnreachable);
    }

    #[test]
    fn cancellation_keeps_partial_session_and_cleans_up() {
        let token = CancelToken::new();
        let (mut actuator, mut frames) = harness(5);
        // Cancel during the first LED's capture; the LED in progress must
        // still complete and be recorded.
        frames.cancel_after = Some((1, token.clone()));

        let run = run_capture(
            &mut actuator,
            &mut frames,
            &fast_config(5),
            SessionInfo::new("t", 5, 0),
            &token,
        )
        .unwrap();

        assert!(run.summary.cancelled);
        assert_eq!(run.session.detections.len(), 1);
        assert_eq!(actuator.calls.last().unwrap(), "all_off");
        // LED 0 was individually turned off before the cancellation took
        // effect.
        assert!(actuator.calls.contains(&"off 0".to_string()));
    }

    #[test]
    fn start_led_resumes_mid_string() {
        let (mut actuator, mut frames) = harness(4);
        let config = CaptureConfig {
            start_led: 2,
            ..fast_config(4)
        };
        let run = run_capture(
            &mut actuator,
            &mut frames,
            &config,
            SessionInfo::new("t", 4, 0),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(run.session.detections.len(), 2);
        assert_eq!(run.session.detections[0].led_index, 2);
    }

    #[test]
    fn settle_polling_stops_on_stable_brightness() {
        let lit: Lit = Rc::new(RefCell::new(Some(0)));
        let mut frames = SyntheticFrameSource {
            lit,
            led_pixels: vec![(10, 10)],
            cancel_after: None,
            captures: 0,
        };
        let cfg = SettleConfig {
            min_delay: Duration::ZERO,
            poll: true,
            stable_delta: 2.0,
            stable_samples: 3,
            poll_interval: Duration::ZERO,
            timeout: Duration::from_secs(5),
        };
        wait_for_settle(&mut frames, &cfg);
        // Constant output: one baseline read plus three stable readings.
        assert_eq!(frames.captures, 4);
    }

    #[test]
    fn settle_polling_waits_between_samples() {
        let lit: Lit = Rc::new(RefCell::new(Some(0)));
        let mut frames = SyntheticFrameSource {
            lit,
            led_pixels: vec![(10, 10)],
            cancel_after: None,
            captures: 0,
        };
        let cfg = SettleConfig {
            min_delay: Duration::ZERO,
            poll: true,
            stable_delta: 2.0,
            stable_samples: 3,
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        };
        let start = Instant::now();
        wait_for_settle(&mut frames, &cfg);
        // Three sleeps separate the four samples.
        assert_eq!(frames.captures, 4);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
