//! glowmap CLI — capture, triangulate, audit and export LED positions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use glowmap_core::actuator::{HttpActuator, LedActuator, Rgb};
use glowmap_core::audit::{audit_sessions, AuditConfig};
use glowmap_core::capture::{
    run_capture, CancelToken, CaptureConfig, FrameSource, SettleConfig,
};
use glowmap_core::detect::{detect, detect_enhanced, DetectConfig};
use glowmap_core::export::export_position_map;
use glowmap_core::rig::CameraRigModel;
use glowmap_core::session::{load_sessions, SessionInfo};
use glowmap_core::triangulate::triangulate_all;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "glowmap")]
#[command(about = "Map the 3D positions of an addressable LED installation from multi-angle photos")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single-angle capture session against a LED control server.
    Capture(CliCaptureArgs),

    /// Detect the lit LED in a single image.
    Detect(CliDetectArgs),

    /// Triangulate all captured angles into a normalized position map.
    Triangulate(CliTriangulateArgs),

    /// Audit multi-angle coverage of captured sessions.
    Audit(CliAuditArgs),

    /// Exercise the LED control server: health, status, one blink.
    ActuatorTest(CliActuatorArgs),
}

#[derive(Debug, Clone, Args)]
struct CliActuatorArgs {
    #[command(flatten)]
    conn: CliActuatorConn,

    /// LED index to blink.
    #[arg(long, default_value = "0")]
    index: u32,

    /// Blink color as r,g,b.
    #[arg(long, default_value = "255,255,255")]
    color: Rgb,

    /// Blink brightness.
    #[arg(long, default_value = "255")]
    brightness: u8,
}

#[derive(Debug, Clone, Args)]
struct CliCaptureArgs {
    #[command(flatten)]
    actuator: CliActuatorConn,

    /// Directory of frames consumed in sorted filename order, standing in
    /// for a live camera feed.
    #[arg(long)]
    frames: PathBuf,

    /// Directory to write the session record into.
    #[arg(long, default_value = "sessions")]
    out: PathBuf,

    /// Session name.
    #[arg(long, default_value = "capture")]
    name: String,

    /// Free-form session description recorded in the session file.
    #[arg(long)]
    description: Option<String>,

    /// Camera azimuth for this session (degrees on the rig circle).
    #[arg(long)]
    angle: u32,

    /// Number of LEDs in the installation.
    #[arg(long, default_value = "200")]
    led_count: u32,

    /// Resume from this LED index.
    #[arg(long, default_value = "0")]
    start_led: u32,

    /// LED color as r,g,b (also selects the detector's channel filter).
    #[arg(long, default_value = "255,255,255")]
    color: Rgb,

    /// LED brightness.
    #[arg(long, default_value = "255")]
    brightness: u8,

    /// Frames to discard before the loop while exposure adapts.
    #[arg(long, default_value = "0")]
    warmup_frames: u32,

    /// Fixed delay after each light command, in milliseconds.
    #[arg(long, default_value = "50")]
    settle_ms: u64,

    /// Poll frames until brightness stabilizes instead of trusting the
    /// fixed delay alone.
    #[arg(long)]
    poll_settle: bool,

    /// Minimum peak brightness for a detection.
    #[arg(long, default_value = "200")]
    brightness_threshold: u8,

    /// Near-peak pixel count above which a frame is ambiguous.
    #[arg(long, default_value = "100")]
    ambiguity_threshold: u32,

    /// Also save the raw and color-filtered frame per LED here.
    #[arg(long)]
    save_images: Option<PathBuf>,

    /// On interruption, drop the partial session instead of writing it
    /// with a _partial suffix.
    #[arg(long)]
    discard_partial: bool,
}

#[derive(Debug, Clone, Args)]
struct CliActuatorConn {
    /// LED control server host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// LED control server port.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

impl CliActuatorConn {
    fn open(&self) -> HttpActuator {
        HttpActuator::new(&self.host, self.port, Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, Args)]
struct CliDetectArgs {
    /// Path to the input image.
    #[arg(long)]
    image: PathBuf,

    /// LED index to stamp into the detection record.
    #[arg(long, default_value = "0")]
    led_index: u32,

    /// Camera azimuth to stamp into the detection record.
    #[arg(long, default_value = "0")]
    angle: u32,

    /// Commanded LED color as r,g,b; enables the channel filter.
    #[arg(long)]
    color: Option<Rgb>,

    /// Use the enhanced detector (blur + largest-region centroid).
    #[arg(long)]
    enhanced: bool,

    /// Background frame (no LED lit) to subtract; enhanced detector only.
    #[arg(long)]
    background: Option<PathBuf>,

    /// Minimum peak brightness for a detection.
    #[arg(long, default_value = "200")]
    brightness_threshold: u8,

    /// Near-peak pixel count above which a frame is ambiguous.
    #[arg(long, default_value = "100")]
    ambiguity_threshold: u32,

    /// Gaussian sigma for the enhanced detector.
    #[arg(long, default_value = "1.0")]
    blur_sigma: f32,

    /// Write the detection record here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CliTriangulateArgs {
    /// Directory containing session_angle_*.json files.
    #[arg(long, default_value = "sessions")]
    sessions: PathBuf,

    /// Path to write the position map (JSON). A detailed sibling lands
    /// next to it.
    #[arg(long, default_value = "position_map.json")]
    out: PathBuf,

    /// Installation name recorded in the map metadata.
    #[arg(long, default_value = "installation")]
    name: String,

    #[command(flatten)]
    rig: CliRigArgs,
}

#[derive(Debug, Clone, Args)]
struct CliRigArgs {
    /// Camera distance from the installation center, in meters.
    #[arg(long, default_value = "2.0")]
    camera_distance: f64,

    /// Frame width in pixels.
    #[arg(long, default_value = "640")]
    image_width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value = "480")]
    image_height: u32,

    /// Horizontal field of view in degrees.
    #[arg(long, default_value = "60.0")]
    fov: f64,
}

impl CliRigArgs {
    fn to_core(&self) -> CameraRigModel {
        CameraRigModel::new(
            self.camera_distance,
            self.image_width,
            self.image_height,
            self.fov,
        )
    }
}

#[derive(Debug, Clone, Args)]
struct CliAuditArgs {
    /// Directory containing session_angle_*.json files.
    #[arg(long, default_value = "sessions")]
    sessions: PathBuf,

    /// Minimum clean detections per LED for reliable triangulation.
    #[arg(long, default_value = "4")]
    min_detections: usize,

    /// Also write the full report as JSON.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capture(args) => run_capture_cmd(&args),
        Commands::Detect(args) => run_detect_cmd(&args),
        Commands::Triangulate(args) => run_triangulate_cmd(&args),
        Commands::Audit(args) => run_audit_cmd(&args),
        Commands::ActuatorTest(args) => run_actuator_test(&args),
    }
}

// ── capture ────────────────────────────────────────────────────────────

/// Frame source backed by a directory of image files, consumed once each
/// in sorted filename order.
struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectoryFrameSource {
    fn open(dir: &Path) -> CliResult<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| -> CliError {
                format!("cannot read frame directory {}: {}", dir.display(), e).into()
            })?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("png") | Some("jpg") | Some("jpeg")
                )
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(format!("no frames found in {}", dir.display()).into());
        }
        tracing::info!("{} frames queued from {}", files.len(), dir.display());
        Ok(Self { files, next: 0 })
    }
}

impl FrameSource for DirectoryFrameSource {
    fn capture_frame(&mut self) -> Option<image::RgbImage> {
        let path = self.files.get(self.next)?;
        self.next += 1;
        match image::open(path) {
            Ok(img) => Some(img.to_rgb8()),
            Err(e) => {
                tracing::warn!("failed to load frame {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn run_capture_cmd(args: &CliCaptureArgs) -> CliResult<()> {
    let mut actuator = args.actuator.open();
    let mut frames = DirectoryFrameSource::open(&args.frames)?;

    let config = CaptureConfig {
        led_count: args.led_count,
        angle_id: args.angle,
        led_color: args.color,
        led_brightness: args.brightness,
        start_led: args.start_led,
        warmup_frames: args.warmup_frames,
        settle: SettleConfig {
            min_delay: Duration::from_millis(args.settle_ms),
            poll: args.poll_settle,
            ..Default::default()
        },
        save_images: args.save_images.clone(),
        detect: DetectConfig {
            brightness_threshold: args.brightness_threshold,
            ambiguity_threshold: args.ambiguity_threshold,
            ..Default::default()
        },
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received, finishing the current LED");
            cancel.cancel();
        })?;
    }

    let mut info = SessionInfo::new(&args.name, args.led_count, args.angle);
    if let Some(description) = &args.description {
        info.description = description.clone();
    }
    let run = run_capture(&mut actuator, &mut frames, &config, info, &cancel)?;

    if run.summary.cancelled {
        if args.discard_partial {
            tracing::warn!(
                "cancelled; discarding partial session ({} detections)",
                run.session.detections.len()
            );
            return Ok(());
        }
        std::fs::create_dir_all(&args.out)?;
        let path = args
            .out
            .join(format!("session_angle_{}_partial.json", args.angle));
        std::fs::write(&path, serde_json::to_string_pretty(&run.session)?)?;
        tracing::warn!("partial session written to {}", path.display());
        return Ok(());
    }

    let path = run.session.save(&args.out)?;
    tracing::info!("session written to {}", path.display());
    Ok(())
}

// ── detect ─────────────────────────────────────────────────────────────

fn run_detect_cmd(args: &CliDetectArgs) -> CliResult<()> {
    let frame = image::open(&args.image)
        .map_err(|e| -> CliError {
            format!("failed to open image {}: {}", args.image.display(), e).into()
        })?
        .to_rgb8();

    let config = DetectConfig {
        brightness_threshold: args.brightness_threshold,
        ambiguity_threshold: args.ambiguity_threshold,
        blur_sigma: args.blur_sigma,
    };

    let detection = if args.enhanced {
        let background = match &args.background {
            Some(path) => Some(
                image::open(path)
                    .map_err(|e| -> CliError {
                        format!("failed to open background {}: {}", path.display(), e).into()
                    })?
                    .to_rgb8(),
            ),
            None => None,
        };
        detect_enhanced(
            &frame,
            args.led_index,
            args.angle,
            background.as_ref(),
            &config,
        )
    } else {
        detect(&frame, args.led_index, args.angle, args.color, &config)
    };

    let json = serde_json::to_string_pretty(&detection)?;
    match &args.out {
        Some(path) => {
            std::fs::write(path, &json)?;
            tracing::info!("detection written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

// ── triangulate ────────────────────────────────────────────────────────

fn run_triangulate_cmd(args: &CliTriangulateArgs) -> CliResult<()> {
    let sessions = load_sessions(&args.sessions)?;
    let angles: Vec<u32> = sessions.iter().map(|s| s.session.angle_id).collect();
    tracing::info!("{} angles loaded: {:?}", angles.len(), angles);

    let rig = args.rig.to_core();
    let positions = triangulate_all(&sessions, &rig);

    let maps = export_position_map(positions, &args.name, &angles);
    maps.save(&args.out)?;

    println!(
        "{} LEDs triangulated, {} missing; map written to {}",
        maps.map.metadata.successful_leds,
        maps.map.metadata.failed_leds,
        args.out.display()
    );
    Ok(())
}

// ── audit ──────────────────────────────────────────────────────────────

fn run_audit_cmd(args: &CliAuditArgs) -> CliResult<()> {
    let sessions = load_sessions(&args.sessions)?;
    let report = audit_sessions(
        &sessions,
        &AuditConfig {
            min_detections: args.min_detections,
        },
    );

    println!("Coverage audit: {} LEDs over {} angles {:?}", report.led_count, report.num_angles, report.angles);
    if report.is_clean() {
        println!("All LEDs have at least {} clean detections.", report.min_detections);
    } else {
        if !report.problematic.is_empty() {
            println!(
                "\n{} LEDs below {} clean detections:",
                report.problematic.len(),
                report.min_detections
            );
            for &led in &report.problematic {
                let c = &report.coverage[led as usize];
                println!(
                    "  LED {:4}: {} clean, {} occluded, {} missing (seen at {:?})",
                    led, c.successful, c.occluded, c.missing, c.angles_detected
                );
            }
        }
        if !report.fully_missing.is_empty() {
            println!(
                "\n{} LEDs never detected at any angle: {:?}",
                report.fully_missing.len(),
                report.fully_missing
            );
        }
    }

    if let Some(path) = &args.out {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        tracing::info!("audit report written to {}", path.display());
    }
    Ok(())
}

// ── actuator-test ──────────────────────────────────────────────────────

fn run_actuator_test(args: &CliActuatorArgs) -> CliResult<()> {
    let mut actuator = args.conn.open();

    if !actuator.connect() {
        return Err(format!(
            "LED control server at {}:{} is not healthy",
            args.conn.host, args.conn.port
        )
        .into());
    }
    println!("health: ok");

    if let Some(status) = actuator.status() {
        println!("status: {}", serde_json::to_string_pretty(&status)?);
    }

    println!(
        "blinking LED {} with color {} at brightness {}",
        args.index, args.color, args.brightness
    );
    if !actuator.light(args.index, args.color, args.brightness) {
        return Err("light command failed".into());
    }
    std::thread::sleep(Duration::from_millis(500));
    if !actuator.turn_off(args.index) {
        return Err("turn-off command failed".into());
    }
    actuator.all_off();
    println!("done");
    Ok(())
}
