//! Per-frame LED localization.
//!
//! The detector finds the lit LED in a single camera frame by locating the
//! global brightness maximum, with an optional color-channel filter to
//! suppress ambient white light and an ambiguity check that flags frames
//! with more than one plausible light source. The enhanced variant adds
//! background subtraction, noise blur and a connected-region centroid for
//! sub-pixel stability when the LED spans several pixels.
//!
//! Occlusion is a valid outcome here, not an error: downstream stages
//! exclude occluded detections from triangulation and surface them in the
//! audit.

use image::{GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::actuator::Rgb;
use crate::session::Detection2D;

/// Detector thresholds.
#[derive(Debug, Clone, Copy)]
pub struct DetectConfig {
    /// Minimum peak brightness for a detection; below this the LED is
    /// reported occluded.
    pub brightness_threshold: u8,
    /// Maximum number of near-peak pixels before the frame is considered
    /// ambiguous (multiple candidate light sources).
    pub ambiguity_threshold: u32,
    /// Gaussian sigma for noise suppression in the enhanced detector.
    pub blur_sigma: f32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            brightness_threshold: 200,
            ambiguity_threshold: 100,
            blur_sigma: 1.0,
        }
    }
}

/// Which RGB channel dominates the commanded LED color.
///
/// Selected once per call; each variant dispatches to a fixed
/// channel-arithmetic routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorChannel {
    Red,
    Green,
    Blue,
    /// White or mixed color; falls back to standard luminance.
    Mixed,
}

impl ColorChannel {
    /// Classify a commanded color. A channel dominates only when it is
    /// strictly greater than both others.
    pub fn from_rgb(color: Rgb) -> Self {
        if color.r > color.g && color.r > color.b {
            Self::Red
        } else if color.g > color.r && color.g > color.b {
            Self::Green
        } else if color.b > color.r && color.b > color.g {
            Self::Blue
        } else {
            Self::Mixed
        }
    }
}

/// Reduce an RGB frame to one brightness channel.
///
/// For a dominant channel the value is `dominant − avg(other two)`,
/// clipped to [0, 255], which rejects ambient white light (white scores
/// near zero). `Mixed` uses standard luminance.
pub fn brightness_channel(frame: &RgbImage, channel: ColorChannel) -> GrayImage {
    let (w, h) = frame.dimensions();
    let mut gray = GrayImage::new(w, h);
    for (x, y, px) in frame.enumerate_pixels() {
        let [r, g, b] = px.0;
        let (r, g, b) = (r as f32, g as f32, b as f32);
        let v = match channel {
            ColorChannel::Red => r - (g + b) / 2.0,
            ColorChannel::Green => g - (r + b) / 2.0,
            ColorChannel::Blue => b - (r + g) / 2.0,
            ColorChannel::Mixed => 0.299 * r + 0.587 * g + 0.114 * b,
        };
        gray.put_pixel(x, y, Luma([v.clamp(0.0, 255.0) as u8]));
    }
    gray
}

/// Global brightness maximum and its pixel coordinate.
fn find_peak(gray: &GrayImage) -> (u32, u32, u8) {
    let mut best = (0u32, 0u32, 0u8);
    for (x, y, px) in gray.enumerate_pixels() {
        if px[0] > best.2 {
            best = (x, y, px[0]);
        }
    }
    best
}

/// Count pixels within 95% of the peak brightness.
fn near_peak_count(gray: &GrayImage, max_val: u8) -> u32 {
    let cutoff = max_val as f32 * 0.95;
    gray.pixels().filter(|p| p[0] as f32 > cutoff).count() as u32
}

fn occluded_detection(
    led_index: u32,
    angle_id: u32,
    brightness: u8,
    confidence: f64,
    notes: String,
) -> Detection2D {
    Detection2D {
        led_index,
        angle_id,
        pixel_x: 0.0,
        pixel_y: 0.0,
        brightness,
        occluded: true,
        confidence,
        notes,
    }
}

/// Locate the lit LED in a frame using the brightest-pixel method.
///
/// `led_color` is the color the LED was commanded with; when one of its
/// RGB channels dominates, detection runs on that channel's ambient-
/// rejecting difference image instead of plain luminance.
pub fn detect(
    frame: &RgbImage,
    led_index: u32,
    angle_id: u32,
    led_color: Option<Rgb>,
    config: &DetectConfig,
) -> Detection2D {
    let channel = led_color.map_or(ColorChannel::Mixed, ColorChannel::from_rgb);
    let gray = brightness_channel(frame, channel);
    classify_peak(&gray, led_index, angle_id, config)
}

fn classify_peak(
    gray: &GrayImage,
    led_index: u32,
    angle_id: u32,
    config: &DetectConfig,
) -> Detection2D {
    let (x, y, max_val) = find_peak(gray);

    if max_val < config.brightness_threshold {
        return occluded_detection(
            led_index,
            angle_id,
            max_val,
            0.0,
            "below brightness threshold".to_string(),
        );
    }

    let bright_count = near_peak_count(gray, max_val);
    if bright_count > config.ambiguity_threshold {
        let mut det = occluded_detection(
            led_index,
            angle_id,
            max_val,
            0.5,
            format!("ambiguous detection: {} bright pixels", bright_count),
        );
        det.pixel_x = x as f64;
        det.pixel_y = y as f64;
        return det;
    }

    let confidence =
        (1.0 - bright_count as f64 / config.ambiguity_threshold as f64).clamp(0.0, 1.0);

    Detection2D {
        led_index,
        angle_id,
        pixel_x: x as f64,
        pixel_y: y as f64,
        brightness: max_val,
        occluded: false,
        confidence,
        notes: String::new(),
    }
}

/// Subtract a background frame (clipped at zero) from a lit frame.
fn subtract_background(frame: &RgbImage, background: &RgbImage) -> RgbImage {
    let (w, h) = frame.dimensions();
    let mut out = RgbImage::new(w, h);
    for (x, y, px) in frame.enumerate_pixels() {
        let bg = background.get_pixel(x, y);
        let diff = [
            px.0[0].saturating_sub(bg.0[0]),
            px.0[1].saturating_sub(bg.0[1]),
            px.0[2].saturating_sub(bg.0[2]),
        ];
        out.put_pixel(x, y, image::Rgb(diff));
    }
    out
}

/// Gaussian-blur a `GrayImage` through an f32 buffer.
fn blur_gray(gray: &GrayImage, sigma: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut f = image::ImageBuffer::<Luma<f32>, Vec<f32>>::new(w, h);
    for (x, y, px) in gray.enumerate_pixels() {
        f.put_pixel(x, y, Luma([px[0] as f32]));
    }
    let blurred = imageproc::filter::gaussian_blur_f32(&f, sigma);
    let mut out = GrayImage::new(w, h);
    for (x, y, px) in blurred.enumerate_pixels() {
        out.put_pixel(x, y, Luma([px[0].clamp(0.0, 255.0).round() as u8]));
    }
    out
}

/// Centroid of the largest bright connected region.
///
/// Thresholds at 90% of the peak, labels 8-connected components and
/// returns the first-moment centroid of the largest one together with the
/// total number of regions.
fn largest_region_centroid(gray: &GrayImage, max_val: u8) -> Option<(f64, f64, usize)> {
    let cutoff = (max_val as f32 * 0.9) as u8;
    let (w, h) = gray.dimensions();
    let mut mask = GrayImage::new(w, h);
    for (x, y, px) in gray.enumerate_pixels() {
        mask.put_pixel(x, y, Luma([if px[0] >= cutoff { 255u8 } else { 0 }]));
    }

    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    // label -> (pixel count, sum_x, sum_y)
    let mut regions: std::collections::HashMap<u32, (u64, f64, f64)> =
        std::collections::HashMap::new();
    for (x, y, px) in labels.enumerate_pixels() {
        let label = px[0];
        if label == 0 {
            continue;
        }
        let entry = regions.entry(label).or_insert((0, 0.0, 0.0));
        entry.0 += 1;
        entry.1 += x as f64;
        entry.2 += y as f64;
    }

    let num_regions = regions.len();
    let (count, sx, sy) = regions.into_values().max_by_key(|r| r.0)?;
    Some((sx / count as f64, sy / count as f64, num_regions))
}

/// Enhanced LED detection with background subtraction and a sub-pixel
/// region centroid.
///
/// When `background` is a frame captured with no LED lit, it is subtracted
/// first so only the lit LED (and sensor noise) remains. The frame is then
/// blurred, and the centroid of the largest near-peak region replaces the
/// single brightest pixel.
pub fn detect_enhanced(
    frame: &RgbImage,
    led_index: u32,
    angle_id: u32,
    background: Option<&RgbImage>,
    config: &DetectConfig,
) -> Detection2D {
    let source = match background {
        Some(bg) => subtract_background(frame, bg),
        None => frame.clone(),
    };
    let gray = blur_gray(
        &brightness_channel(&source, ColorChannel::Mixed),
        config.blur_sigma,
    );

    let (x, y, max_val) = find_peak(&gray);
    if max_val < config.brightness_threshold {
        return occluded_detection(
            led_index,
            angle_id,
            max_val,
            0.0,
            "below brightness threshold (enhanced)".to_string(),
        );
    }

    match largest_region_centroid(&gray, max_val) {
        Some((cx, cy, num_regions)) => {
            let confidence = if num_regions <= 1 {
                1.0
            } else {
                1.0 / num_regions as f64
            };
            Detection2D {
                led_index,
                angle_id,
                pixel_x: cx,
                pixel_y: cy,
                brightness: max_val,
                occluded: false,
                confidence,
                notes: format!("enhanced detection, {} regions", num_regions),
            }
        }
        None => Detection2D {
            led_index,
            angle_id,
            pixel_x: x as f64,
            pixel_y: y as f64,
            brightness: max_val,
            occluded: false,
            confidence: 0.8,
            notes: "enhanced detection, no regions above cutoff".to_string(),
        },
    }
}
