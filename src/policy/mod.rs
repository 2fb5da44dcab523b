//! The passthrough-vs-transcode decision engine.
//!
//! `decide` is a pure, total function from a probed descriptor and the
//! device's capability matrix to a delivery plan. All of the product's
//! format intelligence lives here; the session and encoder layers only
//! execute what this module decides.

use crate::probe::{MediaDescriptor, VideoStream};
use serde::{Deserialize, Serialize};

/// Source display ratios within this relative distance of a supported
/// display ratio are scaled without padding.
const ASPECT_TOLERANCE: f64 = 0.05;

/// Frame rates MPEG-2 playback hardware accepts as-is.
const GOOD_MPEG_FPS: &[f64] = &[23.976, 24.0, 25.0, 29.97, 30.0, 50.0, 59.94, 60.0];

/// A display aspect ratio, written as "16:9" in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl std::str::FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid aspect ratio: {}", s))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid aspect ratio: {}", s))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid aspect ratio: {}", s))?;
        if width == 0 || height == 0 {
            return Err(format!("Invalid aspect ratio: {}", s));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(ar: AspectRatio) -> Self {
        ar.to_string()
    }
}

/// What one playback device model is known to consume natively.
///
/// Constructed once from configuration at startup and passed by reference
/// into `decide`; never re-parsed per request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceCapabilities {
    /// Video codecs the device decodes natively.
    #[serde(default = "default_video_codecs")]
    pub video_codecs: Vec<String>,

    /// Audio codecs the device decodes natively.
    #[serde(default = "default_audio_codecs")]
    pub audio_codecs: Vec<String>,

    /// Container formats the device demuxes natively.
    #[serde(default = "default_containers")]
    pub containers: Vec<String>,

    /// Display aspect ratios the device renders, ordered widest first.
    #[serde(default = "default_display_ratios")]
    pub display_aspect_ratios: Vec<AspectRatio>,

    /// Transcode target video codec.
    #[serde(default = "default_video_codec")]
    pub default_video_codec: String,

    /// Transcode target audio codec.
    #[serde(default = "default_audio_codec")]
    pub default_audio_codec: String,

    /// Transcode video bitrate for full-resolution sources, kbit/s.
    #[serde(default = "default_video_kbps")]
    pub default_video_kbps: u32,

    /// Hard ceiling on video bitrate the device accepts, kbit/s.
    #[serde(default = "default_max_video_kbps")]
    pub max_video_kbps: u32,

    /// Transcode audio bitrate, kbit/s.
    #[serde(default = "default_audio_kbps")]
    pub audio_kbps: u32,

    /// Hard ceiling on audio bitrate the device accepts, kbit/s.
    #[serde(default = "default_max_audio_kbps")]
    pub max_audio_kbps: u32,

    /// Target frame width for transcoded output.
    #[serde(default = "default_max_width")]
    pub max_width: u32,

    /// Target frame height for transcoded output.
    #[serde(default = "default_max_height")]
    pub max_height: u32,

    /// Encoder rate-control buffer, kbit.
    #[serde(default = "default_buffer_kb")]
    pub buffer_kb: u32,
}

fn default_video_codecs() -> Vec<String> {
    vec!["mpeg2video".to_string(), "mpeg1video".to_string()]
}
fn default_audio_codecs() -> Vec<String> {
    vec!["ac3".to_string(), "mp2".to_string()]
}
fn default_containers() -> Vec<String> {
    vec!["mpeg".to_string()]
}
fn default_display_ratios() -> Vec<AspectRatio> {
    vec![AspectRatio::new(16, 9), AspectRatio::new(4, 3)]
}
fn default_video_codec() -> String {
    "mpeg2video".to_string()
}
fn default_audio_codec() -> String {
    "ac3".to_string()
}
fn default_video_kbps() -> u32 {
    16384
}
fn default_max_video_kbps() -> u32 {
    30000
}
fn default_audio_kbps() -> u32 {
    448
}
fn default_max_audio_kbps() -> u32 {
    448
}
fn default_max_width() -> u32 {
    1920
}
fn default_max_height() -> u32 {
    1080
}
fn default_buffer_kb() -> u32 {
    4096
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            video_codecs: default_video_codecs(),
            audio_codecs: default_audio_codecs(),
            containers: default_containers(),
            display_aspect_ratios: default_display_ratios(),
            default_video_codec: default_video_codec(),
            default_audio_codec: default_audio_codec(),
            default_video_kbps: default_video_kbps(),
            max_video_kbps: default_max_video_kbps(),
            audio_kbps: default_audio_kbps(),
            max_audio_kbps: default_max_audio_kbps(),
            max_width: default_max_width(),
            max_height: default_max_height(),
            buffer_kb: default_buffer_kb(),
        }
    }
}

/// How the frame is fitted to the device's display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Scaling {
    /// Source shape is close enough to a supported ratio: scale straight to
    /// the target frame and declare that ratio.
    Fit {
        aspect: AspectRatio,
        width: u32,
        height: u32,
    },
    /// Source is wider than every supported ratio: bars top and bottom.
    Letterbox {
        aspect: AspectRatio,
        width: u32,
        height: u32,
        scaled_height: u32,
        top: u32,
    },
    /// Source is narrower than every supported ratio: bars left and right.
    Pillarbox {
        aspect: AspectRatio,
        width: u32,
        height: u32,
        scaled_width: u32,
        left: u32,
    },
}

/// Parameters of one transcode invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscodeParams {
    pub video_codec: String,
    pub audio_codec: String,
    /// Video bitrate ceiling derived from the source resolution, kbit/s.
    pub video_kbps: u32,
    pub max_video_kbps: u32,
    pub buffer_kb: u32,
    /// Output frame rate; None keeps the source rate.
    pub frame_rate: Option<String>,
    pub scaling: Scaling,
    pub audio_kbps: u32,
    pub audio_sample_rate: u32,
    /// Downmix channel count; None keeps the source layout.
    pub audio_channels: Option<u32>,
}

/// The decided strategy for serving one file to one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeliveryPlan {
    Passthrough,
    Transcode(TranscodeParams),
}

impl DeliveryPlan {
    pub fn is_transcode(&self) -> bool {
        matches!(self, DeliveryPlan::Transcode(_))
    }
}

/// Decide how to deliver `descriptor` to a device with `caps`.
pub fn decide(descriptor: &MediaDescriptor, caps: &DeviceCapabilities) -> DeliveryPlan {
    if passthrough_compatible(descriptor, caps) {
        return DeliveryPlan::Passthrough;
    }
    DeliveryPlan::Transcode(transcode_params(descriptor, caps))
}

/// The passthrough gate: container, every stream codec, bitrates, and frame
/// height must all be within the device matrix. Unknown bitrates fail the
/// gate; the device's rate control cannot be trusted with them.
fn passthrough_compatible(descriptor: &MediaDescriptor, caps: &DeviceCapabilities) -> bool {
    if !caps.containers.iter().any(|c| descriptor.container_is(c)) {
        return false;
    }

    if descriptor
        .video_streams
        .iter()
        .any(|v| !caps.video_codecs.contains(&v.codec))
    {
        return false;
    }
    if descriptor
        .audio_streams
        .iter()
        .any(|a| !caps.audio_codecs.contains(&a.codec))
    {
        return false;
    }

    if let Some(video) = descriptor.primary_video() {
        if video.height > caps.max_height || video.width > caps.max_width {
            return false;
        }
        match descriptor.video_kbps() {
            Some(kbps) if kbps <= caps.max_video_kbps => {}
            _ => return false,
        }
    }

    if let Some(audio) = descriptor.primary_audio() {
        match audio.bit_rate_kbps {
            Some(kbps) if kbps <= caps.max_audio_kbps => {}
            _ => return false,
        }
    }

    true
}

fn transcode_params(descriptor: &MediaDescriptor, caps: &DeviceCapabilities) -> TranscodeParams {
    let video = descriptor.primary_video();
    let audio = descriptor.primary_audio();

    let frame_rate = match video.and_then(|v| v.frame_rate) {
        Some(fps) if is_good_frame_rate(fps) => None,
        _ => Some("29.97".to_string()),
    };

    let audio_sample_rate = match audio.and_then(|a| a.sample_rate) {
        Some(44100) => 44100,
        _ => 48000,
    };

    // AC-3 tops out at 5.1
    let audio_channels = audio.and_then(|a| if a.channels > 6 { Some(6) } else { None });

    TranscodeParams {
        video_codec: caps.default_video_codec.clone(),
        audio_codec: caps.default_audio_codec.clone(),
        video_kbps: bitrate_ceiling(video.map(|v| v.height).unwrap_or(0), caps),
        max_video_kbps: caps.max_video_kbps,
        buffer_kb: caps.buffer_kb,
        frame_rate,
        scaling: select_scaling(video, caps),
        audio_kbps: caps.audio_kbps.min(caps.max_audio_kbps),
        audio_sample_rate,
        audio_channels,
    }
}

/// Bitrate ceiling as a function of the source resolution: low-resolution
/// sources get a lower ceiling, and everything stays under 95% of the
/// device's hard maximum.
fn bitrate_ceiling(source_height: u32, caps: &DeviceCapabilities) -> u32 {
    let tier = match source_height {
        1..=480 => 4096,
        481..=720 => 8192,
        _ => caps.default_video_kbps,
    };
    tier.min(caps.default_video_kbps)
        .min(caps.max_video_kbps * 95 / 100)
}

fn is_good_frame_rate(fps: f64) -> bool {
    GOOD_MPEG_FPS.iter().any(|good| (fps - good).abs() < 0.01)
}

/// Pick the display ratio nearest the source shape. Outside the tolerance
/// band of every supported ratio the output is padded toward the nearest
/// one; ties prefer the wider ratio.
fn select_scaling(video: Option<&VideoStream>, caps: &DeviceCapabilities) -> Scaling {
    let width = caps.max_width;
    let height = caps.max_height;

    let fallback = *caps
        .display_aspect_ratios
        .first()
        .expect("capability matrix lists at least one display ratio");

    let source_ratio = match video.and_then(|v| v.display_aspect()) {
        Some(ratio) => ratio,
        None => {
            return Scaling::Fit {
                aspect: fallback,
                width,
                height,
            }
        }
    };

    let mut nearest = fallback;
    let mut nearest_distance = f64::INFINITY;
    for candidate in &caps.display_aspect_ratios {
        let distance = (source_ratio - candidate.ratio()).abs();
        let closer = distance < nearest_distance - 1e-9;
        let tied_but_wider = (distance - nearest_distance).abs() <= 1e-9
            && candidate.ratio() > nearest.ratio();
        if closer || tied_but_wider {
            nearest = *candidate;
            nearest_distance = distance;
        }
    }

    let target_ratio = nearest.ratio();
    if (source_ratio - target_ratio).abs() / target_ratio <= ASPECT_TOLERANCE {
        return Scaling::Fit {
            aspect: nearest,
            width,
            height,
        };
    }

    if source_ratio > target_ratio {
        // Source is wider than the display: full width, bars top and bottom.
        let mut scaled_height = (height as f64 * target_ratio / source_ratio) as u32;
        if scaled_height % 2 == 1 {
            scaled_height -= 1;
        }
        let mut top = (height - scaled_height) / 2;
        if top % 2 == 1 {
            top -= 1;
        }
        Scaling::Letterbox {
            aspect: nearest,
            width,
            height,
            scaled_height,
            top,
        }
    } else {
        let mut scaled_width = (width as f64 * source_ratio / target_ratio) as u32;
        if scaled_width % 2 == 1 {
            scaled_width -= 1;
        }
        let mut left = (width - scaled_width) / 2;
        if left % 2 == 1 {
            left -= 1;
        }
        Scaling::Pillarbox {
            aspect: nearest,
            width,
            height,
            scaled_width,
            left,
        }
    }
}
