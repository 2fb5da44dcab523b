//! FFprobe-based media inspection.

use super::types::*;
use super::ProbeError;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: String,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    sample_aspect_ratio: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    bit_rate: Option<String>,
}

/// Inspect a media file's headers with ffprobe.
///
/// Bounded by `timeout`; any inspector failure (missing binary, non-zero
/// exit, hang, unparseable output) degrades to `UnrecognizedFormat`.
pub async fn probe_with_ffprobe(
    ffprobe_bin: &Path,
    path: &Path,
    timeout: Duration,
) -> Result<MediaDescriptor, ProbeError> {
    let unrecognized = || ProbeError::UnrecognizedFormat {
        path: path.to_path_buf(),
    };

    let child = Command::new(ffprobe_bin)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("Failed to spawn ffprobe: {}", e);
            return Err(unrecognized());
        }
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::warn!("ffprobe I/O error for {:?}: {}", path, e);
            return Err(unrecognized());
        }
        Err(_) => {
            // kill_on_drop reaps the hung inspector
            tracing::warn!("ffprobe timed out after {:?} on {:?}", timeout, path);
            return Err(unrecognized());
        }
    };

    if !output.status.success() {
        tracing::debug!(
            "ffprobe exited with {} for {:?}: {}",
            output.status,
            path,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Err(unrecognized());
    }

    let ff_output: FfprobeOutput = match serde_json::from_slice(&output.stdout) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Failed to parse ffprobe output for {:?}: {}", path, e);
            return Err(unrecognized());
        }
    };

    parse_ffprobe_output(path, ff_output)
}

fn parse_ffprobe_output(
    path: &Path,
    output: FfprobeOutput,
) -> Result<MediaDescriptor, ProbeError> {
    let duration = output
        .format
        .duration
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);

    let mut descriptor = MediaDescriptor {
        container: output.format.format_name,
        duration,
        bit_rate_kbps: output.format.bit_rate.and_then(|s| parse_kbps(&s)),
        video_streams: Vec::new(),
        audio_streams: Vec::new(),
    };

    for stream in output.streams {
        match stream.codec_type.as_str() {
            "video" => {
                descriptor.video_streams.push(VideoStream {
                    codec: stream.codec_name.unwrap_or_default(),
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    frame_rate: stream.r_frame_rate.and_then(|s| parse_frame_rate(&s)),
                    pixel_aspect: stream.sample_aspect_ratio.and_then(|s| parse_ratio(&s)),
                });
            }
            "audio" => {
                descriptor.audio_streams.push(AudioStream {
                    codec: stream.codec_name.unwrap_or_default(),
                    channels: stream.channels.unwrap_or(2),
                    sample_rate: stream.sample_rate.and_then(|s| s.parse().ok()),
                    bit_rate_kbps: stream.bit_rate.and_then(|s| parse_kbps(&s)),
                });
            }
            _ => {}
        }
    }

    if descriptor.container.is_empty() {
        return Err(ProbeError::UnrecognizedFormat {
            path: path.to_path_buf(),
        });
    }

    Ok(descriptor)
}

fn parse_kbps(bps: &str) -> Option<u32> {
    let bps: u64 = bps.parse().ok()?;
    Some((bps / 1000) as u32)
}

fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    let parts: Vec<&str> = rate_str.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den != 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate_str.parse().ok()
}

fn parse_ratio(ratio_str: &str) -> Option<f64> {
    let (num, den) = ratio_str.split_once(':')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some(num / den)
}
