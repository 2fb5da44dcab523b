//! Deterministic encoder argument construction.

use crate::policy::{Scaling, TranscodeParams};
use std::path::Path;

/// Build the full ffmpeg argument vector for one transcode.
///
/// Pure function of the plan and source path: the same plan always produces
/// the same vector. Output is forced to a progressively-playable program
/// stream on stdout; nothing here assumes the output is seekable.
pub fn build_args(params: &TranscodeParams, source: &Path) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "-bufsize".to_string(),
        format!("{}k", params.buffer_kb),
        "-c:v".to_string(),
        params.video_codec.clone(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-b:v".to_string(),
        format!("{}k", params.video_kbps),
        "-maxrate".to_string(),
        format!("{}k", params.max_video_kbps),
    ];

    if let Some(ref rate) = params.frame_rate {
        args.push("-r".to_string());
        args.push(rate.clone());
    }

    match &params.scaling {
        Scaling::Fit {
            aspect,
            width,
            height,
        } => {
            args.extend([
                "-aspect".to_string(),
                aspect.to_string(),
                "-s".to_string(),
                format!("{}x{}", width, height),
            ]);
        }
        Scaling::Letterbox {
            aspect,
            width,
            height,
            scaled_height,
            top,
        } => {
            args.extend([
                "-aspect".to_string(),
                aspect.to_string(),
                "-vf".to_string(),
                format!(
                    "scale={}:{},pad={}:{}:0:{}",
                    width, scaled_height, width, height, top
                ),
            ]);
        }
        Scaling::Pillarbox {
            aspect,
            width,
            height,
            scaled_width,
            left,
        } => {
            args.extend([
                "-aspect".to_string(),
                aspect.to_string(),
                "-vf".to_string(),
                format!(
                    "scale={}:{},pad={}:{}:{}:0",
                    scaled_width, height, width, height, left
                ),
            ]);
        }
    }

    args.extend([
        "-c:a".to_string(),
        params.audio_codec.clone(),
        "-b:a".to_string(),
        format!("{}k", params.audio_kbps),
        "-ar".to_string(),
        params.audio_sample_rate.to_string(),
    ]);

    if let Some(channels) = params.audio_channels {
        args.push("-ac".to_string());
        args.push(channels.to_string());
    }

    args.extend(["-f".to_string(), "vob".to_string(), "-".to_string()]);

    args
}
