//! Probe result types.

use serde::Serialize;
use std::time::Duration;

/// Immutable description of one media file's container and stream layout.
///
/// Derived once per (path, mtime) pair and shared read-only; re-probing a
/// changed file produces a new descriptor rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaDescriptor {
    /// Container format name as reported by the inspector. Demuxers that
    /// share an implementation report a comma-separated list ("mov,mp4,m4a").
    pub container: String,
    pub duration: Option<Duration>,
    /// Total container bitrate in kbit/s, when reported.
    pub bit_rate_kbps: Option<u32>,
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoStream {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    /// Pixel (sample) aspect ratio; 1.0 means square pixels.
    pub pixel_aspect: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioStream {
    pub codec: String,
    pub channels: u32,
    pub sample_rate: Option<u32>,
    pub bit_rate_kbps: Option<u32>,
}

impl MediaDescriptor {
    pub fn primary_video(&self) -> Option<&VideoStream> {
        self.video_streams.first()
    }

    pub fn primary_audio(&self) -> Option<&AudioStream> {
        self.audio_streams.first()
    }

    /// Bitrate of the video payload: container total minus the primary audio
    /// stream, when both are known.
    pub fn video_kbps(&self) -> Option<u32> {
        let total = self.bit_rate_kbps?;
        let audio = self
            .primary_audio()
            .and_then(|a| a.bit_rate_kbps)
            .unwrap_or(0);
        Some(total.saturating_sub(audio))
    }

    /// True when the container name matches `name`, accounting for the
    /// comma-separated lists shared demuxers report.
    pub fn container_is(&self, name: &str) -> bool {
        self.container.split(',').any(|c| c.trim() == name)
    }
}

impl VideoStream {
    /// Display aspect ratio: frame ratio corrected for non-square pixels.
    pub fn display_aspect(&self) -> Option<f64> {
        if self.height == 0 {
            return None;
        }
        let par = self.pixel_aspect.unwrap_or(1.0);
        Some(self.width as f64 * par / self.height as f64)
    }
}
