//! Shared test harness: a live server over a temp share, with stub
//! ffprobe/ffmpeg shell scripts standing in for the real tools.

#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tivoserve::config::{Config, ShareConfig};
use tivoserve::server::{create_router, AppContext};

/// ffprobe output for a file the device plays natively.
pub const COMPATIBLE_JSON: &str = r#"{
    "streams": [
        {"codec_type": "video", "codec_name": "mpeg2video",
         "width": 720, "height": 480, "r_frame_rate": "30000/1001"},
        {"codec_type": "audio", "codec_name": "ac3", "channels": 2,
         "sample_rate": "48000", "bit_rate": "192000"}
    ],
    "format": {"format_name": "mpeg", "duration": "60.0", "bit_rate": "4000000"}
}"#;

/// ffprobe output for a file that needs transcoding.
pub const INCOMPATIBLE_JSON: &str = r#"{
    "streams": [
        {"codec_type": "video", "codec_name": "h264",
         "width": 1280, "height": 720, "r_frame_rate": "24000/1001"},
        {"codec_type": "audio", "codec_name": "aac", "channels": 6,
         "sample_rate": "48000", "bit_rate": "384000"}
    ],
    "format": {"format_name": "matroska,webm", "duration": "60.0", "bit_rate": "8000000"}
}"#;

pub struct TestHarness {
    pub dir: tempfile::TempDir,
    pub share_dir: PathBuf,
    pub ctx: AppContext,
}

impl TestHarness {
    /// Start a server with stub tools and one share named "movies".
    ///
    /// `probe_json` is what the stub ffprobe prints; `ffmpeg_script` is the
    /// body of the stub encoder (shell, after the shebang line).
    pub async fn with_server(
        max_sessions: usize,
        probe_json: &str,
        ffmpeg_script: &str,
    ) -> (Self, SocketAddr) {
        let dir = tempfile::tempdir().unwrap();
        let share_dir = dir.path().join("share");
        fs::create_dir(&share_dir).unwrap();

        let json_path = dir.path().join("probe.json");
        fs::write(&json_path, probe_json).unwrap();
        let ffprobe = write_script(
            dir.path(),
            "ffprobe",
            &format!("cat {}\n", json_path.display()),
        );
        let ffmpeg = write_script(dir.path(), "ffmpeg", ffmpeg_script);

        let mut config = Config::default();
        config.shares = vec![ShareConfig {
            name: "movies".to_string(),
            path: share_dir.clone(),
        }];
        config.tools.ffprobe_path = Some(ffprobe);
        config.tools.ffmpeg_path = Some(ffmpeg);
        config.streaming.max_sessions = max_sessions;
        config.streaming.cancel_grace_secs = 5;

        let ctx = AppContext::from_config(config);
        let app = create_router(ctx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (
            Self {
                dir,
                share_dir,
                ctx,
            },
            addr,
        )
    }

    /// Drop a media file into the share.
    pub fn write_media(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.share_dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    /// Path to a side file inside the harness temp dir.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
