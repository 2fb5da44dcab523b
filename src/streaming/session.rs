//! One client's streaming session.
//!
//! The state machine is `Initialized -> Planning -> Streaming ->
//! {Completed | Aborted}`. A session owns at most one encoder job; while
//! streaming it has exactly one data source, either the opened file or the
//! encoder's output channel.

use crate::encoder::{EncodeJob, EncoderManager, TerminationCause, CHUNK_SIZE};
use crate::policy::{self, DeliveryPlan, DeviceCapabilities, TranscodeParams};
use crate::probe::{MediaDescriptor, MediaProber, ProbeError};
use crate::streaming::registry::{DeliveryMode, SessionGuard, SessionRegistry};
use crate::streaming::SessionError;
use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Chunks buffered between the encoder pump and a slow client. Beyond this
/// the pump stalls, the stdout pipe fills, and the encoder itself pauses.
const PIPELINE_DEPTH: usize = 4;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// The byte source and content metadata handed back to the HTTP front-end.
pub struct StreamContent {
    pub stream: ByteStream,
    pub content_type: &'static str,
    /// Exact body length; None means chunked delivery of unknown length.
    pub content_length: Option<u64>,
    /// `(start, end, total)` when a byte range was honored.
    pub range: Option<(u64, u64, u64)>,
}

impl std::fmt::Debug for StreamContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContent")
            .field("stream", &"<byte stream>")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("range", &self.range)
            .finish()
    }
}

/// A parsed `Range: bytes=` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// bytes=500-
    From(u64),
    /// bytes=0-499
    Span(u64, u64),
    /// bytes=-500 (last 500 bytes)
    Suffix(u64),
}

/// Parse a Range header. Malformed headers yield None and are ignored,
/// producing a full-body response.
pub fn parse_range_header(header: &str) -> Option<RangeSpec> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (true, false) => end.parse().ok().map(RangeSpec::Suffix),
        (false, true) => start.parse().ok().map(RangeSpec::From),
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            (start <= end).then_some(RangeSpec::Span(start, end))
        }
        (true, true) => None,
    }
}

/// Resolve a parsed range against the file length.
fn resolve_range(spec: RangeSpec, file_size: u64) -> Result<(u64, u64), SessionError> {
    if file_size == 0 {
        return Err(SessionError::RangeUnsatisfiable);
    }
    match spec {
        RangeSpec::From(start) => {
            if start >= file_size {
                return Err(SessionError::RangeUnsatisfiable);
            }
            Ok((start, file_size - 1))
        }
        RangeSpec::Span(start, end) => {
            if start >= file_size {
                return Err(SessionError::RangeUnsatisfiable);
            }
            Ok((start, end.min(file_size - 1)))
        }
        RangeSpec::Suffix(len) => {
            if len == 0 {
                return Err(SessionError::RangeUnsatisfiable);
            }
            Ok((file_size.saturating_sub(len), file_size - 1))
        }
    }
}

/// One in-flight request.
#[derive(Debug)]
pub struct StreamSession {
    guard: SessionGuard,
    path: PathBuf,
    range: Option<RangeSpec>,
}

impl StreamSession {
    /// Parse the request and claim a registry slot. Fails with
    /// `ConcurrencyLimitExceeded` before any probing or process spawn.
    pub fn begin(
        registry: &Arc<SessionRegistry>,
        path: PathBuf,
        range_header: Option<&str>,
    ) -> Result<Self, SessionError> {
        let guard = registry.register(&path)?;
        let range = range_header.and_then(parse_range_header);
        Ok(Self { guard, path, range })
    }

    pub fn id(&self) -> Uuid {
        self.guard.id()
    }

    /// Plan the delivery and enter streaming.
    ///
    /// Any error here surfaces before the first byte is written, so the
    /// front-end can still send a clean error response; the registry entry
    /// is released as the session drops.
    pub async fn stream(
        mut self,
        prober: &MediaProber,
        caps: &DeviceCapabilities,
        encoder: &EncoderManager,
    ) -> Result<StreamContent, SessionError> {
        self.guard.set_planning();

        let descriptor = prober.probe(&self.path).await?;
        let plan = policy::decide(&descriptor, caps);
        tracing::debug!(
            session_id = %self.guard.id(),
            container = %descriptor.container,
            transcode = plan.is_transcode(),
            "Delivery plan decided"
        );

        match plan {
            DeliveryPlan::Passthrough => self.stream_passthrough(&descriptor).await,
            DeliveryPlan::Transcode(params) => self.stream_transcode(&descriptor, params, encoder),
        }
    }

    async fn stream_passthrough(
        mut self,
        descriptor: &MediaDescriptor,
    ) -> Result<StreamContent, SessionError> {
        let unreadable = || {
            SessionError::Probe(ProbeError::Unreadable {
                path: self.path.clone(),
            })
        };

        let mut file = File::open(&self.path).await.map_err(|_| unreadable())?;
        let file_size = file.metadata().await.map_err(|_| unreadable())?.len();

        let resolved = match self.range {
            Some(spec) => Some(resolve_range(spec, file_size)?),
            None => None,
        };
        let (start, length, honored) = match resolved {
            Some((start, end)) => (start, end - start + 1, Some((start, end, file_size))),
            None => (0, file_size, None),
        };

        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|_| unreadable())?;
        }

        self.guard.set_streaming(DeliveryMode::Passthrough);
        let token = self.guard.token();
        let reader = ReaderStream::with_capacity(file.take(length), CHUNK_SIZE);

        Ok(StreamContent {
            stream: Box::pin(GuardedStream::new(reader, self.guard, token)),
            content_type: content_type_for(&descriptor.container),
            content_length: Some(length),
            range: honored,
        })
    }

    fn stream_transcode(
        mut self,
        descriptor: &MediaDescriptor,
        params: TranscodeParams,
        encoder: &EncoderManager,
    ) -> Result<StreamContent, SessionError> {
        // Transcoded output length is not known in advance, so a range
        // request degrades to serving from the beginning. Deliberate policy.
        if self.range.is_some() {
            tracing::debug!(
                session_id = %self.guard.id(),
                "Range header ignored for transcoded delivery"
            );
        }

        let job = encoder.start(&params, &self.path)?;

        if let Some(estimate) = estimated_transcode_size(descriptor, &params) {
            tracing::debug!(
                session_id = %self.guard.id(),
                job_id = %job.id(),
                estimated_bytes = estimate,
                "Transcode started"
            );
        }

        self.guard.set_streaming(DeliveryMode::Transcode);
        let token = self.guard.token();

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(PIPELINE_DEPTH);
        tokio::spawn(relay_encoder_output(job, tx, token.clone()));

        Ok(StreamContent {
            stream: Box::pin(GuardedStream::new(
                ReceiverStream::new(rx),
                self.guard,
                token,
            )),
            content_type: "video/mpeg",
            content_length: None,
            range: None,
        })
    }
}

/// Pump encoder output into the session channel.
///
/// Bytes flow in encoder output order. The bounded channel is the
/// backpressure path: a slow client parks the send, which stops stdout
/// reads and lets the pipe fill until the encoder blocks. A closed channel
/// means the client went away; the encoder is torn down before returning.
async fn relay_encoder_output(
    mut job: EncodeJob,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    token: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = job.cancel(TerminationCause::Canceled).await;
                let _ = tx.try_send(Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "session canceled",
                )));
                return;
            }
            _ = tx.closed() => {
                let _ = job.cancel(TerminationCause::ClientClosed).await;
                return;
            }
            read = job.read_chunk() => read,
        };

        match read {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    let _ = job.cancel(TerminationCause::ClientClosed).await;
                    return;
                }
            }
            Ok(None) => {
                if let Err(e) = job.finish().await {
                    // Bytes already delivered cannot be retracted; the
                    // client sees a truncated stream.
                    let _ = tx.try_send(Err(std::io::Error::other(e)));
                }
                return;
            }
            Err(e) => {
                let _ = job.cancel(TerminationCause::EncoderError).await;
                let _ = tx.try_send(Err(e));
                return;
            }
        }
    }
}

/// Byte stream that owns the session's registry entry.
///
/// Reaching the end of the source marks the session completed; dropping the
/// stream earlier (client disconnect) or hitting an error leaves the
/// aborted default. Cancellation ends the stream between chunks.
struct GuardedStream<S> {
    inner: S,
    guard: SessionGuard,
    cancelled: Pin<Box<dyn Future<Output = ()> + Send>>,
    done: bool,
}

impl<S> GuardedStream<S> {
    fn new(inner: S, guard: SessionGuard, token: CancellationToken) -> Self {
        Self {
            inner,
            guard,
            cancelled: Box::pin(token.cancelled_owned()),
            done: false,
        }
    }
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.guard.add_bytes(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.guard.set_completed();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Content type for a source container, accounting for the comma lists
/// shared demuxers report.
fn content_type_for(container: &str) -> &'static str {
    for name in container.split(',') {
        let mapped = match name.trim() {
            "mpeg" | "vob" | "mpegvideo" => Some("video/mpeg"),
            "mpegts" => Some("video/mp2t"),
            "mov" | "mp4" | "m4v" => Some("video/mp4"),
            "matroska" => Some("video/x-matroska"),
            "webm" => Some("video/webm"),
            "avi" => Some("video/x-msvideo"),
            "asf" => Some("video/x-ms-wmv"),
            "flv" => Some("video/x-flv"),
            _ => None,
        };
        if let Some(content_type) = mapped {
            return content_type;
        }
    }
    "application/octet-stream"
}

/// Size estimate for a transcoded stream: target bitrate over the source
/// duration plus 2% mux overhead. For logs only; the true output length is
/// unknown until the encoder finishes.
fn estimated_transcode_size(
    descriptor: &MediaDescriptor,
    params: &TranscodeParams,
) -> Option<u64> {
    let duration = descriptor.duration?;
    let kbps = (params.video_kbps + params.audio_kbps) as f64;
    Some((duration.as_secs_f64() * kbps * 1000.0 / 8.0 * 1.02) as u64)
}


#[cfg(all(test, unix))]
mod pipeline_tests {
    use super::*;
    use crate::encoder::EncoderManager;
    use crate::events::EventBus;
    use crate::probe::MediaProber;
    use crate::streaming::{SessionOutcome, SessionRegistry};
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    const COMPATIBLE_JSON: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "mpeg2video",
             "width": 720, "height": 480, "r_frame_rate": "30000/1001"},
            {"codec_type": "audio", "codec_name": "ac3", "channels": 2,
             "sample_rate": "48000", "bit_rate": "192000"}
        ],
        "format": {"format_name": "mpeg", "duration": "60.0", "bit_rate": "4000000"}
    }"#;

    const INCOMPATIBLE_JSON: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264",
             "width": 1280, "height": 720, "r_frame_rate": "24000/1001"},
            {"codec_type": "audio", "codec_name": "aac", "channels": 6,
             "sample_rate": "48000", "bit_rate": "384000"}
        ],
        "format": {"format_name": "matroska,webm", "duration": "60.0", "bit_rate": "8000000"}
    }"#;

    fn stub_tool(dir: &Path, name: &str, script: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn stub_prober(dir: &Path, json: &str) -> MediaProber {
        let json_path = dir.join("probe.json");
        fs::write(&json_path, json).unwrap();
        let script = format!("#!/bin/sh\ncat {}\n", json_path.display());
        MediaProber::new(
            stub_tool(dir, "ffprobe", &script),
            Duration::from_secs(5),
        )
    }

    fn registry(cap: usize) -> (Arc<SessionRegistry>, EventBus) {
        let bus = EventBus::new();
        (Arc::new(SessionRegistry::new(cap, bus.clone())), bus)
    }

    /// Drain a stream, returning the bytes and the terminating error if any.
    async fn collect(mut stream: ByteStream) -> (Vec<u8>, Option<std::io::Error>) {
        let mut bytes = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(e) => return (bytes, Some(e)),
            }
        }
        (bytes, None)
    }

    #[tokio::test]
    async fn test_passthrough_honors_range() {
        let dir = tempfile::tempdir().unwrap();
        let prober = stub_prober(dir.path(), COMPATIBLE_JSON);
        let encoder = EncoderManager::new("/bin/false".into(), Duration::from_secs(5));
        let (reg, _) = registry(4);

        let media = dir.path().join("movie.mpg");
        let data: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        fs::write(&media, &data).unwrap();

        let session =
            StreamSession::begin(&reg, media.clone(), Some("bytes=1000-")).unwrap();
        let content = session
            .stream(&prober, &DeviceCapabilities::default(), &encoder)
            .await
            .unwrap();

        assert_eq!(content.content_type, "video/mpeg");
        assert_eq!(content.content_length, Some(1048));
        assert_eq!(content.range, Some((1000, 2047, 2048)));

        let (bytes, err) = collect(content.stream).await;
        assert!(err.is_none());
        assert_eq!(bytes, &data[1000..]);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_unsatisfiable_range() {
        let dir = tempfile::tempdir().unwrap();
        let prober = stub_prober(dir.path(), COMPATIBLE_JSON);
        let encoder = EncoderManager::new("/bin/false".into(), Duration::from_secs(5));
        let (reg, _) = registry(4);

        let media = dir.path().join("movie.mpg");
        fs::write(&media, vec![0u8; 1000]).unwrap();

        let session =
            StreamSession::begin(&reg, media.clone(), Some("bytes=5000-")).unwrap();
        let err = session
            .stream(&prober, &DeviceCapabilities::default(), &encoder)
            .await
            .unwrap_err();

        assert_matches!(err, SessionError::RangeUnsatisfiable);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_transcode_streams_encoder_output_and_ignores_range() {
        let dir = tempfile::tempdir().unwrap();
        let prober = stub_prober(dir.path(), INCOMPATIBLE_JSON);
        let ffmpeg = stub_tool(dir.path(), "ffmpeg", "#!/bin/sh\nprintf 'MPEGSTREAM'\n");
        let encoder = EncoderManager::new(ffmpeg, Duration::from_secs(5));
        let (reg, bus) = registry(4);
        let mut events = bus.subscribe();

        let media = dir.path().join("movie.mkv");
        fs::write(&media, b"source bits").unwrap();

        let session =
            StreamSession::begin(&reg, media.clone(), Some("bytes=1000-")).unwrap();
        let content = session
            .stream(&prober, &DeviceCapabilities::default(), &encoder)
            .await
            .unwrap();

        // The range is ignored: unknown output length, stream from byte 0.
        assert_eq!(content.range, None);
        assert_eq!(content.content_length, None);
        assert_eq!(content.content_type, "video/mpeg");

        let (bytes, err) = collect(content.stream).await;
        assert!(err.is_none());
        assert_eq!(bytes, b"MPEGSTREAM");
        assert!(reg.is_empty());

        let _ = events.recv().await.unwrap(); // started
        match events.recv().await.unwrap() {
            crate::events::SessionEvent::SessionEnded { mode, outcome, .. } => {
                assert_eq!(mode, Some(DeliveryMode::Transcode));
                assert_eq!(outcome, SessionOutcome::Completed);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_encoder_failure_truncates_stream_and_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let prober = stub_prober(dir.path(), INCOMPATIBLE_JSON);
        let ffmpeg = stub_tool(dir.path(), "ffmpeg", "#!/bin/sh\nprintf 'partial'; exit 9\n");
        let encoder = EncoderManager::new(ffmpeg, Duration::from_secs(5));
        let (reg, bus) = registry(4);
        let mut events = bus.subscribe();

        let media = dir.path().join("movie.mkv");
        fs::write(&media, b"source bits").unwrap();

        let session = StreamSession::begin(&reg, media.clone(), None).unwrap();
        let content = session
            .stream(&prober, &DeviceCapabilities::default(), &encoder)
            .await
            .unwrap();

        let (bytes, err) = collect(content.stream).await;
        assert_eq!(bytes, b"partial");
        assert!(err.is_some());
        assert!(reg.is_empty());

        let _ = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            crate::events::SessionEvent::SessionEnded { outcome, .. } => {
                assert_eq!(outcome, SessionOutcome::Aborted)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let prober = stub_prober(dir.path(), INCOMPATIBLE_JSON);

        let pid_file = dir.path().join("encoder.pid");
        let script = format!(
            "#!/bin/sh\necho $$ > {}\nwhile :; do printf 'xxxxxxxxxxxxxxxx'; sleep 0.02; done\n",
            pid_file.display()
        );
        let ffmpeg = stub_tool(dir.path(), "ffmpeg", &script);
        let encoder = EncoderManager::new(ffmpeg, Duration::from_secs(5));
        let (reg, _) = registry(4);

        let media = dir.path().join("movie.mkv");
        fs::write(&media, b"source bits").unwrap();

        let session = StreamSession::begin(&reg, media.clone(), None).unwrap();
        let mut content = session
            .stream(&prober, &DeviceCapabilities::default(), &encoder)
            .await
            .unwrap();

        // Consume one chunk, then hang up.
        let first = content.stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(content);

        let pid: i32 = wait_for(|| {
            fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse().ok())
        })
        .await;

        // The encoder must be terminated and the session removed promptly.
        wait_until(|| !process_alive(pid) && reg.is_empty()).await;
    }

    #[tokio::test]
    async fn test_external_cancellation_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let prober = stub_prober(dir.path(), INCOMPATIBLE_JSON);

        let pid_file = dir.path().join("encoder.pid");
        let script = format!(
            "#!/bin/sh\necho $$ > {}\nwhile :; do printf 'xxxxxxxxxxxxxxxx'; sleep 0.02; done\n",
            pid_file.display()
        );
        let ffmpeg = stub_tool(dir.path(), "ffmpeg", &script);
        let encoder = EncoderManager::new(ffmpeg, Duration::from_secs(5));
        let (reg, _) = registry(4);

        let media = dir.path().join("movie.mkv");
        fs::write(&media, b"source bits").unwrap();

        let session = StreamSession::begin(&reg, media.clone(), None).unwrap();
        let session_id = session.id();
        let mut content = session
            .stream(&prober, &DeviceCapabilities::default(), &encoder)
            .await
            .unwrap();

        let first = content.stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());

        assert!(reg.cancel(session_id));

        // Drain until the stream ends, then the guard drops with it.
        let (_, _) = collect(content.stream).await;

        let pid: i32 = wait_for(|| {
            fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse().ok())
        })
        .await;
        wait_until(|| !process_alive(pid) && reg.is_empty()).await;
    }

    #[tokio::test]
    async fn test_cap_rejection_happens_before_probe() {
        let dir = tempfile::tempdir().unwrap();

        // A prober whose inspector records every invocation
        let counter = dir.path().join("count");
        let script = format!("#!/bin/sh\necho run >> {}\nexit 1\n", counter.display());
        let _prober = MediaProber::new(
            stub_tool(dir.path(), "ffprobe", &script),
            Duration::from_secs(5),
        );

        let (reg, _) = registry(1);
        let media = dir.path().join("movie.mkv");
        fs::write(&media, b"source bits").unwrap();

        let _held = StreamSession::begin(&reg, media.clone(), None).unwrap();
        let err = StreamSession::begin(&reg, media.clone(), None).unwrap_err();
        assert_matches!(err, SessionError::ConcurrencyLimitExceeded);

        // Rejection is immediate and cheap: the inspector never ran.
        assert!(!counter.exists());
    }

    fn process_alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    async fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(value) = f() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within 5s");
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        wait_for(|| f().then_some(())).await
    }
}
