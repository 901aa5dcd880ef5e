use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::{Registry, StreamStatus};

/// How long `stop()` waits for ffmpeg to exit after SIGTERM before escalating to SIGKILL.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Whether the packager is remuxing without re-encoding (the default, fast path) or
/// decoding and re-encoding to H.264/AAC (the fallback on codec failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagerMode {
    StreamCopy,
    ReEncode,
}

/// The classification of an FFmpeg failure, centralized in one function so a future move
/// to structured FFmpeg exit signatures is a one-function change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegFailureKind {
    FileNotReady,
    CodecError,
    Fatal,
}

/// Classifies an FFmpeg failure from its captured stderr. Substring matching is fragile
/// across FFmpeg versions, which is a known, accepted tradeoff for this version — see the
/// design notes on the re-encode trigger heuristic.
pub fn classify_ffmpeg_failure(stderr: &str) -> FfmpegFailureKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("invalid data") || lower.contains("error opening input") {
        FfmpegFailureKind::FileNotReady
    } else if lower.contains("codec") || lower.contains("format") {
        FfmpegFailureKind::CodecError
    } else {
        FfmpegFailureKind::Fatal
    }
}

fn build_args(mode: PackagerMode, input: &Path, output_dir: &Path) -> Vec<String> {
    let playlist = output_dir.join("playlist.m3u8");
    let segment_pattern = output_dir.join("segment%03d.ts");

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
    ];

    match mode {
        PackagerMode::StreamCopy => {
            args.extend(["-c".into(), "copy".into()]);
        }
        PackagerMode::ReEncode => {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "ultrafast".into(),
                "-crf".into(),
                "28".into(),
                "-c:a".into(),
                "aac".into(),
            ]);
        }
    }

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        "10".into(),
        "-hls_list_size".into(),
        "6".into(),
        "-hls_flags".into(),
        "delete_segments+append_list".into(),
        "-fflags".into(),
        "+genpts".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-hls_segment_filename".into(),
        segment_pattern.to_string_lossy().into_owned(),
        "-progress".into(),
        "pipe:2".into(),
        playlist.to_string_lossy().into_owned(),
    ]);

    args
}

struct Job {
    mode: Mutex<PackagerMode>,
    attempts: AtomicU32,
    last_percent: AtomicU8,
    child: Mutex<Option<Child>>,
}

/// Supervises FFmpeg invocations that turn a (partially downloaded) input file into an HLS
/// playlist and segments, with stream-copy-first and single re-encode fallback. One job per
/// stream, keyed by stream ID.
pub struct HlsPackager {
    ffmpeg_path: PathBuf,
    registry: Arc<Registry>,
    jobs: Mutex<HashMap<Uuid, Arc<Job>>>,
}

impl HlsPackager {
    pub fn new(ffmpeg_path: PathBuf, registry: Arc<Registry>) -> Self {
        Self {
            ffmpeg_path,
            registry,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self) -> Vec<Uuid> {
        self.jobs.lock().keys().copied().collect()
    }

    /// Supervises one packager run. Returns `Ok(())` when FFmpeg reaches EOF and flushes the
    /// last segment; `Err` carries the failure kind the coordinator decides on.
    pub async fn convert(
        &self,
        stream_id: Uuid,
        input_path: &Path,
        output_dir: &Path,
        mode: PackagerMode,
    ) -> Result<()> {
        let job = Arc::new(Job {
            mode: Mutex::new(mode),
            attempts: AtomicU32::new(0),
            last_percent: AtomicU8::new(0),
            child: Mutex::new(None),
        });
        self.jobs.lock().insert(stream_id, job.clone());
        job.attempts.fetch_add(1, Ordering::SeqCst);

        let result = self.run_once(stream_id, input_path, output_dir, mode, &job).await;

        self.jobs.lock().remove(&stream_id);
        result
    }

    async fn run_once(
        &self,
        stream_id: Uuid,
        input_path: &Path,
        output_dir: &Path,
        mode: PackagerMode,
        job: &Arc<Job>,
    ) -> Result<()> {
        let args = build_args(mode, input_path, output_dir);

        let mut child = tokio::process::Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::PackagerFatal(format!("failed to spawn ffmpeg: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::PackagerFatal("ffmpeg stderr not piped".to_string()))?;

        self.registry
            .update_status(stream_id, StreamStatus::Converting, None);

        *job.child.lock() = Some(child);

        let captured = self.drive_process(stream_id, stderr, job).await;

        let taken = job.child.lock().take();
        let status = match taken {
            Some(mut child) => child.wait().await,
            None => return Err(Error::Cancelled),
        };

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(classify(&captured)),
            Err(e) => Err(Error::PackagerFatal(format!("ffmpeg wait() failed: {e}"))),
        }
    }

    /// Reads FFmpeg's `-progress`/stderr stream, surfacing `converting` → `ready` once
    /// enough progress has been observed, and returns the captured stderr for
    /// failure-classification if the process later exits non-zero.
    async fn drive_process(
        &self,
        stream_id: Uuid,
        stderr: tokio::process::ChildStderr,
        job: &Arc<Job>,
    ) -> String {
        let duration_re = Regex::new(r"Duration:\s*(\d+):(\d+):(\d+\.\d+)").unwrap();
        let time_re = Regex::new(r"(?:out_)?time=(\d+):(\d+):(\d+\.\d+)").unwrap();
        let frame_re = Regex::new(r"frame=\s*(\d+)").unwrap();

        let mut reader = BufReader::new(stderr).lines();
        let mut captured = String::new();
        let mut total_secs: Option<f64> = None;
        let mut declared_ready = false;

        while let Ok(Some(line)) = reader.next_line().await {
            captured.push_str(&line);
            captured.push('\n');

            if total_secs.is_none() {
                if let Some(caps) = duration_re.captures(&line) {
                    total_secs = Some(to_seconds(&caps));
                }
            }

            let mut percent: Option<u8> = None;
            if let (Some(total), Some(caps)) = (total_secs, time_re.captures(&line)) {
                let elapsed = to_seconds(&caps);
                if total > 0.0 {
                    percent = Some(((elapsed / total) * 100.0).clamp(0.0, 100.0) as u8);
                }
            }

            let has_frames = frame_re.is_match(&line);

            if let Some(p) = percent {
                job.last_percent.store(p, Ordering::SeqCst);
                self.registry.update_progress(stream_id, p);
            }

            if !declared_ready
                && ((percent.unwrap_or(0) >= 10) || (total_secs.is_none() && has_frames))
            {
                declared_ready = true;
                debug!(stream_id=%stream_id, "packager reports enough progress, marking ready");
                self.registry
                    .update_status(stream_id, StreamStatus::Ready, None);
            }
        }

        captured
    }

    /// Sends SIGTERM, gives ffmpeg a grace period to flush and exit, and only escalates to
    /// SIGKILL if it's still alive afterwards. Idempotent.
    pub async fn stop(&self, stream_id: Uuid) {
        let job = self.jobs.lock().remove(&stream_id);
        let Some(job) = job else {
            return;
        };
        let taken = job.child.lock().take();
        let Some(mut child) = taken else {
            return;
        };

        if let Some(pid) = child.id() {
            terminate(pid as i32);
        }

        if tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await.is_err() {
            warn!(stream_id=%stream_id, "ffmpeg did not exit within grace period, sending SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn to_seconds(caps: &regex::Captures) -> f64 {
    let h: f64 = caps[1].parse().unwrap_or(0.0);
    let m: f64 = caps[2].parse().unwrap_or(0.0);
    let s: f64 = caps[3].parse().unwrap_or(0.0);
    h * 3600.0 + m * 60.0 + s
}

fn classify(stderr: &str) -> Error {
    match classify_ffmpeg_failure(stderr) {
        FfmpegFailureKind::FileNotReady => Error::FileNotReady(tail(stderr)),
        FfmpegFailureKind::CodecError => Error::CodecError(tail(stderr)),
        FfmpegFailureKind::Fatal => Error::PackagerFatal(tail(stderr)),
    }
}

fn tail(stderr: &str) -> String {
    stderr.lines().last().unwrap_or("ffmpeg failed").to_string()
}

#[cfg(unix)]
fn terminate(pid: i32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_pid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_data_as_file_not_ready() {
        let stderr = "movie.mp4: Invalid data found when processing input\n";
        assert_eq!(
            classify_ffmpeg_failure(stderr),
            FfmpegFailureKind::FileNotReady
        );
    }

    #[test]
    fn classifies_error_opening_input_as_file_not_ready() {
        let stderr = "Error opening input: No such file or directory\n";
        assert_eq!(
            classify_ffmpeg_failure(stderr),
            FfmpegFailureKind::FileNotReady
        );
    }

    #[test]
    fn classifies_codec_mismatch_as_codec_error() {
        let stderr = "Unknown encoder 'libx264', codec not currently supported\n";
        assert_eq!(classify_ffmpeg_failure(stderr), FfmpegFailureKind::CodecError);
    }

    #[test]
    fn classifies_format_mismatch_as_codec_error() {
        let stderr = "Invalid format for output stream\n";
        assert_eq!(classify_ffmpeg_failure(stderr), FfmpegFailureKind::CodecError);
    }

    #[test]
    fn unrecognized_failure_is_fatal() {
        let stderr = "Segmentation fault\n";
        assert_eq!(classify_ffmpeg_failure(stderr), FfmpegFailureKind::Fatal);
    }

    #[test]
    fn stream_copy_args_include_dash_c_copy() {
        let args = build_args(
            PackagerMode::StreamCopy,
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out"),
        );
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(args.iter().any(|a| a == "hls"));
    }

    #[test]
    fn re_encode_args_use_libx264_and_aac() {
        let args = build_args(
            PackagerMode::ReEncode,
            Path::new("/tmp/in.mkv"),
            Path::new("/tmp/out"),
        );
        assert!(args.iter().any(|a| a == "libx264"));
        assert!(args.iter().any(|a| a == "aac"));
    }
}
