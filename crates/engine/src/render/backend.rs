//! Supervised ffmpeg execution

use super::command::{build_command, uses_encoder, RenderJob};
use super::encoder::{select_encoder, EncoderChoice};
use super::probe::probe_duration;
use super::progress::ProgressParser;
use super::{RenderError, RenderOutcome};
use crate::config::{Config, TimeoutConfig};
use crate::hardware::HardwareCapabilities;
use crate::task::{Operation, OperationKind};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr kept for failure reports
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on a timeout grown from the source duration
const MAX_SCALED_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// How long to keep reading output after the process exited
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Base timeout for an operation kind before duration scaling
fn base_timeout(kind: OperationKind, timeouts: &TimeoutConfig) -> Duration {
    let secs = match kind {
        OperationKind::Transcode => timeouts.transcode_secs,
        OperationKind::Resize => timeouts.resize_secs,
        OperationKind::ApplyFilter => timeouts.filter_secs,
        OperationKind::ExtractFrames => timeouts.extract_frames_secs,
        OperationKind::Concat => timeouts.concat_secs,
        OperationKind::Thumbnail => timeouts.thumbnail_secs,
    };
    Duration::from_secs(secs)
}

/// Timeout for one execution
///
/// An explicit per-task timeout wins. Otherwise the per-kind base, grown to
/// `source_duration * duration_factor` for long sources.
pub fn effective_timeout(
    job_timeout: Option<Duration>,
    kind: OperationKind,
    source_duration_secs: Option<f64>,
    timeouts: &TimeoutConfig,
) -> Duration {
    if let Some(timeout) = job_timeout {
        return timeout;
    }
    let base = base_timeout(kind, timeouts);
    match source_duration_secs {
        Some(secs) if secs.is_finite() && secs > 0.0 => {
            // Durations too large for a Duration come from corrupt metadata
            match Duration::try_from_secs_f64(secs * timeouts.duration_factor) {
                Ok(scaled) if scaled > base => scaled.min(MAX_SCALED_TIMEOUT),
                _ => base,
            }
        }
        _ => base,
    }
}

/// How the supervision loop ended
enum Exit {
    Finished(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Spawns and supervises one ffmpeg process per task
pub struct RendererBackend {
    ffmpeg: PathBuf,
    ffprobe: Option<PathBuf>,
    capabilities: RwLock<HardwareCapabilities>,
    timeouts: TimeoutConfig,
    probe_timeout: Duration,
    temp_dir: PathBuf,
    disallow_hardware: bool,
    spawned: AtomicU64,
}

impl RendererBackend {
    pub fn new(config: &Config, capabilities: HardwareCapabilities) -> Self {
        Self {
            ffmpeg: config.tools.ffmpeg_path.clone(),
            ffprobe: Some(config.tools.ffprobe_path.clone()),
            capabilities: RwLock::new(capabilities),
            timeouts: config.timeouts.clone(),
            probe_timeout: config.tools.probe_timeout(),
            temp_dir: config.engine.temp_dir.clone(),
            disallow_hardware: config.hardware.disallow_hardware_encoding,
            spawned: AtomicU64::new(0),
        }
    }

    /// Use resolved tool paths; `ffprobe: None` disables duration probing
    pub fn with_tools(mut self, ffmpeg: PathBuf, ffprobe: Option<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg;
        self.ffprobe = ffprobe;
        self
    }

    pub fn capabilities(&self) -> HardwareCapabilities {
        self.capabilities.read().clone()
    }

    pub fn set_capabilities(&self, capabilities: HardwareCapabilities) {
        *self.capabilities.write() = capabilities;
    }

    /// Subprocesses spawned since construction
    pub fn spawned_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Encoder the backend would use for `job` right now
    pub fn choose_encoder(&self, job: &RenderJob) -> EncoderChoice {
        let caps = self.capabilities.read();
        select_encoder(&caps, job.encoding.codec, self.disallow_hardware)
    }

    /// Run `job` to completion
    ///
    /// `on_progress` receives values in [0, 1] as ffmpeg reports them.
    /// Cancelling `cancel` kills the process and yields
    /// [`RenderError::Cancelled`]; exceeding the timeout kills it and yields
    /// [`RenderError::Timeout`].
    pub async fn execute<F>(
        &self,
        job: &RenderJob,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<RenderOutcome, RenderError>
    where
        F: FnMut(f32) + Send,
    {
        let started = Instant::now();
        let choice = if uses_encoder(&job.operation) {
            self.choose_encoder(job)
        } else {
            EncoderChoice::software(job.encoding.codec)
        };
        let prepared = build_command(job, &choice, &self.temp_dir, self.disallow_hardware)?;

        self.check_inputs(&job.operation, &job.input_path).await?;
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let source_duration = self.source_duration(job).await;
        let timeout = effective_timeout(
            job.timeout,
            job.operation.kind(),
            source_duration,
            &self.timeouts,
        );

        for dir in &prepared.create_dirs {
            tokio::fs::create_dir_all(dir).await?;
        }
        if let Some(list) = &prepared.concat_list {
            tokio::fs::write(&list.path, &list.contents).await?;
        }

        debug!(
            task_id = %job.task_id,
            program = %self.ffmpeg.display(),
            args = ?prepared.display_args(),
            timeout_secs = timeout.as_secs_f64(),
            "Spawning ffmpeg"
        );
        let result = self
            .supervise(job, &prepared.args, timeout, source_duration, cancel, &mut on_progress)
            .await;

        if let Some(list) = &prepared.concat_list {
            if let Err(e) = tokio::fs::remove_file(&list.path).await {
                debug!(path = %list.path.display(), error = %e, "Failed to remove concat list");
            }
        }

        result?;
        on_progress(1.0);

        let encoder = prepared.encoder;
        Ok(RenderOutcome {
            hardware: encoder.as_ref().map(|c| c.hardware).unwrap_or(false),
            fallback_reason: encoder.as_ref().and_then(|c| c.fallback_reason.clone()),
            encoder: encoder.map(|c| c.encoder),
            duration_ms: started.elapsed().as_millis() as u64,
            from_cache: false,
        })
    }

    async fn supervise<F>(
        &self,
        job: &RenderJob,
        args: &[std::ffi::OsString],
        timeout: Duration,
        source_duration: Option<f64>,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<(), RenderError>
    where
        F: FnMut(f32) + Send,
    {
        let mut child = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => RenderError::ToolUnavailable {
                    tool: self.ffmpeg.display().to_string(),
                    reason: e.to_string(),
                },
                _ => RenderError::Io(e),
            })?;
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RenderError::Io(std::io::Error::other("ffmpeg stdout not captured")))?;
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));

        let mut lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;
        let mut parser = ProgressParser::new();
        let mut last_reported = -1.0f32;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Exit::Cancelled,
                _ = &mut deadline => break Exit::TimedOut,
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if parser.parse_line(&line) {
                            let progress = parser.fraction(source_duration);
                            if progress > last_reported {
                                last_reported = progress;
                                on_progress(progress);
                            }
                        }
                    }
                    Ok(None) | Err(_) => stdout_open = false,
                },
                status = child.wait() => break Exit::Finished(status),
            }
        };

        let status = match exit {
            Exit::Finished(status) => status?,
            Exit::Cancelled => {
                info!(task_id = %job.task_id, "Cancellation requested, killing ffmpeg");
                terminate(&mut child, job).await;
                abort_collector(stderr_task);
                return Err(RenderError::Cancelled);
            }
            Exit::TimedOut => {
                warn!(
                    task_id = %job.task_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "ffmpeg exceeded its timeout, killing"
                );
                terminate(&mut child, job).await;
                abort_collector(stderr_task);
                return Err(RenderError::Timeout { after: timeout });
            }
        };

        // Pick up the final progress block written just before exit
        if stdout_open {
            let _ = tokio::time::timeout(DRAIN_GRACE, async {
                while let Ok(Some(line)) = lines.next_line().await {
                    parser.parse_line(&line);
                }
            })
            .await;
        }

        if status.success() {
            debug!(task_id = %job.task_id, out_time_secs = parser.out_time_secs(), "ffmpeg finished");
            abort_collector(stderr_task);
            return Ok(());
        }

        let stderr = match stderr_task {
            Some(handle) => tokio::time::timeout(DRAIN_GRACE, handle)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .unwrap_or_default(),
            None => String::new(),
        };
        warn!(
            task_id = %job.task_id,
            code = ?status.code(),
            stderr = %stderr,
            "ffmpeg failed"
        );
        Err(RenderError::SubprocessFailure {
            code: status.code(),
            stderr,
        })
    }

    /// Inputs must exist before anything is spawned
    async fn check_inputs(&self, operation: &Operation, input: &Path) -> Result<(), RenderError> {
        let inputs: Vec<&Path> = match operation {
            Operation::Concat(p) => p.sources.iter().map(PathBuf::as_path).collect(),
            _ => vec![input],
        };
        for path in inputs {
            if tokio::fs::metadata(path).await.is_err() {
                return Err(RenderError::Validation(format!(
                    "input does not exist: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    async fn source_duration(&self, job: &RenderJob) -> Option<f64> {
        let ffprobe = self.ffprobe.as_deref()?;
        match &job.operation {
            Operation::Thumbnail(_) => None,
            Operation::Concat(p) => {
                let mut total = 0.0;
                for source in &p.sources {
                    total += probe_duration(ffprobe, source, self.probe_timeout).await?;
                }
                Some(total)
            }
            _ => probe_duration(ffprobe, &job.input_path, self.probe_timeout).await,
        }
    }
}

async fn terminate(child: &mut Child, job: &RenderJob) {
    if let Err(e) = child.kill().await {
        warn!(task_id = %job.task_id, error = %e, "Failed to kill ffmpeg");
    }
}

fn abort_collector(task: Option<tokio::task::JoinHandle<String>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Read a stream to the end, keeping its last lines
async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodingConfig;
    use crate::task::{ConcatParams, TaskId, ThumbnailParams, TranscodeParams};
    use std::sync::{Arc, Mutex};

    fn job(operation: Operation, input: &Path, output: &Path) -> RenderJob {
        RenderJob {
            task_id: TaskId::new(),
            operation,
            input_path: input.to_path_buf(),
            output_path: output.to_path_buf(),
            encoding: EncodingConfig::default(),
            timeout: None,
        }
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn backend(dir: &Path, ffmpeg: PathBuf) -> RendererBackend {
        let mut config = Config::default();
        config.engine.temp_dir = dir.join("tmp");
        RendererBackend::new(&config, HardwareCapabilities::none()).with_tools(ffmpeg, None)
    }

    #[test]
    fn test_effective_timeout() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(
            effective_timeout(None, OperationKind::Concat, None, &timeouts),
            Duration::from_secs(600)
        );
        // 2h source x3 outgrows the 1h transcode base
        assert_eq!(
            effective_timeout(None, OperationKind::Transcode, Some(7200.0), &timeouts),
            Duration::from_secs(21600)
        );
        assert_eq!(
            effective_timeout(None, OperationKind::Transcode, Some(60.0), &timeouts),
            Duration::from_secs(3600)
        );
        assert_eq!(
            effective_timeout(
                Some(Duration::from_secs(1)),
                OperationKind::Transcode,
                Some(7200.0),
                &timeouts
            ),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_effective_timeout_survives_absurd_durations() {
        let timeouts = TimeoutConfig::default();
        // Finite, but far beyond what a Duration holds
        assert_eq!(
            effective_timeout(None, OperationKind::Transcode, Some(1e300), &timeouts),
            Duration::from_secs(3600)
        );
        assert_eq!(
            effective_timeout(None, OperationKind::Transcode, Some(1e9), &timeouts),
            MAX_SCALED_TIMEOUT
        );
        assert_eq!(
            effective_timeout(None, OperationKind::Concat, Some(f64::INFINITY), &timeouts),
            Duration::from_secs(600)
        );
    }

    #[tokio::test]
    async fn test_validation_error_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), PathBuf::from("/nonexistent/ffmpeg"));
        let job = job(
            Operation::Concat(ConcatParams { sources: vec![] }),
            Path::new(""),
            &dir.path().join("out.mp4"),
        );

        let err = backend
            .execute(&job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, RenderError::Validation(_)));
        assert_eq!(backend.spawned_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_input_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), PathBuf::from("/nonexistent/ffmpeg"));
        let job = job(
            Operation::Transcode(TranscodeParams::default()),
            &dir.path().join("missing.mov"),
            &dir.path().join("out.mp4"),
        );

        let err = backend
            .execute(&job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Validation(msg) if msg.contains("missing.mov")));
        assert_eq!(backend.spawned_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_tool_is_tool_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mov");
        std::fs::write(&input, b"x").unwrap();
        let backend = backend(dir.path(), dir.path().join("no-ffmpeg-here"));
        let job = job(
            Operation::Transcode(TranscodeParams::default()),
            &input,
            &dir.path().join("out.mp4"),
        );

        let err = backend
            .execute(&job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::ToolUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_progress_and_success() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mov");
        std::fs::write(&input, b"x").unwrap();
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            "echo out_time_us=500000\necho progress=continue\necho progress=end\nexit 0",
        );
        let backend = backend(dir.path(), ffmpeg);
        let job = job(
            Operation::Thumbnail(ThumbnailParams::default()),
            &input,
            &dir.path().join("thumbs/a.jpg"),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let outcome = backend
            .execute(&job, &CancellationToken::new(), move |p| sink.lock().unwrap().push(p))
            .await
            .unwrap();

        assert!(!outcome.from_cache);
        assert!(outcome.encoder.is_none());
        assert_eq!(backend.spawned_count(), 1);
        assert!(dir.path().join("thumbs").is_dir());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mov");
        std::fs::write(&input, b"x").unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "echo 'Unknown encoder libx264' >&2\nexit 3");
        let backend = backend(dir.path(), ffmpeg);
        let job = job(
            Operation::Transcode(TranscodeParams::default()),
            &input,
            &dir.path().join("out.mp4"),
        );

        let err = backend
            .execute(&job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        match err {
            RenderError::SubprocessFailure { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("Unknown encoder libx264"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mov");
        std::fs::write(&input, b"x").unwrap();
        let pid_file = dir.path().join("pid");
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            &format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()),
        );
        let backend = backend(dir.path(), ffmpeg);
        let mut job = job(
            Operation::Transcode(TranscodeParams::default()),
            &input,
            &dir.path().join("out.mp4"),
        );
        job.timeout = Some(Duration::from_millis(500));

        let started = Instant::now();
        let err = backend
            .execute(&job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, RenderError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mov");
        std::fs::write(&input, b"x").unwrap();
        let ffmpeg = fake_ffmpeg(dir.path(), "exec sleep 30");
        let backend = backend(dir.path(), ffmpeg);
        let job = job(
            Operation::Transcode(TranscodeParams::default()),
            &input,
            &dir.path().join("out.mp4"),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = backend.execute(&job, &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, RenderError::Cancelled));
    }
}
