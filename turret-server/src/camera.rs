//! Camera capture and frame distribution.
//!
//! The camera is read through an external capture command (by default
//! `ffmpeg` copying the MJPEG stream of `/dev/video{index}` to stdout). The
//! output is split into JPEG frames and published on a broadcast channel;
//! the video feed and the tracking loop each subscribe.
//!
//! Opening follows a fixed order: the primary index, then each backup index,
//! then the primary again, until `max_init_attempts` is used up. A device
//! only counts as open once a first frame has arrived.

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::timeout;
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;

use turret_core::mjpeg::FrameSplitter;
use turret_core::MotionError;

use crate::error::TurretError;

const FRAME_CHANNEL_SIZE: usize = 8;
const READ_CHUNK: usize = 64 * 1024;
/// Entries returned by [`CameraManager::recent_errors`]
pub const RECENT_ERRORS: usize = 50;

fn default_capture_command() -> Vec<String> {
    [
        "ffmpeg",
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "v4l2",
        "-input_format",
        "mjpeg",
        "-i",
        "/dev/video{index}",
        "-c:v",
        "copy",
        "-f",
        "mjpeg",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CameraConfig {
    pub primary_index: u32,
    pub backup_indices: Vec<u32>,
    pub max_init_attempts: u32,
    /// Pause between two open attempts, in milliseconds
    pub init_retry_delay_ms: u64,
    /// Wait twice as long before retrying, to give the driver time to settle
    pub aggressive_reset: bool,
    /// Program and arguments; `{index}` is replaced with the device index
    pub capture_command: Vec<String>,
    /// No frame for this long counts as a stalled camera
    pub frame_timeout_ms: u64,
    /// Pause before starting over after every attempt failed
    pub reopen_interval_ms: u64,
    pub error_log_capacity: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            primary_index: 0,
            backup_indices: vec![1, 2, 3],
            max_init_attempts: 3,
            init_retry_delay_ms: 2000,
            aggressive_reset: true,
            capture_command: default_capture_command(),
            frame_timeout_ms: 5000,
            reopen_interval_ms: 30_000,
            error_log_capacity: 200,
        }
    }
}

impl CameraConfig {
    /// Device index to try for each attempt, in order
    pub fn open_candidates(&self) -> Vec<u32> {
        (1..=self.max_init_attempts.max(1))
            .map(|attempt| match attempt {
                1 => self.primary_index,
                n => self
                    .backup_indices
                    .get(n as usize - 2)
                    .copied()
                    .unwrap_or(self.primary_index),
            })
            .collect()
    }

    fn retry_delay(&self) -> Duration {
        let delay = Duration::from_millis(self.init_retry_delay_ms);
        if self.aggressive_reset {
            delay * 2
        } else {
            delay
        }
    }

    fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms.max(1))
    }

    fn command_for(&self, index: u32) -> Result<Command, MotionError> {
        let mut parts = self
            .capture_command
            .iter()
            .map(|p| p.replace("{index}", &index.to_string()));
        let program = parts
            .next()
            .ok_or_else(|| MotionError::CameraUnavailable("empty capture command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

/// Runtime changes accepted by `/configure_camera`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraSettings {
    pub primary_index: Option<u32>,
    pub aggressive_reset: Option<bool>,
    pub max_init_attempts: Option<u32>,
}

/// One JPEG image from the camera
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(seq: u64, data: Bytes) -> Self {
        Self {
            seq,
            data,
            captured_at: Utc::now(),
        }
    }
}

/// Lazy, possibly failing sequence of frames
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Frame, MotionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum CameraStatus {
    /// Started with `--no-camera`
    Disabled,
    Closed,
    Opening { attempt: u32, index: u32 },
    Open { index: u32 },
    /// Every attempt failed; waiting for a reset or the reopen interval
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDiagnostics {
    pub timestamp: DateTime<Utc>,
    pub status: CameraStatus,
    pub available_cameras: Vec<u32>,
    pub config: CameraConfig,
    pub frames_captured: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_frame_age_ms: Option<u64>,
    pub opened_at: Option<DateTime<Utc>>,
    pub subscribers: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct CaptureStats {
    frames: u64,
    last_frame_at: Option<DateTime<Utc>>,
    last_frame: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
}

struct CameraInner {
    config: RwLock<CameraConfig>,
    status: watch::Sender<CameraStatus>,
    frames: broadcast::Sender<Frame>,
    errors: Mutex<VecDeque<CameraErrorEntry>>,
    stats: Mutex<CaptureStats>,
    reset: Notify,
}

#[derive(Clone)]
pub struct CameraManager {
    inner: Arc<CameraInner>,
}

impl CameraManager {
    pub fn new(config: CameraConfig) -> Self {
        Self::with_status(config, CameraStatus::Closed)
    }

    /// A manager that never opens anything
    pub fn disabled() -> Self {
        Self::with_status(CameraConfig::default(), CameraStatus::Disabled)
    }

    fn with_status(config: CameraConfig, status: CameraStatus) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_SIZE);
        let (status, _) = watch::channel(status);
        CameraManager {
            inner: Arc::new(CameraInner {
                config: RwLock::new(config),
                status,
                frames,
                errors: Mutex::new(VecDeque::new()),
                stats: Mutex::new(CaptureStats::default()),
                reset: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> CameraConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> CameraStatus {
        *self.inner.status.borrow()
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status(), CameraStatus::Open { .. })
    }

    /// Frame stream for one consumer.
    ///
    /// Fails with `CameraUnavailable` unless the camera is open.
    pub fn subscribe(&self) -> Result<CameraFrames, MotionError> {
        match self.status() {
            CameraStatus::Open { .. } => Ok(CameraFrames {
                rx: self.inner.frames.subscribe(),
                timeout: self.config().frame_timeout(),
            }),
            status => Err(MotionError::CameraUnavailable(format!(
                "camera status is {:?}",
                status
            ))),
        }
    }

    pub fn log_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("Camera: {}", message);
        let capacity = self.config().error_log_capacity.max(1);
        let mut errors = self.lock_errors();
        while errors.len() >= capacity {
            errors.pop_front();
        }
        errors.push_back(CameraErrorEntry {
            timestamp: Utc::now(),
            message,
        });
    }

    /// Most recent error log entries, oldest first
    pub fn recent_errors(&self) -> Vec<CameraErrorEntry> {
        let errors = self.lock_errors();
        let skip = errors.len().saturating_sub(RECENT_ERRORS);
        errors.iter().skip(skip).cloned().collect()
    }

    /// Apply runtime settings; takes effect on the next open
    pub fn configure(&self, settings: &CameraSettings) -> CameraConfig {
        let mut changes = Vec::new();
        {
            let mut config = self
                .inner
                .config
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(index) = settings.primary_index {
                config.primary_index = index;
                changes.push(format!("Camera primary_index manually set to {}", index));
            }
            if let Some(aggressive) = settings.aggressive_reset {
                config.aggressive_reset = aggressive;
                changes.push(format!(
                    "Camera aggressive_reset manually set to {}",
                    aggressive
                ));
            }
            if let Some(attempts) = settings.max_init_attempts {
                config.max_init_attempts = attempts;
                changes.push(format!(
                    "Camera max_init_attempts manually set to {}",
                    attempts
                ));
            }
        }
        for change in changes {
            self.log_error(change);
        }
        self.config()
    }

    /// Close and reopen the camera; resolves once the new attempt finished
    pub async fn reset(&self) -> CameraStatus {
        if self.status() == CameraStatus::Disabled {
            return CameraStatus::Disabled;
        }
        let mut status = self.inner.status.subscribe();
        self.inner.reset.notify_one();

        let config = self.config();
        let budget = (config.retry_delay() + config.frame_timeout())
            * config.max_init_attempts.max(1)
            + Duration::from_secs(1);
        let _ = timeout(budget, async {
            // First the manager leaves its current state, then it settles
            let _ = status.changed().await;
            let _ = status
                .wait_for(|s| !matches!(s, CameraStatus::Opening { .. } | CameraStatus::Closed))
                .await;
        })
        .await;
        self.status()
    }

    pub fn diagnostics(&self) -> CameraDiagnostics {
        let stats = self.lock_stats();
        CameraDiagnostics {
            timestamp: Utc::now(),
            status: self.status(),
            available_cameras: available_cameras(),
            config: self.config(),
            frames_captured: stats.frames,
            last_frame_at: stats.last_frame_at,
            last_frame_age_ms: stats.last_frame.map(|t| t.elapsed().as_millis() as u64),
            opened_at: stats.opened_at,
            subscribers: self.inner.frames.receiver_count(),
            last_error: self.lock_errors().back().map(|e| e.message.clone()),
        }
    }

    /// Subsystem entry point
    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), TurretError> {
        let cancel = CancellationToken::new();
        tokio::select! {
            _ = subsys.on_shutdown_requested() => {
                cancel.cancel();
            }
            _ = self.run_until(cancel.clone()) => {}
        }
        Ok(())
    }

    /// Keep the camera open until `cancel` fires
    pub async fn run_until(&self, cancel: CancellationToken) {
        if self.status() == CameraStatus::Disabled {
            cancel.cancelled().await;
            return;
        }
        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                capture = self.open() => capture,
            };
            match opened {
                Some(mut capture) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.inner.reset.notified() => {
                            log::info!("Camera reset requested");
                        }
                        e = self.pump(&mut capture) => {
                            self.log_error(format!("Camera index {} stopped: {}", capture.index, e));
                        }
                    }
                    capture.close().await;
                    self.inner.status.send_replace(CameraStatus::Closed);
                }
                None => {
                    let wait = Duration::from_millis(self.config().reopen_interval_ms);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.inner.reset.notified() => {
                            log::info!("Camera reset requested");
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        self.inner.status.send_replace(CameraStatus::Closed);
    }

    async fn open(&self) -> Option<Capture> {
        let config = self.config();
        let candidates = config.open_candidates();
        let attempts = candidates.len();
        let mut last_error = None;

        for (n, index) in candidates.into_iter().enumerate() {
            let attempt = n as u32 + 1;
            if n > 0 {
                tokio::time::sleep(config.retry_delay()).await;
            }
            self.inner
                .status
                .send_replace(CameraStatus::Opening { attempt, index });
            log::info!(
                "Opening camera index {} (attempt {}/{})",
                index,
                attempt,
                attempts
            );

            match Capture::start(&config, index).await {
                Ok((capture, frame)) => {
                    self.log_error(format!("Camera successfully initialized with index {}", index));
                    {
                        let mut stats = self.lock_stats();
                        stats.opened_at = Some(Utc::now());
                    }
                    self.inner.status.send_replace(CameraStatus::Open { index });
                    self.publish(frame);
                    return Some(capture);
                }
                Err(e) => {
                    self.log_error(format!("Failed to open camera with index {}: {}", index, e));
                    last_error = Some(e);
                }
            }
        }

        self.log_error(format!(
            "Failed to initialize camera after {} attempts. Last error: {}",
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ));
        self.inner.status.send_replace(CameraStatus::Failed);
        None
    }

    async fn pump(&self, capture: &mut Capture) -> MotionError {
        loop {
            match capture.next_jpeg().await {
                Ok(data) => self.publish(data),
                Err(e) => return e,
            }
        }
    }

    fn publish(&self, data: Bytes) {
        let seq = {
            let mut stats = self.lock_stats();
            stats.frames += 1;
            stats.last_frame_at = Some(Utc::now());
            stats.last_frame = Some(Instant::now());
            stats.frames
        };
        // No subscribers is fine
        let _ = self.inner.frames.send(Frame::new(seq, data));
    }

    fn lock_errors(&self) -> MutexGuard<'_, VecDeque<CameraErrorEntry>> {
        self.inner.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, CaptureStats> {
        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A running capture process
struct Capture {
    index: u32,
    child: Child,
    stdout: ChildStdout,
    splitter: FrameSplitter,
    pending: VecDeque<Vec<u8>>,
    timeout: Duration,
}

impl Capture {
    /// Spawn the capture command and wait for its first frame
    async fn start(config: &CameraConfig, index: u32) -> Result<(Capture, Bytes), MotionError> {
        let mut child = config
            .command_for(index)?
            .spawn()
            .map_err(|e| MotionError::CameraUnavailable(format!("cannot start capture: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MotionError::CameraUnavailable("capture has no stdout".into()))?;
        let mut capture = Capture {
            index,
            child,
            stdout,
            splitter: FrameSplitter::default(),
            pending: VecDeque::new(),
            timeout: config.frame_timeout(),
        };
        match capture.next_jpeg().await {
            Ok(frame) => Ok((capture, frame)),
            Err(e) => {
                capture.close().await;
                Err(MotionError::CameraUnavailable(format!(
                    "opened but test frame read failed: {}",
                    e
                )))
            }
        }
    }

    async fn next_jpeg(&mut self) -> Result<Bytes, MotionError> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Bytes::from(frame));
            }
            let n = match timeout(self.timeout, self.stdout.read(&mut buf)).await {
                Err(_) => {
                    return Err(MotionError::CameraUnavailable(format!(
                        "no frame for {:?}",
                        self.timeout
                    )))
                }
                Ok(Err(e)) => return Err(MotionError::CameraUnavailable(e.to_string())),
                Ok(Ok(0)) => {
                    return Err(MotionError::CameraUnavailable(
                        "capture process exited".into(),
                    ))
                }
                Ok(Ok(n)) => n,
            };
            self.pending.extend(self.splitter.push(&buf[..n]));
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            log::debug!("Capture process for index {} already gone: {}", self.index, e);
        }
    }
}

/// Frame stream of one subscriber
pub struct CameraFrames {
    rx: broadcast::Receiver<Frame>,
    timeout: Duration,
}

#[async_trait]
impl FrameSource for CameraFrames {
    async fn next_frame(&mut self) -> Result<Frame, MotionError> {
        loop {
            match timeout(self.timeout, self.rx.recv()).await {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    log::trace!("Frame subscriber lagged, skipped {} frames", n);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(MotionError::CameraUnavailable("camera closed".into()))
                }
                Err(_) => {
                    return Err(MotionError::CameraUnavailable(format!(
                        "no frame for {:?}",
                        self.timeout
                    )))
                }
            }
        }
    }
}

/// Indices of the `/dev/video*` devices present
pub fn available_cameras() -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut found: Vec<u32> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("video"))
                .and_then(|n| n.parse().ok())
        })
        .collect();
    found.sort_unstable();
    found
}
