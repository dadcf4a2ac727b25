//! Auto-tracking feed.
//!
//! Detector output comes in either through [`run_tracking_loop`] (a detector
//! running against camera frames in-process) or pushed over HTTP. Both end up
//! in [`TrackingFeed::on_detections`], which picks one subject, maps it to a
//! target and asks the arbiter to hold it for one detection interval plus a
//! guard margin. When detections stop, the feed simply stops asking and the
//! last session runs out.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use turret_core::{
    select_detection, Centroid, Detection, MotionError, MotionRequest, MotionSource, Position,
    TrackHistory, TrackingConfig,
};

use crate::arbiter::{Arbiter, SessionHandle};
use crate::camera::{Frame, FrameSource};

/// Finds subjects in a camera frame
#[async_trait]
pub trait Detector: Send {
    /// Detections with centroids normalized to the frame size
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, MotionError>;
}

/// What the feed did with one batch of detections
#[derive(Debug)]
pub enum FeedOutcome {
    Requested(SessionHandle),
    /// A request was issued less than one detection interval ago
    RateLimited,
    /// Nothing usable in the batch
    NoDetection,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub enabled: bool,
    pub stale: bool,
    pub detections: u64,
    pub requests: u64,
    pub last_target: Option<Position>,
    pub last_track_id: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct FeedState {
    enabled: bool,
    history: TrackHistory,
    last_request: Option<Instant>,
    last_detection: Option<Instant>,
    last_target: Option<Position>,
    last_track_id: Option<u64>,
    detections: u64,
    requests: u64,
    last_error: Option<String>,
}

pub struct TrackingFeed {
    arbiter: Arbiter,
    config: TrackingConfig,
    state: Mutex<FeedState>,
}

impl TrackingFeed {
    pub fn new(arbiter: Arbiter, config: TrackingConfig) -> Self {
        Self {
            arbiter,
            config,
            state: Mutex::new(FeedState::default()),
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        if state.enabled != enabled {
            log::info!("Auto-tracking {}", if enabled { "enabled" } else { "disabled" });
        }
        state.enabled = enabled;
        if enabled {
            state.last_error = None;
            state.last_request = None;
        }
    }

    /// Single centroid without confidence or track information
    pub fn on_detection(&self, centroid: Centroid) -> FeedOutcome {
        self.on_detections(&[Detection::at(centroid.x, centroid.y)])
    }

    /// Handle the detections of one frame
    pub fn on_detections(&self, detections: &[Detection]) -> FeedOutcome {
        let now = Instant::now();
        let request = {
            let mut state = self.lock();
            if !state.enabled {
                return FeedOutcome::Disabled;
            }
            let selected = select_detection(detections, &state.history).cloned();
            state.history.observe(detections);
            let Some(selected) = selected else {
                return FeedOutcome::NoDetection;
            };
            state.detections += 1;
            state.last_detection = Some(now);

            if state
                .last_request
                .is_some_and(|t| now.duration_since(t) < self.config.detection_interval)
            {
                return FeedOutcome::RateLimited;
            }
            let target = self.config.map_centroid(selected.centroid());
            state.last_request = Some(now);
            state.last_target = Some(target);
            state.last_track_id = selected.track_id;
            state.requests += 1;
            MotionRequest::new(target, self.config.hold_duration(), MotionSource::AutoTrack)
        };

        log::debug!("Tracking subject -> {}", request.target);
        FeedOutcome::Requested(self.arbiter.request_motion(request))
    }

    /// Record a camera or detector failure; the feed issues nothing for it
    pub fn report_error(&self, error: &MotionError) {
        log::warn!("Auto-tracking: {}", error);
        self.lock().last_error = Some(error.to_string());
    }

    /// True when no detection arrived within the configured timeout
    pub fn is_stale(&self) -> bool {
        let state = self.lock();
        match state.last_detection {
            Some(t) => t.elapsed() > self.config.timeout,
            None => true,
        }
    }

    pub fn status(&self) -> TrackingStatus {
        let stale = self.is_stale();
        let state = self.lock();
        TrackingStatus {
            enabled: state.enabled,
            stale,
            detections: state.detections,
            requests: state.requests,
            last_target: state.last_target,
            last_track_id: state.last_track_id,
            last_error: state.last_error.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pull frames, detect, feed; until cancelled or a collaborator fails.
///
/// A failing camera or detector ends the loop with that error. The arbiter
/// is unaffected; whatever session is running just expires.
pub async fn run_tracking_loop<S, D>(
    frames: &mut S,
    detector: &mut D,
    feed: &TrackingFeed,
    cancel: CancellationToken,
) -> Result<(), MotionError>
where
    S: FrameSource + ?Sized,
    D: Detector + ?Sized,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = frames.next_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                feed.report_error(&e);
                return Err(e);
            }
        };
        let detections = match detector.detect(&frame).await {
            Ok(d) => d,
            Err(e) => {
                feed.report_error(&e);
                return Err(e);
            }
        };
        match feed.on_detections(&detections) {
            FeedOutcome::Requested(handle) => {
                log::trace!("Frame {} -> session {}", frame.seq, handle.id())
            }
            FeedOutcome::Disabled => return Ok(()),
            FeedOutcome::RateLimited | FeedOutcome::NoDetection => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use std::collections::VecDeque;
    use std::time::Duration;
    use turret_core::{HoldPolicy, SimulatedActuator};

    fn feed(interval_ms: u64) -> (TrackingFeed, Arbiter, SimulatedActuator) {
        let sim = SimulatedActuator::new();
        let arbiter = Arbiter::new(
            Box::new(sim.clone()),
            HoldPolicy {
                reassert_interval: Duration::from_millis(10),
                fault_threshold: 3,
            },
        );
        let config = TrackingConfig {
            detection_interval: Duration::from_millis(interval_ms),
            guard_margin: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            ..TrackingConfig::default()
        };
        (TrackingFeed::new(arbiter.clone(), config), arbiter, sim)
    }

    struct ScriptedFrames(VecDeque<Result<Frame, MotionError>>);

    #[async_trait]
    impl FrameSource for ScriptedFrames {
        async fn next_frame(&mut self) -> Result<Frame, MotionError> {
            match self.0.pop_front() {
                Some(f) => f,
                None => std::future::pending().await,
            }
        }
    }

    struct FixedDetector(Vec<Detection>);

    #[async_trait]
    impl Detector for FixedDetector {
        async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, MotionError> {
            Ok(self.0.clone())
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Bytes::from_static(b"\xff\xd8\xff\xd9"))
    }

    #[tokio::test]
    async fn test_disabled_feed_ignores_detections() {
        let (feed, arbiter, _sim) = feed(10);
        assert!(matches!(
            feed.on_detection(Centroid::new(0.5, 0.5)),
            FeedOutcome::Disabled
        ));
        assert_eq!(arbiter.active_session(), None);
    }

    #[tokio::test]
    async fn test_detection_maps_to_session() {
        let (feed, arbiter, _sim) = feed(10);
        feed.set_enabled(true);
        let FeedOutcome::Requested(handle) = feed.on_detection(Centroid::new(0.75, 0.25)) else {
            panic!("expected a request");
        };
        assert_eq!(handle.target(), Position::new(45.0, -45.0).unwrap());
        assert_eq!(handle.source(), MotionSource::AutoTrack);
        assert!(handle.remaining() <= Duration::from_millis(30));
        assert_eq!(arbiter.position(), handle.target());
        assert!(!feed.is_stale());
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let (feed, _arbiter, _sim) = feed(50);
        feed.set_enabled(true);
        assert!(matches!(
            feed.on_detection(Centroid::new(0.1, 0.1)),
            FeedOutcome::Requested(_)
        ));
        assert!(matches!(
            feed.on_detection(Centroid::new(0.2, 0.2)),
            FeedOutcome::RateLimited
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            feed.on_detection(Centroid::new(0.2, 0.2)),
            FeedOutcome::Requested(_)
        ));
        let status = feed.status();
        assert_eq!(status.detections, 3);
        assert_eq!(status.requests, 2);
    }

    #[tokio::test]
    async fn test_silence_lets_session_expire() {
        let (feed, arbiter, sim) = feed(10);
        feed.set_enabled(true);
        let FeedOutcome::Requested(handle) = feed.on_detection(Centroid::new(0.5, 0.5)) else {
            panic!("expected a request");
        };
        handle.wait().await;
        assert_eq!(arbiter.active_session(), None);
        let count = sim.command_count();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sim.command_count(), count);
        assert!(feed.is_stale());
    }

    #[tokio::test]
    async fn test_loop_stops_on_camera_error() {
        let (feed, arbiter, _sim) = feed(0);
        feed.set_enabled(true);
        let mut frames = ScriptedFrames(VecDeque::from([
            Ok(frame(1)),
            Ok(frame(2)),
            Err(MotionError::CameraUnavailable("stalled".into())),
        ]));
        let mut detector = FixedDetector(vec![Detection::at(1.0, 0.5)]);
        let r = run_tracking_loop(&mut frames, &mut detector, &feed, CancellationToken::new()).await;
        assert!(matches!(r, Err(MotionError::CameraUnavailable(_))));

        let status = feed.status();
        assert_eq!(status.requests, 2);
        assert!(status.last_error.unwrap().contains("stalled"));
        assert_eq!(arbiter.position(), Position::new(90.0, 0.0).unwrap());
    }

    #[tokio::test]
    async fn test_loop_cancel() {
        let (feed, _arbiter, _sim) = feed(10);
        feed.set_enabled(true);
        let mut frames = ScriptedFrames(VecDeque::new());
        let mut detector = FixedDetector(vec![]);
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let r = run_tracking_loop(&mut frames, &mut detector, &feed, cancel).await;
        assert!(r.is_ok());
    }
}
