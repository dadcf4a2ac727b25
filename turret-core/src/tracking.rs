//! Auto-tracking: detection selection and centroid-to-angle mapping.
//!
//! Detections arrive as normalized centroids in `[0, 1] × [0, 1]` with (0, 0)
//! at the top-left of the frame. They are mapped linearly onto the angle range:
//!
//! ```text
//! pan  = (x - 0.5) · 2 · max_pan  · gain   (negated when invert_pan)
//! tilt = (y - 0.5) · 2 · max_tilt · gain   (negated when invert_tilt)
//! ```
//!
//! and then clamped to [-90, 90].
//!
//! When a frame holds several detections exactly one is followed. Selection
//! order is: highest confidence, then largest area, then the track id that
//! was seen most recently in earlier frames, then the higher track id.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use crate::position::{Position, MAX_ANGLE};

/// Normalized centroid of a detected subject
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub x: f64,
    pub y: f64,
}

impl Centroid {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Both coordinates are finite and within [0, 1]
    pub fn is_normalized(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

/// One subject reported by a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
    /// Normalized bounding box area
    #[serde(default)]
    pub area: f64,
    #[serde(default, alias = "track_id")]
    pub track_id: Option<u64>,
}

fn full_confidence() -> f64 {
    1.0
}

impl Detection {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            confidence: 1.0,
            area: 0.0,
            track_id: None,
        }
    }

    pub fn centroid(&self) -> Centroid {
        Centroid::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackingConfig {
    pub max_pan: f64,
    pub max_tilt: f64,
    pub gain: f64,
    pub invert_pan: bool,
    pub invert_tilt: bool,
    /// Expected time between two detections; also the request rate limit
    #[serde(with = "crate::serde_millis")]
    pub detection_interval: Duration,
    /// Added to the detection interval for the hold duration of each request
    #[serde(with = "crate::serde_millis")]
    pub guard_margin: Duration,
    /// No detection for this long marks the feed stale
    #[serde(with = "crate::serde_millis")]
    pub timeout: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_pan: MAX_ANGLE,
            max_tilt: MAX_ANGLE,
            gain: 1.0,
            invert_pan: false,
            invert_tilt: false,
            detection_interval: Duration::from_millis(200),
            guard_margin: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        }
    }
}

impl TrackingConfig {
    /// Hold duration for one tracking request
    pub fn hold_duration(&self) -> Duration {
        self.detection_interval + self.guard_margin
    }

    /// Map a centroid onto a target position
    pub fn map_centroid(&self, c: Centroid) -> Position {
        let axis = |v: f64, max: f64, invert: bool| {
            let a = (v - 0.5) * 2.0 * max * self.gain;
            if invert {
                -a
            } else {
                a
            }
        };
        Position::clamped(
            axis(c.x, self.max_pan, self.invert_pan),
            axis(c.y, self.max_tilt, self.invert_tilt),
        )
    }
}

/// Remembers in which frame each track id was last seen.
#[derive(Debug, Clone, Default)]
pub struct TrackHistory {
    frame: u64,
    last_seen: HashMap<u64, u64>,
}

/// Track ids not seen for this many frames are forgotten
const HISTORY_FRAMES: u64 = 64;

impl TrackHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame number in which `track_id` was last seen
    pub fn last_seen(&self, track_id: u64) -> Option<u64> {
        self.last_seen.get(&track_id).copied()
    }

    /// Record the detections of one frame
    pub fn observe(&mut self, detections: &[Detection]) {
        self.frame += 1;
        let frame = self.frame;
        for id in detections.iter().filter_map(|d| d.track_id) {
            self.last_seen.insert(id, frame);
        }
        self.last_seen
            .retain(|_, seen| frame.saturating_sub(*seen) < HISTORY_FRAMES);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    fn recency(&self, d: &Detection) -> Option<u64> {
        d.track_id.and_then(|id| self.last_seen(id))
    }
}

/// Pick the detection to follow; `None` for an empty frame.
///
/// Detections with a centroid outside the unit square are ignored.
pub fn select_detection<'a>(
    detections: &'a [Detection],
    history: &TrackHistory,
) -> Option<&'a Detection> {
    detections
        .iter()
        .filter(|d| d.centroid().is_normalized())
        .max_by(|a, b| compare(a, b, history))
}

fn compare(a: &Detection, b: &Detection, history: &TrackHistory) -> Ordering {
    a.confidence
        .total_cmp(&b.confidence)
        .then(a.area.total_cmp(&b.area))
        .then(history.recency(a).cmp(&history.recency(b)))
        .then(a.track_id.cmp(&b.track_id))
}
