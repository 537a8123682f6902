// THEORY:
// `Vision` is the query layer programs talk to. It wraps the `PlaneTracker` and the
// motion `GridManager` around a live `FrameSource` and keeps a small memory of what was
// seen, so commands can ask "was this object seen recently, and how confidently?"
// without running detection themselves.
//
// Key architectural principles:
// 1.  **Frame clock**: Every grabbed frame gets a sequence number. Ages are measured in
//     frames, not seconds, so freshness means the same thing at any camera rate.
// 2.  **Latest only**: History keeps one `TrackedTarget` per object, overwritten by each
//     newer detection. There is no longer-term memory.
// 3.  **Passive vs. active queries**: `search_tracked_history` only reads the memory.
//     `get_object_brute_accurate` drives updates itself until it gets a fresh, confident
//     fix or runs out of its attempt and time budget.
// 4.  **Bounded and cancellable**: Every active query takes a `CancellationToken` and a
//     budget. Nothing here can block indefinitely, and a miss is `None`, never an error.

use crate::cancel::sleep_cancellable;
use crate::config::VisionConfig;
use crate::core_modules::coordinates::{PointPair, TransformDirection, position_transform};
use crate::core_modules::geometry::Point2;
use crate::core_modules::grid_manager::GridManager;
use crate::core_modules::plane_tracker::{PlaneTracker, TrackedTarget};
use crate::environment::{FrameSource, Trackable};
use image::RgbImage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BRUTE_POLL: Duration = Duration::from_millis(10);

/// Age in frames within which a passive detection still counts as current.
pub const RECENT_MAX_AGE: u64 = 10;

pub struct Vision {
    frames: Arc<dyn FrameSource>,
    config: VisionConfig,
    tracker: RwLock<PlaneTracker>,
    /// Names of trackables already registered with the tracker.
    registered: Mutex<HashSet<String>>,
    /// Most recent detection per trackable name.
    history: Mutex<HashMap<String, TrackedTarget>>,
    motion: Mutex<GridManager>,
    /// Sequence number of the latest grabbed frame. Zero before the first frame.
    frame_count: AtomicU64,
    last_frame: Mutex<Option<Arc<RgbImage>>>,
}

impl Vision {
    pub fn new(frames: Arc<dyn FrameSource>, config: VisionConfig) -> Self {
        let (width, height) = frames.dimensions();
        Self {
            tracker: RwLock::new(PlaneTracker::new(config.tracker_params())),
            motion: Mutex::new(GridManager::new(width, height, config.motion_chunk_size)),
            frames,
            config,
            registered: Mutex::new(HashSet::new()),
            history: Mutex::new(HashMap::new()),
            frame_count: AtomicU64::new(0),
            last_frame: Mutex::new(None),
        }
    }

    pub fn frame_source(&self) -> &Arc<dyn FrameSource> {
        &self.frames
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.frames.is_connected()
    }

    /// Starts tracking `trackable`. Adding the same name twice is a no-op.
    /// Returns `true` if the trackable was newly registered.
    pub fn add_target(&self, trackable: &Trackable) -> bool {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        if registered.contains(&trackable.name) {
            return false;
        }
        let kept = self
            .tracker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_target(&trackable.image, trackable.rect, trackable.name.clone());
        if kept == 0 {
            tracing::warn!(object = %trackable.name, "trackable has no features and will never be recognised");
        }
        registered.insert(trackable.name.clone());
        true
    }

    /// Drops every target and all history.
    pub fn clear_targets(&self) {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        self.tracker.write().unwrap_or_else(PoisonError::into_inner).clear();
        registered.clear();
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    /// The most recently grabbed frame.
    pub fn last_frame(&self) -> Option<Arc<RgbImage>> {
        self.last_frame.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Grabs one frame and runs tracking and motion analysis on it.
    /// Returns `false` if the camera produced no frame.
    pub fn update(&self) -> bool {
        let Some(frame) = self.frames.get_frame() else {
            return false;
        };
        let frame_id = self.frame_count.fetch_add(1, Ordering::AcqRel) + 1;
        let gray = image::imageops::grayscale(&frame);

        self.motion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process_frame(&gray);

        let tracked = {
            let tracker = self.tracker.read().unwrap_or_else(PoisonError::into_inner);
            if tracker.targets().is_empty() {
                Vec::new()
            } else {
                tracker.track(&gray)
            }
        };

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            for mut target in tracked {
                target.frame_id = frame_id;
                let is_newer = history
                    .get(&target.target_id)
                    .is_none_or(|previous| previous.frame_id <= frame_id);
                if is_newer {
                    tracing::trace!(object = %target.target_id, points = target.match_count(), frame_id, "object seen");
                    history.insert(target.target_id.clone(), target);
                }
            }
        }

        *self.last_frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(frame));
        true
    }

    /// The latest detection of `name`, if it is at most `max_age` frames old and has at
    /// least `min_points` inliers.
    pub fn search_tracked_history(
        &self,
        name: &str,
        max_age: u64,
        min_points: usize,
    ) -> Option<TrackedTarget> {
        let now = self.frame_count();
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let target = history.get(name)?;
        let age = now.saturating_sub(target.frame_id);
        if age <= max_age && target.match_count() >= min_points {
            Some(target.clone())
        } else {
            None
        }
    }

    /// Actively polls the camera until `name` is seen with at least `min_points`
    /// inliers in a frame at most `max_frame_age` old. Gives up after the configured
    /// attempt count or time budget, or as soon as `token` is cancelled.
    pub fn get_object_brute_accurate(
        &self,
        name: &str,
        min_points: usize,
        max_frame_age: u64,
        token: &CancellationToken,
    ) -> Option<TrackedTarget> {
        // An unrepresentable deadline leaves only the attempt budget.
        let deadline = Instant::now().checked_add(self.config.brute_time_budget());
        for attempt in 0..self.config.brute_max_attempts {
            if token.is_cancelled() || deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
            if let Some(found) = self.search_tracked_history(name, max_frame_age, min_points) {
                tracing::debug!(object = name, attempt, points = found.match_count(), "accurate fix acquired");
                return Some(found);
            }
            if !self.update() && !sleep_cancellable(BRUTE_POLL, token, BRUTE_POLL) {
                break;
            }
        }
        let found = self.search_tracked_history(name, max_frame_age, min_points);
        if found.is_none() {
            tracing::debug!(object = name, "no accurate fix within budget");
        }
        found
    }

    /// Smoothed scene-motion level over the last few frames.
    pub fn motion_level(&self) -> f64 {
        self.motion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .motion_level()
    }

    /// Maps a point between camera and robot space using calibration pairs.
    pub fn coordinate_transform(
        point: Point2,
        pairs: &[PointPair],
        direction: TransformDirection,
    ) -> Option<[f64; 3]> {
        position_transform(point, pairs, direction)
    }

    /// Runs `update` at the configured rate on a blocking thread until `token` is
    /// cancelled. Requires a tokio runtime.
    pub fn spawn_tracking(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            let interval = self.config.tracking_interval();
            tracing::info!(fps = self.config.tracking_fps, "vision tracking started");
            let mut timer = crate::cancel::TickTimer::new(interval);
            while timer.wait(&token, BRUTE_POLL) {
                self.update();
            }
            tracing::info!(frames = self.frame_count(), "vision tracking stopped");
        })
    }
}
