// THEORY:
// `robot_vision` holds the routines that drive the arm over time: replaying a recorded
// motion path and the vision-guided pick-up. Both are long-running, so both take the
// run's `CancellationToken` and check it between every step and inside every wait.
//
// Pick-up works in robot space. The object's pixel centre is mapped through the
// camera/robot calibration to a target position, and the arm hovers above it. The
// robot-mounted marker is then located the same way; the difference between where the
// marker is and where the object is gives a correction, applied a few times until the
// two agree. Only then does the arm descend, grip and lift.

use crate::cancel::{duration_from_secs, sleep_cancellable};
use crate::core_modules::coordinates::{PointPair, TransformDirection, position_transform};
use crate::core_modules::motion_path::MotionPath;
use crate::environment::{Robot, Trackable};
use crate::vision::Vision;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Inliers a detection needs before the arm moves relative to it.
pub const MIN_POINTS_FOCUS: usize = 25;
/// Maximum age in frames of a detection the arm moves relative to.
pub const MAX_FRAME_AGE_MOVE: u64 = 5;

const HOVER_HEIGHT: f64 = 6.0;
const REFINE_ATTEMPTS: usize = 3;
/// Marker-to-object error, in cm, below which the approach is considered aligned.
const ALIGNED_TOLERANCE: f64 = 0.5;
const SETTLE_TIME: Duration = Duration::from_millis(400);

/// Replays `path` in real time. Returns `false` if cancelled before the last sample.
pub fn play_motion_path(
    path: &MotionPath,
    robot: &dyn Robot,
    token: &CancellationToken,
    poll: Duration,
) -> bool {
    let start = Instant::now();
    for frame in &path.frames {
        let Some(due) = duration_from_secs(frame.time.max(0.0)).and_then(|offset| start.checked_add(offset)) else {
            tracing::warn!(time = frame.time, "motion sample out of range");
            return false;
        };
        let now = Instant::now();
        if due > now && !sleep_cancellable(due - now, token, poll) {
            return false;
        }
        if token.is_cancelled() {
            return false;
        }
        let angles: Vec<(usize, f64)> = frame.angles.iter().copied().enumerate().collect();
        robot.set_servo_angles(&angles, false);
        if let Some(closed) = frame.gripper {
            robot.set_gripper(closed);
        }
    }
    true
}

/// Everything the pick-up routine reads; borrowed from the command that runs it.
pub struct Pickup<'a> {
    pub target: &'a Trackable,
    pub marker: &'a Trackable,
    pub pairs: &'a [PointPair],
    pub ground_height: f64,
}

impl Pickup<'_> {
    /// Runs the full approach. Returns `false` if the object could not be located or
    /// the run was cancelled part way.
    pub fn run(
        &self,
        robot: &dyn Robot,
        vision: &Vision,
        token: &CancellationToken,
        poll: Duration,
    ) -> bool {
        let Some(object) = self.locate(vision, &self.target.name, token) else {
            tracing::info!(object = %self.target.name, "pick-up target not found");
            return false;
        };

        let grasp_z = self.ground_height + self.target.height;
        robot.set_gripper(false);
        robot.set_pos(object[0], object[1], grasp_z + HOVER_HEIGHT, false);

        for attempt in 0..REFINE_ATTEMPTS {
            if !sleep_cancellable(SETTLE_TIME, token, poll) {
                return false;
            }
            let Some(marker) = self.locate(vision, &self.marker.name, token) else {
                tracing::debug!(attempt, "robot marker not visible, skipping refinement");
                break;
            };
            let (dx, dy) = (object[0] - marker[0], object[1] - marker[1]);
            if dx.hypot(dy) < ALIGNED_TOLERANCE {
                break;
            }
            tracing::debug!(attempt, dx, dy, "correcting approach");
            robot.set_pos(dx, dy, 0.0, true);
        }

        if !sleep_cancellable(SETTLE_TIME, token, poll) {
            return false;
        }
        robot.set_pos(0.0, 0.0, -HOVER_HEIGHT, true);
        if !sleep_cancellable(SETTLE_TIME, token, poll) {
            return false;
        }
        robot.set_gripper(true);
        if !sleep_cancellable(SETTLE_TIME, token, poll) {
            return false;
        }
        robot.set_pos(0.0, 0.0, HOVER_HEIGHT + self.target.height, true);
        true
    }

    fn locate(&self, vision: &Vision, name: &str, token: &CancellationToken) -> Option<[f64; 3]> {
        let tracked = vision.get_object_brute_accurate(name, MIN_POINTS_FOCUS, MAX_FRAME_AGE_MOVE, token)?;
        position_transform(tracked.center, self.pairs, TransformDirection::CameraToRobot)
    }
}
