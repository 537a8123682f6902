// THEORY:
// A `MotionPath` is a recorded demonstration: a time-stamped list of servo poses the arm
// passed through while a user moved it by hand. This module only holds the data and
// the pure transformations applied before playback (speed scaling and reversal).
// Playback itself needs a robot and a cancellation signal, and lives in `robot_vision`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("playback speed must be a positive number, got {0}")]
    InvalidSpeed(f64),
    #[error("playback at speed {0} stretches the recording past any representable time")]
    TooSlow(f64),
}

/// One recorded sample. `time` is seconds since the start of the recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathFrame {
    pub time: f64,
    /// Servo angles in degrees, indexed by servo number.
    pub angles: Vec<f64>,
    #[serde(default)]
    pub gripper: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionPath {
    pub frames: Vec<PathFrame>,
}

impl MotionPath {
    pub fn new(frames: Vec<PathFrame>) -> Self {
        Self { frames }
    }

    pub fn duration(&self) -> f64 {
        self.frames.last().map(|f| f.time).unwrap_or(0.0)
    }

    /// Returns a copy retimed for playback at `speed` (2.0 plays twice as fast).
    /// With `reversed`, the poses play back to front while the time column keeps its
    /// original order, so the gaps between samples are preserved.
    pub fn retimed(&self, speed: f64, reversed: bool) -> Result<MotionPath, PathError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(PathError::InvalidSpeed(speed));
        }
        let scale = 1.0 / speed;
        let times: Vec<f64> = self.frames.iter().map(|f| f.time * scale).collect();
        if times.iter().any(|t| Duration::try_from_secs_f64(t.max(0.0)).is_err()) {
            return Err(PathError::TooSlow(speed));
        }
        let mut poses: Vec<(Vec<f64>, Option<bool>)> = self
            .frames
            .iter()
            .map(|f| (f.angles.clone(), f.gripper))
            .collect();
        if reversed {
            poses.reverse();
        }
        let frames = times
            .into_iter()
            .zip(poses)
            .map(|(time, (angles, gripper))| PathFrame { time, angles, gripper })
            .collect();
        Ok(MotionPath { frames })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> MotionPath {
        MotionPath::new(vec![
            PathFrame { time: 0.0, angles: vec![10.0, 20.0, 30.0, 40.0], gripper: None },
            PathFrame { time: 0.5, angles: vec![11.0, 21.0, 31.0, 41.0], gripper: Some(true) },
            PathFrame { time: 2.0, angles: vec![12.0, 22.0, 32.0, 42.0], gripper: None },
        ])
    }

    #[test]
    fn doubling_speed_halves_durations() {
        let fast = recording().retimed(2.0, false).unwrap();
        let times: Vec<f64> = fast.frames.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![0.0, 0.25, 1.0]);
        assert_eq!(fast.frames[1].angles, vec![11.0, 21.0, 31.0, 41.0]);
    }

    #[test]
    fn reversal_flips_poses_but_keeps_time_order() {
        let back = recording().retimed(1.0, true).unwrap();
        let times: Vec<f64> = back.frames.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![0.0, 0.5, 2.0]);
        assert_eq!(back.frames[0].angles, vec![12.0, 22.0, 32.0, 42.0]);
        assert_eq!(back.frames[2].angles, vec![10.0, 20.0, 30.0, 40.0]);
        assert_eq!(back.frames[1].gripper, Some(true));
    }

    #[test]
    fn non_positive_speed_is_rejected() {
        assert_eq!(recording().retimed(0.0, false), Err(PathError::InvalidSpeed(0.0)));
        assert!(recording().retimed(-1.0, true).is_err());
        assert!(recording().retimed(f64::NAN, false).is_err());
    }

    #[test]
    fn vanishing_speed_is_rejected() {
        assert_eq!(recording().retimed(1e-20, false), Err(PathError::TooSlow(1e-20)));
        assert!(recording().retimed(f64::MIN_POSITIVE, true).is_err());
    }
}
