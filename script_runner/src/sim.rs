//! Stand-ins for hardware: a robot that logs what it is told and a camera that keeps
//! showing one picture.

use arm_logic::{FrameSource, Robot};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct SimulatedRobot {
    position: Mutex<[f64; 3]>,
    exiting: AtomicBool,
}

impl SimulatedRobot {
    pub fn new() -> Self {
        Self {
            position: Mutex::new([0.0, 15.0, 15.0]),
            exiting: AtomicBool::new(false),
        }
    }

    pub fn position(&self) -> [f64; 3] {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Robot for SimulatedRobot {
    fn set_pos(&self, x: f64, y: f64, z: f64, relative: bool) {
        let mut position = self.position.lock().unwrap_or_else(PoisonError::into_inner);
        *position = if relative {
            [position[0] + x, position[1] + y, position[2] + z]
        } else {
            [x, y, z]
        };
        tracing::info!(target: "robot", x = position[0], y = position[1], z = position[2], "move");
    }

    fn set_servo_angles(&self, angles: &[(usize, f64)], relative: bool) {
        tracing::info!(target: "robot", ?angles, relative, "servo angles");
    }

    fn set_active_servos(&self, servos: &[(usize, bool)]) {
        tracing::info!(target: "robot", ?servos, "servo attachment");
    }

    fn set_all_servos_active(&self, active: bool) {
        tracing::info!(target: "robot", active, "all servos");
    }

    fn set_speed(&self, cm_per_sec: f64) {
        tracing::info!(target: "robot", cm_per_sec, "speed");
    }

    fn set_gripper(&self, closed: bool) {
        tracing::info!(target: "robot", closed, "gripper");
    }

    fn set_buzzer(&self, frequency_hz: f64, duration_secs: f64) {
        tracing::info!(target: "robot", frequency_hz, duration_secs, "buzzer");
    }

    fn set_exiting(&self, exiting: bool) {
        self.exiting.store(exiting, Ordering::SeqCst);
    }
}

/// A camera pointed at a photo.
pub struct StillImageSource {
    frame: RgbImage,
}

impl StillImageSource {
    pub fn new(frame: RgbImage) -> Self {
        Self { frame }
    }
}

impl FrameSource for StillImageSource {
    fn get_frame(&self) -> Option<RgbImage> {
        Some(self.frame.clone())
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frame.dimensions()
    }
}
