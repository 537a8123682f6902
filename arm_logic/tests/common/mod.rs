#![allow(dead_code)]

use arm_logic::config::InterpreterConfig;
use arm_logic::{Environment, EventRecord, FrameSource, Interpreter, LoadReport, ObjectManager, Robot, Settings};
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct LoggingRobot {
    calls: Mutex<Vec<String>>,
    exiting: AtomicBool,
}

impl LoggingRobot {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Robot for LoggingRobot {
    fn set_pos(&self, x: f64, y: f64, z: f64, relative: bool) {
        self.log(format!("set_pos({x}, {y}, {z}, {relative})"));
    }
    fn set_servo_angles(&self, angles: &[(usize, f64)], relative: bool) {
        self.log(format!("set_servo_angles({angles:?}, {relative})"));
    }
    fn set_active_servos(&self, servos: &[(usize, bool)]) {
        self.log(format!("set_active_servos({servos:?})"));
    }
    fn set_all_servos_active(&self, active: bool) {
        self.log(format!("set_all_servos_active({active})"));
    }
    fn set_speed(&self, cm_per_sec: f64) {
        self.log(format!("set_speed({cm_per_sec})"));
    }
    fn set_gripper(&self, closed: bool) {
        self.log(format!("set_gripper({closed})"));
    }
    fn set_buzzer(&self, frequency_hz: f64, duration_secs: f64) {
        self.log(format!("set_buzzer({frequency_hz}, {duration_secs})"));
    }
    fn set_exiting(&self, exiting: bool) {
        self.exiting.store(exiting, Ordering::SeqCst);
    }
}

pub struct PhotoCamera(pub RgbImage);

impl FrameSource for PhotoCamera {
    fn get_frame(&self) -> Option<RgbImage> {
        Some(self.0.clone())
    }
    fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }
}

/// Blocky pseudo-random texture with plenty of corners.
pub fn texture(width: u32, height: u32, seed: u32) -> GrayImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let (bx, by) = (x / 7, y / 7);
        let mut h = bx.wrapping_mul(73_856_093) ^ by.wrapping_mul(19_349_663) ^ seed;
        h ^= h >> 13;
        h = h.wrapping_mul(0x5bd1_e995);
        h ^= h >> 15;
        Luma([(h % 256) as u8])
    })
}

pub fn fast_config() -> InterpreterConfig {
    InterpreterConfig {
        tick_rate_hz: 200.0,
        poll_interval_ms: 10,
        ..InterpreterConfig::default()
    }
}

pub fn records(program: serde_json::Value) -> Vec<EventRecord> {
    serde_json::from_value(program).unwrap()
}

pub fn with_robot(program: serde_json::Value) -> (Interpreter, Arc<LoggingRobot>, LoadReport) {
    let robot = Arc::new(LoggingRobot::default());
    let env = Environment::new(Settings::default(), Arc::new(ObjectManager::new())).with_robot(robot.clone());
    let interpreter = Interpreter::new(env, fast_config());
    let report = interpreter.load_script(&records(program)).unwrap();
    (interpreter, robot, report)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn set(variable: &str, expression: &str) -> serde_json::Value {
    serde_json::json!({"typeLogic": "SetVariableCommand", "parameters": {"variable": variable, "expression": expression}})
}

pub fn test(variable: &str, op: &str, expression: &str) -> serde_json::Value {
    serde_json::json!({"typeLogic": "TestVariableCommand", "parameters": {"variable": variable, "test": op, "expression": expression}})
}

pub fn tag(type_logic: &str) -> serde_json::Value {
    serde_json::json!({"typeLogic": type_logic})
}
