// THEORY:
// The `Environment` is everything a program can reach outside itself. The interpreter
// owns none of these collaborators; it borrows them through shared handles so the
// surrounding application (GUI, runner binary, tests) keeps control of the hardware.
//
// Key architectural principles:
// 1.  **Narrow seams**: The robot, the camera and the object store are traits. Drivers,
//     simulators and test doubles all plug in the same way.
// 2.  **Optional hardware**: A missing robot or camera is not a load failure for the
//     whole program. Commands that need one record a construction error and the rest
//     of the program still loads.
// 3.  **Read-only snapshot**: `Settings` is cloned in at construction and never written.

use crate::config::Settings;
use crate::core_modules::geometry::Rect;
use crate::core_modules::motion_path::MotionPath;
use crate::vision::Vision;
use image::{GrayImage, RgbImage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// The arm's command interface. Calls are fire-and-forget; the driver handles its own
/// motion planning and reports nothing back.
pub trait Robot: Send + Sync {
    /// Moves the end effector to `(x, y, z)` in cm, or by that offset when `relative`.
    fn set_pos(&self, x: f64, y: f64, z: f64, relative: bool);
    /// Sets servo angles in degrees, keyed by servo index (0 = base, 3 = wrist).
    fn set_servo_angles(&self, angles: &[(usize, f64)], relative: bool);
    /// Attaches (`true`) or detaches (`false`) individual servos.
    fn set_active_servos(&self, servos: &[(usize, bool)]);
    fn set_all_servos_active(&self, active: bool);
    /// Movement speed in cm/s.
    fn set_speed(&self, cm_per_sec: f64);
    /// `true` closes the gripper.
    fn set_gripper(&self, closed: bool);
    fn set_buzzer(&self, frequency_hz: f64, duration_secs: f64);
    /// While exiting, the driver should abandon queued or in-progress motion quickly.
    fn set_exiting(&self, exiting: bool);
    fn is_connected(&self) -> bool {
        true
    }
}

/// The live camera. Every frame has the same dimensions.
pub trait FrameSource: Send + Sync {
    /// The most recent frame, or `None` if the camera has nothing to give.
    fn get_frame(&self) -> Option<RgbImage>;
    fn dimensions(&self) -> (u32, u32);
    fn is_connected(&self) -> bool {
        true
    }
}

/// A registered planar object: a reference photo and the region of it to recognise.
#[derive(Debug, Clone)]
pub struct Trackable {
    pub name: String,
    pub image: GrayImage,
    pub rect: Rect,
    /// Physical height of the object in cm, added when moving on top of it.
    pub height: f64,
}

/// Lookup of user-created objects by ID.
pub trait Resources: Send + Sync {
    fn trackable(&self, id: &str) -> Option<Arc<Trackable>>;
    fn motion_path(&self, id: &str) -> Option<Arc<MotionPath>>;
    fn trackable_names(&self) -> Vec<String>;
}

/// In-memory object store.
#[derive(Default)]
pub struct ObjectManager {
    trackables: HashMap<String, Arc<Trackable>>,
    motion_paths: HashMap<String, Arc<MotionPath>>,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trackable(&mut self, trackable: Trackable) {
        self.trackables
            .insert(trackable.name.clone(), Arc::new(trackable));
    }

    pub fn add_motion_path(&mut self, id: impl Into<String>, path: MotionPath) {
        self.motion_paths.insert(id.into(), Arc::new(path));
    }
}

impl Resources for ObjectManager {
    fn trackable(&self, id: &str) -> Option<Arc<Trackable>> {
        self.trackables.get(id).cloned()
    }

    fn motion_path(&self, id: &str) -> Option<Arc<MotionPath>> {
        self.motion_paths.get(id).cloned()
    }

    fn trackable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.trackables.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Keys currently held on the keyboard, written by the UI and read by keypress events.
#[derive(Debug, Default)]
pub struct KeyState {
    held: Mutex<HashSet<String>>,
}

impl KeyState {
    pub fn press(&self, key: impl Into<String>) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into());
    }

    pub fn release(&self, key: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

/// The bundle of collaborators handed to the loader and to every command.
#[derive(Clone)]
pub struct Environment {
    pub robot: Option<Arc<dyn Robot>>,
    pub vision: Option<Arc<Vision>>,
    pub resources: Arc<dyn Resources>,
    pub settings: Settings,
    pub keys: Arc<KeyState>,
}

impl Environment {
    pub fn new(settings: Settings, resources: Arc<dyn Resources>) -> Self {
        Self {
            robot: None,
            vision: None,
            resources,
            settings,
            keys: Arc::new(KeyState::default()),
        }
    }

    pub fn with_robot(mut self, robot: Arc<dyn Robot>) -> Self {
        self.robot = Some(robot);
        self
    }

    pub fn with_vision(mut self, vision: Arc<Vision>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_keys(mut self, keys: Arc<KeyState>) -> Self {
        self.keys = keys;
        self
    }

    /// The robot, if one is attached and connected.
    pub fn connected_robot(&self) -> Option<&Arc<dyn Robot>> {
        self.robot.as_ref().filter(|robot| robot.is_connected())
    }

    /// The vision system, if its camera is connected.
    pub fn connected_vision(&self) -> Option<&Arc<Vision>> {
        self.vision.as_ref().filter(|vision| vision.is_connected())
    }
}
