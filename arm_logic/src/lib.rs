// THEORY:
// This file is the entry point for the `arm_logic` library crate. It runs robot-arm
// programs built from Events (triggers) and Commands (actions), several of which are
// driven by what the camera sees.
//
// The public surface is the `Interpreter` plus the collaborator traits an application
// implements (`Robot`, `FrameSource`, `Resources`). Leaf to root:
// -   `core_modules`: the pure engines (feature detection, homography, plane tracking,
//     motion grid, calibration transforms, motion paths).
// -   `vision`: the recognition history and active query layer over a live camera.
// -   `expression` and `namespace`: the restricted expression and script language.
// -   `command` and `event`: the program model, built from saved records.
// -   `interpreter`: the tick loop, the cursor algorithm and the run lifecycle.

pub mod cancel;
pub mod command;
pub mod config;
pub mod core_modules;
pub mod environment;
pub mod error;
pub mod event;
pub mod expression;
pub mod host;
pub mod interpreter;
pub mod namespace;
pub mod robot_vision;
pub mod vision;

pub use command::{Command, CommandTag, Outcome};
pub use config::{EventRecord, RuntimeConfig, Settings};
pub use environment::{Environment, FrameSource, KeyState, ObjectManager, Resources, Robot, Trackable};
pub use error::{ConstructionError, EvalError, InterpreterError};
pub use event::{Event, EventTag};
pub use interpreter::{Interpreter, InterpreterState, LoadReport, RunStatus};
pub use namespace::{Namespace, Value};
pub use vision::Vision;
