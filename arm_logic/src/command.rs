// THEORY:
// A `Command` is one step of an Event's list. Every command follows the same two-phase
// contract:
//
// 1.  **Build**: `Command::build` reads the saved parameters, resolves every collaborator
//     and referenced object it will need (robot, camera, trackables, calibration) and
//     records each problem as a `ConstructionError`. Building never fails outright, so
//     one broken command cannot stop its siblings from loading.
// 2.  **Run**: `Command::run` returns an `Outcome`. A command carrying construction
//     errors short-circuits to `Failure` with no side effects.
//
// Key architectural principles:
// -   **Closed registry**: `CommandTag` lists every command the loader understands.
//     An unknown tag still produces a `Command` (always failing) so block structure
//     and indices in the saved list are preserved.
// -   **Expressions at run time**: Numeric fields are stored as source text and evaluated
//     on every run, so they can depend on variables set earlier in the program.
// -   **Structural markers**: StartBlock, EndBlock and Else do nothing when run. Their
//     meaning lives in the interpreter's cursor algorithm.

use crate::cancel::{duration_from_secs, sleep_cancellable};
use crate::config::CommandRecord;
use crate::core_modules::coordinates::{PointPair, TransformDirection, position_transform};
use crate::core_modules::geometry::{Point2, Quad, Rect, centroid, point_in_polygon};
use crate::core_modules::motion_path::MotionPath;
use crate::environment::{Environment, Robot, Trackable};
use crate::expression::parse_expression;
use crate::error::ConstructionError;
use crate::host::EnvironmentHost;
use crate::namespace::{Namespace, Value};
use crate::robot_vision::{MAX_FRAME_AGE_MOVE, MIN_POINTS_FOCUS, Pickup, play_motion_path};
use crate::vision::{RECENT_MAX_AGE, Vision};
use serde_json::{Map, Value as Json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Name of the trackable mounted on the robot, used by the pick-up routine.
pub const ROBOT_MARKER: &str = "Robot Marker";

/// Result of running a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Stop processing the current event for this tick.
    ExitEvent,
    /// Stop the whole program.
    KillProgram,
}

impl From<bool> for Outcome {
    fn from(value: bool) -> Self {
        if value { Outcome::Success } else { Outcome::Failure }
    }
}

macro_rules! command_tags {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Every command type a saved program may name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandTag {
            $($variant),+
        }

        impl CommandTag {
            pub const ALL: &'static [CommandTag] = &[$(CommandTag::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(CommandTag::$variant => $tag),+
                }
            }

            pub fn from_tag(tag: &str) -> Option<Self> {
                match tag {
                    $($tag => Some(CommandTag::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

command_tags! {
    MoveXyz => "MoveXYZCommand",
    MoveWrist => "MoveWristCommand",
    Speed => "SpeedCommand",
    Attach => "AttachCommand",
    Detach => "DetachCommand",
    Grip => "GripCommand",
    Drop => "DropCommand",
    Buzzer => "BuzzerCommand",
    Wait => "WaitCommand",
    PlayMotionRecording => "PlayMotionRecordingCommand",
    MoveRelativeToObject => "MoveRelativeToObjectCommand",
    PickupObject => "PickupObjectCommand",
    TestObjectSeen => "TestObjectSeenCommand",
    TestObjectLocation => "TestObjectLocationCommand",
    StartBlock => "StartBlockCommand",
    EndBlock => "EndBlockCommand",
    Else => "ElseCommand",
    SetVariable => "SetVariableCommand",
    TestVariable => "TestVariableCommand",
    Script => "ScriptCommand",
    EndProgram => "EndProgramCommand",
    EndEvent => "EndEventCommand",
}

/// Which part of a tracked object must lie inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationPart {
    Any,
    All,
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Lt,
}

impl Comparison {
    /// Saved programs store the test as an index into `[==, !=, >, <]`.
    pub const BY_INDEX: [Comparison; 4] = [Comparison::Eq, Comparison::Ne, Comparison::Gt, Comparison::Lt];

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Lt => "<",
        }
    }

    fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::Number(n) => n.as_u64().and_then(|i| Self::BY_INDEX.get(i as usize).copied()),
            Json::String(s) => Self::BY_INDEX.iter().copied().find(|c| c.symbol() == s),
            _ => None,
        }
    }
}

/// State a command may touch while it runs.
pub struct RunContext<'a> {
    pub env: &'a Environment,
    pub namespace: &'a Mutex<Namespace>,
    pub token: &'a CancellationToken,
    pub poll: Duration,
}

impl RunContext<'_> {
    fn host(&self) -> EnvironmentHost<'_> {
        EnvironmentHost::new(self.env, self.token, self.poll)
    }

    // Evaluation works on a snapshot so a sleeping script never holds the lock.
    fn snapshot(&self) -> Namespace {
        self.namespace.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn commit(&self, namespace: Namespace) {
        *self.namespace.lock().unwrap_or_else(PoisonError::into_inner) = namespace;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn evaluate_expression(&self, source: &str) -> Option<Value> {
        self.snapshot().evaluate_expression(source, &self.host())
    }

    /// Evaluates `source` to a number. `field` names the parameter in the log.
    pub fn evaluate_number(&self, field: &str, source: &str) -> Option<f64> {
        let value = self.evaluate_expression(source)?;
        match value.as_number() {
            Ok(number) => Some(number),
            Err(err) => {
                tracing::warn!(field, expression = source, error = %err, "parameter is not a number");
                None
            }
        }
    }

    pub fn evaluate_script(&self, source: &str) -> bool {
        let mut namespace = self.snapshot();
        let ok = namespace.evaluate_script(source, &self.host());
        self.commit(namespace);
        ok
    }

    pub fn set_variable(&self, name: &str, source: &str) -> bool {
        let mut namespace = self.snapshot();
        let ok = namespace.set_variable(name, source, &self.host());
        self.commit(namespace);
        ok
    }

    pub fn get_variable(&self, name: &str) -> Option<f64> {
        self.namespace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_variable(name)
    }

    /// Reads a variable, creating it at 0 if this is its first reference.
    fn reference_variable(&self, name: &str) -> f64 {
        let mut namespace = self.namespace.lock().unwrap_or_else(PoisonError::into_inner);
        match namespace.get_variable(name) {
            Some(value) => value,
            None => {
                namespace.insert(name, 0.0);
                0.0
            }
        }
    }
}

enum Action {
    MoveXyz {
        robot: Arc<dyn Robot>,
        x: String,
        y: String,
        z: String,
        relative: bool,
    },
    MoveWrist {
        robot: Arc<dyn Robot>,
        angle: String,
        relative: bool,
    },
    Speed {
        robot: Arc<dyn Robot>,
        speed: String,
    },
    Servos {
        robot: Arc<dyn Robot>,
        servos: [bool; 4],
        attach: bool,
    },
    Gripper {
        robot: Arc<dyn Robot>,
        closed: bool,
    },
    Buzzer {
        robot: Arc<dyn Robot>,
        frequency: String,
        time: String,
        wait: bool,
    },
    Wait {
        time: String,
    },
    PlayMotionRecording {
        robot: Arc<dyn Robot>,
        path: Arc<MotionPath>,
        speed: String,
        reversed: bool,
    },
    MoveRelativeToObject {
        robot: Arc<dyn Robot>,
        vision: Arc<Vision>,
        target: Arc<Trackable>,
        pairs: Vec<PointPair>,
        x: String,
        y: String,
        z: String,
    },
    PickupObject {
        robot: Arc<dyn Robot>,
        vision: Arc<Vision>,
        target: Arc<Trackable>,
        marker: Arc<Trackable>,
        pairs: Vec<PointPair>,
        ground_height: f64,
    },
    TestObjectSeen {
        vision: Arc<Vision>,
        name: String,
        max_age: u64,
        min_points: usize,
        negate: bool,
    },
    TestObjectLocation {
        vision: Arc<Vision>,
        name: String,
        region: Quad,
        part: LocationPart,
        negate: bool,
    },
    Marker,
    SetVariable {
        variable: String,
        expression: String,
    },
    TestVariable {
        variable: String,
        test: Comparison,
        expression: String,
    },
    Script {
        script: String,
    },
    EndProgram,
    EndEvent,
}

/// A built command, ready to run.
pub struct Command {
    type_logic: String,
    tag: Option<CommandTag>,
    parameters: Map<String, Json>,
    errors: Vec<ConstructionError>,
    action: Option<Action>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("type_logic", &self.type_logic)
            .field("errors", &self.errors)
            .finish()
    }
}

/// Reads typed fields out of a saved parameter map, recording what is wrong.
struct Params<'a> {
    map: &'a Map<String, Json>,
    errors: Vec<ConstructionError>,
}

impl<'a> Params<'a> {
    fn new(map: &'a Map<String, Json>) -> Self {
        Self { map, errors: Vec::new() }
    }

    fn missing(&mut self, key: &str) {
        self.errors.push(ConstructionError::MissingParameter(key.to_string()));
    }

    fn invalid(&mut self, key: &str, reason: impl Into<String>) {
        self.errors.push(ConstructionError::InvalidParameter {
            name: key.to_string(),
            reason: reason.into(),
        });
    }

    /// An expression field. Plain numbers are accepted and kept as their text.
    fn expression(&mut self, key: &str) -> String {
        match self.map.get(key) {
            Some(Json::String(s)) => s.clone(),
            Some(Json::Number(n)) => n.to_string(),
            Some(Json::Bool(true)) => "True".to_string(),
            Some(Json::Bool(false)) => "False".to_string(),
            Some(_) => {
                self.invalid(key, "expected an expression");
                String::new()
            }
            None => {
                self.missing(key);
                String::new()
            }
        }
    }

    fn text(&mut self, key: &str) -> String {
        match self.map.get(key) {
            Some(Json::String(s)) => s.clone(),
            Some(_) => {
                self.invalid(key, "expected text");
                String::new()
            }
            None => {
                self.missing(key);
                String::new()
            }
        }
    }

    /// A switch; absent means off.
    fn flag(&mut self, key: &str) -> bool {
        match self.map.get(key) {
            None | Some(Json::Null) => false,
            Some(Json::Bool(b)) => *b,
            Some(Json::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(_) => {
                self.invalid(key, "expected true or false");
                false
            }
        }
    }

    fn count(&mut self, key: &str) -> u64 {
        match self.map.get(key) {
            Some(Json::Number(n)) => match n.as_f64() {
                Some(v) if v >= 0.0 && v.is_finite() => v as u64,
                _ => {
                    self.invalid(key, "expected a non-negative number");
                    0
                }
            },
            Some(_) => {
                self.invalid(key, "expected a number");
                0
            }
            None => {
                self.missing(key);
                0
            }
        }
    }

    fn region(&mut self, key: &str) -> Quad {
        let corners = self.map.get(key).and_then(|value| {
            let pair = value.as_array().filter(|a| a.len() == 2)?;
            let point = |v: &Json| {
                let xy = v.as_array().filter(|a| a.len() == 2)?;
                Some(Point2::new(xy[0].as_f64()?, xy[1].as_f64()?))
            };
            Some((point(&pair[0])?, point(&pair[1])?))
        });
        match corners {
            Some((a, b)) => Rect::from_corners(a, b).corners(),
            None => {
                if self.map.contains_key(key) {
                    self.invalid(key, "expected [[x1, y1], [x2, y2]]");
                } else {
                    self.missing(key);
                }
                [Point2::default(); 4]
            }
        }
    }

    fn robot(&mut self, env: &Environment) -> Option<Arc<dyn Robot>> {
        let robot = env.connected_robot().cloned();
        if robot.is_none() {
            self.errors.push(ConstructionError::RobotNotConnected);
        }
        robot
    }

    fn vision(&mut self, env: &Environment) -> Option<Arc<Vision>> {
        let vision = env.connected_vision().cloned();
        if vision.is_none() {
            self.errors.push(ConstructionError::CameraNotConnected);
        }
        vision
    }

    fn trackable(&mut self, env: &Environment, id: &str) -> Option<Arc<Trackable>> {
        let trackable = env.resources.trackable(id);
        if trackable.is_none() {
            self.errors.push(ConstructionError::ObjectNotFound(id.to_string()));
        }
        trackable
    }

    fn motion_path(&mut self, env: &Environment, id: &str) -> Option<Arc<MotionPath>> {
        let path = env.resources.motion_path(id);
        if path.is_none() {
            self.errors.push(ConstructionError::ObjectNotFound(id.to_string()));
        }
        path
    }

    fn calibration(&mut self, env: &Environment) -> Option<Vec<PointPair>> {
        let pairs = &env.settings.coord_calibrations.pt_pairs;
        if pairs.len() < 3 {
            self.errors.push(ConstructionError::CalibrationMissing);
            return None;
        }
        Some(pairs.clone())
    }

    fn ground_height(&mut self, env: &Environment) -> Option<f64> {
        let ground = env.settings.coord_calibrations.ground_pos.map(|pos| pos[2]);
        if ground.is_none() {
            self.errors.push(ConstructionError::CalibrationMissing);
        }
        ground
    }
}

fn build_action(tag: CommandTag, params: &mut Params<'_>, env: &Environment) -> Option<Action> {
    let action = match tag {
        CommandTag::MoveXyz => {
            let (x, y, z) = (params.expression("x"), params.expression("y"), params.expression("z"));
            let relative = params.flag("relative");
            Action::MoveXyz { robot: params.robot(env)?, x, y, z, relative }
        }
        CommandTag::MoveWrist => {
            let angle = params.expression("angle");
            let relative = params.flag("relative");
            Action::MoveWrist { robot: params.robot(env)?, angle, relative }
        }
        CommandTag::Speed => {
            let speed = params.expression("speed");
            Action::Speed { robot: params.robot(env)?, speed }
        }
        CommandTag::Attach | CommandTag::Detach => {
            let servos = [
                params.flag("servo1"),
                params.flag("servo2"),
                params.flag("servo3"),
                params.flag("servo4"),
            ];
            Action::Servos {
                robot: params.robot(env)?,
                servos,
                attach: tag == CommandTag::Attach,
            }
        }
        CommandTag::Grip | CommandTag::Drop => Action::Gripper {
            robot: params.robot(env)?,
            closed: tag == CommandTag::Grip,
        },
        CommandTag::Buzzer => {
            let frequency = params.expression("frequency");
            let time = params.expression("time");
            let wait = params.flag("waitForBuzzer");
            Action::Buzzer { robot: params.robot(env)?, frequency, time, wait }
        }
        CommandTag::Wait => Action::Wait { time: params.expression("time") },
        CommandTag::PlayMotionRecording => {
            let id = params.text("objectID");
            let speed = params.expression("speed");
            let reversed = params.flag("reversed");
            let robot = params.robot(env);
            let path = params.motion_path(env, &id);
            Action::PlayMotionRecording { robot: robot?, path: path?, speed, reversed }
        }
        CommandTag::MoveRelativeToObject => {
            let id = params.text("objectID");
            let (x, y, z) = (params.expression("x"), params.expression("y"), params.expression("z"));
            let robot = params.robot(env);
            let vision = params.vision(env);
            let target = params.trackable(env, &id);
            let pairs = params.calibration(env);
            let (robot, vision, target, pairs) = (robot?, vision?, target?, pairs?);
            vision.add_target(&target);
            Action::MoveRelativeToObject { robot, vision, target, pairs, x, y, z }
        }
        CommandTag::PickupObject => {
            let id = params.text("objectID");
            let pairs = params.calibration(env);
            let ground_height = params.ground_height(env);
            let robot = params.robot(env);
            let vision = params.vision(env);
            let target = params.trackable(env, &id);
            let marker = params.trackable(env, ROBOT_MARKER);
            let (robot, vision, target, marker) = (robot?, vision?, target?, marker?);
            let (pairs, ground_height) = (pairs?, ground_height?);
            vision.add_target(&target);
            vision.add_target(&marker);
            Action::PickupObject { robot, vision, target, marker, pairs, ground_height }
        }
        CommandTag::TestObjectSeen => {
            let id = params.text("objectID");
            let max_age = params.count("age");
            let point_level = params.count("ptCount") as usize;
            let negate = params.flag("not");
            let vision = params.vision(env);
            let target = params.trackable(env, &id);
            let (vision, target) = (vision?, target?);
            vision.add_target(&target);
            let min_points = vision.config().min_match_count * (point_level + 1);
            Action::TestObjectSeen { vision, name: id, max_age, min_points, negate }
        }
        CommandTag::TestObjectLocation => {
            let id = params.text("objectID");
            let region = params.region("location");
            let part = match params.text("part").as_str() {
                "any" => LocationPart::Any,
                "all" => LocationPart::All,
                "center" => LocationPart::Center,
                other => {
                    if params.map.contains_key("part") {
                        params.invalid("part", format!("'{other}' is not one of any, all, center"));
                    }
                    LocationPart::Any
                }
            };
            let negate = params.flag("not");
            let vision = params.vision(env);
            let target = params.trackable(env, &id);
            let (vision, target) = (vision?, target?);
            vision.add_target(&target);
            Action::TestObjectLocation { vision, name: id, region, part, negate }
        }
        CommandTag::StartBlock | CommandTag::EndBlock | CommandTag::Else => Action::Marker,
        CommandTag::SetVariable => Action::SetVariable {
            variable: params.text("variable"),
            expression: params.expression("expression"),
        },
        CommandTag::TestVariable => {
            let variable = params.text("variable");
            let expression = params.expression("expression");
            let map = params.map;
            let test = match map.get("test") {
                Some(value) => Comparison::from_json(value).unwrap_or_else(|| {
                    params.invalid("test", format!("{value} is not a comparison"));
                    Comparison::Eq
                }),
                None => {
                    params.missing("test");
                    Comparison::Eq
                }
            };
            Action::TestVariable { variable, test, expression }
        }
        CommandTag::Script => Action::Script { script: params.text("script") },
        CommandTag::EndProgram => Action::EndProgram,
        CommandTag::EndEvent => Action::EndEvent,
    };
    Some(action)
}

impl Command {
    /// Builds a command from its saved record. Problems are recorded, never raised.
    pub fn build(record: &CommandRecord, env: &Environment) -> Command {
        let tag = CommandTag::from_tag(&record.type_logic);
        let mut params = Params::new(&record.parameters);
        let action = match tag {
            Some(tag) => build_action(tag, &mut params, env),
            None => {
                params
                    .errors
                    .push(ConstructionError::UnknownCommandType(record.type_logic.clone()));
                None
            }
        };
        let errors = params.errors;
        Command {
            type_logic: record.type_logic.clone(),
            tag,
            parameters: record.parameters.clone(),
            errors,
            action,
        }
    }

    pub fn tag(&self) -> Option<CommandTag> {
        self.tag
    }

    pub fn type_logic(&self) -> &str {
        &self.type_logic
    }

    pub fn parameters(&self) -> &Map<String, Json> {
        &self.parameters
    }

    pub fn errors(&self) -> &[ConstructionError] {
        &self.errors
    }

    pub fn is(&self, tag: CommandTag) -> bool {
        self.tag == Some(tag)
    }

    /// A short human-readable summary.
    pub fn describe(&self) -> String {
        let field = |key: &str| match self.parameters.get(key) {
            Some(Json::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "?".to_string(),
        };
        match self.tag {
            Some(CommandTag::MoveXyz) => format!("Move to ({}, {}, {})", field("x"), field("y"), field("z")),
            Some(CommandTag::MoveWrist) => format!("Rotate wrist to {}", field("angle")),
            Some(CommandTag::Speed) => format!("Set speed to {}", field("speed")),
            Some(CommandTag::Wait) => format!("Wait {} seconds", field("time")),
            Some(CommandTag::SetVariable) => format!("Set {} to {}", field("variable"), field("expression")),
            Some(CommandTag::TestVariable) => format!("Test {} against {}", field("variable"), field("expression")),
            Some(CommandTag::TestObjectSeen) | Some(CommandTag::TestObjectLocation) => {
                format!("Test {}", field("objectID"))
            }
            Some(tag) => tag.as_str().trim_end_matches("Command").to_string(),
            None => format!("Unknown command {}", self.type_logic),
        }
    }

    pub fn run(&self, ctx: &RunContext<'_>) -> Outcome {
        if !self.errors.is_empty() {
            return Outcome::Failure;
        }
        let Some(action) = &self.action else {
            return Outcome::Failure;
        };
        tracing::debug!(command = %self.describe(), "running command");

        match action {
            Action::MoveXyz { robot, x, y, z, relative } => {
                let (Some(x), Some(y), Some(z)) = (
                    ctx.evaluate_number("x", x),
                    ctx.evaluate_number("y", y),
                    ctx.evaluate_number("z", z),
                ) else {
                    return Outcome::Failure;
                };
                robot.set_pos(x, y, z, *relative);
                Outcome::Success
            }
            Action::MoveWrist { robot, angle, relative } => {
                let Some(angle) = ctx.evaluate_number("angle", angle) else {
                    return Outcome::Failure;
                };
                robot.set_servo_angles(&[(3, angle)], *relative);
                Outcome::Success
            }
            Action::Speed { robot, speed } => match ctx.evaluate_number("speed", speed) {
                Some(speed) if speed > 0.0 => {
                    robot.set_speed(speed);
                    Outcome::Success
                }
                _ => Outcome::Failure,
            },
            Action::Servos { robot, servos, attach } => {
                let selected: Vec<(usize, bool)> = servos
                    .iter()
                    .enumerate()
                    .filter(|(_, chosen)| **chosen)
                    .map(|(index, _)| (index, *attach))
                    .collect();
                if !selected.is_empty() {
                    robot.set_active_servos(&selected);
                }
                Outcome::Success
            }
            Action::Gripper { robot, closed } => {
                robot.set_gripper(*closed);
                Outcome::Success
            }
            Action::Buzzer { robot, frequency, time, wait } => {
                let (Some(frequency), Some(time)) = (
                    ctx.evaluate_number("frequency", frequency),
                    ctx.evaluate_number("time", time),
                ) else {
                    return Outcome::Failure;
                };
                let Some(duration) = duration_from_secs(time) else {
                    tracing::warn!(time, "buzzer time out of range");
                    return Outcome::Failure;
                };
                robot.set_buzzer(frequency, time);
                if *wait {
                    return sleep_cancellable(duration, ctx.token, ctx.poll).into();
                }
                Outcome::Success
            }
            Action::Wait { time } => {
                let Some(seconds) = ctx.evaluate_number("time", time) else {
                    return Outcome::Failure;
                };
                match duration_from_secs(seconds) {
                    Some(duration) => sleep_cancellable(duration, ctx.token, ctx.poll).into(),
                    None => {
                        tracing::warn!(seconds, "wait time out of range");
                        Outcome::Failure
                    }
                }
            }
            Action::PlayMotionRecording { robot, path, speed, reversed } => {
                let Some(speed) = ctx.evaluate_number("speed", speed) else {
                    return Outcome::Failure;
                };
                match path.retimed(speed, *reversed) {
                    Ok(path) => play_motion_path(&path, robot.as_ref(), ctx.token, ctx.poll).into(),
                    Err(err) => {
                        tracing::warn!(error = %err, "motion path not played");
                        Outcome::Failure
                    }
                }
            }
            Action::MoveRelativeToObject { robot, vision, target, pairs, x, y, z } => {
                let (Some(x), Some(y), Some(z)) = (
                    ctx.evaluate_number("x", x),
                    ctx.evaluate_number("y", y),
                    ctx.evaluate_number("z", z),
                ) else {
                    return Outcome::Failure;
                };
                let Some(tracked) =
                    vision.get_object_brute_accurate(&target.name, MIN_POINTS_FOCUS, MAX_FRAME_AGE_MOVE, ctx.token)
                else {
                    return Outcome::Failure;
                };
                let Some(pos) = position_transform(tracked.center, pairs, TransformDirection::CameraToRobot) else {
                    return Outcome::Failure;
                };
                robot.set_pos(pos[0] + x, pos[1] + y, pos[2] + target.height + z, false);
                Outcome::Success
            }
            Action::PickupObject { robot, vision, target, marker, pairs, ground_height } => {
                let pickup = Pickup {
                    target,
                    marker,
                    pairs,
                    ground_height: *ground_height,
                };
                pickup.run(robot.as_ref(), vision, ctx.token, ctx.poll).into()
            }
            Action::TestObjectSeen { vision, name, max_age, min_points, negate } => {
                let seen = vision.search_tracked_history(name, *max_age, *min_points).is_some();
                (seen != *negate).into()
            }
            Action::TestObjectLocation { vision, name, region, part, negate } => {
                let min_points = vision.config().min_match_count;
                let Some(tracked) = vision.search_tracked_history(name, RECENT_MAX_AGE, min_points) else {
                    return Outcome::Failure;
                };
                let inside = tracked
                    .quad
                    .iter()
                    .filter(|corner| point_in_polygon(corner, region))
                    .count();
                let result = match part {
                    LocationPart::Any => inside > 0,
                    LocationPart::All => inside == tracked.quad.len(),
                    LocationPart::Center => point_in_polygon(&centroid(&tracked.quad), region),
                };
                (result != *negate).into()
            }
            Action::Marker => Outcome::Success,
            Action::SetVariable { variable, expression } => ctx.set_variable(variable, expression).into(),
            Action::TestVariable { variable, test, expression } => {
                ctx.reference_variable(variable);
                // Parsed alone first so it cannot reach outside its parentheses.
                if let Err(err) = parse_expression(expression) {
                    tracing::warn!(expression = %expression, error = %err, "test expression rejected");
                    return Outcome::Failure;
                }
                let comparison = format!("{variable} {} ({expression})", test.symbol());
                ctx.evaluate_expression(&comparison)
                    .is_some_and(|result| result.truthy())
                    .into()
            }
            Action::Script { script } => ctx.evaluate_script(script).into(),
            Action::EndProgram => Outcome::KillProgram,
            Action::EndEvent => Outcome::ExitEvent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordCalibrations, Settings};
    use crate::environment::ObjectManager;
    use crate::robot_vision::tests::RecordingRobot;
    use serde_json::json;

    fn record(tag: &str, parameters: Json) -> CommandRecord {
        CommandRecord {
            type_logic: tag.to_string(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
        }
    }

    struct Harness {
        env: Environment,
        robot: Arc<RecordingRobot>,
        namespace: Mutex<Namespace>,
        token: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_env(|env| env)
        }

        /// A harness whose environment is finished by `configure`; the robot is always attached.
        fn with_env(configure: impl FnOnce(Environment) -> Environment) -> Self {
            Self::with_objects(ObjectManager::new(), configure)
        }

        fn with_objects(objects: ObjectManager, configure: impl FnOnce(Environment) -> Environment) -> Self {
            let robot = Arc::new(RecordingRobot::default());
            let env = configure(Environment::new(Settings::default(), Arc::new(objects)).with_robot(robot.clone()));
            Self { env, robot, namespace: Mutex::new(Namespace::new()), token: CancellationToken::new() }
        }

        fn run(&self, tag: &str, parameters: Json) -> Outcome {
            let command = Command::build(&record(tag, parameters), &self.env);
            command.run(&self.ctx())
        }

        fn ctx(&self) -> RunContext<'_> {
            RunContext {
                env: &self.env,
                namespace: &self.namespace,
                token: &self.token,
                poll: Duration::from_millis(5),
            }
        }

        fn var(&self, name: &str) -> Option<f64> {
            self.namespace.lock().unwrap().get_variable(name)
        }
    }

    #[test]
    fn every_tag_round_trips() {
        for tag in CommandTag::ALL {
            assert_eq!(CommandTag::from_tag(tag.as_str()), Some(*tag));
        }
        assert_eq!(CommandTag::ALL.len(), 22);
        assert_eq!(CommandTag::from_tag("SelfDestructCommand"), None);
    }

    #[test]
    fn move_commands_evaluate_expressions() {
        let h = Harness::new();
        h.namespace.lock().unwrap().insert("offset", 2.0);
        assert_eq!(h.run("MoveXYZCommand", json!({"x": "offset * 5", "y": 3, "z": "1 + 1", "relative": true})), Outcome::Success);
        assert_eq!(h.run("MoveWristCommand", json!({"angle": "90"})), Outcome::Success);
        assert_eq!(h.robot.calls(), vec!["set_pos(10, 3, 2, true)", "set_servo_angles([(3, 90.0)], false)"]);
    }

    #[test]
    fn bad_expression_fails_without_side_effects() {
        let h = Harness::new();
        assert_eq!(h.run("MoveXYZCommand", json!({"x": "1/0", "y": 0, "z": 0})), Outcome::Failure);
        assert_eq!(h.run("SpeedCommand", json!({"speed": "-4"})), Outcome::Failure);
        assert!(h.robot.calls().is_empty());
    }

    #[test]
    fn servo_selection_maps_to_indices() {
        let h = Harness::new();
        assert_eq!(h.run("DetachCommand", json!({"servo1": true, "servo3": true})), Outcome::Success);
        assert_eq!(h.run("AttachCommand", json!({"servo4": true})), Outcome::Success);
        assert_eq!(h.run("GripCommand", json!({})), Outcome::Success);
        assert_eq!(
            h.robot.calls(),
            vec!["set_active_servos([(0, false), (2, false)])", "set_active_servos([(3, true)])", "set_gripper(true)"]
        );
    }

    #[test]
    fn construction_errors_short_circuit() {
        let env = Environment::new(Settings::default(), Arc::new(ObjectManager::new()));
        let command = Command::build(&record("GripCommand", json!({})), &env);
        assert_eq!(command.errors(), &[ConstructionError::RobotNotConnected]);

        let h = Harness::new();
        let ctx = h.ctx();
        assert_eq!(command.run(&ctx), Outcome::Failure);

        let missing = Command::build(&record("SetVariableCommand", json!({"variable": "x"})), &h.env);
        assert_eq!(missing.errors(), &[ConstructionError::MissingParameter("expression".into())]);
        assert_eq!(missing.run(&ctx), Outcome::Failure);
        assert_eq!(h.var("x"), None);
    }

    #[test]
    fn vision_commands_require_camera_and_objects() {
        let h = Harness::new();
        let command = Command::build(&record("TestObjectSeenCommand", json!({"objectID": "Cup", "age": 5, "ptCount": 0})), &h.env);
        assert!(command.errors().contains(&ConstructionError::CameraNotConnected));
        assert!(command.errors().contains(&ConstructionError::ObjectNotFound("Cup".into())));

        let pickup = Command::build(&record("PickupObjectCommand", json!({"objectID": "Cup"})), &h.env);
        assert!(pickup.errors().contains(&ConstructionError::CalibrationMissing));
        assert!(pickup.errors().contains(&ConstructionError::ObjectNotFound(ROBOT_MARKER.into())));
    }

    #[test]
    fn calibration_needs_three_pairs() {
        let mut h = Harness::new();
        h.env.settings.coord_calibrations = CoordCalibrations {
            pt_pairs: vec![PointPair { camera: [0.0, 0.0], robot: [0.0, 0.0, 0.0] }; 2],
            ground_pos: Some([0.0, 0.0, 0.0]),
        };
        let command = Command::build(&record("MoveRelativeToObjectCommand", json!({"objectID": "Cup", "x": 0, "y": 0, "z": 0})), &h.env);
        assert!(command.errors().contains(&ConstructionError::CalibrationMissing));
    }

    #[test]
    fn unknown_tag_builds_an_always_failing_command() {
        let h = Harness::new();
        let command = Command::build(&record("TeleportCommand", json!({})), &h.env);
        assert_eq!(command.tag(), None);
        assert_eq!(command.errors(), &[ConstructionError::UnknownCommandType("TeleportCommand".into())]);
        assert_eq!(command.run(&h.ctx()), Outcome::Failure);
    }

    #[test]
    fn variable_commands() {
        let h = Harness::new();
        assert_eq!(h.run("SetVariableCommand", json!({"variable": "x", "expression": "5"})), Outcome::Success);
        assert_eq!(h.var("x"), Some(5.0));
        assert_eq!(h.run("TestVariableCommand", json!({"variable": "x", "test": 0, "expression": "2 + 3"})), Outcome::Success);
        assert_eq!(h.run("TestVariableCommand", json!({"variable": "x", "test": 1, "expression": "5"})), Outcome::Failure);
        assert_eq!(h.run("TestVariableCommand", json!({"variable": "x", "test": 2, "expression": "4"})), Outcome::Success);
        assert_eq!(h.run("TestVariableCommand", json!({"variable": "x", "test": "<", "expression": "4"})), Outcome::Failure);
        assert_eq!(h.run("TestVariableCommand", json!({"variable": "x", "test": 0, "expression": "nope"})), Outcome::Failure);
    }

    #[test]
    fn test_variable_evaluates_its_expression_once() {
        let h = Harness::new();
        h.run("TestVariableCommand", json!({"variable": "x", "test": 0, "expression": "robot.set_speed(5)"}));
        assert_eq!(h.robot.calls(), vec!["set_speed(5)"]);
    }

    #[test]
    fn test_variable_expression_stays_inside_its_comparison() {
        let h = Harness::new();
        assert_eq!(h.run("TestVariableCommand", json!({"variable": "x", "test": 1, "expression": "0) or (1"})), Outcome::Failure);
    }

    #[test]
    fn test_variable_creates_unset_variable_at_zero() {
        let h = Harness::new();
        assert_eq!(h.run("TestVariableCommand", json!({"variable": "fresh", "test": 0, "expression": "0"})), Outcome::Success);
        assert_eq!(h.var("fresh"), Some(0.0));
    }

    #[test]
    fn program_control_signals() {
        let h = Harness::new();
        assert_eq!(h.run("EndProgramCommand", json!({})), Outcome::KillProgram);
        assert_eq!(h.run("EndEventCommand", json!({})), Outcome::ExitEvent);
        assert_eq!(h.run("StartBlockCommand", json!({})), Outcome::Success);
        assert_eq!(h.run("ElseCommand", json!({})), Outcome::Success);
    }

    #[test]
    fn script_command_shares_variables() {
        let h = Harness::new();
        assert_eq!(h.run("ScriptCommand", json!({"script": "a = 3\nb = a * 2\nrobot.set_speed(b)"})), Outcome::Success);
        assert_eq!(h.var("b"), Some(6.0));
        assert_eq!(h.robot.calls(), vec!["set_speed(6)"]);
        assert_eq!(h.run("ScriptCommand", json!({"script": "c = nothing"})), Outcome::Failure);
    }

    #[test]
    fn wait_is_cut_short_by_cancellation() {
        let h = Harness::new();
        h.token.cancel();
        let start = std::time::Instant::now();
        assert_eq!(h.run("WaitCommand", json!({"time": "30"})), Outcome::Failure);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn out_of_range_durations_fail_instead_of_sleeping() {
        let h = Harness::new();
        let start = std::time::Instant::now();
        assert_eq!(h.run("WaitCommand", json!({"time": "1e20"})), Outcome::Failure);
        assert_eq!(h.run("WaitCommand", json!({"time": "-1"})), Outcome::Failure);
        assert_eq!(h.run("BuzzerCommand", json!({"frequency": 440, "time": "1e20", "waitForBuzzer": true})), Outcome::Failure);
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(h.robot.calls().is_empty());
    }

    fn wave() -> MotionPath {
        use crate::core_modules::motion_path::PathFrame;
        MotionPath::new(vec![
            PathFrame { time: 0.0, angles: vec![90.0], gripper: None },
            PathFrame { time: 0.02, angles: vec![80.0], gripper: None },
        ])
    }

    #[test]
    fn motion_recording_plays_at_evaluated_speed() {
        let mut objects = ObjectManager::new();
        objects.add_motion_path("Wave", wave());
        let h = Harness::with_objects(objects, |env| env);
        h.namespace.lock().unwrap().insert("pace", 2.0);

        let forward = json!({"objectID": "Wave", "speed": "pace"});
        assert_eq!(h.run("PlayMotionRecordingCommand", forward), Outcome::Success);
        let backward = json!({"objectID": "Wave", "speed": 4, "reversed": true});
        assert_eq!(h.run("PlayMotionRecordingCommand", backward), Outcome::Success);
        assert_eq!(
            h.robot.calls(),
            vec![
                "set_servo_angles([(0, 90.0)], false)",
                "set_servo_angles([(0, 80.0)], false)",
                "set_servo_angles([(0, 80.0)], false)",
                "set_servo_angles([(0, 90.0)], false)",
            ]
        );
    }

    #[test]
    fn motion_recording_rejects_bad_speed_and_unknown_paths() {
        let mut objects = ObjectManager::new();
        objects.add_motion_path("Wave", wave());
        let h = Harness::with_objects(objects, |env| env);
        assert_eq!(h.run("PlayMotionRecordingCommand", json!({"objectID": "Wave", "speed": "0"})), Outcome::Failure);
        assert_eq!(h.run("PlayMotionRecordingCommand", json!({"objectID": "Wave", "speed": "-1"})), Outcome::Failure);
        assert_eq!(h.run("PlayMotionRecordingCommand", json!({"objectID": "Wave", "speed": "1e-20"})), Outcome::Failure);
        assert_eq!(h.run("PlayMotionRecordingCommand", json!({"objectID": "Wave", "speed": "1/0"})), Outcome::Failure);
        assert!(h.robot.calls().is_empty());

        let missing = Command::build(&record("PlayMotionRecordingCommand", json!({"objectID": "Dance", "speed": 1})), &h.env);
        assert_eq!(missing.errors(), &[ConstructionError::ObjectNotFound("Dance".into())]);
    }

    #[test]
    fn object_location_modes_and_negation() {
        use crate::core_modules::features::tests::textured_image;
        use crate::vision::tests::StillCamera;

        let image = textured_image(200, 160, 7);
        let mut objects = ObjectManager::new();
        objects.add_trackable(Trackable {
            name: "Book".to_string(),
            image: image.clone(),
            rect: Rect::from_corners(Point2::new(40.0, 30.0), Point2::new(160.0, 130.0)),
            height: 0.0,
        });
        let vision = Arc::new(Vision::new(Arc::new(StillCamera::new(&image)), Default::default()));
        let h = Harness::with_objects(objects, |env| env.with_vision(vision.clone()));

        // The book's corners sit near (40, 30) and (160, 130); its centre near (100, 80).
        let whole_frame = json!([[0, 0], [199, 159]]);
        let top_left = json!([[0, 0], [120, 100]]);
        let corner = json!([[0, 0], [20, 20]]);
        let cases = [
            (&whole_frame, "any", true),
            (&whole_frame, "all", true),
            (&whole_frame, "center", true),
            (&top_left, "any", true),
            (&top_left, "all", false),
            (&top_left, "center", true),
            (&corner, "any", false),
            (&corner, "all", false),
            (&corner, "center", false),
        ];
        let commands: Vec<(Command, bool)> = cases
            .iter()
            .flat_map(|(region, part, inside)| {
                [false, true].map(|negate| {
                    let parameters = json!({"objectID": "Book", "location": region, "part": part, "not": negate});
                    let command = Command::build(&record("TestObjectLocationCommand", parameters), &h.env);
                    assert!(command.errors().is_empty(), "{:?}", command.errors());
                    (command, *inside != negate)
                })
            })
            .collect();
        assert!(vision.update());

        let ctx = h.ctx();
        for (command, expected) in &commands {
            assert_eq!(command.run(&ctx), Outcome::from(*expected), "{}", command.describe());
        }
    }

    #[test]
    fn buzzer_can_wait_for_its_tone() {
        let h = Harness::new();
        assert_eq!(h.run("BuzzerCommand", json!({"frequency": 440, "time": "0.02", "waitForBuzzer": true})), Outcome::Success);
        assert_eq!(h.robot.calls(), vec!["set_buzzer(440, 0.02)"]);
    }
}
