// THEORY:
// `EnvironmentHost` is what a running program's scripts see behind the dotted names
// `robot`, `vision`, `resources`, `settings` and `frame`. Each handle exposes a short,
// explicit list of operations; anything else is an unknown function. `sleep` waits on
// the run's cancellation token, so a sleeping script stops with the program.

use crate::cancel::sleep_cancellable;
use crate::environment::Environment;
use crate::error::EvalError;
use crate::namespace::{Host, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct EnvironmentHost<'a> {
    env: &'a Environment,
    token: &'a CancellationToken,
    poll: Duration,
}

impl<'a> EnvironmentHost<'a> {
    pub fn new(env: &'a Environment, token: &'a CancellationToken, poll: Duration) -> Self {
        Self { env, token, poll }
    }
}

fn number(args: &[Value], index: usize) -> Result<f64, EvalError> {
    args.get(index).ok_or(EvalError::NoValue)?.as_number()
}

fn text(args: &[Value], index: usize) -> Result<String, EvalError> {
    match args.get(index) {
        Some(Value::Text(t)) => Ok(t.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(EvalError::NoValue),
    }
}

fn flag(args: &[Value], index: usize) -> bool {
    args.get(index).is_some_and(Value::truthy)
}

fn servo(args: &[Value], index: usize) -> Result<usize, EvalError> {
    let value = number(args, index)?;
    if value.fract() == 0.0 && (0.0..4.0).contains(&value) {
        Ok(value as usize)
    } else {
        Err(EvalError::Type(format!("servo index must be 0 to 3, got {value}")))
    }
}

fn expect_args(name: &[String], args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if (min..=max).contains(&args.len()) {
        Ok(())
    } else {
        let expected = if min == max { min.to_string() } else { format!("{min} to {max}") };
        Err(EvalError::arity(&name.join("."), expected, args.len()))
    }
}

impl EnvironmentHost<'_> {
    fn robot_call(&self, path: &[String], method: &str, args: &[Value]) -> Result<Value, EvalError> {
        let robot = self
            .env
            .connected_robot()
            .ok_or_else(|| EvalError::Host("robot is not connected".to_string()))?;
        match method {
            "set_pos" => {
                expect_args(path, args, 3, 4)?;
                robot.set_pos(number(args, 0)?, number(args, 1)?, number(args, 2)?, flag(args, 3));
            }
            "set_servo_angle" => {
                expect_args(path, args, 2, 3)?;
                robot.set_servo_angles(&[(servo(args, 0)?, number(args, 1)?)], flag(args, 2));
            }
            "set_speed" => {
                expect_args(path, args, 1, 1)?;
                robot.set_speed(number(args, 0)?);
            }
            "set_gripper" => {
                expect_args(path, args, 1, 1)?;
                robot.set_gripper(flag(args, 0));
            }
            "set_buzzer" => {
                expect_args(path, args, 2, 2)?;
                robot.set_buzzer(number(args, 0)?, number(args, 1)?);
            }
            "attach" | "detach" => {
                expect_args(path, args, 1, 1)?;
                robot.set_active_servos(&[(servo(args, 0)?, method == "attach")]);
            }
            "attach_all" | "detach_all" => {
                expect_args(path, args, 0, 0)?;
                robot.set_all_servos_active(method == "attach_all");
            }
            "is_connected" => return Ok(Value::Bool(true)),
            _ => return Err(EvalError::UnknownFunction(path.join("."))),
        }
        Ok(Value::Nothing)
    }

    fn vision_call(&self, path: &[String], method: &str, args: &[Value]) -> Result<Value, EvalError> {
        let vision = self
            .env
            .connected_vision()
            .ok_or_else(|| EvalError::Host("camera is not connected".to_string()))?;
        match method {
            "is_seen" => {
                expect_args(path, args, 1, 3)?;
                let name = text(args, 0)?;
                let max_age = if args.len() > 1 { number(args, 1)?.max(0.0) as u64 } else { 0 };
                let min_points = if args.len() > 2 { number(args, 2)?.max(0.0) as usize } else { 0 };
                Ok(Value::Bool(vision.search_tracked_history(&name, max_age, min_points).is_some()))
            }
            "center_x" | "center_y" | "points" => {
                expect_args(path, args, 1, 2)?;
                let name = text(args, 0)?;
                let max_age = if args.len() > 1 { number(args, 1)?.max(0.0) as u64 } else { u64::MAX };
                let tracked = vision
                    .search_tracked_history(&name, max_age, 0)
                    .ok_or_else(|| EvalError::Host(format!("'{name}' has not been seen")))?;
                Ok(Value::Number(match method {
                    "center_x" => tracked.center.x,
                    "center_y" => tracked.center.y,
                    _ => tracked.match_count() as f64,
                }))
            }
            "motion" => {
                expect_args(path, args, 0, 0)?;
                Ok(Value::Number(vision.motion_level()))
            }
            "frame_count" => {
                expect_args(path, args, 0, 0)?;
                Ok(Value::Number(vision.frame_count() as f64))
            }
            _ => Err(EvalError::UnknownFunction(path.join("."))),
        }
    }

    fn resources_call(&self, path: &[String], method: &str, args: &[Value]) -> Result<Value, EvalError> {
        let resources = &self.env.resources;
        match method {
            "count" => {
                expect_args(path, args, 0, 0)?;
                Ok(Value::Number(resources.trackable_names().len() as f64))
            }
            "has" => {
                expect_args(path, args, 1, 1)?;
                let name = text(args, 0)?;
                Ok(Value::Bool(
                    resources.trackable(&name).is_some() || resources.motion_path(&name).is_some(),
                ))
            }
            "height" => {
                expect_args(path, args, 1, 1)?;
                let name = text(args, 0)?;
                resources
                    .trackable(&name)
                    .map(|t| Value::Number(t.height))
                    .ok_or_else(|| EvalError::Host(format!("object '{name}' could not be found")))
            }
            _ => Err(EvalError::UnknownFunction(path.join("."))),
        }
    }

    fn frame_dimensions(&self) -> Result<(u32, u32), EvalError> {
        self.env
            .connected_vision()
            .map(|vision| vision.frame_source().dimensions())
            .ok_or_else(|| EvalError::Host("camera is not connected".to_string()))
    }

    fn settings_attribute(&self, path: &[String], field: &str) -> Result<Value, EvalError> {
        let settings = &self.env.settings;
        match field {
            "cameraID" => settings
                .camera_id
                .map(|id| Value::Number(id as f64))
                .ok_or_else(|| EvalError::Host("no camera is configured".to_string())),
            "robotID" => Ok(Value::Text(settings.robot_id.clone().unwrap_or_default())),
            "groundHeight" => settings
                .coord_calibrations
                .ground_pos
                .map(|pos| Value::Number(pos[2]))
                .ok_or_else(|| EvalError::Host("coordinate calibration has not been performed".to_string())),
            "motionLow" | "motionHigh" => settings
                .motion_calibrations
                .map(|m| Value::Number(if field == "motionLow" { m.low } else { m.high }))
                .ok_or_else(|| EvalError::Host("motion calibration has not been performed".to_string())),
            _ => Err(EvalError::UnknownSymbol(path.join("."))),
        }
    }
}

impl Host for EnvironmentHost<'_> {
    fn call(&self, path: &[String], args: &[Value]) -> Result<Value, EvalError> {
        match path {
            [handle, method] => match handle.as_str() {
                "robot" => self.robot_call(path, method, args),
                "vision" => self.vision_call(path, method, args),
                "resources" => self.resources_call(path, method, args),
                "frame" => {
                    expect_args(path, args, 0, 0)?;
                    let (width, height) = self.frame_dimensions()?;
                    match method.as_str() {
                        "width" => Ok(Value::Number(width as f64)),
                        "height" => Ok(Value::Number(height as f64)),
                        _ => Err(EvalError::UnknownFunction(path.join("."))),
                    }
                }
                _ => Err(EvalError::UnknownFunction(path.join("."))),
            },
            _ => Err(EvalError::UnknownFunction(path.join("."))),
        }
    }

    fn attribute(&self, path: &[String]) -> Result<Value, EvalError> {
        match path {
            [handle, field] if handle == "settings" => self.settings_attribute(path, field),
            [handle, field] if handle == "frame" => {
                let (width, height) = self.frame_dimensions()?;
                match field.as_str() {
                    "width" => Ok(Value::Number(width as f64)),
                    "height" => Ok(Value::Number(height as f64)),
                    _ => Err(EvalError::UnknownSymbol(path.join("."))),
                }
            }
            _ => Err(EvalError::UnknownSymbol(path.join("."))),
        }
    }

    fn sleep(&self, duration: Duration) -> bool {
        sleep_cancellable(duration, self.token, self.poll)
    }

    fn print(&self, message: &str) {
        tracing::info!(target: "script", "{message}");
    }
}
