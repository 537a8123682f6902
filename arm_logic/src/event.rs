// THEORY:
// An `Event` is a trigger plus the ordered commands it runs. The interpreter asks every
// event, each tick and in load order, whether it is active; active events run their
// command list through the cursor algorithm.
//
// Key architectural principles:
// 1.  **Closed registry**: `EventTag` names every trigger the loader accepts. Unlike
//     commands, an unknown event tag cannot be kept as a placeholder (it has no
//     activation rule), so the loader skips it and reports it.
// 2.  **Resolved at build**: The trigger captures the handles it polls (key state,
//     vision) once. A trigger whose collaborator is missing records the error and is
//     never active, while its commands still load and report their own errors.
// 3.  **Advisory priority**: `priority` is for display and sorting in editors. Execution
//     order is always load order.

use crate::command::Command;
use crate::config::{EventRecord, MotionCalibrations};
use crate::environment::{Environment, KeyState, Trackable};
use crate::error::ConstructionError;
use crate::vision::{RECENT_MAX_AGE, Vision};
use serde_json::{Map, Value as Json};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    Init,
    Step,
    Destroy,
    Keypress,
    Motion,
    RecognizeObject,
}

impl EventTag {
    pub const ALL: &'static [EventTag] = &[
        EventTag::Init,
        EventTag::Step,
        EventTag::Destroy,
        EventTag::Keypress,
        EventTag::Motion,
        EventTag::RecognizeObject,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventTag::Init => "InitEvent",
            EventTag::Step => "StepEvent",
            EventTag::Destroy => "DestroyEvent",
            EventTag::Keypress => "KeypressEvent",
            EventTag::Motion => "MotionEvent",
            EventTag::RecognizeObject => "RecognizeObjectEvent",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == tag)
    }

    pub fn base_priority(self) -> i32 {
        match self {
            EventTag::Init => 0,
            EventTag::Step => 100,
            EventTag::Keypress => 300,
            EventTag::Motion => 400,
            EventTag::RecognizeObject => 500,
            EventTag::Destroy => 10000,
        }
    }
}

enum Trigger {
    FirstTick,
    EveryTick,
    Never,
    Key {
        keys: Arc<KeyState>,
        key: String,
    },
    Motion {
        vision: Arc<Vision>,
        low: f64,
        high: f64,
    },
    Recognize {
        vision: Arc<Vision>,
        target: Arc<Trackable>,
        min_points: usize,
        negate: bool,
    },
}

/// One of the named motion thresholds a `MotionEvent` bound may refer to.
fn motion_bound(
    value: Option<&Json>,
    key: &str,
    calibration: Option<MotionCalibrations>,
    errors: &mut Vec<ConstructionError>,
) -> f64 {
    let Some(name) = value.and_then(Json::as_str) else {
        errors.push(match value {
            None => ConstructionError::MissingParameter(key.to_string()),
            Some(_) => ConstructionError::InvalidParameter {
                name: key.to_string(),
                reason: "expected None, Low, High or Inf".to_string(),
            },
        });
        return f64::NAN;
    };
    match (name, calibration) {
        ("None", _) => f64::NEG_INFINITY,
        ("Inf", _) => f64::INFINITY,
        ("Low", Some(c)) => c.low,
        ("High", Some(c)) => c.high,
        ("Low" | "High", None) => {
            errors.push(ConstructionError::MotionCalibrationMissing);
            f64::NAN
        }
        (other, _) => {
            errors.push(ConstructionError::InvalidParameter {
                name: key.to_string(),
                reason: format!("'{other}' is not one of None, Low, High, Inf"),
            });
            f64::NAN
        }
    }
}

fn build_trigger(
    tag: EventTag,
    parameters: &Map<String, Json>,
    env: &Environment,
    errors: &mut Vec<ConstructionError>,
) -> Trigger {
    match tag {
        EventTag::Init => Trigger::FirstTick,
        EventTag::Step => Trigger::EveryTick,
        EventTag::Destroy => Trigger::Never,
        EventTag::Keypress => match parameters.get("checkKey").and_then(Json::as_str) {
            Some(key) => Trigger::Key {
                keys: env.keys.clone(),
                key: key.to_string(),
            },
            None => {
                errors.push(ConstructionError::MissingParameter("checkKey".to_string()));
                Trigger::Never
            }
        },
        EventTag::Motion => {
            let calibration = env.settings.motion_calibrations;
            let low = motion_bound(parameters.get("low"), "low", calibration, errors);
            let high = motion_bound(parameters.get("high"), "high", calibration, errors);
            let vision = env.connected_vision().cloned();
            if vision.is_none() {
                errors.push(ConstructionError::CameraNotConnected);
            }
            match vision {
                Some(vision) if !low.is_nan() && !high.is_nan() => Trigger::Motion { vision, low, high },
                _ => Trigger::Never,
            }
        }
        EventTag::RecognizeObject => {
            let negate = parameters.get("not").and_then(Json::as_bool).unwrap_or(false);
            let Some(id) = parameters.get("objectID").and_then(Json::as_str) else {
                errors.push(ConstructionError::MissingParameter("objectID".to_string()));
                return Trigger::Never;
            };
            let vision = env.connected_vision().cloned();
            if vision.is_none() {
                errors.push(ConstructionError::CameraNotConnected);
            }
            let target = env.resources.trackable(id);
            if target.is_none() {
                errors.push(ConstructionError::ObjectNotFound(id.to_string()));
            }
            match (vision, target) {
                (Some(vision), Some(target)) => {
                    vision.add_target(&target);
                    let min_points = vision.config().min_match_count;
                    Trigger::Recognize { vision, target, min_points, negate }
                }
                _ => Trigger::Never,
            }
        }
    }
}

pub struct Event {
    tag: EventTag,
    parameters: Map<String, Json>,
    errors: Vec<ConstructionError>,
    trigger: Trigger,
    commands: Vec<Command>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("tag", &self.tag)
            .field("errors", &self.errors)
            .field("commands", &self.commands)
            .finish()
    }
}

impl Event {
    /// Builds an event and all of its commands. Only an unknown event tag is an error;
    /// every other problem is recorded on the event or the offending command.
    pub fn build(record: &EventRecord, env: &Environment) -> Result<Event, ConstructionError> {
        let tag = EventTag::from_tag(&record.type_logic)
            .ok_or_else(|| ConstructionError::UnknownEventType(record.type_logic.clone()))?;
        let mut errors = Vec::new();
        let trigger = build_trigger(tag, &record.parameters, env, &mut errors);
        let commands = record
            .command_list
            .iter()
            .map(|command| Command::build(command, env))
            .collect();
        Ok(Event {
            tag,
            parameters: record.parameters.clone(),
            errors,
            trigger,
            commands,
        })
    }

    pub fn tag(&self) -> EventTag {
        self.tag
    }

    pub fn parameters(&self) -> &Map<String, Json> {
        &self.parameters
    }

    pub fn errors(&self) -> &[ConstructionError] {
        &self.errors
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn priority(&self) -> i32 {
        let negated = self.tag == EventTag::RecognizeObject
            && self.parameters.get("not").and_then(Json::as_bool).unwrap_or(false);
        self.tag.base_priority() + if negated { 10 } else { 0 }
    }

    /// Whether this event should run on the current tick.
    pub fn is_active(&self, first_tick: bool) -> bool {
        match &self.trigger {
            Trigger::FirstTick => first_tick,
            Trigger::EveryTick => true,
            Trigger::Never => false,
            Trigger::Key { keys, key } => keys.is_held(key),
            Trigger::Motion { vision, low, high } => {
                let motion = vision.motion_level();
                *low < motion && motion < *high
            }
            Trigger::Recognize { vision, target, min_points, negate } => {
                let seen = vision
                    .search_tracked_history(&target.name, RECENT_MAX_AGE, *min_points)
                    .is_some();
                seen != *negate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::environment::ObjectManager;
    use serde_json::json;

    fn record(value: Json) -> EventRecord {
        serde_json::from_value(value).unwrap()
    }

    fn env() -> Environment {
        Environment::new(Settings::default(), Arc::new(ObjectManager::new()))
    }

    #[test]
    fn tags_round_trip() {
        for tag in EventTag::ALL {
            assert_eq!(EventTag::from_tag(tag.as_str()), Some(*tag));
        }
        assert_eq!(EventTag::from_tag("TipEvent"), None);
    }

    #[test]
    fn unknown_event_tag_is_rejected() {
        let err = Event::build(&record(json!({"typeLogic": "TipEvent", "parameters": {}})), &env()).unwrap_err();
        assert_eq!(err, ConstructionError::UnknownEventType("TipEvent".into()));
    }

    #[test]
    fn init_and_step_activation() {
        let env = env();
        let init = Event::build(&record(json!({"typeLogic": "InitEvent"})), &env).unwrap();
        let step = Event::build(&record(json!({"typeLogic": "StepEvent"})), &env).unwrap();
        let destroy = Event::build(&record(json!({"typeLogic": "DestroyEvent"})), &env).unwrap();
        assert!(init.is_active(true) && !init.is_active(false));
        assert!(step.is_active(true) && step.is_active(false));
        assert!(!destroy.is_active(true));
        assert_eq!((init.priority(), step.priority(), destroy.priority()), (0, 100, 10000));
    }

    #[test]
    fn keypress_follows_key_state() {
        let env = env();
        let event = Event::build(
            &record(json!({"typeLogic": "KeypressEvent", "parameters": {"checkKey": "A"}})),
            &env,
        )
        .unwrap();
        assert!(!event.is_active(false));
        env.keys.press("A");
        assert!(event.is_active(false));
        env.keys.release("A");
        assert!(!event.is_active(false));
    }

    #[test]
    fn motion_event_needs_camera_and_calibration() {
        let event = Event::build(
            &record(json!({"typeLogic": "MotionEvent", "parameters": {"low": "Low", "high": "Inf"}})),
            &env(),
        )
        .unwrap();
        assert!(event.errors().contains(&ConstructionError::MotionCalibrationMissing));
        assert!(event.errors().contains(&ConstructionError::CameraNotConnected));
        assert!(!event.is_active(false));
    }

    #[test]
    fn negated_recognition_has_higher_priority() {
        let event = Event::build(
            &record(json!({"typeLogic": "RecognizeObjectEvent", "parameters": {"objectID": "Cup", "not": true}})),
            &env(),
        )
        .unwrap();
        assert_eq!(event.priority(), 510);
        assert!(event.errors().contains(&ConstructionError::ObjectNotFound("Cup".into())));
    }

    #[test]
    fn commands_load_even_when_trigger_is_broken() {
        let event = Event::build(
            &record(json!({
                "typeLogic": "KeypressEvent",
                "parameters": {},
                "commandList": [{"typeLogic": "SetVariableCommand", "parameters": {"variable": "a", "expression": "1"}}]
            })),
            &env(),
        )
        .unwrap();
        assert_eq!(event.errors(), &[ConstructionError::MissingParameter("checkKey".into())]);
        assert_eq!(event.commands().len(), 1);
        assert!(event.commands()[0].errors().is_empty());
    }
}
