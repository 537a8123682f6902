//! Error taxonomy shared by loading, evaluation and the interpreter lifecycle.
//!
//! Tracking misses and protocol signals (exit event, kill program) are not errors and
//! never appear here: misses are `None`, signals are [`crate::command::Outcome`] values.

use std::time::Duration;
use thiserror::Error;

/// A problem found while building an Event or Command from its saved record.
///
/// These are accumulated, never fatal to sibling items. The `Display` text doubles as the
/// error-kind key of a [`crate::interpreter::LoadReport`].
#[derive(Debug, Clone, Error, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstructionError {
    #[error("robot is not connected")]
    RobotNotConnected,
    #[error("camera is not connected")]
    CameraNotConnected,
    #[error("object '{0}' could not be found")]
    ObjectNotFound(String),
    #[error("camera/robot coordinate calibration has not been performed")]
    CalibrationMissing,
    #[error("motion calibration has not been performed")]
    MotionCalibrationMissing,
    #[error("missing parameter '{0}'")]
    MissingParameter(String),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("unknown command type '{0}'")]
    UnknownCommandType(String),
}

/// A fault raised while evaluating an expression or script. Always contained by the
/// evaluator and surfaced as a failed evaluation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("syntax error at {position}: {message}")]
    Parse { message: String, position: usize },
    #[error("name '{0}' is not defined")]
    UnknownSymbol(String),
    #[error("function '{0}' is not available")]
    UnknownFunction(String),
    #[error("{name}() takes {expected} argument(s), {found} given")]
    Arity {
        name: String,
        expected: String,
        found: usize,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("math domain error in {0}")]
    Domain(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("expression produced no value")]
    NoValue,
    #[error("sleep interrupted by stop request")]
    Cancelled,
    #[error("{0}")]
    Host(String),
}

impl EvalError {
    pub(crate) fn parse(message: impl Into<String>, position: usize) -> Self {
        EvalError::Parse {
            message: message.into(),
            position,
        }
    }

    pub(crate) fn arity(name: &str, expected: impl Into<String>, found: usize) -> Self {
        EvalError::Arity {
            name: name.to_string(),
            expected: expected.into(),
            found,
        }
    }
}

/// Failures of the interpreter's controller-side operations.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("a program is already running")]
    AlreadyRunning,
    #[error("no program is running")]
    NotRunning,
    #[error("the program cannot be changed while it is running")]
    ProgramLocked,
    #[error("the program worker did not exit within {0:?}")]
    StopTimeout(Duration),
    #[error("the program worker failed: {0}")]
    Worker(String),
    #[error("starting a program requires a tokio runtime")]
    NoRuntime,
}
