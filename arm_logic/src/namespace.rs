// THEORY:
// The `Namespace` is the only scope user text can see. It holds the program's numeric
// variables and evaluates trees produced by `expression` against them.
//
// Key architectural principles:
// 1.  **Allow-list by construction**: A plain call resolves only against the fixed math
//     table below, plus `sleep` and `print`. A dotted call (`robot.set_pos(...)`) goes to
//     the `Host`, which decides what its handles expose. Nothing else is reachable.
// 2.  **Contained faults**: Every failure is an `EvalError` value. The public
//     `evaluate_expression`/`evaluate_script`/`set_variable` entry points log the fault
//     and report a plain failure; nothing ever panics out of the evaluator.
// 3.  **Numeric variables**: Variables hold `f64`. Booleans are stored as 1 and 0, so a
//     stored comparison still tests the same way. Strings cannot be stored.
// 4.  **Per-run lifetime**: The interpreter clears the namespace on every start.

use crate::error::EvalError;
use crate::expression::{AssignOp, BinaryOp, Expr, Statement, UnaryOp, parse_expression, parse_script};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
    /// Result of calls made for their effect, like `print` or `robot.set_gripper`.
    Nothing,
}

impl Value {
    pub fn as_number(&self) -> Result<f64, EvalError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Text(_) => Err(EvalError::Type("expected a number, found text".to_string())),
            Value::Nothing => Err(EvalError::NoValue),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::Text(t) => !t.is_empty(),
            Value::Nothing => false,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Number(_) | Value::Bool(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Text(t) => write!(f, "{t}"),
            Value::Nothing => write!(f, "None"),
        }
    }
}

/// The externally owned handles a script may call through.
pub trait Host {
    /// Calls a dotted handle function such as `robot.set_pos`.
    fn call(&self, path: &[String], args: &[Value]) -> Result<Value, EvalError>;
    /// Reads a dotted handle attribute such as `settings.robotID`.
    fn attribute(&self, path: &[String]) -> Result<Value, EvalError>;
    /// Sleeps for `duration`. Returns `false` if interrupted by a stop request.
    fn sleep(&self, duration: Duration) -> bool;
    fn print(&self, message: &str);
}

/// A host exposing no handles, for evaluating pure expressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandles;

impl Host for NoHandles {
    fn call(&self, path: &[String], _args: &[Value]) -> Result<Value, EvalError> {
        Err(EvalError::UnknownFunction(path.join(".")))
    }

    fn attribute(&self, path: &[String]) -> Result<Value, EvalError> {
        Err(EvalError::UnknownSymbol(path.join(".")))
    }

    fn sleep(&self, duration: Duration) -> bool {
        std::thread::sleep(duration);
        true
    }

    fn print(&self, message: &str) {
        tracing::info!(target: "script", "{message}");
    }
}

#[derive(Debug, Clone, Copy)]
enum Arity {
    Exactly(usize),
    Between(usize, usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::Between(lo, hi) => (lo..=hi).contains(&n),
            Arity::AtLeast(k) => n >= k,
        }
    }

    fn describe(self) -> String {
        match self {
            Arity::Exactly(k) => k.to_string(),
            Arity::Between(lo, hi) => format!("{lo} to {hi}"),
            Arity::AtLeast(k) => format!("at least {k}"),
        }
    }
}

#[derive(Clone, Copy)]
struct MathFunction {
    arity: Arity,
    apply: fn(&[f64]) -> f64,
}

const fn unary(apply: fn(&[f64]) -> f64) -> MathFunction {
    MathFunction { arity: Arity::Exactly(1), apply }
}

const fn binary(apply: fn(&[f64]) -> f64) -> MathFunction {
    MathFunction { arity: Arity::Exactly(2), apply }
}

fn math_functions() -> &'static HashMap<&'static str, MathFunction> {
    static TABLE: OnceLock<HashMap<&'static str, MathFunction>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("abs", unary(|a| a[0].abs())),
            ("fabs", unary(|a| a[0].abs())),
            ("acos", unary(|a| a[0].acos())),
            ("asin", unary(|a| a[0].asin())),
            ("atan", unary(|a| a[0].atan())),
            ("ceil", unary(|a| a[0].ceil())),
            ("cos", unary(|a| a[0].cos())),
            ("cosh", unary(|a| a[0].cosh())),
            ("degrees", unary(|a| a[0].to_degrees())),
            ("exp", unary(|a| a[0].exp())),
            ("floor", unary(|a| a[0].floor())),
            ("int", unary(|a| a[0].trunc())),
            ("log10", unary(|a| a[0].log10())),
            ("radians", unary(|a| a[0].to_radians())),
            ("sin", unary(|a| a[0].sin())),
            ("sinh", unary(|a| a[0].sinh())),
            ("sqrt", unary(|a| a[0].sqrt())),
            ("tan", unary(|a| a[0].tan())),
            ("tanh", unary(|a| a[0].tanh())),
            ("atan2", binary(|a| a[0].atan2(a[1]))),
            ("fmod", binary(|a| a[0] % a[1])),
            ("hypot", binary(|a| a[0].hypot(a[1]))),
            ("ldexp", binary(|a| a[0] * 2f64.powi(a[1] as i32))),
            ("pow", binary(|a| a[0].powf(a[1]))),
            (
                "log",
                MathFunction {
                    arity: Arity::Between(1, 2),
                    apply: |a| match a {
                        [x] => x.ln(),
                        [x, base] => x.ln() / base.ln(),
                        _ => f64::NAN,
                    },
                },
            ),
            (
                "round",
                MathFunction {
                    arity: Arity::Between(1, 2),
                    apply: |a| match a {
                        [x] => x.round_ties_even(),
                        [x, digits] => {
                            let scale = 10f64.powi(*digits as i32);
                            (x * scale).round_ties_even() / scale
                        }
                        _ => f64::NAN,
                    },
                },
            ),
            (
                "min",
                MathFunction {
                    arity: Arity::AtLeast(1),
                    apply: |a| a.iter().copied().fold(f64::INFINITY, f64::min),
                },
            ),
            (
                "max",
                MathFunction {
                    arity: Arity::AtLeast(1),
                    apply: |a| a.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                },
            ),
        ])
    })
}

fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        _ => None,
    }
}

fn finite(value: f64, what: &str) -> Result<Value, EvalError> {
    if value.is_finite() {
        Ok(Value::Number(value))
    } else {
        Err(EvalError::Domain(what.to_string()))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
        && !matches!(name, "and" | "or" | "not" | "True" | "False" | "true" | "false")
}

/// Program variables plus the evaluator over them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    variables: BTreeMap<String, f64>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.variables.clear();
    }

    pub fn variables(&self) -> &BTreeMap<String, f64> {
        &self.variables
    }

    /// The variable's value, or `None` if it was never set this run.
    pub fn get_variable(&self, name: &str) -> Option<f64> {
        self.variables.get(name).copied()
    }

    /// Stores `value` under `name` without evaluation.
    pub fn insert(&mut self, name: &str, value: f64) {
        self.variables.insert(name.to_string(), value);
    }

    /// Parses and evaluates `source`, requiring it to produce a value.
    pub fn evaluate(&self, source: &str, host: &dyn Host) -> Result<Value, EvalError> {
        let expr = parse_expression(source)?;
        match self.eval(&expr, host)? {
            Value::Nothing => Err(EvalError::NoValue),
            value => Ok(value),
        }
    }

    /// Like [`Namespace::evaluate`], with the fault logged and reduced to `None`.
    pub fn evaluate_expression(&self, source: &str, host: &dyn Host) -> Option<Value> {
        match self.evaluate(source, host) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(expression = source, error = %err, "expression evaluation failed");
                None
            }
        }
    }

    /// Runs a script. Statements before a fault keep their effects.
    pub fn run_script(&mut self, source: &str, host: &dyn Host) -> Result<(), EvalError> {
        for statement in parse_script(source)? {
            match statement {
                Statement::Expr(expr) => {
                    self.eval(&expr, host)?;
                }
                Statement::Assign { name, op, value } => {
                    let rhs = self.eval(&value, host)?.as_number()?;
                    let result = match op {
                        AssignOp::Set => rhs,
                        _ => {
                            let current = self
                                .get_variable(&name)
                                .ok_or_else(|| EvalError::UnknownSymbol(name.clone()))?;
                            match op {
                                AssignOp::Add => current + rhs,
                                AssignOp::Sub => current - rhs,
                                AssignOp::Mul => current * rhs,
                                _ if rhs == 0.0 => return Err(EvalError::DivisionByZero),
                                _ => current / rhs,
                            }
                        }
                    };
                    finite(result, "assignment")?;
                    self.variables.insert(name, result);
                }
            }
        }
        Ok(())
    }

    /// Like [`Namespace::run_script`], with the fault logged and reduced to `false`.
    pub fn evaluate_script(&mut self, source: &str, host: &dyn Host) -> bool {
        match self.run_script(source, host) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "script failed");
                false
            }
        }
    }

    /// Assigns the value of `source` to `name`, creating it at 0 first if needed.
    /// A failed evaluation leaves the variable at its prior value (0 when new).
    pub fn set_variable(&mut self, name: &str, source: &str, host: &dyn Host) -> bool {
        if !is_identifier(name) {
            tracing::warn!(variable = name, "invalid variable name");
            return false;
        }
        self.variables.entry(name.to_string()).or_insert(0.0);
        let Some(value) = self.evaluate_expression(source, host) else {
            return false;
        };
        match value.as_number() {
            Ok(number) => {
                self.variables.insert(name.to_string(), number);
                true
            }
            Err(err) => {
                tracing::warn!(variable = name, error = %err, "value cannot be stored in a variable");
                false
            }
        }
    }

    /// Evaluates a parsed expression.
    pub fn eval(&self, expr: &Expr, host: &dyn Host) -> Result<Value, EvalError> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Text(t) => Ok(Value::Text(t.clone())),
            Expr::Name(name) => self
                .get_variable(name)
                .or_else(|| constant(name))
                .map(Value::Number)
                .ok_or_else(|| EvalError::UnknownSymbol(name.clone())),
            Expr::Attribute(path) => host.attribute(path),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, host)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => Ok(Value::Number(-value.as_number()?)),
                    UnaryOp::Pos => Ok(Value::Number(value.as_number()?)),
                }
            }
            Expr::Binary { op: BinaryOp::And, left, right } => {
                let left = self.eval(left, host)?;
                if !left.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right, host)?.truthy()))
            }
            Expr::Binary { op: BinaryOp::Or, left, right } => {
                let left = self.eval(left, host)?;
                if left.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right, host)?.truthy()))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, host)?;
                let right = self.eval(right, host)?;
                binary_op(*op, &left, &right)
            }
            Expr::Call { path, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, host))
                    .collect::<Result<Vec<_>, _>>()?;
                match path.as_slice() {
                    [name] => call_builtin(name, &args, host),
                    _ => host.call(path, &args),
                }
            }
        }
    }
}

fn call_builtin(name: &str, args: &[Value], host: &dyn Host) -> Result<Value, EvalError> {
    match name {
        "sleep" => {
            if args.len() != 1 {
                return Err(EvalError::arity(name, "1", args.len()));
            }
            let seconds = args[0].as_number()?;
            let duration = Duration::try_from_secs_f64(seconds).map_err(|_| EvalError::Domain(name.to_string()))?;
            if host.sleep(duration) {
                Ok(Value::Nothing)
            } else {
                Err(EvalError::Cancelled)
            }
        }
        "print" => {
            let message = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
            host.print(&message);
            Ok(Value::Nothing)
        }
        _ => {
            let function = math_functions()
                .get(name)
                .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
            if !function.arity.accepts(args.len()) {
                return Err(EvalError::arity(name, function.arity.describe(), args.len()));
            }
            let numbers = args
                .iter()
                .map(Value::as_number)
                .collect::<Result<Vec<_>, _>>()?;
            finite((function.apply)(&numbers), name)
        }
    }
}

fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(left, right, op)?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        BinaryOp::Add => {
            if let (Value::Text(a), Value::Text(b)) = (left, right) {
                return Ok(Value::Text(format!("{a}{b}")));
            }
        }
        _ => {}
    }

    let (a, b) = (left.as_number()?, right.as_number()?);
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod if b == 0.0 => {
            return Err(EvalError::DivisionByZero);
        }
        BinaryOp::Div => a / b,
        BinaryOp::FloorDiv => (a / b).floor(),
        BinaryOp::Mod => a - b * (a / b).floor(),
        _ => unreachable!("comparison and logic operators are handled above"),
    };
    finite(result, op.symbol())
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Text(a), Value::Text(b)) => a == b,
        (Value::Nothing, Value::Nothing) => true,
        (a, b) if a.is_numeric() && b.is_numeric() => a.as_number().ok() == b.as_number().ok(),
        _ => false,
    }
}

fn compare(left: &Value, right: &Value, op: BinaryOp) -> Result<Ordering, EvalError> {
    match (left, right) {
        (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
        (a, b) if a.is_numeric() && b.is_numeric() => a
            .as_number()?
            .partial_cmp(&b.as_number()?)
            .ok_or_else(|| EvalError::Domain(op.symbol().to_string())),
        _ => Err(EvalError::Type(format!("'{}' needs two numbers or two strings", op.symbol()))),
    }
}
