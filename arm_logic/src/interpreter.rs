// THEORY:
// The `Interpreter` owns a loaded program and runs it. The controller side (`load_script`,
// `start`, `stop`, `status`) is called from the application; the program itself runs on
// one dedicated blocking worker, because commands wait, sleep and drive the robot
// synchronously.
//
// Key architectural principles:
// 1.  **One worker**: A lifecycle state machine (Stopped, Starting, Running, Stopping)
//     guards `start`, so at most one worker exists. Ticks never overlap: each tick runs
//     its events and their commands strictly in order.
// 2.  **Explicit cancellation**: Each run gets a fresh `CancellationToken`. `stop` cancels
//     it and flags the robot as exiting; every wait inside the worker polls the token.
//     The worker handle is then awaited with a bounded timeout.
// 3.  **Cursor algorithm**: Within an event, outcomes move a cursor over the command
//     list. A failure skips the block that follows it; a success skips an `Else` block
//     that follows it. `next_index` is pure so the skip rule is tested on its own.
// 4.  **Destroy phase**: A `DestroyEvent` runs once during `stop`, after the main loop is
//     gone, under its own token. Only a second `stop` request can interrupt it.

use crate::cancel::TickTimer;
use crate::command::{CommandTag, Outcome, RunContext};
use crate::config::{EventRecord, InterpreterConfig};
use crate::environment::Environment;
use crate::error::InterpreterError;
use crate::event::{Event, EventTag};
use crate::namespace::Namespace;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error kind (the error's display text) to the type tags that produced it.
pub type LoadReport = BTreeMap<String, Vec<String>>;

/// Event index to the command indices executed so far in the current tick.
pub type RunStatus = BTreeMap<usize, Vec<usize>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How a command participates in block structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMarker {
    Start,
    End,
    Else,
    Plain,
}

impl BlockMarker {
    fn of(tag: Option<CommandTag>) -> Self {
        match tag {
            Some(CommandTag::StartBlock) => BlockMarker::Start,
            Some(CommandTag::EndBlock) => BlockMarker::End,
            Some(CommandTag::Else) => BlockMarker::Else,
            _ => BlockMarker::Plain,
        }
    }
}

/// The position just before where execution resumes when the command at `index`
/// fails: the block that follows it, if any, is skipped. An unterminated block runs
/// to the end of the list. The caller advances the cursor by one afterwards.
pub fn next_index(index: usize, markers: &[BlockMarker]) -> usize {
    let mut depth: i32 = 0;
    for i in index + 1..markers.len() {
        if markers[i] == BlockMarker::Start {
            depth += 1;
        }
        if depth == 0 {
            return i - 1;
        }
        if i == markers.len() - 1 {
            return i;
        }
        if markers[i] == BlockMarker::End {
            depth -= 1;
        }
    }
    index
}

enum EventFlow {
    Continue,
    Kill,
}

/// State shared between the controller and the worker.
struct Shared {
    env: Environment,
    config: InterpreterConfig,
    events: RwLock<Arc<Vec<Event>>>,
    namespace: Mutex<Namespace>,
    status: Mutex<Option<RunStatus>>,
    state: Mutex<InterpreterState>,
    run_token: Mutex<CancellationToken>,
    destroy_token: Mutex<Option<CancellationToken>>,
    ticks: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: InterpreterState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_robot_exiting(&self, exiting: bool) {
        if let Some(robot) = &self.env.robot {
            robot.set_exiting(exiting);
        }
    }

    fn record_status(&self, event: usize, command: usize) {
        if let Some(status) = self.status.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            status.entry(event).or_default().push(command);
        }
    }

    fn run_loop(&self, events: &[Event], token: &CancellationToken) {
        let poll = self.config.poll_interval();
        let ctx = RunContext {
            env: &self.env,
            namespace: &self.namespace,
            token,
            poll,
        };
        let mut timer = TickTimer::new(self.config.tick_interval());
        let mut first_tick = true;

        'ticks: while timer.wait(token, poll) {
            *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunStatus::new());
            for (index, event) in events.iter().enumerate() {
                if token.is_cancelled() {
                    break 'ticks;
                }
                if !event.is_active(first_tick) {
                    continue;
                }
                if let EventFlow::Kill = self.interpret_event(index, event, &ctx) {
                    tracing::info!(event = index, "program ended itself");
                    self.set_robot_exiting(true);
                    token.cancel();
                    break 'ticks;
                }
            }
            first_tick = false;
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        if timer.skipped() > 0 {
            tracing::debug!(skipped = timer.skipped(), "ticks dropped while behind schedule");
        }
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn interpret_event(&self, event_index: usize, event: &Event, ctx: &RunContext<'_>) -> EventFlow {
        let commands = event.commands();
        let markers: Vec<BlockMarker> = commands.iter().map(|c| BlockMarker::of(c.tag())).collect();
        let mut index = 0;

        while index < commands.len() {
            if ctx.is_cancelled() {
                break;
            }
            self.record_status(event_index, index);
            match commands[index].run(ctx) {
                Outcome::KillProgram => return EventFlow::Kill,
                Outcome::ExitEvent => break,
                Outcome::Failure => index = next_index(index, &markers),
                Outcome::Success => {
                    if markers.get(index + 1) == Some(&BlockMarker::Else) {
                        index = next_index(index + 1, &markers);
                    }
                }
            }
            index += 1;
        }
        EventFlow::Continue
    }
}

pub struct Interpreter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Interpreter {
    pub fn new(env: Environment, config: InterpreterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                env,
                config,
                events: RwLock::new(Arc::new(Vec::new())),
                namespace: Mutex::new(Namespace::new()),
                status: Mutex::new(None),
                state: Mutex::new(InterpreterState::Stopped),
                run_token: Mutex::new(CancellationToken::new()),
                destroy_token: Mutex::new(None),
                ticks: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.shared.env
    }

    pub fn state(&self) -> InterpreterState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == InterpreterState::Running
    }

    /// `true` once the worker has exited, including when the program ended itself.
    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Ticks completed since the interpreter was created.
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    pub fn event_count(&self) -> usize {
        self.shared.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Builds events and commands from saved records, replacing the current program.
    /// Items that fail to build are reported, never fatal to the rest of the load.
    pub fn load_script(&self, records: &[EventRecord]) -> Result<LoadReport, InterpreterError> {
        if self.state() != InterpreterState::Stopped {
            return Err(InterpreterError::ProgramLocked);
        }

        let mut report = LoadReport::new();
        let mut note = |kind: String, tag: &str| {
            let tags = report.entry(kind).or_default();
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        };

        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match Event::build(record, &self.shared.env) {
                Ok(event) => {
                    for error in event.errors() {
                        note(error.to_string(), &record.type_logic);
                    }
                    for command in event.commands() {
                        for error in command.errors() {
                            note(error.to_string(), command.type_logic());
                        }
                    }
                    events.push(event);
                }
                Err(error) => note(error.to_string(), &record.type_logic),
            }
        }

        for (kind, tags) in &report {
            tracing::warn!(error = %kind, tags = ?tags, "program loaded with errors");
        }
        tracing::info!(events = events.len(), "program loaded");
        *self.shared.events.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(events);
        Ok(report)
    }

    /// Launches the worker. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), InterpreterError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| InterpreterError::NoRuntime)?;
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != InterpreterState::Stopped {
                return Err(InterpreterError::AlreadyRunning);
            }
            *state = InterpreterState::Starting;
        }

        self.shared.namespace.lock().unwrap_or_else(PoisonError::into_inner).clear();
        if let Some(robot) = self.shared.env.connected_robot() {
            robot.set_exiting(false);
            robot.set_all_servos_active(true);
            robot.set_speed(self.shared.config.start_speed);
        }
        *self.shared.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunStatus::new());

        let token = CancellationToken::new();
        *self.shared.run_token.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        let events = self.shared.events.read().unwrap_or_else(PoisonError::into_inner).clone();
        let shared = self.shared.clone();
        let handle = runtime.spawn_blocking(move || shared.run_loop(&events, &token));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.shared.set_state(InterpreterState::Running);
        tracing::info!(
            tick_rate_hz = self.shared.config.tick_rate_hz,
            events = self.event_count(),
            "program started"
        );
        Ok(())
    }

    /// Cancels the run, waits for the worker, then runs the Destroy event if there is
    /// one. Called again while stopping, it interrupts the Destroy event instead.
    pub async fn stop(&self) -> Result<(), InterpreterError> {
        let previous = {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            if matches!(previous, InterpreterState::Starting | InterpreterState::Running) {
                *state = InterpreterState::Stopping;
            }
            previous
        };
        match previous {
            InterpreterState::Stopped => return Err(InterpreterError::NotRunning),
            InterpreterState::Stopping => {
                if let Some(token) = self.shared.destroy_token.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    tracing::info!("interrupting destroy event");
                    token.cancel();
                }
                return Ok(());
            }
            InterpreterState::Starting | InterpreterState::Running => {}
        }

        tracing::info!("stopping program");
        self.shared.run_token.lock().unwrap_or_else(PoisonError::into_inner).cancel();
        self.shared.set_robot_exiting(true);

        let joined = self.join_worker().await;
        if let Err(InterpreterError::StopTimeout(_)) = joined {
            return joined;
        }

        // A failed worker still gets its Destroy event; the worker's error wins.
        let destroyed = self.run_destroy_phase().await;
        *self.shared.status.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.set_state(InterpreterState::Stopped);
        tracing::info!("program stopped");
        joined.and(destroyed)
    }

    async fn join_worker(&self) -> Result<(), InterpreterError> {
        let Some(mut handle) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };
        let timeout = self.shared.config.stop_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, "program worker failed");
                Err(InterpreterError::Worker(join_error.to_string()))
            }
            Err(_) => {
                tracing::error!(?timeout, "program worker did not stop in time");
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Err(InterpreterError::StopTimeout(timeout))
            }
        }
    }

    async fn run_destroy_phase(&self) -> Result<(), InterpreterError> {
        let events = self.shared.events.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(index) = events.iter().position(|e| e.tag() == EventTag::Destroy) else {
            return Ok(());
        };

        let token = CancellationToken::new();
        *self.shared.destroy_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        self.shared.set_robot_exiting(false);
        tracing::info!(event = index, "running destroy event");

        let shared = self.shared.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let ctx = RunContext {
                env: &shared.env,
                namespace: &shared.namespace,
                token: &token,
                poll: shared.config.poll_interval(),
            };
            shared.interpret_event(index, &events[index], &ctx);
        });
        let result = handle.await.map_err(|join_error| {
            tracing::error!(error = %join_error, "destroy event failed");
            InterpreterError::Worker(join_error.to_string())
        });

        self.shared.set_robot_exiting(true);
        *self.shared.destroy_token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    /// Commands executed so far in the current tick, or `None` when not running.
    pub fn status(&self) -> Option<RunStatus> {
        self.shared.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// A variable of the current (or last) run. `None` if it was never set.
    pub fn get_variable(&self, name: &str) -> Option<f64> {
        self.shared
            .namespace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_variable(name)
    }

    /// Every variable of the current (or last) run.
    pub fn variables(&self) -> BTreeMap<String, f64> {
        self.shared
            .namespace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .variables()
            .clone()
    }

    /// Drops the loaded program.
    pub fn reset(&self) -> Result<(), InterpreterError> {
        if self.state() != InterpreterState::Stopped {
            return Err(InterpreterError::ProgramLocked);
        }
        *self.shared.events.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Vec::new());
        self.shared.namespace.lock().unwrap_or_else(PoisonError::into_inner).clear();
        tracing::info!("program cleared");
        Ok(())
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.shared.run_token.lock().unwrap_or_else(PoisonError::into_inner).cancel();
        if let Some(token) = self.shared.destroy_token.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::environment::ObjectManager;
    use crate::robot_vision::tests::RecordingRobot;
    use serde_json::json;
    use std::time::Duration;
    use super::BlockMarker::{Else, End, Plain, Start};

    #[test]
    fn failure_before_plain_command_does_not_skip() {
        assert_eq!(next_index(0, &[Plain, Plain, Plain]), 0);
    }

    #[test]
    fn failure_skips_following_block() {
        // test, {, a, }, b
        let markers = [Plain, Start, Plain, End, Plain];
        assert_eq!(next_index(0, &markers) + 1, 4);
    }

    #[test]
    fn failure_skips_nested_blocks_entirely() {
        // test, {, a, {, b, }, c, }, d
        let markers = [Plain, Start, Plain, Start, Plain, End, Plain, End, Plain];
        assert_eq!(next_index(0, &markers) + 1, 8);
        // inner test at depth 1 only skips the inner block
        assert_eq!(next_index(2, &markers) + 1, 6);
    }

    #[test]
    fn unterminated_block_reaches_list_end() {
        let markers = [Plain, Start, Plain, Plain];
        assert_eq!(next_index(0, &markers) + 1, markers.len());
        assert_eq!(next_index(0, &[Plain, Start]) + 1, 2);
    }

    #[test]
    fn last_command_failing_is_harmless() {
        assert_eq!(next_index(2, &[Plain, Plain, Plain]), 2);
    }

    #[test]
    fn else_block_is_skipped_from_else_position() {
        // test, {, a, }, else, {, b, }, c
        let markers = [Plain, Start, Plain, End, Else, Start, Plain, End, Plain];
        assert_eq!(next_index(4, &markers) + 1, 8);
    }

    fn interpreter(robot: Arc<RecordingRobot>, program: serde_json::Value) -> (Interpreter, LoadReport) {
        let env = Environment::new(Settings::default(), Arc::new(ObjectManager::new())).with_robot(robot);
        let config = InterpreterConfig { tick_rate_hz: 200.0, poll_interval_ms: 5, ..InterpreterConfig::default() };
        let interpreter = Interpreter::new(env, config);
        let records: Vec<EventRecord> = serde_json::from_value(program).unwrap();
        let report = interpreter.load_script(&records).unwrap();
        (interpreter, report)
    }

    async fn wait_for_ticks(interpreter: &Interpreter, ticks: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while interpreter.tick_count() < ticks && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_applies_defaults_and_stop_runs_destroy() {
        let robot = Arc::new(RecordingRobot::default());
        let (interpreter, report) = interpreter(
            robot.clone(),
            json!([
                {"typeLogic": "InitEvent", "commandList": [
                    {"typeLogic": "SetVariableCommand", "parameters": {"variable": "n", "expression": "0"}}
                ]},
                {"typeLogic": "StepEvent", "commandList": [
                    {"typeLogic": "SetVariableCommand", "parameters": {"variable": "n", "expression": "n + 1"}}
                ]},
                {"typeLogic": "DestroyEvent", "commandList": [
                    {"typeLogic": "GripCommand"}
                ]}
            ]),
        );
        assert!(report.is_empty());

        interpreter.start().unwrap();
        assert!(matches!(interpreter.start(), Err(InterpreterError::AlreadyRunning)));
        assert!(matches!(interpreter.load_script(&[]), Err(InterpreterError::ProgramLocked)));
        wait_for_ticks(&interpreter, 3).await;
        interpreter.stop().await.unwrap();

        assert_eq!(interpreter.state(), InterpreterState::Stopped);
        assert!(interpreter.status().is_none());
        assert!(interpreter.get_variable("n").unwrap() >= 3.0);
        let calls = robot.calls();
        assert_eq!(&calls[..2], &["set_all_servos_active(true)", "set_speed(10)"]);
        assert_eq!(calls.last().map(String::as_str), Some("set_gripper(true)"));
        assert!(robot.exiting.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn end_program_halts_the_loop() {
        let robot = Arc::new(RecordingRobot::default());
        let (interpreter, _) = interpreter(
            robot.clone(),
            json!([
                {"typeLogic": "StepEvent", "commandList": [
                    {"typeLogic": "EndProgramCommand"},
                    {"typeLogic": "GripCommand"}
                ]}
            ]),
        );
        interpreter.start().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !interpreter.is_finished() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(interpreter.is_finished());
        assert!(robot.exiting.load(Ordering::SeqCst));
        interpreter.stop().await.unwrap();
        assert!(!robot.calls().iter().any(|c| c == "set_gripper(true)"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn end_event_only_stops_its_own_event() {
        let robot = Arc::new(RecordingRobot::default());
        let (interpreter, _) = interpreter(
            robot,
            json!([
                {"typeLogic": "InitEvent", "commandList": [
                    {"typeLogic": "SetVariableCommand", "parameters": {"variable": "a", "expression": "1"}},
                    {"typeLogic": "EndEventCommand"},
                    {"typeLogic": "SetVariableCommand", "parameters": {"variable": "a", "expression": "2"}}
                ]},
                {"typeLogic": "InitEvent", "commandList": [
                    {"typeLogic": "SetVariableCommand", "parameters": {"variable": "b", "expression": "1"}}
                ]}
            ]),
        );
        interpreter.start().unwrap();
        wait_for_ticks(&interpreter, 1).await;
        interpreter.stop().await.unwrap();
        assert_eq!(interpreter.get_variable("a"), Some(1.0));
        assert_eq!(interpreter.get_variable("b"), Some(1.0));
    }

    #[test]
    fn unknown_tags_are_reported_and_skipped() {
        let (interpreter, report) = interpreter(
            Arc::new(RecordingRobot::default()),
            json!([
                {"typeLogic": "TipEvent", "commandList": [{"typeLogic": "GripCommand"}]},
                {"typeLogic": "StepEvent", "commandList": [
                    {"typeLogic": "TeleportCommand"},
                    {"typeLogic": "TeleportCommand"},
                    {"typeLogic": "PickupObjectCommand", "parameters": {"objectID": "Cup"}}
                ]}
            ]),
        );
        assert_eq!(interpreter.event_count(), 1);
        assert_eq!(report["unknown event type 'TipEvent'"], vec!["TipEvent"]);
        assert_eq!(report["unknown command type 'TeleportCommand'"], vec!["TeleportCommand"]);
        assert_eq!(report["camera is not connected"], vec!["PickupObjectCommand"]);
    }

    #[test]
    fn start_requires_a_runtime() {
        let (interpreter, _) = interpreter(Arc::new(RecordingRobot::default()), json!([]));
        assert!(matches!(interpreter.start(), Err(InterpreterError::NoRuntime)));
        assert_eq!(interpreter.state(), InterpreterState::Stopped);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_an_error() {
        let (interpreter, _) = interpreter(Arc::new(RecordingRobot::default()), json!([]));
        assert!(matches!(interpreter.stop().await, Err(InterpreterError::NotRunning)));
        assert!(interpreter.reset().is_ok());
    }
}
