mod common;

use arm_logic::{Environment, Interpreter, InterpreterError, InterpreterState, ObjectManager, Robot, Settings};
use common::{fast_config, records, set, tag, test, wait_until, with_robot};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread")]
async fn failed_test_skips_block_and_true_test_enters_it() {
    let (interpreter, _, report) = with_robot(json!([
        {"typeLogic": "InitEvent", "commandList": [
            test("x", "==", "0"),
            tag("StartBlockCommand"),
            set("x", "1"),
            tag("EndBlockCommand"),
        ]}
    ]));
    assert!(report.is_empty());
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.tick_count() >= 1).await);
    interpreter.stop().await.unwrap();
    assert_eq!(interpreter.get_variable("x"), Some(1.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_failure_resumes_at_same_depth() {
    let (interpreter, _, _) = with_robot(json!([
        {"typeLogic": "InitEvent", "commandList": [
            set("a", "5"),
            test("a", ">", "1"),
            tag("StartBlockCommand"),
                set("inner", "1"),
                test("a", "<", "1"),
                tag("StartBlockCommand"),
                    set("deep", "1"),
                    tag("StartBlockCommand"),
                        set("deeper", "1"),
                    tag("EndBlockCommand"),
                tag("EndBlockCommand"),
                set("after_inner", "1"),
            tag("EndBlockCommand"),
            set("after_outer", "1"),
        ]}
    ]));
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.tick_count() >= 1).await);
    interpreter.stop().await.unwrap();
    assert_eq!(interpreter.get_variable("inner"), Some(1.0));
    assert_eq!(interpreter.get_variable("deep"), None);
    assert_eq!(interpreter.get_variable("deeper"), None);
    assert_eq!(interpreter.get_variable("after_inner"), Some(1.0));
    assert_eq!(interpreter.get_variable("after_outer"), Some(1.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn else_block_runs_only_after_false_condition() {
    let branch = |value: &str| {
        json!({"typeLogic": "InitEvent", "commandList": [
            set("v", value),
            test("v", "==", "1"),
            tag("StartBlockCommand"), set("then_v", "v"), tag("EndBlockCommand"),
            tag("ElseCommand"),
            tag("StartBlockCommand"), set("else_v", "v"), tag("EndBlockCommand"),
            set("done_v", "v"),
        ]})
    };
    let (interpreter, _, _) = with_robot(json!([branch("1")]));
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.tick_count() >= 1).await);
    interpreter.stop().await.unwrap();
    assert_eq!(interpreter.get_variable("then_v"), Some(1.0));
    assert_eq!(interpreter.get_variable("else_v"), None);
    assert_eq!(interpreter.get_variable("done_v"), Some(1.0));

    let (interpreter, _, _) = with_robot(json!([branch("2")]));
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.tick_count() >= 1).await);
    interpreter.stop().await.unwrap();
    assert_eq!(interpreter.get_variable("then_v"), None);
    assert_eq!(interpreter.get_variable("else_v"), Some(2.0));
    assert_eq!(interpreter.get_variable("done_v"), Some(2.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_interrupts_a_long_wait() {
    let (interpreter, robot, _) = with_robot(json!([
        {"typeLogic": "StepEvent", "commandList": [
            {"typeLogic": "WaitCommand", "parameters": {"time": "30"}},
            {"typeLogic": "GripCommand"}
        ]}
    ]));
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.status().is_some_and(|s| s.get(&0).is_some_and(|c| c == &[0]))).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    interpreter.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(150), "stop took {:?}", started.elapsed());
    assert_eq!(interpreter.state(), InterpreterState::Stopped);
    assert!(robot.is_exiting());
    assert!(!robot.calls().iter().any(|c| c == "set_gripper(true)"));
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluator_faults_do_not_stop_the_loop() {
    let (interpreter, _, _) = with_robot(json!([
        {"typeLogic": "StepEvent", "commandList": [
            set("bad", "1/0"),
            set("missing", "undefined_name * 2"),
            {"typeLogic": "ScriptCommand", "parameters": {"script": "import os"}},
            set("count", "count + 1"),
        ]}
    ]));
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.get_variable("count").is_some_and(|c| c >= 3.0)).await);
    interpreter.stop().await.unwrap();
    assert_eq!(interpreter.get_variable("bad"), Some(0.0));
    assert_eq!(interpreter.get_variable("missing"), Some(0.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_waits_fail_and_the_loop_keeps_ticking() {
    let (interpreter, _, _) = with_robot(json!([
        {"typeLogic": "StepEvent", "commandList": [
            set("count", "count + 1"),
            {"typeLogic": "WaitCommand", "parameters": {"time": "1e20"}},
            {"typeLogic": "ScriptCommand", "parameters": {"script": "sleep(1e19)"}},
        ]}
    ]));
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.get_variable("count").is_some_and(|c| c >= 3.0)).await);
    interpreter.stop().await.unwrap();
    assert_eq!(interpreter.state(), InterpreterState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn variables_are_cleared_on_restart() {
    let (interpreter, _, _) = with_robot(json!([
        {"typeLogic": "InitEvent", "commandList": [set("runs", "runs + 1")]}
    ]));
    for _ in 0..2 {
        let ticks = interpreter.tick_count();
        interpreter.start().unwrap();
        assert!(wait_until(|| interpreter.tick_count() > ticks).await);
        interpreter.stop().await.unwrap();
        assert_eq!(interpreter.get_variable("runs"), Some(1.0));
    }
    assert_eq!(interpreter.get_variable("never"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn motion_commands_reach_the_robot_in_order() {
    let (interpreter, robot, report) = with_robot(json!([
        {"typeLogic": "InitEvent", "commandList": [
            {"typeLogic": "SpeedCommand", "parameters": {"speed": "20"}},
            {"typeLogic": "MoveXYZCommand", "parameters": {"x": "0", "y": "15", "z": "5 * 2"}},
            {"typeLogic": "DropCommand"},
            {"typeLogic": "BuzzerCommand", "parameters": {"frequency": "300", "time": "0.1"}},
            {"typeLogic": "EndProgramCommand"},
            {"typeLogic": "GripCommand"}
        ]}
    ]));
    assert!(report.is_empty());
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.is_finished()).await);
    interpreter.stop().await.unwrap();
    assert_eq!(
        robot.calls(),
        vec![
            "set_all_servos_active(true)",
            "set_speed(10)",
            "set_speed(20)",
            "set_pos(0, 15, 10, false)",
            "set_gripper(false)",
            "set_buzzer(300, 0.1)",
        ]
    );
}

/// A robot whose position bus faults on the first move.
struct FaultyRobot;

impl Robot for FaultyRobot {
    fn set_pos(&self, _x: f64, _y: f64, _z: f64, _relative: bool) {
        panic!("servo bus fault");
    }
    fn set_servo_angles(&self, _angles: &[(usize, f64)], _relative: bool) {}
    fn set_active_servos(&self, _servos: &[(usize, bool)]) {}
    fn set_all_servos_active(&self, _active: bool) {}
    fn set_speed(&self, _cm_per_sec: f64) {}
    fn set_gripper(&self, _closed: bool) {}
    fn set_buzzer(&self, _frequency_hz: f64, _duration_secs: f64) {}
    fn set_exiting(&self, _exiting: bool) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_worker_still_cleans_up_on_stop() {
    let env = Environment::new(Settings::default(), Arc::new(ObjectManager::new())).with_robot(Arc::new(FaultyRobot));
    let interpreter = Interpreter::new(env, fast_config());
    interpreter
        .load_script(&records(json!([
            {"typeLogic": "StepEvent", "commandList": [
                {"typeLogic": "MoveXYZCommand", "parameters": {"x": 0, "y": 0, "z": 0}}
            ]},
            {"typeLogic": "DestroyEvent", "commandList": [set("cleaned_up", "1")]}
        ])))
        .unwrap();
    interpreter.start().unwrap();
    assert!(wait_until(|| interpreter.is_finished()).await);

    assert!(matches!(interpreter.stop().await, Err(InterpreterError::Worker(_))));
    assert_eq!(interpreter.state(), InterpreterState::Stopped);
    assert!(interpreter.status().is_none());
    assert_eq!(interpreter.get_variable("cleaned_up"), Some(1.0));
}
