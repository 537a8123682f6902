// THEORY:
// Three kinds of file feed a run, and all of them are plain JSON read with serde:
//
// 1.  **RuntimeConfig**: tuning for the interpreter loop and the vision engine. Every
//     field has a default, so an empty object (or no file at all) is a valid config.
//     Loading always finishes with `validate()`; a config that deserialises but makes
//     no sense (a zero tick rate, a ratio test above 1) is rejected here, not at run time.
// 2.  **Settings**: the read-only snapshot the calibration tools saved, in their
//     camelCase layout. Missing calibrations are represented as `None`/empty and are
//     turned into construction errors by the commands that need them.
// 3.  **Program records**: the saved Event/Command list. Only its shape is checked here;
//     interpreting the tags and parameters is the loader's job.

use crate::core_modules::coordinates::PointPair;
use crate::core_modules::homography::RansacParams;
use crate::core_modules::plane_tracker::TrackerParams;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Slowest accepted loop or tracking rate. Slower rates are clamped to it.
pub const MIN_RATE_HZ: f64 = 0.01;

fn rate_interval(rate_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate_hz.max(MIN_RATE_HZ))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Target rate of the program loop.
    pub tick_rate_hz: f64,
    /// How long `stop()` waits for the worker before giving up.
    pub stop_timeout_ms: u64,
    /// Robot speed applied at every start, in cm/s.
    pub start_speed: f64,
    /// Granularity at which long-running commands check for cancellation.
    pub poll_interval_ms: u64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 50.0,
            stop_timeout_ms: 5000,
            start_speed: 10.0,
            poll_interval_ms: 25,
        }
    }
}

impl InterpreterConfig {
    pub fn tick_interval(&self) -> Duration {
        rate_interval(self.tick_rate_hz)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub max_features: usize,
    pub fast_threshold: u8,
    pub min_match_count: usize,
    pub ratio_test: f64,
    pub ransac_threshold: f64,
    pub ransac_iterations: usize,
    /// Upper bound on frames grabbed by one brute-accurate search.
    pub brute_max_attempts: usize,
    /// Upper bound on wall time spent by one brute-accurate search.
    pub brute_time_budget_ms: u64,
    /// Update rate of the background tracking task.
    pub tracking_fps: f64,
    /// Side length in pixels of one motion-detection cell.
    pub motion_chunk_size: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            min_match_count: 10,
            ratio_test: 0.75,
            ransac_threshold: 3.0,
            ransac_iterations: 500,
            brute_max_attempts: 40,
            brute_time_budget_ms: 3000,
            tracking_fps: 30.0,
            motion_chunk_size: 16,
        }
    }
}

impl VisionConfig {
    pub fn tracker_params(&self) -> TrackerParams {
        TrackerParams {
            max_features: self.max_features,
            fast_threshold: self.fast_threshold,
            min_match_count: self.min_match_count,
            ratio: self.ratio_test,
            ransac: RansacParams {
                threshold: self.ransac_threshold,
                max_iterations: self.ransac_iterations,
                ..RansacParams::default()
            },
        }
    }

    pub fn brute_time_budget(&self) -> Duration {
        Duration::from_millis(self.brute_time_budget_ms)
    }

    pub fn tracking_interval(&self) -> Duration {
        rate_interval(self.tracking_fps)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub interpreter: InterpreterConfig,
    pub vision: VisionConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interpreter = &self.interpreter;
        if !(interpreter.tick_rate_hz.is_finite() && interpreter.tick_rate_hz >= MIN_RATE_HZ) {
            return Err(ConfigError::Invalid(format!(
                "interpreter.tick_rate_hz must be at least {MIN_RATE_HZ}"
            )));
        }
        if interpreter.stop_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "interpreter.stop_timeout_ms must be > 0".to_string(),
            ));
        }
        if interpreter.poll_interval_ms == 0 || interpreter.poll_interval_ms >= 100 {
            return Err(ConfigError::Invalid(
                "interpreter.poll_interval_ms must be between 1 and 99".to_string(),
            ));
        }
        if !(interpreter.start_speed.is_finite() && interpreter.start_speed > 0.0) {
            return Err(ConfigError::Invalid(
                "interpreter.start_speed must be > 0".to_string(),
            ));
        }

        let vision = &self.vision;
        if vision.max_features == 0 {
            return Err(ConfigError::Invalid(
                "vision.max_features must be > 0".to_string(),
            ));
        }
        if vision.min_match_count < 4 {
            return Err(ConfigError::Invalid(
                "vision.min_match_count must be at least 4".to_string(),
            ));
        }
        if !(vision.ratio_test > 0.0 && vision.ratio_test <= 1.0) {
            return Err(ConfigError::Invalid(
                "vision.ratio_test must be in (0, 1]".to_string(),
            ));
        }
        if !(vision.ransac_threshold.is_finite() && vision.ransac_threshold > 0.0) {
            return Err(ConfigError::Invalid(
                "vision.ransac_threshold must be > 0".to_string(),
            ));
        }
        if vision.ransac_iterations == 0 || vision.brute_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "vision iteration and attempt budgets must be > 0".to_string(),
            ));
        }
        if vision.brute_time_budget_ms == 0 {
            return Err(ConfigError::Invalid(
                "vision.brute_time_budget_ms must be > 0".to_string(),
            ));
        }
        if !(vision.tracking_fps.is_finite() && vision.tracking_fps >= MIN_RATE_HZ) {
            return Err(ConfigError::Invalid(format!(
                "vision.tracking_fps must be at least {MIN_RATE_HZ}"
            )));
        }
        if vision.motion_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "vision.motion_chunk_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Camera/robot calibration. Both fields are absent until calibration has been run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordCalibrations {
    pub pt_pairs: Vec<PointPair>,
    /// Robot position touching the table, in cm. Its `z` is the ground height.
    pub ground_pos: Option<[f64; 3]>,
}

/// Scene-motion levels measured with the camera still (`low`) and with a hand waving in
/// front of it (`high`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionCalibrations {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "cameraID")]
    pub camera_id: Option<i64>,
    #[serde(rename = "robotID")]
    pub robot_id: Option<String>,
    #[serde(rename = "coordCalibrations")]
    pub coord_calibrations: CoordCalibrations,
    #[serde(rename = "motionCalibrations")]
    pub motion_calibrations: Option<MotionCalibrations>,
}

/// One saved Command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    #[serde(rename = "typeLogic")]
    pub type_logic: String,
    #[serde(default, deserialize_with = "nullable_map")]
    pub parameters: Map<String, Value>,
}

/// One saved Event with its ordered commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "typeLogic")]
    pub type_logic: String,
    #[serde(default, deserialize_with = "nullable_map")]
    pub parameters: Map<String, Value>,
    #[serde(rename = "commandList", default)]
    pub command_list: Vec<CommandRecord>,
}

fn nullable_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Load and validate a runtime config from a JSON file.
pub fn load_runtime_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: RuntimeConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load a settings snapshot from a JSON file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Load a saved program from a JSON file.
pub fn load_program(path: &Path) -> Result<Vec<EventRecord>, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_the_default_config() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.interpreter.tick_interval(), Duration::from_millis(20));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"interpreter": {"tick_rate_hz": 10}}"#).unwrap();
        assert_eq!(config.interpreter.tick_rate_hz, 10.0);
        assert_eq!(config.interpreter.poll_interval_ms, 25);
        assert_eq!(config.vision.ratio_test, 0.75);
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut config = RuntimeConfig::default();
        config.interpreter.tick_rate_hz = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RuntimeConfig::default();
        config.vision.ratio_test = 1.5;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.interpreter.poll_interval_ms = 250;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.vision.tracking_fps = 1e-30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn vanishing_rates_clamp_their_interval() {
        let mut config = RuntimeConfig::default();
        config.interpreter.tick_rate_hz = 1e-30;
        config.vision.tracking_fps = f64::NAN;
        assert!(config.validate().is_err());
        assert_eq!(config.interpreter.tick_interval(), Duration::from_secs(100));
        assert_eq!(config.vision.tracking_interval(), Duration::from_secs(100));
    }

    #[test]
    fn settings_read_the_saved_layout() {
        let json = r#"{
            "cameraID": 0,
            "robotID": "/dev/ttyUSB0",
            "coordCalibrations": {
                "ptPairs": [[[100, 100], [5, 20, 1]], [[300, 120], [25, 18, 1]]],
                "groundPos": [10, 15, -2]
            },
            "motionCalibrations": {"low": 1.5, "high": 9.0}
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.camera_id, Some(0));
        assert_eq!(settings.coord_calibrations.pt_pairs.len(), 2);
        assert_eq!(settings.coord_calibrations.ground_pos, Some([10.0, 15.0, -2.0]));
        assert_eq!(settings.motion_calibrations.map(|m| m.high), Some(9.0));
    }

    #[test]
    fn uncalibrated_settings_are_empty() {
        let settings: Settings = serde_json::from_str(r#"{"coordCalibrations": {}}"#).unwrap();
        assert!(settings.coord_calibrations.pt_pairs.is_empty());
        assert!(settings.motion_calibrations.is_none());
    }

    #[test]
    fn program_records_accept_null_parameters() {
        let json = r#"[{"typeLogic": "StepEvent", "parameters": null,
                        "commandList": [{"typeLogic": "GripCommand", "parameters": {}}]}]"#;
        let program: Vec<EventRecord> = serde_json::from_str(json).unwrap();
        assert!(program[0].parameters.is_empty());
        assert_eq!(program[0].command_list[0].type_logic, "GripCommand");
    }
}
