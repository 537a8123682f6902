//! Script Runner
//!
//! Runs a saved arm program against a simulated robot, optionally with a still photo
//! standing in for the camera, and reports the program's variables when it ends.

use anyhow::{Context, Result, bail};
use arm_logic::core_modules::geometry::{Point2, Rect};
use arm_logic::core_modules::motion_path::MotionPath;
use arm_logic::{Environment, Interpreter, ObjectManager, RuntimeConfig, Settings, Trackable, Vision, config};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod sim;

use sim::{SimulatedRobot, StillImageSource};

/// Run a saved robot-arm program with simulated hardware
#[derive(Parser, Debug)]
#[command(name = "script_runner")]
#[command(version)]
struct Args {
    /// Saved program (JSON list of events)
    #[arg(value_name = "PROGRAM")]
    program: PathBuf,

    /// Settings snapshot (camera/robot IDs, calibrations)
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Runtime tuning for the interpreter and vision engine
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Photo to use as the camera feed
    #[arg(short, long, value_name = "FILE")]
    image: Option<PathBuf>,

    /// Trackable object as NAME=PATH or NAME=PATH@HEIGHT (can be repeated)
    #[arg(long, value_name = "NAME=PATH")]
    object: Vec<String>,

    /// Recorded motion path as NAME=PATH (can be repeated)
    #[arg(long, value_name = "NAME=PATH")]
    motion: Vec<String>,

    /// Key to hold down for the whole run (can be repeated)
    #[arg(long, value_name = "KEY")]
    hold: Vec<String>,

    /// Seconds to run before stopping
    #[arg(short, long, default_value_t = 5.0)]
    duration: f64,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

fn split_named(arg: &str) -> Result<(&str, &str)> {
    match arg.split_once('=') {
        Some((name, rest)) if !name.is_empty() && !rest.is_empty() => Ok((name, rest)),
        _ => bail!("expected NAME=PATH, got '{arg}'"),
    }
}

fn load_trackable(arg: &str) -> Result<Trackable> {
    let (name, rest) = split_named(arg)?;
    let (path, height) = match rest.rsplit_once('@') {
        Some((path, height)) => (path, height.parse().with_context(|| format!("bad height in '{arg}'"))?),
        None => (rest, 0.0),
    };
    let image = image::open(path)
        .with_context(|| format!("failed to open object image {path}"))?
        .to_luma8();
    let rect = Rect::from_corners(
        Point2::new(0.0, 0.0),
        Point2::new(f64::from(image.width()) - 1.0, f64::from(image.height()) - 1.0),
    );
    Ok(Trackable { name: name.to_string(), image, rect, height })
}

fn load_motion_path(arg: &str) -> Result<(String, MotionPath)> {
    let (name, path) = split_named(arg)?;
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let motion: MotionPath = serde_json::from_str(&text).with_context(|| format!("failed to parse {path}"))?;
    Ok((name.to_string(), motion))
}

fn load_or_default<T: Default>(path: Option<&Path>, load: impl FnOnce(&Path) -> Result<T, config::ConfigError>) -> Result<T> {
    match path {
        Some(path) => load(path).with_context(|| format!("failed to load {}", path.display())),
        None => Ok(T::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let runtime: RuntimeConfig = load_or_default(args.config.as_deref(), config::load_runtime_config)?;
    let settings: Settings = load_or_default(args.settings.as_deref(), config::load_settings)?;
    let program = config::load_program(&args.program)
        .with_context(|| format!("failed to load program {}", args.program.display()))?;

    let mut objects = ObjectManager::new();
    for arg in &args.object {
        objects.add_trackable(load_trackable(arg)?);
    }
    for arg in &args.motion {
        let (name, path) = load_motion_path(arg)?;
        objects.add_motion_path(name, path);
    }

    let robot = Arc::new(SimulatedRobot::new());
    let mut env = Environment::new(settings, Arc::new(objects)).with_robot(robot.clone());
    let tracking = CancellationToken::new();
    let mut tracking_task = None;
    if let Some(path) = &args.image {
        let frame = image::open(path)
            .with_context(|| format!("failed to open camera image {}", path.display()))?
            .to_rgb8();
        let vision = Arc::new(Vision::new(Arc::new(StillImageSource::new(frame)), runtime.vision.clone()));
        tracking_task = Some(vision.clone().spawn_tracking(tracking.clone()));
        env = env.with_vision(vision);
    }
    for key in &args.hold {
        env.keys.press(key.clone());
    }

    let interpreter = Interpreter::new(env, runtime.interpreter.clone());
    let report = interpreter.load_script(&program)?;
    for (kind, tags) in &report {
        tracing::warn!("{kind}: {}", tags.join(", "));
    }

    let run_for = Duration::try_from_secs_f64(args.duration.max(0.0))
        .with_context(|| format!("duration of {} seconds is out of range", args.duration))?;
    let deadline = tokio::time::Instant::now()
        .checked_add(run_for)
        .with_context(|| format!("duration of {} seconds is out of range", args.duration))?;

    interpreter.start()?;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                if interpreter.is_finished() {
                    break;
                }
            }
        }
    }
    interpreter.stop().await?;

    tracking.cancel();
    if let Some(task) = tracking_task {
        task.await.context("vision tracking task failed")?;
    }

    tracing::info!(ticks = interpreter.tick_count(), position = ?robot.position(), "run finished");
    for (name, value) in interpreter.variables() {
        println!("{name} = {value}");
    }
    Ok(())
}
