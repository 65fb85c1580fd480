//! Multi-channel capture - Main Entry Point
//!
//! Runs the pipeline against simulated devices until a frame limit is
//! reached, a stage fails, Ctrl-C is pressed or `q` is typed, then prints
//! the run summary as JSON.
//!
//! Usage: `multicap-rs [config.toml]`

use anyhow::Context;
use multicap_rs::{
    bus::{parser, BusInterpreter, BusWorker, CommandScript, InterpreterOptions, MemoryBus},
    config::{default_config_path, PipelineConfig, RuntimeSchedule},
    pipeline::{CancelToken, DeviceSet, PipelineBuilder},
    sensor::{SensorKind, SensorProfile},
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let loaded = load_config(std::env::args_os().nth(1).map(PathBuf::from));

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(loaded.as_ref().ok().and_then(|c| c.log_dir.as_deref()));
    tracing::info!("Starting multi-channel capture");
    let config = logged(loaded, "load pipeline config")?;

    let sensor = config
        .sensor
        .as_ref()
        .map(|s| SensorKind::resolve(&s.name))
        .transpose()?;
    let sensor_tag = match (&sensor, &config.sensor) {
        (Some(kind), Some(settings)) => kind.filename_tag(&settings.properties),
        _ => String::new(),
    };

    // Bring the bus up before any stage starts, then hand it to the worker
    let script = match &config.bus.script {
        Some(path) => parser::parse_file(path)?.script,
        None => CommandScript::new(),
    };
    let interpreter = BusInterpreter::new(MemoryBus::new(), config.bus.device).with_options(InterpreterOptions {
        verify_writes: config.bus.verify_writes,
        write_settle: Duration::from_micros(config.bus.write_settle_us),
    });
    let (mut bus_worker, bus) = BusWorker::new(interpreter, script)?;
    if let (Some(kind), Some(settings)) = (&sensor, &config.sensor) {
        bus_worker = bus_worker.with_calibration(kind.calibrate(&settings.properties, &settings.calibration)?);
    }
    let runtime = if config.runtime_settings.is_empty() {
        None
    } else {
        Some(Arc::new(RuntimeSchedule::from_config(&config.runtime_settings)?))
    };
    if let Some(schedule) = &runtime {
        bus_worker = bus_worker.with_runtime(schedule.clone());
    }
    bus_worker.bring_up().context("bus bring-up failed")?;
    let bus_thread = bus_worker.spawn()?;

    let mut builder = PipelineBuilder::new(config.clone())
        .with_sensor_tag(sensor_tag)
        .with_bus(bus.clone());
    if let Some(schedule) = runtime {
        builder = builder.with_runtime(schedule);
    }
    let mut pipeline = builder.build(DeviceSet::simulated(&config))?;

    let cancel = pipeline.cancel_token();
    let ctrlc_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupted");
        ctrlc_cancel.cancel();
    })
    .context("failed to install Ctrl-C handler")?;
    spawn_quit_listener(cancel.clone());

    if let Err(e) = pipeline.start() {
        tracing::error!("Failed to start pipeline: {}", e);
    }
    pipeline.wait();

    tracing::info!("Shutting down...");
    let summary = pipeline.shutdown();

    if let Some(path) = &config.bus.dump_on_exit {
        bus.dump(path.clone());
    }
    bus.shutdown();
    if bus_thread.join().is_err() {
        tracing::error!("Bus worker panicked");
    }
    for message in bus.drain() {
        tracing::debug!("Bus: {:?}", message);
    }

    println!("{}", summary.to_json()?);
    if let Some(error) = summary.error {
        anyhow::bail!("run failed: {error}");
    }
    if !summary.conservation.is_balanced() {
        anyhow::bail!("buffers missing after teardown");
    }
    Ok(())
}

/// Load and validate the config named on the command line, else the one in
/// the default location, else the defaults
fn load_config(path: Option<PathBuf>) -> anyhow::Result<PipelineConfig> {
    let path = path.or_else(|| default_config_path().filter(|p| p.exists()));
    let config = match path {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Report a startup failure through tracing before it ends the run
fn logged<T>(result: anyhow::Result<T>, action: &str) -> anyhow::Result<T> {
    if let Err(e) = &result {
        tracing::error!("Failed to {}: {:#}", action, e);
    }
    result
}

fn init_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,multicap_rs=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "multicap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

/// Cancel the run when `q` or `quit` is read from stdin
fn spawn_quit_listener(cancel: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if matches!(line.trim(), "q" | "quit") {
                    tracing::info!("Quit requested");
                    cancel.cancel();
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Could not listen for quit on stdin: {}", e);
    }
}
