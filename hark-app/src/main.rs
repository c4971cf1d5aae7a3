//! Hark wake-word listener.
//!
//! Opens the microphone, runs the configured wake device and prints one JSON
//! line per event on stdout so a host (speech recognizer, UI) can follow
//! along. Logs go to stderr.
//!
//! ```text
//! hark                  listen with the saved settings
//! hark --list-devices   print input device names
//! hark --settings       print the effective settings as JSON
//! ```

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hark_core::{
    audio::list_input_devices,
    wake::{artifacts::selected_models_dir, ModelFetcher},
    ArbiterConfig, ArbiterHandle, DeviceBuilder, EngineConfig, HarkEngine, HttpFetcher,
    OnnxEngineFactory, RegistryConfig, WakeDeviceKind, WakeDeviceRegistry, WakeDeviceState,
};
use serde::Serialize;
use settings::{apply_runtime_env_from_settings, default_settings_path, load_or_init_settings};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

/// One stdout line; `channel` names the source stream.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Line<'a, T: Serialize> {
    channel: &'a str,
    event: T,
}

fn emit<T: Serialize>(channel: &str, event: T) {
    match serde_json::to_string(&Line { channel, event }) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(channel, error = %e, "event serialization failed"),
    }
}

/// Print every event of `rx` until the channel closes.
fn forward<T>(channel: &'static str, mut rx: broadcast::Receiver<T>)
where
    T: Serialize + Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => emit(channel, event),
                Err(RecvError::Lagged(skipped)) => warn!(channel, skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hark_app=info,hark_core=info")),
        )
        .init();

    let settings_path = std::env::var_os("HARK_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let settings = load_or_init_settings(&settings_path);
    apply_runtime_env_from_settings(&settings);

    match std::env::args().nth(1).as_deref() {
        Some("--list-devices") => {
            for name in list_input_devices() {
                println!("{name}");
            }
            return Ok(());
        }
        Some("--settings") => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        Some(other) => anyhow::bail!("unknown argument: {other}"),
        None => {}
    }

    info!(settings = %settings_path.display(), device = %settings.wake_device, "hark starting");

    let models_root = settings.model_root().unwrap_or_else(selected_models_dir);
    let fetcher: Arc<dyn ModelFetcher> = Arc::new(HttpFetcher::new()?);
    let mut builder = DeviceBuilder::new(&models_root, Arc::new(OnnxEngineFactory), Some(fetcher));
    builder.detector.threshold = settings.threshold;
    if let Some(src) = settings.custom_classifier_path.as_deref() {
        if let Err(e) = builder.custom.import_classifier(Path::new(src)) {
            warn!(path = src, error = %e, "custom classifier import failed");
        }
    }

    let (arbiter, _arbiter_task) = ArbiterHandle::spawn(ArbiterConfig {
        wake_detected_timeout: Duration::from_millis(settings.wake_detected_timeout_ms),
        ..ArbiterConfig::default()
    });
    let registry = Arc::new(WakeDeviceRegistry::new(
        builder,
        arbiter.clone(),
        RegistryConfig::default(),
    ));
    forward("pipeline", arbiter.subscribe());
    forward("device", registry.subscribe());

    registry
        .select(settings.wake_device)
        .await
        .context("selecting wake device")?;
    if settings.wake_device != WakeDeviceKind::Disabled
        && registry.current().state() == WakeDeviceState::NotDownloaded
    {
        info!(models = %models_root.display(), "wake models missing; downloading");
        if let Err(e) = registry.download().await {
            warn!(error = %e, "wake model download failed; continuing without detection");
        }
    }

    let engine = Arc::new(HarkEngine::new(
        EngineConfig {
            max_backlog_frames: settings.max_backlog_frames,
            ..EngineConfig::default()
        },
        Arc::clone(&registry),
        arbiter.clone(),
    )?);
    forward("wake", engine.subscribe_wake());
    forward("engine", engine.subscribe_status());

    let starter = Arc::clone(&engine);
    let preferred = settings.preferred_input_device.clone();
    tokio::task::spawn_blocking(move || starter.start_with_device(preferred))
        .await
        .context("engine start task")??;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Err(e) = engine.stop() {
        warn!(error = %e, "engine stop");
    }
    let diagnostics = engine.diagnostics();
    info!(
        frames_processed = diagnostics.frames_processed,
        detections = diagnostics.detections,
        inference_errors = diagnostics.inference_errors,
        "final diagnostics"
    );
    registry.current().destroy();
    Ok(())
}
