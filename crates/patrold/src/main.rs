//! Patrol daemon
//!
//! Wires the patrol engine to its providers (thresholds from config, state
//! from the platform's snapshot file, file-backed persistence), starts the
//! trigger worker, and serves health/metrics endpoints. LLM and agent
//! executor providers are wired by the embedding platform; without them the
//! engine records skipped runs.

use anyhow::Result;
use patrol_lib::engine::EngineConfig;
use patrol_lib::findings::FindingsStore;
use patrol_lib::health::components;
use patrol_lib::history::RunHistoryStore;
use patrol_lib::providers::StaticThresholds;
use patrol_lib::thresholds::ThresholdMode;
use patrol_lib::trigger::TriggerManager;
use patrol_lib::{HealthRegistry, PatrolEngineBuilder, PatrolLogger, PatrolMetrics};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod persist;
mod state_file;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting patrold");

    let config = config::DaemonConfig::load()?;
    info!(instance = %config.instance, "Daemon configured");

    let health = HealthRegistry::new();
    health.set_ok(components::ENGINE).await;
    health.set_ok(components::TRIGGERS).await;
    health.set_ok(components::PERSISTENCE).await;

    let _metrics = PatrolMetrics::new();
    let logger = PatrolLogger::new(&config.instance);
    logger.log_startup(DAEMON_VERSION);

    // Stores with file-backed persistence
    let persistence = Arc::new(persist::FilePersistence::new(&config.data_dir));
    let findings = Arc::new(FindingsStore::new());
    findings.set_persistence(persistence.clone()).await;
    {
        let health = health.clone();
        findings
            .set_save_error_callback(Arc::new(move |e: &anyhow::Error| {
                let health = health.clone();
                let message = e.to_string();
                tokio::spawn(async move {
                    health
                        .set_degraded(components::PERSISTENCE, message)
                        .await;
                });
            }))
            .await;
    }
    let history = Arc::new(RunHistoryStore::new());
    history.set_persistence(persistence).await;

    let threshold_mode = match config.threshold_mode.as_str() {
        "proactive" => ThresholdMode::Proactive,
        _ => ThresholdMode::Exact,
    };
    let engine_config = EngineConfig {
        interval: Duration::from_secs(config.patrol_interval_secs),
        llm_timeout: Duration::from_secs(config.llm_timeout_secs),
        auto_fix: config.auto_fix,
        threshold_mode,
        instance: config.instance.clone(),
        ..Default::default()
    };

    let engine = PatrolEngineBuilder::new()
        .config(engine_config)
        .thresholds(Arc::new(StaticThresholds {
            cpu: config.cpu_threshold,
            memory: config.memory_threshold,
            disk: config.disk_threshold,
            storage: config.storage_threshold,
        }))
        .state(Arc::new(state_file::FileStateProvider::new(
            &config.state_file,
        )))
        .findings_store(findings)
        .history_store(history)
        .build();
    engine.start();

    // Trigger worker feeding scoped patrols into the engine
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let triggers = Arc::new(TriggerManager::new());
    triggers.set_event_triggers_enabled(config.event_triggers);
    tokio::spawn(
        Arc::clone(&triggers).run(engine.clone(), shutdown_tx.subscribe()),
    );

    health.set_ready(true).await;

    let app_state = Arc::new(api::AppState::new(health.clone(), engine.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    engine.stop();
    api_handle.abort();

    Ok(())
}
