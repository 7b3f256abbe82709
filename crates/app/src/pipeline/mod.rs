//! The surveillance pipeline: per-camera ingest workers feeding the decision
//! engine, the alert dispatcher, and the API server.
//!
//! Construction wires every component through explicit handles — the
//! directive registry in particular is a single shared instance handed to
//! both the API layer and every worker.

pub mod baseline;
pub mod config;
pub mod data;
pub mod decision;
pub mod directives;
pub mod dispatch;
pub mod reasoning;
pub mod server;
pub mod store;
pub mod summary;
pub mod supervisor;
pub mod telemetry;
pub mod vision;
pub mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::pipeline::config::PipelineConfig;
use crate::pipeline::directives::DirectiveRegistry;
use crate::pipeline::dispatch::{AlertDispatcher, StreamHub};
use crate::pipeline::reasoning::{ClaudeReasoning, ProgressionAnalyzer};
use crate::pipeline::server::{spawn_api_server, ApiState};
use crate::pipeline::store::FrameStore;
use crate::pipeline::supervisor::Supervisor;
use crate::pipeline::vision::{GeminiVision, SceneAnalyzer};
use crate::pipeline::worker::WorkerDeps;

/// CLI-level overrides layered on top of the environment configuration.
#[derive(Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub frames_root: Option<PathBuf>,
}

/// Build the pipeline from configuration and serve until interrupted.
pub fn run(overrides: RuntimeOverrides) -> Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(frames_root) = overrides.frames_root {
        config.frame_store_root = frames_root;
    }
    let host = overrides.host.unwrap_or_else(|| config.app_host.clone());
    let port = overrides.port.unwrap_or(config.app_port);

    let metrics_handle = telemetry::init_metrics_recorder();

    let registry = Arc::new(DirectiveRegistry::new());
    let store = Arc::new(FrameStore::new(config.frame_store_root.clone()));

    let vision: Option<Arc<dyn SceneAnalyzer>> = match &config.vision_api_key {
        Some(key) => Some(Arc::new(GeminiVision::new(
            config.vision_api_url.clone(),
            key.clone(),
            config.vision_rate_limit,
            config.model_call_timeout,
        )?)),
        None => {
            warn!("VISION_API_KEY not set; cameras will stream frames without analysis");
            None
        }
    };

    let reasoning: Option<Arc<dyn ProgressionAnalyzer>> = match &config.reasoning_api_key {
        Some(key) => Some(Arc::new(ClaudeReasoning::new(
            config.reasoning_api_url.clone(),
            key.clone(),
            config.model_call_timeout,
        )?)),
        None => {
            info!("REASONING_API_KEY not set; reasoning layer disabled");
            None
        }
    };

    let alerts = Arc::new(AlertDispatcher::new(config.alert_ring_capacity));
    let live = Arc::new(StreamHub::new("live-feed"));
    let analysis = Arc::new(StreamHub::new("analysis"));
    let system = Arc::new(StreamHub::new("system"));

    let deps = WorkerDeps {
        registry: registry.clone(),
        store,
        vision,
        reasoning,
        alerts: alerts.clone(),
        live: live.clone(),
        analysis: analysis.clone(),
        system: system.clone(),
    };
    let supervisor = Arc::new(Supervisor::new(config, deps));

    let api = spawn_api_server(
        ApiState {
            supervisor: supervisor.clone(),
            registry,
            alerts,
            live,
            analysis,
            system,
            metrics: metrics_handle,
            started_at: Utc::now(),
        },
        host.clone(),
        port,
    )?;

    info!("argus listening on http://{host}:{port}");

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        handler_shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    supervisor.shutdown();
    api.stop();
    Ok(())
}
