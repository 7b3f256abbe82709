//! Camera lifecycle and directive orchestration.
//!
//! The supervisor owns the camera inventory, spawns and stops workers on API
//! requests, and implements the auto-start policy: a directive arriving for a
//! stopped camera starts it, and removing the last directive stops only the
//! cameras the supervisor itself auto-started — never one the user started by
//! hand.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::config::PipelineConfig;
use crate::pipeline::data::{AlertSeverity, Directive};
use crate::pipeline::decision::DecisionThresholds;
use crate::pipeline::directives::SharedRegistry;
use crate::pipeline::worker::{
    publish_system, spawn_camera_worker, CameraHandle, CameraState, WorkerDeps, WorkerSettings,
};

/// Ceiling on waiting for one worker to acknowledge a stop.
const STOP_CEILING: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize)]
pub struct CameraStatus {
    pub camera_id: u32,
    pub source: String,
    pub state: CameraState,
    pub auto_started: bool,
}

/// Result of processing one directive through the supervisor.
#[derive(Clone, Debug, Serialize)]
pub struct DirectiveOutcome {
    pub directive_id: Uuid,
    pub action: String,
    pub started_cameras: Vec<u32>,
}

struct CameraSlot {
    source_uri: String,
    handle: Option<CameraHandle>,
}

pub struct Supervisor {
    config: PipelineConfig,
    registry: SharedRegistry,
    deps: WorkerDeps,
    cameras: Mutex<HashMap<u32, CameraSlot>>,
}

impl Supervisor {
    pub fn new(config: PipelineConfig, deps: WorkerDeps) -> Self {
        let cameras = config
            .camera_sources
            .iter()
            .enumerate()
            .map(|(id, uri)| {
                (
                    id as u32,
                    CameraSlot {
                        source_uri: uri.clone(),
                        handle: None,
                    },
                )
            })
            .collect();
        Self {
            registry: deps.registry.clone(),
            config,
            deps,
            cameras: Mutex::new(cameras),
        }
    }

    pub fn camera_ids(&self) -> Vec<u32> {
        let cameras = self.cameras.lock().expect("camera table poisoned");
        let mut ids: Vec<u32> = cameras.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn camera_states(&self) -> Vec<CameraStatus> {
        let cameras = self.cameras.lock().expect("camera table poisoned");
        let mut states: Vec<CameraStatus> = cameras
            .iter()
            .map(|(&camera_id, slot)| CameraStatus {
                camera_id,
                source: slot.source_uri.clone(),
                state: slot
                    .handle
                    .as_ref()
                    .map(|h| h.state())
                    .unwrap_or(CameraState::Stopped),
                auto_started: slot.handle.as_ref().map(|h| h.auto_started).unwrap_or(false),
            })
            .collect();
        states.sort_by_key(|status| status.camera_id);
        states
    }

    /// Start a camera. Idempotent: an already-running camera reports its
    /// current state.
    pub fn start_camera(&self, camera_id: u32, auto_started: bool) -> Result<CameraState> {
        let mut cameras = self.cameras.lock().expect("camera table poisoned");
        let Some(slot) = cameras.get_mut(&camera_id) else {
            bail!("unknown camera {camera_id}");
        };

        if let Some(handle) = &slot.handle {
            match handle.state() {
                CameraState::Stopped | CameraState::Failed => {
                    // Fall through and respawn over the finished worker.
                }
                state => return Ok(state),
            }
        }

        info!("starting camera {camera_id} ({})", slot.source_uri);
        let source = frame_ingest::build_source(&slot.source_uri);
        let settings = WorkerSettings {
            camera_id,
            frame_interval: self.config.frame_interval(),
            summary_interval: self.config.summary_interval,
            thresholds: DecisionThresholds {
                object: self.config.object_threshold,
                activity: self.config.activity_threshold,
                undirected_immediate: self.config.undirected_immediate_threshold,
                summary_collect: self.config.summary_collect_threshold,
            },
            baseline_stability_frames: self.config.baseline_stability_frames,
            history_window: self.config.history_window,
        };
        let handle = spawn_camera_worker(settings, self.deps.clone(), source, auto_started);
        let state = handle.state();
        slot.handle = Some(handle);
        metrics::gauge!("argus_active_cameras").set(self.active_count_locked(&cameras) as f64);
        Ok(state)
    }

    /// Stop a camera. Idempotent: a stopped camera reports STOPPED.
    pub fn stop_camera(&self, camera_id: u32) -> Result<CameraState> {
        let handle = {
            let mut cameras = self.cameras.lock().expect("camera table poisoned");
            let Some(slot) = cameras.get_mut(&camera_id) else {
                bail!("unknown camera {camera_id}");
            };
            slot.handle.take()
        };

        let Some(mut handle) = handle else {
            return Ok(CameraState::Stopped);
        };

        handle.request_stop();
        if !handle.await_stopped(STOP_CEILING) {
            warn!("camera {camera_id}: stop acknowledgement timed out");
        }
        let state = handle.state();

        let cameras = self.cameras.lock().expect("camera table poisoned");
        metrics::gauge!("argus_active_cameras").set(self.active_count_locked(&cameras) as f64);
        Ok(state)
    }

    /// Record a directive and auto-start every stopped camera in its scope.
    pub fn process_directive(&self, directive: Directive) -> DirectiveOutcome {
        let directive_id = directive.id;
        let target = directive.target.clone();
        let scope = directive.camera_scope.clone();

        if !self.registry.add(directive) {
            return DirectiveOutcome {
                directive_id,
                action: "duplicate".into(),
                started_cameras: Vec::new(),
            };
        }

        let mut started = Vec::new();
        for camera_id in self.camera_ids() {
            if !scope.includes(camera_id) {
                continue;
            }
            let currently_stopped = {
                let cameras = self.cameras.lock().expect("camera table poisoned");
                cameras
                    .get(&camera_id)
                    .map(|slot| {
                        slot.handle
                            .as_ref()
                            .map(|h| {
                                matches!(h.state(), CameraState::Stopped | CameraState::Failed)
                            })
                            .unwrap_or(true)
                    })
                    .unwrap_or(false)
            };
            if currently_stopped {
                match self.start_camera(camera_id, true) {
                    Ok(_) => started.push(camera_id),
                    Err(err) => warn!("auto-start of camera {camera_id} failed: {err}"),
                }
            }
        }

        publish_system(
            &self.deps.alerts,
            &self.deps.system,
            None,
            AlertSeverity::System,
            "directive_accepted",
            format!("Monitoring directive accepted: {target}"),
            json!({
                "directive_id": directive_id,
                "target": target,
                "started_cameras": started,
            }),
        );

        DirectiveOutcome {
            directive_id,
            action: "created".into(),
            started_cameras: started,
        }
    }

    /// Remove a directive; auto-stop cameras this supervisor auto-started
    /// that now have no directive in scope.
    pub fn remove_directive(&self, directive_id: Uuid) -> bool {
        let Some(directive) = self.registry.remove(directive_id) else {
            return false;
        };

        for camera_id in self.camera_ids() {
            if !directive.camera_scope.includes(camera_id) {
                continue;
            }
            if !self.registry.list_for_camera(camera_id).is_empty() {
                continue;
            }
            let auto_started = {
                let cameras = self.cameras.lock().expect("camera table poisoned");
                cameras
                    .get(&camera_id)
                    .and_then(|slot| slot.handle.as_ref())
                    .map(|h| h.auto_started && h.state() == CameraState::Running)
                    .unwrap_or(false)
            };
            if auto_started {
                info!("camera {camera_id}: last directive removed, auto-stopping");
                let _ = self.stop_camera(camera_id);
            }
        }

        publish_system(
            &self.deps.alerts,
            &self.deps.system,
            None,
            AlertSeverity::System,
            "directive_removed",
            format!("Monitoring directive removed: {}", directive.target),
            json!({ "directive_id": directive_id }),
        );
        true
    }

    /// Stop every camera, bounded per worker.
    pub fn shutdown(&self) {
        for camera_id in self.camera_ids() {
            if let Err(err) = self.stop_camera(camera_id) {
                warn!("shutdown of camera {camera_id} failed: {err}");
            }
        }
    }

    fn active_count_locked(&self, cameras: &HashMap<u32, CameraSlot>) -> usize {
        cameras
            .values()
            .filter(|slot| {
                slot.handle
                    .as_ref()
                    .map(|h| {
                        matches!(
                            h.state(),
                            CameraState::Starting | CameraState::Running | CameraState::Stopping
                        )
                    })
                    .unwrap_or(false)
            })
            .count()
    }
}
