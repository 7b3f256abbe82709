//! End-to-end pipeline runs with scripted analyzers and a synthetic camera.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use argus::pipeline::config::PipelineConfig;
use argus::pipeline::data::{
    AlertKind, AlertSeverity, CameraScope, Directive, DirectiveKind, DirectiveStatus,
    VisionObservation,
};
use argus::pipeline::directives::DirectiveRegistry;
use argus::pipeline::dispatch::{AlertDispatcher, StreamHub};
use argus::pipeline::store::FrameStore;
use argus::pipeline::supervisor::Supervisor;
use argus::pipeline::vision::{SceneAnalyzer, VisionError};
use argus::pipeline::worker::{CameraState, WorkerDeps};
use uuid::Uuid;

// ── Scripted vision model ────────────────────────────────────────────────────

enum Step {
    Observe(VisionObservation),
    RateLimited,
}

/// Replays a fixed script of observations; the final step repeats forever.
struct ScriptedAnalyzer {
    steps: Mutex<Vec<Step>>,
}

impl ScriptedAnalyzer {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        assert!(!steps.is_empty());
        Arc::new(Self {
            steps: Mutex::new(steps),
        })
    }
}

impl SceneAnalyzer for ScriptedAnalyzer {
    fn analyze(
        &self,
        _jpeg: &[u8],
        captured_at: DateTime<Utc>,
        _directive: Option<&Directive>,
        _baseline: Option<&str>,
    ) -> Result<VisionObservation, VisionError> {
        let mut steps = self.steps.lock().unwrap();
        let step = if steps.len() > 1 {
            steps.remove(0)
        } else {
            match &steps[0] {
                Step::Observe(obs) => Step::Observe(obs.clone()),
                Step::RateLimited => Step::RateLimited,
            }
        };
        match step {
            Step::Observe(mut obs) => {
                obs.captured_at = captured_at;
                Ok(obs)
            }
            Step::RateLimited => Err(VisionError::RateLimited),
        }
    }
}

fn observation(scene: &str, significance: u8, person: bool) -> VisionObservation {
    let mut obs = VisionObservation::failed(Utc::now());
    obs.scene_description = scene.into();
    obs.activity = "routine".into();
    obs.significance = significance;
    obs.person_present = person;
    obs
}

// ── World construction ───────────────────────────────────────────────────────

struct World {
    supervisor: Arc<Supervisor>,
    alerts: Arc<AlertDispatcher>,
    _frames: TempDir,
}

fn build_world(vision: Arc<dyn SceneAnalyzer>, summary_interval: Duration) -> World {
    let frames = TempDir::new().unwrap();
    let config = PipelineConfig {
        camera_fps: 20.0,
        camera_sources: vec!["synthetic:".into()],
        vision_api_key: Some("scripted".into()),
        vision_api_url: String::new(),
        vision_rate_limit: 10_000,
        reasoning_api_key: None,
        reasoning_api_url: String::new(),
        object_threshold: 60,
        activity_threshold: 40,
        undirected_immediate_threshold: 60,
        summary_collect_threshold: 50,
        summary_interval,
        baseline_stability_frames: 3,
        history_window: 8,
        alert_ring_capacity: 200,
        frame_store_root: PathBuf::from(frames.path()),
        model_call_timeout: Duration::from_secs(20),
        app_host: "127.0.0.1".into(),
        app_port: 0,
    };

    let registry = Arc::new(DirectiveRegistry::new());
    let alerts = Arc::new(AlertDispatcher::new(config.alert_ring_capacity));
    let deps = WorkerDeps {
        registry,
        store: Arc::new(FrameStore::new(config.frame_store_root.clone())),
        vision: Some(vision),
        reasoning: None,
        alerts: alerts.clone(),
        live: Arc::new(StreamHub::new("live-feed")),
        analysis: Arc::new(StreamHub::new("analysis")),
        system: Arc::new(StreamHub::new("system")),
    };
    let supervisor = Arc::new(Supervisor::new(config, deps));

    World {
        supervisor,
        alerts,
        _frames: frames,
    }
}

fn activity_directive(target: &str) -> Directive {
    Directive {
        id: Uuid::new_v4(),
        kind: DirectiveKind::ActivityDetection,
        target: target.into(),
        requires_baseline: true,
        camera_scope: CameraScope::All,
        created_at: Utc::now(),
        status: DirectiveStatus::Active,
    }
}

/// Poll until the predicate holds or the timeout elapses.
fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    predicate()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn test_person_leaves_after_baseline_fires_critical_override() {
    let vision = ScriptedAnalyzer::new(vec![
        Step::Observe(observation("person seated in chair", 40, true)),
        Step::Observe(observation("person seated in chair", 40, true)),
        Step::Observe(observation("person seated in chair", 40, true)),
        Step::Observe(observation("empty chair, nobody visible", 40, false)),
    ]);
    let world = build_world(vision, Duration::from_secs(120));

    let directive = activity_directive("alert when person leaves");
    let directive_id = directive.id;
    let outcome = world.supervisor.process_directive(directive);
    assert_eq!(outcome.action, "created");
    assert_eq!(outcome.started_cameras, vec![0]);

    // The stability criterion announces itself first...
    assert!(wait_for(Duration::from_secs(5), || {
        world
            .alerts
            .query(None, None, 200)
            .iter()
            .any(|a| a.reasons.contains(&"baseline_established".to_string()))
    }));

    // ...then the disappearance forces the critical override.
    assert!(wait_for(Duration::from_secs(5), || {
        world
            .alerts
            .query(None, Some(AlertSeverity::Critical), 200)
            .iter()
            .any(|a| a.reasons.contains(&"presence_lost_override".to_string()))
    }));

    let critical: Vec<_> = world
        .alerts
        .query(None, Some(AlertSeverity::Critical), 200)
        .into_iter()
        .filter(|a| a.reasons.contains(&"presence_lost_override".to_string()))
        .collect();
    let alert = &critical[0];
    assert_eq!(alert.kind, AlertKind::Immediate);
    assert_eq!(alert.confidence, 95);
    assert_eq!(alert.directive_id, Some(directive_id));
    assert!(alert.frame_base64.is_some());

    // Removing the directive auto-stops the auto-started camera.
    assert!(world.supervisor.remove_directive(directive_id));
    assert!(wait_for(Duration::from_secs(6), || {
        world.supervisor.camera_states()[0].state == CameraState::Stopped
    }));

    world.supervisor.shutdown();
}

#[test]
fn test_quiet_observations_consolidate_into_one_summary() {
    // Significances in [50, 60): summary candidates only, never immediate.
    let vision = ScriptedAnalyzer::new(vec![
        Step::Observe(observation("courtyard, delivery at the gate", 52, false)),
        Step::Observe(observation("courtyard, van parked", 58, false)),
        Step::Observe(observation("courtyard, van door open", 54, false)),
        Step::Observe(observation("courtyard, quiet again", 50, false)),
    ]);
    let world = build_world(vision, Duration::from_secs(1));

    world.supervisor.start_camera(0, false).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        !world
            .alerts
            .query(None, None, 200)
            .iter()
            .filter(|a| a.kind == AlertKind::Summary)
            .collect::<Vec<_>>()
            .is_empty()
    }));

    let all = world.alerts.query(None, None, 200);
    let immediate: Vec<_> = all.iter().filter(|a| a.kind == AlertKind::Immediate).collect();
    assert!(
        immediate.is_empty(),
        "sub-threshold observations must never fire immediately: {immediate:?}"
    );

    let summaries: Vec<_> = all.iter().filter(|a| a.kind == AlertKind::Summary).collect();
    let summary = summaries[0];
    assert_eq!(summary.severity, AlertSeverity::Warning);
    assert_eq!(summary.confidence, 58);
    assert!(summary.title.contains("Camera 0"));
    assert!(summary.frame_base64.is_some());

    world.supervisor.shutdown();
}

#[test]
fn test_rate_limited_frames_degrade_with_single_system_warning() {
    let vision = ScriptedAnalyzer::new(vec![Step::RateLimited]);
    let world = build_world(vision, Duration::from_secs(120));

    world.supervisor.start_camera(0, false).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        world
            .alerts
            .query(None, None, 200)
            .iter()
            .any(|a| a.reasons.contains(&"remote_degraded".to_string()))
    }));

    // Let several more rate-limited ticks pass: the warning stays one-shot.
    std::thread::sleep(Duration::from_millis(600));
    let degraded: Vec<_> = world
        .alerts
        .query(None, None, 200)
        .into_iter()
        .filter(|a| a.reasons.contains(&"remote_degraded".to_string()))
        .collect();
    assert_eq!(degraded.len(), 1);

    // And no observation-driven alerts were produced at all.
    let all = world.alerts.query(None, None, 200);
    assert!(all.iter().all(|a| a.kind == AlertKind::System));

    world.supervisor.shutdown();
}

#[test]
fn test_start_and_stop_are_idempotent() {
    let vision = ScriptedAnalyzer::new(vec![Step::Observe(observation("quiet room", 10, false))]);
    let world = build_world(vision, Duration::from_secs(120));

    world.supervisor.start_camera(0, false).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        world.supervisor.camera_states()[0].state == CameraState::Running
    }));

    // Starting a running camera is a no-op reporting the current state.
    assert_eq!(
        world.supervisor.start_camera(0, false).unwrap(),
        CameraState::Running
    );

    assert_eq!(
        world.supervisor.stop_camera(0).unwrap(),
        CameraState::Stopped
    );
    assert_eq!(
        world.supervisor.stop_camera(0).unwrap(),
        CameraState::Stopped
    );

    // Unknown camera ids are rejected outright.
    assert!(world.supervisor.start_camera(9, false).is_err());
    assert!(world.supervisor.stop_camera(9).is_err());

    world.supervisor.shutdown();
}
