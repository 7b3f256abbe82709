//! Per-camera ingest worker.
//!
//! Each active camera owns one worker thread running the capture → persist →
//! analyze → decide → dispatch loop, plus a companion summary-timer thread.
//! Ticks are anchored to a monotonic clock so the cadence does not drift with
//! model latency. All temporal state (baselines, observation history, remote
//! health) lives inside the worker; nothing is shared across cameras.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use frame_ingest::{CaptureError, Frame, FrameSource};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::pipeline::baseline::{BaselineTracker, BaselineUpdate, ObservationHistory};
use crate::pipeline::data::{
    Alert, AlertKind, AlertSeverity, AlertSource, AnalysisUpdate, Directive, LiveFeedUpdate,
    ReasoningDecision, SystemEvent, VisionObservation,
};
use crate::pipeline::decision::{decide, Decision, DecisionThresholds, ImmediateDecision};
use crate::pipeline::directives::SharedRegistry;
use crate::pipeline::dispatch::{AlertDispatcher, StreamHub};
use crate::pipeline::reasoning::ProgressionAnalyzer;
use crate::pipeline::store::{FrameStore, StoredFrame};
use crate::pipeline::summary::{spawn_summary_timer, SummaryAggregator, SummaryEvent};
use crate::pipeline::vision::{SceneAnalyzer, VisionError};

const FRAME_RETRY_BASE: Duration = Duration::from_secs(1);
const FRAME_RETRY_CAP: Duration = Duration::from_secs(30);
const FRAME_RETRY_ATTEMPTS: u32 = 6;

/// Consecutive model failures before the one-shot `remote_degraded` alert.
const REMOTE_DEGRADED_AFTER: u32 = 5;

/// Re-warn cadence while a persistent credential failure keeps the vision
/// client disabled.
const LOCKOUT_REWARN_INTERVAL: Duration = Duration::from_secs(300);

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CameraState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Services shared by all workers, injected at spawn.
#[derive(Clone)]
pub struct WorkerDeps {
    pub registry: SharedRegistry,
    pub store: Arc<FrameStore>,
    pub vision: Option<Arc<dyn SceneAnalyzer>>,
    pub reasoning: Option<Arc<dyn ProgressionAnalyzer>>,
    pub alerts: Arc<AlertDispatcher>,
    pub live: Arc<StreamHub>,
    pub analysis: Arc<StreamHub>,
    pub system: Arc<StreamHub>,
}

/// Per-camera tuning derived from the pipeline configuration.
#[derive(Clone)]
pub struct WorkerSettings {
    pub camera_id: u32,
    pub frame_interval: Duration,
    pub summary_interval: Duration,
    pub thresholds: DecisionThresholds,
    pub baseline_stability_frames: u32,
    pub history_window: usize,
}

/// Control handle for one spawned camera.
pub struct CameraHandle {
    pub camera_id: u32,
    pub auto_started: bool,
    state: Arc<Mutex<CameraState>>,
    stop: Arc<AtomicBool>,
    stopped_rx: Receiver<()>,
    join: Option<thread::JoinHandle<()>>,
    timer_join: Option<thread::JoinHandle<()>>,
}

impl CameraHandle {
    pub fn state(&self) -> CameraState {
        *self.state.lock().expect("camera state poisoned")
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to acknowledge STOPPED, up to `ceiling`. Returns
    /// false when the ceiling elapsed and the thread was abandoned.
    pub fn await_stopped(&mut self, ceiling: Duration) -> bool {
        let acknowledged = self.stopped_rx.recv_timeout(ceiling).is_ok();
        if acknowledged {
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
            if let Some(join) = self.timer_join.take() {
                let _ = join.join();
            }
        } else {
            warn!(
                "camera {}: worker did not stop within {:?}, abandoning thread",
                self.camera_id, ceiling
            );
        }
        acknowledged
    }
}

/// Publish a system notification to both the alert ring and the system
/// stream.
pub(crate) fn publish_system(
    alerts: &AlertDispatcher,
    system: &StreamHub,
    camera_id: Option<u32>,
    severity: AlertSeverity,
    event: &str,
    message: String,
    data: serde_json::Value,
) {
    alerts.publish(Alert::system(camera_id, severity, event, message));
    system.publish(&SystemEvent::new(event, data));
}

/// Spawn the worker and summary-timer threads for one camera.
pub fn spawn_camera_worker(
    settings: WorkerSettings,
    deps: WorkerDeps,
    source: Box<dyn FrameSource>,
    auto_started: bool,
) -> CameraHandle {
    let camera_id = settings.camera_id;
    let state = Arc::new(Mutex::new(CameraState::Starting));
    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicBool::new(true));
    let (stopped_tx, stopped_rx) = bounded::<()>(1);

    let aggregator = Arc::new(Mutex::new(SummaryAggregator::new(
        camera_id,
        settings.summary_interval,
    )));
    let timer_join = spawn_summary_timer(
        camera_id,
        aggregator.clone(),
        deps.alerts.clone(),
        running.clone(),
        settings.summary_interval,
    );

    let worker_state = state.clone();
    let worker_stop = stop.clone();
    let worker_running = running;
    let stability_frames = settings.baseline_stability_frames;
    let join = thread::Builder::new()
        .name(format!("camera-worker-{camera_id}"))
        .spawn(move || {
            let mut worker = CameraWorker {
                settings,
                deps,
                aggregator,
                baselines: BaselineTracker::new(stability_frames),
                histories: HashMap::new(),
                remote: RemoteHealth::new(),
                store_degraded: false,
            };
            worker.run(source, worker_state, worker_stop, worker_running, stopped_tx);
        })
        .expect("failed to spawn camera worker thread");

    CameraHandle {
        camera_id,
        auto_started,
        state,
        stop,
        stopped_rx,
        join: Some(join),
        timer_join: Some(timer_join),
    }
}

struct CameraWorker {
    settings: WorkerSettings,
    deps: WorkerDeps,
    aggregator: Arc<Mutex<SummaryAggregator>>,
    baselines: BaselineTracker,
    histories: HashMap<Uuid, ObservationHistory>,
    remote: RemoteHealth,
    store_degraded: bool,
}

enum Fetch {
    Frame(Frame),
    Stop,
    EndOfStream,
    Failed(CaptureError),
}

impl CameraWorker {
    fn run(
        &mut self,
        mut source: Box<dyn FrameSource>,
        state: Arc<Mutex<CameraState>>,
        stop: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        stopped_tx: Sender<()>,
    ) {
        let camera_id = self.settings.camera_id;
        set_state(&state, CameraState::Starting);

        if !self.open_with_retry(&mut *source, &stop) {
            if stop.load(Ordering::Relaxed) {
                set_state(&state, CameraState::Stopped);
            } else {
                set_state(&state, CameraState::Failed);
                self.publish_camera_event(
                    AlertSeverity::Warning,
                    "camera_failed",
                    format!("Camera {camera_id} could not be opened"),
                );
            }
            running.store(false, Ordering::SeqCst);
            let _ = stopped_tx.send(());
            return;
        }

        let interval = self.settings.frame_interval;
        let mut next_tick = Instant::now();
        let mut first_frame = true;
        let mut failed = false;

        while !stop.load(Ordering::Relaxed) {
            match fetch_with_retry(&mut *source, &stop, camera_id) {
                Fetch::Frame(frame) => {
                    if first_frame {
                        first_frame = false;
                        set_state(&state, CameraState::Running);
                        self.publish_camera_event(
                            AlertSeverity::System,
                            "camera_started",
                            format!("Camera {camera_id} is running"),
                        );
                    }
                    metrics::counter!("argus_frames_captured_total").increment(1);
                    self.process_tick(&frame);
                }
                Fetch::Stop => break,
                Fetch::EndOfStream => {
                    debug!("camera {camera_id}: source exhausted, stopping");
                    break;
                }
                Fetch::Failed(err) => {
                    error!("camera {camera_id}: capture failed after retries: {err}");
                    failed = true;
                    break;
                }
            }

            next_tick += interval;
            // A slow tick (model latency) must not cause a catch-up burst:
            // realign to the next future slot on the same grid.
            let now = Instant::now();
            while next_tick < now {
                next_tick += interval;
            }
            if !sleep_until(next_tick, &stop) {
                break;
            }
        }

        set_state(&state, CameraState::Stopping);
        source.close();
        self.baselines.clear();
        self.histories.clear();
        running.store(false, Ordering::SeqCst);

        if failed {
            set_state(&state, CameraState::Failed);
            self.publish_camera_event(
                AlertSeverity::Warning,
                "camera_failed",
                format!("Camera {camera_id} failed: frame source exhausted its retry budget"),
            );
        } else {
            set_state(&state, CameraState::Stopped);
            if !first_frame {
                self.publish_camera_event(
                    AlertSeverity::System,
                    "camera_stopped",
                    format!("Camera {camera_id} stopped"),
                );
            }
        }

        let _ = stopped_tx.send(());
    }

    /// One scheduled tick: persist the frame, evaluate every applicable
    /// directive (or the undirected path), and feed the push channels.
    fn process_tick(&mut self, frame: &Frame) {
        let camera_id = self.settings.camera_id;
        let stored = self.deps.store.persist(camera_id, frame);

        if stored.url.is_none() {
            if !self.store_degraded {
                self.store_degraded = true;
                self.publish_camera_event(
                    AlertSeverity::Warning,
                    "storage_degraded",
                    format!("Camera {camera_id}: frame store unavailable, alerts carry base64 only"),
                );
            }
        } else {
            self.store_degraded = false;
        }

        let directives = self.deps.registry.list_for_camera(camera_id);
        let active: HashSet<Uuid> = directives.iter().map(|d| d.id).collect();
        for stale in self.baselines.retain_directives(&active) {
            self.histories.remove(&stale);
            self.publish_camera_event(
                AlertSeverity::Info,
                "baseline_cleared",
                format!("Camera {camera_id}: baseline discarded for removed directive {stale}"),
            );
        }
        self.histories.retain(|id, _| active.contains(id));

        let mut observation_summary = String::new();
        if self.deps.vision.is_some() {
            if self.remote.is_locked_out() {
                if self.remote.should_rewarn(Instant::now()) {
                    self.publish_camera_event(
                        AlertSeverity::Warning,
                        "remote_disabled",
                        format!(
                            "Camera {camera_id}: vision credential rejected; analysis disabled \
                             until restart"
                        ),
                    );
                }
            } else if directives.is_empty() {
                if let Some(summary) = self.evaluate(None, frame, &stored) {
                    observation_summary = summary;
                }
            } else {
                for directive in &directives {
                    if let Some(summary) = self.evaluate(Some(directive), frame, &stored) {
                        observation_summary = summary;
                    }
                }
            }
        }

        self.deps.live.publish(&LiveFeedUpdate {
            camera_id,
            timestamp: frame.captured_at,
            frame_base64: stored.base64.clone(),
            observation_summary,
        });
    }

    /// Evaluate one directive (or the undirected path) against the frame.
    /// Returns the scene description for the live-feed summary.
    fn evaluate(
        &mut self,
        directive: Option<&Directive>,
        frame: &Frame,
        stored: &StoredFrame,
    ) -> Option<String> {
        let camera_id = self.settings.camera_id;
        let vision = self.deps.vision.as_ref()?.clone();

        let baseline_desc: Option<String> = directive
            .filter(|d| d.requires_baseline)
            .and_then(|d| self.baselines.get(d.id))
            .filter(|b| b.established)
            .map(|b| b.state_description.clone());

        let observation = match vision.analyze(
            &frame.jpeg,
            frame.captured_at,
            directive,
            baseline_desc.as_deref(),
        ) {
            Ok(observation) => {
                self.remote.record_success();
                observation
            }
            Err(VisionError::RateLimited) => {
                debug!("camera {camera_id}: frame skipped (rate limited)");
                self.note_transient_failure();
                return None;
            }
            Err(VisionError::Transient(msg)) => {
                warn!("camera {camera_id}: vision call failed: {msg}");
                metrics::counter!("argus_vision_failures_total").increment(1);
                self.note_transient_failure();
                return None;
            }
            Err(VisionError::Persistent(msg)) => {
                error!("camera {camera_id}: vision credential rejected: {msg}");
                self.remote.record_persistent(Instant::now());
                self.publish_camera_event(
                    AlertSeverity::Warning,
                    "remote_disabled",
                    format!("Camera {camera_id}: vision credential rejected; analysis disabled"),
                );
                return None;
            }
        };

        // Baseline state advances only on a successful observation, so a
        // cancelled or failed call can never leave it half-updated.
        if let Some(directive) = directive {
            if directive.requires_baseline {
                if let BaselineUpdate::Established =
                    self.baselines.observe(directive.id, &observation)
                {
                    let state = self
                        .baselines
                        .get(directive.id)
                        .map(|b| b.state_description.clone())
                        .unwrap_or_default();
                    publish_system(
                        &self.deps.alerts,
                        &self.deps.system,
                        Some(camera_id),
                        AlertSeverity::Info,
                        "baseline_established",
                        format!("Camera {camera_id}: baseline established: {state}"),
                        json!({ "camera_id": camera_id, "directive_id": directive.id, "state": state }),
                    );
                }
            }
            let history = self
                .histories
                .entry(directive.id)
                .or_insert_with(|| ObservationHistory::new(self.settings.history_window));
            history.push(observation.clone());
        }

        let reasoning_decision: Option<ReasoningDecision> =
            match (directive, self.deps.reasoning.as_ref()) {
                (Some(directive), Some(reasoning)) => {
                    let entries = self
                        .histories
                        .get(&directive.id)
                        .map(|h| h.entries())
                        .unwrap_or_default();
                    match reasoning.analyze_progression(
                        directive,
                        baseline_desc.as_deref(),
                        &observation,
                        &entries,
                    ) {
                        Ok(decision) => Some(decision),
                        Err(err) => {
                            // Fall back to the vision-only decision for this call.
                            debug!("camera {camera_id}: {err}");
                            None
                        }
                    }
                }
                _ => None,
            };

        let baseline_state = directive.and_then(|d| self.baselines.get(d.id));
        let decision = match catch_unwind(AssertUnwindSafe(|| {
            decide(
                directive,
                &observation,
                baseline_state,
                reasoning_decision.as_ref(),
                &self.settings.thresholds,
            )
        })) {
            Ok(decision) => decision,
            Err(_) => {
                error!("camera {camera_id}: decision engine panicked, observation dropped");
                Decision::Quiet
            }
        };

        match decision {
            Decision::Immediate(immediate) => {
                let alert = build_immediate_alert(
                    camera_id,
                    directive,
                    &observation,
                    frame,
                    stored,
                    reasoning_decision.as_ref(),
                    immediate,
                );
                self.deps.alerts.publish(alert);
            }
            Decision::SummaryCandidate => {
                let mut aggregator = self.aggregator.lock().expect("summary bucket poisoned");
                aggregator.collect(SummaryEvent {
                    at: observation.captured_at,
                    description: observation.scene_description.clone(),
                    significance: observation.significance,
                    detected_objects: observation.detected_labels(),
                    frame: stored.clone(),
                });
            }
            Decision::Quiet => {}
        }

        self.deps.analysis.publish(&AnalysisUpdate {
            camera_id,
            timestamp: observation.captured_at,
            scene_description: observation.scene_description.clone(),
            activity: observation.activity.clone(),
            significance: observation.significance,
            detections: observation.detections.len(),
            directive_id: directive.map(|d| d.id),
        });

        Some(observation.scene_description)
    }

    fn note_transient_failure(&mut self) {
        if self.remote.record_transient() {
            let camera_id = self.settings.camera_id;
            self.publish_camera_event(
                AlertSeverity::Warning,
                "remote_degraded",
                format!(
                    "Camera {camera_id}: vision service failing repeatedly; frames are being \
                     skipped"
                ),
            );
        }
    }

    fn publish_camera_event(&self, severity: AlertSeverity, event: &str, message: String) {
        let camera_id = self.settings.camera_id;
        publish_system(
            &self.deps.alerts,
            &self.deps.system,
            Some(camera_id),
            severity,
            event,
            message,
            json!({ "camera_id": camera_id }),
        );
    }

    fn open_with_retry(&self, source: &mut dyn FrameSource, stop: &AtomicBool) -> bool {
        let camera_id = self.settings.camera_id;
        let mut backoff = FRAME_RETRY_BASE;
        for attempt in 1..=FRAME_RETRY_ATTEMPTS {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            match source.open() {
                Ok(()) => return true,
                Err(err) if attempt == FRAME_RETRY_ATTEMPTS => {
                    error!("camera {camera_id}: open failed on final attempt: {err}");
                    return false;
                }
                Err(err) => {
                    warn!("camera {camera_id}: open attempt {attempt} failed: {err}");
                    if !sleep_with_stop(backoff, stop) {
                        return false;
                    }
                    backoff = (backoff * 2).min(FRAME_RETRY_CAP);
                }
            }
        }
        false
    }
}

fn build_immediate_alert(
    camera_id: u32,
    directive: Option<&Directive>,
    observation: &VisionObservation,
    frame: &Frame,
    stored: &StoredFrame,
    reasoning: Option<&ReasoningDecision>,
    immediate: ImmediateDecision,
) -> Alert {
    let title = match immediate.source {
        AlertSource::Override => format!("Presence change – Camera {camera_id}"),
        AlertSource::Reasoning => format!("Event confirmed – Camera {camera_id}"),
        _ => format!("{} Alert – Camera {camera_id}", immediate.severity.label()),
    };

    let message = match immediate.source {
        AlertSource::Reasoning => reasoning
            .map(|r| r.alert_message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| observation.scene_description.clone()),
        _ => {
            let mut message = observation.scene_description.clone();
            if !observation.query_details.is_empty() {
                message.push('\n');
                message.push_str(&observation.query_details);
            }
            message
        }
    };

    Alert {
        id: Uuid::new_v4(),
        camera_id: Some(camera_id),
        severity: immediate.severity,
        kind: AlertKind::Immediate,
        title,
        message,
        confidence: immediate.confidence,
        timestamp: observation.captured_at,
        detected_objects: observation.detected_labels(),
        frame_url: stored.url.clone(),
        frame_base64: Some(stored.base64.clone()),
        reasons: immediate.reasons,
        source: immediate.source,
        directive_id: directive.map(|d| d.id),
        sequence_no: Some(frame.sequence_no),
        acknowledged: false,
    }
}

fn fetch_with_retry(source: &mut dyn FrameSource, stop: &AtomicBool, camera_id: u32) -> Fetch {
    let mut backoff = FRAME_RETRY_BASE;
    for attempt in 1..=FRAME_RETRY_ATTEMPTS {
        if stop.load(Ordering::Relaxed) {
            return Fetch::Stop;
        }
        match source.next_frame() {
            Ok(frame) => return Fetch::Frame(frame),
            Err(CaptureError::EndOfStream) => return Fetch::EndOfStream,
            Err(err) if attempt == FRAME_RETRY_ATTEMPTS => return Fetch::Failed(err),
            Err(err) => {
                warn!("camera {camera_id}: frame fetch attempt {attempt} failed: {err}");
                if !sleep_with_stop(backoff, stop) {
                    return Fetch::Stop;
                }
                backoff = (backoff * 2).min(FRAME_RETRY_CAP);
            }
        }
    }
    Fetch::Stop
}

fn set_state(state: &Mutex<CameraState>, next: CameraState) {
    *state.lock().expect("camera state poisoned") = next;
}

/// Sleep in stop-aware slices. Returns false when stop was requested.
fn sleep_with_stop(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    sleep_until(deadline, stop)
}

fn sleep_until(deadline: Instant, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

// ── Remote health bookkeeping ────────────────────────────────────────────────

/// Tracks consecutive model failures and credential lockout for one worker.
pub(crate) struct RemoteHealth {
    consecutive_failures: u32,
    degraded_notified: bool,
    locked_out: bool,
    last_lockout_warning: Option<Instant>,
}

impl RemoteHealth {
    pub(crate) fn new() -> Self {
        Self {
            consecutive_failures: 0,
            degraded_notified: false,
            locked_out: false,
            last_lockout_warning: None,
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.degraded_notified = false;
    }

    /// Returns true exactly once per degradation episode, when the
    /// consecutive counter first reaches the threshold.
    pub(crate) fn record_transient(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= REMOTE_DEGRADED_AFTER && !self.degraded_notified {
            self.degraded_notified = true;
            return true;
        }
        false
    }

    pub(crate) fn record_persistent(&mut self, now: Instant) {
        self.locked_out = true;
        self.last_lockout_warning = Some(now);
    }

    pub(crate) fn is_locked_out(&self) -> bool {
        self.locked_out
    }

    /// While locked out, warn again every five minutes.
    pub(crate) fn should_rewarn(&mut self, now: Instant) -> bool {
        if !self.locked_out {
            return false;
        }
        match self.last_lockout_warning {
            Some(last) if now.duration_since(last) < LOCKOUT_REWARN_INTERVAL => false,
            _ => {
                self.last_lockout_warning = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Remote health ────────────────────────────────────────────────────────

    #[test]
    fn test_degraded_alert_fires_once_at_five_consecutive() {
        let mut health = RemoteHealth::new();
        for _ in 0..4 {
            assert!(!health.record_transient());
        }
        assert!(health.record_transient());
        // Further failures stay silent.
        assert!(!health.record_transient());
        assert!(!health.record_transient());
    }

    #[test]
    fn test_success_resets_degradation_episode() {
        let mut health = RemoteHealth::new();
        for _ in 0..5 {
            health.record_transient();
        }
        health.record_success();
        for _ in 0..4 {
            assert!(!health.record_transient());
        }
        assert!(health.record_transient());
    }

    #[test]
    fn test_lockout_rewarns_every_five_minutes() {
        let mut health = RemoteHealth::new();
        let start = Instant::now();
        assert!(!health.should_rewarn(start));

        health.record_persistent(start);
        assert!(health.is_locked_out());
        assert!(!health.should_rewarn(start + Duration::from_secs(60)));
        assert!(health.should_rewarn(start + Duration::from_secs(301)));
        assert!(!health.should_rewarn(start + Duration::from_secs(302)));
    }

    // ── Tick sleeping ────────────────────────────────────────────────────────

    #[test]
    fn test_sleep_until_honours_stop_flag() {
        let stop = AtomicBool::new(true);
        let deadline = Instant::now() + Duration::from_secs(60);
        let begun = Instant::now();
        assert!(!sleep_until(deadline, &stop));
        assert!(begun.elapsed() < Duration::from_secs(1));
    }
}
