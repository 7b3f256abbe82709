//! Shared vocabulary of the surveillance pipeline: observations, directives,
//! alerts, and the payloads pushed to UI clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One object detected by the vision model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Model confidence in [0, 1].
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<[f32; 4]>,
}

/// Structured output of the vision model for a single frame.
///
/// The directive block (`query_*`) and the baseline block (`baseline_match`,
/// `state_analysis`, `changes_detected`, `person_present`) carry their
/// defaults when the corresponding annotation was not supplied with the call.
#[derive(Clone, Debug, Serialize)]
pub struct VisionObservation {
    pub scene_description: String,
    pub activity: String,
    pub detections: Vec<Detection>,
    /// The model's own importance score in [0, 100].
    pub significance: u8,
    pub query_match: bool,
    pub query_confidence: u8,
    pub query_details: String,
    pub baseline_match: bool,
    pub state_analysis: String,
    pub changes_detected: Vec<String>,
    pub person_present: bool,
    pub captured_at: DateTime<Utc>,
}

impl VisionObservation {
    /// The degraded observation used when the model response cannot be
    /// salvaged. Parsing failures are never fatal.
    pub fn failed(captured_at: DateTime<Utc>) -> Self {
        Self {
            scene_description: "Analysis failed".into(),
            activity: String::new(),
            detections: Vec::new(),
            significance: 0,
            query_match: false,
            query_confidence: 0,
            query_details: String::new(),
            baseline_match: false,
            state_analysis: String::new(),
            changes_detected: Vec::new(),
            person_present: false,
            captured_at,
        }
    }

    /// Labels of all detected objects, in detection order.
    pub fn detected_labels(&self) -> Vec<String> {
        self.detections.iter().map(|d| d.label.clone()).collect()
    }
}

/// Output of the reasoning model for one observation sequence.
#[derive(Clone, Debug, Serialize)]
pub struct ReasoningDecision {
    pub event_occurred: bool,
    pub confidence_percentage: u8,
    pub reasoning: String,
    pub should_alert: bool,
    pub alert_priority: AlertSeverity,
    pub alert_message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    ObjectDetection,
    ActivityDetection,
    Surveillance,
    SceneAnalysis,
    Anomaly,
    Tracking,
}

impl DirectiveKind {
    /// Activity and state-change monitoring compares against an initial
    /// state; everything else evaluates frames independently.
    pub fn requires_baseline(self) -> bool {
        matches!(self, DirectiveKind::ActivityDetection)
    }
}

/// Cameras a directive applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScopeRepr", into = "ScopeRepr")]
pub enum CameraScope {
    All,
    Cameras(Vec<u32>),
}

impl CameraScope {
    pub fn includes(&self, camera_id: u32) -> bool {
        match self {
            CameraScope::All => true,
            CameraScope::Cameras(ids) => ids.contains(&camera_id),
        }
    }
}

/// Wire form: the string `"all"` or a list of camera ids.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeRepr {
    Word(String),
    Ids(Vec<u32>),
}

impl From<CameraScope> for ScopeRepr {
    fn from(scope: CameraScope) -> Self {
        match scope {
            CameraScope::All => ScopeRepr::Word("all".into()),
            CameraScope::Cameras(ids) => ScopeRepr::Ids(ids),
        }
    }
}

impl TryFrom<ScopeRepr> for CameraScope {
    type Error = String;

    fn try_from(repr: ScopeRepr) -> Result<Self, Self::Error> {
        match repr {
            ScopeRepr::Word(word) if word == "all" => Ok(CameraScope::All),
            ScopeRepr::Word(word) => Err(format!("unknown camera scope {word:?}")),
            ScopeRepr::Ids(ids) => Ok(CameraScope::Cameras(ids)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveStatus {
    Active,
    Expired,
}

/// A user's monitoring request, parsed from a natural-language command.
#[derive(Clone, Debug, Serialize)]
pub struct Directive {
    pub id: Uuid,
    pub kind: DirectiveKind,
    pub target: String,
    pub requires_baseline: bool,
    pub camera_scope: CameraScope,
    pub created_at: DateTime<Utc>,
    pub status: DirectiveStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    System,
}

impl AlertSeverity {
    pub fn label(self) -> &'static str {
        match self {
            AlertSeverity::Critical => "CRITICAL",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Info => "INFO",
            AlertSeverity::System => "SYSTEM",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Immediate,
    Summary,
    System,
}

/// Which layer produced the final decision behind an alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    Vision,
    Reasoning,
    Override,
    Aggregator,
    Supervisor,
}

/// The dispatched alert record.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub camera_id: Option<u32>,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub title: String,
    pub message: String,
    pub confidence: u8,
    pub timestamp: DateTime<Utc>,
    pub detected_objects: Vec<String>,
    pub frame_url: Option<String>,
    pub frame_base64: Option<String>,
    /// Short tags explaining why the alert was raised.
    pub reasons: Vec<String>,
    pub source: AlertSource,
    pub directive_id: Option<Uuid>,
    pub sequence_no: Option<u64>,
    pub acknowledged: bool,
}

impl Alert {
    /// A process-level notification (camera lifecycle, degradations,
    /// directive acceptance). These share the alert channel so UI clients
    /// see them inline with detections.
    pub fn system(
        camera_id: Option<u32>,
        severity: AlertSeverity,
        event: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera_id,
            severity,
            kind: AlertKind::System,
            title: event.to_string(),
            message: message.into(),
            confidence: 0,
            timestamp: Utc::now(),
            detected_objects: Vec::new(),
            frame_url: None,
            frame_base64: None,
            reasons: vec![event.to_string()],
            source: AlertSource::Supervisor,
            directive_id: None,
            sequence_no: None,
            acknowledged: false,
        }
    }
}

/// Per-tick payload of the `live-feed` stream.
#[derive(Clone, Debug, Serialize)]
pub struct LiveFeedUpdate {
    pub camera_id: u32,
    pub timestamp: DateTime<Utc>,
    pub frame_base64: String,
    pub observation_summary: String,
}

/// Per-observation payload of the `analysis` stream.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisUpdate {
    pub camera_id: u32,
    pub timestamp: DateTime<Utc>,
    pub scene_description: String,
    pub activity: String,
    pub significance: u8,
    pub detections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directive_id: Option<Uuid>,
}

/// Payload of the `system` stream.
#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl SystemEvent {
    pub fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}
