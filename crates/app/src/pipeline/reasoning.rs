//! Reasoning model client.
//!
//! Interprets a sequence of scene observations against the active directive
//! using the Anthropic Messages API. The layer is optional: without a
//! configured credential the pipeline runs on vision output alone, and any
//! per-call failure degrades the same way.

use std::time::Duration;

use chrono::SecondsFormat;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::pipeline::data::{AlertSeverity, Directive, ReasoningDecision, VisionObservation};
use crate::pipeline::vision::{extract_json_object, strip_code_fences, strip_trailing_commas};

/// Required API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

/// Low temperature favours reproducible decisions.
const REASONING_TEMPERATURE: f64 = 0.3;

const MAX_DECISION_TOKENS: u32 = 2000;

/// Observations from the history window included in the prompt.
const CONTEXT_OBSERVATIONS: usize = 5;

#[derive(Debug, Error)]
#[error("reasoning unavailable: {0}")]
pub struct ReasoningUnavailable(pub String);

/// Progression analysis seam between workers and the reasoning model.
pub trait ProgressionAnalyzer: Send + Sync {
    fn analyze_progression(
        &self,
        directive: &Directive,
        baseline: Option<&str>,
        current: &VisionObservation,
        history: &[VisionObservation],
    ) -> Result<ReasoningDecision, ReasoningUnavailable>;
}

pub struct ClaudeReasoning {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl ClaudeReasoning {
    pub fn new(api_url: String, api_key: String, call_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building reasoning HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_url,
            api_key,
            model: DEFAULT_MODEL.to_string(),
        })
    }
}

impl ProgressionAnalyzer for ClaudeReasoning {
    fn analyze_progression(
        &self,
        directive: &Directive,
        baseline: Option<&str>,
        current: &VisionObservation,
        history: &[VisionObservation],
    ) -> Result<ReasoningDecision, ReasoningUnavailable> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_DECISION_TOKENS,
            temperature: REASONING_TEMPERATURE,
            system: REASONING_SYSTEM_PROMPT.to_string(),
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: build_user_prompt(directive, baseline, current, history),
            }],
        };

        metrics::counter!("argus_reasoning_calls_total").increment(1);
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .map_err(|e| ReasoningUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReasoningUnavailable(format!("status {status}")));
        }

        let envelope: MessagesResponse = response
            .json()
            .map_err(|e| ReasoningUnavailable(format!("malformed envelope: {e}")))?;

        let text = envelope
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| ReasoningUnavailable("response contained no text".into()))?;

        parse_decision(&text)
    }
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    system: String,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ContentBlock {
    text: Option<String>,
}

// ── Prompt construction ──────────────────────────────────────────────────────

const REASONING_SYSTEM_PROMPT: &str = "\
You monitor a surveillance camera on behalf of a user. You receive the user's \
monitoring directive, the established baseline state (if any), a chronological \
window of recent scene observations, and the latest observation. Decide \
whether the user's requested event has occurred.

Focus on CHANGE and temporal progression, not static states. If the baseline \
had a person and the current scene has none, the person has left: be decisive \
and report high confidence.

Respond with a single JSON object only:
{
  \"event_occurred\": true/false,
  \"confidence_percentage\": 0-100,
  \"reasoning\": \"why\",
  \"should_alert\": true/false,
  \"alert_priority\": \"CRITICAL|WARNING|INFO\",
  \"alert_message\": \"message for the user if alerting\"
}";

fn build_user_prompt(
    directive: &Directive,
    baseline: Option<&str>,
    current: &VisionObservation,
    history: &[VisionObservation],
) -> String {
    let mut prompt = format!("USER'S DIRECTIVE: {}\n\n", directive.target);

    if let Some(baseline) = baseline {
        prompt.push_str(&format!("BASELINE STATE (initial):\n{baseline}\n\n"));
    }

    let previous: Vec<&VisionObservation> = history
        .iter()
        .rev()
        .skip(1) // the latest entry is reported separately below
        .take(CONTEXT_OBSERVATIONS)
        .collect();
    if !previous.is_empty() {
        prompt.push_str("RECENT OBSERVATIONS (oldest first):\n");
        for obs in previous.iter().rev() {
            prompt.push_str(&format!(
                "- [{}] {}\n",
                obs.captured_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                obs.scene_description
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "CURRENT OBSERVATION:\n\
         Scene: {}\n\
         Activity: {}\n\
         Significance: {}%\n\
         Person present: {}\n",
        current.scene_description, current.activity, current.significance, current.person_present
    ));
    if current.query_match || current.query_confidence > 0 {
        prompt.push_str(&format!(
            "Vision assessment: match={} confidence={}% ({})\n",
            current.query_match, current.query_confidence, current.query_details
        ));
    }

    prompt
}

// ── Response parsing ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDecision {
    event_occurred: bool,
    confidence_percentage: f64,
    reasoning: String,
    should_alert: bool,
    alert_priority: String,
    alert_message: String,
}

fn parse_decision(text: &str) -> Result<ReasoningDecision, ReasoningUnavailable> {
    let cleaned = strip_code_fences(text.trim());
    let body = extract_json_object(cleaned)
        .ok_or_else(|| ReasoningUnavailable("decision carried no JSON object".into()))?;
    let normalized = strip_trailing_commas(body);

    let raw: RawDecision = serde_json::from_str(&normalized).map_err(|e| {
        warn!("reasoning decision failed to parse: {e}");
        ReasoningUnavailable(format!("unparseable decision: {e}"))
    })?;

    Ok(ReasoningDecision {
        event_occurred: raw.event_occurred,
        confidence_percentage: raw.confidence_percentage.clamp(0.0, 100.0).round() as u8,
        reasoning: raw.reasoning,
        should_alert: raw.should_alert,
        alert_priority: parse_priority(&raw.alert_priority),
        alert_message: raw.alert_message,
    })
}

/// The model occasionally answers with HIGH/MEDIUM/LOW instead of the
/// requested severity names; both vocabularies are accepted.
fn parse_priority(s: &str) -> AlertSeverity {
    match s.trim().to_uppercase().as_str() {
        "CRITICAL" | "HIGH" => AlertSeverity::Critical,
        "WARNING" | "MEDIUM" => AlertSeverity::Warning,
        _ => AlertSeverity::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::data::{CameraScope, DirectiveKind, DirectiveStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn directive() -> Directive {
        Directive {
            id: Uuid::new_v4(),
            kind: DirectiveKind::ActivityDetection,
            target: "alert when person leaves".into(),
            requires_baseline: true,
            camera_scope: CameraScope::All,
            created_at: Utc::now(),
            status: DirectiveStatus::Active,
        }
    }

    fn observation(scene: &str) -> VisionObservation {
        let mut obs = VisionObservation::failed(Utc::now());
        obs.scene_description = scene.into();
        obs
    }

    // ── Prompt construction ──────────────────────────────────────────────────

    #[test]
    fn test_prompt_carries_directive_baseline_and_history() {
        let history = vec![
            observation("person seated in chair"),
            observation("person still seated"),
            observation("empty chair"),
        ];
        let prompt = build_user_prompt(
            &directive(),
            Some("person seated in chair"),
            &history[2],
            &history,
        );

        assert!(prompt.contains("alert when person leaves"));
        assert!(prompt.contains("BASELINE STATE"));
        assert!(prompt.contains("person still seated"));
        assert!(prompt.contains("CURRENT OBSERVATION"));
        // The current observation is not duplicated into the recent window.
        assert_eq!(prompt.matches("empty chair").count(), 1);
    }

    // ── Decision parsing ─────────────────────────────────────────────────────

    #[test]
    fn test_parse_valid_decision() {
        let decision = parse_decision(
            r#"{
                "event_occurred": true,
                "confidence_percentage": 92,
                "reasoning": "person was present in baseline, absent now",
                "should_alert": true,
                "alert_priority": "CRITICAL",
                "alert_message": "Person has left the monitored area"
            }"#,
        )
        .unwrap();

        assert!(decision.event_occurred);
        assert_eq!(decision.confidence_percentage, 92);
        assert!(decision.should_alert);
        assert_eq!(decision.alert_priority, AlertSeverity::Critical);
    }

    #[test]
    fn test_parse_fenced_decision() {
        let decision = parse_decision(
            "```json\n{\"should_alert\": false, \"confidence_percentage\": 10}\n```",
        )
        .unwrap();
        assert!(!decision.should_alert);
        assert_eq!(decision.confidence_percentage, 10);
    }

    #[test]
    fn test_malformed_decision_is_unavailable() {
        assert!(parse_decision("the scene appears unchanged").is_err());
        assert!(parse_decision("{\"event_occurred\": }").is_err());
    }

    #[test]
    fn test_priority_vocabularies() {
        assert_eq!(parse_priority("CRITICAL"), AlertSeverity::Critical);
        assert_eq!(parse_priority("high"), AlertSeverity::Critical);
        assert_eq!(parse_priority("Warning"), AlertSeverity::Warning);
        assert_eq!(parse_priority("medium"), AlertSeverity::Warning);
        assert_eq!(parse_priority("LOW"), AlertSeverity::Info);
        assert_eq!(parse_priority("whatever"), AlertSeverity::Info);
    }
}
