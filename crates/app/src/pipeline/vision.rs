//! Vision model client.
//!
//! Wraps the Gemini `generateContent` endpoint behind the [`SceneAnalyzer`]
//! trait. The model is asked for a JSON document describing the scene; the
//! parser tolerates code fences, surrounding prose, trailing commas, and
//! missing optional fields. A client-side minute window enforces the API
//! quota so a misconfigured cadence surfaces as skipped frames, never as
//! upstream 429 storms.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::pipeline::data::{Detection, Directive, VisionObservation};

#[derive(Debug, Error)]
pub enum VisionError {
    /// The per-minute quota is spent; the frame is skipped without an alert.
    #[error("vision call refused by rate limiter")]
    RateLimited,
    /// Timeouts, connection failures, 5xx, malformed envelopes.
    #[error("vision request failed: {0}")]
    Transient(String),
    /// Rejected credential or exhausted daily quota; stop calling.
    #[error("vision credential rejected: {0}")]
    Persistent(String),
}

/// Scene analysis seam between workers and the vision model.
pub trait SceneAnalyzer: Send + Sync {
    fn analyze(
        &self,
        jpeg: &[u8],
        captured_at: DateTime<Utc>,
        directive: Option<&Directive>,
        baseline: Option<&str>,
    ) -> Result<VisionObservation, VisionError>;
}

// ── Rate limiting ────────────────────────────────────────────────────────────

/// Fixed one-minute quota window.
struct MinuteWindow {
    window_start: Instant,
    used: u32,
}

impl MinuteWindow {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            used: 0,
        }
    }

    fn try_acquire(&mut self, now: Instant, limit: u32) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(60) {
            self.window_start = now;
            self.used = 0;
        }
        if self.used < limit {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct GeminiVision {
    client: Client,
    api_url: String,
    api_key: String,
    rate_limit: u32,
    window: Mutex<MinuteWindow>,
}

impl GeminiVision {
    pub fn new(
        api_url: String,
        api_key: String,
        rate_limit: u32,
        call_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building vision HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_url,
            api_key,
            rate_limit,
            window: Mutex::new(MinuteWindow::new(Instant::now())),
        })
    }
}

impl SceneAnalyzer for GeminiVision {
    fn analyze(
        &self,
        jpeg: &[u8],
        captured_at: DateTime<Utc>,
        directive: Option<&Directive>,
        baseline: Option<&str>,
    ) -> Result<VisionObservation, VisionError> {
        {
            let mut window = self.window.lock().expect("rate window poisoned");
            if !window.try_acquire(Instant::now(), self.rate_limit) {
                metrics::counter!("argus_vision_rate_limited_total").increment(1);
                return Err(VisionError::RateLimited);
            }
        }

        let prompt = build_vision_prompt(directive, baseline);
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": "image/jpeg", "data": BASE64.encode(jpeg) } }
                ]
            }],
            "generationConfig": { "temperature": 0.4, "maxOutputTokens": 2048 }
        });

        metrics::counter!("argus_vision_calls_total").increment(1);
        let response = self
            .client
            .post(&self.api_url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    VisionError::Transient("call deadline expired".into())
                } else {
                    VisionError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(VisionError::Persistent(format!("status {status}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(VisionError::RateLimited);
        }
        if !status.is_success() {
            return Err(VisionError::Transient(format!("status {status}")));
        }

        let envelope: GenerateContentResponse = response
            .json()
            .map_err(|e| VisionError::Transient(format!("malformed response envelope: {e}")))?;

        let text = envelope
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| VisionError::Transient("response contained no text".into()))?;

        Ok(parse_observation(&text, captured_at))
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CandidatePart {
    text: Option<String>,
}

// ── Prompt ───────────────────────────────────────────────────────────────────

const VISION_SYSTEM_PROMPT: &str = "\
You are a surveillance scene analyst. Examine the attached camera frame and \
respond with a single JSON object (no markdown, no commentary) of the form:
{
  \"scene_description\": \"concise narrative of the scene\",
  \"activity\": \"what is happening\",
  \"detections\": [
    { \"label\": \"specific object\", \"confidence\": 0.95, \"bounding_box\": [x, y, w, h] }
  ],
  \"significance\": 0-100
}
Focus on security-relevant events. Be concise but thorough.";

fn build_vision_prompt(directive: Option<&Directive>, baseline: Option<&str>) -> String {
    let mut prompt = String::from(VISION_SYSTEM_PROMPT);

    if let Some(directive) = directive {
        prompt.push_str(&format!(
            "\n\nACTIVE MONITORING DIRECTIVE: {target:?}\n\
             Additionally report, inside the same JSON object:\n\
             \"query_match\": whether the directive condition is visible,\n\
             \"query_confidence\": 0-100,\n\
             \"query_details\": \"what you saw relative to the directive\"",
            target = directive.target
        ));
    }

    if let Some(baseline) = baseline {
        prompt.push_str(&format!(
            "\n\nESTABLISHED BASELINE STATE: {baseline:?}\n\
             Compare the frame against this baseline and additionally report:\n\
             \"baseline_match\": whether the scene still matches the baseline,\n\
             \"state_analysis\": \"how the current state relates to the baseline\",\n\
             \"changes_detected\": [\"each change as a short phrase\"],\n\
             \"person_present\": whether any person is visible"
        ));
    }

    prompt
}

// ── Response parsing ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawObservation {
    scene_description: String,
    activity: String,
    detections: Vec<RawDetection>,
    significance: Option<f64>,
    query_match: Option<bool>,
    query_confidence: Option<f64>,
    query_details: String,
    baseline_match: Option<bool>,
    state_analysis: String,
    changes_detected: Vec<String>,
    person_present: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDetection {
    #[serde(alias = "object_label")]
    label: String,
    confidence: f64,
    bounding_box: Option<[f32; 4]>,
}

/// Parse the model's text into an observation. Never fails: unsalvageable
/// output degrades to the `Analysis failed` observation.
fn parse_observation(text: &str, captured_at: DateTime<Utc>) -> VisionObservation {
    let cleaned = strip_code_fences(text.trim());
    let Some(body) = extract_json_object(cleaned) else {
        warn!("vision response carried no JSON object: {}", truncate(text, 120));
        return VisionObservation::failed(captured_at);
    };
    let normalized = strip_trailing_commas(body);

    let raw: RawObservation = match serde_json::from_str(&normalized) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(
                "vision response failed to parse ({err}): {}",
                truncate(text, 120)
            );
            metrics::counter!("argus_vision_parse_failures_total").increment(1);
            return VisionObservation::failed(captured_at);
        }
    };

    let significance = clamp_percent(raw.significance.unwrap_or(50.0));
    let mut query_confidence = clamp_percent(raw.query_confidence.unwrap_or(0.0));
    // Tie-break: a confidence without a verdict counts as a match at >= 50.
    let query_match = raw
        .query_match
        .unwrap_or(raw.query_confidence.is_some() && query_confidence >= 50);
    if query_match && query_confidence < 1 {
        query_confidence = 1;
    }

    VisionObservation {
        scene_description: raw.scene_description,
        activity: raw.activity,
        detections: raw
            .detections
            .into_iter()
            .map(|d| Detection {
                label: d.label,
                confidence: (d.confidence as f32).clamp(0.0, 1.0),
                bounding_box: d.bounding_box,
            })
            .collect(),
        significance,
        query_match,
        query_confidence,
        query_details: raw.query_details,
        baseline_match: raw.baseline_match.unwrap_or(false),
        state_analysis: raw.state_analysis,
        changes_detected: raw.changes_detected,
        person_present: raw.person_present.unwrap_or(false),
        captured_at,
    }
}

fn clamp_percent(value: f64) -> u8 {
    value.clamp(0.0, 100.0).round() as u8
}

/// Strip markdown code fences (```json ... ```) from the response.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    if text.starts_with("```") {
        let after_open = match text.find('\n') {
            Some(nl) => &text[nl + 1..],
            None => return text,
        };
        if let Some(close) = after_open.rfind("```") {
            return after_open[..close].trim();
        }
        return after_open.trim();
    }
    text
}

/// The outermost `{ ... }` slice, tolerating prose around it.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Remove commas that directly precede a closing brace or bracket.
pub(crate) fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = input.chars().collect();

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    }
}
