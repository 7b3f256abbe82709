//! The alert decision engine.
//!
//! A pure function over one observation and its surrounding state. Decisions
//! are layered; earlier layers short-circuit with a critical immediate
//! verdict:
//!
//!   A. hazard keyword scan (always active)
//!   B. presence-lost emergency override (activity directives with an
//!      established baseline)
//!   C. reasoning-model override
//!   D. directive match against thresholds
//!   E. undirected significance
//!   F. summary candidacy
//!
//! The return type is a three-way enum, so an observation can either fire
//! immediately or become a summary candidate, never both.

use crate::pipeline::baseline::BaselineState;
use crate::pipeline::data::{
    AlertSeverity, AlertSource, Directive, DirectiveKind, ReasoningDecision, VisionObservation,
};

/// Keywords that force a critical alert regardless of any directive.
/// `unusual` and `anomaly` carry the same force as `weapon`; deliberately
/// broad, tune here.
pub const HAZARD_KEYWORDS: &[&str] = &[
    "weapon", "gun", "knife", "violence", "fight", "attack", "threat", "dangerous", "hazard",
    "fire", "smoke", "blood", "injury", "fall", "accident", "emergency", "suspicious", "intruder",
    "break", "damage", "vandal", "unusual", "anomaly",
];

/// Confidence assigned when a person vanishes from an established baseline.
/// A fixed policy constant, not a computed value: a downstream threshold must
/// not be able to suppress a clear disappearance.
pub const PRESENCE_LOST_CONFIDENCE: u8 = 95;

/// Floor applied to hazard-keyword confidence.
const HAZARD_MIN_CONFIDENCE: u8 = 60;

/// Significance at and above which an undirected observation is CRITICAL
/// rather than WARNING; also the directive-match severity split.
const CRITICAL_SPLIT: u8 = 80;

#[derive(Clone, Debug)]
pub struct ImmediateDecision {
    pub severity: AlertSeverity,
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub source: AlertSource,
}

/// Verdict for one observation under one directive (or none).
#[derive(Clone, Debug)]
pub enum Decision {
    /// Alert now, in the same tick.
    Immediate(ImmediateDecision),
    /// Significant but not alert-worthy on its own; fold into the next
    /// consolidated summary.
    SummaryCandidate,
    /// Nothing to do.
    Quiet,
}

impl Decision {
    pub fn should_alert(&self) -> bool {
        matches!(self, Decision::Immediate(_))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DecisionThresholds {
    pub object: u8,
    pub activity: u8,
    pub undirected_immediate: u8,
    pub summary_collect: u8,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            object: 60,
            activity: 40,
            undirected_immediate: 60,
            summary_collect: 50,
        }
    }
}

/// Merge vision output, baseline state, and the reasoning verdict into the
/// final alert decision.
pub fn decide(
    directive: Option<&Directive>,
    observation: &VisionObservation,
    baseline: Option<&BaselineState>,
    reasoning: Option<&ReasoningDecision>,
    thresholds: &DecisionThresholds,
) -> Decision {
    // Layer A: hazard keywords, no directive required.
    if let Some(keyword) = hazard_keyword(observation) {
        return Decision::Immediate(ImmediateDecision {
            severity: AlertSeverity::Critical,
            confidence: observation.significance.max(HAZARD_MIN_CONFIDENCE),
            reasons: vec![format!("hazard_keyword:{keyword}")],
            source: AlertSource::Vision,
        });
    }

    // Layer B: a person present in the established baseline has disappeared.
    if let (Some(directive), Some(baseline)) = (directive, baseline) {
        if directive.kind == DirectiveKind::ActivityDetection
            && baseline.established
            && baseline.person_was_present
            && !current_has_person(observation)
        {
            return Decision::Immediate(ImmediateDecision {
                severity: AlertSeverity::Critical,
                confidence: PRESENCE_LOST_CONFIDENCE,
                reasons: vec!["presence_lost_override".to_string()],
                source: AlertSource::Override,
            });
        }
    }

    // Layer C: the reasoning model outranks vision when it is more confident.
    if let Some(reasoning) = reasoning {
        if reasoning.should_alert
            && reasoning.confidence_percentage > observation.query_confidence
        {
            return Decision::Immediate(ImmediateDecision {
                severity: reasoning.alert_priority,
                confidence: reasoning.confidence_percentage,
                reasons: vec!["reasoning_override".to_string()],
                source: AlertSource::Reasoning,
            });
        }
    }

    // Layer D: directive match. Layer E: undirected significance.
    let immediate = match directive {
        Some(directive) => directive_match(directive, observation, thresholds),
        None => undirected_significance(observation, thresholds),
    };
    if let Some(decision) = immediate {
        return Decision::Immediate(decision);
    }

    // Layer F: summary candidacy.
    if observation.significance >= thresholds.summary_collect {
        Decision::SummaryCandidate
    } else {
        Decision::Quiet
    }
}

fn hazard_keyword(observation: &VisionObservation) -> Option<&'static str> {
    let mut tokens = std::collections::HashSet::new();
    for text in [&observation.scene_description, &observation.activity] {
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if !token.is_empty() {
                tokens.insert(token.to_lowercase());
            }
        }
    }
    HAZARD_KEYWORDS
        .iter()
        .find(|kw| tokens.contains(**kw))
        .copied()
}

/// A person counts as present only when the flag says so and the prose does
/// not negate it; vision models sometimes set the flag while describing an
/// empty scene.
fn current_has_person(observation: &VisionObservation) -> bool {
    observation.person_present
        && !observation
            .scene_description
            .to_lowercase()
            .contains("no person")
}

fn directive_match(
    directive: &Directive,
    observation: &VisionObservation,
    thresholds: &DecisionThresholds,
) -> Option<ImmediateDecision> {
    let confidence = observation.query_confidence;
    match directive.kind {
        DirectiveKind::ObjectDetection => {
            if observation.query_match && confidence >= thresholds.object {
                let severity = if confidence >= CRITICAL_SPLIT {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                };
                return Some(ImmediateDecision {
                    severity,
                    confidence,
                    reasons: vec!["directive_match".to_string()],
                    source: AlertSource::Vision,
                });
            }
        }
        DirectiveKind::ActivityDetection => {
            // Activity events are high-priority by policy.
            if observation.query_match && confidence >= thresholds.activity {
                return Some(ImmediateDecision {
                    severity: AlertSeverity::Critical,
                    confidence,
                    reasons: vec!["directive_match".to_string()],
                    source: AlertSource::Vision,
                });
            }
        }
        DirectiveKind::Surveillance
        | DirectiveKind::SceneAnalysis
        | DirectiveKind::Anomaly
        | DirectiveKind::Tracking => {
            if confidence >= thresholds.object {
                return Some(ImmediateDecision {
                    severity: AlertSeverity::Warning,
                    confidence,
                    reasons: vec!["directive_match".to_string()],
                    source: AlertSource::Vision,
                });
            }
        }
    }
    None
}

fn undirected_significance(
    observation: &VisionObservation,
    thresholds: &DecisionThresholds,
) -> Option<ImmediateDecision> {
    let significance = observation.significance;
    if significance >= thresholds.undirected_immediate {
        let severity = if significance >= CRITICAL_SPLIT {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        return Some(ImmediateDecision {
            severity,
            confidence: significance,
            reasons: vec!["significance".to_string()],
            source: AlertSource::Vision,
        });
    }
    None
}
