//! The process-wide directive registry and the command-intake parser.
//!
//! The registry is the single shared instance consulted by both the API
//! handlers and every camera worker; it is threaded through construction as
//! an `Arc` handle and never reachable through ambient state. An earlier
//! incarnation of this system held two separate copies (one per subsystem)
//! and silently ignored every directive.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::pipeline::data::{CameraScope, Directive, DirectiveKind, DirectiveStatus};

pub type SharedRegistry = Arc<DirectiveRegistry>;

/// Map of active monitoring directives. One writer (the API), many readers
/// (workers); readers take cloned snapshots so a held lock never spans a
/// model call.
#[derive(Default)]
pub struct DirectiveRegistry {
    inner: RwLock<HashMap<Uuid, Directive>>,
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a directive. Returns false when the id is already present
    /// (re-processing the same directive is a no-op).
    pub fn add(&self, directive: Directive) -> bool {
        let mut inner = self.inner.write().expect("directive registry poisoned");
        match inner.entry(directive.id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(directive);
                true
            }
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<Directive> {
        self.inner
            .write()
            .expect("directive registry poisoned")
            .remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Directive> {
        self.inner
            .read()
            .expect("directive registry poisoned")
            .get(&id)
            .cloned()
    }

    /// Snapshot of the directives that apply to one camera.
    pub fn list_for_camera(&self, camera_id: u32) -> Vec<Directive> {
        let inner = self.inner.read().expect("directive registry poisoned");
        let mut directives: Vec<Directive> = inner
            .values()
            .filter(|d| d.status == DirectiveStatus::Active && d.camera_scope.includes(camera_id))
            .cloned()
            .collect();
        directives.sort_by_key(|d| d.created_at);
        directives
    }

    pub fn list_all(&self) -> Vec<Directive> {
        let inner = self.inner.read().expect("directive registry poisoned");
        let mut directives: Vec<Directive> = inner.values().cloned().collect();
        directives.sort_by_key(|d| d.created_at);
        directives
    }

    pub fn active_any(&self) -> bool {
        self.inner
            .read()
            .expect("directive registry poisoned")
            .values()
            .any(|d| d.status == DirectiveStatus::Active)
    }
}

// ── Command intake ───────────────────────────────────────────────────────────

/// Structured form produced by the command parser.
pub struct ParsedCommand {
    pub kind: DirectiveKind,
    pub target: String,
}

const ACTIVITY_MARKERS: &[&str] = &[
    "leaves", "leave", "left the", "gets up", "get up", "stands up", "stand up",
    "sits down", "exits", "exit the", "walks away", "moves out", "goes away",
    "disappears",
];

const TRACKING_MARKERS: &[&str] = &["track ", "follow "];

const ANOMALY_MARKERS: &[&str] = &["suspicious", "unusual", "anomal", "strange", "abnormal"];

const SCENE_MARKERS: &[&str] = &["describe", "analyze", "analyse", "what is happening", "what's happening"];

/// Phrases stripped from the front of a command to expose the target.
const COMMAND_PREFIXES: &[&str] = &[
    "alert me if you see",
    "alert me if there is",
    "alert me if",
    "alert me when",
    "alert when",
    "notify me when",
    "notify me if",
    "tell me when",
    "tell me if",
    "let me know when",
    "let me know if",
    "watch for",
    "watch out for",
    "look for",
    "look out for",
    "monitor for",
    "detect",
    "find",
    "watch",
    "monitor",
];

/// Heuristic stand-in for the external natural-language command parser.
///
/// Only the output schema is contractual; deployments wire a model-backed
/// parser behind the same shape. The heuristic keys on activity phrasing
/// first because those commands need baseline tracking.
pub fn parse_command_text(text: &str) -> ParsedCommand {
    let lowered = text.trim().to_lowercase();

    if ACTIVITY_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ParsedCommand {
            kind: DirectiveKind::ActivityDetection,
            target: strip_prefixes(&lowered),
        };
    }
    if TRACKING_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ParsedCommand {
            kind: DirectiveKind::Tracking,
            target: strip_prefixes(&lowered),
        };
    }
    if ANOMALY_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ParsedCommand {
            kind: DirectiveKind::Anomaly,
            target: strip_prefixes(&lowered),
        };
    }
    if SCENE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ParsedCommand {
            kind: DirectiveKind::SceneAnalysis,
            target: strip_prefixes(&lowered),
        };
    }

    let prefixed = starts_with_prefix(&lowered);
    let target = strip_prefixes(&lowered);

    // A long command with no recognised lead-in has no extractable object
    // phrase: treat it as open-ended surveillance of the whole request.
    if !prefixed && target.split_whitespace().count() > 6 {
        return ParsedCommand {
            kind: DirectiveKind::Surveillance,
            target: lowered,
        };
    }

    ParsedCommand {
        kind: DirectiveKind::ObjectDetection,
        target: if target.is_empty() { lowered } else { target },
    }
}

fn starts_with_prefix(text: &str) -> bool {
    COMMAND_PREFIXES.iter().any(|p| text.starts_with(p))
}

fn strip_prefixes(text: &str) -> String {
    for prefix in COMMAND_PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            return rest
                .trim_start_matches([' ', ':'])
                .trim_end_matches(['.', '!'])
                .trim()
                .to_string();
        }
    }
    text.trim_end_matches(['.', '!']).trim().to_string()
}

/// Build a full directive from a parsed command.
pub fn directive_from_command(parsed: ParsedCommand, camera_scope: CameraScope) -> Directive {
    let requires_baseline = parsed.kind.requires_baseline();
    Directive {
        id: Uuid::new_v4(),
        kind: parsed.kind,
        target: parsed.target,
        requires_baseline,
        camera_scope,
        created_at: Utc::now(),
        status: DirectiveStatus::Active,
    }
}
