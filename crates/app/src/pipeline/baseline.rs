//! Per-(camera, directive) temporal memory.
//!
//! [`BaselineTracker`] captures the "initial state" for activity directives:
//! the first scene description becomes a candidate, and each consecutive
//! semantically-consistent frame advances a counter until the baseline is
//! declared established. Once established it never changes; it is destroyed
//! only with its directive. [`ObservationHistory`] is the bounded window of
//! recent observations handed to the reasoning model.
//!
//! Both structures are owned by exactly one camera worker; nothing here is
//! shared across threads.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::pipeline::data::VisionObservation;

/// Minimum token-set overlap for two descriptions to count as the same scene.
const CONSISTENCY_JACCARD: f64 = 0.6;

#[derive(Clone, Debug)]
pub struct BaselineState {
    pub established: bool,
    pub state_description: String,
    pub person_was_present: bool,
    pub established_at: Option<DateTime<Utc>>,
    consistency_counter: u32,
}

/// Outcome of feeding one observation to the tracker.
#[derive(Debug, PartialEq, Eq)]
pub enum BaselineUpdate {
    /// Still collecting consistent frames.
    Forming { consecutive: u32 },
    /// This observation completed the stability criterion.
    Established,
    /// The baseline was already established; nothing changed.
    AlreadyEstablished,
}

pub struct BaselineTracker {
    stability_frames: u32,
    states: HashMap<Uuid, BaselineState>,
}

impl BaselineTracker {
    pub fn new(stability_frames: u32) -> Self {
        Self {
            stability_frames,
            states: HashMap::new(),
        }
    }

    /// Feed one observation for a baseline-requiring directive.
    pub fn observe(&mut self, directive_id: Uuid, obs: &VisionObservation) -> BaselineUpdate {
        let state = self
            .states
            .entry(directive_id)
            .or_insert_with(|| BaselineState {
                established: false,
                state_description: obs.scene_description.clone(),
                person_was_present: obs.person_present,
                established_at: None,
                consistency_counter: 0,
            });

        if state.established {
            return BaselineUpdate::AlreadyEstablished;
        }

        if consistent(state, obs) {
            state.consistency_counter += 1;
        } else {
            // Restart forming around the new scene.
            state.state_description = obs.scene_description.clone();
            state.person_was_present = obs.person_present;
            state.consistency_counter = 1;
        }

        if state.consistency_counter >= self.stability_frames {
            state.established = true;
            state.established_at = Some(Utc::now());
            state.person_was_present = obs.person_present;
            BaselineUpdate::Established
        } else {
            BaselineUpdate::Forming {
                consecutive: state.consistency_counter,
            }
        }
    }

    pub fn get(&self, directive_id: Uuid) -> Option<&BaselineState> {
        self.states.get(&directive_id)
    }

    pub fn remove(&mut self, directive_id: Uuid) {
        self.states.remove(&directive_id);
    }

    /// Drop state for directives no longer active; returns the ids cleared so
    /// the worker can announce the cleanup.
    pub fn retain_directives(&mut self, active: &HashSet<Uuid>) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .states
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();
        for id in &stale {
            self.states.remove(id);
        }
        stale
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

/// A freshly-counted frame is consistent with the forming baseline when the
/// descriptions overlap enough and presence agrees.
fn consistent(state: &BaselineState, obs: &VisionObservation) -> bool {
    if state.person_was_present != obs.person_present {
        return false;
    }
    // First frame for a new candidate: counter 0 means the stored description
    // is this observation's own.
    if state.consistency_counter == 0 {
        return true;
    }
    jaccard(
        &token_set(&state.state_description),
        &token_set(&obs.scene_description),
    ) >= CONSISTENCY_JACCARD
}

fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

// ── Observation history ──────────────────────────────────────────────────────

/// Rolling window of recent observations, oldest evicted on overflow. Used
/// solely as context for the reasoning model.
pub struct ObservationHistory {
    window: usize,
    entries: VecDeque<VisionObservation>,
}

impl ObservationHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            entries: VecDeque::with_capacity(window),
        }
    }

    pub fn push(&mut self, obs: VisionObservation) {
        self.entries.push_back(obs);
        if self.entries.len() > self.window {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<VisionObservation> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(scene: &str, person: bool) -> VisionObservation {
        let mut o = VisionObservation::failed(Utc::now());
        o.scene_description = scene.into();
        o.person_present = person;
        o
    }

    // ── Baseline establishment ───────────────────────────────────────────────

    #[test]
    fn test_three_consistent_frames_establish() {
        let mut tracker = BaselineTracker::new(3);
        let id = Uuid::new_v4();

        assert_eq!(
            tracker.observe(id, &obs("person seated in chair", true)),
            BaselineUpdate::Forming { consecutive: 1 }
        );
        assert_eq!(
            tracker.observe(id, &obs("person seated in the chair", true)),
            BaselineUpdate::Forming { consecutive: 2 }
        );
        assert_eq!(
            tracker.observe(id, &obs("person seated in chair", true)),
            BaselineUpdate::Established
        );

        let state = tracker.get(id).unwrap();
        assert!(state.established);
        assert!(state.person_was_present);
        assert!(state.established_at.is_some());
    }

    #[test]
    fn test_never_established_before_stability_frames() {
        let mut tracker = BaselineTracker::new(4);
        let id = Uuid::new_v4();
        for _ in 0..3 {
            let update = tracker.observe(id, &obs("desk with laptop", false));
            assert!(matches!(update, BaselineUpdate::Forming { .. }));
            assert!(!tracker.get(id).unwrap().established);
        }
        assert_eq!(
            tracker.observe(id, &obs("desk with laptop", false)),
            BaselineUpdate::Established
        );
    }

    #[test]
    fn test_scene_change_restarts_forming() {
        let mut tracker = BaselineTracker::new(3);
        let id = Uuid::new_v4();

        tracker.observe(id, &obs("person seated in chair", true));
        tracker.observe(id, &obs("person seated in chair", true));
        // Completely different scene: counter restarts at 1.
        assert_eq!(
            tracker.observe(id, &obs("delivery truck parked outside gate", true)),
            BaselineUpdate::Forming { consecutive: 1 }
        );
        assert_eq!(
            tracker.get(id).unwrap().state_description,
            "delivery truck parked outside gate"
        );
    }

    #[test]
    fn test_person_flag_disagreement_restarts_forming() {
        let mut tracker = BaselineTracker::new(3);
        let id = Uuid::new_v4();

        tracker.observe(id, &obs("person seated in chair", true));
        tracker.observe(id, &obs("person seated in chair", true));
        assert_eq!(
            tracker.observe(id, &obs("person seated in chair", false)),
            BaselineUpdate::Forming { consecutive: 1 }
        );
    }

    #[test]
    fn test_established_baseline_is_immutable() {
        let mut tracker = BaselineTracker::new(2);
        let id = Uuid::new_v4();

        tracker.observe(id, &obs("empty hallway", false));
        tracker.observe(id, &obs("empty hallway", false));
        assert!(tracker.get(id).unwrap().established);

        assert_eq!(
            tracker.observe(id, &obs("crowd of people in hallway", true)),
            BaselineUpdate::AlreadyEstablished
        );
        let state = tracker.get(id).unwrap();
        assert_eq!(state.state_description, "empty hallway");
        assert!(!state.person_was_present);
    }

    #[test]
    fn test_retain_clears_stale_directives() {
        let mut tracker = BaselineTracker::new(2);
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        tracker.observe(keep, &obs("scene a", false));
        tracker.observe(drop, &obs("scene b", false));

        let mut active = HashSet::new();
        active.insert(keep);

        let removed = tracker.retain_directives(&active);
        assert_eq!(removed, vec![drop]);
        assert!(tracker.get(keep).is_some());
        assert!(tracker.get(drop).is_none());
    }

    // ── Similarity ───────────────────────────────────────────────────────────

    #[test]
    fn test_jaccard_on_token_sets() {
        let a = token_set("Person seated in chair");
        let b = token_set("person seated in the chair");
        assert!(jaccard(&a, &b) >= 0.6);

        let c = token_set("empty chair, no person visible");
        assert!(jaccard(&a, &c) < 0.6);
    }

    // ── History window ───────────────────────────────────────────────────────

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = ObservationHistory::new(3);
        for i in 0..5 {
            history.push(obs(&format!("frame {i}"), false));
        }
        let entries = history.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].scene_description, "frame 2");
        assert_eq!(entries[2].scene_description, "frame 4");
    }
}
