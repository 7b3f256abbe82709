//! Consolidated activity summaries.
//!
//! Observations that clear the collection threshold but do not fire
//! immediately land in a per-camera bucket. A timer thread flushes the bucket
//! once per summary interval, producing at most one alert whose attached
//! frame comes from the peak-significance observation. Stopping the camera
//! cancels the timer and discards the bucket without a final flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::pipeline::data::{Alert, AlertKind, AlertSeverity, AlertSource};
use crate::pipeline::dispatch::AlertDispatcher;
use crate::pipeline::store::StoredFrame;

/// Events enumerated in the summary body; the remainder is counted.
const SUMMARY_BODY_EVENTS: usize = 5;

/// One collected observation awaiting consolidation.
#[derive(Clone)]
pub struct SummaryEvent {
    pub at: DateTime<Utc>,
    pub description: String,
    pub significance: u8,
    pub detected_objects: Vec<String>,
    pub frame: StoredFrame,
}

pub struct SummaryAggregator {
    camera_id: u32,
    interval: Duration,
    bucket: Vec<SummaryEvent>,
}

impl SummaryAggregator {
    pub fn new(camera_id: u32, interval: Duration) -> Self {
        Self {
            camera_id,
            interval,
            bucket: Vec::new(),
        }
    }

    pub fn collect(&mut self, event: SummaryEvent) {
        self.bucket.push(event);
    }

    pub fn pending(&self) -> usize {
        self.bucket.len()
    }

    /// Drain the bucket into one consolidated alert. Empty bucket, no alert.
    pub fn flush(&mut self) -> Option<Alert> {
        if self.bucket.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.bucket);

        let peak = events
            .iter()
            .max_by_key(|event| event.significance)
            .expect("bucket not empty")
            .clone();

        let severity = if peak.significance >= 80 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };

        let minutes = (self.interval.as_secs() / 60).max(1);
        let title = format!("Activity summary ({}m) – Camera {}", minutes, self.camera_id);

        let mut message = format!("{} significant event(s) in the last window:\n", events.len());
        for event in events.iter().take(SUMMARY_BODY_EVENTS) {
            message.push_str(&format!(
                "• {} — {} ({}%)\n",
                event.at.format("%H:%M:%S"),
                event.description,
                event.significance
            ));
        }
        if events.len() > SUMMARY_BODY_EVENTS {
            message.push_str(&format!(
                "…and {} more\n",
                events.len() - SUMMARY_BODY_EVENTS
            ));
        }

        let mut detected_objects: Vec<String> = Vec::new();
        for event in &events {
            for label in &event.detected_objects {
                if !detected_objects.contains(label) {
                    detected_objects.push(label.clone());
                }
            }
        }

        Some(Alert {
            id: Uuid::new_v4(),
            camera_id: Some(self.camera_id),
            severity,
            kind: AlertKind::Summary,
            title,
            message,
            confidence: peak.significance,
            timestamp: Utc::now(),
            detected_objects,
            frame_url: peak.frame.url,
            frame_base64: Some(peak.frame.base64),
            reasons: vec!["summary_window".to_string()],
            source: AlertSource::Aggregator,
            directive_id: None,
            sequence_no: None,
            acknowledged: false,
        })
    }

    /// Drop collected events without emitting anything.
    pub fn discard(&mut self) {
        self.bucket.clear();
    }
}

/// Spawn the per-camera flush timer. The thread polls so a stop request is
/// honoured within a fraction of a second rather than a full interval.
pub fn spawn_summary_timer(
    camera_id: u32,
    aggregator: Arc<Mutex<SummaryAggregator>>,
    dispatcher: Arc<AlertDispatcher>,
    running: Arc<AtomicBool>,
    interval: Duration,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("summary-timer-{camera_id}"))
        .spawn(move || {
            let mut next_flush = Instant::now() + interval;
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(200));
                if Instant::now() < next_flush {
                    continue;
                }
                next_flush += interval;

                let alert = {
                    let mut aggregator = aggregator.lock().expect("summary bucket poisoned");
                    aggregator.flush()
                };
                if let Some(alert) = alert {
                    tracing::debug!(
                        "camera {camera_id}: flushing summary ({} confidence)",
                        alert.confidence
                    );
                    dispatcher.publish(alert);
                }
            }
            // Camera stopped: discard whatever is left, no final flush.
            if let Ok(mut aggregator) = aggregator.lock() {
                aggregator.discard();
            }
        })
        .expect("failed to spawn summary timer thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(description: &str, significance: u8, objects: &[&str]) -> SummaryEvent {
        SummaryEvent {
            at: Utc::now(),
            description: description.into(),
            significance,
            detected_objects: objects.iter().map(|s| s.to_string()).collect(),
            frame: StoredFrame {
                url: Some(format!("/frames/{description}.jpg")),
                base64: format!("b64-{description}"),
            },
        }
    }

    #[test]
    fn test_empty_bucket_emits_nothing() {
        let mut agg = SummaryAggregator::new(0, Duration::from_secs(120));
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_peak_observation_represents_window() {
        let mut agg = SummaryAggregator::new(2, Duration::from_secs(120));
        agg.collect(event("first", 52, &["car"]));
        agg.collect(event("second", 58, &["person", "car"]));
        agg.collect(event("third", 54, &["dog"]));
        agg.collect(event("fourth", 50, &[]));

        let alert = agg.flush().unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert_eq!(alert.confidence, 58);
        assert_eq!(alert.kind, AlertKind::Summary);
        assert_eq!(alert.source, AlertSource::Aggregator);
        assert_eq!(alert.title, "Activity summary (2m) – Camera 2");
        assert_eq!(alert.frame_base64.as_deref(), Some("b64-second"));
        assert_eq!(alert.detected_objects, vec!["car", "person", "dog"]);
        // Bucket cleared by the flush.
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_peak_at_or_above_eighty_is_critical() {
        let mut agg = SummaryAggregator::new(0, Duration::from_secs(120));
        agg.collect(event("big", 80, &[]));
        let alert = agg.flush().unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_body_lists_at_most_five_events() {
        let mut agg = SummaryAggregator::new(1, Duration::from_secs(60));
        for i in 0..7 {
            agg.collect(event(&format!("event-{i}"), 51, &[]));
        }
        let alert = agg.flush().unwrap();
        assert_eq!(alert.message.matches('•').count(), 5);
        assert!(alert.message.contains("and 2 more"));
    }

    #[test]
    fn test_discard_drops_pending_events() {
        let mut agg = SummaryAggregator::new(0, Duration::from_secs(60));
        agg.collect(event("gone", 55, &[]));
        agg.discard();
        assert!(agg.flush().is_none());
    }
}
