//! Environment-driven configuration for the pipeline.
//!
//! Every recognised key has a default, so a bare environment starts a single
//! synthetic camera with no model credentials. Invalid values fail startup
//! with a contextual error rather than being silently clamped.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// Default capture cadence: roughly one frame every 30 seconds.
const DEFAULT_CAMERA_FPS: f64 = 0.033;

/// Gemini flash endpoint used when `VISION_API_URL` is not set.
const DEFAULT_VISION_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";

/// Anthropic Messages endpoint used when `REASONING_API_URL` is not set.
const DEFAULT_REASONING_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage of the pipeline.
pub struct PipelineConfig {
    /// Frames analysed per second, per camera.
    pub camera_fps: f64,
    /// Source URI per camera; the index is the camera id.
    pub camera_sources: Vec<String>,
    pub vision_api_key: Option<String>,
    pub vision_api_url: String,
    /// Vision model calls allowed per minute, across all cameras.
    pub vision_rate_limit: u32,
    /// Presence of the reasoning key enables the reasoning layer.
    pub reasoning_api_key: Option<String>,
    pub reasoning_api_url: String,
    pub object_threshold: u8,
    pub activity_threshold: u8,
    pub undirected_immediate_threshold: u8,
    pub summary_collect_threshold: u8,
    pub summary_interval: Duration,
    pub baseline_stability_frames: u32,
    pub history_window: usize,
    pub alert_ring_capacity: usize,
    pub frame_store_root: PathBuf,
    /// Per-call deadline for both model clients.
    pub model_call_timeout: Duration,
    pub app_host: String,
    pub app_port: u16,
}

impl PipelineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let camera_fps: f64 = parse_env("CAMERA_FPS", DEFAULT_CAMERA_FPS)?;
        if !(camera_fps > 0.0) {
            bail!("CAMERA_FPS must be positive, got {camera_fps}");
        }

        let camera_sources = env::var("CAMERA_SOURCES")
            .map(|raw| {
                raw.split(',')
                    .map(|uri| uri.trim().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| vec!["synthetic:".to_string()]);
        if camera_sources.is_empty() {
            bail!("CAMERA_SOURCES must name at least one source");
        }

        let object_threshold = parse_percent("OBJECT_THRESHOLD", 60)?;
        let activity_threshold = parse_percent("ACTIVITY_THRESHOLD", 40)?;
        let undirected_immediate_threshold = parse_percent("UNDIRECTED_IMMEDIATE_THRESHOLD", 60)?;
        let summary_collect_threshold = parse_percent("SUMMARY_COLLECT_THRESHOLD", 50)?;

        let summary_interval_seconds: u64 = parse_env("SUMMARY_INTERVAL_SECONDS", 120)?;
        if summary_interval_seconds == 0 {
            bail!("SUMMARY_INTERVAL_SECONDS must be at least 1");
        }

        let baseline_stability_frames: u32 = parse_env("BASELINE_STABILITY_FRAMES", 3)?;
        if baseline_stability_frames < 2 {
            bail!("BASELINE_STABILITY_FRAMES must be at least 2");
        }

        let history_window: usize = parse_env("HISTORY_WINDOW", 8)?;
        if history_window < 2 {
            bail!("HISTORY_WINDOW must be at least 2");
        }

        let alert_ring_capacity: usize = parse_env("ALERT_RING_CAPACITY", 200)?;
        if alert_ring_capacity == 0 {
            bail!("ALERT_RING_CAPACITY must be at least 1");
        }

        let vision_rate_limit: u32 = parse_env("VISION_RATE_LIMIT", 15)?;
        if vision_rate_limit == 0 {
            bail!("VISION_RATE_LIMIT must be at least 1");
        }

        let model_timeout_seconds: u64 = parse_env("MODEL_CALL_TIMEOUT_SECONDS", 20)?;

        let config = Self {
            camera_fps,
            camera_sources,
            vision_api_key: non_empty_env("VISION_API_KEY"),
            vision_api_url: env::var("VISION_API_URL")
                .unwrap_or_else(|_| DEFAULT_VISION_API_URL.to_string()),
            vision_rate_limit,
            reasoning_api_key: non_empty_env("REASONING_API_KEY"),
            reasoning_api_url: env::var("REASONING_API_URL")
                .unwrap_or_else(|_| DEFAULT_REASONING_API_URL.to_string()),
            object_threshold,
            activity_threshold,
            undirected_immediate_threshold,
            summary_collect_threshold,
            summary_interval: Duration::from_secs(summary_interval_seconds),
            baseline_stability_frames,
            history_window,
            alert_ring_capacity,
            frame_store_root: env::var("FRAME_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./event_frames")),
            model_call_timeout: Duration::from_secs(model_timeout_seconds),
            app_host: env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            app_port: parse_env("APP_PORT", 8000)?,
        };

        let calls_per_minute = config.camera_fps * 60.0 * config.camera_sources.len() as f64;
        if calls_per_minute > config.vision_rate_limit as f64 {
            warn!(
                "configured cadence needs {:.1} vision calls/min but VISION_RATE_LIMIT is {}; \
                 excess frames will be skipped",
                calls_per_minute, config.vision_rate_limit
            );
        }

        Ok(config)
    }

    /// Time between scheduled ticks of one camera.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.camera_fps)
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_percent(key: &str, default: u8) -> Result<u8> {
    let value: u8 = parse_env(key, default)?;
    if value > 100 {
        bail!("{key} must be within 0-100, got {value}");
    }
    Ok(value)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutation is process-global; tests serialise on this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.object_threshold, 60);
        assert_eq!(config.activity_threshold, 40);
        assert_eq!(config.undirected_immediate_threshold, 60);
        assert_eq!(config.summary_collect_threshold, 50);
        assert_eq!(config.summary_interval, Duration::from_secs(120));
        assert_eq!(config.baseline_stability_frames, 3);
        assert_eq!(config.history_window, 8);
        assert_eq!(config.alert_ring_capacity, 200);
        assert_eq!(config.camera_sources, vec!["synthetic:".to_string()]);
        assert!(config.frame_interval() > Duration::from_secs(29));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("OBJECT_THRESHOLD", "140");
        let result = PipelineConfig::from_env();
        env::remove_var("OBJECT_THRESHOLD");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_stability_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("BASELINE_STABILITY_FRAMES", "1");
        let result = PipelineConfig::from_env();
        env::remove_var("BASELINE_STABILITY_FRAMES");
        assert!(result.is_err());
    }

    #[test]
    fn test_camera_sources_parsed() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("CAMERA_SOURCES", "synthetic:, frames:/var/capture/cam1");
        let config = PipelineConfig::from_env().unwrap();
        env::remove_var("CAMERA_SOURCES");
        assert_eq!(
            config.camera_sources,
            vec!["synthetic:".to_string(), "frames:/var/capture/cam1".to_string()]
        );
    }
}
