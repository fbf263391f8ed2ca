use crate::controller::LoopSettings;
use anyhow::Context;
use emocam_hw::CaptureRequest;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// How state is written to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Text,
    Json,
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(RenderMode::Text),
            "json" => Ok(RenderMode::Json),
            other => Err(format!("unknown render mode: {other}")),
        }
    }
}

/// Daemon configuration. Defaults, then an optional TOML file named by
/// `EMOCAM_CONFIG`, then `EMOCAM_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Classifier service root (default: http://localhost:5000).
    pub backend_url: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Sampling period in milliseconds.
    pub sample_interval_ms: u64,
    /// Per-request timeout for the classifier, in seconds.
    pub request_timeout_secs: u64,
    pub jpeg_quality: u8,
    /// Number of readings kept for the timeline.
    pub history_capacity: usize,
    pub render: RenderMode,
    /// Start a session immediately instead of waiting for `start`.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let capture = CaptureRequest::default();
        Self {
            camera_device: capture.device,
            backend_url: emocam_core::classifier::DEFAULT_BACKEND_URL.to_string(),
            frame_width: capture.width,
            frame_height: capture.height,
            sample_interval_ms: 2000,
            request_timeout_secs: 10,
            jpeg_quality: emocam_hw::frame::DEFAULT_JPEG_QUALITY,
            history_capacity: emocam_core::history::DEFAULT_HISTORY_CAPACITY,
            render: RenderMode::Text,
            autostart: false,
        }
    }
}

impl Config {
    /// Load from `EMOCAM_CONFIG` (if set) and `EMOCAM_*` variables.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("EMOCAM_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay environment values. Unparseable values keep the current
    /// setting and are logged.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("EMOCAM_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("EMOCAM_BACKEND_URL") {
            self.backend_url = v;
        }
        env_parse(&lookup, "EMOCAM_FRAME_WIDTH", &mut self.frame_width);
        env_parse(&lookup, "EMOCAM_FRAME_HEIGHT", &mut self.frame_height);
        env_parse(&lookup, "EMOCAM_SAMPLE_INTERVAL_MS", &mut self.sample_interval_ms);
        env_parse(&lookup, "EMOCAM_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        env_parse(&lookup, "EMOCAM_JPEG_QUALITY", &mut self.jpeg_quality);
        env_parse(&lookup, "EMOCAM_HISTORY_CAPACITY", &mut self.history_capacity);
        env_parse(&lookup, "EMOCAM_RENDER", &mut self.render);
        if let Some(v) = lookup("EMOCAM_AUTOSTART") {
            self.autostart = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn sample_interval(&self) -> Duration {
        // A zero period would spin the timer.
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            capture: CaptureRequest {
                device: self.camera_device.clone(),
                width: self.frame_width,
                height: self.frame_height,
            },
            sample_interval: self.sample_interval(),
            jpeg_quality: self.jpeg_quality,
            history_capacity: self.history_capacity,
        }
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.backend_url, "http://localhost:5000");
        assert_eq!((config.frame_width, config.frame_height), (640, 480));
        assert_eq!(config.sample_interval(), Duration::from_millis(2000));
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.render, RenderMode::Text);
        assert!(!config.autostart);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            backend_url = "http://10.0.0.5:5000"
            sample_interval_ms = 500
            render = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend_url, "http://10.0.0.5:5000");
        assert_eq!(config.sample_interval_ms, 500);
        assert_eq!(config.render, RenderMode::Json);
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.history_capacity, 10);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(Config::from_toml_str("sample_rate = 3").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml_str("frame_width = 320\njpeg_quality = 50").unwrap();
        config.apply_env(env(&[
            ("EMOCAM_FRAME_WIDTH", "1280"),
            ("EMOCAM_CAMERA_DEVICE", "/dev/video2"),
            ("EMOCAM_RENDER", "JSON"),
            ("EMOCAM_AUTOSTART", "1"),
        ]));
        assert_eq!(config.frame_width, 1280);
        assert_eq!(config.jpeg_quality, 50);
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.render, RenderMode::Json);
        assert!(config.autostart);
    }

    #[test]
    fn test_bad_env_value_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("EMOCAM_SAMPLE_INTERVAL_MS", "fast"),
            ("EMOCAM_AUTOSTART", "false"),
        ]));
        assert_eq!(config.sample_interval_ms, 2000);
        assert!(!config.autostart);
    }

    #[test]
    fn test_loop_settings() {
        let config = Config {
            sample_interval_ms: 0,
            ..Config::default()
        };
        let settings = config.loop_settings();
        assert_eq!(settings.sample_interval, Duration::from_millis(1));
        assert_eq!(settings.capture.device, "/dev/video0");
        assert_eq!(settings.history_capacity, 10);
    }
}
