//! Shared configuration state, authoritatively owned by the controllee.
//!
//! Startup defaults load from an optional TOML file into a fixed,
//! `#[serde(default)]` struct, but the live map itself is a plain key ->
//! value table rather than a fixed struct, since a `SET_VAR` write can
//! carry forward-compatible unknown keys.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

pub const KEY_MONITOR: &str = "monitor";
pub const KEY_SCALE: &str = "scale";
pub const KEY_FPS: &str = "fps";
pub const KEY_JPEG_QUALITY: &str = "jpeg_quality";
pub const KEY_COMPRESSION_LEVEL: &str = "compression_level";
pub const KEY_USE_NUMPY: &str = "use_numpy";
pub const KEY_SHOULD_UPDATE_COMMANDS: &str = "should_update_commands";

pub const DEFAULT_MONITOR: i64 = 0;
pub const DEFAULT_SCALE: f64 = 1.0;
pub const DEFAULT_FPS: i64 = 120;
pub const DEFAULT_JPEG_QUALITY: i64 = 50;
pub const DEFAULT_COMPRESSION_LEVEL: i64 = 1;
pub const DEFAULT_USE_NUMPY: bool = false;
pub const DEFAULT_SHOULD_UPDATE_COMMANDS: bool = true;

/// Optional `--config` TOML file; every field is optional and falls back to
/// the built-in default when absent.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub monitor: Option<i64>,
    pub scale: Option<f64>,
    pub fps: Option<i64>,
    pub jpeg_quality: Option<i64>,
    pub compression_level: Option<i64>,
    pub use_numpy: Option<bool>,
    pub should_update_commands: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

struct Inner {
    values: HashMap<String, Value>,
    capture_interval: Duration,
}

/// Shared, mutex-protected key -> value map. One mutex guards both the map
/// and the derived `fps` -> capture-interval side effect so a reader never
/// observes the two out of sync.
#[derive(Clone)]
pub struct Configuration {
    inner: Arc<Mutex<Inner>>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::from_file_opt(ConfigFile::default())
    }

    pub fn from_file_opt(file: ConfigFile) -> Self {
        let fps = file.fps.unwrap_or(DEFAULT_FPS);
        let mut values = HashMap::new();
        values.insert(KEY_MONITOR.into(), Value::from(file.monitor.unwrap_or(DEFAULT_MONITOR)));
        values.insert(KEY_SCALE.into(), Value::from(file.scale.unwrap_or(DEFAULT_SCALE)));
        values.insert(KEY_FPS.into(), Value::from(fps));
        values.insert(
            KEY_JPEG_QUALITY.into(),
            Value::from(file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY)),
        );
        values.insert(
            KEY_COMPRESSION_LEVEL.into(),
            Value::from(file.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL)),
        );
        values.insert(KEY_USE_NUMPY.into(), Value::from(file.use_numpy.unwrap_or(DEFAULT_USE_NUMPY)));
        values.insert(
            KEY_SHOULD_UPDATE_COMMANDS.into(),
            Value::from(file.should_update_commands.unwrap_or(DEFAULT_SHOULD_UPDATE_COMMANDS)),
        );

        let capture_interval = interval_for_fps(fps as f64);
        Configuration { inner: Arc::new(Mutex::new(Inner { values, capture_interval })) }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().values.get(key).cloned()
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Applies a `SET_VAR` write. Unknown keys are stored verbatim for
    /// forward compatibility; a write to `fps` updates the capture
    /// interval in the same critical section.
    pub fn set(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        if key == KEY_FPS {
            if let Some(fps) = value.as_f64() {
                if fps > 0.0 {
                    inner.capture_interval = interval_for_fps(fps);
                }
            }
        }
        inner.values.insert(key.to_string(), value);
        log::debug!("config {} = {:?}", key, inner.values.get(key));
    }

    pub fn capture_interval(&self) -> Duration {
        self.inner.lock().unwrap().capture_interval
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

fn interval_for_fps(fps: f64) -> Duration {
    Duration::from_secs_f64(1.0 / fps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_write_updates_capture_interval() {
        let config = Configuration::new();
        assert_eq!(config.capture_interval(), Duration::from_secs_f64(1.0 / 120.0));
        config.set(KEY_FPS, Value::from(30));
        assert!((config.capture_interval().as_secs_f64() - 1.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_key_is_accepted_without_side_effect() {
        let config = Configuration::new();
        config.set("wobble", Value::from(7));
        assert_eq!(config.get("wobble"), Some(Value::from(7)));
        assert_eq!(config.get_i64(KEY_FPS, 0), DEFAULT_FPS);
    }
}
