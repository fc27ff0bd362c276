//! Engine configuration.
//!
//! The engine is configured from one JSON document:
//!
//! ```json
//! {
//!     "FixedFrameDuration": 0.02,
//!     "MaxFixedStepsPerFrame": 5,
//!     "Window": { "Title": "Ember", "Width": 1280, "Height": 720 },
//!     "Systems": {
//!         "SceneSystem": { "BaseScenePath": "Data/Scenes/", "NextSceneName": "Level1" },
//!         "BehaviorSystem": {}
//!     }
//! }
//! ```
//!
//! `Systems` is an ordered object: its key order is the system registration
//! order. Each block is fed to the matching system through the same reading
//! facade used for scenes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EngineError;

// ---------------------------------------------------------------------------
// WindowConfig
// ---------------------------------------------------------------------------

/// Window parameters. The core only consumes `Headless` and `FrameLimit`;
/// the rest is passed through to whatever presentation system is plugged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WindowConfig {
    /// Window caption.
    pub title: String,
    /// Client width in pixels.
    pub width: u32,
    /// Client height in pixels.
    pub height: u32,
    /// Ask the presenter to wait for vertical sync.
    pub vsync: bool,
    /// Run the loop as fast as possible, without pacing to the fixed step.
    pub headless: bool,
    /// Stop after this many loop iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_limit: Option<u64>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Ember".to_owned(),
            width: 1280,
            height: 720,
            vsync: true,
            headless: false,
            frame_limit: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EngineConfig {
    /// Seconds per simulation frame. Must be positive and finite.
    pub fixed_frame_duration: f64,
    /// Catch-up bound: at most this many fixed updates per loop iteration.
    pub max_fixed_steps_per_frame: u32,
    /// Window parameters.
    pub window: WindowConfig,
    /// System tag → config block, in registration order.
    pub systems: Map<String, Value>,
}

impl Default for EngineConfig {
    /// 50 Hz simulation, up to 5 catch-up steps, no systems.
    fn default() -> Self {
        Self {
            fixed_frame_duration: 1.0 / 50.0,
            max_fixed_steps_per_frame: 5,
            window: WindowConfig::default(),
            systems: Map::new(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a config document.
    pub fn from_json_str(text: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(text).map_err(|e| EngineError::Config {
            details: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate an EngineConfig file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            details: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.fixed_frame_duration > 0.0 && self.fixed_frame_duration.is_finite()) {
            return Err(EngineError::Config {
                details: format!(
                    "FixedFrameDuration must be positive and finite, got {}",
                    self.fixed_frame_duration
                ),
            });
        }
        if self.max_fixed_steps_per_frame == 0 {
            return Err(EngineError::Config {
                details: "MaxFixedStepsPerFrame must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    /// Builder: append a system block.
    pub fn with_system(mut self, tag: &str, block: Value) -> Self {
        self.systems.insert(tag.to_owned(), block);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_keys() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!((config.fixed_frame_duration - 0.02).abs() < f64::EPSILON);
        assert_eq!(config.max_fixed_steps_per_frame, 5);
    }

    #[test]
    fn systems_keep_declaration_order() {
        let config = EngineConfig::from_json_str(
            r#"{ "Systems": { "Zeta": {}, "SceneSystem": {}, "Alpha": { "X": 1 } } }"#,
        )
        .unwrap();
        let tags: Vec<&str> = config.systems.keys().map(String::as_str).collect();
        assert_eq!(tags, vec!["Zeta", "SceneSystem", "Alpha"]);
        assert_eq!(config.systems["Alpha"], json!({ "X": 1 }));
    }

    #[test]
    fn window_block_is_pascal_case() {
        let config = EngineConfig::from_json_str(
            r#"{ "Window": { "Title": "Test", "Headless": true, "FrameLimit": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.window.title, "Test");
        assert!(config.window.headless);
        assert_eq!(config.window.frame_limit, Some(3));
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn non_positive_step_is_rejected() {
        for text in [
            r#"{ "FixedFrameDuration": 0.0 }"#,
            r#"{ "FixedFrameDuration": -1.0 }"#,
        ] {
            let err = EngineConfig::from_json_str(text).unwrap_err();
            assert!(err.to_string().contains("must be positive and finite"));
        }
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = EngineConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn zero_catch_up_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "MaxFixedStepsPerFrame": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }
}
