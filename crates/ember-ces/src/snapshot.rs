//! Scene snapshots.
//!
//! A [`SceneSnapshot`] freezes the serialized form of a scene together with
//! a BLAKE3 digest of that text. Two snapshots with the same hash describe
//! byte-identical scenes, which makes the digest a cheap equality check for
//! autosave verification and round-trip tests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Serialized scene plus its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    /// Scene name at capture time.
    pub name: String,
    /// Pretty-printed scene JSON.
    pub json: String,
    /// BLAKE3 hex digest of `json`.
    pub hash: String,
}

impl SceneSnapshot {
    /// Capture `scene` (the output of a scene `write()`).
    pub fn capture(name: impl Into<String>, scene: &Value) -> Self {
        // Value always serializes; the empty fallback only guards the type.
        let json = serde_json::to_string_pretty(scene).unwrap_or_default();
        let hash = hash_text(&json);
        Self {
            name: name.into(),
            json,
            hash,
        }
    }

    /// Whether both snapshots hold the same scene text.
    pub fn same_scene(&self, other: &SceneSnapshot) -> bool {
        self.hash == other.hash
    }

    /// Recompute the digest and compare it with the stored one.
    pub fn verify(&self) -> bool {
        hash_text(&self.json) == self.hash
    }

    /// Parse the stored scene text back into JSON.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.json)
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_scenes_hash_equal() {
        let scene = json!({ "Name": "level", "Entities": [{ "Name": "a" }] });
        let a = SceneSnapshot::capture("level", &scene);
        let b = SceneSnapshot::capture("copy", &scene);
        assert!(a.same_scene(&b));
        assert_eq!(a.hash.len(), 64);
        assert!(a.hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_scenes_hash_differently() {
        let a = SceneSnapshot::capture("level", &json!({ "Entities": [] }));
        let b = SceneSnapshot::capture("level", &json!({ "Entities": [{ "Name": "x" }] }));
        assert!(!a.same_scene(&b));
    }

    #[test]
    fn verify_detects_tampering() {
        let mut snapshot = SceneSnapshot::capture("level", &json!({ "Entities": [] }));
        assert!(snapshot.verify());
        snapshot.json.push(' ');
        assert!(!snapshot.verify());
        assert!(snapshot.to_value().is_ok());
    }
}
