//! Scene bookkeeping and scene storage.
//!
//! [`SceneSystem`] tracks which scene is running and which one was requested
//! next. The actual transition (exit, load, init) is driven by the engine
//! at the end of a simulation frame, so a scene change requested from any
//! callback never tears the world down under that callback's feet.
//!
//! Scene files are reached through a [`SceneStore`]. [`DirectoryStore`]
//! maps a scene name to `<base path><name>.scene.json`; [`MemoryStore`]
//! keeps scene text in memory for tests and tools.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use ember_ces::prelude::*;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::EngineError;

/// File extension of scene files.
pub const SCENE_EXTENSION: &str = ".scene.json";

/// EngineConfig tag of the built-in scene system.
pub const SCENE_SYSTEM_TAG: &str = "SceneSystem";

const DEFAULT_BASE_PATH: &str = "Data/Scenes/";
const DEFAULT_AUTOSAVE_NAME: &str = "Autosave";

// ---------------------------------------------------------------------------
// SceneStore
// ---------------------------------------------------------------------------

/// Where scene text lives.
pub trait SceneStore {
    /// The full text of scene `name`.
    fn load(&self, name: &str) -> Result<String, EngineError>;

    /// Create or overwrite scene `name`.
    fn save(&mut self, name: &str, text: &str) -> Result<(), EngineError>;

    /// Names of every available scene, sorted.
    fn names(&self) -> Result<Vec<String>, EngineError>;

    /// Human-readable location of scene `name`, used in breadcrumbs.
    fn path_of(&self, name: &str) -> String;

    /// The configured base path, for stores that have one.
    fn base_path(&self) -> Option<&str> {
        None
    }

    /// Apply a `BaseScenePath` config value.
    fn set_base_path(&mut self, _base: &str) {}
}

/// Scenes as files under a base directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    base: String,
}

impl DirectoryStore {
    /// `base` is used as a plain prefix, so it normally ends with a separator.
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Prefix put in front of every scene file name.
    pub fn base(&self) -> &str {
        &self.base
    }
}

impl SceneStore for DirectoryStore {
    fn load(&self, name: &str) -> Result<String, EngineError> {
        let path = self.path_of(name);
        std::fs::read_to_string(&path).map_err(|source| EngineError::SceneStore { path, source })
    }

    fn save(&mut self, name: &str, text: &str) -> Result<(), EngineError> {
        let path = self.path_of(name);
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| EngineError::SceneStore {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        std::fs::write(&path, text).map_err(|source| EngineError::SceneStore { path, source })
    }

    fn names(&self) -> Result<Vec<String>, EngineError> {
        let dir = if self.base.is_empty() { "." } else { self.base.as_str() };
        let entries = std::fs::read_dir(dir).map_err(|source| EngineError::SceneStore {
            path: dir.to_owned(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let file_name = file_name.to_str()?;
                file_name.strip_suffix(SCENE_EXTENSION).map(str::to_owned)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn path_of(&self, name: &str) -> String {
        format!("{}{name}{SCENE_EXTENSION}", self.base)
    }

    fn base_path(&self) -> Option<&str> {
        Some(&self.base)
    }

    fn set_base_path(&mut self, base: &str) {
        self.base = base.to_owned();
    }
}

/// Scenes held in memory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    scenes: BTreeMap<String, String>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add or replace a scene.
    pub fn with_scene(mut self, name: &str, text: &str) -> Self {
        self.scenes.insert(name.to_owned(), text.to_owned());
        self
    }

    /// Stored text of scene `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.scenes.get(name).map(String::as_str)
    }
}

impl SceneStore for MemoryStore {
    fn load(&self, name: &str) -> Result<String, EngineError> {
        self.scenes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::SceneLoad {
                scene: name.to_owned(),
                details: "no such scene".to_owned(),
            })
    }

    fn save(&mut self, name: &str, text: &str) -> Result<(), EngineError> {
        self.scenes.insert(name.to_owned(), text.to_owned());
        Ok(())
    }

    fn names(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.scenes.keys().cloned().collect())
    }

    fn path_of(&self, name: &str) -> String {
        format!("{name}{SCENE_EXTENSION}")
    }
}

// ---------------------------------------------------------------------------
// SceneSystem
// ---------------------------------------------------------------------------

/// Where the scene lifecycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SceneState {
    /// No scene is loaded.
    #[default]
    Idle,
    /// Scene JSON is being read and entities added.
    Loading,
    /// A scene is loaded and initialized.
    Running,
    /// Systems and entities are being torn down.
    Exiting,
}

/// Current/next scene bookkeeping, autosave, and the scene store.
pub struct SceneSystem {
    state: SceneState,
    current: Option<String>,
    next: Option<String>,
    autosave_name: String,
    must_copy_autosave: bool,
    store: Box<dyn SceneStore>,
    last_diagnostics: Vec<Diagnostic>,
}

impl Default for SceneSystem {
    fn default() -> Self {
        Self::new(Box::new(DirectoryStore::new(DEFAULT_BASE_PATH)))
    }
}

impl SceneSystem {
    /// Idle scene bookkeeping over `store`.
    pub fn new(store: Box<dyn SceneStore>) -> Self {
        Self {
            state: SceneState::Idle,
            current: None,
            next: None,
            autosave_name: DEFAULT_AUTOSAVE_NAME.to_owned(),
            must_copy_autosave: false,
            store,
            last_diagnostics: Vec::new(),
        }
    }

    /// `BaseScenePath`: forwarded to the store, which may ignore it.
    fn read_base_path(&mut self, value: &Value, stream: &mut Stream<'_>) {
        if let Some(base) = stream.read::<String>(value) {
            self.store.set_base_path(&base);
        }
    }

    /// `NextSceneName`: the scene to open at the end of the first frame.
    /// An empty name requests nothing.
    fn read_next_scene(&mut self, value: &Value, stream: &mut Stream<'_>) {
        if let Some(name) = stream.read::<String>(value) {
            if !name.is_empty() {
                self.set_next_scene(name);
            }
        }
    }

    /// `AutosaveName`: store name used by autosave and the editor copy.
    fn read_autosave_name(&mut self, value: &Value, stream: &mut Stream<'_>) {
        stream.read_into(&mut self.autosave_name, value);
    }

    // -- requests -----------------------------------------------------------

    /// Switch to `name` at the end of the current simulation frame. A later
    /// request in the same frame replaces an earlier one.
    pub fn set_next_scene(&mut self, name: impl Into<String>) {
        let name = name.into();
        debug!(scene = %name, "scene change requested");
        self.next = Some(name);
    }

    /// Reload the running scene from its stored text.
    pub fn reset_scene(&mut self) {
        match self.current.clone() {
            Some(current) => self.set_next_scene(current),
            None => warn!("reset requested with no scene loaded"),
        }
    }

    /// Restore the last autosave.
    pub fn load_autosave(&mut self) {
        let name = self.autosave_name.clone();
        self.set_next_scene(name);
    }

    /// Load `name` and copy its text to the autosave once it has loaded, so
    /// the play bar can always get back to the scene as opened.
    pub fn open_for_editing(&mut self, name: impl Into<String>) {
        self.set_next_scene(name);
        self.must_copy_autosave = true;
    }

    /// Store `scene` (the output of a scene write) under `name`.
    pub fn save_scene_value(
        &mut self,
        name: &str,
        scene: &Value,
    ) -> Result<SceneSnapshot, EngineError> {
        let snapshot = SceneSnapshot::capture(name, scene);
        self.store.save(name, &snapshot.json)?;
        debug!(scene = %name, hash = %snapshot.hash, "scene saved");
        Ok(snapshot)
    }

    /// Every scene name the store can load.
    pub fn scene_names(&self) -> Result<Vec<String>, EngineError> {
        self.store.names()
    }

    // -- accessors ----------------------------------------------------------

    /// Where the scene lifecycle is.
    pub fn state(&self) -> SceneState {
        self.state
    }

    /// Store name of the running scene.
    pub fn current_scene(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Scene requested for the end of this frame, if any.
    pub fn next_scene(&self) -> Option<&str> {
        self.next.as_deref()
    }

    /// Store name autosaves are written to.
    pub fn autosave_name(&self) -> &str {
        &self.autosave_name
    }

    /// Change where autosaves go.
    pub fn set_autosave_name(&mut self, name: impl Into<String>) {
        self.autosave_name = name.into();
    }

    /// Where scenes are read from and written to.
    pub fn store(&self) -> &dyn SceneStore {
        self.store.as_ref()
    }

    /// Mutable access to the scene store.
    pub fn store_mut(&mut self) -> &mut dyn SceneStore {
        self.store.as_mut()
    }

    /// Swap the scene store. Takes effect at the next load or save.
    pub fn set_store(&mut self, store: Box<dyn SceneStore>) {
        self.store = store;
    }

    /// Diagnostics recorded while reading the running scene.
    pub fn last_load_diagnostics(&self) -> &[Diagnostic] {
        &self.last_diagnostics
    }

    /// State, current and next scene, and load warning count.
    pub fn debug_window(&self) -> InspectNode {
        InspectNode::group(
            SCENE_SYSTEM_TAG,
            vec![
                InspectNode::readonly("State", json!(format!("{:?}", self.state))),
                InspectNode::readonly("CurrentScene", json!(self.current)),
                InspectNode::field("NextScene", json!(self.next)),
                InspectNode::field("AutosaveName", json!(self.autosave_name)),
                InspectNode::readonly("LoadWarnings", json!(self.last_diagnostics.len())),
            ],
        )
    }

    // -- transition plumbing (driven by the engine) -------------------------

    pub(crate) fn take_next(&mut self) -> Option<String> {
        self.next.take()
    }

    pub(crate) fn take_autosave_copy(&mut self) -> bool {
        std::mem::take(&mut self.must_copy_autosave)
    }

    pub(crate) fn set_state(&mut self, state: SceneState) {
        self.state = state;
    }

    pub(crate) fn begin_loading(&mut self, name: &str) {
        self.current = Some(name.to_owned());
        self.state = SceneState::Loading;
    }

    pub(crate) fn finish_loading(&mut self, diagnostics: Vec<Diagnostic>) {
        self.last_diagnostics = diagnostics;
        self.state = SceneState::Running;
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = None;
        self.last_diagnostics.clear();
        self.state = SceneState::Idle;
    }
}

impl Serializable for SceneSystem {
    fn read_methods() -> ReadMethodMap<Self> {
        &[
            ("BaseScenePath", Self::read_base_path),
            ("NextSceneName", Self::read_next_scene),
            ("AutosaveName", Self::read_autosave_name),
        ]
    }

    /// The running scene is written as `NextSceneName`, so a saved config
    /// reopens where the session left off.
    fn write(&self) -> Value {
        let scene = self.current.as_deref().or(self.next.as_deref()).unwrap_or("");
        let mut out = serde_json::Map::new();
        if let Some(base) = self.store.base_path() {
            out.insert("BaseScenePath".to_owned(), json!(base));
        }
        out.insert("NextSceneName".to_owned(), json!(scene));
        out.insert("AutosaveName".to_owned(), json!(self.autosave_name));
        Value::Object(out)
    }
}

impl fmt::Debug for SceneSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneSystem")
            .field("state", &self.state)
            .field("current", &self.current)
            .field("next", &self.next)
            .field("autosave_name", &self.autosave_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_base(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!("ember-scenes-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        format!("{}/", dir.display())
    }

    #[test]
    fn config_block_sets_next_scene_and_base_path() {
        let mut scenes = SceneSystem::default();
        let mut stream = Stream::new();
        scenes.read_value(
            &json!({ "BaseScenePath": "levels/", "NextSceneName": "Intro", "AutosaveName": "Auto" }),
            &mut stream,
        );
        assert!(stream.diagnostics().is_empty());
        assert_eq!(scenes.next_scene(), Some("Intro"));
        assert_eq!(scenes.autosave_name(), "Auto");
        assert_eq!(scenes.store().path_of("Intro"), "levels/Intro.scene.json");
        assert_eq!(
            scenes.write(),
            json!({ "BaseScenePath": "levels/", "NextSceneName": "Intro", "AutosaveName": "Auto" })
        );
    }

    #[test]
    fn unknown_config_key_warns() {
        let mut scenes = SceneSystem::default();
        let mut stream = Stream::new().with_file("EngineConfig");
        {
            let mut scope = stream.scope(SCENE_SYSTEM_TAG);
            scenes.read_value(&json!({ "Bogus": 1 }), &mut scope);
        }
        let diagnostics = stream.into_diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::UnknownKey);
        assert_eq!(diagnostics[0].location, "EngineConfig::SceneSystem");
    }

    #[test]
    fn last_request_wins() {
        let mut scenes = SceneSystem::new(Box::new(MemoryStore::new()));
        scenes.set_next_scene("a");
        scenes.set_next_scene("b");
        assert_eq!(scenes.take_next().as_deref(), Some("b"));
        assert!(scenes.take_next().is_none());
    }

    #[test]
    fn reset_and_autosave_requests() {
        let mut scenes = SceneSystem::new(Box::new(MemoryStore::new()));
        scenes.reset_scene();
        assert!(scenes.next_scene().is_none());

        scenes.begin_loading("level");
        scenes.reset_scene();
        assert_eq!(scenes.next_scene(), Some("level"));
        scenes.load_autosave();
        assert_eq!(scenes.next_scene(), Some(DEFAULT_AUTOSAVE_NAME));
    }

    #[test]
    fn open_for_editing_flags_one_copy() {
        let mut scenes = SceneSystem::new(Box::new(MemoryStore::new()));
        scenes.open_for_editing("level");
        assert!(scenes.take_autosave_copy());
        assert!(!scenes.take_autosave_copy());
    }

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryStore::new().with_scene("b", "{}");
        store.save("a", "[]").unwrap();
        assert_eq!(store.load("a").unwrap(), "[]");
        assert_eq!(store.names().unwrap(), vec!["a", "b"]);
        assert!(matches!(store.load("zzz"), Err(EngineError::SceneLoad { .. })));
    }

    #[test]
    fn directory_store_lists_scene_files() {
        let base = temp_base("list");
        let mut store = DirectoryStore::new(base.clone());
        store.save("Level1", "{}").unwrap();
        store.save("Level2", "{}").unwrap();
        std::fs::write(format!("{base}notes.txt"), "ignored").unwrap();

        assert_eq!(store.names().unwrap(), vec!["Level1", "Level2"]);
        assert_eq!(store.load("Level2").unwrap(), "{}");
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn directory_store_missing_file_is_io_error() {
        let store = DirectoryStore::new(temp_base("missing"));
        let err = store.load("Nowhere").unwrap_err();
        assert!(matches!(err, EngineError::SceneStore { .. }));
        assert!(err.to_string().contains("Nowhere.scene.json"));
    }

    #[test]
    fn save_scene_value_returns_snapshot() {
        let mut scenes = SceneSystem::new(Box::new(MemoryStore::new()));
        let scene = json!({ "Name": "x", "Entities": [] });
        let snapshot = scenes.save_scene_value("x", &scene).unwrap();
        assert!(snapshot.verify());
        assert_eq!(scenes.store().load("x").unwrap(), snapshot.json);
        assert_eq!(scenes.scene_names().unwrap(), vec!["x"]);
    }
}
