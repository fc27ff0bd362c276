//! JSON read/write facade.
//!
//! Any value that can be loaded from scene or config JSON implements
//! [`Serializable`]: a static table mapping JSON keys to reader functions,
//! plus a [`Serializable::write`] that produces an ordered JSON object.
//! [`ReadValue`] is the object-safe entry point that walks a JSON object and
//! dispatches each key through that table.
//!
//! Reading happens inside a [`Stream`], which carries the lookup tables a
//! reader may need (component registry, archetype library), a breadcrumb
//! stack describing where in the document the reader currently is, and the
//! [`Diagnostic`]s produced so far. Field-level problems never abort a load;
//! they are recorded with their breadcrumb and the field is skipped.
//!
//! # Example
//!
//! ```
//! use ember_ces::stream::{ReadMethodMap, Serializable, ReadValue, Stream};
//! use serde_json::{json, Value};
//!
//! #[derive(Default)]
//! struct Health { max: u32 }
//!
//! impl Health {
//!     fn read_max(&mut self, value: &Value, stream: &mut Stream<'_>) {
//!         stream.read_into(&mut self.max, value);
//!     }
//! }
//!
//! impl Serializable for Health {
//!     fn read_methods() -> ReadMethodMap<Self> {
//!         &[("Max", Self::read_max)]
//!     }
//!     fn write(&self) -> Value {
//!         json!({ "Max": self.max })
//!     }
//! }
//!
//! let mut stream = Stream::new();
//! let mut health = Health::default();
//! health.read_value(&json!({ "Max": 30, "Regen": 2 }), &mut stream);
//! assert_eq!(health.max, 30);
//! assert_eq!(stream.diagnostics().len(), 1); // "Regen" is unknown
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::asset::AssetLibrary;
use crate::component::ComponentRegistry;
use crate::entity::Entity;
use crate::CesError;

// ---------------------------------------------------------------------------
// Serializable / ReadValue
// ---------------------------------------------------------------------------

/// A reader for one JSON key of `T`.
pub type ReadMethod<T> = fn(&mut T, &Value, &mut Stream<'_>);

/// Static key → reader table of `T`.
pub type ReadMethodMap<T> = &'static [(&'static str, ReadMethod<T>)];

/// A value with a JSON representation.
pub trait Serializable: 'static {
    /// Readers for every key this type understands.
    fn read_methods() -> ReadMethodMap<Self>
    where
        Self: Sized;

    /// Serialize into an ordered JSON value.
    fn write(&self) -> Value;

    /// Called with the whole JSON value before any key is dispatched.
    fn before_load(&mut self, _value: &Value, _stream: &mut Stream<'_>) {}

    /// Called once every key has been dispatched.
    fn after_load(&mut self) {}
}

/// Object-safe reading entry point, implemented for every [`Serializable`].
pub trait ReadValue {
    /// Apply `value` to `self`, key by key.
    fn read_value(&mut self, value: &Value, stream: &mut Stream<'_>);
}

impl<T: Serializable> ReadValue for T {
    fn read_value(&mut self, value: &Value, stream: &mut Stream<'_>) {
        let Some(object) = value.as_object() else {
            stream.warn(
                DiagnosticKind::WrongType,
                format!("expected a JSON object, found {}", json_type_name(value)),
            );
            return;
        };
        self.before_load(value, stream);
        let methods = T::read_methods();
        for (key, field) in object {
            match methods.iter().find(|(name, _)| *name == key.as_str()) {
                Some((_, read)) => {
                    let mut scope = stream.scope(key);
                    read(self, field, &mut scope);
                }
                None => stream.warn(
                    DiagnosticKind::UnknownKey,
                    format!("unrecognized key \"{key}\""),
                ),
            }
        }
        self.after_load();
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// Category of a recoverable load problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// A key with no reader.
    UnknownKey,
    /// A component tag missing from the registry.
    UnknownComponent,
    /// A field whose JSON type does not match what the reader expects.
    WrongType,
    /// A named asset that could not be found.
    MissingAsset,
    /// A second entry under a name that is already taken.
    Duplicate,
    /// Text that is not JSON at all.
    Malformed,
}

/// A recoverable problem met while reading, with the breadcrumb where it
/// happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Category of the problem.
    pub kind: DiagnosticKind,
    /// Human-readable description.
    pub message: String,
    /// Breadcrumb such as `Entities[2].Components.Health`.
    pub location: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.location, self.message)
        }
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Crumb {
    File(String),
    Key(String),
    Index(usize),
}

/// Per-load reading context.
#[derive(Default)]
pub struct Stream<'a> {
    registry: Option<&'a ComponentRegistry>,
    archetypes: Option<&'a AssetLibrary<Entity>>,
    crumbs: Vec<Crumb>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Stream<'a> {
    /// A stream with no lookup tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make component tags resolvable.
    pub fn with_registry(mut self, registry: &'a ComponentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Make `"Archetype"` keys resolvable.
    pub fn with_archetypes(mut self, archetypes: &'a AssetLibrary<Entity>) -> Self {
        self.archetypes = Some(archetypes);
        self
    }

    /// Prefix every location with `name::`.
    pub fn with_file(mut self, name: &str) -> Self {
        self.crumbs.insert(0, Crumb::File(name.to_owned()));
        self
    }

    /// Registry used to build components by tag.
    pub fn registry(&self) -> Option<&'a ComponentRegistry> {
        self.registry
    }

    /// Library `"Archetype"` keys resolve against.
    pub fn archetypes(&self) -> Option<&'a AssetLibrary<Entity>> {
        self.archetypes
    }

    /// Push a key breadcrumb; popped when the guard drops.
    pub fn scope(&mut self, key: &str) -> Scope<'_, 'a> {
        self.crumbs.push(Crumb::Key(key.to_owned()));
        Scope { stream: self }
    }

    /// Push an array-index breadcrumb; popped when the guard drops.
    pub fn scope_index(&mut self, index: usize) -> Scope<'_, 'a> {
        self.crumbs.push(Crumb::Index(index));
        Scope { stream: self }
    }

    /// The current breadcrumb, e.g. `level1::Entities[2].Components.Sprite`.
    pub fn location(&self) -> String {
        let mut out = String::new();
        let mut after_file = true;
        for crumb in &self.crumbs {
            match crumb {
                Crumb::File(name) => {
                    out.push_str(name);
                    out.push_str("::");
                    after_file = true;
                }
                Crumb::Key(key) => {
                    if !after_file {
                        out.push('.');
                    }
                    out.push_str(key);
                    after_file = false;
                }
                Crumb::Index(index) => {
                    out.push_str(&format!("[{index}]"));
                    after_file = false;
                }
            }
        }
        out
    }

    /// Record a diagnostic at the current location and log it.
    pub fn warn(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            kind,
            message: message.into(),
            location: self.location(),
        };
        warn!(
            location = %diagnostic.location,
            kind = ?diagnostic.kind,
            "{}",
            diagnostic.message
        );
        self.diagnostics.push(diagnostic);
    }

    /// Diagnostics recorded so far.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Consume the stream, keeping its diagnostics.
    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    /// Deserialize a plain value, warning and returning `None` on a type
    /// mismatch.
    pub fn read<T: DeserializeOwned>(&mut self, value: &Value) -> Option<T> {
        match T::deserialize(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.warn(
                    DiagnosticKind::WrongType,
                    format!(
                        "could not read {} as {}: {e}",
                        json_type_name(value),
                        short_type_name::<T>()
                    ),
                );
                None
            }
        }
    }

    /// Like [`Stream::read`], overwriting `target` only on success.
    pub fn read_into<T: DeserializeOwned>(&mut self, target: &mut T, value: &Value) -> bool {
        match self.read(value) {
            Some(parsed) => {
                *target = parsed;
                true
            }
            None => false,
        }
    }

    /// Read an array element by element, each under an index breadcrumb.
    pub fn read_array<F>(&mut self, value: &Value, mut read: F)
    where
        F: FnMut(usize, &Value, &mut Stream<'a>),
    {
        let Some(items) = value.as_array() else {
            self.warn(
                DiagnosticKind::WrongType,
                format!("expected an array, found {}", json_type_name(value)),
            );
            return;
        };
        for (index, item) in items.iter().enumerate() {
            let mut scope = self.scope_index(index);
            read(index, item, &mut *scope);
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Breadcrumb guard returned by [`Stream::scope`].
pub struct Scope<'s, 'a> {
    stream: &'s mut Stream<'a>,
}

impl<'a> Deref for Scope<'_, 'a> {
    type Target = Stream<'a>;

    fn deref(&self) -> &Self::Target {
        self.stream
    }
}

impl DerefMut for Scope<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.stream
    }
}

impl Drop for Scope<'_, '_> {
    fn drop(&mut self) {
        self.stream.crumbs.pop();
    }
}

// ---------------------------------------------------------------------------
// Text entry points
// ---------------------------------------------------------------------------

/// Parse JSON text. A syntax error is the one structural failure a load can
/// hit; it is reported once and the caller abandons the load.
pub fn parse_str(text: &str, path: &str) -> Result<Value, CesError> {
    serde_json::from_str(text).map_err(|e| {
        warn!(path = %path, error = %e, "malformed JSON");
        CesError::Json {
            path: path.to_owned(),
            details: e.to_string(),
        }
    })
}

/// Serialize one value to clipboard text.
pub fn copy_to_string<T: Serializable + ?Sized>(value: &T) -> String {
    // Pretty output keeps pasted text readable in an editor.
    serde_json::to_string_pretty(&value.write()).unwrap_or_default()
}

/// Apply clipboard text onto `target`. Malformed text leaves `target`
/// untouched.
pub fn paste_from_str<T: ReadValue + ?Sized>(
    target: &mut T,
    text: &str,
    stream: &mut Stream<'_>,
) -> Result<(), CesError> {
    let value = parse_str(text, "clipboard")?;
    target.read_value(&value, stream);
    Ok(())
}

// ---------------------------------------------------------------------------
// Clipboard
// ---------------------------------------------------------------------------

/// Text clipboard used by inspector copy and paste.
pub trait Clipboard {
    fn set_text(&mut self, text: String);
    fn text(&self) -> Option<String>;
}

/// A clipboard held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryClipboard {
    contents: Option<String>,
}

impl Clipboard for MemoryClipboard {
    fn set_text(&mut self, text: String) {
        self.contents = Some(text);
    }

    fn text(&self) -> Option<String> {
        self.contents.clone()
    }
}

/// Copy `value` onto `clipboard`.
pub fn copy_to_clipboard<T: Serializable + ?Sized>(value: &T, clipboard: &mut dyn Clipboard) {
    clipboard.set_text(copy_to_string(value));
}

/// Paste the clipboard contents onto `target`.
///
/// An empty clipboard is not an error; nothing happens.
pub fn paste_from_clipboard<T: ReadValue + ?Sized>(
    target: &mut T,
    clipboard: &dyn Clipboard,
    stream: &mut Stream<'_>,
) -> Result<(), CesError> {
    match clipboard.text() {
        Some(text) => paste_from_str(target, &text, stream),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq)]
    struct Building {
        cost: u32,
        label: String,
    }

    impl Building {
        fn read_cost(&mut self, value: &Value, stream: &mut Stream<'_>) {
            stream.read_into(&mut self.cost, value);
        }

        fn read_label(&mut self, value: &Value, stream: &mut Stream<'_>) {
            stream.read_into(&mut self.label, value);
        }
    }

    impl Serializable for Building {
        fn read_methods() -> ReadMethodMap<Self> {
            &[("Cost", Self::read_cost), ("Label", Self::read_label)]
        }

        fn write(&self) -> Value {
            json!({ "Cost": self.cost, "Label": self.label })
        }
    }

    #[derive(Debug, Default, PartialEq)]
    struct Construction {
        buildings: Vec<Building>,
        loaded: bool,
    }

    impl Construction {
        fn read_buildings(&mut self, value: &Value, stream: &mut Stream<'_>) {
            self.buildings.clear();
            stream.read_array(value, |_, item, stream| {
                let mut building = Building::default();
                building.read_value(item, stream);
                self.buildings.push(building);
            });
        }
    }

    impl Serializable for Construction {
        fn read_methods() -> ReadMethodMap<Self> {
            &[("Buildings", Self::read_buildings)]
        }

        fn write(&self) -> Value {
            let buildings: Vec<Value> = self.buildings.iter().map(|b| b.write()).collect();
            json!({ "Buildings": buildings })
        }

        fn after_load(&mut self) {
            self.loaded = true;
        }
    }

    #[test]
    fn known_keys_are_dispatched() {
        let mut stream = Stream::new();
        let mut b = Building::default();
        b.read_value(&json!({ "Cost": 12, "Label": "mill" }), &mut stream);
        assert_eq!(b.cost, 12);
        assert_eq!(b.label, "mill");
        assert!(stream.diagnostics().is_empty());
    }

    #[test]
    fn breadcrumb_path_through_arrays() {
        let mut stream = Stream::new();
        let mut c = Construction::default();
        {
            let mut scope = stream.scope("ConstructionBehavior");
            c.read_value(
                &json!({ "Buildings": [{}, {}, {}, { "Cost": "lots" }] }),
                &mut scope,
            );
        }
        let diags = stream.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::WrongType);
        assert_eq!(diags[0].location, "ConstructionBehavior.Buildings[3].Cost");
        assert_eq!(stream.location(), "", "scopes must pop on drop");
    }

    #[test]
    fn unknown_key_warns_and_continues() {
        let mut stream = Stream::new().with_file("level1");
        let mut b = Building::default();
        b.read_value(&json!({ "Colour": "red", "Cost": 4 }), &mut stream);
        assert_eq!(b.cost, 4);
        let diags = stream.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::UnknownKey);
        assert!(diags[0].message.contains("Colour"));
        assert_eq!(diags[0].location, "level1::");
    }

    #[test]
    fn after_load_runs_once_keys_are_read() {
        let mut stream = Stream::new();
        let mut c = Construction::default();
        c.read_value(&json!({ "Buildings": [] }), &mut stream);
        assert!(c.loaded);
    }

    #[test]
    fn non_object_is_a_type_warning() {
        let mut stream = Stream::new();
        let mut b = Building::default();
        b.read_value(&json!([1, 2]), &mut stream);
        assert_eq!(stream.diagnostics()[0].kind, DiagnosticKind::WrongType);
        assert_eq!(b, Building::default());
    }

    #[test]
    fn malformed_text_is_structural() {
        let err = parse_str("{ \"Cost\": ", "broken.scene.json").unwrap_err();
        assert!(matches!(err, CesError::Json { ref path, .. } if path == "broken.scene.json"));
    }

    #[test]
    fn clipboard_round_trip_is_idempotent() {
        let source = Construction {
            buildings: vec![
                Building { cost: 3, label: "hut".into() },
                Building { cost: 9, label: "tower".into() },
            ],
            loaded: false,
        };
        let mut clipboard = MemoryClipboard::default();
        copy_to_clipboard(&source, &mut clipboard);

        let mut pasted = Construction::default();
        let mut stream = Stream::new();
        paste_from_clipboard(&mut pasted, &clipboard, &mut stream).unwrap();
        assert_eq!(pasted.buildings, source.buildings);
        assert_eq!(pasted.write(), source.write());
        assert!(stream.diagnostics().is_empty());
    }

    #[test]
    fn empty_clipboard_is_a_no_op() {
        let clipboard = MemoryClipboard::default();
        let mut b = Building { cost: 1, label: "x".into() };
        paste_from_clipboard(&mut b, &clipboard, &mut Stream::new()).unwrap();
        assert_eq!(b.cost, 1);
    }

    #[test]
    fn malformed_paste_leaves_target_untouched() {
        let mut b = Building { cost: 1, label: "x".into() };
        let result = paste_from_str(&mut b, "not json", &mut Stream::new());
        assert!(result.is_err());
        assert_eq!(b.cost, 1);
    }
}
