//! Named asset libraries.
//!
//! An [`AssetLibrary<T>`] maps names to owned assets of one type. Scenes
//! fill libraries from their `"Assets"` block before any entity is read, and
//! every library is flushed when the scene exits. The archetype library
//! (`AssetLibrary<Entity>` under the key `"Archetypes"`) is what the
//! `"Archetype"` key of entity JSON resolves against.
//!
//! Components point at assets through an [`AssetReference<T>`], which is
//! serialized as the asset's name and goes null when its library is flushed.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::entity::Entity;
use crate::stream::{
    json_type_name, DiagnosticKind, ReadMethodMap, ReadValue, Serializable, Stream,
};

/// Key of the built-in archetype library.
pub const ARCHETYPES: &str = "Archetypes";

// ---------------------------------------------------------------------------
// AssetLibrary
// ---------------------------------------------------------------------------

/// Name → asset store for one asset type.
#[derive(Debug)]
pub struct AssetLibrary<T> {
    key: String,
    assets: BTreeMap<String, T>,
    /// Bumped by every flush; asset references resolved in an older epoch
    /// read as null.
    epoch: u64,
}

impl<T> AssetLibrary<T> {
    /// An empty library loaded from `key` in scene JSON.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            assets: BTreeMap::new(),
            epoch: 0,
        }
    }

    /// The key this library is loaded from in scene JSON.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The asset stored under `name`.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.assets.get(name)
    }

    /// Reverse lookup by identity: the name under which exactly this asset
    /// (not an equal copy) is stored.
    pub fn name_of(&self, asset: &T) -> Option<&str> {
        self.assets
            .iter()
            .find(|(_, stored)| std::ptr::eq(*stored, asset))
            .map(|(name, _)| name.as_str())
    }

    /// Store `asset` under `name`. A name already in use keeps its first
    /// asset; the new one is dropped with a warning.
    pub fn add(&mut self, name: impl Into<String>, asset: T) -> bool {
        let name = name.into();
        if self.assets.contains_key(&name) {
            warn!(library = %self.key, asset = %name, "duplicate asset name; keeping the first");
            return false;
        }
        self.assets.insert(name, asset);
        true
    }

    /// Drop every asset and invalidate every reference resolved so far.
    pub fn flush(&mut self) {
        self.assets.clear();
        self.epoch += 1;
    }

    /// Number of flushes so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of stored assets.
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// Whether the library holds no asset.
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Asset names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }
}

impl<T: Serializable + Default> AssetLibrary<T> {
    /// Read a `{name: assetJson}` object into the library.
    pub fn load_assets(&mut self, value: &Value, stream: &mut Stream<'_>) {
        let Some(object) = value.as_object() else {
            stream.warn(
                DiagnosticKind::WrongType,
                format!("expected an object of assets, found {}", json_type_name(value)),
            );
            return;
        };
        for (name, data) in object {
            let mut scope = stream.scope(name);
            if self.assets.contains_key(name) {
                scope.warn(DiagnosticKind::Duplicate, format!("duplicate asset \"{name}\""));
                continue;
            }
            let mut asset = T::default();
            asset.read_value(data, &mut scope);
            self.assets.insert(name.clone(), asset);
        }
    }

    /// Every asset as a `{name: assetJson}` object, sorted by name.
    pub fn save_assets(&self) -> Value {
        Value::Object(
            self.assets
                .iter()
                .map(|(name, asset)| (name.clone(), asset.write()))
                .collect::<Map<String, Value>>(),
        )
    }
}

// ---------------------------------------------------------------------------
// AssetStore
// ---------------------------------------------------------------------------

/// Type-erased view of a library, so a scene can hold libraries of many
/// asset types under their keys.
pub trait AssetStore: Any {
    fn key(&self) -> &str;
    fn load(&mut self, value: &Value, stream: &mut Stream<'_>);
    fn save(&self) -> Value;
    fn flush(&mut self);
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Serializable + Default> AssetStore for AssetLibrary<T> {
    fn key(&self) -> &str {
        AssetLibrary::key(self)
    }

    fn load(&mut self, value: &Value, stream: &mut Stream<'_>) {
        self.load_assets(value, stream);
    }

    fn save(&self) -> Value {
        self.save_assets()
    }

    fn flush(&mut self) {
        AssetLibrary::flush(self);
    }

    fn len(&self) -> usize {
        AssetLibrary::len(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// AssetLibraries
// ---------------------------------------------------------------------------

/// Every asset library of a scene, keyed and kept in registration order.
///
/// The archetype library is always present.
pub struct AssetLibraries {
    libraries: Vec<Box<dyn AssetStore>>,
}

impl Default for AssetLibraries {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetLibraries {
    /// Just the (empty) archetype library.
    pub fn new() -> Self {
        Self {
            libraries: vec![Box::new(AssetLibrary::<Entity>::new(ARCHETYPES))],
        }
    }

    /// Add a library for `T` under `key`. Registering an existing key is a
    /// no-op that returns `false`.
    pub fn register<T: Serializable + Default>(&mut self, key: &str) -> bool {
        if self.position(key).is_some() {
            warn!(library = %key, "asset library is already registered");
            return false;
        }
        self.libraries.push(Box::new(AssetLibrary::<T>::new(key)));
        true
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.libraries.iter().position(|library| library.key() == key)
    }

    /// The library under `key`, if it stores `T`.
    pub fn get<T: Serializable + Default>(&self, key: &str) -> Option<&AssetLibrary<T>> {
        self.libraries[self.position(key)?]
            .as_any()
            .downcast_ref::<AssetLibrary<T>>()
    }

    /// Mutable access to the library under `key`, if it stores `T`.
    pub fn get_mut<T: Serializable + Default>(&mut self, key: &str) -> Option<&mut AssetLibrary<T>> {
        let index = self.position(key)?;
        self.libraries[index]
            .as_any_mut()
            .downcast_mut::<AssetLibrary<T>>()
    }

    /// The built-in archetype library.
    pub fn archetypes(&self) -> Option<&AssetLibrary<Entity>> {
        self.get::<Entity>(ARCHETYPES)
    }

    /// Mutable access to the archetype library.
    pub fn archetypes_mut(&mut self) -> Option<&mut AssetLibrary<Entity>> {
        self.get_mut::<Entity>(ARCHETYPES)
    }

    /// Read a scene's `"Assets"` block: `{key: {name: assetJson}}`.
    ///
    /// Archetypes are read first so other libraries' entities can use them.
    pub fn load(&mut self, value: &Value, stream: &mut Stream<'_>) {
        let Some(object) = value.as_object() else {
            stream.warn(
                DiagnosticKind::WrongType,
                format!("expected an object of asset libraries, found {}", json_type_name(value)),
            );
            return;
        };
        if let Some(archetypes) = object.get(ARCHETYPES) {
            if let Some(library) = self.archetypes_mut() {
                let mut scope = stream.scope(ARCHETYPES);
                library.load_assets(archetypes, &mut scope);
            }
        }
        for (key, block) in object {
            if key == ARCHETYPES {
                continue;
            }
            let mut scope = stream.scope(key);
            match self.position(key) {
                Some(index) => self.libraries[index].load(block, &mut scope),
                None => scope.warn(
                    DiagnosticKind::UnknownKey,
                    format!("no asset library registered under \"{key}\""),
                ),
            }
        }
    }

    /// `{key: {name: assetJson}}` for every non-empty library.
    pub fn save(&self) -> Value {
        Value::Object(
            self.libraries
                .iter()
                .filter(|library| library.len() > 0)
                .map(|library| (library.key().to_owned(), library.save()))
                .collect::<Map<String, Value>>(),
        )
    }

    /// Empty every library (scene exit).
    pub fn flush_all(&mut self) {
        for library in &mut self.libraries {
            library.flush();
        }
    }

    /// Keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.libraries.iter().map(|library| library.key())
    }
}

impl std::fmt::Debug for AssetLibraries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.libraries.iter().map(|library| (library.key(), library.len())))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AssetReference
// ---------------------------------------------------------------------------

/// Serializable handle to a named asset in one library.
///
/// Written as `{"Name": "..."}`. The handle resolves at
/// [`init`](Self::init) and stays valid until its library is flushed; after
/// that it reads as null until initialized again. Cloning keeps both the
/// name and the resolution.
pub struct AssetReference<T> {
    library: String,
    name: String,
    /// Entity or component name shown in warnings.
    owner: String,
    /// Library epoch at the last successful init.
    resolved: Option<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serializable + Default> AssetReference<T> {
    /// An unnamed reference into the library registered under `library`.
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            name: String::new(),
            owner: String::new(),
            resolved: None,
            _marker: PhantomData,
        }
    }

    /// A reference to asset `name`, not yet resolved.
    pub fn named(library: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new(library)
        }
    }

    /// Key of the library this reference resolves against.
    pub fn library(&self) -> &str {
        &self.library
    }

    /// Name of the referenced asset; empty after [`clear`](Self::clear).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Point at another asset. Takes effect at the next init.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.resolved = None;
    }

    /// Name of the holder, shown in warnings.
    pub fn set_owner_name(&mut self, owner: impl Into<String>) {
        self.owner = owner.into();
    }

    /// Look the asset up in `assets`. A required reference logs a warning
    /// when the library or the asset is missing; either way the reference
    /// is null afterwards. Returns whether the asset was found.
    pub fn init(&mut self, assets: &AssetLibraries, required: bool) -> bool {
        self.resolved = None;
        let Some(library) = assets.get::<T>(&self.library) else {
            if required {
                warn!(
                    library = %self.library,
                    asset = %self.name,
                    owner = %self.owner,
                    "no asset library of this type is registered"
                );
            }
            return false;
        };
        if library.get(&self.name).is_none() {
            if required {
                warn!(
                    library = %self.library,
                    asset = %self.name,
                    owner = %self.owner,
                    "could not find asset"
                );
            }
            return false;
        }
        self.resolved = Some(library.epoch());
        true
    }

    /// Forget the asset and its name.
    pub fn clear(&mut self) {
        self.name.clear();
        self.resolved = None;
    }

    /// The asset, while the resolution is current.
    pub fn get<'a>(&self, assets: &'a AssetLibraries) -> Option<&'a T> {
        let epoch = self.resolved?;
        let library = assets.get::<T>(&self.library)?;
        if library.epoch() != epoch {
            return None;
        }
        library.get(&self.name)
    }

    /// Whether [`get`](Self::get) would return an asset.
    pub fn is_resolved(&self, assets: &AssetLibraries) -> bool {
        self.get(assets).is_some()
    }

    fn read_name(&mut self, value: &Value, stream: &mut Stream<'_>) {
        if stream.read_into(&mut self.name, value) {
            self.resolved = None;
        }
    }
}

impl<T: Serializable + Default> Serializable for AssetReference<T> {
    fn read_methods() -> ReadMethodMap<Self> {
        &[("Name", Self::read_name)]
    }

    fn write(&self) -> Value {
        json!({ "Name": self.name })
    }
}

impl<T> Clone for AssetReference<T> {
    fn clone(&self) -> Self {
        Self {
            library: self.library.clone(),
            name: self.name.clone(),
            owner: self.owner.clone(),
            resolved: self.resolved,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AssetReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetReference")
            .field("type", &std::any::type_name::<T>())
            .field("library", &self.library)
            .field("name", &self.name)
            .field("resolved", &self.resolved.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
