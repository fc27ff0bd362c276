//! Entity handles and detached entity trees.
//!
//! An [`EntityId`] is a 64-bit handle to an entity living in an
//! [`EntitySystem`](crate::entity_system::EntitySystem). It packs a
//! *generation* counter in the high 32 bits and an *index* in the low 32
//! bits; the generation is bumped every time an index is recycled, so a
//! handle to a removed entity is detected immediately.
//!
//! An [`Entity`] is a *detached* entity: a named bag of components plus an
//! owned list of child entities, not yet part of any scene. Scenes and
//! archetypes are loaded into detached trees, which are then handed to the
//! entity system as a whole.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::arena::ArenaKey;
use crate::component::{Component, ComponentEntry, ComponentKind, ComponentMap, ComponentRegistry};
use crate::stream::{json_type_name, DiagnosticKind, ReadMethodMap, ReadValue, Serializable, Stream};
use crate::CesError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Construct an `EntityId` from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl ArenaKey for EntityId {
    fn from_parts(index: u32, generation: u32) -> Self {
        Self::new(index, generation)
    }

    fn index(self) -> u32 {
        EntityId::index(self)
    }

    fn generation(self) -> u32 {
        EntityId::generation(self)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

static NEXT_ENTITY_ID: AtomicU32 = AtomicU32::new(1);

fn next_entity_id() -> u32 {
    NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed)
}

/// A detached entity tree.
///
/// Every `Entity` value carries a process-unique serial number. Cloning
/// produces a deep copy with fresh serial numbers for the entity, its
/// components and all of its children.
pub struct Entity {
    id: u32,
    name: String,
    components: ComponentMap,
    children: Vec<Entity>,
    parent_on_init: Option<EntityId>,
}

impl Entity {
    /// A detached entity with no components or children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_entity_id(),
            name: name.into(),
            components: ComponentMap::new(),
            children: Vec::new(),
            parent_on_init: None,
        }
    }

    /// Process-unique serial number.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name used by lookups and entity references.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the detached entity.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Attach a component.
    ///
    /// Fails if the type is unregistered or the entity already has a
    /// component of the same kind; the entity is left unchanged.
    pub fn add<C: Component>(
        &mut self,
        registry: &ComponentRegistry,
        component: C,
    ) -> Result<ComponentKind, CesError> {
        self.add_boxed(registry, Box::new(component))
    }

    /// Boxed form of [`Entity::add`].
    pub fn add_boxed(
        &mut self,
        registry: &ComponentRegistry,
        component: Box<dyn Component>,
    ) -> Result<ComponentKind, CesError> {
        let entry = ComponentEntry::new(registry, component)?;
        let kind = entry.kind;
        self.components.insert(entry).map_err(|entry| {
            warn!(entity = %self.name, tag = %entry.tag, "duplicate component ignored");
            CesError::DuplicateComponent {
                entity: self.name.clone(),
                tag: entry.tag.to_string(),
            }
        })?;
        Ok(kind)
    }

    /// Builder form of [`Entity::add`]; duplicates are logged and dropped.
    pub fn with<C: Component>(mut self, registry: &ComponentRegistry, component: C) -> Self {
        let _ = self.add(registry, component);
        self
    }

    /// Detach and return the component of `kind`.
    pub fn remove(&mut self, kind: ComponentKind) -> Option<Box<dyn Component>> {
        self.components.remove(kind)?.component
    }

    /// First component of type `T`.
    pub fn get<T: Component>(&self) -> Option<&T> {
        self.components.find::<T>()
    }

    /// Mutable access to the first component of type `T`.
    pub fn get_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.components.find_mut::<T>()
    }

    /// Untyped lookup by kind.
    pub fn get_kind(&self, kind: ComponentKind) -> Option<&dyn Component> {
        self.components.get(kind)
    }

    /// Every component, sorted by kind.
    pub fn components(&self) -> &ComponentMap {
        &self.components
    }

    /// Give the component of `kind` a human-readable name. Returns `false`
    /// if the entity has no such component.
    pub fn set_component_name(&mut self, kind: ComponentKind, name: impl Into<String>) -> bool {
        self.components.set_name(kind, Some(name.into()))
    }

    pub(crate) fn components_mut(&mut self) -> &mut ComponentMap {
        &mut self.components
    }

    /// Parent `child` under this entity, as its last child.
    pub fn add_child(&mut self, child: Entity) {
        self.children.push(child);
    }

    /// Builder form of [`Entity::add_child`].
    pub fn with_child(mut self, child: Entity) -> Self {
        self.add_child(child);
        self
    }

    /// Direct children in order.
    pub fn children(&self) -> &[Entity] {
        &self.children
    }

    /// Mutable access to the direct children.
    pub fn children_mut(&mut self) -> &mut [Entity] {
        &mut self.children
    }

    /// Total number of entities below this one.
    pub fn num_descendants(&self) -> usize {
        self.children
            .iter()
            .map(|child| 1 + child.num_descendants())
            .sum()
    }

    /// Parent this entity under an in-scene entity once it is added.
    pub fn set_parent_on_init(&mut self, parent: Option<EntityId>) {
        self.parent_on_init = parent;
    }

    /// Parent recorded by [`Entity::set_parent_on_init`].
    pub fn parent_on_init(&self) -> Option<EntityId> {
        self.parent_on_init
    }

    pub(crate) fn into_parts(self) -> (u32, String, ComponentMap, Vec<Entity>, Option<EntityId>) {
        (
            self.id,
            self.name,
            self.components,
            self.children,
            self.parent_on_init,
        )
    }

    pub(crate) fn from_parts(name: String, components: ComponentMap, children: Vec<Entity>) -> Self {
        Self {
            id: next_entity_id(),
            name,
            components,
            children,
            parent_on_init: None,
        }
    }

    // -- readers --------------------------------------------------------------

    fn read_name(&mut self, value: &Value, stream: &mut Stream<'_>) {
        stream.read_into(&mut self.name, value);
    }

    // Resolved in `before_load`.
    fn read_archetype(&mut self, _value: &Value, _stream: &mut Stream<'_>) {}

    fn read_components(&mut self, value: &Value, stream: &mut Stream<'_>) {
        let Some(object) = value.as_object() else {
            stream.warn(
                DiagnosticKind::WrongType,
                format!("expected an object of components, found {}", json_type_name(value)),
            );
            return;
        };
        let Some(registry) = stream.registry() else {
            stream.warn(
                DiagnosticKind::UnknownComponent,
                "no component registry available to read components",
            );
            return;
        };
        for (tag, data) in object {
            let Some(kind) = registry.find_tag(tag) else {
                stream.warn(
                    DiagnosticKind::UnknownComponent,
                    format!("unknown component type \"{tag}\""),
                );
                continue;
            };
            let mut scope = stream.scope(tag);
            if let Some(existing) = self.components.get_mut(kind) {
                existing.read_value(data, &mut scope);
                continue;
            }
            if let Some(mut component) = registry.create(tag) {
                component.read_value(data, &mut scope);
                if let Ok(entry) = ComponentEntry::new(registry, component) {
                    let _ = self.components.insert(entry);
                }
            }
        }
    }

    /// Replaces any children, including ones cloned from an archetype.
    fn read_children(&mut self, value: &Value, stream: &mut Stream<'_>) {
        self.children.clear();
        stream.read_array(value, |_, item, stream| {
            let mut child = Entity::default();
            child.read_value(item, stream);
            self.children.push(child);
        });
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new("")
    }
}

impl Clone for Entity {
    fn clone(&self) -> Self {
        Self {
            id: next_entity_id(),
            name: self.name.clone(),
            components: self.components.duplicate(),
            children: self.children.clone(),
            parent_on_init: None,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("components", &self.components)
            .field("children", &self.children)
            .finish()
    }
}

impl Serializable for Entity {
    fn read_methods() -> ReadMethodMap<Self> {
        &[
            ("Archetype", Self::read_archetype),
            ("Name", Self::read_name),
            ("Components", Self::read_components),
            ("Children", Self::read_children),
        ]
    }

    /// Resolve `"Archetype"` first so the remaining keys act as overrides,
    /// wherever the key appears in the object.
    fn before_load(&mut self, value: &Value, stream: &mut Stream<'_>) {
        let Some(archetype) = value.get("Archetype") else {
            return;
        };
        let mut scope = stream.scope("Archetype");
        let Some(name) = archetype.as_str() else {
            scope.warn(
                DiagnosticKind::WrongType,
                format!("expected an archetype name, found {}", json_type_name(archetype)),
            );
            return;
        };
        match scope.archetypes().and_then(|library| library.get(name)) {
            Some(prototype) => {
                let parent_on_init = self.parent_on_init;
                *self = prototype.clone();
                self.parent_on_init = parent_on_init;
            }
            None => scope.warn(
                DiagnosticKind::MissingAsset,
                format!("unknown archetype \"{name}\""),
            ),
        }
    }

    fn write(&self) -> Value {
        let mut json = Map::new();
        json.insert("Name".into(), Value::String(self.name.clone()));
        let components: Map<String, Value> = self
            .components
            .iter()
            .map(|(tag, component)| (tag.to_owned(), component.write()))
            .collect();
        json.insert("Components".into(), Value::Object(components));
        if !self.children.is_empty() {
            json.insert(
                "Children".into(),
                Value::Array(self.children.iter().map(Entity::write).collect()),
            );
        }
        Value::Object(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetLibrary;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Transform {
        translation: [f32; 2],
        scale: f32,
    }

    impl Transform {
        fn read_translation(&mut self, value: &Value, stream: &mut Stream<'_>) {
            stream.read_into(&mut self.translation, value);
        }

        fn read_scale(&mut self, value: &Value, stream: &mut Stream<'_>) {
            stream.read_into(&mut self.scale, value);
        }
    }

    impl Serializable for Transform {
        fn read_methods() -> ReadMethodMap<Self> {
            &[("Translation", Self::read_translation), ("Scale", Self::read_scale)]
        }

        fn write(&self) -> Value {
            json!({ "Translation": self.translation, "Scale": self.scale })
        }
    }

    impl Component for Transform {}

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Gun {
        damage: u32,
    }

    impl Gun {
        fn read_damage(&mut self, value: &Value, stream: &mut Stream<'_>) {
            stream.read_into(&mut self.damage, value);
        }
    }

    impl Serializable for Gun {
        fn read_methods() -> ReadMethodMap<Self> {
            &[("Damage", Self::read_damage)]
        }

        fn write(&self) -> Value {
            json!({ "Damage": self.damage })
        }
    }

    impl Component for Gun {}

    fn setup_registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register::<Transform>("Transform");
        reg.register::<Gun>("Gun");
        reg
    }

    #[test]
    fn entity_id_roundtrip() {
        let id = EntityId::new(42, 7);
        assert_eq!(id.index(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
    }

    #[test]
    fn serial_ids_are_unique() {
        let a = Entity::new("a");
        let b = Entity::new("b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn duplicate_component_is_rejected() {
        let reg = setup_registry();
        let mut e = Entity::new("e");
        e.add(&reg, Gun { damage: 1 }).unwrap();
        let err = e.add(&reg, Gun { damage: 2 }).unwrap_err();
        assert!(matches!(err, CesError::DuplicateComponent { .. }));
        assert_eq!(e.get::<Gun>().unwrap().damage, 1);
    }

    #[test]
    fn clone_is_deep_with_fresh_ids() {
        let reg = setup_registry();
        let child = Entity::new("child").with(&reg, Gun { damage: 4 });
        let parent = Entity::new("parent")
            .with(&reg, Transform::default())
            .with_child(child);
        let mut copy = parent.clone();
        assert_ne!(copy.id(), parent.id());
        assert_ne!(copy.children()[0].id(), parent.children()[0].id());
        assert_eq!(copy.name(), "parent");
        assert_eq!(copy.num_descendants(), 1);

        copy.children_mut()[0].get_mut::<Gun>().unwrap().damage = 9;
        assert_eq!(parent.children()[0].get::<Gun>().unwrap().damage, 4);
    }

    #[test]
    fn write_then_read_is_idempotent() {
        let reg = setup_registry();
        let source = Entity::new("tower")
            .with(&reg, Transform { translation: [1.0, 2.0], scale: 1.0 })
            .with_child(Entity::new("barrel").with(&reg, Gun { damage: 3 }));
        let written = source.write();

        let mut stream = Stream::new().with_registry(&reg);
        let mut loaded = Entity::default();
        loaded.read_value(&written, &mut stream);
        assert!(stream.diagnostics().is_empty());
        assert_eq!(loaded.write(), written);
    }

    #[test]
    fn unknown_component_tag_warns_once_at_entity_path() {
        let reg = setup_registry();
        let mut stream = Stream::new().with_registry(&reg).with_file("level");
        let mut e = Entity::default();
        {
            let mut scope = stream.scope("Entities");
            let mut scope = scope.scope_index(0);
            e.read_value(
                &json!({ "Name": "crate", "Components": { "NoSuchThing": {}, "Gun": {} } }),
                &mut scope,
            );
        }
        let diags = stream.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::UnknownComponent);
        assert!(diags[0].message.contains("NoSuchThing"));
        assert_eq!(diags[0].location, "level::Entities[0].Components");
        assert_eq!(e.name(), "crate");
        assert!(e.get::<Gun>().is_some());
    }

    #[test]
    fn archetype_overrides_merge_into_prototype() {
        let reg = setup_registry();
        let mut archetypes = AssetLibrary::<Entity>::new("Archetypes");
        archetypes.add(
            "Turret",
            Entity::new("Turret")
                .with(&reg, Transform { translation: [0.0, 0.0], scale: 2.0 })
                .with(&reg, Gun { damage: 7 }),
        );

        let mut stream = Stream::new().with_registry(&reg).with_archetypes(&archetypes);
        let mut e = Entity::default();
        e.read_value(
            &json!({ "Components": { "Transform": { "Translation": [3, 4] } }, "Archetype": "Turret" }),
            &mut stream,
        );
        assert!(stream.diagnostics().is_empty());
        assert_eq!(e.name(), "Turret");
        let t = e.get::<Transform>().unwrap();
        assert_eq!(t.translation, [3.0, 4.0]);
        assert_eq!(t.scale, 2.0);
        assert_eq!(e.get::<Gun>().unwrap().damage, 7);
        assert_eq!(archetypes.get("Turret").unwrap().get::<Transform>().unwrap().translation, [0.0, 0.0]);
    }

    #[test]
    fn children_override_replaces_archetype_children() {
        let reg = setup_registry();
        let mut archetypes = AssetLibrary::<Entity>::new("Archetypes");
        archetypes.add(
            "Tank",
            Entity::new("Tank")
                .with_child(Entity::new("barrel"))
                .with_child(Entity::new("tread")),
        );

        let mut stream = Stream::new().with_registry(&reg).with_archetypes(&archetypes);
        let mut plain = Entity::default();
        plain.read_value(&json!({ "Archetype": "Tank" }), &mut stream);
        let names: Vec<&str> = plain.children().iter().map(Entity::name).collect();
        assert_eq!(names, ["barrel", "tread"]);

        let mut custom = Entity::default();
        custom.read_value(
            &json!({ "Archetype": "Tank", "Children": [{ "Name": "cannon" }] }),
            &mut stream,
        );
        assert!(stream.diagnostics().is_empty());
        let names: Vec<&str> = custom.children().iter().map(Entity::name).collect();
        assert_eq!(names, ["cannon"]);
    }

    #[test]
    fn unresolved_archetype_yields_empty_entity() {
        let reg = setup_registry();
        let archetypes = AssetLibrary::<Entity>::new("Archetypes");
        let mut stream = Stream::new().with_registry(&reg).with_archetypes(&archetypes);
        let mut e = Entity::default();
        e.read_value(&json!({ "Archetype": "Ghost" }), &mut stream);
        let diags = stream.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::MissingAsset);
        assert!(e.components().is_empty());
    }
}
