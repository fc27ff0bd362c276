//! The component contract and the component registry.
//!
//! A component is a typed unit of data and behavior owned by exactly one
//! entity. Concrete component types live outside this crate; they implement
//! [`Component`] (lifecycle hooks, all optional) and [`Serializable`]
//! (read table and `write`), and are registered once at startup in a
//! [`ComponentRegistry`] under the *tag* used in scene JSON.
//!
//! Registration assigns every type a dense [`ComponentKind`]. Each entity
//! stores its components in a [`ComponentMap`], a vector sorted by kind.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::entity::EntityId;
use crate::entity_system::ComponentContext;
use crate::inspect::InspectNode;
use crate::reference::ReferenceEvent;
use crate::stream::{ReadValue, Serializable};
use crate::CesError;

// ---------------------------------------------------------------------------
// ComponentKind
// ---------------------------------------------------------------------------

/// Dense identifier of a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKind(pub(crate) u32);

impl ComponentKind {
    /// Raw index.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentKind({})", self.0)
    }
}

/// Where a live component sits: its entity plus its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentAddress {
    /// Owning entity.
    pub entity: EntityId,
    /// Kind of the component at that address.
    pub kind: ComponentKind,
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Upcast helpers, implemented for every `'static` type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Boxed cloning, implemented for every `Component + Clone`.
pub trait CloneComponent {
    fn clone_box(&self) -> Box<dyn Component>;
}

impl<T: Component + Clone> CloneComponent for T {
    fn clone_box(&self) -> Box<dyn Component> {
        Box::new(self.clone())
    }
}

/// A unit of data and behavior attached to an entity.
///
/// Every hook has an empty default. `on_init` runs when the owning entity
/// enters the scene (or when the component is added to an in-scene entity);
/// `on_exit` runs exactly once for every `on_init`, when the component is
/// removed or its entity leaves the scene.
///
/// Hooks receive a [`ComponentContext`] giving mutable access to the rest
/// of the scene. While a hook runs, the component is checked out of its
/// entity, so looking itself up through the context yields `None`.
pub trait Component: Serializable + ReadValue + AsAny + CloneComponent {
    fn on_init(&mut self, _ctx: &mut ComponentContext<'_>) {}

    fn on_exit(&mut self, _ctx: &mut ComponentContext<'_>) {}

    fn on_fixed_update(&mut self, _ctx: &mut ComponentContext<'_>) {}

    fn on_update(&mut self, _dt: f32, _ctx: &mut ComponentContext<'_>) {}

    /// The owning entity (or one of its ancestors) changed parent.
    fn on_hierarchy_change(
        &mut self,
        _previous_parent: Option<EntityId>,
        _ctx: &mut ComponentContext<'_>,
    ) {
    }

    fn on_add_child(&mut self, _child: EntityId, _ctx: &mut ComponentContext<'_>) {}

    fn on_remove_child(&mut self, _child: EntityId, _ctx: &mut ComponentContext<'_>) {}

    /// A reference held by this component connected or disconnected.
    fn on_reference_event(&mut self, _event: &ReferenceEvent, _ctx: &mut ComponentContext<'_>) {}

    /// Editable-field tree for inspector front ends.
    fn inspect(&self) -> InspectNode {
        InspectNode::from_value("", &self.write())
    }
}

static NEXT_COMPONENT_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_component_id() -> u32 {
    NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Kind assigned at registration.
    pub kind: ComponentKind,
    /// The key used under `"Components"` in scene JSON.
    pub tag: Arc<str>,
    /// Rust type behind the kind.
    pub type_id: TypeId,
    /// Rust type name, for logs.
    pub type_name: &'static str,
    constructor: fn() -> Box<dyn Component>,
}

fn construct<T: Component + Default>() -> Box<dyn Component> {
    Box::new(T::default())
}

/// Tag ↔ kind ↔ constructor table.
///
/// Built once at startup, then shared immutably (usually behind an `Arc`).
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentKind>,
    by_tag: HashMap<Arc<str>, ComponentKind>,
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `tag`.
    ///
    /// Registering the same type again returns its existing kind.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is already taken by a different type.
    pub fn register<T: Component + Default>(&mut self, tag: &str) -> ComponentKind {
        let type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&type_id) {
            return existing;
        }
        if self.by_tag.contains_key(tag) {
            panic!("component tag '{tag}' is already registered for a different type");
        }

        let kind = ComponentKind(self.infos.len() as u32);
        let tag: Arc<str> = Arc::from(tag);
        self.infos.push(ComponentInfo {
            kind,
            tag: tag.clone(),
            type_id,
            type_name: std::any::type_name::<T>(),
            constructor: construct::<T>,
        });
        self.by_type.insert(type_id, kind);
        self.by_tag.insert(tag, kind);
        kind
    }

    /// Build a fresh, unattached component from its tag.
    pub fn create(&self, tag: &str) -> Option<Box<dyn Component>> {
        match self.find_tag(tag) {
            Some(kind) => Some((self.infos[kind.0 as usize].constructor)()),
            None => {
                warn!(tag = %tag, "cannot create unregistered component type");
                None
            }
        }
    }

    /// Kind registered under `tag`, warning when there is none.
    pub fn kind_of_tag(&self, tag: &str) -> Option<ComponentKind> {
        let kind = self.find_tag(tag);
        if kind.is_none() {
            warn!(tag = %tag, "unregistered component tag");
        }
        kind
    }

    /// Tag of a registered kind.
    pub fn tag_of(&self, kind: ComponentKind) -> Option<&str> {
        self.infos.get(kind.0 as usize).map(|info| &*info.tag)
    }

    /// Kind of the Rust type `T`.
    pub fn kind_of<T: 'static>(&self) -> Option<ComponentKind> {
        self.kind_of_type_id(TypeId::of::<T>())
    }

    /// Kind of the type with `type_id`.
    pub fn kind_of_type_id(&self, type_id: TypeId) -> Option<ComponentKind> {
        self.by_type.get(&type_id).copied()
    }

    /// Kind of a type-erased component value.
    pub fn kind_of_value(&self, component: &dyn Component) -> Option<ComponentKind> {
        self.kind_of_type_id(component.as_any().type_id())
    }

    /// Registration data of `kind`.
    pub fn info(&self, kind: ComponentKind) -> Option<&ComponentInfo> {
        self.infos.get(kind.0 as usize)
    }

    /// Every registered tag, sorted, for "add component" menus.
    pub fn list_types(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.infos.iter().map(|info| &*info.tag).collect();
        tags.sort_unstable();
        tags
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub(crate) fn find_tag(&self, tag: &str) -> Option<ComponentKind> {
        self.by_tag.get(tag).copied()
    }
}

// ---------------------------------------------------------------------------
// ComponentMap
// ---------------------------------------------------------------------------

pub(crate) struct ComponentEntry {
    pub(crate) kind: ComponentKind,
    pub(crate) id: u32,
    pub(crate) tag: Arc<str>,
    /// Optional human-readable label for inspectors and logs.
    pub(crate) name: Option<String>,
    /// `None` while the component is checked out for a hook call.
    pub(crate) component: Option<Box<dyn Component>>,
}

impl ComponentEntry {
    pub(crate) fn new(
        registry: &ComponentRegistry,
        component: Box<dyn Component>,
    ) -> Result<Self, CesError> {
        let kind = registry.kind_of_value(component.as_ref()).ok_or_else(|| {
            CesError::UnregisteredComponent {
                type_name: component.as_ref().type_name().to_owned(),
            }
        })?;
        Ok(Self {
            kind,
            id: next_component_id(),
            tag: registry.infos[kind.0 as usize].tag.clone(),
            name: None,
            component: Some(component),
        })
    }

    /// Copy with a fresh component id. `None` if the component is checked
    /// out.
    pub(crate) fn try_clone(&self) -> Option<Self> {
        let component = self.component.as_deref()?.clone_box();
        Some(Self {
            kind: self.kind,
            id: next_component_id(),
            tag: self.tag.clone(),
            name: self.name.clone(),
            component: Some(component),
        })
    }
}

/// Components of one entity, sorted by kind, at most one per kind.
#[derive(Default)]
pub struct ComponentMap {
    entries: Vec<ComponentEntry>,
}

impl ComponentMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, kind: ComponentKind) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&kind, |entry| entry.kind)
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the entity has no component.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a component of `kind` is present, checked out or not.
    pub fn contains(&self, kind: ComponentKind) -> bool {
        self.position(kind).is_ok()
    }

    /// The component of `kind`; `None` while it is checked out.
    pub fn get(&self, kind: ComponentKind) -> Option<&dyn Component> {
        let index = self.position(kind).ok()?;
        self.entries[index].component.as_deref()
    }

    /// Mutable access to the component of `kind`.
    pub fn get_mut(&mut self, kind: ComponentKind) -> Option<&mut (dyn Component + 'static)> {
        let index = self.position(kind).ok()?;
        self.entries[index].component.as_deref_mut()
    }

    /// Typed lookup by kind.
    pub fn get_as<T: Component>(&self, kind: ComponentKind) -> Option<&T> {
        self.get(kind)?.as_any().downcast_ref::<T>()
    }

    /// Mutable typed lookup by kind.
    pub fn get_as_mut<T: Component>(&mut self, kind: ComponentKind) -> Option<&mut T> {
        self.get_mut(kind)?.as_any_mut().downcast_mut::<T>()
    }

    /// Typed lookup without a registry, by scanning.
    pub fn find<T: Component>(&self) -> Option<&T> {
        self.entries
            .iter()
            .filter_map(|entry| entry.component.as_deref())
            .find_map(|component| component.as_any().downcast_ref::<T>())
    }

    /// Mutable typed lookup by scanning.
    pub fn find_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.component.as_deref_mut())
            .find_map(|component| component.as_any_mut().downcast_mut::<T>())
    }

    /// Kinds in ascending order.
    pub fn kinds(&self) -> impl DoubleEndedIterator<Item = ComponentKind> + '_ {
        self.entries.iter().map(|entry| entry.kind)
    }

    /// `(tag, component)` pairs in kind order, skipping checked-out slots.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Component)> {
        self.entries
            .iter()
            .filter_map(|entry| Some((&*entry.tag, entry.component.as_deref()?)))
    }

    /// Unique id of the component in the `kind` slot.
    pub fn id_of(&self, kind: ComponentKind) -> Option<u32> {
        self.position(kind).ok().map(|index| self.entries[index].id)
    }

    /// Human-readable name of the component in the `kind` slot, if set.
    pub fn name_of(&self, kind: ComponentKind) -> Option<&str> {
        let index = self.position(kind).ok()?;
        self.entries[index].name.as_deref()
    }

    /// Label the component in the `kind` slot. Returns `false` when the slot
    /// is empty.
    pub fn set_name(&mut self, kind: ComponentKind, name: Option<String>) -> bool {
        match self.position(kind) {
            Ok(index) => {
                self.entries[index].name = name;
                true
            }
            Err(_) => false,
        }
    }

    /// Whether the `kind` slot exists but its component is checked out.
    pub(crate) fn is_busy(&self, kind: ComponentKind) -> bool {
        matches!(self.position(kind), Ok(index) if self.entries[index].component.is_none())
    }

    /// Insert, handing the entry back if the kind is already present.
    pub(crate) fn insert(&mut self, entry: ComponentEntry) -> Result<(), ComponentEntry> {
        match self.position(entry.kind) {
            Ok(_) => Err(entry),
            Err(index) => {
                self.entries.insert(index, entry);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&mut self, kind: ComponentKind) -> Option<ComponentEntry> {
        let index = self.position(kind).ok()?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn take(&mut self, kind: ComponentKind) -> Option<Box<dyn Component>> {
        let index = self.position(kind).ok()?;
        self.entries[index].component.take()
    }

    /// Put a checked-out component back. Returns it if the slot is gone.
    pub(crate) fn restore(
        &mut self,
        kind: ComponentKind,
        component: Box<dyn Component>,
    ) -> Option<Box<dyn Component>> {
        match self.position(kind) {
            Ok(index) if self.entries[index].component.is_none() => {
                self.entries[index].component = Some(component);
                None
            }
            _ => Some(component),
        }
    }

    pub(crate) fn entries(&self) -> &[ComponentEntry] {
        &self.entries
    }

    /// Deep copy with fresh component ids. A component checked out for a
    /// running hook cannot be copied and is left out of the copy.
    pub(crate) fn duplicate(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .filter_map(|entry| {
                let copy = entry.try_clone();
                if copy.is_none() {
                    warn!(tag = %entry.tag, id = entry.id, "component is running a hook; left out of the copy");
                }
                copy
            })
            .collect();
        Self { entries }
    }
}

impl fmt::Debug for ComponentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &*entry.tag))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ReadMethodMap, Stream};
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Position {
        fn read_x(&mut self, value: &Value, stream: &mut Stream<'_>) {
            stream.read_into(&mut self.x, value);
        }
    }

    impl Serializable for Position {
        fn read_methods() -> ReadMethodMap<Self> {
            &[("X", Self::read_x)]
        }

        fn write(&self) -> Value {
            json!({ "X": self.x, "Y": self.y })
        }
    }

    impl Component for Position {}

    #[derive(Debug, Clone, Default)]
    struct Health(u32);

    impl Serializable for Health {
        fn read_methods() -> ReadMethodMap<Self> {
            &[]
        }

        fn write(&self) -> Value {
            json!({ "Value": self.0 })
        }
    }

    impl Component for Health {}

    fn setup_registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register::<Position>("Position");
        reg.register::<Health>("Health");
        reg
    }

    #[test]
    fn register_and_lookup() {
        let reg = setup_registry();
        let kind = reg.kind_of::<Position>().unwrap();
        assert_eq!(reg.kind_of_tag("Position"), Some(kind));
        assert_eq!(reg.tag_of(kind), Some("Position"));
        assert_eq!(reg.info(kind).unwrap().type_id, TypeId::of::<Position>());
    }

    #[test]
    fn same_type_same_kind() {
        let mut reg = ComponentRegistry::new();
        let a = reg.register::<Position>("Position");
        let b = reg.register::<Position>("PositionAgain");
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn tag_collision_panics() {
        let mut reg = ComponentRegistry::new();
        reg.register::<Position>("Thing");
        reg.register::<Health>("Thing");
    }

    #[test]
    fn create_builds_default_component() {
        let reg = setup_registry();
        let component = reg.create("Health").unwrap();
        assert_eq!(reg.kind_of_value(component.as_ref()), reg.kind_of::<Health>());
        assert_eq!(component.write(), json!({ "Value": 0 }));
    }

    #[test]
    fn unknown_tag_is_none() {
        let reg = setup_registry();
        assert!(reg.create("NoSuchThing").is_none());
        assert!(reg.kind_of_tag("NoSuchThing").is_none());
    }

    #[test]
    fn list_types_sorted() {
        let reg = setup_registry();
        assert_eq!(reg.list_types(), vec!["Health", "Position"]);
    }

    #[test]
    fn map_keeps_kind_order_and_rejects_duplicates() {
        let reg = setup_registry();
        let mut map = ComponentMap::new();
        map.insert(ComponentEntry::new(&reg, Box::new(Health(3))).unwrap())
            .ok()
            .unwrap();
        map.insert(ComponentEntry::new(&reg, Box::new(Position::default())).unwrap())
            .ok()
            .unwrap();
        let kinds: Vec<ComponentKind> = map.kinds().collect();
        let mut sorted = kinds.clone();
        sorted.sort();
        assert_eq!(kinds, sorted);

        let dup = ComponentEntry::new(&reg, Box::new(Health(9))).unwrap();
        assert!(map.insert(dup).is_err());
        assert_eq!(map.find::<Health>().unwrap().0, 3);
    }

    #[test]
    fn take_marks_slot_busy_until_restored() {
        let reg = setup_registry();
        let kind = reg.kind_of::<Position>().unwrap();
        let mut map = ComponentMap::new();
        map.insert(ComponentEntry::new(&reg, Box::new(Position::default())).unwrap())
            .ok()
            .unwrap();
        let taken = map.take(kind).unwrap();
        assert!(map.is_busy(kind));
        assert!(map.get(kind).is_none());
        assert!(map.restore(kind, taken).is_none());
        assert!(!map.is_busy(kind));
        assert!(map.get_as::<Position>(kind).is_some());
    }

    #[test]
    fn unregistered_component_is_rejected() {
        let reg = ComponentRegistry::new();
        let err = ComponentEntry::new(&reg, Box::new(Health(1))).err().unwrap();
        assert!(matches!(err, CesError::UnregisteredComponent { .. }));
    }

    #[test]
    fn duplicate_gets_fresh_ids() {
        let reg = setup_registry();
        let mut map = ComponentMap::new();
        map.insert(ComponentEntry::new(&reg, Box::new(Health(5))).unwrap())
            .ok()
            .unwrap();
        let kind = reg.kind_of::<Health>().unwrap();
        let copy = map.duplicate();
        assert_ne!(copy.id_of(kind), map.id_of(kind));
        assert_eq!(copy.find::<Health>().unwrap().0, 5);
    }
}
