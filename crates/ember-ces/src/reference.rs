//! Self-repairing handles to components and entities.
//!
//! A [`ComponentReference<T>`] tracks "the `T` on entity E". An
//! [`EntityReference`] tracks "the entity named N", plus any number of
//! component references scoped to that entity. Neither holds a pointer:
//! each handle owns a slot in the entity system's reference table, and the
//! entity system keeps every slot in sync as components and entities come
//! and go.
//!
//! When a slot gains or loses its target, the component that owns the
//! handle receives a [`ReferenceEvent`] through
//! [`Component::on_reference_event`](crate::component::Component::on_reference_event).
//! Events are delivered after the operation that caused them completes, at
//! most once per transition.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;

use serde_json::{json, Value};

use crate::arena::ArenaKey;
use crate::component::{Component, ComponentAddress, ComponentKind};
use crate::entity::EntityId;
use crate::entity_system::{ComponentContext, EntitySystem};
use crate::stream::{ReadMethodMap, Serializable, Stream};

// ---------------------------------------------------------------------------
// ReferenceId
// ---------------------------------------------------------------------------

/// Handle of a reference-table slot. Same layout as [`EntityId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceId(u64);

impl ArenaKey for ReferenceId {
    fn from_parts(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    fn index(self) -> u32 {
        self.0 as u32
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceId({}v{})", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Direction of a reference transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceEventKind {
    /// The reference now has a target.
    Connected,
    /// The reference lost its target and reads as null.
    Disconnected,
}

/// A reference gained or lost its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEvent {
    /// The handle the owner holds (for a component scoped to an
    /// [`EntityReference`], the entity reference's id).
    pub reference: ReferenceId,
    /// Whether the target was gained or lost.
    pub kind: ReferenceEventKind,
    /// The entity the reference pointed at or now points at.
    pub target: EntityId,
    /// Set when the event concerns a component reference scoped to an
    /// entity reference.
    pub component: Option<ComponentKind>,
}

impl ReferenceEvent {
    /// Whether the reference gained its target.
    pub fn is_connect(&self) -> bool {
        self.kind == ReferenceEventKind::Connected
    }

    /// Whether the reference lost its target.
    pub fn is_disconnect(&self) -> bool {
        self.kind == ReferenceEventKind::Disconnected
    }
}

// ---------------------------------------------------------------------------
// Table slots
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum ReferenceTarget {
    Component {
        entity: Option<EntityId>,
        kind: ComponentKind,
    },
    Entity {
        name: String,
        entity: Option<EntityId>,
        components: Vec<ReferenceId>,
    },
}

#[derive(Debug)]
pub(crate) struct ReferenceSlot {
    pub(crate) owner: Option<ComponentAddress>,
    pub(crate) label: String,
    pub(crate) required: bool,
    pub(crate) connected: bool,
    /// The entity reference a scoped component slot belongs to.
    pub(crate) parent: Option<ReferenceId>,
    pub(crate) target: ReferenceTarget,
}

impl ReferenceSlot {
    pub(crate) fn entity(&self) -> Option<EntityId> {
        match &self.target {
            ReferenceTarget::Component { entity, .. } | ReferenceTarget::Entity { entity, .. } => {
                *entity
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentReference
// ---------------------------------------------------------------------------

/// Handle to the component of type `T` on one entity.
///
/// A required reference (the default) logs a warning when the component is
/// missing at init time; an optional one stays quiet. Cloning yields an
/// uninitialized handle with the same label.
pub struct ComponentReference<T: Component> {
    label: String,
    required: bool,
    slot: Option<ReferenceId>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> ComponentReference<T> {
    /// A required reference. `label` names it in warnings.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            required: true,
            slot: None,
            _marker: PhantomData,
        }
    }

    /// A reference whose target may legitimately be absent.
    pub fn optional(label: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::new(label)
        }
    }

    /// Name used in warnings.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a missing target is worth a warning.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Resolve against `entity` on behalf of the component running the
    /// current hook. Re-initializing releases the previous slot first.
    pub fn init(&mut self, ctx: &mut ComponentContext<'_>, entity: EntityId) {
        let owner = ctx.address();
        self.init_with(ctx.entities_mut(), Some(owner), entity);
    }

    /// Resolve without an owning component; no events are delivered.
    pub fn init_unowned(&mut self, entities: &mut EntitySystem, entity: EntityId) {
        self.init_with(entities, None, entity);
    }

    fn init_with(
        &mut self,
        entities: &mut EntitySystem,
        owner: Option<ComponentAddress>,
        entity: EntityId,
    ) {
        self.exit(entities);
        self.slot = entities.open_component_reference(
            owner,
            &self.label,
            self.required,
            entity,
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
        );
    }

    /// Release the slot. No event fires.
    pub fn exit(&mut self, entities: &mut EntitySystem) {
        if let Some(slot) = self.slot.take() {
            entities.release_reference(slot);
        }
    }

    /// The target component; `None` while the reference is null.
    pub fn get<'e>(&self, entities: &'e EntitySystem) -> Option<&'e T> {
        let (entity, kind) = entities.resolve_component_reference(self.slot?)?;
        entities.get_kind(entity, kind)?.as_any().downcast_ref::<T>()
    }

    /// Mutable access to the target component.
    pub fn get_mut<'e>(&self, entities: &'e mut EntitySystem) -> Option<&'e mut T> {
        let (entity, kind) = entities.resolve_component_reference(self.slot?)?;
        entities
            .get_kind_mut(entity, kind)?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// Whether [`get`](Self::get) would return a component.
    pub fn is_connected(&self, entities: &EntitySystem) -> bool {
        self.slot
            .and_then(|slot| entities.resolve_component_reference(slot))
            .is_some()
    }

    /// Entity the reference was initialized against, while it is alive.
    pub fn entity(&self, entities: &EntitySystem) -> Option<EntityId> {
        entities.reference_entity(self.slot?)
    }

    /// Table slot of this handle, while initialized.
    pub fn id(&self) -> Option<ReferenceId> {
        self.slot
    }

    /// Whether `event` concerns this handle.
    pub fn is(&self, event: &ReferenceEvent) -> bool {
        self.slot == Some(event.reference)
    }
}

impl<T: Component> Clone for ComponentReference<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            required: self.required,
            slot: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Component> Default for ComponentReference<T> {
    fn default() -> Self {
        Self::new("")
    }
}

impl<T: Component> fmt::Debug for ComponentReference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentReference")
            .field("type", &std::any::type_name::<T>())
            .field("label", &self.label)
            .field("slot", &self.slot)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EntityReference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct ScopedComponent {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) required: bool,
}

/// Handle to an entity by name, with optional component references scoped
/// to it.
///
/// Resolved by name at init. Renaming or destroying the target nulls the
/// reference (and every scoped component reference) and fires a disconnect.
/// Serialized as `{"EntityName": "..."}`.
#[derive(Debug)]
pub struct EntityReference {
    label: String,
    name: String,
    slot: Option<ReferenceId>,
    components: Vec<ScopedComponent>,
}

impl EntityReference {
    /// An unnamed entity reference. `label` names it in warnings.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            name: String::new(),
            slot: None,
            components: Vec::new(),
        }
    }

    /// Also track the `T` on the target entity.
    pub fn with_component<T: Component>(mut self) -> Self {
        self.components.push(ScopedComponent {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            required: true,
        });
        self
    }

    /// Also track the `T` on the target, without warning when it is absent.
    pub fn with_optional_component<T: Component>(mut self) -> Self {
        self.components.push(ScopedComponent {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            required: false,
        });
        self
    }

    /// Name used in warnings.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Name of the target entity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change the target name. Takes effect at the next init.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Resolve the name (and every scoped component) on behalf of the
    /// component running the current hook.
    pub fn init(&mut self, ctx: &mut ComponentContext<'_>) {
        let owner = ctx.address();
        self.init_with(ctx.entities_mut(), Some(owner));
    }

    /// Resolve without an owning component; no events are delivered.
    pub fn init_unowned(&mut self, entities: &mut EntitySystem) {
        self.init_with(entities, None);
    }

    fn init_with(&mut self, entities: &mut EntitySystem, owner: Option<ComponentAddress>) {
        self.exit(entities);
        self.slot = Some(entities.open_entity_reference(
            owner,
            &self.label,
            &self.name,
            &self.components,
        ));
    }

    /// Point at `entity` (taking its current name) and re-resolve.
    pub fn set(&mut self, ctx: &mut ComponentContext<'_>, entity: EntityId) {
        if let Some(name) = ctx.entities().name(entity) {
            self.name = name.to_owned();
            self.init(ctx);
        }
    }

    /// Release the slot and its scoped component slots. No event fires.
    pub fn exit(&mut self, entities: &mut EntitySystem) {
        if let Some(slot) = self.slot.take() {
            entities.release_reference(slot);
        }
    }

    /// The target entity, while the reference is connected.
    pub fn entity(&self, entities: &EntitySystem) -> Option<EntityId> {
        entities.reference_entity(self.slot?)
    }

    /// Whether the target entity is in the scene under the expected name.
    pub fn is_connected(&self, entities: &EntitySystem) -> bool {
        self.entity(entities).is_some()
    }

    /// The scoped `T` on the target entity.
    pub fn component<'e, T: Component>(&self, entities: &'e EntitySystem) -> Option<&'e T> {
        let scoped = entities.scoped_reference(self.slot?, TypeId::of::<T>())?;
        let (entity, kind) = entities.resolve_component_reference(scoped)?;
        entities.get_kind(entity, kind)?.as_any().downcast_ref::<T>()
    }

    /// Mutable access to the scoped `T` on the target entity.
    pub fn component_mut<'e, T: Component>(
        &self,
        entities: &'e mut EntitySystem,
    ) -> Option<&'e mut T> {
        let scoped = entities.scoped_reference(self.slot?, TypeId::of::<T>())?;
        let (entity, kind) = entities.resolve_component_reference(scoped)?;
        entities
            .get_kind_mut(entity, kind)?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// Table slot of this handle, while initialized.
    pub fn id(&self) -> Option<ReferenceId> {
        self.slot
    }

    /// Whether `event` concerns this handle or one of its scoped
    /// component references.
    pub fn is(&self, event: &ReferenceEvent) -> bool {
        self.slot == Some(event.reference)
    }

    fn read_entity_name(&mut self, value: &Value, stream: &mut Stream<'_>) {
        stream.read_into(&mut self.name, value);
    }
}

impl Clone for EntityReference {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            name: self.name.clone(),
            slot: None,
            components: self.components.clone(),
        }
    }
}

impl Serializable for EntityReference {
    fn read_methods() -> ReadMethodMap<Self> {
        &[("EntityName", Self::read_entity_name)]
    }

    fn write(&self) -> Value {
        json!({ "EntityName": self.name })
    }
}
