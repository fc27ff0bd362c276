//! The in-scene entity store.
//!
//! [`EntitySystem`] owns every entity of the current scene. Entities are
//! kept in one flat list that is always a depth-first pre-order flattening
//! of the entity forest: every entity appears after its parent, and a
//! subtree is a contiguous run of the list. Per-frame iteration walks this
//! list, so parents are always visited before their children.
//!
//! Detached [`Entity`] trees enter the scene either immediately
//! ([`EntitySystem::add_entity`], used while loading) or at the next frame
//! boundary ([`EntitySystem::queue_add_entity`]). Removal is always
//! deferred: [`EntitySystem::destroy`] flags an entity and its descendants,
//! and [`EntitySystem::flush_queues`] takes them out.
//!
//! Component hooks run with the component checked out of its entity and a
//! [`ComponentContext`] giving access to the rest of the scene. Reference
//! events caused by a hook are delivered once the outermost operation
//! finishes.

use std::any::TypeId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::arena::Arena;
use crate::command::{ApplyReport, CommandBuffer};
use crate::component::{Component, ComponentAddress, ComponentKind, ComponentMap, ComponentRegistry};
use crate::entity::{Entity, EntityId};
use crate::inspect::InspectNode;
use crate::reference::{
    ReferenceEvent, ReferenceEventKind, ReferenceId, ReferenceSlot, ReferenceTarget,
    ScopedComponent,
};
use crate::stream::{copy_to_string, paste_from_str, Diagnostic, Stream};
use crate::CesError;

// ---------------------------------------------------------------------------
// ComponentContext
// ---------------------------------------------------------------------------

/// What a component hook can see: the whole entity system, plus the
/// address of the component being called.
pub struct ComponentContext<'a> {
    entities: &'a mut EntitySystem,
    this: ComponentAddress,
}

impl<'a> ComponentContext<'a> {
    /// The entity owning the component.
    pub fn entity(&self) -> EntityId {
        self.this.entity
    }

    /// Address of the component running the hook.
    pub fn address(&self) -> ComponentAddress {
        self.this
    }

    /// Name of the owning entity.
    pub fn entity_name(&self) -> &str {
        self.entities.name(self.this.entity).unwrap_or_default()
    }

    /// The whole scene.
    pub fn entities(&self) -> &EntitySystem {
        self.entities
    }

    /// Mutable access to the scene. The running component is checked out.
    pub fn entities_mut(&mut self) -> &mut EntitySystem {
        self.entities
    }

    /// Another component on the owning entity.
    pub fn sibling<T: Component>(&self) -> Option<&T> {
        self.entities.get::<T>(self.this.entity)
    }

    /// Mutable access to another component on the same entity.
    pub fn sibling_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.entities.get_mut::<T>(self.this.entity)
    }
}

// ---------------------------------------------------------------------------
// EntityNode
// ---------------------------------------------------------------------------

struct PlacedTree {
    root: EntityId,
    parent: Option<EntityId>,
    /// Root and descendants, in flat order.
    members: Vec<EntityId>,
}

struct EntityNode {
    serial: u32,
    name: String,
    destroyed: bool,
    parent: Option<EntityId>,
    children: Vec<EntityId>,
    descendants: usize,
    components: ComponentMap,
    incoming_entity_refs: Vec<ReferenceId>,
    incoming_component_refs: Vec<ReferenceId>,
}

impl EntityNode {
    fn new(serial: u32, name: String, parent: Option<EntityId>, components: ComponentMap) -> Self {
        Self {
            serial,
            name,
            destroyed: false,
            parent,
            children: Vec::new(),
            descendants: 0,
            components,
            incoming_entity_refs: Vec::new(),
            incoming_component_refs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntitySystem
// ---------------------------------------------------------------------------

/// Ordered store of every entity in the current scene.
pub struct EntitySystem {
    registry: Arc<ComponentRegistry>,
    nodes: Arena<EntityId, EntityNode>,
    /// Depth-first pre-order of the forest.
    order: Vec<EntityId>,
    by_serial: HashMap<u32, EntityId>,
    commands: CommandBuffer,
    last_report: ApplyReport,
    references: Arena<ReferenceId, ReferenceSlot>,
    events: VecDeque<(ComponentAddress, ReferenceEvent)>,
    /// Nesting of hook calls and batched operations; events wait for zero.
    depth: u32,
    pumping: bool,
}

impl EntitySystem {
    /// An empty scene over `registry`.
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self {
            registry,
            nodes: Arena::new(),
            order: Vec::new(),
            by_serial: HashMap::new(),
            commands: CommandBuffer::new(),
            last_report: ApplyReport::default(),
            references: Arena::new(),
            events: VecDeque::new(),
            depth: 0,
            pumping: false,
        }
    }

    /// The registry component tags resolve against.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Every in-scene entity, in flat order.
    pub fn entities(&self) -> &[EntityId] {
        &self.order
    }

    /// Number of in-scene entities, destroyed ones included until the flush.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no entity is in the scene.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether `id` is part of the scene (destroyed entities count until
    /// the frame boundary removes them).
    pub fn is_in_scene(&self, id: EntityId) -> bool {
        self.nodes.contains(id)
    }

    /// Whether `id` was reserved by [`EntitySystem::queue_add_entity`] and
    /// is waiting for the next flush.
    pub fn is_queued(&self, id: EntityId) -> bool {
        self.nodes.is_reserved(id)
    }

    /// Whether `id` is flagged for removal at the next flush.
    pub fn is_destroyed(&self, id: EntityId) -> bool {
        self.nodes.get(id).is_some_and(|node| node.destroyed)
    }

    fn is_live(&self, id: EntityId) -> bool {
        self.nodes.get(id).is_some_and(|node| !node.destroyed)
    }

    /// Name of an in-scene entity.
    pub fn name(&self, id: EntityId) -> Option<&str> {
        self.nodes.get(id).map(|node| node.name.as_str())
    }

    /// Serial number the entity carried while detached.
    pub fn serial(&self, id: EntityId) -> Option<u32> {
        self.nodes.get(id).map(|node| node.serial)
    }

    /// The in-scene entity with serial id `serial`.
    pub fn find_serial(&self, serial: u32) -> Option<EntityId> {
        self.by_serial.get(&serial).copied()
    }

    /// Parent of `id`; `None` for roots.
    pub fn parent(&self, id: EntityId) -> Option<EntityId> {
        self.nodes.get(id)?.parent
    }

    /// Direct children of `id` in order.
    pub fn children(&self, id: EntityId) -> &[EntityId] {
        self.nodes
            .get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
    }

    /// Number of entities below `id`.
    pub fn descendant_count(&self, id: EntityId) -> usize {
        self.nodes.get(id).map_or(0, |node| node.descendants)
    }

    /// First live entity named `name`, in flat order.
    pub fn get_entity(&self, name: &str) -> Option<EntityId> {
        self.order.iter().copied().find(|&id| {
            self.nodes
                .get(id)
                .is_some_and(|node| !node.destroyed && node.name == name)
        })
    }

    /// Whether `ancestor` appears on the parent chain of `id`.
    pub fn is_descended_from(&self, id: EntityId, ancestor: EntityId) -> bool {
        let mut current = self.parent(id);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent(parent);
        }
        false
    }

    fn index_of(&self, id: EntityId) -> Option<usize> {
        self.order.iter().position(|&entry| entry == id)
    }

    /// `id` followed by all its descendants, in flat order.
    fn subtree(&self, id: EntityId) -> Vec<EntityId> {
        match self.index_of(id) {
            Some(start) => {
                let end = (start + 1 + self.descendant_count(id)).min(self.order.len());
                self.order[start..end].to_vec()
            }
            None => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    /// Every component of `id`, sorted by kind.
    pub fn components(&self, id: EntityId) -> Option<&ComponentMap> {
        self.nodes.get(id).map(|node| &node.components)
    }

    /// The `T` on `id`.
    pub fn get<T: Component>(&self, id: EntityId) -> Option<&T> {
        let kind = self.registry.kind_of::<T>()?;
        self.nodes.get(id)?.components.get_as::<T>(kind)
    }

    /// Mutable access to the `T` on `id`.
    pub fn get_mut<T: Component>(&mut self, id: EntityId) -> Option<&mut T> {
        let kind = self.registry.kind_of::<T>()?;
        self.nodes.get_mut(id)?.components.get_as_mut::<T>(kind)
    }

    /// Whether `id` carries a `T`.
    pub fn has<T: Component>(&self, id: EntityId) -> bool {
        self.registry
            .kind_of::<T>()
            .and_then(|kind| self.nodes.get(id).map(|node| node.components.contains(kind)))
            .unwrap_or(false)
    }

    /// Untyped lookup by kind.
    pub fn get_kind(&self, id: EntityId, kind: ComponentKind) -> Option<&dyn Component> {
        self.nodes.get(id)?.components.get(kind)
    }

    /// Human-readable name of a component, if one was given.
    pub fn component_name(&self, id: EntityId, kind: ComponentKind) -> Option<&str> {
        self.nodes.get(id)?.components.name_of(kind)
    }

    /// Name (or, with `None`, unname) a component. Returns `false` if the
    /// entity has no component of `kind`.
    pub fn set_component_name(
        &mut self,
        id: EntityId,
        kind: ComponentKind,
        name: Option<String>,
    ) -> bool {
        self.nodes
            .get_mut(id)
            .is_some_and(|node| node.components.set_name(kind, name))
    }

    /// Mutable untyped lookup by kind.
    pub fn get_kind_mut(
        &mut self,
        id: EntityId,
        kind: ComponentKind,
    ) -> Option<&mut (dyn Component + 'static)> {
        self.nodes.get_mut(id)?.components.get_mut(kind)
    }

    /// Live entities carrying a `T`, in flat order.
    pub fn iter_with<T: Component>(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        let kind = self.registry.kind_of::<T>();
        self.order.iter().filter_map(move |&id| {
            let node = self.nodes.get(id)?;
            if node.destroyed {
                return None;
            }
            Some((id, node.components.get_as::<T>(kind?)?))
        })
    }

    /// Addresses of every component of every live entity, in flat order.
    /// With `kinds`, only components of those kinds.
    pub fn component_addresses(&self, kinds: Option<&[ComponentKind]>) -> Vec<ComponentAddress> {
        let mut out = Vec::new();
        for &entity in &self.order {
            let Some(node) = self.nodes.get(entity) else {
                continue;
            };
            if node.destroyed {
                continue;
            }
            for kind in node.components.kinds() {
                if kinds.map_or(true, |wanted| wanted.contains(&kind)) {
                    out.push(ComponentAddress { entity, kind });
                }
            }
        }
        out
    }

    /// Attach a component to an in-scene entity: runs `on_init`, then offers
    /// the component to every reference waiting on this entity.
    pub fn add_component<C: Component>(
        &mut self,
        id: EntityId,
        component: C,
    ) -> Result<ComponentKind, CesError> {
        self.add_component_boxed(id, Box::new(component))
    }

    /// Boxed form of [`EntitySystem::add_component`].
    pub fn add_component_boxed(
        &mut self,
        id: EntityId,
        component: Box<dyn Component>,
    ) -> Result<ComponentKind, CesError> {
        let entry = crate::component::ComponentEntry::new(&self.registry, component).map_err(|e| {
            warn!(error = %e, "cannot add component");
            e
        })?;
        let kind = entry.kind;
        let node = self
            .nodes
            .get_mut(id)
            .ok_or(CesError::StaleEntity { entity: id })?;
        if let Err(entry) = node.components.insert(entry) {
            warn!(entity = %node.name, tag = %entry.tag, "duplicate component ignored");
            return Err(CesError::DuplicateComponent {
                entity: node.name.clone(),
                tag: entry.tag.to_string(),
            });
        }

        let address = ComponentAddress { entity: id, kind };
        self.depth += 1;
        self.dispatch(address, |component, ctx| component.on_init(ctx));
        self.connect_waiting_references(address);
        self.depth -= 1;
        self.pump_events();
        Ok(kind)
    }

    /// Detach and drop a component: references pointing at it are nulled,
    /// then `on_exit` runs.
    ///
    /// A component cannot be removed while one of its own hooks is running.
    pub fn remove_component(&mut self, id: EntityId, kind: ComponentKind) -> Result<(), CesError> {
        let node = self.nodes.get(id).ok_or(CesError::StaleEntity { entity: id })?;
        let tag = self.registry.tag_of(kind).unwrap_or("?").to_owned();
        if !node.components.contains(kind) {
            warn!(entity = %node.name, tag = %tag, "cannot remove a component the entity does not have");
            return Err(CesError::MissingComponent {
                entity: node.name.clone(),
                tag,
            });
        }
        if node.components.is_busy(kind) {
            warn!(entity = %node.name, tag = %tag, "cannot remove a component while its hook is running");
            return Err(CesError::ComponentBusy {
                entity: node.name.clone(),
                tag,
            });
        }

        let address = ComponentAddress { entity: id, kind };
        self.depth += 1;
        self.disconnect_references_to(address);
        self.dispatch(address, |component, ctx| component.on_exit(ctx));
        self.release_owned_references(address);
        if let Some(node) = self.nodes.get_mut(id) {
            node.components.remove(kind);
        }
        self.depth -= 1;
        self.pump_events();
        Ok(())
    }

    /// Typed form of [`EntitySystem::remove_component`].
    pub fn remove<T: Component>(&mut self, id: EntityId) -> Result<(), CesError> {
        let kind = self
            .registry
            .kind_of::<T>()
            .ok_or_else(|| CesError::UnregisteredComponent {
                type_name: std::any::type_name::<T>().to_owned(),
            })?;
        self.remove_component(id, kind)
    }

    /// Run a hook on one component with the component checked out.
    ///
    /// Returns `false` if the component does not exist or is already busy.
    pub fn dispatch<F>(&mut self, address: ComponentAddress, hook: F) -> bool
    where
        F: FnOnce(&mut dyn Component, &mut ComponentContext<'_>),
    {
        let Some(node) = self.nodes.get_mut(address.entity) else {
            return false;
        };
        let Some(mut component) = node.components.take(address.kind) else {
            return false;
        };

        self.depth += 1;
        {
            let mut ctx = ComponentContext {
                entities: &mut *self,
                this: address,
            };
            hook(component.as_mut(), &mut ctx);
        }
        self.depth -= 1;

        let leftover = match self.nodes.get_mut(address.entity) {
            Some(node) => node.components.restore(address.kind, component),
            None => Some(component),
        };
        if leftover.is_some() {
            warn!(
                entity = ?address.entity,
                kind = ?address.kind,
                "component slot disappeared while its hook was running; component dropped"
            );
        }
        self.pump_events();
        true
    }

    fn dispatch_all<F>(&mut self, id: EntityId, mut hook: F)
    where
        F: FnMut(&mut dyn Component, &mut ComponentContext<'_>),
    {
        let kinds: Vec<ComponentKind> = match self.nodes.get(id) {
            Some(node) => node.components.kinds().collect(),
            None => return,
        };
        for kind in kinds {
            self.dispatch(ComponentAddress { entity: id, kind }, &mut hook);
        }
    }

    // -----------------------------------------------------------------------
    // Adding entities
    // -----------------------------------------------------------------------

    /// Add a detached tree right away.
    ///
    /// The root goes to the end of the list, or right after the last
    /// descendant of its pending parent (see [`Entity::set_parent_on_init`]);
    /// its descendants follow in pre-order. Once every node is in place,
    /// `on_init` runs on each entity's components in insertion order.
    ///
    /// Adding an entity that is already in the scene logs a warning and
    /// returns the existing id.
    pub fn add_entity(&mut self, entity: Entity) -> EntityId {
        if let Some(existing) = self.find_serial(entity.id()) {
            warn!(entity = %entity.name(), "entity is already in the scene; add ignored");
            return existing;
        }
        let id = self.nodes.reserve();
        self.insert_tree(id, entity);
        id
    }

    /// Stage a detached tree for the next frame boundary. The returned id
    /// becomes valid once the tree is added.
    pub fn queue_add_entity(&mut self, entity: Entity) -> EntityId {
        if let Some(existing) = self.find_serial(entity.id()) {
            warn!(entity = %entity.name(), "entity is already in the scene; add ignored");
            return existing;
        }
        if self.commands.contains_serial(entity.id()) {
            warn!(entity = %entity.name(), "entity is already queued; add ignored");
            if let Some(cmd) = self.commands.commands().iter().find(|cmd| {
                matches!(&cmd.kind, crate::command::CommandKind::Add(e) if e.id() == entity.id())
            }) {
                return cmd.target;
            }
        }
        let id = self.nodes.reserve();
        self.commands.add(id, entity);
        id
    }

    /// Stage removal of an in-scene entity and its descendants.
    pub fn queue_remove_entity(&mut self, id: EntityId) {
        if !self.nodes.contains(id) {
            warn!(entity = ?id, "cannot remove an entity that is not in the scene");
            return;
        }
        self.commands.remove(id);
    }

    /// Additions and removals waiting for the next flush.
    pub fn commands(&self) -> &CommandBuffer {
        &self.commands
    }

    /// Report of the most recent [`EntitySystem::flush_queues`].
    pub fn last_apply_report(&self) -> &ApplyReport {
        &self.last_report
    }

    /// Fill a reservation made by [`EntitySystem::queue_add_entity`].
    pub(crate) fn insert_reserved(&mut self, id: EntityId, entity: Entity) -> bool {
        if !self.nodes.is_reserved(id) {
            return false;
        }
        self.insert_tree(id, entity);
        true
    }

    /// Add several detached trees, then initialize them.
    ///
    /// Every tree is placed before any component's `on_init` runs, so
    /// entity references between the trees resolve regardless of order.
    /// This is how scenes are loaded.
    pub fn add_entities(&mut self, entities: impl IntoIterator<Item = Entity>) -> Vec<EntityId> {
        let mut placed = Vec::new();
        for entity in entities {
            if self.find_serial(entity.id()).is_some() {
                warn!(entity = %entity.name(), "entity is already in the scene; add ignored");
                continue;
            }
            let id = self.nodes.reserve();
            placed.push(self.place_tree(id, entity));
        }
        self.init_trees(&placed);
        placed.into_iter().map(|tree| tree.root).collect()
    }

    fn insert_tree(&mut self, root: EntityId, entity: Entity) {
        let placed = self.place_tree(root, entity);
        self.init_trees(std::slice::from_ref(&placed));
    }

    /// Link a tree into the flat list without running any hook.
    fn place_tree(&mut self, root: EntityId, entity: Entity) -> PlacedTree {
        let parent = match entity.parent_on_init() {
            Some(parent) if self.is_live(parent) => Some(parent),
            Some(parent) => {
                warn!(
                    entity = %entity.name(),
                    parent = ?parent,
                    "pending parent left the scene before init; adding as a root"
                );
                None
            }
            None => None,
        };

        let mut members = Vec::with_capacity(1 + entity.num_descendants());
        let root = self.build_nodes(root, entity, parent, &mut members);

        let position = match parent {
            Some(parent) => match self.index_of(parent) {
                Some(index) => index + 1 + self.descendant_count(parent),
                None => self.order.len(),
            },
            None => self.order.len(),
        };
        self.order.splice(position..position, members.iter().copied());
        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.push(root);
            }
            self.adjust_descendants(parent, members.len() as isize);
        }
        debug!(root = ?root, count = members.len(), "entities added to scene");
        PlacedTree {
            root,
            parent,
            members,
        }
    }

    /// `on_init` on every member in insertion order, then `on_add_child` on
    /// each tree's parent.
    fn init_trees(&mut self, trees: &[PlacedTree]) {
        self.depth += 1;
        for tree in trees {
            for &id in &tree.members {
                self.dispatch_all(id, |component, ctx| component.on_init(ctx));
            }
        }
        for tree in trees {
            if let Some(parent) = tree.parent {
                let root = tree.root;
                self.dispatch_all(parent, |component, ctx| component.on_add_child(root, ctx));
            }
        }
        self.depth -= 1;
        self.pump_events();
    }

    /// Create nodes for `entity` and its descendants, appending their ids in
    /// pre-order. Returns the id actually used for the root.
    fn build_nodes(
        &mut self,
        id: EntityId,
        entity: Entity,
        parent: Option<EntityId>,
        inserted: &mut Vec<EntityId>,
    ) -> EntityId {
        let (serial, name, components, children, _) = entity.into_parts();
        let node = EntityNode::new(serial, name, parent, components);
        let id = match self.nodes.fill(id, node) {
            Ok(()) => id,
            Err(node) => self.nodes.insert(node),
        };
        self.by_serial.insert(serial, id);
        inserted.push(id);

        let mut descendants = 0;
        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            descendants += 1 + child.num_descendants();
            let reserved = self.nodes.reserve();
            child_ids.push(self.build_nodes(reserved, child, Some(id), inserted));
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.children = child_ids;
            node.descendants = descendants;
        }
        id
    }

    fn adjust_descendants(&mut self, from: EntityId, delta: isize) {
        let mut current = Some(from);
        while let Some(id) = current {
            let Some(node) = self.nodes.get_mut(id) else {
                break;
            };
            node.descendants = node.descendants.saturating_add_signed(delta);
            current = node.parent;
        }
    }

    // -----------------------------------------------------------------------
    // Hierarchy
    // -----------------------------------------------------------------------

    /// Re-parent an in-scene entity (`None` makes it a root).
    ///
    /// The subtree moves right after the new parent's other descendants (or
    /// to the end of the list), then every component in the subtree gets
    /// `on_hierarchy_change` with the previous parent.
    pub fn set_parent(&mut self, id: EntityId, parent: Option<EntityId>) -> Result<(), CesError> {
        let node = self.nodes.get(id).ok_or(CesError::StaleEntity { entity: id })?;
        if node.destroyed {
            return Err(CesError::EntityDestroyed { entity: id });
        }
        let previous = node.parent;
        if let Some(new_parent) = parent {
            let target = self
                .nodes
                .get(new_parent)
                .ok_or(CesError::StaleEntity { entity: new_parent })?;
            if target.destroyed {
                return Err(CesError::EntityDestroyed { entity: new_parent });
            }
            if new_parent == id || self.is_descended_from(new_parent, id) {
                warn!(entity = ?id, parent = ?new_parent, "re-parenting would create a cycle");
                return Err(CesError::ParentCycle {
                    entity: id,
                    parent: new_parent,
                });
            }
        }
        if previous == parent {
            return Ok(());
        }

        let size = 1 + self.descendant_count(id) as isize;
        self.depth += 1;
        if let Some(old) = previous {
            if let Some(node) = self.nodes.get_mut(old) {
                node.children.retain(|&child| child != id);
            }
            self.adjust_descendants(old, -size);
            self.dispatch_all(old, |component, ctx| component.on_remove_child(id, ctx));
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = parent;
        }
        match parent {
            Some(new_parent) => {
                if let Some(node) = self.nodes.get_mut(new_parent) {
                    node.children.push(id);
                }
                self.adjust_descendants(new_parent, size);
                self.move_entity_after_parent(id);
                self.dispatch_all(new_parent, |component, ctx| component.on_add_child(id, ctx));
            }
            None => self.move_to_end(id),
        }
        for member in self.subtree(id) {
            self.dispatch_all(member, |component, ctx| {
                component.on_hierarchy_change(previous, ctx)
            });
        }
        self.depth -= 1;
        self.pump_events();
        Ok(())
    }

    /// Move `id` and its subtree to sit after the last descendant of its
    /// parent. The parent link must already be in place.
    pub fn move_entity_after_parent(&mut self, id: EntityId) {
        let Some(parent) = self.parent(id) else {
            self.move_to_end(id);
            return;
        };
        let Some(start) = self.index_of(id) else {
            return;
        };
        let len = 1 + self.descendant_count(id);
        let end = (start + len).min(self.order.len());
        let block: Vec<EntityId> = self.order.drain(start..end).collect();
        let Some(parent_index) = self.index_of(parent) else {
            self.order.splice(start..start, block);
            return;
        };
        let destination =
            (parent_index + 1 + self.descendant_count(parent).saturating_sub(block.len()))
                .min(self.order.len());
        self.order.splice(destination..destination, block);
    }

    /// Move a root `id` and its subtree to the end of the list.
    pub fn move_to_end(&mut self, id: EntityId) {
        if self.parent(id).is_some() {
            self.move_entity_after_parent(id);
            return;
        }
        let Some(start) = self.index_of(id) else {
            return;
        };
        let end = (start + 1 + self.descendant_count(id)).min(self.order.len());
        let block: Vec<EntityId> = self.order.drain(start..end).collect();
        self.order.extend(block);
    }

    /// Rename an entity. Entity references that resolved the old name are
    /// disconnected.
    pub fn rename(&mut self, id: EntityId, name: impl Into<String>) -> Result<(), CesError> {
        let name = name.into();
        let node = self.nodes.get_mut(id).ok_or(CesError::StaleEntity { entity: id })?;
        if name.is_empty() {
            warn!(entity = %node.name, "entities cannot have an empty name");
            return Err(CesError::EmptyName { entity: id });
        }
        if node.name == name {
            return Ok(());
        }
        node.name = name;
        let incoming = std::mem::take(&mut node.incoming_entity_refs);
        for reference in incoming {
            self.disconnect_entity_reference(reference);
        }
        self.pump_events();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Removing entities
    // -----------------------------------------------------------------------

    /// Flag `id` and all its descendants as destroyed. They stay visible
    /// (but skipped by iteration) until the next frame boundary.
    pub fn destroy(&mut self, id: EntityId) -> Result<(), CesError> {
        self.mark_destroyed(id).map_err(|e| {
            warn!(entity = ?id, "cannot destroy an entity that is not in the scene");
            e
        })
    }

    pub(crate) fn mark_destroyed(&mut self, id: EntityId) -> Result<(), CesError> {
        if !self.nodes.contains(id) {
            return Err(CesError::StaleEntity { entity: id });
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(current) {
                node.destroyed = true;
                stack.extend(node.children.iter().copied());
            }
        }
        Ok(())
    }

    /// Apply queued additions and removals. Called once per simulation
    /// frame, after every system's fixed update.
    pub fn flush_queues(&mut self) -> ApplyReport {
        let buffer = std::mem::take(&mut self.commands);
        self.depth += 1;
        let report = buffer.apply(self);
        self.depth -= 1;
        self.pump_events();
        self.last_report = report.clone();
        report
    }

    /// Exit and drop every destroyed entity. Components exit in reverse
    /// flat order.
    pub(crate) fn remove_destroyed(&mut self) -> usize {
        let doomed: Vec<EntityId> = self
            .order
            .iter()
            .copied()
            .filter(|&id| self.is_destroyed(id))
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        // Entities destroyed by the exit hooks below wait for the next flush.
        let doomed_set: HashSet<EntityId> = doomed.iter().copied().collect();
        for &id in doomed.iter().rev() {
            self.exit_entity_and_notify(id);
        }
        self.depth += 1;
        for &id in &doomed {
            let Some(parent) = self.parent(id) else {
                continue;
            };
            if doomed_set.contains(&parent) {
                continue;
            }
            let size = 1 + self.descendant_count(id) as isize;
            if let Some(node) = self.nodes.get_mut(parent) {
                node.children.retain(|&child| child != id);
            }
            self.adjust_descendants(parent, -size);
            self.dispatch_all(parent, |component, ctx| component.on_remove_child(id, ctx));
        }
        self.order.retain(|id| !doomed_set.contains(id));
        for &id in &doomed {
            if let Some(node) = self.nodes.remove(id) {
                self.by_serial.remove(&node.serial);
            }
        }
        self.depth -= 1;
        debug!(count = doomed.len(), "destroyed entities removed");
        self.pump_events();
        doomed.len()
    }

    /// Exit one entity, then hand the reference events it caused to their
    /// owners. Owners that exit later in the same teardown have already seen
    /// their targets go.
    fn exit_entity_and_notify(&mut self, id: EntityId) {
        self.depth += 1;
        self.exit_entity(id);
        self.depth -= 1;
        self.deliver_events();
    }

    /// Run `on_exit` on every component of `id` in reverse kind order and
    /// null every reference into the entity. Incoming references to a
    /// component are nulled before that component exits.
    fn exit_entity(&mut self, id: EntityId) {
        let kinds: Vec<ComponentKind> = match self.nodes.get(id) {
            Some(node) => node.components.kinds().rev().collect(),
            None => return,
        };
        for kind in kinds {
            let address = ComponentAddress { entity: id, kind };
            self.disconnect_references_to(address);
            self.dispatch(address, |component, ctx| component.on_exit(ctx));
            self.release_owned_references(address);
        }

        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let entity_refs = std::mem::take(&mut node.incoming_entity_refs);
        for reference in entity_refs {
            self.disconnect_entity_reference(reference);
        }
        let component_refs = match self.nodes.get_mut(id) {
            Some(node) => std::mem::take(&mut node.incoming_component_refs),
            None => Vec::new(),
        };
        for reference in component_refs {
            self.orphan_component_reference(reference);
        }
    }

    /// Tear down the whole scene: entities exit in reverse flat order, each
    /// one nulling the references into it and notifying their owners before
    /// the next entity exits. Then all entities, queued additions and
    /// remaining (unowned) reference slots are dropped.
    pub fn on_scene_exit(&mut self) {
        let order = self.order.clone();
        for &id in order.iter().rev() {
            self.exit_entity_and_notify(id);
        }

        let discarded = self.commands.clear().len();
        if discarded > 0 {
            debug!(count = discarded, "queued entity additions discarded at scene exit");
        }
        self.nodes.clear();
        self.order.clear();
        self.by_serial.clear();
        self.references.clear();
        self.events.clear();
    }

    // -----------------------------------------------------------------------
    // Copying out
    // -----------------------------------------------------------------------

    /// Deep copy of an in-scene subtree as a detached tree.
    pub fn clone_entity(&self, id: EntityId) -> Option<Entity> {
        let node = self.nodes.get(id)?;
        let children = node
            .children
            .iter()
            .filter_map(|&child| self.clone_entity(child))
            .collect();
        Some(Entity::from_parts(
            node.name.clone(),
            node.components.duplicate(),
            children,
        ))
    }

    /// JSON for one in-scene subtree, identical to what the detached copy
    /// would write.
    pub fn write_entity(&self, id: EntityId) -> Option<Value> {
        let node = self.nodes.get(id)?;
        let mut json = Map::new();
        json.insert("Name".into(), Value::String(node.name.clone()));
        let components: Map<String, Value> = node
            .components
            .iter()
            .map(|(tag, component)| (tag.to_owned(), component.write()))
            .collect();
        json.insert("Components".into(), Value::Object(components));
        let children: Vec<Value> = node
            .children
            .iter()
            .filter(|&&child| !self.is_destroyed(child))
            .filter_map(|&child| self.write_entity(child))
            .collect();
        if !children.is_empty() {
            json.insert("Children".into(), Value::Array(children));
        }
        Some(Value::Object(json))
    }

    /// Every live root subtree, in flat order.
    pub fn write(&self) -> Value {
        Value::Array(
            self.order
                .iter()
                .filter(|&&id| self.parent(id).is_none() && !self.is_destroyed(id))
                .filter_map(|&id| self.write_entity(id))
                .collect(),
        )
    }

    /// Inspection tree of one entity: one group per component, labelled
    /// `Tag` or `Tag "name"` for named components.
    pub fn inspect_entity(&self, id: EntityId) -> Option<InspectNode> {
        let node = self.nodes.get(id)?;
        let components = node
            .components
            .entries()
            .iter()
            .filter_map(|entry| {
                let mut tree = entry.component.as_deref()?.inspect();
                tree.label = match &entry.name {
                    Some(name) => format!("{} \"{name}\"", entry.tag),
                    None => entry.tag.to_string(),
                };
                Some(tree)
            })
            .collect();
        Some(InspectNode::group(node.name.clone(), components))
    }

    /// Clipboard text for one component.
    pub fn copy_component(&self, id: EntityId, kind: ComponentKind) -> Option<String> {
        Some(copy_to_string(self.get_kind(id, kind)?))
    }

    /// Apply clipboard text to one component. Returns the field-level
    /// diagnostics of the paste.
    pub fn paste_component(
        &mut self,
        id: EntityId,
        kind: ComponentKind,
        text: &str,
    ) -> Result<Vec<Diagnostic>, CesError> {
        let registry = Arc::clone(&self.registry);
        let tag = registry.tag_of(kind).unwrap_or("?").to_owned();
        let component = self.get_kind_mut(id, kind).ok_or_else(|| CesError::MissingComponent {
            entity: format!("{id}"),
            tag: tag.clone(),
        })?;
        let mut stream = Stream::new().with_registry(&registry);
        {
            let mut scope = stream.scope(&tag);
            paste_from_str(component, text, &mut scope)?;
        }
        Ok(stream.into_diagnostics())
    }

    // -----------------------------------------------------------------------
    // Reference table
    // -----------------------------------------------------------------------

    pub(crate) fn open_component_reference(
        &mut self,
        owner: Option<ComponentAddress>,
        label: &str,
        required: bool,
        entity: EntityId,
        type_id: TypeId,
        type_name: &str,
    ) -> Option<ReferenceId> {
        let Some(kind) = self.registry.kind_of_type_id(type_id) else {
            warn!(
                reference = %label,
                component = %type_name,
                "reference to an unregistered component type"
            );
            return None;
        };
        Some(self.open_component_slot(owner, label, required, entity, kind, None))
    }

    fn open_component_slot(
        &mut self,
        owner: Option<ComponentAddress>,
        label: &str,
        required: bool,
        entity: EntityId,
        kind: ComponentKind,
        parent: Option<ReferenceId>,
    ) -> ReferenceId {
        let present = self.nodes.get(entity).map(|node| node.components.contains(kind));
        let id = self.references.insert(ReferenceSlot {
            owner,
            label: label.to_owned(),
            required,
            connected: present == Some(true),
            parent,
            target: ReferenceTarget::Component {
                entity: present.map(|_| entity),
                kind,
            },
        });
        match present {
            Some(found) => {
                if let Some(node) = self.nodes.get_mut(entity) {
                    node.incoming_component_refs.push(id);
                }
                if found {
                    self.notify(id, ReferenceEventKind::Connected, entity);
                } else if required {
                    warn!(
                        reference = %label,
                        entity = %self.name(entity).unwrap_or_default(),
                        component = %self.registry.tag_of(kind).unwrap_or("?"),
                        "could not find referenced component"
                    );
                }
            }
            None => {
                if required {
                    warn!(reference = %label, entity = ?entity, "referenced entity is not in the scene");
                }
            }
        }
        id
    }

    pub(crate) fn open_entity_reference(
        &mut self,
        owner: Option<ComponentAddress>,
        label: &str,
        name: &str,
        scoped: &[ScopedComponent],
    ) -> ReferenceId {
        let entity = self.get_entity(name);
        let id = self.references.insert(ReferenceSlot {
            owner,
            label: label.to_owned(),
            required: true,
            connected: entity.is_some(),
            parent: None,
            target: ReferenceTarget::Entity {
                name: name.to_owned(),
                entity,
                components: Vec::new(),
            },
        });
        let Some(entity) = entity else {
            warn!(reference = %label, name = %name, "could not find referenced entity");
            return id;
        };
        if let Some(node) = self.nodes.get_mut(entity) {
            node.incoming_entity_refs.push(id);
        }
        self.notify(id, ReferenceEventKind::Connected, entity);

        let mut children = Vec::with_capacity(scoped.len());
        for wanted in scoped {
            match self.registry.kind_of_type_id(wanted.type_id) {
                Some(kind) => children.push(self.open_component_slot(
                    owner,
                    label,
                    wanted.required,
                    entity,
                    kind,
                    Some(id),
                )),
                None => warn!(
                    reference = %label,
                    component = %wanted.type_name,
                    "reference to an unregistered component type"
                ),
            }
        }
        if let Some(slot) = self.references.get_mut(id) {
            if let ReferenceTarget::Entity { components, .. } = &mut slot.target {
                *components = children;
            }
        }
        id
    }

    /// Free a slot (and any scoped component slots). No event fires.
    pub(crate) fn release_reference(&mut self, id: ReferenceId) {
        let Some(slot) = self.references.remove(id) else {
            return;
        };
        match slot.target {
            ReferenceTarget::Component { entity, .. } => {
                if let Some(node) = entity.and_then(|e| self.nodes.get_mut(e)) {
                    node.incoming_component_refs.retain(|&r| r != id);
                }
            }
            ReferenceTarget::Entity {
                entity, components, ..
            } => {
                if let Some(node) = entity.and_then(|e| self.nodes.get_mut(e)) {
                    node.incoming_entity_refs.retain(|&r| r != id);
                }
                for child in components {
                    self.release_reference(child);
                }
            }
        }
    }

    fn release_owned_references(&mut self, owner: ComponentAddress) {
        let owned: Vec<ReferenceId> = self
            .references
            .iter()
            .filter(|(_, slot)| slot.owner == Some(owner) && slot.parent.is_none())
            .map(|(id, _)| id)
            .collect();
        for id in owned {
            self.release_reference(id);
        }
    }

    pub(crate) fn resolve_component_reference(
        &self,
        id: ReferenceId,
    ) -> Option<(EntityId, ComponentKind)> {
        let slot = self.references.get(id)?;
        match slot.target {
            ReferenceTarget::Component {
                entity: Some(entity),
                kind,
            } if slot.connected => Some((entity, kind)),
            _ => None,
        }
    }

    pub(crate) fn reference_entity(&self, id: ReferenceId) -> Option<EntityId> {
        self.references.get(id)?.entity()
    }

    pub(crate) fn scoped_reference(&self, id: ReferenceId, type_id: TypeId) -> Option<ReferenceId> {
        let kind = self.registry.kind_of_type_id(type_id)?;
        let ReferenceTarget::Entity { components, .. } = &self.references.get(id)?.target else {
            return None;
        };
        components.iter().copied().find(|&child| {
            matches!(
                self.references.get(child).map(|slot| &slot.target),
                Some(ReferenceTarget::Component { kind: k, .. }) if *k == kind
            )
        })
    }

    /// Offer a freshly added component to the references waiting on its
    /// entity.
    fn connect_waiting_references(&mut self, address: ComponentAddress) {
        let incoming = match self.nodes.get(address.entity) {
            Some(node) => node.incoming_component_refs.clone(),
            None => return,
        };
        for id in incoming {
            let Some(slot) = self.references.get_mut(id) else {
                continue;
            };
            if let ReferenceTarget::Component { kind, .. } = slot.target {
                if kind == address.kind && !slot.connected {
                    slot.connected = true;
                    self.notify(id, ReferenceEventKind::Connected, address.entity);
                }
            }
        }
    }

    /// Null the references pointing at a component about to go away.
    fn disconnect_references_to(&mut self, address: ComponentAddress) {
        let incoming = match self.nodes.get(address.entity) {
            Some(node) => node.incoming_component_refs.clone(),
            None => return,
        };
        for id in incoming {
            let Some(slot) = self.references.get_mut(id) else {
                continue;
            };
            if let ReferenceTarget::Component { kind, .. } = slot.target {
                if kind == address.kind && slot.connected {
                    slot.connected = false;
                    self.notify(id, ReferenceEventKind::Disconnected, address.entity);
                }
            }
        }
    }

    /// The target entity of a component slot is leaving the scene.
    fn orphan_component_reference(&mut self, id: ReferenceId) {
        let Some(slot) = self.references.get_mut(id) else {
            return;
        };
        let was_connected = std::mem::replace(&mut slot.connected, false);
        let ReferenceTarget::Component { entity, .. } = &mut slot.target else {
            return;
        };
        let previous = entity.take();
        if let (true, Some(previous)) = (was_connected, previous) {
            self.notify(id, ReferenceEventKind::Disconnected, previous);
        }
    }

    /// The target of an entity slot was renamed or is leaving the scene:
    /// null it, then its scoped component slots.
    fn disconnect_entity_reference(&mut self, id: ReferenceId) {
        let Some(slot) = self.references.get_mut(id) else {
            return;
        };
        slot.connected = false;
        let ReferenceTarget::Entity {
            entity, components, ..
        } = &mut slot.target
        else {
            return;
        };
        let Some(previous) = entity.take() else {
            return;
        };
        let scoped = components.clone();
        self.notify(id, ReferenceEventKind::Disconnected, previous);
        for child in scoped {
            if let Some(node) = self.nodes.get_mut(previous) {
                node.incoming_component_refs.retain(|&r| r != child);
            }
            self.orphan_component_reference(child);
        }
    }

    fn notify(&mut self, id: ReferenceId, kind: ReferenceEventKind, target: EntityId) {
        let Some(slot) = self.references.get(id) else {
            return;
        };
        let (reference, component) = match (slot.parent, &slot.target) {
            (Some(parent), ReferenceTarget::Component { kind, .. }) => (parent, Some(*kind)),
            _ => (id, None),
        };
        let owner = match slot.parent {
            Some(parent) => self.references.get(parent).and_then(|p| p.owner),
            None => slot.owner,
        };
        if let Some(owner) = owner {
            self.events.push_back((
                owner,
                ReferenceEvent {
                    reference,
                    kind,
                    target,
                    component,
                },
            ));
        }
    }

    fn pump_events(&mut self) {
        if self.depth > 0 {
            return;
        }
        self.deliver_events();
    }

    /// Dispatch queued events regardless of nesting depth. Re-entrant calls
    /// return at once; the outer loop drains what they would have.
    fn deliver_events(&mut self) {
        if self.pumping {
            return;
        }
        self.pumping = true;
        while let Some((owner, event)) = self.events.pop_front() {
            self.dispatch(owner, |component, ctx| component.on_reference_event(&event, ctx));
        }
        self.pumping = false;
    }

    // -----------------------------------------------------------------------
    // Consistency
    // -----------------------------------------------------------------------

    /// Check the structural invariants: the flat list is a pre-order of the
    /// forest, descendant counts match, and reference bookkeeping is
    /// symmetric. Intended for tests and debug tooling.
    pub fn validate(&self) -> Result<(), String> {
        if self.order.len() != self.nodes.len() {
            return Err(format!(
                "flat list has {} entries but {} entities are stored",
                self.order.len(),
                self.nodes.len()
            ));
        }
        for (index, &id) in self.order.iter().enumerate() {
            let node = self.nodes.get(id).ok_or(format!("{id} in list but not stored"))?;
            if let Some(parent) = node.parent {
                let parent_index = self
                    .index_of(parent)
                    .ok_or(format!("{id} has parent {parent} outside the scene"))?;
                if parent_index >= index {
                    return Err(format!("{id} appears before its parent {parent}"));
                }
                let parent_node = self.nodes.get(parent).ok_or("missing parent")?;
                if !parent_node.children.contains(&id) {
                    return Err(format!("{parent} does not list child {id}"));
                }
            }
            let counted: usize = node
                .children
                .iter()
                .map(|&child| 1 + self.descendant_count(child))
                .sum();
            if counted != node.descendants {
                return Err(format!(
                    "{id} records {} descendants but has {counted}",
                    node.descendants
                ));
            }
            let end = index + 1 + node.descendants;
            if end > self.order.len() {
                return Err(format!("subtree of {id} runs past the end of the list"));
            }
            for &member in &self.order[index + 1..end] {
                if !self.is_descended_from(member, id) {
                    return Err(format!("{member} sits inside the subtree of {id}"));
                }
            }
            for &reference in &node.incoming_component_refs {
                match self.references.get(reference).map(|slot| slot.entity()) {
                    Some(Some(target)) if target == id => {}
                    _ => return Err(format!("{id} lists a component reference aimed elsewhere")),
                }
            }
            for &reference in &node.incoming_entity_refs {
                match self.references.get(reference).map(|slot| slot.entity()) {
                    Some(Some(target)) if target == id => {}
                    _ => return Err(format!("{id} lists an entity reference aimed elsewhere")),
                }
            }
        }
        for (reference, slot) in self.references.iter() {
            if let Some(target) = slot.entity() {
                let node = self
                    .nodes
                    .get(target)
                    .ok_or(format!("{reference:?} targets a missing entity"))?;
                let listed = match slot.target {
                    ReferenceTarget::Component { .. } => &node.incoming_component_refs,
                    ReferenceTarget::Entity { .. } => &node.incoming_entity_refs,
                };
                if !listed.contains(&reference) {
                    return Err(format!("{reference:?} is not registered on {target}"));
                }
            }
            if let ReferenceTarget::Component { entity: Some(e), kind } = slot.target {
                let present = self.nodes.get(e).is_some_and(|n| n.components.contains(kind));
                if slot.connected != present {
                    return Err(format!("{reference:?} connected flag is out of date"));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntitySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySystem")
            .field("entities", &self.order.len())
            .field("queued", &self.commands.len())
            .field("references", &self.references.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::reference::{ComponentReference, EntityReference};
    use crate::stream::{ReadMethodMap, Serializable};

    // -- test component types -----------------------------------------------

    thread_local! {
        /// Records lifecycle calls as `"<entity>:<hook>"`.
        static JOURNAL: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    fn journal_take() -> Vec<String> {
        JOURNAL.with(|journal| std::mem::take(&mut *journal.borrow_mut()))
    }

    fn record(ctx: &ComponentContext<'_>, hook: &str) {
        let line = format!("{}:{hook}", ctx.entity_name());
        JOURNAL.with(|journal| journal.borrow_mut().push(line));
    }

    #[derive(Debug, Clone, Default)]
    struct Tracker;

    impl Serializable for Tracker {
        fn read_methods() -> ReadMethodMap<Self> {
            &[]
        }

        fn write(&self) -> Value {
            json!({})
        }
    }

    impl Component for Tracker {
        fn on_init(&mut self, ctx: &mut ComponentContext<'_>) {
            record(ctx, "init");
        }

        fn on_exit(&mut self, ctx: &mut ComponentContext<'_>) {
            record(ctx, "exit");
        }

        fn on_hierarchy_change(&mut self, _previous: Option<EntityId>, ctx: &mut ComponentContext<'_>) {
            record(ctx, "hierarchy");
        }

        fn on_add_child(&mut self, _child: EntityId, ctx: &mut ComponentContext<'_>) {
            record(ctx, "add_child");
        }

        fn on_remove_child(&mut self, _child: EntityId, ctx: &mut ComponentContext<'_>) {
            record(ctx, "remove_child");
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Health(u32);

    impl Health {
        fn read_amount(&mut self, value: &Value, stream: &mut Stream<'_>) {
            stream.read_into(&mut self.0, value);
        }
    }

    impl Serializable for Health {
        fn read_methods() -> ReadMethodMap<Self> {
            &[("Value", Self::read_amount)]
        }

        fn write(&self) -> Value {
            json!({ "Value": self.0 })
        }
    }

    impl Component for Health {}

    /// Holds a reference to the `Health` on its own entity.
    #[derive(Debug, Clone, Default)]
    struct Watcher {
        health: ComponentReference<Health>,
        connects: u32,
        disconnects: u32,
    }

    impl Serializable for Watcher {
        fn read_methods() -> ReadMethodMap<Self> {
            &[]
        }

        fn write(&self) -> Value {
            json!({})
        }
    }

    impl Component for Watcher {
        fn on_init(&mut self, ctx: &mut ComponentContext<'_>) {
            let entity = ctx.entity();
            self.health.init(ctx, entity);
        }

        fn on_exit(&mut self, ctx: &mut ComponentContext<'_>) {
            self.health.exit(ctx.entities_mut());
        }

        fn on_reference_event(&mut self, event: &ReferenceEvent, _ctx: &mut ComponentContext<'_>) {
            if self.health.is(event) {
                if event.is_connect() {
                    self.connects += 1;
                } else {
                    self.disconnects += 1;
                }
            }
        }
    }

    /// Follows another entity by name.
    #[derive(Debug, Clone)]
    struct Follower {
        target: EntityReference,
        disconnects: u32,
    }

    impl Default for Follower {
        fn default() -> Self {
            Self {
                target: EntityReference::new("Target").with_component::<Health>(),
                disconnects: 0,
            }
        }
    }

    impl Serializable for Follower {
        fn read_methods() -> ReadMethodMap<Self> {
            &[]
        }

        fn write(&self) -> Value {
            json!({})
        }
    }

    impl Component for Follower {
        fn on_init(&mut self, ctx: &mut ComponentContext<'_>) {
            self.target.init(ctx);
        }

        fn on_exit(&mut self, ctx: &mut ComponentContext<'_>) {
            self.target.exit(ctx.entities_mut());
        }

        fn on_reference_event(&mut self, event: &ReferenceEvent, _ctx: &mut ComponentContext<'_>) {
            if self.target.is(event) && event.is_disconnect() && event.component.is_none() {
                self.disconnects += 1;
            }
        }
    }

    /// Watches the `Health` on its first child and follows the entity named
    /// "Target"; journals what it still sees when it exits.
    #[derive(Debug, Clone)]
    struct Guardian {
        ward: ComponentReference<Health>,
        target: EntityReference,
        disconnects: u32,
    }

    impl Default for Guardian {
        fn default() -> Self {
            let mut target = EntityReference::new("Target");
            target.set_name("Target");
            Self {
                ward: ComponentReference::optional("Ward"),
                target,
                disconnects: 0,
            }
        }
    }

    impl Serializable for Guardian {
        fn read_methods() -> ReadMethodMap<Self> {
            &[]
        }

        fn write(&self) -> Value {
            json!({})
        }
    }

    impl Component for Guardian {
        fn on_init(&mut self, ctx: &mut ComponentContext<'_>) {
            let child = ctx.entities().children(ctx.entity()).first().copied();
            if let Some(child) = child {
                self.ward.init(ctx, child);
            }
            self.target.init(ctx);
        }

        fn on_exit(&mut self, ctx: &mut ComponentContext<'_>) {
            let line = format!(
                "{}:exit ward={} target={} disconnects={}",
                ctx.entity_name(),
                self.ward.get(ctx.entities()).is_some(),
                self.target.is_connected(ctx.entities()),
                self.disconnects,
            );
            JOURNAL.with(|journal| journal.borrow_mut().push(line));
            self.ward.exit(ctx.entities_mut());
            self.target.exit(ctx.entities_mut());
        }

        fn on_reference_event(&mut self, event: &ReferenceEvent, _ctx: &mut ComponentContext<'_>) {
            if event.is_disconnect() && (self.ward.is(event) || self.target.is(event)) {
                self.disconnects += 1;
            }
        }
    }

    /// Copies its own entity from inside `on_init` and journals what the copy holds.
    #[derive(Debug, Clone, Default)]
    struct Cloner;

    impl Serializable for Cloner {
        fn read_methods() -> ReadMethodMap<Self> {
            &[]
        }

        fn write(&self) -> Value {
            json!({})
        }
    }

    impl Component for Cloner {
        fn on_init(&mut self, ctx: &mut ComponentContext<'_>) {
            let line = match ctx.entities().clone_entity(ctx.entity()) {
                Some(copy) => format!(
                    "{}:copy cloner={} health={}",
                    copy.name(),
                    copy.get::<Cloner>().is_some(),
                    copy.get::<Health>().is_some()
                ),
                None => "copy failed".to_owned(),
            };
            JOURNAL.with(|journal| journal.borrow_mut().push(line));
        }
    }

    fn setup_registry() -> Arc<ComponentRegistry> {
        let mut reg = ComponentRegistry::new();
        reg.register::<Guardian>("Guardian");
        reg.register::<Tracker>("Tracker");
        reg.register::<Health>("Health");
        reg.register::<Watcher>("Watcher");
        reg.register::<Follower>("Follower");
        reg.register::<Cloner>("Cloner");
        Arc::new(reg)
    }

    fn setup_entities() -> EntitySystem {
        EntitySystem::new(setup_registry())
    }

    fn names(entities: &EntitySystem) -> Vec<&str> {
        entities
            .entities()
            .iter()
            .map(|&id| entities.name(id).unwrap())
            .collect()
    }

    // -- ordering -------------------------------------------------------------

    #[test]
    fn add_entity_flattens_pre_order() {
        let mut entities = setup_entities();
        let tree = Entity::new("A")
            .with_child(Entity::new("B").with_child(Entity::new("C")))
            .with_child(Entity::new("D"));
        let a = entities.add_entity(tree);
        entities.add_entity(Entity::new("E"));

        assert_eq!(names(&entities), vec!["A", "B", "C", "D", "E"]);
        assert_eq!(entities.descendant_count(a), 3);
        let b = entities.get_entity("B").unwrap();
        assert_eq!(entities.parent(b), Some(a));
        assert_eq!(entities.descendant_count(b), 1);
        entities.validate().unwrap();
    }

    #[test]
    fn pending_parent_inserts_after_existing_descendants() {
        let mut entities = setup_entities();
        let a = entities.add_entity(Entity::new("A").with_child(Entity::new("A1")));
        entities.add_entity(Entity::new("Z"));

        let mut late = Entity::new("A2");
        late.set_parent_on_init(Some(a));
        let a2 = entities.add_entity(late);

        assert_eq!(names(&entities), vec!["A", "A1", "A2", "Z"]);
        assert_eq!(entities.parent(a2), Some(a));
        assert_eq!(entities.descendant_count(a), 2);
        entities.validate().unwrap();
    }

    #[test]
    fn destroyed_pending_parent_falls_back_to_root() {
        let mut entities = setup_entities();
        let a = entities.add_entity(Entity::new("A"));
        let mut child = Entity::new("child");
        child.set_parent_on_init(Some(a));
        let queued = entities.queue_add_entity(child);
        entities.destroy(a).unwrap();
        entities.flush_queues();

        assert!(entities.is_in_scene(queued));
        assert_eq!(entities.parent(queued), None);
        assert_eq!(names(&entities), vec!["child"]);
        entities.validate().unwrap();
    }

    #[test]
    fn set_parent_moves_subtree_after_parent() {
        let mut entities = setup_entities();
        let a = entities.add_entity(Entity::new("A").with_child(Entity::new("A1")));
        let b = entities.add_entity(Entity::new("B").with_child(Entity::new("B1")));
        entities.add_entity(Entity::new("C"));

        entities.set_parent(b, Some(a)).unwrap();
        assert_eq!(names(&entities), vec!["A", "A1", "B", "B1", "C"]);
        assert_eq!(entities.descendant_count(a), 3);
        assert_eq!(entities.children(a).len(), 2);
        entities.validate().unwrap();

        entities.set_parent(b, None).unwrap();
        assert_eq!(names(&entities), vec!["A", "A1", "C", "B", "B1"]);
        assert_eq!(entities.descendant_count(a), 1);
        entities.validate().unwrap();
    }

    #[test]
    fn set_parent_to_grandparent() {
        let mut entities = setup_entities();
        let a = entities.add_entity(
            Entity::new("A")
                .with_child(Entity::new("B").with_child(Entity::new("C")))
                .with_child(Entity::new("D")),
        );
        let c = entities.get_entity("C").unwrap();
        entities.set_parent(c, Some(a)).unwrap();
        assert_eq!(names(&entities), vec!["A", "B", "D", "C"]);
        assert_eq!(entities.descendant_count(a), 3);
        entities.validate().unwrap();
    }

    #[test]
    fn set_parent_rejects_cycles() {
        let mut entities = setup_entities();
        let a = entities.add_entity(Entity::new("A").with_child(Entity::new("B")));
        let b = entities.get_entity("B").unwrap();
        assert!(matches!(
            entities.set_parent(a, Some(b)),
            Err(CesError::ParentCycle { .. })
        ));
        assert!(matches!(
            entities.set_parent(a, Some(a)),
            Err(CesError::ParentCycle { .. })
        ));
        entities.validate().unwrap();
    }

    #[test]
    fn hierarchy_hooks_fire() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let a = entities.add_entity(Entity::new("A").with(&reg, Tracker));
        let b = entities.add_entity(
            Entity::new("B")
                .with(&reg, Tracker)
                .with_child(Entity::new("B1").with(&reg, Tracker)),
        );
        journal_take();

        entities.set_parent(b, Some(a)).unwrap();
        let journal = journal_take();
        assert_eq!(journal, vec!["A:add_child", "B:hierarchy", "B1:hierarchy"]);
    }

    // -- destruction ----------------------------------------------------------

    #[test]
    fn destroy_cascades_and_exits_in_reverse_order() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let keep = entities.add_entity(Entity::new("keep").with(&reg, Tracker));
        let a = entities.add_entity(
            Entity::new("A")
                .with(&reg, Tracker)
                .with_child(Entity::new("B").with(&reg, Tracker).with_child(Entity::new("C").with(&reg, Tracker)))
                .with_child(Entity::new("D").with(&reg, Tracker)),
        );
        journal_take();

        entities.destroy(a).unwrap();
        for name in ["A", "B", "C", "D"] {
            let id = entities.get_entity(name);
            assert!(id.is_none(), "destroyed entities are hidden from lookups");
        }
        assert_eq!(entities.len(), 5);

        let report = entities.flush_queues();
        assert_eq!(report.removed, 4);
        assert_eq!(journal_take(), vec!["D:exit", "C:exit", "B:exit", "A:exit"]);
        assert_eq!(entities.entities(), &[keep]);
        assert!(!entities.is_in_scene(a));
        entities.validate().unwrap();
    }

    #[test]
    fn destroying_a_child_updates_the_parent() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let a = entities.add_entity(
            Entity::new("A")
                .with(&reg, Tracker)
                .with_child(Entity::new("B").with_child(Entity::new("C"))),
        );
        let b = entities.get_entity("B").unwrap();
        journal_take();
        entities.destroy(b).unwrap();
        entities.flush_queues();
        assert_eq!(journal_take(), vec!["A:remove_child"]);
        assert_eq!(entities.descendant_count(a), 0);
        assert!(entities.children(a).is_empty());
        entities.validate().unwrap();
    }

    #[test]
    fn scene_exit_exits_everything_and_discards_queue() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        entities.add_entity(Entity::new("A").with(&reg, Tracker));
        entities.add_entity(Entity::new("B").with(&reg, Tracker));
        let queued = entities.queue_add_entity(Entity::new("Q").with(&reg, Tracker));
        journal_take();

        entities.on_scene_exit();
        assert_eq!(journal_take(), vec!["B:exit", "A:exit"]);
        assert!(entities.is_empty());
        assert!(!entities.is_queued(queued));
        entities.flush_queues();
        assert!(entities.is_empty());
    }

    #[test]
    fn scene_exit_nulls_references_into_exiting_children() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let parent = entities.add_entity(
            Entity::new("parent")
                .with(&reg, Guardian::default())
                .with_child(Entity::new("child").with(&reg, Health(4))),
        );
        let guardian = entities.get::<Guardian>(parent).unwrap();
        assert!(guardian.ward.is_connected(&entities));
        journal_take();

        entities.on_scene_exit();
        assert_eq!(
            journal_take(),
            vec!["parent:exit ward=false target=false disconnects=1"]
        );
        assert!(entities.references.is_empty());
        assert!(entities.events.is_empty());
    }

    #[test]
    fn scene_exit_disconnects_cross_entity_references_once() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let ids = entities.add_entities(vec![
            Entity::new("watcher").with(&reg, Guardian::default()),
            Entity::new("Target").with(&reg, Health(1)),
        ]);
        let guardian = entities.get::<Guardian>(ids[0]).unwrap();
        assert_eq!(guardian.target.entity(&entities), Some(ids[1]));
        journal_take();

        entities.on_scene_exit();
        assert_eq!(
            journal_take(),
            vec!["watcher:exit ward=false target=false disconnects=1"]
        );
        assert!(entities.is_empty());
        assert!(entities.references.is_empty());
    }

    #[test]
    fn destroyed_owner_hears_about_its_child_before_exiting() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let parent = entities.add_entity(
            Entity::new("parent")
                .with(&reg, Guardian::default())
                .with_child(Entity::new("child").with(&reg, Health(4))),
        );
        journal_take();

        entities.destroy(parent).unwrap();
        let report = entities.flush_queues();
        assert_eq!(report.removed, 2);
        assert_eq!(
            journal_take(),
            vec!["parent:exit ward=false target=false disconnects=1"]
        );
        entities.validate().unwrap();
        assert!(entities.references.is_empty());
    }

    // -- components -----------------------------------------------------------

    #[test]
    fn clone_inside_hook_leaves_out_the_running_component() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let e = entities.add_entity(
            Entity::new("twin")
                .with(&reg, Cloner)
                .with(&reg, Health(6)),
        );
        assert_eq!(journal_take(), vec!["twin:copy cloner=false health=true"]);

        let copy = entities.clone_entity(e).unwrap();
        assert!(copy.get::<Cloner>().is_some());
        assert_eq!(copy.get::<Health>(), Some(&Health(6)));
    }

    #[test]
    fn component_name_labels_inspector_and_survives_clone() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let e = entities.add_entity(Entity::new("hero").with(&reg, Health(3)));
        let kind = reg.kind_of::<Health>().unwrap();
        assert_eq!(entities.component_name(e, kind), None);

        assert!(entities.set_component_name(e, kind, Some("Vitality".into())));
        assert_eq!(entities.component_name(e, kind), Some("Vitality"));
        let tree = entities.inspect_entity(e).unwrap();
        assert_eq!(tree.children[0].label, "Health \"Vitality\"");

        let copy = entities.clone_entity(e).unwrap();
        assert_eq!(copy.components().name_of(kind), Some("Vitality"));
        let unnamed = reg.kind_of::<Tracker>().unwrap();
        assert!(!entities.set_component_name(e, unnamed, Some("nope".into())));
    }

    #[test]
    fn duplicate_component_is_rejected_in_scene() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let e = entities.add_entity(Entity::new("e").with(&reg, Health(5)));
        let err = entities.add_component(e, Health(9)).unwrap_err();
        assert!(matches!(err, CesError::DuplicateComponent { .. }));
        assert_eq!(entities.get::<Health>(e), Some(&Health(5)));
    }

    #[test]
    fn component_added_in_scene_is_initialized() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let e = entities.add_entity(Entity::new("e"));
        journal_take();
        entities.add_component(e, Tracker).unwrap();
        assert_eq!(journal_take(), vec!["e:init"]);
        let kind = reg.kind_of::<Tracker>().unwrap();
        entities.remove_component(e, kind).unwrap();
        assert_eq!(journal_take(), vec!["e:exit"]);
        assert!(!entities.has::<Tracker>(e));
    }

    #[test]
    fn component_reference_repairs_itself() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let e = entities.add_entity(
            Entity::new("E")
                .with(&reg, Watcher::default())
                .with(&reg, Health(10)),
        );
        let watcher = entities.get::<Watcher>(e).unwrap();
        assert_eq!((watcher.connects, watcher.disconnects), (1, 0));
        assert_eq!(watcher.health.get(&entities), Some(&Health(10)));

        entities.remove::<Health>(e).unwrap();
        let watcher = entities.get::<Watcher>(e).unwrap();
        assert_eq!((watcher.connects, watcher.disconnects), (1, 1));
        assert!(watcher.health.get(&entities).is_none());

        entities.add_component(e, Health(3)).unwrap();
        let watcher = entities.get::<Watcher>(e).unwrap();
        assert_eq!((watcher.connects, watcher.disconnects), (2, 1));
        assert_eq!(watcher.health.get(&entities), Some(&Health(3)));
        entities.validate().unwrap();
    }

    #[test]
    fn entity_reference_follows_name_until_rename() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let target = entities.add_entity(Entity::new("Target").with(&reg, Health(7)));
        let mut follower = Follower::default();
        follower.target.set_name("Target");
        let f = entities.add_entity(Entity::new("F").with(&reg, follower));

        let follower = entities.get::<Follower>(f).unwrap();
        assert_eq!(follower.target.entity(&entities), Some(target));
        assert_eq!(follower.target.component::<Health>(&entities), Some(&Health(7)));

        entities.rename(target, "Renamed").unwrap();
        let follower = entities.get::<Follower>(f).unwrap();
        assert_eq!(follower.disconnects, 1);
        assert!(follower.target.entity(&entities).is_none());
        assert!(follower.target.component::<Health>(&entities).is_none());
        entities.validate().unwrap();
    }

    #[test]
    fn batch_add_resolves_forward_references() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let mut follower = Follower::default();
        follower.target.set_name("Target");
        let ids = entities.add_entities(vec![
            Entity::new("F").with(&reg, follower),
            Entity::new("Target").with(&reg, Health(2)),
        ]);
        assert_eq!(ids.len(), 2);
        let follower = entities.get::<Follower>(ids[0]).unwrap();
        assert_eq!(follower.target.entity(&entities), Some(ids[1]));
        assert_eq!(follower.target.component::<Health>(&entities), Some(&Health(2)));
        entities.validate().unwrap();
    }

    #[test]
    fn entity_reference_nulls_when_target_destroyed() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let target = entities.add_entity(Entity::new("Target").with(&reg, Health(1)));
        let mut follower = Follower::default();
        follower.target.set_name("Target");
        let f = entities.add_entity(Entity::new("F").with(&reg, follower));

        entities.destroy(target).unwrap();
        entities.flush_queues();
        let follower = entities.get::<Follower>(f).unwrap();
        assert_eq!(follower.disconnects, 1);
        assert!(!follower.target.is_connected(&entities));
        entities.validate().unwrap();
    }

    #[test]
    fn exiting_owner_releases_its_slots() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let e = entities.add_entity(
            Entity::new("E")
                .with(&reg, Watcher::default())
                .with(&reg, Health(1)),
        );
        let kind = reg.kind_of::<Watcher>().unwrap();
        entities.remove_component(e, kind).unwrap();
        entities.validate().unwrap();
        assert!(entities.references.is_empty());
    }

    #[test]
    fn clone_entity_round_trips_through_write() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let a = entities.add_entity(
            Entity::new("A")
                .with(&reg, Health(4))
                .with_child(Entity::new("B").with(&reg, Health(2))),
        );
        let copy = entities.clone_entity(a).unwrap();
        assert_eq!(copy.write(), entities.write_entity(a).unwrap());
        let b = entities.add_entity(copy);
        assert_ne!(a, b);
        assert_eq!(entities.len(), 4);
        entities.validate().unwrap();
    }

    #[test]
    fn paste_component_applies_fields() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        let e = entities.add_entity(Entity::new("e").with(&reg, Health(1)));
        let kind = reg.kind_of::<Health>().unwrap();
        let text = entities.copy_component(e, kind).unwrap();

        entities.get_mut::<Health>(e).unwrap().0 = 50;
        let diags = entities.paste_component(e, kind, &text).unwrap();
        assert!(diags.is_empty());
        assert_eq!(entities.get::<Health>(e), Some(&Health(1)));

        let diags = entities
            .paste_component(e, kind, r#"{ "Value": 8, "Bogus": 1 }"#)
            .unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].location, "Health");
        assert_eq!(entities.get::<Health>(e), Some(&Health(8)));
    }

    #[test]
    fn iter_with_visits_in_flat_order() {
        let reg = setup_registry();
        let mut entities = EntitySystem::new(reg.clone());
        entities.add_entity(Entity::new("x").with(&reg, Health(1)));
        entities.add_entity(Entity::new("y"));
        entities.add_entity(
            Entity::new("z")
                .with(&reg, Health(3))
                .with_child(Entity::new("z1").with(&reg, Health(2))),
        );
        let values: Vec<u32> = entities.iter_with::<Health>().map(|(_, h)| h.0).collect();
        assert_eq!(values, vec![1, 3, 2]);
    }
}
