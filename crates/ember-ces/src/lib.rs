//! Ember CES -- the component-entity runtime of the Ember engine.
//!
//! Entities are named, hierarchical containers of components. Scenes and
//! archetypes are read from JSON into *detached* [`Entity`](entity::Entity)
//! trees, which are then handed to an [`EntitySystem`](entity_system::EntitySystem).
//! The entity system keeps every in-scene entity in a flat depth-first list
//! (parents before children), drives component lifecycles, defers additions
//! and removals to frame boundaries, and keeps component/entity references
//! from ever dangling.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use ember_ces::prelude::*;
//! use serde_json::{json, Value};
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Health(u32);
//!
//! impl Health {
//!     fn read_amount(&mut self, value: &Value, stream: &mut Stream<'_>) {
//!         stream.read_into(&mut self.0, value);
//!     }
//! }
//!
//! impl Serializable for Health {
//!     fn read_methods() -> ReadMethodMap<Self> {
//!         &[("Value", Self::read_amount)]
//!     }
//!
//!     fn write(&self) -> Value {
//!         json!({ "Value": self.0 })
//!     }
//! }
//!
//! impl Component for Health {}
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register::<Health>("Health");
//! let registry = Arc::new(registry);
//!
//! let mut stream = Stream::new().with_registry(&registry);
//! let mut ship = Entity::default();
//! ship.read_value(&json!({ "Name": "ship", "Components": { "Health": { "Value": 3 } } }), &mut stream);
//! assert!(stream.diagnostics().is_empty());
//!
//! let mut entities = EntitySystem::new(registry.clone());
//! let id = entities.add_entity(ship);
//! assert_eq!(entities.get::<Health>(id), Some(&Health(3)));
//! ```

#![deny(unsafe_code)]

pub mod arena;
pub mod asset;
pub mod command;
pub mod component;
pub mod entity;
pub mod entity_system;
pub mod inspect;
pub mod reference;
pub mod snapshot;
pub mod stream;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by entity and component operations.
///
/// Field-level problems in JSON input are not errors: they are collected as
/// [`Diagnostic`](stream::Diagnostic)s by the reading [`Stream`](stream::Stream).
#[derive(Debug, thiserror::Error)]
pub enum CesError {
    /// The entity is not in the scene (stale generation or never added).
    #[error("entity {entity} is not in the scene")]
    StaleEntity { entity: entity::EntityId },

    /// The entity is flagged for removal at the next frame boundary.
    #[error("entity {entity} is destroyed")]
    EntityDestroyed { entity: entity::EntityId },

    /// A component type was used that has not been registered.
    #[error("component type '{type_name}' is not registered")]
    UnregisteredComponent { type_name: String },

    /// The entity already has a component of this type.
    #[error("entity '{entity}' already has a '{tag}' component")]
    DuplicateComponent { entity: String, tag: String },

    /// The entity has no component of the requested type.
    #[error("entity '{entity}' has no '{tag}' component")]
    MissingComponent { entity: String, tag: String },

    /// The component is checked out for one of its own hooks.
    #[error("component '{tag}' on entity '{entity}' is running a hook")]
    ComponentBusy { entity: String, tag: String },

    /// Re-parenting would make an entity its own ancestor.
    #[error("cannot parent entity {entity} under {parent}: it would become its own ancestor")]
    ParentCycle {
        entity: entity::EntityId,
        parent: entity::EntityId,
    },

    /// Entity names used for lookup must not be empty.
    #[error("entity {entity} cannot be given an empty name")]
    EmptyName { entity: entity::EntityId },

    /// Text that should hold JSON could not be parsed at all.
    #[error("malformed JSON in '{path}': {details}")]
    Json { path: String, details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::asset::{AssetLibraries, AssetLibrary, AssetReference, AssetStore, ARCHETYPES};
    pub use crate::command::{ApplyReport, CommandBuffer};
    pub use crate::component::{
        Component, ComponentAddress, ComponentKind, ComponentMap, ComponentRegistry,
    };
    pub use crate::entity::{Entity, EntityId};
    pub use crate::entity_system::{ComponentContext, EntitySystem};
    pub use crate::inspect::InspectNode;
    pub use crate::reference::{ComponentReference, EntityReference, ReferenceEvent};
    pub use crate::snapshot::SceneSnapshot;
    pub use crate::stream::{
        copy_to_clipboard, paste_from_clipboard, Clipboard, Diagnostic, DiagnosticKind,
        MemoryClipboard, ReadMethodMap, ReadValue, Serializable, Stream,
    };
    pub use crate::CesError;
}
