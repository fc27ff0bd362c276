//! Deferred entity additions and removals.
//!
//! Systems and components that add or remove entities in the middle of a
//! simulation frame do so through the [`CommandBuffer`] owned by the
//! [`EntitySystem`]. Commands are applied in FIFO order at the frame
//! boundary by [`EntitySystem::flush_queues`], so every participant sees the
//! same entity set for the whole frame.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ember_ces::prelude::*;
//!
//! let mut entities = EntitySystem::new(Arc::new(ComponentRegistry::new()));
//! let ship = entities.queue_add_entity(Entity::new("ship"));
//! assert!(!entities.is_in_scene(ship));
//!
//! let report = entities.flush_queues();
//! assert_eq!(report.added, 1);
//! assert!(entities.is_in_scene(ship));
//! ```

use std::collections::HashMap;

use tracing::warn;

use crate::entity::{Entity, EntityId};
use crate::entity_system::EntitySystem;

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

/// The mutation a [`Command`] performs.
#[derive(Debug)]
pub enum CommandKind {
    /// Add a detached tree under an id reserved when the command was queued.
    Add(Entity),
    /// Destroy an in-scene entity and its descendants.
    Remove,
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A single deferred mutation.
#[derive(Debug)]
pub struct Command {
    /// The entity this command targets. For adds, the reserved root id.
    pub target: EntityId,
    /// What to do to the target.
    pub kind: CommandKind,
    /// Sequential index within the buffer (set on insertion).
    pub command_index: u32,
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of one frame-boundary flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Root entities added from the queue.
    pub added: usize,
    /// Entities removed (every destroyed entity, queued or not).
    pub removed: usize,
    /// Commands that could not be applied (stale targets).
    pub failed: usize,
    /// Entities targeted by more than one remove command.
    pub conflict_count: usize,
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// FIFO queue of entity additions and removals.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    next_index: u32,
}

impl CommandBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an addition under an already reserved id.
    pub fn add(&mut self, target: EntityId, entity: Entity) {
        self.push(target, CommandKind::Add(entity));
    }

    /// Queue a removal.
    pub fn remove(&mut self, target: EntityId) {
        self.push(target, CommandKind::Remove);
    }

    /// Queued commands in insertion order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command is pending.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Whether an addition of a detached entity with serial `id` is queued.
    pub fn contains_serial(&self, id: u32) -> bool {
        self.commands
            .iter()
            .any(|cmd| matches!(&cmd.kind, CommandKind::Add(entity) if entity.id() == id))
    }

    /// Apply every command: removals first, then additions, each group in
    /// insertion order. Commands queued while applying land in the
    /// entity system's fresh buffer and wait for the next flush.
    pub fn apply(mut self, entities: &mut EntitySystem) -> ApplyReport {
        let commands = std::mem::take(&mut self.commands);
        let mut report = ApplyReport::default();

        // --- Conflict detection ---
        let mut seen: HashMap<EntityId, Vec<u32>> = HashMap::new();
        for cmd in &commands {
            if matches!(cmd.kind, CommandKind::Remove) {
                seen.entry(cmd.target).or_default().push(cmd.command_index);
            }
        }
        for (entity, indices) in &seen {
            if indices.len() > 1 {
                report.conflict_count += 1;
                warn!(
                    entity = ?entity,
                    command_indices = ?indices,
                    "{} remove commands target the same entity this frame",
                    indices.len()
                );
            }
        }

        // --- Removals ---
        let mut additions = Vec::new();
        for cmd in commands {
            match cmd.kind {
                CommandKind::Remove => {
                    if entities.mark_destroyed(cmd.target).is_err() {
                        report.failed += 1;
                        warn!(
                            command_index = cmd.command_index,
                            target = ?cmd.target,
                            "queued removal targets an entity that is no longer in the scene"
                        );
                    }
                }
                CommandKind::Add(entity) => additions.push((cmd.command_index, cmd.target, entity)),
            }
        }
        report.removed = entities.remove_destroyed();

        // --- Additions ---
        for (command_index, target, entity) in additions {
            if entities.insert_reserved(target, entity) {
                report.added += 1;
            } else {
                report.failed += 1;
                warn!(
                    command_index,
                    target = ?target,
                    "queued addition lost its reserved id"
                );
            }
        }

        report
    }

    /// Drop every queued command, returning the reserved ids of dropped
    /// additions.
    pub fn clear(&mut self) -> Vec<EntityId> {
        self.next_index = 0;
        self.commands
            .drain(..)
            .filter(|cmd| matches!(cmd.kind, CommandKind::Add(_)))
            .map(|cmd| cmd.target)
            .collect()
    }

    fn push(&mut self, target: EntityId, kind: CommandKind) {
        self.commands.push(Command {
            target,
            kind,
            command_index: self.next_index,
        });
        self.next_index += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
