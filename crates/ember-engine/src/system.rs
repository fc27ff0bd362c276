//! The system contract and the tag → constructor registry.
//!
//! A [`System`] is a long-lived engine service. Systems are registered in a
//! meaningful order; every lifecycle callback runs over them in that order
//! (shutdown runs in reverse). Systems are configured through the same
//! reading facade as components, so a config block is just a JSON object
//! whose keys map onto the system's read methods.

use std::fmt;

use ember_ces::prelude::*;

use crate::engine::EngineContext;

/// Registration index of a system, unique within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub u32);

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// An engine service with lifecycle callbacks.
///
/// All callbacks default to no-ops. Callbacks receive the shared
/// [`EngineContext`]; they never see other systems directly.
pub trait System: Serializable + ReadValue {
    /// Unique name, also the tag used in EngineConfig.
    fn name(&self) -> &str;

    /// Right after registration.
    fn on_init(&mut self, _ctx: &mut EngineContext) {}

    /// At engine shutdown, after `on_scene_exit`.
    fn on_exit(&mut self, _ctx: &mut EngineContext) {}

    /// A scene is about to be read. The entity list is empty.
    fn on_scene_load(&mut self, _ctx: &mut EngineContext) {}

    /// Every entity of the new scene has been added and initialized.
    fn on_scene_init(&mut self, _ctx: &mut EngineContext) {}

    /// The current scene is about to be torn down.
    fn on_scene_exit(&mut self, _ctx: &mut EngineContext) {}

    /// Once per simulation step.
    fn on_fixed_update(&mut self, _ctx: &mut EngineContext) {}

    /// Once per loop iteration with the elapsed wall time.
    fn on_update(&mut self, _dt: f32, _ctx: &mut EngineContext) {}

    /// Inspection tree for a debug window, if this system has one.
    fn debug_window(&self, _ctx: &EngineContext) -> Option<InspectNode> {
        None
    }

    /// Editor systems keep running while the game is paused.
    fn is_editor(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// SystemRegistry
// ---------------------------------------------------------------------------

type SystemConstructor = fn() -> Box<dyn System>;

fn construct<T: System + Default>() -> Box<dyn System> {
    Box::new(T::default())
}

/// Maps EngineConfig tags to system constructors.
#[derive(Default)]
pub struct SystemRegistry {
    constructors: Vec<(String, SystemConstructor)>,
}

impl SystemRegistry {
    /// An empty registry; see [`SystemRegistry::with_builtin`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the systems this crate ships.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<crate::behavior::BehaviorSystem>(crate::behavior::BEHAVIOR_SYSTEM_TAG);
        registry
    }

    /// Register `T` under `tag`.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is already registered.
    pub fn register<T: System + Default>(&mut self, tag: &str) {
        assert!(
            !self.constructors.iter().any(|(t, _)| t == tag),
            "system tag '{tag}' is already registered"
        );
        self.constructors.push((tag.to_owned(), construct::<T>));
    }

    /// A fresh, unconfigured instance of the system registered as `tag`.
    pub fn create(&self, tag: &str) -> Option<Box<dyn System>> {
        self.constructors
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, constructor)| constructor())
    }

    /// Whether `tag` is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.iter().any(|(t, _)| t == tag)
    }

    /// Registered tags, in registration order.
    pub fn tags(&self) -> Vec<&str> {
        self.constructors.iter().map(|(t, _)| t.as_str()).collect()
    }
}

impl fmt::Debug for SystemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tags()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
