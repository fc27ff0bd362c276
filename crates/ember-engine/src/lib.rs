//! Ember Engine -- frame loop, systems and scene management.
//!
//! This crate builds on [`ember_ces`] to provide the runtime driver: an
//! [`Engine`](engine::Engine) owning an ordered list of
//! [`System`](system::System)s, a two-clock loop (a variable update per
//! iteration plus fixed simulation steps with bounded catch-up), and a
//! [`SceneSystem`](scene::SceneSystem) that swaps scenes at frame boundaries.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use ember_engine::prelude::*;
//!
//! let registry = Arc::new(ComponentRegistry::new());
//! let store = MemoryStore::new().with_scene("start", r#"{ "Name": "start", "Entities": [{ "Name": "hero" }] }"#);
//!
//! let mut engine = Engine::new(EngineConfig::default(), registry).unwrap();
//! engine.context_mut().scenes_mut().set_store(Box::new(store));
//! engine.context_mut().scenes_mut().set_next_scene("start");
//!
//! engine.advance(engine.fixed_dt());
//! assert_eq!(engine.context().scenes().current_scene(), Some("start"));
//! assert!(engine.context().entities().get_entity("hero").is_some());
//! ```

#![deny(unsafe_code)]

pub mod behavior;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod scene;
pub mod system;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the entity runtime for convenience.
pub use ember_ces;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while configuring the engine or moving between scenes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine configuration is unusable.
    #[error("invalid engine config: {details}")]
    Config { details: String },

    /// A scene could not be found or parsed. The previous scene keeps running.
    #[error("failed to load scene '{scene}': {details}")]
    SceneLoad { scene: String, details: String },

    /// Reading or writing a scene file failed.
    #[error("scene store I/O failed for '{path}': {source}")]
    SceneStore {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// EngineConfig named a system tag nobody registered.
    #[error("unknown system type '{tag}'. Registered systems: [{registered}]")]
    UnknownSystem { tag: String, registered: String },

    #[error(transparent)]
    Ces(#[from] ember_ces::CesError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the entity runtime prelude.
    pub use ember_ces::prelude::*;

    pub use crate::behavior::BehaviorSystem;
    pub use crate::config::{EngineConfig, WindowConfig};
    pub use crate::diagnostics::{init_logging, DiagnosticLayer, DiagnosticLog, LoggedDiagnostic};
    pub use crate::engine::{Engine, EngineContext, FrameDiagnostics};
    pub use crate::scene::{
        DirectoryStore, MemoryStore, SceneState, SceneStore, SceneSystem, SCENE_EXTENSION,
        SCENE_SYSTEM_TAG,
    };
    pub use crate::system::{System, SystemId, SystemRegistry};
    pub use crate::EngineError;
}
