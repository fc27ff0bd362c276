//! The engine loop.
//!
//! [`Engine`] owns an ordered list of systems and an [`EngineContext`]
//! holding everything systems share: the entity system, the asset
//! libraries, the scene bookkeeping and the diagnostic log.
//!
//! Each call to [`Engine::advance`] with the wall time elapsed since the
//! previous call does the following:
//!
//! 1. **Fixed steps**: for every whole fixed step of accumulated time (at
//!    most `MaxFixedStepsPerFrame`), every enabled system gets
//!    `on_fixed_update`, then queued entity additions and removals are
//!    applied, then a pending scene change runs.
//! 2. **Update**: every enabled system gets `on_update(elapsed)` once.
//!
//! Time beyond the catch-up bound is dropped, so a long stall does not turn
//! into a burst of simulation frames.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ember_engine::prelude::*;
//!
//! let config = EngineConfig { fixed_frame_duration: 0.01, ..Default::default() };
//! let mut engine = Engine::new(config, Arc::new(ComponentRegistry::new())).unwrap();
//!
//! assert_eq!(engine.advance(0.035), 3);
//! assert_eq!(engine.frame_count(), 3);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_ces::stream::parse_str;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, trace, warn};

use ember_ces::prelude::*;

use crate::config::EngineConfig;
use crate::diagnostics::DiagnosticLog;
use crate::scene::{SceneState, SceneSystem, SCENE_SYSTEM_TAG};
use crate::system::{System, SystemId, SystemRegistry};
use crate::EngineError;

/// Top-level keys of a scene document.
const SCENE_KEYS: &[&str] = &["Name", "Assets", "Entities"];

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

/// Shared state handed to every system callback.
pub struct EngineContext {
    entities: EntitySystem,
    assets: AssetLibraries,
    scenes: SceneSystem,
    diagnostics: DiagnosticLog,
    fixed_dt: f64,
    frame: u64,
    should_exit: bool,
}

impl EngineContext {
    fn new(registry: Arc<ComponentRegistry>, fixed_dt: f64) -> Self {
        Self {
            entities: EntitySystem::new(registry),
            assets: AssetLibraries::new(),
            scenes: SceneSystem::default(),
            diagnostics: DiagnosticLog::default(),
            fixed_dt,
            frame: 0,
            should_exit: false,
        }
    }

    /// The component registry scenes are read with.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        self.entities.registry()
    }

    /// The running scene.
    pub fn entities(&self) -> &EntitySystem {
        &self.entities
    }

    /// Mutable access to the running scene.
    pub fn entities_mut(&mut self) -> &mut EntitySystem {
        &mut self.entities
    }

    /// Asset libraries of the running scene.
    pub fn assets(&self) -> &AssetLibraries {
        &self.assets
    }

    /// Register asset libraries here before the first scene loads.
    pub fn assets_mut(&mut self) -> &mut AssetLibraries {
        &mut self.assets
    }

    /// Scene bookkeeping.
    pub fn scenes(&self) -> &SceneSystem {
        &self.scenes
    }

    /// Scene bookkeeping, for change and save requests.
    pub fn scenes_mut(&mut self) -> &mut SceneSystem {
        &mut self.scenes
    }

    /// The process-wide diagnostic sink.
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Seconds per simulation frame.
    pub fn fixed_dt(&self) -> f64 {
        self.fixed_dt
    }

    /// Simulation frames run so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Ask the loop to stop at the top of its next iteration.
    pub fn close(&mut self) {
        debug!(frame = self.frame, "exit requested");
        self.should_exit = true;
    }

    /// Whether [`close`](Self::close) was called.
    pub fn should_exit(&self) -> bool {
        self.should_exit
    }

    /// The running scene as a scene document.
    pub fn write_scene(&self) -> Value {
        json!({
            "Name": self.scenes.current_scene().unwrap_or(""),
            "Assets": self.assets.save(),
            "Entities": self.entities.write(),
        })
    }

    /// Write the running scene to the store under `name`.
    pub fn save_scene(&mut self, name: &str) -> Result<SceneSnapshot, EngineError> {
        let scene = self.write_scene();
        let snapshot = self.scenes.save_scene_value(name, &scene)?;
        info!(scene = %name, "Saved scene \"{name}\"");
        Ok(snapshot)
    }

    /// Overwrite the running scene's own file. `None` when no scene is loaded.
    pub fn save_current_scene(&mut self) -> Result<Option<SceneSnapshot>, EngineError> {
        match self.scenes.current_scene().map(str::to_owned) {
            Some(current) => self.save_scene(&current).map(Some),
            None => {
                warn!("save requested with no scene loaded");
                Ok(None)
            }
        }
    }

    /// Snapshot the running scene under the autosave name.
    pub fn autosave(&mut self) -> Result<SceneSnapshot, EngineError> {
        let name = self.scenes.autosave_name().to_owned();
        self.save_scene(&name)
    }

    /// Read a parsed scene document into the (empty) entity system.
    ///
    /// Assets are read first so entities can use archetypes defined in the
    /// same file. Every entity is placed before any of them is initialized.
    fn read_scene(&mut self, file: &str, scene: &Value) -> Vec<Diagnostic> {
        let registry = Arc::clone(self.entities.registry());
        let mut diagnostics = Vec::new();
        let Some(object) = scene.as_object() else {
            return diagnostics;
        };

        let mut stream = Stream::new().with_registry(&registry).with_file(file);
        for key in object.keys() {
            if !SCENE_KEYS.contains(&key.as_str()) {
                stream.warn(DiagnosticKind::UnknownKey, format!("unrecognized key \"{key}\""));
            }
        }
        if let Some(assets) = object.get("Assets") {
            let mut scope = stream.scope("Assets");
            self.assets.load(assets, &mut scope);
        }
        diagnostics.extend(stream.into_diagnostics());

        let mut loaded = Vec::new();
        if let Some(list) = object.get("Entities") {
            let mut stream = Stream::new().with_registry(&registry).with_file(file);
            if let Some(archetypes) = self.assets.archetypes() {
                stream = stream.with_archetypes(archetypes);
            }
            {
                let mut scope = stream.scope("Entities");
                scope.read_array(list, |_, item, stream| {
                    let mut entity = Entity::default();
                    entity.read_value(item, stream);
                    loaded.push(entity);
                });
            }
            diagnostics.extend(stream.into_diagnostics());
        }
        let added = self.entities.add_entities(loaded);
        debug!(roots = added.len(), entities = self.entities.len(), "scene entities added");
        diagnostics
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("scenes", &self.scenes)
            .field("entities", &self.entities.len())
            .field("assets", &self.assets)
            .field("frame", &self.frame)
            .field("should_exit", &self.should_exit)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FrameDiagnostics
// ---------------------------------------------------------------------------

/// Timing and bookkeeping of the last loop iteration.
#[derive(Debug, Clone, Default)]
pub struct FrameDiagnostics {
    /// Fixed steps run.
    pub fixed_steps: u32,
    /// Fixed steps skipped because of the catch-up bound.
    pub dropped_steps: u32,
    /// Wall time per system (fixed updates and update combined), in
    /// registration order.
    pub system_times: Vec<(String, Duration)>,
    /// Queue flush of the last fixed step.
    pub flush: ApplyReport,
    /// Wall time of the whole iteration.
    pub total_time: Duration,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct SystemEntry {
    id: SystemId,
    enabled: bool,
    system: Box<dyn System>,
}

/// Owns the systems, the shared context and the clocks.
pub struct Engine {
    context: EngineContext,
    systems: Vec<SystemEntry>,
    config: EngineConfig,
    accumulator: f64,
    paused: bool,
    shut_down: bool,
    last_diagnostics: FrameDiagnostics,
}

impl Engine {
    /// An engine with no systems besides scene bookkeeping.
    pub fn new(config: EngineConfig, registry: Arc<ComponentRegistry>) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            context: EngineContext::new(registry, config.fixed_frame_duration),
            systems: Vec::new(),
            config,
            accumulator: 0.0,
            paused: false,
            shut_down: false,
            last_diagnostics: FrameDiagnostics::default(),
        })
    }

    /// Build every system named in `config.systems`, in order, and apply its
    /// config block. `SceneSystem` configures the built-in scene bookkeeping.
    pub fn from_config(
        config: EngineConfig,
        systems: &SystemRegistry,
        registry: Arc<ComponentRegistry>,
    ) -> Result<Self, EngineError> {
        let blocks = config.systems.clone();
        let mut engine = Self::new(config, registry)?;
        for (tag, block) in &blocks {
            let mut stream = Stream::new().with_file("EngineConfig");
            let mut scope = stream.scope(tag);
            if tag == SCENE_SYSTEM_TAG {
                engine.context.scenes.read_value(block, &mut scope);
                continue;
            }
            let Some(mut system) = systems.create(tag) else {
                return Err(EngineError::UnknownSystem {
                    tag: tag.clone(),
                    registered: systems.tags().join(", "),
                });
            };
            system.read_value(block, &mut scope);
            drop(scope);
            engine.add_system(system);
        }
        Ok(engine)
    }

    /// Builder: share `log` as the context's diagnostic sink.
    pub fn with_diagnostic_log(mut self, log: DiagnosticLog) -> Self {
        self.context.diagnostics = log;
        self
    }

    /// Register a system after all existing ones and run its `on_init`.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system(&mut self, mut system: Box<dyn System>) -> SystemId {
        let name = system.name().to_owned();
        assert!(
            name != SCENE_SYSTEM_TAG && !self.systems.iter().any(|e| e.system.name() == name),
            "duplicate system name: {name:?}"
        );
        let id = SystemId(self.systems.len() as u32);
        system.on_init(&mut self.context);
        let enabled = !self.paused || system.is_editor();
        debug!(system = %name, id = %id, "system registered");
        self.systems.push(SystemEntry { id, enabled, system });
        id
    }

    // -- loop ---------------------------------------------------------------

    /// Run one loop iteration covering `elapsed` seconds of wall time.
    /// Returns the number of fixed steps run.
    pub fn advance(&mut self, elapsed: f64) -> u32 {
        if self.shut_down {
            return 0;
        }
        let start = Instant::now();
        let dt = self.context.fixed_dt;
        let max_steps = self.config.max_fixed_steps_per_frame;
        let mut times = vec![Duration::ZERO; self.systems.len()];

        self.accumulator += elapsed.max(0.0);
        let mut steps = 0;
        let mut flush = ApplyReport::default();
        while self.accumulator >= dt && steps < max_steps {
            self.accumulator -= dt;
            flush = self.fixed_step(&mut times);
            steps += 1;
        }
        let mut dropped = 0;
        if self.accumulator >= dt {
            dropped = (self.accumulator / dt).floor() as u32;
            self.accumulator -= f64::from(dropped) * dt;
            debug!(dropped, "simulation fell behind, dropping fixed steps");
        }

        let frame_dt = elapsed as f32;
        for (index, entry) in self.systems.iter_mut().enumerate() {
            if !entry.enabled {
                continue;
            }
            let sys_start = Instant::now();
            entry.system.on_update(frame_dt, &mut self.context);
            times[index] += sys_start.elapsed();
        }

        self.last_diagnostics = FrameDiagnostics {
            fixed_steps: steps,
            dropped_steps: dropped,
            system_times: self
                .systems
                .iter()
                .zip(times)
                .map(|(entry, time)| (entry.system.name().to_owned(), time))
                .collect(),
            flush,
            total_time: start.elapsed(),
        };
        steps
    }

    fn fixed_step(&mut self, times: &mut [Duration]) -> ApplyReport {
        for (index, entry) in self.systems.iter_mut().enumerate() {
            if !entry.enabled {
                continue;
            }
            let sys_start = Instant::now();
            entry.system.on_fixed_update(&mut self.context);
            times[index] += sys_start.elapsed();
        }

        let report = self.context.entities.flush_queues();
        self.context.frame += 1;
        trace!(
            frame = self.context.frame,
            added = report.added,
            removed = report.removed,
            "fixed step"
        );

        if let Some(next) = self.context.scenes.take_next() {
            if let Err(e) = self.change_scene(&next) {
                error!(scene = %next, error = %e, "scene change failed, keeping the current scene");
            }
        }
        report
    }

    /// Run until a system calls [`EngineContext::close`] or the configured
    /// frame limit is reached, then shut down. Returns the iteration count.
    ///
    /// Headless runs advance exactly one fixed step per iteration without
    /// sleeping; otherwise wall time drives the clocks and each iteration is
    /// paced to the fixed step.
    pub fn run(&mut self) -> u64 {
        let headless = self.config.window.headless;
        let frame_limit = self.config.window.frame_limit;
        let pace = Duration::from_secs_f64(self.context.fixed_dt);
        info!(headless, frame_limit = ?frame_limit, "Engine loop started");

        let mut previous = Instant::now();
        let mut iterations = 0u64;
        while !self.context.should_exit {
            if frame_limit.is_some_and(|limit| iterations >= limit) {
                break;
            }
            let now = Instant::now();
            let elapsed = if headless {
                self.context.fixed_dt
            } else {
                now.duration_since(previous).as_secs_f64()
            };
            previous = now;
            self.advance(elapsed);
            iterations += 1;

            if !headless {
                let spent = now.elapsed();
                if spent < pace {
                    std::thread::sleep(pace - spent);
                }
            }
        }

        self.shutdown();
        info!(iterations, frames = self.context.frame, "Engine loop finished");
        iterations
    }

    /// Tear the running scene down and shut every system down, in reverse
    /// registration order. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Some(current) = self.context.scenes.current_scene() {
            info!(scene = %current, "Exiting scene \"{current}\"");
        }
        self.context.scenes.set_state(SceneState::Exiting);
        for entry in self.systems.iter_mut().rev() {
            entry.system.on_scene_exit(&mut self.context);
        }
        self.context.entities.on_scene_exit();
        self.context.assets.flush_all();
        self.context.scenes.clear_current();
        for entry in self.systems.iter_mut().rev() {
            entry.system.on_exit(&mut self.context);
        }
    }

    // -- scene transitions --------------------------------------------------

    /// Replace the running scene with scene `name`.
    ///
    /// The new scene is fetched and parsed before anything is torn down, so
    /// a missing or malformed file leaves the running scene untouched.
    fn change_scene(&mut self, name: &str) -> Result<(), EngineError> {
        let path = self.context.scenes.store().path_of(name);
        info!(scene = %name, path = %path, "Loading scene \"{name}\"");
        let text = self.context.scenes.store().load(name)?;
        let scene = parse_str(&text, &path).map_err(|e| EngineError::SceneLoad {
            scene: name.to_owned(),
            details: e.to_string(),
        })?;
        if !scene.is_object() {
            return Err(EngineError::SceneLoad {
                scene: name.to_owned(),
                details: "a scene must be a JSON object".to_owned(),
            });
        }

        self.exit_scene();

        if self.context.scenes.take_autosave_copy() {
            let autosave = self.context.scenes.autosave_name().to_owned();
            if let Err(e) = self.context.scenes.store_mut().save(&autosave, &text) {
                warn!(scene = %name, error = %e, "could not copy scene to autosave");
            }
        }

        self.context.scenes.begin_loading(name);
        for entry in &mut self.systems {
            entry.system.on_scene_load(&mut self.context);
        }
        let diagnostics = self.context.read_scene(&path, &scene);

        info!(scene = %name, warnings = diagnostics.len(), "Initializing scene \"{name}\"");
        for entry in &mut self.systems {
            entry.system.on_scene_init(&mut self.context);
        }
        self.context.scenes.finish_loading(diagnostics);
        Ok(())
    }

    fn exit_scene(&mut self) {
        if let Some(current) = self.context.scenes.current_scene().map(str::to_owned) {
            info!(scene = %current, "Exiting scene \"{current}\"");
            self.context.scenes.set_state(SceneState::Exiting);
            for entry in &mut self.systems {
                entry.system.on_scene_exit(&mut self.context);
            }
        }
        self.context.entities.on_scene_exit();
        self.context.assets.flush_all();
        self.context.scenes.clear_current();
    }

    // -- pause / enable -----------------------------------------------------

    /// Pausing disables every non-editor system; unpausing enables them.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        for entry in &mut self.systems {
            if !entry.system.is_editor() {
                entry.enabled = !paused;
            }
        }
        debug!(paused, "pause toggled");
    }

    /// Whether non-editor systems are paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Enable or disable one system. Returns `false` for an unknown id.
    pub fn set_enabled(&mut self, id: SystemId, enabled: bool) -> bool {
        match self.systems.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Whether system `id` gets updates; `None` for an unknown id.
    pub fn is_enabled(&self, id: SystemId) -> Option<bool> {
        self.systems.iter().find(|e| e.id == id).map(|e| e.enabled)
    }

    // -- inspection ---------------------------------------------------------

    /// Every debug window: scene bookkeeping, each system that has one, and
    /// the captured diagnostics.
    pub fn debug_windows(&self) -> Vec<InspectNode> {
        let mut windows = vec![self.context.scenes.debug_window()];
        windows.extend(
            self.systems
                .iter()
                .filter_map(|entry| entry.system.debug_window(&self.context)),
        );
        let entries = self
            .context
            .diagnostics
            .entries()
            .into_iter()
            .map(|entry| {
                InspectNode::readonly(entry.level.to_string(), json!(entry.to_string()))
            })
            .collect();
        windows.push(InspectNode::group("Diagnostics", entries));
        windows
    }

    /// The engine configuration as it stands, including each system's
    /// current config block.
    pub fn write_config(&self) -> Value {
        let mut systems = Map::new();
        systems.insert(SCENE_SYSTEM_TAG.to_owned(), self.context.scenes.write());
        for entry in &self.systems {
            systems.insert(entry.system.name().to_owned(), entry.system.write());
        }
        json!({
            "FixedFrameDuration": self.config.fixed_frame_duration,
            "MaxFixedStepsPerFrame": self.config.max_fixed_steps_per_frame,
            "Window": serde_json::to_value(&self.config.window).unwrap_or_default(),
            "Systems": systems,
        })
    }

    // -- accessors ----------------------------------------------------------

    /// State shared with systems.
    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Mutable shared state, for setup and tools.
    pub fn context_mut(&mut self) -> &mut EngineContext {
        &mut self.context
    }

    /// The configuration the engine was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Seconds per simulation frame.
    pub fn fixed_dt(&self) -> f64 {
        self.context.fixed_dt
    }

    /// Simulation frames run so far.
    pub fn frame_count(&self) -> u64 {
        self.context.frame
    }

    /// Number of registered systems.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// System names in registration order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|e| e.system.name()).collect()
    }

    /// The system registered as `name`.
    pub fn system(&self, name: &str) -> Option<&dyn System> {
        self.systems
            .iter()
            .find(|e| e.system.name() == name)
            .map(|e| e.system.as_ref())
    }

    /// Timing of the last loop iteration.
    pub fn last_diagnostics(&self) -> &FrameDiagnostics {
        &self.last_diagnostics
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("systems", &self.system_names())
            .field("context", &self.context)
            .field("paused", &self.paused)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
