//! Component behaviour driver.
//!
//! [`BehaviorSystem`] forwards the engine's update callbacks to components:
//! each fixed step calls `on_fixed_update` and each loop iteration calls
//! `on_update(dt)` on every in-scene component, in flat (parent before
//! child) order. A `Components` config array restricts it to the listed
//! component tags.

use ember_ces::prelude::*;
use serde_json::{json, Value};
use tracing::warn;

use crate::engine::EngineContext;
use crate::system::System;

/// EngineConfig tag of [`BehaviorSystem`].
pub const BEHAVIOR_SYSTEM_TAG: &str = "BehaviorSystem";

#[derive(Debug, Default)]
pub struct BehaviorSystem {
    /// Tags from config; empty means every component.
    tags: Vec<String>,
    /// `tags` resolved against the component registry.
    kinds: Option<Vec<ComponentKind>>,
    driven_last_frame: usize,
}

impl BehaviorSystem {
    /// Drive only the components registered under `tags`.
    pub fn with_components(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            ..Self::default()
        }
    }

    fn read_components(&mut self, value: &Value, stream: &mut Stream<'_>) {
        stream.read_into(&mut self.tags, value);
        self.kinds = None;
    }

    fn resolve(&mut self, registry: &ComponentRegistry) {
        if self.tags.is_empty() {
            self.kinds = None;
            return;
        }
        let mut kinds = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            match registry.kind_of_tag(tag) {
                Some(kind) => kinds.push(kind),
                None => warn!(system = BEHAVIOR_SYSTEM_TAG, tag = %tag, "unknown component tag"),
            }
        }
        self.kinds = Some(kinds);
    }

    fn drive<F>(&mut self, ctx: &mut EngineContext, mut hook: F)
    where
        F: FnMut(&mut dyn Component, &mut ComponentContext<'_>),
    {
        let entities = ctx.entities_mut();
        let addresses = entities.component_addresses(self.kinds.as_deref());
        self.driven_last_frame = addresses.len();
        for address in addresses {
            // Earlier hooks this frame may have destroyed the entity.
            if entities.is_destroyed(address.entity) {
                continue;
            }
            entities.dispatch(address, |component, cctx| hook(component, cctx));
        }
    }
}

impl Serializable for BehaviorSystem {
    fn read_methods() -> ReadMethodMap<Self> {
        &[("Components", Self::read_components)]
    }

    fn write(&self) -> Value {
        json!({ "Components": self.tags })
    }
}

impl System for BehaviorSystem {
    fn name(&self) -> &str {
        BEHAVIOR_SYSTEM_TAG
    }

    fn on_init(&mut self, ctx: &mut EngineContext) {
        let registry = ctx.registry().clone();
        self.resolve(&registry);
    }

    fn on_fixed_update(&mut self, ctx: &mut EngineContext) {
        self.drive(ctx, |component, cctx| component.on_fixed_update(cctx));
    }

    fn on_update(&mut self, dt: f32, ctx: &mut EngineContext) {
        self.drive(ctx, |component, cctx| component.on_update(dt, cctx));
    }

    fn debug_window(&self, _ctx: &EngineContext) -> Option<InspectNode> {
        Some(InspectNode::group(
            BEHAVIOR_SYSTEM_TAG,
            vec![
                InspectNode::field("Components", json!(self.tags)),
                InspectNode::readonly("Driven", json!(self.driven_last_frame)),
            ],
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
