//! `ember` -- run the engine from an EngineConfig file.
//!
//! Usage: `ember [path/to/EngineConfig.json]` (default `Data/EngineConfig.json`).
//!
//! Games link their own component and system registrations into a binary
//! like this one; the stock binary knows only the built-in systems, which is
//! enough to load, run and re-save scenes made of built-in data.

use std::sync::Arc;

use anyhow::Context as _;
use ember_engine::prelude::*;

const DEFAULT_CONFIG_PATH: &str = "Data/EngineConfig.json";

fn main() -> Result<(), anyhow::Error> {
    let log = DiagnosticLog::default();
    init_logging(&log).context("failed to install the tracing subscriber")?;

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let config = EngineConfig::from_path(&path)
        .with_context(|| format!("failed to load engine config from {path}"))?;

    let registry = Arc::new(ComponentRegistry::new());
    let mut engine = Engine::from_config(config, &SystemRegistry::with_builtin(), registry)
        .context("failed to build the engine")?
        .with_diagnostic_log(log.clone());

    let iterations = engine.run();
    tracing::info!(
        iterations,
        warnings = log.len(),
        "Shut down cleanly"
    );
    Ok(())
}
