//! Property tests for the two-clock loop.
//!
//! Elapsed times are multiples of 1/64 s and the fixed step is 1/4 s, so
//! every accumulator operation is exact and the bookkeeping can be checked
//! with equality: each fixed step of accumulated time is either run or
//! dropped by the catch-up bound, never lost or duplicated.

use std::sync::Arc;

use ember_engine::prelude::*;
use proptest::prelude::*;

const FIXED_DT: f64 = 0.25;

fn setup_engine(max_steps: u32) -> Engine {
    let config = EngineConfig {
        fixed_frame_duration: FIXED_DT,
        max_fixed_steps_per_frame: max_steps,
        ..Default::default()
    };
    Engine::new(config, Arc::new(ComponentRegistry::new())).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// No iteration runs more fixed steps than the catch-up bound.
    #[test]
    fn steps_respect_the_bound(
        max_steps in 1..6u32,
        ticks in prop::collection::vec(0..256u32, 1..50),
    ) {
        let mut engine = setup_engine(max_steps);
        for &t in &ticks {
            let steps = engine.advance(f64::from(t) / 64.0);
            prop_assert!(steps <= max_steps);
        }
    }

    /// Run steps plus dropped steps account for all elapsed time.
    #[test]
    fn elapsed_time_is_fully_accounted(
        max_steps in 1..6u32,
        ticks in prop::collection::vec(0..256u32, 1..50),
    ) {
        let mut engine = setup_engine(max_steps);
        let mut run = 0u64;
        let mut dropped = 0u64;
        let mut total = 0.0f64;
        for &t in &ticks {
            let elapsed = f64::from(t) / 64.0;
            total += elapsed;
            run += u64::from(engine.advance(elapsed));
            dropped += u64::from(engine.last_diagnostics().dropped_steps);
        }
        prop_assert_eq!(run, engine.frame_count());
        prop_assert_eq!(run + dropped, (total / FIXED_DT).floor() as u64);
    }

    /// Without stalls beyond the bound, nothing is dropped.
    #[test]
    fn small_steps_never_drop(ticks in prop::collection::vec(0..16u32, 1..100)) {
        let mut engine = setup_engine(5);
        for &t in &ticks {
            engine.advance(f64::from(t) / 64.0);
            prop_assert_eq!(engine.last_diagnostics().dropped_steps, 0);
        }
    }
}
