//! Lava simulation configuration.
//!
//! This module contains compile-time tunable parameters plus the runtime
//! configuration resource injected at construction. Integer parameters are
//! expressed in fluid units or ticks; see `units` for the fixed-point scheme.

use bevy_ecs::resource::Resource;

/// Compile-time lava simulation configuration.
///
/// These constants control behavior that is not worth exposing at runtime.
/// Runtime-tunable values live in [`LavaConfig`].
pub mod constants {
    use crate::units::UNITS_PER_LEVEL;

    /// Number of CAS attempts when applying a flow in parallel mode before the
    /// transfer is abandoned for this step. Contention on a single cell is
    /// rare (only neighbors touch it), so a small count suffices.
    pub const MAX_FLOW_CAS_ATTEMPTS: u32 = 4;

    /// Number of lock acquisition retries when forming a new connection
    /// between two cells before giving up until the next tick.
    pub const MAX_LOCK_ATTEMPTS: u32 = 16;

    /// Maximum times a block event is retried across ticks before being
    /// dropped with a log line.
    pub const MAX_EVENT_RETRIES: u32 = 4;

    /// Retention applied to a cell resting on a full solid block.
    /// One level of lava sticks to flat terrain.
    pub const RETENTION_FULL_FLOOR: i32 = UNITS_PER_LEVEL;

    /// Retention applied to a cell resting on a partial "flow height" block.
    /// Lava on a flow surface drains more completely.
    pub const RETENTION_FLOW_FLOOR: i32 = UNITS_PER_LEVEL / 2;

    /// Floor drop (in levels) to a neighbor at which retention is halved.
    /// Lava on sloped terrain runs off instead of pooling.
    pub const RETENTION_SLOPE_LEVELS: i32 = 2;

    /// Maximum floor-height difference (in units) credited to a connection's
    /// `drop`. Steeper drops all sort into the same leading round.
    pub const MAX_DROP_UNITS: i32 = 4 * UNITS_PER_LEVEL * 12;

    /// Cells whose outflow exceeded this in the current tick count as having
    /// flowed for cooling purposes.
    pub const SIGNIFICANT_FLOW_UNITS: i32 = UNITS_PER_LEVEL / 4;

    /// Denominator for the randomized cooling tolerance when a cell has
    /// exactly 3 fluid-connected sides: it cools with probability 1/N.
    /// Keeps cooling fronts from advancing as perfectly straight walls.
    pub const THREE_SIDE_COOL_CHANCE: u32 = 4;
}

/// Runtime lava simulation configuration resource.
///
/// All values are injected at construction and read-only during a tick.
#[derive(Resource, Clone, Debug)]
pub struct LavaConfig {
    /// Compressibility of over-full cells. Each unit of excess fluid raises
    /// the effective pressure surface by this many units, making pressurized
    /// cells push outward through tunnels. Higher = harder push per unit.
    pub pressure_factor: i32,

    /// Number of bounded flow steps executed per tick. Each step gives every
    /// flow chain one pass; more steps converge faster at higher cost.
    pub step_count: u32,

    /// Per-source-cell output budget per step, in units. Throttles how much
    /// of a step's ration a cell spends on its steepest outflows before
    /// shallower rounds are allowed to run.
    pub max_output_per_step: i32,

    /// Equalization dead zone in units: surface gaps and transfers below this
    /// are suppressed, so settled lava stops exchanging sub-visible amounts.
    pub min_flow_units: i32,

    /// Surface gap (units) required to reverse a connection's flow direction
    /// relative to the previous tick. Hysteresis against oscillation.
    pub reversal_threshold: i32,

    /// Ticks without significant flow before a cell becomes a cooling
    /// candidate.
    pub cooling_idle_ticks: u64,

    /// Consecutive idle ticks (no active cells, no retains) before a chunk is
    /// reported unloadable.
    pub chunk_unload_ticks: u32,

    /// Minimum number of flowable connections before flow execution is
    /// dispatched to the compute task pool instead of running serially.
    pub parallel_threshold: usize,

    /// Per-tick flowable budget used to derive the load factor reported to
    /// the caller. The engine never truncates flow; callers are expected to
    /// throttle new-fluid intake when the load factor approaches 1.0.
    pub flow_budget_per_tick: usize,

    /// Maximum column validations performed per tick. Remaining flagged
    /// columns carry over to the next tick.
    pub max_validations_per_tick: usize,

    /// When false, cells never cool. Useful for tests and staged eruptions.
    pub cooling_enabled: bool,
}

impl Default for LavaConfig {
    fn default() -> Self {
        Self {
            pressure_factor: 20,
            step_count: 4,
            max_output_per_step: crate::units::UNITS_PER_BLOCK / 4,
            min_flow_units: 2,
            reversal_threshold: 2 * crate::units::UNITS_PER_LEVEL,
            cooling_idle_ticks: 200,
            chunk_unload_ticks: 40,
            parallel_threshold: 128,
            flow_budget_per_tick: 4096,
            max_validations_per_tick: 64,
            cooling_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_sane() {
        let config = LavaConfig::default();
        assert!(config.pressure_factor > 1);
        assert!(config.step_count >= 1);
        assert!(config.max_output_per_step > 0);
        assert!(config.min_flow_units > 0);
        assert!(config.reversal_threshold > config.min_flow_units);
    }
}
