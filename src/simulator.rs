//! Tick orchestration for the lava simulation.
//!
//! [`LavaSimState`] owns the registry, the event queue and the flow scheduler
//! and runs one fixed-order tick: apply world events, validate flagged
//! columns, rebuild connections and retention, run the flow steps, cool idle
//! cells, sweep chunk lifecycle, and report changed surfaces. Everything
//! except the flow steps runs serially; the flow steps only touch cell
//! atomics and may fan out to the compute task pool.
//!
//! The engine never truncates flow under load. Instead it reports a load
//! factor derived from the per-tick flowable budget and expects the host to
//! throttle new-fluid intake (eruptions, emitters) as the factor approaches
//! one.

use bevy::math::IVec3;
use bevy_ecs::resource::Resource;
use rand::thread_rng;

use crate::chunk::registry::LavaCellRegistry;
use crate::config::LavaConfig;
use crate::events::{BlockEvent, BlockEventKind, BlockEventQueue};
use crate::geometry::WorldGeometry;
use crate::scheduler::FlowScheduler;
use crate::sink::{CellStateSink, LifecycleHooks};

/// Counters for the last completed tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub columns_validated: usize,
    pub flowables: usize,
    pub units_moved: i64,
    pub cells_cooled: usize,
}

/// The complete simulation state, advanced one tick at a time.
#[derive(Resource, Debug, Default)]
pub struct LavaSimState {
    pub registry: LavaCellRegistry,
    pub events: BlockEventQueue,
    pub config: LavaConfig,
    scheduler: FlowScheduler,
    pub(crate) tick: u64,
    stats: TickStats,
    /// Events taken off the queue this tick, kept so a deferred column can be
    /// retried with its original attempt count.
    inflight: Vec<BlockEvent>,
    deferred: Vec<(i32, i32)>,
}

impl LavaSimState {
    pub fn new(config: LavaConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    #[inline]
    pub fn stats(&self) -> TickStats {
        self.stats
    }

    /// Fraction of the per-tick flowable budget used last tick. The host is
    /// expected to throttle new fluid as this approaches 1.0.
    pub fn load_factor(&self) -> f32 {
        self.stats.flowables as f32 / self.config.flow_budget_per_tick.max(1) as f32
    }

    /// Queues a world block change for processing on the next tick.
    pub fn queue_block_event(&mut self, pos: IVec3, kind: BlockEventKind) {
        self.events.queue(pos, kind);
    }

    /// Adds fluid directly to the cell covering block `pos`, if one exists.
    ///
    /// Returns false when no cell covers the position yet; the column is then
    /// queued for validation and the caller retries on a later tick.
    pub fn add_fluid(&mut self, pos: IVec3, units: i32) -> bool {
        debug_assert!(units > 0);
        let target = self.registry.chunk(crate::chunk::chunk_key(pos.x, pos.z)).and_then(|chunk| {
            let mut cursor = chunk.columns[crate::chunk::column_index(pos.x, pos.z)];
            while let Some(id) = cursor {
                let cell = self.registry.cells.get(id)?;
                if cell.intersects_block(pos.y) {
                    return Some(id);
                }
                if cell.floor() >= (pos.y + 1) * crate::units::LEVELS_PER_BLOCK {
                    return None;
                }
                cursor = cell.above;
            }
            None
        });

        match target {
            Some(id) => {
                if let Some(cell) = self.registry.cells.get(id) {
                    cell.change_fluid(units);
                    cell.touch_flow(self.tick);
                    true
                } else {
                    false
                }
            }
            None => {
                self.events.queue(pos, BlockEventKind::ColumnInvalidated);
                false
            }
        }
    }

    /// Advances the simulation by one tick.
    pub fn tick(
        &mut self,
        geometry: &dyn WorldGeometry,
        sink: &mut dyn CellStateSink,
        hooks: &mut dyn LifecycleHooks,
    ) {
        self.tick += 1;
        let tick = self.tick;
        self.stats = TickStats::default();
        self.registry.begin_tick();

        // World events collapse into column validation flags.
        self.inflight.clear();
        let pending = self.events.len();
        for _ in 0..pending {
            let Some(event) = self.events.pop() else { break };
            self.registry.flag_column(event.pos.x, event.pos.z);
            self.inflight.push(event);
        }

        // Column validation under budget. Deferred columns go back through
        // the event queue, keeping their retry budget, so a column the world
        // refuses to reconcile is eventually dropped instead of spinning.
        self.deferred.clear();
        self.stats.columns_validated = self.registry.validate_flagged(
            geometry,
            self.config.max_validations_per_tick,
            tick,
            &mut self.deferred,
        );
        while let Some((x, z)) = self.deferred.pop() {
            let position = self
                .inflight
                .iter()
                .position(|event| event.pos.x == x && event.pos.z == z);
            match position {
                Some(index) => {
                    let event = self.inflight.swap_remove(index);
                    self.events.retry(event);
                }
                None => {
                    self.events
                        .queue(IVec3::new(x, 0, z), BlockEventKind::ColumnInvalidated);
                }
            }
        }

        // Structure settled: rebuild the flow graph and retention.
        self.registry.update_connections();
        self.registry.refresh_retention();

        // Flow.
        self.stats.flowables = self.scheduler.prepare(
            &mut self.registry.connections,
            &self.registry.cells,
            &self.config,
            tick,
        );
        self.stats.units_moved = self
            .scheduler
            .run(&self.registry.cells, &self.config, tick);

        // Cooling and lifecycle.
        let mut rng = thread_rng();
        self.stats.cells_cooled =
            self.registry
                .cooling_pass(tick, &self.config, hooks, &mut rng);
        self.registry.update_lifecycle(&self.config, hooks, tick);

        // Report what changed.
        self.registry.report_surfaces(sink);

        if self.stats.flowables > 0 || self.stats.cells_cooled > 0 {
            log::trace!(
                "[SIM] Tick {}: {} validated, {} flowables, {} units moved, {} cooled",
                tick,
                self.stats.columns_validated,
                self.stats.flowables,
                self.stats.units_moved,
                self.stats.cells_cooled
            );
        }
    }
}
