//! Per-tick flow scheduling: setup, chaining, and bounded stepped execution.
//!
//! Each tick the scheduler asks every connection for a [`Flowable`], groups
//! the results into per-source chains sorted by descending drop, and runs a
//! fixed number of execution steps. Within a chain the steepest outflows form
//! the leading round; shallower rounds only run while the source cell still
//! has output budget for the step, so lava pouring off a cliff edge is fed
//! before it fans out sideways.
//!
//! Both the setup sweep and chain execution move to the compute task pool
//! once the workload crosses the configured threshold. Setup partitions the
//! connection slots (each task owns its slice exclusively); execution
//! partitions the chains, whose writes all go through the cells' atomics.

use bevy::tasks::{ComputeTaskPool, TaskPool};

use crate::cell::CellArena;
use crate::config::LavaConfig;
use crate::connection::{ConnectionArena, Flowable};

/// All flowables sharing one source cell, sorted by descending drop.
#[derive(Debug)]
struct FlowChain {
    flowables: Vec<Flowable>,
}

impl FlowChain {
    /// Runs one execution step over the chain's rounds. Returns units moved.
    fn run_step(&self, cells: &CellArena, config: &LavaConfig, tick: u64, step: u32) -> i64 {
        // Cumulative per-source budget: by step N the source may have emitted
        // at most N+1 rations.
        let budget = config
            .max_output_per_step
            .saturating_mul(step as i32 + 1);

        let mut moved = 0i64;
        let mut index = 0;
        while index < self.flowables.len() {
            let drop = self.flowables[index].drop_units;
            let mut round_end = index;
            while round_end < self.flowables.len()
                && self.flowables[round_end].drop_units == drop
            {
                round_end += 1;
            }
            for flowable in &self.flowables[index..round_end] {
                moved += i64::from(flowable.execute(cells, config, tick));
            }
            index = round_end;

            // Shallower rounds only run while the source has budget left.
            let spent = cells
                .get(self.flowables[0].from)
                .map_or(i32::MAX, |cell| cell.outflow_this_tick());
            if spent >= budget {
                break;
            }
        }
        moved
    }
}

/// Reusable per-tick flow scheduler.
#[derive(Debug, Default)]
pub struct FlowScheduler {
    chains: Vec<FlowChain>,
    flowable_count: usize,
}

impl FlowScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flowables produced by the last `prepare`, for load reporting.
    #[inline]
    pub fn flowable_count(&self) -> usize {
        self.flowable_count
    }

    /// Runs setup on every connection and builds this tick's chains.
    /// Returns the number of flowables gathered.
    pub fn prepare(
        &mut self,
        connections: &mut ConnectionArena,
        cells: &CellArena,
        config: &LavaConfig,
        tick: u64,
    ) -> usize {
        let slots = connections.slots_mut();
        let mut flowables: Vec<Flowable> = if slots.len() >= config.parallel_threshold {
            let pool = ComputeTaskPool::get_or_init(TaskPool::default);
            let batch = slots.len().div_ceil(pool.thread_num().max(1)).max(1);
            let batches = pool.scope(|scope| {
                for slice in slots.chunks_mut(batch) {
                    scope.spawn(async move {
                        let mut out = Vec::new();
                        for connection in slice.iter_mut().flatten() {
                            if let Some(flowable) = connection.setup(cells, config, tick) {
                                out.push(flowable);
                            }
                        }
                        out
                    });
                }
            });
            batches.into_iter().flatten().collect()
        } else {
            let mut out = Vec::new();
            for connection in slots.iter_mut().flatten() {
                if let Some(flowable) = connection.setup(cells, config, tick) {
                    out.push(flowable);
                }
            }
            out
        };
        self.flowable_count = flowables.len();

        // Group by source; within a source, steepest drop first.
        flowables.sort_unstable_by(|a, b| {
            a.from
                .cmp(&b.from)
                .then_with(|| b.drop_units.cmp(&a.drop_units))
        });
        self.chains.clear();
        let mut start = 0;
        for end in 1..=flowables.len() {
            if end == flowables.len() || flowables[end].from != flowables[start].from {
                self.chains.push(FlowChain {
                    flowables: flowables[start..end].to_vec(),
                });
                start = end;
            }
        }

        log::trace!(
            "[SCHED] Tick {}: {} flowables in {} chains",
            tick,
            self.flowable_count,
            self.chains.len()
        );
        self.flowable_count
    }

    /// Executes the configured number of steps over the prepared chains.
    /// Returns total units moved. Stops early once a step moves nothing.
    pub fn run(&self, cells: &CellArena, config: &LavaConfig, tick: u64) -> i64 {
        if self.chains.is_empty() {
            return 0;
        }
        let mut total = 0i64;
        for step in 0..config.step_count {
            let moved: i64 = if self.chains.len() >= config.parallel_threshold {
                let pool = ComputeTaskPool::get_or_init(TaskPool::default);
                let batch = self.chains.len().div_ceil(pool.thread_num().max(1)).max(1);
                let sums = pool.scope(|scope| {
                    for slice in self.chains.chunks(batch) {
                        scope.spawn(async move {
                            slice
                                .iter()
                                .map(|chain| chain.run_step(cells, config, tick, step))
                                .sum::<i64>()
                        });
                    }
                });
                sums.into_iter().sum()
            } else {
                self.chains
                    .iter()
                    .map(|chain| chain.run_step(cells, config, tick, step))
                    .sum()
            };
            total += moved;
            if moved == 0 {
                break;
            }
        }
        total
    }
}
