//! Pressure-equalization flow math and its lock-free application.
//!
//! A [`Flowable`] is the per-tick descriptor a connection emits from setup:
//! source, target, and the cached direction-dependent attributes. The flow
//! quantity is computed by exactly one of three closed-form integer formulas
//! selected by comparing the pair's total fluid against the two cached
//! thresholds:
//!
//! - **Free flow**: neither cell pressurized at equilibrium; equalize
//!   `floor + fluid`.
//! - **Single-pressure**: only the lower-ceiling cell would be pressurized;
//!   assume it fills to its ceiling and solve for the shared surface.
//! - **Dual-pressure**: both pressurized; solve the two pressure-surface
//!   equations under conservation of fluid.
//!
//! Each formula rounds so the source never ends up with an effective surface
//! below the target — a biased-down transfer leaves at most a sub-unit
//! surplus on the source side, which kills rounding-induced flow reversals
//! that would otherwise oscillate forever and block cooling.
//!
//! Application is optimistic: both fluid counters are committed with
//! compare-and-swap, and a failed swap on the target rolls back the source
//! before retrying. Nothing is locked across the read-compute-commit window.

use crate::cell::{CellArena, CellId, LavaCell};
use crate::config::constants::{MAX_FLOW_CAS_ATTEMPTS, SIGNIFICANT_FLOW_UNITS};
use crate::config::LavaConfig;
use crate::connection::ConnectionId;
use crate::units::ceil_div;

/// One executable flow for the current tick.
#[derive(Debug, Clone, Copy)]
pub struct Flowable {
    pub connection: ConnectionId,
    pub from: CellId,
    pub to: CellId,
    /// Floor height difference in units, capped; the round sort key.
    pub drop_units: i32,
    /// Cap on units moved by one execution of this flowable.
    pub max_flow_per_step: i32,
    pub single_pressure_threshold: i32,
    pub dual_pressure_threshold: i32,
}

impl Flowable {
    /// Computes the equalizing transfer for the current fluid amounts,
    /// before caps. Zero or negative means no flow this step.
    fn equalizing_flow(
        &self,
        from: &LavaCell,
        to: &LavaCell,
        from_fluid: i32,
        to_fluid: i32,
        pressure_factor: i32,
    ) -> i32 {
        let total = from_fluid + to_fluid;
        if total <= 0 {
            return 0;
        }

        if total > self.dual_pressure_threshold {
            dual_pressure_flow(from, to, from_fluid, total, pressure_factor)
        } else if total > self.single_pressure_threshold {
            single_pressure_flow(from, to, from_fluid, total, pressure_factor)
        } else {
            free_flow(from, to, from_fluid, to_fluid)
        }
    }

    /// Executes this flowable once: computes the transfer, caps it, and
    /// commits it to both cells with compare-and-swap. Returns the units
    /// actually moved.
    pub fn execute(&self, cells: &CellArena, config: &LavaConfig, tick: u64) -> i32 {
        let Some(from) = cells.get(self.from) else { return 0 };
        let Some(to) = cells.get(self.to) else { return 0 };

        for _ in 0..MAX_FLOW_CAS_ATTEMPTS {
            let from_fluid = from.fluid();
            let to_fluid = to.fluid();

            let mut amount =
                self.equalizing_flow(from, to, from_fluid, to_fluid, config.pressure_factor);
            amount = amount
                .min(self.max_flow_per_step)
                .min(from_fluid - from.retained_units());
            if amount < config.min_flow_units {
                return 0;
            }

            if !from.change_fluid_if_matches(-amount, from_fluid) {
                continue;
            }
            if !to.change_fluid_if_matches(amount, to_fluid) {
                // The second commit failed: undo the first before retrying,
                // or the fluid would be destroyed.
                from.change_fluid(amount);
                continue;
            }

            // Sub-visible trickles near equilibrium do not count as activity,
            // or settled pools would never start cooling.
            if amount >= SIGNIFICANT_FLOW_UNITS {
                from.touch_flow(tick);
                to.touch_flow(tick);
            }
            from.add_outflow(amount);
            log::trace!(
                "[FLOW] {:?} -> {:?}: {} units (drop {})",
                self.from,
                self.to,
                amount,
                self.drop_units
            );
            return amount;
        }
        0
    }
}

/// Free flow: equalize `floor + fluid` between the two cells. Floor division
/// leaves any odd unit on the source.
fn free_flow(from: &LavaCell, to: &LavaCell, from_fluid: i32, to_fluid: i32) -> i32 {
    let surface_from = from.floor_units() + from_fluid;
    let surface_to = to.floor_units() + to_fluid;
    (surface_from - surface_to) / 2
}

/// Single-pressure flow: the lower-ceiling cell is assumed to fill to its
/// ceiling and pressurize; the other stays free. Solves for the source's
/// equilibrium fluid, rounded up so the source keeps the remainder.
fn single_pressure_flow(
    from: &LavaCell,
    to: &LavaCell,
    from_fluid: i32,
    total: i32,
    pressure_factor: i32,
) -> i32 {
    let from_is_pressurized = from.ceiling_units() < to.ceiling_units();
    let equilibrium_from = if from_is_pressurized {
        // ceil_f + (f* - vol_f)·P = floor_t + (T - f*)
        ceil_div(
            to.floor_units() + total - from.ceiling_units() + from.volume_units() * pressure_factor,
            pressure_factor + 1,
        )
    } else {
        // floor_f + f* = ceil_t + (T - f* - vol_t)·P
        ceil_div(
            to.ceiling_units() - from.floor_units() + (total - to.volume_units()) * pressure_factor,
            pressure_factor + 1,
        )
    };
    from_fluid - equilibrium_from
}

/// Dual-pressure flow: both cells pressurized at equilibrium. Solves the
/// linear system of the two pressure-surface equations under conservation.
fn dual_pressure_flow(
    from: &LavaCell,
    to: &LavaCell,
    from_fluid: i32,
    total: i32,
    pressure_factor: i32,
) -> i32 {
    // ceil_f + (f* - vol_f)·P = ceil_t + (T - f* - vol_t)·P
    let equilibrium_from = ceil_div(
        to.ceiling_units() - from.ceiling_units()
            + (total - to.volume_units() + from.volume_units()) * pressure_factor,
        2 * pressure_factor,
    );
    from_fluid - equilibrium_from
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellArena;
    use crate::connection::ConnectionArena;
    use crate::units::{UNITS_PER_BLOCK, UNITS_PER_LEVEL};

    struct Rig {
        cells: CellArena,
        connections: ConnectionArena,
        a: CellId,
        b: CellId,
        id: ConnectionId,
        config: LavaConfig,
    }

    impl Rig {
        fn new(floor_a: i32, ceiling_a: i32, floor_b: i32, ceiling_b: i32) -> Self {
            let mut cells = CellArena::new();
            let a = cells.insert(0, 0, floor_a, ceiling_a);
            let b = cells.insert(1, 0, floor_b, ceiling_b);
            // Retention off so the math is easy to assert against.
            cells.get_mut(a).unwrap().set_retention(10);
            cells.get_mut(b).unwrap().set_retention(10);
            let mut connections = ConnectionArena::new();
            let id = connections.insert(a, b);
            cells.get_mut(a).unwrap().connections.push(id);
            cells.get_mut(b).unwrap().connections.push(id);
            Self {
                cells,
                connections,
                a,
                b,
                id,
                config: LavaConfig::default(),
            }
        }

        /// Runs setup + execute until no more fluid moves. Returns ticks used.
        fn settle(&mut self, max_ticks: u64) -> u64 {
            for tick in 1..=max_ticks {
                let Some(flowable) =
                    self.connections
                        .get_mut(self.id)
                        .unwrap()
                        .setup(&self.cells, &self.config, tick)
                else {
                    return tick;
                };
                let mut moved = 0;
                for _ in 0..self.config.step_count {
                    moved += flowable.execute(&self.cells, &self.config, tick);
                }
                if moved == 0 {
                    return tick;
                }
            }
            max_ticks
        }

        fn fluid(&self, id: CellId) -> i32 {
            self.cells.get(id).unwrap().fluid()
        }
    }

    #[test]
    fn test_flow_conserves_fluid() {
        let mut rig = Rig::new(0, 12, 0, 12);
        rig.cells.get(rig.a).unwrap().set_fluid(9000);
        rig.cells.get(rig.b).unwrap().set_fluid(1000);

        let flowable = rig
            .connections
            .get_mut(rig.id)
            .unwrap()
            .setup(&rig.cells, &rig.config, 1)
            .unwrap();
        let moved = flowable.execute(&rig.cells, &rig.config, 1);

        assert!(moved > 0);
        assert_eq!(rig.fluid(rig.a) + rig.fluid(rig.b), 10_000);
    }

    #[test]
    fn test_free_flow_equalizes_and_stops() {
        let mut rig = Rig::new(0, 12, 0, 12);
        rig.cells.get(rig.a).unwrap().set_fluid(8000);

        rig.settle(50);

        let surface_a = rig.cells.get(rig.a).unwrap().floor_units() + rig.fluid(rig.a);
        let surface_b = rig.cells.get(rig.b).unwrap().floor_units() + rig.fluid(rig.b);
        assert!((surface_a - surface_b).abs() < UNITS_PER_LEVEL);
        assert!(surface_a >= surface_b, "source must not undershoot target");
        assert_eq!(rig.fluid(rig.a) + rig.fluid(rig.b), 8000);
    }

    #[test]
    fn test_free_flow_respects_floor_offset() {
        // B's floor one block below A's, with enough total fluid that the
        // shared surface clears A's floor: equal surfaces, unequal fluids.
        let mut rig = Rig::new(12, 24, 0, 24);
        rig.cells.get(rig.a).unwrap().set_fluid(9000);
        rig.cells.get(rig.b).unwrap().set_fluid(18_000);

        rig.settle(50);

        let surface_a = rig.cells.get(rig.a).unwrap().floor_units() + rig.fluid(rig.a);
        let surface_b = rig.cells.get(rig.b).unwrap().floor_units() + rig.fluid(rig.b);
        assert!((surface_a - surface_b).abs() < UNITS_PER_LEVEL);
        assert!(rig.fluid(rig.b) > rig.fluid(rig.a));
        assert_eq!(rig.fluid(rig.a) + rig.fluid(rig.b), 27_000);
    }

    #[test]
    fn test_shallow_pool_above_dry_ledge_drains_to_retention() {
        // Too little fluid for the shared surface to reach A's floor: A pours
        // everything above its retained minimum over the ledge and stops.
        let mut rig = Rig::new(12, 24, 0, 24);
        rig.cells.get(rig.a).unwrap().set_fluid(9000);

        rig.settle(50);

        let retained = rig.cells.get(rig.a).unwrap().retained_units();
        assert_eq!(rig.fluid(rig.a), retained);
        assert_eq!(rig.fluid(rig.a) + rig.fluid(rig.b), 9000);
    }

    #[test]
    fn test_pressurized_cell_drains_into_empty_neighbor() {
        // A one block tall filled past its ceiling, B two blocks tall, empty.
        let mut rig = Rig::new(0, 12, 0, 24);
        rig.cells.get(rig.a).unwrap().set_fluid(13_000);

        rig.settle(100);

        let total = rig.fluid(rig.a) + rig.fluid(rig.b);
        assert_eq!(total, 13_000);

        // The pair settles within the equalization dead zone, pressure term
        // included.
        let p = rig.config.pressure_factor;
        let surface_a = rig.cells.get(rig.a).unwrap().pressure_surface_units(p);
        let surface_b = rig.cells.get(rig.b).unwrap().pressure_surface_units(p);
        assert!((surface_a - surface_b).abs() < UNITS_PER_LEVEL);
        assert!(rig.fluid(rig.b) > 0);
    }

    #[test]
    fn test_dual_pressure_converges_to_equal_pressure_surfaces() {
        // Same floors, uneven ceilings, total well past the dual threshold.
        let mut rig = Rig::new(0, 12, 0, 24);
        rig.cells.get(rig.a).unwrap().set_fluid(4 * UNITS_PER_BLOCK);
        rig.cells.get(rig.b).unwrap().set_fluid(0);

        rig.settle(200);

        let p = rig.config.pressure_factor;
        let surface_a = rig.cells.get(rig.a).unwrap().pressure_surface_units(p);
        let surface_b = rig.cells.get(rig.b).unwrap().pressure_surface_units(p);
        assert!(
            (surface_a - surface_b).abs() < UNITS_PER_LEVEL,
            "pressure surfaces diverge: {surface_a} vs {surface_b}"
        );
        // Both ended pressurized
        assert!(rig.fluid(rig.a) > rig.cells.get(rig.a).unwrap().volume_units());
        assert!(rig.fluid(rig.b) > rig.cells.get(rig.b).unwrap().volume_units());
    }

    #[test]
    fn test_no_flow_below_min_units() {
        let mut rig = Rig::new(0, 12, 0, 12);
        rig.cells.get(rig.a).unwrap().set_fluid(5000);
        rig.cells.get(rig.b).unwrap().set_fluid(5000 - 1);

        // One odd unit of difference is inside the dead zone.
        assert!(rig
            .connections
            .get_mut(rig.id)
            .unwrap()
            .setup(&rig.cells, &rig.config, 1)
            .is_none());
    }

    #[test]
    fn test_rollback_on_failed_target_cas_preserves_total() {
        // Direct check of the rollback path: force a stale expectation by
        // mutating the target between load and commit is not possible from a
        // single thread, so assert the arithmetic instead: executing against
        // concurrent-looking state never destroys fluid.
        let mut rig = Rig::new(0, 12, 0, 12);
        rig.cells.get(rig.a).unwrap().set_fluid(9000);
        let flowable = rig
            .connections
            .get_mut(rig.id)
            .unwrap()
            .setup(&rig.cells, &rig.config, 1)
            .unwrap();

        for _ in 0..10 {
            flowable.execute(&rig.cells, &rig.config, 1);
        }
        assert_eq!(rig.fluid(rig.a) + rig.fluid(rig.b), 9000);
    }

    #[test]
    fn test_flow_capped_per_step() {
        let mut rig = Rig::new(0, 12, 0, 12);
        rig.cells.get(rig.a).unwrap().set_fluid(12_000);

        let flowable = rig
            .connections
            .get_mut(rig.id)
            .unwrap()
            .setup(&rig.cells, &rig.config, 1)
            .unwrap();
        let moved = flowable.execute(&rig.cells, &rig.config, 1);
        assert!(moved <= flowable.max_flow_per_step);
    }
}
