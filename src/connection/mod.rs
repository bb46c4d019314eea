//! Connections: flow edges between horizontally adjacent cells.
//!
//! A connection exists while two cells in neighboring columns overlap
//! vertically. It owns neither cell; both endpoints keep its id in their
//! membership lists. The pair is canonicalized by ascending cell uid so the
//! same edge is never created twice and locks are always taken in a stable
//! order.
//!
//! ## Direction caches
//! The flow formulas depend on direction-specific quantities (drop, the two
//! pressure thresholds, the per-step cap). These are cached and recomputed
//! when the direction changes or when either cell's floor/ceiling moved
//! since the last setup — geometry can change through merges and splits
//! without flipping the direction, so invalidation is explicit rather than
//! piggybacked on direction changes.

pub mod flow;

use crate::cell::{CellArena, CellId};
use crate::config::constants::MAX_DROP_UNITS;
use crate::config::LavaConfig;
use crate::units::ceil_div;

pub use flow::Flowable;

/// Stable arena slot id of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u32);

impl ConnectionId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which endpoint is currently the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowDirection {
    #[default]
    None,
    FirstToSecond,
    SecondToFirst,
}

impl FlowDirection {
    #[inline]
    fn reversed(self) -> FlowDirection {
        match self {
            FlowDirection::None => FlowDirection::None,
            FlowDirection::FirstToSecond => FlowDirection::SecondToFirst,
            FlowDirection::SecondToFirst => FlowDirection::FirstToSecond,
        }
    }
}

/// A flow edge between exactly two adjacent cells.
#[derive(Debug)]
pub struct LavaConnection {
    id: ConnectionId,
    /// Endpoint with the lower uid.
    pub first: CellId,
    /// Endpoint with the higher uid.
    pub second: CellId,

    direction: FlowDirection,
    /// Tick on which `direction` last produced a flowable.
    direction_tick: u64,
    /// Set when either cell's bounds changed since the caches were built.
    shape_dirty: bool,

    // Direction-dependent caches, valid for `direction` only.
    drop_units: i32,
    single_pressure_threshold: i32,
    dual_pressure_threshold: i32,
    max_flow_per_step: i32,
}

impl LavaConnection {
    fn new(id: ConnectionId, first: CellId, second: CellId) -> Self {
        Self {
            id,
            first,
            second,
            direction: FlowDirection::None,
            direction_tick: 0,
            shape_dirty: true,
            drop_units: 0,
            single_pressure_threshold: 0,
            dual_pressure_threshold: 0,
            max_flow_per_step: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The other endpoint of this edge.
    #[inline]
    pub fn other(&self, cell: CellId) -> CellId {
        if cell == self.first {
            self.second
        } else {
            self.first
        }
    }

    /// Marks the direction caches stale. Called by the registry whenever
    /// either endpoint's floor or ceiling changes.
    #[inline]
    pub fn mark_shape_dirty(&mut self) {
        self.shape_dirty = true;
    }

    #[inline]
    pub fn drop_units(&self) -> i32 {
        self.drop_units
    }

    /// Per-tick flow setup: decides direction, applies reversal hysteresis,
    /// refreshes caches, and emits a [`Flowable`] if fluid should move.
    pub fn setup(
        &mut self,
        cells: &CellArena,
        config: &LavaConfig,
        tick: u64,
    ) -> Option<Flowable> {
        let first = cells.get(self.first)?;
        let second = cells.get(self.second)?;

        let surface_first = first.pressure_surface_units(config.pressure_factor);
        let surface_second = second.pressure_surface_units(config.pressure_factor);
        let gap = surface_first - surface_second;
        if gap.abs() < config.min_flow_units {
            return None;
        }

        let desired = if gap > 0 {
            FlowDirection::FirstToSecond
        } else {
            FlowDirection::SecondToFirst
        };

        // Hysteresis: a connection that flowed the other way last tick may
        // only reverse if the new gap clears the reversal threshold. Within
        // one tick the direction never reverses at all.
        if desired == self.direction.reversed() && self.direction != FlowDirection::None {
            if self.direction_tick == tick {
                return None;
            }
            if self.direction_tick + 1 == tick && gap.abs() <= config.reversal_threshold {
                return None;
            }
        }

        if desired != self.direction || self.shape_dirty {
            self.refresh_caches(first_second(desired, first, second), config);
            self.direction = desired;
            self.shape_dirty = false;
        }

        let (from, to) = match desired {
            FlowDirection::FirstToSecond => (first, second),
            FlowDirection::SecondToFirst => (second, first),
            FlowDirection::None => return None,
        };

        if from.available_fluid() < config.min_flow_units {
            return None;
        }

        // Stamped only when a flowable is actually emitted; a starved setup
        // must not arm the reversal hysteresis for the next tick.
        self.direction_tick = tick;

        Some(Flowable {
            connection: self.id,
            from: from.id(),
            to: to.id(),
            drop_units: self.drop_units,
            max_flow_per_step: self.max_flow_per_step,
            single_pressure_threshold: self.single_pressure_threshold,
            dual_pressure_threshold: self.dual_pressure_threshold,
        })
    }

    /// Rebuilds the direction-dependent caches for (from, to).
    fn refresh_caches(&mut self, pair: (&crate::cell::LavaCell, &crate::cell::LavaCell), config: &LavaConfig) {
        let (from, to) = pair;
        self.drop_units = (from.floor_units() - to.floor_units()).clamp(0, MAX_DROP_UNITS);

        let ceil_low = from.ceiling_units().min(to.ceiling_units());
        let ceil_high = from.ceiling_units().max(to.ceiling_units());

        // Total fluid at which the lower-ceiling cell fills to its ceiling
        // when surfaces are level.
        self.single_pressure_threshold = (ceil_low - from.floor_units()).max(0)
            + (ceil_low - to.floor_units()).max(0);

        // Total fluid at which even the higher-ceiling cell is full, with the
        // lower cell pressurized up to the higher ceiling.
        self.dual_pressure_threshold = from.volume_units()
            + to.volume_units()
            + ceil_div(ceil_high - ceil_low, config.pressure_factor);

        // Per-step throughput follows the open cross-section shared by the
        // two spans, spread across the tick's steps.
        let overlap_units = (from.ceiling_units().min(to.ceiling_units())
            - from.floor_units().max(to.floor_units()))
        .max(0);
        self.max_flow_per_step =
            (overlap_units / config.step_count.max(1) as i32).max(config.min_flow_units);
    }
}

#[inline]
fn first_second<'a>(
    direction: FlowDirection,
    first: &'a crate::cell::LavaCell,
    second: &'a crate::cell::LavaCell,
) -> (&'a crate::cell::LavaCell, &'a crate::cell::LavaCell) {
    match direction {
        FlowDirection::SecondToFirst => (second, first),
        _ => (first, second),
    }
}

/// Slot arena owning every connection in the simulation.
#[derive(Debug, Default)]
pub struct ConnectionArena {
    slots: Vec<Option<LavaConnection>>,
    free: Vec<u32>,
    live: usize,
}

impl ConnectionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connection between two cells. Endpoints must already be
    /// canonicalized (first = lower uid) by the caller.
    pub fn insert(&mut self, first: CellId, second: CellId) -> ConnectionId {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let id = ConnectionId(slot);
            self.slots[id.index()] = Some(LavaConnection::new(id, first, second));
            id
        } else {
            let id = ConnectionId(self.slots.len() as u32);
            self.slots.push(Some(LavaConnection::new(id, first, second)));
            id
        }
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<LavaConnection> {
        let connection = self.slots.get_mut(id.index())?.take()?;
        self.free.push(id.0);
        self.live -= 1;
        Some(connection)
    }

    #[inline]
    pub fn get(&self, id: ConnectionId) -> Option<&LavaConnection> {
        self.slots.get(id.index())?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut LavaConnection> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Raw slot access for batched parallel setup.
    pub fn slots_mut(&mut self) -> &mut [Option<LavaConnection>] {
        &mut self.slots
    }

    pub fn iter(&self) -> impl Iterator<Item = &LavaConnection> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UNITS_PER_BLOCK;

    fn pair(
        floor_a: i32,
        ceiling_a: i32,
        floor_b: i32,
        ceiling_b: i32,
    ) -> (CellArena, CellId, CellId, ConnectionArena, ConnectionId) {
        let mut cells = CellArena::new();
        let a = cells.insert(0, 0, floor_a, ceiling_a);
        let b = cells.insert(1, 0, floor_b, ceiling_b);
        let mut connections = ConnectionArena::new();
        let id = connections.insert(a, b);
        cells.get_mut(a).unwrap().connections.push(id);
        cells.get_mut(b).unwrap().connections.push(id);
        (cells, a, b, connections, id)
    }

    #[test]
    fn test_setup_no_flow_at_equal_surfaces() {
        let (cells, a, b, mut connections, id) = pair(0, 12, 0, 12);
        cells.get(a).unwrap().set_fluid(3000);
        cells.get(b).unwrap().set_fluid(3000);
        let config = LavaConfig::default();
        assert!(connections.get_mut(id).unwrap().setup(&cells, &config, 1).is_none());
    }

    #[test]
    fn test_setup_picks_higher_surface_as_source() {
        let (cells, a, _b, mut connections, id) = pair(0, 12, 0, 12);
        cells.get(a).unwrap().set_fluid(6000);
        let config = LavaConfig::default();
        let flowable = connections
            .get_mut(id)
            .unwrap()
            .setup(&cells, &config, 1)
            .unwrap();
        assert_eq!(flowable.from, a);
    }

    #[test]
    fn test_no_reversal_within_reversal_threshold() {
        let (cells, a, b, mut connections, id) = pair(0, 12, 0, 12);
        let config = LavaConfig::default();

        cells.get(a).unwrap().set_fluid(6000);
        let flowable = connections
            .get_mut(id)
            .unwrap()
            .setup(&cells, &config, 1)
            .unwrap();
        assert_eq!(flowable.from, a);

        // Next tick the surfaces flipped, but by less than the threshold:
        // the connection refuses to reverse.
        cells.get(a).unwrap().set_fluid(2000);
        cells.get(b).unwrap().set_fluid(2000 + config.reversal_threshold / 2);
        assert!(connections.get_mut(id).unwrap().setup(&cells, &config, 2).is_none());

        // A decisive flip reverses.
        cells.get(b).unwrap().set_fluid(2000 + config.reversal_threshold * 2);
        let flowable = connections
            .get_mut(id)
            .unwrap()
            .setup(&cells, &config, 3)
            .unwrap();
        assert_eq!(flowable.from, b);
    }

    #[test]
    fn test_dead_zone_width_is_configurable() {
        let (cells, a, _b, mut connections, id) = pair(0, 12, 0, 12);
        cells.get(a).unwrap().set_fluid(5000);

        let mut config = LavaConfig::default();
        config.min_flow_units = 6000;
        assert!(connections.get_mut(id).unwrap().setup(&cells, &config, 1).is_none());

        config.min_flow_units = 2;
        assert!(connections.get_mut(id).unwrap().setup(&cells, &config, 1).is_some());
    }

    #[test]
    fn test_starved_setup_does_not_arm_hysteresis() {
        let (cells, a, b, mut connections, id) = pair(0, 12, 0, 12);
        let config = LavaConfig::default();

        // A's surface is higher, but nothing above the retained minimum is
        // available: no flowable.
        let retained = cells.get(a).unwrap().retained_units();
        cells.get(a).unwrap().set_fluid(retained);
        assert!(connections.get_mut(id).unwrap().setup(&cells, &config, 1).is_none());

        // Next tick B is higher by less than the reversal threshold. Nothing
        // flowed on tick 1, so the reversal must not be suppressed.
        cells.get(b).unwrap().set_fluid(retained + config.reversal_threshold / 2);
        let flowable = connections
            .get_mut(id)
            .unwrap()
            .setup(&cells, &config, 2)
            .unwrap();
        assert_eq!(flowable.from, b);
    }

    #[test]
    fn test_drop_reflects_floor_difference() {
        // Source floor one block above target floor
        let (cells, a, _b, mut connections, id) = pair(12, 24, 0, 24);
        cells.get(a).unwrap().set_fluid(6000);
        let config = LavaConfig::default();
        let flowable = connections
            .get_mut(id)
            .unwrap()
            .setup(&cells, &config, 1)
            .unwrap();
        assert_eq!(flowable.drop_units, UNITS_PER_BLOCK);
    }

    #[test]
    fn test_thresholds_for_uneven_ceilings() {
        // A: one block tall, B: two blocks tall, same floor
        let (cells, a, _b, mut connections, id) = pair(0, 12, 0, 24);
        cells.get(a).unwrap().set_fluid(6000);
        let config = LavaConfig::default();
        let flowable = connections
            .get_mut(id)
            .unwrap()
            .setup(&cells, &config, 1)
            .unwrap();

        // Both cells can hold one block below A's ceiling
        assert_eq!(flowable.single_pressure_threshold, 2 * UNITS_PER_BLOCK);
        // Dual: both volumes plus the ceiling gap compressed by the factor
        assert_eq!(
            flowable.dual_pressure_threshold,
            3 * UNITS_PER_BLOCK + UNITS_PER_BLOCK / config.pressure_factor
        );
    }

    #[test]
    fn test_retention_starves_setup() {
        let (cells, a, _b, mut connections, id) = pair(0, 12, 0, 12);
        let config = LavaConfig::default();
        // Fluid at or below the retained minimum produces no flowable
        let retained = cells.get(a).unwrap().retained_units();
        cells.get(a).unwrap().set_fluid(retained);
        assert!(connections.get_mut(id).unwrap().setup(&cells, &config, 1).is_none());
    }
}
