//! The cell registry: every chunk, cell and connection in the simulation.
//!
//! The registry owns the two arenas and the chunk map and performs all
//! structural mutation: column validation against world geometry, connection
//! graph maintenance, retention refresh, cooling, and chunk lifecycle. All of
//! it runs in the serial phase of a tick; the parallel flow phase only ever
//! touches the cells' atomic fields.
//!
//! ## Design Principles
//! - Structure is rebuilt lazily: world changes flag columns, flagged columns
//!   are validated under a per-tick budget, and validation flags cells whose
//!   connections must be re-derived.
//! - Connection pairs are canonicalized by ascending cell uid, and both cell
//!   locks are taken in that order when an edge is formed, so the same edge is
//!   never created twice and lock order is stable.
//! - Deleted cells carry their connection ids out of the column pass; the
//!   registry severs the far endpoints afterwards and flags them for rebuild.

use std::collections::HashMap;

use bevy::math::IVec2;
use rand::Rng;

use crate::cell::builder::{ColumnBuilder, RebuildOutcome};
use crate::cell::column::{ColumnMut, RemovedCell};
use crate::cell::{CellArena, CellId, LavaCell};
use crate::chunk::{chunk_key, column_index, ChunkEdge, LavaChunk, CHUNK_SIZE, COLUMNS_PER_CHUNK};
use crate::config::constants::MAX_LOCK_ATTEMPTS;
use crate::config::LavaConfig;
use crate::connection::{ConnectionArena, ConnectionId};
use crate::geometry::WorldGeometry;
use crate::sink::{CellStateSink, LifecycleHooks, SurfaceReport};

/// Owner of the full cell/connection graph and its spatial chunk index.
#[derive(Debug, Default)]
pub struct LavaCellRegistry {
    pub cells: CellArena,
    pub connections: ConnectionArena,
    chunks: HashMap<IVec2, LavaChunk>,
    builder: ColumnBuilder,
    /// Cells deleted by column passes, pending connection severing.
    removed: Vec<RemovedCell>,
}

impl LavaCellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Chunk access
    // ------------------------------------------------------------------

    pub fn chunk(&self, key: IVec2) -> Option<&LavaChunk> {
        self.chunks.get(&key)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn get_or_create_chunk(&mut self, key: IVec2) -> &mut LavaChunk {
        self.chunks.entry(key).or_insert_with(|| {
            log::debug!("[CHUNK] Created chunk {:?}", key);
            LavaChunk::new(key)
        })
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Flags column (x, z) for validation against world geometry, creating
    /// its chunk if needed.
    pub fn flag_column(&mut self, x: i32, z: i32) {
        let chunk = self.get_or_create_chunk(chunk_key(x, z));
        chunk.flag_column(column_index(x, z));
    }

    /// Total columns awaiting validation.
    pub fn pending_validations(&self) -> usize {
        self.chunks
            .values()
            .map(|chunk| chunk.pending_validations())
            .sum()
    }

    /// Validates up to `budget` flagged columns against `geometry`.
    ///
    /// Columns whose geometry is unavailable or whose changes were refused
    /// are pushed to `deferred` instead of staying flagged; the caller routes
    /// them through the bounded-retry event queue so a permanently stuck
    /// column cannot burn validation budget forever. Returns columns
    /// processed.
    pub fn validate_flagged(
        &mut self,
        geometry: &dyn WorldGeometry,
        budget: usize,
        tick: u64,
        deferred: &mut Vec<(i32, i32)>,
    ) -> usize {
        let keys: Vec<IVec2> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.pending_validations() > 0)
            .map(|(key, _)| *key)
            .collect();

        let mut processed = 0;
        let mut indices = Vec::new();
        for key in keys {
            if processed >= budget {
                break;
            }
            indices.clear();
            let Some(chunk) = self.chunks.get_mut(&key) else { continue };
            chunk.take_flagged(budget - processed, &mut indices);

            for &index in &indices {
                let x = key.x * CHUNK_SIZE + index as i32 % CHUNK_SIZE;
                let z = key.y * CHUNK_SIZE + index as i32 / CHUNK_SIZE;
                let outcome = {
                    let mut column = ColumnMut {
                        arena: &mut self.cells,
                        entry: &mut chunk.columns[index],
                        x,
                        z,
                        removed: &mut self.removed,
                        tick,
                    };
                    self.builder.rebuild(geometry, &mut column)
                };
                if outcome == RebuildOutcome::Deferred {
                    deferred.push((x, z));
                }
                processed += 1;
            }
        }

        self.sever_removed();
        processed
    }

    // ------------------------------------------------------------------
    // Connection graph maintenance
    // ------------------------------------------------------------------

    /// Re-derives connections for every cell flagged by structural changes.
    pub fn update_connections(&mut self) {
        let flagged: Vec<CellId> = self
            .cells
            .iter()
            .filter(|cell| cell.needs_connection_update)
            .map(|cell| cell.id())
            .collect();
        for id in flagged {
            let complete = self.refresh_cell_connections(id);
            if let Some(cell) = self.cells.get_mut(id) {
                cell.needs_connection_update = !complete;
            }
        }
    }

    /// Reconciles one cell's connection list against the cells currently
    /// overlapping it in the four neighboring columns. Returns false if a
    /// connection could not be formed (lock contention); the cell stays
    /// flagged for the next tick.
    fn refresh_cell_connections(&mut self, id: CellId) -> bool {
        let Some(cell) = self.cells.get(id) else { return true };
        if cell.deleted {
            return true;
        }
        let (x, z) = (cell.x, cell.z);
        let (floor, ceiling) = (cell.floor(), cell.ceiling());

        // Drop edges whose endpoints no longer overlap; keep the rest but
        // mark their direction caches stale since our bounds may have moved.
        let existing: Vec<ConnectionId> = cell.connections.clone();
        for cid in existing {
            let Some(connection) = self.connections.get(cid) else {
                if let Some(cell) = self.cells.get_mut(id) {
                    cell.connections.retain(|&c| c != cid);
                }
                continue;
            };
            let other_id = connection.other(id);
            let keep = self.cells.get(other_id).is_some_and(|other| {
                !other.deleted && floor < other.ceiling() && other.floor() < ceiling
            });
            if keep {
                if let Some(connection) = self.connections.get_mut(cid) {
                    connection.mark_shape_dirty();
                }
            } else {
                self.remove_connection(cid);
            }
        }

        // Form edges to newly overlapping neighbor cells. Only existing
        // chunks are consulted; unloaded neighbors are reached through edge
        // retention and later validation.
        let mut complete = true;
        let mut neighbor_ids: Vec<CellId> = Vec::new();
        for (dx, dz) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
            let (nx, nz) = (x + dx, z + dz);
            let Some(neighbor_chunk) = self.chunks.get(&chunk_key(nx, nz)) else {
                continue;
            };
            neighbor_ids.clear();
            let mut cursor = neighbor_chunk.columns[column_index(nx, nz)];
            while let Some(nid) = cursor {
                let Some(neighbor) = self.cells.get(nid) else { break };
                if neighbor.floor() >= ceiling {
                    break;
                }
                if floor < neighbor.ceiling() {
                    neighbor_ids.push(nid);
                }
                cursor = neighbor.above;
            }
            for &nid in &neighbor_ids {
                let already = self.cells.get(id).is_some_and(|cell| {
                    cell.connections.iter().any(|&cid| {
                        self.connections
                            .get(cid)
                            .is_some_and(|connection| connection.other(id) == nid)
                    })
                });
                if !already && !self.create_connection(id, nid) {
                    complete = false;
                }
            }
        }
        complete
    }

    /// Forms a connection between two cells, canonicalized by ascending uid,
    /// taking both cell locks in that order. Returns false on contention.
    fn create_connection(&mut self, a: CellId, b: CellId) -> bool {
        let (Some(cell_a), Some(cell_b)) = (self.cells.get(a), self.cells.get(b)) else {
            return true;
        };
        let (first, second) = if cell_a.uid() <= cell_b.uid() {
            (a, b)
        } else {
            (b, a)
        };

        let mut locked = false;
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let (Some(first_cell), Some(second_cell)) =
                (self.cells.get(first), self.cells.get(second))
            else {
                return true;
            };
            if first_cell.try_lock() {
                if second_cell.try_lock() {
                    locked = true;
                    break;
                }
                first_cell.unlock();
            }
        }
        if !locked {
            log::trace!(
                "[CONNECT] Lock contention forming {:?} <-> {:?}, retrying next tick",
                first,
                second
            );
            return false;
        }

        let id = self.connections.insert(first, second);
        if let Some(cell) = self.cells.get_mut(first) {
            cell.connections.push(id);
        }
        if let Some(cell) = self.cells.get_mut(second) {
            cell.connections.push(id);
        }
        if let Some(cell) = self.cells.get(first) {
            cell.unlock();
        }
        if let Some(cell) = self.cells.get(second) {
            cell.unlock();
        }
        true
    }

    /// Removes a connection from the arena and both endpoint membership lists.
    fn remove_connection(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.remove(id) {
            for endpoint in [connection.first, connection.second] {
                if let Some(cell) = self.cells.get_mut(endpoint) {
                    cell.connections.retain(|&c| c != id);
                }
            }
        }
    }

    /// Severs the connections carried by cells deleted during column passes
    /// and flags the surviving endpoints for a connection rebuild.
    fn sever_removed(&mut self) {
        while let Some(removed) = self.removed.pop() {
            for cid in removed.connections {
                let Some(connection) = self.connections.remove(cid) else {
                    continue;
                };
                let other_id = connection.other(removed.id);
                if let Some(other) = self.cells.get_mut(other_id) {
                    other.connections.retain(|&c| c != cid);
                    other.needs_connection_update = true;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Recomputes retention for every cell whose floor, surface type or
    /// neighborhood changed. Cells above a steep drop retain less.
    pub fn refresh_retention(&mut self) {
        let dirty: Vec<CellId> = self
            .cells
            .iter()
            .filter(|cell| cell.retention_dirty())
            .map(|cell| cell.id())
            .collect();
        for id in dirty {
            let Some(cell) = self.cells.get(id) else { continue };
            let mut steepest = 0;
            for &cid in &cell.connections {
                let Some(connection) = self.connections.get(cid) else {
                    continue;
                };
                if let Some(other) = self.cells.get(connection.other(id)) {
                    steepest = steepest.max(cell.floor() - other.floor());
                }
            }
            if let Some(cell) = self.cells.get_mut(id) {
                cell.set_retention(steepest);
            }
        }
    }

    // ------------------------------------------------------------------
    // Cooling
    // ------------------------------------------------------------------

    /// Number of horizontal sides with a fluid-holding connected neighbor.
    fn hot_sides(&self, cell: &LavaCell) -> u32 {
        let mut sides = [false; 4];
        for &cid in &cell.connections {
            let Some(connection) = self.connections.get(cid) else {
                continue;
            };
            let Some(other) = self.cells.get(connection.other(cell.id())) else {
                continue;
            };
            if other.fluid() <= 0 {
                continue;
            }
            let side = match (other.x - cell.x, other.z - cell.z) {
                (-1, 0) => 0,
                (1, 0) => 1,
                (0, -1) => 2,
                (0, 1) => 3,
                _ => continue,
            };
            sides[side] = true;
        }
        sides.iter().filter(|hot| **hot).count() as u32
    }

    /// Solidifies every cell eligible to cool this tick. Cooled spans report
    /// through `hooks`; fluid-connected neighbors get a randomized cooling
    /// delay so a front does not solidify in lock-step. Returns cells cooled.
    pub fn cooling_pass<R: Rng>(
        &mut self,
        tick: u64,
        config: &LavaConfig,
        hooks: &mut dyn LifecycleHooks,
        rng: &mut R,
    ) -> usize {
        if !config.cooling_enabled {
            return 0;
        }

        let mut candidates: Vec<CellId> = Vec::new();
        for cell in self.cells.iter() {
            if cell.fluid() <= 0 || cell.cooling_disabled {
                continue;
            }
            let hot = self.hot_sides(cell);
            if cell.can_cool(tick, hot, config, rng) {
                candidates.push(cell.id());
            }
        }

        let mut cooled = 0;
        for id in candidates {
            // A neighbor that solidified earlier in this pass delays this
            // cell's cooling clock; eligibility must hold at the moment of
            // solidification, not just at gathering time.
            let eligible = self.cells.get(id).is_some_and(|cell| {
                let hot = self.hot_sides(cell);
                cell.can_cool(tick, hot, config, rng)
            });
            if !eligible {
                continue;
            }

            let neighbor_ids: Vec<CellId> = match self.cells.get(id) {
                Some(cell) => cell
                    .connections
                    .iter()
                    .filter_map(|&cid| self.connections.get(cid).map(|c| c.other(id)))
                    .collect(),
                None => continue,
            };

            let Some(cell) = self.cells.get_mut(id) else { continue };
            let (x, z) = (cell.x, cell.z);
            let ceiling = cell.ceiling();
            let (old_floor, surface) = cell.cool_and_shrink();
            cooled += 1;
            log::debug!(
                "[COOLING] Cell at ({}, {}) solidified: floor {} -> {}",
                x,
                z,
                old_floor,
                surface
            );
            hooks.on_cell_cooled(x, z, old_floor, surface);

            for nid in neighbor_ids {
                if let Some(neighbor) = self.cells.get(nid) {
                    neighbor.delay_cooling(tick, config, rng);
                }
            }

            // A cell that solidified up to its ceiling has no open span left.
            if surface >= ceiling {
                self.delete_cell_in_column(id, x, z, tick);
            }
        }
        self.sever_removed();
        cooled
    }

    /// Deletes one cell through its column so the links stay consistent.
    fn delete_cell_in_column(&mut self, id: CellId, x: i32, z: i32, tick: u64) {
        let Some(chunk) = self.chunks.get_mut(&chunk_key(x, z)) else {
            return;
        };
        let mut column = ColumnMut {
            arena: &mut self.cells,
            entry: &mut chunk.columns[column_index(x, z)],
            x,
            z,
            removed: &mut self.removed,
            tick,
        };
        column.delete_cell(id);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Per-tick lifecycle sweep: recomputes chunk activity, propagates edge
    /// retention to neighbors, reports activity transitions, and unloads
    /// chunks that idled out.
    pub fn update_lifecycle(
        &mut self,
        config: &LavaConfig,
        hooks: &mut dyn LifecycleHooks,
        tick: u64,
    ) {
        let keys: Vec<IVec2> = self.chunks.keys().copied().collect();

        // Recompute per-chunk activity from the cells and diff edge retains.
        let mut retain_changes: Vec<(IVec2, bool)> = Vec::new();
        for key in &keys {
            let Some(chunk) = self.chunks.get_mut(key) else { continue };
            chunk.active_count = 0;
            chunk.edge_active = [0; 4];
            for index in 0..COLUMNS_PER_CHUNK {
                let mut active = false;
                let mut cursor = chunk.columns[index];
                while let Some(id) = cursor {
                    let Some(cell) = self.cells.get(id) else { break };
                    if cell.fluid() > 0 || cell.has_refresh() {
                        active = true;
                    }
                    cursor = cell.above;
                }
                if active {
                    chunk.active_count += 1;
                    let local_x = index as i32 % CHUNK_SIZE;
                    let local_z = index as i32 / CHUNK_SIZE;
                    for edge in ChunkEdge::edges_of_local(local_x, local_z) {
                        chunk.edge_active[edge.index()] += 1;
                    }
                }
            }
            for edge in ChunkEdge::ALL {
                let desired = chunk.edge_active[edge.index()] > 0;
                if desired != chunk.retains_held[edge.index()] {
                    chunk.retains_held[edge.index()] = desired;
                    retain_changes.push((*key + edge.neighbor_offset(), desired));
                }
            }
        }

        for (neighbor, retain) in retain_changes {
            if retain {
                // Retaining an edge keeps the neighbor loaded before any lava
                // reaches it, so flow across the border lands in live cells.
                self.get_or_create_chunk(neighbor).retain_count += 1;
            } else if let Some(chunk) = self.chunks.get_mut(&neighbor) {
                chunk.retain_count -= 1;
            }
        }

        // Report transitions and collect idle chunks.
        let mut to_unload: Vec<IVec2> = Vec::new();
        for key in &keys {
            let Some(chunk) = self.chunks.get_mut(key) else { continue };
            let active = chunk.active_count > 0;
            if active != chunk.reported_active {
                chunk.reported_active = active;
                hooks.on_chunk_active_changed(*key, active);
            }
            if chunk.active_count == 0
                && chunk.retain_count == 0
                && chunk.pending_validations() == 0
            {
                chunk.idle_ticks += 1;
            } else {
                chunk.idle_ticks = 0;
            }
            if chunk.is_unloadable(config.chunk_unload_ticks) && !chunk.reported_unloadable {
                chunk.reported_unloadable = true;
                to_unload.push(*key);
            }
        }
        for key in to_unload {
            self.unload_chunk(key, hooks, tick);
        }
    }

    /// Deletes an idle chunk's cells (top-down per column) and reports the
    /// chunk unloadable to the host.
    fn unload_chunk(&mut self, key: IVec2, hooks: &mut dyn LifecycleHooks, tick: u64) {
        let Some(mut chunk) = self.chunks.remove(&key) else { return };
        debug_assert_eq!(chunk.retains_held, [false; 4]);

        for index in 0..COLUMNS_PER_CHUNK {
            let x = key.x * CHUNK_SIZE + index as i32 % CHUNK_SIZE;
            let z = key.y * CHUNK_SIZE + index as i32 / CHUNK_SIZE;
            let mut column = ColumnMut {
                arena: &mut self.cells,
                entry: &mut chunk.columns[index],
                x,
                z,
                removed: &mut self.removed,
                tick,
            };
            let ids = column.cell_ids();
            for id in ids.into_iter().rev() {
                column.delete_cell(id);
            }
        }
        self.sever_removed();
        log::debug!("[CHUNK] Unloaded idle chunk {:?}", key);
        hooks.on_chunk_unloadable(key);
    }

    /// Splices a restored cell into its column, creating the chunk if needed.
    /// Returns `None` if the span conflicts with an already-restored cell.
    pub fn restore_cell(&mut self, x: i32, z: i32, floor: i32, ceiling: i32) -> Option<CellId> {
        // Field-precise chunk lookup so the cell arena stays borrowable below.
        let key = chunk_key(x, z);
        let chunk = self.chunks.entry(key).or_insert_with(|| {
            log::debug!("[CHUNK] Created chunk {:?}", key);
            LavaChunk::new(key)
        });
        let mut column = ColumnMut {
            arena: &mut self.cells,
            entry: &mut chunk.columns[column_index(x, z)],
            x,
            z,
            removed: &mut self.removed,
            tick: 0,
        };
        column.insert_span(floor, ceiling)
    }

    // ------------------------------------------------------------------
    // Reporting and per-tick scratch
    // ------------------------------------------------------------------

    /// Clears per-tick scratch counters on every cell.
    pub fn begin_tick(&self) {
        for cell in self.cells.iter() {
            cell.reset_tick_scratch();
        }
    }

    /// Reports every cell whose visible surface or dirty range changed since
    /// the last report.
    pub fn report_surfaces(&mut self, sink: &mut dyn CellStateSink) {
        let ids: Vec<CellId> = self.cells.ids().collect();
        for id in ids {
            let Some(cell) = self.cells.get_mut(id) else { continue };
            let surface = cell.world_surface_level();
            if surface == cell.last_visible_level && !cell.has_refresh() {
                continue;
            }
            let mut low = surface.min(cell.last_visible_level);
            let mut high = surface.max(cell.last_visible_level);
            if let Some((refresh_low, refresh_high)) = cell.take_refresh() {
                low = low.min(refresh_low);
                high = high.max(refresh_high);
            }
            cell.last_visible_level = surface;
            sink.report_surface(SurfaceReport {
                x: cell.x,
                z: cell.z,
                visible_level: surface,
                dirty_low: low,
                dirty_high: high,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BlockClass, ColumnSnapshot};
    use crate::sink::NullSink;
    use crate::units::{UNITS_PER_BLOCK, UNITS_PER_LEVEL};
    use rand::rngs::mock::StepRng;

    /// Uniform world: one barrier floor at y=0, open space above.
    struct FlatWorld {
        height: usize,
    }

    impl WorldGeometry for FlatWorld {
        fn column_snapshot(&self, _x: i32, _z: i32, snapshot: &mut ColumnSnapshot) -> bool {
            snapshot.reset(0);
            snapshot.classes.push(BlockClass::Barrier);
            for _ in 0..self.height {
                snapshot.classes.push(BlockClass::Space);
            }
            true
        }
    }

    /// World where every block is solid.
    struct SolidWorld;

    impl WorldGeometry for SolidWorld {
        fn column_snapshot(&self, _x: i32, _z: i32, snapshot: &mut ColumnSnapshot) -> bool {
            snapshot.reset(0);
            for _ in 0..4 {
                snapshot.classes.push(BlockClass::Barrier);
            }
            true
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        active_changes: Vec<(IVec2, bool)>,
        unloadable: Vec<IVec2>,
        cooled: Vec<(i32, i32, i32, i32)>,
    }

    impl LifecycleHooks for RecordingHooks {
        fn on_chunk_active_changed(&mut self, chunk: IVec2, active: bool) {
            self.active_changes.push((chunk, active));
        }
        fn on_chunk_unloadable(&mut self, chunk: IVec2) {
            self.unloadable.push(chunk);
        }
        fn on_cell_cooled(&mut self, x: i32, z: i32, floor_level: i32, surface_level: i32) {
            self.cooled.push((x, z, floor_level, surface_level));
        }
    }

    fn cell_at(registry: &LavaCellRegistry, x: i32, z: i32) -> CellId {
        let chunk = registry.chunk(chunk_key(x, z)).unwrap();
        chunk.columns[column_index(x, z)].unwrap()
    }

    fn build_columns(registry: &mut LavaCellRegistry, world: &dyn WorldGeometry, columns: &[(i32, i32)]) {
        for &(x, z) in columns {
            registry.flag_column(x, z);
        }
        registry.validate_flagged(world, usize::MAX, 1, &mut Vec::new());
        registry.update_connections();
    }

    #[test]
    fn test_adjacent_columns_connect() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(0, 0), (1, 0)]);

        assert_eq!(registry.cells.len(), 2);
        assert_eq!(registry.connections.len(), 1);

        let a = cell_at(&registry, 0, 0);
        let b = cell_at(&registry, 1, 0);
        let connection = registry.connections.iter().next().unwrap();
        assert_eq!(connection.other(a), b);
    }

    #[test]
    fn test_connection_update_is_idempotent() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(0, 0), (1, 0), (0, 1)]);

        // Corner-adjacent columns never connect; only the two face pairs do.
        assert_eq!(registry.connections.len(), 2);
        registry.update_connections();
        assert_eq!(registry.connections.len(), 2);
    }

    #[test]
    fn test_deleting_column_severs_connections() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(0, 0), (1, 0)]);
        assert_eq!(registry.connections.len(), 1);

        // Column (1, 0) turns fully solid.
        registry.flag_column(1, 0);
        registry.validate_flagged(&SolidWorld, usize::MAX, 2, &mut Vec::new());

        assert_eq!(registry.cells.len(), 1);
        assert_eq!(registry.connections.len(), 0);
        let survivor = registry.cells.iter().next().unwrap();
        assert!(survivor.connections.is_empty());
        assert!(survivor.needs_connection_update);
    }

    #[test]
    fn test_retention_halved_on_slope() {
        let mut registry = LavaCellRegistry::new();
        // Column (1, 0) floor is two levels below (0, 0): a steep edge.
        struct Steps;
        impl WorldGeometry for Steps {
            fn column_snapshot(&self, x: i32, _z: i32, snapshot: &mut ColumnSnapshot) -> bool {
                snapshot.reset(0);
                if x == 0 {
                    snapshot.classes.push(BlockClass::PartialSolid { flow_height: 4 });
                } else {
                    snapshot.classes.push(BlockClass::PartialSolid { flow_height: 2 });
                }
                snapshot.classes.push(BlockClass::Space);
                true
            }
        }
        build_columns(&mut registry, &Steps, &[(0, 0), (1, 0)]);
        registry.refresh_retention();

        let high = registry.cells.get(cell_at(&registry, 0, 0)).unwrap();
        let low = registry.cells.get(cell_at(&registry, 1, 0)).unwrap();
        // Both sit on flow surfaces; the higher one drains harder.
        assert_eq!(
            high.retained_units(),
            crate::config::constants::RETENTION_FLOW_FLOOR / 2
        );
        assert_eq!(
            low.retained_units(),
            crate::config::constants::RETENTION_FLOW_FLOOR
        );
    }

    #[test]
    fn test_edge_activity_retains_neighbor_chunk() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        // Column at the +x edge of chunk (0, 0).
        build_columns(&mut registry, &world, &[(15, 4)]);
        let id = cell_at(&registry, 15, 4);
        registry.cells.get(id).unwrap().set_fluid(UNITS_PER_BLOCK);

        let config = LavaConfig::default();
        let mut hooks = RecordingHooks::default();
        registry.update_lifecycle(&config, &mut hooks, 1);

        assert_eq!(hooks.active_changes, vec![(IVec2::new(0, 0), true)]);
        let neighbor = registry.chunk(IVec2::new(1, 0)).unwrap();
        assert_eq!(neighbor.retain_count, 1);

        // Draining the cell releases the retain.
        registry.cells.get(id).unwrap().set_fluid(0);
        registry.report_surfaces(&mut NullSink);
        registry.update_lifecycle(&config, &mut hooks, 2);
        let neighbor = registry.chunk(IVec2::new(1, 0)).unwrap();
        assert_eq!(neighbor.retain_count, 0);
    }

    #[test]
    fn test_idle_chunk_unloads_and_deletes_cells() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(4, 4)]);
        assert_eq!(registry.cells.len(), 1);
        // Flush the creation refresh so the chunk reads as inactive.
        registry.report_surfaces(&mut NullSink);

        let config = LavaConfig::default();
        let mut hooks = RecordingHooks::default();
        for tick in 1..=u64::from(config.chunk_unload_ticks) + 1 {
            registry.update_lifecycle(&config, &mut hooks, tick);
        }

        assert_eq!(hooks.unloadable, vec![IVec2::new(0, 0)]);
        assert_eq!(registry.chunk_count(), 0);
        assert_eq!(registry.cells.len(), 0);
    }

    #[test]
    fn test_cooling_pass_solidifies_idle_cell() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(0, 0)]);
        let id = cell_at(&registry, 0, 0);
        {
            let cell = registry.cells.get(id).unwrap();
            cell.set_fluid(5 * UNITS_PER_LEVEL);
            cell.touch_flow(1);
        }

        let config = LavaConfig::default();
        let mut hooks = RecordingHooks::default();
        let mut rng = StepRng::new(0, 0);

        // Still hot: nothing cools.
        let cooled = registry.cooling_pass(100, &config, &mut hooks, &mut rng);
        assert_eq!(cooled, 0);

        let tick = 2 + config.cooling_idle_ticks;
        let cooled = registry.cooling_pass(tick, &config, &mut hooks, &mut rng);
        assert_eq!(cooled, 1);
        assert_eq!(hooks.cooled, vec![(0, 0, 12, 17)]);

        let cell = registry.cells.get(id).unwrap();
        assert_eq!(cell.fluid(), 0);
        assert_eq!(cell.floor(), 17);
    }

    #[test]
    fn test_restore_cell_splices_column() {
        let mut registry = LavaCellRegistry::new();
        let low = registry.restore_cell(3, 4, 12, 24).unwrap();
        let high = registry.restore_cell(3, 4, 36, 48).unwrap();
        assert_eq!(registry.chunk_count(), 1);

        let bottom = cell_at(&registry, 3, 4);
        assert_eq!(bottom, low);
        assert_eq!(registry.cells.get(low).unwrap().above, Some(high));
        assert_eq!(registry.cells.get(high).unwrap().below, Some(low));

        // A span overlapping an existing cell is refused.
        assert!(registry.restore_cell(3, 4, 20, 30).is_none());
        assert_eq!(registry.cells.len(), 2);
    }

    #[test]
    fn test_adjacent_idle_cells_do_not_cool_in_lockstep() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(0, 0), (1, 0)]);
        for &(x, z) in &[(0, 0), (1, 0)] {
            let cell = registry.cells.get(cell_at(&registry, x, z)).unwrap();
            cell.set_fluid(5 * UNITS_PER_LEVEL);
            cell.touch_flow(1);
        }

        let config = LavaConfig::default();
        let mut hooks = RecordingHooks::default();
        let mut rng = StepRng::new(0, 0);

        // Both cells are past the idle span, but the first one to solidify
        // delays the other; they must not cool in the same pass.
        let tick = 2 + config.cooling_idle_ticks;
        let cooled = registry.cooling_pass(tick, &config, &mut hooks, &mut rng);
        assert_eq!(cooled, 1);

        let survivors: Vec<_> = registry.cells.iter().filter(|c| c.fluid() > 0).collect();
        assert_eq!(survivors.len(), 1);
        assert!(survivors[0].last_flow_tick() > 1);
    }

    #[test]
    fn test_cooling_delays_fluid_neighbors() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(0, 0), (1, 0)]);
        let a = cell_at(&registry, 0, 0);
        let b = cell_at(&registry, 1, 0);
        {
            let cell = registry.cells.get(a).unwrap();
            cell.set_fluid(5 * UNITS_PER_LEVEL);
            cell.touch_flow(1);
        }
        {
            // The neighbor is hotter (flowed more recently) and holds fluid.
            let cell = registry.cells.get(b).unwrap();
            cell.set_fluid(5 * UNITS_PER_LEVEL);
            cell.touch_flow(50);
        }

        let config = LavaConfig::default();
        let mut hooks = RecordingHooks::default();
        let mut rng = StepRng::new(0, 0);

        let tick = 2 + config.cooling_idle_ticks;
        let cooled = registry.cooling_pass(tick, &config, &mut hooks, &mut rng);
        assert_eq!(cooled, 1);

        // The surviving neighbor's cooling clock was pushed forward.
        assert!(registry.cells.get(b).unwrap().last_flow_tick() > 50);
    }

    #[test]
    fn test_surface_reports_deduplicate() {
        let mut registry = LavaCellRegistry::new();
        let world = FlatWorld { height: 3 };
        build_columns(&mut registry, &world, &[(0, 0)]);
        let id = cell_at(&registry, 0, 0);

        struct Collect(Vec<SurfaceReport>);
        impl CellStateSink for Collect {
            fn report_surface(&mut self, report: SurfaceReport) {
                self.0.push(report);
            }
        }

        let mut sink = Collect(Vec::new());
        registry.report_surfaces(&mut sink);
        sink.0.clear();

        registry.cells.get(id).unwrap().set_fluid(3 * UNITS_PER_LEVEL);
        registry.report_surfaces(&mut sink);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].visible_level, 15);

        // Unchanged state reports nothing.
        registry.report_surfaces(&mut sink);
        assert_eq!(sink.0.len(), 1);
    }
}
