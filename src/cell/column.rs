//! Column topology: the ordered stack of cells at one (x, z) location.
//!
//! A column is a singly-owned ascending chain of non-overlapping cells,
//! addressed through its bottom "entry" cell. This module owns every
//! structural mutation of a column: expanding cells into newly opened space,
//! shrinking them around new barriers, merging adjacent cells, and splitting
//! a cell when a barrier lands strictly inside it.
//!
//! ## Invariant
//! No two cells in one column ever overlap or touch vertically; any operation
//! that makes two cells adjacent must merge them (or is refused). Checked by
//! a debug-only validation after every rebuild.
//!
//! The flow engine never calls into this module; cells are created and
//! destroyed only through validation passes.

use crate::cell::{CellArena, CellId};
use crate::connection::ConnectionId;
use crate::units::{level_to_units, LEVELS_PER_BLOCK};

/// Vertical gap (in blocks) above which merged fluid is treated as falling
/// from height rather than teleporting: the merge stamps flow activity so the
/// result keeps simulating instead of instantly settling.
const MERGE_FALL_BLOCKS: i32 = 2;

/// Record of a cell deleted during a column pass. The registry uses the
/// carried connection ids to sever the other endpoints afterwards.
#[derive(Debug)]
pub struct RemovedCell {
    pub id: CellId,
    pub connections: Vec<ConnectionId>,
}

/// Mutable view of one column's cell stack.
///
/// Structural mutations collect deleted cells into `removed` so the registry
/// can sever their connections afterwards.
pub struct ColumnMut<'a> {
    pub arena: &'a mut CellArena,
    /// Bottom cell of the column, if any.
    pub entry: &'a mut Option<CellId>,
    pub x: i32,
    pub z: i32,
    /// Cells deleted by this pass; connections are cleaned up by the caller.
    pub removed: &'a mut Vec<RemovedCell>,
    /// Current tick, stamped on fluid that moves during merges.
    pub tick: u64,
}

impl<'a> ColumnMut<'a> {
    /// Collects the column's cell ids bottom-up.
    pub fn cell_ids(&self) -> Vec<CellId> {
        let mut ids = Vec::new();
        let mut cursor = *self.entry;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.arena.get(id).and_then(|c| c.above);
        }
        ids
    }

    /// Ensures an open, fluid-capable span exists at block `y`.
    ///
    /// `floor_height` (0..=11 levels) is the height of any partial solid at
    /// the bottom of the block; `is_flow_floor` marks that partial surface as
    /// a flow-height block. `seed_units` is applied only when a brand new
    /// cell must be created (world adoption of visible fluid).
    ///
    /// Returns false if the change could not be applied this pass.
    pub fn add_or_confirm_space(
        &mut self,
        y: i32,
        floor_height: i32,
        is_flow_floor: bool,
        seed_units: i32,
    ) -> bool {
        debug_assert!((0..LEVELS_PER_BLOCK).contains(&floor_height));
        let block_low = y * LEVELS_PER_BLOCK;
        let block_high = block_low + LEVELS_PER_BLOCK;
        let open_low = block_low + floor_height;

        // A partial solid bottom behaves as a barrier for anything below it.
        if floor_height > 0 && !self.confirm_solid_span(block_low, open_low) {
            return false;
        }

        self.confirm_open_span(open_low, block_high, floor_height > 0 || is_flow_floor, seed_units)
    }

    /// Ensures no open span exists at block `y`: shrinks or removes the cell
    /// there, splitting it when the barrier falls strictly inside.
    ///
    /// `is_flow_block` records whether the barrier is a full-height flow
    /// block (meltable); the distinction only affects the flow-surface flag
    /// of any cell left resting on top of it.
    ///
    /// Returns false if the barrier could not be applied (it would sit below
    /// existing fluid and melt next tick); the caller retries the event.
    pub fn add_or_confirm_barrier(&mut self, y: i32, is_flow_block: bool) -> bool {
        let block_low = y * LEVELS_PER_BLOCK;
        let block_high = block_low + LEVELS_PER_BLOCK;
        let _ = is_flow_block;
        self.confirm_solid_span(block_low, block_high)
    }

    // ------------------------------------------------------------------
    // Span reconciliation
    // ------------------------------------------------------------------

    /// Makes (open_low, open_high] part of some cell, extending or creating
    /// as needed, then merges any cells the expansion made adjacent.
    fn confirm_open_span(
        &mut self,
        open_low: i32,
        open_high: i32,
        is_flow_floor: bool,
        seed_units: i32,
    ) -> bool {
        // Find the closest existing cell: the highest cell starting at or
        // below the span, and the one above it.
        let mut below: Option<CellId> = None;
        let mut cursor = *self.entry;
        while let Some(id) = cursor {
            let Some(cell) = self.arena.get(id) else { break };
            if cell.floor() > open_low {
                break;
            }
            below = Some(id);
            cursor = cell.above;
        }
        let above = match below {
            Some(id) => self.arena.get(id).and_then(|c| c.above),
            None => *self.entry,
        };

        if let Some(id) = below {
            let Some(cell) = self.arena.get(id) else { return false };
            if cell.ceiling() >= open_high {
                // Already covered.
                return true;
            }
            if cell.ceiling() >= open_low {
                // Touching or partially covering from below: grow upward.
                let Some(cell) = self.arena.get_mut(id) else { return false };
                cell.set_ceiling(open_high);
                self.try_merge_up(id);
                return true;
            }
        }

        if let Some(id) = above {
            let Some(cell) = self.arena.get(id) else { return false };
            if cell.floor() <= open_high {
                // Touching from above: grow downward.
                let Some(cell) = self.arena.get_mut(id) else { return false };
                cell.set_floor(open_low, is_flow_floor);
                self.try_merge_down(id);
                return true;
            }
        }

        // No cell nearby: create and splice.
        let id = self.create_cell(open_low, open_high, below, above);
        if let Some(cell) = self.arena.get_mut(id) {
            if is_flow_floor {
                cell.set_floor(open_low, true);
            }
            if seed_units > 0 {
                cell.set_fluid(seed_units);
                cell.touch_flow(self.tick);
            }
        }
        true
    }

    /// Removes all open space in (solid_low, solid_high] from the column.
    ///
    /// Returns false when a required split is refused because the barrier
    /// would sit below existing fluid.
    fn confirm_solid_span(&mut self, solid_low: i32, solid_high: i32) -> bool {
        let ids = self.cell_ids();
        for id in ids {
            let Some(cell) = self.arena.get(id) else { continue };
            if cell.floor() >= solid_high || cell.ceiling() <= solid_low {
                continue;
            }
            let floor = cell.floor();
            let ceiling = cell.ceiling();
            let surface_units = level_to_units(floor) + cell.fluid().min(cell.volume_units());

            if floor >= solid_low && ceiling <= solid_high {
                // Cell entirely inside the barrier: fluid here is destroyed.
                self.delete_cell(id);
            } else if floor < solid_low && ceiling > solid_high {
                // Barrier strictly inside the cell: split. Refused when fluid
                // stands above the barrier top, because the new solid would
                // be submerged and melt again next tick.
                if surface_units > level_to_units(solid_high) {
                    log::debug!(
                        "[VALIDATE] Refusing split at ({}, {}): barrier ({}, {}] below fluid surface",
                        self.x,
                        self.z,
                        solid_low,
                        solid_high
                    );
                    return false;
                }
                self.split_cell(id, solid_low, solid_high);
            } else if floor < solid_low {
                // Barrier truncates the top of the cell. Fluid at or above
                // the barrier bottom inside the shrinking span is destroyed.
                let Some(cell) = self.arena.get_mut(id) else { continue };
                cell.set_ceiling(solid_low);
                let capacity = cell.volume_units();
                if cell.fluid() > capacity {
                    cell.set_fluid(capacity);
                }
            } else {
                // Barrier truncates the bottom; fluid above it is preserved
                // and now rests on the new barrier.
                let Some(cell) = self.arena.get_mut(id) else { continue };
                cell.set_floor(solid_high, solid_high % LEVELS_PER_BLOCK != 0);
            }
        }
        true
    }

    /// Splices a restored cell span into the column at its sorted position.
    ///
    /// Used when loading a saved simulation; the span must not overlap or
    /// touch any existing cell (saved columns satisfy the column invariant).
    pub fn insert_span(&mut self, floor: i32, ceiling: i32) -> Option<CellId> {
        if floor >= ceiling {
            return None;
        }
        let mut below: Option<CellId> = None;
        let mut cursor = *self.entry;
        while let Some(id) = cursor {
            let cell = self.arena.get(id)?;
            if cell.floor() > floor {
                break;
            }
            below = Some(id);
            cursor = cell.above;
        }
        let above = match below {
            Some(id) => self.arena.get(id)?.above,
            None => *self.entry,
        };
        if let Some(id) = below {
            if self.arena.get(id)?.ceiling() >= floor {
                return None;
            }
        }
        if let Some(id) = above {
            if self.arena.get(id)?.floor() <= ceiling {
                return None;
            }
        }
        Some(self.create_cell(floor, ceiling, below, above))
    }

    // ------------------------------------------------------------------
    // Structural primitives
    // ------------------------------------------------------------------

    /// Creates a cell between `below` and `above` and splices the links.
    fn create_cell(
        &mut self,
        floor: i32,
        ceiling: i32,
        below: Option<CellId>,
        above: Option<CellId>,
    ) -> CellId {
        let id = self.arena.insert(self.x, self.z, floor, ceiling);
        if let Some(cell) = self.arena.get_mut(id) {
            cell.below = below;
            cell.above = above;
        }
        match below {
            Some(b) => {
                if let Some(cell) = self.arena.get_mut(b) {
                    cell.above = Some(id);
                }
            }
            None => *self.entry = Some(id),
        }
        if let Some(a) = above {
            if let Some(cell) = self.arena.get_mut(a) {
                cell.below = Some(id);
            }
        }
        id
    }

    /// Unlinks and removes a cell; its id is queued for connection cleanup.
    pub fn delete_cell(&mut self, id: CellId) {
        let (below, above) = match self.arena.get(id) {
            Some(cell) => (cell.below, cell.above),
            None => return,
        };
        match below {
            Some(b) => {
                if let Some(cell) = self.arena.get_mut(b) {
                    cell.above = above;
                }
            }
            None => *self.entry = above,
        }
        if let Some(a) = above {
            if let Some(cell) = self.arena.get_mut(a) {
                cell.below = below;
            }
        }
        if let Some(mut cell) = self.arena.remove(id) {
            cell.deleted = true;
            self.removed.push(RemovedCell {
                id,
                connections: std::mem::take(&mut cell.connections),
            });
        }
    }

    /// Splits a cell around the solid span (solid_low, solid_high].
    ///
    /// The lower part keeps all fluid (split is only reached when the fluid
    /// surface is at or below `solid_high`; anything between `solid_low` and
    /// the barrier top is destroyed). The upper part is created empty.
    fn split_cell(&mut self, id: CellId, solid_low: i32, solid_high: i32) {
        let (ceiling, above, fluid) = match self.arena.get(id) {
            Some(cell) => (cell.ceiling(), cell.above, cell.fluid()),
            None => return,
        };

        let upper = self.create_cell(solid_high, ceiling, Some(id), above);
        let Some(cell) = self.arena.get_mut(id) else { return };
        cell.set_ceiling(solid_low);
        let lower_capacity = cell.volume_units();
        if fluid > lower_capacity {
            cell.set_fluid(lower_capacity);
        }
        cell.mark_refresh(solid_low, solid_high);
        if let Some(cell) = self.arena.get_mut(upper) {
            cell.needs_connection_update = true;
        }
    }

    /// Merges `id` with the cell above it if the merge rule allows.
    ///
    /// Cells may merge when overlapping, or when vertically adjacent and the
    /// upper cell's floor is flush with a block boundary or the upper cell
    /// already holds fluid (fluid is taken to have melted any partial floor).
    pub fn try_merge_up(&mut self, id: CellId) -> bool {
        let Some(cell) = self.arena.get(id) else { return false };
        let Some(upper_id) = cell.above else { return false };
        let Some(upper) = self.arena.get(upper_id) else { return false };

        if !cell.overlaps_or_touches(upper) {
            return false;
        }
        let overlapping = cell.overlaps(upper);
        if !overlapping {
            let flush = upper.floor() % LEVELS_PER_BLOCK == 0;
            if !flush && upper.fluid() <= 0 {
                return false;
            }
        }

        let upper_fluid = upper.fluid();
        let upper_ceiling = upper.ceiling();
        let upper_floor = upper.floor();
        self.delete_cell(upper_id);

        let Some(cell) = self.arena.get_mut(id) else { return false };
        let fall_gap = upper_floor - cell.world_surface_level();
        cell.set_ceiling(upper_ceiling.max(cell.ceiling()));
        if upper_fluid > 0 {
            cell.change_fluid(upper_fluid);
            // A long drop keeps the merged cell simulating instead of letting
            // the transferred fluid settle instantly.
            if fall_gap > MERGE_FALL_BLOCKS * LEVELS_PER_BLOCK {
                cell.touch_flow(self.tick);
            }
        }
        cell.needs_connection_update = true;
        true
    }

    fn try_merge_down(&mut self, id: CellId) -> bool {
        let below = self.arena.get(id).and_then(|c| c.below);
        match below {
            Some(b) => self.try_merge_up(b),
            None => false,
        }
    }

    /// Debug-only invariant check: cells are ascending, non-overlapping and
    /// non-touching, with consistent links.
    pub fn validate(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let mut previous: Option<CellId> = None;
        let mut cursor = *self.entry;
        while let Some(id) = cursor {
            let Some(cell) = self.arena.get(id) else {
                debug_assert!(false, "column links a removed cell");
                return;
            };
            debug_assert_eq!(cell.below, previous, "broken below link");
            debug_assert!(cell.floor() < cell.ceiling(), "inverted span");
            if let Some(prev_id) = previous {
                if let Some(prev) = self.arena.get(prev_id) {
                    debug_assert!(
                        prev.ceiling() < cell.floor(),
                        "cells overlap or touch: ({}, {}] then ({}, {}]",
                        prev.floor(),
                        prev.ceiling(),
                        cell.floor(),
                        cell.ceiling()
                    );
                }
            }
            previous = Some(id);
            cursor = cell.above;
        }
    }
}
