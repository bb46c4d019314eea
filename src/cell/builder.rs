//! Column rebuild: reconciling a cell stack against world geometry.
//!
//! The builder walks one column's [`ColumnSnapshot`] bottom-up and issues the
//! matching space/barrier confirmations to [`ColumnMut`]. Confirmations are
//! idempotent, so re-validating an unchanged column is a no-op; only genuine
//! differences mutate the stack.

use crate::cell::column::ColumnMut;
use crate::geometry::{BlockClass, ColumnSnapshot, WorldGeometry};
use crate::units::{level_to_units, LEVELS_PER_BLOCK};

/// Outcome of one column rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The stack matches the snapshot.
    Reconciled,
    /// At least one change was refused (e.g. a barrier under standing fluid)
    /// or the world data was unavailable; the caller retries later.
    Deferred,
}

/// Reusable column rebuilder. Owns the snapshot buffer so validation passes
/// do not allocate per column.
#[derive(Debug, Default)]
pub struct ColumnBuilder {
    snapshot: ColumnSnapshot,
}

impl ColumnBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches the column's geometry and reconciles the cell stack against it.
    pub fn rebuild(
        &mut self,
        geometry: &dyn WorldGeometry,
        column: &mut ColumnMut<'_>,
    ) -> RebuildOutcome {
        self.snapshot.reset(0);
        if !geometry.column_snapshot(column.x, column.z, &mut self.snapshot) {
            log::trace!(
                "[VALIDATE] Column ({}, {}) not available, deferring",
                column.x,
                column.z
            );
            return RebuildOutcome::Deferred;
        }

        let mut reconciled = true;
        for (offset, class) in self.snapshot.classes.iter().enumerate() {
            let y = self.snapshot.min_y + offset as i32;
            reconciled &= match *class {
                BlockClass::Barrier => column.add_or_confirm_barrier(y, false),
                BlockClass::PartialSolid { flow_height } => {
                    let height = i32::from(flow_height).min(LEVELS_PER_BLOCK);
                    if height >= LEVELS_PER_BLOCK {
                        // A full-height flow block is a barrier that happens
                        // to be meltable.
                        column.add_or_confirm_barrier(y, true)
                    } else {
                        column.add_or_confirm_space(y, height, true, 0)
                    }
                }
                BlockClass::Space => column.add_or_confirm_space(y, 0, false, 0),
                BlockClass::PartialFluid { level } => {
                    // Visible world fluid is adopted as cell fluid only when
                    // this rebuild creates the cell; an existing cell already
                    // owns its amount.
                    let seed = level_to_units(i32::from(level).min(LEVELS_PER_BLOCK));
                    column.add_or_confirm_space(y, 0, false, seed)
                }
            };
        }

        column.validate();
        if reconciled {
            RebuildOutcome::Reconciled
        } else {
            RebuildOutcome::Deferred
        }
    }
}
