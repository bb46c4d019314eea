//! World-geometry feed contract.
//!
//! The engine never reads blocks directly. During validation passes the column
//! builder requests a snapshot of one column's per-block classification from
//! the host through [`WorldGeometry`], and reconciles its cell stack against
//! it. Flow processing never touches this interface.

/// Classification of one block position as seen by the fluid engine.
///
/// Heights are in levels (1..=12, twelfths of a block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockClass {
    /// Full solid block. No fluid can exist or pass here.
    Barrier,
    /// Solid block with a partial "flow height" top surface. Fluid can rest
    /// on top of it within the same block space.
    PartialSolid {
        /// Height of the solid portion, 1..=12 levels.
        flow_height: u8,
    },
    /// Open space a cell can span.
    Space,
    /// Space currently holding partial fluid (visible lava).
    PartialFluid {
        /// Visible fluid height, 1..=12 levels.
        level: u8,
    },
}

/// Snapshot of one column's block classification, bottom-up.
///
/// Reused across columns to avoid per-column allocation; the builder clears it
/// before each fill.
#[derive(Debug, Default, Clone)]
pub struct ColumnSnapshot {
    /// Block y of `classes[0]`.
    pub min_y: i32,
    /// Classification per block, ascending y.
    pub classes: Vec<BlockClass>,
}

impl ColumnSnapshot {
    /// Clears the snapshot for reuse.
    pub fn reset(&mut self, min_y: i32) {
        self.min_y = min_y;
        self.classes.clear();
    }
}

/// Host-supplied geometry source consumed by the column builder.
///
/// Implementations translate world block state into [`BlockClass`] runs. The
/// engine only calls this during the serial validation phase.
pub trait WorldGeometry {
    /// Fills `snapshot` with the classification of column (x, z).
    ///
    /// Returns false if the column's world data is not currently available
    /// (for example the region is still loading); the engine will retry the
    /// triggering event on a later tick.
    fn column_snapshot(&self, x: i32, z: i32, snapshot: &mut ColumnSnapshot) -> bool;
}
