//! Cell-state sink and lifecycle hook contracts.
//!
//! The engine reports committed cell state outward through these traits; it
//! never writes blocks itself. The host adapter turns surface reports into
//! block writes and lifecycle events into region load/unload decisions.

use bevy::math::IVec2;

/// A visible-surface change report for one column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceReport {
    /// Column world x.
    pub x: i32,
    /// Column world z.
    pub z: i32,
    /// Visible fluid surface in levels, ignoring pressure excess.
    pub visible_level: i32,
    /// Lowest level whose rendering may have changed.
    pub dirty_low: i32,
    /// Highest level whose rendering may have changed.
    pub dirty_high: i32,
}

/// Consumer of per-cell visible state, called at the end of each tick for
/// every cell whose visible level or refresh range changed since last report.
pub trait CellStateSink {
    /// Receives one surface change report.
    fn report_surface(&mut self, report: SurfaceReport);
}

/// Lifecycle callbacks exposed to chunk/world management.
pub trait LifecycleHooks {
    /// A chunk transitioned between having and not having active cells.
    /// Active chunks must stay loaded.
    fn on_chunk_active_changed(&mut self, chunk: IVec2, active: bool);

    /// A chunk has had no active cells and no retains for the configured
    /// number of ticks and its cells have been deleted; the host may unload
    /// the region.
    fn on_chunk_unloadable(&mut self, chunk: IVec2);

    /// A cell solidified. The host should convert the span up to
    /// `surface_level` into solid terrain.
    fn on_cell_cooled(&mut self, x: i32, z: i32, floor_level: i32, surface_level: i32);
}

/// No-op sink used by tests and headless runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl CellStateSink for NullSink {
    fn report_surface(&mut self, _report: SurfaceReport) {}
}

impl LifecycleHooks for NullSink {
    fn on_chunk_active_changed(&mut self, _chunk: IVec2, _active: bool) {}
    fn on_chunk_unloadable(&mut self, _chunk: IVec2) {}
    fn on_cell_cooled(&mut self, _x: i32, _z: i32, _floor_level: i32, _surface_level: i32) {}
}
