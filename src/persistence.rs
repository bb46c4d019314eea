//! Saving and restoring the simulation state.
//!
//! Only what cannot be rebuilt from world geometry is persisted: each cell's
//! position, span, fluid and retention amounts and cooling state, plus the
//! tick counter. Connections and chunk bookkeeping are re-derived on the
//! first tick after a load. Payloads are bincode-encoded and lz4-compressed.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::config::LavaConfig;
use crate::simulator::LavaSimState;

/// Persistent form of one cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub x: i32,
    pub z: i32,
    pub floor: i32,
    pub ceiling: i32,
    pub bottom_is_flow_surface: bool,
    pub fluid: i32,
    pub retained: i32,
    pub last_flow_tick: u64,
    pub cooling_disabled: bool,
    pub last_visible_level: i32,
}

/// Persistent form of the whole simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub tick: u64,
    pub cells: Vec<CellSnapshot>,
}

impl RegistrySnapshot {
    /// Captures the current simulation state.
    pub fn capture(sim: &LavaSimState) -> Self {
        let cells = sim
            .registry
            .cells
            .iter()
            .map(|cell| CellSnapshot {
                x: cell.x,
                z: cell.z,
                floor: cell.floor(),
                ceiling: cell.ceiling(),
                bottom_is_flow_surface: cell.bottom_is_flow_surface(),
                fluid: cell.fluid(),
                retained: cell.retained_units(),
                last_flow_tick: cell.last_flow_tick(),
                cooling_disabled: cell.cooling_disabled,
                last_visible_level: cell.last_visible_level,
            })
            .collect();
        Self {
            tick: sim.tick_count(),
            cells,
        }
    }

    /// Rebuilds a simulation from this snapshot.
    ///
    /// Every restored cell starts flagged for a connection rebuild, so the
    /// flow graph reassembles on the first tick. Snapshot cells that conflict
    /// with one another are skipped with a warning rather than failing the
    /// whole load.
    pub fn restore(&self, config: LavaConfig) -> LavaSimState {
        let mut sim = LavaSimState::new(config);
        sim.tick = self.tick;
        for snapshot in &self.cells {
            let Some(id) = sim.registry.restore_cell(
                snapshot.x,
                snapshot.z,
                snapshot.floor,
                snapshot.ceiling,
            ) else {
                log::warn!(
                    "[PERSIST] Skipping conflicting cell at ({}, {}) span ({}, {}]",
                    snapshot.x,
                    snapshot.z,
                    snapshot.floor,
                    snapshot.ceiling
                );
                continue;
            };
            if let Some(cell) = sim.registry.cells.get_mut(id) {
                cell.set_floor(snapshot.floor, snapshot.bottom_is_flow_surface);
                cell.set_fluid(snapshot.fluid.max(0));
                cell.restore_retention(snapshot.retained);
                cell.touch_flow(snapshot.last_flow_tick);
                cell.cooling_disabled = snapshot.cooling_disabled;
                cell.last_visible_level = snapshot.last_visible_level;
            }
        }
        log::info!(
            "[PERSIST] Restored {} cells at tick {}",
            self.cells.len(),
            self.tick
        );
        sim
    }
}

/// Serializes and compresses a snapshot.
pub fn snapshot_to_bytes(snapshot: &RegistrySnapshot) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::options().serialize(snapshot)?;
    Ok(lz4::block::compress(&payload, None, true)?)
}

/// Decompresses and deserializes a snapshot.
pub fn snapshot_from_bytes(bytes: &[u8]) -> Result<RegistrySnapshot, bincode::Error> {
    let payload = lz4::block::decompress(bytes, None)?;
    bincode::options().deserialize(&payload)
}
