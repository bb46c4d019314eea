//! Spatial chunks: fixed 16×16 tiles of columns.
//!
//! A chunk owns the entry point into each of its columns' cell stacks plus
//! the counters that drive lifecycle: how many cells need their region kept
//! loaded (`active_count`), per-edge activity used to retain neighbor chunks
//! before lava reaches them, external retains held on this chunk, and how
//! long the chunk has been idle.

pub mod registry;

use bevy::math::IVec2;

use crate::cell::CellId;

/// Columns per chunk side.
pub const CHUNK_SIZE: i32 = 16;

/// Columns per chunk.
pub const COLUMNS_PER_CHUNK: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Horizontal edge of a chunk, toward the neighbor it can retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkEdge {
    NegX,
    PosX,
    NegZ,
    PosZ,
}

impl ChunkEdge {
    /// All four horizontal edges.
    pub const ALL: [ChunkEdge; 4] = [
        ChunkEdge::NegX,
        ChunkEdge::PosX,
        ChunkEdge::NegZ,
        ChunkEdge::PosZ,
    ];

    /// Offset to the neighboring chunk across this edge.
    pub fn neighbor_offset(&self) -> IVec2 {
        match self {
            ChunkEdge::NegX => IVec2::new(-1, 0),
            ChunkEdge::PosX => IVec2::new(1, 0),
            ChunkEdge::NegZ => IVec2::new(0, -1),
            ChunkEdge::PosZ => IVec2::new(0, 1),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        match self {
            ChunkEdge::NegX => 0,
            ChunkEdge::PosX => 1,
            ChunkEdge::NegZ => 2,
            ChunkEdge::PosZ => 3,
        }
    }

    /// Edges a column at chunk-local (x, z) touches.
    pub fn edges_of_local(local_x: i32, local_z: i32) -> impl Iterator<Item = ChunkEdge> {
        let mut edges = [None, None];
        if local_x == 0 {
            edges[0] = Some(ChunkEdge::NegX);
        } else if local_x == CHUNK_SIZE - 1 {
            edges[0] = Some(ChunkEdge::PosX);
        }
        if local_z == 0 {
            edges[1] = Some(ChunkEdge::NegZ);
        } else if local_z == CHUNK_SIZE - 1 {
            edges[1] = Some(ChunkEdge::PosZ);
        }
        edges.into_iter().flatten()
    }
}

/// Converts a global column position to its chunk key.
#[inline]
pub fn chunk_key(x: i32, z: i32) -> IVec2 {
    IVec2::new(x.div_euclid(CHUNK_SIZE), z.div_euclid(CHUNK_SIZE))
}

/// Converts a global column position to its index within the chunk.
#[inline]
pub fn column_index(x: i32, z: i32) -> usize {
    (x.rem_euclid(CHUNK_SIZE) + z.rem_euclid(CHUNK_SIZE) * CHUNK_SIZE) as usize
}

/// One 16×16 tile of columns and its lifecycle counters.
#[derive(Debug)]
pub struct LavaChunk {
    pub pos: IVec2,
    /// Bottom cell of each column's stack, indexed by [`column_index`].
    pub columns: Vec<Option<CellId>>,
    /// Cells currently requiring this chunk's region to stay loaded.
    pub active_count: i32,
    /// Active cells per edge, for neighbor retention.
    pub edge_active: [i32; 4],
    /// Whether this chunk currently holds a retain on each neighbor.
    pub retains_held: [bool; 4],
    /// Retains other chunks hold on this one.
    pub retain_count: i32,
    /// Consecutive ticks with no activity and no retains.
    pub idle_ticks: u32,
    /// Columns flagged for validation against world geometry.
    validation_flags: Vec<bool>,
    validation_count: usize,
    /// Set once `on_chunk_unloadable` has fired, until re-referenced.
    pub reported_unloadable: bool,
    /// Last activity state reported through `on_chunk_active_changed`.
    pub reported_active: bool,
}

impl LavaChunk {
    pub fn new(pos: IVec2) -> Self {
        Self {
            pos,
            columns: vec![None; COLUMNS_PER_CHUNK],
            active_count: 0,
            edge_active: [0; 4],
            retains_held: [false; 4],
            retain_count: 0,
            idle_ticks: 0,
            validation_flags: vec![false; COLUMNS_PER_CHUNK],
            validation_count: 0,
            reported_unloadable: false,
            reported_active: false,
        }
    }

    /// Flags a column for geometry validation. Returns true if it was not
    /// already flagged.
    pub fn flag_column(&mut self, index: usize) -> bool {
        if !self.validation_flags[index] {
            self.validation_flags[index] = true;
            self.validation_count += 1;
            self.reported_unloadable = false;
            true
        } else {
            false
        }
    }

    /// Number of columns awaiting validation.
    #[inline]
    pub fn pending_validations(&self) -> usize {
        self.validation_count
    }

    /// Takes up to `budget` flagged column indices, clearing their flags.
    pub fn take_flagged(&mut self, budget: usize, out: &mut Vec<usize>) {
        if self.validation_count == 0 || budget == 0 {
            return;
        }
        for (index, flag) in self.validation_flags.iter_mut().enumerate() {
            if out.len() >= budget {
                break;
            }
            if *flag {
                *flag = false;
                self.validation_count -= 1;
                out.push(index);
            }
        }
    }

    /// True once the chunk has been idle long enough to be unloaded.
    #[inline]
    pub fn is_unloadable(&self, unload_ticks: u32) -> bool {
        self.active_count == 0
            && self.retain_count == 0
            && self.validation_count == 0
            && self.idle_ticks >= unload_ticks
    }
}
