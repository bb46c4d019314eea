//! lavacore: a cell-and-connection lava flow engine for voxel worlds.
//!
//! Instead of simulating per-block, the engine merges vertically contiguous
//! open space in each column into *cells* and connects horizontally adjacent
//! cells with *connections*. Fluid moves along connections toward pressure
//! equilibrium in integer units; idle lava cools into terrain. The engine
//! owns no world data: geometry comes in through [`geometry::WorldGeometry`],
//! results go out through [`sink::CellStateSink`] and
//! [`sink::LifecycleHooks`].

pub mod cell;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod events;
pub mod geometry;
pub mod persistence;
pub mod plugin;
pub mod scheduler;
pub mod simulator;
pub mod sink;
pub mod units;

pub use config::LavaConfig;
pub use events::BlockEventKind;
pub use geometry::{BlockClass, ColumnSnapshot, WorldGeometry};
pub use plugin::{CellStateOutput, LavaSimPlugin, LifecycleOutput, WorldGeometrySource};
pub use simulator::{LavaSimState, TickStats};
pub use sink::{CellStateSink, LifecycleHooks, NullSink, SurfaceReport};
