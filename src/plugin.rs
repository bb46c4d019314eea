//! Bevy integration for the lava simulation.
//!
//! The host supplies its world adapters as resources (geometry source, cell
//! state sink, lifecycle hooks) and adds [`LavaSimPlugin`]; the simulation
//! then steps once per `FixedUpdate`. Hosts that drive ticks manually can
//! skip the plugin and call [`LavaSimState::tick`] themselves.

use bevy_app::{App, FixedUpdate, Plugin};
use bevy_ecs::prelude::{Res, ResMut};
use bevy_ecs::resource::Resource;
use bevy_log::debug;

use crate::geometry::WorldGeometry;
use crate::simulator::LavaSimState;
use crate::sink::{CellStateSink, LifecycleHooks};

/// Host-provided world geometry source.
#[derive(Resource)]
pub struct WorldGeometrySource(pub Box<dyn WorldGeometry + Send + Sync>);

/// Host-provided consumer of surface change reports.
#[derive(Resource)]
pub struct CellStateOutput(pub Box<dyn CellStateSink + Send + Sync>);

/// Host-provided consumer of chunk and cooling lifecycle events.
#[derive(Resource)]
pub struct LifecycleOutput(pub Box<dyn LifecycleHooks + Send + Sync>);

/// Plugin that steps the lava simulation in `FixedUpdate`.
pub struct LavaSimPlugin;

impl Plugin for LavaSimPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<LavaSimState>()
            .add_systems(FixedUpdate, step_lava_simulation);
        debug!("Lava simulation plugin registered");
    }
}

/// System that advances the simulation by one tick.
///
/// Skips quietly until the host has inserted all three adapter resources.
fn step_lava_simulation(
    mut sim: ResMut<LavaSimState>,
    geometry: Option<Res<WorldGeometrySource>>,
    sink: Option<ResMut<CellStateOutput>>,
    hooks: Option<ResMut<LifecycleOutput>>,
) {
    let (Some(geometry), Some(mut sink), Some(mut hooks)) = (geometry, sink, hooks) else {
        return;
    };
    sim.tick(geometry.0.as_ref(), sink.0.as_mut(), hooks.0.as_mut());
}
