use bevy::{prelude::*, utils::HashMap};
use serde::{Deserialize, Serialize};

/// Stores a separate component `C` for each (terrain, view) combination.
#[derive(Resource, Deref, DerefMut)]
pub struct TerrainViewComponents<C>(HashMap<(Entity, Entity), C>);

impl<C> Default for TerrainViewComponents<C> {
    fn default() -> Self {
        Self(HashMap::default())
    }
}

/// Marker for views (cameras, shadow casters) that tessellate terrain.
#[derive(Clone, Copy, Component)]
pub struct TerrainView;

/// The LOD tuning of one terrain as seen from one view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerrainViewConfig {
    /// Radius of the detailed region around the view.
    pub view_radius: f32,
    /// Fall-off divisor of the camera-distance factor; increase to reduce
    /// detail in the distance.
    pub lod_falloff: f32,
    /// Fraction of the view radius that clamps the tracked variance. Reduces
    /// the maximum LOD in the distance without touching the maximum
    /// tessellation.
    pub variance_ceiling: f32,
    /// The rendering pass whose node pools this view tessellates with.
    pub pass: usize,
    /// Camera movement beyond this distance triggers a retessellation.
    pub retessellation_distance: f32,
}

impl Default for TerrainViewConfig {
    fn default() -> Self {
        Self {
            view_radius: 300.0,
            lod_falloff: 300.0,
            variance_ceiling: 0.35,
            pass: 0,
            retessellation_distance: 8.0,
        }
    }
}
