use anyhow::{ensure, Context, Result};
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Marker for terrain entities.
#[derive(Clone, Copy, Component)]
pub struct Terrain;

/// The full configuration of a terrain.
///
/// Loadable from RON files via [`TerrainConfig::load_file`].
#[derive(Clone, Debug, Component, Serialize, Deserialize)]
pub struct TerrainConfig {
    /// Grid squares per patch side. Must be a power of two.
    pub patch_size: u32,
    /// World units per grid square.
    pub square_size: f32,
    /// Tracked depth of the variance trees; each table stores
    /// `1 << variance_depth` entries per patch half.
    pub variance_depth: u32,
    /// Triangles smaller than this sample block carry no tracked variance.
    pub variance_min_block: u32,
    /// Total node budget per rendering pass, split across the worker pools.
    pub pool_size: usize,
    /// Independent rendering passes (e.g. main and shadow).
    pub pass_count: usize,
    /// Skirt quads drop from the surface to this elevation.
    pub skirt_depth: f32,
    /// World height of a fully saturated height map sample.
    pub height_scale: f32,
    /// World height of a zero sample.
    pub height_offset: f32,
    /// Height map image loaded through the asset server, if any.
    pub height_map_path: Option<String>,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            patch_size: 128,
            square_size: 8.0,
            variance_depth: 12,
            variance_min_block: 4,
            pool_size: 8192,
            pass_count: 1,
            skirt_depth: -400.0,
            height_scale: 100.0,
            height_offset: 0.0,
            height_map_path: None,
        }
    }
}

impl TerrainConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.patch_size.is_power_of_two(),
            "patch_size must be a power of two, got {}",
            self.patch_size
        );
        ensure!(
            (2..=20).contains(&self.variance_depth),
            "variance_depth must lie between 2 and 20, got {}",
            self.variance_depth
        );
        ensure!(
            self.variance_min_block >= 2,
            "variance_min_block must be at least 2, got {}",
            self.variance_min_block
        );
        ensure!(self.pass_count >= 1, "at least one rendering pass is required");
        ensure!(
            self.pool_size >= 4,
            "pool_size must hold at least two node pairs, got {}",
            self.pool_size
        );

        Ok(())
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading terrain config from {path:?}"))?;

        let config: Self = ron::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Patches per axis for a height map with the given sample counts.
    pub fn patch_count(&self, samples: UVec2) -> UVec2 {
        (samples.max(UVec2::ONE) - UVec2::ONE) / self.patch_size
    }
}
