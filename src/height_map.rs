//! Height-field storage and ingestion.
//!
//! The terrain keeps its own corner height samples, so tessellation and
//! variance computation never query external data mid-pass. Samples can be
//! decoded from grayscale images (PNG and friends via `image`, TIFF via
//! `tiff`), from raw 16-bit buffers, or filled procedurally. Changes are
//! tracked as dirty rectangles that the patches consume once per frame.

use crate::terrain::TerrainConfig;
use anyhow::{bail, ensure, Context, Result};
use bevy::{math::URect, prelude::*, render::render_resource::TextureFormat};
use bytemuck::pod_collect_to_vec;
use derive_more::derive::From;
use image::DynamicImage;
use itertools::iproduct;
use ndarray::Array2;
use slab::Slab;
use std::{fs::File, io::BufReader, mem, path::Path};
use tiff::decoder::{Decoder, DecodingResult};

/// Raw height samples as decoded from a source image, before scaling.
#[derive(Clone, From)]
pub enum HeightMapData {
    /// One channel  8 bit.
    U8(Vec<u8>),
    /// One channel 16 bit.
    U16(Vec<u16>),
    /// One channel 32 bit float.
    F32(Vec<f32>),
}

impl HeightMapData {
    pub fn from_r16_bytes(bytes: &[u8]) -> Self {
        Self::U16(pod_collect_to_vec(bytes))
    }

    /// Integer samples are normalized to `0..=1` before scaling; float
    /// samples pass through as-is.
    fn to_heights(&self, scale: f32, offset: f32) -> Vec<f32> {
        match self {
            Self::U8(data) => data
                .iter()
                .map(|&value| value as f32 / u8::MAX as f32 * scale + offset)
                .collect(),
            Self::U16(data) => data
                .iter()
                .map(|&value| value as f32 / u16::MAX as f32 * scale + offset)
                .collect(),
            Self::F32(data) => data.iter().map(|&value| value * scale + offset).collect(),
        }
    }
}

/// The corner height samples of a terrain.
///
/// Stores `(width + 1) × (height + 1)` vertices for a terrain of
/// `width × height` grid squares. Mutations are recorded as inclusive sample
/// rectangles so that only the affected patch regions are refreshed.
#[derive(Component)]
pub struct HeightMap {
    heights: Array2<f32>,
    changed: Vec<URect>,
    min_height: f32,
    max_height: f32,
    square_size: f32,
}

impl HeightMap {
    pub fn new(heights: Array2<f32>, square_size: f32) -> Self {
        let mut map = Self {
            heights,
            changed: Vec::new(),
            min_height: 0.0,
            max_height: 0.0,
            square_size,
        };

        map.update_bounds();
        map.changed.push(map.full_rect());
        map
    }

    /// Fills a height map procedurally, sample by sample.
    pub fn from_fn(samples: UVec2, square_size: f32, mut height: impl FnMut(u32, u32) -> f32) -> Self {
        let mut heights = Array2::zeros((samples.y as usize, samples.x as usize));

        for (z, x) in iproduct!(0..samples.y, 0..samples.x) {
            heights[[z as usize, x as usize]] = height(x, z);
        }

        Self::new(heights, square_size)
    }

    /// Decodes a grayscale image into heights, scaled by the terrain config.
    pub fn from_image(image: &DynamicImage, config: &TerrainConfig) -> Result<Self> {
        let samples = UVec2::new(image.width(), image.height());
        let data = HeightMapData::from(image.to_luma16().into_raw());
        Self::from_data(&data, samples, config)
    }

    pub fn from_data(data: &HeightMapData, samples: UVec2, config: &TerrainConfig) -> Result<Self> {
        let heights = data.to_heights(config.height_scale, config.height_offset);

        ensure!(
            heights.len() == (samples.x * samples.y) as usize,
            "height map data holds {} samples, expected {}x{}",
            heights.len(),
            samples.x,
            samples.y
        );

        let heights = Array2::from_shape_vec((samples.y as usize, samples.x as usize), heights)?;
        Ok(Self::new(heights, config.square_size))
    }

    /// Loads a height map image from disk, dispatching on the file extension.
    pub fn load_file(path: impl AsRef<Path>, config: &TerrainConfig) -> Result<Self> {
        let path = path.as_ref();

        match path.extension().and_then(|extension| extension.to_str()) {
            Some("tif") | Some("tiff") => Self::load_tiff(path, config),
            _ => {
                let image = image::ImageReader::open(path)
                    .with_context(|| format!("opening height map {path:?}"))?
                    .decode()?;
                Self::from_image(&image, config)
            }
        }
    }

    fn load_tiff(path: &Path, config: &TerrainConfig) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening height map {path:?}"))?;
        let mut decoder = Decoder::new(BufReader::new(file))?;

        let (width, height) = decoder.dimensions()?;

        let data = match decoder.read_image()? {
            DecodingResult::U8(data) => HeightMapData::from(data),
            DecodingResult::U16(data) => HeightMapData::from(data),
            DecodingResult::F32(data) => HeightMapData::from(data),
            _ => bail!("unsupported tiff sample format in {path:?}"),
        };

        Self::from_data(&data, UVec2::new(width, height), config)
    }

    /// Sample counts per axis (grid squares plus one).
    pub fn samples(&self) -> UVec2 {
        let (rows, columns) = self.heights.dim();
        UVec2::new(columns as u32, rows as u32)
    }

    pub fn sample(&self, pos: UVec2) -> f32 {
        self.heights[[pos.y as usize, pos.x as usize]]
    }

    /// Bilinearly interpolated height at a world position, clamped to the
    /// terrain bounds.
    pub fn height_at(&self, world_x: f32, world_z: f32) -> f32 {
        let samples = self.samples().as_vec2();
        let x = (world_x / self.square_size).clamp(0.0, samples.x - 1.0);
        let z = (world_z / self.square_size).clamp(0.0, samples.y - 1.0);

        let base = UVec2::new(x as u32, z as u32);
        let next = (base + UVec2::ONE).min(self.samples() - UVec2::ONE);
        let fraction = Vec2::new(x.fract(), z.fract());

        let top = self
            .sample(base)
            .lerp(self.sample(UVec2::new(next.x, base.y)), fraction.x);
        let bottom = self
            .sample(UVec2::new(base.x, next.y))
            .lerp(self.sample(next), fraction.x);

        top.lerp(bottom, fraction.y)
    }

    pub fn min_height(&self) -> f32 {
        self.min_height
    }

    pub fn max_height(&self) -> f32 {
        self.max_height
    }

    pub fn set_sample(&mut self, pos: UVec2, height: f32) {
        self.heights[[pos.y as usize, pos.x as usize]] = height;
        self.changed.push(URect::from_corners(pos, pos));
    }

    /// Records an inclusive sample rectangle as changed.
    pub fn mark_changed(&mut self, rect: URect) {
        let max = self.samples().max(UVec2::ONE) - UVec2::ONE;
        self.changed.push(URect::from_corners(rect.min.min(max), rect.max.min(max)));
    }

    /// Drains the changed rectangles, refreshing the height bounds if
    /// anything was touched.
    pub(crate) fn take_changed(&mut self) -> Vec<URect> {
        if !self.changed.is_empty() {
            self.update_bounds();
        }

        mem::take(&mut self.changed)
    }

    fn full_rect(&self) -> URect {
        URect::from_corners(UVec2::ZERO, self.samples().max(UVec2::ONE) - UVec2::ONE)
    }

    fn update_bounds(&mut self) {
        let (min, max) = self
            .heights
            .iter()
            .fold((f32::MAX, f32::MIN), |(min, max), &height| {
                (min.min(height), max.max(height))
            });

        self.min_height = min;
        self.max_height = max;
    }
}

struct LoadingHeightMap {
    handle: Handle<Image>,
}

/// Loads the height map named in the [`TerrainConfig`] through the asset
/// server and attaches the decoded [`HeightMap`] to the terrain entity.
#[derive(Component)]
pub struct HeightMapLoader {
    loading: Slab<LoadingHeightMap>,
}

impl Default for HeightMapLoader {
    fn default() -> Self {
        Self {
            loading: Slab::with_capacity(1),
        }
    }
}

fn decode_image(image: &Image, config: &TerrainConfig) -> Result<HeightMap> {
    let samples = image.size();

    let data = match image.texture_descriptor.format {
        TextureFormat::R8Unorm | TextureFormat::R8Uint => HeightMapData::U8(image.data.clone()),
        TextureFormat::R16Unorm | TextureFormat::R16Uint => {
            HeightMapData::from_r16_bytes(&image.data)
        }
        TextureFormat::R32Float => HeightMapData::F32(pod_collect_to_vec(&image.data)),
        // take the red channel of color images
        TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
            HeightMapData::U8(image.data.iter().step_by(4).copied().collect())
        }
        format => bail!("unsupported height map texture format {format:?}"),
    };

    HeightMap::from_data(&data, samples, config)
}

pub fn start_height_map_loading(
    mut terrains: Query<(&TerrainConfig, &mut HeightMapLoader), Added<HeightMapLoader>>,
    asset_server: Res<AssetServer>,
) {
    for (config, mut loader) in &mut terrains {
        if let Some(path) = &config.height_map_path {
            loader.loading.insert(LoadingHeightMap {
                handle: asset_server.load(path.clone()),
            });
        }
    }
}

pub fn finish_height_map_loading(
    mut commands: Commands,
    mut terrains: Query<(Entity, &TerrainConfig, &mut HeightMapLoader)>,
    asset_server: Res<AssetServer>,
    images: Res<Assets<Image>>,
) {
    for (terrain, config, mut loader) in &mut terrains {
        let mut decoded = None;

        loader.loading.retain(|_, loading| {
            if asset_server.is_loaded(loading.handle.id()) {
                let image = images.get(&loading.handle).unwrap();
                decoded = Some(decode_image(image, config));
                false
            } else {
                true
            }
        });

        match decoded {
            Some(Ok(height_map)) => {
                commands.entity(terrain).insert(height_map);
            }
            Some(Err(error)) => warn!("failed to decode height map: {error}"),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TerrainConfig {
        TerrainConfig {
            square_size: 2.0,
            height_scale: 10.0,
            height_offset: -5.0,
            ..default()
        }
    }

    #[test]
    fn integer_samples_are_normalized_and_scaled() {
        let data = HeightMapData::from(vec![0u16, u16::MAX, u16::MAX / 2, 0]);
        let map = HeightMap::from_data(&data, UVec2::new(2, 2), &config()).unwrap();

        assert_eq!(map.sample(UVec2::new(0, 0)), -5.0);
        assert_eq!(map.sample(UVec2::new(1, 0)), 5.0);
        assert_eq!(map.min_height(), -5.0);
        assert_eq!(map.max_height(), 5.0);

        // a fresh map reports its entire sample grid as changed
        let mut map = map;
        let changed = map.take_changed();
        assert_eq!(changed, vec![URect::new(0, 0, 1, 1)]);
    }

    #[test]
    fn data_length_mismatch_is_rejected() {
        let data = HeightMapData::from(vec![0u8; 3]);
        assert!(HeightMap::from_data(&data, UVec2::new(2, 2), &config()).is_err());
    }

    #[test]
    fn sample_edits_accumulate_dirty_rects() {
        let mut map = HeightMap::from_fn(UVec2::new(4, 4), 1.0, |_, _| 0.0);
        map.take_changed();

        map.set_sample(UVec2::new(1, 2), 3.0);
        map.mark_changed(URect::new(0, 0, 10, 10));

        let changed = map.take_changed();
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0], URect::new(1, 2, 1, 2));
        // marked rectangles are clamped to the sample grid
        assert_eq!(changed[1], URect::new(0, 0, 3, 3));
        assert_eq!(map.max_height(), 3.0);

        assert!(map.take_changed().is_empty());
    }

    #[test]
    fn world_queries_interpolate_between_samples() {
        let map = HeightMap::from_fn(UVec2::new(3, 3), 2.0, |x, _| x as f32 * 10.0);

        assert_eq!(map.height_at(0.0, 0.0), 0.0);
        assert_eq!(map.height_at(2.0, 1.0), 10.0);
        assert_eq!(map.height_at(1.0, 0.0), 5.0);

        // clamped past the terrain edge
        assert_eq!(map.height_at(100.0, 100.0), 20.0);
    }
}
