//! Tessellates a procedural height field and renders the resulting patch
//! meshes with simple standard materials.

use bevy::prelude::*;
use bevy_roam::prelude::*;

fn main() {
    App::new()
        .add_plugins((DefaultPlugins, TerrainPlugin))
        .add_systems(Startup, setup)
        .add_systems(Update, attach_meshes)
        .run();
}

fn setup(
    mut commands: Commands,
    mut view_configs: ResMut<TerrainViewComponents<TerrainViewConfig>>,
) {
    let config = TerrainConfig {
        patch_size: 64,
        square_size: 4.0,
        pool_size: 32768,
        ..default()
    };

    let height_map = HeightMap::from_fn(UVec2::splat(257), config.square_size, |x, z| {
        let (x, z) = (x as f32 * 0.08, z as f32 * 0.05);
        (x.sin() + z.cos()) * 15.0
    });

    let terrain = commands.spawn((Terrain, config, height_map)).id();

    let view = commands
        .spawn((
            TerrainView,
            Camera3d::default(),
            Transform::from_xyz(-80.0, 120.0, -80.0).looking_at(Vec3::new(512.0, 0.0, 512.0), Vec3::Y),
        ))
        .id();

    view_configs.insert((terrain, view), TerrainViewConfig::default());

    commands.spawn((
        DirectionalLight {
            illuminance: 8_000.0,
            ..default()
        },
        Transform::from_rotation(Quat::from_euler(EulerRot::XYZ, -1.0, 0.4, 0.0)),
    ));
}

/// Spawns render entities once the plugin has published the patch meshes.
fn attach_meshes(
    mut commands: Commands,
    mut materials: ResMut<Assets<StandardMaterial>>,
    terrain_meshes: Res<TerrainViewComponents<TerrainMeshes>>,
    mut attached: Local<bool>,
) {
    if *attached {
        return;
    }
    let Some(meshes) = terrain_meshes.values().next() else {
        return;
    };
    if meshes.surfaces.is_empty() {
        return;
    }

    let surface_material = materials.add(StandardMaterial {
        base_color: Color::srgb(0.3, 0.5, 0.3),
        perceptual_roughness: 1.0,
        ..default()
    });
    let skirt_material = materials.add(StandardMaterial {
        base_color: Color::srgb(0.2, 0.3, 0.2),
        unlit: true,
        alpha_mode: AlphaMode::Blend,
        cull_mode: None,
        ..default()
    });

    for handle in &meshes.surfaces {
        commands.spawn((Mesh3d(handle.clone()), MeshMaterial3d(surface_material.clone())));
    }
    for handle in &meshes.skirts {
        commands.spawn((Mesh3d(handle.clone()), MeshMaterial3d(skirt_material.clone())));
    }

    *attached = true;
}
