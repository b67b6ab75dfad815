use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;

/// Host-facing configuration surface, read from the harness request.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_spore_count")]
    pub spore_count: u32,
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,
    #[serde(default = "default_field_reduction")]
    pub field_reduction: u32,
    #[serde(default = "default_spore_speed")]
    pub spore_speed: f32,
    #[serde(default = "default_decay_speed")]
    pub decay_speed: f32,
    #[serde(default = "default_turn_speed")]
    pub turn_speed: f32,
    #[serde(default = "default_sensor_distance")]
    pub sensor_distance: f32,
    #[serde(default = "default_sensor_angle")]
    pub sensor_angle: f32,
    #[serde(default)]
    pub wrap_around: bool,
    #[serde(default)]
    pub transparency: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_camera_distance")]
    pub camera_distance: f32,
    #[serde(default = "default_orbit_speed")]
    pub orbit_speed: f32,
    /// Debug only: stop the jump flood after this many propagation passes.
    #[serde(default)]
    pub max_field_passes: Option<u32>,
}

fn default_spore_count() -> u32 { 100_000 }
fn default_grid_size() -> u32 { 128 }
fn default_field_reduction() -> u32 { 4 }
fn default_spore_speed() -> f32 { 20.0 }
fn default_decay_speed() -> f32 { 0.5 }
fn default_turn_speed() -> f32 { 8.0 }
fn default_sensor_distance() -> f32 { 3.0 }
fn default_sensor_angle() -> f32 { 0.5 }
fn default_seed() -> u64 { 7 }
fn default_camera_distance() -> f32 { 1.8 }
fn default_orbit_speed() -> f32 { 0.25 }

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            spore_count: default_spore_count(),
            grid_size: default_grid_size(),
            field_reduction: default_field_reduction(),
            spore_speed: default_spore_speed(),
            decay_speed: default_decay_speed(),
            turn_speed: default_turn_speed(),
            sensor_distance: default_sensor_distance(),
            sensor_angle: default_sensor_angle(),
            wrap_around: false,
            transparency: false,
            seed: default_seed(),
            camera_distance: default_camera_distance(),
            orbit_speed: default_orbit_speed(),
            max_field_passes: None,
        }
    }
}

/// Uniform record uploaded wholesale every frame. Layout matches `SimParams`
/// in the WGSL prelude; the camera vectors sit at 16-byte offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SimulationParameters {
    pub spore_count: u32,
    pub grid_size: u32,
    pub field_reduction: u32,
    pub spore_speed: f32,
    pub decay_speed: f32,
    pub turn_speed: f32,
    pub sensor_distance: f32,
    pub sensor_angle: f32,
    pub camera_position: [f32; 4],
    pub camera_focus: [f32; 4],
    pub delta_time: f32,
    pub frame_index: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl SimulationParameters {
    pub fn from_config(config: &SimConfig) -> Self {
        let field_reduction = config.field_reduction.max(1);
        let grid_size = divisible_grid_size(config.grid_size, field_reduction);
        let center = Vec3::splat(grid_size as f32 * 0.5);
        Self {
            spore_count: config.spore_count.max(1),
            grid_size,
            field_reduction,
            spore_speed: config.spore_speed,
            decay_speed: config.decay_speed,
            turn_speed: config.turn_speed,
            sensor_distance: config.sensor_distance,
            sensor_angle: config.sensor_angle,
            camera_position: (center + Vec3::Z * grid_size as f32 * config.camera_distance)
                .extend(1.0)
                .to_array(),
            camera_focus: center.extend(1.0).to_array(),
            delta_time: 0.0,
            frame_index: 0,
            _pad0: 0,
            _pad1: 0,
        }
    }

    pub fn reduced_grid_size(&self) -> u32 {
        self.grid_size / self.field_reduction.max(1)
    }

    /// `grid_size % field_reduction == 0`.
    pub fn is_reduction_aligned(&self) -> bool {
        self.grid_size % self.field_reduction.max(1) == 0
    }
}

/// Nearest multiple of `reduction` to `requested`, never below one multiple.
/// Ties round down.
pub fn nearest_multiple(requested: u32, reduction: u32) -> u32 {
    let reduction = reduction.max(1);
    let below = requested / reduction * reduction;
    let above = below.saturating_add(reduction);
    let adjusted = if requested - below <= above - requested { below } else { above };
    adjusted.max(reduction)
}

/// Grid size that keeps the reduced field aligned. Misaligned sizes are a
/// configuration error: logged and adjusted, never rejected.
pub fn divisible_grid_size(requested: u32, reduction: u32) -> u32 {
    let adjusted = nearest_multiple(requested, reduction);
    if adjusted != requested {
        log::warn!(
            "grid size {requested} is not divisible by field reduction {reduction}; using {adjusted}"
        );
    }
    adjusted
}

/// Per-dispatch uniform: the jump-flood stride and the inputs of the rescale pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PassParams {
    pub step: u32,
    pub previous_grid_size: u32,
    pub previous_spore_count: u32,
    pub seed: u32,
}

/// One particle. Both vectors are padded to 16 bytes to match `Spore` in WGSL.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Spore {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub direction: [f32; 3],
    pub _pad1: f32,
}

impl Spore {
    pub fn new(position: Vec3, direction: Vec3) -> Self {
        Self {
            position: position.to_array(),
            _pad0: 0.0,
            direction: direction.normalize_or(Vec3::X).to_array(),
            _pad1: 0.0,
        }
    }
}

/// Deterministic initial spores: uniform positions inside the grid, uniform
/// unit directions.
pub fn seed_spores(count: u32, grid_size: u32, seed: u64) -> Vec<Spore> {
    let mut rng = StdRng::seed_from_u64(seed);
    let extent = grid_size as f32;
    (0..count)
        .map(|_| {
            let position = Vec3::new(
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
                rng.gen_range(0.0..extent),
            );
            let z: f32 = rng.gen_range(-1.0..1.0);
            let phi: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
            let r = (1.0 - z * z).max(0.0).sqrt();
            Spore::new(position, Vec3::new(r * phi.cos(), r * phi.sin(), z))
        })
        .collect()
}

/// GPU copy of a uniform record, overwritten in full on every upload.
pub struct UniformBuffer<T> {
    buffer: wgpu::Buffer,
    _record: std::marker::PhantomData<T>,
}

impl<T: Pod> UniformBuffer<T> {
    pub fn new(device: &wgpu::Device, label: &str) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: std::mem::size_of::<T>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            _record: std::marker::PhantomData,
        }
    }

    pub fn upload(&self, queue: &wgpu::Queue, record: &T) {
        queue.write_buffer(&self.buffer, 0, bytemuck::bytes_of(record));
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }
}

/// ParameterBufferSync: the frame's [`SimulationParameters`] on the GPU.
pub type ParameterBuffer = UniformBuffer<SimulationParameters>;
pub type PassBuffer = UniformBuffer<PassParams>;

/// Camera circling the grid center, written into the parameters each frame.
#[derive(Debug, Clone, Copy)]
pub struct OrbitCamera {
    pub angle: f32,
    pub distance: f32,
    pub speed: f32,
}

impl OrbitCamera {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            angle: 0.0,
            distance: config.camera_distance,
            speed: config.orbit_speed,
        }
    }

    pub fn advance(&mut self, delta_time: f32, params: &mut SimulationParameters) {
        self.angle = (self.angle + self.speed * delta_time) % std::f32::consts::TAU;
        let extent = params.grid_size as f32;
        let center = Vec3::splat(extent * 0.5);
        let offset = Vec3::new(self.angle.sin(), 0.35, self.angle.cos()).normalize() * extent * self.distance;
        params.camera_position = (center + offset).extend(1.0).to_array();
        params.camera_focus = center.extend(1.0).to_array();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn parameter_layout_matches_wgsl() {
        assert_eq!(offset_of!(SimulationParameters, camera_position), 32);
        assert_eq!(offset_of!(SimulationParameters, camera_focus), 48);
        assert_eq!(offset_of!(SimulationParameters, delta_time), 64);
        assert_eq!(size_of::<SimulationParameters>(), 80);
        assert_eq!(size_of::<SimulationParameters>() % 16, 0);
    }

    #[test]
    fn spore_is_two_padded_vectors() {
        assert_eq!(size_of::<Spore>(), 32);
        assert_eq!(offset_of!(Spore, direction), 16);
        assert_eq!(size_of::<PassParams>(), 16);
    }

    #[test]
    fn nearest_multiple_prefers_closest() {
        assert_eq!(nearest_multiple(301, 3), 300);
        assert_eq!(nearest_multiple(302, 3), 303);
        assert_eq!(nearest_multiple(300, 3), 300);
        assert_eq!(nearest_multiple(32, 2), 32);
        // tie goes down
        assert_eq!(nearest_multiple(6, 4), 4);
        // never below one multiple
        assert_eq!(nearest_multiple(1, 4), 4);
        assert_eq!(nearest_multiple(0, 3), 3);
    }

    #[test]
    fn resize_to_301_is_never_kept_with_reduction_3() {
        let adjusted = divisible_grid_size(301, 3);
        assert_ne!(adjusted, 301);
        assert_eq!(adjusted % 3, 0);
        assert!(adjusted == 300 || adjusted == 303);
    }

    #[test]
    fn from_config_aligns_grid() {
        let config = SimConfig {
            grid_size: 301,
            field_reduction: 3,
            ..SimConfig::default()
        };
        let params = SimulationParameters::from_config(&config);
        assert_eq!(params.grid_size, 300);
        assert!(params.is_reduction_aligned());
        assert_eq!(params.reduced_grid_size(), 100);
    }

    #[test]
    fn reduced_size_for_32_by_2() {
        let config = SimConfig {
            grid_size: 32,
            field_reduction: 2,
            ..SimConfig::default()
        };
        assert_eq!(SimulationParameters::from_config(&config).reduced_grid_size(), 16);
    }

    #[test]
    fn seeded_spores_are_deterministic_and_inside() {
        let a = seed_spores(256, 32, 11);
        let b = seed_spores(256, 32, 11);
        assert_eq!(a, b);
        for spore in &a {
            let p = Vec3::from_array(spore.position);
            assert!(p.cmpge(Vec3::ZERO).all() && p.cmplt(Vec3::splat(32.0)).all());
            let len = Vec3::from_array(spore.direction).length();
            assert!((len - 1.0).abs() < 1e-4, "direction length {len}");
        }
        assert_ne!(seed_spores(256, 32, 12), a);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SimConfig = serde_json::from_str(r#"{"grid_size": 64, "wrap_around": true}"#).unwrap();
        assert_eq!(config.grid_size, 64);
        assert!(config.wrap_around);
        assert_eq!(config.field_reduction, 4);
        assert_eq!(config.max_field_passes, None);
    }

    #[test]
    fn orbit_camera_stays_at_distance() {
        let mut params = SimulationParameters::from_config(&SimConfig::default());
        let mut camera = OrbitCamera::from_config(&SimConfig::default());
        camera.advance(1.0, &mut params);
        let eye = Vec3::new(params.camera_position[0], params.camera_position[1], params.camera_position[2]);
        let focus = Vec3::new(params.camera_focus[0], params.camera_focus[1], params.camera_focus[2]);
        let expected = params.grid_size as f32 * camera.distance;
        assert!((eye.distance(focus) - expected).abs() < 1e-2);
        assert_eq!(params.camera_position[3], 1.0);
    }
}
