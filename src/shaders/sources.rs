// WGSL for every compute program. `*_SLOT` tokens and `#define` placeholder
// lines are resolved by `ShaderBuilder::compose` before compilation.

pub const PRELUDE_WGSL: &str = r#"
struct SimParams {
  spore_count: u32,
  grid_size: u32,
  field_reduction: u32,
  spore_speed: f32,
  decay_speed: f32,
  turn_speed: f32,
  sensor_distance: f32,
  sensor_angle: f32,
  camera_position: vec4<f32>,
  camera_focus: vec4<f32>,
  delta_time: f32,
  frame_index: u32,
  _pad0: u32,
  _pad1: u32,
};

struct PassParams {
  step: u32,
  previous_grid_size: u32,
  previous_spore_count: u32,
  seed: u32,
};

struct Spore {
  position: vec3<f32>,
  direction: vec3<f32>,
};

const NO_SEED: vec4<f32> = vec4<f32>(0.0, 0.0, 0.0, -1.0);

fn hash_u32(x: u32) -> u32 {
  let state = x * 747796405u + 2891336453u;
  let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
  return (word >> 22u) ^ word;
}

fn rand01(x: u32) -> f32 {
  return f32(hash_u32(x)) / 4294967295.0;
}

fn random_direction(x: u32) -> vec3<f32> {
  let z = rand01(x) * 2.0 - 1.0;
  let phi = rand01(x ^ 0x9e3779b9u) * 6.2831853;
  let r = sqrt(max(1.0 - z * z, 0.0));
  return vec3<f32>(r * cos(phi), r * sin(phi), z);
}
"#;

pub const DECAY_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(GRID_SLOT) var grid: texture_storage_3d<r32float, read_write>;

@compute @workgroup_size(4, 4, 4)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let n = params.grid_size;
  if (gid.x >= n || gid.y >= n || gid.z >= n) { return; }
  let cell = vec3<i32>(gid);
  let value = textureLoad(grid, cell).x;
  let keep = clamp(1.0 - params.decay_speed * params.delta_time, 0.0, 1.0);
  textureStore(grid, cell, vec4<f32>(value * keep, 0.0, 0.0, 0.0));
}
"#;

pub const MOVE_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(GRID_SLOT) var grid: texture_storage_3d<r32float, read_write>;
@group(0) @binding(SPORES_SLOT) var<storage, read_write> spores: array<Spore>;

fn wrap_around() -> bool {
  var enabled = false;
#define WRAP_AROUND
  return enabled;
}

fn sense(pos: vec3<f32>) -> f32 {
  let n = i32(params.grid_size);
  var cell = vec3<i32>(floor(pos));
  if (wrap_around()) {
    cell = ((cell % n) + n) % n;
  } else if (any(cell < vec3<i32>(0)) || any(cell >= vec3<i32>(n))) {
    return 0.0;
  }
  return textureLoad(grid, cell).x;
}

fn rotate_about(v: vec3<f32>, axis: vec3<f32>, angle: f32) -> vec3<f32> {
  let c = cos(angle);
  let s = sin(angle);
  return v * c + cross(axis, v) * s + axis * dot(axis, v) * (1.0 - c);
}

fn perpendicular(d: vec3<f32>) -> vec3<f32> {
  let up = select(vec3<f32>(0.0, 1.0, 0.0), vec3<f32>(1.0, 0.0, 0.0), abs(d.y) > 0.9);
  return normalize(cross(d, up));
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let i = gid.x;
  if (i >= params.spore_count) { return; }

  let spore = spores[i];
  let forward = normalize(spore.direction);

  // sensors sit on a cone around the heading, rolled randomly each frame
  let roll = rand01(i ^ hash_u32(params.frame_index)) * 6.2831853;
  let axis = rotate_about(perpendicular(forward), forward, roll);
  let left = rotate_about(forward, axis, params.sensor_angle);
  let right = rotate_about(forward, axis, -params.sensor_angle);

  let ahead = sense(spore.position + forward * params.sensor_distance);
  let ahead_left = sense(spore.position + left * params.sensor_distance);
  let ahead_right = sense(spore.position + right * params.sensor_distance);

  let turn = min(params.turn_speed * params.delta_time, params.sensor_angle);
  var heading = forward;
  if (ahead >= ahead_left && ahead >= ahead_right) {
    heading = forward;
  } else if (ahead_left > ahead_right) {
    heading = rotate_about(forward, axis, turn);
  } else {
    heading = rotate_about(forward, axis, -turn);
  }

  let extent = f32(params.grid_size);
  var pos = spore.position + heading * params.spore_speed * params.delta_time;
  if (wrap_around()) {
    pos = pos - floor(pos / extent) * extent;
  } else {
    let below = pos < vec3<f32>(0.0);
    let above = pos >= vec3<f32>(extent);
    pos = select(pos, -pos, below);
    pos = select(pos, vec3<f32>(2.0 * extent) - pos, above);
    heading = select(heading, -heading, below | above);
  }
  pos = clamp(pos, vec3<f32>(0.0), vec3<f32>(extent - 0.001));

  spores[i] = Spore(pos, normalize(heading));
}
"#;

pub const DRAW_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(GRID_SLOT) var grid: texture_storage_3d<r32float, read_write>;
@group(0) @binding(SPORES_SLOT) var<storage, read_write> spores: array<Spore>;

const DEPOSIT: f32 = 0.25;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let i = gid.x;
  if (i >= params.spore_count) { return; }
  let n = i32(params.grid_size);
  let cell = clamp(vec3<i32>(floor(spores[i].position)), vec3<i32>(0), vec3<i32>(n - 1));
  // Not atomic: spores landing in one cell during a dispatch may leave a
  // single deposit. Every touched cell still ends at or above DEPOSIT.
  let value = textureLoad(grid, cell).x;
  textureStore(grid, cell, vec4<f32>(min(value + DEPOSIT, 1.0), 0.0, 0.0, 0.0));
}
"#;

pub const RESCALE_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(SPORES_SLOT) var<storage, read_write> spores: array<Spore>;
@group(0) @binding(PASS_SLOT) var<uniform> pass_params: PassParams;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let i = gid.x;
  if (i >= params.spore_count) { return; }
  let extent = f32(params.grid_size);

  if (i < pass_params.previous_spore_count) {
    let factor = extent / f32(max(pass_params.previous_grid_size, 1u));
    let spore = spores[i];
    let pos = clamp(spore.position * factor, vec3<f32>(0.0), vec3<f32>(extent - 0.001));
    spores[i] = Spore(pos, spore.direction);
    return;
  }

  let h = hash_u32(i ^ pass_params.seed);
  let pos = vec3<f32>(rand01(h), rand01(h ^ 0x85ebca6bu), rand01(h ^ 0xc2b2ae35u)) * (extent - 0.001);
  spores[i] = Spore(pos, random_direction(h ^ 0x27d4eb2fu));
}
"#;

pub const CLEAR_GRID_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(GRID_SLOT) var grid: texture_storage_3d<r32float, read_write>;

@compute @workgroup_size(4, 4, 4)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let n = params.grid_size;
  if (gid.x >= n || gid.y >= n || gid.z >= n) { return; }
  textureStore(grid, vec3<i32>(gid), vec4<f32>(0.0));
}
"#;

pub const FIELD_INIT_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(GRID_SLOT) var grid: texture_storage_3d<r32float, read_write>;
@group(0) @binding(FIELD_WRITE_SLOT) var field_out: texture_storage_3d<rgba32float, write>;

const SEED_THRESHOLD: f32 = 0.05;

@compute @workgroup_size(4, 4, 4)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let reduction = max(params.field_reduction, 1u);
  let size = params.grid_size / reduction;
  if (any(gid >= vec3<u32>(size))) { return; }

  let origin = gid * reduction;
  var strongest = 0.0;
  for (var z = 0u; z < reduction; z += 1u) {
    for (var y = 0u; y < reduction; y += 1u) {
      for (var x = 0u; x < reduction; x += 1u) {
        let cell = vec3<i32>(origin + vec3<u32>(x, y, z));
        strongest = max(strongest, textureLoad(grid, cell).x);
      }
    }
  }

  let seeded = vec4<f32>(vec3<f32>(gid), 0.0);
  textureStore(field_out, vec3<i32>(gid), select(NO_SEED, seeded, strongest > SEED_THRESHOLD));
}
"#;

pub const FIELD_STEP_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(FIELD_READ_SLOT) var field_in: texture_storage_3d<rgba32float, read>;
@group(0) @binding(FIELD_WRITE_SLOT) var field_out: texture_storage_3d<rgba32float, write>;
@group(0) @binding(PASS_SLOT) var<uniform> pass_params: PassParams;

@compute @workgroup_size(4, 4, 4)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let size = params.grid_size / max(params.field_reduction, 1u);
  if (any(gid >= vec3<u32>(size))) { return; }

  let cell = vec3<i32>(gid);
  let here = vec3<f32>(gid);
  let stride = i32(pass_params.step);
  let bound = i32(size);

  var best = textureLoad(field_in, cell);
  var best_distance = 3.4e38;
  if (best.w >= 0.0) {
    best_distance = distance(best.xyz, here);
  }

  for (var dz = -1; dz <= 1; dz += 1) {
    for (var dy = -1; dy <= 1; dy += 1) {
      for (var dx = -1; dx <= 1; dx += 1) {
        let probe = cell + vec3<i32>(dx, dy, dz) * stride;
        if (any(probe < vec3<i32>(0)) || any(probe >= vec3<i32>(bound))) { continue; }
        let candidate = textureLoad(field_in, probe);
        if (candidate.w < 0.0) { continue; }
        let d = distance(candidate.xyz, here);
        if (d < best_distance) {
          best = candidate;
          best_distance = d;
        }
      }
    }
  }

  if (best.w < 0.0) {
    textureStore(field_out, cell, NO_SEED);
  } else {
    textureStore(field_out, cell, vec4<f32>(best.xyz, best_distance));
  }
}
"#;

pub const VIEW_WGSL: &str = r#"
@group(0) @binding(PARAMS_SLOT) var<uniform> params: SimParams;
@group(0) @binding(GRID_SLOT) var grid: texture_storage_3d<r32float, read_write>;
@group(0) @binding(FIELD_READ_SLOT) var field_in: texture_storage_3d<rgba32float, read>;
@group(0) @binding(VIEW_SLOT) var view_out: texture_storage_2d<rgba8unorm, write>;

const MAX_STEPS: i32 = 512;
const HIT_THRESHOLD: f32 = 0.05;

fn transparent() -> bool {
  var enabled = false;
#define TRANSPARENCY
  return enabled;
}

fn shade(p: vec3<f32>, extent: f32) -> vec3<f32> {
  let t = p / extent;
  return mix(vec3<f32>(0.95, 0.85, 0.35), vec3<f32>(0.25, 0.75, 0.55), t.y);
}

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let dims = textureDimensions(view_out);
  if (gid.x >= dims.x || gid.y >= dims.y) { return; }

  let uv = (vec2<f32>(gid.xy) + vec2<f32>(0.5)) / vec2<f32>(dims) * 2.0 - vec2<f32>(1.0);
  let eye = params.camera_position.xyz;
  let forward = normalize(params.camera_focus.xyz - eye);
  let right = normalize(cross(forward, vec3<f32>(0.0, 1.0, 0.0)));
  let up = cross(right, forward);
  let ray = normalize(forward + right * uv.x - up * uv.y);

  let n = i32(params.grid_size);
  let extent = f32(params.grid_size);
  let reduction = max(params.field_reduction, 1u);
  let field_last = i32(params.grid_size / reduction) - 1;
  let cell_size = f32(reduction);

  // slab test against the grid cube
  let inv = 1.0 / select(ray, vec3<f32>(1e-6), abs(ray) < vec3<f32>(1e-6));
  let t0 = (vec3<f32>(0.0) - eye) * inv;
  let t1 = (vec3<f32>(extent) - eye) * inv;
  let t_min = min(t0, t1);
  let t_max = max(t0, t1);
  let t_near = max(max(t_min.x, t_min.y), max(t_min.z, 0.0));
  let t_far = min(min(t_max.x, t_max.y), t_max.z);

  var color = vec4<f32>(0.0);
  var t = t_near;
  for (var i = 0; i < MAX_STEPS && t < t_far; i += 1) {
    let p = eye + ray * t;
    let field_cell = clamp(vec3<i32>(p / cell_size), vec3<i32>(0), vec3<i32>(field_last));
    let nearest = textureLoad(field_in, field_cell);
    var advance = 0.5;
    if (nearest.w < 0.0) {
      advance = cell_size;
    } else if (nearest.w > 1.5) {
      advance = (nearest.w - 1.0) * cell_size;
    }

    let grid_cell = clamp(vec3<i32>(p), vec3<i32>(0), vec3<i32>(n - 1));
    let density = textureLoad(grid, grid_cell).x;
    if (density > HIT_THRESHOLD) {
      let base = shade(p, extent);
      if (transparent()) {
        let alpha = clamp(density * 0.2, 0.0, 1.0) * (1.0 - color.a);
        color = vec4<f32>(color.rgb + base * alpha, color.a + alpha);
        if (color.a > 0.98) { break; }
        advance = 0.5;
      } else {
        color = vec4<f32>(base, 1.0);
        break;
      }
    }
    t += advance;
  }

  textureStore(view_out, vec2<i32>(gid.xy), color);
}
"#;

/// Include bodies selectable through `#define` placeholders.
pub const WRAP_BOUNDARY_INCLUDE: &str = "  enabled = true;";
pub const TRANSPARENT_BLEND_INCLUDE: &str = "  enabled = true;";
