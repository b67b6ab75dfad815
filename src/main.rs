use anyhow::{Context, Result};
use moldlab_compute::dispatch::WorkGroupLimits;
use moldlab_compute::pipeline::{FieldStats, FrameKind, GridStats};
use moldlab_compute::view::ViewStats;
use moldlab_compute::{Feature, GpuContext, SimConfig, SimulationPipeline};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Limits,
    Simulate {
        #[serde(default)]
        config: SimConfig,
        #[serde(default = "default_frames")]
        frames: u32,
        #[serde(default = "default_dt")]
        dt: f32,
        #[serde(default)]
        resize: Option<ResizeAt>,
        #[serde(default)]
        toggle: Option<ToggleAt>,
        #[serde(default)]
        view_size: Option<u32>,
    },
}

/// Structural change applied between frames, as the UI would.
#[derive(Debug, Deserialize)]
struct ResizeAt {
    at_frame: u32,
    grid_size: Option<u32>,
    spore_count: Option<u32>,
    field_reduction: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ToggleAt {
    at_frame: u32,
    wrap_around: Option<bool>,
    transparency: Option<bool>,
}

fn default_frames() -> u32 { 60 }
fn default_dt() -> f32 { 1.0 / 60.0 }

#[derive(Debug, Serialize)]
struct LimitsResponse {
    ok: bool,
    backend: String,
    adapter: String,
    limits: WorkGroupLimits,
    max_texture_3d: u32,
}

#[derive(Debug, Serialize)]
struct SimulateResponse {
    ok: bool,
    backend: String,
    frames: u32,
    resize_frames: Vec<u32>,
    elapsed_ms: f64,
    fps: f64,
    dispatches: u64,
    grid_size: u32,
    spore_count: u32,
    reduced_grid_size: u32,
    field_passes: u32,
    field_strides: Vec<u32>,
    field_read_index: usize,
    grid: GridStats,
    field: FieldStats,
    view: Option<ViewStats>,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        let out = serde_json::json!({"ok": false, "error": format!("{err:#}")});
        println!(
            "{}",
            serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{\"ok\":false}".into())
        );
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    let req: Request = if input.trim().is_empty() {
        Request::Limits
    } else {
        serde_json::from_str(&input).context("invalid JSON request")?
    };

    match req {
        Request::Limits => {
            let gpu = GpuContext::new().context("device init failed")?;
            let resp = LimitsResponse {
                ok: true,
                backend: gpu.backend.clone(),
                adapter: gpu.adapter_name.clone(),
                limits: gpu.limits,
                max_texture_3d: gpu.max_texture_3d,
            };
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Request::Simulate {
            config,
            frames,
            dt,
            resize,
            toggle,
            view_size,
        } => {
            let resp = run_simulation(&config, frames.max(1), dt.max(1e-4), resize, toggle, view_size)?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
    }

    Ok(())
}

/// Logs the mean frame rate once per accumulated second of wall time.
struct FrameRate {
    window_start: Instant,
    frames: u32,
}

impl FrameRate {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    fn tick(&mut self) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            log::info!("{:.1} fps", f64::from(self.frames) / elapsed.as_secs_f64());
            self.window_start = Instant::now();
            self.frames = 0;
        }
    }
}

fn run_simulation(
    config: &SimConfig,
    frames: u32,
    dt: f32,
    resize: Option<ResizeAt>,
    toggle: Option<ToggleAt>,
    view_size: Option<u32>,
) -> Result<SimulateResponse> {
    let t0 = Instant::now();
    let gpu = GpuContext::new().context("device init failed")?;
    let backend = gpu.backend.clone();
    let mut pipeline = SimulationPipeline::new(gpu, config).context("pipeline init failed")?;

    let mut rate = FrameRate::new();
    let mut resize_frames = Vec::new();
    let mut last_field = None;
    for frame in 0..frames {
        if let Some(r) = resize.as_ref().filter(|r| r.at_frame == frame) {
            let params = pipeline.params_mut();
            if let Some(grid_size) = r.grid_size {
                params.grid_size = grid_size;
            }
            if let Some(spore_count) = r.spore_count {
                params.spore_count = spore_count;
            }
            if let Some(field_reduction) = r.field_reduction {
                params.field_reduction = field_reduction;
            }
        }
        if let Some(t) = toggle.as_ref().filter(|t| t.at_frame == frame) {
            if let Some(enabled) = t.wrap_around {
                pipeline.set_feature(Feature::WrapAround, enabled)?;
            }
            if let Some(enabled) = t.transparency {
                pipeline.set_feature(Feature::Transparency, enabled)?;
            }
        }

        let report = pipeline
            .step(dt)
            .with_context(|| format!("frame {frame} failed"))?;
        if report.kind == FrameKind::Resize {
            resize_frames.push(report.frame);
        }
        last_field = Some(report.field);
        rate.tick();
    }

    let elapsed = t0.elapsed().as_secs_f64();
    let view = view_size
        .map(|size| pipeline.render_view(size, size))
        .transpose()
        .context("view pass failed")?;
    let grid = pipeline.read_grid_stats()?;
    let field = pipeline.read_field_stats()?;
    let params = *pipeline.params();
    let field_report = last_field.context("no frame ran")?;

    Ok(SimulateResponse {
        ok: true,
        backend,
        frames,
        resize_frames,
        elapsed_ms: elapsed * 1000.0,
        fps: f64::from(frames) / elapsed.max(1e-6),
        dispatches: pipeline.dispatcher().dispatched(),
        grid_size: params.grid_size,
        spore_count: params.spore_count,
        reduced_grid_size: params.reduced_grid_size(),
        field_passes: field_report.passes,
        field_strides: field_report.strides,
        field_read_index: field_report.read_index,
        grid,
        field,
        view,
    })
}
