//! Per-frame orchestration of the simulation passes.
//!
//! A normal frame runs `upload -> decay -> move -> draw -> field`. The first
//! frame after a structural change (grid size, spore count or field
//! reduction) runs `upload -> rescale -> clear -> field` instead, so spores are
//! moved into the new grid extent before the simulation resumes.

use serde::Serialize;
use wgpu::util::DeviceExt;

use crate::bindings::{GRID_FORMAT, LayoutKind, Slot};
use crate::dispatch::WorkGroupDispatcher;
use crate::error::SimError;
use crate::field::{DistanceFieldGenerator, FieldReport};
use crate::gpu::{self, GpuContext};
use crate::params::{
    OrbitCamera, ParameterBuffer, PassBuffer, PassParams, SimConfig, SimulationParameters, Spore,
    divisible_grid_size, seed_spores,
};
use crate::shaders::{Feature, ProgramKind, ShaderBuilder, ShaderVariantRegistry};
use crate::view::{HeadlessView, ViewStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FramePass {
    UploadParameters,
    Decay,
    Move,
    Draw,
    Rescale,
    ClearGrid,
    DistanceField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Step,
    Resize,
}

impl FrameKind {
    pub const fn passes(self) -> &'static [FramePass] {
        match self {
            FrameKind::Step => &[
                FramePass::UploadParameters,
                FramePass::Decay,
                FramePass::Move,
                FramePass::Draw,
                FramePass::DistanceField,
            ],
            FrameKind::Resize => &[
                FramePass::UploadParameters,
                FramePass::Rescale,
                FramePass::ClearGrid,
                FramePass::DistanceField,
            ],
        }
    }
}

/// The parameters that size GPU resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Structure {
    pub grid_size: u32,
    pub spore_count: u32,
    pub field_reduction: u32,
}

impl Structure {
    pub fn of(params: &SimulationParameters) -> Self {
        Self {
            grid_size: params.grid_size,
            spore_count: params.spore_count,
            field_reduction: params.field_reduction,
        }
    }

    fn apply(self, params: &mut SimulationParameters) {
        params.grid_size = self.grid_size;
        params.spore_count = self.spore_count;
        params.field_reduction = self.field_reduction;
    }
}

/// Device ceilings for the resources a [`Structure`] sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationLimits {
    pub max_texture_3d: u32,
    pub max_storage_bytes: u64,
}

impl AllocationLimits {
    pub fn of(gpu: &GpuContext) -> Self {
        Self {
            max_texture_3d: gpu.max_texture_3d,
            max_storage_bytes: gpu.max_storage_bytes,
        }
    }

    pub fn check(&self, structure: Structure) -> Result<(), SimError> {
        if structure.grid_size > self.max_texture_3d {
            return Err(SimError::GridTooLarge {
                requested: structure.grid_size,
                limit: self.max_texture_3d,
            });
        }
        let bytes = spore_buffer_size(structure.spore_count);
        if bytes > self.max_storage_bytes {
            return Err(SimError::SporeBufferTooLarge {
                count: structure.spore_count,
                bytes,
                limit: self.max_storage_bytes,
            });
        }
        Ok(())
    }
}

/// Normalizes a requested structure and compares it with the allocated one.
/// `Ok(None)` means the resources can stay as they are.
pub fn plan_resize(
    allocated: Structure,
    requested: Structure,
    limits: &AllocationLimits,
) -> Result<Option<Structure>, SimError> {
    let field_reduction = requested.field_reduction.max(1);
    let target = Structure {
        grid_size: divisible_grid_size(requested.grid_size, field_reduction),
        spore_count: requested.spore_count.max(1),
        field_reduction,
    };
    limits.check(target)?;
    Ok((target != allocated).then_some(target))
}

#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame: u32,
    pub kind: FrameKind,
    pub dispatches: u64,
    pub field: FieldReport,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GridStats {
    pub total: f32,
    pub max: f32,
    /// Fraction of cells holding any trail.
    pub footprint: f32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FieldStats {
    /// Fraction of reduced cells that found a seed.
    pub seeded: f32,
    pub max_distance: f32,
}

struct GridImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl GridImage {
    fn new(device: &wgpu::Device, size: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("grid"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: size,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: GRID_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

fn spore_buffer_size(count: u32) -> u64 {
    u64::from(count) * std::mem::size_of::<Spore>() as u64
}

const SPORE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

pub struct SimulationPipeline {
    gpu: GpuContext,
    registry: ShaderVariantRegistry,
    dispatcher: WorkGroupDispatcher,
    params: SimulationParameters,
    camera: OrbitCamera,
    parameter_buffer: ParameterBuffer,
    pass_buffer: PassBuffer,
    grid: GridImage,
    spores: wgpu::Buffer,
    simulation_group: wgpu::BindGroup,
    field: DistanceFieldGenerator,
    allocated: Structure,
    /// Structure the resources had before the resize that the next frame rescales from.
    rescale_from: Option<Structure>,
    frame_index: u32,
    seed: u64,
    field_pass_limit: Option<u32>,
}

impl SimulationPipeline {
    pub fn new(gpu: GpuContext, config: &SimConfig) -> Result<Self, SimError> {
        let params = SimulationParameters::from_config(config);
        AllocationLimits::of(&gpu).check(Structure::of(&params))?;

        let mut builder = ShaderBuilder::standard();
        if config.wrap_around {
            builder.add(Feature::WrapAround.token(), Feature::WrapAround.definition());
        }
        if config.transparency {
            builder.add(Feature::Transparency.token(), Feature::Transparency.definition());
        }
        let registry = ShaderVariantRegistry::new(gpu.device.clone(), gpu.limits, builder)?;
        let dispatcher = WorkGroupDispatcher::new(gpu.device.clone(), gpu.queue.clone(), gpu.limits);

        let device = &gpu.device;
        let resources = gpu::scoped(device, "pipeline resources", || {
            let parameter_buffer = ParameterBuffer::new(device, "sim-params");
            let pass_buffer = PassBuffer::new(device, "pass-params");
            let grid = GridImage::new(device, params.grid_size);

            // host copy lives only until the upload
            let spores = {
                let seeded = seed_spores(params.spore_count, params.grid_size, config.seed);
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("spores"),
                    contents: bytemuck::cast_slice(&seeded),
                    usage: SPORE_USAGE,
                })
            };

            let simulation_group =
                Self::simulation_group(device, &registry, &parameter_buffer, &pass_buffer, &grid, &spores);
            let field = DistanceFieldGenerator::new(
                device,
                &registry,
                &params,
                &parameter_buffer,
                &pass_buffer,
                &grid.view,
                config.max_field_passes,
            );
            (parameter_buffer, pass_buffer, grid, spores, simulation_group, field)
        })?;
        let (parameter_buffer, pass_buffer, grid, spores, simulation_group, field) = resources;

        log::info!(
            "pipeline ready: grid {}^3, {} spores, field {}^3",
            params.grid_size,
            params.spore_count,
            field.reduced_size()
        );

        Ok(Self {
            registry,
            dispatcher,
            camera: OrbitCamera::from_config(config),
            allocated: Structure::of(&params),
            params,
            parameter_buffer,
            pass_buffer,
            grid,
            spores,
            simulation_group,
            field,
            rescale_from: None,
            frame_index: 0,
            seed: config.seed,
            field_pass_limit: config.max_field_passes,
            gpu,
        })
    }

    fn simulation_group(
        device: &wgpu::Device,
        registry: &ShaderVariantRegistry,
        parameter_buffer: &ParameterBuffer,
        pass_buffer: &PassBuffer,
        grid: &GridImage,
        spores: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("simulation"),
            layout: registry.bind_group_layout(LayoutKind::Simulation),
            entries: &[
                Slot::Params.entry(parameter_buffer.binding()),
                Slot::Grid.entry(wgpu::BindingResource::TextureView(&grid.view)),
                Slot::Spores.entry(spores.as_entire_binding()),
                Slot::Pass.entry(pass_buffer.binding()),
            ],
        })
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn params(&self) -> &SimulationParameters {
        &self.params
    }

    /// Tunables take effect at the next upload. Structural fields trigger a
    /// resize frame.
    pub fn params_mut(&mut self) -> &mut SimulationParameters {
        &mut self.params
    }

    pub fn registry(&self) -> &ShaderVariantRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &WorkGroupDispatcher {
        &self.dispatcher
    }

    pub fn field(&self) -> &DistanceFieldGenerator {
        &self.field
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Recompiles the programs using the feature's placeholder. Only call
    /// between frames.
    pub fn set_feature(&mut self, feature: Feature, enabled: bool) -> Result<bool, SimError> {
        let changed = self.registry.set_feature(feature, enabled)?;
        if changed {
            log::info!("{} {}", feature.token(), if enabled { "enabled" } else { "disabled" });
        }
        Ok(changed)
    }

    /// Runs one frame. Any failing pass aborts the frame.
    pub fn step(&mut self, delta_time: f32) -> Result<FrameReport, SimError> {
        let kind = self.sync_structure()?;
        let before = self.dispatcher.dispatched();

        self.params.delta_time = delta_time;
        self.params.frame_index = self.frame_index;
        self.camera.advance(delta_time, &mut self.params);

        let mut field = None;
        for &pass in kind.passes() {
            match pass {
                FramePass::UploadParameters => self.parameter_buffer.upload(&self.gpu.queue, &self.params),
                FramePass::Decay => self.dispatch_grid(ProgramKind::Decay)?,
                FramePass::Move => self.dispatch_spores(ProgramKind::Move)?,
                FramePass::Draw => self.dispatch_spores(ProgramKind::Draw)?,
                FramePass::Rescale => self.rescale()?,
                FramePass::ClearGrid => self.dispatch_grid(ProgramKind::ClearGrid)?,
                FramePass::DistanceField => {
                    field = Some(self.field.generate(
                        &mut self.dispatcher,
                        &self.registry,
                        &self.gpu.queue,
                        &self.pass_buffer,
                    )?);
                }
            }
        }

        let report = FrameReport {
            frame: self.frame_index,
            kind,
            dispatches: self.dispatcher.dispatched() - before,
            field: field.unwrap_or_else(|| FieldReport {
                passes: 0,
                strides: Vec::new(),
                read_index: self.field.read_index(),
            }),
        };
        log::debug!(
            "frame {} {:?}: {} dispatches, {} field passes",
            report.frame,
            report.kind,
            report.dispatches,
            report.field.passes
        );
        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(report)
    }

    fn dispatch_grid(&mut self, kind: ProgramKind) -> Result<(), SimError> {
        let n = self.params.grid_size;
        self.dispatcher
            .dispatch(self.registry.program(kind), &self.simulation_group, [n, n, n])?;
        Ok(())
    }

    fn dispatch_spores(&mut self, kind: ProgramKind) -> Result<(), SimError> {
        self.dispatcher.dispatch(
            self.registry.program(kind),
            &self.simulation_group,
            [self.params.spore_count, 1, 1],
        )?;
        Ok(())
    }

    fn rescale(&mut self) -> Result<(), SimError> {
        let previous = self.rescale_from.take().unwrap_or(self.allocated);
        let pass = PassParams {
            step: 0,
            previous_grid_size: previous.grid_size,
            previous_spore_count: previous.spore_count.min(self.params.spore_count),
            seed: (self.seed as u32) ^ self.frame_index.wrapping_mul(0x9e37_79b9),
        };
        self.pass_buffer.upload(&self.gpu.queue, &pass);
        self.dispatch_spores(ProgramKind::Rescale)
    }

    /// Detects structural edits made through `params_mut` and reallocates the
    /// resources they size.
    fn sync_structure(&mut self) -> Result<FrameKind, SimError> {
        let requested = Structure::of(&self.params);
        let target = match plan_resize(self.allocated, requested, &AllocationLimits::of(&self.gpu)) {
            Ok(Some(target)) => target,
            Ok(None) => {
                self.allocated.apply(&mut self.params);
                return Ok(FrameKind::Step);
            }
            Err(err) => {
                self.allocated.apply(&mut self.params);
                return Err(err);
            }
        };

        let previous = self.allocated;
        let mut resized = self.params;
        target.apply(&mut resized);

        let device = &self.gpu.device;
        let allocated = gpu::scoped(device, "resized resources", || {
            let grid = (target.grid_size != previous.grid_size).then(|| GridImage::new(device, target.grid_size));
            let spores = (target.spore_count != previous.spore_count).then(|| {
                let spores = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("spores"),
                    size: spore_buffer_size(target.spore_count),
                    usage: SPORE_USAGE,
                    mapped_at_creation: false,
                });
                let kept = previous.spore_count.min(target.spore_count);
                let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("spore-realloc"),
                });
                encoder.copy_buffer_to_buffer(&self.spores, 0, &spores, 0, spore_buffer_size(kept));
                self.gpu.queue.submit(Some(encoder.finish()));
                spores
            });
            let grid_ref = grid.as_ref().unwrap_or(&self.grid);
            let spores_ref = spores.as_ref().unwrap_or(&self.spores);
            let simulation_group = Self::simulation_group(
                device,
                &self.registry,
                &self.parameter_buffer,
                &self.pass_buffer,
                grid_ref,
                spores_ref,
            );
            let field = DistanceFieldGenerator::new(
                device,
                &self.registry,
                &resized,
                &self.parameter_buffer,
                &self.pass_buffer,
                &grid_ref.view,
                self.field_pass_limit,
            );
            (grid, spores, simulation_group, field)
        });
        let (grid, spores, simulation_group, field) = match allocated {
            Ok(resources) => resources,
            Err(err) => {
                self.allocated.apply(&mut self.params);
                return Err(err);
            }
        };

        log::info!(
            "resize: grid {} -> {}, spores {} -> {}, reduction {} -> {}",
            previous.grid_size,
            target.grid_size,
            previous.spore_count,
            target.spore_count,
            previous.field_reduction,
            target.field_reduction
        );
        if let Some(grid) = grid {
            self.grid = grid;
        }
        if let Some(spores) = spores {
            self.spores = spores;
        }
        self.simulation_group = simulation_group;
        self.field = field;
        self.params = resized;
        self.allocated = target;
        self.rescale_from = Some(previous);
        Ok(FrameKind::Resize)
    }

    pub fn read_grid_stats(&self) -> Result<GridStats, SimError> {
        let cells = gpu::read_texture_f32(&self.gpu.device, &self.gpu.queue, &self.grid.texture, 1)?;
        let count = cells.len().max(1) as f32;
        let occupied = cells.iter().filter(|&&v| v > 0.0).count();
        Ok(GridStats {
            total: cells.iter().sum(),
            max: cells.iter().copied().fold(0.0, f32::max),
            footprint: occupied as f32 / count,
        })
    }

    pub fn read_field_stats(&self) -> Result<FieldStats, SimError> {
        let texture = self.field.texture(self.field.read_index());
        let texels = gpu::read_texture_f32(&self.gpu.device, &self.gpu.queue, texture, 4)?;
        let count = (texels.len() / 4).max(1) as f32;
        let mut seeded = 0usize;
        let mut max_distance = 0.0f32;
        for texel in texels.chunks_exact(4) {
            if texel[3] >= 0.0 {
                seeded += 1;
                max_distance = max_distance.max(texel[3]);
            }
        }
        Ok(FieldStats {
            seeded: seeded as f32 / count,
            max_distance,
        })
    }

    /// Reads every spore back. Debug and test use only.
    pub fn read_spores(&self) -> Result<Vec<Spore>, SimError> {
        let size = spore_buffer_size(self.params.spore_count);
        let device = &self.gpu.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("spores-readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("spores-readback"),
        });
        encoder.copy_buffer_to_buffer(&self.spores, 0, &staging, 0, size);
        self.gpu.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        gpu::map_wait(device, &slice)?;
        let spores = bytemuck::cast_slice::<u8, Spore>(&slice.get_mapped_range()).to_vec();
        staging.unmap();
        Ok(spores)
    }

    /// Raymarches the current field into an offscreen image and summarizes it.
    pub fn render_view(&mut self, width: u32, height: u32) -> Result<ViewStats, SimError> {
        self.parameter_buffer.upload(&self.gpu.queue, &self.params);
        let view = HeadlessView::new(
            &self.gpu.device,
            &self.registry,
            &self.parameter_buffer,
            &self.grid.view,
            &self.field,
            width,
            height,
        );
        view.render(&mut self.dispatcher, &self.registry, self.field.read_index())?;
        view.read_stats(&self.gpu.device, &self.gpu.queue)
    }
}
