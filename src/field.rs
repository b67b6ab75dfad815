//! Jump-flood distance field over the reduced grid.
//!
//! The init pass seeds the "read" image from the simulation grid. Each
//! propagation pass reads one image, writes the other, then the roles swap.
//! The image left in the read role after the last pass holds the field.

use crate::bindings::{FIELD_FORMAT, LayoutKind, Slot};
use crate::dispatch::WorkGroupDispatcher;
use crate::error::SimError;
use crate::params::{PassBuffer, PassParams, ParameterBuffer, SimulationParameters};
use crate::shaders::{ProgramKind, ShaderVariantRegistry};

/// Strides of the propagation passes: `size / 2`, halving down to 1.
#[derive(Debug, Clone)]
pub struct JumpFloodSchedule {
    next: u32,
    remaining: Option<u32>,
}

impl JumpFloodSchedule {
    pub fn new(reduced_size: u32) -> Self {
        Self {
            next: reduced_size / 2,
            remaining: None,
        }
    }

    /// Debug override: stop after `limit` passes even if not converged.
    pub fn with_pass_limit(mut self, limit: Option<u32>) -> Self {
        self.remaining = limit;
        self
    }

    /// Number of propagation passes the schedule runs.
    pub fn pass_count(&self) -> u32 {
        self.clone().count() as u32
    }

    /// Whether the pass limit stops the schedule before it converges.
    pub fn truncates(&self) -> bool {
        let full = Self {
            remaining: None,
            ..self.clone()
        };
        self.pass_count() < full.pass_count()
    }
}

impl Iterator for JumpFloodSchedule {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == 0 || self.remaining == Some(0) {
            return None;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        let step = self.next;
        self.next /= 2;
        Some(step)
    }
}

/// Index of the image currently in the read role; the other one is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingPong {
    read: usize,
}

impl PingPong {
    pub fn read(&self) -> usize {
        self.read
    }

    pub fn write(&self) -> usize {
        1 - self.read
    }

    pub fn swap(&mut self) {
        self.read = 1 - self.read;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldReport {
    pub passes: u32,
    pub strides: Vec<u32>,
    /// Image holding the converged field.
    pub read_index: usize,
}

struct FieldImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

pub struct DistanceFieldGenerator {
    images: [FieldImage; 2],
    /// `init_groups[i]` seeds image `i`.
    init_groups: [wgpu::BindGroup; 2],
    /// `step_groups[i]` reads image `i` and writes the other one.
    step_groups: [wgpu::BindGroup; 2],
    reduced_size: u32,
    pass_limit: Option<u32>,
    last_read: usize,
}

impl DistanceFieldGenerator {
    pub fn new(
        device: &wgpu::Device,
        registry: &ShaderVariantRegistry,
        params: &SimulationParameters,
        parameter_buffer: &ParameterBuffer,
        pass_buffer: &PassBuffer,
        grid_view: &wgpu::TextureView,
        pass_limit: Option<u32>,
    ) -> Self {
        if !params.is_reduction_aligned() {
            log::warn!(
                "grid size {} is not divisible by field reduction {}; field output is degraded",
                params.grid_size,
                params.field_reduction
            );
        }
        let reduced_size = params.reduced_grid_size().max(1);
        let images = [0, 1].map(|i| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(if i == 0 { "field-a" } else { "field-b" }),
                size: wgpu::Extent3d {
                    width: reduced_size,
                    height: reduced_size,
                    depth_or_array_layers: reduced_size,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D3,
                format: FIELD_FORMAT,
                usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            FieldImage { texture, view }
        });

        let init_layout = registry.bind_group_layout(LayoutKind::FieldInit);
        let init_groups = [0, 1].map(|i| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("field-init"),
                layout: init_layout,
                entries: &[
                    Slot::Params.entry(parameter_buffer.binding()),
                    Slot::Grid.entry(wgpu::BindingResource::TextureView(grid_view)),
                    Slot::FieldWrite.entry(wgpu::BindingResource::TextureView(&images[i].view)),
                ],
            })
        });

        let step_layout = registry.bind_group_layout(LayoutKind::FieldStep);
        let step_groups = [0, 1].map(|i| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(if i == 0 { "field-step-ab" } else { "field-step-ba" }),
                layout: step_layout,
                entries: &[
                    Slot::Params.entry(parameter_buffer.binding()),
                    Slot::FieldRead.entry(wgpu::BindingResource::TextureView(&images[i].view)),
                    Slot::FieldWrite.entry(wgpu::BindingResource::TextureView(&images[1 - i].view)),
                    Slot::Pass.entry(pass_buffer.binding()),
                ],
            })
        });

        log::debug!("distance field {reduced_size}^3, reduction {}", params.field_reduction);
        let schedule = JumpFloodSchedule::new(reduced_size).with_pass_limit(pass_limit);
        if schedule.truncates() {
            log::warn!(
                "jump flood limited to {} of {} passes; the field will not converge",
                schedule.pass_count(),
                JumpFloodSchedule::new(reduced_size).pass_count()
            );
        }
        Self {
            images,
            init_groups,
            step_groups,
            reduced_size,
            pass_limit,
            last_read: 0,
        }
    }

    pub fn reduced_size(&self) -> u32 {
        self.reduced_size
    }

    pub fn schedule(&self) -> JumpFloodSchedule {
        JumpFloodSchedule::new(self.reduced_size).with_pass_limit(self.pass_limit)
    }

    pub fn texture(&self, index: usize) -> &wgpu::Texture {
        &self.images[index].texture
    }

    pub fn view(&self, index: usize) -> &wgpu::TextureView {
        &self.images[index].view
    }

    /// Image holding the field produced by the last [`generate`](Self::generate).
    pub fn read_index(&self) -> usize {
        self.last_read
    }

    /// Runs init plus every propagation pass of the schedule.
    pub fn generate(
        &mut self,
        dispatcher: &mut WorkGroupDispatcher,
        registry: &ShaderVariantRegistry,
        queue: &wgpu::Queue,
        pass_buffer: &PassBuffer,
    ) -> Result<FieldReport, SimError> {
        let items = [self.reduced_size; 3];
        let mut roles = PingPong::default();

        dispatcher.dispatch(
            registry.program(ProgramKind::FieldInit),
            &self.init_groups[roles.read()],
            items,
        )?;

        let step_program = registry.program(ProgramKind::FieldStep);
        let mut strides = Vec::new();
        for step in self.schedule() {
            pass_buffer.upload(queue, &PassParams { step, ..PassParams::default() });
            dispatcher.dispatch(step_program, &self.step_groups[roles.read()], items)?;
            roles.swap();
            strides.push(step);
        }

        if self.pass_limit.is_some() {
            log::debug!("jump flood ran {} limited passes", strides.len());
        }

        self.last_read = roles.read();
        Ok(FieldReport {
            passes: strides.len() as u32,
            strides,
            read_index: roles.read(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors `generate`'s role bookkeeping without a device.
    fn final_read(schedule: JumpFloodSchedule) -> usize {
        let mut roles = PingPong::default();
        for _ in schedule {
            roles.swap();
        }
        roles.read()
    }

    #[test]
    fn reduced_16_runs_four_halving_passes() {
        let strides: Vec<u32> = JumpFloodSchedule::new(16).collect();
        assert_eq!(strides, vec![8, 4, 2, 1]);
        assert_eq!(JumpFloodSchedule::new(16).pass_count(), 4);
        // even pass count: the field ends in the image init seeded
        assert_eq!(final_read(JumpFloodSchedule::new(16)), 0);
    }

    #[test]
    fn power_of_two_pass_count_is_log2() {
        for exp in 0..10u32 {
            let size = 1u32 << exp;
            assert_eq!(JumpFloodSchedule::new(size).pass_count(), exp, "size {size}");
        }
    }

    #[test]
    fn odd_pass_count_ends_in_the_other_image() {
        let schedule = JumpFloodSchedule::new(8);
        assert_eq!(schedule.pass_count(), 3);
        assert_eq!(final_read(schedule), 1);
    }

    #[test]
    fn non_power_of_two_still_halves_to_one() {
        let strides: Vec<u32> = JumpFloodSchedule::new(100).collect();
        assert_eq!(strides, vec![50, 25, 12, 6, 3, 1]);
        for pair in strides.windows(2) {
            assert_eq!(pair[1], pair[0] / 2);
        }
    }

    #[test]
    fn single_cell_field_needs_no_propagation() {
        assert_eq!(JumpFloodSchedule::new(1).pass_count(), 0);
        assert_eq!(final_read(JumpFloodSchedule::new(1)), 0);
    }

    #[test]
    fn pass_limit_truncates_the_schedule() {
        let strides: Vec<u32> = JumpFloodSchedule::new(16).with_pass_limit(Some(2)).collect();
        assert_eq!(strides, vec![8, 4]);
        let all: Vec<u32> = JumpFloodSchedule::new(16).with_pass_limit(Some(99)).collect();
        assert_eq!(all, vec![8, 4, 2, 1]);
        assert_eq!(JumpFloodSchedule::new(16).with_pass_limit(Some(0)).pass_count(), 0);
    }

    #[test]
    fn only_a_limit_below_the_full_count_truncates() {
        assert!(JumpFloodSchedule::new(16).with_pass_limit(Some(2)).truncates());
        assert!(JumpFloodSchedule::new(16).with_pass_limit(Some(0)).truncates());
        assert!(!JumpFloodSchedule::new(16).with_pass_limit(Some(4)).truncates());
        assert!(!JumpFloodSchedule::new(16).with_pass_limit(Some(99)).truncates());
        assert!(!JumpFloodSchedule::new(16).truncates());
        assert!(!JumpFloodSchedule::new(1).with_pass_limit(Some(0)).truncates());
    }

    #[test]
    fn ping_pong_roles_are_complementary() {
        let mut roles = PingPong::default();
        assert_eq!((roles.read(), roles.write()), (0, 1));
        roles.swap();
        assert_eq!((roles.read(), roles.write()), (1, 0));
        roles.swap();
        assert_eq!(roles, PingPong::default());
    }
}
