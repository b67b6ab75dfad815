use serde::Serialize;

use crate::bindings::{LayoutKind, Slot, VIEW_FORMAT};
use crate::dispatch::WorkGroupDispatcher;
use crate::error::SimError;
use crate::field::DistanceFieldGenerator;
use crate::gpu;
use crate::params::ParameterBuffer;
use crate::shaders::{ProgramKind, ShaderVariantRegistry};

/// RGBA8 texels per 256-byte copy row.
const ROW_TEXELS: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT / 4;

/// Width rounded up so readback rows need no padding.
pub fn aligned_width(width: u32) -> u32 {
    width.max(1).div_ceil(ROW_TEXELS) * ROW_TEXELS
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ViewStats {
    pub width: u32,
    pub height: u32,
    /// Fraction of texels with non-zero alpha.
    pub coverage: f32,
    pub mean_alpha: f32,
}

impl ViewStats {
    pub fn from_rgba8(width: u32, height: u32, texels: &[u8]) -> Self {
        let count = (texels.len() / 4).max(1);
        let mut covered = 0usize;
        let mut alpha_sum = 0.0f32;
        for px in texels.chunks_exact(4) {
            if px[3] > 0 {
                covered += 1;
            }
            alpha_sum += f32::from(px[3]) / 255.0;
        }
        Self {
            width,
            height,
            coverage: covered as f32 / count as f32,
            mean_alpha: alpha_sum / count as f32,
        }
    }
}

/// Offscreen target for the view program, bound against either field image.
pub struct HeadlessView {
    texture: wgpu::Texture,
    /// `groups[i]` samples field image `i`.
    groups: [wgpu::BindGroup; 2],
    width: u32,
    height: u32,
}

impl HeadlessView {
    pub fn new(
        device: &wgpu::Device,
        registry: &ShaderVariantRegistry,
        parameter_buffer: &ParameterBuffer,
        grid_view: &wgpu::TextureView,
        field: &DistanceFieldGenerator,
        width: u32,
        height: u32,
    ) -> Self {
        let width = aligned_width(width);
        let height = height.max(1);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("view"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: VIEW_FORMAT,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let layout = registry.bind_group_layout(LayoutKind::View);
        let groups = [0, 1].map(|i| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("view"),
                layout,
                entries: &[
                    Slot::Params.entry(parameter_buffer.binding()),
                    Slot::Grid.entry(wgpu::BindingResource::TextureView(grid_view)),
                    Slot::FieldRead.entry(wgpu::BindingResource::TextureView(field.view(i))),
                    Slot::View.entry(wgpu::BindingResource::TextureView(&target)),
                ],
            })
        });
        Self {
            texture,
            groups,
            width,
            height,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn render(
        &self,
        dispatcher: &mut WorkGroupDispatcher,
        registry: &ShaderVariantRegistry,
        field_read_index: usize,
    ) -> Result<(), SimError> {
        dispatcher.dispatch(
            registry.program(ProgramKind::View),
            &self.groups[field_read_index],
            [self.width, self.height, 1],
        )?;
        Ok(())
    }

    pub fn read_stats(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<ViewStats, SimError> {
        let texels = gpu::read_texture(device, queue, &self.texture, 4)?;
        Ok(ViewStats::from_rgba8(self.width, self.height, &texels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_rounds_up_to_copy_alignment() {
        assert_eq!(aligned_width(1), 64);
        assert_eq!(aligned_width(64), 64);
        assert_eq!(aligned_width(65), 128);
        assert_eq!(aligned_width(0), 64);
        assert_eq!(aligned_width(200) * 4 % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0);
    }

    #[test]
    fn coverage_counts_non_transparent_texels() {
        let texels = [0, 0, 0, 0, 10, 20, 30, 255, 1, 1, 1, 51, 0, 0, 0, 0];
        let stats = ViewStats::from_rgba8(2, 2, &texels);
        assert_eq!(stats.coverage, 0.5);
        assert!((stats.mean_alpha - 0.3).abs() < 1e-6);
    }
}
