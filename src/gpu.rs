use std::sync::Arc;

use crate::dispatch::WorkGroupLimits;
use crate::error::SimError;

/// Device, queue and the limits queried once at startup.
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub limits: WorkGroupLimits,
    pub max_texture_3d: u32,
    /// Largest storage buffer a bind group can hold.
    pub max_storage_bytes: u64,
    pub adapter_name: String,
    pub backend: String,
}

impl GpuContext {
    pub fn new() -> Result<Self, SimError> {
        pollster::block_on(create_device())
    }
}

pub async fn create_device() -> Result<GpuContext, SimError> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            ..Default::default()
        })
        .await
        .map_err(|err| SimError::Adapter(err.to_string()))?;

    let info = adapter.get_info();
    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("moldlab-device"),
            required_limits: adapter.limits(),
            ..Default::default()
        })
        .await
        .map_err(|err| SimError::Device(err.to_string()))?;

    device.on_uncaptured_error(Arc::new(|err| {
        log::error!("uncaptured wgpu error: {err}");
    }));

    let limits = WorkGroupLimits::from_device(&device.limits());
    log::info!(
        "adapter {} ({:?}) groups={:?} local={:?} invocations={}",
        info.name,
        info.backend,
        limits.max_groups,
        limits.max_local_size,
        limits.max_invocations
    );

    let device_limits = device.limits();
    Ok(GpuContext {
        max_texture_3d: device_limits.max_texture_dimension_3d,
        max_storage_bytes: u64::from(device_limits.max_storage_buffer_binding_size)
            .min(device_limits.max_buffer_size),
        device: Arc::new(device),
        queue: Arc::new(queue),
        limits,
        adapter_name: info.name,
        backend: format!("{}/wgpu", info.backend.to_str()),
    })
}

/// Whether any adapter can be opened on this machine.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default())).is_ok()
}

/// Runs resource creation inside validation and out-of-memory error scopes,
/// so a failed allocation is reported here and not by the next dispatch.
pub fn scoped<T>(device: &wgpu::Device, what: &'static str, create: impl FnOnce() -> T) -> Result<T, SimError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let created = create();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    match validation.or(out_of_memory) {
        Some(err) => Err(SimError::Allocation {
            what,
            message: err.to_string(),
        }),
        None => Ok(created),
    }
}

pub fn map_wait(device: &wgpu::Device, slice: &wgpu::BufferSlice<'_>) -> Result<(), SimError> {
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    let _ = device.poll(wgpu::PollType::wait_indefinitely());
    rx.recv()
        .map_err(|_| SimError::Readback("map_async channel closed".into()))?
        .map_err(|err| SimError::Readback(err.to_string()))
}

/// Copies a whole texture to the host as tightly packed rows.
pub fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    bytes_per_texel: u32,
) -> Result<Vec<u8>, SimError> {
    let size = texture.size();
    let depth = match texture.dimension() {
        wgpu::TextureDimension::D3 => size.depth_or_array_layers,
        _ => 1,
    };
    let row = size.width * bytes_per_texel;
    let padded_row = row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let rows = size.height * depth;

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback"),
        size: u64::from(padded_row) * u64::from(rows),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_row),
                rows_per_image: Some(size.height),
            },
        },
        wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: depth,
        },
    );
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    map_wait(device, &slice)?;
    let mapped = slice.get_mapped_range();
    let mut out = Vec::with_capacity((row * rows) as usize);
    for chunk in mapped.chunks(padded_row as usize) {
        out.extend_from_slice(&chunk[..row as usize]);
    }
    drop(mapped);
    staging.unmap();
    Ok(out)
}

/// `read_texture` for 32-bit float formats.
pub fn read_texture_f32(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    channels: u32,
) -> Result<Vec<f32>, SimError> {
    let bytes = read_texture(device, queue, texture, channels * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
