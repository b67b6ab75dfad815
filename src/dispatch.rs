use std::sync::Arc;

use serde::Serialize;

use crate::error::{Axis, DispatchError, LimitKind};
use crate::shaders::ComputeProgram;

/// Per-axis compute limits reported by the device. Queried once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkGroupLimits {
    pub max_groups: [u32; 3],
    pub max_local_size: [u32; 3],
    pub max_invocations: u32,
}

impl WorkGroupLimits {
    pub fn from_device(limits: &wgpu::Limits) -> Self {
        let per_dimension = limits.max_compute_workgroups_per_dimension;
        Self {
            max_groups: [per_dimension; 3],
            max_local_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_invocations: limits.max_compute_invocations_per_workgroup,
        }
    }

    /// Device capability check for a program's fixed local size.
    pub fn check_local_size(&self, local_size: [u32; 3]) -> Result<(), DispatchError> {
        for (i, axis) in Axis::ALL.into_iter().enumerate() {
            if local_size[i] > self.max_local_size[i] {
                return Err(DispatchError::WorkGroupLimitExceeded {
                    axis,
                    kind: LimitKind::LocalSize,
                    requested: local_size[i],
                    limit: self.max_local_size[i],
                });
            }
        }
        Ok(())
    }
}

/// `ceil(items / local)`.
pub fn group_count(items: u32, local: u32) -> u32 {
    items.div_ceil(local.max(1))
}

/// Work groups needed to cover `items` with programs of `local_size`,
/// validated against `limits`. The last group on each axis may run past the
/// item count; programs bounds-check their global id.
pub fn plan_groups(
    limits: &WorkGroupLimits,
    local_size: [u32; 3],
    items: [u32; 3],
) -> Result<[u32; 3], DispatchError> {
    if items.contains(&0) {
        return Err(DispatchError::InvalidDispatchSize { items });
    }
    limits.check_local_size(local_size)?;

    let groups = [
        group_count(items[0], local_size[0]),
        group_count(items[1], local_size[1]),
        group_count(items[2], local_size[2]),
    ];
    for (i, axis) in Axis::ALL.into_iter().enumerate() {
        if groups[i] > limits.max_groups[i] {
            return Err(DispatchError::WorkGroupLimitExceeded {
                axis,
                kind: LimitKind::GroupCount,
                requested: groups[i],
                limit: limits.max_groups[i],
            });
        }
    }
    Ok(groups)
}

/// Validates and issues single compute launches. Every launch is its own
/// queue submission followed by an error-scope poll, so writes from one
/// dispatch are visible to the next and no two passes overlap.
pub struct WorkGroupDispatcher {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    limits: WorkGroupLimits,
    dispatched: u64,
}

impl WorkGroupDispatcher {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, limits: WorkGroupLimits) -> Self {
        Self {
            device,
            queue,
            limits,
            dispatched: 0,
        }
    }

    pub fn limits(&self) -> &WorkGroupLimits {
        &self.limits
    }

    /// Number of launches issued so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn dispatch(
        &mut self,
        program: &ComputeProgram,
        bind_group: &wgpu::BindGroup,
        items: [u32; 3],
    ) -> Result<[u32; 3], DispatchError> {
        let groups = plan_groups(&self.limits, program.local_size(), items)?;
        log::debug!(
            "dispatch {} items={items:?} local={:?} groups={groups:?}",
            program.label(),
            program.local_size()
        );

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(program.label()),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(program.label()),
                ..Default::default()
            });
            pass.set_pipeline(program.pipeline());
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        self.queue.submit(Some(encoder.finish()));
        self.dispatched += 1;

        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            return Err(DispatchError::DeviceExecutionError {
                program: program.label().to_owned(),
                message: err.to_string(),
            });
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits() -> WorkGroupLimits {
        WorkGroupLimits {
            max_groups: [65535, 65535, 65535],
            max_local_size: [256, 256, 64],
            max_invocations: 256,
        }
    }

    #[test]
    fn hundred_spores_at_local_64_need_two_groups() {
        let groups = plan_groups(&limits(), [64, 1, 1], [100, 1, 1]).unwrap();
        assert_eq!(groups, [2, 1, 1]);
    }

    #[test]
    fn cube_dispatch_rounds_up_each_axis() {
        let groups = plan_groups(&limits(), [4, 4, 4], [33, 32, 1]).unwrap();
        assert_eq!(groups, [9, 8, 1]);
    }

    #[test]
    fn zero_items_on_any_axis_is_invalid() {
        for items in [[0, 1, 1], [1, 0, 1], [1, 1, 0]] {
            let err = plan_groups(&limits(), [1, 1, 1], items).unwrap_err();
            assert!(matches!(err, DispatchError::InvalidDispatchSize { items: got } if got == items));
        }
    }

    #[test]
    fn tiny_local_size_can_exceed_group_limit() {
        let limits = WorkGroupLimits {
            max_groups: [8, 8, 8],
            ..limits()
        };
        // 9 items is small, but one invocation per group needs 9 groups.
        let err = plan_groups(&limits, [1, 1, 1], [9, 1, 1]).unwrap_err();
        match err {
            DispatchError::WorkGroupLimitExceeded { axis, kind, requested, limit } => {
                assert_eq!(axis, Axis::X);
                assert_eq!(kind, LimitKind::GroupCount);
                assert_eq!(requested, 9);
                assert_eq!(limit, 8);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(plan_groups(&limits, [2, 1, 1], [9, 1, 1]).unwrap(), [5, 1, 1]);
    }

    #[test]
    fn oversized_local_size_is_rejected() {
        let err = plan_groups(&limits(), [1, 1, 128], [1, 1, 1]).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::WorkGroupLimitExceeded { axis: Axis::Z, kind: LimitKind::LocalSize, .. }
        ));
    }

    #[test]
    fn from_device_copies_compute_limits() {
        let device = wgpu::Limits::default();
        let limits = WorkGroupLimits::from_device(&device);
        assert_eq!(limits.max_groups, [device.max_compute_workgroups_per_dimension; 3]);
        assert_eq!(limits.max_local_size[0], device.max_compute_workgroup_size_x);
        assert_eq!(limits.max_local_size[2], device.max_compute_workgroup_size_z);
    }

    proptest! {
        #[test]
        fn group_count_covers_items_without_a_spare_group(items in 1u32..1_000_000, local in 1u32..1024) {
            let groups = group_count(items, local);
            prop_assert_eq!(groups, (items + local - 1) / local);
            prop_assert!(u64::from(groups) * u64::from(local) >= u64::from(items));
            prop_assert!(u64::from(groups - 1) * u64::from(local) < u64::from(items));
        }
    }
}
