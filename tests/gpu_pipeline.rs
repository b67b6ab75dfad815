#![cfg(feature = "gpu")]

use glam::Vec3;
use moldlab_compute::gpu::gpu_available;
use moldlab_compute::pipeline::FrameKind;
use moldlab_compute::shaders::ProgramKind;
use moldlab_compute::{
    Definition, DispatchError, Feature, GpuContext, ShaderBuilder, ShaderVariantRegistry, SimConfig, SimError,
    SimulationPipeline, WorkGroupDispatcher,
};

fn small_config() -> SimConfig {
    SimConfig {
        spore_count: 100,
        grid_size: 32,
        field_reduction: 2,
        seed: 3,
        ..SimConfig::default()
    }
}

fn context() -> GpuContext {
    assert!(gpu_available(), "the gpu feature needs an adapter");
    GpuContext::new().expect("device init")
}

fn pipeline(config: &SimConfig) -> SimulationPipeline {
    SimulationPipeline::new(context(), config).expect("pipeline init")
}

#[test]
fn grid_32_reduction_2_runs_four_field_passes() {
    let mut sim = pipeline(&small_config());
    let report = sim.step(1.0 / 60.0).unwrap();

    assert_eq!(report.kind, FrameKind::Step);
    assert_eq!(sim.field().reduced_size(), 16);
    assert_eq!(report.field.strides, vec![8, 4, 2, 1]);
    // decay, move, draw, field init, 4 steps
    assert_eq!(report.dispatches, 8);
    assert_eq!(report.field.read_index, 0);

    let grid = sim.read_grid_stats().unwrap();
    assert!(grid.total > 0.0, "spores deposited nothing");
    let field = sim.read_field_stats().unwrap();
    assert!(field.seeded > 0.99, "seeded fraction {}", field.seeded);
}

#[test]
fn identical_seeds_give_identical_fields() {
    let mut a = pipeline(&small_config());
    let mut b = pipeline(&small_config());
    for _ in 0..3 {
        a.step(1.0 / 60.0).unwrap();
        b.step(1.0 / 60.0).unwrap();
    }
    assert_eq!(a.read_spores().unwrap(), b.read_spores().unwrap());
    assert_eq!(a.field().read_index(), b.field().read_index());
}

#[test]
fn resize_to_301_with_reduction_3_lands_on_a_multiple() {
    let config = SimConfig {
        spore_count: 200,
        grid_size: 150,
        field_reduction: 3,
        ..SimConfig::default()
    };
    let mut sim = pipeline(&config);
    sim.step(0.01).unwrap();

    sim.params_mut().grid_size = 301;
    sim.params_mut().spore_count = 300;
    let report = sim.step(0.01).unwrap();

    assert_eq!(report.kind, FrameKind::Resize);
    assert_eq!(sim.params().grid_size, 300);
    assert_eq!(sim.field().reduced_size(), 100);
    assert_eq!(report.field.strides, vec![50, 25, 12, 6, 3, 1]);

    let extent = sim.params().grid_size as f32;
    let spores = sim.read_spores().unwrap();
    assert_eq!(spores.len(), 300);
    for spore in &spores {
        let p = Vec3::from_array(spore.position);
        assert!(p.cmpge(Vec3::ZERO).all() && p.cmplt(Vec3::splat(extent)).all(), "{p:?}");
    }

    // back to normal frames afterwards
    assert_eq!(sim.step(0.01).unwrap().kind, FrameKind::Step);
}

#[test]
fn toggling_features_rebuilds_only_between_frames() {
    let mut sim = pipeline(&small_config());
    sim.step(0.01).unwrap();
    let before = sim.registry().generation();

    assert!(sim.set_feature(Feature::WrapAround, true).unwrap());
    assert!(!sim.set_feature(Feature::WrapAround, true).unwrap());
    assert!(sim.registry().generation() > before);
    assert!(sim.registry().is_enabled(Feature::WrapAround));

    sim.step(0.01).unwrap();
    assert!(sim.set_feature(Feature::Transparency, true).unwrap());
    let view = sim.render_view(100, 100).unwrap();
    assert_eq!(view.width, 128);
    assert!((0.0..=1.0).contains(&view.coverage));
}

#[test]
fn toggles_bump_only_the_programs_using_the_token() {
    let mut sim = pipeline(&small_config());
    let generation = |sim: &SimulationPipeline, kind| sim.registry().program(kind).generation();
    let (moves, views, decays) = (
        generation(&sim, ProgramKind::Move),
        generation(&sim, ProgramKind::View),
        generation(&sim, ProgramKind::Decay),
    );

    assert!(sim.set_feature(Feature::WrapAround, true).unwrap());
    assert!(generation(&sim, ProgramKind::Move) > moves);
    assert_eq!(generation(&sim, ProgramKind::View), views);
    assert_eq!(generation(&sim, ProgramKind::Decay), decays);

    let moves = generation(&sim, ProgramKind::Move);
    assert!(sim.set_feature(Feature::Transparency, true).unwrap());
    assert!(generation(&sim, ProgramKind::View) > views);
    assert_eq!(generation(&sim, ProgramKind::Move), moves);
    assert_eq!(generation(&sim, ProgramKind::Decay), decays);
}

#[test]
fn failed_definition_leaves_the_registry_unchanged() {
    let gpu = context();
    let mut registry =
        ShaderVariantRegistry::new(gpu.device.clone(), gpu.limits, ShaderBuilder::standard()).unwrap();
    let generation = registry.generation();
    let moves = registry.program(ProgramKind::Move).generation();

    let result = registry.add_definition(Feature::WrapAround.token(), Definition::Include("missing".into()));
    assert!(result.is_err());
    assert!(registry.definitions().is_empty());
    assert!(!registry.is_enabled(Feature::WrapAround));
    assert_eq!(registry.generation(), generation);
    assert_eq!(registry.program(ProgramKind::Move).generation(), moves);

    // the real definition still goes through afterwards
    assert!(registry.set_feature(Feature::WrapAround, true).unwrap());
    assert!(registry.is_enabled(Feature::WrapAround));
}

#[test]
fn mismatched_bind_group_surfaces_as_a_device_error() {
    let gpu = context();
    let registry =
        ShaderVariantRegistry::new(gpu.device.clone(), gpu.limits, ShaderBuilder::standard()).unwrap();
    let mut dispatcher = WorkGroupDispatcher::new(gpu.device.clone(), gpu.queue.clone(), gpu.limits);

    let layout = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("empty"),
        entries: &[],
    });
    let group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("empty"),
        layout: &layout,
        entries: &[],
    });

    let err = dispatcher
        .dispatch(registry.program(ProgramKind::Decay), &group, [8, 8, 8])
        .unwrap_err();
    match err {
        DispatchError::DeviceExecutionError { program, .. } => assert_eq!(program, "decay"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn spore_buffer_over_the_device_limit_fails_at_construction() {
    let gpu = context();
    let spore_count = u32::try_from(gpu.max_storage_bytes / 32 + 1024).unwrap_or(u32::MAX);
    let config = SimConfig {
        spore_count,
        ..small_config()
    };
    match SimulationPipeline::new(gpu, &config) {
        Err(SimError::SporeBufferTooLarge { count, .. }) => assert_eq!(count, spore_count),
        Err(other) => panic!("unexpected {other:?}"),
        Ok(_) => panic!("pipeline accepted {spore_count} spores"),
    }
}

#[test]
fn oversized_spore_resize_keeps_the_running_structure() {
    let mut sim = pipeline(&small_config());
    sim.step(0.01).unwrap();

    let limit = sim.gpu().max_storage_bytes;
    sim.params_mut().spore_count = u32::try_from(limit / 32 + 1024).unwrap_or(u32::MAX);
    assert!(matches!(sim.step(0.01), Err(SimError::SporeBufferTooLarge { .. })));
    assert_eq!(sim.params().spore_count, 100);
    assert_eq!(sim.step(0.01).unwrap().kind, FrameKind::Step);
}

#[test]
fn crowded_cells_keep_at_least_one_deposit() {
    // 64 cells for 2000 spores: most cells are shared
    let config = SimConfig {
        spore_count: 2000,
        grid_size: 4,
        field_reduction: 2,
        ..small_config()
    };
    let mut sim = pipeline(&config);
    sim.step(1.0 / 60.0).unwrap();

    let grid = sim.read_grid_stats().unwrap();
    assert!(grid.max <= 1.0, "max {}", grid.max);
    let occupied = grid.footprint * 64.0;
    assert!(occupied >= 1.0);
    assert!(grid.total >= 0.25 * occupied - 1e-3, "total {} over {occupied} cells", grid.total);
}
