//! GPU compute orchestration for a volumetric spore/mold growth simulation.
//!
//! [`SimulationPipeline`] drives the per-frame passes through a
//! [`WorkGroupDispatcher`], feeds the trail grid to the jump-flood
//! [`DistanceFieldGenerator`], and takes every program from the
//! [`ShaderVariantRegistry`].

pub mod bindings;
pub mod dispatch;
pub mod error;
pub mod field;
pub mod gpu;
pub mod params;
pub mod pipeline;
pub mod shaders;
pub mod view;

pub use dispatch::{WorkGroupDispatcher, WorkGroupLimits, group_count, plan_groups};
pub use error::{DispatchError, ShaderError, SimError};
pub use field::{DistanceFieldGenerator, FieldReport, JumpFloodSchedule, PingPong};
pub use gpu::GpuContext;
pub use params::{SimConfig, SimulationParameters, Spore};
pub use pipeline::{FrameKind, FramePass, FrameReport, SimulationPipeline};
pub use shaders::{ComputeProgram, Definition, Feature, ShaderBuilder, ShaderVariantRegistry};
