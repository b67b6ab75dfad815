//! Shader variants: textual `#define` substitution and the registry of
//! compiled compute programs.
//!
//! A source line of the form `#define NAME` is a placeholder. When `NAME` has
//! an active definition the line is replaced by that definition's content
//! (inline text or a named include); otherwise it is replaced by nothing.
//! Features are selected by recompiling with a different definition set, never
//! by branching on a runtime flag.

pub mod sources;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::bindings::{LayoutKind, substitute_slots};
use crate::dispatch::WorkGroupLimits;
use crate::error::ShaderError;

pub const ENTRY_POINT: &str = "main";

/// Substitution content for a placeholder token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition {
    Inline(String),
    Include(String),
}

/// Feature toggles exposed to the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Transparency,
    WrapAround,
}

impl Feature {
    pub const fn token(self) -> &'static str {
        match self {
            Feature::Transparency => "TRANSPARENCY",
            Feature::WrapAround => "WRAP_AROUND",
        }
    }

    pub fn definition(self) -> Definition {
        match self {
            Feature::Transparency => Definition::Include("transparent_blend".into()),
            Feature::WrapAround => Definition::Include("wrap_boundary".into()),
        }
    }
}

/// Pure `(source, active definitions) -> compilable source` builder.
#[derive(Debug, Clone, Default)]
pub struct ShaderBuilder {
    definitions: BTreeMap<String, Definition>,
    includes: BTreeMap<String, String>,
}

impl ShaderBuilder {
    /// Builder knowing the includes used by the bundled programs.
    pub fn standard() -> Self {
        let mut builder = Self::default();
        builder.register_include("wrap_boundary", sources::WRAP_BOUNDARY_INCLUDE);
        builder.register_include("transparent_blend", sources::TRANSPARENT_BLEND_INCLUDE);
        builder
    }

    pub fn register_include(&mut self, name: &str, body: &str) {
        self.includes.insert(name.to_owned(), body.to_owned());
    }

    /// Returns `false` when `token` was already defined (no-op).
    pub fn add(&mut self, token: &str, definition: Definition) -> bool {
        if self.definitions.contains_key(token) {
            return false;
        }
        self.definitions.insert(token.to_owned(), definition);
        true
    }

    /// Returns `false` when `token` was not defined (no-op).
    pub fn remove(&mut self, token: &str) -> bool {
        self.definitions.remove(token).is_some()
    }

    pub fn definitions(&self) -> &BTreeMap<String, Definition> {
        &self.definitions
    }

    pub fn is_defined(&self, token: &str) -> bool {
        self.definitions.contains_key(token)
    }

    /// Prelude, placeholder substitution and binding-slot substitution.
    pub fn compose(&self, label: &str, source: &str) -> Result<String, ShaderError> {
        let mut out = String::with_capacity(sources::PRELUDE_WGSL.len() + source.len());
        out.push_str(sources::PRELUDE_WGSL);
        for line in source.lines() {
            match placeholder(line) {
                Some(token) => {
                    if let Some(body) = self.resolve(label, token)? {
                        out.push_str(body);
                        out.push('\n');
                    }
                }
                None => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        Ok(substitute_slots(&out))
    }

    fn resolve(&self, label: &str, token: &str) -> Result<Option<&str>, ShaderError> {
        match self.definitions.get(token) {
            None => Ok(None),
            Some(Definition::Inline(text)) => Ok(Some(text)),
            Some(Definition::Include(name)) => self
                .includes
                .get(name)
                .map(|body| Some(body.as_str()))
                .ok_or_else(|| ShaderError::UnknownInclude {
                    program: label.to_owned(),
                    include: name.clone(),
                }),
        }
    }
}

/// Token of a `#define NAME` placeholder line.
pub fn placeholder(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("#define")
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .and_then(|rest| rest.split_whitespace().next())
}

/// Whether `source` carries a placeholder for `token`.
pub fn uses_token(source: &str, token: &str) -> bool {
    source.lines().any(|line| placeholder(line) == Some(token))
}

/// Parses and validates a composed WGSL source, returning the fixed local
/// size of its compute entry point.
pub fn validate_wgsl(label: &str, source: &str) -> Result<[u32; 3], ShaderError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| ShaderError::Parse {
        program: label.to_owned(),
        message: err.emit_to_string(source),
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator.validate(&module).map_err(|err| ShaderError::Validation {
        program: label.to_owned(),
        message: err.emit_to_string(source),
    })?;

    module
        .entry_points
        .iter()
        .find(|ep| ep.name == ENTRY_POINT && ep.stage == naga::ShaderStage::Compute)
        .map(|ep| ep.workgroup_size)
        .ok_or_else(|| ShaderError::MissingEntryPoint {
            program: label.to_owned(),
            entry: ENTRY_POINT.to_owned(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Decay,
    Move,
    Draw,
    Rescale,
    ClearGrid,
    FieldInit,
    FieldStep,
    View,
}

impl ProgramKind {
    pub const ALL: [ProgramKind; 8] = [
        ProgramKind::Decay,
        ProgramKind::Move,
        ProgramKind::Draw,
        ProgramKind::Rescale,
        ProgramKind::ClearGrid,
        ProgramKind::FieldInit,
        ProgramKind::FieldStep,
        ProgramKind::View,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            ProgramKind::Decay => "decay",
            ProgramKind::Move => "move",
            ProgramKind::Draw => "draw",
            ProgramKind::Rescale => "rescale",
            ProgramKind::ClearGrid => "clear-grid",
            ProgramKind::FieldInit => "field-init",
            ProgramKind::FieldStep => "field-step",
            ProgramKind::View => "view",
        }
    }

    pub const fn source(self) -> &'static str {
        match self {
            ProgramKind::Decay => sources::DECAY_WGSL,
            ProgramKind::Move => sources::MOVE_WGSL,
            ProgramKind::Draw => sources::DRAW_WGSL,
            ProgramKind::Rescale => sources::RESCALE_WGSL,
            ProgramKind::ClearGrid => sources::CLEAR_GRID_WGSL,
            ProgramKind::FieldInit => sources::FIELD_INIT_WGSL,
            ProgramKind::FieldStep => sources::FIELD_STEP_WGSL,
            ProgramKind::View => sources::VIEW_WGSL,
        }
    }

    pub const fn layout(self) -> LayoutKind {
        match self {
            ProgramKind::Decay
            | ProgramKind::Move
            | ProgramKind::Draw
            | ProgramKind::Rescale
            | ProgramKind::ClearGrid => LayoutKind::Simulation,
            ProgramKind::FieldInit => LayoutKind::FieldInit,
            ProgramKind::FieldStep => LayoutKind::FieldStep,
            ProgramKind::View => LayoutKind::View,
        }
    }
}

/// Handle to a linked compute program. Immutable; a rebuild replaces it.
#[derive(Debug)]
pub struct ComputeProgram {
    label: &'static str,
    pipeline: wgpu::ComputePipeline,
    local_size: [u32; 3],
    generation: u64,
}

impl ComputeProgram {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    pub fn local_size(&self) -> [u32; 3] {
        self.local_size
    }

    /// Registry generation this handle was built in.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Layout {
    bind_group: wgpu::BindGroupLayout,
    pipeline: wgpu::PipelineLayout,
}

/// Owns every compute program and the definition set they are built with.
///
/// Programs are handed out by reference, so a handle cannot outlive a
/// definition change: mutating the registry needs `&mut self`. Bind group
/// layouts never depend on definitions and survive rebuilds.
pub struct ShaderVariantRegistry {
    device: Arc<wgpu::Device>,
    limits: WorkGroupLimits,
    builder: ShaderBuilder,
    layouts: HashMap<LayoutKind, Layout>,
    programs: HashMap<ProgramKind, ComputeProgram>,
    generation: u64,
}

impl ShaderVariantRegistry {
    pub fn new(
        device: Arc<wgpu::Device>,
        limits: WorkGroupLimits,
        builder: ShaderBuilder,
    ) -> Result<Self, ShaderError> {
        let layouts = LayoutKind::ALL
            .into_iter()
            .map(|kind| {
                let entries = kind.entries();
                let bind_group = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(kind.label()),
                    entries: &entries,
                });
                let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(kind.label()),
                    bind_group_layouts: &[&bind_group],
                    push_constant_ranges: &[],
                });
                (kind, Layout { bind_group, pipeline })
            })
            .collect();

        let mut registry = Self {
            device,
            limits,
            builder,
            layouts,
            programs: HashMap::new(),
            generation: 0,
        };
        registry.rebuild(&ProgramKind::ALL)?;
        Ok(registry)
    }

    pub fn program(&self, kind: ProgramKind) -> &ComputeProgram {
        &self.programs[&kind]
    }

    pub fn bind_group_layout(&self, kind: LayoutKind) -> &wgpu::BindGroupLayout {
        &self.layouts[&kind].bind_group
    }

    pub fn definitions(&self) -> &BTreeMap<String, Definition> {
        self.builder.definitions()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Adds `token` and rebuilds the programs using it. No-op when present.
    /// On error the registry is left exactly as it was.
    pub fn add_definition(&mut self, token: &str, definition: Definition) -> Result<bool, ShaderError> {
        let mut builder = self.builder.clone();
        if !builder.add(token, definition) {
            return Ok(false);
        }
        self.commit(builder, &programs_using(token))?;
        Ok(true)
    }

    /// Removes `token` and rebuilds the programs using it. No-op when absent.
    /// On error the registry is left exactly as it was.
    pub fn remove_definition(&mut self, token: &str) -> Result<bool, ShaderError> {
        let mut builder = self.builder.clone();
        if !builder.remove(token) {
            return Ok(false);
        }
        self.commit(builder, &programs_using(token))?;
        Ok(true)
    }

    pub fn set_feature(&mut self, feature: Feature, enabled: bool) -> Result<bool, ShaderError> {
        if enabled {
            self.add_definition(feature.token(), feature.definition())
        } else {
            self.remove_definition(feature.token())
        }
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.builder.is_defined(feature.token())
    }

    fn rebuild(&mut self, kinds: &[ProgramKind]) -> Result<(), ShaderError> {
        let builder = self.builder.clone();
        self.commit(builder, kinds)
    }

    /// Builds every program in `kinds` with `builder`, then swaps the builder,
    /// the programs and the generation in together. Nothing changes on error.
    fn commit(&mut self, builder: ShaderBuilder, kinds: &[ProgramKind]) -> Result<(), ShaderError> {
        let generation = self.generation + 1;
        let built = kinds
            .iter()
            .map(|&kind| {
                let staged = stage_program(&builder, &self.limits, kind)?;
                self.link(staged, generation).map(|program| (kind, program))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.builder = builder;
        self.generation = generation;
        for (kind, program) in built {
            log::info!(
                "built program {} local={:?} generation={}",
                kind.label(),
                program.local_size,
                program.generation
            );
            self.programs.insert(kind, program);
        }
        Ok(())
    }

    fn link(&self, staged: StagedProgram, generation: u64) -> Result<ComputeProgram, ShaderError> {
        let label = staged.kind.label();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(staged.source.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&self.layouts[&staged.kind.layout()].pipeline),
            module: &module,
            entry_point: Some(ENTRY_POINT),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ShaderError::Device {
                program: label.to_owned(),
                message: err.to_string(),
            });
        }

        Ok(ComputeProgram {
            label,
            pipeline,
            local_size: staged.local_size,
            generation,
        })
    }
}

/// Programs whose source carries a placeholder for `token`.
pub fn programs_using(token: &str) -> Vec<ProgramKind> {
    ProgramKind::ALL
        .into_iter()
        .filter(|kind| uses_token(kind.source(), token))
        .collect()
}

/// Composed, validated source that fits the device, ready to link.
#[derive(Debug, Clone)]
pub struct StagedProgram {
    pub kind: ProgramKind,
    pub source: String,
    pub local_size: [u32; 3],
}

/// Everything a build does before touching the device.
pub fn stage_program(
    builder: &ShaderBuilder,
    limits: &WorkGroupLimits,
    kind: ProgramKind,
) -> Result<StagedProgram, ShaderError> {
    let label = kind.label();
    let source = builder.compose(label, kind.source())?;
    let local_size = validate_wgsl(label, &source)?;
    limits
        .check_local_size(local_size)
        .map_err(|source| ShaderError::LocalSizeExceeded {
            program: label.to_owned(),
            local_size,
            source,
        })?;
    Ok(StagedProgram {
        kind,
        source,
        local_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_sets() -> Vec<ShaderBuilder> {
        let mut sets = Vec::new();
        for wrap in [false, true] {
            for transparency in [false, true] {
                let mut builder = ShaderBuilder::standard();
                if wrap {
                    builder.add(Feature::WrapAround.token(), Feature::WrapAround.definition());
                }
                if transparency {
                    builder.add(Feature::Transparency.token(), Feature::Transparency.definition());
                }
                sets.push(builder);
            }
        }
        sets
    }

    #[test]
    fn placeholder_parses_define_lines_only() {
        assert_eq!(placeholder("#define WRAP_AROUND"), Some("WRAP_AROUND"));
        assert_eq!(placeholder("   #define  TRANSPARENCY  "), Some("TRANSPARENCY"));
        assert_eq!(placeholder("#defineX"), None);
        assert_eq!(placeholder("#define"), None);
        assert_eq!(placeholder("let x = 1;"), None);
    }

    #[test]
    fn inactive_placeholder_is_removed() {
        let builder = ShaderBuilder::standard();
        let out = builder.compose("t", "a\n#define WRAP_AROUND\nb\n").unwrap();
        assert!(!out.contains("#define"));
        assert!(out.ends_with("a\nb\n"));
    }

    #[test]
    fn active_placeholder_takes_inline_or_include() {
        let mut builder = ShaderBuilder::standard();
        builder.add("GREETING", Definition::Inline("hello();".into()));
        builder.add("WRAP_AROUND", Definition::Include("wrap_boundary".into()));
        let out = builder
            .compose("t", "#define GREETING\n#define WRAP_AROUND\n")
            .unwrap();
        assert!(out.contains("hello();\n"));
        assert!(out.contains(sources::WRAP_BOUNDARY_INCLUDE));
    }

    #[test]
    fn unknown_include_is_an_error() {
        let mut builder = ShaderBuilder::standard();
        builder.add("X", Definition::Include("missing".into()));
        let err = builder.compose("prog", "#define X\n").unwrap_err();
        assert!(matches!(err, ShaderError::UnknownInclude { include, .. } if include == "missing"));
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let mut builder = ShaderBuilder::standard();
        assert!(builder.add("A", Definition::Inline("1".into())));
        assert!(!builder.add("A", Definition::Inline("2".into())));
        assert_eq!(builder.definitions()["A"], Definition::Inline("1".into()));
        assert!(builder.remove("A"));
        assert!(!builder.remove("A"));
    }

    #[test]
    fn add_then_remove_round_trips_the_mapping() {
        let mut builder = ShaderBuilder::standard();
        builder.add(Feature::Transparency.token(), Feature::Transparency.definition());
        let before = builder.definitions().clone();
        let source_before = builder.compose("move", sources::MOVE_WGSL).unwrap();

        builder.add(Feature::WrapAround.token(), Feature::WrapAround.definition());
        builder.remove(Feature::WrapAround.token());

        assert_eq!(builder.definitions(), &before);
        assert_eq!(builder.compose("move", sources::MOVE_WGSL).unwrap(), source_before);
    }

    #[test]
    fn composing_twice_is_identical() {
        let builder = feature_sets().pop().unwrap();
        for kind in ProgramKind::ALL {
            let a = builder.compose(kind.label(), kind.source()).unwrap();
            let b = builder.compose(kind.label(), kind.source()).unwrap();
            assert_eq!(a, b);
            assert_eq!(validate_wgsl(kind.label(), &a).unwrap(), validate_wgsl(kind.label(), &b).unwrap());
        }
    }

    #[test]
    fn every_program_validates_under_every_feature_set() {
        for builder in feature_sets() {
            for kind in ProgramKind::ALL {
                let source = builder.compose(kind.label(), kind.source()).unwrap();
                assert!(!source.contains("_SLOT"), "{} kept a slot token", kind.label());
                if let Err(err) = validate_wgsl(kind.label(), &source) {
                    panic!("{err}");
                }
            }
        }
    }

    #[test]
    fn local_sizes_come_from_the_source() {
        let builder = ShaderBuilder::standard();
        let local = |kind: ProgramKind| {
            validate_wgsl(kind.label(), &builder.compose(kind.label(), kind.source()).unwrap()).unwrap()
        };
        assert_eq!(local(ProgramKind::Move), [64, 1, 1]);
        assert_eq!(local(ProgramKind::Draw), [64, 1, 1]);
        assert_eq!(local(ProgramKind::Decay), [4, 4, 4]);
        assert_eq!(local(ProgramKind::FieldStep), [4, 4, 4]);
        assert_eq!(local(ProgramKind::View), [8, 8, 1]);
    }

    #[test]
    fn only_feature_programs_use_feature_tokens() {
        assert_eq!(programs_using(Feature::WrapAround.token()), vec![ProgramKind::Move]);
        assert_eq!(programs_using(Feature::Transparency.token()), vec![ProgramKind::View]);
        assert!(programs_using("NOT_A_TOKEN").is_empty());
    }

    fn roomy_limits() -> WorkGroupLimits {
        WorkGroupLimits {
            max_groups: [65535; 3],
            max_local_size: [256, 256, 64],
            max_invocations: 256,
        }
    }

    #[test]
    fn staging_fails_on_a_bad_include_before_linking() {
        let mut builder = ShaderBuilder::standard();
        builder.add(Feature::WrapAround.token(), Definition::Include("missing".into()));
        let err = stage_program(&builder, &roomy_limits(), ProgramKind::Move).unwrap_err();
        assert!(matches!(err, ShaderError::UnknownInclude { ref program, .. } if program == "move"));
        // programs without the token still stage
        assert!(stage_program(&builder, &roomy_limits(), ProgramKind::View).is_ok());
    }

    #[test]
    fn staging_rejects_local_sizes_the_device_cannot_run() {
        let limits = WorkGroupLimits {
            max_local_size: [32, 32, 32],
            ..roomy_limits()
        };
        let err = stage_program(&ShaderBuilder::standard(), &limits, ProgramKind::Move).unwrap_err();
        assert!(matches!(
            err,
            ShaderError::LocalSizeExceeded { local_size: [64, 1, 1], .. }
        ));
        let staged = stage_program(&ShaderBuilder::standard(), &limits, ProgramKind::Decay).unwrap();
        assert_eq!(staged.local_size, [4, 4, 4]);
    }

    #[test]
    fn wrap_variant_changes_only_the_toggle_body() {
        let plain = ShaderBuilder::standard();
        let mut wrapped = ShaderBuilder::standard();
        wrapped.add(Feature::WrapAround.token(), Feature::WrapAround.definition());
        let a = plain.compose("move", sources::MOVE_WGSL).unwrap();
        let b = wrapped.compose("move", sources::MOVE_WGSL).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.len() - a.len(), sources::WRAP_BOUNDARY_INCLUDE.len() + 1);
    }

    #[test]
    fn parse_errors_carry_the_program_name() {
        let err = validate_wgsl("broken", "fn main( {").unwrap_err();
        assert!(matches!(err, ShaderError::Parse { ref program, .. } if program == "broken"));
    }

    #[test]
    fn missing_compute_entry_is_reported() {
        let err = validate_wgsl("nothing", "fn helper() -> f32 { return 1.0; }").unwrap_err();
        assert!(matches!(err, ShaderError::MissingEntryPoint { .. }));
    }
}
