//! Binding slots shared by the host orchestration and the WGSL sources.
//!
//! Every program binds its resources in group 0. The WGSL sources never spell
//! a slot number out; they use the slot's token (`@binding(GRID_SLOT)`), which
//! [`substitute_slots`] rewrites from this table before compilation.

pub const GRID_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
pub const FIELD_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const VIEW_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Params,
    Grid,
    Spores,
    FieldRead,
    FieldWrite,
    Pass,
    View,
}

impl Slot {
    pub const ALL: [Slot; 7] = [
        Slot::Params,
        Slot::Grid,
        Slot::Spores,
        Slot::FieldRead,
        Slot::FieldWrite,
        Slot::Pass,
        Slot::View,
    ];

    pub const fn binding(self) -> u32 {
        match self {
            Slot::Params => 0,
            Slot::Grid => 1,
            Slot::Spores => 2,
            Slot::FieldRead => 3,
            Slot::FieldWrite => 4,
            Slot::Pass => 5,
            Slot::View => 6,
        }
    }

    /// Token standing in for the binding number inside WGSL sources.
    pub const fn token(self) -> &'static str {
        match self {
            Slot::Params => "PARAMS_SLOT",
            Slot::Grid => "GRID_SLOT",
            Slot::Spores => "SPORES_SLOT",
            Slot::FieldRead => "FIELD_READ_SLOT",
            Slot::FieldWrite => "FIELD_WRITE_SLOT",
            Slot::Pass => "PASS_SLOT",
            Slot::View => "VIEW_SLOT",
        }
    }

    pub fn binding_type(self) -> wgpu::BindingType {
        match self {
            Slot::Params | Slot::Pass => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            Slot::Spores => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            Slot::Grid => wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::ReadWrite,
                format: GRID_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D3,
            },
            Slot::FieldRead => wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::ReadOnly,
                format: FIELD_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D3,
            },
            Slot::FieldWrite => wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: FIELD_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D3,
            },
            Slot::View => wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: VIEW_FORMAT,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
        }
    }

    pub fn layout_entry(self) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding: self.binding(),
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: self.binding_type(),
            count: None,
        }
    }

    pub fn entry<'a>(self, resource: wgpu::BindingResource<'a>) -> wgpu::BindGroupEntry<'a> {
        wgpu::BindGroupEntry {
            binding: self.binding(),
            resource,
        }
    }
}

/// Bind group layouts. Programs sharing a layout can share bind groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    Simulation,
    FieldInit,
    FieldStep,
    View,
}

impl LayoutKind {
    pub const ALL: [LayoutKind; 4] = [
        LayoutKind::Simulation,
        LayoutKind::FieldInit,
        LayoutKind::FieldStep,
        LayoutKind::View,
    ];

    pub const fn slots(self) -> &'static [Slot] {
        match self {
            LayoutKind::Simulation => &[Slot::Params, Slot::Grid, Slot::Spores, Slot::Pass],
            LayoutKind::FieldInit => &[Slot::Params, Slot::Grid, Slot::FieldWrite],
            LayoutKind::FieldStep => &[Slot::Params, Slot::FieldRead, Slot::FieldWrite, Slot::Pass],
            LayoutKind::View => &[Slot::Params, Slot::Grid, Slot::FieldRead, Slot::View],
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            LayoutKind::Simulation => "simulation-layout",
            LayoutKind::FieldInit => "field-init-layout",
            LayoutKind::FieldStep => "field-step-layout",
            LayoutKind::View => "view-layout",
        }
    }

    pub fn entries(self) -> Vec<wgpu::BindGroupLayoutEntry> {
        self.slots().iter().map(|slot| slot.layout_entry()).collect()
    }
}

/// Rewrites every slot token in `source` to its binding number.
pub fn substitute_slots(source: &str) -> String {
    Slot::ALL.iter().fold(source.to_owned(), |text, slot| {
        text.replace(slot.token(), &slot.binding().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn slot_bindings_are_unique() {
        let bindings: HashSet<u32> = Slot::ALL.iter().map(|s| s.binding()).collect();
        assert_eq!(bindings.len(), Slot::ALL.len());
    }

    #[test]
    fn no_token_is_a_substring_of_another() {
        for a in Slot::ALL {
            for b in Slot::ALL {
                if a != b {
                    assert!(!a.token().contains(b.token()), "{} contains {}", a.token(), b.token());
                }
            }
        }
    }

    #[test]
    fn substitute_slots_rewrites_tokens() {
        let src = "@group(0) @binding(GRID_SLOT) var grid;\n@group(0) @binding(FIELD_WRITE_SLOT) var out;";
        let out = substitute_slots(src);
        assert_eq!(out, "@group(0) @binding(1) var grid;\n@group(0) @binding(4) var out;");
    }

    #[test]
    fn layouts_list_each_slot_once() {
        for layout in LayoutKind::ALL {
            let slots: HashSet<Slot> = layout.slots().iter().copied().collect();
            assert_eq!(slots.len(), layout.slots().len(), "{layout:?}");
            assert!(slots.contains(&Slot::Params));
        }
    }
}
