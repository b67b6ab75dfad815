use std::fmt;

/// Axis of a 3-D dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        })
    }
}

/// Which device limit a dispatch ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    GroupCount,
    LocalSize,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::GroupCount => "work group count",
            LimitKind::LocalSize => "local work group size",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch item counts must be at least 1 on every axis, got {items:?}")]
    InvalidDispatchSize { items: [u32; 3] },
    #[error("{kind} exceeded on {axis} axis: {requested} > {limit}")]
    WorkGroupLimitExceeded {
        axis: Axis,
        kind: LimitKind,
        requested: u32,
        limit: u32,
    },
    #[error("device error after dispatching `{program}`: {message}")]
    DeviceExecutionError { program: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("`{program}` references unknown include `{include}`")]
    UnknownInclude { program: String, include: String },
    #[error("failed to parse `{program}`:\n{message}")]
    Parse { program: String, message: String },
    #[error("`{program}` failed validation:\n{message}")]
    Validation { program: String, message: String },
    #[error("`{program}` has no compute entry point `{entry}`")]
    MissingEntryPoint { program: String, entry: String },
    #[error("`{program}` local size {local_size:?} does not fit the device")]
    LocalSizeExceeded {
        program: String,
        local_size: [u32; 3],
        #[source]
        source: DispatchError,
    },
    #[error("device rejected `{program}`: {message}")]
    Device { program: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("no GPU adapter: {0}")]
    Adapter(String),
    #[error("request_device failed: {0}")]
    Device(String),
    #[error("grid size {requested} exceeds the device 3-D texture limit of {limit}")]
    GridTooLarge { requested: u32, limit: u32 },
    #[error("{count} spores need {bytes} bytes, over the device storage buffer limit of {limit}")]
    SporeBufferTooLarge { count: u32, bytes: u64, limit: u64 },
    #[error("allocating {what} failed: {message}")]
    Allocation { what: &'static str, message: String },
    #[error("readback failed: {0}")]
    Readback(String),
}
