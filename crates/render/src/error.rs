/// Errors from resolving, encoding and submitting a frame.
///
/// Every variant is raised before any of the frame's commands are queued on
/// the device.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{pool} pool reached its limit of {max_heaps} heaps")]
    HeapLimitReached { pool: &'static str, max_heaps: u32 },
    #[error("{pool} pool cannot place {requested} bytes in a {heap_size}-byte heap")]
    AllocationTooLarge {
        pool: &'static str,
        requested: u32,
        heap_size: u32,
    },
    #[error("dynamic arena overflow: {requested} bytes at cursor {cursor} exceed capacity {capacity}")]
    ArenaOverflow {
        cursor: u32,
        requested: u32,
        capacity: u32,
    },
    #[error("uniform block of {size} bytes exceeds the {limit}-byte dynamic block")]
    UniformBlockTooLarge { size: usize, limit: u32 },
    #[error("invalid binding {slot} in '{label}': {reason}")]
    InvalidBinding {
        label: String,
        slot: u32,
        reason: &'static str,
    },
    #[error("stale or unknown {0} handle")]
    StaleHandle(&'static str),
    #[error("buffer '{label}' cannot be used as {expected}")]
    WrongBufferKind {
        label: String,
        expected: &'static str,
    },
    #[error("missing resource: {0}")]
    MissingResource(String),
    #[error("geometry '{label}' has {count} vertex streams, at most {max} are supported")]
    TooManyVertexStreams {
        label: String,
        count: usize,
        max: usize,
    },
    #[error("device rejected frame '{label}': {reason}")]
    Device { label: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;
