//! Plain value types shared by descriptors, the device seam and the cache.
//!
//! Everything here derives `Hash` so it can feed structural keys.

use bitflags::bitflags;

bitflags! {
    /// Shader stages a binding is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsages: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsages: u32 {
        const COPY_DST = 1 << 0;
        const UNIFORM = 1 << 1;
        const STORAGE = 1 << 2;
        const VERTEX = 1 << 3;
        const INDEX = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    R32Float,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth16Unorm,
    Depth24Plus,
    Depth24PlusStencil8,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm | Self::Depth24Plus | Self::Depth24PlusStencil8 | Self::Depth32Float
        )
    }

    /// Bytes per texel for formats with a fixed CPU-visible layout.
    ///
    /// `Depth24Plus` variants have no defined layout and return `None`.
    pub fn bytes_per_texel(self) -> Option<u32> {
        match self {
            Self::R8Unorm => Some(1),
            Self::Depth16Unorm => Some(2),
            Self::R32Float
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Depth32Float => Some(4),
            Self::Rgba16Float => Some(8),
            Self::Rgba32Float => Some(16),
            Self::Depth24Plus | Self::Depth24PlusStencil8 => None,
        }
    }

    /// Whether the format can be sampled with a filtering sampler.
    pub fn is_filterable(self) -> bool {
        !self.is_depth() && self != Self::R32Float && self != Self::Rgba32Float
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }

    pub(crate) fn to_word(self) -> u32 {
        match self {
            Self::Uint16 => 0,
            Self::Uint32 => 1,
        }
    }

    pub(crate) fn from_word(word: u32) -> Option<Self> {
        match word {
            0 => Some(Self::Uint16),
            1 => Some(Self::Uint32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x4,
    Sint32,
    Unorm8x4,
    Uint16x2,
    Uint16x4,
    Float16x2,
    Float16x4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::Unorm8x4 | Self::Uint16x2 | Self::Float16x2 => 4,
            Self::Float32 | Self::Uint32 | Self::Sint32 => 4,
            Self::Float32x2 | Self::Uint32x2 | Self::Uint16x4 | Self::Float16x4 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub format: VertexFormat,
    pub offset: u32,
    pub location: u32,
}

/// Layout of one vertex stream as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u32,
    pub step: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexBufferLayout {
    /// A tightly packed stream holding a single attribute.
    pub fn single(format: VertexFormat, location: u32) -> Self {
        Self {
            stride: format.size(),
            step: VertexStepMode::Vertex,
            attributes: vec![VertexAttribute {
                format,
                offset: 0,
                location,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    AlphaBlend,
    Premultiplied,
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub write: bool,
    pub compare: CompareFunction,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            write: true,
            compare: CompareFunction::Less,
        }
    }
}

/// Fixed-function state of a material's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipelineState {
    pub topology: PrimitiveTopology,
    pub cull: CullMode,
    pub blend: BlendMode,
    pub depth: DepthState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Sampler state. Identical descriptors share one device sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub compare: Option<CompareFunction>,
}

impl SamplerDesc {
    pub fn nearest() -> Self {
        Self {
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            ..Self::default()
        }
    }

    pub fn repeat(mut self) -> Self {
        self.address_u = AddressMode::Repeat;
        self.address_v = AddressMode::Repeat;
        self.address_w = AddressMode::Repeat;
        self
    }

    pub fn is_filtering(&self) -> bool {
        self.mag_filter == FilterMode::Linear
            || self.min_filter == FilterMode::Linear
            || self.mipmap_filter == FilterMode::Linear
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    #[default]
    Load,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    #[default]
    Store,
    Discard,
}

/// Round `value` up to a multiple of `align` (which must be non-zero).
pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

pub(crate) fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

pub(crate) fn lcm(a: u32, b: u32) -> u32 {
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_are_not_filterable() {
        for format in [
            TextureFormat::Depth16Unorm,
            TextureFormat::Depth24Plus,
            TextureFormat::Depth32Float,
        ] {
            assert!(format.is_depth());
            assert!(!format.is_filterable());
        }
        assert!(TextureFormat::Rgba8UnormSrgb.is_filterable());
    }

    #[test]
    fn index_format_words_round_trip() {
        for format in [IndexFormat::Uint16, IndexFormat::Uint32] {
            assert_eq!(IndexFormat::from_word(format.to_word()), Some(format));
        }
        assert_eq!(IndexFormat::from_word(u32::MAX), None);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(lcm(12, 4), 12);
        assert_eq!(lcm(6, 4), 12);
        assert_eq!(lcm(20, 4), 20);
    }

    #[test]
    fn single_attribute_layout_is_packed() {
        let layout = VertexBufferLayout::single(VertexFormat::Float32x3, 0);
        assert_eq!(layout.stride, 12);
        assert_eq!(layout.attributes.len(), 1);
    }
}
