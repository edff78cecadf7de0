//! Engine-level enums and their GL translations.

use serde::{Deserialize, Serialize};

use crate::gl::consts::{self, GlEnum};

/// Blend presets accepted by `Engine::set_alpha_mode`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlphaMode {
    #[default]
    Disable,
    Add,
    Combine,
    Subtract,
    Multiply,
    Maximized,
    OneOne,
    Premultiplied,
    PremultipliedPorterDuff,
    Interpolate,
    ScreenMode,
}

impl AlphaMode {
    /// `[src_rgb, dst_rgb, src_alpha, dst_alpha]`, or `None` when blending is off.
    pub fn blend_factors(self) -> Option<[GlEnum; 4]> {
        use consts::*;
        Some(match self {
            AlphaMode::Disable => return None,
            AlphaMode::Add => [SRC_ALPHA, ONE, ZERO, ONE],
            AlphaMode::Combine => [SRC_ALPHA, ONE_MINUS_SRC_ALPHA, ONE, ONE],
            AlphaMode::Subtract => [ZERO, ONE_MINUS_SRC_COLOR, ONE, ONE],
            AlphaMode::Multiply => [DST_COLOR, ZERO, ONE, ONE],
            AlphaMode::Maximized => [SRC_ALPHA, ONE_MINUS_SRC_COLOR, ONE, ONE],
            AlphaMode::OneOne => [ONE, ONE, ZERO, ONE],
            AlphaMode::Premultiplied => [ONE, ONE_MINUS_SRC_ALPHA, ONE, ONE],
            AlphaMode::PremultipliedPorterDuff => [ONE, ONE_MINUS_SRC_ALPHA, ONE, ONE_MINUS_SRC_ALPHA],
            AlphaMode::Interpolate => [
                CONSTANT_COLOR,
                ONE_MINUS_CONSTANT_COLOR,
                CONSTANT_ALPHA,
                ONE_MINUS_CONSTANT_ALPHA,
            ],
            AlphaMode::ScreenMode => [ONE, ONE_MINUS_SRC_COLOR, ONE, ONE_MINUS_SRC_ALPHA],
        })
    }
}

/// Alpha blend equation presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AlphaEquation {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Max,
    Min,
}

impl AlphaEquation {
    pub fn gl(self) -> GlEnum {
        match self {
            AlphaEquation::Add => consts::FUNC_ADD,
            AlphaEquation::Subtract => consts::FUNC_SUBTRACT,
            AlphaEquation::ReverseSubtract => consts::FUNC_REVERSE_SUBTRACT,
            AlphaEquation::Max => consts::MAX,
            AlphaEquation::Min => consts::MIN,
        }
    }
}

/// Depth and stencil comparison function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareFunction {
    pub fn gl(self) -> GlEnum {
        match self {
            CompareFunction::Never => consts::NEVER,
            CompareFunction::Less => consts::LESS,
            CompareFunction::Equal => consts::EQUAL,
            CompareFunction::LessOrEqual => consts::LEQUAL,
            CompareFunction::Greater => consts::GREATER,
            CompareFunction::NotEqual => consts::NOTEQUAL,
            CompareFunction::GreaterOrEqual => consts::GEQUAL,
            CompareFunction::Always => consts::ALWAYS,
        }
    }
}

/// Primitive assembly for draw calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FillMode {
    Triangle,
    Wireframe,
    Point,
    Line,
    LineLoop,
    LineStrip,
    TriangleStrip,
    TriangleFan,
}

impl FillMode {
    pub fn gl(self) -> GlEnum {
        match self {
            FillMode::Triangle => consts::TRIANGLES,
            FillMode::Wireframe | FillMode::Line => consts::LINES,
            FillMode::Point => consts::POINTS,
            FillMode::LineLoop => consts::LINE_LOOP,
            FillMode::LineStrip => consts::LINE_STRIP,
            FillMode::TriangleStrip => consts::TRIANGLE_STRIP,
            FillMode::TriangleFan => consts::TRIANGLE_FAN,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferUsage {
    #[default]
    Static,
    Dynamic,
}

impl BufferUsage {
    pub fn gl(self) -> GlEnum {
        match self {
            BufferUsage::Static => consts::STATIC_DRAW,
            BufferUsage::Dynamic => consts::DYNAMIC_DRAW,
        }
    }
}

/// Channel layout of a texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    Alpha,
    Luminance,
    LuminanceAlpha,
    Rgb,
    #[default]
    Rgba,
    R,
    Rg,
}

impl TextureFormat {
    pub fn gl(self) -> GlEnum {
        match self {
            TextureFormat::Alpha => consts::ALPHA,
            TextureFormat::Luminance => consts::LUMINANCE,
            TextureFormat::LuminanceAlpha => consts::LUMINANCE_ALPHA,
            TextureFormat::Rgb => consts::RGB,
            TextureFormat::Rgba => consts::RGBA,
            TextureFormat::R => consts::RED,
            TextureFormat::Rg => consts::RG,
        }
    }

    pub fn channel_count(self) -> usize {
        match self {
            TextureFormat::Alpha | TextureFormat::Luminance | TextureFormat::R => 1,
            TextureFormat::LuminanceAlpha | TextureFormat::Rg => 2,
            TextureFormat::Rgb => 3,
            TextureFormat::Rgba => 4,
        }
    }
}

/// Component storage of a texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureType {
    #[default]
    UnsignedByte,
    Float,
    HalfFloat,
    UnsignedInt,
}

impl TextureType {
    pub fn gl(self) -> GlEnum {
        match self {
            TextureType::UnsignedByte => consts::UNSIGNED_BYTE,
            TextureType::Float => consts::FLOAT,
            TextureType::HalfFloat => consts::HALF_FLOAT,
            TextureType::UnsignedInt => consts::UNSIGNED_INT,
        }
    }

    pub fn bytes_per_component(self) -> usize {
        match self {
            TextureType::UnsignedByte => 1,
            TextureType::HalfFloat => 2,
            TextureType::Float | TextureType::UnsignedInt => 4,
        }
    }
}

/// Sized internal format for a `(type, format)` pair. Legacy unsized formats
/// (alpha / luminance) map to themselves.
pub fn internal_sized_format(texture_type: TextureType, format: TextureFormat) -> GlEnum {
    use TextureFormat as F;
    match (texture_type, format) {
        (_, F::Alpha | F::Luminance | F::LuminanceAlpha) => format.gl(),
        (TextureType::Float, F::R) => consts::R32F,
        (TextureType::Float, F::Rg) => consts::RG32F,
        (TextureType::Float, F::Rgb) => consts::RGB32F,
        (TextureType::Float, F::Rgba) => consts::RGBA32F,
        (TextureType::HalfFloat, F::R) => consts::R16F,
        (TextureType::HalfFloat, F::Rg) => consts::RG16F,
        (TextureType::HalfFloat, F::Rgb) => consts::RGB16F,
        (TextureType::HalfFloat, F::Rgba) => consts::RGBA16F,
        (_, F::R) => consts::R8,
        (_, F::Rg) => consts::RG8,
        (_, F::Rgb) => consts::RGB8,
        (_, F::Rgba) => consts::RGBA8,
    }
}

/// Texture filtering presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingMode {
    /// Nearest magnification, nearest-texel/linear-mip minification.
    Nearest,
    /// Linear filtering, nearest mip.
    Bilinear,
    /// Linear filtering, linear mip.
    #[default]
    Trilinear,
    NearestNearest,
    LinearLinear,
    NearestLinear,
    LinearNearest,
}

impl SamplingMode {
    /// `(mag_filter, min_filter)` for this mode.
    pub fn filters(self, generate_mipmaps: bool) -> (GlEnum, GlEnum) {
        use consts::*;
        match self {
            SamplingMode::Nearest => (
                NEAREST,
                if generate_mipmaps { NEAREST_MIPMAP_LINEAR } else { NEAREST },
            ),
            SamplingMode::Bilinear => (
                LINEAR,
                if generate_mipmaps { LINEAR_MIPMAP_NEAREST } else { LINEAR },
            ),
            SamplingMode::Trilinear => (
                LINEAR,
                if generate_mipmaps { LINEAR_MIPMAP_LINEAR } else { LINEAR },
            ),
            SamplingMode::NearestNearest => (NEAREST, NEAREST),
            SamplingMode::LinearLinear => (LINEAR, LINEAR),
            SamplingMode::NearestLinear => (NEAREST, LINEAR),
            SamplingMode::LinearNearest => (LINEAR, NEAREST),
        }
    }
}

/// Cube-map / 2D face index used when binding a render target.
pub const CUBE_FACE_COUNT: u32 = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_has_no_blend_factors() {
        assert_eq!(AlphaMode::Disable.blend_factors(), None);
        assert_eq!(
            AlphaMode::Combine.blend_factors(),
            Some([consts::SRC_ALPHA, consts::ONE_MINUS_SRC_ALPHA, consts::ONE, consts::ONE])
        );
    }

    #[test]
    fn sampling_drops_mip_filter_without_mipmaps() {
        assert_eq!(SamplingMode::Trilinear.filters(true), (consts::LINEAR, consts::LINEAR_MIPMAP_LINEAR));
        assert_eq!(SamplingMode::Trilinear.filters(false), (consts::LINEAR, consts::LINEAR));
        assert_eq!(SamplingMode::Nearest.filters(true).1, consts::NEAREST_MIPMAP_LINEAR);
    }

    #[test]
    fn sized_formats_follow_type() {
        assert_eq!(internal_sized_format(TextureType::Float, TextureFormat::Rgba), consts::RGBA32F);
        assert_eq!(internal_sized_format(TextureType::HalfFloat, TextureFormat::Rg), consts::RG16F);
        assert_eq!(internal_sized_format(TextureType::UnsignedByte, TextureFormat::Rgb), consts::RGB8);
        assert_eq!(internal_sized_format(TextureType::Float, TextureFormat::Alpha), consts::ALPHA);
    }
}
