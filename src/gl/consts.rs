//! GL enum values used across the engine.
//!
//! Values match the WebGL2 / GLES3 numbering so a native binding can forward them
//! untouched.

pub type GlEnum = u32;

// ── Primitive topologies ─────────────────────────────────────────────────
pub const POINTS: GlEnum = 0x0000;
pub const LINES: GlEnum = 0x0001;
pub const LINE_LOOP: GlEnum = 0x0002;
pub const LINE_STRIP: GlEnum = 0x0003;
pub const TRIANGLES: GlEnum = 0x0004;
pub const TRIANGLE_STRIP: GlEnum = 0x0005;
pub const TRIANGLE_FAN: GlEnum = 0x0006;

// ── Comparison functions ─────────────────────────────────────────────────
pub const NEVER: GlEnum = 0x0200;
pub const LESS: GlEnum = 0x0201;
pub const EQUAL: GlEnum = 0x0202;
pub const LEQUAL: GlEnum = 0x0203;
pub const GREATER: GlEnum = 0x0204;
pub const NOTEQUAL: GlEnum = 0x0205;
pub const GEQUAL: GlEnum = 0x0206;
pub const ALWAYS: GlEnum = 0x0207;

// ── Blending ─────────────────────────────────────────────────────────────
pub const ZERO: GlEnum = 0;
pub const ONE: GlEnum = 1;
pub const SRC_COLOR: GlEnum = 0x0300;
pub const ONE_MINUS_SRC_COLOR: GlEnum = 0x0301;
pub const SRC_ALPHA: GlEnum = 0x0302;
pub const ONE_MINUS_SRC_ALPHA: GlEnum = 0x0303;
pub const DST_ALPHA: GlEnum = 0x0304;
pub const ONE_MINUS_DST_ALPHA: GlEnum = 0x0305;
pub const DST_COLOR: GlEnum = 0x0306;
pub const ONE_MINUS_DST_COLOR: GlEnum = 0x0307;
pub const CONSTANT_COLOR: GlEnum = 0x8001;
pub const ONE_MINUS_CONSTANT_COLOR: GlEnum = 0x8002;
pub const CONSTANT_ALPHA: GlEnum = 0x8003;
pub const ONE_MINUS_CONSTANT_ALPHA: GlEnum = 0x8004;
pub const FUNC_ADD: GlEnum = 0x8006;
pub const MIN: GlEnum = 0x8007;
pub const MAX: GlEnum = 0x8008;
pub const FUNC_SUBTRACT: GlEnum = 0x800A;
pub const FUNC_REVERSE_SUBTRACT: GlEnum = 0x800B;

// ── Capabilities toggled with enable/disable ─────────────────────────────
pub const CULL_FACE: GlEnum = 0x0B44;
pub const DEPTH_TEST: GlEnum = 0x0B71;
pub const STENCIL_TEST: GlEnum = 0x0B90;
pub const DITHER: GlEnum = 0x0BD0;
pub const BLEND: GlEnum = 0x0BE2;
pub const SCISSOR_TEST: GlEnum = 0x0C11;
pub const POLYGON_OFFSET_FILL: GlEnum = 0x8037;
pub const RASTERIZER_DISCARD: GlEnum = 0x8C89;

// ── Faces ────────────────────────────────────────────────────────────────
pub const FRONT: GlEnum = 0x0404;
pub const BACK: GlEnum = 0x0405;
pub const CW: GlEnum = 0x0900;
pub const CCW: GlEnum = 0x0901;

// ── Stencil operations ───────────────────────────────────────────────────
pub const KEEP: GlEnum = 0x1E00;
pub const REPLACE: GlEnum = 0x1E01;
pub const INCR: GlEnum = 0x1E02;
pub const DECR: GlEnum = 0x1E03;
pub const INVERT: GlEnum = 0x150A;
pub const INCR_WRAP: GlEnum = 0x8507;
pub const DECR_WRAP: GlEnum = 0x8508;

// ── Clear bits ───────────────────────────────────────────────────────────
pub const DEPTH_BUFFER_BIT: u32 = 0x0000_0100;
pub const STENCIL_BUFFER_BIT: u32 = 0x0000_0400;
pub const COLOR_BUFFER_BIT: u32 = 0x0000_4000;

// ── Data types ───────────────────────────────────────────────────────────
pub const BYTE: GlEnum = 0x1400;
pub const UNSIGNED_BYTE: GlEnum = 0x1401;
pub const SHORT: GlEnum = 0x1402;
pub const UNSIGNED_SHORT: GlEnum = 0x1403;
pub const INT: GlEnum = 0x1404;
pub const UNSIGNED_INT: GlEnum = 0x1405;
pub const FLOAT: GlEnum = 0x1406;
pub const HALF_FLOAT: GlEnum = 0x140B;
pub const UNSIGNED_INT_24_8: GlEnum = 0x84FA;

// ── Buffers ──────────────────────────────────────────────────────────────
pub const ARRAY_BUFFER: GlEnum = 0x8892;
pub const ELEMENT_ARRAY_BUFFER: GlEnum = 0x8893;
pub const UNIFORM_BUFFER: GlEnum = 0x8A11;
pub const TRANSFORM_FEEDBACK_BUFFER: GlEnum = 0x8C8E;
pub const STATIC_DRAW: GlEnum = 0x88E4;
pub const DYNAMIC_DRAW: GlEnum = 0x88E8;

// ── Textures ─────────────────────────────────────────────────────────────
pub const TEXTURE_2D: GlEnum = 0x0DE1;
pub const TEXTURE_3D: GlEnum = 0x806F;
pub const TEXTURE_2D_ARRAY: GlEnum = 0x8C1A;
pub const TEXTURE_CUBE_MAP: GlEnum = 0x8513;
pub const TEXTURE_CUBE_MAP_POSITIVE_X: GlEnum = 0x8515;
pub const TEXTURE0: GlEnum = 0x84C0;
pub const TEXTURE_MAG_FILTER: GlEnum = 0x2800;
pub const TEXTURE_MIN_FILTER: GlEnum = 0x2801;
pub const TEXTURE_WRAP_S: GlEnum = 0x2802;
pub const TEXTURE_WRAP_T: GlEnum = 0x2803;
pub const TEXTURE_WRAP_R: GlEnum = 0x8072;
pub const TEXTURE_COMPARE_MODE: GlEnum = 0x884C;
pub const TEXTURE_COMPARE_FUNC: GlEnum = 0x884D;
pub const COMPARE_REF_TO_TEXTURE: GlEnum = 0x884E;
pub const NONE: GlEnum = 0;
pub const TEXTURE_MAX_ANISOTROPY_EXT: GlEnum = 0x84FE;
pub const NEAREST: GlEnum = 0x2600;
pub const LINEAR: GlEnum = 0x2601;
pub const NEAREST_MIPMAP_NEAREST: GlEnum = 0x2700;
pub const LINEAR_MIPMAP_NEAREST: GlEnum = 0x2701;
pub const NEAREST_MIPMAP_LINEAR: GlEnum = 0x2702;
pub const LINEAR_MIPMAP_LINEAR: GlEnum = 0x2703;
pub const REPEAT: GlEnum = 0x2901;
pub const CLAMP_TO_EDGE: GlEnum = 0x812F;
pub const MIRRORED_REPEAT: GlEnum = 0x8370;
pub const UNPACK_FLIP_Y_WEBGL: GlEnum = 0x9240;
pub const UNPACK_PREMULTIPLY_ALPHA_WEBGL: GlEnum = 0x9241;
pub const UNPACK_ALIGNMENT: GlEnum = 0x0CF5;

// ── Pixel formats ────────────────────────────────────────────────────────
pub const DEPTH_COMPONENT: GlEnum = 0x1902;
pub const ALPHA: GlEnum = 0x1906;
pub const RGB: GlEnum = 0x1907;
pub const RGBA: GlEnum = 0x1908;
pub const LUMINANCE: GlEnum = 0x1909;
pub const LUMINANCE_ALPHA: GlEnum = 0x190A;
pub const RED: GlEnum = 0x1903;
pub const RG: GlEnum = 0x8227;
pub const DEPTH_STENCIL: GlEnum = 0x84F9;
pub const R8: GlEnum = 0x8229;
pub const RG8: GlEnum = 0x822B;
pub const RGB8: GlEnum = 0x8051;
pub const RGBA8: GlEnum = 0x8058;
pub const R16F: GlEnum = 0x822D;
pub const RG16F: GlEnum = 0x822F;
pub const RGB16F: GlEnum = 0x881B;
pub const RGBA16F: GlEnum = 0x881A;
pub const R32F: GlEnum = 0x822E;
pub const RG32F: GlEnum = 0x8230;
pub const RGB32F: GlEnum = 0x8815;
pub const RGBA32F: GlEnum = 0x8814;
pub const DEPTH_COMPONENT16: GlEnum = 0x81A5;
pub const DEPTH_COMPONENT24: GlEnum = 0x81A6;
pub const DEPTH24_STENCIL8: GlEnum = 0x88F0;
pub const DEPTH_COMPONENT32F: GlEnum = 0x8CAC;

// ── Framebuffers ─────────────────────────────────────────────────────────
pub const FRAMEBUFFER: GlEnum = 0x8D40;
pub const READ_FRAMEBUFFER: GlEnum = 0x8CA8;
pub const DRAW_FRAMEBUFFER: GlEnum = 0x8CA9;
pub const RENDERBUFFER: GlEnum = 0x8D41;
pub const COLOR_ATTACHMENT0: GlEnum = 0x8CE0;
pub const DEPTH_ATTACHMENT: GlEnum = 0x8D00;
pub const STENCIL_ATTACHMENT: GlEnum = 0x8D20;
pub const DEPTH_STENCIL_ATTACHMENT: GlEnum = 0x821A;
pub const STENCIL_INDEX8: GlEnum = 0x8D48;

// ── Shaders ──────────────────────────────────────────────────────────────
pub const FRAGMENT_SHADER: GlEnum = 0x8B30;
pub const VERTEX_SHADER: GlEnum = 0x8B31;
pub const INTERLEAVED_ATTRIBS: GlEnum = 0x8C8C;
pub const SEPARATE_ATTRIBS: GlEnum = 0x8C8D;
pub const INVALID_INDEX: u32 = 0xFFFF_FFFF;

// ── Queries / transform feedback ─────────────────────────────────────────
pub const ANY_SAMPLES_PASSED: GlEnum = 0x8C2F;
pub const ANY_SAMPLES_PASSED_CONSERVATIVE: GlEnum = 0x8D6A;
pub const TIME_ELAPSED_EXT: GlEnum = 0x88BF;
pub const TRANSFORM_FEEDBACK: GlEnum = 0x8E22;

// ── Parameters queried at init ───────────────────────────────────────────
pub const MAX_TEXTURE_SIZE: GlEnum = 0x0D33;
pub const MAX_CUBE_MAP_TEXTURE_SIZE: GlEnum = 0x851C;
pub const MAX_RENDERBUFFER_SIZE: GlEnum = 0x84E8;
pub const MAX_TEXTURE_IMAGE_UNITS: GlEnum = 0x8872;
pub const MAX_VERTEX_TEXTURE_IMAGE_UNITS: GlEnum = 0x8B4C;
pub const MAX_COMBINED_TEXTURE_IMAGE_UNITS: GlEnum = 0x8B4D;
pub const MAX_VERTEX_ATTRIBS: GlEnum = 0x8869;
pub const MAX_VARYING_VECTORS: GlEnum = 0x8DFC;
pub const MAX_VERTEX_UNIFORM_VECTORS: GlEnum = 0x8DFB;
pub const MAX_FRAGMENT_UNIFORM_VECTORS: GlEnum = 0x8DFD;
pub const MAX_SAMPLES: GlEnum = 0x8D57;
pub const MAX_UNIFORM_BUFFER_BINDINGS: GlEnum = 0x8A2F;
