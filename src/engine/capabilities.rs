//! Device capability snapshot, queried at init and again after a context restore.

use crate::config::EngineOptions;
use crate::gl::GraphicsContext;
use crate::gl::consts;

/// A feature that was requested but had to be degraded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityFallback {
    FloatTextureAsHalfFloat,
    HalfFloatTextureAsUnsignedByte,
    SamplesClamped { requested: u32, granted: u32 },
    AnisotropyClamped { requested: u32, granted: u32 },
    UniformBuffersUnavailable,
    VertexArrayObjectsUnavailable,
    InstancingUnavailable,
    TimerQueryUnavailable,
    TransformFeedbackUnavailable,
}

#[derive(Clone, Debug, Default)]
pub struct EngineCapabilities {
    pub webgl2: bool,
    pub max_texture_size: u32,
    pub max_cube_texture_size: u32,
    pub max_render_texture_size: u32,
    pub max_texture_image_units: u32,
    pub max_vertex_texture_image_units: u32,
    pub max_combined_texture_image_units: u32,
    pub max_vertex_attribs: u32,
    pub max_varying_vectors: u32,
    pub max_vertex_uniform_vectors: u32,
    pub max_fragment_uniform_vectors: u32,
    pub max_samples: u32,
    pub max_anisotropy: u32,
    pub uniform_buffers: bool,
    pub vertex_array_object: bool,
    pub instanced_arrays: bool,
    pub texture_float: bool,
    pub texture_float_linear: bool,
    pub texture_half_float: bool,
    pub color_buffer_float: bool,
    pub standard_derivatives: bool,
    pub timer_query: bool,
    pub occlusion_query: bool,
    pub transform_feedback: bool,
    pub depth_texture: bool,
    pub non_power_of_two_mipmaps: bool,

    /// Degradations recorded since init, without duplicates.
    pub fallbacks: Vec<CapabilityFallback>,
}

impl EngineCapabilities {
    pub fn query(ctx: &dyn GraphicsContext, options: &EngineOptions) -> Self {
        let param = |p| ctx.get_parameter(p).max(0) as u32;
        let webgl2 = ctx.has_extension("WEBGL2");

        let mut caps = Self {
            webgl2,
            max_texture_size: param(consts::MAX_TEXTURE_SIZE),
            max_cube_texture_size: param(consts::MAX_CUBE_MAP_TEXTURE_SIZE),
            max_render_texture_size: param(consts::MAX_RENDERBUFFER_SIZE),
            max_texture_image_units: param(consts::MAX_TEXTURE_IMAGE_UNITS),
            max_vertex_texture_image_units: param(consts::MAX_VERTEX_TEXTURE_IMAGE_UNITS),
            max_combined_texture_image_units: param(consts::MAX_COMBINED_TEXTURE_IMAGE_UNITS),
            max_vertex_attribs: param(consts::MAX_VERTEX_ATTRIBS),
            max_varying_vectors: param(consts::MAX_VARYING_VECTORS),
            max_vertex_uniform_vectors: param(consts::MAX_VERTEX_UNIFORM_VECTORS),
            max_fragment_uniform_vectors: param(consts::MAX_FRAGMENT_UNIFORM_VECTORS),
            max_samples: if webgl2 { param(consts::MAX_SAMPLES).max(1) } else { 1 },
            max_anisotropy: param(consts::TEXTURE_MAX_ANISOTROPY_EXT),
            uniform_buffers: webgl2 && !options.disable_uniform_buffers,
            vertex_array_object: webgl2 || ctx.has_extension("OES_vertex_array_object"),
            instanced_arrays: webgl2 || ctx.has_extension("ANGLE_instanced_arrays"),
            texture_float: webgl2 || ctx.has_extension("OES_texture_float"),
            texture_float_linear: ctx.has_extension("OES_texture_float_linear"),
            texture_half_float: webgl2 || ctx.has_extension("OES_texture_half_float"),
            color_buffer_float: webgl2 && ctx.has_extension("EXT_color_buffer_float"),
            standard_derivatives: webgl2 || ctx.has_extension("OES_standard_derivatives"),
            timer_query: ctx.has_extension("EXT_disjoint_timer_query_webgl2")
                || ctx.has_extension("EXT_disjoint_timer_query"),
            occlusion_query: webgl2,
            transform_feedback: webgl2,
            depth_texture: webgl2 || ctx.has_extension("WEBGL_depth_texture"),
            non_power_of_two_mipmaps: webgl2,
            fallbacks: Vec::new(),
        };

        if !caps.uniform_buffers {
            caps.record_fallback(CapabilityFallback::UniformBuffersUnavailable);
        }
        if !caps.vertex_array_object {
            caps.record_fallback(CapabilityFallback::VertexArrayObjectsUnavailable);
        }
        caps
    }

    pub fn record_fallback(&mut self, fallback: CapabilityFallback) {
        if !self.fallbacks.contains(&fallback) {
            log::debug!("capability fallback: {fallback:?}");
            self.fallbacks.push(fallback);
        }
    }

    pub fn has_fallback(&self, fallback: &CapabilityFallback) -> bool {
        self.fallbacks.contains(fallback)
    }

    /// Clamp an MSAA sample request to what the device supports.
    pub fn clamp_samples(&mut self, requested: u32) -> u32 {
        let granted = requested.min(self.max_samples).max(1);
        if granted != requested.max(1) {
            self.record_fallback(CapabilityFallback::SamplesClamped { requested, granted });
        }
        granted
    }

    pub fn clamp_anisotropy(&mut self, requested: u32) -> u32 {
        let granted = requested.min(self.max_anisotropy);
        if granted != requested {
            self.record_fallback(CapabilityFallback::AnisotropyClamped { requested, granted });
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl::{HeadlessCapabilities, HeadlessContext};

    #[test]
    fn webgl2_device_exposes_uniform_buffers() {
        let ctx = HeadlessContext::new(8, 8);
        let caps = EngineCapabilities::query(&ctx, &EngineOptions::default());
        assert!(caps.uniform_buffers);
        assert!(caps.vertex_array_object);
        assert_eq!(caps.max_texture_size, 4096);
        assert!(caps.fallbacks.is_empty());
    }

    #[test]
    fn minimal_device_records_fallbacks() {
        let ctx = HeadlessContext::with_capabilities(8, 8, HeadlessCapabilities::minimal());
        let mut caps = EngineCapabilities::query(&ctx, &EngineOptions::default());
        assert!(!caps.uniform_buffers);
        assert!(caps.has_fallback(&CapabilityFallback::UniformBuffersUnavailable));
        assert_eq!(caps.clamp_samples(4), 1);
        assert!(caps.has_fallback(&CapabilityFallback::SamplesClamped { requested: 4, granted: 1 }));
    }
}
