//! The engine: sole owner of the graphics context.
//!
//! Scene and material code reaches the GPU only through [`Engine`]. The
//! implementation is split by concern:
//! - `state_cache`: redundant-call suppression;
//! - `buffers`, `texture`, `queries`: resource creation and release;
//! - `effect`: program compilation and uniform upload;
//! - `frame`: frame loop, framebuffers and draws;
//! - `restore`: context-loss handling and rebuild.

pub mod buffers;
pub mod capabilities;
pub mod constants;
pub mod effect;
pub mod frame;
pub mod loader;
pub mod observable;
pub mod queries;
pub mod registry;
pub mod resources;
mod restore;
pub mod state_cache;
pub mod texture;

use anyhow::{Result, bail};

use crate::config::EngineOptions;
use crate::gl::consts::{self, GlEnum};
use crate::gl::{GraphicsContext, HeadlessContext, HeadlessHandle};

pub use buffers::{VertexArrayHandle, VertexArrayObject, VertexBufferBinding};
pub use capabilities::{CapabilityFallback, EngineCapabilities};
pub use constants::{
    AlphaEquation, AlphaMode, BufferUsage, CompareFunction, FillMode, SamplingMode, TextureFormat, TextureType,
};
pub use effect::{Effect, EffectCompilationError, EffectCreationOptions, EffectHandle, EffectState};
pub use frame::{RenderLoopId, Viewport};
pub use loader::CancellationToken;
pub use observable::{Observable, ObserverId};
pub use queries::OcclusionAlgorithm;
pub use registry::{DirtyMarker, MaterialDirtyFlags, MaterialRegistry};
pub use resources::{BufferHandle, Handle, QueryHandle, ResourceTable, TransformFeedbackHandle};
pub use state_cache::{StateSnapshot, StencilFunc, StencilOps};
pub use texture::{InternalTexture, TextureCreationOptions, TextureHandle, TextureSource};

use effect::EffectCache;
use frame::{FrameState, RenderTargetContext, VertexInputCache};
use loader::TextureLoader;
use resources::{GpuBuffer, GpuQuery, GpuTransformFeedback, ResourceTable as Table};
use state_cache::StateCache;
use texture::TextureSlots;

pub struct Engine {
    pub(crate) ctx: Box<dyn GraphicsContext>,
    pub(crate) options: EngineOptions,
    pub(crate) caps: EngineCapabilities,
    pub(crate) state: StateCache,

    pub(crate) buffers: Table<GpuBuffer>,
    pub(crate) textures: Table<InternalTexture>,
    pub(crate) texture_slots: TextureSlots,
    pub(crate) effects: EffectCache,
    pub(crate) queries: Table<GpuQuery>,
    pub(crate) vertex_arrays: Table<VertexArrayObject>,
    pub(crate) transform_feedbacks: Table<GpuTransformFeedback>,
    pub(crate) bound_transform_feedback: Option<TransformFeedbackHandle>,

    pub(crate) frame: FrameState,
    pub(crate) loader: TextureLoader,
    pub(crate) render_targets: Vec<RenderTargetContext>,
    pub(crate) vertex_input: VertexInputCache,
    pub(crate) current_effect: Option<EffectHandle>,
    pub(crate) cached_viewport: Option<Viewport>,
    stencil_backup: Option<state_cache::StencilState>,

    canvas_size: (u32, u32),
    hardware_scaling_level: f32,
    pub(crate) context_was_lost: bool,
    disposed: bool,

    pub on_resize: Observable<(u32, u32)>,
    pub on_context_lost: Observable<()>,
    pub on_context_restored: Observable<()>,
    pub on_begin_frame: Observable<u64>,
    pub on_end_frame: Observable<u64>,
    pub on_dispose: Observable<()>,
}

impl Engine {
    /// Wrap a live context.
    ///
    /// # Errors
    /// Fails when the context is already lost or the options are invalid.
    pub fn new(ctx: Box<dyn GraphicsContext>, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        if ctx.is_context_lost() {
            bail!("cannot create an engine on a lost graphics context");
        }
        let caps = EngineCapabilities::query(ctx.as_ref(), &options);
        let canvas_size = ctx.drawing_buffer_size();
        let hardware_scaling_level = options.effective_scaling_level();

        let mut engine = Self {
            ctx,
            caps,
            state: StateCache::default(),
            buffers: Table::default(),
            textures: Table::default(),
            texture_slots: TextureSlots::default(),
            effects: EffectCache::default(),
            queries: Table::default(),
            vertex_arrays: Table::default(),
            transform_feedbacks: Table::default(),
            bound_transform_feedback: None,
            frame: FrameState::new(&options),
            loader: TextureLoader::default(),
            render_targets: Vec::new(),
            vertex_input: VertexInputCache::default(),
            current_effect: None,
            cached_viewport: None,
            stencil_backup: None,
            canvas_size,
            hardware_scaling_level,
            context_was_lost: false,
            disposed: false,
            options,
            on_resize: Observable::default(),
            on_context_lost: Observable::default(),
            on_context_restored: Observable::default(),
            on_begin_frame: Observable::default(),
            on_end_frame: Observable::default(),
            on_dispose: Observable::default(),
        };
        engine.wipe_caches(true);
        log::info!(
            "engine created: {}x{}, webgl2={}, uniform buffers={}",
            engine.canvas_size.0,
            engine.canvas_size.1,
            engine.caps.webgl2,
            engine.caps.uniform_buffers
        );
        Ok(engine)
    }

    /// Engine over a fresh [`HeadlessContext`], plus its control handle.
    pub fn headless(width: u32, height: u32, options: EngineOptions) -> Result<(Self, HeadlessHandle)> {
        let ctx = HeadlessContext::new(width, height);
        let handle = ctx.handle();
        Ok((Self::new(Box::new(ctx), options)?, handle))
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn get_caps(&self) -> &EngineCapabilities {
        &self.caps
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// True between a context loss and the end of its rebuild.
    pub fn is_context_lost(&self) -> bool {
        self.context_was_lost
    }

    pub(crate) fn handles_context_loss(&self) -> bool {
        !self.options.do_not_handle_context_lost
    }

    /// Whether GPU calls may be issued right now.
    pub(crate) fn can_issue(&self) -> bool {
        !self.context_was_lost && !self.ctx.is_context_lost()
    }

    // ── Cache control ────────────────────────────────────────────────────

    /// Forget cached context state. Brute force also resets depth, stencil and
    /// blend requests to their defaults and forgets the current program.
    pub fn wipe_caches(&mut self, brute_force: bool) {
        if self.options.prevent_cache_wipe_between_frames && !brute_force {
            return;
        }
        self.current_effect = None;
        self.state.wipe(brute_force);
        self.vertex_input = VertexInputCache::default();
        self.reset_texture_slots();
        if brute_force {
            self.cached_viewport = None;
            self.state.depth.set_depth_func(CompareFunction::LessOrEqual);
        }
    }

    pub fn reset_texture_cache(&mut self) {
        self.state.reset_texture_cache();
        self.reset_texture_slots();
    }

    /// Capture the cached state before handing the context to foreign code.
    pub fn backup_gl_state(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// Re-issue a snapshot taken with [`Engine::backup_gl_state`].
    pub fn restore_gl_state(&mut self, snapshot: StateSnapshot) {
        if !self.can_issue() {
            return;
        }
        self.vertex_input = VertexInputCache::default();
        self.state.restore(snapshot, self.ctx.as_mut());
    }

    /// Push pending depth / stencil / blend changes to the context.
    pub fn apply_states(&mut self) {
        if self.can_issue() {
            self.state.apply_states(self.ctx.as_mut());
        }
    }

    // ── Depth / culling ──────────────────────────────────────────────────

    pub fn set_depth_buffer(&mut self, enable: bool) {
        self.state.depth.set_depth_test(enable);
    }

    pub fn get_depth_buffer(&self) -> bool {
        self.state.depth.depth_test()
    }

    pub fn set_depth_write(&mut self, enable: bool) {
        self.state.depth.set_depth_mask(enable);
    }

    pub fn get_depth_write(&self) -> bool {
        self.state.depth.depth_mask()
    }

    pub fn set_depth_function(&mut self, func: CompareFunction) {
        self.state.depth.set_depth_func(func);
    }

    pub fn get_depth_function(&self) -> CompareFunction {
        self.state.depth.depth_func()
    }

    pub fn set_depth_function_to_greater(&mut self) {
        self.set_depth_function(CompareFunction::Greater);
    }

    pub fn set_depth_function_to_greater_or_equal(&mut self) {
        self.set_depth_function(CompareFunction::GreaterOrEqual);
    }

    pub fn set_depth_function_to_less(&mut self) {
        self.set_depth_function(CompareFunction::Less);
    }

    pub fn set_depth_function_to_less_or_equal(&mut self) {
        self.set_depth_function(CompareFunction::LessOrEqual);
    }

    pub fn set_z_offset(&mut self, value: f32) {
        self.state.depth.set_z_offset(value);
    }

    pub fn get_z_offset(&self) -> f32 {
        self.state.depth.z_offset()
    }

    /// Culling, polygon offset and winding in one call.
    ///
    /// # Arguments
    /// * `culling` - enable face culling
    /// * `z_offset` - polygon offset factor, `0` disables the offset
    /// * `force` - re-issue the values even if cached
    /// * `reverse_side` - clockwise front faces
    /// * `cull_back_faces` - cull back faces (otherwise front faces)
    pub fn set_state(&mut self, culling: bool, z_offset: f32, force: bool, reverse_side: bool, cull_back_faces: bool) {
        let depth = &mut self.state.depth;
        if force {
            depth.invalidate_all();
        }
        depth.set_cull(culling);
        depth.set_cull_face(if cull_back_faces { consts::BACK } else { consts::FRONT });
        depth.set_z_offset(z_offset);
        depth.set_front_face(if reverse_side { consts::CW } else { consts::CCW });
    }

    // ── Stencil ──────────────────────────────────────────────────────────

    pub fn set_stencil_buffer(&mut self, enable: bool) {
        self.state.stencil.set_enabled(enable);
    }

    pub fn get_stencil_buffer(&self) -> bool {
        self.state.stencil.enabled()
    }

    pub fn set_stencil_mask(&mut self, mask: u32) {
        self.state.stencil.set_mask(mask);
    }

    pub fn get_stencil_mask(&self) -> u32 {
        self.state.stencil.mask()
    }

    pub fn set_stencil_function(&mut self, func: CompareFunction) {
        let f = self.state.stencil.func();
        self.state.stencil.set_func(StencilFunc { func, ..f });
    }

    pub fn get_stencil_function(&self) -> CompareFunction {
        self.state.stencil.func().func
    }

    pub fn set_stencil_function_reference(&mut self, reference: i32) {
        let f = self.state.stencil.func();
        self.state.stencil.set_func(StencilFunc { reference, ..f });
    }

    pub fn get_stencil_function_reference(&self) -> i32 {
        self.state.stencil.func().reference
    }

    pub fn set_stencil_function_mask(&mut self, mask: u32) {
        let f = self.state.stencil.func();
        self.state.stencil.set_func(StencilFunc { mask, ..f });
    }

    pub fn get_stencil_function_mask(&self) -> u32 {
        self.state.stencil.func().mask
    }

    pub fn set_stencil_operation_fail(&mut self, op: GlEnum) {
        let o = self.state.stencil.ops();
        self.state.stencil.set_ops(StencilOps { stencil_fail: op, ..o });
    }

    pub fn get_stencil_operation_fail(&self) -> GlEnum {
        self.state.stencil.ops().stencil_fail
    }

    pub fn set_stencil_operation_depth_fail(&mut self, op: GlEnum) {
        let o = self.state.stencil.ops();
        self.state.stencil.set_ops(StencilOps { depth_fail: op, ..o });
    }

    pub fn get_stencil_operation_depth_fail(&self) -> GlEnum {
        self.state.stencil.ops().depth_fail
    }

    pub fn set_stencil_operation_pass(&mut self, op: GlEnum) {
        let o = self.state.stencil.ops();
        self.state.stencil.set_ops(StencilOps { pass: op, ..o });
    }

    pub fn get_stencil_operation_pass(&self) -> GlEnum {
        self.state.stencil.ops().pass
    }

    /// Remember the stencil configuration for a later [`Engine::restore_stencil_state`].
    pub fn cache_stencil_state(&mut self) {
        self.stencil_backup = Some(self.state.stencil.clone());
    }

    pub fn restore_stencil_state(&mut self) {
        if let Some(saved) = self.stencil_backup.take() {
            self.set_stencil_buffer(saved.enabled());
            self.set_stencil_mask(saved.mask());
            self.state.stencil.set_func(saved.func());
            self.state.stencil.set_ops(saved.ops());
        }
    }

    // ── Blending / raster ────────────────────────────────────────────────

    /// Select a blend preset. Unless `no_depth_write_change`, depth writes are
    /// enabled exactly when blending is disabled.
    pub fn set_alpha_mode(&mut self, mode: AlphaMode, no_depth_write_change: bool) {
        if self.state.alpha.mode() == mode {
            return;
        }
        self.state.alpha.set_mode(mode);
        if !no_depth_write_change {
            self.set_depth_write(mode == AlphaMode::Disable);
        }
    }

    pub fn get_alpha_mode(&self) -> AlphaMode {
        self.state.alpha.mode()
    }

    pub fn set_alpha_equation(&mut self, rgb: AlphaEquation, alpha: AlphaEquation) {
        self.state.alpha.set_equation(rgb, alpha);
    }

    pub fn set_alpha_constants(&mut self, r: f32, g: f32, b: f32, a: f32) {
        self.state.alpha.set_constants([r, g, b, a]);
    }

    pub fn set_color_write(&mut self, enable: bool) {
        if self.can_issue() {
            self.state.color_mask(self.ctx.as_mut(), [enable; 4]);
        }
    }

    pub fn get_color_write(&self) -> bool {
        self.state.color_write()
    }

    pub fn set_dithering_state(&mut self, enable: bool) {
        if self.can_issue() {
            self.state.dithering(self.ctx.as_mut(), enable);
        }
    }

    /// `false` discards all rasterization.
    pub fn set_rasterizer_state(&mut self, enable: bool) {
        if self.can_issue() {
            self.state.rasterizer_discard(self.ctx.as_mut(), !enable);
        }
    }

    // ── Canvas / sizing ──────────────────────────────────────────────────

    /// Called by the windowing collaborator when the drawing surface changes.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == self.canvas_size {
            return;
        }
        self.canvas_size = (width, height);
        self.state.bindings.viewport = None;
        let size = (self.get_render_width(true), self.get_render_height(true));
        self.on_resize.notify(&size);
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        self.canvas_size
    }

    pub fn set_hardware_scaling_level(&mut self, level: f32) {
        if level > 0.0 && level != self.hardware_scaling_level {
            self.hardware_scaling_level = level;
            let size = (self.get_render_width(true), self.get_render_height(true));
            self.on_resize.notify(&size);
        }
    }

    pub fn get_hardware_scaling_level(&self) -> f32 {
        self.hardware_scaling_level
    }

    /// Width of the current render target, or of the back buffer when
    /// `use_screen` is set or no target is bound.
    pub fn get_render_width(&self, use_screen: bool) -> u32 {
        if !use_screen {
            if let Some(rt) = self.render_targets.last() {
                return rt.width;
            }
        }
        (self.canvas_size.0 as f32 / self.hardware_scaling_level).floor() as u32
    }

    pub fn get_render_height(&self, use_screen: bool) -> u32 {
        if !use_screen {
            if let Some(rt) = self.render_targets.last() {
                return rt.height;
            }
        }
        (self.canvas_size.1 as f32 / self.hardware_scaling_level).floor() as u32
    }

    pub fn get_aspect_ratio(&self, use_screen: bool) -> f32 {
        let h = self.get_render_height(use_screen).max(1);
        self.get_render_width(use_screen) as f32 / h as f32
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Release every resource, stop the render loop and notify `on_dispose`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.stop_render_loop(None);
        self.loader.cancel_all();
        self.release_effects();
        for h in self.vertex_arrays.handles_in_creation_order() {
            self.release_vertex_array_object(h);
        }
        for h in self.transform_feedbacks.handles_in_creation_order() {
            self.delete_transform_feedback(h);
        }
        for h in self.queries.handles_in_creation_order() {
            self.delete_query(h);
        }
        for h in self.textures.handles_in_creation_order() {
            self.release_texture_storage(h);
        }
        for h in self.buffers.handles_in_creation_order() {
            self.release_buffer_storage(h);
        }
        self.disposed = true;
        self.on_dispose.notify(&());
        log::info!("engine disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl::GlCall;

    #[test]
    fn alpha_mode_controls_depth_write() {
        let (mut engine, _h) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
        engine.set_alpha_mode(AlphaMode::Add, false);
        assert!(!engine.get_depth_write());
        engine.set_alpha_mode(AlphaMode::Disable, false);
        assert!(engine.get_depth_write());
        engine.set_alpha_mode(AlphaMode::Combine, true);
        assert!(engine.get_depth_write());
    }

    #[test]
    fn stencil_cache_round_trip() {
        let (mut engine, _h) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
        engine.set_stencil_buffer(true);
        engine.set_stencil_function(CompareFunction::Equal);
        engine.cache_stencil_state();
        engine.set_stencil_buffer(false);
        engine.set_stencil_function(CompareFunction::Never);
        engine.restore_stencil_state();
        assert!(engine.get_stencil_buffer());
        assert_eq!(engine.get_stencil_function(), CompareFunction::Equal);
    }

    #[test]
    fn set_state_force_reissues() {
        let (mut engine, handle) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
        engine.set_state(true, 0.0, false, false, true);
        engine.apply_states();
        handle.clear_calls();
        engine.set_state(true, 0.0, false, false, true);
        engine.apply_states();
        assert!(handle.calls().is_empty());
        engine.set_state(true, 0.0, true, false, true);
        engine.apply_states();
        assert!(handle.calls().contains(&GlCall::Enable(consts::CULL_FACE)));
    }

    #[test]
    fn hardware_scaling_divides_render_size() {
        let (mut engine, _h) = Engine::headless(200, 100, EngineOptions::default()).unwrap();
        engine.set_hardware_scaling_level(2.0);
        assert_eq!(engine.get_render_width(false), 100);
        assert_eq!(engine.get_render_height(false), 50);
        assert_eq!(engine.get_aspect_ratio(false), 2.0);
    }

    #[test]
    fn resize_notifies_observers() {
        use std::cell::Cell;
        use std::rc::Rc;
        let (mut engine, _h) = Engine::headless(10, 10, EngineOptions::default()).unwrap();
        let seen = Rc::new(Cell::new((0, 0)));
        let s = seen.clone();
        engine.on_resize.add(move |size| s.set(*size));
        engine.resize(64, 32);
        assert_eq!(seen.get(), (64, 32));
    }
}
