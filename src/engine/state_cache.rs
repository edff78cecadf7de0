//! Shadow copy of GPU pipeline state.
//!
//! Two kinds of state live here:
//! - depth/culling, stencil and alpha blending are *requested* by setters and
//!   only pushed to the context by [`StateCache::apply_states`] (right before a
//!   draw or clear), so a burst of setters costs at most one call per field;
//! - bindings (buffers, program, textures per unit, framebuffer, viewport,
//!   vertex attributes) are compared and issued immediately.
//!
//! `None` in a binding slot means "unknown": the next request always issues.

use std::collections::HashMap;

use crate::engine::constants::{AlphaEquation, AlphaMode, CompareFunction};
use crate::gl::consts::{self, GlEnum};
use crate::gl::{GlName, GraphicsContext, VertexAttribPointer};

/// A requested value plus what the context currently holds.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cached<T> {
    value: T,
    applied: Option<T>,
}

impl<T: Copy + PartialEq> Cached<T> {
    fn new(value: T) -> Self {
        Self { value, applied: None }
    }

    pub(crate) fn get(&self) -> T {
        self.value
    }

    fn set(&mut self, value: T) {
        self.value = value;
    }

    /// The value to push, if it differs from what was last pushed.
    fn take_dirty(&mut self, force: bool) -> Option<T> {
        if !force && self.applied == Some(self.value) {
            return None;
        }
        self.applied = Some(self.value);
        Some(self.value)
    }

    fn invalidate(&mut self) {
        self.applied = None;
    }

    fn is_dirty(&self) -> bool {
        self.applied != Some(self.value)
    }
}

fn toggle(ctx: &mut dyn GraphicsContext, cap: GlEnum, on: bool) {
    if on {
        ctx.enable(cap);
    } else {
        ctx.disable(cap);
    }
}

// ── Depth / culling ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct DepthCullingState {
    depth_test: Cached<bool>,
    depth_mask: Cached<bool>,
    depth_func: Cached<CompareFunction>,
    cull: Cached<bool>,
    cull_face: Cached<GlEnum>,
    front_face: Cached<GlEnum>,
    z_offset: Cached<f32>,
}

impl Default for DepthCullingState {
    fn default() -> Self {
        Self {
            depth_test: Cached::new(true),
            depth_mask: Cached::new(true),
            depth_func: Cached::new(CompareFunction::LessOrEqual),
            cull: Cached::new(false),
            cull_face: Cached::new(consts::BACK),
            front_face: Cached::new(consts::CCW),
            z_offset: Cached::new(0.0),
        }
    }
}

impl DepthCullingState {
    pub fn depth_test(&self) -> bool {
        self.depth_test.get()
    }
    pub fn depth_mask(&self) -> bool {
        self.depth_mask.get()
    }
    pub fn depth_func(&self) -> CompareFunction {
        self.depth_func.get()
    }
    pub fn cull(&self) -> bool {
        self.cull.get()
    }
    pub fn cull_face(&self) -> GlEnum {
        self.cull_face.get()
    }
    pub fn front_face(&self) -> GlEnum {
        self.front_face.get()
    }
    pub fn z_offset(&self) -> f32 {
        self.z_offset.get()
    }

    pub fn set_depth_test(&mut self, v: bool) {
        self.depth_test.set(v);
    }
    pub fn set_depth_mask(&mut self, v: bool) {
        self.depth_mask.set(v);
    }
    pub fn set_depth_func(&mut self, v: CompareFunction) {
        self.depth_func.set(v);
    }
    pub fn set_cull(&mut self, v: bool) {
        self.cull.set(v);
    }
    pub fn set_cull_face(&mut self, v: GlEnum) {
        self.cull_face.set(v);
    }
    pub fn set_front_face(&mut self, v: GlEnum) {
        self.front_face.set(v);
    }
    pub fn set_z_offset(&mut self, v: f32) {
        self.z_offset.set(v);
    }

    pub fn is_dirty(&self) -> bool {
        self.depth_test.is_dirty()
            || self.depth_mask.is_dirty()
            || self.depth_func.is_dirty()
            || self.cull.is_dirty()
            || self.cull_face.is_dirty()
            || self.front_face.is_dirty()
            || self.z_offset.is_dirty()
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.depth_test.invalidate();
        self.depth_mask.invalidate();
        self.depth_func.invalidate();
        self.cull.invalidate();
        self.cull_face.invalidate();
        self.front_face.invalidate();
        self.z_offset.invalidate();
    }

    fn apply(&mut self, ctx: &mut dyn GraphicsContext, force: bool) {
        if let Some(v) = self.depth_test.take_dirty(force) {
            toggle(ctx, consts::DEPTH_TEST, v);
        }
        if let Some(v) = self.depth_mask.take_dirty(force) {
            ctx.depth_mask(v);
        }
        if let Some(v) = self.depth_func.take_dirty(force) {
            ctx.depth_func(v.gl());
        }
        if let Some(v) = self.cull.take_dirty(force) {
            toggle(ctx, consts::CULL_FACE, v);
        }
        if let Some(v) = self.cull_face.take_dirty(force) {
            ctx.cull_face(v);
        }
        if let Some(v) = self.front_face.take_dirty(force) {
            ctx.front_face(v);
        }
        if let Some(v) = self.z_offset.take_dirty(force) {
            toggle(ctx, consts::POLYGON_OFFSET_FILL, v != 0.0);
            if v != 0.0 {
                ctx.polygon_offset(v, 0.0);
            }
        }
    }
}

// ── Stencil ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StencilFunc {
    pub func: CompareFunction,
    pub reference: i32,
    pub mask: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilOps {
    pub stencil_fail: GlEnum,
    pub depth_fail: GlEnum,
    pub pass: GlEnum,
}

#[derive(Clone, Debug)]
pub struct StencilState {
    enabled: Cached<bool>,
    mask: Cached<u32>,
    func: Cached<StencilFunc>,
    ops: Cached<StencilOps>,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            enabled: Cached::new(false),
            mask: Cached::new(0xFF),
            func: Cached::new(StencilFunc {
                func: CompareFunction::Always,
                reference: 1,
                mask: 0xFF,
            }),
            ops: Cached::new(StencilOps {
                stencil_fail: consts::KEEP,
                depth_fail: consts::KEEP,
                pass: consts::REPLACE,
            }),
        }
    }
}

impl StencilState {
    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }
    pub fn mask(&self) -> u32 {
        self.mask.get()
    }
    pub fn func(&self) -> StencilFunc {
        self.func.get()
    }
    pub fn ops(&self) -> StencilOps {
        self.ops.get()
    }

    pub fn set_enabled(&mut self, v: bool) {
        self.enabled.set(v);
    }
    pub fn set_mask(&mut self, v: u32) {
        self.mask.set(v);
    }
    pub fn set_func(&mut self, v: StencilFunc) {
        self.func.set(v);
    }
    pub fn set_ops(&mut self, v: StencilOps) {
        self.ops.set(v);
    }

    fn invalidate(&mut self) {
        self.enabled.invalidate();
        self.mask.invalidate();
        self.func.invalidate();
        self.ops.invalidate();
    }

    fn apply(&mut self, ctx: &mut dyn GraphicsContext, force: bool) {
        if let Some(v) = self.enabled.take_dirty(force) {
            toggle(ctx, consts::STENCIL_TEST, v);
        }
        if let Some(v) = self.mask.take_dirty(force) {
            ctx.stencil_mask(v);
        }
        if let Some(f) = self.func.take_dirty(force) {
            ctx.stencil_func(f.func.gl(), f.reference, f.mask);
        }
        if let Some(o) = self.ops.take_dirty(force) {
            ctx.stencil_op(o.stencil_fail, o.depth_fail, o.pass);
        }
    }
}

// ── Alpha blending ───────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct AlphaState {
    mode: AlphaMode,
    blend: Cached<bool>,
    factors: Cached<[GlEnum; 4]>,
    equation: Cached<(GlEnum, GlEnum)>,
    constants: Cached<[f32; 4]>,
}

impl Default for AlphaState {
    fn default() -> Self {
        Self {
            mode: AlphaMode::Disable,
            blend: Cached::new(false),
            factors: Cached::new([consts::ONE, consts::ZERO, consts::ONE, consts::ZERO]),
            equation: Cached::new((consts::FUNC_ADD, consts::FUNC_ADD)),
            constants: Cached::new([0.0; 4]),
        }
    }
}

impl AlphaState {
    pub fn mode(&self) -> AlphaMode {
        self.mode
    }
    pub fn blend(&self) -> bool {
        self.blend.get()
    }
    pub fn factors(&self) -> [GlEnum; 4] {
        self.factors.get()
    }
    pub fn constants(&self) -> [f32; 4] {
        self.constants.get()
    }

    pub fn set_mode(&mut self, mode: AlphaMode) {
        self.mode = mode;
        match mode.blend_factors() {
            Some(f) => {
                self.factors.set(f);
                self.blend.set(true);
            }
            None => self.blend.set(false),
        }
    }

    pub fn set_equation(&mut self, rgb: AlphaEquation, alpha: AlphaEquation) {
        self.equation.set((rgb.gl(), alpha.gl()));
    }

    pub fn set_constants(&mut self, rgba: [f32; 4]) {
        self.constants.set(rgba);
    }

    fn invalidate(&mut self) {
        self.blend.invalidate();
        self.factors.invalidate();
        self.equation.invalidate();
        self.constants.invalidate();
    }

    fn apply(&mut self, ctx: &mut dyn GraphicsContext, force: bool) {
        if let Some(v) = self.blend.take_dirty(force) {
            toggle(ctx, consts::BLEND, v);
        }
        if !self.blend.get() && !force {
            return;
        }
        if let Some(f) = self.factors.take_dirty(force) {
            ctx.blend_func_separate(f[0], f[1], f[2], f[3]);
        }
        if let Some((rgb, a)) = self.equation.take_dirty(force) {
            ctx.blend_equation_separate(rgb, a);
        }
        if let Some(c) = self.constants.take_dirty(force) {
            ctx.blend_color(c[0], c[1], c[2], c[3]);
        }
    }
}

// ── Bindings ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub(crate) struct BindingCache {
    pub(crate) buffers: HashMap<GlEnum, GlName>,
    pub(crate) program: Option<GlName>,
    pub(crate) active_unit: Option<u32>,
    pub(crate) textures: HashMap<u32, (GlEnum, GlName)>,
    pub(crate) framebuffer: Option<GlName>,
    pub(crate) vertex_array: Option<GlName>,
    pub(crate) viewport: Option<[i32; 4]>,
    pub(crate) clear_color: Option<[f32; 4]>,
    pub(crate) clear_depth: Option<f32>,
    pub(crate) clear_stencil: Option<i32>,
    pub(crate) attrib_pointers: HashMap<u32, (GlName, VertexAttribPointer)>,
    pub(crate) enabled_attribs: HashMap<u32, bool>,
    pub(crate) attrib_divisors: HashMap<u32, u32>,
    pub(crate) color_mask: Option<[bool; 4]>,
    pub(crate) dithering: Option<bool>,
    pub(crate) rasterizer_discard: Option<bool>,
}

/// What `backup_gl_state` captures.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    depth: DepthCullingState,
    stencil: StencilState,
    alpha: AlphaState,
    program: Option<GlName>,
    framebuffer: Option<GlName>,
    viewport: Option<[i32; 4]>,
    array_buffer: Option<GlName>,
    color_mask: Option<[bool; 4]>,
}

/// Everything the engine knows about the context's current state.
#[derive(Clone, Debug, Default)]
pub struct StateCache {
    pub depth: DepthCullingState,
    pub stencil: StencilState,
    pub alpha: AlphaState,
    pub(crate) bindings: BindingCache,
}

impl StateCache {
    /// Push pending depth, stencil and blend changes.
    pub fn apply_states(&mut self, ctx: &mut dyn GraphicsContext) {
        self.depth.apply(ctx, false);
        self.stencil.apply(ctx, false);
        self.alpha.apply(ctx, false);
    }

    /// Forget what the context holds. Brute force also resets the requested
    /// depth/stencil/alpha values to their defaults.
    pub fn wipe(&mut self, brute_force: bool) {
        let bindings = &mut self.bindings;
        bindings.textures.clear();
        bindings.active_unit = None;
        bindings.viewport = None;
        bindings.buffers.clear();
        bindings.attrib_pointers.clear();
        bindings.enabled_attribs.clear();
        bindings.attrib_divisors.clear();
        bindings.vertex_array = None;
        if brute_force {
            bindings.program = None;
            bindings.framebuffer = None;
            bindings.clear_color = None;
            bindings.clear_depth = None;
            bindings.clear_stencil = None;
            bindings.color_mask = None;
            bindings.dithering = None;
            bindings.rasterizer_discard = None;
            self.depth = DepthCullingState::default();
            self.stencil = StencilState::default();
            self.alpha = AlphaState::default();
        }
    }

    /// Drop bound-texture associations only.
    pub fn reset_texture_cache(&mut self) {
        self.bindings.textures.clear();
        self.bindings.active_unit = None;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            depth: self.depth.clone(),
            stencil: self.stencil.clone(),
            alpha: self.alpha.clone(),
            program: self.bindings.program,
            framebuffer: self.bindings.framebuffer,
            viewport: self.bindings.viewport,
            array_buffer: self.bindings.buffers.get(&consts::ARRAY_BUFFER).copied(),
            color_mask: self.bindings.color_mask,
        }
    }

    /// Re-establish a snapshot after foreign code touched the context. All
    /// captured state is re-issued since the context contents are unknown.
    pub fn restore(&mut self, snapshot: StateSnapshot, ctx: &mut dyn GraphicsContext) {
        self.wipe(false);
        self.depth = snapshot.depth;
        self.stencil = snapshot.stencil;
        self.alpha = snapshot.alpha;
        self.depth.invalidate_all();
        self.stencil.invalidate();
        self.alpha.invalidate();
        self.depth.apply(ctx, true);
        self.stencil.apply(ctx, true);
        self.alpha.apply(ctx, true);

        self.bindings.program = None;
        self.bindings.framebuffer = None;
        self.bindings.color_mask = None;
        if let Some(p) = snapshot.program {
            self.use_program(ctx, p);
        }
        if let Some(fb) = snapshot.framebuffer {
            self.bind_framebuffer(ctx, fb);
        }
        if let Some([x, y, w, h]) = snapshot.viewport {
            self.viewport(ctx, x, y, w, h);
        }
        if let Some(b) = snapshot.array_buffer {
            self.bind_buffer(ctx, consts::ARRAY_BUFFER, b);
        }
        if let Some([r, g, b, a]) = snapshot.color_mask {
            self.color_mask(ctx, [r, g, b, a]);
        }
    }

    // ── immediate bindings ──

    pub fn bind_buffer(&mut self, ctx: &mut dyn GraphicsContext, target: GlEnum, buffer: GlName) {
        if self.bindings.buffers.get(&target) != Some(&buffer) {
            ctx.bind_buffer(target, buffer);
            self.bindings.buffers.insert(target, buffer);
        }
    }

    pub fn bound_buffer(&self, target: GlEnum) -> Option<GlName> {
        self.bindings.buffers.get(&target).copied()
    }

    /// Forget a deleted buffer so a recycled name is rebound.
    pub fn forget_buffer(&mut self, buffer: GlName) {
        self.bindings.buffers.retain(|_, b| *b != buffer);
        self.bindings.attrib_pointers.retain(|_, (b, _)| *b != buffer);
    }

    pub fn use_program(&mut self, ctx: &mut dyn GraphicsContext, program: GlName) {
        if self.bindings.program != Some(program) {
            ctx.use_program(program);
            self.bindings.program = Some(program);
        }
    }

    pub fn current_program(&self) -> Option<GlName> {
        self.bindings.program.filter(|p| *p != 0)
    }

    pub fn forget_program(&mut self, program: GlName) {
        if self.bindings.program == Some(program) {
            self.bindings.program = None;
        }
    }

    pub fn active_texture(&mut self, ctx: &mut dyn GraphicsContext, unit: u32) {
        if self.bindings.active_unit != Some(unit) {
            ctx.active_texture(unit);
            self.bindings.active_unit = Some(unit);
        }
    }

    /// Bind `texture` on `unit`. Returns whether a call was issued.
    pub fn bind_texture(&mut self, ctx: &mut dyn GraphicsContext, unit: u32, target: GlEnum, texture: GlName) -> bool {
        if self.bindings.textures.get(&unit) == Some(&(target, texture)) {
            return false;
        }
        self.active_texture(ctx, unit);
        ctx.bind_texture(target, texture);
        self.bindings.textures.insert(unit, (target, texture));
        true
    }

    pub fn forget_texture(&mut self, texture: GlName) {
        self.bindings.textures.retain(|_, (_, t)| *t != texture);
    }

    pub fn bind_framebuffer(&mut self, ctx: &mut dyn GraphicsContext, framebuffer: GlName) {
        if self.bindings.framebuffer != Some(framebuffer) {
            ctx.bind_framebuffer(consts::FRAMEBUFFER, framebuffer);
            self.bindings.framebuffer = Some(framebuffer);
        }
    }

    pub fn bind_vertex_array(&mut self, ctx: &mut dyn GraphicsContext, vao: GlName) {
        if self.bindings.vertex_array != Some(vao) {
            ctx.bind_vertex_array(vao);
            self.bindings.vertex_array = Some(vao);
            // Attribute and element-buffer state belong to the VAO.
            self.bindings.buffers.remove(&consts::ELEMENT_ARRAY_BUFFER);
            self.bindings.attrib_pointers.clear();
            self.bindings.enabled_attribs.clear();
            self.bindings.attrib_divisors.clear();
        }
    }

    pub fn viewport(&mut self, ctx: &mut dyn GraphicsContext, x: i32, y: i32, w: i32, h: i32) {
        let v = [x, y, w, h];
        if self.bindings.viewport != Some(v) {
            ctx.viewport(x, y, w, h);
            self.bindings.viewport = Some(v);
        }
    }

    pub fn current_viewport(&self) -> Option<[i32; 4]> {
        self.bindings.viewport
    }

    pub fn clear_color(&mut self, ctx: &mut dyn GraphicsContext, rgba: [f32; 4]) {
        if self.bindings.clear_color != Some(rgba) {
            ctx.clear_color(rgba[0], rgba[1], rgba[2], rgba[3]);
            self.bindings.clear_color = Some(rgba);
        }
    }

    pub fn clear_depth(&mut self, ctx: &mut dyn GraphicsContext, depth: f32) {
        if self.bindings.clear_depth != Some(depth) {
            ctx.clear_depth(depth);
            self.bindings.clear_depth = Some(depth);
        }
    }

    pub fn clear_stencil(&mut self, ctx: &mut dyn GraphicsContext, stencil: i32) {
        if self.bindings.clear_stencil != Some(stencil) {
            ctx.clear_stencil(stencil);
            self.bindings.clear_stencil = Some(stencil);
        }
    }

    pub fn color_mask(&mut self, ctx: &mut dyn GraphicsContext, mask: [bool; 4]) {
        if self.bindings.color_mask != Some(mask) {
            ctx.color_mask(mask[0], mask[1], mask[2], mask[3]);
            self.bindings.color_mask = Some(mask);
        }
    }

    pub fn color_write(&self) -> bool {
        self.bindings.color_mask.is_none_or(|m| m.iter().all(|c| *c))
    }

    pub fn dithering(&mut self, ctx: &mut dyn GraphicsContext, on: bool) {
        if self.bindings.dithering != Some(on) {
            toggle(ctx, consts::DITHER, on);
            self.bindings.dithering = Some(on);
        }
    }

    pub fn rasterizer_discard(&mut self, ctx: &mut dyn GraphicsContext, on: bool) {
        if self.bindings.rasterizer_discard != Some(on) {
            toggle(ctx, consts::RASTERIZER_DISCARD, on);
            self.bindings.rasterizer_discard = Some(on);
        }
    }

    pub fn vertex_attrib_pointer(&mut self, ctx: &mut dyn GraphicsContext, buffer: GlName, pointer: VertexAttribPointer) {
        let entry = (buffer, pointer);
        if self.bindings.attrib_pointers.get(&pointer.index) != Some(&entry) {
            ctx.vertex_attrib_pointer(pointer);
            self.bindings.attrib_pointers.insert(pointer.index, entry);
        }
    }

    pub fn enable_attrib(&mut self, ctx: &mut dyn GraphicsContext, index: u32) {
        if self.bindings.enabled_attribs.get(&index) != Some(&true) {
            ctx.enable_vertex_attrib_array(index);
            self.bindings.enabled_attribs.insert(index, true);
        }
    }

    pub fn disable_attrib(&mut self, ctx: &mut dyn GraphicsContext, index: u32) {
        if self.bindings.enabled_attribs.get(&index) == Some(&true) {
            ctx.disable_vertex_attrib_array(index);
            self.bindings.enabled_attribs.insert(index, false);
        }
    }

    pub fn enabled_attribs(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self
            .bindings
            .enabled_attribs
            .iter()
            .filter(|(_, on)| **on)
            .map(|(i, _)| *i)
            .collect();
        v.sort_unstable();
        v
    }

    pub fn attrib_divisor(&mut self, ctx: &mut dyn GraphicsContext, index: u32, divisor: u32) {
        let current = self.bindings.attrib_divisors.get(&index).copied().unwrap_or(0);
        if current != divisor {
            ctx.vertex_attrib_divisor(index, divisor);
            self.bindings.attrib_divisors.insert(index, divisor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl::{GlCall, HeadlessContext};

    #[test]
    fn repeated_depth_func_issues_once() {
        let mut ctx = HeadlessContext::new(4, 4);
        let handle = ctx.handle();
        let mut cache = StateCache::default();
        for _ in 0..5 {
            cache.depth.set_depth_func(CompareFunction::Greater);
            cache.apply_states(&mut ctx);
        }
        assert_eq!(handle.count(|c| matches!(c, GlCall::DepthFunc(_))), 1);
    }

    #[test]
    fn blend_factors_skipped_while_blending_is_off() {
        let mut ctx = HeadlessContext::new(4, 4);
        let handle = ctx.handle();
        let mut cache = StateCache::default();
        cache.apply_states(&mut ctx);
        assert_eq!(handle.count(|c| matches!(c, GlCall::BlendFuncSeparate(_))), 0);
        cache.alpha.set_mode(AlphaMode::Combine);
        cache.apply_states(&mut ctx);
        assert_eq!(handle.count(|c| matches!(c, GlCall::Enable(consts::BLEND))), 1);
        assert_eq!(handle.count(|c| matches!(c, GlCall::BlendFuncSeparate(_))), 1);
    }

    #[test]
    fn wipe_forces_rebind() {
        let mut ctx = HeadlessContext::new(4, 4);
        let handle = ctx.handle();
        let mut cache = StateCache::default();
        cache.bind_buffer(&mut ctx, consts::ARRAY_BUFFER, 7);
        cache.bind_buffer(&mut ctx, consts::ARRAY_BUFFER, 7);
        cache.wipe(false);
        cache.bind_buffer(&mut ctx, consts::ARRAY_BUFFER, 7);
        assert_eq!(handle.count(GlCall::is_bind_buffer), 2);
    }

    #[test]
    fn restore_reissues_captured_state() {
        let mut ctx = HeadlessContext::new(4, 4);
        let handle = ctx.handle();
        let mut cache = StateCache::default();
        cache.depth.set_depth_func(CompareFunction::Greater);
        cache.apply_states(&mut ctx);
        cache.use_program(&mut ctx, 3);
        let snap = cache.snapshot();

        cache.depth.set_depth_func(CompareFunction::Less);
        cache.apply_states(&mut ctx);
        handle.clear_calls();

        cache.restore(snap, &mut ctx);
        let calls = handle.calls();
        assert!(calls.contains(&GlCall::DepthFunc(consts::GREATER)));
        assert!(calls.contains(&GlCall::UseProgram(3)));
        assert_eq!(cache.depth.depth_func(), CompareFunction::Greater);
    }
}
