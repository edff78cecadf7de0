//! Frame loop, framebuffer stack, viewport, clears and draw dispatch.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::EngineOptions;
use crate::engine::Engine;
use crate::engine::buffers::VertexBufferBinding;
use crate::engine::constants::FillMode;
use crate::engine::effect::EffectHandle;
use crate::engine::resources::BufferHandle;
use crate::engine::texture::TextureHandle;
use crate::gl::consts;

const FPS_SAMPLE_COUNT: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderLoopId(u64);

type RenderLoopCallback = Box<dyn FnMut(&mut Engine)>;

/// Viewport expressed as fractions of the render target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// Pixel rectangle inside a `width` x `height` target.
    pub fn to_global(&self, width: u32, height: u32) -> [i32; 4] {
        [
            (self.x * width as f32) as i32,
            (self.y * height as f32) as i32,
            (self.width * width as f32) as i32,
            (self.height * height as f32) as i32,
        ]
    }
}

/// One entry of the bound render-target stack.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RenderTargetContext {
    pub(crate) texture: TextureHandle,
    pub(crate) face: Option<u32>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) lod: i32,
}

/// Last vertex input bound through `bind_buffers`.
#[derive(Default)]
pub(crate) struct VertexInputCache {
    pub(crate) bindings: Option<(Vec<VertexBufferBinding>, EffectHandle)>,
    pub(crate) index_buffer: Option<BufferHandle>,
    pub(crate) uint_indices: bool,
    pub(crate) instance_attribs: Vec<u32>,
}

pub(crate) struct FrameState {
    frame_id: u64,
    in_frame: bool,
    draw_calls: u32,
    last_frame_draw_calls: u32,
    frame_times: VecDeque<f64>,
    fps: f64,
    delta_ms: f64,
    last_frame_ms: Option<f64>,
    clock: Instant,
    render_loops: Vec<(RenderLoopId, RenderLoopCallback)>,
    next_loop_id: u64,
    running_loops: bool,
    stopped_during_run: Vec<RenderLoopId>,
    stop_all_requested: bool,
    deterministic_lockstep: bool,
    lockstep_max_steps: u32,
    time_step: f64,
}

impl FrameState {
    pub(crate) fn new(options: &EngineOptions) -> Self {
        Self {
            frame_id: 0,
            in_frame: false,
            draw_calls: 0,
            last_frame_draw_calls: 0,
            frame_times: VecDeque::with_capacity(FPS_SAMPLE_COUNT),
            fps: 60.0,
            delta_ms: 0.0,
            last_frame_ms: None,
            clock: Instant::now(),
            render_loops: Vec::new(),
            next_loop_id: 1,
            running_loops: false,
            stopped_during_run: Vec::new(),
            stop_all_requested: false,
            deterministic_lockstep: options.deterministic_lockstep,
            lockstep_max_steps: options.lockstep_max_steps,
            time_step: options.time_step,
        }
    }

    fn sample(&mut self, now_ms: f64) {
        if let Some(last) = self.last_frame_ms {
            self.delta_ms = (now_ms - last).max(0.0);
            if self.frame_times.len() == FPS_SAMPLE_COUNT {
                self.frame_times.pop_front();
            }
            self.frame_times.push_back(self.delta_ms);
            let avg = self.frame_times.iter().sum::<f64>() / self.frame_times.len() as f64;
            if avg > 0.0 {
                self.fps = 1000.0 / avg;
            }
        }
        self.last_frame_ms = Some(now_ms);
    }
}

impl Engine {
    // ── Frame loop ───────────────────────────────────────────────────────

    /// Start a frame at `now_ms` on the engine clock.
    pub fn begin_frame_at(&mut self, now_ms: f64) {
        self.frame.sample(now_ms);
        self.frame.in_frame = true;
        self.frame.draw_calls = 0;
        self.wipe_caches(false);
        let id = self.frame.frame_id;
        self.on_begin_frame.notify(&id);
    }

    pub fn begin_frame(&mut self) {
        let now = self.now_ms();
        self.begin_frame_at(now);
    }

    pub fn end_frame(&mut self) {
        if !self.frame.in_frame {
            return;
        }
        self.frame.in_frame = false;
        self.frame.last_frame_draw_calls = self.frame.draw_calls;
        let id = self.frame.frame_id;
        self.on_end_frame.notify(&id);
        self.frame.frame_id += 1;
    }

    /// Milliseconds since the engine was created.
    pub fn now_ms(&self) -> f64 {
        self.frame.clock.elapsed().as_secs_f64() * 1000.0
    }

    /// Register a per-frame callback. Callbacks run in registration order.
    pub fn run_render_loop(&mut self, callback: impl FnMut(&mut Engine) + 'static) -> RenderLoopId {
        let id = RenderLoopId(self.frame.next_loop_id);
        self.frame.next_loop_id += 1;
        self.frame.render_loops.push((id, Box::new(callback)));
        log::debug!("render loop {id:?} registered");
        id
    }

    /// Remove one callback, or all of them with `None`.
    pub fn stop_render_loop(&mut self, id: Option<RenderLoopId>) {
        match id {
            Some(id) => {
                self.frame.render_loops.retain(|(i, _)| *i != id);
                if self.frame.running_loops {
                    self.frame.stopped_during_run.push(id);
                }
            }
            None => {
                self.frame.render_loops.clear();
                if self.frame.running_loops {
                    self.frame.stop_all_requested = true;
                }
            }
        }
    }

    pub fn has_render_loop(&self) -> bool {
        !self.frame.render_loops.is_empty()
    }

    /// Run one frame of every registered callback at `now_ms`. Returns whether
    /// a frame was produced; nothing renders while the context is lost.
    pub fn render_frame_at(&mut self, now_ms: f64) -> bool {
        self.poll_context_state();
        if !self.can_issue() || self.frame.render_loops.is_empty() {
            return false;
        }
        self.begin_frame_at(now_ms);

        let mut loops = std::mem::take(&mut self.frame.render_loops);
        self.frame.running_loops = true;
        for (_, callback) in loops.iter_mut() {
            callback(self);
        }
        self.frame.running_loops = false;

        let stopped = std::mem::take(&mut self.frame.stopped_during_run);
        if std::mem::take(&mut self.frame.stop_all_requested) {
            loops.clear();
        } else {
            loops.retain(|(id, _)| !stopped.contains(id));
        }
        loops.append(&mut self.frame.render_loops);
        self.frame.render_loops = loops;

        self.end_frame();
        true
    }

    pub fn render_frame(&mut self) -> bool {
        let now = self.now_ms();
        self.render_frame_at(now)
    }

    /// Step `count` frames on a simulated clock advancing `frame_ms` each.
    /// Returns the number of frames produced.
    pub fn run_frames(&mut self, count: u32, frame_ms: f64) -> u32 {
        let start = self.frame.last_frame_ms.unwrap_or(0.0);
        (1..=count)
            .filter(|i| self.render_frame_at(start + f64::from(*i) * frame_ms))
            .count() as u32
    }

    pub fn get_fps(&self) -> f64 {
        self.frame.fps
    }

    /// Milliseconds between the last two frames.
    pub fn get_delta_time(&self) -> f64 {
        self.frame.delta_ms
    }

    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id
    }

    /// Draw calls issued so far in the current frame.
    pub fn draw_calls(&self) -> u32 {
        self.frame.draw_calls
    }

    pub fn last_frame_draw_calls(&self) -> u32 {
        self.frame.last_frame_draw_calls
    }

    pub fn is_deterministic_lock_step(&self) -> bool {
        self.frame.deterministic_lockstep
    }

    pub fn get_lockstep_max_steps(&self) -> u32 {
        self.frame.lockstep_max_steps
    }

    pub fn get_time_step(&self) -> f64 {
        self.frame.time_step
    }

    // ── Viewport / clear ─────────────────────────────────────────────────

    /// Apply a fractional viewport to the current target, or to an explicit
    /// size when given.
    pub fn set_viewport(&mut self, viewport: Viewport, required_width: Option<u32>, required_height: Option<u32>) {
        let width = required_width.unwrap_or_else(|| self.get_render_width(false));
        let height = required_height.unwrap_or_else(|| self.get_render_height(false));
        self.cached_viewport = Some(viewport);
        if self.can_issue() {
            let [x, y, w, h] = viewport.to_global(width, height);
            self.state.viewport(self.ctx.as_mut(), x, y, w, h);
        }
    }

    /// Set a pixel viewport directly and return the previous one.
    pub fn set_direct_viewport(&mut self, x: i32, y: i32, width: i32, height: i32) -> Option<[i32; 4]> {
        let previous = self.state.current_viewport();
        self.cached_viewport = None;
        if self.can_issue() {
            self.state.viewport(self.ctx.as_mut(), x, y, width, height);
        }
        previous
    }

    pub fn current_viewport(&self) -> Option<Viewport> {
        self.cached_viewport
    }

    /// Clear the bound framebuffer. `color` is applied only with `back_buffer`.
    pub fn clear(&mut self, color: Option<[f32; 4]>, back_buffer: bool, depth: bool, stencil: bool) {
        if !self.can_issue() {
            return;
        }
        self.apply_states();
        let ctx = self.ctx.as_mut();
        let mut mask = 0;
        if back_buffer {
            if let Some(rgba) = color {
                self.state.clear_color(ctx, rgba);
            }
            mask |= consts::COLOR_BUFFER_BIT;
        }
        if depth {
            self.state.clear_depth(ctx, 1.0);
            mask |= consts::DEPTH_BUFFER_BIT;
        }
        if stencil {
            self.state.clear_stencil(ctx, 0);
            mask |= consts::STENCIL_BUFFER_BIT;
        }
        if mask != 0 {
            ctx.clear(mask);
        }
    }

    /// Clear only a pixel rectangle.
    pub fn scissor_clear(&mut self, x: i32, y: i32, width: i32, height: i32, color: [f32; 4]) {
        if !self.can_issue() {
            return;
        }
        self.ctx.enable(consts::SCISSOR_TEST);
        self.ctx.scissor(x, y, width, height);
        self.clear(Some(color), true, true, true);
        self.ctx.disable(consts::SCISSOR_TEST);
    }

    // ── Framebuffers ─────────────────────────────────────────────────────

    /// Push a render target. `face` selects a cube face; the viewport covers
    /// the whole target when `force_full_viewport` is set or no fractional
    /// viewport is cached.
    pub fn bind_framebuffer(
        &mut self,
        texture: TextureHandle,
        face: Option<u32>,
        required_width: Option<u32>,
        required_height: Option<u32>,
        force_full_viewport: bool,
        lod: i32,
    ) -> bool {
        let Some(tex) = self.textures.get(texture) else {
            return false;
        };
        if tex.framebuffer == 0 && self.can_issue() {
            log::warn!("texture {texture:?} is not a render target");
            return false;
        }
        let (fb, name, width, height) = (tex.framebuffer, tex.name, tex.width, tex.height);
        let lod_shift = lod.max(0) as u32;
        let width = required_width.unwrap_or(width >> lod_shift).max(1);
        let height = required_height.unwrap_or(height >> lod_shift).max(1);

        if self.can_issue() {
            let ctx = self.ctx.as_mut();
            self.state.bind_framebuffer(ctx, fb);
            if let Some(face) = face {
                ctx.framebuffer_texture_2d(
                    consts::FRAMEBUFFER,
                    consts::COLOR_ATTACHMENT0,
                    consts::TEXTURE_CUBE_MAP_POSITIVE_X + face,
                    name,
                    lod,
                );
            } else if lod != 0 {
                ctx.framebuffer_texture_2d(consts::FRAMEBUFFER, consts::COLOR_ATTACHMENT0, consts::TEXTURE_2D, name, lod);
            }
        }
        self.render_targets.push(RenderTargetContext { texture, face, width, height, lod });

        match self.cached_viewport {
            Some(vp) if !force_full_viewport => self.set_viewport(vp, Some(width), Some(height)),
            _ => {
                if self.can_issue() {
                    self.state.viewport(self.ctx.as_mut(), 0, 0, width as i32, height as i32);
                }
            }
        }
        true
    }

    /// Pop the current render target, generating its mipmaps unless disabled,
    /// and rebind whatever was below it.
    pub fn un_bind_framebuffer(&mut self, disable_generate_mipmaps: bool) {
        let Some(top) = self.render_targets.pop() else {
            return;
        };
        if self.can_issue() && !disable_generate_mipmaps {
            if let Some(tex) = self.textures.get(top.texture).filter(|t| t.generate_mipmaps) {
                let (target, name) = (tex.target(), tex.name);
                self.state.bind_texture(self.ctx.as_mut(), 0, target, name);
                self.ctx.generate_mipmap(target);
                self.state.bind_texture(self.ctx.as_mut(), 0, target, 0);
            }
        }
        self.rebind_top_framebuffer();
    }

    /// Pop every render target and return to the canvas.
    pub fn restore_default_framebuffer(&mut self) {
        while !self.render_targets.is_empty() {
            self.un_bind_framebuffer(false);
        }
        self.rebind_top_framebuffer();
    }

    fn rebind_top_framebuffer(&mut self) {
        if !self.can_issue() {
            return;
        }
        let (fb, width, height) = match self.render_targets.last() {
            Some(rt) => (
                self.textures.get(rt.texture).map_or(0, |t| t.framebuffer),
                rt.width,
                rt.height,
            ),
            None => (0, self.get_render_width(true), self.get_render_height(true)),
        };
        self.state.bind_framebuffer(self.ctx.as_mut(), fb);
        match self.cached_viewport {
            Some(vp) => self.set_viewport(vp, Some(width), Some(height)),
            None => self.state.viewport(self.ctx.as_mut(), 0, 0, width as i32, height as i32),
        }
    }

    pub fn is_render_target_bound(&self) -> bool {
        !self.render_targets.is_empty()
    }

    /// Submit buffered commands.
    pub fn flush_framebuffer(&mut self) {
        if self.can_issue() {
            self.ctx.flush();
        }
    }

    /// Read RGBA8 pixels from the bound framebuffer. Commands are flushed first.
    pub fn read_pixels(&mut self, x: i32, y: i32, width: u32, height: u32) -> Option<Vec<u8>> {
        if !self.can_issue() {
            return None;
        }
        self.flush_framebuffer();
        Some(self.ctx.read_pixels(x, y, width, height))
    }

    // ── Draws ────────────────────────────────────────────────────────────

    /// Common draw prologue. Draws without a usable program are skipped.
    fn prepare_draw(&mut self) -> bool {
        if !self.can_issue() {
            return false;
        }
        if self.state.current_program().is_none() {
            log::warn!("draw skipped: no program enabled");
            return false;
        }
        self.apply_states();
        self.frame.draw_calls += 1;
        true
    }

    /// Indexed draw. `instances` of 0 or 1 means non-instanced.
    pub fn draw_elements_type(&mut self, fill_mode: FillMode, index_start: usize, index_count: usize, instances: u32) {
        if !self.prepare_draw() {
            return;
        }
        let (index_type, index_size) = if self.vertex_input.uint_indices {
            (consts::UNSIGNED_INT, 4)
        } else {
            (consts::UNSIGNED_SHORT, 2)
        };
        let mode = fill_mode.gl();
        let offset = index_start * index_size;
        if instances > 1 && self.caps.instanced_arrays {
            self.ctx
                .draw_elements_instanced(mode, index_count as i32, index_type, offset, instances as i32);
        } else {
            self.ctx.draw_elements(mode, index_count as i32, index_type, offset);
        }
    }

    /// Non-indexed draw.
    pub fn draw_arrays_type(&mut self, fill_mode: FillMode, vertices_start: usize, vertices_count: usize, instances: u32) {
        if !self.prepare_draw() {
            return;
        }
        let mode = fill_mode.gl();
        if instances > 1 && self.caps.instanced_arrays {
            self.ctx
                .draw_arrays_instanced(mode, vertices_start as i32, vertices_count as i32, instances as i32);
        } else {
            self.ctx.draw_arrays(mode, vertices_start as i32, vertices_count as i32);
        }
    }

    pub fn draw_point_clouds(&mut self, vertices_start: usize, vertices_count: usize, instances: u32) {
        self.draw_arrays_type(FillMode::Point, vertices_start, vertices_count, instances);
    }

    /// Indexed triangles, or wireframe lines when `use_triangles` is false.
    pub fn draw(&mut self, use_triangles: bool, index_start: usize, index_count: usize, instances: u32) {
        let mode = if use_triangles { FillMode::Triangle } else { FillMode::Wireframe };
        self.draw_elements_type(mode, index_start, index_count, instances);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl::GlCall;

    #[test]
    fn viewport_fractions_scale_to_target() {
        let vp = Viewport::new(0.5, 0.0, 0.5, 1.0);
        assert_eq!(vp.to_global(200, 100), [100, 0, 100, 100]);
    }

    #[test]
    fn draws_without_program_are_skipped() {
        let (mut engine, handle) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        engine.draw_arrays_type(FillMode::Triangle, 0, 3, 0);
        assert_eq!(handle.count(GlCall::is_draw), 0);
        assert_eq!(engine.draw_calls(), 0);
    }

    #[test]
    fn fps_averages_frame_times() {
        let (mut engine, _h) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        engine.run_render_loop(|_| {});
        assert_eq!(engine.run_frames(10, 20.0), 10);
        assert!((engine.get_fps() - 50.0).abs() < 1e-6);
        assert!((engine.get_delta_time() - 20.0).abs() < 1e-6);
        assert_eq!(engine.frame_id(), 10);
    }

    #[test]
    fn render_loop_can_stop_itself() {
        use std::cell::Cell;
        use std::rc::Rc;
        let (mut engine, _h) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        engine.run_render_loop(move |e| {
            r.set(r.get() + 1);
            if r.get() == 2 {
                e.stop_render_loop(None);
            }
        });
        engine.run_frames(5, 16.0);
        assert_eq!(runs.get(), 2);
        assert!(!engine.has_render_loop());
    }

    #[test]
    fn clear_caches_clear_color() {
        let (mut engine, handle) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        engine.clear(Some([0.1, 0.2, 0.3, 1.0]), true, true, false);
        engine.clear(Some([0.1, 0.2, 0.3, 1.0]), true, true, false);
        assert_eq!(handle.count(|c| matches!(c, GlCall::ClearColor(_))), 1);
        assert_eq!(handle.count(|c| matches!(c, GlCall::Clear(_))), 2);
    }

    #[test]
    fn read_pixels_flushes_first() {
        let (mut engine, handle) = Engine::headless(4, 4, EngineOptions::default()).unwrap();
        engine.clear(Some([0.0, 1.0, 0.0, 1.0]), true, false, false);
        handle.clear_calls();
        let px = engine.read_pixels(0, 0, 1, 1).unwrap();
        assert_eq!(px, vec![0, 255, 0, 255]);
        let calls = handle.calls();
        assert_eq!(calls[0], GlCall::Flush);
        assert!(matches!(calls[1], GlCall::ReadPixels { .. }));
    }
}
