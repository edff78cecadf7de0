//! Internal textures: creation, upload, sampling state, unit assignment and
//! release.
//!
//! Each texture keeps the CPU-side description needed to recreate it after a
//! context loss (and, unless `do_not_handle_context_lost` is set, its pixel
//! data). Bound textures form a least-recently-used list threaded through the
//! texture table by handle; when every unit is taken the oldest binding gives
//! up its unit.

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbaImage;
use image::imageops::{self, FilterType};

use crate::engine::Engine;
use crate::engine::capabilities::CapabilityFallback;
use crate::engine::constants::{
    CUBE_FACE_COUNT, CompareFunction, SamplingMode, TextureFormat, TextureType, internal_sized_format,
};
use crate::engine::effect::EffectHandle;
use crate::engine::loader::CancellationToken;
use crate::engine::resources::Handle;
use crate::gl::consts::{self, GlEnum};
use crate::gl::{GlName, GraphicsContext, TexImageDesc};

pub type TextureHandle = Handle<InternalTexture>;
pub type TextureLoadedCallback = Box<dyn FnOnce(&mut Engine, TextureHandle)>;
pub type TextureErrorCallback = Box<dyn FnOnce(&mut Engine, &str)>;

const CUBE_FACES: usize = CUBE_FACE_COUNT as usize;

/// Where a texture's contents come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TextureSource {
    Url(String),
    Raw,
    Dynamic,
    RenderTarget,
    CubeRenderTarget,
    CubeRaw,
    DepthStencil,
}

impl TextureSource {
    fn has_framebuffer(&self) -> bool {
        matches!(self, TextureSource::RenderTarget | TextureSource::CubeRenderTarget | TextureSource::DepthStencil)
    }
}

#[derive(Clone, Debug)]
pub struct TextureCreationOptions {
    pub generate_mipmaps: bool,
    pub invert_y: bool,
    pub sampling_mode: SamplingMode,
    pub format: TextureFormat,
    pub texture_type: TextureType,
    /// MSAA samples for render targets; clamped to the device limit.
    pub samples: u32,
    pub generate_depth_buffer: bool,
    pub generate_stencil_buffer: bool,
    pub compare_function: Option<CompareFunction>,
}

impl Default for TextureCreationOptions {
    fn default() -> Self {
        Self {
            generate_mipmaps: false,
            invert_y: false,
            sampling_mode: SamplingMode::Trilinear,
            format: TextureFormat::Rgba,
            texture_type: TextureType::UnsignedByte,
            samples: 1,
            generate_depth_buffer: true,
            generate_stencil_buffer: false,
            compare_function: None,
        }
    }
}

pub struct InternalTexture {
    pub(crate) name: GlName,
    pub(crate) framebuffer: GlName,
    pub(crate) depth_stencil_buffer: GlName,
    pub source: TextureSource,
    pub width: u32,
    pub height: u32,
    /// Size before power-of-two or max-size adjustment.
    pub base_width: u32,
    pub base_height: u32,
    pub is_cube: bool,
    pub format: TextureFormat,
    pub texture_type: TextureType,
    pub sampling_mode: SamplingMode,
    pub generate_mipmaps: bool,
    pub invert_y: bool,
    pub samples: u32,
    pub compare_function: Option<CompareFunction>,
    pub generate_depth_buffer: bool,
    pub generate_stencil_buffer: bool,
    pub is_ready: bool,
    /// Pixel data per face, kept for rebuild.
    pub(crate) retained: Option<Vec<Arc<[u8]>>>,
    pub(crate) references: u32,
    pub(crate) load_token: Option<CancellationToken>,
    on_loaded: Vec<TextureLoadedCallback>,
    on_error: Vec<TextureErrorCallback>,
    pub(crate) designated_slot: Option<u32>,
    prev_bound: Option<TextureHandle>,
    next_bound: Option<TextureHandle>,
}

impl InternalTexture {
    fn new(source: TextureSource, width: u32, height: u32, options: &TextureCreationOptions) -> Self {
        let is_cube = matches!(source, TextureSource::CubeRenderTarget | TextureSource::CubeRaw);
        Self {
            name: 0,
            framebuffer: 0,
            depth_stencil_buffer: 0,
            source,
            width,
            height,
            base_width: width,
            base_height: height,
            is_cube,
            format: options.format,
            texture_type: options.texture_type,
            sampling_mode: options.sampling_mode,
            generate_mipmaps: options.generate_mipmaps,
            invert_y: options.invert_y,
            samples: options.samples.max(1),
            compare_function: options.compare_function,
            generate_depth_buffer: options.generate_depth_buffer,
            generate_stencil_buffer: options.generate_stencil_buffer,
            is_ready: false,
            retained: None,
            references: 1,
            load_token: None,
            on_loaded: Vec::new(),
            on_error: Vec::new(),
            designated_slot: None,
            prev_bound: None,
            next_bound: None,
        }
    }

    pub fn gl_name(&self) -> GlName {
        self.name
    }

    pub fn framebuffer(&self) -> GlName {
        self.framebuffer
    }

    pub fn target(&self) -> GlEnum {
        if self.is_cube { consts::TEXTURE_CUBE_MAP } else { consts::TEXTURE_2D }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.source {
            TextureSource::Url(u) => Some(u),
            _ => None,
        }
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    /// Unit this texture currently occupies, if any.
    pub fn designated_slot(&self) -> Option<u32> {
        self.designated_slot
    }

    pub fn is_render_target(&self) -> bool {
        self.source.has_framebuffer()
    }

    fn face_count(&self) -> usize {
        if self.is_cube { CUBE_FACES } else { 1 }
    }

    fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channel_count() * self.texture_type.bytes_per_component()
    }

    /// `(internal_format, format, type)` for uploads.
    fn gl_formats(&self, webgl2: bool) -> (GlEnum, GlEnum, GlEnum) {
        if self.source == TextureSource::DepthStencil {
            return if self.generate_stencil_buffer {
                (consts::DEPTH24_STENCIL8, consts::DEPTH_STENCIL, consts::UNSIGNED_INT_24_8)
            } else {
                (consts::DEPTH_COMPONENT24, consts::DEPTH_COMPONENT, consts::UNSIGNED_INT)
            };
        }
        let internal = if webgl2 {
            internal_sized_format(self.texture_type, self.format)
        } else {
            self.format.gl()
        };
        (internal, self.format.gl(), self.texture_type.gl())
    }
}

/// Unit bookkeeping for bound textures.
#[derive(Default)]
pub(crate) struct TextureSlots {
    bound: HashMap<u32, TextureHandle>,
    free: Vec<u32>,
    first: Option<TextureHandle>,
    last: Option<TextureHandle>,
    collisions: u64,
}

fn is_pot(v: u32) -> bool {
    v != 0 && v & (v - 1) == 0
}

fn nearest_pot(v: u32) -> u32 {
    if v <= 1 {
        return 1;
    }
    let up = v.next_power_of_two();
    let down = up >> 1;
    if up - v < v - down { up } else { down }
}

fn apply_sampling(ctx: &mut dyn GraphicsContext, target: GlEnum, mode: SamplingMode, mipmaps: bool) {
    let (mag, min) = mode.filters(mipmaps);
    ctx.tex_parameter_i(target, consts::TEXTURE_MAG_FILTER, mag as i32);
    ctx.tex_parameter_i(target, consts::TEXTURE_MIN_FILTER, min as i32);
}

fn apply_compare(ctx: &mut dyn GraphicsContext, target: GlEnum, func: Option<CompareFunction>) {
    match func {
        Some(f) => {
            ctx.tex_parameter_i(target, consts::TEXTURE_COMPARE_MODE, consts::COMPARE_REF_TO_TEXTURE as i32);
            ctx.tex_parameter_i(target, consts::TEXTURE_COMPARE_FUNC, f.gl() as i32);
        }
        None => ctx.tex_parameter_i(target, consts::TEXTURE_COMPARE_MODE, consts::NONE as i32),
    }
}

impl Engine {
    // ── Lookup ───────────────────────────────────────────────────────────

    pub fn texture(&self, handle: TextureHandle) -> Option<&InternalTexture> {
        self.textures.get(handle)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Every live texture in creation order.
    pub fn get_loaded_textures_cache(&self) -> Vec<TextureHandle> {
        self.textures.handles_in_creation_order()
    }

    /// Devices without WebGL2 need power-of-two sizes for mipmaps and wrapping.
    pub fn need_pot_textures(&self) -> bool {
        !self.caps.webgl2
    }

    pub fn texture_collisions(&self) -> u64 {
        self.texture_slots.collisions
    }

    fn adjusted_size(&self, width: u32, height: u32) -> (u32, u32) {
        let max = self.caps.max_texture_size.max(1);
        let (mut w, mut h) = (width.clamp(1, max), height.clamp(1, max));
        if self.need_pot_textures() {
            w = nearest_pot(w).min(max);
            h = nearest_pot(h).min(max);
        }
        (w, h)
    }

    pub fn retain_texture(&mut self, handle: TextureHandle) -> bool {
        match self.textures.get_mut(handle) {
            Some(t) => {
                t.references += 1;
                true
            }
            None => false,
        }
    }

    // ── Unit assignment ──────────────────────────────────────────────────

    pub(crate) fn reset_texture_slots(&mut self) {
        for (_, tex) in self.textures.iter_mut() {
            tex.designated_slot = None;
            tex.prev_bound = None;
            tex.next_bound = None;
        }
        let units = self.caps.max_combined_texture_image_units;
        let slots = &mut self.texture_slots;
        slots.bound.clear();
        slots.first = None;
        slots.last = None;
        slots.free = (0..units).collect();
    }

    fn link_bound(&mut self, prev: Option<TextureHandle>, next: Option<TextureHandle>) {
        match prev.and_then(|p| self.textures.get_mut(p)) {
            Some(t) => t.next_bound = next,
            None => self.texture_slots.first = next,
        }
        match next.and_then(|n| self.textures.get_mut(n)) {
            Some(t) => t.prev_bound = prev,
            None => self.texture_slots.last = prev,
        }
    }

    fn unlink_bound(&mut self, handle: TextureHandle) {
        let Some(tex) = self.textures.get_mut(handle) else {
            return;
        };
        let (prev, next) = (tex.prev_bound.take(), tex.next_bound.take());
        let listed = prev.is_some() || next.is_some() || self.texture_slots.first == Some(handle);
        if listed {
            self.link_bound(prev, next);
        }
    }

    fn push_bound_on_top(&mut self, handle: TextureHandle) {
        let last = self.texture_slots.last;
        self.link_bound(last, Some(handle));
        self.link_bound(Some(handle), None);
    }

    fn move_bound_texture_on_top(&mut self, handle: TextureHandle) {
        if self.options.disable_texture_binding_optimization || self.texture_slots.last == Some(handle) {
            return;
        }
        self.unlink_bound(handle);
        self.push_bound_on_top(handle);
    }

    /// Give up the unit `handle` occupies. Returns the freed unit.
    fn remove_designated_slot(&mut self, handle: TextureHandle) -> Option<u32> {
        let slot = self.textures.get_mut(handle)?.designated_slot.take()?;
        if self.texture_slots.bound.get(&slot) == Some(&handle) {
            self.texture_slots.bound.remove(&slot);
        }
        if self.options.disable_texture_binding_optimization {
            return None;
        }
        self.unlink_bound(handle);
        if !self.texture_slots.free.contains(&slot) {
            self.texture_slots.free.push(slot);
        }
        Some(slot)
    }

    /// Unit to bind `handle` on when a sampler asks for `channel`.
    fn correct_texture_channel(&mut self, channel: u32, handle: TextureHandle) -> u32 {
        let designated = self.textures.get(handle).and_then(|t| t.designated_slot);
        if self.options.disable_texture_binding_optimization {
            if designated.is_some_and(|d| d != channel) {
                self.texture_slots.collisions += 1;
            }
            return channel;
        }
        match designated {
            Some(slot) => slot,
            None => {
                if let Some(&free) = self.texture_slots.free.first() {
                    return free;
                }
                self.texture_slots.collisions += 1;
                self.texture_slots
                    .first
                    .and_then(|oldest| self.remove_designated_slot(oldest))
                    .unwrap_or(channel)
            }
        }
    }

    /// Bind `handle` on `channel`, evicting the previous occupant.
    fn bind_texture_to_channel(&mut self, channel: u32, handle: TextureHandle) -> bool {
        let Some(tex) = self.textures.get(handle) else {
            return false;
        };
        let (target, name, designated) = (tex.target(), tex.name, tex.designated_slot);
        if self.texture_slots.bound.get(&channel) == Some(&handle) {
            self.move_bound_texture_on_top(handle);
            return false;
        }
        if let Some(current) = self.texture_slots.bound.get(&channel).copied() {
            self.remove_designated_slot(current);
        }
        if designated.is_some_and(|d| d != channel) {
            self.remove_designated_slot(handle);
        }
        let issued = self.state.bind_texture(self.ctx.as_mut(), channel, target, name);
        self.texture_slots.bound.insert(channel, handle);
        if let Some(tex) = self.textures.get_mut(handle) {
            tex.designated_slot = Some(channel);
        }
        if !self.options.disable_texture_binding_optimization {
            self.texture_slots.free.retain(|s| *s != channel);
            self.push_bound_on_top(handle);
        }
        issued
    }

    fn unbind_channel(&mut self, channel: u32) {
        if let Some(current) = self.texture_slots.bound.get(&channel).copied() {
            let target = self.textures.get(current).map_or(consts::TEXTURE_2D, |t| t.target());
            self.remove_designated_slot(current);
            self.state.bind_texture(self.ctx.as_mut(), channel, target, 0);
        }
    }

    /// Bind `texture` for the sampler `sampler` of `effect`. `None` or a texture
    /// that is not ready unbinds the sampler's unit.
    pub fn set_texture(&mut self, effect: EffectHandle, sampler: &str, texture: Option<TextureHandle>) {
        if !self.can_issue() {
            return;
        }
        let Some((slot, program)) = self
            .effects
            .get(effect)
            .and_then(|e| e.samplers.get(sampler).map(|s| (*s, e.program)))
        else {
            return;
        };
        let usable = texture.filter(|h| self.textures.get(*h).is_some_and(|t| t.is_ready && t.name != 0));
        let Some(handle) = usable else {
            self.unbind_channel(slot.unit);
            return;
        };
        let channel = self.correct_texture_channel(slot.unit, handle);
        self.bind_texture_to_channel(channel, handle);
        if channel != slot.channel {
            self.state.use_program(self.ctx.as_mut(), program);
            self.ctx.uniform1i(slot.location, channel as i32);
            if let Some(s) = self.effects.get_mut(effect).and_then(|e| e.samplers.get_mut(sampler)) {
                s.channel = channel;
            }
        }
    }

    /// Bind a sampler array on consecutive units starting at the sampler's unit.
    pub fn set_texture_array(&mut self, effect: EffectHandle, sampler: &str, textures: &[TextureHandle]) {
        if !self.can_issue() {
            return;
        }
        let Some((slot, program)) = self
            .effects
            .get(effect)
            .and_then(|e| e.samplers.get(sampler).map(|s| (*s, e.program)))
        else {
            return;
        };
        let units: Vec<i32> = (0..textures.len() as u32).map(|i| (slot.unit + i) as i32).collect();
        self.state.use_program(self.ctx.as_mut(), program);
        self.ctx.uniform1iv(slot.location, &units);
        for (unit, handle) in units.iter().zip(textures) {
            self.bind_texture_to_channel(*unit as u32, *handle);
        }
    }

    /// Unbind 2D and cube textures from every unit.
    pub fn unbind_all_textures(&mut self) {
        if !self.can_issue() {
            return;
        }
        let ctx = self.ctx.as_mut();
        for unit in 0..self.caps.max_combined_texture_image_units {
            self.state.bind_texture(ctx, unit, consts::TEXTURE_2D, 0);
            self.state.bind_texture(ctx, unit, consts::TEXTURE_CUBE_MAP, 0);
        }
        self.reset_texture_slots();
    }

    // ── Upload ───────────────────────────────────────────────────────────

    /// Bind `handle` on its unit (or the active one), run `f`, then unbind.
    fn with_texture_bound(&mut self, handle: TextureHandle, f: impl FnOnce(&mut dyn GraphicsContext, GlEnum)) -> bool {
        if !self.can_issue() {
            return false;
        }
        let Some(tex) = self.textures.get(handle) else {
            return false;
        };
        let (target, name, slot) = (tex.target(), tex.name, tex.designated_slot);
        if name == 0 {
            return false;
        }
        let unit = slot.unwrap_or(self.state.bindings.active_unit.unwrap_or(0));
        if let Some(other) = self.texture_slots.bound.get(&unit).copied().filter(|o| *o != handle) {
            self.remove_designated_slot(other);
        }
        let ctx = self.ctx.as_mut();
        self.state.bind_texture(ctx, unit, target, name);
        f(ctx, target);
        self.state.bind_texture(ctx, unit, target, 0);
        self.remove_designated_slot(handle);
        true
    }

    /// Issue storage, retained pixels and sampling state for `handle`.
    fn upload_texture(&mut self, handle: TextureHandle, premultiply_alpha: bool) -> bool {
        let webgl2 = self.caps.webgl2;
        let Some(tex) = self.textures.get(handle) else {
            return false;
        };
        if tex.width == 0 || tex.height == 0 {
            return true;
        }
        let (internal_format, format, data_type) = tex.gl_formats(webgl2);
        let faces = tex.face_count();
        let (width, height, invert_y, mode, mipmaps, compare) =
            (tex.width, tex.height, tex.invert_y, tex.sampling_mode, tex.generate_mipmaps, tex.compare_function);
        let has_pixels = tex.retained.is_some();
        let retained = tex.retained.clone().unwrap_or_default();
        let is_cube = tex.is_cube;

        self.with_texture_bound(handle, |ctx, target| {
            ctx.pixel_store(consts::UNPACK_FLIP_Y_WEBGL, invert_y as i32);
            ctx.pixel_store(consts::UNPACK_PREMULTIPLY_ALPHA_WEBGL, premultiply_alpha as i32);
            for face in 0..faces {
                let face_target = if is_cube { consts::TEXTURE_CUBE_MAP_POSITIVE_X + face as u32 } else { target };
                let desc = TexImageDesc {
                    target: face_target,
                    level: 0,
                    internal_format,
                    width,
                    height,
                    depth: 1,
                    format,
                    data_type,
                };
                ctx.tex_image(desc, retained.get(face).map(|d| &d[..]));
            }
            apply_sampling(ctx, target, mode, mipmaps);
            if is_cube {
                ctx.tex_parameter_i(target, consts::TEXTURE_WRAP_S, consts::CLAMP_TO_EDGE as i32);
                ctx.tex_parameter_i(target, consts::TEXTURE_WRAP_T, consts::CLAMP_TO_EDGE as i32);
            }
            if compare.is_some() {
                apply_compare(ctx, target, compare);
            }
            if mipmaps && has_pixels {
                ctx.generate_mipmap(target);
            }
        })
    }

    /// Create the framebuffer (and depth/stencil renderbuffer) of a render target.
    fn create_texture_framebuffer(&mut self, handle: TextureHandle) -> bool {
        let Some(tex) = self.textures.get(handle) else {
            return false;
        };
        let (name, width, height, samples) = (tex.name, tex.width, tex.height, tex.samples);
        let (depth, stencil, is_depth_texture) = (
            tex.generate_depth_buffer,
            tex.generate_stencil_buffer,
            tex.source == TextureSource::DepthStencil,
        );
        let color_target = if tex.is_cube { consts::TEXTURE_CUBE_MAP_POSITIVE_X } else { consts::TEXTURE_2D };

        let Some(framebuffer) = self.ctx.create_framebuffer() else {
            log::error!("failed to allocate framebuffer for {width}x{height} render target");
            return false;
        };
        let previous = self.state.bindings.framebuffer.unwrap_or(0);
        let ctx = self.ctx.as_mut();
        self.state.bind_framebuffer(ctx, framebuffer);
        let mut renderbuffer = 0;
        if is_depth_texture {
            let attachment = if stencil { consts::DEPTH_STENCIL_ATTACHMENT } else { consts::DEPTH_ATTACHMENT };
            ctx.framebuffer_texture_2d(consts::FRAMEBUFFER, attachment, consts::TEXTURE_2D, name, 0);
        } else {
            ctx.framebuffer_texture_2d(consts::FRAMEBUFFER, consts::COLOR_ATTACHMENT0, color_target, name, 0);
            if depth || stencil {
                if let Some(rb) = ctx.create_renderbuffer() {
                    let (format, attachment) = match (depth, stencil) {
                        (true, true) => (consts::DEPTH24_STENCIL8, consts::DEPTH_STENCIL_ATTACHMENT),
                        (false, true) => (consts::STENCIL_INDEX8, consts::STENCIL_ATTACHMENT),
                        _ => (consts::DEPTH_COMPONENT16, consts::DEPTH_ATTACHMENT),
                    };
                    ctx.renderbuffer_storage(format, samples, width, height);
                    ctx.framebuffer_renderbuffer(consts::FRAMEBUFFER, attachment, rb);
                    renderbuffer = rb;
                } else {
                    log::error!("failed to allocate depth/stencil renderbuffer");
                }
            }
        }
        self.state.bind_framebuffer(ctx, previous);
        if let Some(tex) = self.textures.get_mut(handle) {
            tex.framebuffer = framebuffer;
            tex.depth_stencil_buffer = renderbuffer;
        }
        true
    }

    /// Create GPU objects for a texture record from its description.
    pub(crate) fn allocate_texture(&mut self, handle: TextureHandle) -> bool {
        if !self.can_issue() {
            return false;
        }
        let Some(has_framebuffer) = self.textures.get(handle).map(|t| t.source.has_framebuffer()) else {
            return false;
        };
        let Some(name) = self.ctx.create_texture() else {
            log::error!("failed to allocate texture {handle:?}");
            return false;
        };
        if let Some(tex) = self.textures.get_mut(handle) {
            tex.name = name;
        }
        if !self.upload_texture(handle, false) {
            return false;
        }
        if has_framebuffer && !self.create_texture_framebuffer(handle) {
            return false;
        }
        if !self.handles_context_loss() {
            if let Some(tex) = self.textures.get_mut(handle) {
                tex.retained = None;
            }
        }
        true
    }

    /// Insert a record and create its GPU objects. On allocation failure the
    /// record is dropped and `None` returned.
    fn insert_texture(&mut self, texture: InternalTexture) -> Option<TextureHandle> {
        let handle = self.textures.insert(texture);
        if self.can_issue() && !self.allocate_texture(handle) {
            self.release_texture_storage(handle);
            return None;
        }
        Some(handle)
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Load a texture from a file path, `file://` or `data:` URL.
    ///
    /// A live texture with the same URL and sampling options is shared. The
    /// callbacks run on the render thread from
    /// [`Engine::process_pending_loads`], or immediately when the shared
    /// texture is already loaded.
    pub fn create_texture(
        &mut self,
        url: &str,
        options: TextureCreationOptions,
        on_load: Option<TextureLoadedCallback>,
        on_error: Option<TextureErrorCallback>,
    ) -> Option<TextureHandle> {
        let cached = self.textures.iter().find_map(|(h, t)| {
            (t.url() == Some(url)
                && t.generate_mipmaps == options.generate_mipmaps
                && t.invert_y == options.invert_y
                && t.sampling_mode == options.sampling_mode)
                .then_some(h)
        });
        if let Some(handle) = cached {
            let ready = self.textures.get_mut(handle).map(|t| {
                t.references += 1;
                t.is_ready
            });
            if ready == Some(true) {
                if let Some(cb) = on_load {
                    cb(self, handle);
                }
            } else if let Some(tex) = self.textures.get_mut(handle) {
                tex.on_loaded.extend(on_load);
                tex.on_error.extend(on_error);
            }
            return Some(handle);
        }

        let mut texture = InternalTexture::new(TextureSource::Url(url.to_string()), 0, 0, &options);
        texture.on_loaded.extend(on_load);
        texture.on_error.extend(on_error);
        let handle = self.insert_texture(texture)?;
        let token = self.loader.request_texture(url, handle);
        if let Some(tex) = self.textures.get_mut(handle) {
            tex.load_token = Some(token);
        }
        Some(handle)
    }

    /// Cancel a pending URL load. Its callbacks will not run.
    pub fn cancel_texture_load(&mut self, handle: TextureHandle) -> bool {
        let Some(tex) = self.textures.get_mut(handle) else {
            return false;
        };
        let Some(token) = tex.load_token.take() else {
            return false;
        };
        token.cancel();
        tex.on_loaded.clear();
        tex.on_error.clear();
        true
    }

    pub(crate) fn complete_texture_load(&mut self, handle: TextureHandle, result: Result<RgbaImage, String>) {
        let Some(tex) = self.textures.get_mut(handle) else {
            return;
        };
        tex.load_token = None;
        let image = match result {
            Ok(img) => img,
            Err(e) => {
                log::error!("texture '{}' failed to load: {e}", tex.url().unwrap_or("?"));
                tex.on_loaded.clear();
                let callbacks = std::mem::take(&mut tex.on_error);
                for cb in callbacks {
                    cb(self, &e);
                }
                return;
            }
        };

        let (base_w, base_h) = image.dimensions();
        let (w, h) = self.adjusted_size(base_w, base_h);
        let pixels = if (w, h) != (base_w, base_h) {
            log::debug!("resizing texture from {base_w}x{base_h} to {w}x{h}");
            imageops::resize(&image, w, h, FilterType::Triangle).into_raw()
        } else {
            image.into_raw()
        };
        let Some(tex) = self.textures.get_mut(handle) else {
            return;
        };
        tex.base_width = base_w;
        tex.base_height = base_h;
        tex.width = w;
        tex.height = h;
        tex.format = TextureFormat::Rgba;
        tex.texture_type = TextureType::UnsignedByte;
        tex.retained = Some(vec![Arc::from(pixels)]);
        tex.is_ready = true;

        if self.can_issue() {
            self.upload_texture(handle, false);
            if !self.handles_context_loss() {
                if let Some(tex) = self.textures.get_mut(handle) {
                    tex.retained = None;
                }
            }
        }
        let callbacks = self
            .textures
            .get_mut(handle)
            .map(|t| {
                t.on_error.clear();
                std::mem::take(&mut t.on_loaded)
            })
            .unwrap_or_default();
        for cb in callbacks {
            cb(self, handle);
        }
    }

    /// Texture from caller-supplied pixels (`None` allocates storage only).
    pub fn create_raw_texture(
        &mut self,
        data: Option<&[u8]>,
        width: u32,
        height: u32,
        options: TextureCreationOptions,
    ) -> Option<TextureHandle> {
        let mut texture = InternalTexture::new(TextureSource::Raw, width, height, &options);
        if let Some(d) = data {
            if d.len() < texture.byte_len() {
                log::error!("raw texture data too short: {} < {}", d.len(), texture.byte_len());
                return None;
            }
            texture.retained = Some(vec![Arc::from(d)]);
        }
        texture.is_ready = true;
        self.insert_texture(texture)
    }

    /// Texture from `f32` texels. Stored as `Float` when the device samples
    /// float textures, otherwise packed to half floats.
    pub fn create_raw_float_texture(
        &mut self,
        data: &[f32],
        width: u32,
        height: u32,
        format: TextureFormat,
        sampling_mode: SamplingMode,
    ) -> Option<TextureHandle> {
        let expected = width as usize * height as usize * format.channel_count();
        if data.len() < expected {
            log::error!("raw float texture data too short: {} < {expected}", data.len());
            return None;
        }
        let data = &data[..expected];
        let (texture_type, bytes) = if self.caps.texture_float {
            (TextureType::Float, bytemuck::cast_slice::<f32, u8>(data).to_vec())
        } else if self.caps.texture_half_float {
            self.caps.record_fallback(CapabilityFallback::FloatTextureAsHalfFloat);
            let halves: Vec<half::f16> = data.iter().map(|&v| half::f16::from_f32(v)).collect();
            (TextureType::HalfFloat, bytemuck::cast_slice::<half::f16, u8>(&halves).to_vec())
        } else {
            log::error!("device samples neither float nor half-float textures");
            return None;
        };
        let options = TextureCreationOptions { sampling_mode, format, texture_type, ..Default::default() };
        self.create_raw_texture(Some(&bytes), width, height, options)
    }

    pub fn update_raw_texture(&mut self, handle: TextureHandle, data: &[u8], format: TextureFormat, invert_y: bool) -> bool {
        let Some(tex) = self.textures.get_mut(handle) else {
            return false;
        };
        tex.format = format;
        tex.invert_y = invert_y;
        if data.len() < tex.byte_len() {
            log::error!("raw texture update too short: {} < {}", data.len(), tex.byte_len());
            return false;
        }
        tex.retained = Some(vec![Arc::from(data)]);
        tex.is_ready = true;
        let uploaded = self.upload_texture(handle, false);
        if !self.handles_context_loss() && uploaded {
            if let Some(tex) = self.textures.get_mut(handle) {
                tex.retained = None;
            }
        }
        uploaded || !self.can_issue()
    }

    /// Storage for CPU-drawn RGBA8 content; becomes ready on first update.
    pub fn create_dynamic_texture(
        &mut self,
        width: u32,
        height: u32,
        generate_mipmaps: bool,
        sampling_mode: SamplingMode,
    ) -> Option<TextureHandle> {
        let (w, h) = self.adjusted_size(width, height);
        let options = TextureCreationOptions { generate_mipmaps, sampling_mode, ..Default::default() };
        let mut texture = InternalTexture::new(TextureSource::Dynamic, w, h, &options);
        texture.base_width = width;
        texture.base_height = height;
        self.insert_texture(texture)
    }

    /// Upload RGBA8 `pixels` of the texture's size.
    pub fn update_dynamic_texture(&mut self, handle: TextureHandle, pixels: &[u8], invert_y: bool, premultiply_alpha: bool) -> bool {
        let Some(tex) = self.textures.get_mut(handle) else {
            return false;
        };
        if pixels.len() < tex.byte_len() {
            log::error!("dynamic texture update too short: {} < {}", pixels.len(), tex.byte_len());
            return false;
        }
        tex.invert_y = invert_y;
        tex.retained = Some(vec![Arc::from(pixels)]);
        tex.is_ready = true;
        let uploaded = self.upload_texture(handle, premultiply_alpha);
        if !self.handles_context_loss() && uploaded {
            if let Some(tex) = self.textures.get_mut(handle) {
                tex.retained = None;
            }
        }
        uploaded || !self.can_issue()
    }

    /// Downgrade float render-target types the device cannot render to.
    fn render_target_type(&mut self, requested: TextureType) -> TextureType {
        let mut ty = requested;
        if ty == TextureType::Float && !(self.caps.texture_float && self.caps.color_buffer_float) {
            self.caps.record_fallback(CapabilityFallback::FloatTextureAsHalfFloat);
            ty = TextureType::HalfFloat;
        }
        if ty == TextureType::HalfFloat && !(self.caps.texture_half_float && self.caps.color_buffer_float) {
            self.caps.record_fallback(CapabilityFallback::HalfFloatTextureAsUnsignedByte);
            ty = TextureType::UnsignedByte;
        }
        ty
    }

    fn render_target_options(&mut self, mut options: TextureCreationOptions) -> TextureCreationOptions {
        options.texture_type = self.render_target_type(options.texture_type);
        if options.texture_type == TextureType::Float && !self.caps.texture_float_linear {
            options.sampling_mode = SamplingMode::NearestNearest;
        }
        options.samples = self.caps.clamp_samples(options.samples);
        options
    }

    pub fn create_render_target_texture(&mut self, width: u32, height: u32, options: TextureCreationOptions) -> Option<TextureHandle> {
        let options = self.render_target_options(options);
        let max = self.caps.max_render_texture_size.max(1);
        let mut texture = InternalTexture::new(TextureSource::RenderTarget, width.clamp(1, max), height.clamp(1, max), &options);
        texture.base_width = width;
        texture.base_height = height;
        texture.is_ready = true;
        self.insert_texture(texture)
    }

    pub fn create_render_target_cube_texture(&mut self, size: u32, options: TextureCreationOptions) -> Option<TextureHandle> {
        let options = self.render_target_options(options);
        let size = size.clamp(1, self.caps.max_cube_texture_size.max(1));
        let mut texture = InternalTexture::new(TextureSource::CubeRenderTarget, size, size, &options);
        texture.is_ready = true;
        self.insert_texture(texture)
    }

    /// Cube texture from six faces (+X, -X, +Y, -Y, +Z, -Z).
    pub fn create_raw_cube_texture(
        &mut self,
        faces: Option<&[Vec<u8>]>,
        size: u32,
        options: TextureCreationOptions,
    ) -> Option<TextureHandle> {
        let mut texture = InternalTexture::new(TextureSource::CubeRaw, size, size, &options);
        if let Some(faces) = faces {
            if faces.len() != CUBE_FACES || faces.iter().any(|f| f.len() < texture.byte_len()) {
                log::error!("raw cube texture needs {CUBE_FACES} faces of {} bytes", texture.byte_len());
                return None;
            }
            texture.retained = Some(faces.iter().map(|f| Arc::from(f.as_slice())).collect());
        }
        texture.is_ready = true;
        self.insert_texture(texture)
    }

    /// Depth (optionally depth-stencil) texture with its own framebuffer.
    /// `compare_function` enables hardware shadow comparison.
    pub fn create_depth_stencil_texture(
        &mut self,
        width: u32,
        height: u32,
        compare_function: Option<CompareFunction>,
        generate_stencil: bool,
    ) -> Option<TextureHandle> {
        if !self.caps.depth_texture {
            log::warn!("depth textures are not supported on this device");
            return None;
        }
        let options = TextureCreationOptions {
            sampling_mode: if compare_function.is_some() {
                SamplingMode::LinearLinear
            } else {
                SamplingMode::NearestNearest
            },
            compare_function,
            generate_depth_buffer: true,
            generate_stencil_buffer: generate_stencil,
            ..Default::default()
        };
        let mut texture = InternalTexture::new(TextureSource::DepthStencil, width.max(1), height.max(1), &options);
        texture.is_ready = true;
        self.insert_texture(texture)
    }

    // ── Sampling state ───────────────────────────────────────────────────

    pub fn update_texture_sampling_mode(&mut self, mode: SamplingMode, handle: TextureHandle) {
        let Some(tex) = self.textures.get_mut(handle) else {
            return;
        };
        tex.sampling_mode = mode;
        let mipmaps = tex.generate_mipmaps;
        self.with_texture_bound(handle, |ctx, target| apply_sampling(ctx, target, mode, mipmaps));
    }

    pub fn update_texture_comparison_function(&mut self, handle: TextureHandle, func: Option<CompareFunction>) {
        let Some(tex) = self.textures.get_mut(handle) else {
            return;
        };
        tex.compare_function = func;
        self.with_texture_bound(handle, |ctx, target| apply_compare(ctx, target, func));
    }

    /// Set anisotropic filtering, clamped to the device maximum.
    pub fn update_texture_anisotropy(&mut self, handle: TextureHandle, level: u32) {
        let level = self.caps.clamp_anisotropy(level);
        if level == 0 {
            return;
        }
        self.with_texture_bound(handle, |ctx, target| {
            ctx.tex_parameter_f(target, consts::TEXTURE_MAX_ANISOTROPY_EXT, level as f32)
        });
    }

    pub fn generate_mip_maps_for_cubemap(&mut self, handle: TextureHandle) {
        if self.textures.get(handle).is_some_and(|t| t.is_cube) {
            self.with_texture_bound(handle, |ctx, target| ctx.generate_mipmap(target));
        }
    }

    // ── Release ──────────────────────────────────────────────────────────

    /// Drop one reference; storage is freed when none remain.
    pub fn release_texture(&mut self, handle: impl Into<Option<TextureHandle>>) -> bool {
        let Some(h) = handle.into() else {
            return false;
        };
        let Some(tex) = self.textures.get_mut(h) else {
            return false;
        };
        tex.references = tex.references.saturating_sub(1);
        if tex.references > 0 {
            return false;
        }
        self.release_texture_storage(h);
        true
    }

    pub(crate) fn release_texture_storage(&mut self, handle: TextureHandle) {
        self.remove_designated_slot(handle);
        self.unlink_bound(handle);
        let Some(tex) = self.textures.remove(handle) else {
            return;
        };
        if let Some(token) = &tex.load_token {
            token.cancel();
        }
        self.texture_slots.bound.retain(|_, h| *h != handle);
        self.render_targets.retain(|rt| rt.texture != handle);
        if self.can_issue() {
            if tex.depth_stencil_buffer != 0 {
                self.ctx.delete_renderbuffer(tex.depth_stencil_buffer);
            }
            if tex.framebuffer != 0 {
                if self.state.bindings.framebuffer == Some(tex.framebuffer) {
                    self.state.bind_framebuffer(self.ctx.as_mut(), 0);
                }
                self.ctx.delete_framebuffer(tex.framebuffer);
            }
            if tex.name != 0 {
                self.ctx.delete_texture(tex.name);
            }
        }
        self.state.forget_texture(tex.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::gl::{GlCall, HeadlessCapabilities, HeadlessContext};

    fn engine() -> (Engine, crate::gl::HeadlessHandle) {
        Engine::headless(64, 64, EngineOptions::default()).unwrap()
    }

    #[test]
    fn nearest_pot_rounds_to_closest() {
        assert_eq!(nearest_pot(100), 128);
        assert_eq!(nearest_pot(90), 64);
        assert_eq!(nearest_pot(1), 1);
        assert!(is_pot(256));
        assert!(!is_pot(0));
    }

    #[test]
    fn raw_texture_rejects_short_data() {
        let (mut engine, _h) = engine();
        assert!(engine.create_raw_texture(Some(&[0u8; 3]), 1, 1, TextureCreationOptions::default()).is_none());
        assert!(engine.create_raw_texture(Some(&[0u8; 4]), 1, 1, TextureCreationOptions::default()).is_some());
    }

    #[test]
    fn render_target_gets_framebuffer_and_depth() {
        let (mut engine, handle) = engine();
        let rt = engine.create_render_target_texture(32, 16, TextureCreationOptions::default()).unwrap();
        let tex = engine.texture(rt).unwrap();
        assert_ne!(tex.framebuffer(), 0);
        assert_eq!(handle.count(|c| matches!(c, GlCall::RenderbufferStorage { .. })), 1);
    }

    #[test]
    fn float_render_target_falls_back_on_minimal_device() {
        let ctx = HeadlessContext::with_capabilities(8, 8, HeadlessCapabilities::minimal());
        let mut engine = Engine::new(Box::new(ctx), EngineOptions::default()).unwrap();
        let options = TextureCreationOptions { texture_type: TextureType::Float, ..Default::default() };
        let rt = engine.create_render_target_texture(8, 8, options).unwrap();
        assert_eq!(engine.texture(rt).unwrap().texture_type, TextureType::UnsignedByte);
        assert!(engine.get_caps().has_fallback(&CapabilityFallback::FloatTextureAsHalfFloat));
        assert!(engine.get_caps().has_fallback(&CapabilityFallback::HalfFloatTextureAsUnsignedByte));
    }

    #[test]
    fn float_texels_pack_to_half_without_float_support() {
        let (mut engine, _h) = engine();
        let t = engine
            .create_raw_float_texture(&[0.5, 1.0], 1, 1, TextureFormat::Rg, SamplingMode::Nearest)
            .unwrap();
        assert_eq!(engine.texture(t).unwrap().texture_type, TextureType::Float);

        let ctx = HeadlessContext::with_capabilities(8, 8, HeadlessCapabilities::minimal());
        let mut minimal = Engine::new(Box::new(ctx), EngineOptions::default()).unwrap();
        let result = minimal.create_raw_float_texture(&[0.5, 1.0], 1, 1, TextureFormat::Rg, SamplingMode::Nearest);
        let caps = minimal.get_caps();
        match result {
            Some(t) => {
                assert_eq!(minimal.texture(t).unwrap().texture_type, TextureType::HalfFloat);
                assert!(caps.has_fallback(&CapabilityFallback::FloatTextureAsHalfFloat));
            }
            None => assert!(!caps.texture_half_float && !caps.texture_float),
        }
        assert!(engine.create_raw_float_texture(&[0.5], 1, 1, TextureFormat::Rg, SamplingMode::Nearest).is_none());
    }

    #[test]
    fn release_twice_is_noop() {
        let (mut engine, handle) = engine();
        let t = engine.create_dynamic_texture(4, 4, false, SamplingMode::Bilinear).unwrap();
        let name = engine.texture(t).unwrap().gl_name();
        assert!(engine.release_texture(t));
        assert!(!engine.release_texture(t));
        assert!(!engine.release_texture(None));
        assert!(!handle.is_texture_alive(name));
        assert_eq!(engine.texture_count(), 0);
    }

    #[test]
    fn allocation_failure_yields_none() {
        let (mut engine, handle) = engine();
        handle.fail_next_allocations(1);
        assert!(engine.create_raw_texture(None, 4, 4, TextureCreationOptions::default()).is_none());
        assert_eq!(engine.texture_count(), 0);
    }

    #[test]
    fn dynamic_texture_is_rounded_to_pot_without_webgl2() {
        let ctx = HeadlessContext::with_capabilities(8, 8, HeadlessCapabilities::minimal());
        let mut engine = Engine::new(Box::new(ctx), EngineOptions::default()).unwrap();
        assert!(engine.need_pot_textures());
        let t = engine.create_dynamic_texture(100, 60, false, SamplingMode::Bilinear).unwrap();
        let tex = engine.texture(t).unwrap();
        assert_eq!((tex.width, tex.height), (128, 64));
        assert_eq!((tex.base_width, tex.base_height), (100, 60));
    }
}
