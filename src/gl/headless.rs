//! Call-recording [`GraphicsContext`] with no GPU behind it.
//!
//! `HeadlessContext` behaves like a permissive GL driver: it allocates names,
//! "compiles" shaders with a structural check, links programs by matching
//! declarations and answers capability queries from [`HeadlessCapabilities`].
//! Every call is appended to a log that callers inspect through a cloned
//! [`HeadlessHandle`], which also drives simulated failures (context loss,
//! out-of-memory, compile/link errors).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::consts::{self, GlEnum};
use super::{GlName, GraphicsContext, TexImageDesc, UniformLocation, VertexAttribPointer};

/// One recorded context call.
#[derive(Clone, Debug, PartialEq)]
pub enum GlCall {
    Enable(GlEnum),
    Disable(GlEnum),
    DepthFunc(GlEnum),
    DepthMask(bool),
    ColorMask([bool; 4]),
    CullFace(GlEnum),
    FrontFace(GlEnum),
    PolygonOffset(f32, f32),
    BlendFuncSeparate([GlEnum; 4]),
    BlendEquationSeparate(GlEnum, GlEnum),
    BlendColor([f32; 4]),
    StencilFunc(GlEnum, i32, u32),
    StencilMask(u32),
    StencilOp(GlEnum, GlEnum, GlEnum),
    Viewport([i32; 4]),
    Scissor([i32; 4]),
    ClearColor([f32; 4]),
    ClearDepth(f32),
    ClearStencil(i32),
    Clear(u32),
    PixelStore(GlEnum, i32),
    Flush,

    CreateBuffer(GlName),
    DeleteBuffer(GlName),
    BindBuffer { target: GlEnum, buffer: GlName },
    BindBufferBase { target: GlEnum, index: u32, buffer: GlName },
    BufferData { target: GlEnum, len: usize, usage: GlEnum },
    BufferSubData { target: GlEnum, offset: usize, len: usize },
    VertexAttribPointer(VertexAttribPointer),
    EnableVertexAttribArray(u32),
    DisableVertexAttribArray(u32),
    VertexAttribDivisor(u32, u32),
    CreateVertexArray(GlName),
    DeleteVertexArray(GlName),
    BindVertexArray(GlName),

    CreateTexture(GlName),
    DeleteTexture(GlName),
    ActiveTexture(u32),
    BindTexture { target: GlEnum, texture: GlName },
    TexImage(TexImageDesc),
    TexParameterI(GlEnum, GlEnum, i32),
    TexParameterF(GlEnum, GlEnum, f32),
    GenerateMipmap(GlEnum),

    CreateFramebuffer(GlName),
    DeleteFramebuffer(GlName),
    BindFramebuffer { target: GlEnum, framebuffer: GlName },
    FramebufferTexture2D { attachment: GlEnum, tex_target: GlEnum, texture: GlName, level: i32 },
    CreateRenderbuffer(GlName),
    DeleteRenderbuffer(GlName),
    RenderbufferStorage { format: GlEnum, samples: u32, width: u32, height: u32 },
    FramebufferRenderbuffer { attachment: GlEnum, renderbuffer: GlName },
    ReadPixels { x: i32, y: i32, width: u32, height: u32 },

    CreateShader { kind: GlEnum, shader: GlName },
    CompileShader(GlName),
    DeleteShader(GlName),
    CreateProgram(GlName),
    LinkProgram(GlName),
    DeleteProgram(GlName),
    UseProgram(GlName),
    UniformBlockBinding { program: GlName, block_index: u32, binding: u32 },
    TransformFeedbackVaryings { program: GlName, count: usize },
    Uniform { location: UniformLocation, values: Vec<f32> },

    DrawArrays { mode: GlEnum, first: i32, count: i32, instances: i32 },
    DrawElements { mode: GlEnum, count: i32, index_type: GlEnum, offset: usize, instances: i32 },

    CreateQuery(GlName),
    DeleteQuery(GlName),
    BeginQuery { target: GlEnum, query: GlName },
    EndQuery(GlEnum),
    CreateTransformFeedback(GlName),
    DeleteTransformFeedback(GlName),
    BindTransformFeedback(GlName),
    BeginTransformFeedback(GlEnum),
    EndTransformFeedback,
}

impl GlCall {
    pub fn is_bind_buffer(&self) -> bool {
        matches!(self, GlCall::BindBuffer { .. })
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, GlCall::DrawArrays { .. } | GlCall::DrawElements { .. })
    }
}

/// Capabilities reported by the headless driver.
#[derive(Clone, Debug)]
pub struct HeadlessCapabilities {
    pub max_texture_size: i32,
    pub max_cube_texture_size: i32,
    pub max_render_texture_size: i32,
    pub max_texture_image_units: i32,
    pub max_vertex_texture_image_units: i32,
    pub max_combined_texture_image_units: i32,
    pub max_vertex_attribs: i32,
    pub max_varying_vectors: i32,
    pub max_vertex_uniform_vectors: i32,
    pub max_fragment_uniform_vectors: i32,
    pub max_samples: i32,
    pub max_uniform_buffer_bindings: i32,
    pub extensions: Vec<String>,
}

impl Default for HeadlessCapabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 4096,
            max_cube_texture_size: 4096,
            max_render_texture_size: 4096,
            max_texture_image_units: 16,
            max_vertex_texture_image_units: 16,
            max_combined_texture_image_units: 32,
            max_vertex_attribs: 16,
            max_varying_vectors: 15,
            max_vertex_uniform_vectors: 1024,
            max_fragment_uniform_vectors: 1024,
            max_samples: 4,
            max_uniform_buffer_bindings: 24,
            extensions: [
                "WEBGL2",
                "EXT_color_buffer_float",
                "EXT_color_buffer_half_float",
                "OES_texture_float_linear",
                "EXT_texture_filter_anisotropic",
                "EXT_disjoint_timer_query_webgl2",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl HeadlessCapabilities {
    /// A WebGL1-class device: no VAO, uniform buffers, float render targets or
    /// multisampling.
    pub fn minimal() -> Self {
        Self {
            max_texture_size: 2048,
            max_cube_texture_size: 1024,
            max_render_texture_size: 2048,
            max_texture_image_units: 8,
            max_vertex_texture_image_units: 0,
            max_combined_texture_image_units: 8,
            max_samples: 1,
            max_uniform_buffer_bindings: 0,
            extensions: Vec::new(),
            ..Self::default()
        }
    }
}

type ShaderValidator = Box<dyn Fn(GlEnum, &str) -> Result<(), String>>;

struct ShaderObject {
    kind: GlEnum,
    source: String,
    compiled: bool,
    info_log: String,
}

#[derive(Default)]
struct ProgramObject {
    shaders: Vec<GlName>,
    linked: bool,
    info_log: String,
    attributes: Vec<String>,
    uniforms: Vec<String>,
    uniform_blocks: Vec<String>,
}

#[derive(Default)]
struct HeadlessState {
    calls: Vec<GlCall>,
    lost: bool,
    next_name: GlName,
    drawing_buffer: (u32, u32),
    capabilities: HeadlessCapabilities,
    clear_color: [f32; 4],

    buffers: HashMap<GlName, usize>,
    bound_buffers: HashMap<GlEnum, GlName>,
    textures: HashSet<GlName>,
    framebuffers: HashSet<GlName>,
    renderbuffers: HashSet<GlName>,
    vertex_arrays: HashSet<GlName>,
    queries: HashSet<GlName>,
    transform_feedbacks: HashSet<GlName>,
    shaders: HashMap<GlName, ShaderObject>,
    programs: HashMap<GlName, ProgramObject>,

    failing_allocations: usize,
    failing_shader_marker: Option<String>,
    failing_link_marker: Option<String>,
    validator: Option<ShaderValidator>,
}

impl HeadlessState {
    fn record(&mut self, call: GlCall) {
        if !self.lost {
            self.calls.push(call);
        }
    }

    fn allocate(&mut self) -> Option<GlName> {
        if self.lost {
            return None;
        }
        if self.failing_allocations > 0 {
            self.failing_allocations -= 1;
            return None;
        }
        self.next_name += 1;
        Some(self.next_name)
    }

    fn live_object_count(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.framebuffers.len()
            + self.renderbuffers.len()
            + self.vertex_arrays.len()
            + self.queries.len()
            + self.transform_feedbacks.len()
            + self.programs.len()
    }
}

/// Shared control surface over a [`HeadlessContext`].
#[derive(Clone, Default)]
pub struct HeadlessHandle {
    inner: Rc<RefCell<HeadlessState>>,
}

impl HeadlessHandle {
    pub fn calls(&self) -> Vec<GlCall> {
        self.inner.borrow().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<GlCall> {
        std::mem::take(&mut self.inner.borrow_mut().calls)
    }

    pub fn clear_calls(&self) {
        self.inner.borrow_mut().calls.clear();
    }

    pub fn count(&self, predicate: impl Fn(&GlCall) -> bool) -> usize {
        self.inner.borrow().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Drop every GPU object and start rejecting calls.
    pub fn lose_context(&self) {
        let mut s = self.inner.borrow_mut();
        s.lost = true;
        s.buffers.clear();
        s.bound_buffers.clear();
        s.textures.clear();
        s.framebuffers.clear();
        s.renderbuffers.clear();
        s.vertex_arrays.clear();
        s.queries.clear();
        s.transform_feedbacks.clear();
        s.shaders.clear();
        s.programs.clear();
    }

    pub fn restore_context(&self) {
        self.inner.borrow_mut().lost = false;
    }

    pub fn is_lost(&self) -> bool {
        self.inner.borrow().lost
    }

    pub fn fail_next_allocations(&self, count: usize) {
        self.inner.borrow_mut().failing_allocations = count;
    }

    /// Any shader whose source contains `marker` fails to compile.
    pub fn fail_shaders_containing(&self, marker: impl Into<String>) {
        self.inner.borrow_mut().failing_shader_marker = Some(marker.into());
    }

    /// Any program whose vertex or fragment source contains `marker` fails to link.
    pub fn fail_links_containing(&self, marker: impl Into<String>) {
        self.inner.borrow_mut().failing_link_marker = Some(marker.into());
    }

    pub fn clear_failures(&self) {
        let mut s = self.inner.borrow_mut();
        s.failing_allocations = 0;
        s.failing_shader_marker = None;
        s.failing_link_marker = None;
    }

    /// Install an extra compile-time check run after the structural one.
    pub fn set_shader_validator(&self, validator: impl Fn(GlEnum, &str) -> Result<(), String> + 'static) {
        self.inner.borrow_mut().validator = Some(Box::new(validator));
    }

    pub fn set_drawing_buffer_size(&self, width: u32, height: u32) {
        self.inner.borrow_mut().drawing_buffer = (width, height);
    }

    pub fn set_capabilities(&self, caps: HeadlessCapabilities) {
        self.inner.borrow_mut().capabilities = caps;
    }

    pub fn live_object_count(&self) -> usize {
        self.inner.borrow().live_object_count()
    }

    pub fn is_texture_alive(&self, texture: GlName) -> bool {
        self.inner.borrow().textures.contains(&texture)
    }

    pub fn is_buffer_alive(&self, buffer: GlName) -> bool {
        self.inner.borrow().buffers.contains_key(&buffer)
    }

    pub fn is_program_alive(&self, program: GlName) -> bool {
        self.inner.borrow().programs.contains_key(&program)
    }

    pub fn buffer_size(&self, buffer: GlName) -> Option<usize> {
        self.inner.borrow().buffers.get(&buffer).copied()
    }
}

/// Recording context; see the module docs.
pub struct HeadlessContext {
    handle: HeadlessHandle,
}

impl HeadlessContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capabilities(width, height, HeadlessCapabilities::default())
    }

    pub fn with_capabilities(width: u32, height: u32, capabilities: HeadlessCapabilities) -> Self {
        let handle = HeadlessHandle::default();
        {
            let mut s = handle.inner.borrow_mut();
            s.drawing_buffer = (width, height);
            s.capabilities = capabilities;
        }
        Self { handle }
    }

    pub fn handle(&self) -> HeadlessHandle {
        self.handle.clone()
    }

    fn state(&self) -> std::cell::RefMut<'_, HeadlessState> {
        self.handle.inner.borrow_mut()
    }

    fn record(&mut self, call: GlCall) {
        self.state().record(call);
    }

    fn uniform(&mut self, location: UniformLocation, values: Vec<f32>) {
        self.record(GlCall::Uniform { location, values });
    }
}

// ── Source scanning used by compile / link ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct Declaration {
    qualifier: String,
    ty: String,
    name: String,
}

fn parse_declaration(line: &str) -> Option<Declaration> {
    let mut line = line.trim();
    if !line.ends_with(';') {
        return None;
    }
    if line.starts_with("layout") {
        let close = line.find(')')?;
        line = line[close + 1..].trim();
    }
    let body = line.trim_end_matches(';');
    let tokens: Vec<&str> = body
        .split_whitespace()
        .filter(|t| !matches!(*t, "flat" | "smooth" | "highp" | "mediump" | "lowp" | "centroid"))
        .collect();
    if tokens.len() != 3 {
        return None;
    }
    let qualifier = tokens[0];
    if !matches!(qualifier, "uniform" | "attribute" | "varying" | "in" | "out") {
        return None;
    }
    let name = tokens[2].split('[').next()?.to_string();
    Some(Declaration {
        qualifier: qualifier.to_string(),
        ty: tokens[1].to_string(),
        name,
    })
}

fn uniform_block_names(source: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|line| {
            let mut line = line.trim();
            if line.starts_with("layout") {
                line = line[line.find(')')? + 1..].trim();
            }
            let rest = line.strip_prefix("uniform ")?;
            let name = rest.trim_end_matches('{').trim();
            (!name.is_empty() && !name.contains(' ') && line.ends_with('{')).then(|| name.to_string())
        })
        .collect()
}

/// Members of `uniform Block { ... };` bodies are not individually addressable.
fn uniform_block_members(source: &str) -> HashSet<String> {
    let mut members = HashSet::new();
    let mut inside = false;
    for line in source.lines() {
        let t = line.trim();
        if !inside && t.contains("uniform ") && t.ends_with('{') {
            inside = true;
            continue;
        }
        if inside {
            if t.starts_with('}') {
                inside = false;
                continue;
            }
            let tokens: Vec<&str> = t.trim_end_matches(';').split_whitespace().collect();
            if let Some(name) = tokens.last() {
                members.insert(name.split('[').next().unwrap_or(name).to_string());
            }
        }
    }
    members
}

fn structural_check(source: &str) -> Result<(), String> {
    for (i, line) in source.lines().enumerate() {
        let t = line.trim();
        if let Some(rest) = t.strip_prefix("#error") {
            return Err(format!("ERROR: 0:{}: '#error' : {}", i + 1, rest.trim()));
        }
    }
    if !source.contains("void main") {
        return Err("ERROR: 0:0: '' : missing main function".to_string());
    }
    let open = source.matches('{').count();
    let close = source.matches('}').count();
    if open != close {
        return Err(format!("ERROR: 0:0: '}}' : unbalanced braces ({open} opened, {close} closed)"));
    }
    Ok(())
}

impl GraphicsContext for HeadlessContext {
    fn is_context_lost(&self) -> bool {
        self.handle.is_lost()
    }

    fn get_parameter(&self, pname: GlEnum) -> i32 {
        let s = self.handle.inner.borrow();
        let caps = &s.capabilities;
        match pname {
            consts::MAX_TEXTURE_SIZE => caps.max_texture_size,
            consts::MAX_CUBE_MAP_TEXTURE_SIZE => caps.max_cube_texture_size,
            consts::MAX_RENDERBUFFER_SIZE => caps.max_render_texture_size,
            consts::MAX_TEXTURE_IMAGE_UNITS => caps.max_texture_image_units,
            consts::MAX_VERTEX_TEXTURE_IMAGE_UNITS => caps.max_vertex_texture_image_units,
            consts::MAX_COMBINED_TEXTURE_IMAGE_UNITS => caps.max_combined_texture_image_units,
            consts::MAX_VERTEX_ATTRIBS => caps.max_vertex_attribs,
            consts::MAX_VARYING_VECTORS => caps.max_varying_vectors,
            consts::MAX_VERTEX_UNIFORM_VECTORS => caps.max_vertex_uniform_vectors,
            consts::MAX_FRAGMENT_UNIFORM_VECTORS => caps.max_fragment_uniform_vectors,
            consts::MAX_SAMPLES => caps.max_samples,
            consts::MAX_UNIFORM_BUFFER_BINDINGS => caps.max_uniform_buffer_bindings,
            consts::TEXTURE_MAX_ANISOTROPY_EXT => {
                if caps.extensions.iter().any(|e| e == "EXT_texture_filter_anisotropic") {
                    16
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn has_extension(&self, name: &str) -> bool {
        self.handle
            .inner
            .borrow()
            .capabilities
            .extensions
            .iter()
            .any(|e| e == name)
    }

    fn flush(&mut self) {
        self.record(GlCall::Flush);
    }

    fn drawing_buffer_size(&self) -> (u32, u32) {
        self.handle.inner.borrow().drawing_buffer
    }

    fn enable(&mut self, cap: GlEnum) {
        self.record(GlCall::Enable(cap));
    }

    fn disable(&mut self, cap: GlEnum) {
        self.record(GlCall::Disable(cap));
    }

    fn depth_func(&mut self, func: GlEnum) {
        self.record(GlCall::DepthFunc(func));
    }

    fn depth_mask(&mut self, flag: bool) {
        self.record(GlCall::DepthMask(flag));
    }

    fn color_mask(&mut self, r: bool, g: bool, b: bool, a: bool) {
        self.record(GlCall::ColorMask([r, g, b, a]));
    }

    fn cull_face(&mut self, mode: GlEnum) {
        self.record(GlCall::CullFace(mode));
    }

    fn front_face(&mut self, mode: GlEnum) {
        self.record(GlCall::FrontFace(mode));
    }

    fn polygon_offset(&mut self, factor: f32, units: f32) {
        self.record(GlCall::PolygonOffset(factor, units));
    }

    fn blend_func_separate(&mut self, src_rgb: GlEnum, dst_rgb: GlEnum, src_a: GlEnum, dst_a: GlEnum) {
        self.record(GlCall::BlendFuncSeparate([src_rgb, dst_rgb, src_a, dst_a]));
    }

    fn blend_equation_separate(&mut self, rgb: GlEnum, alpha: GlEnum) {
        self.record(GlCall::BlendEquationSeparate(rgb, alpha));
    }

    fn blend_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        self.record(GlCall::BlendColor([r, g, b, a]));
    }

    fn stencil_func(&mut self, func: GlEnum, reference: i32, mask: u32) {
        self.record(GlCall::StencilFunc(func, reference, mask));
    }

    fn stencil_mask(&mut self, mask: u32) {
        self.record(GlCall::StencilMask(mask));
    }

    fn stencil_op(&mut self, fail: GlEnum, depth_fail: GlEnum, pass: GlEnum) {
        self.record(GlCall::StencilOp(fail, depth_fail, pass));
    }

    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.record(GlCall::Viewport([x, y, width, height]));
    }

    fn scissor(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.record(GlCall::Scissor([x, y, width, height]));
    }

    fn clear_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        let mut s = self.state();
        s.clear_color = [r, g, b, a];
        s.record(GlCall::ClearColor([r, g, b, a]));
    }

    fn clear_depth(&mut self, depth: f32) {
        self.record(GlCall::ClearDepth(depth));
    }

    fn clear_stencil(&mut self, stencil: i32) {
        self.record(GlCall::ClearStencil(stencil));
    }

    fn clear(&mut self, mask: u32) {
        self.record(GlCall::Clear(mask));
    }

    fn pixel_store(&mut self, pname: GlEnum, value: i32) {
        self.record(GlCall::PixelStore(pname, value));
    }

    fn create_buffer(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.buffers.insert(name, 0);
        s.record(GlCall::CreateBuffer(name));
        Some(name)
    }

    fn delete_buffer(&mut self, buffer: GlName) {
        let mut s = self.state();
        s.buffers.remove(&buffer);
        s.record(GlCall::DeleteBuffer(buffer));
    }

    fn bind_buffer(&mut self, target: GlEnum, buffer: GlName) {
        let mut s = self.state();
        s.bound_buffers.insert(target, buffer);
        s.record(GlCall::BindBuffer { target, buffer });
    }

    fn bind_buffer_base(&mut self, target: GlEnum, index: u32, buffer: GlName) {
        self.record(GlCall::BindBufferBase { target, index, buffer });
    }

    fn buffer_data(&mut self, target: GlEnum, data: &[u8], usage: GlEnum) {
        self.buffer_data_size(target, data.len(), usage);
    }

    fn buffer_data_size(&mut self, target: GlEnum, size: usize, usage: GlEnum) {
        let mut s = self.state();
        if let Some(bound) = s.bound_buffers.get(&target).copied() {
            if let Some(len) = s.buffers.get_mut(&bound) {
                *len = size;
            }
        }
        s.record(GlCall::BufferData { target, len: size, usage });
    }

    fn buffer_sub_data(&mut self, target: GlEnum, offset: usize, data: &[u8]) {
        self.record(GlCall::BufferSubData { target, offset, len: data.len() });
    }

    fn vertex_attrib_pointer(&mut self, pointer: VertexAttribPointer) {
        self.record(GlCall::VertexAttribPointer(pointer));
    }

    fn enable_vertex_attrib_array(&mut self, index: u32) {
        self.record(GlCall::EnableVertexAttribArray(index));
    }

    fn disable_vertex_attrib_array(&mut self, index: u32) {
        self.record(GlCall::DisableVertexAttribArray(index));
    }

    fn vertex_attrib_divisor(&mut self, index: u32, divisor: u32) {
        self.record(GlCall::VertexAttribDivisor(index, divisor));
    }

    fn create_vertex_array(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.vertex_arrays.insert(name);
        s.record(GlCall::CreateVertexArray(name));
        Some(name)
    }

    fn delete_vertex_array(&mut self, vao: GlName) {
        let mut s = self.state();
        s.vertex_arrays.remove(&vao);
        s.record(GlCall::DeleteVertexArray(vao));
    }

    fn bind_vertex_array(&mut self, vao: GlName) {
        self.record(GlCall::BindVertexArray(vao));
    }

    fn create_texture(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.textures.insert(name);
        s.record(GlCall::CreateTexture(name));
        Some(name)
    }

    fn delete_texture(&mut self, texture: GlName) {
        let mut s = self.state();
        s.textures.remove(&texture);
        s.record(GlCall::DeleteTexture(texture));
    }

    fn active_texture(&mut self, unit: u32) {
        self.record(GlCall::ActiveTexture(unit));
    }

    fn bind_texture(&mut self, target: GlEnum, texture: GlName) {
        self.record(GlCall::BindTexture { target, texture });
    }

    fn tex_image(&mut self, desc: TexImageDesc, _data: Option<&[u8]>) {
        self.record(GlCall::TexImage(desc));
    }

    fn tex_parameter_i(&mut self, target: GlEnum, pname: GlEnum, value: i32) {
        self.record(GlCall::TexParameterI(target, pname, value));
    }

    fn tex_parameter_f(&mut self, target: GlEnum, pname: GlEnum, value: f32) {
        self.record(GlCall::TexParameterF(target, pname, value));
    }

    fn generate_mipmap(&mut self, target: GlEnum) {
        self.record(GlCall::GenerateMipmap(target));
    }

    fn create_framebuffer(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.framebuffers.insert(name);
        s.record(GlCall::CreateFramebuffer(name));
        Some(name)
    }

    fn delete_framebuffer(&mut self, framebuffer: GlName) {
        let mut s = self.state();
        s.framebuffers.remove(&framebuffer);
        s.record(GlCall::DeleteFramebuffer(framebuffer));
    }

    fn bind_framebuffer(&mut self, target: GlEnum, framebuffer: GlName) {
        self.record(GlCall::BindFramebuffer { target, framebuffer });
    }

    fn framebuffer_texture_2d(
        &mut self,
        _target: GlEnum,
        attachment: GlEnum,
        tex_target: GlEnum,
        texture: GlName,
        level: i32,
    ) {
        self.record(GlCall::FramebufferTexture2D { attachment, tex_target, texture, level });
    }

    fn create_renderbuffer(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.renderbuffers.insert(name);
        s.record(GlCall::CreateRenderbuffer(name));
        Some(name)
    }

    fn delete_renderbuffer(&mut self, renderbuffer: GlName) {
        let mut s = self.state();
        s.renderbuffers.remove(&renderbuffer);
        s.record(GlCall::DeleteRenderbuffer(renderbuffer));
    }

    fn renderbuffer_storage(&mut self, internal_format: GlEnum, samples: u32, width: u32, height: u32) {
        self.record(GlCall::RenderbufferStorage { format: internal_format, samples, width, height });
    }

    fn framebuffer_renderbuffer(&mut self, _target: GlEnum, attachment: GlEnum, renderbuffer: GlName) {
        self.record(GlCall::FramebufferRenderbuffer { attachment, renderbuffer });
    }

    fn read_pixels(&mut self, x: i32, y: i32, width: u32, height: u32) -> Vec<u8> {
        let mut s = self.state();
        s.record(GlCall::ReadPixels { x, y, width, height });
        let texel = s.clear_color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        texel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect()
    }

    fn create_shader(&mut self, kind: GlEnum) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.shaders.insert(
            name,
            ShaderObject { kind, source: String::new(), compiled: false, info_log: String::new() },
        );
        s.record(GlCall::CreateShader { kind, shader: name });
        Some(name)
    }

    fn shader_source(&mut self, shader: GlName, source: &str) {
        if let Some(obj) = self.state().shaders.get_mut(&shader) {
            obj.source = source.to_string();
        }
    }

    fn compile_shader(&mut self, shader: GlName) {
        let mut s = self.state();
        let marker = s.failing_shader_marker.clone();
        let Some(obj) = s.shaders.get(&shader) else {
            return;
        };
        let mut result = structural_check(&obj.source);
        if result.is_ok() {
            if let Some(marker) = marker.filter(|m| obj.source.contains(m.as_str())) {
                result = Err(format!("ERROR: 0:1: '{marker}' : syntax error"));
            }
        }
        if result.is_ok() {
            if let Some(validator) = s.validator.as_ref() {
                result = validator(obj.kind, &obj.source);
            }
        }
        if let Some(obj) = s.shaders.get_mut(&shader) {
            match result {
                Ok(()) => {
                    obj.compiled = true;
                    obj.info_log.clear();
                }
                Err(log) => {
                    obj.compiled = false;
                    obj.info_log = log;
                }
            }
        }
        s.record(GlCall::CompileShader(shader));
    }

    fn shader_compile_status(&self, shader: GlName) -> bool {
        self.handle
            .inner
            .borrow()
            .shaders
            .get(&shader)
            .is_some_and(|s| s.compiled)
    }

    fn shader_info_log(&self, shader: GlName) -> String {
        self.handle
            .inner
            .borrow()
            .shaders
            .get(&shader)
            .map(|s| s.info_log.clone())
            .unwrap_or_default()
    }

    fn delete_shader(&mut self, shader: GlName) {
        let mut s = self.state();
        s.shaders.remove(&shader);
        s.record(GlCall::DeleteShader(shader));
    }

    fn create_program(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.programs.insert(name, ProgramObject::default());
        s.record(GlCall::CreateProgram(name));
        Some(name)
    }

    fn attach_shader(&mut self, program: GlName, shader: GlName) {
        if let Some(p) = self.state().programs.get_mut(&program) {
            p.shaders.push(shader);
        }
    }

    fn transform_feedback_varyings(&mut self, program: GlName, varyings: &[String], _buffer_mode: GlEnum) {
        self.record(GlCall::TransformFeedbackVaryings { program, count: varyings.len() });
    }

    fn link_program(&mut self, program: GlName) {
        let mut s = self.state();
        let Some(p) = s.programs.get(&program) else {
            return;
        };

        let mut vertex_src = String::new();
        let mut fragment_src = String::new();
        let mut all_compiled = true;
        for shader in &p.shaders {
            match s.shaders.get(shader) {
                Some(obj) if obj.compiled => {
                    if obj.kind == consts::VERTEX_SHADER {
                        vertex_src = obj.source.clone();
                    } else {
                        fragment_src = obj.source.clone();
                    }
                }
                _ => all_compiled = false,
            }
        }

        let mut info_log = String::new();
        if !all_compiled || vertex_src.is_empty() || fragment_src.is_empty() {
            info_log = "ERROR: one or more attached shaders not successfully compiled".to_string();
        } else if let Some(marker) = s
            .failing_link_marker
            .as_ref()
            .filter(|m| vertex_src.contains(m.as_str()) || fragment_src.contains(m.as_str()))
        {
            info_log = format!("ERROR: link failure triggered by '{marker}'");
        }

        let vertex_decls: Vec<Declaration> = vertex_src.lines().filter_map(parse_declaration).collect();
        let fragment_decls: Vec<Declaration> = fragment_src.lines().filter_map(parse_declaration).collect();

        if info_log.is_empty() {
            for input in fragment_decls
                .iter()
                .filter(|d| d.qualifier == "in" || d.qualifier == "varying")
            {
                let matched = vertex_decls.iter().any(|o| {
                    (o.qualifier == "out" || o.qualifier == "varying") && o.name == input.name && o.ty == input.ty
                });
                if !matched {
                    info_log = format!(
                        "ERROR: varying '{}' of type {} is not written by the vertex shader",
                        input.name, input.ty
                    );
                    break;
                }
            }
        }

        let block_members: HashSet<String> = uniform_block_members(&vertex_src)
            .into_iter()
            .chain(uniform_block_members(&fragment_src))
            .collect();
        let mut uniforms: Vec<String> = Vec::new();
        for d in vertex_decls.iter().chain(fragment_decls.iter()) {
            if d.qualifier == "uniform" && !block_members.contains(&d.name) && !uniforms.contains(&d.name) {
                uniforms.push(d.name.clone());
            }
        }
        let attributes: Vec<String> = vertex_decls
            .iter()
            .filter(|d| d.qualifier == "in" || d.qualifier == "attribute")
            .map(|d| d.name.clone())
            .collect();
        let mut uniform_blocks = uniform_block_names(&vertex_src);
        for b in uniform_block_names(&fragment_src) {
            if !uniform_blocks.contains(&b) {
                uniform_blocks.push(b);
            }
        }

        if let Some(p) = s.programs.get_mut(&program) {
            p.linked = info_log.is_empty();
            p.info_log = info_log;
            p.uniforms = uniforms;
            p.attributes = attributes;
            p.uniform_blocks = uniform_blocks;
        }
        s.record(GlCall::LinkProgram(program));
    }

    fn program_link_status(&self, program: GlName) -> bool {
        self.handle
            .inner
            .borrow()
            .programs
            .get(&program)
            .is_some_and(|p| p.linked)
    }

    fn program_info_log(&self, program: GlName) -> String {
        self.handle
            .inner
            .borrow()
            .programs
            .get(&program)
            .map(|p| p.info_log.clone())
            .unwrap_or_default()
    }

    fn delete_program(&mut self, program: GlName) {
        let mut s = self.state();
        s.programs.remove(&program);
        s.record(GlCall::DeleteProgram(program));
    }

    fn use_program(&mut self, program: GlName) {
        self.record(GlCall::UseProgram(program));
    }

    fn get_attrib_location(&self, program: GlName, name: &str) -> i32 {
        self.handle
            .inner
            .borrow()
            .programs
            .get(&program)
            .and_then(|p| p.attributes.iter().position(|a| a == name))
            .map(|i| i as i32)
            .unwrap_or(-1)
    }

    fn get_uniform_location(&self, program: GlName, name: &str) -> Option<UniformLocation> {
        self.handle
            .inner
            .borrow()
            .programs
            .get(&program)
            .and_then(|p| p.uniforms.iter().position(|u| u == name))
            .map(|i| UniformLocation(i as i32))
    }

    fn get_uniform_block_index(&self, program: GlName, name: &str) -> u32 {
        self.handle
            .inner
            .borrow()
            .programs
            .get(&program)
            .and_then(|p| p.uniform_blocks.iter().position(|b| b == name))
            .map(|i| i as u32)
            .unwrap_or(consts::INVALID_INDEX)
    }

    fn uniform_block_binding(&mut self, program: GlName, block_index: u32, binding: u32) {
        self.record(GlCall::UniformBlockBinding { program, block_index, binding });
    }

    fn uniform1i(&mut self, location: UniformLocation, value: i32) {
        self.uniform(location, vec![value as f32]);
    }

    fn uniform1iv(&mut self, location: UniformLocation, values: &[i32]) {
        self.uniform(location, values.iter().map(|v| *v as f32).collect());
    }

    fn uniform1f(&mut self, location: UniformLocation, value: f32) {
        self.uniform(location, vec![value]);
    }

    fn uniform2f(&mut self, location: UniformLocation, x: f32, y: f32) {
        self.uniform(location, vec![x, y]);
    }

    fn uniform3f(&mut self, location: UniformLocation, x: f32, y: f32, z: f32) {
        self.uniform(location, vec![x, y, z]);
    }

    fn uniform4f(&mut self, location: UniformLocation, x: f32, y: f32, z: f32, w: f32) {
        self.uniform(location, vec![x, y, z, w]);
    }

    fn uniform1fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.uniform(location, values.to_vec());
    }

    fn uniform_matrix2fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.uniform(location, values.to_vec());
    }

    fn uniform_matrix3fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.uniform(location, values.to_vec());
    }

    fn uniform_matrix4fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.uniform(location, values.to_vec());
    }

    fn draw_arrays(&mut self, mode: GlEnum, first: i32, count: i32) {
        self.record(GlCall::DrawArrays { mode, first, count, instances: 1 });
    }

    fn draw_elements(&mut self, mode: GlEnum, count: i32, index_type: GlEnum, offset: usize) {
        self.record(GlCall::DrawElements { mode, count, index_type, offset, instances: 1 });
    }

    fn draw_arrays_instanced(&mut self, mode: GlEnum, first: i32, count: i32, instances: i32) {
        self.record(GlCall::DrawArrays { mode, first, count, instances });
    }

    fn draw_elements_instanced(
        &mut self,
        mode: GlEnum,
        count: i32,
        index_type: GlEnum,
        offset: usize,
        instances: i32,
    ) {
        self.record(GlCall::DrawElements { mode, count, index_type, offset, instances });
    }

    fn create_query(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.queries.insert(name);
        s.record(GlCall::CreateQuery(name));
        Some(name)
    }

    fn delete_query(&mut self, query: GlName) {
        let mut s = self.state();
        s.queries.remove(&query);
        s.record(GlCall::DeleteQuery(query));
    }

    fn begin_query(&mut self, target: GlEnum, query: GlName) {
        self.record(GlCall::BeginQuery { target, query });
    }

    fn end_query(&mut self, target: GlEnum) {
        self.record(GlCall::EndQuery(target));
    }

    fn query_result_available(&self, query: GlName) -> bool {
        self.handle.inner.borrow().queries.contains(&query)
    }

    fn query_result(&self, query: GlName) -> u64 {
        u64::from(self.query_result_available(query))
    }

    fn create_transform_feedback(&mut self) -> Option<GlName> {
        let mut s = self.state();
        let name = s.allocate()?;
        s.transform_feedbacks.insert(name);
        s.record(GlCall::CreateTransformFeedback(name));
        Some(name)
    }

    fn delete_transform_feedback(&mut self, feedback: GlName) {
        let mut s = self.state();
        s.transform_feedbacks.remove(&feedback);
        s.record(GlCall::DeleteTransformFeedback(feedback));
    }

    fn bind_transform_feedback(&mut self, feedback: GlName) {
        self.record(GlCall::BindTransformFeedback(feedback));
    }

    fn begin_transform_feedback(&mut self, primitive: GlEnum) {
        self.record(GlCall::BeginTransformFeedback(primitive));
    }

    fn end_transform_feedback(&mut self) {
        self.record(GlCall::EndTransformFeedback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VS: &str = "#version 300 es\nin vec3 position;\nuniform mat4 world;\nout vec2 vUV;\nvoid main(void) {\n  vUV = position.xy;\n  gl_Position = world * vec4(position, 1.0);\n}\n";
    const FS: &str = "#version 300 es\nprecision highp float;\nin vec2 vUV;\nuniform vec4 tint;\nout vec4 glFragColor;\nvoid main(void) {\n  glFragColor = tint * vUV.x;\n}\n";

    fn link(ctx: &mut HeadlessContext, vs: &str, fs: &str) -> GlName {
        let v = ctx.create_shader(consts::VERTEX_SHADER).unwrap();
        ctx.shader_source(v, vs);
        ctx.compile_shader(v);
        let f = ctx.create_shader(consts::FRAGMENT_SHADER).unwrap();
        ctx.shader_source(f, fs);
        ctx.compile_shader(f);
        let p = ctx.create_program().unwrap();
        ctx.attach_shader(p, v);
        ctx.attach_shader(p, f);
        ctx.link_program(p);
        p
    }

    #[test]
    fn links_matching_stages_and_exposes_locations() {
        let mut ctx = HeadlessContext::new(4, 4);
        let p = link(&mut ctx, VS, FS);
        assert!(ctx.program_link_status(p), "{}", ctx.program_info_log(p));
        assert_eq!(ctx.get_attrib_location(p, "position"), 0);
        assert_eq!(ctx.get_attrib_location(p, "normal"), -1);
        assert!(ctx.get_uniform_location(p, "world").is_some());
        assert!(ctx.get_uniform_location(p, "tint").is_some());
        assert!(ctx.get_uniform_location(p, "missing").is_none());
    }

    #[test]
    fn varying_type_mismatch_fails_link() {
        let mut ctx = HeadlessContext::new(4, 4);
        let fs = FS.replace("in vec2 vUV;", "in vec3 vUV;");
        let p = link(&mut ctx, VS, &fs);
        assert!(!ctx.program_link_status(p));
        assert!(ctx.program_info_log(p).contains("vUV"));
    }

    #[test]
    fn error_directive_fails_compile_with_log() {
        let mut ctx = HeadlessContext::new(4, 4);
        let s = ctx.create_shader(consts::FRAGMENT_SHADER).unwrap();
        ctx.shader_source(s, "#error unsupported\nvoid main(void) {}\n");
        ctx.compile_shader(s);
        assert!(!ctx.shader_compile_status(s));
        assert!(ctx.shader_info_log(s).contains("unsupported"));
    }

    #[test]
    fn lost_context_rejects_allocations_and_records_nothing() {
        let mut ctx = HeadlessContext::new(4, 4);
        let handle = ctx.handle();
        let b = ctx.create_buffer().unwrap();
        handle.lose_context();
        handle.clear_calls();
        assert!(ctx.create_buffer().is_none());
        ctx.bind_buffer(consts::ARRAY_BUFFER, b);
        assert!(handle.calls().is_empty());
        assert!(!handle.is_buffer_alive(b));
    }

    #[test]
    fn read_pixels_returns_clear_color() {
        let mut ctx = HeadlessContext::new(2, 2);
        ctx.clear_color(1.0, 0.0, 0.0, 1.0);
        let px = ctx.read_pixels(0, 0, 2, 1);
        assert_eq!(px, vec![255, 0, 0, 255, 255, 0, 0, 255]);
    }
}
