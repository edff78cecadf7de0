//! The graphics-context seam.
//!
//! Everything above this module talks to the GPU exclusively through the
//! [`GraphicsContext`] trait: a WebGL2-shaped immediate API operating on opaque
//! object names. A windowing collaborator supplies a native implementation; the
//! engine ships [`HeadlessContext`], which records every call and is used for
//! headless runs and tests.

pub mod consts;
pub mod headless;

pub use consts::GlEnum;
pub use headless::{GlCall, HeadlessCapabilities, HeadlessContext, HeadlessHandle};

/// Opaque GPU object name. `0` is the null object.
pub type GlName = u32;

/// A resolved uniform location inside a linked program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub i32);

/// Layout of one vertex attribute inside the currently bound array buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VertexAttribPointer {
    pub index: u32,
    pub size: i32,
    pub data_type: GlEnum,
    pub normalized: bool,
    pub stride: i32,
    pub offset: i32,
}

/// Description of a 2D/3D/cube-face texture upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TexImageDesc {
    pub target: GlEnum,
    pub level: i32,
    pub internal_format: GlEnum,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: GlEnum,
    pub data_type: GlEnum,
}

/// GL-style rendering context.
///
/// Implementations never panic on invalid names: like GL they ignore the call
/// (and may record an error). Creation functions return `None` when the
/// context is lost or the driver is out of memory.
pub trait GraphicsContext {
    // ── Context ──────────────────────────────────────────────────────────
    fn is_context_lost(&self) -> bool;
    fn get_parameter(&self, pname: GlEnum) -> i32;
    fn has_extension(&self, name: &str) -> bool;
    fn flush(&mut self);
    fn drawing_buffer_size(&self) -> (u32, u32);

    // ── Fixed-function state ─────────────────────────────────────────────
    fn enable(&mut self, cap: GlEnum);
    fn disable(&mut self, cap: GlEnum);
    fn depth_func(&mut self, func: GlEnum);
    fn depth_mask(&mut self, flag: bool);
    fn color_mask(&mut self, r: bool, g: bool, b: bool, a: bool);
    fn cull_face(&mut self, mode: GlEnum);
    fn front_face(&mut self, mode: GlEnum);
    fn polygon_offset(&mut self, factor: f32, units: f32);
    fn blend_func_separate(&mut self, src_rgb: GlEnum, dst_rgb: GlEnum, src_a: GlEnum, dst_a: GlEnum);
    fn blend_equation_separate(&mut self, rgb: GlEnum, alpha: GlEnum);
    fn blend_color(&mut self, r: f32, g: f32, b: f32, a: f32);
    fn stencil_func(&mut self, func: GlEnum, reference: i32, mask: u32);
    fn stencil_mask(&mut self, mask: u32);
    fn stencil_op(&mut self, fail: GlEnum, depth_fail: GlEnum, pass: GlEnum);
    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32);
    fn scissor(&mut self, x: i32, y: i32, width: i32, height: i32);
    fn clear_color(&mut self, r: f32, g: f32, b: f32, a: f32);
    fn clear_depth(&mut self, depth: f32);
    fn clear_stencil(&mut self, stencil: i32);
    fn clear(&mut self, mask: u32);
    fn pixel_store(&mut self, pname: GlEnum, value: i32);

    // ── Buffers / vertex input ───────────────────────────────────────────
    fn create_buffer(&mut self) -> Option<GlName>;
    fn delete_buffer(&mut self, buffer: GlName);
    fn bind_buffer(&mut self, target: GlEnum, buffer: GlName);
    fn bind_buffer_base(&mut self, target: GlEnum, index: u32, buffer: GlName);
    fn buffer_data(&mut self, target: GlEnum, data: &[u8], usage: GlEnum);
    fn buffer_data_size(&mut self, target: GlEnum, size: usize, usage: GlEnum);
    fn buffer_sub_data(&mut self, target: GlEnum, offset: usize, data: &[u8]);
    fn vertex_attrib_pointer(&mut self, pointer: VertexAttribPointer);
    fn enable_vertex_attrib_array(&mut self, index: u32);
    fn disable_vertex_attrib_array(&mut self, index: u32);
    fn vertex_attrib_divisor(&mut self, index: u32, divisor: u32);
    fn create_vertex_array(&mut self) -> Option<GlName>;
    fn delete_vertex_array(&mut self, vao: GlName);
    fn bind_vertex_array(&mut self, vao: GlName);

    // ── Textures ─────────────────────────────────────────────────────────
    fn create_texture(&mut self) -> Option<GlName>;
    fn delete_texture(&mut self, texture: GlName);
    fn active_texture(&mut self, unit: u32);
    fn bind_texture(&mut self, target: GlEnum, texture: GlName);
    fn tex_image(&mut self, desc: TexImageDesc, data: Option<&[u8]>);
    fn tex_parameter_i(&mut self, target: GlEnum, pname: GlEnum, value: i32);
    fn tex_parameter_f(&mut self, target: GlEnum, pname: GlEnum, value: f32);
    fn generate_mipmap(&mut self, target: GlEnum);

    // ── Framebuffers ─────────────────────────────────────────────────────
    fn create_framebuffer(&mut self) -> Option<GlName>;
    fn delete_framebuffer(&mut self, framebuffer: GlName);
    fn bind_framebuffer(&mut self, target: GlEnum, framebuffer: GlName);
    fn framebuffer_texture_2d(
        &mut self,
        target: GlEnum,
        attachment: GlEnum,
        tex_target: GlEnum,
        texture: GlName,
        level: i32,
    );
    fn create_renderbuffer(&mut self) -> Option<GlName>;
    fn delete_renderbuffer(&mut self, renderbuffer: GlName);
    fn renderbuffer_storage(&mut self, internal_format: GlEnum, samples: u32, width: u32, height: u32);
    fn framebuffer_renderbuffer(&mut self, target: GlEnum, attachment: GlEnum, renderbuffer: GlName);
    fn read_pixels(&mut self, x: i32, y: i32, width: u32, height: u32) -> Vec<u8>;

    // ── Programs ─────────────────────────────────────────────────────────
    fn create_shader(&mut self, kind: GlEnum) -> Option<GlName>;
    fn shader_source(&mut self, shader: GlName, source: &str);
    fn compile_shader(&mut self, shader: GlName);
    fn shader_compile_status(&self, shader: GlName) -> bool;
    fn shader_info_log(&self, shader: GlName) -> String;
    fn delete_shader(&mut self, shader: GlName);
    fn create_program(&mut self) -> Option<GlName>;
    fn attach_shader(&mut self, program: GlName, shader: GlName);
    fn transform_feedback_varyings(&mut self, program: GlName, varyings: &[String], buffer_mode: GlEnum);
    fn link_program(&mut self, program: GlName);
    fn program_link_status(&self, program: GlName) -> bool;
    fn program_info_log(&self, program: GlName) -> String;
    fn delete_program(&mut self, program: GlName);
    fn use_program(&mut self, program: GlName);
    fn get_attrib_location(&self, program: GlName, name: &str) -> i32;
    fn get_uniform_location(&self, program: GlName, name: &str) -> Option<UniformLocation>;
    fn get_uniform_block_index(&self, program: GlName, name: &str) -> u32;
    fn uniform_block_binding(&mut self, program: GlName, block_index: u32, binding: u32);

    // ── Uniform upload ───────────────────────────────────────────────────
    fn uniform1i(&mut self, location: UniformLocation, value: i32);
    fn uniform1iv(&mut self, location: UniformLocation, values: &[i32]);
    fn uniform1f(&mut self, location: UniformLocation, value: f32);
    fn uniform2f(&mut self, location: UniformLocation, x: f32, y: f32);
    fn uniform3f(&mut self, location: UniformLocation, x: f32, y: f32, z: f32);
    fn uniform4f(&mut self, location: UniformLocation, x: f32, y: f32, z: f32, w: f32);
    fn uniform1fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform_matrix2fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform_matrix3fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform_matrix4fv(&mut self, location: UniformLocation, values: &[f32]);

    // ── Draws ────────────────────────────────────────────────────────────
    fn draw_arrays(&mut self, mode: GlEnum, first: i32, count: i32);
    fn draw_elements(&mut self, mode: GlEnum, count: i32, index_type: GlEnum, offset: usize);
    fn draw_arrays_instanced(&mut self, mode: GlEnum, first: i32, count: i32, instances: i32);
    fn draw_elements_instanced(
        &mut self,
        mode: GlEnum,
        count: i32,
        index_type: GlEnum,
        offset: usize,
        instances: i32,
    );

    // ── Queries / transform feedback ─────────────────────────────────────
    fn create_query(&mut self) -> Option<GlName>;
    fn delete_query(&mut self, query: GlName);
    fn begin_query(&mut self, target: GlEnum, query: GlName);
    fn end_query(&mut self, target: GlEnum);
    fn query_result_available(&self, query: GlName) -> bool;
    fn query_result(&self, query: GlName) -> u64;
    fn create_transform_feedback(&mut self) -> Option<GlName>;
    fn delete_transform_feedback(&mut self, feedback: GlName);
    fn bind_transform_feedback(&mut self, feedback: GlName);
    fn begin_transform_feedback(&mut self, primitive: GlEnum);
    fn end_transform_feedback(&mut self);
}
