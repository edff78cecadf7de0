//! Effects: compiled programs plus their resolved location tables.
//!
//! Effects are cached by `(base name, defines, attributes)`. A compile or link
//! failure reports through the caller's error callback and then retries with
//! each fallback define set in order; if none links, the effect is marked
//! failed and draws using it are skipped.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Result, anyhow};
use glam::{Mat4, Vec3};

use crate::engine::Engine;
use crate::engine::resources::{Handle, ResourceTable};
use crate::gl::consts;
use crate::gl::{GlName, GraphicsContext, UniformLocation};

pub type EffectHandle = Handle<Effect>;

/// A sampler uniform: its declared unit plus the unit it currently points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SamplerSlot {
    pub(crate) unit: u32,
    pub(crate) location: UniformLocation,
    pub(crate) channel: u32,
}
pub type EffectErrorCallback = Box<dyn FnMut(&EffectCompilationError)>;
pub type EffectCompiledCallback = Box<dyn FnMut(EffectHandle)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectState {
    /// Waiting for a usable context.
    Pending,
    Ready,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileStage {
    Allocation,
    Vertex,
    Fragment,
    Link,
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompileStage::Allocation => "program allocation",
            CompileStage::Vertex => "vertex shader compilation",
            CompileStage::Fragment => "fragment shader compilation",
            CompileStage::Link => "program link",
        })
    }
}

/// Driver diagnostics for one failed compile attempt.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{stage} failed for effect '{key}': {log}")]
pub struct EffectCompilationError {
    pub key: String,
    pub stage: CompileStage,
    pub defines: String,
    pub log: String,
}

/// Everything needed to build (and later rebuild) an effect.
#[derive(Default)]
pub struct EffectCreationOptions {
    pub base_name: String,
    pub vertex_source: String,
    pub fragment_source: String,
    pub attributes: Vec<String>,
    pub uniforms: Vec<String>,
    pub uniform_buffers: Vec<String>,
    pub samplers: Vec<String>,
    /// `#define` lines injected after the `#version` line.
    pub defines: String,
    /// Alternative define sets tried in order when `defines` fails.
    pub fallbacks: Vec<String>,
    pub transform_feedback_varyings: Vec<String>,
    pub on_compiled: Option<EffectCompiledCallback>,
    pub on_error: Option<EffectErrorCallback>,
}

pub struct Effect {
    key: String,
    base_name: String,
    vertex_source: String,
    fragment_source: String,
    requested_defines: String,
    defines: String,
    fallbacks: Vec<String>,
    pub(crate) attribute_names: Vec<String>,
    pub(crate) attribute_locations: Vec<i32>,
    uniform_names: Vec<String>,
    sampler_names: Vec<String>,
    uniform_buffer_names: Vec<String>,
    transform_feedback_varyings: Vec<String>,
    pub(crate) uniforms: HashMap<String, UniformLocation>,
    pub(crate) samplers: HashMap<String, SamplerSlot>,
    pub(crate) uniform_buffers: HashMap<String, u32>,
    pub(crate) program: GlName,
    pub(crate) state: EffectState,
    compilation_error: Option<String>,
    used_fallback: Option<usize>,
    pub(crate) references: u32,
    value_cache: HashMap<String, Vec<f32>>,
    on_compiled: Option<EffectCompiledCallback>,
    on_error: Option<EffectErrorCallback>,
}

impl Effect {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn is_ready(&self) -> bool {
        self.state == EffectState::Ready
    }

    pub fn state(&self) -> EffectState {
        self.state
    }

    pub fn compilation_error(&self) -> Option<&str> {
        self.compilation_error.as_deref()
    }

    /// Define set the current program was built from.
    pub fn defines(&self) -> &str {
        &self.defines
    }

    /// Index into the fallback list when a fallback was needed.
    pub fn used_fallback(&self) -> Option<usize> {
        self.used_fallback
    }

    pub fn program(&self) -> GlName {
        self.program
    }

    pub fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    pub fn get_attribute_location(&self, index: usize) -> i32 {
        self.attribute_locations.get(index).copied().unwrap_or(-1)
    }

    pub fn get_attribute_location_by_name(&self, name: &str) -> i32 {
        self.attribute_names
            .iter()
            .position(|n| n == name)
            .map_or(-1, |i| self.get_attribute_location(i))
    }

    pub fn get_uniform_location(&self, name: &str) -> Option<UniformLocation> {
        self.uniforms.get(name).copied()
    }

    /// Texture unit assigned to a sampler; unused samplers have none.
    pub fn get_sampler_unit(&self, name: &str) -> Option<u32> {
        self.samplers.get(name).map(|s| s.unit)
    }

    pub fn get_uniform_buffer_binding(&self, name: &str) -> Option<u32> {
        self.uniform_buffers.get(name).copied()
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    fn compile_candidates(&self) -> Vec<String> {
        std::iter::once(self.requested_defines.clone())
            .chain(self.fallbacks.iter().cloned())
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct EffectCache {
    table: ResourceTable<Effect>,
    by_key: HashMap<String, EffectHandle>,
}

impl EffectCache {
    pub(crate) fn key(base_name: &str, defines: &str, attributes: &[String]) -> String {
        format!("{base_name}@{defines}|{}", attributes.join(","))
    }

    pub(crate) fn get(&self, h: EffectHandle) -> Option<&Effect> {
        self.table.get(h)
    }

    pub(crate) fn get_mut(&mut self, h: EffectHandle) -> Option<&mut Effect> {
        self.table.get_mut(h)
    }

    fn lookup(&self, key: &str) -> Option<EffectHandle> {
        self.by_key.get(key).copied().filter(|h| self.table.contains(*h))
    }

    fn insert(&mut self, effect: Effect) -> EffectHandle {
        let key = effect.key.clone();
        let h = self.table.insert(effect);
        self.by_key.insert(key, h);
        h
    }

    fn remove(&mut self, h: EffectHandle) -> Option<Effect> {
        let effect = self.table.remove(h)?;
        if self.by_key.get(&effect.key) == Some(&h) {
            self.by_key.remove(&effect.key);
        }
        Some(effect)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn handles_in_creation_order(&self) -> Vec<EffectHandle> {
        self.table.handles_in_creation_order()
    }
}

// ── Program building ─────────────────────────────────────────────────────

/// Insert `defines` right after a leading `#version` line, or at the top.
pub fn inject_defines(source: &str, defines: &str) -> String {
    if defines.trim().is_empty() {
        return source.to_string();
    }
    let mut defines = defines.to_string();
    if !defines.ends_with('\n') {
        defines.push('\n');
    }
    let trimmed = source.trim_start();
    if trimmed.starts_with("#version") {
        let offset = source.len() - trimmed.len();
        let line_end = trimmed.find('\n').map_or(source.len(), |i| offset + i + 1);
        let mut out = String::with_capacity(source.len() + defines.len() + 1);
        out.push_str(&source[..line_end]);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&defines);
        out.push_str(&source[line_end..]);
        out
    } else {
        format!("{defines}{source}")
    }
}

fn compile_shader(ctx: &mut dyn GraphicsContext, kind: u32, source: &str) -> std::result::Result<GlName, (CompileStage, String)> {
    let stage = if kind == consts::VERTEX_SHADER {
        CompileStage::Vertex
    } else {
        CompileStage::Fragment
    };
    let shader = ctx
        .create_shader(kind)
        .ok_or((CompileStage::Allocation, "unable to create shader object".to_string()))?;
    ctx.shader_source(shader, source);
    ctx.compile_shader(shader);
    if !ctx.shader_compile_status(shader) {
        let log = ctx.shader_info_log(shader);
        ctx.delete_shader(shader);
        return Err((stage, log));
    }
    Ok(shader)
}

/// Compile both stages with `defines` and link them.
pub(crate) fn build_program(
    ctx: &mut dyn GraphicsContext,
    vertex: &str,
    fragment: &str,
    defines: &str,
    transform_feedback_varyings: &[String],
) -> std::result::Result<GlName, (CompileStage, String)> {
    let vs = compile_shader(ctx, consts::VERTEX_SHADER, &inject_defines(vertex, defines))?;
    let fs = match compile_shader(ctx, consts::FRAGMENT_SHADER, &inject_defines(fragment, defines)) {
        Ok(fs) => fs,
        Err(e) => {
            ctx.delete_shader(vs);
            return Err(e);
        }
    };
    let Some(program) = ctx.create_program() else {
        ctx.delete_shader(vs);
        ctx.delete_shader(fs);
        return Err((CompileStage::Allocation, "unable to create program object".to_string()));
    };
    ctx.attach_shader(program, vs);
    ctx.attach_shader(program, fs);
    if !transform_feedback_varyings.is_empty() {
        ctx.transform_feedback_varyings(program, transform_feedback_varyings, consts::INTERLEAVED_ATTRIBS);
    }
    ctx.link_program(program);
    let linked = ctx.program_link_status(program);
    ctx.delete_shader(vs);
    ctx.delete_shader(fs);
    if !linked {
        let log = ctx.program_info_log(program);
        ctx.delete_program(program);
        return Err((CompileStage::Link, log));
    }
    Ok(program)
}

impl Engine {
    /// Return the cached effect for these options or build a new one.
    ///
    /// Never fails: a build failure yields a handle in the
    /// [`EffectState::Failed`] state and is reported through `on_error`.
    pub fn create_effect(&mut self, options: EffectCreationOptions) -> EffectHandle {
        let key = EffectCache::key(&options.base_name, &options.defines, &options.attributes);
        if let Some(h) = self.effects.lookup(&key) {
            let mut on_compiled = options.on_compiled;
            if let Some(effect) = self.effects.get_mut(h) {
                effect.references += 1;
                if effect.is_ready() {
                    if let Some(cb) = on_compiled.as_mut() {
                        cb(h);
                    }
                }
            }
            return h;
        }

        let effect = Effect {
            key,
            base_name: options.base_name,
            vertex_source: options.vertex_source,
            fragment_source: options.fragment_source,
            requested_defines: options.defines.clone(),
            defines: options.defines,
            fallbacks: options.fallbacks,
            attribute_locations: vec![-1; options.attributes.len()],
            attribute_names: options.attributes,
            uniform_names: options.uniforms,
            sampler_names: options.samplers,
            uniform_buffer_names: options.uniform_buffers,
            transform_feedback_varyings: options.transform_feedback_varyings,
            uniforms: HashMap::new(),
            samplers: HashMap::new(),
            uniform_buffers: HashMap::new(),
            program: 0,
            state: EffectState::Pending,
            compilation_error: None,
            used_fallback: None,
            references: 1,
            value_cache: HashMap::new(),
            on_compiled: options.on_compiled,
            on_error: options.on_error,
        };
        let handle = self.effects.insert(effect);
        self.compile_effect(handle);
        handle
    }

    /// Build the program for an effect, walking its fallback list.
    pub(crate) fn compile_effect(&mut self, handle: EffectHandle) {
        if !self.can_issue() {
            if let Some(effect) = self.effects.get_mut(handle) {
                effect.state = EffectState::Pending;
                log::debug!("context lost: effect '{}' queued for compilation", effect.key);
            }
            return;
        }
        let Some(effect) = self.effects.get(handle) else {
            return;
        };
        let candidates = effect.compile_candidates();
        let vertex = effect.vertex_source.clone();
        let fragment = effect.fragment_source.clone();
        let varyings = effect.transform_feedback_varyings.clone();
        let key = effect.key.clone();

        let mut last_log = String::new();
        for (i, defines) in candidates.iter().enumerate() {
            match build_program(self.ctx.as_mut(), &vertex, &fragment, defines, &varyings) {
                Ok(program) => {
                    if i > 0 {
                        log::warn!("effect '{key}' compiled with fallback #{i}");
                    }
                    self.finish_effect(handle, program, defines.clone(), (i > 0).then(|| i - 1));
                    return;
                }
                Err((stage, log)) => {
                    let err = EffectCompilationError {
                        key: key.clone(),
                        stage,
                        defines: defines.clone(),
                        log,
                    };
                    log::error!("{err}");
                    self.report_effect_error(handle, &err);
                    last_log = err.log;
                }
            }
        }

        if let Some(effect) = self.effects.get_mut(handle) {
            effect.state = EffectState::Failed;
            effect.program = 0;
            effect.compilation_error = Some(last_log);
        }
    }

    fn report_effect_error(&mut self, handle: EffectHandle, err: &EffectCompilationError) {
        let Some(mut cb) = self.effects.get_mut(handle).and_then(|e| e.on_error.take()) else {
            return;
        };
        cb(err);
        if let Some(effect) = self.effects.get_mut(handle) {
            effect.on_error = Some(cb);
        }
    }

    fn finish_effect(&mut self, handle: EffectHandle, program: GlName, defines: String, used_fallback: Option<usize>) {
        let Some(effect) = self.effects.get_mut(handle) else {
            self.ctx.delete_program(program);
            return;
        };
        let ctx = self.ctx.as_mut();
        let previous = self.state.current_program();
        self.state.use_program(ctx, program);

        effect.attribute_locations = effect
            .attribute_names
            .iter()
            .map(|n| ctx.get_attrib_location(program, n))
            .collect();

        effect.uniforms.clear();
        for name in &effect.uniform_names {
            if let Some(loc) = ctx.get_uniform_location(program, name) {
                effect.uniforms.insert(name.clone(), loc);
            }
        }

        effect.samplers.clear();
        let mut unit = 0u32;
        for name in &effect.sampler_names {
            if let Some(loc) = ctx.get_uniform_location(program, name) {
                ctx.uniform1i(loc, unit as i32);
                effect.samplers.insert(name.clone(), SamplerSlot { unit, location: loc, channel: unit });
                unit += 1;
            }
        }

        effect.uniform_buffers.clear();
        for (binding, name) in effect.uniform_buffer_names.iter().enumerate() {
            let index = ctx.get_uniform_block_index(program, name);
            if index != consts::INVALID_INDEX {
                ctx.uniform_block_binding(program, index, binding as u32);
                effect.uniform_buffers.insert(name.clone(), binding as u32);
            }
        }
        self.state.use_program(ctx, previous.unwrap_or(0));

        effect.program = program;
        effect.defines = defines;
        effect.used_fallback = used_fallback;
        effect.state = EffectState::Ready;
        effect.compilation_error = None;
        effect.value_cache.clear();
        log::debug!("effect '{}' ready (program {program})", effect.key);

        if let Some(mut cb) = effect.on_compiled.take() {
            cb(handle);
            if let Some(effect) = self.effects.get_mut(handle) {
                effect.on_compiled = Some(cb);
            }
        }
    }

    pub fn effect(&self, handle: EffectHandle) -> Option<&Effect> {
        self.effects.get(handle)
    }

    pub fn compiled_effects_count(&self) -> usize {
        self.effects.len()
    }

    /// Vertex source as sent to the driver (defines injected).
    pub fn get_vertex_shader_source(&self, handle: EffectHandle) -> Option<String> {
        self.effects
            .get(handle)
            .map(|e| inject_defines(&e.vertex_source, &e.defines))
    }

    pub fn get_fragment_shader_source(&self, handle: EffectHandle) -> Option<String> {
        self.effects
            .get(handle)
            .map(|e| inject_defines(&e.fragment_source, &e.defines))
    }

    /// Make `handle` the current effect. A failed or pending effect unbinds the
    /// program so following draws are skipped.
    pub fn enable_effect(&mut self, handle: EffectHandle) -> bool {
        if !self.can_issue() {
            return false;
        }
        let program = match self.effects.get(handle) {
            Some(e) if e.is_ready() => e.program,
            Some(e) => {
                log::warn!("effect '{}' is not usable ({:?}); draws will be skipped", e.key, e.state);
                0
            }
            None => 0,
        };
        self.state.use_program(self.ctx.as_mut(), program);
        self.current_effect = (program != 0).then_some(handle);
        program != 0
    }

    /// Bind a raw program name directly.
    pub fn set_program(&mut self, program: GlName) {
        if self.can_issue() {
            self.state.use_program(self.ctx.as_mut(), program);
            self.current_effect = None;
        }
    }

    /// Compile and link sources without caching or rebuild tracking.
    pub fn create_raw_shader_program(
        &mut self,
        vertex: &str,
        fragment: &str,
        transform_feedback_varyings: &[String],
    ) -> Result<GlName> {
        if !self.can_issue() {
            return Err(anyhow!("cannot create a program while the context is lost"));
        }
        build_program(self.ctx.as_mut(), vertex, fragment, "", transform_feedback_varyings)
            .map_err(|(stage, log)| anyhow!("{stage} failed: {log}"))
    }

    /// Delete a program created with [`Engine::create_raw_shader_program`].
    pub fn delete_program(&mut self, program: GlName) {
        if program != 0 && self.can_issue() {
            self.ctx.delete_program(program);
        }
        self.state.forget_program(program);
    }

    /// Drop one reference; the program is deleted and the cache entry removed
    /// when none remain. Returns whether the effect was freed.
    pub fn release_effect(&mut self, handle: impl Into<Option<EffectHandle>>) -> bool {
        let Some(h) = handle.into() else {
            return false;
        };
        let Some(effect) = self.effects.get_mut(h) else {
            return false;
        };
        effect.references = effect.references.saturating_sub(1);
        if effect.references > 0 {
            return false;
        }
        if let Some(effect) = self.effects.remove(h) {
            self.delete_program(effect.program);
        }
        if self.current_effect == Some(h) {
            self.current_effect = None;
        }
        true
    }

    /// Delete every compiled program and empty the cache.
    pub fn release_effects(&mut self) {
        for h in self.effects.handles_in_creation_order() {
            if let Some(effect) = self.effects.remove(h) {
                self.delete_program(effect.program);
            }
        }
        self.current_effect = None;
    }

    // ── Uniform upload ───────────────────────────────────────────────────

    /// Location to write `values` to, or `None` when the uniform is absent or
    /// the cached value already matches.
    fn uniform_slot(&mut self, handle: EffectHandle, name: &str, values: &[f32]) -> Option<UniformLocation> {
        if !self.can_issue() {
            return None;
        }
        let effect = self.effects.get_mut(handle)?;
        if !effect.is_ready() {
            return None;
        }
        let location = *effect.uniforms.get(name)?;
        if effect.value_cache.get(name).is_some_and(|v| v.as_slice() == values) {
            return None;
        }
        effect.value_cache.insert(name.to_string(), values.to_vec());
        let program = effect.program;
        self.state.use_program(self.ctx.as_mut(), program);
        Some(location)
    }

    pub fn set_int(&mut self, effect: EffectHandle, name: &str, value: i32) {
        if let Some(loc) = self.uniform_slot(effect, name, &[value as f32]) {
            self.ctx.uniform1i(loc, value);
        }
    }

    pub fn set_bool(&mut self, effect: EffectHandle, name: &str, value: bool) {
        self.set_int(effect, name, value as i32);
    }

    pub fn set_int_array(&mut self, effect: EffectHandle, name: &str, values: &[i32]) {
        let as_f32: Vec<f32> = values.iter().map(|v| *v as f32).collect();
        if let Some(loc) = self.uniform_slot(effect, name, &as_f32) {
            self.ctx.uniform1iv(loc, values);
        }
    }

    pub fn set_float(&mut self, effect: EffectHandle, name: &str, value: f32) {
        if let Some(loc) = self.uniform_slot(effect, name, &[value]) {
            self.ctx.uniform1f(loc, value);
        }
    }

    pub fn set_float2(&mut self, effect: EffectHandle, name: &str, x: f32, y: f32) {
        if let Some(loc) = self.uniform_slot(effect, name, &[x, y]) {
            self.ctx.uniform2f(loc, x, y);
        }
    }

    pub fn set_float3(&mut self, effect: EffectHandle, name: &str, x: f32, y: f32, z: f32) {
        if let Some(loc) = self.uniform_slot(effect, name, &[x, y, z]) {
            self.ctx.uniform3f(loc, x, y, z);
        }
    }

    pub fn set_float4(&mut self, effect: EffectHandle, name: &str, x: f32, y: f32, z: f32, w: f32) {
        if let Some(loc) = self.uniform_slot(effect, name, &[x, y, z, w]) {
            self.ctx.uniform4f(loc, x, y, z, w);
        }
    }

    pub fn set_float_array(&mut self, effect: EffectHandle, name: &str, values: &[f32]) {
        if let Some(loc) = self.uniform_slot(effect, name, values) {
            self.ctx.uniform1fv(loc, values);
        }
    }

    pub fn set_array(&mut self, effect: EffectHandle, name: &str, values: &[f32]) {
        self.set_float_array(effect, name, values);
    }

    pub fn set_vector3(&mut self, effect: EffectHandle, name: &str, v: Vec3) {
        self.set_float3(effect, name, v.x, v.y, v.z);
    }

    pub fn set_color3(&mut self, effect: EffectHandle, name: &str, color: Vec3) {
        self.set_float3(effect, name, color.x, color.y, color.z);
    }

    pub fn set_color4(&mut self, effect: EffectHandle, name: &str, color: Vec3, alpha: f32) {
        self.set_float4(effect, name, color.x, color.y, color.z, alpha);
    }

    pub fn set_matrix(&mut self, effect: EffectHandle, name: &str, m: &Mat4) {
        let cols = m.to_cols_array();
        if let Some(loc) = self.uniform_slot(effect, name, &cols) {
            self.ctx.uniform_matrix4fv(loc, &cols);
        }
    }

    /// Several 4x4 matrices packed column-major.
    pub fn set_matrices(&mut self, effect: EffectHandle, name: &str, packed: &[f32]) {
        if let Some(loc) = self.uniform_slot(effect, name, packed) {
            self.ctx.uniform_matrix4fv(loc, packed);
        }
    }

    pub fn set_matrix3x3(&mut self, effect: EffectHandle, name: &str, m: &[f32; 9]) {
        if let Some(loc) = self.uniform_slot(effect, name, m) {
            self.ctx.uniform_matrix3fv(loc, m);
        }
    }

    pub fn set_matrix2x2(&mut self, effect: EffectHandle, name: &str, m: &[f32; 4]) {
        if let Some(loc) = self.uniform_slot(effect, name, m) {
            self.ctx.uniform_matrix2fv(loc, m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_go_after_version_line() {
        let src = "#version 300 es\nvoid main(void) {}\n";
        let out = inject_defines(src, "#define A\n#define B");
        assert_eq!(out, "#version 300 es\n#define A\n#define B\nvoid main(void) {}\n");
    }

    #[test]
    fn defines_prepend_without_version() {
        assert_eq!(inject_defines("void main(){}", "#define X"), "#define X\nvoid main(){}");
        assert_eq!(inject_defines("void main(){}", ""), "void main(){}");
    }

    #[test]
    fn cache_key_includes_attributes() {
        let a = EffectCache::key("m", "#define A", &["position".to_string()]);
        let b = EffectCache::key("m", "#define A", &["position".to_string(), "uv".to_string()]);
        assert_ne!(a, b);
    }
}
