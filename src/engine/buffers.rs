//! Vertex, index, uniform and instance buffers, vertex-array objects and
//! vertex input binding.

use std::sync::Arc;

use crate::engine::Engine;
use crate::engine::capabilities::CapabilityFallback;
use crate::engine::constants::BufferUsage;
use crate::engine::effect::EffectHandle;
use crate::engine::resources::{BufferContents, BufferHandle, BufferKind, GpuBuffer, Handle};
use crate::gl::consts::{self, GlEnum};
use crate::gl::{GlName, VertexAttribPointer};

/// How one effect attribute reads from a vertex buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct VertexBufferBinding {
    /// Attribute name the binding feeds (`position`, `uv`, ...).
    pub kind: String,
    pub buffer: BufferHandle,
    /// Component count, 1 to 4.
    pub size: i32,
    pub data_type: GlEnum,
    pub normalized: bool,
    /// Byte stride between vertices; `0` means tightly packed.
    pub stride: i32,
    /// Byte offset of the first component.
    pub offset: i32,
    /// Instancing divisor; `0` advances per vertex.
    pub divisor: u32,
}

impl VertexBufferBinding {
    /// Float attribute with stride and offset counted in floats.
    pub fn float(kind: impl Into<String>, buffer: BufferHandle, size: i32, stride: i32, offset: i32) -> Self {
        Self {
            kind: kind.into(),
            buffer,
            size,
            data_type: consts::FLOAT,
            normalized: false,
            stride: stride * 4,
            offset: offset * 4,
            divisor: 0,
        }
    }
}

/// One attribute sourced from an instance buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceAttribute {
    pub location: u32,
    pub size: i32,
    /// Bytes.
    pub stride: i32,
    /// Bytes.
    pub offset: i32,
    pub divisor: u32,
}

impl InstanceAttribute {
    /// The four `vec4` columns of a per-instance world matrix starting at `first_location`.
    pub fn world_matrix(first_location: u32) -> [InstanceAttribute; 4] {
        std::array::from_fn(|i| InstanceAttribute {
            location: first_location + i as u32,
            size: 4,
            stride: 64,
            offset: i as i32 * 16,
            divisor: 1,
        })
    }
}

#[derive(Debug)]
pub struct VertexArrayObject {
    pub(crate) name: GlName,
    pub(crate) bindings: Vec<VertexBufferBinding>,
    pub(crate) index_buffer: Option<BufferHandle>,
    pub(crate) effect: EffectHandle,
}

impl VertexArrayObject {
    pub fn gl_name(&self) -> GlName {
        self.name
    }
}

pub type VertexArrayHandle = Handle<VertexArrayObject>;

fn f32_bytes(data: &[f32]) -> Arc<[u8]> {
    Arc::from(bytemuck::cast_slice::<f32, u8>(data))
}

fn index_bytes(indices: &[u32], use_32bit: bool) -> Arc<[u8]> {
    if use_32bit {
        Arc::from(bytemuck::cast_slice::<u32, u8>(indices))
    } else {
        let short: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
        Arc::from(bytemuck::cast_slice::<u16, u8>(&short))
    }
}

/// Write `bytes` into a retained copy, growing it if needed.
fn patch_retained(buffer: &mut GpuBuffer, byte_offset: usize, bytes: &[u8]) {
    let Some(retained) = buffer.retained.as_mut() else {
        return;
    };
    let mut data: Vec<u8> = match retained {
        BufferContents::Init(d) => d.to_vec(),
        BufferContents::Sized(n) => vec![0u8; *n],
    };
    let end = byte_offset + bytes.len();
    if data.len() < end {
        data.resize(end, 0);
    }
    data[byte_offset..end].copy_from_slice(bytes);
    *retained = BufferContents::Init(Arc::from(data));
}

impl Engine {
    // ── Creation ─────────────────────────────────────────────────────────

    pub(crate) fn create_buffer_internal(
        &mut self,
        kind: BufferKind,
        usage: BufferUsage,
        contents: BufferContents,
        is_32bit_indices: bool,
    ) -> Option<BufferHandle> {
        let byte_len = match &contents {
            BufferContents::Init(d) => d.len(),
            BufferContents::Sized(n) => *n,
        };
        let mut record = GpuBuffer {
            name: 0,
            kind,
            usage,
            byte_len,
            is_32bit_indices,
            retained: None,
            references: 1,
        };
        if self.can_issue() {
            let Some(name) = self.ctx.create_buffer() else {
                log::error!("failed to allocate {kind:?} buffer ({byte_len} bytes)");
                return None;
            };
            record.name = name;
            self.upload_buffer(&record, &contents);
        } else {
            log::debug!("context lost: {kind:?} buffer creation deferred until restore");
        }
        if self.handles_context_loss() || record.name == 0 {
            record.retained = Some(contents);
        }
        Some(self.buffers.insert(record))
    }

    /// Bind, fill and unbind. The element-array binding belongs to the current
    /// VAO, so any VAO is unbound first.
    pub(crate) fn upload_buffer(&mut self, record: &GpuBuffer, contents: &BufferContents) {
        let target = record.kind.target();
        let ctx = self.ctx.as_mut();
        if target == consts::ELEMENT_ARRAY_BUFFER && self.caps.vertex_array_object {
            self.state.bind_vertex_array(ctx, 0);
        }
        self.state.bind_buffer(ctx, target, record.name);
        match contents {
            BufferContents::Init(data) => ctx.buffer_data(target, data, record.usage.gl()),
            BufferContents::Sized(size) => ctx.buffer_data_size(target, *size, record.usage.gl()),
        }
        self.state.bind_buffer(ctx, target, 0);
        if target == consts::ELEMENT_ARRAY_BUFFER {
            self.vertex_input.index_buffer = None;
        }
    }

    pub fn create_vertex_buffer(&mut self, data: &[f32]) -> Option<BufferHandle> {
        self.create_buffer_internal(BufferKind::Vertex, BufferUsage::Static, BufferContents::Init(f32_bytes(data)), false)
    }

    pub fn create_dynamic_vertex_buffer(&mut self, data: &[f32]) -> Option<BufferHandle> {
        self.create_buffer_internal(BufferKind::Vertex, BufferUsage::Dynamic, BufferContents::Init(f32_bytes(data)), false)
    }

    /// Index buffer; 32-bit indices are used only when some index needs them.
    pub fn create_index_buffer(&mut self, indices: &[u32], updatable: bool) -> Option<BufferHandle> {
        let use_32bit = indices.iter().any(|&i| i > u16::MAX as u32);
        let usage = if updatable { BufferUsage::Dynamic } else { BufferUsage::Static };
        self.create_buffer_internal(BufferKind::Index, usage, BufferContents::Init(index_bytes(indices, use_32bit)), use_32bit)
    }

    /// `None` when the device has no uniform buffers; callers fall back to
    /// plain uniforms.
    pub fn create_uniform_buffer(&mut self, data: &[f32]) -> Option<BufferHandle> {
        self.create_uniform_buffer_with_usage(data, BufferUsage::Static)
    }

    pub fn create_dynamic_uniform_buffer(&mut self, data: &[f32]) -> Option<BufferHandle> {
        self.create_uniform_buffer_with_usage(data, BufferUsage::Dynamic)
    }

    fn create_uniform_buffer_with_usage(&mut self, data: &[f32], usage: BufferUsage) -> Option<BufferHandle> {
        if !self.caps.uniform_buffers {
            self.caps.record_fallback(CapabilityFallback::UniformBuffersUnavailable);
            return None;
        }
        self.create_buffer_internal(BufferKind::Uniform, usage, BufferContents::Init(f32_bytes(data)), false)
    }

    /// Dynamic per-instance storage of `capacity` bytes.
    pub fn create_instances_buffer(&mut self, capacity: usize) -> Option<BufferHandle> {
        self.create_buffer_internal(BufferKind::Instances, BufferUsage::Dynamic, BufferContents::Sized(capacity), false)
    }

    pub fn delete_instances_buffer(&mut self, buffer: impl Into<Option<BufferHandle>>) -> bool {
        self.release_buffer(buffer)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&GpuBuffer> {
        self.buffers.get(handle)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Add a reference; the buffer then needs one more release to be freed.
    pub fn retain_buffer(&mut self, handle: BufferHandle) -> bool {
        match self.buffers.get_mut(handle) {
            Some(b) => {
                b.references += 1;
                true
            }
            None => false,
        }
    }

    // ── Updates ──────────────────────────────────────────────────────────

    /// Write `bytes` at `byte_offset`. Growing is only allowed from offset 0.
    fn update_buffer_bytes(&mut self, handle: BufferHandle, byte_offset: usize, bytes: &[u8]) -> bool {
        let can_issue = self.can_issue();
        let Some(buffer) = self.buffers.get_mut(handle) else {
            return false;
        };
        let end = byte_offset + bytes.len();
        let grow = end > buffer.byte_len;
        if grow && byte_offset != 0 {
            log::warn!(
                "buffer update out of range: {end} bytes into a {}-byte {:?} buffer",
                buffer.byte_len,
                buffer.kind
            );
            return false;
        }
        patch_retained(buffer, byte_offset, bytes);
        if grow {
            buffer.byte_len = end;
        }
        if !can_issue || buffer.name == 0 {
            return true;
        }

        let (name, target, usage) = (buffer.name, buffer.kind.target(), buffer.usage.gl());
        let ctx = self.ctx.as_mut();
        if target == consts::ELEMENT_ARRAY_BUFFER && self.caps.vertex_array_object {
            self.state.bind_vertex_array(ctx, 0);
            self.vertex_input.index_buffer = None;
        }
        self.state.bind_buffer(ctx, target, name);
        if grow {
            ctx.buffer_data(target, bytes, usage);
        } else {
            ctx.buffer_sub_data(target, byte_offset, bytes);
        }
        if target == consts::ELEMENT_ARRAY_BUFFER {
            self.state.bind_buffer(ctx, target, 0);
        }
        true
    }

    pub fn update_dynamic_vertex_buffer(&mut self, handle: BufferHandle, data: &[f32], byte_offset: usize) -> bool {
        self.update_buffer_bytes(handle, byte_offset, bytemuck::cast_slice(data))
    }

    /// Indices keep the width chosen at creation.
    pub fn update_dynamic_index_buffer(&mut self, handle: BufferHandle, indices: &[u32], byte_offset: usize) -> bool {
        let Some(use_32bit) = self.buffers.get(handle).map(|b| b.is_32bit_indices) else {
            return false;
        };
        if !use_32bit && indices.iter().any(|&i| i > u16::MAX as u32) {
            log::warn!("index exceeds 16-bit range of an existing 16-bit index buffer");
            return false;
        }
        let bytes = index_bytes(indices, use_32bit);
        self.update_buffer_bytes(handle, byte_offset, &bytes)
    }

    /// Update `data` floats starting at float `offset`.
    pub fn update_uniform_buffer(&mut self, handle: BufferHandle, data: &[f32], offset: usize) -> bool {
        self.update_buffer_bytes(handle, offset * 4, bytemuck::cast_slice(data))
    }

    pub fn bind_uniform_buffer(&mut self, handle: Option<BufferHandle>) {
        if !self.can_issue() {
            return;
        }
        let name = handle.and_then(|h| self.buffers.get(h)).map_or(0, |b| b.name);
        self.state.bind_buffer(self.ctx.as_mut(), consts::UNIFORM_BUFFER, name);
    }

    pub fn bind_uniform_buffer_base(&mut self, handle: BufferHandle, location: u32) {
        if !self.can_issue() {
            return;
        }
        if let Some(b) = self.buffers.get(handle) {
            self.ctx.bind_buffer_base(consts::UNIFORM_BUFFER, location, b.name);
        }
    }

    // ── Release ──────────────────────────────────────────────────────────

    /// Drop one reference. Returns `true` when the GPU storage was freed.
    /// Releasing `None` or an already-freed handle does nothing.
    pub fn release_buffer(&mut self, handle: impl Into<Option<BufferHandle>>) -> bool {
        let Some(h) = handle.into() else {
            return false;
        };
        let Some(buffer) = self.buffers.get_mut(h) else {
            return false;
        };
        buffer.references = buffer.references.saturating_sub(1);
        if buffer.references > 0 {
            return false;
        }
        self.release_buffer_storage(h);
        true
    }

    pub(crate) fn release_buffer_storage(&mut self, handle: BufferHandle) {
        let Some(buffer) = self.buffers.remove(handle) else {
            return;
        };
        if buffer.name != 0 && self.can_issue() {
            self.ctx.delete_buffer(buffer.name);
        }
        self.state.forget_buffer(buffer.name);
        if self.vertex_input.index_buffer == Some(handle) {
            self.vertex_input.index_buffer = None;
        }
        self.vertex_input.bindings = None;
    }

    // ── Vertex input ─────────────────────────────────────────────────────

    fn bind_index_buffer(&mut self, index_buffer: Option<BufferHandle>) {
        if self.vertex_input.index_buffer == index_buffer {
            return;
        }
        self.vertex_input.index_buffer = index_buffer;
        let (name, is_32bit) = index_buffer
            .and_then(|h| self.buffers.get(h))
            .map_or((0, false), |b| (b.name, b.is_32bit_indices));
        self.vertex_input.uint_indices = is_32bit;
        self.state.bind_buffer(self.ctx.as_mut(), consts::ELEMENT_ARRAY_BUFFER, name);
    }

    /// Point every attribute of `effect` at its binding and disable the rest.
    fn bind_vertex_buffers_attributes(&mut self, bindings: &[VertexBufferBinding], effect: EffectHandle) {
        let Some(eff) = self.effects.get(effect) else {
            return;
        };
        let locations: Vec<(String, i32)> = eff
            .attribute_names
            .iter()
            .cloned()
            .zip(eff.attribute_locations.iter().copied())
            .collect();

        let ctx = self.ctx.as_mut();
        let mut used: Vec<u32> = Vec::with_capacity(locations.len());
        for (name, location) in locations {
            if location < 0 {
                continue;
            }
            let Some(binding) = bindings.iter().find(|b| b.kind == name) else {
                continue;
            };
            let Some(buffer) = self.buffers.get(binding.buffer) else {
                log::warn!("vertex binding '{name}' references a released buffer");
                continue;
            };
            let index = location as u32;
            self.state.bind_buffer(ctx, consts::ARRAY_BUFFER, buffer.name);
            self.state.vertex_attrib_pointer(
                ctx,
                buffer.name,
                VertexAttribPointer {
                    index,
                    size: binding.size,
                    data_type: binding.data_type,
                    normalized: binding.normalized,
                    stride: binding.stride,
                    offset: binding.offset,
                },
            );
            self.state.enable_attrib(ctx, index);
            if self.caps.instanced_arrays {
                self.state.attrib_divisor(ctx, index, binding.divisor);
            }
            used.push(index);
        }
        for index in self.state.enabled_attribs() {
            if !used.contains(&index) {
                self.state.disable_attrib(ctx, index);
            }
        }
    }

    /// Bind vertex and index buffers for `effect`. Repeating the previous
    /// bindings for the same effect issues nothing.
    pub fn bind_buffers(
        &mut self,
        bindings: &[VertexBufferBinding],
        index_buffer: Option<BufferHandle>,
        effect: EffectHandle,
    ) {
        if !self.can_issue() {
            return;
        }
        let unchanged = self
            .vertex_input
            .bindings
            .as_ref()
            .is_some_and(|(b, e)| *e == effect && b.as_slice() == bindings);
        if !unchanged {
            if self.caps.vertex_array_object {
                self.state.bind_vertex_array(self.ctx.as_mut(), 0);
                if self.state.bound_buffer(consts::ELEMENT_ARRAY_BUFFER).is_none() {
                    self.vertex_input.index_buffer = None;
                }
            }
            self.vertex_input.bindings = Some((bindings.to_vec(), effect));
            self.bind_vertex_buffers_attributes(bindings, effect);
        }
        self.bind_index_buffer(index_buffer);
    }

    /// Bind a single interleaved float buffer whose layout follows the effect's
    /// attribute order: `declaration[i]` floats for attribute `i`.
    pub fn bind_buffers_directly(
        &mut self,
        buffer: BufferHandle,
        index_buffer: Option<BufferHandle>,
        declaration: &[i32],
        stride_floats: i32,
        effect: EffectHandle,
    ) {
        let Some(names) = self.effects.get(effect).map(|e| e.attribute_names.clone()) else {
            return;
        };
        let mut offset = 0;
        let bindings: Vec<VertexBufferBinding> = names
            .into_iter()
            .zip(declaration.iter().copied())
            .map(|(name, size)| {
                let b = VertexBufferBinding::float(name, buffer, size, stride_floats, offset);
                offset += size;
                b
            })
            .collect();
        self.bind_buffers(&bindings, index_buffer, effect);
    }

    /// Upload per-instance data and point `attributes` at it.
    pub fn update_and_bind_instances_buffer(
        &mut self,
        buffer: BufferHandle,
        data: &[f32],
        attributes: &[InstanceAttribute],
    ) -> bool {
        if !self.caps.instanced_arrays {
            self.caps.record_fallback(CapabilityFallback::InstancingUnavailable);
            return false;
        }
        if !self.update_buffer_bytes(buffer, 0, bytemuck::cast_slice(data)) {
            return false;
        }
        if !self.can_issue() {
            return true;
        }
        let Some(name) = self.buffers.get(buffer).map(|b| b.name) else {
            return false;
        };
        let ctx = self.ctx.as_mut();
        self.state.bind_buffer(ctx, consts::ARRAY_BUFFER, name);
        for attr in attributes {
            self.state.vertex_attrib_pointer(
                ctx,
                name,
                VertexAttribPointer {
                    index: attr.location,
                    size: attr.size,
                    data_type: consts::FLOAT,
                    normalized: false,
                    stride: attr.stride,
                    offset: attr.offset,
                },
            );
            self.state.enable_attrib(ctx, attr.location);
            self.state.attrib_divisor(ctx, attr.location, attr.divisor);
            if !self.vertex_input.instance_attribs.contains(&attr.location) {
                self.vertex_input.instance_attribs.push(attr.location);
            }
        }
        self.vertex_input.bindings = None;
        true
    }

    pub fn unbind_instance_attributes(&mut self) {
        if !self.can_issue() {
            return;
        }
        let ctx = self.ctx.as_mut();
        for location in std::mem::take(&mut self.vertex_input.instance_attribs) {
            self.state.disable_attrib(ctx, location);
            self.state.attrib_divisor(ctx, location, 0);
        }
        self.vertex_input.bindings = None;
    }

    pub fn unbind_all_attributes(&mut self) {
        if !self.can_issue() {
            return;
        }
        let ctx = self.ctx.as_mut();
        for index in self.state.enabled_attribs() {
            self.state.disable_attrib(ctx, index);
        }
        self.vertex_input.bindings = None;
    }

    // ── Vertex array objects ─────────────────────────────────────────────

    pub(crate) fn record_vertex_array_name(
        &mut self,
        bindings: &[VertexBufferBinding],
        index_buffer: Option<BufferHandle>,
        effect: EffectHandle,
    ) -> Option<GlName> {
        let name = self.ctx.create_vertex_array()?;
        self.state.bind_vertex_array(self.ctx.as_mut(), name);
        self.vertex_input = Default::default();
        self.bind_vertex_buffers_attributes(bindings, effect);
        if let Some(b) = index_buffer.and_then(|h| self.buffers.get(h)) {
            let n = b.name;
            self.state.bind_buffer(self.ctx.as_mut(), consts::ELEMENT_ARRAY_BUFFER, n);
        }
        self.state.bind_vertex_array(self.ctx.as_mut(), 0);
        self.vertex_input = Default::default();
        Some(name)
    }

    /// Capture a binding set into a VAO. `None` without VAO support.
    pub fn record_vertex_array_object(
        &mut self,
        bindings: &[VertexBufferBinding],
        index_buffer: Option<BufferHandle>,
        effect: EffectHandle,
    ) -> Option<VertexArrayHandle> {
        if !self.caps.vertex_array_object {
            self.caps.record_fallback(CapabilityFallback::VertexArrayObjectsUnavailable);
            return None;
        }
        let name = if self.can_issue() {
            match self.record_vertex_array_name(bindings, index_buffer, effect) {
                Some(n) => n,
                None => {
                    log::error!("failed to allocate vertex array object");
                    return None;
                }
            }
        } else {
            0
        };
        Some(self.vertex_arrays.insert(VertexArrayObject {
            name,
            bindings: bindings.to_vec(),
            index_buffer,
            effect,
        }))
    }

    pub fn bind_vertex_array_object(&mut self, vao: VertexArrayHandle, index_buffer: Option<BufferHandle>) {
        if !self.can_issue() {
            return;
        }
        let Some(name) = self.vertex_arrays.get(vao).map(|v| v.name) else {
            return;
        };
        self.state.bind_vertex_array(self.ctx.as_mut(), name);
        self.vertex_input.bindings = None;
        self.vertex_input.index_buffer = index_buffer;
        self.vertex_input.uint_indices = index_buffer
            .and_then(|h| self.buffers.get(h))
            .is_some_and(|b| b.is_32bit_indices);
    }

    pub fn release_vertex_array_object(&mut self, vao: impl Into<Option<VertexArrayHandle>>) -> bool {
        let Some(record) = vao.into().and_then(|h| self.vertex_arrays.remove(h)) else {
            return false;
        };
        if record.name != 0 && self.can_issue() {
            if self.state.bindings.vertex_array == Some(record.name) {
                self.state.bind_vertex_array(self.ctx.as_mut(), 0);
            }
            self.ctx.delete_vertex_array(record.name);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::gl::GlCall;

    #[test]
    fn index_width_follows_largest_index() {
        let (mut engine, _h) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        let small = engine.create_index_buffer(&[0, 1, 2], false).unwrap();
        let large = engine.create_index_buffer(&[0, 1, 70_000], false).unwrap();
        assert!(!engine.buffer(small).unwrap().is_32bit_indices);
        assert_eq!(engine.buffer(small).unwrap().byte_len, 6);
        assert!(engine.buffer(large).unwrap().is_32bit_indices);
        assert_eq!(engine.buffer(large).unwrap().byte_len, 12);
    }

    #[test]
    fn shared_buffer_needs_every_release() {
        let (mut engine, handle) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        let vb = engine.create_vertex_buffer(&[0.0; 6]).unwrap();
        let name = engine.buffer(vb).unwrap().gl_name();
        engine.retain_buffer(vb);
        assert!(!engine.release_buffer(vb));
        assert!(handle.is_buffer_alive(name));
        assert!(engine.release_buffer(vb));
        assert!(!handle.is_buffer_alive(name));
        assert!(!engine.release_buffer(vb));
        assert!(!engine.release_buffer(None));
    }

    #[test]
    fn out_of_range_update_is_rejected() {
        let (mut engine, handle) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        let vb = engine.create_dynamic_vertex_buffer(&[0.0; 4]).unwrap();
        handle.clear_calls();
        assert!(engine.update_dynamic_vertex_buffer(vb, &[1.0, 2.0], 8));
        assert!(!engine.update_dynamic_vertex_buffer(vb, &[1.0, 2.0], 12));
        assert_eq!(
            handle.count(|c| matches!(c, GlCall::BufferSubData { offset: 8, len: 8, .. })),
            1
        );
    }

    #[test]
    fn uniform_buffers_absent_on_minimal_device() {
        use crate::gl::{HeadlessCapabilities, HeadlessContext};
        let ctx = HeadlessContext::with_capabilities(8, 8, HeadlessCapabilities::minimal());
        let mut engine = Engine::new(Box::new(ctx), EngineOptions::default()).unwrap();
        assert!(engine.create_uniform_buffer(&[0.0; 16]).is_none());
        assert!(engine
            .get_caps()
            .has_fallback(&CapabilityFallback::UniformBuffersUnavailable));
    }
}
