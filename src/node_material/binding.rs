//! Draw-time value binding: streams input-block values, system values,
//! textures and the `Scene` uniform block into a compiled material's effect.

use glam::{Mat4, Vec3};

use crate::engine::{BufferHandle, EffectHandle, Engine};
use crate::node_material::blocks::{BlockKind, InputBlock, InputSource, InputValue};
use crate::node_material::errors::NodeMaterialError;
use crate::node_material::graph::{BuildOptions, CompiledNodeMaterial, NodeMaterial};
use crate::node_material::types::{GlslVersion, SystemValue};
use crate::scene::Scene;

/// Build options matching what the engine's context can run.
pub fn build_options_for(engine: &Engine) -> BuildOptions {
    let caps = engine.get_caps();
    BuildOptions {
        glsl_version: if caps.webgl2 { GlslVersion::Es300 } else { GlslVersion::Es100 },
        support_uniform_buffers: caps.uniform_buffers,
        emit_comments: false,
    }
}

/// Upload `value` with the setter matching its type.
pub fn set_input_value(engine: &mut Engine, effect: EffectHandle, name: &str, value: InputValue) {
    match value {
        InputValue::Float(v) => engine.set_float(effect, name, v),
        InputValue::Int(v) => engine.set_int(effect, name, v),
        InputValue::Vector2(v) => engine.set_float2(effect, name, v.x, v.y),
        InputValue::Vector3(v) => engine.set_vector3(effect, name, v),
        InputValue::Vector4(v) => engine.set_float4(effect, name, v.x, v.y, v.z, v.w),
        InputValue::Color3(c) => engine.set_color3(effect, name, c),
        InputValue::Color4(c) => engine.set_color4(effect, name, Vec3::new(c.x, c.y, c.z), c.w),
        InputValue::Matrix(m) => engine.set_matrix(effect, name, &m),
    }
}

impl InputBlock {
    /// Push a scene-level value (constant, callback or scene system value).
    /// Per-mesh system values are sent by [`transmit_world`](Self::transmit_world).
    pub fn transmit(&self, engine: &mut Engine, effect: EffectHandle, uniform: &str, scene: &Scene) {
        match self.source() {
            InputSource::Value(_) | InputSource::Callback(_) if self.is_uniform() => {
                if let Some(value) = self.value() {
                    set_input_value(engine, effect, uniform, value);
                }
            }
            InputSource::SystemValue(sv) => match sv {
                SystemValue::View => engine.set_matrix(effect, uniform, &scene.camera.view),
                SystemValue::Projection => engine.set_matrix(effect, uniform, &scene.camera.projection),
                SystemValue::ViewProjection => engine.set_matrix(effect, uniform, &scene.view_projection()),
                SystemValue::CameraPosition => engine.set_vector3(effect, uniform, scene.camera.position),
                SystemValue::FogColor => engine.set_color3(effect, uniform, scene.fog_color),
                SystemValue::DeltaTime => engine.set_float(effect, uniform, (scene.delta_ms() / 1000.0) as f32),
                SystemValue::Time => engine.set_float(effect, uniform, (scene.elapsed_ms() / 1000.0) as f32),
                SystemValue::World | SystemValue::WorldView | SystemValue::WorldViewProjection => {}
            },
            _ => {}
        }
    }

    /// Push the per-mesh matrices.
    pub fn transmit_world(
        &self,
        engine: &mut Engine,
        effect: EffectHandle,
        uniform: &str,
        world: &Mat4,
        world_view: &Mat4,
        world_view_projection: &Mat4,
    ) {
        let m = match self.system_value() {
            Some(SystemValue::World) => world,
            Some(SystemValue::WorldView) => world_view,
            Some(SystemValue::WorldViewProjection) => world_view_projection,
            _ => return,
        };
        engine.set_matrix(effect, uniform, m);
    }
}

/// A compiled node material together with its effect and scene buffer.
pub struct BoundNodeMaterial {
    pub compiled: CompiledNodeMaterial,
    pub effect: EffectHandle,
    scene_buffer: Option<BufferHandle>,
}

impl BoundNodeMaterial {
    pub fn new(engine: &mut Engine, compiled: CompiledNodeMaterial) -> Self {
        let effect = engine.create_effect(compiled.effect_options());
        Self { compiled, effect, scene_buffer: None }
    }

    /// Build `material` for this engine and create its effect.
    pub fn build(engine: &mut Engine, material: &mut NodeMaterial) -> Result<Self, NodeMaterialError> {
        let compiled = material.build(&build_options_for(engine))?;
        Ok(Self::new(engine, compiled))
    }

    pub fn is_ready(&self, engine: &Engine) -> bool {
        engine.effect(self.effect).is_some_and(|e| e.is_ready())
    }

    /// Enable the effect and send everything that does not depend on the
    /// mesh. Returns `false` when the effect cannot be used.
    pub fn bind(&mut self, engine: &mut Engine, material: &NodeMaterial, scene: &Scene) -> bool {
        if !engine.enable_effect(self.effect) {
            return false;
        }
        let scene_block = self.compiled.uses_scene_block();
        for binding in &self.compiled.inputs {
            if scene_block && binding.system_value.is_some_and(SystemValue::in_scene_block) {
                continue;
            }
            if let Some(input) = material.block(binding.block).and_then(|b| b.as_input()) {
                input.transmit(engine, self.effect, &binding.uniform, scene);
            }
        }
        for texture in &self.compiled.textures {
            let handle = material.block(texture.block).and_then(|b| match &b.kind {
                BlockKind::Texture(t) => t.texture,
                _ => None,
            });
            engine.set_texture(self.effect, &texture.sampler, handle);
        }
        if scene_block {
            self.bind_scene_block(engine, scene);
        }
        true
    }

    fn bind_scene_block(&mut self, engine: &mut Engine, scene: &Scene) {
        let mut data = Vec::with_capacity(48);
        for m in [scene.view_projection(), scene.camera.view, scene.camera.projection] {
            data.extend_from_slice(&m.to_cols_array());
        }
        let buffer = match self.scene_buffer {
            Some(buffer) if engine.update_uniform_buffer(buffer, &data, 0) => Some(buffer),
            _ => engine.create_dynamic_uniform_buffer(&data),
        };
        self.scene_buffer = buffer;
        let binding = engine.effect(self.effect).and_then(|e| e.get_uniform_buffer_binding("Scene"));
        if let (Some(buffer), Some(binding)) = (buffer, binding) {
            engine.bind_uniform_buffer_base(buffer, binding);
        }
    }

    /// Send the per-mesh matrices for `world`.
    pub fn bind_world(&self, engine: &mut Engine, material: &NodeMaterial, scene: &Scene, world: &Mat4) {
        let world_view = scene.world_view(world);
        let world_view_projection = scene.world_view_projection(world);
        for binding in self.compiled.inputs.iter().filter(|b| b.system_value.is_some_and(SystemValue::is_per_mesh)) {
            if let Some(input) = material.block(binding.block).and_then(|b| b.as_input()) {
                input.transmit_world(engine, self.effect, &binding.uniform, world, &world_view, &world_view_projection);
            }
        }
    }

    pub fn dispose(self, engine: &mut Engine) {
        engine.release_effect(self.effect);
        engine.release_buffer(self.scene_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::gl::GlCall;
    use crate::node_material::BlockId;
    use crate::scene::Camera;
    use crate::node_material::ConnectionPointType;
    use glam::Vec4;
    use std::rc::Rc;

    fn tinted_material() -> (NodeMaterial, BlockId) {
        let mut m = NodeMaterial::new("tinted");
        let position = m.add_input("position", |i| i.set_as_attribute("position"));
        let wvp = m.add_input("wvp", |i| i.set_as_system_value(SystemValue::WorldViewProjection));
        let transform = m.add_block("transform", BlockKind::transform());
        let vout = m.add_block("vout", BlockKind::VertexOutput);
        let tint = m.add_input("tint", |i| i.set_value(InputValue::Color4(Vec4::new(1.0, 0.0, 0.0, 1.0))));
        let fout = m.add_block("fout", BlockKind::FragmentOutput);
        m.connect(position, "output", transform, "vector").unwrap();
        m.connect(wvp, "output", transform, "transform").unwrap();
        m.connect(transform, "output", vout, "vector").unwrap();
        m.connect(tint, "output", fout, "rgba").unwrap();
        (m, tint)
    }

    #[test]
    fn uniforms_are_sent_once_per_distinct_value() {
        let (mut engine, handle) = Engine::headless(64, 64, EngineOptions::default()).unwrap();
        let (mut material, _) = tinted_material();
        let mut bound = BoundNodeMaterial::build(&mut engine, &mut material).unwrap();
        assert!(bound.is_ready(&engine));

        let scene = Scene::new(Camera::default());
        assert!(bound.bind(&mut engine, &material, &scene));
        bound.bind_world(&mut engine, &material, &scene, &Mat4::IDENTITY);
        assert!(bound.bind(&mut engine, &material, &scene));
        bound.bind_world(&mut engine, &material, &scene, &Mat4::IDENTITY);

        let uploads = |len: usize| handle.count(|c| matches!(c, GlCall::Uniform { values, .. } if values.len() == len));
        assert_eq!(uploads(4), 1);
        assert_eq!(uploads(16), 1);
        bound.bind_world(&mut engine, &material, &scene, &Mat4::from_translation(Vec3::X));
        assert_eq!(uploads(16), 2);
    }

    #[test]
    fn constant_callback_is_still_uploaded() {
        let (mut engine, handle) = Engine::headless(64, 64, EngineOptions::default()).unwrap();
        let mut material = NodeMaterial::new("callback");
        let tint = material.add_input("tint", |i| {
            i.set_value_callback(ConnectionPointType::Color4, Rc::new(|| InputValue::Color4(Vec4::new(0.0, 1.0, 0.0, 1.0))));
            i.is_constant = true;
        });
        let fout = material.add_block("fout", BlockKind::FragmentOutput);
        material.connect(tint, "output", fout, "rgba").unwrap();

        let mut bound = BoundNodeMaterial::build(&mut engine, &mut material).unwrap();
        assert!(bound.compiled.fragment_source.contains("uniform vec4 u_tint;"));
        assert!(bound.bind(&mut engine, &material, &Scene::default()));
        let greens = handle.count(|c| matches!(c, GlCall::Uniform { values, .. } if values == &[0.0, 1.0, 0.0, 1.0]));
        assert_eq!(greens, 1);
    }

    #[test]
    fn failed_effect_refuses_to_bind() {
        let (mut engine, handle) = Engine::headless(64, 64, EngineOptions::default()).unwrap();
        handle.fail_shaders_containing("glFragColor");
        let (mut material, _) = tinted_material();
        let mut bound = BoundNodeMaterial::build(&mut engine, &mut material).unwrap();
        assert!(!bound.is_ready(&engine));
        assert!(!bound.bind(&mut engine, &material, &Scene::default()));
    }
}
