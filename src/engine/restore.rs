//! Context loss detection and rebuild.
//!
//! While the context is lost no call reaches it; resources created meanwhile
//! get records with null names. On restore every record is recreated from its
//! CPU-side description in a fixed order: effects, textures, buffers, vertex
//! arrays, queries, transform feedbacks. Handles stay valid throughout; only
//! the underlying names change.

use crate::engine::Engine;
use crate::engine::capabilities::EngineCapabilities;
use crate::engine::effect::EffectState;
use crate::engine::resources::{BufferContents, GpuBuffer};

impl Engine {
    /// Compare the context's loss flag with the engine's and react to a change.
    /// Runs at the start of every rendered frame.
    pub fn poll_context_state(&mut self) {
        let lost = self.ctx.is_context_lost();
        if lost && !self.context_was_lost {
            self.handle_context_lost();
        } else if !lost && self.context_was_lost {
            self.handle_context_restored();
        }
    }

    fn handle_context_lost(&mut self) {
        log::warn!("graphics context lost");
        self.context_was_lost = true;
        self.render_targets.clear();
        self.on_context_lost.notify(&());
    }

    fn handle_context_restored(&mut self) {
        log::info!("graphics context restored, rebuilding resources");
        if !self.handles_context_loss() {
            log::warn!("context loss handling is disabled; resource contents were not retained");
        }
        self.context_was_lost = false;
        self.caps = EngineCapabilities::query(self.ctx.as_ref(), &self.options);
        self.wipe_caches(true);
        self.bound_transform_feedback = None;

        let effects = self.rebuild_effects();
        let textures = self.rebuild_textures();
        let buffers = self.rebuild_buffers();
        self.rebuild_vertex_arrays();
        self.rebuild_queries();

        // The rebuild leaves bindings behind.
        self.wipe_caches(true);
        log::info!("rebuilt {effects} effects, {textures} textures, {buffers} buffers");
        self.on_context_restored.notify(&());
    }

    fn rebuild_effects(&mut self) -> usize {
        let handles = self.effects.handles_in_creation_order();
        for &h in &handles {
            if let Some(effect) = self.effects.get_mut(h) {
                effect.program = 0;
                effect.state = EffectState::Pending;
            }
            self.compile_effect(h);
        }
        handles.len()
    }

    fn rebuild_textures(&mut self) -> usize {
        let handles = self.textures.handles_in_creation_order();
        for &h in &handles {
            let Some(tex) = self.textures.get_mut(h) else {
                continue;
            };
            tex.name = 0;
            tex.framebuffer = 0;
            tex.depth_stencil_buffer = 0;
            let reload = match (tex.url(), &tex.retained, &tex.load_token) {
                (Some(url), None, None) => Some(url.to_string()),
                _ => None,
            };
            if !self.allocate_texture(h) {
                log::error!("failed to recreate texture {h:?}");
                continue;
            }
            if let Some(url) = reload {
                log::debug!("reloading texture '{url}'");
                let token = self.loader.request_texture(&url, h);
                if let Some(tex) = self.textures.get_mut(h) {
                    tex.is_ready = false;
                    tex.load_token = Some(token);
                }
            }
        }
        handles.len()
    }

    fn rebuild_buffers(&mut self) -> usize {
        let handles = self.buffers.handles_in_creation_order();
        for &h in &handles {
            let Some(buffer) = self.buffers.get(h) else {
                continue;
            };
            let contents = buffer.retained.clone().unwrap_or(BufferContents::Sized(buffer.byte_len));
            let Some(name) = self.ctx.create_buffer() else {
                log::error!("failed to recreate buffer {h:?}");
                continue;
            };
            let record = GpuBuffer {
                name,
                kind: buffer.kind,
                usage: buffer.usage,
                byte_len: buffer.byte_len,
                is_32bit_indices: buffer.is_32bit_indices,
                retained: None,
                references: 1,
            };
            self.upload_buffer(&record, &contents);
            let keep = self.handles_context_loss();
            if let Some(buffer) = self.buffers.get_mut(h) {
                buffer.name = name;
                if !keep {
                    buffer.retained = None;
                }
            }
        }
        handles.len()
    }

    fn rebuild_vertex_arrays(&mut self) {
        for h in self.vertex_arrays.handles_in_creation_order() {
            let Some(vao) = self.vertex_arrays.get(h) else {
                continue;
            };
            let (bindings, index_buffer, effect) = (vao.bindings.clone(), vao.index_buffer, vao.effect);
            let name = self.record_vertex_array_name(&bindings, index_buffer, effect).unwrap_or_else(|| {
                log::error!("failed to recreate vertex array {h:?}");
                0
            });
            if let Some(vao) = self.vertex_arrays.get_mut(h) {
                vao.name = name;
            }
        }
    }

    fn rebuild_queries(&mut self) {
        for h in self.queries.handles_in_creation_order() {
            let name = self.ctx.create_query().unwrap_or(0);
            if let Some(q) = self.queries.get_mut(h) {
                q.name = name;
                q.active_target = None;
            }
        }
        for h in self.transform_feedbacks.handles_in_creation_order() {
            let name = self.ctx.create_transform_feedback().unwrap_or(0);
            if let Some(tf) = self.transform_feedbacks.get_mut(h) {
                tf.name = name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::config::EngineOptions;
    use crate::engine::{EffectCreationOptions, Engine, TextureCreationOptions};

    const VS: &str = "#version 300 es\nin vec3 position;\nvoid main() { gl_Position = vec4(position, 1.0); }\n";
    const FS: &str = "#version 300 es\nprecision highp float;\nout vec4 color;\nvoid main() { color = vec4(1.0); }\n";

    #[test]
    fn handles_survive_loss_and_restore() {
        let (mut engine, gl) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
        let lost = Rc::new(Cell::new(0));
        let restored = Rc::new(Cell::new(0));
        let (l, r) = (lost.clone(), restored.clone());
        engine.on_context_lost.add(move |_| l.set(l.get() + 1));
        engine.on_context_restored.add(move |_| r.set(r.get() + 1));

        let vb = engine.create_vertex_buffer(&[0.0; 9]).unwrap();
        let tex = engine.create_raw_texture(Some(&[255; 16]), 2, 2, TextureCreationOptions::default()).unwrap();
        let effect = engine.create_effect(EffectCreationOptions {
                base_name: "plain".into(),
                vertex_source: VS.into(),
                fragment_source: FS.into(),
                attributes: vec!["position".into()],
                ..Default::default()
            });
        let old_buffer = engine.buffer(vb).unwrap().gl_name();

        gl.lose_context();
        engine.poll_context_state();
        assert!(engine.is_context_lost());
        assert_eq!(lost.get(), 1);
        assert!(!gl.is_buffer_alive(old_buffer));

        gl.restore_context();
        engine.poll_context_state();
        assert!(!engine.is_context_lost());
        assert_eq!(restored.get(), 1);

        let new_buffer = engine.buffer(vb).unwrap().gl_name();
        assert!(gl.is_buffer_alive(new_buffer));
        assert_eq!(gl.buffer_size(new_buffer), Some(36));
        assert!(gl.is_texture_alive(engine.texture(tex).unwrap().gl_name()));
        assert!(engine.effect(effect).unwrap().is_ready());
        assert!(gl.is_program_alive(engine.effect(effect).unwrap().program()));
    }

    #[test]
    fn resources_created_while_lost_are_built_on_restore() {
        let (mut engine, gl) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
        gl.lose_context();
        engine.poll_context_state();
        let vb = engine.create_vertex_buffer(&[1.0, 2.0]).unwrap();
        assert_eq!(engine.buffer(vb).unwrap().gl_name(), 0);
        gl.restore_context();
        engine.poll_context_state();
        assert_ne!(engine.buffer(vb).unwrap().gl_name(), 0);
    }
}
