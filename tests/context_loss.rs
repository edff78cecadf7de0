use std::cell::Cell;
use std::rc::Rc;

use node_forge_engine::engine::{FillMode, TextureCreationOptions};
use node_forge_engine::gl::GlCall;
use node_forge_engine::node_material::{BlockKind, BoundNodeMaterial, InputValue, NodeMaterial, SystemValue};
use node_forge_engine::scene::{Camera, Scene};
use node_forge_engine::{Engine, EngineOptions};

fn flat_material() -> NodeMaterial {
    let mut m = NodeMaterial::new("flat");
    let position = m.add_input("position", |i| i.set_as_attribute("position"));
    let wvp = m.add_input("wvp", |i| i.set_as_system_value(SystemValue::WorldViewProjection));
    let transform = m.add_block("transform", BlockKind::transform());
    let vout = m.add_block("vout", BlockKind::VertexOutput);
    let color = m.add_input("color", |i| i.set_value(InputValue::Color3(glam::Vec3::new(0.2, 0.4, 0.6))));
    let fout = m.add_block("fout", BlockKind::FragmentOutput);
    m.connect(position, "output", transform, "vector").unwrap();
    m.connect(wvp, "output", transform, "transform").unwrap();
    m.connect(transform, "output", vout, "vector").unwrap();
    m.connect(color, "output", fout, "rgb").unwrap();
    m
}

#[test]
fn render_loop_resumes_after_restore_with_same_handles() {
    let (mut engine, gl) = Engine::headless(32, 32, EngineOptions::default()).unwrap();
    let mut material = flat_material();
    let bound = BoundNodeMaterial::build(&mut engine, &mut material).unwrap();
    let effect = bound.effect;
    let vb = engine.create_vertex_buffer(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
    let texture = engine
        .create_raw_texture(Some(&[255; 4 * 4]), 2, 2, TextureCreationOptions::default())
        .unwrap();

    let frames = Rc::new(Cell::new(0));
    let counter = frames.clone();
    let scene = Scene::new(Camera::default());
    let mut bound = bound;
    engine.run_render_loop(move |e| {
        counter.set(counter.get() + 1);
        if bound.bind(e, &material, &scene) {
            bound.bind_world(e, &material, &scene, &glam::Mat4::IDENTITY);
            e.bind_buffers_directly(vb, None, &[3], 3, bound.effect);
            e.draw_arrays_type(FillMode::Triangle, 0, 3, 1);
        }
    });

    assert_eq!(engine.run_frames(2, 16.0), 2);
    assert_eq!(engine.last_frame_draw_calls(), 1);

    gl.lose_context();
    assert_eq!(engine.run_frames(3, 16.0), 0);
    assert!(engine.is_context_lost());
    assert_eq!(frames.get(), 2);

    gl.restore_context();
    gl.clear_calls();
    assert_eq!(engine.run_frames(2, 16.0), 2);
    assert_eq!(frames.get(), 4);
    assert_eq!(engine.last_frame_draw_calls(), 1);
    assert!(gl.count(GlCall::is_draw) >= 2);

    let e = engine.effect(effect).unwrap();
    assert!(e.is_ready());
    assert!(gl.is_program_alive(e.program()));
    assert!(gl.is_buffer_alive(engine.buffer(vb).unwrap().gl_name()));
    assert!(gl.is_texture_alive(engine.texture(texture).unwrap().gl_name()));
}

#[test]
fn calls_during_loss_never_reach_the_context() {
    let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
    gl.lose_context();
    engine.poll_context_state();
    gl.clear_calls();
    engine.clear(Some([1.0, 0.0, 0.0, 1.0]), true, true, true);
    let vb = engine.create_vertex_buffer(&[0.0; 3]);
    assert!(vb.is_some());
    engine.draw_arrays_type(FillMode::Triangle, 0, 3, 1);
    assert!(gl.calls().is_empty());
}
