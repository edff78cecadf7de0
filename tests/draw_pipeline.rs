use node_forge_engine::engine::{EffectCreationOptions, EffectState, FillMode};
use node_forge_engine::gl::{GlCall, consts};
use node_forge_engine::{Engine, EngineOptions};

const VS: &str = "#version 300 es\nin vec2 position;\nin vec2 uv;\nout vec2 v_uv;\nvoid main() { v_uv = uv; gl_Position = vec4(position, 0.0, 1.0); }\n";
const FS: &str = "#version 300 es\nprecision highp float;\nin vec2 v_uv;\nout vec4 color;\nvoid main() { color = vec4(v_uv, 0.0, 1.0); }\n";

fn quad_effect(engine: &mut Engine) -> node_forge_engine::engine::EffectHandle {
    engine.create_effect(EffectCreationOptions {
        base_name: "quad".into(),
        vertex_source: VS.into(),
        fragment_source: FS.into(),
        attributes: vec!["position".into(), "uv".into()],
        ..Default::default()
    })
}

#[test]
fn twelve_float_buffer_binds_once_and_draws_three_vertices() {
    let (mut engine, gl) = Engine::headless(32, 32, EngineOptions::default()).unwrap();
    let effect = quad_effect(&mut engine);
    assert!(engine.enable_effect(effect));
    let vb = engine
        .create_vertex_buffer(&[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0])
        .unwrap();
    engine.apply_states();
    gl.clear_calls();

    engine.bind_buffers_directly(vb, None, &[2, 2], 4, effect);
    engine.draw_arrays_type(FillMode::Triangle, 0, 3, 1);

    let calls = gl.calls();
    let binds: Vec<usize> = calls.iter().enumerate().filter(|(_, c)| c.is_bind_buffer()).map(|(i, _)| i).collect();
    let draws: Vec<usize> = calls.iter().enumerate().filter(|(_, c)| c.is_draw()).map(|(i, _)| i).collect();
    assert_eq!(binds.len(), 1);
    assert_eq!(draws.len(), 1);
    assert!(binds[0] < draws[0]);
    assert_eq!(
        calls[draws[0]],
        GlCall::DrawArrays { mode: consts::TRIANGLES, first: 0, count: 3, instances: 1 }
    );
    assert_eq!(engine.draw_calls(), 1);
}

#[test]
fn repeated_binding_is_a_cache_hit() {
    let (mut engine, gl) = Engine::headless(32, 32, EngineOptions::default()).unwrap();
    let effect = quad_effect(&mut engine);
    engine.enable_effect(effect);
    let vb = engine.create_vertex_buffer(&[0.0; 12]).unwrap();
    engine.bind_buffers_directly(vb, None, &[2, 2], 4, effect);
    gl.clear_calls();
    engine.bind_buffers_directly(vb, None, &[2, 2], 4, effect);
    assert_eq!(gl.count(GlCall::is_bind_buffer), 0);
    assert_eq!(gl.count(|c| matches!(c, GlCall::VertexAttribPointer(_))), 0);
}

#[test]
fn failed_effect_uses_fallback_defines() {
    let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
    gl.fail_shaders_containing("BROKEN_PATH");
    let effect = engine.create_effect(EffectCreationOptions {
        base_name: "fallback".into(),
        vertex_source: VS.into(),
        fragment_source: FS.into(),
        attributes: vec!["position".into(), "uv".into()],
        defines: "#define BROKEN_PATH\n".into(),
        fallbacks: vec![String::new()],
        ..Default::default()
    });
    let e = engine.effect(effect).unwrap();
    assert!(e.is_ready());
    assert_eq!(e.used_fallback(), Some(0));
}

#[test]
fn unusable_effect_skips_draws() {
    let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
    gl.fail_shaders_containing("v_uv");
    let effect = quad_effect(&mut engine);
    assert_eq!(engine.effect(effect).unwrap().state(), EffectState::Failed);
    assert!(engine.effect(effect).unwrap().compilation_error().is_some());
    assert!(!engine.enable_effect(effect));
    engine.draw_arrays_type(FillMode::Triangle, 0, 3, 1);
    assert_eq!(gl.count(GlCall::is_draw), 0);
}

#[test]
fn render_loop_counts_draws_per_frame() {
    let (mut engine, _gl) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
    let effect = quad_effect(&mut engine);
    let vb = engine.create_vertex_buffer(&[0.0; 12]).unwrap();
    engine.run_render_loop(move |e| {
        e.enable_effect(effect);
        e.bind_buffers_directly(vb, None, &[2, 2], 4, effect);
        e.draw_arrays_type(FillMode::Triangle, 0, 3, 1);
        e.draw_arrays_type(FillMode::Triangle, 0, 3, 1);
    });
    assert_eq!(engine.run_frames(3, 16.0), 3);
    assert_eq!(engine.last_frame_draw_calls(), 2);
}

#[test]
fn double_release_is_a_noop() {
    let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
    let vb = engine.create_vertex_buffer(&[1.0; 6]).unwrap();
    let keep = engine.create_vertex_buffer(&[1.0; 6]).unwrap();
    let alive = gl.live_object_count();
    assert!(engine.release_buffer(vb));
    let after_first = gl.live_object_count();
    assert_eq!(after_first, alive - 1);
    assert!(!engine.release_buffer(vb));
    assert!(!engine.release_buffer(None));
    assert_eq!(gl.live_object_count(), after_first);
    assert_eq!(engine.buffer_count(), 1);
    assert!(engine.buffer(keep).is_some());
}

#[test]
fn compiling_an_effect_keeps_the_bound_program() {
    let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
    let first = quad_effect(&mut engine);
    engine.draw_arrays_type(FillMode::Triangle, 0, 3, 1);
    assert_eq!(gl.count(GlCall::is_draw), 0);

    assert!(engine.enable_effect(first));
    let second = engine.create_effect(EffectCreationOptions {
        base_name: "second".into(),
        vertex_source: VS.into(),
        fragment_source: FS.into(),
        attributes: vec!["position".into(), "uv".into()],
        ..Default::default()
    });
    assert!(engine.effect(second).unwrap().is_ready());

    let first_program = engine.effect(first).unwrap().program();
    let last_bound = gl.calls().into_iter().rev().find_map(|c| match c {
        GlCall::UseProgram(p) => Some(p),
        _ => None,
    });
    assert_eq!(last_bound, Some(first_program));
}
