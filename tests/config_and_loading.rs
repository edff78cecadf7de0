use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use node_forge_engine::engine::TextureCreationOptions;
use node_forge_engine::{Engine, EngineOptions};

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("node-forge-{}-{name}", std::process::id()))
}

#[test]
fn options_load_from_json_file() {
    let path = temp_path("engine.json");
    std::fs::write(&path, r#"{ "disableUniformBuffers": true, "stencil": false, "lockstepMaxSteps": 8 }"#).unwrap();
    let options = EngineOptions::load_from_path(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    assert!(options.disable_uniform_buffers);
    assert!(!options.stencil);
    assert_eq!(options.lockstep_max_steps, 8);

    let (engine, _gl) = Engine::headless(8, 8, options).unwrap();
    assert!(!engine.get_caps().uniform_buffers);
}

#[test]
fn missing_options_file_names_the_path() {
    let path = temp_path("does-not-exist.json");
    let err = EngineOptions::load_from_path(&path).unwrap_err();
    assert!(format!("{err:#}").contains("does-not-exist.json"));
}

#[test]
fn texture_loads_in_background_and_completes_on_render_thread() {
    let path = temp_path("checker.png");
    let mut img = image::RgbaImage::new(4, 2);
    img.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
    img.save(&path).unwrap();

    let (mut engine, gl) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
    let loaded = Rc::new(Cell::new(false));
    let flag = loaded.clone();
    let url = path.to_string_lossy().into_owned();
    let texture = engine
        .create_texture(&url, TextureCreationOptions::default(), Some(Box::new(move |_, _| flag.set(true))), None)
        .unwrap();
    assert!(!engine.texture(texture).unwrap().is_ready);

    engine.wait_for_pending_loads(Duration::from_secs(10));
    let _ = std::fs::remove_file(&path);
    assert!(loaded.get());
    let tex = engine.texture(texture).unwrap();
    assert!(tex.is_ready);
    assert_eq!((tex.base_width, tex.base_height), (4, 2));
    assert!(gl.is_texture_alive(tex.gl_name()));
}

#[test]
fn missing_texture_reports_error_callback() {
    let (mut engine, _gl) = Engine::headless(16, 16, EngineOptions::default()).unwrap();
    let error = Rc::new(RefCell::new(None));
    let sink = error.clone();
    let url = temp_path("missing.png").to_string_lossy().into_owned();
    engine.create_texture(
        &url,
        TextureCreationOptions::default(),
        None,
        Some(Box::new(move |_, message| *sink.borrow_mut() = Some(message.to_string()))),
    );
    engine.wait_for_pending_loads(Duration::from_secs(10));
    assert!(error.borrow().is_some());
}

#[test]
fn cancelled_file_load_never_calls_back() {
    let path = temp_path("payload.bin");
    std::fs::write(&path, b"payload").unwrap();
    let (mut engine, _gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();

    let called = Rc::new(Cell::new(false));
    let flag = called.clone();
    let token = engine.load_file(&path.to_string_lossy(), move |_, _| flag.set(true));
    token.cancel();
    engine.wait_for_pending_loads(Duration::from_secs(10));

    let bytes = Rc::new(RefCell::new(Vec::new()));
    let sink = bytes.clone();
    engine.load_file(&path.to_string_lossy(), move |_, result| {
        *sink.borrow_mut() = result.unwrap_or_default();
    });
    engine.wait_for_pending_loads(Duration::from_secs(10));
    let _ = std::fs::remove_file(&path);

    assert!(!called.get());
    assert_eq!(bytes.borrow().as_slice(), b"payload");
}
