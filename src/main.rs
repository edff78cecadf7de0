use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use glam::{Mat4, Vec3};
use node_forge_engine::engine::VertexBufferBinding;
use node_forge_engine::logging::{LoggingConfig, init_logging};
use node_forge_engine::node_material::{BoundNodeMaterial, NodeMaterial, build_options_for};
use node_forge_engine::scene::{Camera, Scene};
use node_forge_engine::{Engine, EngineOptions, validation};

const DRAW_SIZE: u32 = 256;

#[derive(Debug, Default, Clone)]
struct Cli {
    graph_json: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    wgsl: bool,
    draw: bool,
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--wgsl" => {
                cli.wgsl = true;
                i += 1;
            }
            "--draw" => {
                cli.draw = true;
                i += 1;
            }
            "--graph-json" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --graph-json"));
                };
                cli.graph_json = Some(PathBuf::from(v));
                i += 2;
            }
            "--outputdir" | "--output-dir" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --output-dir"));
                };
                cli.output_dir = Some(PathBuf::from(v));
                i += 2;
            }
            "--config" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --config"));
                };
                cli.config = Some(PathBuf::from(v));
                i += 2;
            }
            other => {
                return Err(anyhow!(
                    "unknown argument: {other} (supported: --graph-json <graph.json>, --output-dir <dir>, --config <engine.json>, --wgsl, --draw)"
                ));
            }
        }
    }
    Ok(cli)
}

fn write_output(dir: &Path, file_name: &str, contents: &[u8]) -> Result<()> {
    let path = dir.join(file_name);
    std::fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    println!("[compile] saved: {}", path.display());
    Ok(())
}

/// Floats per vertex for the attributes a headless draw can feed.
fn attribute_size(name: &str) -> i32 {
    match name {
        "uv" | "uv2" => 2,
        "position" | "normal" => 3,
        _ => 4,
    }
}

/// Draw one triangle with the compiled material and save the frame as PNG.
fn draw_once(engine: &mut Engine, material: &NodeMaterial, bound: &mut BoundNodeMaterial, out_path: &Path) -> Result<()> {
    let camera = Camera::look_at(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, 0.8, 1.0, 0.1, 100.0);
    let scene = Scene::new(camera);

    let mut buffers = Vec::new();
    let mut bindings = Vec::new();
    for name in &bound.compiled.attributes {
        let size = attribute_size(name);
        let data: Vec<f32> = match name.as_str() {
            "position" => vec![-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 0.0, 1.0, 0.0],
            "uv" => vec![0.0, 0.0, 1.0, 0.0, 0.5, 1.0],
            _ => vec![0.0; size as usize * 3],
        };
        let buffer = engine
            .create_vertex_buffer(&data)
            .ok_or_else(|| anyhow!("failed to allocate vertex buffer for '{name}'"))?;
        buffers.push(buffer);
        bindings.push(VertexBufferBinding::float(name.as_str(), buffer, size, size, 0));
    }

    engine.begin_frame();
    engine.clear(Some([0.0, 0.0, 0.0, 1.0]), true, true, false);
    if bound.bind(engine, material, &scene) {
        bound.bind_world(engine, material, &scene, &Mat4::IDENTITY);
        engine.bind_buffers(&bindings, None, bound.effect);
        engine.draw_arrays_type(node_forge_engine::engine::FillMode::Triangle, 0, 3, 1);
    } else {
        log::warn!("material '{}' is not ready; frame left cleared", material.name);
    }
    engine.end_frame();

    let pixels = engine
        .read_pixels(0, 0, DRAW_SIZE, DRAW_SIZE)
        .ok_or_else(|| anyhow!("read_pixels unavailable"))?;
    let image = image::RgbaImage::from_raw(DRAW_SIZE, DRAW_SIZE, pixels)
        .ok_or_else(|| anyhow!("read_pixels returned a short buffer"))?;
    image.save(out_path).with_context(|| format!("failed to save {}", out_path.display()))?;
    println!("[draw] saved: {} ({} draw calls)", out_path.display(), engine.last_frame_draw_calls());

    for buffer in buffers {
        engine.release_buffer(buffer);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let graph_path = cli
        .graph_json
        .as_deref()
        .ok_or_else(|| anyhow!("--graph-json <graph.json> is required"))?;
    let output_dir = cli.output_dir.clone().unwrap_or_else(|| {
        graph_path
            .parent()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;

    let options = match cli.config.as_deref() {
        Some(path) => EngineOptions::load_from_path(path)?,
        None => EngineOptions::default(),
    };

    let text = std::fs::read_to_string(graph_path)
        .with_context(|| format!("failed to read --graph-json file {}", graph_path.display()))?;
    let mut material = NodeMaterial::from_json(&text)
        .with_context(|| format!("invalid node material json in {}", graph_path.display()))?;

    let (mut engine, _handle) = Engine::headless(DRAW_SIZE, DRAW_SIZE, options)?;
    let compiled = material
        .build(&build_options_for(&engine))
        .with_context(|| format!("failed to compile '{}'", material.name))?;

    let stem = compiled.base_name();
    write_output(&output_dir, &format!("{stem}.vert"), compiled.vertex_source.as_bytes())?;
    write_output(&output_dir, &format!("{stem}.frag"), compiled.fragment_source.as_bytes())?;

    if cli.wgsl {
        let (vertex, fragment) = validation::validate_compiled(&compiled)?;
        write_output(&output_dir, &format!("{stem}.vert.wgsl"), vertex.as_bytes())?;
        write_output(&output_dir, &format!("{stem}.frag.wgsl"), fragment.as_bytes())?;
    }

    if cli.draw {
        let mut bound = BoundNodeMaterial::new(&mut engine, compiled);
        let out_path = output_dir.join(format!("{stem}.png"));
        let result = draw_once(&mut engine, &material, &mut bound, &out_path);
        bound.dispose(&mut engine);
        result?;
    }

    engine.dispose();
    Ok(())
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&argv)?;
    run(cli)
}
