//! Offline validation of generated shaders through naga.
//!
//! Generated sources target GLSL ES 3.00; naga's GLSL frontend reads Vulkan
//! flavored `#version 450`, so sources are first rewritten: explicit
//! locations, loose uniforms gathered into one block, and combined samplers
//! split into a texture plus a sampler.

use anyhow::{Context, Result, anyhow, bail};

use crate::node_material::{CompiledNodeMaterial, ShaderStage};

const LOOSE_UNIFORM_BLOCK: &str = "Uniforms";

/// Rewrite an ES 3.00 shader as `#version 450` GLSL.
pub fn to_vulkan_glsl(source: &str) -> Result<String> {
    if !source.trim_start().starts_with("#version 300 es") {
        bail!("only GLSL ES 3.00 sources can be translated");
    }

    let mut body = Vec::new();
    let mut uniforms = Vec::new();
    let mut samplers = Vec::new();
    let (mut in_location, mut out_location) = (0, 0);
    for line in source.lines() {
        let t = line.trim();
        if t.starts_with("#version") || t.starts_with("#extension") || t.starts_with("precision ") {
            continue;
        }
        if t == "void main(void) {" {
            body.push("void main() {".to_string());
            continue;
        }
        if let Some(rest) = t.strip_prefix("layout(std140, column_major)") {
            body.push(format!("layout(std140, set = 0, binding = 1){rest}"));
            continue;
        }
        let tokens: Vec<&str> = t.trim_end_matches(';').split_whitespace().collect();
        if t.ends_with(';') && tokens.len() == 3 {
            match tokens[0] {
                "in" => {
                    body.push(format!("layout(location = {in_location}) {t}"));
                    in_location += 1;
                    continue;
                }
                "out" => {
                    body.push(format!("layout(location = {out_location}) {t}"));
                    out_location += 1;
                    continue;
                }
                "uniform" if tokens[1] == "sampler2D" => {
                    let name = tokens[2];
                    let binding = samplers.len() * 2;
                    body.push(format!("layout(set = 1, binding = {binding}) uniform texture2D {name}_tex;"));
                    body.push(format!("layout(set = 1, binding = {}) uniform sampler {name}_smp;", binding + 1));
                    samplers.push(name.to_string());
                    continue;
                }
                "uniform" => {
                    uniforms.push(format!("    {} {};", tokens[1], tokens[2]));
                    continue;
                }
                _ => {}
            }
        }
        body.push(line.to_string());
    }

    let mut out = String::from("#version 450\n");
    if !uniforms.is_empty() {
        out.push_str(&format!("layout(set = 0, binding = 0) uniform {LOOSE_UNIFORM_BLOCK} {{\n"));
        for u in &uniforms {
            out.push_str(u);
            out.push('\n');
        }
        out.push_str("};\n");
    }
    let mut text = body.join("\n");
    for s in &samplers {
        text = text.replace(&format!("texture({s}, "), &format!("texture(sampler2D({s}_tex, {s}_smp), "));
    }
    out.push_str(&text);
    out.push('\n');
    Ok(out)
}

/// Parse and validate `#version 450` GLSL and emit it as WGSL.
pub fn glsl_to_wgsl(source: &str, stage: ShaderStage) -> Result<String> {
    let shader_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };

    let mut parser = naga::front::glsl::Frontend::default();
    let options = naga::front::glsl::Options {
        stage: shader_stage,
        defines: Default::default(),
    };

    let module = parser
        .parse(&options, source)
        .map_err(|e| anyhow!("GLSL parse failed: {e:?}\n{}", numbered(source)))?;

    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
        .validate(&module)
        .map_err(|e| anyhow!("GLSL validation failed: {e:?}"))?;

    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::EXPLICIT_TYPES)
        .map_err(|e| anyhow!("WGSL writer failed: {e:?}"))
}

fn numbered(source: &str) -> String {
    let mut out = String::new();
    for (n, line) in source.lines().enumerate() {
        out.push_str(&format!("{:4} | {line}\n", n + 1));
    }
    out
}

/// Validate both stages of a compiled material; returns the WGSL
/// translations (vertex, fragment).
pub fn validate_compiled(compiled: &CompiledNodeMaterial) -> Result<(String, String)> {
    let vertex = to_vulkan_glsl(&compiled.vertex_source)
        .and_then(|s| glsl_to_wgsl(&s, ShaderStage::Vertex))
        .with_context(|| format!("vertex shader of '{}'", compiled.name))?;
    let fragment = to_vulkan_glsl(&compiled.fragment_source)
        .and_then(|s| glsl_to_wgsl(&s, ShaderStage::Fragment))
        .with_context(|| format!("fragment shader of '{}'", compiled.name))?;
    Ok((vertex, fragment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_material::{BlockKind, BuildOptions, GlslVersion, InputValue, NodeMaterial, SystemValue, TextureBlock};
    use glam::Vec4;

    #[test]
    fn rewrite_adds_locations_and_splits_samplers() {
        let src = "#version 300 es\nprecision highp float;\n\nuniform vec4 u_tint;\nuniform sampler2D tex;\nin vec2 v_uv;\nout vec4 glFragColor;\n\nvoid main(void) {\n    glFragColor = texture(tex, v_uv) * u_tint;\n}\n";
        let out = to_vulkan_glsl(src).unwrap();
        assert!(out.starts_with("#version 450\nlayout(set = 0, binding = 0) uniform Uniforms {\n    vec4 u_tint;\n};"));
        assert!(out.contains("layout(location = 0) in vec2 v_uv;"));
        assert!(out.contains("layout(location = 0) out vec4 glFragColor;"));
        assert!(out.contains("uniform texture2D tex_tex;"));
        assert!(out.contains("texture(sampler2D(tex_tex, tex_smp), v_uv)"));
        assert!(out.contains("void main() {"));
        assert!(!out.contains("precision"));
    }

    #[test]
    fn es100_sources_are_rejected() {
        assert!(to_vulkan_glsl("precision highp float;\nvoid main(void) {}\n").is_err());
    }

    #[test]
    fn generated_material_translates_to_wgsl() {
        let mut m = NodeMaterial::new("validated");
        let position = m.add_input("position", |i| i.set_as_attribute("position"));
        let wvp = m.add_input("wvp", |i| i.set_as_system_value(SystemValue::WorldViewProjection));
        let transform = m.add_block("transform", BlockKind::transform());
        let vout = m.add_block("vout", BlockKind::VertexOutput);
        let uv = m.add_input("uv", |i| i.set_as_attribute("uv"));
        let texture = m.add_block("diffuse", BlockKind::Texture(TextureBlock::default()));
        let tint = m.add_input("tint", |i| i.set_value(InputValue::Color4(Vec4::ONE)));
        let multiply = m.add_block("tinted", BlockKind::Binary(crate::node_material::BinaryOp::Multiply));
        let fout = m.add_block("fout", BlockKind::FragmentOutput);
        m.connect(position, "output", transform, "vector").unwrap();
        m.connect(wvp, "output", transform, "transform").unwrap();
        m.connect(transform, "output", vout, "vector").unwrap();
        m.connect(uv, "output", texture, "uv").unwrap();
        m.connect(texture, "rgba", multiply, "left").unwrap();
        m.connect(tint, "output", multiply, "right").unwrap();
        m.connect(multiply, "output", fout, "rgba").unwrap();

        let compiled = m.build(&BuildOptions { glsl_version: GlslVersion::Es300, ..Default::default() }).unwrap();
        let (vertex, fragment) = validate_compiled(&compiled).unwrap();
        assert!(vertex.contains("@vertex"));
        assert!(fragment.contains("@fragment"));
    }
}
