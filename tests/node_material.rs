use node_forge_engine::node_material::{
    BinaryOp, BlockId, BlockKind, BlockTarget, BuildOptions, CompiledNodeMaterial, GlslVersion, GraphFormatError,
    InputValue, MAX_BLOCK_ID, NodeMaterial, NodeMaterialError, SharedData, SystemValue,
};
use proptest::prelude::*;

fn declarations<'a>(source: &'a str, qualifier: &str) -> Vec<&'a str> {
    source
        .lines()
        .filter_map(|l| l.trim().strip_prefix(qualifier))
        .filter_map(|rest| rest.strip_prefix(' '))
        .collect()
}

fn assert_varyings_match(vertex: &str, fragment: &str) {
    let outs = declarations(vertex, "out");
    let ins = declarations(fragment, "in");
    for decl in &ins {
        assert!(outs.contains(decl), "fragment input `in {decl}` has no vertex output");
    }
    for decl in &outs {
        assert!(ins.contains(decl), "vertex output `out {decl}` is never read");
    }
}

#[test]
fn world_view_projection_reaches_fragment_output() {
    let mut m = NodeMaterial::new("wvp");
    let position = m.add_input("position", |i| i.set_as_attribute("position"));
    m.block_mut(position).unwrap().set_target(BlockTarget::Vertex);
    let vout = m.add_block("vout", BlockKind::VertexOutput);
    let wvp = m.add_input("wvp", |i| i.set_as_system_value(SystemValue::WorldViewProjection));
    let fout = m.add_block("fout", BlockKind::FragmentOutput);
    m.connect(position, "output", vout, "vector").unwrap();
    m.connect(wvp, "output", fout, "rgba").unwrap();

    let compiled = m.build(&BuildOptions::default()).unwrap();
    let fs = &compiled.fragment_source;
    assert!(fs.contains("uniform mat4 worldViewProjection;"));
    let assignment = fs.lines().find(|l| l.trim_start().starts_with("glFragColor =")).unwrap();
    assert!(assignment.contains("worldViewProjection"));
    assert!(!fs.contains("in vec3 position;"));
    assert!(compiled.vertex_source.contains("in vec3 position;"));
    assert_varyings_match(&compiled.vertex_source, fs);
}

#[test]
fn cycles_are_rejected_before_any_source_exists() {
    let mut m = NodeMaterial::new("loop");
    let a = m.add_block("a", BlockKind::Binary(BinaryOp::Add));
    let b = m.add_block("b", BlockKind::Normalize);
    let fout = m.add_block("fout", BlockKind::FragmentOutput);
    m.connect(a, "output", b, "input").unwrap();
    m.connect(b, "output", a, "left").unwrap();
    m.connect(b, "output", a, "right").unwrap();
    m.connect(a, "output", fout, "rgba").unwrap();
    let err = m.build(&BuildOptions::default()).unwrap_err();
    assert!(matches!(err, NodeMaterialError::Cycle { ref block } if block == "a" || block == "b"));
}

#[test]
fn json_round_trip_compiles_identically() {
    let mut m = NodeMaterial::new("roundtrip");
    let uv = m.add_input("uv", |i| i.set_as_attribute("uv"));
    let position = m.add_input("position", |i| i.set_as_attribute("position"));
    let wvp = m.add_input("wvp", |i| i.set_as_system_value(SystemValue::WorldViewProjection));
    let transform = m.add_block("transform", BlockKind::transform());
    let vout = m.add_block("vout", BlockKind::VertexOutput);
    let merger = m.add_block("merger", BlockKind::VectorMerger);
    let splitter = m.add_block("splitter", BlockKind::VectorSplitter);
    let fout = m.add_block("fout", BlockKind::FragmentOutput);
    m.connect(position, "output", transform, "vector").unwrap();
    m.connect(wvp, "output", transform, "transform").unwrap();
    m.connect(transform, "output", vout, "vector").unwrap();
    m.connect(uv, "output", splitter, "xy").unwrap();
    m.connect(splitter, "x", merger, "x").unwrap();
    m.connect(splitter, "y", merger, "y").unwrap();
    m.connect(merger, "xyzw", fout, "rgba").unwrap();

    let path = std::env::temp_dir().join(format!("node-forge-roundtrip-{}.json", std::process::id()));
    std::fs::write(&path, m.to_json().unwrap()).unwrap();
    let mut loaded = NodeMaterial::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.blocks().len(), m.blocks().len());
    for (a, b) in loaded.blocks().iter().zip(m.blocks()) {
        assert_eq!(a.class_name(), b.class_name());
        assert_eq!(a.id, b.id);
        let links = |blk: &node_forge_engine::node_material::Block| {
            blk.inputs.iter().map(|i| i.connected_to()).collect::<Vec<_>>()
        };
        assert_eq!(links(a), links(b));
    }

    let original = m.build(&BuildOptions::default()).unwrap();
    let reloaded = loaded.build(&BuildOptions::default()).unwrap();
    assert_eq!(original.vertex_source, reloaded.vertex_source);
    assert_eq!(original.fragment_source, reloaded.fragment_source);
}

#[test]
fn unknown_class_is_a_format_error() {
    let json = r#"{ "name": "bad", "blocks": [ { "customType": "BABYLON.TeleportBlock", "id": 1, "name": "t", "inputs": [], "outputs": [] } ] }"#;
    let err = NodeMaterial::from_json(json).unwrap_err();
    assert!(err.to_string().contains("TeleportBlock"));
}

#[test]
fn es100_build_uses_legacy_keywords() {
    let mut m = NodeMaterial::new("legacy");
    let uv = m.add_input("uv", |i| i.set_as_attribute("uv"));
    let splitter = m.add_block("splitter", BlockKind::VectorSplitter);
    let merger = m.add_block("merger", BlockKind::VectorMerger);
    let fout = m.add_block("fout", BlockKind::FragmentOutput);
    m.connect(uv, "output", splitter, "xy").unwrap();
    m.connect(splitter, "x", merger, "y").unwrap();
    m.connect(merger, "xyzw", fout, "rgba").unwrap();
    let compiled = m
        .build(&BuildOptions { glsl_version: GlslVersion::Es100, ..Default::default() })
        .unwrap();
    assert!(!compiled.vertex_source.contains("#version"));
    assert!(compiled.vertex_source.contains("attribute vec2 uv;"));
    assert!(compiled.vertex_source.contains("varying vec2 v_uv;"));
    assert!(compiled.fragment_source.contains("gl_FragColor"));
}

fn crossed_normals(add_first: bool, add_input: Option<InputValue>) -> Result<CompiledNodeMaterial, NodeMaterialError> {
    let mut m = NodeMaterial::new("crossed");
    let normal = m.add_input("normal", |i| i.set_as_attribute("normal"));
    let source = match add_input {
        Some(value) => m.add_input("scalar", |i| i.set_value(value)),
        None => normal,
    };
    let add = m.add_block("add", BlockKind::Binary(BinaryOp::Add));
    let cross = m.add_block("cross", BlockKind::Cross);
    let fout = m.add_block("fout", BlockKind::FragmentOutput);
    let wire_add = |m: &mut NodeMaterial| -> Result<(), NodeMaterialError> {
        m.connect(source, "output", add, "left")?;
        m.connect(source, "output", add, "right")
    };
    if add_first {
        m.connect(add, "output", cross, "left")?;
        wire_add(&mut m)?;
    } else {
        wire_add(&mut m)?;
        m.connect(add, "output", cross, "left")?;
    }
    m.connect(normal, "output", cross, "right")?;
    m.connect(cross, "output", fout, "rgb")?;
    m.build(&BuildOptions::default())
}

#[test]
fn connection_order_does_not_change_validity() {
    let early = crossed_normals(true, None).unwrap();
    let late = crossed_normals(false, None).unwrap();
    assert_eq!(early.vertex_source, late.vertex_source);
    assert_eq!(early.fragment_source, late.fragment_source);

    for add_first in [true, false] {
        let err = crossed_normals(add_first, Some(InputValue::Float(1.0))).unwrap_err();
        assert!(
            matches!(err, NodeMaterialError::TypeMismatch { ref block, ref input, .. } if block == "cross" && input == "left"),
            "add_first = {add_first}: {err:?}"
        );
    }
}

#[test]
fn out_of_range_block_id_is_a_format_error() {
    let json = r#"{"name": "x", "blocks": [{"customType": "BABYLON.VertexOutputBlock", "id": 4294967295,
        "name": "v", "inputs": [], "outputs": []}]}"#;
    assert!(matches!(NodeMaterial::from_json(json), Err(GraphFormatError::InvalidId(u32::MAX))));
}

#[test]
fn highest_block_id_loads_and_new_blocks_fill_gaps() {
    let json = format!(
        r#"{{"name": "x", "blocks": [{{"customType": "NormalizeBlock", "id": {MAX_BLOCK_ID}, "name": "n"}}]}}"#
    );
    let mut m = NodeMaterial::from_json(&json).unwrap();
    let added = m.add_block("extra", BlockKind::Normalize);
    assert_eq!(added, BlockId(0));
    let again = m.add_block("more", BlockKind::Normalize);
    assert_eq!(again, BlockId(1));
    assert_eq!(m.blocks().len(), 3);
}

#[test]
fn duplicate_block_id_is_a_format_error() {
    let json = r#"{"blocks": [{"customType": "DotBlock", "id": 4}, {"customType": "CrossBlock", "id": 4}]}"#;
    assert!(matches!(NodeMaterial::from_json(json), Err(GraphFormatError::DuplicateId(4))));
}

#[test]
fn link_to_missing_block_is_a_format_error() {
    let json = r#"{"blocks": [{"customType": "NormalizeBlock", "id": 1,
        "inputs": [{"name": "input", "targetBlockId": 12, "targetConnectionName": "output"}]}]}"#;
    let err = NodeMaterial::from_json(json).unwrap_err();
    assert!(matches!(err, GraphFormatError::DanglingConnection { block: 1, ref input, target: 12 } if input == "input"));
}

#[test]
fn attribute_input_without_a_name_is_a_format_error() {
    let json = r#"{"blocks": [{"customType": "InputBlock", "id": 2, "mode": "attribute"}]}"#;
    assert!(matches!(NodeMaterial::from_json(json), Err(GraphFormatError::InvalidProperties { block: 2, .. })));
}

#[test]
fn truncated_json_is_a_format_error() {
    assert!(matches!(NodeMaterial::from_json(r#"{"blocks": ["#), Err(GraphFormatError::Json(_))));
}

proptest! {
    #[test]
    fn free_names_are_distinct_and_skip_exclusions(count in 1usize..40, exclude in 1u32..10) {
        let mut shared = SharedData::new(GlslVersion::Es300);
        let excluded = format!("uv{exclude}");
        shared.exclude_variable_name(&excluded);
        let names: Vec<String> = (0..count).map(|_| shared.get_free_variable_name("uv")).collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), names.len());
        prop_assert!(!names.contains(&excluded));
    }

    #[test]
    fn every_vertex_output_has_a_matching_fragment_input(mask in 1u8..8, es100 in any::<bool>()) {
        let attributes = ["uv", "normal", "color"];
        let mut m = NodeMaterial::new("random");
        let mut sum = None;
        for (i, name) in attributes.iter().enumerate() {
            if mask & (1 << i) == 0 {
                continue;
            }
            let attr = m.add_input(name, |b| b.set_as_attribute(name));
            let dot = m.add_block(&format!("{name}Dot"), BlockKind::Dot);
            m.connect(attr, "output", dot, "left").unwrap();
            m.connect(attr, "output", dot, "right").unwrap();
            sum = Some(match sum {
                None => dot,
                Some(prev) => {
                    let add = m.add_block(&format!("{name}Sum"), BlockKind::Binary(BinaryOp::Add));
                    m.connect(prev, "output", add, "left").unwrap();
                    m.connect(dot, "output", add, "right").unwrap();
                    add
                }
            });
        }
        let merger = m.add_block("merger", BlockKind::VectorMerger);
        let fout = m.add_block("fout", BlockKind::FragmentOutput);
        m.connect(sum.unwrap(), "output", merger, "x").unwrap();
        m.connect(merger, "xyzw", fout, "rgba").unwrap();

        let version = if es100 { GlslVersion::Es100 } else { GlslVersion::Es300 };
        let compiled = m.build(&BuildOptions { glsl_version: version, ..Default::default() }).unwrap();
        let (out_kw, in_kw) = if es100 { ("varying", "varying") } else { ("out", "in") };
        let outs = declarations(&compiled.vertex_source, out_kw);
        let ins: Vec<&str> = declarations(&compiled.fragment_source, in_kw)
            .into_iter()
            .filter(|d| !d.starts_with("vec4 glFragColor"))
            .collect();
        for decl in &ins {
            prop_assert!(outs.contains(decl));
        }
        for decl in outs.iter().filter(|d| !d.starts_with("vec4 glFragColor")) {
            prop_assert!(ins.contains(decl));
        }
    }
}
