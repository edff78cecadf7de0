//! Per-stage accumulation of declarations and main-body code.
//!
//! Each stage owns a [`BuildState`]; both share one [`SharedData`] for names
//! and varyings so identifiers never collide across the two programs and every
//! varying is declared identically on both sides. The main body is kept as an
//! ordered list of code fragments and anchors rather than one string: code
//! inserted at an anchor later lands at the anchor's position.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::node_material::errors::NodeMaterialError;
use crate::node_material::types::{ConnectionPointType, GlslVersion, ShaderStage};

/// Identifiers the name allocator never hands out unsuffixed.
const RESERVED_WORDS: &[&str] = &[
    "attribute", "bool", "break", "const", "continue", "discard", "else", "flat", "float", "for", "highp", "if",
    "in", "inout", "input", "int", "lowp", "main", "mat2", "mat3", "mat4", "mediump", "out", "output", "precision",
    "return", "sample", "sampler", "sampler2D", "smooth", "struct", "texture", "uniform", "varying", "vec2", "vec3",
    "vec4", "void", "while",
];

const SCENE_BLOCK: &str = "Scene";
const SCENE_BLOCK_MEMBERS: [&str; 3] = ["viewProjection", "view", "projection"];

/// A varying shared by both stages, optionally wrapped in a define test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Varying {
    pub name: String,
    pub ty: String,
    pub define: Option<String>,
    pub not_define: bool,
}

/// Cross-stage bookkeeping for one graph build.
#[derive(Debug, Default)]
pub struct SharedData {
    pub glsl_version: GlslVersion,
    pub emit_comments: bool,
    counters: HashMap<String, u32>,
    used_names: HashSet<String>,
    define_counters: HashMap<String, u32>,
    used_defines: HashSet<String>,
    varyings: Vec<Varying>,
    temps: HashSet<String>,
}

fn sanitize_prefix(prefix: &str) -> String {
    let cleaned: String = prefix.chars().filter(|c| c.is_ascii_alphabetic() || *c == '_').collect();
    match cleaned.as_str() {
        "" => "v".to_string(),
        s if s.starts_with("gl_") || s.contains("__") => format!("n{}", s.replace("__", "_")),
        _ => cleaned,
    }
}

impl SharedData {
    pub fn new(glsl_version: GlslVersion) -> Self {
        Self { glsl_version, ..Default::default() }
    }

    /// A fresh identifier starting with `prefix`. The bare prefix is used
    /// first, then `prefix1`, `prefix2`, ... skipping every taken or excluded
    /// name.
    pub fn get_free_variable_name(&mut self, prefix: &str) -> String {
        let prefix = sanitize_prefix(prefix);
        if !RESERVED_WORDS.contains(&prefix.as_str()) && !self.counters.contains_key(&prefix) && self.used_names.insert(prefix.clone()) {
            self.counters.insert(prefix.clone(), 0);
            return prefix;
        }
        let counter = self.counters.entry(prefix.clone()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{prefix}{counter}");
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    pub fn get_free_define_name(&mut self, prefix: &str) -> String {
        let prefix = sanitize_prefix(prefix).to_uppercase();
        loop {
            let counter = self.define_counters.entry(prefix.clone()).or_insert(0);
            let candidate = format!("{prefix}{counter}");
            *counter += 1;
            if self.used_defines.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Reserve `name` so the allocator never returns it.
    pub fn exclude_variable_name(&mut self, name: &str) {
        self.used_names.insert(name.to_string());
    }

    pub fn is_variable_name_used(&self, name: &str) -> bool {
        self.used_names.contains(name)
    }

    /// Suffix counters per sanitized prefix.
    pub fn counters(&self) -> &HashMap<String, u32> {
        &self.counters
    }

    pub fn varyings(&self) -> &[Varying] {
        &self.varyings
    }

    fn emit_varying(&mut self, name: &str, ty: &str, define: Option<&str>, not_define: bool) -> Result<bool, NodeMaterialError> {
        if let Some(existing) = self.varyings.iter().find(|v| v.name == name) {
            if existing.ty != ty {
                return Err(NodeMaterialError::VaryingTypeMismatch {
                    name: name.to_string(),
                    ty: ty.to_string(),
                    previous: existing.ty.clone(),
                });
            }
            return Ok(false);
        }
        self.used_names.insert(name.to_string());
        self.varyings.push(Varying {
            name: name.to_string(),
            ty: ty.to_string(),
            define: define.map(str::to_string),
            not_define,
        });
        Ok(true)
    }
}

/// Position in a stage's main body where code can be inserted later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnchorId(usize);

#[derive(Clone, Debug)]
enum BodyFragment {
    Code(String),
    Anchor(usize),
}

#[derive(Clone, Debug)]
struct Declaration {
    name: String,
    ty: String,
    define: Option<String>,
    not_define: bool,
}

fn write_guarded(out: &mut String, define: Option<&str>, not_define: bool, line: &str) {
    match define {
        Some(d) => {
            let test = if not_define { "#ifndef" } else { "#ifdef" };
            out.push_str(&format!("{test} {d}\n{line}\n#endif\n"));
        }
        None => {
            out.push_str(line);
            out.push('\n');
        }
    }
}

pub struct BuildState {
    pub target: ShaderStage,
    pub support_uniform_buffers: bool,
    /// Attribute names in first-emission order.
    pub attributes: Vec<String>,
    pub uniforms: Vec<String>,
    pub uniform_buffers: Vec<String>,
    pub samplers: Vec<String>,
    shared: Rc<RefCell<SharedData>>,
    functions: Vec<(String, String)>,
    extensions: Vec<(String, String)>,
    attribute_declarations: Vec<(String, String)>,
    uniform_declarations: Vec<Declaration>,
    constant_declarations: Vec<String>,
    uses_scene_block: bool,
    varying_transfer: Vec<String>,
    body: Vec<BodyFragment>,
    anchors: Vec<Vec<String>>,
    insertion_anchor: Option<AnchorId>,
}

impl BuildState {
    pub fn new(target: ShaderStage, shared: Rc<RefCell<SharedData>>, support_uniform_buffers: bool) -> Self {
        Self {
            target,
            support_uniform_buffers,
            attributes: Vec::new(),
            uniforms: Vec::new(),
            uniform_buffers: Vec::new(),
            samplers: Vec::new(),
            shared,
            functions: Vec::new(),
            extensions: Vec::new(),
            attribute_declarations: Vec::new(),
            uniform_declarations: Vec::new(),
            constant_declarations: Vec::new(),
            uses_scene_block: false,
            varying_transfer: Vec::new(),
            body: Vec::new(),
            anchors: Vec::new(),
            insertion_anchor: None,
        }
    }

    pub fn shared(&self) -> &Rc<RefCell<SharedData>> {
        &self.shared
    }

    pub fn glsl_version(&self) -> GlslVersion {
        self.shared.borrow().glsl_version
    }

    // ── Names ────────────────────────────────────────────────────────────

    pub fn get_free_variable_name(&self, prefix: &str) -> String {
        self.shared.borrow_mut().get_free_variable_name(prefix)
    }

    pub fn get_free_define_name(&self, prefix: &str) -> String {
        self.shared.borrow_mut().get_free_define_name(prefix)
    }

    pub fn exclude_variable_name(&self, name: &str) {
        self.shared.borrow_mut().exclude_variable_name(name);
    }

    /// Returns `false` when `name` was already registered in this build.
    pub fn register_temp_variable(&self, name: &str) -> bool {
        self.shared.borrow_mut().temps.insert(name.to_string())
    }

    pub fn get_gl_type(&self, ty: ConnectionPointType) -> &'static str {
        ty.glsl()
    }

    /// Name of the fragment color output.
    pub fn frag_color(&self) -> &'static str {
        match self.glsl_version() {
            GlslVersion::Es100 => "gl_FragColor",
            GlslVersion::Es300 => "glFragColor",
        }
    }

    /// GLSL function sampling a 2D texture.
    pub fn texture_fn(&self) -> &'static str {
        match self.glsl_version() {
            GlslVersion::Es100 => "texture2D",
            GlslVersion::Es300 => "texture",
        }
    }

    // ── Declarations ─────────────────────────────────────────────────────

    /// `extension` is the full `#extension` directive.
    pub fn emit_extension(&mut self, name: &str, extension: &str) {
        if !self.extensions.iter().any(|(n, _)| n == name) {
            self.extensions.push((name.to_string(), extension.to_string()));
        }
    }

    /// Add a helper function. Re-emitting the same name is a no-op when the
    /// code matches and an error otherwise.
    pub fn emit_function(&mut self, name: &str, code: &str, comments: &str) -> Result<(), NodeMaterialError> {
        let text = if self.shared.borrow().emit_comments && !comments.is_empty() {
            format!("// {comments}\n{code}")
        } else {
            code.to_string()
        };
        match self.functions.iter().find(|(n, _)| n == name) {
            Some((_, existing)) if *existing == text => Ok(()),
            Some(_) => Err(NodeMaterialError::DuplicateFunction { name: name.to_string() }),
            None => {
                self.functions.push((name.to_string(), text));
                Ok(())
            }
        }
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|(n, _)| n == name)
    }

    /// Declare a varying in both stages. Returns whether it was new.
    pub fn emit_varying_from_string(
        &mut self,
        name: &str,
        ty: &str,
        define: Option<&str>,
        not_define: bool,
    ) -> Result<bool, NodeMaterialError> {
        self.shared.borrow_mut().emit_varying(name, ty, define, not_define)
    }

    pub fn emit_uniform_from_string(&mut self, name: &str, ty: &str, define: Option<&str>, not_define: bool) {
        if self.uniforms.iter().any(|u| u == name) {
            return;
        }
        self.uniforms.push(name.to_string());
        self.uniform_declarations.push(Declaration {
            name: name.to_string(),
            ty: ty.to_string(),
            define: define.map(str::to_string),
            not_define,
        });
    }

    /// Scene-wide matrix served from the `Scene` uniform block.
    pub fn emit_scene_uniform(&mut self, name: &str) -> bool {
        if !self.support_uniform_buffers || !SCENE_BLOCK_MEMBERS.contains(&name) {
            return false;
        }
        if !self.uses_scene_block {
            self.uses_scene_block = true;
            self.uniform_buffers.push(SCENE_BLOCK.to_string());
        }
        true
    }

    pub fn emit_attribute(&mut self, name: &str, ty: &str) -> bool {
        if self.attributes.iter().any(|a| a == name) {
            return false;
        }
        self.attributes.push(name.to_string());
        self.attribute_declarations.push((name.to_string(), ty.to_string()));
        true
    }

    pub fn emit_sampler(&mut self, name: &str) -> bool {
        if self.samplers.iter().any(|s| s == name) {
            return false;
        }
        self.samplers.push(name.to_string());
        true
    }

    pub fn emit_constant(&mut self, name: &str, ty: &str, literal: &str) {
        self.constant_declarations.push(format!("const {ty} {name} = {literal};"));
    }

    // ── Body ─────────────────────────────────────────────────────────────

    /// Append code to the main body, or to the insertion anchor when one is
    /// set.
    pub fn compile(&mut self, code: impl Into<String>) {
        match self.insertion_anchor {
            Some(anchor) => self.insert_at_anchor(anchor, code),
            None => self.body.push(BodyFragment::Code(code.into())),
        }
    }

    /// Route subsequent [`compile`](Self::compile) calls to `anchor`.
    pub fn set_insertion_anchor(&mut self, anchor: Option<AnchorId>) {
        self.insertion_anchor = anchor;
    }

    /// Mark the current end of the body for later insertion.
    pub fn repeatable_content_anchor(&mut self) -> AnchorId {
        let id = self.anchors.len();
        self.anchors.push(Vec::new());
        self.body.push(BodyFragment::Anchor(id));
        AnchorId(id)
    }

    /// Insert code at `anchor`, after anything already inserted there.
    pub fn insert_at_anchor(&mut self, anchor: AnchorId, code: impl Into<String>) {
        if let Some(slot) = self.anchors.get_mut(anchor.0) {
            slot.push(code.into());
        }
    }

    /// Vertex-stage copy into a varying, emitted at the end of main.
    pub fn add_varying_transfer(&mut self, code: impl Into<String>) {
        self.varying_transfer.push(code.into());
    }

    /// The main body with anchored insertions resolved.
    pub fn compilation_string(&self) -> String {
        let mut out = String::new();
        for fragment in &self.body {
            match fragment {
                BodyFragment::Code(c) => out.push_str(c),
                BodyFragment::Anchor(id) => {
                    for c in self.anchors.get(*id).into_iter().flatten() {
                        out.push_str(c);
                    }
                }
            }
        }
        out
    }

    // ── Output ───────────────────────────────────────────────────────────

    /// Assemble the complete shader source for this stage.
    pub fn finalize(&self) -> String {
        let shared = self.shared.borrow();
        let es300 = shared.glsl_version == GlslVersion::Es300;
        let vertex = self.target == ShaderStage::Vertex;
        let mut out = String::new();

        if es300 {
            out.push_str("#version 300 es\n");
        }
        for (_, ext) in &self.extensions {
            out.push_str(ext);
            out.push('\n');
        }
        out.push_str("precision highp float;\n\n");

        if vertex && !self.attribute_declarations.is_empty() {
            let qualifier = if es300 { "in" } else { "attribute" };
            for (name, ty) in &self.attribute_declarations {
                out.push_str(&format!("{qualifier} {ty} {name};\n"));
            }
            out.push('\n');
        }

        for d in &self.uniform_declarations {
            write_guarded(&mut out, d.define.as_deref(), d.not_define, &format!("uniform {} {};", d.ty, d.name));
        }
        if self.uses_scene_block {
            out.push_str(&format!("layout(std140, column_major) uniform {SCENE_BLOCK} {{\n"));
            for member in SCENE_BLOCK_MEMBERS {
                out.push_str(&format!("    mat4 {member};\n"));
            }
            out.push_str("};\n");
        }
        for s in &self.samplers {
            out.push_str(&format!("uniform sampler2D {s};\n"));
        }
        for c in &self.constant_declarations {
            out.push_str(c);
            out.push('\n');
        }

        let qualifier = match (es300, vertex) {
            (false, _) => "varying",
            (true, true) => "out",
            (true, false) => "in",
        };
        for v in shared.varyings() {
            write_guarded(&mut out, v.define.as_deref(), v.not_define, &format!("{qualifier} {} {};", v.ty, v.name));
        }
        if es300 && !vertex {
            out.push_str("out vec4 glFragColor;\n");
        }

        for (_, code) in &self.functions {
            out.push('\n');
            out.push_str(code.trim_end());
            out.push('\n');
        }

        out.push_str("\nvoid main(void) {\n");
        out.push_str(&self.compilation_string());
        for t in &self.varying_transfer {
            out.push_str(t);
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states() -> (BuildState, BuildState) {
        let shared = Rc::new(RefCell::new(SharedData::new(GlslVersion::Es300)));
        (
            BuildState::new(ShaderStage::Vertex, shared.clone(), false),
            BuildState::new(ShaderStage::Fragment, shared, false),
        )
    }

    #[test]
    fn free_names_count_up_per_prefix() {
        let mut shared = SharedData::default();
        assert_eq!(shared.get_free_variable_name("uv"), "uv");
        assert_eq!(shared.get_free_variable_name("uv"), "uv1");
        assert_eq!(shared.get_free_variable_name("uv"), "uv2");
        assert_eq!(shared.get_free_variable_name("output"), "output1");
        assert_eq!(shared.get_free_variable_name("my-var 2"), "myvar");
        assert_eq!(shared.counters().get("uv"), Some(&2));
    }

    #[test]
    fn excluded_names_are_skipped() {
        let mut shared = SharedData::default();
        shared.exclude_variable_name("uv1");
        shared.exclude_variable_name("position");
        let names: Vec<String> = (0..3).map(|_| shared.get_free_variable_name("uv")).collect();
        assert_eq!(names, ["uv", "uv2", "uv3"]);
        assert_eq!(shared.get_free_variable_name("position"), "position1");
    }

    #[test]
    fn define_names_are_numbered() {
        let mut shared = SharedData::default();
        assert_eq!(shared.get_free_define_name("uv"), "UV0");
        assert_eq!(shared.get_free_define_name("uv"), "UV1");
    }

    #[test]
    fn varyings_are_shared_and_typed() {
        let (mut vertex, fragment) = states();
        assert!(vertex.emit_varying_from_string("vUV", "vec2", None, false).unwrap());
        assert!(!vertex.emit_varying_from_string("vUV", "vec2", None, false).unwrap());
        assert!(matches!(
            vertex.emit_varying_from_string("vUV", "vec3", None, false),
            Err(NodeMaterialError::VaryingTypeMismatch { .. })
        ));
        assert!(vertex.finalize().contains("out vec2 vUV;"));
        assert!(fragment.finalize().contains("in vec2 vUV;"));
    }

    #[test]
    fn functions_dedupe_by_name() {
        let (mut vertex, _) = states();
        vertex.emit_function("f", "float f() { return 1.0; }", "").unwrap();
        vertex.emit_function("f", "float f() { return 1.0; }", "").unwrap();
        assert_eq!(
            vertex.emit_function("f", "float f() { return 2.0; }", ""),
            Err(NodeMaterialError::DuplicateFunction { name: "f".into() })
        );
    }

    #[test]
    fn anchored_code_lands_at_anchor() {
        let (mut vertex, _) = states();
        vertex.compile("a;\n");
        let anchor = vertex.repeatable_content_anchor();
        vertex.compile("c;\n");
        vertex.insert_at_anchor(anchor, "b1;\n");
        vertex.set_insertion_anchor(Some(anchor));
        vertex.compile("b2;\n");
        vertex.set_insertion_anchor(None);
        vertex.compile("d;\n");
        assert_eq!(vertex.compilation_string(), "a;\nb1;\nb2;\nc;\nd;\n");
    }

    #[test]
    fn guarded_uniforms_and_es100_qualifiers() {
        let shared = Rc::new(RefCell::new(SharedData::new(GlslVersion::Es100)));
        let mut vertex = BuildState::new(ShaderStage::Vertex, shared, false);
        vertex.emit_attribute("position", "vec3");
        vertex.emit_uniform_from_string("u_alpha", "float", Some("ALPHA"), true);
        vertex.compile("gl_Position = vec4(position, u_alpha);\n");
        let src = vertex.finalize();
        assert!(!src.contains("#version"));
        assert!(src.contains("attribute vec3 position;"));
        assert!(src.contains("#ifndef ALPHA\nuniform float u_alpha;\n#endif"));
        assert!(src.ends_with("gl_Position = vec4(position, u_alpha);\n}\n"));
    }

    #[test]
    fn scene_block_needs_uniform_buffers() {
        let shared = Rc::new(RefCell::new(SharedData::new(GlslVersion::Es300)));
        let mut with = BuildState::new(ShaderStage::Vertex, shared.clone(), true);
        let mut without = BuildState::new(ShaderStage::Vertex, shared, false);
        assert!(with.emit_scene_uniform("viewProjection"));
        assert!(!with.emit_scene_uniform("world"));
        assert!(!without.emit_scene_uniform("viewProjection"));
        assert_eq!(with.uniform_buffers, ["Scene"]);
        assert!(with.finalize().contains("uniform Scene {"));
    }
}
