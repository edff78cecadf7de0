//! `NodeMaterial`: the block arena, connection editing and the two-stage
//! build that turns the graph into vertex and fragment sources.
//!
//! Build order: every vertex output block (insertion order), an anchor, then
//! every fragment output block. Each output pulls its inputs depth-first in
//! declaration order, so the emitted text depends only on the graph. Vertex
//! code discovered while walking the fragment stage lands at the anchor.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::engine::EffectCreationOptions;
use crate::node_material::blocks::{Block, BlockContext, BlockKind, InputBlock, ResolvedInput, ResolvedOutput};
use crate::node_material::build_state::{BuildState, SharedData, Varying};
use crate::node_material::connection::{BlockId, OutputRef};
use crate::node_material::errors::NodeMaterialError;
use crate::node_material::types::{
    BlockTarget, ConnectionPointType, GlslVersion, KNOWN_ATTRIBUTES, ShaderStage, SystemValue,
};
use crate::scene::Scene;

#[derive(Clone, Copy, Debug)]
pub struct BuildOptions {
    pub glsl_version: GlslVersion,
    /// Serve view/projection matrices from the `Scene` uniform block.
    /// Ignored for ES 1.00.
    pub support_uniform_buffers: bool,
    pub emit_comments: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            glsl_version: GlslVersion::Es300,
            support_uniform_buffers: false,
            emit_comments: false,
        }
    }
}

/// A uniform fed from an input block at draw time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputBinding {
    pub block: BlockId,
    pub uniform: String,
    pub system_value: Option<SystemValue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub block: BlockId,
    pub sampler: String,
}

/// Result of a successful build.
#[derive(Clone, Debug)]
pub struct CompiledNodeMaterial {
    pub name: String,
    pub vertex_source: String,
    pub fragment_source: String,
    pub attributes: Vec<String>,
    pub uniforms: Vec<String>,
    pub uniform_buffers: Vec<String>,
    pub samplers: Vec<String>,
    pub varyings: Vec<Varying>,
    pub inputs: Vec<InputBinding>,
    pub textures: Vec<TextureBinding>,
}

impl CompiledNodeMaterial {
    /// Effect cache name; differs whenever the generated text differs.
    pub fn base_name(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.vertex_source.hash(&mut hasher);
        self.fragment_source.hash(&mut hasher);
        let name: String = self.name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
        let name = if name.is_empty() { "nodeMaterial" } else { name.as_str() };
        format!("{name}_{:016x}", hasher.finish())
    }

    pub fn uses_scene_block(&self) -> bool {
        self.uniform_buffers.iter().any(|b| b == "Scene")
    }

    pub fn effect_options(&self) -> EffectCreationOptions {
        EffectCreationOptions {
            base_name: self.base_name(),
            vertex_source: self.vertex_source.clone(),
            fragment_source: self.fragment_source.clone(),
            attributes: self.attributes.clone(),
            uniforms: self.uniforms.clone(),
            uniform_buffers: self.uniform_buffers.clone(),
            samplers: self.samplers.clone(),
            ..Default::default()
        }
    }
}

/// Highest id a block may carry; `u32::MAX` is never handed out.
pub const MAX_BLOCK_ID: u32 = u32::MAX - 1;

#[derive(Clone, Debug, Default)]
pub struct NodeMaterial {
    pub name: String,
    blocks: Vec<Block>,
    next_id: u32,
}

impl NodeMaterial {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    // ── Blocks ───────────────────────────────────────────────────────────

    pub fn add_block(&mut self, name: &str, kind: BlockKind) -> BlockId {
        let id = self.allocate_id();
        self.blocks.push(Block::new(id, name, kind));
        id
    }

    fn allocate_id(&mut self) -> BlockId {
        if self.next_id <= MAX_BLOCK_ID {
            let id = BlockId(self.next_id);
            self.next_id += 1;
            return id;
        }
        // The counter reached the top after loading high ids; reuse a gap.
        let free = (0..=MAX_BLOCK_ID).find(|id| self.block(BlockId(*id)).is_none());
        BlockId(free.unwrap_or(MAX_BLOCK_ID))
    }

    /// Convenience for an input block.
    pub fn add_input(&mut self, name: &str, configure: impl FnOnce(&mut InputBlock)) -> BlockId {
        let mut input = InputBlock::default();
        configure(&mut input);
        self.add_block(name, BlockKind::Input(input))
    }

    /// Insert a block with a caller-chosen id. Returns `false` if the id is
    /// taken or above [`MAX_BLOCK_ID`].
    pub fn insert_block(&mut self, block: Block) -> bool {
        if block.id.0 > MAX_BLOCK_ID || self.block(block.id).is_some() {
            return false;
        }
        self.next_id = self.next_id.max(block.id.0 + 1);
        self.blocks.push(block);
        true
    }

    pub fn remove_block(&mut self, id: BlockId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        self.blocks.remove(index);
        for block in &mut self.blocks {
            for input in &mut block.inputs {
                if input.link.is_some_and(|l| l.block == id) {
                    input.link = None;
                }
            }
        }
        true
    }

    fn index_of(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    pub fn block_by_name(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn input_block_mut(&mut self, id: BlockId) -> Option<&mut InputBlock> {
        self.block_mut(id).and_then(Block::as_input_mut)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn output_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_output())
    }

    // ── Connections ──────────────────────────────────────────────────────

    /// Link `from.output` into `to.input`, replacing any previous link.
    pub fn connect(&mut self, from: BlockId, output: &str, to: BlockId, input: &str) -> Result<(), NodeMaterialError> {
        let src = self.block(from).ok_or(NodeMaterialError::UnknownBlock(from.0))?;
        let output_index = src.output_index(output).ok_or_else(|| NodeMaterialError::UnknownConnectionPoint {
            block: src.name.clone(),
            point: output.to_string(),
        })?;
        let link = OutputRef { block: from, output: output_index };
        let from_ty = self.output_type_at(link, 0);

        let dst = self.block(to).ok_or(NodeMaterialError::UnknownBlock(to.0))?;
        let input_index = dst.input_index(input).ok_or_else(|| NodeMaterialError::UnknownConnectionPoint {
            block: dst.name.clone(),
            point: input.to_string(),
        })?;
        let to_ty = dst.inputs[input_index].ty;
        if from_ty.is_resolved() && !from_ty.can_feed(to_ty) {
            return Err(NodeMaterialError::TypeMismatch {
                block: dst.name.clone(),
                input: input.to_string(),
                from: from_ty,
                to: to_ty,
            });
        }
        if let Some(dst) = self.block_mut(to) {
            dst.inputs[input_index].link = Some(link);
        }
        Ok(())
    }

    pub fn disconnect(&mut self, to: BlockId, input: &str) -> Result<(), NodeMaterialError> {
        let block = self.block_mut(to).ok_or(NodeMaterialError::UnknownBlock(to.0))?;
        let name = block.name.clone();
        let point = block
            .inputs
            .iter_mut()
            .find(|i| i.name == input)
            .ok_or_else(|| NodeMaterialError::UnknownConnectionPoint { block: name, point: input.to_string() })?;
        point.link = None;
        Ok(())
    }

    /// Resolved type of an output; `BasedOnInput` follows the first linked
    /// input and falls back to `Float` when nothing is linked yet.
    pub fn output_type(&self, output: OutputRef) -> ConnectionPointType {
        let ty = self.output_type_at(output, 0);
        if ty.is_resolved() { ty } else { ConnectionPointType::Float }
    }

    /// Type of an output as far as the current links tell; unresolved while
    /// a `BasedOnInput` chain ends at an unwired block.
    fn output_type_at(&self, output: OutputRef, depth: usize) -> ConnectionPointType {
        let Some(block) = self.block(output.block) else {
            return ConnectionPointType::BasedOnInput;
        };
        if let Some(input) = block.as_input() {
            return input.ty();
        }
        match block.outputs.get(output.output).map(|o| o.ty) {
            Some(ConnectionPointType::BasedOnInput) if depth <= self.blocks.len() => {
                match block.inputs.iter().find_map(|i| i.link) {
                    Some(link) => self.output_type_at(link, depth + 1),
                    None => block
                        .inputs
                        .first()
                        .map(|i| i.ty)
                        .unwrap_or(ConnectionPointType::BasedOnInput),
                }
            }
            Some(ty) => ty,
            None => ConnectionPointType::BasedOnInput,
        }
    }

    /// Re-check every link now that the whole graph is wired. `connect`
    /// defers links whose source type is still unknown.
    fn check_link_types(&self) -> Result<(), NodeMaterialError> {
        for block in &self.blocks {
            for input in &block.inputs {
                let Some(link) = input.link else {
                    continue;
                };
                let from = self.output_type_at(link, 0);
                if from.is_resolved() && !from.can_feed(input.ty) {
                    return Err(NodeMaterialError::TypeMismatch {
                        block: block.name.clone(),
                        input: input.name.clone(),
                        from,
                        to: input.ty,
                    });
                }
            }
        }
        Ok(())
    }

    // ── Ordering ─────────────────────────────────────────────────────────

    /// Dependency order of all blocks; ties keep insertion order.
    pub fn topological_order(&self) -> Result<Vec<BlockId>, NodeMaterialError> {
        let mut indeg: HashMap<BlockId, usize> = self.blocks.iter().map(|b| (b.id, 0)).collect();
        let mut outgoing: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for block in &self.blocks {
            for link in block.inputs.iter().filter_map(|i| i.link) {
                if !indeg.contains_key(&link.block) {
                    return Err(NodeMaterialError::UnknownBlock(link.block.0));
                }
                *indeg.entry(block.id).or_default() += 1;
                outgoing.entry(link.block).or_default().push(block.id);
            }
        }

        let mut queue: VecDeque<BlockId> =
            self.blocks.iter().map(|b| b.id).filter(|id| indeg.get(id) == Some(&0)).collect();
        let mut order = Vec::with_capacity(self.blocks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for next in outgoing.get(&id).into_iter().flatten() {
                if let Some(d) = indeg.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if order.len() != self.blocks.len() {
            let remaining: HashSet<BlockId> = indeg.iter().filter(|(_, d)| **d > 0).map(|(id, _)| *id).collect();
            return Err(NodeMaterialError::Cycle { block: self.block_on_cycle(&remaining) });
        }
        Ok(order)
    }

    /// Walk upstream inside `remaining` until the walk must be on a cycle.
    fn block_on_cycle(&self, remaining: &HashSet<BlockId>) -> String {
        let mut current = self.blocks.iter().map(|b| b.id).find(|id| remaining.contains(id));
        for _ in 0..self.blocks.len() {
            current = current.and_then(|id| {
                self.block(id)?.inputs.iter().filter_map(|i| i.link).map(|l| l.block).find(|b| remaining.contains(b))
            });
        }
        current.and_then(|id| self.block(id)).map(|b| b.name.clone()).unwrap_or_default()
    }

    // ── Runtime ──────────────────────────────────────────────────────────

    /// Advance time-animated inputs by one scene tick.
    pub fn animate(&mut self, scene: &Scene) {
        for block in &mut self.blocks {
            if let Some(input) = block.as_input_mut() {
                input.animate(scene);
            }
        }
    }

    /// Compile the graph into vertex and fragment sources.
    pub fn build(&mut self, options: &BuildOptions) -> Result<CompiledNodeMaterial, NodeMaterialError> {
        self.topological_order()?;
        if self.output_blocks().next().is_none() {
            return Err(NodeMaterialError::MissingOutput);
        }
        self.check_link_types()?;
        let (compiled, names) = GraphBuilder::new(self, options).run()?;
        for (id, name) in names {
            if let Some(input) = self.input_block_mut(id) {
                input.associated_variable_name = name;
            }
        }
        log::debug!(
            "built node material '{}': {} blocks, {} uniforms, {} varyings",
            self.name,
            self.blocks.len(),
            compiled.uniforms.len(),
            compiled.varyings.len()
        );
        Ok(compiled)
    }
}

// ── Build walk ───────────────────────────────────────────────────────────

struct GraphBuilder<'a> {
    material: &'a NodeMaterial,
    vertex: BuildState,
    fragment: BuildState,
    built: HashSet<(BlockId, ShaderStage)>,
    names: HashMap<(BlockId, usize), String>,
    forwarded: HashMap<(BlockId, usize), String>,
    used_outputs: HashSet<(BlockId, usize)>,
    samplers: Vec<TextureBinding>,
}

impl<'a> GraphBuilder<'a> {
    fn new(material: &'a NodeMaterial, options: &BuildOptions) -> Self {
        let mut shared = SharedData::new(options.glsl_version);
        shared.emit_comments = options.emit_comments;
        let ubo = options.support_uniform_buffers && options.glsl_version == GlslVersion::Es300;

        for name in KNOWN_ATTRIBUTES
            .iter()
            .copied()
            .chain(["glFragColor", "viewProjection", "view", "projection", "computeFresnelTerm"])
        {
            shared.exclude_variable_name(name);
        }
        for input in material.blocks.iter().filter_map(Block::as_input) {
            if let Some(name) = input.fixed_variable_name() {
                shared.exclude_variable_name(name);
            }
        }

        let shared = Rc::new(RefCell::new(shared));
        let used_outputs = material
            .blocks
            .iter()
            .flat_map(|b| b.inputs.iter().filter_map(|i| i.link))
            .map(|l| (l.block, l.output))
            .collect();
        Self {
            material,
            vertex: BuildState::new(ShaderStage::Vertex, shared.clone(), ubo),
            fragment: BuildState::new(ShaderStage::Fragment, shared, ubo),
            built: HashSet::new(),
            names: HashMap::new(),
            forwarded: HashMap::new(),
            used_outputs,
            samplers: Vec::new(),
        }
    }

    fn run(mut self) -> Result<(CompiledNodeMaterial, HashMap<BlockId, String>), NodeMaterialError> {
        let material = self.material;
        let outputs = |kind_is_vertex: bool| {
            material
                .output_blocks()
                .filter(move |b| matches!(b.kind, BlockKind::VertexOutput) == kind_is_vertex)
                .map(|b| b.id)
                .collect::<Vec<_>>()
        };
        let (vertex_outputs, fragment_outputs) = (outputs(true), outputs(false));

        for id in &vertex_outputs {
            self.ensure_built(*id, ShaderStage::Vertex, &material.name)?;
        }
        if vertex_outputs.is_empty() {
            self.vertex.compile("    gl_Position = vec4(0.0, 0.0, 0.0, 1.0);\n");
        }
        let anchor = self.vertex.repeatable_content_anchor();
        self.vertex.set_insertion_anchor(Some(anchor));

        for id in &fragment_outputs {
            self.ensure_built(*id, ShaderStage::Fragment, &material.name)?;
        }
        if fragment_outputs.is_empty() {
            let frag = self.fragment.frag_color();
            self.fragment.compile(format!("    {frag} = vec4(1.0);\n"));
        }

        let mut uniforms = self.vertex.uniforms.clone();
        uniforms.extend(self.fragment.uniforms.iter().filter(|u| !self.vertex.uniforms.contains(u)).cloned());
        let mut uniform_buffers = self.vertex.uniform_buffers.clone();
        uniform_buffers
            .extend(self.fragment.uniform_buffers.iter().filter(|u| !self.vertex.uniform_buffers.contains(u)).cloned());
        let mut samplers = self.vertex.samplers.clone();
        samplers.extend(self.fragment.samplers.iter().cloned());

        let mut inputs = Vec::new();
        let mut input_names = HashMap::new();
        for block in &material.blocks {
            let (Some(input), Some(name)) = (block.as_input(), self.names.get(&(block.id, 0))) else {
                continue;
            };
            input_names.insert(block.id, name.clone());
            if input.is_uniform() || input.is_system_value() {
                inputs.push(InputBinding {
                    block: block.id,
                    uniform: name.clone(),
                    system_value: input.system_value(),
                });
            }
        }

        let compiled = CompiledNodeMaterial {
            name: material.name.clone(),
            vertex_source: self.vertex.finalize(),
            fragment_source: self.fragment.finalize(),
            attributes: self.vertex.attributes.clone(),
            uniforms,
            uniform_buffers,
            samplers,
            varyings: self.vertex.shared().borrow().varyings().to_vec(),
            inputs,
            textures: self.samplers,
        };
        Ok((compiled, input_names))
    }

    fn block(&self, id: BlockId) -> Result<&'a Block, NodeMaterialError> {
        self.material.block(id).ok_or(NodeMaterialError::UnknownBlock(id.0))
    }

    /// Build `id` so its outputs can feed `stage`; returns the stage whose
    /// variables hold them.
    fn ensure_built(&mut self, id: BlockId, stage: ShaderStage, consumer: &str) -> Result<ShaderStage, NodeMaterialError> {
        let block = self.block(id)?;
        let build_stage = match block.target() {
            BlockTarget::Vertex => ShaderStage::Vertex,
            BlockTarget::Fragment if stage == ShaderStage::Vertex => {
                return Err(NodeMaterialError::UnbuiltInput {
                    block: consumer.to_string(),
                    source_block: block.name.clone(),
                    stage,
                });
            }
            BlockTarget::Fragment => ShaderStage::Fragment,
            BlockTarget::VertexAndFragment => stage,
            BlockTarget::Neutral => {
                if stage == ShaderStage::Fragment
                    && !self.built.contains(&(id, stage))
                    && self.built.contains(&(id, ShaderStage::Vertex))
                {
                    ShaderStage::Vertex
                } else {
                    stage
                }
            }
        };
        self.build_in(block, build_stage)?;
        Ok(build_stage)
    }

    fn build_in(&mut self, block: &'a Block, stage: ShaderStage) -> Result<(), NodeMaterialError> {
        if !self.built.insert((block.id, stage)) {
            return Ok(());
        }

        let mut inputs = Vec::with_capacity(block.inputs.len());
        for input in &block.inputs {
            match input.link {
                Some(link) => inputs.push(Some(self.resolve(link, stage, &block.name)?)),
                None if input.optional => inputs.push(None),
                None => {
                    return Err(NodeMaterialError::UnconnectedInput {
                        block: block.name.clone(),
                        input: input.name.clone(),
                    });
                }
            }
        }

        let outputs = (0..block.outputs.len())
            .map(|i| ResolvedOutput {
                name: self.output_name(block, i),
                ty: self.material.output_type(OutputRef { block: block.id, output: i }),
                used: self.used_outputs.contains(&(block.id, i)),
            })
            .collect();
        let state = match stage {
            ShaderStage::Vertex => &mut self.vertex,
            ShaderStage::Fragment => &mut self.fragment,
        };
        let mut ctx = BlockContext {
            state,
            name: &block.name,
            input_names: block.inputs.iter().map(|i| i.name.clone()).collect(),
            inputs,
            outputs,
            samplers: Vec::new(),
        };
        block.kind.build(&mut ctx)?;
        let samplers = ctx.samplers;
        self.samplers
            .extend(samplers.into_iter().map(|sampler| TextureBinding { block: block.id, sampler }));
        Ok(())
    }

    /// Expression for `link` usable in `stage`, forwarding vertex values to
    /// the fragment stage through a varying.
    fn resolve(&mut self, link: OutputRef, stage: ShaderStage, consumer: &str) -> Result<ResolvedInput, NodeMaterialError> {
        let built_stage = self.ensure_built(link.block, stage, consumer)?;
        let ty = self.material.output_type(link);
        let block = self.block(link.block)?;
        let name = self.output_name(block, link.output);
        if built_stage == stage {
            return Ok(ResolvedInput { expr: name, ty });
        }
        if let Some(varying) = self.forwarded.get(&(link.block, link.output)) {
            return Ok(ResolvedInput { expr: varying.clone(), ty });
        }
        let varying = self.vertex.get_free_variable_name(&format!("v_{name}"));
        self.vertex.emit_varying_from_string(&varying, ty.glsl(), None, false)?;
        self.vertex.add_varying_transfer(format!("    {varying} = {name};\n"));
        self.forwarded.insert((link.block, link.output), varying.clone());
        Ok(ResolvedInput { expr: varying, ty })
    }

    /// Variable holding output `index`, allocated once per build.
    fn output_name(&mut self, block: &Block, index: usize) -> String {
        if let Some(name) = self.names.get(&(block.id, index)) {
            return name.clone();
        }
        let name = match block.as_input() {
            Some(input) => match input.fixed_variable_name() {
                Some(fixed) => fixed.to_string(),
                None if input.is_inlined_constant() => self.vertex.get_free_variable_name(&block.name),
                None => self.vertex.get_free_variable_name(&format!("u_{}", block.name)),
            },
            None => {
                let output = block.outputs.get(index).map_or("output", |o| o.name.as_str());
                self.vertex.get_free_variable_name(&format!("{}_{output}", block.name))
            }
        };
        self.names.insert((block.id, index), name.clone());
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_material::blocks::{BinaryOp, InputValue, TextureBlock};
    use glam::Vec4;

    fn standard_graph() -> NodeMaterial {
        let mut m = NodeMaterial::new("standard");
        let position = m.add_input("position", |i| i.set_as_attribute("position"));
        let wvp = m.add_input("wvp", |i| i.set_as_system_value(SystemValue::WorldViewProjection));
        let transform = m.add_block("transform", BlockKind::transform());
        let vertex_out = m.add_block("vertexOutput", BlockKind::VertexOutput);
        let uv = m.add_input("uv", |i| i.set_as_attribute("uv"));
        let texture = m.add_block("diffuse", BlockKind::Texture(TextureBlock::default()));
        let frag_out = m.add_block("fragmentOutput", BlockKind::FragmentOutput);
        m.connect(position, "output", transform, "vector").unwrap();
        m.connect(wvp, "output", transform, "transform").unwrap();
        m.connect(transform, "output", vertex_out, "vector").unwrap();
        m.connect(uv, "output", texture, "uv").unwrap();
        m.connect(texture, "rgba", frag_out, "rgba").unwrap();
        m
    }

    #[test]
    fn attribute_reaches_fragment_through_varying() {
        let compiled = standard_graph().build(&BuildOptions::default()).unwrap();
        let vs = &compiled.vertex_source;
        let fs = &compiled.fragment_source;
        assert!(vs.contains("in vec3 position;"));
        assert!(vs.contains("in vec2 uv;"));
        assert!(vs.contains("out vec2 v_uv;"));
        assert!(vs.contains("    v_uv = uv;\n"));
        assert!(vs.contains("gl_Position = transform_output;"));
        assert!(fs.contains("in vec2 v_uv;"));
        assert!(fs.contains("uniform sampler2D diffuseSampler;"));
        assert!(fs.contains("texture(diffuseSampler, v_uv)"));
        assert!(!fs.contains("in vec3 position;"));
        assert_eq!(compiled.attributes, ["position", "uv"]);
        assert_eq!(compiled.samplers, ["diffuseSampler"]);
        assert_eq!(compiled.textures.len(), 1);
    }

    #[test]
    fn builds_are_deterministic() {
        let a = standard_graph().build(&BuildOptions::default()).unwrap();
        let b = standard_graph().build(&BuildOptions::default()).unwrap();
        assert_eq!(a.vertex_source, b.vertex_source);
        assert_eq!(a.fragment_source, b.fragment_source);
        assert_eq!(a.base_name(), b.base_name());
    }

    #[test]
    fn system_value_into_fragment_output() {
        let mut m = NodeMaterial::new("wvp");
        let wvp = m.add_input("wvp", |i| i.set_as_system_value(SystemValue::WorldViewProjection));
        let out = m.add_block("out", BlockKind::FragmentOutput);
        m.connect(wvp, "output", out, "rgba").unwrap();
        let compiled = m.build(&BuildOptions::default()).unwrap();
        assert!(compiled.fragment_source.contains("uniform mat4 worldViewProjection;"));
        assert!(compiled.fragment_source.contains("glFragColor = (worldViewProjection * vec4(0.0, 0.0, 0.0, 1.0));"));
        assert!(!compiled.vertex_source.contains("worldViewProjection"));
        assert_eq!(compiled.inputs[0].system_value, Some(SystemValue::WorldViewProjection));
        assert_eq!(m.block(wvp).and_then(Block::as_input).unwrap().associated_variable_name(), "worldViewProjection");
    }

    #[test]
    fn cycles_are_rejected_with_a_block_name() {
        let mut m = NodeMaterial::new("cycle");
        let a = m.add_block("a", BlockKind::Binary(BinaryOp::Add));
        let b = m.add_block("b", BlockKind::Binary(BinaryOp::Add));
        let out = m.add_block("out", BlockKind::FragmentOutput);
        m.connect(a, "output", b, "left").unwrap();
        m.connect(b, "output", a, "left").unwrap();
        m.connect(b, "output", out, "rgba").unwrap();
        match m.build(&BuildOptions::default()) {
            Err(NodeMaterialError::Cycle { block }) => assert!(block == "a" || block == "b"),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn fragment_block_cannot_feed_vertex_stage() {
        let mut m = NodeMaterial::new("bad");
        let uv = m.add_input("uv", |i| i.set_as_attribute("uv"));
        let texture = m.add_block("tex", BlockKind::Texture(TextureBlock::default()));
        let out = m.add_block("vout", BlockKind::VertexOutput);
        m.connect(uv, "output", texture, "uv").unwrap();
        m.connect(texture, "rgba", out, "vector").unwrap();
        assert_eq!(
            m.build(&BuildOptions::default()).unwrap_err(),
            NodeMaterialError::UnbuiltInput { block: "vout".into(), source_block: "tex".into(), stage: ShaderStage::Vertex }
        );
    }

    #[test]
    fn missing_required_input_is_reported() {
        let mut m = NodeMaterial::new("open");
        let add = m.add_block("add", BlockKind::Binary(BinaryOp::Add));
        let color = m.add_input("color", |i| i.set_value(InputValue::Color4(Vec4::ONE)));
        let out = m.add_block("out", BlockKind::FragmentOutput);
        m.connect(color, "output", add, "left").unwrap();
        m.connect(add, "output", out, "rgba").unwrap();
        assert_eq!(
            m.build(&BuildOptions::default()).unwrap_err(),
            NodeMaterialError::UnconnectedInput { block: "add".into(), input: "right".into() }
        );
    }

    #[test]
    fn late_vertex_code_lands_after_vertex_outputs() {
        let mut m = standard_graph();
        let normal = m.add_input("normal", |i| i.set_as_attribute("normal"));
        let world = m.add_input("world", |i| i.set_as_system_value(SystemValue::World));
        let world_normal = m.add_block("worldNormal", BlockKind::transform());
        if let Some(b) = m.block_mut(world_normal) {
            b.set_target(BlockTarget::Vertex);
        }
        let out = m.block_by_name("fragmentOutput").map(|b| b.id).unwrap();
        m.connect(normal, "output", world_normal, "vector").unwrap();
        m.connect(world, "output", world_normal, "transform").unwrap();
        m.disconnect(out, "rgba").unwrap();
        m.connect(world_normal, "xyz", out, "rgb").unwrap();

        let compiled = m.build(&BuildOptions::default()).unwrap();
        let vs = &compiled.vertex_source;
        let position = vs.find("gl_Position").unwrap();
        let late = vs.find("vec3 worldNormal_xyz").unwrap();
        let transfer = vs.find("v_worldNormal_xyz = worldNormal_xyz;").unwrap();
        assert!(position < late && late < transfer);
        assert!(compiled.fragment_source.contains("glFragColor = vec4(v_worldNormal_xyz, 1.0);"));
    }

    #[test]
    fn type_mismatch_and_missing_output() {
        let mut m = NodeMaterial::new("types");
        let uv = m.add_input("uv", |i| i.set_as_attribute("uv"));
        let cross = m.add_block("cross", BlockKind::Cross);
        assert!(matches!(m.connect(uv, "output", cross, "left"), Err(NodeMaterialError::TypeMismatch { .. })));
        assert_eq!(m.build(&BuildOptions::default()).unwrap_err(), NodeMaterialError::MissingOutput);
    }

    #[test]
    fn scene_matrices_use_the_uniform_block() {
        let mut m = NodeMaterial::new("ubo");
        let position = m.add_input("position", |i| i.set_as_attribute("position"));
        let vp = m.add_input("vp", |i| i.set_as_system_value(SystemValue::ViewProjection));
        let transform = m.add_block("transform", BlockKind::transform());
        let out = m.add_block("vout", BlockKind::VertexOutput);
        m.connect(position, "output", transform, "vector").unwrap();
        m.connect(vp, "output", transform, "transform").unwrap();
        m.connect(transform, "output", out, "vector").unwrap();
        let options = BuildOptions { support_uniform_buffers: true, ..Default::default() };
        let compiled = m.build(&options).unwrap();
        assert!(compiled.uses_scene_block());
        assert!(!compiled.uniforms.contains(&"viewProjection".to_string()));
        assert!(compiled.vertex_source.contains("mat4 viewProjection;"));
        assert!(compiled.fragment_source.contains("glFragColor = vec4(1.0);"));
    }
}
