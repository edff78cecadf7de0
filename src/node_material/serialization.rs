//! JSON graph format.
//!
//! Each block is a record of its class name, id, name, input links (by
//! source block id and output name), output names and its kind-specific
//! properties flattened into the same object. Loading rebuilds blocks by class
//! name and relinks by id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::node_material::blocks::{Block, BlockKind, InputBlock, InputSource, InputValue, TextureBlock, TrigonometryOperation};
use crate::node_material::connection::{BlockId, OutputRef};
use crate::node_material::errors::{GraphFormatError, NodeMaterialError};
use crate::node_material::graph::{MAX_BLOCK_ID, NodeMaterial};
use crate::node_material::types::{AnimatedInputType, BlockTarget, ConnectionPointType, SystemValue};

/// Namespace some editors prefix class names with.
const CLASS_PREFIX: &str = "BABYLON.";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedGraph {
    #[serde(default)]
    pub name: String,
    pub blocks: Vec<SerializedBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedBlock {
    pub custom_type: String,
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BlockTarget>,
    #[serde(default)]
    pub inputs: Vec<SerializedInput>,
    #[serde(default)]
    pub outputs: Vec<SerializedOutput>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedInput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_block_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_connection_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializedOutput {
    pub name: String,
}

// ── Kind properties ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum InputMode {
    #[default]
    Undefined,
    Value,
    Attribute,
    SystemValue,
    Varying,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InputProperties {
    #[serde(rename = "type")]
    ty: ConnectionPointType,
    mode: InputMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    attribute_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_value: Option<SystemValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    varying_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<InputValue>,
    is_constant: bool,
    visible_in_inspector: bool,
    animation_type: AnimatedInputType,
}

impl Default for InputProperties {
    fn default() -> Self {
        Self {
            ty: ConnectionPointType::AutoDetect,
            mode: InputMode::Undefined,
            attribute_name: None,
            system_value: None,
            varying_name: None,
            value: None,
            is_constant: false,
            visible_in_inspector: false,
            animation_type: AnimatedInputType::None,
        }
    }
}

impl InputProperties {
    fn from_input(input: &InputBlock) -> Self {
        let mut props = Self {
            ty: input.ty(),
            is_constant: input.is_constant,
            visible_in_inspector: input.visible_in_inspector,
            animation_type: input.animation_type,
            ..Default::default()
        };
        match input.source() {
            InputSource::Undefined => {}
            InputSource::Value(_) | InputSource::Callback(_) => {
                props.mode = InputMode::Value;
                props.value = input.value();
            }
            InputSource::Attribute(a) => {
                props.mode = InputMode::Attribute;
                props.attribute_name = Some(a.clone());
            }
            InputSource::SystemValue(s) => {
                props.mode = InputMode::SystemValue;
                props.system_value = Some(*s);
            }
            InputSource::Varying(v) => {
                props.mode = InputMode::Varying;
                props.varying_name = Some(v.clone());
            }
        }
        props
    }

    fn into_input(self, block: u32) -> Result<InputBlock, GraphFormatError> {
        let missing = |field: &str| GraphFormatError::InvalidProperties {
            block,
            message: format!("missing '{field}'"),
        };
        let mut input = InputBlock::new(self.ty);
        match self.mode {
            InputMode::Undefined => {}
            InputMode::Value => input.set_value(self.value.ok_or_else(|| missing("value"))?),
            InputMode::Attribute => input.set_as_attribute(&self.attribute_name.ok_or_else(|| missing("attributeName"))?),
            InputMode::SystemValue => input.set_as_system_value(self.system_value.ok_or_else(|| missing("systemValue"))?),
            InputMode::Varying => input.set_as_varying(&self.varying_name.ok_or_else(|| missing("varyingName"))?),
        }
        input.is_constant = self.is_constant;
        input.visible_in_inspector = self.visible_in_inspector;
        input.animation_type = self.animation_type;
        Ok(input)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TransformProperties {
    complement_w: f32,
    complement_z: f32,
}

impl Default for TransformProperties {
    fn default() -> Self {
        Self { complement_w: 1.0, complement_z: 0.0 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ClampProperties {
    minimum: f32,
    maximum: f32,
}

impl Default for ClampProperties {
    fn default() -> Self {
        Self { minimum: 0.0, maximum: 1.0 }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct TrigonometryProperties {
    operation: TrigonometryOperation,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct TextureProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

fn to_map<T: Serialize>(props: &T) -> Map<String, Value> {
    match serde_json::to_value(props) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn kind_properties(kind: &BlockKind) -> Map<String, Value> {
    match kind {
        BlockKind::Input(input) => to_map(&InputProperties::from_input(input)),
        BlockKind::Transform { complement_w, complement_z } => {
            to_map(&TransformProperties { complement_w: *complement_w, complement_z: *complement_z })
        }
        BlockKind::Clamp { minimum, maximum } => to_map(&ClampProperties { minimum: *minimum, maximum: *maximum }),
        BlockKind::Trigonometry(operation) => to_map(&TrigonometryProperties { operation: *operation }),
        BlockKind::Texture(texture) => to_map(&TextureProperties { url: texture.url.clone() }),
        _ => Map::new(),
    }
}

fn apply_properties(kind: BlockKind, props: Map<String, Value>, block: u32) -> Result<BlockKind, GraphFormatError> {
    fn decode<T: for<'de> Deserialize<'de>>(props: Map<String, Value>, block: u32) -> Result<T, GraphFormatError> {
        serde_json::from_value(Value::Object(props))
            .map_err(|e| GraphFormatError::InvalidProperties { block, message: e.to_string() })
    }
    Ok(match kind {
        BlockKind::Input(_) => BlockKind::Input(decode::<InputProperties>(props, block)?.into_input(block)?),
        BlockKind::Transform { .. } => {
            let p: TransformProperties = decode(props, block)?;
            BlockKind::Transform { complement_w: p.complement_w, complement_z: p.complement_z }
        }
        BlockKind::Clamp { .. } => {
            let p: ClampProperties = decode(props, block)?;
            BlockKind::Clamp { minimum: p.minimum, maximum: p.maximum }
        }
        BlockKind::Trigonometry(_) => BlockKind::Trigonometry(decode::<TrigonometryProperties>(props, block)?.operation),
        BlockKind::Texture(_) => {
            let p: TextureProperties = decode(props, block)?;
            BlockKind::Texture(TextureBlock { texture: None, url: p.url })
        }
        other => other,
    })
}

// ── Graph ────────────────────────────────────────────────────────────────

pub fn serialize(material: &NodeMaterial) -> SerializedGraph {
    let blocks = material
        .blocks()
        .iter()
        .map(|block| SerializedBlock {
            custom_type: block.class_name().to_string(),
            id: block.id.0,
            name: block.name.clone(),
            target: block.target_override(),
            inputs: block
                .inputs
                .iter()
                .map(|input| {
                    let link = input.connected_to();
                    SerializedInput {
                        name: input.name.clone(),
                        target_block_id: link.map(|l| l.block.0),
                        target_connection_name: link.and_then(|l| {
                            material.block(l.block).and_then(|b| b.outputs.get(l.output)).map(|o| o.name.clone())
                        }),
                    }
                })
                .collect(),
            outputs: block.outputs.iter().map(|o| SerializedOutput { name: o.name.clone() }).collect(),
            properties: kind_properties(&block.kind),
        })
        .collect();
    SerializedGraph { name: material.name.clone(), blocks }
}

/// Rebuild a material. Links are restored as stored, without type checks,
/// so block order in the file does not matter.
pub fn parse(graph: SerializedGraph) -> Result<NodeMaterial, GraphFormatError> {
    let mut material = NodeMaterial::new(&graph.name);
    let mut links = Vec::new();

    for record in graph.blocks {
        if record.id > MAX_BLOCK_ID {
            return Err(GraphFormatError::InvalidId(record.id));
        }
        let class = record.custom_type.strip_prefix(CLASS_PREFIX).unwrap_or(&record.custom_type);
        let kind = BlockKind::from_class_name(class)
            .ok_or_else(|| GraphFormatError::UnknownClass(record.custom_type.clone()))?;
        let kind = apply_properties(kind, record.properties, record.id)?;
        let mut block = Block::new(BlockId(record.id), &record.name, kind);
        if let Some(target) = record.target {
            block.set_target(target);
        }
        if !material.insert_block(block) {
            return Err(GraphFormatError::DuplicateId(record.id));
        }
        for input in record.inputs {
            if let Some(target) = input.target_block_id {
                links.push((record.id, input.name, target, input.target_connection_name));
            }
        }
    }

    for (block_id, input_name, target, output_name) in links {
        let source = material.block(BlockId(target)).ok_or_else(|| GraphFormatError::DanglingConnection {
            block: block_id,
            input: input_name.clone(),
            target,
        })?;
        let output = match &output_name {
            Some(name) => source.output_index(name).ok_or_else(|| NodeMaterialError::UnknownConnectionPoint {
                block: source.name.clone(),
                point: name.clone(),
            })?,
            None => 0,
        };
        let block = material.block_mut(BlockId(block_id)).ok_or(NodeMaterialError::UnknownBlock(block_id))?;
        let block_name = block.name.clone();
        let point = block
            .inputs
            .iter_mut()
            .find(|i| i.name == input_name)
            .ok_or(NodeMaterialError::UnknownConnectionPoint { block: block_name, point: input_name })?;
        point.link = Some(OutputRef { block: BlockId(target), output });
    }

    log::debug!("loaded node material '{}' with {} blocks", material.name, material.blocks().len());
    Ok(material)
}

impl NodeMaterial {
    pub fn to_json(&self) -> Result<String, GraphFormatError> {
        Ok(serde_json::to_string_pretty(&serialize(self))?)
    }

    pub fn from_json(text: &str) -> Result<Self, GraphFormatError> {
        parse(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_material::blocks::BinaryOp;
    use glam::Vec3;

    fn topology(material: &NodeMaterial) -> Vec<(u32, String, Option<(u32, usize)>)> {
        material
            .blocks()
            .iter()
            .flat_map(|b| b.inputs.iter().map(move |i| (b.id.0, i.name.clone(), i.connected_to().map(|l| (l.block.0, l.output)))))
            .collect()
    }

    #[test]
    fn properties_survive_a_round_trip() {
        let mut m = NodeMaterial::new("props");
        let color = m.add_input("color", |i| {
            i.set_value(InputValue::Color3(Vec3::new(1.0, 0.5, 0.25)));
            i.is_constant = true;
        });
        let clamp = m.add_block("clamp", BlockKind::Clamp { minimum: -1.0, maximum: 2.0 });
        let trig = m.add_block("trig", BlockKind::Trigonometry(TrigonometryOperation::Fract));
        let add = m.add_block("add", BlockKind::Binary(BinaryOp::Add));
        m.connect(color, "output", clamp, "input").unwrap();
        m.connect(clamp, "output", trig, "input").unwrap();
        m.connect(trig, "output", add, "left").unwrap();
        m.connect(color, "output", add, "right").unwrap();

        let loaded = NodeMaterial::from_json(&m.to_json().unwrap()).unwrap();
        assert_eq!(loaded.name, "props");
        assert_eq!(topology(&loaded), topology(&m));
        let input = loaded.block(color).and_then(Block::as_input).unwrap();
        assert!(input.is_constant);
        assert_eq!(input.value(), Some(InputValue::Color3(Vec3::new(1.0, 0.5, 0.25))));
        assert!(matches!(loaded.block(clamp).unwrap().kind, BlockKind::Clamp { minimum, maximum } if minimum == -1.0 && maximum == 2.0));
        assert!(matches!(loaded.block(trig).unwrap().kind, BlockKind::Trigonometry(TrigonometryOperation::Fract)));
    }

    #[test]
    fn prefixed_class_names_and_any_order() {
        let json = r#"{
            "name": "m",
            "blocks": [
                {"customType": "BABYLON.FragmentOutputBlock", "id": 7, "name": "out",
                 "inputs": [{"name": "rgba", "targetBlockId": 3, "targetConnectionName": "output"}]},
                {"customType": "InputBlock", "id": 3, "name": "c", "type": "Float", "mode": "value",
                 "value": {"type": "Float", "value": 0.5}}
            ]
        }"#;
        let m = NodeMaterial::from_json(json).unwrap();
        assert_eq!(m.blocks().len(), 2);
        assert_eq!(m.block(BlockId(7)).unwrap().inputs[0].connected_to(), Some(OutputRef { block: BlockId(3), output: 0 }));
        let next = m.clone().add_block("extra", BlockKind::Normalize);
        assert_eq!(next, BlockId(8));
    }

    #[test]
    fn format_errors_are_typed() {
        let unknown = r#"{"blocks": [{"customType": "PBRBlock", "id": 1}]}"#;
        assert!(matches!(NodeMaterial::from_json(unknown), Err(GraphFormatError::UnknownClass(c)) if c == "PBRBlock"));

        let dangling = r#"{"blocks": [{"customType": "NormalizeBlock", "id": 1,
            "inputs": [{"name": "input", "targetBlockId": 9}]}]}"#;
        assert!(matches!(NodeMaterial::from_json(dangling), Err(GraphFormatError::DanglingConnection { target: 9, .. })));

        let duplicate = r#"{"blocks": [{"customType": "DotBlock", "id": 1}, {"customType": "DotBlock", "id": 1}]}"#;
        assert!(matches!(NodeMaterial::from_json(duplicate), Err(GraphFormatError::DuplicateId(1))));

        let missing = r#"{"blocks": [{"customType": "InputBlock", "id": 1, "mode": "attribute"}]}"#;
        assert!(matches!(NodeMaterial::from_json(missing), Err(GraphFormatError::InvalidProperties { block: 1, .. })));

        assert!(matches!(NodeMaterial::from_json("{"), Err(GraphFormatError::Json(_))));
    }
}
