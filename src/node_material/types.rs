//! Connection-point types, block targets, system values and their GLSL
//! spellings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value type carried by a connection point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionPointType {
    Float,
    Int,
    Vector2,
    Vector3,
    Vector4,
    Color3,
    Color4,
    Matrix,
    Texture,
    /// Takes the type of whatever gets connected.
    AutoDetect,
    /// Output whose type follows the block's first input.
    BasedOnInput,
}

impl ConnectionPointType {
    pub fn glsl(self) -> &'static str {
        match self {
            ConnectionPointType::Float => "float",
            ConnectionPointType::Int => "int",
            ConnectionPointType::Vector2 => "vec2",
            ConnectionPointType::Vector3 | ConnectionPointType::Color3 => "vec3",
            ConnectionPointType::Vector4 | ConnectionPointType::Color4 => "vec4",
            ConnectionPointType::Matrix => "mat4",
            ConnectionPointType::Texture => "sampler2D",
            ConnectionPointType::AutoDetect | ConnectionPointType::BasedOnInput => "float",
        }
    }

    /// Number of float components; `0` for non-vector types.
    pub fn components(self) -> usize {
        match self {
            ConnectionPointType::Float | ConnectionPointType::Int => 1,
            ConnectionPointType::Vector2 => 2,
            ConnectionPointType::Vector3 | ConnectionPointType::Color3 => 3,
            ConnectionPointType::Vector4 | ConnectionPointType::Color4 => 4,
            ConnectionPointType::Matrix => 16,
            _ => 0,
        }
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, ConnectionPointType::AutoDetect | ConnectionPointType::BasedOnInput)
    }

    /// Whether an output of type `self` may feed an input declared as `input`.
    pub fn can_feed(self, input: ConnectionPointType) -> bool {
        use ConnectionPointType::*;
        match (self, input) {
            (_, AutoDetect) => true,
            (a, b) if a == b => true,
            (Vector3, Color3) | (Color3, Vector3) => true,
            (Vector4, Color4) | (Color4, Vector4) => true,
            (Int, Float) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionPointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Stage(s) a block or connection point belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockTarget {
    Vertex,
    Fragment,
    VertexAndFragment,
    /// Built in whichever stage first consumes it.
    #[default]
    Neutral,
}

impl BlockTarget {
    pub fn includes(self, stage: ShaderStage) -> bool {
        match self {
            BlockTarget::Vertex => stage == ShaderStage::Vertex,
            BlockTarget::Fragment => stage == ShaderStage::Fragment,
            BlockTarget::VertexAndFragment | BlockTarget::Neutral => true,
        }
    }
}

/// One of the two generated programs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        })
    }
}

/// GLSL dialect the generated sources target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GlslVersion {
    /// `#version 100`: `attribute`/`varying`, `gl_FragColor`.
    Es100,
    #[default]
    Es300,
}

/// Engine-computed value an input block can be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemValue {
    World,
    View,
    Projection,
    ViewProjection,
    WorldView,
    WorldViewProjection,
    CameraPosition,
    FogColor,
    DeltaTime,
    Time,
}

impl SystemValue {
    /// Uniform name the value is declared and uploaded under.
    pub fn uniform_name(self) -> &'static str {
        match self {
            SystemValue::World => "world",
            SystemValue::View => "view",
            SystemValue::Projection => "projection",
            SystemValue::ViewProjection => "viewProjection",
            SystemValue::WorldView => "worldView",
            SystemValue::WorldViewProjection => "worldViewProjection",
            SystemValue::CameraPosition => "cameraPosition",
            SystemValue::FogColor => "fogColor",
            SystemValue::DeltaTime => "deltaTime",
            SystemValue::Time => "time",
        }
    }

    pub fn value_type(self) -> ConnectionPointType {
        match self {
            SystemValue::CameraPosition => ConnectionPointType::Vector3,
            SystemValue::FogColor => ConnectionPointType::Color3,
            SystemValue::DeltaTime | SystemValue::Time => ConnectionPointType::Float,
            _ => ConnectionPointType::Matrix,
        }
    }

    /// Depends on the mesh being drawn rather than the scene.
    pub fn is_per_mesh(self) -> bool {
        matches!(self, SystemValue::World | SystemValue::WorldView | SystemValue::WorldViewProjection)
    }

    /// Scene-wide matrices that live in the `Scene` uniform block when
    /// uniform buffers are enabled.
    pub fn in_scene_block(self) -> bool {
        matches!(self, SystemValue::ViewProjection | SystemValue::View | SystemValue::Projection)
    }
}

/// Per-frame animation applied to an input value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimatedInputType {
    #[default]
    None,
    Time,
}

/// Type of a well-known mesh attribute.
pub fn attribute_type(name: &str) -> Option<ConnectionPointType> {
    Some(match name {
        "position" | "normal" => ConnectionPointType::Vector3,
        "tangent" | "matricesIndices" | "matricesWeights" => ConnectionPointType::Vector4,
        "uv" | "uv2" => ConnectionPointType::Vector2,
        "color" => ConnectionPointType::Color4,
        _ => return None,
    })
}

/// Well-known mesh attribute names.
pub const KNOWN_ATTRIBUTES: [&str; 8] =
    ["position", "normal", "tangent", "uv", "uv2", "color", "matricesIndices", "matricesWeights"];

/// Expression converting `expr` of type `from` to a `vec4`.
pub(crate) fn to_vec4(expr: &str, from: ConnectionPointType) -> String {
    match from {
        ConnectionPointType::Float | ConnectionPointType::Int => format!("vec4(vec3(float({expr})), 1.0)"),
        ConnectionPointType::Vector2 => format!("vec4({expr}, 0.0, 1.0)"),
        ConnectionPointType::Vector3 | ConnectionPointType::Color3 => format!("vec4({expr}, 1.0)"),
        ConnectionPointType::Matrix => format!("({expr} * vec4(0.0, 0.0, 0.0, 1.0))"),
        _ => expr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_and_vectors_interchange() {
        assert!(ConnectionPointType::Color3.can_feed(ConnectionPointType::Vector3));
        assert!(ConnectionPointType::Vector4.can_feed(ConnectionPointType::Color4));
        assert!(ConnectionPointType::Matrix.can_feed(ConnectionPointType::AutoDetect));
        assert!(!ConnectionPointType::Vector2.can_feed(ConnectionPointType::Vector3));
    }

    #[test]
    fn attributes_detect_types() {
        assert_eq!(attribute_type("uv"), Some(ConnectionPointType::Vector2));
        assert_eq!(attribute_type("color"), Some(ConnectionPointType::Color4));
        assert_eq!(attribute_type("custom"), None);
        assert_eq!(SystemValue::WorldViewProjection.value_type(), ConnectionPointType::Matrix);
    }
}
