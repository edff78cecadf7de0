//! The block library.
//!
//! Every block is a [`Block`] record (id, name, connection points) carrying a
//! [`BlockKind`]: a closed set of variants dispatched through one build
//! contract. A kind declares its connection points and default target, and
//! emits code for one stage through a [`BlockContext`] whose inputs the graph
//! has already resolved to expressions valid in that stage.

use std::fmt;
use std::rc::Rc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::engine::TextureHandle;
use crate::node_material::build_state::BuildState;
use crate::node_material::connection::{BlockId, InputPoint, OutputPoint};
use crate::node_material::errors::NodeMaterialError;
use crate::node_material::types::{
    AnimatedInputType, BlockTarget, ConnectionPointType, GlslVersion, ShaderStage, SystemValue, attribute_type,
    to_vec4,
};
use crate::node_material::types::ConnectionPointType as T;
use crate::scene::Scene;

// ── Values ───────────────────────────────────────────────────────────────

/// A typed constant an input block can hold.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum InputValue {
    Float(f32),
    Int(i32),
    Vector2(Vec2),
    Vector3(Vec3),
    Vector4(Vec4),
    Color3(Vec3),
    Color4(Vec4),
    Matrix(Mat4),
}

pub(crate) fn float_literal(v: f32) -> String {
    if v.is_finite() { format!("{v:?}") } else { "0.0".to_string() }
}

fn vector_literal(ctor: &str, components: &[f32]) -> String {
    let parts: Vec<String> = components.iter().map(|c| float_literal(*c)).collect();
    format!("{ctor}({})", parts.join(", "))
}

impl InputValue {
    pub fn ty(&self) -> ConnectionPointType {
        match self {
            InputValue::Float(_) => T::Float,
            InputValue::Int(_) => T::Int,
            InputValue::Vector2(_) => T::Vector2,
            InputValue::Vector3(_) => T::Vector3,
            InputValue::Vector4(_) => T::Vector4,
            InputValue::Color3(_) => T::Color3,
            InputValue::Color4(_) => T::Color4,
            InputValue::Matrix(_) => T::Matrix,
        }
    }

    /// Zero of the given type; identity for matrices.
    pub fn default_for(ty: ConnectionPointType) -> Self {
        match ty {
            T::Int => InputValue::Int(0),
            T::Vector2 => InputValue::Vector2(Vec2::ZERO),
            T::Vector3 => InputValue::Vector3(Vec3::ZERO),
            T::Vector4 => InputValue::Vector4(Vec4::ZERO),
            T::Color3 => InputValue::Color3(Vec3::ZERO),
            T::Color4 => InputValue::Color4(Vec4::ZERO),
            T::Matrix => InputValue::Matrix(Mat4::IDENTITY),
            _ => InputValue::Float(0.0),
        }
    }

    /// Component values in GLSL order (matrices column-major).
    pub fn to_floats(&self) -> Vec<f32> {
        match self {
            InputValue::Float(v) => vec![*v],
            InputValue::Int(v) => vec![*v as f32],
            InputValue::Vector2(v) => v.to_array().to_vec(),
            InputValue::Vector3(v) | InputValue::Color3(v) => v.to_array().to_vec(),
            InputValue::Vector4(v) | InputValue::Color4(v) => v.to_array().to_vec(),
            InputValue::Matrix(m) => m.to_cols_array().to_vec(),
        }
    }

    pub fn glsl_literal(&self) -> String {
        match self {
            InputValue::Float(v) => float_literal(*v),
            InputValue::Int(v) => v.to_string(),
            other => vector_literal(other.ty().glsl(), &other.to_floats()),
        }
    }
}

/// Convert `expr` of type `from` into an expression of type `to`.
pub(crate) fn cast(expr: &str, from: ConnectionPointType, to: ConnectionPointType) -> String {
    if from == T::Matrix || to == T::Matrix || !to.is_resolved() {
        return expr.to_string();
    }
    let (f, t) = (from.components(), to.components());
    match (from, to) {
        (T::Int, T::Float) => format!("float({expr})"),
        (T::Float, T::Int) => format!("int({expr})"),
        _ if f == t => expr.to_string(),
        _ if f == 1 => format!("{}({expr})", to.glsl()),
        _ if t == 1 => format!("{expr}.x"),
        _ if f > t => format!("{expr}.{}", &"xyzw"[..t]),
        _ => {
            let pad = vec!["0.0"; t - f].join(", ");
            format!("{}({expr}, {pad})", to.glsl())
        }
    }
}

// ── Input block ──────────────────────────────────────────────────────────

pub type ValueCallback = Rc<dyn Fn() -> InputValue>;

/// What an input block is bound to. Exactly one binding is active.
#[derive(Clone, Default)]
pub enum InputSource {
    #[default]
    Undefined,
    Value(InputValue),
    /// Evaluated every time the value is transmitted.
    Callback(ValueCallback),
    Attribute(String),
    SystemValue(SystemValue),
    Varying(String),
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Undefined => f.write_str("Undefined"),
            InputSource::Value(v) => f.debug_tuple("Value").field(v).finish(),
            InputSource::Callback(_) => f.write_str("Callback(..)"),
            InputSource::Attribute(a) => f.debug_tuple("Attribute").field(a).finish(),
            InputSource::SystemValue(s) => f.debug_tuple("SystemValue").field(s).finish(),
            InputSource::Varying(v) => f.debug_tuple("Varying").field(v).finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InputBlock {
    ty: ConnectionPointType,
    source: InputSource,
    /// Emit a `const` instead of a uniform.
    pub is_constant: bool,
    pub visible_in_inspector: bool,
    pub animation_type: AnimatedInputType,
    pub(crate) associated_variable_name: String,
}

impl Default for InputBlock {
    fn default() -> Self {
        Self::new(T::AutoDetect)
    }
}

impl InputBlock {
    pub fn new(ty: ConnectionPointType) -> Self {
        Self {
            ty,
            source: InputSource::Undefined,
            is_constant: false,
            visible_in_inspector: false,
            animation_type: AnimatedInputType::None,
            associated_variable_name: String::new(),
        }
    }

    pub fn ty(&self) -> ConnectionPointType {
        self.ty
    }

    pub fn source(&self) -> &InputSource {
        &self.source
    }

    pub fn set_value(&mut self, value: InputValue) {
        self.ty = value.ty();
        self.source = InputSource::Value(value);
    }

    pub fn set_value_callback(&mut self, ty: ConnectionPointType, callback: ValueCallback) {
        self.ty = ty;
        self.source = InputSource::Callback(callback);
    }

    /// Bind to a mesh attribute; well-known names fix the type.
    pub fn set_as_attribute(&mut self, name: &str) {
        self.ty = attribute_type(name).unwrap_or(if self.ty.is_resolved() { self.ty } else { T::Vector4 });
        self.source = InputSource::Attribute(name.to_string());
    }

    pub fn set_as_system_value(&mut self, value: SystemValue) {
        self.ty = value.value_type();
        self.source = InputSource::SystemValue(value);
    }

    /// Read a varying declared elsewhere; keeps the current type.
    pub fn set_as_varying(&mut self, name: &str) {
        self.source = InputSource::Varying(name.to_string());
    }

    /// Replace the binding with the zero value of the current type.
    pub fn set_default_value(&mut self) {
        let ty = if self.ty.is_resolved() { self.ty } else { T::Float };
        self.set_value(InputValue::default_for(ty));
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.source, InputSource::Undefined)
    }

    /// Callbacks are re-evaluated every bind, so `is_constant` only
    /// applies to stored values.
    pub fn is_uniform(&self) -> bool {
        match self.source {
            InputSource::Value(_) => !self.is_constant,
            InputSource::Callback(_) => true,
            _ => false,
        }
    }

    /// Emitted as a `const` literal instead of a uniform.
    pub fn is_inlined_constant(&self) -> bool {
        self.is_constant && matches!(self.source, InputSource::Value(_))
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self.source, InputSource::Attribute(_))
    }

    pub fn is_varying(&self) -> bool {
        matches!(self.source, InputSource::Varying(_))
    }

    pub fn is_system_value(&self) -> bool {
        matches!(self.source, InputSource::SystemValue(_))
    }

    pub fn system_value(&self) -> Option<SystemValue> {
        match self.source {
            InputSource::SystemValue(s) => Some(s),
            _ => None,
        }
    }

    pub fn attribute_name(&self) -> Option<&str> {
        match &self.source {
            InputSource::Attribute(a) => Some(a),
            _ => None,
        }
    }

    /// Current value: the stored constant or the callback's result.
    pub fn value(&self) -> Option<InputValue> {
        match &self.source {
            InputSource::Value(v) => Some(*v),
            InputSource::Callback(cb) => Some(cb()),
            _ => None,
        }
    }

    pub fn value_callback(&self) -> Option<&ValueCallback> {
        match &self.source {
            InputSource::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    /// Variable the block was emitted as in the last build.
    pub fn associated_variable_name(&self) -> &str {
        &self.associated_variable_name
    }

    pub fn target(&self) -> BlockTarget {
        match self.source {
            InputSource::Attribute(_) => BlockTarget::Vertex,
            InputSource::Varying(_) => BlockTarget::Fragment,
            _ => BlockTarget::VertexAndFragment,
        }
    }

    /// Names that are not allocated: attributes, system uniforms, varyings.
    pub(crate) fn fixed_variable_name(&self) -> Option<&str> {
        match &self.source {
            InputSource::Attribute(a) | InputSource::Varying(a) => Some(a),
            InputSource::SystemValue(s) => Some(s.uniform_name()),
            _ => None,
        }
    }

    /// Advance time-animated values by one scene tick.
    pub fn animate(&mut self, scene: &Scene) {
        if self.animation_type != AnimatedInputType::Time {
            return;
        }
        if let InputSource::Value(InputValue::Float(v)) = &mut self.source {
            *v += scene.animation_ratio() * 0.01;
        }
    }

    fn build(&self, ctx: &mut BlockContext<'_>) -> Result<(), NodeMaterialError> {
        if !self.ty.is_resolved() {
            return Err(NodeMaterialError::UndefinedInput { block: ctx.name.to_string() });
        }
        let name = ctx.output_name(0).to_string();
        let glsl = self.ty.glsl();
        match &self.source {
            InputSource::Undefined => return Err(NodeMaterialError::UndefinedInput { block: ctx.name.to_string() }),
            InputSource::Attribute(attr) => {
                if ctx.state.target == ShaderStage::Vertex {
                    ctx.state.emit_attribute(attr, glsl);
                }
            }
            InputSource::SystemValue(sv) => {
                if !(sv.in_scene_block() && ctx.state.emit_scene_uniform(&name)) {
                    ctx.state.emit_uniform_from_string(&name, glsl, None, false);
                }
            }
            InputSource::Varying(v) => {
                ctx.state.emit_varying_from_string(v, glsl, None, false)?;
            }
            InputSource::Value(v) if self.is_constant => ctx.state.emit_constant(&name, glsl, &v.glsl_literal()),
            InputSource::Value(_) | InputSource::Callback(_) => {
                ctx.state.emit_uniform_from_string(&name, glsl, None, false);
            }
        }
        Ok(())
    }
}

// ── Block kinds ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrigonometryOperation {
    #[default]
    Cos,
    Sin,
    Abs,
    Exp,
    Exp2,
    Round,
    Floor,
    Ceiling,
    Sqrt,
    Log,
    Tan,
    ArcTan,
    ArcCos,
    ArcSin,
    Fract,
    Sign,
    Radians,
    Degrees,
}

impl TrigonometryOperation {
    fn apply(self, v: &str) -> String {
        let f = match self {
            TrigonometryOperation::Round => return format!("floor({v} + 0.5)"),
            TrigonometryOperation::Cos => "cos",
            TrigonometryOperation::Sin => "sin",
            TrigonometryOperation::Abs => "abs",
            TrigonometryOperation::Exp => "exp",
            TrigonometryOperation::Exp2 => "exp2",
            TrigonometryOperation::Floor => "floor",
            TrigonometryOperation::Ceiling => "ceil",
            TrigonometryOperation::Sqrt => "sqrt",
            TrigonometryOperation::Log => "log",
            TrigonometryOperation::Tan => "tan",
            TrigonometryOperation::ArcTan => "atan",
            TrigonometryOperation::ArcCos => "acos",
            TrigonometryOperation::ArcSin => "asin",
            TrigonometryOperation::Fract => "fract",
            TrigonometryOperation::Sign => "sign",
            TrigonometryOperation::Radians => "radians",
            TrigonometryOperation::Degrees => "degrees",
        };
        format!("{f}({v})")
    }
}

/// Texture sampling state. The handle is bound at draw time.
#[derive(Clone, Debug, Default)]
pub struct TextureBlock {
    pub texture: Option<TextureHandle>,
    pub url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

#[derive(Clone, Debug)]
pub enum BlockKind {
    Input(InputBlock),
    VertexOutput,
    FragmentOutput,
    Transform { complement_w: f32, complement_z: f32 },
    Binary(BinaryOp),
    Scale,
    Clamp { minimum: f32, maximum: f32 },
    Lerp,
    Dot,
    Cross,
    Normalize,
    VectorMerger,
    VectorSplitter,
    Texture(TextureBlock),
    Trigonometry(TrigonometryOperation),
    Fresnel,
    Derivative,
}

const FRESNEL_FUNCTION: &str = "\
float computeFresnelTerm(vec3 viewDirection, vec3 worldNormal, float bias, float power) {
    float fresnelTerm = pow(bias + (1.0 - bias) * (1.0 - dot(normalize(viewDirection), worldNormal)), power);
    return clamp(fresnelTerm, 0.0, 1.0);
}";

impl BlockKind {
    pub fn transform() -> Self {
        BlockKind::Transform { complement_w: 1.0, complement_z: 0.0 }
    }

    pub fn clamp() -> Self {
        BlockKind::Clamp { minimum: 0.0, maximum: 1.0 }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            BlockKind::Input(_) => "InputBlock",
            BlockKind::VertexOutput => "VertexOutputBlock",
            BlockKind::FragmentOutput => "FragmentOutputBlock",
            BlockKind::Transform { .. } => "TransformBlock",
            BlockKind::Binary(BinaryOp::Add) => "AddBlock",
            BlockKind::Binary(BinaryOp::Subtract) => "SubtractBlock",
            BlockKind::Binary(BinaryOp::Multiply) => "MultiplyBlock",
            BlockKind::Binary(BinaryOp::Divide) => "DivideBlock",
            BlockKind::Scale => "ScaleBlock",
            BlockKind::Clamp { .. } => "ClampBlock",
            BlockKind::Lerp => "LerpBlock",
            BlockKind::Dot => "DotBlock",
            BlockKind::Cross => "CrossBlock",
            BlockKind::Normalize => "NormalizeBlock",
            BlockKind::VectorMerger => "VectorMergerBlock",
            BlockKind::VectorSplitter => "VectorSplitterBlock",
            BlockKind::Texture(_) => "TextureBlock",
            BlockKind::Trigonometry(_) => "TrigonometryBlock",
            BlockKind::Fresnel => "FresnelBlock",
            BlockKind::Derivative => "DerivativeBlock",
        }
    }

    /// Property-less kind for a class name; kinds with properties get defaults.
    pub fn from_class_name(name: &str) -> Option<Self> {
        Some(match name {
            "InputBlock" => BlockKind::Input(InputBlock::default()),
            "VertexOutputBlock" => BlockKind::VertexOutput,
            "FragmentOutputBlock" => BlockKind::FragmentOutput,
            "TransformBlock" => BlockKind::transform(),
            "AddBlock" => BlockKind::Binary(BinaryOp::Add),
            "SubtractBlock" => BlockKind::Binary(BinaryOp::Subtract),
            "MultiplyBlock" => BlockKind::Binary(BinaryOp::Multiply),
            "DivideBlock" => BlockKind::Binary(BinaryOp::Divide),
            "ScaleBlock" => BlockKind::Scale,
            "ClampBlock" => BlockKind::clamp(),
            "LerpBlock" => BlockKind::Lerp,
            "DotBlock" => BlockKind::Dot,
            "CrossBlock" => BlockKind::Cross,
            "NormalizeBlock" => BlockKind::Normalize,
            "VectorMergerBlock" => BlockKind::VectorMerger,
            "VectorSplitterBlock" => BlockKind::VectorSplitter,
            "TextureBlock" => BlockKind::Texture(TextureBlock::default()),
            "TrigonometryBlock" => BlockKind::Trigonometry(TrigonometryOperation::default()),
            "FresnelBlock" => BlockKind::Fresnel,
            "DerivativeBlock" => BlockKind::Derivative,
            _ => return None,
        })
    }

    pub fn default_target(&self) -> BlockTarget {
        match self {
            BlockKind::Input(input) => input.target(),
            BlockKind::VertexOutput => BlockTarget::Vertex,
            BlockKind::FragmentOutput | BlockKind::Texture(_) | BlockKind::Derivative => BlockTarget::Fragment,
            _ => BlockTarget::Neutral,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, BlockKind::VertexOutput | BlockKind::FragmentOutput)
    }

    fn connection_points(&self) -> (Vec<InputPoint>, Vec<OutputPoint>) {
        let i = InputPoint::new;
        let o = OutputPoint::new;
        match self {
            BlockKind::Input(_) => (vec![], vec![o("output", T::AutoDetect)]),
            BlockKind::VertexOutput => (vec![i("vector", T::AutoDetect)], vec![]),
            BlockKind::FragmentOutput => (
                vec![
                    i("rgba", T::AutoDetect).optional(),
                    i("rgb", T::Color3).optional(),
                    i("a", T::Float).optional(),
                ],
                vec![],
            ),
            BlockKind::Transform { .. } => (
                vec![i("vector", T::AutoDetect), i("transform", T::Matrix)],
                vec![o("output", T::Vector4), o("xyz", T::Vector3)],
            ),
            BlockKind::Binary(_) | BlockKind::Dot => {
                let out = if matches!(self, BlockKind::Dot) { T::Float } else { T::BasedOnInput };
                (vec![i("left", T::AutoDetect), i("right", T::AutoDetect)], vec![o("output", out)])
            }
            BlockKind::Scale => (
                vec![i("input", T::AutoDetect), i("factor", T::Float)],
                vec![o("output", T::BasedOnInput)],
            ),
            BlockKind::Clamp { .. } | BlockKind::Normalize | BlockKind::Trigonometry(_) => {
                (vec![i("input", T::AutoDetect)], vec![o("output", T::BasedOnInput)])
            }
            BlockKind::Lerp => (
                vec![i("left", T::AutoDetect), i("right", T::AutoDetect), i("gradient", T::AutoDetect)],
                vec![o("output", T::BasedOnInput)],
            ),
            BlockKind::Cross => (
                vec![i("left", T::Vector3), i("right", T::Vector3)],
                vec![o("output", T::Vector3)],
            ),
            BlockKind::VectorMerger => (
                vec![
                    i("x", T::Float).optional(),
                    i("y", T::Float).optional(),
                    i("z", T::Float).optional(),
                    i("w", T::Float).optional(),
                ],
                vec![o("xyzw", T::Vector4), o("xyz", T::Vector3), o("xy", T::Vector2)],
            ),
            BlockKind::VectorSplitter => (
                vec![
                    i("xyzw", T::Vector4).optional(),
                    i("xyz", T::Vector3).optional(),
                    i("xy", T::Vector2).optional(),
                ],
                vec![
                    o("xyz", T::Vector3),
                    o("xy", T::Vector2),
                    o("x", T::Float),
                    o("y", T::Float),
                    o("z", T::Float),
                    o("w", T::Float),
                ],
            ),
            BlockKind::Texture(_) => (
                vec![i("uv", T::Vector2)],
                vec![
                    o("rgba", T::Color4),
                    o("rgb", T::Color3),
                    o("r", T::Float),
                    o("g", T::Float),
                    o("b", T::Float),
                    o("a", T::Float),
                ],
            ),
            BlockKind::Fresnel => (
                vec![
                    i("worldNormal", T::AutoDetect),
                    i("viewDirection", T::AutoDetect),
                    i("bias", T::Float).optional(),
                    i("power", T::Float).optional(),
                ],
                vec![o("fresnel", T::Float)],
            ),
            BlockKind::Derivative => (
                vec![i("input", T::AutoDetect)],
                vec![o("dx", T::BasedOnInput), o("dy", T::BasedOnInput)],
            ),
        }
    }

    /// Emit this block's code into `ctx.state`.
    pub(crate) fn build(&self, ctx: &mut BlockContext<'_>) -> Result<(), NodeMaterialError> {
        match self {
            BlockKind::Input(input) => input.build(ctx)?,
            BlockKind::VertexOutput => {
                let v = ctx.required(0)?;
                let code = format!("    gl_Position = {};\n", to_vec4(&v.expr, v.ty));
                ctx.state.compile(code);
            }
            BlockKind::FragmentOutput => {
                let frag = ctx.state.frag_color();
                let color = match (ctx.input(0), ctx.input(1)) {
                    (Some(rgba), _) => to_vec4(&rgba.expr, rgba.ty),
                    (None, Some(rgb)) => format!("vec4({}, 1.0)", cast(&rgb.expr, rgb.ty, T::Vector3)),
                    (None, None) => return Err(ctx.unconnected(0)),
                };
                ctx.state.compile(format!("    {frag} = {color};\n"));
                if let Some(a) = ctx.input(2) {
                    let alpha = cast(&a.expr, a.ty, T::Float);
                    ctx.state.compile(format!("    {frag}.a = {alpha};\n"));
                }
            }
            BlockKind::Transform { complement_w, complement_z } => {
                let v = ctx.required(0)?;
                let m = ctx.required(1)?;
                let (w, z) = (float_literal(*complement_w), float_literal(*complement_z));
                let v4 = match v.ty {
                    T::Vector2 => format!("vec4({}, {z}, {w})", v.expr),
                    T::Vector3 | T::Color3 => format!("vec4({}, {w})", v.expr),
                    T::Vector4 | T::Color4 => v.expr.clone(),
                    _ => format!("vec4(vec3({}), {w})", v.expr),
                };
                let product = format!("{} * {v4}", m.expr);
                if ctx.outputs[1].used {
                    ctx.declare_always(0, product);
                    let out = ctx.output_name(0).to_string();
                    ctx.declare(1, format!("{out}.xyz"));
                } else {
                    ctx.declare(0, product);
                }
            }
            BlockKind::Binary(op) => {
                let (l, r) = (ctx.required(0)?, ctx.required(1)?);
                let ty = ctx.outputs[0].ty;
                let right = if r.ty == T::Float && l.ty != T::Int { r.expr.clone() } else { cast(&r.expr, r.ty, ty) };
                ctx.declare(0, format!("{} {} {right}", l.expr, op.symbol()));
            }
            BlockKind::Scale => {
                let (v, f) = (ctx.required(0)?, ctx.required(1)?);
                ctx.declare(0, format!("{} * {}", v.expr, cast(&f.expr, f.ty, T::Float)));
            }
            BlockKind::Clamp { minimum, maximum } => {
                let v = ctx.required(0)?;
                ctx.declare(0, format!("clamp({}, {}, {})", v.expr, float_literal(*minimum), float_literal(*maximum)));
            }
            BlockKind::Lerp => {
                let (l, r, g) = (ctx.required(0)?, ctx.required(1)?, ctx.required(2)?);
                let ty = ctx.outputs[0].ty;
                let right = cast(&r.expr, r.ty, ty);
                let gradient = if g.ty.components() == 1 { cast(&g.expr, g.ty, T::Float) } else { cast(&g.expr, g.ty, ty) };
                ctx.declare(0, format!("mix({}, {right}, {gradient})", l.expr));
            }
            BlockKind::Dot => {
                let (l, r) = (ctx.required(0)?, ctx.required(1)?);
                ctx.declare(0, format!("dot({}, {})", l.expr, cast(&r.expr, r.ty, l.ty)));
            }
            BlockKind::Cross => {
                let (l, r) = (ctx.required(0)?, ctx.required(1)?);
                ctx.declare(0, format!("cross({}, {})", cast(&l.expr, l.ty, T::Vector3), cast(&r.expr, r.ty, T::Vector3)));
            }
            BlockKind::Normalize => {
                let v = ctx.required(0)?;
                ctx.declare(0, format!("normalize({})", v.expr));
            }
            BlockKind::Trigonometry(op) => {
                let v = ctx.required(0)?;
                ctx.declare(0, op.apply(&v.expr));
            }
            BlockKind::VectorMerger => {
                let c: Vec<String> = (0..4)
                    .map(|i| ctx.input(i).map_or_else(|| "0.0".to_string(), |v| cast(&v.expr, v.ty, T::Float)))
                    .collect();
                ctx.declare(0, format!("vec4({}, {}, {}, {})", c[0], c[1], c[2], c[3]));
                ctx.declare(1, format!("vec3({}, {}, {})", c[0], c[1], c[2]));
                ctx.declare(2, format!("vec2({}, {})", c[0], c[1]));
            }
            BlockKind::VectorSplitter => {
                let Some(src) = (0..3).find_map(|i| ctx.input(i)) else {
                    return Err(ctx.unconnected(0));
                };
                let n = src.ty.components().clamp(2, 4);
                let e = src.expr.clone();
                ctx.declare(0, if n >= 3 { format!("{e}.xyz") } else { format!("vec3({e}.xy, 0.0)") });
                ctx.declare(1, format!("{e}.xy"));
                for (i, c) in ["x", "y", "z", "w"].iter().enumerate() {
                    let expr = if i < n { format!("{e}.{c}") } else { "0.0".to_string() };
                    ctx.declare(2 + i, expr);
                }
            }
            BlockKind::Texture(_) => {
                let uv = ctx.required(0)?;
                let sampler = ctx.state.get_free_variable_name(&format!("{}Sampler", ctx.name));
                ctx.state.emit_sampler(&sampler);
                ctx.samplers.push(sampler.clone());
                let sample = format!("{}({sampler}, {})", ctx.state.texture_fn(), cast(&uv.expr, uv.ty, T::Vector2));
                ctx.declare_always(0, sample);
                let rgba = ctx.output_name(0).to_string();
                for (i, swizzle) in ["rgb", "r", "g", "b", "a"].iter().enumerate() {
                    ctx.declare(i + 1, format!("{rgba}.{swizzle}"));
                }
            }
            BlockKind::Fresnel => {
                let (n, v) = (ctx.required(0)?, ctx.required(1)?);
                let bias = ctx.input(2).map_or_else(|| "0.0".to_string(), |b| cast(&b.expr, b.ty, T::Float));
                let power = ctx.input(3).map_or_else(|| "1.0".to_string(), |p| cast(&p.expr, p.ty, T::Float));
                ctx.state.emit_function("computeFresnelTerm", FRESNEL_FUNCTION, "Fresnel term")?;
                let expr = format!(
                    "computeFresnelTerm({}, {}, {bias}, {power})",
                    cast(&v.expr, v.ty, T::Vector3),
                    cast(&n.expr, n.ty, T::Vector3)
                );
                ctx.declare(0, expr);
            }
            BlockKind::Derivative => {
                let v = ctx.required(0)?;
                if ctx.state.glsl_version() == GlslVersion::Es100 {
                    ctx.state
                        .emit_extension("derivatives", "#extension GL_OES_standard_derivatives : enable");
                }
                ctx.declare(0, format!("dFdx({})", v.expr));
                ctx.declare(1, format!("dFdy({})", v.expr));
            }
        }
        Ok(())
    }
}

// ── Block record ─────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub inputs: Vec<InputPoint>,
    pub outputs: Vec<OutputPoint>,
    pub kind: BlockKind,
    target_override: Option<BlockTarget>,
}

impl Block {
    pub fn new(id: BlockId, name: &str, kind: BlockKind) -> Self {
        let (inputs, outputs) = kind.connection_points();
        Self {
            id,
            name: name.to_string(),
            inputs,
            outputs,
            kind,
            target_override: None,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }

    pub fn target(&self) -> BlockTarget {
        self.target_override.unwrap_or_else(|| self.kind.default_target())
    }

    /// Pin the block to a stage instead of its kind's default.
    pub fn set_target(&mut self, target: BlockTarget) {
        self.target_override = Some(target);
    }

    pub fn target_override(&self) -> Option<BlockTarget> {
        self.target_override
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|i| i.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn as_input(&self) -> Option<&InputBlock> {
        match &self.kind {
            BlockKind::Input(input) => Some(input),
            _ => None,
        }
    }

    pub fn as_input_mut(&mut self) -> Option<&mut InputBlock> {
        match &mut self.kind {
            BlockKind::Input(input) => Some(input),
            _ => None,
        }
    }

    pub fn is_output(&self) -> bool {
        self.kind.is_output()
    }
}

// ── Build context ────────────────────────────────────────────────────────

/// An input resolved to an expression valid in the stage being built.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedInput {
    pub expr: String,
    pub ty: ConnectionPointType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedOutput {
    pub name: String,
    pub ty: ConnectionPointType,
    /// Some block reads this output.
    pub used: bool,
}

pub struct BlockContext<'a> {
    pub state: &'a mut BuildState,
    pub name: &'a str,
    pub(crate) input_names: Vec<String>,
    pub inputs: Vec<Option<ResolvedInput>>,
    pub outputs: Vec<ResolvedOutput>,
    pub(crate) samplers: Vec<String>,
}

impl BlockContext<'_> {
    pub fn input(&self, index: usize) -> Option<&ResolvedInput> {
        self.inputs.get(index).and_then(Option::as_ref)
    }

    pub fn required(&self, index: usize) -> Result<ResolvedInput, NodeMaterialError> {
        self.input(index).cloned().ok_or_else(|| self.unconnected(index))
    }

    fn unconnected(&self, index: usize) -> NodeMaterialError {
        NodeMaterialError::UnconnectedInput {
            block: self.name.to_string(),
            input: self.input_names.get(index).cloned().unwrap_or_default(),
        }
    }

    pub fn output_name(&self, index: usize) -> &str {
        self.outputs.get(index).map_or("", |o| o.name.as_str())
    }

    /// Declare output `index` as `expr` if anything reads it.
    pub fn declare(&mut self, index: usize, expr: String) {
        if self.outputs.get(index).is_some_and(|o| o.used) {
            self.declare_always(index, expr);
        }
    }

    pub fn declare_always(&mut self, index: usize, expr: String) {
        let Some(out) = self.outputs.get(index) else {
            return;
        };
        let code = format!("    {} {} = {expr};\n", out.ty.glsl(), out.name);
        self.state.compile(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_setters_are_exclusive() {
        let mut input = InputBlock::default();
        assert!(input.is_undefined());
        input.set_as_attribute("uv");
        assert_eq!(input.ty(), T::Vector2);
        assert_eq!(input.target(), BlockTarget::Vertex);
        input.set_as_system_value(SystemValue::CameraPosition);
        assert!(!input.is_attribute());
        assert!(input.is_system_value());
        assert_eq!(input.ty(), T::Vector3);
        input.set_default_value();
        assert!(input.is_uniform());
        assert_eq!(input.value(), Some(InputValue::Vector3(Vec3::ZERO)));
        assert_eq!(input.target(), BlockTarget::VertexAndFragment);
    }

    #[test]
    fn matrix_default_is_identity() {
        let mut input = InputBlock::new(T::Matrix);
        input.set_default_value();
        assert_eq!(input.value(), Some(InputValue::Matrix(Mat4::IDENTITY)));
    }

    #[test]
    fn callback_values_are_evaluated_on_read() {
        let mut input = InputBlock::default();
        input.set_value_callback(T::Float, Rc::new(|| InputValue::Float(4.0)));
        assert!(input.value_callback().is_some());
        assert_eq!(input.value(), Some(InputValue::Float(4.0)));
    }

    #[test]
    fn time_animation_follows_scene_clock() {
        let mut input = InputBlock::default();
        input.set_value(InputValue::Float(1.0));
        input.animation_type = AnimatedInputType::Time;
        let mut scene = Scene::default();
        scene.advance(1000.0 / 30.0);
        input.animate(&scene);
        match input.value() {
            Some(InputValue::Float(v)) => assert!((v - 1.02).abs() < 1e-5),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn literals_are_valid_glsl() {
        assert_eq!(InputValue::Float(1.0).glsl_literal(), "1.0");
        assert_eq!(InputValue::Color3(Vec3::new(1.0, 0.5, 0.0)).glsl_literal(), "vec3(1.0, 0.5, 0.0)");
        assert!(InputValue::Matrix(Mat4::IDENTITY).glsl_literal().starts_with("mat4(1.0, 0.0"));
    }

    #[test]
    fn casts_pad_truncate_and_broadcast() {
        assert_eq!(cast("v", T::Vector4, T::Vector3), "v.xyz");
        assert_eq!(cast("v", T::Vector2, T::Vector4), "vec4(v, 0.0, 0.0)");
        assert_eq!(cast("f", T::Float, T::Vector3), "vec3(f)");
        assert_eq!(cast("c", T::Color3, T::Vector3), "c");
        assert_eq!(cast("i", T::Int, T::Float), "float(i)");
    }

    #[test]
    fn class_names_round_trip() {
        for name in ["InputBlock", "TextureBlock", "DivideBlock", "TrigonometryBlock", "VectorSplitterBlock"] {
            let kind = BlockKind::from_class_name(name).unwrap();
            assert_eq!(kind.class_name(), name);
        }
        assert!(BlockKind::from_class_name("PBRMetallicRoughnessBlock").is_none());
    }
}
