//! Node materials: shader programs generated from a graph of typed blocks.
//!
//! A [`NodeMaterial`] is edited as a block arena, compiled by
//! [`NodeMaterial::build`] into vertex/fragment GLSL plus the uniform,
//! attribute and sampler lists an effect needs, and bound each frame through
//! [`BoundNodeMaterial`].

pub mod binding;
pub mod blocks;
pub mod build_state;
pub mod connection;
pub mod errors;
pub mod graph;
pub mod serialization;
pub mod types;

pub use binding::{BoundNodeMaterial, build_options_for, set_input_value};
pub use blocks::{
    BinaryOp, Block, BlockKind, InputBlock, InputSource, InputValue, TextureBlock, TrigonometryOperation,
    ValueCallback,
};
pub use build_state::{AnchorId, BuildState, SharedData, Varying};
pub use connection::{BlockId, InputPoint, OutputPoint, OutputRef};
pub use errors::{GraphFormatError, NodeMaterialError};
pub use graph::{BuildOptions, CompiledNodeMaterial, InputBinding, MAX_BLOCK_ID, NodeMaterial, TextureBinding};
pub use serialization::SerializedGraph;
pub use types::{AnimatedInputType, BlockTarget, ConnectionPointType, GlslVersion, ShaderStage, SystemValue};
