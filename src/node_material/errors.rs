//! Errors raised while editing, building or loading a node-material graph.

use thiserror::Error;

use crate::node_material::types::{ConnectionPointType, ShaderStage};

#[derive(Debug, Error, PartialEq)]
pub enum NodeMaterialError {
    #[error("cycle detected through block '{block}'")]
    Cycle { block: String },

    #[error("required input '{input}' of block '{block}' is not connected")]
    UnconnectedInput { block: String, input: String },

    #[error("block '{block}' reads '{source_block}' which is not available in the {stage} stage")]
    UnbuiltInput { block: String, source_block: String, stage: ShaderStage },

    #[error("input block '{block}' has no value, attribute or system value")]
    UndefinedInput { block: String },

    #[error("function '{name}' was emitted twice with different code")]
    DuplicateFunction { name: String },

    #[error("varying '{name}' declared as {ty} but already exists as {previous}")]
    VaryingTypeMismatch { name: String, ty: String, previous: String },

    #[error("no block with id {0}")]
    UnknownBlock(u32),

    #[error("block '{block}' has no connection point named '{point}'")]
    UnknownConnectionPoint { block: String, point: String },

    #[error("cannot connect {from} output to {to} input '{input}' of block '{block}'")]
    TypeMismatch { block: String, input: String, from: ConnectionPointType, to: ConnectionPointType },

    #[error("the graph has no vertex or fragment output block")]
    MissingOutput,
}

#[derive(Debug, Error)]
pub enum GraphFormatError {
    #[error("malformed node-material JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown block class '{0}'")]
    UnknownClass(String),

    #[error("block id {0} is out of range")]
    InvalidId(u32),

    #[error("block id {0} appears more than once")]
    DuplicateId(u32),

    #[error("input '{input}' of block {block} references missing block {target}")]
    DanglingConnection { block: u32, input: String, target: u32 },

    #[error("invalid properties for block {block}: {message}")]
    InvalidProperties { block: u32, message: String },

    #[error(transparent)]
    Graph(#[from] NodeMaterialError),
}
