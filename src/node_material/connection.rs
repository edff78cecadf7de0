//! Named, typed connection points. Links are stored on the consuming input as
//! a block id plus output index.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node_material::types::ConnectionPointType;

/// Stable identifier of a block inside one graph; also its serialized id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An output slot of a specific block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub block: BlockId,
    pub output: usize,
}

#[derive(Clone, Debug)]
pub struct InputPoint {
    pub name: String,
    pub ty: ConnectionPointType,
    pub optional: bool,
    pub(crate) link: Option<OutputRef>,
}

impl InputPoint {
    pub fn new(name: &str, ty: ConnectionPointType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            optional: false,
            link: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn connected_to(&self) -> Option<OutputRef> {
        self.link
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct OutputPoint {
    pub name: String,
    pub ty: ConnectionPointType,
}

impl OutputPoint {
    pub fn new(name: &str, ty: ConnectionPointType) -> Self {
        Self { name: name.to_string(), ty }
    }
}
