//! Rendering-engine core: a cached GL-style state layer, GPU resource
//! management with context-loss rebuild, effect compilation and the
//! node-material shader-graph compiler.

pub mod config;
pub mod engine;
pub mod gl;
pub mod logging;
pub mod node_material;
pub mod scene;
pub mod validation;

pub use config::EngineOptions;
pub use engine::Engine;
