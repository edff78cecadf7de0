//! Engine construction options.
//!
//! Loaded from a camelCase JSON document; every field is optional and falls back
//! to [`EngineOptions::default`].

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineOptions {
    pub antialias: bool,
    pub premultiplied_alpha: bool,
    pub preserve_drawing_buffer: bool,
    pub stencil: bool,
    /// Skip retaining CPU-side copies of GPU data. Resources cannot be rebuilt
    /// after a context loss when set.
    pub do_not_handle_context_lost: bool,
    pub disable_uniform_buffers: bool,
    pub adapt_to_device_ratio: bool,
    pub device_pixel_ratio: f32,
    pub hardware_scaling_level: f32,
    pub deterministic_lockstep: bool,
    pub lockstep_max_steps: u32,
    /// Fixed step in seconds used by deterministic lock-step.
    pub time_step: f64,
    pub disable_texture_binding_optimization: bool,
    /// Skip the cache wipe that normally happens between frames.
    pub prevent_cache_wipe_between_frames: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            antialias: true,
            premultiplied_alpha: true,
            preserve_drawing_buffer: false,
            stencil: true,
            do_not_handle_context_lost: false,
            disable_uniform_buffers: false,
            adapt_to_device_ratio: false,
            device_pixel_ratio: 1.0,
            hardware_scaling_level: 1.0,
            deterministic_lockstep: false,
            lockstep_max_steps: 4,
            time_step: 1.0 / 60.0,
            disable_texture_binding_optimization: false,
            prevent_cache_wipe_between_frames: false,
        }
    }
}

impl EngineOptions {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let opts: EngineOptions = serde_json::from_str(text).context("invalid engine options json")?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine options {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.hardware_scaling_level > 0.0) {
            bail!("hardwareScalingLevel must be > 0, got {}", self.hardware_scaling_level);
        }
        if !(self.device_pixel_ratio > 0.0) {
            bail!("devicePixelRatio must be > 0, got {}", self.device_pixel_ratio);
        }
        if self.deterministic_lockstep && !(self.time_step > 0.0) {
            bail!("timeStep must be > 0 with deterministicLockstep");
        }
        Ok(())
    }

    /// Effective scaling between canvas pixels and render pixels.
    pub fn effective_scaling_level(&self) -> f32 {
        if self.adapt_to_device_ratio {
            self.hardware_scaling_level / self.device_pixel_ratio
        } else {
            self.hardware_scaling_level
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let opts = EngineOptions::from_json_str(r#"{ "doNotHandleContextLost": true, "stencil": false }"#).unwrap();
        assert!(opts.do_not_handle_context_lost);
        assert!(!opts.stencil);
        assert_eq!(opts.lockstep_max_steps, 4);
        assert_eq!(opts.hardware_scaling_level, 1.0);
    }

    #[test]
    fn rejects_non_positive_scaling() {
        let err = EngineOptions::from_json_str(r#"{ "hardwareScalingLevel": 0 }"#).unwrap_err();
        assert!(format!("{err:#}").contains("hardwareScalingLevel"));
    }

    #[test]
    fn device_ratio_divides_scaling_when_adapting() {
        let opts = EngineOptions {
            adapt_to_device_ratio: true,
            device_pixel_ratio: 2.0,
            ..EngineOptions::default()
        };
        assert_eq!(opts.effective_scaling_level(), 0.5);
    }
}
