//! The slice of a scene that node materials read: a clock, a camera and fog.

use glam::{Mat4, Vec3};

/// Frame duration the animation ratio is normalized against (60 fps).
const REFERENCE_FRAME_MS: f64 = 1000.0 / 60.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

impl Camera {
    /// Right-handed perspective camera at `position` looking at `target`.
    pub fn look_at(position: Vec3, target: Vec3, fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            view: Mat4::look_at_rh(position, target, Vec3::Y),
            projection: Mat4::perspective_rh_gl(fov_y, aspect.max(f32::EPSILON), near, far),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub camera: Camera,
    pub fog_color: Vec3,
    elapsed_ms: f64,
    delta_ms: f64,
}

impl Scene {
    pub fn new(camera: Camera) -> Self {
        Self { camera, ..Default::default() }
    }

    /// Advance the scene clock by one frame.
    pub fn advance(&mut self, delta_ms: f64) {
        let delta_ms = delta_ms.max(0.0);
        self.delta_ms = delta_ms;
        self.elapsed_ms += delta_ms;
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    pub fn delta_ms(&self) -> f64 {
        self.delta_ms
    }

    /// Last frame's duration relative to a 60 fps frame.
    pub fn animation_ratio(&self) -> f32 {
        (self.delta_ms / REFERENCE_FRAME_MS) as f32
    }

    pub fn view_projection(&self) -> Mat4 {
        self.camera.projection * self.camera.view
    }

    pub fn world_view(&self, world: &Mat4) -> Mat4 {
        self.camera.view * *world
    }

    pub fn world_view_projection(&self, world: &Mat4) -> Mat4 {
        self.view_projection() * *world
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_accumulates_and_ratio_is_frame_relative() {
        let mut scene = Scene::default();
        scene.advance(REFERENCE_FRAME_MS * 2.0);
        scene.advance(REFERENCE_FRAME_MS);
        assert!((scene.elapsed_ms() - REFERENCE_FRAME_MS * 3.0).abs() < 1e-9);
        assert!((scene.animation_ratio() - 1.0).abs() < 1e-6);
        scene.advance(-5.0);
        assert_eq!(scene.delta_ms(), 0.0);
    }

    #[test]
    fn matrices_compose_projection_last() {
        let camera = Camera::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0, 1.5, 0.1, 100.0);
        let scene = Scene::new(camera);
        let world = Mat4::from_translation(Vec3::X);
        let expected = camera.projection * camera.view * world;
        assert!(scene.world_view_projection(&world).abs_diff_eq(expected, 1e-6));
    }
}
