// Draw requests accepted by the 2D renderer

use std::sync::Arc;

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

use crate::framebuffer::NO_ENTITY;
use crate::texture::Texture2D;

/// Corners of the unit quad, counter-clockwise from bottom-left
pub(crate) const QUAD_POSITIONS: [Vec4; 4] = [
    Vec4::new(-0.5, -0.5, 0.0, 1.0),
    Vec4::new(0.5, -0.5, 0.0, 1.0),
    Vec4::new(0.5, 0.5, 0.0, 1.0),
    Vec4::new(-0.5, 0.5, 0.0, 1.0),
];

pub(crate) const QUAD_UVS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

/// Translation × rotation about z (degrees) × scale
pub fn quad_transform(position: Vec3, size: Vec2, rotation_degrees: f32) -> Mat4 {
    Mat4::from_scale_rotation_translation(
        size.extend(1.0),
        Quat::from_rotation_z(rotation_degrees.to_radians()),
        position,
    )
}

#[derive(Clone)]
pub struct Quad {
    pub transform: Mat4,
    pub color: Vec4,
    pub texture: Option<Arc<Texture2D>>,
    pub tiling_factor: f32,
    pub entity_id: i32,
}

impl Default for Quad {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            color: Vec4::ONE,
            texture: None,
            tiling_factor: 1.0,
            entity_id: NO_ENTITY,
        }
    }
}

impl Quad {
    pub fn new(position: Vec3, size: Vec2, color: Vec4) -> Self {
        Self::rotated(position, size, 0.0, color)
    }

    pub fn rotated(position: Vec3, size: Vec2, rotation_degrees: f32, color: Vec4) -> Self {
        Self {
            transform: quad_transform(position, size, rotation_degrees),
            color,
            ..Self::default()
        }
    }

    pub fn from_transform(transform: Mat4, color: Vec4) -> Self {
        Self {
            transform,
            color,
            ..Self::default()
        }
    }

    pub fn with_texture(mut self, texture: Arc<Texture2D>, tiling_factor: f32) -> Self {
        self.texture = Some(texture);
        self.tiling_factor = tiling_factor;
        self
    }

    pub fn with_entity(mut self, entity_id: i32) -> Self {
        self.entity_id = entity_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub transform: Mat4,
    pub color: Vec4,
    /// 1.0 is a filled disc, smaller values an outline
    pub thickness: f32,
    /// Width of the antialiased edge in local units
    pub fade: f32,
    pub entity_id: i32,
}

impl Default for Circle {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            color: Vec4::ONE,
            thickness: 1.0,
            fade: 0.005,
            entity_id: NO_ENTITY,
        }
    }
}

impl Circle {
    pub fn new(center: Vec3, radius: f32, color: Vec4) -> Self {
        Self {
            transform: quad_transform(center, Vec2::splat(radius * 2.0), 0.0),
            color,
            ..Self::default()
        }
    }

    pub fn outline(mut self, thickness: f32) -> Self {
        self.thickness = thickness;
        self
    }

    pub fn with_fade(mut self, fade: f32) -> Self {
        self.fade = fade;
        self
    }

    pub fn with_entity(mut self, entity_id: i32) -> Self {
        self.entity_id = entity_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_transform_applies_scale_before_rotation() {
        let transform = quad_transform(Vec3::new(10.0, 0.0, 0.0), Vec2::new(2.0, 1.0), 90.0);
        let corner = transform * QUAD_POSITIONS[2];
        // (1, 0.5) rotated by 90° is (-0.5, 1)
        assert!((corner - Vec4::new(9.5, 1.0, 0.0, 1.0)).abs().max_element() < 1e-5);
    }

    #[test]
    fn test_circle_spans_its_diameter() {
        let circle = Circle::new(Vec3::ZERO, 3.0, Vec4::ONE);
        let corner = circle.transform * QUAD_POSITIONS[2];
        assert!((corner - Vec4::new(3.0, 3.0, 0.0, 1.0)).abs().max_element() < 1e-5);
    }
}
