// Cameras for the 2D renderer

use glam::{Mat4, Vec3};

/// A projection; the view comes from the transform passed alongside it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    projection: Mat4,
}

impl Camera {
    pub fn new(projection: Mat4) -> Self {
        Self { projection }
    }

    /// Orthographic projection with world +y at the top of the screen
    pub fn orthographic(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Self {
        // Vulkan clip space has y pointing down
        Self::new(Mat4::orthographic_rh(left, right, top, bottom, near, far))
    }

    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        let mut projection = Mat4::perspective_rh(fov_y_degrees.to_radians(), aspect, near, far);
        projection.y_axis.y *= -1.0;
        Self::new(projection)
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    /// Projection × view for a camera placed at `transform`
    pub fn view_projection(&self, transform: &Mat4) -> Mat4 {
        self.projection * transform.inverse()
    }
}

/// Editor-style 2D camera: position plus rotation around z
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrthographicCamera {
    projection: Mat4,
    view: Mat4,
    view_projection: Mat4,
    position: Vec3,
    /// Degrees
    rotation: f32,
}

impl OrthographicCamera {
    pub fn new(left: f32, right: f32, bottom: f32, top: f32) -> Self {
        let projection = Camera::orthographic(left, right, bottom, top, -1.0, 1.0).projection();
        Self {
            projection,
            view: Mat4::IDENTITY,
            view_projection: projection,
            position: Vec3::ZERO,
            rotation: 0.0,
        }
    }

    /// Camera showing `zoom` world units above and below the centre
    pub fn with_aspect(aspect: f32, zoom: f32) -> Self {
        Self::new(-aspect * zoom, aspect * zoom, -zoom, zoom)
    }

    pub fn set_projection(&mut self, left: f32, right: f32, bottom: f32, top: f32) {
        self.projection = Camera::orthographic(left, right, bottom, top, -1.0, 1.0).projection();
        self.recalculate();
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.recalculate();
    }

    pub fn set_rotation(&mut self, degrees: f32) {
        self.rotation = degrees;
        self.recalculate();
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> f32 {
        self.rotation
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn view_projection(&self) -> Mat4 {
        self.view_projection
    }

    fn recalculate(&mut self) {
        let transform = Mat4::from_translation(self.position) * Mat4::from_rotation_z(self.rotation.to_radians());
        self.view = transform.inverse();
        self.view_projection = self.projection * self.view;
    }
}
