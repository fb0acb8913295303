// Vertex formats of the 2D pipelines

use std::mem::{offset_of, size_of};

use bytemuck::{Pod, Zeroable};

use crate::backend::{VertexAttribute, VertexFormat, VertexLayout};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub tex_coord: [f32; 2],
    /// Slot in the bound texture array; 0 is plain white
    pub tex_index: i32,
    pub tiling_factor: f32,
    pub entity_id: i32,
}

impl QuadVertex {
    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: size_of::<Self>() as u32,
            attributes: vec![
                attribute(0, VertexFormat::Float3, offset_of!(Self, position)),
                attribute(1, VertexFormat::Float4, offset_of!(Self, color)),
                attribute(2, VertexFormat::Float2, offset_of!(Self, tex_coord)),
                attribute(3, VertexFormat::Int, offset_of!(Self, tex_index)),
                attribute(4, VertexFormat::Float, offset_of!(Self, tiling_factor)),
                attribute(5, VertexFormat::Int, offset_of!(Self, entity_id)),
            ],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CircleVertex {
    pub world_position: [f32; 3],
    /// Position inside the unit circle quad, -1..1
    pub local_position: [f32; 3],
    pub color: [f32; 4],
    pub thickness: f32,
    pub fade: f32,
    pub entity_id: i32,
}

impl CircleVertex {
    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: size_of::<Self>() as u32,
            attributes: vec![
                attribute(0, VertexFormat::Float3, offset_of!(Self, world_position)),
                attribute(1, VertexFormat::Float3, offset_of!(Self, local_position)),
                attribute(2, VertexFormat::Float4, offset_of!(Self, color)),
                attribute(3, VertexFormat::Float, offset_of!(Self, thickness)),
                attribute(4, VertexFormat::Float, offset_of!(Self, fade)),
                attribute(5, VertexFormat::Int, offset_of!(Self, entity_id)),
            ],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LineVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub entity_id: i32,
}

impl LineVertex {
    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: size_of::<Self>() as u32,
            attributes: vec![
                attribute(0, VertexFormat::Float3, offset_of!(Self, position)),
                attribute(1, VertexFormat::Float4, offset_of!(Self, color)),
                attribute(2, VertexFormat::Int, offset_of!(Self, entity_id)),
            ],
        }
    }
}

fn attribute(location: u32, format: VertexFormat, offset: usize) -> VertexAttribute {
    VertexAttribute {
        location,
        format,
        offset: offset as u32,
    }
}
