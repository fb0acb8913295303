// Fixed-capacity staging storage for batch vertices

use anyhow::{bail, Result};
use bytemuck::Pod;

/// Owned vertex storage with a write cursor
///
/// Never grows past the capacity it was created with; callers flush
/// before it fills.
#[derive(Debug)]
pub struct VertexArena<T> {
    data: Vec<T>,
    capacity: usize,
}

impl<T: Pod> VertexArena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, vertex: T) -> Result<()> {
        if self.data.len() >= self.capacity {
            bail!("Vertex arena full ({} vertices)", self.capacity);
        }
        self.data.push(vertex);
        Ok(())
    }

    /// Room for `count` more vertices
    pub fn has_room(&self, count: usize) -> bool {
        self.data.len() + count <= self.capacity
    }

    /// Move the cursor back to the start; storage is kept
    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn vertices(&self) -> &[T] {
        &self.data
    }

    /// Bytes written since the last reset
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Byte size of a full arena
    pub fn byte_capacity(&self) -> u64 {
        (self.capacity * std::mem::size_of::<T>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_is_bounded() {
        let mut arena = VertexArena::<u32>::with_capacity(2);
        arena.push(1).unwrap();
        arena.push(2).unwrap();
        assert!(!arena.has_room(1));
        assert!(arena.push(3).is_err());
        assert_eq!(arena.vertices(), &[1, 2]);
    }

    #[test]
    fn test_bytes_cover_only_written_vertices() {
        let mut arena = VertexArena::<[f32; 2]>::with_capacity(8);
        assert!(arena.as_bytes().is_empty());
        arena.push([1.0, 2.0]).unwrap();
        assert_eq!(arena.as_bytes().len(), 8);
        assert_eq!(arena.byte_capacity(), 64);

        arena.reset();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), 8);
    }
}
