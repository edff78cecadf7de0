//! GPU object ownership.
//!
//! Every GPU object the engine creates lives in a [`ResourceTable`] slot. Callers
//! hold [`Handle`]s: an index plus a generation, so a handle taken before a
//! release can never resolve to whatever reuses the slot later. The table also
//! remembers creation order, which the context-restore path replays.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::engine::constants::BufferUsage;
use crate::gl::GlName;
use crate::gl::consts::{self, GlEnum};

// ── Handles ──────────────────────────────────────────────────────────────

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

// ── Table ────────────────────────────────────────────────────────────────

struct Slot<T> {
    generation: u32,
    entry: Option<(u64, T)>,
}

/// Index-stable arena with generation checks and creation ordering.
pub struct ResourceTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    next_sequence: u64,
    len: usize,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_sequence: 0,
            len: 0,
        }
    }
}

impl<T> ResourceTable<T> {
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some((sequence, value));
            return Handle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some((sequence, value)),
        });
        Handle::new(index, 0)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut().map(|(_, v)| v)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove and return the value. Stale or already-removed handles yield `None`.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let (_, value) = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry
                .as_ref()
                .map(|(_, v)| (Handle::new(i as u32, slot.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| {
            let generation = slot.generation;
            slot.entry
                .as_mut()
                .map(|(_, v)| (Handle::new(i as u32, generation), v))
        })
    }

    /// Live handles sorted by the order they were inserted.
    pub fn handles_in_creation_order(&self) -> Vec<Handle<T>> {
        let mut live: Vec<(u64, Handle<T>)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.entry
                    .as_ref()
                    .map(|(seq, _)| (*seq, Handle::new(i as u32, slot.generation)))
            })
            .collect();
        live.sort_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, h)| h).collect()
    }

    /// Remove everything, returning values in creation order.
    pub fn drain(&mut self) -> Vec<T> {
        let order = self.handles_in_creation_order();
        order.into_iter().filter_map(|h| self.remove(h)).collect()
    }
}

// ── Buffer / query / VAO / transform-feedback records ───────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    Instances,
    TransformFeedback,
}

impl BufferKind {
    pub fn target(self) -> GlEnum {
        match self {
            BufferKind::Vertex | BufferKind::Instances => consts::ARRAY_BUFFER,
            BufferKind::Index => consts::ELEMENT_ARRAY_BUFFER,
            BufferKind::Uniform => consts::UNIFORM_BUFFER,
            BufferKind::TransformFeedback => consts::TRANSFORM_FEEDBACK_BUFFER,
        }
    }
}

/// CPU-side copy kept so the buffer can be recreated after a context loss.
#[derive(Clone, Debug)]
pub enum BufferContents {
    Init(Arc<[u8]>),
    Sized(usize),
}

#[derive(Debug)]
pub struct GpuBuffer {
    pub(crate) name: GlName,
    pub kind: BufferKind,
    pub usage: BufferUsage,
    pub byte_len: usize,
    pub is_32bit_indices: bool,
    pub(crate) retained: Option<BufferContents>,
    pub(crate) references: u32,
}

impl GpuBuffer {
    pub fn gl_name(&self) -> GlName {
        self.name
    }
}

#[derive(Debug)]
pub struct GpuQuery {
    pub(crate) name: GlName,
    pub(crate) active_target: Option<GlEnum>,
}

impl GpuQuery {
    pub fn gl_name(&self) -> GlName {
        self.name
    }
}

#[derive(Debug)]
pub struct GpuTransformFeedback {
    pub(crate) name: GlName,
    pub(crate) buffer: Option<BufferHandle>,
}

impl GpuTransformFeedback {
    pub fn gl_name(&self) -> GlName {
        self.name
    }
}

pub type BufferHandle = Handle<GpuBuffer>;
pub type QueryHandle = Handle<GpuQuery>;
pub type TransformFeedbackHandle = Handle<GpuTransformFeedback>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_does_not_resolve_after_slot_reuse() {
        let mut table: ResourceTable<&str> = ResourceTable::default();
        let a = table.insert("a");
        assert_eq!(table.remove(a), Some("a"));
        let b = table.insert("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(&"b"));
    }

    #[test]
    fn remove_twice_is_noop() {
        let mut table: ResourceTable<u32> = ResourceTable::default();
        let a = table.insert(1);
        table.insert(2);
        assert_eq!(table.remove(a), Some(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn creation_order_survives_slot_reuse() {
        let mut table: ResourceTable<u32> = ResourceTable::default();
        let a = table.insert(10);
        let _b = table.insert(20);
        table.remove(a);
        let c = table.insert(30);
        let order: Vec<u32> = table
            .handles_in_creation_order()
            .into_iter()
            .map(|h| *table.get(h).unwrap())
            .collect();
        assert_eq!(order, vec![20, 30]);
        assert_eq!(c.index(), a.index());
    }
}
