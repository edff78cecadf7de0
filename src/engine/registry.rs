//! Registry of live materials for bulk invalidation.
//!
//! Materials register a shared dirty marker; the registry keeps only weak
//! references so dropping a material unregisters it.

use std::cell::Cell;
use std::ops::{BitOr, BitOrAssign};
use std::rc::{Rc, Weak};

use crate::engine::Engine;

/// Which parts of a material's compiled state are stale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MaterialDirtyFlags(u32);

impl MaterialDirtyFlags {
    pub const NONE: Self = Self(0);
    pub const TEXTURE: Self = Self(1);
    pub const LIGHT: Self = Self(2);
    pub const FRESNEL: Self = Self(4);
    pub const ATTRIBUTES: Self = Self(8);
    pub const MISC: Self = Self(16);
    pub const PREPASS: Self = Self(32);
    pub const ALL: Self = Self(63);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MaterialDirtyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MaterialDirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Dirty state owned by one material.
#[derive(Debug, Default)]
pub struct DirtyMarker {
    flags: Cell<MaterialDirtyFlags>,
}

impl DirtyMarker {
    pub fn mark(&self, flags: MaterialDirtyFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    pub fn flags(&self) -> MaterialDirtyFlags {
        self.flags.get()
    }

    pub fn is_dirty(&self) -> bool {
        !self.flags.get().is_empty()
    }

    /// Return the pending flags and clear them.
    pub fn take(&self) -> MaterialDirtyFlags {
        self.flags.replace(MaterialDirtyFlags::NONE)
    }
}

#[derive(Default)]
pub struct MaterialRegistry {
    entries: Vec<Weak<DirtyMarker>>,
}

impl MaterialRegistry {
    /// Register a new material and return its marker.
    pub fn register(&mut self) -> Rc<DirtyMarker> {
        let marker = Rc::new(DirtyMarker::default());
        self.entries.push(Rc::downgrade(&marker));
        marker
    }

    /// Live materials; dead entries are pruned.
    pub fn len(&mut self) -> usize {
        self.entries.retain(|w| w.strong_count() > 0);
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn mark_all(&mut self, flags: MaterialDirtyFlags) -> usize {
        self.entries.retain(|w| match w.upgrade() {
            Some(marker) => {
                marker.mark(flags);
                true
            }
            None => false,
        });
        self.entries.len()
    }
}

impl Engine {
    /// Flag every registered material for rebuild. Returns how many were marked.
    pub fn mark_all_materials_as_dirty(&self, registry: &mut MaterialRegistry, flags: MaterialDirtyFlags) -> usize {
        let marked = registry.mark_all(flags);
        log::debug!("marked {marked} materials dirty ({:#x})", flags.bits());
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_materials_are_pruned() {
        let mut registry = MaterialRegistry::default();
        let a = registry.register();
        let b = registry.register();
        drop(b);
        assert_eq!(registry.mark_all(MaterialDirtyFlags::TEXTURE | MaterialDirtyFlags::MISC), 1);
        assert!(a.flags().contains(MaterialDirtyFlags::TEXTURE));
        assert!(!a.flags().contains(MaterialDirtyFlags::LIGHT));
        assert_eq!(a.take(), MaterialDirtyFlags(17));
        assert!(!a.is_dirty());
    }
}
