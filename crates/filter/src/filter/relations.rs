//! Two-phase access to a device-relations buffer
//!
//! A pass first captures the buffer into an owned [`RelationsView`], then
//! rewrites the same buffer in place through a [`RelationsBuilder`] whose
//! capacity is the buffer's original count.

use crate::pnp::{DeviceObject, DeviceRelations};

/// Owned snapshot of a relations buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationsView {
    entries: Vec<DeviceObject>,
}

impl RelationsView {
    /// Copy the buffer; an absent buffer reads as empty
    pub fn capture(relations: Option<&DeviceRelations>) -> Self {
        Self {
            entries: relations.map(|r| r.objects().to_vec()).unwrap_or_default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, device: DeviceObject) -> bool {
        self.entries.contains(&device)
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceObject> + '_ {
        self.entries.iter().copied()
    }
}

/// Bounded in-place writer over a relations buffer
pub struct RelationsBuilder<'a> {
    relations: &'a mut DeviceRelations,
    capacity: usize,
    written: usize,
}

impl<'a> RelationsBuilder<'a> {
    pub fn over(relations: &'a mut DeviceRelations) -> Self {
        let capacity = relations.len();
        Self {
            relations,
            capacity,
            written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Append one entry
    ///
    /// # Panics
    ///
    /// Writing more entries than the buffer originally held is a contract
    /// violation.
    pub fn push_back(&mut self, device: DeviceObject) {
        assert!(
            self.written < self.capacity,
            "relations buffer overflow: capacity {}",
            self.capacity
        );
        self.relations.objects_mut()[self.written] = device;
        self.written += 1;
    }

    /// Shrink the buffer to the entries written; returns the new count
    pub fn finish(self) -> usize {
        self.relations.objects_mut().truncate(self.written);
        self.written
    }
}
