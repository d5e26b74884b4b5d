//! Per-recording set of buffer objects the kernel must keep resident

use bitflags::bitflags;

use crate::bo::BoRef;
use crate::error::Result;
use crate::kgd::ResidencyEntry;

const MIN_CAPACITY: usize = 16;

bitflags! {
    /// How a submission touches a buffer object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// GPU reads
        const READ = 1 << 0;
        /// GPU writes
        const WRITE = 1 << 1;
        /// Include in GPU crash dumps
        const DUMP = 1 << 2;
    }
}

/// Unique buffer objects with the union of their access flags
///
/// Look-up is a linear scan; lists are short per recording.
#[derive(Debug, Default)]
pub struct ResidencyList {
    entries: Vec<(BoRef, AccessFlags)>,
}

impl ResidencyList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bo`, or widen its flags if already present; returns its slot
    pub fn add(&mut self, bo: &BoRef, access: AccessFlags) -> Result<u32> {
        if let Some(idx) = self.find(bo.handle()) {
            self.entries[idx].1 |= access;
            return Ok(idx as u32);
        }

        if self.entries.len() == self.entries.capacity() {
            let target = (self.entries.capacity() * 2).max(MIN_CAPACITY);
            self.entries.try_reserve_exact(target - self.entries.len())?;
        }
        self.entries.push((BoRef::clone(bo), access));
        Ok((self.entries.len() - 1) as u32)
    }

    /// Add every entry of `other`, unioning flags of shared handles
    pub fn merge(&mut self, other: &ResidencyList) -> Result<()> {
        for (bo, access) in &other.entries {
            self.add(bo, *access)?;
        }
        Ok(())
    }

    fn find(&self, handle: u32) -> Option<usize> {
        self.entries.iter().position(|(bo, _)| bo.handle() == handle)
    }

    /// Whether `handle` is in the list
    pub fn contains(&self, handle: u32) -> bool {
        self.find(handle).is_some()
    }

    /// Access flags recorded for `handle`
    pub fn access(&self, handle: u32) -> Option<AccessFlags> {
        self.find(handle).map(|idx| self.entries[idx].1)
    }

    /// Number of unique buffer objects
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current capacity
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Buffer objects with their access flags, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&BoRef, AccessFlags)> {
        self.entries.iter().map(|(bo, access)| (bo, *access))
    }

    /// Kernel-facing view of the list
    pub fn entries(&self) -> impl Iterator<Item = ResidencyEntry> + '_ {
        self.entries.iter().map(|(bo, flags)| ResidencyEntry {
            handle: bo.handle(),
            flags: *flags,
        })
    }

    /// Drop every reference, keeping the allocation
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
