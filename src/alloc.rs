//! Scope-tagged host memory accounting
//!
//! Objects the core creates on behalf of the caller (command buffers,
//! submission scratch arrays) are charged against a [`HostAllocator`] so a
//! frontend can impose its own limits. Failure surfaces as
//! [`Error::OutOfHostMemory`] instead of aborting.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;

use crate::error::{Error, Result};

/// Lifetime class of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationScope {
    /// Lives for the duration of one call
    Command,
    /// Lives as long as an API object
    Object,
    /// Cached across objects
    Cache,
    /// Lives as long as the device
    Device,
}

impl AllocationScope {
    fn index(self) -> usize {
        match self {
            AllocationScope::Command => 0,
            AllocationScope::Object => 1,
            AllocationScope::Cache => 2,
            AllocationScope::Device => 3,
        }
    }
}

/// Host allocation callbacks
pub trait HostAllocator: Send + Sync + fmt::Debug {
    /// Charge `bytes` to `scope`, failing when the budget is exhausted
    fn reserve(&self, bytes: usize, scope: AllocationScope) -> Result<()>;

    /// Return bytes previously reserved for `scope`
    fn release(&self, bytes: usize, scope: AllocationScope);
}

/// Allocator enforcing one byte budget across all scopes
#[derive(Debug)]
pub struct BudgetAllocator {
    limit: usize,
    used: AtomicUsize,
    per_scope: [AtomicUsize; 4],
}

impl BudgetAllocator {
    /// Budget of `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            per_scope: Default::default(),
        }
    }

    /// Budget equal to the machine's physical memory
    pub fn with_physical_memory() -> Self {
        Self::new(physical_memory().unwrap_or(usize::MAX))
    }

    /// Byte budget
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently reserved
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes currently reserved in one scope
    pub fn used_in(&self, scope: AllocationScope) -> usize {
        self.per_scope[scope.index()].load(Ordering::Acquire)
    }
}

impl HostAllocator for BudgetAllocator {
    fn reserve(&self, bytes: usize, scope: AllocationScope) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.limit)
            })
            .map_err(|_| {
                trace!("host budget exhausted: {bytes} bytes for {scope:?}");
                Error::OutOfHostMemory
            })?;
        self.per_scope[scope.index()].fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    fn release(&self, bytes: usize, scope: AllocationScope) {
        self.per_scope[scope.index()].fetch_sub(bytes, Ordering::AcqRel);
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

fn physical_memory() -> Option<usize> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as usize).checked_mul(page_size as usize)
}

/// Bytes held against a [`HostAllocator`] until dropped
pub struct Reservation {
    allocator: Arc<dyn HostAllocator>,
    bytes: usize,
    scope: AllocationScope,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("bytes", &self.bytes)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Reservation {
    /// Reserve `bytes` in `scope`
    pub fn new(allocator: &Arc<dyn HostAllocator>, bytes: usize, scope: AllocationScope) -> Result<Self> {
        allocator.reserve(bytes, scope)?;
        Ok(Self {
            allocator: Arc::clone(allocator),
            bytes,
            scope,
        })
    }

    /// Reserve room for `count` values of `T`
    pub fn for_array<T>(allocator: &Arc<dyn HostAllocator>, count: usize, scope: AllocationScope) -> Result<Self> {
        let bytes = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(Error::OutOfHostMemory)?;
        Self::new(allocator, bytes, scope)
    }

    /// Reserved bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Scope the bytes are charged to
    pub fn scope(&self) -> AllocationScope {
        self.scope
    }

    /// Move up to `bytes` of this reservation into a new one
    pub fn split(&mut self, bytes: usize) -> Reservation {
        let taken = bytes.min(self.bytes);
        self.bytes -= taken;
        Reservation {
            allocator: Arc::clone(&self.allocator),
            bytes: taken,
            scope: self.scope,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.allocator.release(self.bytes, self.scope);
        }
    }
}
