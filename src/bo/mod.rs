//! Buffer objects and the caching allocator behind them
//!
//! A [`Bo`] is one kernel GPU memory allocation. It is shared as a
//! [`BoRef`] (`Arc<Bo>`); dropping the last reference unmaps it and offers
//! it to the allocator's [`BoCache`], which either keeps it for reuse
//! (marked `DONTNEED` at the kernel) or closes the kernel handle.

mod cache;

pub use cache::{bucket_index, BoCache, CachePolicy, IdleBo, MAX_BUCKET, MIN_BUCKET};

use std::fmt;
use std::os::fd::{OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::device::LostState;
use crate::error::{Error, Result};
use crate::kgd::{is_enomem, Kgd, Madvise, NewBo};

/// Allocation granularity of the kernel
pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Buffer object creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        /// GPU may execute from the pages
        const EXECUTABLE = 1 << 0;
        /// Kernel may back more pages on GPU fault; requires INVISIBLE
        const GROWABLE = 1 << 1;
        /// No CPU mapping will ever be requested
        const INVISIBLE = 1 << 2;
        /// Do not map at creation
        const DELAY_MMAP = 1 << 3;
        /// Hardware-coherent without explicit flushes
        const COHERENT_LOCAL = 1 << 4;
        /// Never returned to the cache
        const NO_REUSE = 1 << 5;
    }
}

/// Shared buffer object reference
pub type BoRef = Arc<Bo>;

#[derive(Debug, Clone, Copy)]
struct Mapping(NonNull<u8>);

// The pointer is only handed out; all writes go through the owner of the
// range being written.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Round `size` up to a whole number of pages
pub fn page_align(size: u64) -> Option<u64> {
    size.checked_add(PAGE_SIZE - 1).map(|s| s & !(PAGE_SIZE - 1))
}

/// One GPU memory allocation
pub struct Bo {
    handle: u32,
    size: u64,
    gpu_addr: u64,
    flags: BoFlags,
    exported: AtomicBool,
    mapping: Mutex<Option<Mapping>>,
    allocator: Arc<BoAllocator>,
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("gpu_addr", &format_args!("{:#x}", self.gpu_addr))
            .field("flags", &self.flags())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl Bo {
    fn new(allocator: Arc<BoAllocator>, new: NewBo, flags: BoFlags) -> Self {
        Self {
            handle: new.handle,
            size: new.size,
            gpu_addr: new.gpu_addr,
            flags,
            exported: AtomicBool::new(false),
            mapping: Mutex::new(None),
            allocator,
        }
    }

    /// Kernel handle
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// GPU virtual address
    pub fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    /// Creation flags; `NO_REUSE` once exported
    pub fn flags(&self) -> BoFlags {
        if self.exported.load(Ordering::Acquire) {
            self.flags | BoFlags::NO_REUSE
        } else {
            self.flags
        }
    }

    fn mapping(&self) -> MutexGuard<'_, Option<Mapping>> {
        self.mapping.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// CPU address of the first byte, if mapped
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.mapping().map(|m| m.0)
    }

    /// Whether the object currently has a CPU mapping
    pub fn is_mapped(&self) -> bool {
        self.mapping().is_some()
    }

    /// Map the object for CPU access; a no-op if already mapped
    pub fn map(&self) -> Result<NonNull<u8>> {
        if self.flags.contains(BoFlags::INVISIBLE) {
            return Err(Error::InvalidUsage("invisible buffer objects cannot be mapped"));
        }
        if let Some(ptr) = self.cpu_ptr() {
            return Ok(ptr);
        }

        let kgd = &self.allocator.kgd;
        let ptr = kgd.bo_map(self.handle, self.size).map_err(|e| {
            warn!("mapping BO {} failed: {}", self.handle, e);
            Error::MemoryMapFailed
        })?;

        let mut mapping = self.mapping();
        match *mapping {
            Some(existing) => {
                drop(mapping);
                kgd.bo_munmap(ptr, self.size);
                Ok(existing.0)
            }
            None => {
                *mapping = Some(Mapping(ptr));
                Ok(ptr)
            }
        }
    }

    fn checked_range(&self, offset: u64, words: usize) -> Result<NonNull<u8>> {
        let ptr = self
            .cpu_ptr()
            .ok_or(Error::InvalidUsage("buffer object is not mapped"))?;
        let end = (words as u64)
            .checked_mul(4)
            .and_then(|bytes| offset.checked_add(bytes));
        if offset % 4 != 0 || end.map_or(true, |end| end > self.size) {
            return Err(Error::InvalidUsage("range exceeds buffer object"));
        }
        Ok(ptr)
    }

    /// Copy `count` words out of the mapping starting at byte `offset`
    pub fn read_words(&self, offset: u64, count: usize) -> Result<Vec<u32>> {
        let base = self.checked_range(offset, count)?;
        let mut out = Vec::new();
        out.try_reserve_exact(count)?;
        let src = unsafe { base.as_ptr().add(offset as usize) as *const u32 };
        for i in 0..count {
            out.push(unsafe { src.add(i).read_unaligned() });
        }
        Ok(out)
    }

    /// Copy `words` into the mapping starting at byte `offset`
    pub fn write_words(&self, offset: u64, words: &[u32]) -> Result<()> {
        let base = self.checked_range(offset, words.len())?;
        let dst = unsafe { base.as_ptr().add(offset as usize) as *mut u32 };
        for (i, word) in words.iter().enumerate() {
            unsafe { dst.add(i).write_unaligned(*word) };
        }
        Ok(())
    }

    /// Export as a dmabuf descriptor. The object is never cached afterwards.
    pub fn export(&self) -> Result<OwnedFd> {
        let fd = self.allocator.kgd.bo_export(self.handle).map_err(|e| {
            match e.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) => {
                    Error::OutOfHostMemory
                }
                _ => self.allocator.lost.kernel("bo_export", e),
            }
        })?;
        self.exported.store(true, Ordering::Release);
        Ok(fd)
    }

    /// The allocator this object returns to
    pub fn allocator(&self) -> &Arc<BoAllocator> {
        &self.allocator
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        let mapping = self.mapping.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Mapping(ptr)) = mapping {
            self.allocator.kgd.bo_munmap(ptr, self.size);
        }
        let idle = IdleBo {
            handle: self.handle,
            size: self.size,
            gpu_addr: self.gpu_addr,
            flags: self.flags,
        };
        self.allocator.release(idle, !self.flags().contains(BoFlags::NO_REUSE));
    }
}

/// Creates buffer objects, recycling idle ones through a [`BoCache`]
pub struct BoAllocator {
    kgd: Arc<dyn Kgd>,
    cache: Mutex<BoCache>,
    policy: CachePolicy,
    lost: Arc<LostState>,
}

impl fmt::Debug for BoAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoAllocator")
            .field("kgd", &self.kgd.name())
            .field("policy", &self.policy)
            .field("cached", &self.cached_count())
            .finish()
    }
}

impl BoAllocator {
    pub(crate) fn new(kgd: Arc<dyn Kgd>, policy: CachePolicy, lost: Arc<LostState>) -> Arc<Self> {
        Arc::new(Self {
            kgd,
            cache: Mutex::new(BoCache::new()),
            policy,
            lost,
        })
    }

    fn cache(&self) -> MutexGuard<'_, BoCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache retention policy
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Number of idle BOs held by the cache
    pub fn cached_count(&self) -> usize {
        self.cache().len()
    }

    /// Bytes of idle BOs held by the cache
    pub fn cached_bytes(&self) -> u64 {
        self.cache().bytes()
    }

    /// Allocate a buffer object of at least `size` bytes, reusing a cached
    /// one created with the same flags when possible
    pub fn create(self: &Arc<Self>, size: u64, flags: BoFlags) -> Result<BoRef> {
        self.lost.check()?;
        if size == 0 {
            return Err(Error::InvalidUsage("buffer object size must be non-zero"));
        }
        if flags.contains(BoFlags::GROWABLE) && !flags.contains(BoFlags::INVISIBLE) {
            return Err(Error::InvalidUsage("growable buffer objects must be invisible"));
        }
        let size = page_align(size).ok_or(Error::OutOfDeviceMemory)?;

        let new = match self.fetch_cached(size, flags) {
            Some(idle) => {
                trace!("BO {} ({} bytes) reused from cache", idle.handle, idle.size);
                NewBo {
                    handle: idle.handle,
                    gpu_addr: idle.gpu_addr,
                    size: idle.size,
                }
            }
            None => self.allocate(size, flags)?,
        };

        let bo = Arc::new(Bo::new(Arc::clone(self), new, flags));
        if !flags.intersects(BoFlags::INVISIBLE | BoFlags::DELAY_MMAP) {
            bo.map()?;
        }
        Ok(bo)
    }

    fn fetch_cached(&self, size: u64, flags: BoFlags) -> Option<IdleBo> {
        if flags.contains(BoFlags::NO_REUSE) {
            return None;
        }
        loop {
            let idle = self.cache().take(size, flags)?;
            match self.kgd.bo_madvise(idle.handle, Madvise::WillNeed) {
                Ok(true) => return Some(idle),
                Ok(false) => debug!("cached BO {} was purged by the kernel", idle.handle),
                Err(e) => warn!("WILLNEED on cached BO {} failed: {}", idle.handle, e),
            }
            self.kgd.bo_close(idle.handle);
        }
    }

    fn allocate(&self, size: u64, flags: BoFlags) -> Result<NewBo> {
        match self.kgd.bo_new(size, flags) {
            Ok(new) => {
                trace!("BO {} allocated ({} bytes @ {:#x})", new.handle, new.size, new.gpu_addr);
                return Ok(new);
            }
            Err(e) if is_enomem(&e) => {}
            Err(e) => return Err(self.lost.kernel("bo_new", e)),
        }

        let victim = {
            let mut cache = self.cache();
            cache.pop_oldest_in_bucket(size).or_else(|| cache.pop_oldest())
        };
        if let Some(victim) = victim {
            debug!("out of device memory, evicting cached BO {}", victim.handle);
            self.kgd.bo_close(victim.handle);
        }

        match self.kgd.bo_new(size, flags) {
            Ok(new) => Ok(new),
            Err(e) if is_enomem(&e) => Err(Error::OutOfDeviceMemory),
            Err(e) => Err(self.lost.kernel("bo_new", e)),
        }
    }

    /// Wrap a dmabuf descriptor as a buffer object. Imported objects are
    /// mapped on demand and never cached.
    pub fn import(self: &Arc<Self>, fd: RawFd) -> Result<BoRef> {
        self.lost.check()?;
        let new = self.kgd.bo_import(fd).map_err(|e| {
            if is_enomem(&e) {
                Error::OutOfDeviceMemory
            } else {
                debug!("dmabuf import failed: {e}");
                Error::InvalidExternalHandle
            }
        })?;
        Ok(Arc::new(Bo::new(
            Arc::clone(self),
            new,
            BoFlags::NO_REUSE | BoFlags::DELAY_MMAP,
        )))
    }

    fn release(&self, idle: IdleBo, reusable: bool) {
        if !reusable || self.policy == CachePolicy::Disabled || self.lost.is_lost() {
            self.kgd.bo_close(idle.handle);
            return;
        }
        if let Err(e) = self.kgd.bo_madvise(idle.handle, Madvise::DontNeed) {
            warn!("DONTNEED on BO {} failed: {}", idle.handle, e);
            self.kgd.bo_close(idle.handle);
            return;
        }
        let rejected = self.cache().put(idle, self.policy);
        for bo in rejected {
            self.kgd.bo_close(bo.handle);
        }
    }

    /// Close every cached BO; returns how many were closed
    pub fn evict_all(&self) -> usize {
        let drained = self.cache().drain();
        for bo in &drained {
            self.kgd.bo_close(bo.handle);
        }
        drained.len()
    }
}

impl Drop for BoAllocator {
    fn drop(&mut self) {
        let evicted = self.evict_all();
        if evicted > 0 {
            debug!("closed {evicted} cached BOs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kgd::NullKgd;

    fn allocator(policy: CachePolicy) -> (Arc<NullKgd>, Arc<BoAllocator>) {
        let kgd = Arc::new(NullKgd::new());
        let alloc = BoAllocator::new(kgd.clone(), policy, Arc::new(LostState::default()));
        (kgd, alloc)
    }

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(1), Some(4096));
        assert_eq!(page_align(4096), Some(4096));
        assert_eq!(page_align(4097), Some(8192));
        assert_eq!(page_align(u64::MAX), None);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (_, alloc) = allocator(CachePolicy::Unbounded);
        assert!(matches!(alloc.create(0, BoFlags::empty()), Err(Error::InvalidUsage(_))));
    }

    #[test]
    fn test_growable_requires_invisible() {
        let (_, alloc) = allocator(CachePolicy::Unbounded);
        assert!(matches!(
            alloc.create(4096, BoFlags::GROWABLE),
            Err(Error::InvalidUsage(_))
        ));
        let bo = alloc.create(4096, BoFlags::GROWABLE | BoFlags::INVISIBLE).unwrap();
        assert!(!bo.is_mapped());
        assert!(bo.map().is_err());
    }

    #[test]
    fn test_create_maps_unless_delayed() {
        let (_, alloc) = allocator(CachePolicy::Unbounded);
        let bo = alloc.create(100, BoFlags::empty()).unwrap();
        assert_eq!(bo.size(), 4096);
        assert!(bo.is_mapped());

        let delayed = alloc.create(4096, BoFlags::DELAY_MMAP).unwrap();
        assert!(!delayed.is_mapped());
        delayed.map().unwrap();
        assert!(delayed.is_mapped());
    }

    #[test]
    fn test_drop_returns_to_cache_as_dontneed() {
        let (kgd, alloc) = allocator(CachePolicy::Unbounded);
        let bo = alloc.create(8192, BoFlags::empty()).unwrap();
        let handle = bo.handle();
        drop(bo);
        assert_eq!(alloc.cached_count(), 1);
        assert!(kgd.is_bo_open(handle));
        assert!(kgd.is_purgeable(handle));

        let again = alloc.create(8192, BoFlags::empty()).unwrap();
        assert_eq!(again.handle(), handle);
        assert!(!kgd.is_purgeable(handle));
        assert_eq!(alloc.cached_count(), 0);
    }

    #[test]
    fn test_different_flags_miss_cache() {
        let (_, alloc) = allocator(CachePolicy::Unbounded);
        let handle = alloc.create(4096, BoFlags::empty()).unwrap().handle();
        let exec = alloc.create(4096, BoFlags::EXECUTABLE).unwrap();
        assert_ne!(exec.handle(), handle);
    }

    #[test]
    fn test_no_reuse_and_disabled_close() {
        let (kgd, alloc) = allocator(CachePolicy::Unbounded);
        drop(alloc.create(4096, BoFlags::NO_REUSE).unwrap());
        assert_eq!(alloc.cached_count(), 0);
        assert!(kgd.live_bos().is_empty());

        let (kgd, alloc) = allocator(CachePolicy::Disabled);
        drop(alloc.create(4096, BoFlags::empty()).unwrap());
        assert_eq!(alloc.cached_count(), 0);
        assert!(kgd.live_bos().is_empty());
    }

    #[test]
    fn test_enomem_evicts_and_retries() {
        let (kgd, alloc) = allocator(CachePolicy::Unbounded);
        drop(alloc.create(8192, BoFlags::EXECUTABLE).unwrap());
        assert_eq!(alloc.cached_count(), 1);

        kgd.fail_next_bo_new(1);
        let bo = alloc.create(8192, BoFlags::empty()).unwrap();
        assert_eq!(alloc.cached_count(), 0);
        assert_eq!(kgd.live_bos(), vec![bo.handle()]);

        kgd.fail_next_bo_new(2);
        assert_eq!(alloc.create(4096, BoFlags::empty()).err(), Some(Error::OutOfDeviceMemory));
    }

    #[test]
    fn test_read_write_words() {
        let (_, alloc) = allocator(CachePolicy::Unbounded);
        let bo = alloc.create(4096, BoFlags::empty()).unwrap();
        bo.write_words(8, &[1, 2, 3]).unwrap();
        assert_eq!(bo.read_words(8, 3).unwrap(), vec![1, 2, 3]);
        assert!(bo.read_words(4094, 1).is_err());
        assert!(bo.write_words(4092, &[1, 2]).is_err());
        assert!(bo.read_words(2, 1).is_err());
    }

    #[test]
    fn test_export_import() {
        let (kgd, alloc) = allocator(CachePolicy::Unbounded);
        let bo = alloc.create(4096, BoFlags::empty()).unwrap();
        bo.write_words(0, &[0xABCD]).unwrap();
        let fd = bo.export().unwrap();
        assert!(bo.flags().contains(BoFlags::NO_REUSE));

        let imported = alloc.import(std::os::fd::AsRawFd::as_raw_fd(&fd)).unwrap();
        assert!(imported.flags().contains(BoFlags::NO_REUSE));
        assert!(!imported.is_mapped());
        imported.map().unwrap();
        assert_eq!(imported.read_words(0, 1).unwrap(), vec![0xABCD]);

        drop(bo);
        drop(imported);
        assert_eq!(alloc.cached_count(), 0);
        assert!(kgd.live_bos().is_empty());
    }

    #[test]
    fn test_import_garbage_fd() {
        let (_, alloc) = allocator(CachePolicy::Unbounded);
        assert_eq!(alloc.import(-1).err(), Some(Error::InvalidExternalHandle));
    }

    #[test]
    fn test_evict_all_closes_everything() {
        let (kgd, alloc) = allocator(CachePolicy::Unbounded);
        let a = alloc.create(4096, BoFlags::empty()).unwrap();
        let b = alloc.create(65536, BoFlags::empty()).unwrap();
        drop(a);
        drop(b);
        assert_eq!(alloc.evict_all(), 2);
        assert!(kgd.live_bos().is_empty());
    }
}
