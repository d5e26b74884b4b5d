//! Kernel GPU driver boundary
//!
//! Every operation the core needs from the kernel goes through the [`Kgd`]
//! trait. Each method maps to one kernel call and reports the raw errno in
//! its `io::Error`; callers translate that into [`crate::Error`] kinds.
//!
//! Two implementations ship with the crate:
//!
//! - [`msm::MsmKgd`] talks to a Linux/Android msm DRM render node
//! - [`null::NullKgd`] is an in-process software driver used by tests,
//!   benchmarks and bring-up

#[cfg(all(feature = "msm", any(target_os = "linux", target_os = "android")))]
mod ioctl;
#[cfg(all(feature = "msm", any(target_os = "linux", target_os = "android")))]
pub mod msm;
pub mod null;

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::ptr::NonNull;

use bitflags::bitflags;
use serde::Serialize;

use crate::bo::BoFlags;
use crate::residency::AccessFlags;

pub use null::NullKgd;

/// Command tuple flag: the range is an indirect buffer
pub const CMD_FLAG_IB: u32 = 1 << 0;

/// A freshly allocated or imported kernel buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBo {
    /// Kernel handle
    pub handle: u32,
    /// GPU virtual address, stable for the object's life
    pub gpu_addr: u64,
    /// Effective size in bytes, never smaller than requested
    pub size: u64,
}

/// Reclaimability hint for idle buffer objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Madvise {
    /// Pages are about to be used again
    WillNeed,
    /// Pages may be reclaimed by the kernel
    DontNeed,
}

/// Device constants readable through [`Kgd::get_param`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    /// Packed GPU id (e.g. 630 for an a630)
    GpuId,
    /// On-chip tile memory size in bytes
    GmemSize,
    /// GPU address of tile memory
    GmemBase,
    /// Chip id (core/major/minor/patch)
    ChipId,
    /// Maximum core clock in Hz
    MaxFreq,
    /// Current GPU timestamp counter
    Timestamp,
    /// Number of submit queue priorities
    Priorities,
}

/// Result of a sync object wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The wait condition was met
    Signaled,
    /// The deadline passed first
    TimedOut,
}

/// One command tuple as marshalled to the kernel
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandTuple {
    /// GPU address of the first packet word
    pub gpu_addr: u64,
    /// Reserved, always zero
    pub reserved: u64,
    /// Size of the range in bytes
    pub size: u32,
    /// `CMD_FLAG_*` bits
    pub flags: u32,
    /// Kernel handle of the BO holding the range
    pub handle: u32,
    /// Padding, always zero
    pub padding: u32,
}

/// One buffer object the kernel must keep resident during a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyEntry {
    /// Kernel handle
    pub handle: u32,
    /// How the submission accesses it
    pub flags: AccessFlags,
}

bitflags! {
    /// Queue type and content requirements attached to a submission
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Requirements: u32 {
        /// Graphics queue
        const GRAPHICS = 1 << 0;
        /// Compute queue
        const COMPUTE = 1 << 1;
        /// Transfer queue
        const TRANSFER = 1 << 2;
        /// The submission contains fragment (tile pass) work
        const FRAGMENT = 1 << 3;
    }
}

/// Kernel GPU driver operations
///
/// Implementations retry `EINTR`/`EAGAIN` themselves. Deadlines are
/// absolute `CLOCK_MONOTONIC` nanoseconds, as returned by [`monotonic_ns`].
#[cfg_attr(test, mockall::automock)]
pub trait Kgd: Send + Sync {
    /// Short driver name for logs
    fn name(&self) -> &'static str;

    /// Allocate a buffer object of at least `size` bytes
    fn bo_new(&self, size: u64, flags: BoFlags) -> io::Result<NewBo>;

    /// Release the kernel reference to a buffer object
    fn bo_close(&self, handle: u32);

    /// Map `size` bytes of a buffer object for CPU access
    fn bo_map(&self, handle: u32, size: u64) -> io::Result<NonNull<u8>>;

    /// Undo [`Kgd::bo_map`]
    fn bo_munmap(&self, ptr: NonNull<u8>, size: u64);

    /// Export a buffer object as a dmabuf descriptor
    fn bo_export(&self, handle: u32) -> io::Result<OwnedFd>;

    /// Import a dmabuf descriptor
    fn bo_import(&self, fd: RawFd) -> io::Result<NewBo>;

    /// Mark a buffer object reclaimable or needed; returns whether the
    /// backing pages were retained
    fn bo_madvise(&self, handle: u32, advice: Madvise) -> io::Result<bool>;

    /// Create a submission queue
    fn queue_new(&self, priority: u32, flags: u32) -> io::Result<u32>;

    /// Destroy a submission queue
    fn queue_close(&self, queue_id: u32);

    /// Submit command tuples; returns the kernel timestamp of the submission
    fn submit(
        &self,
        queue_id: u32,
        commands: &[CommandTuple],
        residency: &[ResidencyEntry],
        in_syncs: &[u32],
        out_sync: u32,
        requirements: Requirements,
    ) -> io::Result<u32>;

    /// Create a sync object, optionally already signaled
    fn sync_new(&self, signaled: bool) -> io::Result<u32>;

    /// Destroy a sync object
    fn sync_close(&self, sync_id: u32);

    /// Wait for all (or any) of `sync_ids` until `deadline_ns`
    fn sync_wait(&self, sync_ids: &[u32], wait_all: bool, deadline_ns: i64)
        -> io::Result<WaitStatus>;

    /// Return sync objects to the unsignaled state
    fn sync_reset(&self, sync_ids: &[u32]) -> io::Result<()>;

    /// Snapshot a sync object's fence as a sync-file descriptor
    fn sync_export_file(&self, sync_id: u32) -> io::Result<OwnedFd>;

    /// Replace a sync object's fence with the one carried by a sync file
    fn sync_import_file(&self, sync_id: u32, fd: RawFd) -> io::Result<()>;

    /// Sync file that signals once `timestamp` retires on `queue_id`
    fn sync_signal_from_timestamp(&self, queue_id: u32, timestamp: u32) -> io::Result<OwnedFd>;

    /// Read a device constant
    fn get_param(&self, param: Param) -> io::Result<u64>;
}

/// Current `CLOCK_MONOTONIC` time in nanoseconds
pub fn monotonic_ns() -> i64 {
    // SAFETY: timespec is plain old data; CLOCK_MONOTONIC cannot fail with
    // a valid pointer.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as i64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as i64)
}

/// Absolute deadline for a relative timeout, saturating at `i64::MAX`
pub fn deadline_after(timeout_ns: u64) -> i64 {
    if timeout_ns >= i64::MAX as u64 {
        return i64::MAX;
    }
    monotonic_ns().saturating_add(timeout_ns as i64)
}

/// Whether an errno means the kernel ran out of memory
pub(crate) fn is_enomem(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOMEM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_command_tuple_layout() {
        assert_eq!(std::mem::size_of::<CommandTuple>(), 32);
        let t = CommandTuple {
            gpu_addr: 0x1000,
            size: 16,
            flags: CMD_FLAG_IB,
            handle: 7,
            ..Default::default()
        };
        let base = &t as *const CommandTuple as usize;
        assert_eq!(&t.size as *const u32 as usize - base, 16);
        assert_eq!(&t.flags as *const u32 as usize - base, 20);
        assert_eq!(&t.handle as *const u32 as usize - base, 24);
    }

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[rstest]
    #[case(u64::MAX)]
    #[case(i64::MAX as u64)]
    #[case(i64::MAX as u64 + 1)]
    fn test_deadline_saturates(#[case] timeout: u64) {
        assert_eq!(deadline_after(timeout), i64::MAX);
    }

    #[test]
    fn test_deadline_zero_is_now() {
        let before = monotonic_ns();
        let deadline = deadline_after(0);
        assert!(deadline >= before);
        assert!(deadline <= monotonic_ns());
    }
}
