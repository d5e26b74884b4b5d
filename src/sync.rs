//! Sync objects, fence waits and sync-file exchange

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::kgd::{deadline_after, WaitStatus};

struct SyncInner {
    device: Device,
    id: u32,
    snapshot: Mutex<Option<OwnedFd>>,
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        self.device.kgd().sync_close(self.id);
    }
}

/// A kernel sync object, usable as a fence or a semaphore
///
/// Clones share the kernel object, which is closed when the last clone is
/// dropped. A sync object created from a queue or a sync file also keeps
/// that sync file as a point-in-time snapshot.
#[derive(Clone)]
pub struct SyncObject {
    inner: Arc<SyncInner>,
}

impl fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncObject")
            .field("id", &self.inner.id)
            .field("snapshot", &self.snapshot().as_ref().map(|fd| fd.as_raw_fd()))
            .finish()
    }
}

impl SyncObject {
    pub(crate) fn new(device: &Device, signaled: bool) -> Result<Self> {
        device.check_lost()?;
        let id = device
            .kgd()
            .sync_new(signaled)
            .map_err(|e| device.kernel_error("sync_new", e))?;
        Ok(Self {
            inner: Arc::new(SyncInner {
                device: device.clone(),
                id,
                snapshot: Mutex::new(None),
            }),
        })
    }

    /// Sync object carrying the fence of `fd`, which it keeps
    pub fn from_sync_file(device: &Device, fd: OwnedFd) -> Result<Self> {
        let sync = Self::new(device, false)?;
        sync.import_raw(fd.as_raw_fd())?;
        *sync.snapshot() = Some(fd);
        Ok(sync)
    }

    fn snapshot(&self) -> MutexGuard<'_, Option<OwnedFd>> {
        self.inner.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Kernel id
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Device the object lives on
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// Whether the object holds a sync-file snapshot
    pub fn has_snapshot(&self) -> bool {
        self.snapshot().is_some()
    }

    pub(crate) fn clear_snapshot(&self) {
        self.snapshot().take();
    }

    /// Export the current fence as a sync file
    pub fn export_sync_file(&self) -> Result<OwnedFd> {
        let device = self.device();
        device.check_lost()?;
        if let Some(fd) = self.snapshot().as_ref() {
            return fd.try_clone().map_err(|_| Error::OutOfHostMemory);
        }
        device.kgd().sync_export_file(self.inner.id).map_err(|e| match e.raw_os_error() {
            Some(libc::EINVAL) => Error::InvalidUsage("sync object has no fence to export"),
            _ => device.kernel_error("sync_export_file", e),
        })
    }

    pub(crate) fn import_raw(&self, fd: RawFd) -> Result<()> {
        self.device()
            .kgd()
            .sync_import_file(self.inner.id, fd)
            .map_err(|e| {
                trace!("sync file import rejected: {e}");
                Error::InvalidExternalHandle
            })
    }

    /// Replace the fence with the one carried by `fd`
    pub fn import_sync_file(&self, fd: RawFd) -> Result<()> {
        self.device().check_lost()?;
        self.import_raw(fd)?;
        self.clear_snapshot();
        Ok(())
    }

    /// Return to the unsignaled state
    pub fn reset(&self) -> Result<()> {
        reset_fences(self.device(), &[self])
    }

    /// Poll without blocking
    pub fn is_signaled(&self) -> Result<bool> {
        match wait_fences(self.device(), &[self], true, 0) {
            Ok(()) => Ok(true),
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Block until signaled or `timeout_ns` elapses
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        wait_fences(self.device(), &[self], true, timeout_ns)
    }
}

/// Wait for all (or any) of `fences`, giving up after `timeout_ns`
///
/// A timeout of zero polls; `u64::MAX` waits forever. Fences holding a
/// sync-file snapshot are waited on through a temporary sync object the
/// snapshot is imported into.
pub fn wait_fences(device: &Device, fences: &[&SyncObject], wait_all: bool, timeout_ns: u64) -> Result<()> {
    device.check_lost()?;
    if fences.is_empty() {
        return Ok(());
    }
    let deadline = deadline_after(timeout_ns);

    let mut ids = Vec::new();
    ids.try_reserve_exact(fences.len())?;
    let mut temporaries = Vec::new();
    for fence in fences {
        if !fence.device().same_device(device) {
            return Err(Error::InvalidUsage("fence belongs to another device"));
        }
        // Dup under the lock; a concurrent reset may close the original
        let snapshot = match fence.snapshot().as_ref() {
            Some(fd) => Some(fd.try_clone().map_err(|_| Error::OutOfHostMemory)?),
            None => None,
        };
        match snapshot {
            Some(fd) => {
                let temp = SyncObject::new(device, false)?;
                temp.import_raw(fd.as_raw_fd())?;
                ids.push(temp.id());
                temporaries.push(temp);
            }
            None => ids.push(fence.id()),
        }
    }

    match device.kgd().sync_wait(&ids, wait_all, deadline) {
        Ok(WaitStatus::Signaled) => Ok(()),
        Ok(WaitStatus::TimedOut) => Err(Error::Timeout),
        Err(e) => Err(device.kernel_error("sync_wait", e)),
    }
}

/// Return every fence to the unsignaled state
pub fn reset_fences(device: &Device, fences: &[&SyncObject]) -> Result<()> {
    device.check_lost()?;
    let mut ids = Vec::new();
    ids.try_reserve_exact(fences.len())?;
    for fence in fences {
        if !fence.device().same_device(device) {
            return Err(Error::InvalidUsage("fence belongs to another device"));
        }
        ids.push(fence.id());
    }
    device
        .kgd()
        .sync_reset(&ids)
        .map_err(|e| device.kernel_error("sync_reset", e))?;
    for fence in fences {
        fence.clear_snapshot();
    }
    Ok(())
}
