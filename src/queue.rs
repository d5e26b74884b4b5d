//! Submission queues and the submission builder

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};

use log::{debug, trace};

use crate::alloc::{AllocationScope, Reservation};
use crate::cmd::{CommandBuffer, Level, Status, UsageFlags};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::kgd::{CommandTuple, Requirements, CMD_FLAG_IB};
use crate::residency::{AccessFlags, ResidencyList};
use crate::sync::{wait_fences, SyncObject};

/// One kernel submission queue
///
/// Work submitted to one queue executes in submission order. After each
/// successful [`Queue::submit`] the queue holds a sync file for that
/// submission, from which [`Queue::create_fence`] derives fences.
pub struct Queue {
    device: Device,
    id: u32,
    priority: u32,
    requirements: Requirements,
    fence_fd: Option<OwnedFd>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("requirements", &self.requirements)
            .field("has_fence", &self.fence_fd.is_some())
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(device: &Device, priority: u32, requirements: Requirements) -> Result<Self> {
        device.check_lost()?;
        let id = device.kgd().queue_new(priority, 0).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOMEM) => Error::OutOfHostMemory,
            _ => Error::InitializationFailed(format!("could not create submit queue: {e}")),
        })?;
        debug!("queue {id} created (priority {priority}, {requirements:?})");
        Ok(Self {
            device: device.clone(),
            id,
            priority,
            requirements,
            fence_fd: None,
        })
    }

    /// Kernel queue id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Scheduling priority
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Queue type bits attached to every submission
    pub fn requirements(&self) -> Requirements {
        self.requirements
    }

    /// Device the queue belongs to
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether the queue has a fence from an earlier submission
    pub fn has_fence(&self) -> bool {
        self.fence_fd.is_some()
    }

    fn check_submittable(&self, cb: &mut CommandBuffer) -> Result<()> {
        if !cb.device().same_device(&self.device) {
            return Err(Error::InvalidUsage("command buffer belongs to another device"));
        }
        if cb.level() != Level::Primary {
            return Err(Error::InvalidUsage("only primary command buffers can be submitted"));
        }
        match cb.refresh_status()? {
            Status::Executable => Ok(()),
            Status::Pending if cb.usage().contains(UsageFlags::SIMULTANEOUS_USE) => Ok(()),
            Status::Pending => Err(Error::InvalidUsage("command buffer is pending execution")),
            _ => Err(Error::InvalidUsage("command buffer is not executable")),
        }
    }

    /// Submit `cmd_buffers` in order as one kernel submission
    ///
    /// The submission waits on `wait` and signals `signal` when given.
    /// Every buffer becomes pending until the submission completes,
    /// independently of what later happens to `signal`. A kernel failure
    /// loses the device.
    pub fn submit(
        &mut self,
        cmd_buffers: &mut [&mut CommandBuffer],
        wait: &[&SyncObject],
        signal: Option<&SyncObject>,
    ) -> Result<()> {
        self.device.check_lost()?;
        for cb in cmd_buffers.iter_mut() {
            self.check_submittable(cb)?;
        }
        for sync in wait.iter().chain(signal.iter()) {
            if !sync.device().same_device(&self.device) {
                return Err(Error::InvalidUsage("sync object belongs to another device"));
            }
        }

        let total_entries: usize = cmd_buffers.iter().map(|cb| cb.cs().entry_count()).sum();
        let _scratch = Reservation::for_array::<CommandTuple>(
            self.device.host_allocator(),
            total_entries,
            AllocationScope::Command,
        )?;
        let mut commands = Vec::new();
        commands.try_reserve_exact(total_entries)?;

        let mut residency = ResidencyList::new();
        let mut requirements = self.requirements;
        for cb in cmd_buffers.iter() {
            residency.merge(cb.residency())?;
            for entry in cb.cs().entries() {
                residency.add(&entry.bo, AccessFlags::READ | AccessFlags::DUMP)?;
                commands.push(CommandTuple {
                    gpu_addr: entry.gpu_addr(),
                    size: entry.size,
                    flags: CMD_FLAG_IB,
                    handle: entry.bo.handle(),
                    ..Default::default()
                });
            }
            if cb.has_fragment_work() {
                requirements |= Requirements::FRAGMENT;
            }
        }

        let mut bo_table = Vec::new();
        bo_table.try_reserve_exact(residency.len())?;
        bo_table.extend(residency.entries());
        let mut in_syncs = Vec::new();
        in_syncs.try_reserve_exact(wait.len())?;
        in_syncs.extend(wait.iter().map(|s| s.id()));

        // Buffers track a private object; the caller may reset `signal` at will
        let tracker = SyncObject::new(&self.device, false)?;
        let out = signal.unwrap_or(&tracker);

        let kgd = self.device.kgd();
        let timestamp = kgd
            .submit(self.id, &commands, &bo_table, &in_syncs, out.id(), requirements)
            .map_err(|e| self.device.set_lost(format!("submit on queue {}: {e}", self.id)))?;
        trace!(
            "queue {} submitted {} IBs, {} BOs, timestamp {}",
            self.id,
            commands.len(),
            bo_table.len(),
            timestamp
        );
        out.clear_snapshot();

        let fence = kgd
            .sync_signal_from_timestamp(self.id, timestamp)
            .map_err(|e| self.device.set_lost(format!("fence for timestamp {timestamp}: {e}")))?;
        if signal.is_some() {
            tracker
                .import_raw(fence.as_raw_fd())
                .map_err(|e| self.device.set_lost(format!("tracking timestamp {timestamp}: {e}")))?;
        }
        self.fence_fd = Some(fence);

        for cb in cmd_buffers.iter_mut() {
            cb.mark_submitted(tracker.clone());
        }
        Ok(())
    }

    /// Fence that signals when everything submitted so far has completed;
    /// already signaled if nothing was submitted
    pub fn create_fence(&self) -> Result<SyncObject> {
        self.device.check_lost()?;
        match &self.fence_fd {
            Some(fd) => {
                let dup = fd.try_clone().map_err(|_| Error::OutOfHostMemory)?;
                SyncObject::from_sync_file(&self.device, dup)
            }
            None => SyncObject::new(&self.device, true),
        }
    }

    /// Block until the queue has drained
    pub fn wait_idle(&self) -> Result<()> {
        self.device.check_lost()?;
        if self.fence_fd.is_none() {
            return Ok(());
        }
        let fence = self.create_fence()?;
        wait_fences(&self.device, &[&fence], true, u64::MAX)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.fence_fd.take();
        self.device.kgd().queue_close(self.id);
    }
}
