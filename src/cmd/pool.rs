//! Command pools: slab storage for command buffers with a reuse free list

use std::fmt;
use std::mem;
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;

use super::buffer::{CommandBuffer, Level, Status};
use crate::alloc::{AllocationScope, HostAllocator, Reservation};
use crate::device::Device;
use crate::error::{Error, Result};

bitflags! {
    /// Options for [`CommandPool::reset`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PoolResetFlags: u32 {
        /// Also destroy free-listed buffers
        const RELEASE_RESOURCES = 1 << 0;
    }
}

/// Opaque reference to a command buffer inside one pool
///
/// Handles carry the slot generation, so a handle to a freed buffer is
/// rejected even after the slot has been handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    pool: u32,
    index: u32,
    generation: u32,
}

impl CommandBufferHandle {
    pub(crate) fn new(pool: u32, index: u32, generation: u32) -> Self {
        Self {
            pool,
            index,
            generation,
        }
    }
}

enum SlotState {
    Live(Box<CommandBuffer>),
    Free(Box<CommandBuffer>),
    Vacant,
}

struct Slot {
    generation: u32,
    state: SlotState,
}

/// Owner of command buffers
///
/// Freed buffers are parked on a free list and handed out again by
/// [`CommandPool::allocate`] until [`CommandPool::trim`] destroys them.
pub struct CommandPool {
    device: Device,
    id: u32,
    allocator: Arc<dyn HostAllocator>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    vacant: Vec<u32>,
    _reservation: Reservation,
}

impl fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPool")
            .field("id", &self.id)
            .field("live", &self.live_count())
            .field("free", &self.free_count())
            .finish()
    }
}

const STALE_HANDLE: Error = Error::InvalidUsage("stale or foreign command buffer handle");

impl CommandPool {
    pub(crate) fn new(device: &Device, allocator: Option<Arc<dyn HostAllocator>>) -> Result<Self> {
        let allocator = allocator.unwrap_or_else(|| Arc::clone(device.host_allocator()));
        let reservation = Reservation::new(&allocator, mem::size_of::<CommandPool>(), AllocationScope::Object)?;
        Ok(Self {
            device: device.clone(),
            id: device.next_pool_id(),
            allocator,
            slots: Vec::new(),
            free: Vec::new(),
            vacant: Vec::new(),
            _reservation: reservation,
        })
    }

    /// Device the pool records for
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Host allocator the pool charges
    pub fn allocator(&self) -> &Arc<dyn HostAllocator> {
        &self.allocator
    }

    /// Number of buffers handed out
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Live(_)))
            .count()
    }

    /// Number of buffers parked for reuse
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Handles of every live buffer
    pub fn handles(&self) -> Vec<CommandBufferHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.state, SlotState::Live(_)))
            .map(|(i, s)| CommandBufferHandle::new(self.id, i as u32, s.generation))
            .collect()
    }

    /// Hand out `count` buffers of `level`, reusing free-listed ones first.
    /// On failure every buffer produced by this call is freed again.
    pub fn allocate(&mut self, level: Level, count: u32) -> Result<Vec<CommandBufferHandle>> {
        let mut batch = Reservation::for_array::<CommandBuffer>(&self.allocator, count as usize, AllocationScope::Object)?;
        let mut handles = Vec::new();
        handles.try_reserve_exact(count as usize)?;

        for _ in 0..count {
            match self.allocate_one(level, &mut batch) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    debug!("allocating command buffer failed: {e}");
                    self.free(&handles);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    fn allocate_one(&mut self, level: Level, batch: &mut Reservation) -> Result<CommandBufferHandle> {
        // Newest first; buffers still executing stay parked
        let mut pos = self.free.len();
        while pos > 0 {
            pos -= 1;
            let index = self.free[pos];
            let slot = &mut self.slots[index as usize];
            let SlotState::Free(cb) = &mut slot.state else {
                self.free.remove(pos);
                continue;
            };
            if let Err(e) = cb.reset() {
                debug!("free-listed command buffer {index} not reusable yet: {e}");
                continue;
            }
            cb.set_level(level);
            if let SlotState::Free(cb) = mem::replace(&mut slot.state, SlotState::Vacant) {
                slot.state = SlotState::Live(cb);
            }
            self.free.remove(pos);
            return Ok(CommandBufferHandle::new(self.id, index, self.slots[index as usize].generation));
        }

        let reservation = batch.split(mem::size_of::<CommandBuffer>());
        let cb = Box::new(CommandBuffer::new(&self.device, self.id, level, reservation));
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index as usize].state = SlotState::Live(cb);
                index
            }
            None => {
                self.slots.try_reserve(1)?;
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Live(cb),
                });
                (self.slots.len() - 1) as u32
            }
        };
        Ok(CommandBufferHandle::new(
            self.id,
            index,
            self.slots[index as usize].generation,
        ))
    }

    fn live_index(&self, handle: CommandBufferHandle) -> Option<usize> {
        if handle.pool != self.id {
            return None;
        }
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation && matches!(slot.state, SlotState::Live(_)))
            .then_some(handle.index as usize)
    }

    /// Park buffers on the free list; stale and foreign handles are ignored
    pub fn free(&mut self, handles: &[CommandBufferHandle]) {
        for &handle in handles {
            let Some(index) = self.live_index(handle) else {
                continue;
            };
            let slot = &mut self.slots[index];
            if let SlotState::Live(cb) = mem::replace(&mut slot.state, SlotState::Vacant) {
                slot.state = SlotState::Free(cb);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
    }

    /// Command buffer behind `handle`
    pub fn get(&self, handle: CommandBufferHandle) -> Result<&CommandBuffer> {
        let index = self.live_index(handle).ok_or(STALE_HANDLE)?;
        match &self.slots[index].state {
            SlotState::Live(cb) => Ok(&**cb),
            _ => Err(STALE_HANDLE),
        }
    }

    /// Mutable command buffer behind `handle`
    pub fn get_mut(&mut self, handle: CommandBufferHandle) -> Result<&mut CommandBuffer> {
        let index = self.live_index(handle).ok_or(STALE_HANDLE)?;
        match &mut self.slots[index].state {
            SlotState::Live(cb) => Ok(&mut **cb),
            _ => Err(STALE_HANDLE),
        }
    }

    /// Mutable command buffers behind distinct handles, in handle order
    pub fn get_many_mut(&mut self, handles: &[CommandBufferHandle]) -> Result<Vec<&mut CommandBuffer>> {
        for &handle in handles {
            self.live_index(handle).ok_or(STALE_HANDLE)?;
        }
        let mut by_slot: Vec<Option<&mut CommandBuffer>> = self
            .slots
            .iter_mut()
            .map(|slot| match &mut slot.state {
                SlotState::Live(cb) => Some(&mut **cb),
                _ => None,
            })
            .collect();

        let mut out = Vec::new();
        out.try_reserve_exact(handles.len())?;
        for handle in handles {
            let cb = by_slot[handle.index as usize]
                .take()
                .ok_or(Error::InvalidUsage("command buffer handle listed twice"))?;
            out.push(cb);
        }
        Ok(out)
    }

    /// Reset every live buffer; the first failure aborts
    pub fn reset(&mut self, flags: PoolResetFlags) -> Result<()> {
        for slot in &mut self.slots {
            if let SlotState::Live(cb) = &mut slot.state {
                cb.reset()?;
            }
        }
        if flags.contains(PoolResetFlags::RELEASE_RESOURCES) {
            self.trim();
        }
        Ok(())
    }

    /// Destroy every free-listed buffer
    pub fn trim(&mut self) {
        let trimmed = self.free.len();
        for index in self.free.drain(..) {
            self.slots[index as usize].state = SlotState::Vacant;
            self.vacant.push(index);
        }
        if trimmed > 0 {
            debug!("pool {} trimmed {} command buffers", self.id, trimmed);
        }
    }

    /// Whether every live buffer is in `status`
    pub fn all_in(&self, status: Status) -> bool {
        self.slots.iter().all(|s| match &s.state {
            SlotState::Live(cb) => cb.status() == status,
            _ => true,
        })
    }
}
