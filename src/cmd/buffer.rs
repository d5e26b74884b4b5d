//! Command buffer state machine and packet-level recording surface

use std::fmt;
use std::mem;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace};

use crate::alloc::Reservation;
use crate::bo::BoRef;
use crate::cs::packet::{self, event, opcode, reg, DI_PT_TRILIST, DI_SRC_SEL_AUTO_INDEX};
use crate::cs::CommandStream;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::residency::{AccessFlags, ResidencyList};
use crate::sync::SyncObject;

/// Words guaranteed writable right after `begin`
pub const BEGIN_RESERVE_WORDS: usize = 4096;
/// Payload words of the NOP emitted at `begin`
pub const BEGIN_NOP_PAYLOAD: u32 = 3;
/// Highest descriptor set index plus one
pub const MAX_DESCRIPTOR_SETS: u32 = 32;

const MAX_PKT4_COUNT: usize = 0x7f;
const MAX_PKT7_COUNT: usize = 0x3fff;
const MEM_WRITE_CHUNK: usize = 1024;
const DRAW_INDIRECT_ARGS_SIZE: u64 = 16;
const DISPATCH_INDIRECT_ARGS_SIZE: u64 = 12;

/// Command buffer level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Submitted to a queue directly
    Primary,
    /// Executed from a primary command buffer
    Secondary,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// A recording failed or a one-time-submit buffer completed
    Invalid,
    /// Freshly created or reset
    Initial,
    /// Between `begin` and `end`
    Recording,
    /// Recorded and ready to submit
    Executable,
    /// Submitted and not yet known to be complete
    Pending,
}

bitflags! {
    /// How a recording will be submitted
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UsageFlags: u32 {
        /// Invalid after its one submission completes
        const ONE_TIME_SUBMIT = 1 << 0;
        /// Secondary buffer continuing a render pass
        const RENDER_PASS_CONTINUE = 1 << 1;
        /// May be resubmitted while still pending
        const SIMULTANEOUS_USE = 1 << 2;
    }
}

bitflags! {
    /// Cache maintenance and waits requested by a pipeline barrier
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BarrierFlags: u32 {
        /// Flush the color CCU
        const FLUSH_COLOR = 1 << 0;
        /// Flush the depth CCU
        const FLUSH_DEPTH = 1 << 1;
        /// Invalidate the color CCU
        const INVALIDATE_COLOR = 1 << 2;
        /// Invalidate the depth CCU
        const INVALIDATE_DEPTH = 1 << 3;
        /// Flush the shared cache
        const FLUSH_CACHE = 1 << 4;
        /// Invalidate the shared cache
        const INVALIDATE_CACHE = 1 << 5;
        /// Wait for the GPU to idle
        const WAIT_FOR_IDLE = 1 << 6;
        /// Wait for the micro engine
        const WAIT_FOR_ME = 1 << 7;
    }
}

impl BarrierFlags {
    const EVENTS: [(BarrierFlags, u32); 6] = [
        (BarrierFlags::FLUSH_COLOR, event::PC_CCU_FLUSH_COLOR_TS),
        (BarrierFlags::FLUSH_DEPTH, event::PC_CCU_FLUSH_DEPTH_TS),
        (BarrierFlags::INVALIDATE_COLOR, event::PC_CCU_INVALIDATE_COLOR),
        (BarrierFlags::INVALIDATE_DEPTH, event::PC_CCU_INVALIDATE_DEPTH),
        (BarrierFlags::FLUSH_CACHE, event::CACHE_FLUSH_TS),
        (BarrierFlags::INVALIDATE_CACHE, event::CACHE_INVALIDATE),
    ];

    fn events(self) -> impl Iterator<Item = u32> {
        Self::EVENTS
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, event)| event)
    }

    fn word_count(self) -> usize {
        let waits = self.intersection(BarrierFlags::WAIT_FOR_IDLE | BarrierFlags::WAIT_FOR_ME);
        self.events().count() * 2 + waits.bits().count_ones() as usize
    }
}

/// Pipeline bind point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    /// Draws
    Graphics,
    /// Dispatches
    Compute,
}

impl BindPoint {
    fn index(self) -> usize {
        match self {
            BindPoint::Graphics => 0,
            BindPoint::Compute => 1,
        }
    }
}

/// Descriptor bookkeeping held for the translation layer; one bit per set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorState {
    /// Sets that have been bound
    pub valid: u32,
    /// Sets bound since the translation layer last consumed them
    pub dirty: u32,
    /// A push descriptor set changed
    pub push_dirty: bool,
}

fn draw_initiator() -> u32 {
    DI_PT_TRILIST | (DI_SRC_SEL_AUTO_INDEX << 6)
}

fn range_ok(bo: &BoRef, offset: u64, bytes: u64) -> bool {
    offset % 4 == 0 && offset.checked_add(bytes).map_or(false, |end| end <= bo.size())
}

/// A recording of packets plus the buffer objects they touch
///
/// Recording calls never fail directly. The first error is latched and
/// every later call becomes a no-op; [`CommandBuffer::end`] reports it.
pub struct CommandBuffer {
    device: Device,
    pool_id: u32,
    level: Level,
    status: Status,
    usage: UsageFlags,
    cs: CommandStream,
    residency: ResidencyList,
    record_result: Result<()>,
    descriptors: [DescriptorState; 2],
    fragment_work: bool,
    pending: Vec<SyncObject>,
    _reservation: Reservation,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("pool", &self.pool_id)
            .field("level", &self.level)
            .field("status", &self.status)
            .field("entries", &self.cs.entry_count())
            .field("residency", &self.residency.len())
            .finish()
    }
}

impl CommandBuffer {
    pub(crate) fn new(device: &Device, pool_id: u32, level: Level, reservation: Reservation) -> Self {
        let config = device.config();
        let cs = CommandStream::with_chunk_size(
            Arc::clone(device.bo_allocator()),
            config.cs_min_bo_size,
            config.cs_fixed_bo_size,
        );
        Self {
            device: device.clone(),
            pool_id,
            level,
            status: Status::Initial,
            usage: UsageFlags::empty(),
            cs,
            residency: ResidencyList::new(),
            record_result: Ok(()),
            descriptors: [DescriptorState::default(); 2],
            fragment_work: false,
            pending: Vec::new(),
            _reservation: reservation,
        }
    }

    /// Device the buffer records for
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Level
    pub fn level(&self) -> Level {
        self.level
    }

    pub(crate) fn set_level(&mut self, level: Level) {
        self.level = level;
    }

    /// Current state, without polling pending work
    pub fn status(&self) -> Status {
        self.status
    }

    /// Usage flags of the current recording
    pub fn usage(&self) -> UsageFlags {
        self.usage
    }

    /// Command stream
    pub fn cs(&self) -> &CommandStream {
        &self.cs
    }

    /// Buffer objects the recording references
    pub fn residency(&self) -> &ResidencyList {
        &self.residency
    }

    /// First error hit while recording
    pub fn record_result(&self) -> Result<()> {
        self.record_result.clone()
    }

    /// Whether the recording contains fragment work
    pub fn has_fragment_work(&self) -> bool {
        self.fragment_work
    }

    /// Descriptor bookkeeping for a bind point
    pub fn descriptor_state(&self, bind_point: BindPoint) -> DescriptorState {
        self.descriptors[bind_point.index()]
    }

    /// Return and clear the dirty bits of a bind point
    pub fn take_dirty_descriptors(&mut self, bind_point: BindPoint) -> DescriptorState {
        let state = &mut self.descriptors[bind_point.index()];
        let taken = *state;
        state.dirty = 0;
        state.push_dirty = false;
        taken
    }

    /// Poll pending submissions without blocking and move to
    /// `Executable` (or `Invalid` for one-time-submit recordings) once they
    /// have all completed
    pub fn refresh_status(&mut self) -> Result<Status> {
        if self.status != Status::Pending {
            return Ok(self.status);
        }
        let mut still_pending = Vec::new();
        for sync in mem::take(&mut self.pending) {
            match sync.is_signaled() {
                Ok(true) => {}
                Ok(false) => still_pending.push(sync),
                Err(e) => {
                    self.status = Status::Invalid;
                    return Err(e);
                }
            }
        }
        self.pending = still_pending;
        if self.pending.is_empty() {
            self.status = if self.usage.contains(UsageFlags::ONE_TIME_SUBMIT) {
                Status::Invalid
            } else {
                Status::Executable
            };
            trace!("command buffer completed, now {:?}", self.status);
        }
        Ok(self.status)
    }

    fn ensure_not_pending(&mut self) -> Result<()> {
        if self.status == Status::Pending && self.refresh_status()? == Status::Pending {
            return Err(Error::InvalidUsage("command buffer is pending execution"));
        }
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self, sync: SyncObject) {
        self.status = Status::Pending;
        self.pending.push(sync);
    }

    fn clear_recording(&mut self) {
        self.cs.reset();
        self.residency.reset();
        self.descriptors = [DescriptorState::default(); 2];
        self.fragment_work = false;
    }

    /// Start a recording, resetting first if the buffer is not `Initial`
    pub fn begin(&mut self, usage: UsageFlags) -> Result<()> {
        self.ensure_not_pending()?;
        self.clear_recording();
        self.status = Status::Initial;
        self.usage = usage;
        self.record_result = Ok(());

        self.cs.begin(BEGIN_RESERVE_WORDS)?;
        if self.device.config().emit_begin_nop {
            packet::emit_nop(&mut self.cs, BEGIN_NOP_PAYLOAD);
        }
        self.status = Status::Recording;
        Ok(())
    }

    /// Finish the recording; returns the first error latched while
    /// recording, in which case the buffer becomes `Invalid`
    pub fn end(&mut self) -> Result<()> {
        if self.status != Status::Recording {
            return Err(Error::InvalidUsage("command buffer is not recording"));
        }
        if let Err(e) = self.cs.end() {
            self.latch(e);
        }
        match &self.record_result {
            Ok(()) => {
                self.status = Status::Executable;
                trace!(
                    "recorded {} entries, {} BOs resident",
                    self.cs.entry_count(),
                    self.residency.len()
                );
                Ok(())
            }
            Err(e) => {
                self.status = Status::Invalid;
                Err(e.clone())
            }
        }
    }

    /// Drop the recording and return to `Initial`
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_not_pending()?;
        self.clear_recording();
        self.status = Status::Initial;
        self.record_result = Ok(());
        Ok(())
    }

    fn latch(&mut self, err: Error) {
        if self.record_result.is_ok() {
            debug!("recording error latched: {err}");
            self.record_result = Err(err);
        }
    }

    fn can_record(&mut self) -> bool {
        if self.status != Status::Recording {
            self.latch(Error::InvalidUsage("command buffer is not recording"));
            return false;
        }
        self.record_result.is_ok()
    }

    fn reserve(&mut self, words: usize) -> bool {
        match self.cs.reserve_space(words) {
            Ok(()) => true,
            Err(e) => {
                self.latch(e);
                false
            }
        }
    }

    fn add_bo(&mut self, bo: &BoRef, access: AccessFlags) -> bool {
        if !Arc::ptr_eq(bo.allocator(), self.device.bo_allocator()) {
            self.latch(Error::InvalidUsage("buffer object belongs to another device"));
            return false;
        }
        match self.residency.add(bo, access) {
            Ok(_) => true,
            Err(e) => {
                self.latch(e);
                false
            }
        }
    }

    /// Register-write packet
    pub fn cmd_pkt4(&mut self, reg: u32, values: &[u32]) {
        if !self.can_record() {
            return;
        }
        if values.len() > MAX_PKT4_COUNT {
            self.latch(Error::InvalidUsage("too many registers in one packet"));
            return;
        }
        if self.reserve(1 + values.len()) {
            packet::emit_pkt4(&mut self.cs, reg, values);
        }
    }

    /// Opcode packet
    pub fn cmd_pkt7(&mut self, opcode: u8, payload: &[u32]) {
        if !self.can_record() {
            return;
        }
        if payload.len() > MAX_PKT7_COUNT {
            self.latch(Error::InvalidUsage("packet payload too long"));
            return;
        }
        if self.reserve(1 + payload.len()) {
            packet::emit_pkt7(&mut self.cs, opcode, payload);
        }
    }

    /// Keep `bo` resident while the recording executes
    pub fn use_bo(&mut self, bo: &BoRef, access: AccessFlags) {
        if self.can_record() {
            self.add_bo(bo, access);
        }
    }

    /// Non-indexed draw
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if !self.can_record() || vertex_count == 0 || instance_count == 0 {
            return;
        }
        if !self.reserve(7) {
            return;
        }
        packet::emit_pkt4(&mut self.cs, reg::VFD_INDEX_OFFSET, &[first_vertex, first_instance]);
        packet::emit_pkt7(
            &mut self.cs,
            opcode::CP_DRAW_INDX_OFFSET,
            &[draw_initiator(), instance_count, vertex_count],
        );
        self.fragment_work = true;
    }

    /// Draws whose arguments live in `bo`, `stride` bytes apart
    pub fn draw_indirect(&mut self, bo: &BoRef, offset: u64, draw_count: u32, stride: u32) {
        if !self.can_record() || draw_count == 0 {
            return;
        }
        let last = (draw_count as u64 - 1) * stride as u64;
        if stride % 4 != 0 || !range_ok(bo, offset, last + DRAW_INDIRECT_ARGS_SIZE) {
            self.latch(Error::InvalidUsage("indirect draw arguments exceed buffer object"));
            return;
        }
        if !self.add_bo(bo, AccessFlags::READ) {
            return;
        }
        for i in 0..draw_count as u64 {
            if !self.reserve(4) {
                return;
            }
            let addr = bo.gpu_addr() + offset + i * stride as u64;
            packet::emit_pkt7_header(&mut self.cs, opcode::CP_DRAW_INDIRECT, 3);
            self.cs.emit(draw_initiator());
            packet::emit_qw(&mut self.cs, addr);
        }
        self.fragment_work = true;
    }

    /// Compute dispatch of `x * y * z` workgroups
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if !self.can_record() || x == 0 || y == 0 || z == 0 {
            return;
        }
        if self.reserve(5) {
            packet::emit_pkt7(&mut self.cs, opcode::CP_EXEC_CS, &[0, x, y, z]);
        }
    }

    /// Compute dispatch whose group counts live in `bo`
    pub fn dispatch_indirect(&mut self, bo: &BoRef, offset: u64) {
        if !self.can_record() {
            return;
        }
        if !range_ok(bo, offset, DISPATCH_INDIRECT_ARGS_SIZE) {
            self.latch(Error::InvalidUsage("indirect dispatch arguments exceed buffer object"));
            return;
        }
        if !self.add_bo(bo, AccessFlags::READ) || !self.reserve(5) {
            return;
        }
        let addr = bo.gpu_addr() + offset;
        packet::emit_pkt7_header(&mut self.cs, opcode::CP_EXEC_CS_INDIRECT, 4);
        self.cs.emit(0);
        packet::emit_qw(&mut self.cs, addr);
        self.cs.emit(0);
    }

    /// GPU-side write of `words` into `dst` at byte `offset`
    pub fn update_buffer(&mut self, dst: &BoRef, offset: u64, words: &[u32]) {
        if !self.can_record() || words.is_empty() {
            return;
        }
        if !range_ok(dst, offset, words.len() as u64 * 4) {
            self.latch(Error::InvalidUsage("buffer update exceeds buffer object"));
            return;
        }
        if !self.add_bo(dst, AccessFlags::WRITE) {
            return;
        }
        let mut addr = dst.gpu_addr() + offset;
        for chunk in words.chunks(MEM_WRITE_CHUNK) {
            if !self.reserve(3 + chunk.len()) {
                return;
            }
            packet::emit_mem_write(&mut self.cs, addr, chunk);
            addr += chunk.len() as u64 * 4;
        }
    }

    /// GPU-side copy of `dwords` words from `src` to `dst`
    pub fn copy_buffer(&mut self, src: &BoRef, src_offset: u64, dst: &BoRef, dst_offset: u64, dwords: u32) {
        if !self.can_record() || dwords == 0 {
            return;
        }
        let bytes = dwords as u64 * 4;
        if !range_ok(src, src_offset, bytes) || !range_ok(dst, dst_offset, bytes) {
            self.latch(Error::InvalidUsage("buffer copy exceeds buffer object"));
            return;
        }
        if !self.add_bo(src, AccessFlags::READ) || !self.add_bo(dst, AccessFlags::WRITE) {
            return;
        }
        let src_addr = src.gpu_addr() + src_offset;
        let dst_addr = dst.gpu_addr() + dst_offset;
        for i in 0..dwords as u64 {
            if !self.reserve(6) {
                return;
            }
            packet::emit_mem_to_mem(&mut self.cs, dst_addr + i * 4, src_addr + i * 4);
        }
    }

    /// Cache maintenance events followed by the requested waits
    pub fn pipeline_barrier(&mut self, flags: BarrierFlags) {
        if !self.can_record() || flags.is_empty() {
            return;
        }
        if !self.reserve(flags.word_count()) {
            return;
        }
        for ev in flags.events() {
            packet::emit_event_write(&mut self.cs, ev);
        }
        if flags.contains(BarrierFlags::WAIT_FOR_IDLE) {
            packet::emit_wfi(&mut self.cs);
        }
        if flags.contains(BarrierFlags::WAIT_FOR_ME) {
            packet::emit_pkt7_header(&mut self.cs, opcode::CP_WAIT_FOR_ME, 0);
        }
    }

    /// Mark sets `first_set .. first_set + count` bound and dirty
    pub fn bind_descriptor_sets(&mut self, bind_point: BindPoint, first_set: u32, count: u32) {
        if !self.can_record() || count == 0 {
            return;
        }
        if first_set.checked_add(count).map_or(true, |end| end > MAX_DESCRIPTOR_SETS) {
            self.latch(Error::InvalidUsage("descriptor set index out of range"));
            return;
        }
        let mask = (u32::MAX >> (32 - count)) << first_set;
        let state = &mut self.descriptors[bind_point.index()];
        state.valid |= mask;
        state.dirty |= mask;
    }

    /// Mark the push descriptor set dirty
    pub fn push_descriptor_set(&mut self, bind_point: BindPoint) {
        if self.can_record() {
            self.descriptors[bind_point.index()].push_dirty = true;
        }
    }

    /// Call the recorded ranges of executable secondary buffers
    pub fn execute_commands(&mut self, secondaries: &[&CommandBuffer]) {
        if !self.can_record() {
            return;
        }
        if self.level != Level::Primary {
            self.latch(Error::InvalidUsage("only primary command buffers execute secondaries"));
            return;
        }
        for secondary in secondaries {
            if secondary.level != Level::Secondary || secondary.status != Status::Executable {
                self.latch(Error::InvalidUsage("secondary command buffer is not executable"));
                return;
            }
            if let Err(e) = self.residency.merge(&secondary.residency) {
                self.latch(e);
                return;
            }
            for entry in secondary.cs.entries() {
                if !self.add_bo(&entry.bo, AccessFlags::READ | AccessFlags::DUMP) || !self.reserve(4) {
                    return;
                }
                packet::emit_indirect_buffer(&mut self.cs, entry.gpu_addr(), entry.words());
            }
            self.fragment_work |= secondary.fragment_work;
        }
    }
}
