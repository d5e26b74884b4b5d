//! Null kernel driver: everything happens in process memory.
//!
//! Buffer objects are host allocations with made-up GPU addresses, and a
//! submission "executes" by completing its fence. Sync files and dmabufs
//! are real `memfd` descriptors so they can be dup'd, closed and passed
//! around like the kernel's, but their identity is the memfd inode.
//!
//! The driver also records every submission (including the packet words it
//! pointed at) and can inject failures, which makes it the backend for the
//! test-suite and benchmarks.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::trace;

use super::{
    monotonic_ns, CommandTuple, Kgd, Madvise, NewBo, Param, Requirements, ResidencyEntry,
    WaitStatus, CMD_FLAG_IB,
};
use crate::bo::BoFlags;

const GPU_VA_BASE: u64 = 0x1_0000_0000;
const GPU_VA_ALIGN: u64 = 0x1000;
const MAX_TRACKED_TIMESTAMPS: usize = 64;
const MAX_TRACKED_FILES: usize = 256;

/// Host memory standing in for a kernel buffer object
struct Storage {
    ptr: NonNull<u64>,
    words: usize,
}

// The storage is plain memory; access is coordinated by the callers the
// same way GPU-visible memory is.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn new(bytes: u64) -> io::Result<Arc<Self>> {
        let words = usize::try_from(bytes.div_ceil(8))
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?
            .max(1);
        let mut v: Vec<u64> = Vec::new();
        v.try_reserve_exact(words)
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
        v.resize(words, 0);
        let raw = Box::into_raw(v.into_boxed_slice()) as *mut u64;
        let ptr = NonNull::new(raw).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Arc::new(Self { ptr, words }))
    }

    fn base(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    fn zero(&self) {
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.words) };
    }

    fn read_u32s(&self, offset: usize, count: usize) -> Vec<u32> {
        let base = self.ptr.as_ptr() as *const u8;
        (0..count)
            .map(|i| unsafe { (base.add(offset + i * 4) as *const u32).read_unaligned() })
            .collect()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.words);
        drop(unsafe { Box::from_raw(slice) });
    }
}

type FencePoint = Arc<AtomicBool>;

struct NullBo {
    storage: Arc<Storage>,
    gpu_addr: u64,
    size: u64,
    imported: bool,
    purgeable: bool,
}

struct NullQueue {
    next_timestamp: u32,
    fences: BTreeMap<u32, FencePoint>,
}

/// One submission as the null driver received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmission {
    /// Queue the work went to
    pub queue_id: u32,
    /// Command tuples in submission order
    pub commands: Vec<CommandTuple>,
    /// Residency table
    pub residency: Vec<ResidencyEntry>,
    /// Sync objects waited on
    pub in_syncs: Vec<u32>,
    /// Sync object signaled on completion
    pub out_sync: u32,
    /// Requirement bits
    pub requirements: Requirements,
    /// Timestamp returned to the caller
    pub timestamp: u32,
    /// Packet words of every command tuple, read at submit time
    pub ib_words: Vec<Vec<u32>>,
}

impl RecordedSubmission {
    /// All packet words of the submission, concatenated in execution order
    pub fn words(&self) -> Vec<u32> {
        self.ib_words.iter().flatten().copied().collect()
    }
}

/// Objects reachable through exported fds, keyed by memfd inode.
/// The oldest entries are forgotten once the table is full.
struct InodeTable<V> {
    entries: HashMap<u64, V>,
    order: VecDeque<u64>,
}

impl<V: Clone> InodeTable<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, ino: u64, value: V) {
        // Inodes are recycled once the memfd is closed
        if self.entries.insert(ino, value).is_some() {
            self.order.retain(|&i| i != ino);
        }
        self.order.push_back(ino);
        while self.order.len() > MAX_TRACKED_FILES {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }

    fn get(&self, ino: u64) -> Option<V> {
        self.entries.get(&ino).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct NullState {
    next_handle: u32,
    next_gpu_addr: u64,
    bos: HashMap<u32, NullBo>,
    dmabufs: InodeTable<(Arc<Storage>, u64)>,
    memory_used: u64,
    memory_limit: Option<u64>,
    fail_bo_new: u32,
    discard_on_willneed: bool,

    next_queue: u32,
    queues: HashMap<u32, NullQueue>,
    fail_submit: Option<i32>,
    submissions: Vec<RecordedSubmission>,

    next_sync: u32,
    syncs: HashMap<u32, Option<FencePoint>>,
    sync_files: InodeTable<FencePoint>,
    auto_complete: bool,
    unretired: Vec<FencePoint>,

    params: HashMap<Param, u64>,
    calls: HashMap<&'static str, usize>,
}

impl NullState {
    fn bump(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }

    fn alloc_gpu_addr(&mut self, size: u64) -> u64 {
        let addr = self.next_gpu_addr;
        let span = size.div_ceil(GPU_VA_ALIGN).max(1) * GPU_VA_ALIGN;
        self.next_gpu_addr = self.next_gpu_addr.saturating_add(span);
        addr
    }

    fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn fence_state(&self, sync_id: u32) -> io::Result<bool> {
        match self.syncs.get(&sync_id) {
            Some(Some(fence)) => Ok(fence.load(Ordering::Acquire)),
            Some(None) => Ok(false),
            None => Err(errno(libc::ENOENT)),
        }
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn memfd(size: u64) -> io::Result<(OwnedFd, u64)> {
    let name = b"gpucs-null\0";
    let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if size > 0 && unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let ino = inode_of(fd.as_raw_fd())?;
    Ok((fd, ino))
}

fn inode_of(fd: RawFd) -> io::Result<u64> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_ino as u64)
}

/// In-process kernel driver
pub struct NullKgd {
    state: Mutex<NullState>,
    signal: Condvar,
}

impl Default for NullKgd {
    fn default() -> Self {
        Self::new()
    }
}

impl NullKgd {
    /// A driver reporting an a630-like device whose GPU completes work
    /// as soon as it is submitted
    pub fn new() -> Self {
        let params = HashMap::from([
            (Param::GpuId, 630),
            (Param::GmemSize, 1024 * 1024),
            (Param::GmemBase, 0x0010_0000),
            (Param::ChipId, 0x0603_0000),
            (Param::MaxFreq, 710_000_000),
            (Param::Timestamp, 0),
            (Param::Priorities, 3),
        ]);

        Self {
            state: Mutex::new(NullState {
                next_handle: 1,
                next_gpu_addr: GPU_VA_BASE,
                bos: HashMap::new(),
                dmabufs: InodeTable::new(),
                memory_used: 0,
                memory_limit: None,
                fail_bo_new: 0,
                discard_on_willneed: false,
                next_queue: 1,
                queues: HashMap::new(),
                fail_submit: None,
                submissions: Vec::new(),
                next_sync: 1,
                syncs: HashMap::new(),
                sync_files: InodeTable::new(),
                auto_complete: true,
                unretired: Vec::new(),
                params,
                calls: HashMap::new(),
            }),
            signal: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// When disabled, submissions stay pending until [`NullKgd::complete_all`]
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state().auto_complete = enabled;
    }

    /// Retire every pending submission
    pub fn complete_all(&self) {
        let mut st = self.state();
        for fence in st.unretired.drain(..) {
            fence.store(true, Ordering::Release);
        }
        drop(st);
        self.signal.notify_all();
    }

    /// Fail the next `count` BO allocations with `ENOMEM`
    pub fn fail_next_bo_new(&self, count: u32) {
        self.state().fail_bo_new = count;
    }

    /// Cap the bytes of device memory the driver hands out
    pub fn set_memory_limit(&self, limit: Option<u64>) {
        self.state().memory_limit = limit;
    }

    /// Bytes of device memory currently allocated
    pub fn memory_used(&self) -> u64 {
        self.state().memory_used
    }

    /// When enabled, `WILLNEED` on a purgeable BO reports its pages as lost
    pub fn set_discard_on_willneed(&self, enabled: bool) {
        self.state().discard_on_willneed = enabled;
    }

    /// Fail the next submit with `errno`
    pub fn fail_next_submit(&self, errno: i32) {
        self.state().fail_submit = Some(errno);
    }

    /// Override (or with `None`, remove) a device constant
    pub fn set_param(&self, param: Param, value: Option<u64>) {
        let mut st = self.state();
        match value {
            Some(v) => st.params.insert(param, v),
            None => st.params.remove(&param),
        };
    }

    /// How often a trait operation was invoked
    pub fn call_count(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    /// Total number of trait operations invoked
    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    /// Handles of all open buffer objects, sorted
    pub fn live_bos(&self) -> Vec<u32> {
        let mut handles: Vec<u32> = self.state().bos.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Whether a buffer object handle is open
    pub fn is_bo_open(&self, handle: u32) -> bool {
        self.state().bos.contains_key(&handle)
    }

    /// Whether a buffer object is currently marked `DONTNEED`
    pub fn is_purgeable(&self, handle: u32) -> bool {
        self.state().bos.get(&handle).map(|bo| bo.purgeable).unwrap_or(false)
    }

    /// Number of open sync objects
    pub fn live_syncs(&self) -> usize {
        self.state().syncs.len()
    }

    /// Exported sync files and dmabufs still importable
    pub fn tracked_files(&self) -> usize {
        let st = self.state();
        st.sync_files.len() + st.dmabufs.len()
    }

    /// Number of open submission queues
    pub fn live_queues(&self) -> usize {
        self.state().queues.len()
    }

    /// Every submission received so far
    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state().submissions.clone()
    }

    /// The most recent submission
    pub fn last_submission(&self) -> Option<RecordedSubmission> {
        self.state().submissions.last().cloned()
    }

    /// Read back words from a buffer object by GPU address
    pub fn read_gpu(&self, gpu_addr: u64, count: usize) -> Option<Vec<u32>> {
        let st = self.state();
        st.bos.values().find_map(|bo| {
            let end = bo.gpu_addr + bo.size;
            let last = gpu_addr.checked_add(count as u64 * 4)?;
            if gpu_addr >= bo.gpu_addr && last <= end {
                Some(bo.storage.read_u32s((gpu_addr - bo.gpu_addr) as usize, count))
            } else {
                None
            }
        })
    }
}

impl Kgd for NullKgd {
    fn name(&self) -> &'static str {
        "null"
    }

    fn bo_new(&self, size: u64, _flags: BoFlags) -> io::Result<NewBo> {
        let mut st = self.state();
        st.bump("bo_new");

        if st.fail_bo_new > 0 {
            st.fail_bo_new -= 1;
            return Err(errno(libc::ENOMEM));
        }
        if let Some(limit) = st.memory_limit {
            if st.memory_used.saturating_add(size) > limit {
                return Err(errno(libc::ENOMEM));
            }
        }

        let storage = Storage::new(size)?;
        let handle = st.alloc_handle();
        let gpu_addr = st.alloc_gpu_addr(size);
        st.memory_used += size;
        st.bos.insert(
            handle,
            NullBo {
                storage,
                gpu_addr,
                size,
                imported: false,
                purgeable: false,
            },
        );
        trace!("null: bo_new {size} -> {handle} @ {gpu_addr:#x}");
        Ok(NewBo {
            handle,
            gpu_addr,
            size,
        })
    }

    fn bo_close(&self, handle: u32) {
        let mut st = self.state();
        st.bump("bo_close");
        if let Some(bo) = st.bos.remove(&handle) {
            if !bo.imported {
                st.memory_used -= bo.size;
            }
        }
    }

    fn bo_map(&self, handle: u32, size: u64) -> io::Result<NonNull<u8>> {
        let mut st = self.state();
        st.bump("bo_map");
        match st.bos.get(&handle) {
            Some(bo) if size <= bo.size => Ok(bo.storage.base()),
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn bo_munmap(&self, _ptr: NonNull<u8>, _size: u64) {
        self.state().bump("bo_munmap");
    }

    fn bo_export(&self, handle: u32) -> io::Result<OwnedFd> {
        let mut st = self.state();
        st.bump("bo_export");
        let (storage, size) = match st.bos.get(&handle) {
            Some(bo) => (bo.storage.clone(), bo.size),
            None => return Err(errno(libc::ENOENT)),
        };
        let (fd, ino) = memfd(size)?;
        st.dmabufs.insert(ino, (storage, size));
        Ok(fd)
    }

    fn bo_import(&self, fd: RawFd) -> io::Result<NewBo> {
        let mut st = self.state();
        st.bump("bo_import");
        let ino = inode_of(fd)?;
        let (storage, size) = st.dmabufs.get(ino).ok_or_else(|| errno(libc::EINVAL))?;
        let handle = st.alloc_handle();
        let gpu_addr = st.alloc_gpu_addr(size);
        st.bos.insert(
            handle,
            NullBo {
                storage,
                gpu_addr,
                size,
                imported: true,
                purgeable: false,
            },
        );
        Ok(NewBo {
            handle,
            gpu_addr,
            size,
        })
    }

    fn bo_madvise(&self, handle: u32, advice: Madvise) -> io::Result<bool> {
        let mut st = self.state();
        st.bump("bo_madvise");
        let discard = st.discard_on_willneed;
        let bo = st.bos.get_mut(&handle).ok_or_else(|| errno(libc::ENOENT))?;
        match advice {
            Madvise::DontNeed => {
                bo.purgeable = true;
                Ok(true)
            }
            Madvise::WillNeed => {
                let retained = !(discard && bo.purgeable);
                if !retained {
                    bo.storage.zero();
                }
                bo.purgeable = false;
                Ok(retained)
            }
        }
    }

    fn queue_new(&self, _priority: u32, _flags: u32) -> io::Result<u32> {
        let mut st = self.state();
        st.bump("queue_new");
        let id = st.next_queue;
        st.next_queue += 1;
        st.queues.insert(
            id,
            NullQueue {
                next_timestamp: 1,
                fences: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn queue_close(&self, queue_id: u32) {
        let mut st = self.state();
        st.bump("queue_close");
        st.queues.remove(&queue_id);
    }

    fn submit(
        &self,
        queue_id: u32,
        commands: &[CommandTuple],
        residency: &[ResidencyEntry],
        in_syncs: &[u32],
        out_sync: u32,
        requirements: Requirements,
    ) -> io::Result<u32> {
        let mut st = self.state();
        st.bump("submit");

        if let Some(code) = st.fail_submit.take() {
            return Err(errno(code));
        }
        if !st.queues.contains_key(&queue_id) {
            return Err(errno(libc::ENOENT));
        }
        for id in in_syncs.iter().chain(std::iter::once(&out_sync)) {
            if !st.syncs.contains_key(id) {
                return Err(errno(libc::ENOENT));
            }
        }
        for entry in residency {
            if !st.bos.contains_key(&entry.handle) {
                return Err(errno(libc::ENOENT));
            }
        }

        let mut ib_words = Vec::with_capacity(commands.len());
        for cmd in commands {
            if cmd.flags & CMD_FLAG_IB == 0 || cmd.size % 4 != 0 {
                return Err(errno(libc::EINVAL));
            }
            if !residency.iter().any(|entry| entry.handle == cmd.handle) {
                return Err(errno(libc::EINVAL));
            }
            let bo = st.bos.get(&cmd.handle).ok_or_else(|| errno(libc::ENOENT))?;
            let end = cmd.gpu_addr.checked_add(cmd.size as u64).ok_or_else(|| errno(libc::EINVAL))?;
            if cmd.gpu_addr < bo.gpu_addr || end > bo.gpu_addr + bo.size {
                return Err(errno(libc::EINVAL));
            }
            let offset = (cmd.gpu_addr - bo.gpu_addr) as usize;
            ib_words.push(bo.storage.read_u32s(offset, cmd.size as usize / 4));
        }

        let fence: FencePoint = Arc::new(AtomicBool::new(st.auto_complete));
        if !st.auto_complete {
            st.unretired.push(fence.clone());
        }

        let queue = st.queues.get_mut(&queue_id).ok_or_else(|| errno(libc::ENOENT))?;
        let timestamp = queue.next_timestamp;
        queue.next_timestamp = queue.next_timestamp.wrapping_add(1);
        queue.fences.insert(timestamp, fence.clone());
        while queue.fences.len() > MAX_TRACKED_TIMESTAMPS {
            queue.fences.pop_first();
        }

        st.syncs.insert(out_sync, Some(fence));
        if let Some(ts) = st.params.get_mut(&Param::Timestamp) {
            *ts += 1;
        }
        st.submissions.push(RecordedSubmission {
            queue_id,
            commands: commands.to_vec(),
            residency: residency.to_vec(),
            in_syncs: in_syncs.to_vec(),
            out_sync,
            requirements,
            timestamp,
            ib_words,
        });
        drop(st);

        self.signal.notify_all();
        Ok(timestamp)
    }

    fn sync_new(&self, signaled: bool) -> io::Result<u32> {
        let mut st = self.state();
        st.bump("sync_new");
        let id = st.next_sync;
        st.next_sync += 1;
        let fence = signaled.then(|| Arc::new(AtomicBool::new(true)));
        st.syncs.insert(id, fence);
        Ok(id)
    }

    fn sync_close(&self, sync_id: u32) {
        let mut st = self.state();
        st.bump("sync_close");
        st.syncs.remove(&sync_id);
    }

    fn sync_wait(&self, sync_ids: &[u32], wait_all: bool, deadline_ns: i64) -> io::Result<WaitStatus> {
        let mut st = self.state();
        st.bump("sync_wait");
        loop {
            let mut all = true;
            let mut any = false;
            for &id in sync_ids {
                let signaled = st.fence_state(id)?;
                all &= signaled;
                any |= signaled;
            }
            if (wait_all && all) || (!wait_all && any) {
                return Ok(WaitStatus::Signaled);
            }

            let now = monotonic_ns();
            if now >= deadline_ns {
                return Ok(WaitStatus::TimedOut);
            }
            let remaining = Duration::from_nanos((deadline_ns - now) as u64);
            st = match self.signal.wait_timeout(st, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn sync_reset(&self, sync_ids: &[u32]) -> io::Result<()> {
        let mut st = self.state();
        st.bump("sync_reset");
        for id in sync_ids {
            match st.syncs.get_mut(id) {
                Some(fence) => *fence = None,
                None => return Err(errno(libc::ENOENT)),
            }
        }
        Ok(())
    }

    fn sync_export_file(&self, sync_id: u32) -> io::Result<OwnedFd> {
        let mut st = self.state();
        st.bump("sync_export_file");
        let fence = match st.syncs.get(&sync_id) {
            Some(Some(fence)) => fence.clone(),
            Some(None) => return Err(errno(libc::EINVAL)),
            None => return Err(errno(libc::ENOENT)),
        };
        let (fd, ino) = memfd(0)?;
        st.sync_files.insert(ino, fence);
        Ok(fd)
    }

    fn sync_import_file(&self, sync_id: u32, fd: RawFd) -> io::Result<()> {
        let mut st = self.state();
        st.bump("sync_import_file");
        let ino = inode_of(fd)?;
        let fence = st.sync_files.get(ino).ok_or_else(|| errno(libc::EINVAL))?;
        match st.syncs.get_mut(&sync_id) {
            Some(slot) => {
                *slot = Some(fence);
                Ok(())
            }
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn sync_signal_from_timestamp(&self, queue_id: u32, timestamp: u32) -> io::Result<OwnedFd> {
        let mut st = self.state();
        st.bump("sync_signal_from_timestamp");
        let fence = st
            .queues
            .get(&queue_id)
            .and_then(|q| q.fences.get(&timestamp))
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))?;
        let (fd, ino) = memfd(0)?;
        st.sync_files.insert(ino, fence);
        Ok(fd)
    }

    fn get_param(&self, param: Param) -> io::Result<u64> {
        let mut st = self.state();
        st.bump("get_param");
        st.params.get(&param).copied().ok_or_else(|| errno(libc::EINVAL))
    }
}
