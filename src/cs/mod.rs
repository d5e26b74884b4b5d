//! Chunked command stream writer
//!
//! A [`CommandStream`] appends 32-bit packet words into a list of
//! CPU-mapped buffer objects. Callers bracket writes with
//! [`CommandStream::begin`] / [`CommandStream::end`]; each non-empty
//! bracket becomes one [`CsEntry`], the unit handed to the kernel as an
//! indirect buffer. When the current chunk runs out, a new, larger one is
//! allocated and writing continues there.

pub mod packet;

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use log::trace;

use crate::bo::{BoAllocator, BoFlags, BoRef};
use crate::config::DEFAULT_CS_MIN_BO_SIZE;
use crate::error::{Error, Result};

/// Size of one packet word in bytes
pub const WORD_SIZE: u64 = 4;

/// One contiguous range of packet words inside a buffer object
#[derive(Debug, Clone)]
pub struct CsEntry {
    /// Buffer object holding the range
    pub bo: BoRef,
    /// Byte offset of the first word
    pub offset: u32,
    /// Length in bytes
    pub size: u32,
}

impl CsEntry {
    /// GPU address of the first word
    pub fn gpu_addr(&self) -> u64 {
        self.bo.gpu_addr() + self.offset as u64
    }

    /// Length in words
    pub fn words(&self) -> u32 {
        self.size / WORD_SIZE as u32
    }
}

/// Append-only packet writer backed by a growing list of buffer objects
///
/// `start`, `cur` and `end` are word indices into the last BO of `bos`.
/// `cur` never passes `end`.
pub struct CommandStream {
    allocator: Arc<BoAllocator>,
    bos: Vec<BoRef>,
    entries: Vec<CsEntry>,
    base: NonNull<u32>,
    start: usize,
    cur: usize,
    end: usize,
    min_bo_size: u64,
    fixed_bo_size: bool,
}

// `base` points into the mapping of the last BO in `bos`, which the stream
// keeps alive; the stream itself is externally synchronized.
unsafe impl Send for CommandStream {}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("bos", &self.bos.len())
            .field("entries", &self.entries.len())
            .field("start", &self.start)
            .field("cur", &self.cur)
            .field("end", &self.end)
            .finish()
    }
}

impl CommandStream {
    /// Stream with 16 KiB minimum chunks that double as they are replaced
    pub fn new(allocator: Arc<BoAllocator>) -> Self {
        Self::with_chunk_size(allocator, DEFAULT_CS_MIN_BO_SIZE, false)
    }

    /// Stream with `min_bo_size` chunks; with `fixed` set chunks never grow
    /// beyond what a single reservation needs
    pub fn with_chunk_size(allocator: Arc<BoAllocator>, min_bo_size: u64, fixed: bool) -> Self {
        Self {
            allocator,
            bos: Vec::new(),
            entries: Vec::new(),
            base: NonNull::dangling(),
            start: 0,
            cur: 0,
            end: 0,
            min_bo_size,
            fixed_bo_size: fixed,
        }
    }

    fn next_bo_size(&self, min_words: usize) -> u64 {
        let needed = (min_words as u64).saturating_mul(WORD_SIZE);
        let mut size = self.min_bo_size.max(needed);
        if !self.fixed_bo_size {
            if let Some(last) = self.bos.last() {
                size = size.max(last.size().saturating_mul(2));
            }
        }
        size
    }

    /// Guarantee at least `min_words` contiguous writable words and open a
    /// new range at the cursor
    pub fn begin(&mut self, min_words: usize) -> Result<()> {
        if min_words == 0 {
            return Err(Error::InvalidUsage("command stream reservation must be non-zero"));
        }
        if self.end - self.cur >= min_words {
            self.start = self.cur;
            return Ok(());
        }

        self.bos.try_reserve(1)?;
        let size = self.next_bo_size(min_words);
        let bo = self.allocator.create(size, BoFlags::empty())?;
        let base = bo.cpu_ptr().ok_or(Error::MemoryMapFailed)?;
        trace!(
            "command stream chunk {} ({} bytes, BO {})",
            self.bos.len(),
            bo.size(),
            bo.handle()
        );

        self.base = base.cast();
        self.start = 0;
        self.cur = 0;
        self.end = (bo.size() / WORD_SIZE) as usize;
        self.bos.push(bo);
        Ok(())
    }

    /// Close the open range, recording it as an entry if anything was
    /// written
    pub fn end(&mut self) -> Result<()> {
        if self.cur == self.start {
            return Ok(());
        }
        let bo = match self.bos.last() {
            Some(bo) => BoRef::clone(bo),
            None => return Ok(()),
        };
        self.entries.try_reserve(1)?;
        self.entries.push(CsEntry {
            bo,
            offset: (self.start as u64 * WORD_SIZE) as u32,
            size: ((self.cur - self.start) as u64 * WORD_SIZE) as u32,
        });
        self.start = self.cur;
        Ok(())
    }

    /// Make sure `min_words` can be written, closing the open range and
    /// moving to a new chunk if needed
    pub fn reserve_space(&mut self, min_words: usize) -> Result<()> {
        if self.end - self.cur >= min_words {
            return Ok(());
        }
        self.end()?;
        self.begin(min_words)
    }

    /// Drop every entry and every chunk except the last, which is rewound
    /// for reuse
    pub fn reset(&mut self) {
        self.entries.clear();
        if let Some(last) = self.bos.pop() {
            self.bos.clear();
            self.bos.push(last);
        }
        self.start = 0;
        self.cur = 0;
    }

    /// Append one word; the caller must have reserved room
    #[inline]
    pub fn emit(&mut self, word: u32) {
        assert!(self.cur < self.end, "command stream overflow");
        // SAFETY: cur < end and [base, base + end) is the mapping of the
        // last BO in `bos`.
        unsafe { self.base.as_ptr().add(self.cur).write(word) };
        self.cur += 1;
    }

    /// Append a run of words; the caller must have reserved room
    #[inline]
    pub fn emit_slice(&mut self, words: &[u32]) {
        assert!(self.end - self.cur >= words.len(), "command stream overflow");
        // SAFETY: the destination range is inside the mapping, checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(words.as_ptr(), self.base.as_ptr().add(self.cur), words.len());
        }
        self.cur += words.len();
    }

    /// Ranges recorded so far
    pub fn entries(&self) -> &[CsEntry] {
        &self.entries
    }

    /// Number of recorded ranges
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Backing buffer objects, oldest first
    pub fn bos(&self) -> &[BoRef] {
        &self.bos
    }

    /// Number of backing buffer objects
    pub fn bo_count(&self) -> usize {
        self.bos.len()
    }

    /// Words writable without reserving
    pub fn space(&self) -> usize {
        self.end - self.cur
    }

    /// Words written to the open range
    pub fn pending_words(&self) -> usize {
        self.cur - self.start
    }

    /// Byte offset of the cursor inside the current chunk
    pub fn cur_offset(&self) -> u64 {
        self.cur as u64 * WORD_SIZE
    }

    /// Chunk the cursor points into
    pub fn current_bo(&self) -> Option<&BoRef> {
        self.bos.last()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.cur == self.start
    }

    /// Total bytes covered by recorded entries
    pub fn recorded_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size as u64).sum()
    }
}
