//! Size-bucketed cache of idle buffer objects

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::BoFlags;

/// Smallest bucket: 4 KiB
pub const MIN_BUCKET: u32 = 12;
/// Largest bucket: 4 MiB; anything bigger lands here too
pub const MAX_BUCKET: u32 = 22;

const BUCKET_COUNT: usize = (MAX_BUCKET - MIN_BUCKET + 1) as usize;

/// Bucket for a size: `clamp(ceil(log2(size)), MIN_BUCKET, MAX_BUCKET)`,
/// relative to `MIN_BUCKET`
pub fn bucket_index(size: u64) -> usize {
    let log2 = if size <= 1 {
        0
    } else {
        64 - (size - 1).leading_zeros()
    };
    (log2.clamp(MIN_BUCKET, MAX_BUCKET) - MIN_BUCKET) as usize
}

/// What the cache keeps when a buffer object goes idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Never retain anything
    Disabled,
    /// Keep every idle BO until evicted
    Unbounded,
    /// Keep at most `max_bytes` of idle BOs, dropping the least recently
    /// cached ones first
    HighWaterMark {
        /// Byte ceiling for all buckets together
        max_bytes: u64,
    },
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Unbounded
    }
}

/// Kernel-side identity of a buffer object with no live references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleBo {
    /// Kernel handle
    pub handle: u32,
    /// Size in bytes
    pub size: u64,
    /// GPU virtual address
    pub gpu_addr: u64,
    /// Creation flags
    pub flags: BoFlags,
}

#[derive(Debug)]
struct Cached {
    bo: IdleBo,
    seq: u64,
}

/// Idle buffer objects grouped by size bucket, oldest first
#[derive(Debug)]
pub struct BoCache {
    buckets: Vec<VecDeque<Cached>>,
    bytes: u64,
    seq: u64,
}

impl Default for BoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BoCache {
    /// Empty cache
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| VecDeque::new()).collect(),
            bytes: 0,
            seq: 0,
        }
    }

    /// Number of cached BOs
    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Whether the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Total bytes of cached BOs
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Splice out the first BO in `size`'s bucket that is big enough and was
    /// created with exactly `flags`
    pub fn take(&mut self, size: u64, flags: BoFlags) -> Option<IdleBo> {
        let bucket = &mut self.buckets[bucket_index(size)];
        let pos = bucket
            .iter()
            .position(|c| c.bo.size >= size && c.bo.flags == flags)?;
        let cached = bucket.remove(pos)?;
        self.bytes -= cached.bo.size;
        Some(cached.bo)
    }

    /// Offer an idle BO to the cache. Returns the BOs the caller must close:
    /// the offered one if the policy rejects it, or older entries evicted to
    /// make room.
    pub fn put(&mut self, bo: IdleBo, policy: CachePolicy) -> Vec<IdleBo> {
        match policy {
            CachePolicy::Disabled => vec![bo],
            CachePolicy::Unbounded => {
                self.push(bo);
                Vec::new()
            }
            CachePolicy::HighWaterMark { max_bytes } => {
                if bo.size > max_bytes {
                    return vec![bo];
                }
                self.push(bo);
                let mut evicted = Vec::new();
                while self.bytes > max_bytes {
                    match self.pop_oldest() {
                        Some(old) => evicted.push(old),
                        None => break,
                    }
                }
                evicted
            }
        }
    }

    fn push(&mut self, bo: IdleBo) {
        self.seq += 1;
        self.bytes += bo.size;
        self.buckets[bucket_index(bo.size)].push_back(Cached { bo, seq: self.seq });
    }

    /// Evict the oldest BO in `size`'s bucket
    pub fn pop_oldest_in_bucket(&mut self, size: u64) -> Option<IdleBo> {
        let cached = self.buckets[bucket_index(size)].pop_front()?;
        self.bytes -= cached.bo.size;
        Some(cached.bo)
    }

    /// Evict the least recently cached BO of any bucket
    pub fn pop_oldest(&mut self) -> Option<IdleBo> {
        let idx = self
            .buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.front().map(|c| (i, c.seq)))
            .min_by_key(|&(_, seq)| seq)?
            .0;
        let cached = self.buckets[idx].pop_front()?;
        self.bytes -= cached.bo.size;
        Some(cached.bo)
    }

    /// Detach every cached BO
    pub fn drain(&mut self) -> Vec<IdleBo> {
        self.bytes = 0;
        self.buckets
            .iter_mut()
            .flat_map(|b| b.drain(..).map(|c| c.bo))
            .collect()
    }
}
