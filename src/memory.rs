// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DMA-capable memory shared with the VPU.
//!
//! Every buffer the firmware touches (frame buffers, the bitstream ring, scratch memory) is
//! obtained from a [`DmaAllocator`]. The resulting [`DmaBuffer`] carries both the CPU view of the
//! memory and the physical address handed to the firmware.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use thiserror::Error;

use crate::utils::align_up;
use crate::utils::lock;

/// Physical alignment the VPU requires for every buffer it addresses.
pub const DMA_ALIGNMENT: u64 = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// CPU accesses are cached and must be flushed before the device reads the memory.
    Cached,
    /// Write-combined mapping, no flush needed.
    WriteCombined,
    NonCached,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("cannot map a zero-sized buffer")]
    ZeroSize,
    #[error("out of DMA memory while mapping {0} bytes")]
    OutOfMemory(usize),
}

type UnmapFn = Box<dyn FnOnce(u64, usize) + Send>;

/// A mapped buffer. Unmapping happens when the buffer is dropped.
pub struct DmaBuffer {
    phys_addr: u64,
    cache: CacheMode,
    mem: Box<[u8]>,
    unmap: Option<UnmapFn>,
}

impl DmaBuffer {
    /// Physical (device-visible) address of the first byte of the buffer.
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache
    }

    /// Physical address range covered by the buffer.
    pub fn phys_range(&self) -> Range<u64> {
        self.phys_addr..self.phys_addr + self.mem.len() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mem
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mem
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap(self.phys_addr, self.mem.len());
        }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .field("size", &self.mem.len())
            .field("cache", &self.cache)
            .finish()
    }
}

/// The memory-mapping collaborator.
pub trait DmaAllocator: Send + Sync {
    /// Maps `size` bytes of device-visible memory.
    fn map(&self, size: usize, cache: CacheMode) -> Result<DmaBuffer, MapError>;

    /// Makes CPU writes to `range` of `buffer` visible to the device.
    fn flush(&self, buffer: &DmaBuffer, range: Range<usize>);
}

#[derive(Debug)]
struct HostAllocatorState {
    next_phys: u64,
    /// Unmapped ranges below `next_phys`, sorted and coalesced.
    holes: Vec<Range<u64>>,
    /// Number of mappings left before the allocator starts failing, if limited.
    remaining: Option<usize>,
    flushes: usize,
}

impl HostAllocatorState {
    /// Carves `len` bytes from the first hole large enough, or from the end of the range.
    fn carve(&mut self, len: u64) -> u64 {
        if let Some(pos) = self.holes.iter().position(|h| h.end - h.start >= len) {
            let hole = &mut self.holes[pos];
            let start = hole.start;
            hole.start += len;
            if hole.is_empty() {
                self.holes.remove(pos);
            }
            return start;
        }

        let start = self.next_phys;
        self.next_phys += len;
        start
    }

    fn give_back(&mut self, mut range: Range<u64>) {
        let pos = self.holes.partition_point(|h| h.start < range.start);
        if pos < self.holes.len() && self.holes[pos].start == range.end {
            range.end = self.holes.remove(pos).end;
        }
        if pos > 0 && self.holes[pos - 1].end == range.start {
            self.holes[pos - 1].end = range.end;
        } else {
            self.holes.insert(pos, range);
        }

        if let Some(last) = self.holes.last() {
            if last.end == self.next_phys {
                self.next_phys = last.start;
                self.holes.pop();
            }
        }
    }
}

/// Allocator backed by host memory, handing out synthetic physical addresses.
///
/// Physical addresses are carved from a linear range starting at `base` and realigned to
/// [`DMA_ALIGNMENT`], the way a larger contiguous allocation would be trimmed to satisfy the VPU.
/// Dropping a buffer returns its range for later mappings.
#[derive(Debug)]
pub struct HostAllocator {
    state: Arc<Mutex<HostAllocatorState>>,
}

impl HostAllocator {
    pub fn new(base: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostAllocatorState {
                next_phys: align_up(base, DMA_ALIGNMENT),
                holes: Vec::new(),
                remaining: None,
                flushes: 0,
            })),
        }
    }

    /// Creates an allocator that fails every mapping after the first `limit` ones.
    pub fn with_limit(base: u64, limit: usize) -> Self {
        let allocator = Self::new(base);
        lock(&allocator.state).remaining = Some(limit);
        allocator
    }

    /// Number of flushes performed so far.
    pub fn num_flushes(&self) -> usize {
        lock(&self.state).flushes
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new(0x8000_0000)
    }
}

impl DmaAllocator for HostAllocator {
    fn map(&self, size: usize, cache: CacheMode) -> Result<DmaBuffer, MapError> {
        if size == 0 {
            return Err(MapError::ZeroSize);
        }

        let mut state = lock(&self.state);
        if let Some(remaining) = state.remaining.as_mut() {
            if *remaining == 0 {
                return Err(MapError::OutOfMemory(size));
            }
            *remaining -= 1;
        }

        let phys_addr = state.carve(align_up(size as u64, DMA_ALIGNMENT));

        log::trace!("mapped {size} bytes at {phys_addr:#x} ({cache:?})");

        let owner: Weak<Mutex<HostAllocatorState>> = Arc::downgrade(&self.state);
        Ok(DmaBuffer {
            phys_addr,
            cache,
            mem: vec![0u8; size].into_boxed_slice(),
            unmap: Some(Box::new(move |addr, size| {
                log::trace!("unmapped {size} bytes at {addr:#x}");
                if let Some(state) = owner.upgrade() {
                    let end = addr + align_up(size as u64, DMA_ALIGNMENT);
                    lock(&state).give_back(addr..end);
                }
            })),
        })
    }

    fn flush(&self, buffer: &DmaBuffer, range: Range<usize>) {
        if buffer.cache_mode() != CacheMode::Cached || range.is_empty() {
            return;
        }

        log::trace!(
            "flushing {:#x}..{:#x}",
            buffer.phys_addr() + range.start as u64,
            buffer.phys_addr() + range.end as u64
        );
        lock(&self.state).flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_aligned_and_disjoint() {
        let allocator = HostAllocator::new(0x1000_0001);
        let a = allocator.map(100, CacheMode::Cached).unwrap();
        let b = allocator.map(5000, CacheMode::WriteCombined).unwrap();

        assert_eq!(a.phys_addr() % DMA_ALIGNMENT, 0);
        assert_eq!(b.phys_addr() % DMA_ALIGNMENT, 0);
        assert!(a.phys_range().end <= b.phys_addr());
        assert_eq!(b.size(), 5000);
    }

    #[test]
    fn dropped_ranges_are_reused() {
        let allocator = HostAllocator::new(0x1000_0000);
        let a = allocator.map(100, CacheMode::Cached).unwrap();
        let b = allocator.map(3 * 4096, CacheMode::Cached).unwrap();
        let c = allocator.map(100, CacheMode::Cached).unwrap();
        let (a_addr, b_addr, c_addr) = (a.phys_addr(), b.phys_addr(), c.phys_addr());

        drop(b);
        let small = allocator.map(4096, CacheMode::Cached).unwrap();
        assert_eq!(small.phys_addr(), b_addr);

        // Neighbouring holes merge into one range.
        drop(small);
        drop(a);
        let big = allocator.map(4 * 4096, CacheMode::Cached).unwrap();
        assert_eq!(big.phys_addr(), a_addr);
        assert_eq!(big.phys_range().end, c_addr);

        // Releasing the tail shrinks the range back to its base.
        drop(big);
        drop(c);
        assert_eq!(
            allocator.map(1, CacheMode::Cached).unwrap().phys_addr(),
            0x1000_0000
        );
    }

    #[test]
    fn buffers_outlive_allocator() {
        let allocator = HostAllocator::default();
        let buffer = allocator.map(64, CacheMode::Cached).unwrap();
        drop(allocator);
        assert_eq!(buffer.size(), 64);
    }

    #[test]
    fn limited_allocator_fails() {
        let allocator = HostAllocator::with_limit(0, 1);
        assert!(allocator.map(16, CacheMode::Cached).is_ok());
        assert_eq!(
            allocator.map(16, CacheMode::Cached).unwrap_err(),
            MapError::OutOfMemory(16)
        );
        assert_eq!(
            HostAllocator::default().map(0, CacheMode::Cached).unwrap_err(),
            MapError::ZeroSize
        );
    }

    #[test]
    fn only_cached_buffers_are_flushed() {
        let allocator = HostAllocator::default();
        let cached = allocator.map(64, CacheMode::Cached).unwrap();
        let wc = allocator.map(64, CacheMode::WriteCombined).unwrap();

        allocator.flush(&cached, 0..64);
        allocator.flush(&cached, 10..10);
        allocator.flush(&wc, 0..64);
        assert_eq!(allocator.num_flushes(), 1);
    }
}
