// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame buffer list.
//!
//! Each stream owns two pools of frame buffers:
//!
//! * VPU frame buffers (vfb) hold tiled luma/chroma pictures. The firmware decodes into them and
//!   keeps them as references until it releases them.
//! * Output frame buffers (ofb) hold linear RGBA pictures produced by the blitter and consumed by
//!   the client.
//!
//! Buffers of both pools are identified by their index. At any time a buffer is either free in
//! its pool, acquired by the decode pipeline, waiting in a ready queue, or held by the blitter
//! (vfb) or the client (ofb). Acquisition never blocks: a miss is recorded as a pending request and
//! replayed once a buffer comes back.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::memory::CacheMode;
use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;
use crate::memory::MapError;

/// Capacity of the ready queues, and upper bound of both pools.
pub const MAX_FRAMES: usize = 40;

/// Firmware-visible state of a VPU frame buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Mapped but never handed to the firmware.
    Alloc,
    /// Handed to the firmware as a decode target.
    Free,
    /// The firmware has decoded a picture into it.
    Decoded,
    /// Queued for the blitter.
    Ready,
    /// Released by the firmware, available to be handed out again.
    Release,
}

impl FrameStatus {
    fn can_become(self, new: FrameStatus) -> bool {
        use FrameStatus::*;

        matches!(
            (self, new),
            (Alloc, Free)
                | (Free, Decoded)
                | (Decoded, Ready)
                | (Ready, Release)
                | (Release, Free)
                | (Release, Alloc)
                // The firmware may drop a picture it never displayed, e.g. after an abort.
                | (Free, Release)
                | (Decoded, Release)
        )
    }
}

#[derive(Debug)]
pub struct VpuFrame {
    index: usize,
    status: FrameStatus,
    acquired: bool,
    rdy_for_blit: bool,
    held_by_blitter: bool,
    luma: DmaBuffer,
    chroma: DmaBuffer,
}

impl VpuFrame {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn is_ready_for_blit(&self) -> bool {
        self.rdy_for_blit
    }

    pub fn is_held_by_blitter(&self) -> bool {
        self.held_by_blitter
    }

    pub fn luma(&self) -> &DmaBuffer {
        &self.luma
    }

    pub fn chroma(&self) -> &DmaBuffer {
        &self.chroma
    }
}

#[derive(Debug)]
pub struct OutputFrame {
    index: usize,
    width: u32,
    height: u32,
    stride: u32,
    acquired: bool,
    rdy_for_display: bool,
    held_by_client: bool,
    buffer: DmaBuffer,
}

impl OutputFrame {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn is_ready_for_display(&self) -> bool {
        self.rdy_for_display
    }

    pub fn is_held_by_client(&self) -> bool {
        self.held_by_client
    }

    pub fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }
}

/// Pool-wide flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FblFlags(u32);

impl FblFlags {
    /// The stream is stopping, acquisitions must fail without being recorded as pending.
    pub const STOPPING: Self = Self(1 << 0);
    /// The vfb pool has been mapped.
    pub const HAVE_VFBS: Self = Self(1 << 1);
    /// The ofb pool has been mapped.
    pub const HAVE_OFBS: Self = Self(1 << 2);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// Bounded FIFO of buffer indices.
#[derive(Debug, Default)]
struct FrameQueue(VecDeque<usize>);

impl FrameQueue {
    fn push(&mut self, index: usize) -> bool {
        if self.0.len() >= MAX_FRAMES {
            return false;
        }
        self.0.push_back(index);
        true
    }

    fn push_front(&mut self, index: usize) {
        self.0.push_front(index)
    }

    fn pop(&mut self) -> Option<usize> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }
}

/// Snapshot of the pool occupancy, for status reports.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FblStats {
    pub vfb_capacity: usize,
    pub vfb_active: usize,
    pub vfb_free: usize,
    pub vfb_queued: usize,
    pub vfb_in_blit: usize,
    pub vfb_pending: u32,
    pub ofb_capacity: usize,
    pub ofb_free: usize,
    pub ofb_queued: usize,
    pub ofb_held_by_client: usize,
    pub ofb_pending: u32,
}

#[derive(Debug, Default)]
pub struct FrameBufferList {
    vfbs: Vec<VpuFrame>,
    ofbs: Vec<OutputFrame>,
    /// Number of vfbs the current sequence uses, counted from the start of the pool.
    vfb_active: usize,
    vfbq: FrameQueue,
    ofbq: FrameQueue,
    vfb_cursor: usize,
    ofb_cursor: usize,
    flags: FblFlags,
    vfb_waiting: bool,
    ofb_waiting: bool,
    vfb_pending: u32,
    ofb_pending: u32,
    /// Luma physical address to vfb index.
    addr_index: HashMap<u64, usize>,
    /// Set whenever a waiter of the stream's condition variable must be woken up.
    signal: bool,
}

impl FrameBufferList {
    pub fn new() -> Self {
        Default::default()
    }

    /// Maps `capacity` vfbs of `luma_size` + `chroma_size` bytes.
    pub fn update_vfbs(
        &mut self,
        allocator: &dyn DmaAllocator,
        capacity: usize,
        luma_size: usize,
        chroma_size: usize,
    ) -> Result<(), MapError> {
        let capacity = capacity.min(MAX_FRAMES);
        let mut vfbs = Vec::with_capacity(capacity);

        for index in 0..capacity {
            vfbs.push(VpuFrame {
                index,
                status: FrameStatus::Alloc,
                acquired: false,
                rdy_for_blit: false,
                held_by_blitter: false,
                luma: allocator.map(luma_size, CacheMode::WriteCombined)?,
                chroma: allocator.map(chroma_size, CacheMode::WriteCombined)?,
            });
        }

        self.addr_index = vfbs
            .iter()
            .map(|f| (f.luma.phys_addr(), f.index))
            .collect();
        self.vfbs = vfbs;
        self.vfb_active = capacity;
        self.vfb_cursor = 0;
        self.flags.insert(FblFlags::HAVE_VFBS);

        log::debug!("mapped {capacity} vfbs ({luma_size} + {chroma_size} bytes)");
        Ok(())
    }

    /// Maps `capacity` ofbs of `size` bytes.
    pub fn update_ofbs(
        &mut self,
        allocator: &dyn DmaAllocator,
        capacity: usize,
        size: usize,
    ) -> Result<(), MapError> {
        let capacity = capacity.min(MAX_FRAMES);
        let mut ofbs = Vec::with_capacity(capacity);

        for index in 0..capacity {
            ofbs.push(OutputFrame {
                index,
                width: 0,
                height: 0,
                stride: 0,
                acquired: false,
                rdy_for_display: false,
                held_by_client: false,
                buffer: allocator.map(size, CacheMode::Cached)?,
            });
        }

        self.ofbs = ofbs;
        self.ofb_cursor = 0;
        self.flags.insert(FblFlags::HAVE_OFBS);

        log::debug!("mapped {capacity} ofbs ({size} bytes)");
        Ok(())
    }

    /// Records the geometry of the linear frames the blitter will produce.
    pub fn set_output_geometry(&mut self, width: u32, height: u32, stride: u32) {
        for ofb in self.ofbs.iter_mut() {
            ofb.width = width;
            ofb.height = height;
            ofb.stride = stride;
        }
    }

    pub fn vfb_capacity(&self) -> usize {
        self.vfbs.len()
    }

    pub fn vfb_active(&self) -> usize {
        self.vfb_active
    }

    pub fn ofb_capacity(&self) -> usize {
        self.ofbs.len()
    }

    pub fn flags(&self) -> FblFlags {
        self.flags
    }

    pub fn vfb(&self, index: usize) -> Option<&VpuFrame> {
        self.vfbs.get(index)
    }

    pub fn ofb(&self, index: usize) -> Option<&OutputFrame> {
        self.ofbs.get(index)
    }

    pub fn vfb_pending(&self) -> u32 {
        self.vfb_pending
    }

    pub fn ofb_pending(&self) -> u32 {
        self.ofb_pending
    }

    pub fn is_vfb_waiting(&self) -> bool {
        self.vfb_waiting
    }

    pub fn is_ofb_waiting(&self) -> bool {
        self.ofb_waiting
    }

    /// Returns whether a waiter must be woken up, clearing the request.
    pub fn take_signal(&mut self) -> bool {
        std::mem::take(&mut self.signal)
    }

    fn scan_vfb(&mut self) -> Option<usize> {
        let n = self.vfb_active;
        if n == 0 {
            return None;
        }

        for i in 0..n {
            let index = (self.vfb_cursor + i) % n;
            let vfb = &mut self.vfbs[index];
            if !vfb.acquired && matches!(vfb.status, FrameStatus::Alloc | FrameStatus::Release) {
                vfb.acquired = true;
                vfb.rdy_for_blit = false;
                vfb.held_by_blitter = false;
                self.vfb_cursor = (index + 1) % n;
                return Some(index);
            }
        }

        None
    }

    fn scan_ofb(&mut self) -> Option<usize> {
        let n = self.ofbs.len();
        if n == 0 {
            return None;
        }

        for i in 0..n {
            let index = (self.ofb_cursor + i) % n;
            let ofb = &mut self.ofbs[index];
            if !ofb.acquired {
                ofb.acquired = true;
                ofb.rdy_for_display = false;
                ofb.held_by_client = false;
                self.ofb_cursor = (index + 1) % n;
                return Some(index);
            }
        }

        None
    }

    /// Acquires a vfb for the decoder, starting from the rotating cursor.
    ///
    /// On a miss the request is recorded as pending, to be served later by
    /// [`take_pending_vfb`](Self::take_pending_vfb).
    pub fn acquire_vfb(&mut self, abort_pending: bool) -> Option<usize> {
        if self.flags.contains(FblFlags::STOPPING) || abort_pending {
            return None;
        }

        let acquired = self.scan_vfb();
        if acquired.is_none() {
            log::debug!("no free vfb, pending requests: {}", self.vfb_pending + 1);
            self.vfb_waiting = true;
            self.signal = true;
            self.vfb_pending += 1;
        }

        acquired
    }

    /// Acquires an ofb for the blitter.
    pub fn acquire_ofb(&mut self, abort_pending: bool) -> Option<usize> {
        if self.flags.contains(FblFlags::STOPPING) || abort_pending {
            return None;
        }

        let acquired = self.scan_ofb();
        if acquired.is_none() {
            log::trace!("no free ofb, pending requests: {}", self.ofb_pending + 1);
            self.ofb_waiting = true;
            self.signal = true;
            self.ofb_pending += 1;
        }

        acquired
    }

    /// Serves one previously missed vfb request, if a buffer is available now.
    pub fn take_pending_vfb(&mut self) -> Option<usize> {
        if self.vfb_pending == 0 || self.flags.contains(FblFlags::STOPPING) {
            return None;
        }

        let index = self.scan_vfb()?;
        self.vfb_pending -= 1;
        Some(index)
    }

    /// Consumes one previously missed ofb request, if a buffer is available now.
    pub fn take_pending_ofb(&mut self) -> Option<usize> {
        if self.ofb_pending == 0 || self.flags.contains(FblFlags::STOPPING) {
            return None;
        }

        let index = self.scan_ofb()?;
        self.ofb_pending -= 1;
        Some(index)
    }

    /// Returns `index` to the vfb pool. Does nothing if the buffer is not acquired.
    pub fn release_vfb(&mut self, index: usize) -> bool {
        let Some(vfb) = self.vfbs.get_mut(index) else {
            return false;
        };
        if !vfb.acquired {
            return false;
        }
        if vfb.rdy_for_blit {
            log::warn!("vfb {index} is queued for the blitter, not releasing it");
            return false;
        }

        vfb.acquired = false;
        vfb.rdy_for_blit = false;
        vfb.held_by_blitter = false;

        if self.vfb_waiting {
            self.vfb_waiting = false;
            self.signal = true;
        }

        true
    }

    /// Returns `index` to the ofb pool. Does nothing if the buffer is not acquired.
    pub fn release_ofb(&mut self, index: usize) -> bool {
        let Some(ofb) = self.ofbs.get_mut(index) else {
            return false;
        };
        if !ofb.acquired {
            return false;
        }
        if ofb.rdy_for_display {
            log::warn!("ofb {index} is queued for the client, not releasing it");
            return false;
        }

        ofb.acquired = false;
        ofb.rdy_for_display = false;
        ofb.held_by_client = false;

        if self.ofb_waiting {
            self.ofb_waiting = false;
            self.signal = true;
        }

        true
    }

    /// Records a firmware-reported status change of a vfb.
    ///
    /// Illegal transitions are logged and ignored. Moving to [`FrameStatus::Release`] gives the
    /// buffer back to the pool unless it is queued for or held by the blitter, in which case the
    /// blit completion does it.
    pub fn set_vfb_status(&mut self, index: usize, status: FrameStatus) -> bool {
        let Some(vfb) = self.vfbs.get_mut(index) else {
            log::error!("status change for unknown vfb {index}");
            return false;
        };

        let old = vfb.status;
        if old == status {
            return true;
        }
        if !old.can_become(status) {
            log::error!("vfb {index}: illegal status transition {old:?} -> {status:?}");
            return false;
        }

        vfb.status = status;

        if status == FrameStatus::Release
            && vfb.acquired
            && !vfb.rdy_for_blit
            && !vfb.held_by_blitter
        {
            vfb.acquired = false;
            if self.vfb_waiting {
                self.vfb_waiting = false;
                self.signal = true;
            }
        }

        true
    }

    /// Looks up a vfb by the physical address of its luma plane.
    pub fn find_by_addr(&self, luma_addr: u64) -> Option<usize> {
        if let Some(&index) = self.addr_index.get(&luma_addr) {
            return Some(index);
        }

        self.vfbs
            .iter()
            .position(|f| f.luma.phys_addr() == luma_addr)
    }

    pub fn find_by_index(&self, index: usize) -> Option<&VpuFrame> {
        self.vfbs.get(index)
    }

    /// Queues a decoded vfb for the blitter.
    pub fn push_ready_vfb(&mut self, index: usize) -> bool {
        let Some(vfb) = self.vfbs.get_mut(index) else {
            return false;
        };
        if !vfb.acquired || vfb.rdy_for_blit || vfb.held_by_blitter {
            log::warn!(
                "vfb {index} cannot be queued (acquired: {}, queued: {}, in blit: {})",
                vfb.acquired,
                vfb.rdy_for_blit,
                vfb.held_by_blitter
            );
            return false;
        }
        if !self.vfbq.push(index) {
            log::error!("vfb ready queue full, dropping vfb {index}");
            return false;
        }

        vfb.rdy_for_blit = true;
        true
    }

    /// Pops the oldest ready vfb.
    pub fn pop_ready_vfb(&mut self) -> Option<usize> {
        let index = self.vfbq.pop()?;
        self.vfbs[index].rdy_for_blit = false;
        Some(index)
    }

    /// Puts a vfb back at the head of the ready queue after a refused blit.
    pub fn requeue_vfb(&mut self, index: usize) {
        if let Some(vfb) = self.vfbs.get_mut(index) {
            vfb.rdy_for_blit = true;
            vfb.held_by_blitter = false;
            self.vfbq.push_front(index);
        }
    }

    /// Marks a vfb as being read by the blitter.
    pub fn begin_blit(&mut self, index: usize) {
        if let Some(vfb) = self.vfbs.get_mut(index) {
            vfb.rdy_for_blit = false;
            vfb.held_by_blitter = true;
        }
    }

    /// Ends the blit of a vfb. The buffer goes back to the pool if the firmware already released
    /// it, otherwise it stays acquired until the firmware does.
    pub fn finish_blit(&mut self, index: usize) {
        let Some(vfb) = self.vfbs.get_mut(index) else {
            return;
        };
        if !vfb.held_by_blitter {
            return;
        }

        vfb.held_by_blitter = false;
        if vfb.status == FrameStatus::Release {
            self.release_vfb(index);
        }
    }

    /// Queues a blitted ofb for the client.
    pub fn push_ready_ofb(&mut self, index: usize) -> bool {
        let Some(ofb) = self.ofbs.get_mut(index) else {
            return false;
        };
        if !ofb.acquired || ofb.rdy_for_display || ofb.held_by_client {
            return false;
        }
        if !self.ofbq.push(index) {
            log::error!("ofb ready queue full, dropping ofb {index}");
            return false;
        }

        ofb.rdy_for_display = true;
        true
    }

    /// Pops the oldest ready ofb and hands it to the client.
    pub fn pop_ready_ofb(&mut self) -> Option<usize> {
        let index = self.ofbq.pop()?;
        let ofb = &mut self.ofbs[index];
        ofb.rdy_for_display = false;
        ofb.held_by_client = true;
        Some(index)
    }

    pub fn num_ready_vfbs(&self) -> usize {
        self.vfbq.len()
    }

    pub fn num_ready_ofbs(&self) -> usize {
        self.ofbq.len()
    }

    pub fn num_free_ofbs(&self) -> usize {
        self.ofbs.iter().filter(|f| !f.acquired).count()
    }

    pub fn num_client_held_ofbs(&self) -> usize {
        self.ofbs.iter().filter(|f| f.held_by_client).count()
    }

    /// Releases every queued vfb and ofb back to its pool.
    pub fn drain_queues(&mut self) {
        while let Some(index) = self.vfbq.pop() {
            let vfb = &mut self.vfbs[index];
            vfb.rdy_for_blit = false;
            if vfb.status == FrameStatus::Ready {
                vfb.status = FrameStatus::Release;
            }
            self.release_vfb(index);
        }

        while let Some(index) = self.ofbq.pop() {
            self.ofbs[index].rdy_for_display = false;
            self.release_ofb(index);
        }
    }

    /// Starts serving buffers, using the first `active` vfbs of the pool.
    pub fn start(&mut self, active: usize) {
        self.vfb_active = if active == 0 {
            self.vfbs.len()
        } else {
            active.min(self.vfbs.len())
        };
        self.vfb_cursor = 0;
        self.ofb_cursor = 0;
        self.flags.remove(FblFlags::STOPPING);

        log::debug!(
            "frame buffer list started with {} of {} vfbs",
            self.vfb_active,
            self.vfbs.len()
        );
    }

    /// Stops serving buffers and wakes up anybody waiting for one.
    pub fn stop(&mut self) {
        self.flags.insert(FblFlags::STOPPING);
        self.vfb_cursor = 0;
        self.ofb_cursor = 0;
        self.vfb_waiting = false;
        self.ofb_waiting = false;
        self.vfb_pending = 0;
        self.ofb_pending = 0;
        self.signal = true;
    }

    /// Forces every vfb back to the released, unacquired state. A vfb the blitter is still reading
    /// stays acquired until [`finish_blit`](Self::finish_blit).
    pub fn clear(&mut self) {
        self.vfbq = Default::default();
        for vfb in self.vfbs.iter_mut() {
            vfb.status = FrameStatus::Release;
            vfb.acquired = vfb.held_by_blitter;
            vfb.rdy_for_blit = false;
        }
        self.vfb_waiting = false;
        self.signal = true;
    }

    pub fn stats(&self) -> FblStats {
        FblStats {
            vfb_capacity: self.vfbs.len(),
            vfb_active: self.vfb_active,
            vfb_free: self.vfbs.iter().filter(|f| !f.acquired).count(),
            vfb_queued: self.num_ready_vfbs(),
            vfb_in_blit: self.vfbs.iter().filter(|f| f.is_held_by_blitter()).count(),
            vfb_pending: self.vfb_pending,
            ofb_capacity: self.ofbs.len(),
            ofb_free: self.num_free_ofbs(),
            ofb_queued: self.num_ready_ofbs(),
            ofb_held_by_client: self.num_client_held_ofbs(),
            ofb_pending: self.ofb_pending,
        }
    }

    /// Checks that every buffer is in exactly one ownership state and that the queues agree with
    /// the per-buffer flags.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for vfb in &self.vfbs {
            let states = [
                !vfb.acquired,
                vfb.acquired && !vfb.rdy_for_blit && !vfb.held_by_blitter,
                vfb.rdy_for_blit,
                vfb.held_by_blitter,
            ];
            assert_eq!(
                states.iter().filter(|s| **s).count(),
                1,
                "vfb {} in several states: {vfb:?}",
                vfb.index
            );
            assert_eq!(vfb.rdy_for_blit, self.vfbq.contains(vfb.index));
            if vfb.rdy_for_blit || vfb.held_by_blitter {
                assert!(vfb.acquired);
            }
        }

        for ofb in &self.ofbs {
            let states = [
                !ofb.acquired,
                ofb.acquired && !ofb.rdy_for_display && !ofb.held_by_client,
                ofb.rdy_for_display,
                ofb.held_by_client,
            ];
            assert_eq!(
                states.iter().filter(|s| **s).count(),
                1,
                "ofb {} in several states: {ofb:?}",
                ofb.index
            );
            assert_eq!(ofb.rdy_for_display, self.ofbq.contains(ofb.index));
            if ofb.rdy_for_display || ofb.held_by_client {
                assert!(ofb.acquired);
            }
        }
    }
}
