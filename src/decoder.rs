// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder sessions.
//!
//! A [`VpuDevice`] owns a fixed number of stream slots, each protected by its own lock and
//! condition variable. Client operations (`open`, `decode`, `stop`, `flush`, ...) run on the
//! caller's thread and may block on the condition variable; firmware events are delivered by the
//! message unit DPC, which takes the same lock to update the stream and wake the waiters. Every
//! blocking wait releases the stream lock while it sleeps.
//!
//! The session state machine is `Stopped -> Starting -> Started -> Stopping -> Stopped`, with an
//! independent abort state (`Init -> Pending -> Done`) driven by [`VpuDevice::flush`].

pub mod events;

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use bytes::Buf;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::config::VpuConfig;
use crate::fbl::FblStats;
use crate::fbl::FrameBufferList;
use crate::memory::CacheMode;
use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;
use crate::memory::MapError;
use crate::mu::MessageUnit;
use crate::mu::MuError;
use crate::mu::MuTransport;
use crate::mu::MU_QUEUE_SIZE;
use crate::rpc::RpcChannel;
use crate::rpc::VpuCommand;
use crate::rpc::MAX_STREAMS;
use crate::t2l::Blitter;
use crate::t2l::InFlightBlit;
use crate::utils::lock;
use crate::CodecFormat;
use crate::Fourcc;
use crate::FrameGeometry;
use crate::Resolution;

/// How long `decode` waits for the firmware to acknowledge START before giving up for this call.
pub const START_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on the number of vfbs a sequence may use.
pub const MAX_REQUIRED_FRAMES: usize = 32;

/// Size of the user data buffer mapped for each stream.
pub const USER_DATA_SIZE: usize = 64 * 1024;

const MBI_BUFFERS: usize = 2;
const DCP_BUFFERS: usize = 2;
const DCP_SIZE: usize = 0x30_0000;

/// Opaque identifier of the client file a stream was opened through.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

/// Errors that stop a stream for good. They are recorded in the stream and returned by every
/// subsequent `decode` call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("firmware exception {0:#x}")]
    FirmwareException(u32),
    #[error("malformed sequence header of {0} words")]
    MalformedSequence(usize),
    #[error("sequence header with zero resolution")]
    ZeroResolution,
    #[error("sequence resolution {0:?} exceeds the frame buffers")]
    ResolutionTooLarge(Resolution),
    #[error("bit depth {0} is not allowed")]
    UnsupportedBitDepth(u32),
    #[error("resolution change in the middle of the stream")]
    ResolutionChange,
    #[error("address {0:#x} is not reachable by the firmware")]
    AddressOutOfRange(u64),
}

#[derive(Debug, Error)]
pub enum VdecError {
    #[error("no free stream context")]
    NoFreeContext,
    #[error("unsupported format {0}")]
    UnsupportedFormat(Fourcc),
    #[error("failed to map stream memory: {0}")]
    InsufficientResources(#[from] MapError),
    #[error("output buffer {0} out of range")]
    RangeNotFound(usize),
    #[error("no open stream {0}")]
    InvalidStream(usize),
    #[error("write pointer {0:#x} is outside of the stream buffer")]
    InvalidWritePointer(u64),
    #[error("fatal stream error: {0}")]
    Fatal(FatalError),
    #[error("timed out waiting for the firmware")]
    Timeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortState {
    Init,
    /// ABORT sent, waiting for the firmware to acknowledge it.
    Pending,
    /// Aborted. Goes back to `Init` once new bitstream is submitted.
    Done,
}

/// Sequence parameters reported by the firmware with SEQ_HDR_FOUND.
///
/// Payload layout: width, height, number of DPB frames, number of reference frames, and
/// optionally the luma and chroma bit depths (8 if absent).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SequenceInfo {
    pub resolution: Resolution,
    pub num_dpb_frames: u32,
    pub num_ref_frames: u32,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
}

impl SequenceInfo {
    pub fn parse(payload: &[u32]) -> Result<Self, FatalError> {
        if payload.len() < 4 {
            return Err(FatalError::MalformedSequence(payload.len()));
        }

        Ok(Self {
            resolution: Resolution::from((payload[0], payload[1])),
            num_dpb_frames: payload[2],
            num_ref_frames: payload[3],
            bit_depth_luma: payload.get(4).copied().unwrap_or(8),
            bit_depth_chroma: payload.get(5).copied().unwrap_or(8),
        })
    }

    /// Number of vfbs the sequence needs in flight: its DPB and references plus three for the
    /// display pipeline.
    pub fn required_frames(&self) -> usize {
        let required = self.num_dpb_frames as usize + self.num_ref_frames as usize + 3;
        required.min(MAX_REQUIRED_FRAMES)
    }

    pub fn max_bit_depth(&self) -> u32 {
        self.bit_depth_luma.max(self.bit_depth_chroma)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Picture headers parsed by the firmware.
    pub parsed: u64,
    /// Pictures decoded into a vfb.
    pub decoded: u64,
    /// Decoded pictures queued for the blitter.
    pub ready: u64,
    /// Output frames returned to the client.
    pub displayed: u64,
    /// vfbs released by the firmware.
    pub released: u64,
}

/// Pointers of the bitstream ring, as physical addresses. The firmware reads them directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamBufferDescriptor {
    pub start: u64,
    pub end: u64,
    pub rptr: u64,
    pub wptr: u64,
}

/// The bitstream ring buffer of a stream.
///
/// The host produces at the write pointer and the firmware consumes at the read pointer. One byte
/// is always kept free so that a full ring can be told apart from an empty one.
#[derive(Debug)]
pub struct StreamBuffer {
    buffer: DmaBuffer,
    rptr: u64,
    wptr: u64,
}

impl StreamBuffer {
    fn new(buffer: DmaBuffer) -> Self {
        let start = buffer.phys_addr();
        Self {
            buffer,
            rptr: start,
            wptr: start,
        }
    }

    pub fn start(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn end(&self) -> u64 {
        self.buffer.phys_range().end
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    pub fn rptr(&self) -> u64 {
        self.rptr
    }

    pub fn wptr(&self) -> u64 {
        self.wptr
    }

    fn offset(&self, addr: u64) -> usize {
        (addr - self.start()) as usize
    }

    /// Number of bytes written but not consumed yet.
    pub fn level(&self) -> usize {
        let size = self.size();
        (self.offset(self.wptr) + size - self.offset(self.rptr)) % size
    }

    pub fn free_space(&self) -> usize {
        self.size() - 1 - self.level()
    }

    /// Copies as much of `data` as fits into the ring, advancing both `data` and the write
    /// pointer. Returns the number of bytes written.
    pub fn write<B: Buf>(&mut self, data: &mut B) -> usize {
        let size = self.size();
        let mut written = 0;

        while data.has_remaining() && self.free_space() > 0 {
            let offset = self.offset(self.wptr);
            let contiguous = (size - offset).min(self.free_space());
            let chunk = data.chunk();
            let n = chunk.len().min(contiguous);

            self.buffer.as_mut_slice()[offset..offset + n].copy_from_slice(&chunk[..n]);
            data.advance(n);
            written += n;
            self.wptr = self.start() + ((offset + n) % size) as u64;
        }

        written
    }

    fn contains(&self, addr: u64) -> bool {
        (self.start()..self.end()).contains(&addr)
    }

    fn set_wptr(&mut self, wptr: u64) -> Result<(), VdecError> {
        if !self.contains(wptr) {
            return Err(VdecError::InvalidWritePointer(wptr));
        }
        self.wptr = wptr;
        Ok(())
    }

    fn set_rptr(&mut self, rptr: u64) {
        if self.contains(rptr) {
            self.rptr = rptr;
        } else {
            log::warn!("ignoring read pointer {rptr:#x} outside of the stream buffer");
        }
    }

    /// Moves both pointers back to the start of the ring, dropping unread data.
    fn realign(&mut self) {
        self.rptr = self.start();
        self.wptr = self.start();
    }

    /// Flushes the bytes written between the `from` and `to` write pointers.
    fn flush(&self, allocator: &dyn DmaAllocator, from: u64, to: u64) {
        let (from, to) = (self.offset(from), self.offset(to));
        if from <= to {
            allocator.flush(&self.buffer, from..to);
        } else {
            allocator.flush(&self.buffer, from..self.size());
            allocator.flush(&self.buffer, 0..to);
        }
    }

    pub fn descriptor(&self) -> StreamBufferDescriptor {
        StreamBufferDescriptor {
            start: self.start(),
            end: self.end(),
            rptr: self.rptr,
            wptr: self.wptr,
        }
    }
}

/// Scratch buffers handed to the firmware round-robin.
#[derive(Debug, Default)]
pub(crate) struct ScratchPool {
    buffers: Vec<DmaBuffer>,
    next: usize,
}

impl ScratchPool {
    fn map(allocator: &dyn DmaAllocator, count: usize, size: usize) -> Result<Self, MapError> {
        let buffers = (0..count)
            .map(|_| allocator.map(size, CacheMode::WriteCombined))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { buffers, next: 0 })
    }

    pub(crate) fn next(&mut self) -> Option<(usize, &DmaBuffer)> {
        if self.buffers.is_empty() {
            return None;
        }

        let index = self.next;
        self.next = (index + 1) % self.buffers.len();
        Some((index, &self.buffers[index]))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InitParams {
    /// Compressed format of the stream.
    pub fourcc: Fourcc,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpenedStream {
    pub stream: usize,
    pub stream_buffer: StreamBufferDescriptor,
    /// Physical address of the user data buffer.
    pub user_data: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeParams {
    /// New write pointer of the stream buffer, if the client wrote into it directly. `None` uses
    /// the pointer left by [`VpuDevice::write_bitstream`].
    pub wptr: Option<u64>,
    /// No more input will be submitted.
    pub eos: bool,
    /// How long to wait for an output frame before returning.
    pub timeout: Option<Duration>,
    /// Number of pictures the client wants ahead of the output.
    pub frame_depth: u64,
    /// Whether the stream uses picture reordering.
    pub reorder: bool,
    pub trick_mode: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeOutput {
    NoOutput,
    /// Index of an output frame now held by the client.
    Frame(usize),
    /// The firmware needs more bitstream before it can produce output.
    LowInputFrames,
    /// Every output frame is held by the client.
    LowOutputBuffers,
    EndOfStream,
}

/// Output frame description returned by GETOUTPUT.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputFrameInfo {
    pub index: usize,
    pub phys_addr: u64,
    pub size: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

/// Snapshot returned by STATUS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamStatus {
    pub format: CodecFormat,
    pub state: SessionState,
    pub abort: AbortState,
    pub sequence: Option<SequenceInfo>,
    pub counters: FrameCounters,
    pub fatal: Option<FatalError>,
    pub finished: bool,
    pub stream_buffer: StreamBufferDescriptor,
    pub fbl: FblStats,
    pub mu_overflows: u64,
}

pub(crate) struct StreamContext {
    pub(crate) file: FileId,
    pub(crate) format: CodecFormat,
    pub(crate) state: SessionState,
    pub(crate) abort: AbortState,
    pub(crate) fatal: Option<FatalError>,
    pub(crate) seq: Option<SequenceInfo>,
    pub(crate) geometry: FrameGeometry,
    pub(crate) stream_buffer: StreamBuffer,
    /// Write pointer last announced to the firmware.
    pub(crate) fw_wptr: u64,
    pub(crate) user_data: DmaBuffer,
    pub(crate) mbi: ScratchPool,
    pub(crate) dcp: ScratchPool,
    pub(crate) fbl: FrameBufferList,
    pub(crate) counters: FrameCounters,
    /// End of stream reported by the firmware and not yet returned by `decode`.
    pub(crate) eos: bool,
    /// FINISHED received since the last start.
    pub(crate) finished: bool,
    pub(crate) blit: Option<InFlightBlit>,
    /// Bumped every time waiters are woken up.
    pub(crate) wakeups: u64,
}

impl StreamContext {
    /// Records `err` unless the stream already failed. Returns `true` so event handlers can use
    /// it as their wake-up result.
    pub(crate) fn fail(&mut self, stream: usize, err: FatalError) -> bool {
        log::error!("stream {stream}: {err}");
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        true
    }

    /// Drops the output of the blit in flight, if any, once it completes.
    pub(crate) fn discard_blit(&mut self) {
        if let Some(blit) = self.blit.as_mut() {
            blit.discard = true;
        }
    }
}

pub(crate) struct StreamSlot {
    ctx: Mutex<Option<StreamContext>>,
    cond: Condvar,
}

type SlotGuard<'a> = MutexGuard<'a, Option<StreamContext>>;

fn context<'a>(
    guard: &'a mut SlotGuard<'_>,
    stream: usize,
) -> Result<&'a mut StreamContext, VdecError> {
    guard.as_mut().ok_or(VdecError::InvalidStream(stream))
}

/// Blocks while `pending` holds for the stream, releasing the lock in the meantime. Returns
/// early if the stream gets closed. The boolean is `true` if the wait timed out.
fn wait_while<'a>(
    slot: &'a StreamSlot,
    guard: SlotGuard<'a>,
    timeout: Option<Duration>,
    mut pending: impl FnMut(&StreamContext) -> bool,
) -> (SlotGuard<'a>, bool) {
    match timeout {
        None => {
            let guard = slot
                .cond
                .wait_while(guard, |ctx| ctx.as_ref().is_some_and(&mut pending))
                .unwrap_or_else(PoisonError::into_inner);
            (guard, false)
        }
        Some(timeout) => {
            let (guard, result) = slot
                .cond
                .wait_timeout_while(guard, timeout, |ctx| {
                    ctx.as_ref().is_some_and(&mut pending)
                })
                .unwrap_or_else(PoisonError::into_inner);
            (guard, result.timed_out())
        }
    }
}

/// Converts a physical address to the 32-bit form the firmware understands.
pub(crate) fn addr_word(addr: u64) -> Result<u32, FatalError> {
    u32::try_from(addr).map_err(|_| FatalError::AddressOutOfRange(addr))
}

pub struct VpuDevice {
    config: VpuConfig,
    allocator: Arc<dyn DmaAllocator>,
    pub(crate) blitter: Arc<dyn Blitter>,
    transport: MuTransport,
    streams: Box<[StreamSlot]>,
}

impl VpuDevice {
    pub fn new(
        config: VpuConfig,
        allocator: Arc<dyn DmaAllocator>,
        blitter: Arc<dyn Blitter>,
        mu: Arc<dyn MessageUnit>,
        rpc: Box<dyn RpcChannel>,
    ) -> Result<Self, MuError> {
        if config.max_contexts > MAX_STREAMS {
            return Err(MuError::TooManyStreams(config.max_contexts));
        }

        let transport = MuTransport::new(mu, rpc, MU_QUEUE_SIZE)?;
        let streams = (0..config.max_contexts)
            .map(|_| StreamSlot {
                ctx: Mutex::new(None),
                cond: Condvar::new(),
            })
            .collect();

        Ok(Self {
            config,
            allocator,
            blitter,
            transport,
            streams,
        })
    }

    pub fn config(&self) -> &VpuConfig {
        &self.config
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    fn slot(&self, stream: usize) -> Result<&StreamSlot, VdecError> {
        self.streams
            .get(stream)
            .ok_or(VdecError::InvalidStream(stream))
    }

    /// Returns the stream opened through `file`, if any.
    pub fn stream_for_file(&self, file: FileId) -> Option<usize> {
        self.streams
            .iter()
            .position(|slot| lock(&slot.ctx).as_ref().is_some_and(|ctx| ctx.file == file))
    }

    pub(crate) fn send_command(
        &self,
        stream: usize,
        command: VpuCommand,
        data: &[u32],
    ) -> anyhow::Result<()> {
        self.transport
            .send_command(stream, command, data)
            .with_context(|| format!("failed to send {command:?} to stream {stream}"))
    }

    /// Runs `f` on an open stream, waking up its waiters if `f` returns `true` or the frame
    /// buffer list asks for it. Does nothing if the stream is not open.
    pub(crate) fn with_stream(
        &self,
        stream: usize,
        f: impl FnOnce(&mut StreamContext) -> bool,
    ) -> bool {
        let Some(slot) = self.streams.get(stream) else {
            log::warn!("no stream slot {stream}");
            return false;
        };

        let mut guard = lock(&slot.ctx);
        let Some(ctx) = guard.as_mut() else {
            log::debug!("stream {stream} is not open");
            return false;
        };

        let wake = f(ctx);
        if ctx.fbl.take_signal() || wake {
            ctx.wakeups += 1;
            slot.cond.notify_all();
        }

        true
    }

    /// Blocks on a firmware acknowledgement, bounded by the watchdog if one is configured.
    fn wait_firmware<'a>(
        &self,
        slot: &'a StreamSlot,
        guard: SlotGuard<'a>,
        what: &str,
        pending: impl FnMut(&StreamContext) -> bool,
    ) -> Result<SlotGuard<'a>, VdecError> {
        let (guard, timed_out) = wait_while(slot, guard, self.config.watchdog, pending);
        if timed_out {
            log::warn!("watchdog expired while waiting for {what}");
            return Err(VdecError::Timeout);
        }

        Ok(guard)
    }

    fn create_context(
        &self,
        file: FileId,
        format: CodecFormat,
    ) -> Result<StreamContext, VdecError> {
        let allocator = &*self.allocator;
        let max = self.config.max_resolution;
        let pool = FrameGeometry::new(max)
            .ok_or(VdecError::Fatal(FatalError::ResolutionTooLarge(max)))?;

        let stream_buffer = StreamBuffer::new(
            allocator.map(self.config.stream_buff_size, CacheMode::Cached)?,
        );
        let user_data = allocator.map(USER_DATA_SIZE, CacheMode::NonCached)?;

        let mut fbl = FrameBufferList::new();
        fbl.update_vfbs(
            allocator,
            self.config.frame_buffers,
            pool.luma_size(),
            pool.chroma_size(),
        )?;
        fbl.update_ofbs(allocator, self.config.out_frame_buffers, pool.output_size())?;

        let mbi = if format.needs_mbi() {
            ScratchPool::map(allocator, MBI_BUFFERS, pool.mbi_size())?
        } else {
            Default::default()
        };
        let dcp = if format.needs_dcp() {
            ScratchPool::map(allocator, DCP_BUFFERS, DCP_SIZE)?
        } else {
            Default::default()
        };

        let fw_wptr = stream_buffer.wptr();
        Ok(StreamContext {
            file,
            format,
            state: SessionState::Stopped,
            abort: AbortState::Init,
            fatal: None,
            seq: None,
            geometry: pool,
            stream_buffer,
            fw_wptr,
            user_data,
            mbi,
            dcp,
            fbl,
            counters: Default::default(),
            eos: false,
            finished: false,
            blit: None,
            wakeups: 0,
        })
    }

    /// Opens a stream in the first free slot.
    ///
    /// Everything the stream needs is mapped here. If any mapping fails, whatever was already
    /// mapped is released and the slot stays free.
    pub fn open(&self, file: FileId, params: &InitParams) -> Result<OpenedStream, VdecError> {
        for (stream, slot) in self.streams.iter().enumerate() {
            let mut guard = lock(&slot.ctx);
            if guard.is_some() {
                continue;
            }

            let format = CodecFormat::from_fourcc(params.fourcc, self.config.enable_hevc)
                .ok_or(VdecError::UnsupportedFormat(params.fourcc))?;

            let ctx = self.create_context(file, format).map_err(|e| {
                log::error!("stream {stream}: failed to open {format:?} stream: {e}");
                e
            })?;

            let opened = OpenedStream {
                stream,
                stream_buffer: ctx.stream_buffer.descriptor(),
                user_data: ctx.user_data.phys_addr(),
            };
            log::debug!("stream {stream}: opened {format:?} ({})", params.fourcc);

            *guard = Some(ctx);
            return Ok(opened);
        }

        log::warn!("no free stream context for {:?}", file);
        Err(VdecError::NoFreeContext)
    }

    /// Stops the stream if needed and frees its slot, unmapping all its memory.
    pub fn close(&self, stream: usize) -> Result<(), VdecError> {
        let slot = self.slot(stream)?;

        let running = {
            let mut guard = lock(&slot.ctx);
            let ctx = context(&mut guard, stream)?;
            ctx.state != SessionState::Stopped && ctx.fatal.is_none()
        };
        if running {
            match self.stop(stream, true) {
                Ok(()) | Err(VdecError::InvalidStream(_)) => (),
                Err(e) => log::warn!("stream {stream}: closing without clean stop: {e}"),
            }
        }

        let mut guard = lock(&slot.ctx);
        if guard.take().is_none() {
            return Err(VdecError::InvalidStream(stream));
        }
        slot.cond.notify_all();

        log::debug!("stream {stream}: closed");
        Ok(())
    }

    /// Copies bitstream into the stream buffer. Returns the number of bytes written, which is
    /// less than `data.remaining()` if the ring is full.
    pub fn write_bitstream<B: Buf>(&self, stream: usize, data: &mut B) -> Result<usize, VdecError> {
        let slot = self.slot(stream)?;
        let mut guard = lock(&slot.ctx);
        let ctx = context(&mut guard, stream)?;

        Ok(ctx.stream_buffer.write(data))
    }

    fn update_write_pointer(
        &self,
        stream: usize,
        ctx: &mut StreamContext,
        wptr: Option<u64>,
    ) -> Result<(), VdecError> {
        if let Some(wptr) = wptr {
            ctx.stream_buffer.set_wptr(wptr)?;
        }

        let wptr = ctx.stream_buffer.wptr();
        if wptr == ctx.fw_wptr {
            return Ok(());
        }

        ctx.stream_buffer
            .flush(&*self.allocator, ctx.fw_wptr, wptr);
        let word = addr_word(wptr).map_err(VdecError::Fatal)?;
        self.send_command(stream, VpuCommand::UpdateEsWrPtr, &[word])?;
        ctx.fw_wptr = wptr;

        if ctx.abort == AbortState::Done {
            ctx.abort = AbortState::Init;
        }

        Ok(())
    }

    fn start_stream(&self, stream: usize, ctx: &mut StreamContext) -> Result<(), VdecError> {
        let start = addr_word(ctx.stream_buffer.start()).map_err(VdecError::Fatal)?;
        let size = ctx.stream_buffer.size() as u32;

        ctx.state = SessionState::Starting;
        if let Err(e) =
            self.send_command(stream, VpuCommand::Start, &[ctx.format as u32, start, size])
        {
            ctx.state = SessionState::Stopped;
            return Err(e.into());
        }

        log::debug!("stream {stream}: starting");
        Ok(())
    }

    /// Feeds the firmware the bitstream written so far and retrieves the next output frame, if
    /// any.
    pub fn decode(&self, stream: usize, params: &DecodeParams) -> Result<DecodeOutput, VdecError> {
        let slot = self.slot(stream)?;
        let mut guard = lock(&slot.ctx);
        let ctx = context(&mut guard, stream)?;

        self.update_write_pointer(stream, ctx, params.wptr)?;
        if ctx.state == SessionState::Stopped
            && ctx.fatal.is_none()
            && ctx.abort != AbortState::Pending
            && ctx.stream_buffer.level() > 0
        {
            self.start_stream(stream, ctx)?;
        }

        let deadline = params.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let ctx = context(&mut guard, stream)?;

            if let Some(err) = &ctx.fatal {
                return Err(VdecError::Fatal(err.clone()));
            }

            let state = ctx.state;
            if matches!(state, SessionState::Stopped | SessionState::Stopping)
                || ctx.abort == AbortState::Pending
            {
                return Ok(DecodeOutput::NoOutput);
            }

            if state == SessionState::Starting {
                let (g, timed_out) = wait_while(slot, guard, Some(START_TIMEOUT), |c| {
                    c.state == SessionState::Starting && c.fatal.is_none()
                });
                guard = g;
                if timed_out {
                    log::debug!("stream {stream}: START not acknowledged yet");
                    return Ok(DecodeOutput::NoOutput);
                }
                continue;
            }

            let more_input_expected = !params.eos && !ctx.eos;
            let counters = &ctx.counters;

            if params.reorder
                && more_input_expected
                && counters.parsed.saturating_sub(counters.displayed) < params.frame_depth
            {
                return Ok(DecodeOutput::LowInputFrames);
            }

            if params.trick_mode && params.eos && !ctx.finished {
                guard = self.wait_firmware(slot, guard, "FINISHED", |c| {
                    !c.finished
                        && c.fatal.is_none()
                        && c.state == SessionState::Started
                        && c.abort != AbortState::Pending
                })?;
                continue;
            }

            if let Some(index) = ctx.fbl.pop_ready_ofb() {
                ctx.counters.displayed += 1;
                log::trace!("stream {stream}: output frame {index}");
                return Ok(DecodeOutput::Frame(index));
            }

            let counters = &ctx.counters;
            if !params.reorder
                && more_input_expected
                && counters.decoded.saturating_sub(counters.displayed) < params.frame_depth
            {
                return Ok(DecodeOutput::LowInputFrames);
            }

            if ctx.fbl.num_free_ofbs() == 0 && ctx.fbl.num_client_held_ofbs() > 0 {
                return Ok(DecodeOutput::LowOutputBuffers);
            }

            if ctx.eos {
                ctx.eos = false;
                return Ok(DecodeOutput::EndOfStream);
            }

            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now < deadline {
                    let seen = ctx.wakeups;
                    let (g, _) =
                        wait_while(slot, guard, Some(deadline - now), |c| c.wakeups == seen);
                    guard = g;
                    continue;
                }
            }

            return Ok(DecodeOutput::NoOutput);
        }
    }

    /// Stops decoding. Queued frames go back to their pools and pending buffer requests are
    /// dropped. If `block` is set, waits for the firmware to confirm.
    pub fn stop(&self, stream: usize, block: bool) -> Result<(), VdecError> {
        let slot = self.slot(stream)?;
        let mut guard = lock(&slot.ctx);

        let state = context(&mut guard, stream)?.state;
        match state {
            SessionState::Stopped => return Ok(()),
            SessionState::Starting => {
                guard = self.wait_firmware(slot, guard, "START_DONE", |c| {
                    c.state == SessionState::Starting && c.fatal.is_none()
                })?;
            }
            _ => (),
        }

        let ctx = context(&mut guard, stream)?;
        match ctx.state {
            SessionState::Stopped => return Ok(()),
            SessionState::Stopping => (),
            _ => {
                ctx.state = SessionState::Stopping;
                ctx.fbl.drain_queues();
                ctx.discard_blit();
                ctx.fbl.stop();
                let _ = ctx.fbl.take_signal();
                ctx.wakeups += 1;
                slot.cond.notify_all();

                self.send_command(stream, VpuCommand::Stop, &[])?;
                log::debug!("stream {stream}: stopping");
            }
        }

        if block {
            self.wait_firmware(slot, guard, "STOPPED", |c| {
                c.state != SessionState::Stopped && c.fatal.is_none()
            })?;
        }

        Ok(())
    }

    /// Discards everything queued in the decoder, e.g. to seek. `padding` is the number of
    /// padding bytes the firmware must append to the bitstream. Blocks until the firmware
    /// confirms the abort.
    pub fn flush(&self, stream: usize, padding: u32) -> Result<(), VdecError> {
        let slot = self.slot(stream)?;
        let mut guard = lock(&slot.ctx);

        let ctx = context(&mut guard, stream)?;
        if matches!(ctx.state, SessionState::Stopped | SessionState::Stopping)
            || ctx.abort != AbortState::Init
        {
            return Ok(());
        }

        if ctx.state == SessionState::Starting {
            guard = self.wait_firmware(slot, guard, "START_DONE", |c| {
                c.state == SessionState::Starting && c.fatal.is_none()
            })?;
        }

        let ctx = context(&mut guard, stream)?;
        if ctx.state != SessionState::Started || ctx.fatal.is_some() {
            return Ok(());
        }

        ctx.fbl.drain_queues();
        ctx.discard_blit();
        ctx.abort = AbortState::Pending;
        if let Err(e) = self.send_command(stream, VpuCommand::Abort, &[padding]) {
            ctx.abort = AbortState::Init;
            return Err(e.into());
        }
        log::debug!("stream {stream}: aborting with {padding} bytes of padding");

        self.wait_firmware(slot, guard, "ABORT_DONE", |c| {
            c.abort == AbortState::Pending && c.fatal.is_none() && c.state != SessionState::Stopped
        })?;

        Ok(())
    }

    pub fn status(&self, stream: usize) -> Result<StreamStatus, VdecError> {
        let slot = self.slot(stream)?;
        let mut guard = lock(&slot.ctx);
        let ctx = context(&mut guard, stream)?;

        Ok(StreamStatus {
            format: ctx.format,
            state: ctx.state,
            abort: ctx.abort,
            sequence: ctx.seq,
            counters: ctx.counters.clone(),
            fatal: ctx.fatal.clone(),
            finished: ctx.finished,
            stream_buffer: ctx.stream_buffer.descriptor(),
            fbl: ctx.fbl.stats(),
            mu_overflows: self.transport.overflow_count(),
        })
    }

    /// Gives an output frame obtained from `decode` back to the decoder.
    pub fn clear_output(&self, stream: usize, index: usize) -> Result<(), VdecError> {
        let slot = self.slot(stream)?;
        let mut guard = lock(&slot.ctx);
        let ctx = context(&mut guard, stream)?;

        if index >= ctx.fbl.ofb_capacity() {
            return Err(VdecError::RangeNotFound(index));
        }

        if ctx.fbl.ofb(index).is_some_and(|ofb| ofb.is_held_by_client()) {
            ctx.fbl.release_ofb(index);
        } else {
            log::warn!("stream {stream}: ofb {index} is not held by the client");
        }

        // A ready vfb may have been waiting for this ofb.
        self.t2l_frame(stream, ctx);

        if ctx.fbl.take_signal() {
            ctx.wakeups += 1;
            slot.cond.notify_all();
        }

        Ok(())
    }

    pub fn get_output(&self, stream: usize, index: usize) -> Result<OutputFrameInfo, VdecError> {
        let slot = self.slot(stream)?;
        let mut guard = lock(&slot.ctx);
        let ctx = context(&mut guard, stream)?;

        let ofb = ctx.fbl.ofb(index).ok_or(VdecError::RangeNotFound(index))?;
        Ok(OutputFrameInfo {
            index,
            phys_addr: ofb.buffer().phys_addr(),
            size: ofb.buffer().size(),
            width: ofb.width(),
            height: ofb.height(),
            stride: ofb.stride(),
        })
    }

    /// Message unit interrupt handler.
    pub fn mu_isr(&self) -> bool {
        self.transport.isr()
    }

    /// Deferred part of the message unit interrupt: dispatches every pending firmware event.
    pub fn mu_dpc(&self) {
        self.transport.dpc(&mut |msg| self.handle_event(msg));
    }

    /// Signalled whenever [`mu_dpc`](Self::mu_dpc) has work to do.
    pub fn dpc_event(&self) -> &EventFd {
        self.transport.dpc_event()
    }
}
