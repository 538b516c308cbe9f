// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tile-to-linear blit handoff.
//!
//! Decoded pictures are stored by the VPU in a tiled layout. Before the client can use them they
//! are converted by an external blitter into linear output frames. This module pairs the oldest
//! ready vfb with a free ofb, hands both to the [`Blitter`] and, on completion, queues the ofb for
//! the client. At most one blit per stream is in flight; the blitter being busy is the
//! backpressure between decoding and display.

use crate::decoder::addr_word;
use crate::decoder::AbortState;
use crate::decoder::FatalError;
use crate::decoder::SessionState;
use crate::decoder::StreamContext;
use crate::decoder::VpuDevice;
use crate::Resolution;

/// One tile-to-linear conversion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlitRequest {
    pub vfb: usize,
    pub ofb: usize,
    pub luma_addr: u32,
    pub chroma_addr: u32,
    /// Dimensions of the tiled source planes.
    pub tiled: Resolution,
    /// Visible area to convert.
    pub resolution: Resolution,
    pub dst_addr: u32,
    pub dst_stride: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlitStatus {
    Accepted,
    /// The request was refused and must be retried later.
    Busy,
}

/// The external tile-to-linear engine.
///
/// Completion of an accepted request is reported by calling [`VpuDevice::blit_complete`].
pub trait Blitter: Send + Sync {
    /// Whether the blitter can take a new request for `stream`.
    fn is_idle(&self, stream: usize) -> bool;

    fn start_blit(&self, stream: usize, request: &BlitRequest) -> BlitStatus;

    /// Polls the hardware completion status of the request in flight for `stream`.
    fn completed(&self, stream: usize) -> bool;

    /// Clears the completion status of `stream` without waiting for the interrupt.
    fn acknowledge(&self, stream: usize);
}

/// The pair of buffers a started blit reads from and writes to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct InFlightBlit {
    pub(crate) vfb: usize,
    pub(crate) ofb: usize,
    /// The picture predates a flush or a stop. Its output is dropped on completion.
    pub(crate) discard: bool,
}

fn blit_request(ctx: &StreamContext, vfb: usize, ofb: usize) -> Result<BlitRequest, FatalError> {
    let (luma, chroma) = ctx
        .fbl
        .vfb(vfb)
        .map(|frame| (frame.luma().phys_addr(), frame.chroma().phys_addr()))
        .unwrap_or_default();
    let dst = ctx.fbl.ofb(ofb).map(|frame| frame.buffer().phys_addr()).unwrap_or_default();

    Ok(BlitRequest {
        vfb,
        ofb,
        luma_addr: addr_word(luma)?,
        chroma_addr: addr_word(chroma)?,
        tiled: ctx.geometry.tiled,
        resolution: ctx.geometry.resolution,
        dst_addr: addr_word(dst)?,
        dst_stride: ctx.geometry.out_stride,
    })
}

impl VpuDevice {
    /// Blit completion callback for `stream`.
    pub fn blit_complete(&self, stream: usize) {
        self.with_stream(stream, |ctx| {
            self.t2l_frame_done(stream, ctx);
            true
        });
    }

    /// Starts converting the oldest ready vfb if the blitter is idle and an ofb is available.
    pub(crate) fn t2l_frame(&self, stream: usize, ctx: &mut StreamContext) {
        if ctx.blit.is_some() {
            if self.blitter.completed(stream) {
                log::warn!("stream {stream}: blit completed without interrupt");
                self.blitter.acknowledge(stream);
                self.t2l_frame_done(stream, ctx);
            }
            return;
        }

        if ctx.fbl.num_ready_vfbs() == 0 || !self.blitter.is_idle(stream) {
            return;
        }

        let ofb = if ctx.fbl.ofb_pending() > 0 {
            ctx.fbl.take_pending_ofb()
        } else {
            ctx.fbl.acquire_ofb(ctx.abort == AbortState::Pending)
        };
        let Some(ofb) = ofb else {
            log::trace!("stream {stream}: no ofb for the next blit");
            return;
        };

        let Some(vfb) = ctx.fbl.pop_ready_vfb() else {
            ctx.fbl.release_ofb(ofb);
            return;
        };

        let request = match blit_request(ctx, vfb, ofb) {
            Ok(request) => request,
            Err(e) => {
                ctx.fbl.requeue_vfb(vfb);
                ctx.fbl.release_ofb(ofb);
                ctx.fail(stream, e);
                return;
            }
        };

        ctx.fbl.begin_blit(vfb);
        match self.blitter.start_blit(stream, &request) {
            BlitStatus::Accepted => {
                log::trace!("stream {stream}: blitting vfb {vfb} into ofb {ofb}");
                ctx.blit = Some(InFlightBlit {
                    vfb,
                    ofb,
                    discard: false,
                });
            }
            BlitStatus::Busy => {
                log::debug!("stream {stream}: blitter refused vfb {vfb}");
                ctx.fbl.requeue_vfb(vfb);
                ctx.fbl.release_ofb(ofb);
            }
        }
    }

    /// Completes the blit in flight: gives the vfb back, queues the ofb for the client and
    /// retries whatever was waiting on either buffer.
    pub(crate) fn t2l_frame_done(&self, stream: usize, ctx: &mut StreamContext) {
        let Some(InFlightBlit { vfb, ofb, discard }) = ctx.blit.take() else {
            log::debug!("stream {stream}: spurious blit completion");
            return;
        };

        ctx.fbl.finish_blit(vfb);

        let discard = discard
            || matches!(ctx.state, SessionState::Stopping | SessionState::Stopped)
            || ctx.abort == AbortState::Pending;
        if discard {
            log::debug!("stream {stream}: discarding blitted ofb {ofb}");
            ctx.fbl.release_ofb(ofb);
        } else if !ctx.fbl.push_ready_ofb(ofb) {
            ctx.fbl.release_ofb(ofb);
        }

        self.serve_pending_vfb(stream, ctx);
        self.t2l_frame(stream, ctx);
    }
}
