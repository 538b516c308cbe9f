// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Firmware event handling.
//!
//! Events reach [`VpuDevice::handle_event`] from the message unit DPC, one at a time and in the
//! order the firmware posted them. Each event is applied to its stream under the stream lock.
//! Events for unknown or closed streams, and unknown event identifiers, are dropped.

use crate::decoder::addr_word;
use crate::decoder::AbortState;
use crate::decoder::FatalError;
use crate::decoder::ScratchPool;
use crate::decoder::SequenceInfo;
use crate::decoder::SessionState;
use crate::decoder::StreamContext;
use crate::decoder::VpuDevice;
use crate::fbl::FrameStatus;
use crate::rpc::FrameRequestKind;
use crate::rpc::RpcMessage;
use crate::rpc::VpuCommand;
use crate::rpc::VpuEvent;
use crate::FrameGeometry;

impl VpuDevice {
    pub fn handle_event(&self, msg: RpcMessage) {
        let Some(event) = VpuEvent::n(msg.id) else {
            log::debug!("stream {}: ignoring unknown event {:#x}", msg.stream, msg.id);
            return;
        };

        let stream = msg.stream;
        let payload = msg.payload.as_slice();
        log::trace!("stream {stream}: {event:?} {payload:x?}");

        self.with_stream(stream, |ctx| match event {
            VpuEvent::StartDone => {
                if ctx.state == SessionState::Starting {
                    ctx.state = SessionState::Started;
                    log::debug!("stream {stream}: started");
                }
                true
            }
            VpuEvent::Stopped => on_stopped(stream, ctx),
            VpuEvent::SeqHdrFound => self.on_sequence_header(stream, ctx, payload),
            VpuEvent::PicHdrFound => {
                ctx.counters.parsed += 1;
                false
            }
            VpuEvent::PicDecoded => on_picture_decoded(stream, ctx, payload),
            VpuEvent::ReqFrameBuff => {
                self.on_frame_request(stream, ctx, payload);
                false
            }
            VpuEvent::RelFrameBuff => {
                self.on_frame_release(stream, ctx, payload);
                false
            }
            VpuEvent::FrameBuffRdy => {
                self.on_frame_ready(stream, ctx, payload);
                true
            }
            VpuEvent::AbortDone => on_abort_done(stream, ctx),
            VpuEvent::StrBufRst => {
                ctx.fbl.clear();
                on_abort_done(stream, ctx)
            }
            VpuEvent::Finished => {
                log::debug!("stream {stream}: finished");
                ctx.finished = true;
                ctx.eos = true;
                true
            }
            VpuEvent::FirmwareXcpt => {
                let code = payload.first().copied().unwrap_or(0);
                log::error!("stream {stream}: frame buffers at exception: {:#?}", ctx.fbl);
                ctx.fail(stream, FatalError::FirmwareException(code))
            }
            VpuEvent::ResChange => ctx.fail(stream, FatalError::ResolutionChange),
            VpuEvent::ResetDone => {
                log::debug!("stream {stream}: firmware reset done");
                false
            }
        });
    }

    fn on_sequence_header(
        &self,
        stream: usize,
        ctx: &mut StreamContext,
        payload: &[u32],
    ) -> bool {
        if ctx.seq.is_some() {
            log::debug!("stream {stream}: ignoring repeated sequence header");
            return false;
        }

        let seq = match SequenceInfo::parse(payload) {
            Ok(seq) => seq,
            Err(e) => return ctx.fail(stream, e),
        };
        log::debug!("stream {stream}: sequence {seq:?}");

        if seq.resolution.is_empty() {
            return ctx.fail(stream, FatalError::ZeroResolution);
        }
        if seq.max_bit_depth() > 8 && !self.config().allow_10bit {
            return ctx.fail(stream, FatalError::UnsupportedBitDepth(seq.max_bit_depth()));
        }
        if !self.config().max_resolution.can_contain(seq.resolution) {
            return ctx.fail(stream, FatalError::ResolutionTooLarge(seq.resolution));
        }

        let required = seq.required_frames();
        if required > ctx.fbl.vfb_capacity() {
            log::warn!(
                "stream {stream}: sequence needs {required} frame buffers, only {} mapped",
                ctx.fbl.vfb_capacity()
            );
        }

        let Some(geometry) = FrameGeometry::new(seq.resolution) else {
            return ctx.fail(stream, FatalError::ResolutionTooLarge(seq.resolution));
        };
        ctx.fbl.set_output_geometry(
            geometry.resolution.width,
            geometry.resolution.height,
            geometry.out_stride,
        );
        ctx.fbl.start(required);
        ctx.geometry = geometry;
        ctx.seq = Some(seq);

        true
    }

    fn on_frame_request(&self, stream: usize, ctx: &mut StreamContext, payload: &[u32]) {
        let kind = payload.first().copied().and_then(FrameRequestKind::n);
        match kind {
            Some(FrameRequestKind::Frame) => {
                match ctx.fbl.acquire_vfb(ctx.abort == AbortState::Pending) {
                    Some(index) => self.grant_vfb(stream, ctx, index),
                    None => log::debug!("stream {stream}: frame buffer request deferred"),
                }
            }
            Some(kind @ FrameRequestKind::Mbi) => self.grant_scratch(stream, kind, &mut ctx.mbi),
            Some(kind @ FrameRequestKind::Dcp) => self.grant_scratch(stream, kind, &mut ctx.dcp),
            None => log::warn!("stream {stream}: unknown frame buffer request {payload:x?}"),
        }
    }

    /// Hands vfb `index` to the firmware as a decode target.
    fn grant_vfb(&self, stream: usize, ctx: &mut StreamContext, index: usize) {
        let Some(vfb) = ctx.fbl.vfb(index) else {
            return;
        };

        let addrs = addr_word(vfb.luma().phys_addr())
            .and_then(|luma| Ok((luma, addr_word(vfb.chroma().phys_addr())?)));
        let (luma, chroma) = match addrs {
            Ok(addrs) => addrs,
            Err(e) => {
                ctx.fbl.release_vfb(index);
                ctx.fail(stream, e);
                return;
            }
        };

        ctx.fbl.set_vfb_status(index, FrameStatus::Free);
        log::trace!("stream {stream}: granting vfb {index}");

        let data = [FrameRequestKind::Frame as u32, index as u32, luma, chroma];
        if let Err(e) = self.send_command(stream, VpuCommand::FsAlloc, &data) {
            log::error!("{e:#}");
        }
    }

    fn grant_scratch(&self, stream: usize, kind: FrameRequestKind, pool: &mut ScratchPool) {
        let Some((index, buffer)) = pool.next() else {
            log::warn!("stream {stream}: {kind:?} buffer requested but none mapped");
            return;
        };

        let addr = match addr_word(buffer.phys_addr()) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("stream {stream}: {e}");
                return;
            }
        };

        let data = [kind as u32, index as u32, addr, buffer.size() as u32];
        if let Err(e) = self.send_command(stream, VpuCommand::FsAlloc, &data) {
            log::error!("{e:#}");
        }
    }

    /// Replays the frame buffer requests that found the pool empty.
    pub(crate) fn serve_pending_vfb(&self, stream: usize, ctx: &mut StreamContext) {
        while let Some(index) = ctx.fbl.take_pending_vfb() {
            log::debug!("stream {stream}: serving deferred request with vfb {index}");
            self.grant_vfb(stream, ctx, index);
        }
    }

    fn on_frame_release(&self, stream: usize, ctx: &mut StreamContext, payload: &[u32]) {
        let Some(index) = payload.first().map(|&i| i as usize) else {
            log::warn!("stream {stream}: frame release without index");
            return;
        };
        if index >= ctx.fbl.vfb_capacity() {
            log::warn!("stream {stream}: release of unknown vfb {index}");
            return;
        }

        ctx.fbl.set_vfb_status(index, FrameStatus::Release);
        ctx.counters.released += 1;

        if let Err(e) = self.send_command(stream, VpuCommand::FsRelease, &[index as u32]) {
            log::error!("{e:#}");
        }

        self.serve_pending_vfb(stream, ctx);
    }

    fn on_frame_ready(&self, stream: usize, ctx: &mut StreamContext, payload: &[u32]) {
        let Some(index) = find_vfb(stream, ctx, payload) else {
            return;
        };

        if ctx.fbl.vfb(index).map(|vfb| vfb.status()) == Some(FrameStatus::Free) {
            ctx.fbl.set_vfb_status(index, FrameStatus::Decoded);
        }

        if ctx.fbl.push_ready_vfb(index) {
            ctx.fbl.set_vfb_status(index, FrameStatus::Ready);
            ctx.counters.ready += 1;
        }

        self.t2l_frame(stream, ctx);
    }
}

/// Looks up the vfb whose luma address is the first word of `payload`.
fn find_vfb(stream: usize, ctx: &StreamContext, payload: &[u32]) -> Option<usize> {
    let Some(&addr) = payload.first() else {
        log::warn!("stream {stream}: missing frame address");
        return None;
    };

    let index = ctx.fbl.find_by_addr(u64::from(addr));
    if index.is_none() {
        log::warn!("stream {stream}: no vfb at {addr:#x}");
    }
    index
}

/// The firmware decoded a picture. The optional second word is the new bitstream read pointer.
fn on_picture_decoded(stream: usize, ctx: &mut StreamContext, payload: &[u32]) -> bool {
    if let Some(&rptr) = payload.get(1) {
        ctx.stream_buffer.set_rptr(u64::from(rptr));
    }

    let Some(index) = find_vfb(stream, ctx, payload) else {
        return false;
    };

    if ctx.fbl.set_vfb_status(index, FrameStatus::Decoded) {
        ctx.counters.decoded += 1;
    }
    true
}

fn on_stopped(stream: usize, ctx: &mut StreamContext) -> bool {
    log::debug!("stream {stream}: stopped");

    ctx.state = SessionState::Stopped;
    ctx.abort = AbortState::Init;
    ctx.counters = Default::default();
    ctx.seq = None;
    ctx.eos = false;
    ctx.finished = false;
    // The firmware does not release every buffer it holds when stopping.
    ctx.fbl.clear();
    ctx.discard_blit();

    true
}

fn on_abort_done(stream: usize, ctx: &mut StreamContext) -> bool {
    log::debug!("stream {stream}: abort done");

    ctx.stream_buffer.realign();
    ctx.fw_wptr = ctx.stream_buffer.wptr();
    ctx.fbl.drain_queues();
    ctx.discard_blit();
    ctx.abort = AbortState::Done;

    true
}

#[cfg(test)]
mod tests {
    use crate::backend::dummy::DummyHarness;
    use crate::config::VpuConfig;
    use crate::decoder::tests::configure;
    use crate::decoder::tests::decode_picture;
    use crate::decoder::tests::harness;
    use crate::decoder::tests::started_stream;
    use crate::decoder::tests::test_config;
    use crate::decoder::*;
    use crate::rpc::FrameRequestKind;
    use crate::rpc::VpuCommand;
    use crate::rpc::VpuEvent;
    use crate::CodecFormat;
    use crate::Fourcc;
    use crate::Resolution;

    fn fs_allocs(h: &DummyHarness) -> Vec<Vec<u32>> {
        h.firmware
            .drain_commands()
            .into_iter()
            .filter(|c| c.id == VpuCommand::FsAlloc as u16)
            .map(|c| c.payload)
            .collect()
    }

    #[test]
    fn sequence_header_starts_frame_buffer_list() {
        let h = harness();
        let stream = started_stream(&h);

        h.post(stream, VpuEvent::SeqHdrFound, &[320, 240, 5, 3])
            .unwrap();
        let status = h.device.status(stream).unwrap();
        let seq = status.sequence.unwrap();
        assert_eq!(seq.required_frames(), 11);
        assert_eq!(status.fbl.vfb_active, 11);
        assert_eq!(status.fbl.vfb_capacity, 22);

        // Only the first header counts.
        h.post(stream, VpuEvent::SeqHdrFound, &[160, 120, 10, 10])
            .unwrap();
        assert_eq!(h.device.status(stream).unwrap().sequence, Some(seq));
    }

    #[test]
    fn required_frames_are_capped() {
        let seq = SequenceInfo::parse(&[64, 64, 30, 16]).unwrap();
        assert_eq!(seq.required_frames(), MAX_REQUIRED_FRAMES);
        assert_eq!(
            SequenceInfo::parse(&[64, 64]),
            Err(FatalError::MalformedSequence(2))
        );
    }

    #[test]
    fn invalid_sequences_are_fatal() {
        let cases: [(&[u32], FatalError); 3] = [
            (&[0, 240, 2, 1], FatalError::ZeroResolution),
            (
                &[1920, 1080, 2, 1],
                FatalError::ResolutionTooLarge(Resolution::from((1920, 1080))),
            ),
            (&[320, 240, 2, 1, 10, 10], FatalError::UnsupportedBitDepth(10)),
        ];

        for (payload, expected) in cases {
            let h = harness();
            let stream = started_stream(&h);
            h.post(stream, VpuEvent::SeqHdrFound, payload).unwrap();

            match h.device.decode(stream, &Default::default()) {
                Err(VdecError::Fatal(err)) => assert_eq!(err, expected),
                other => panic!("unexpected decode result {other:?}"),
            }
            // Not auto-closed.
            assert!(h.device.status(stream).is_ok());
        }
    }

    #[test]
    fn ten_bit_allowed_by_config() {
        let _ = env_logger::try_init();
        let config = VpuConfig {
            allow_10bit: true,
            ..test_config()
        };
        let h = DummyHarness::new(config).unwrap();
        let stream = started_stream(&h);

        h.post(stream, VpuEvent::SeqHdrFound, &[320, 240, 2, 1, 10, 10])
            .unwrap();
        let status = h.device.status(stream).unwrap();
        assert_eq!(status.fatal, None);
        assert_eq!(status.sequence.unwrap().max_bit_depth(), 10);
    }

    #[test]
    fn frame_request_grants_vfb() {
        let h = harness();
        let stream = started_stream(&h);
        h.post(stream, VpuEvent::SeqHdrFound, &[320, 240, 2, 1])
            .unwrap();
        h.firmware.drain_commands();

        h.post(stream, VpuEvent::ReqFrameBuff, &[0]).unwrap();
        let allocs = fs_allocs(&h);
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0][0], FrameRequestKind::Frame as u32);
        assert_eq!(allocs[0][1], 0);

        let status = h.device.status(stream).unwrap();
        assert_eq!(status.fbl.vfb_free, 21);
    }

    #[test]
    fn frame_request_miss_is_served_on_release() {
        let h = harness();
        let stream = started_stream(&h);
        // 1 + 0 + 3 frames.
        h.post(stream, VpuEvent::SeqHdrFound, &[320, 240, 1, 0])
            .unwrap();
        for _ in 0..5 {
            h.post(stream, VpuEvent::ReqFrameBuff, &[0]).unwrap();
        }
        assert_eq!(fs_allocs(&h).len(), 4);
        assert_eq!(h.device.status(stream).unwrap().fbl.vfb_pending, 1);

        // Released before display: goes straight back to the pool and to the firmware.
        h.post(stream, VpuEvent::RelFrameBuff, &[2]).unwrap();
        let commands = h.firmware.history();
        let release = commands
            .iter()
            .rev()
            .find(|c| c.id == VpuCommand::FsRelease as u16)
            .unwrap();
        assert_eq!(release.payload, vec![2]);

        let allocs: Vec<_> = commands
            .iter()
            .filter(|c| c.id == VpuCommand::FsAlloc as u16)
            .collect();
        assert_eq!(allocs.len(), 5);
        assert_eq!(allocs[4].payload[1], 2);

        let status = h.device.status(stream).unwrap();
        assert_eq!(status.fbl.vfb_pending, 0);
        assert_eq!(status.counters.released, 1);
    }

    #[test]
    fn scratch_requests_rotate() {
        let h = harness();
        let stream = started_stream(&h);

        for _ in 0..3 {
            h.post(stream, VpuEvent::ReqFrameBuff, &[FrameRequestKind::Mbi as u32])
                .unwrap();
        }
        let allocs = fs_allocs(&h);
        let indices: Vec<_> = allocs.iter().map(|a| a[1]).collect();
        assert_eq!(indices, vec![0, 1, 0]);
        assert!(allocs
            .iter()
            .all(|a| a[0] == FrameRequestKind::Mbi as u32));
        assert_ne!(allocs[0][2], allocs[1][2]);

        // H.264 has no DCP buffers.
        h.post(stream, VpuEvent::ReqFrameBuff, &[FrameRequestKind::Dcp as u32])
            .unwrap();
        assert!(fs_allocs(&h).is_empty());
    }

    #[test]
    fn hevc_gets_dcp_buffers() {
        let h = harness();
        let params = InitParams {
            fourcc: Fourcc::from(b"HEVC"),
        };
        let stream = h.device.open(FileId(7), &params).unwrap().stream;
        assert_eq!(h.device.status(stream).unwrap().format, CodecFormat::Hevc);

        h.post(stream, VpuEvent::ReqFrameBuff, &[FrameRequestKind::Dcp as u32])
            .unwrap();
        let allocs = fs_allocs(&h);
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0][0], FrameRequestKind::Dcp as u32);
    }

    #[test]
    fn picture_decoded_marks_vfb_and_moves_read_pointer() {
        let h = harness();
        let stream = started_stream(&h);
        configure(&h, stream, 1);

        let frame = h.firmware.take_granted(stream).unwrap();
        let start = h.device.status(stream).unwrap().stream_buffer.start;
        h.post(stream, VpuEvent::PicDecoded, &[frame.luma, start as u32 + 32])
            .unwrap();

        let status = h.device.status(stream).unwrap();
        assert_eq!(status.counters.decoded, 1);
        assert_eq!(status.stream_buffer.rptr, start + 32);

        // Unknown address: ignored.
        h.post(stream, VpuEvent::PicDecoded, &[0x1234]).unwrap();
        assert_eq!(h.device.status(stream).unwrap().counters.decoded, 1);
    }

    #[test]
    fn frame_ready_without_picture_decoded() {
        let h = harness();
        let stream = started_stream(&h);
        configure(&h, stream, 1);
        h.blitter.set_busy(true);

        let frame = h.firmware.take_granted(stream).unwrap();
        h.post(stream, VpuEvent::FrameBuffRdy, &[frame.luma])
            .unwrap();

        let status = h.device.status(stream).unwrap();
        assert_eq!(status.fbl.vfb_queued, 1);
        assert_eq!(status.counters.ready, 1);
    }

    #[test]
    fn firmware_exception_is_fatal_for_the_stream() {
        let h = harness();
        let stream = started_stream(&h);
        configure(&h, stream, 2);
        decode_picture(&h, stream);

        h.post(stream, VpuEvent::FirmwareXcpt, &[0x42]).unwrap();
        assert!(matches!(
            h.device.decode(stream, &Default::default()),
            Err(VdecError::Fatal(FatalError::FirmwareException(0x42)))
        ));
        // Still fatal on the next call.
        assert!(matches!(
            h.device.decode(stream, &Default::default()),
            Err(VdecError::Fatal(_))
        ));
    }

    #[test]
    fn resolution_change_is_fatal() {
        let h = harness();
        let stream = started_stream(&h);
        h.post(stream, VpuEvent::ResChange, &[]).unwrap();
        assert_eq!(
            h.device.status(stream).unwrap().fatal,
            Some(FatalError::ResolutionChange)
        );
    }

    #[test]
    fn stream_buffer_reset_clears_frame_buffers() {
        let h = harness();
        let stream = started_stream(&h);
        configure(&h, stream, 4);
        assert_eq!(h.device.status(stream).unwrap().fbl.vfb_free, 18);

        h.post(stream, VpuEvent::StrBufRst, &[]).unwrap();
        let status = h.device.status(stream).unwrap();
        assert_eq!(status.fbl.vfb_free, 22);
        assert_eq!(status.abort, AbortState::Done);
        assert_eq!(status.stream_buffer.wptr, status.stream_buffer.start);
    }

    #[test]
    fn events_for_closed_streams_are_dropped() {
        let h = harness();
        h.post(1, VpuEvent::StartDone, &[]).unwrap();
        h.post(9, VpuEvent::StartDone, &[]).unwrap();
        h.firmware.post_raw(0, 0x7f, &[1, 2, 3]).unwrap();
        h.pump();
        assert_eq!(h.device.stream_for_file(FileId(1)), None);
    }

    #[test]
    fn stopped_forces_release() {
        let h = harness();
        let stream = started_stream(&h);
        configure(&h, stream, 3);
        decode_picture(&h, stream);
        h.finish_blit(stream).unwrap();

        h.post(stream, VpuEvent::Stopped, &[]).unwrap();
        let status = h.device.status(stream).unwrap();
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.fbl.vfb_free, 22);

        // The next sequence hands out the pool from the start again.
        h.post(stream, VpuEvent::SeqHdrFound, &[320, 240, 1, 1])
            .unwrap();
        h.post(stream, VpuEvent::ReqFrameBuff, &[0]).unwrap();
        let allocs = fs_allocs(&h);
        assert_eq!(allocs.last().unwrap()[1], 0);
    }
}
