// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scripted collaborators whose only purpose is to let the decoder core run so we can test it
//! in isolation.
//!
//! [`DummyFirmware`] plays the firmware end of the RPC rings, [`DummyMailbox`] the message unit
//! and [`DummyBlitter`] the tile-to-linear engine. Nothing happens on its own: tests post events
//! and complete blits explicitly, then call [`DummyHarness::pump`] to run the interrupt path.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::config::VpuConfig;
use crate::decoder::VpuDevice;
use crate::memory::HostAllocator;
use crate::mu::MessageUnit;
use crate::mu::MuBusy;
use crate::mu::MuError;
use crate::rpc::FirmwareRpc;
use crate::rpc::FrameRequestKind;
use crate::rpc::RpcError;
use crate::rpc::RpcMessage;
use crate::rpc::SharedMemoryRpc;
use crate::rpc::VpuCommand;
use crate::rpc::VpuEvent;
use crate::rpc::DEFAULT_RING_WORDS;
use crate::t2l::BlitRequest;
use crate::t2l::BlitStatus;
use crate::t2l::Blitter;
use crate::utils::lock;

/// Mailbox word used to announce posted events.
const EVENT_DOORBELL: u32 = 1;

#[derive(Debug, Default)]
struct MailboxState {
    /// Words posted by the firmware, not read yet.
    rx: VecDeque<u32>,
    /// Words sent by the host.
    sent: Vec<u32>,
    /// Number of upcoming sends to reject as busy.
    busy_polls: u32,
}

#[derive(Debug, Default)]
pub struct DummyMailbox {
    state: Mutex<MailboxState>,
}

impl DummyMailbox {
    /// Makes `word` available to the next read of the receive register.
    pub fn post(&self, word: u32) {
        lock(&self.state).rx.push_back(word);
    }

    /// Rejects the next `polls` sends as if the firmware had not consumed the previous word.
    pub fn set_busy_polls(&self, polls: u32) {
        lock(&self.state).busy_polls = polls;
    }

    pub fn sent(&self) -> Vec<u32> {
        lock(&self.state).sent.clone()
    }

    pub fn num_pending(&self) -> usize {
        lock(&self.state).rx.len()
    }
}

impl MessageUnit for DummyMailbox {
    fn read(&self) -> Option<u32> {
        lock(&self.state).rx.pop_front()
    }

    fn try_send(&self, word: u32) -> Result<(), MuBusy> {
        let mut state = lock(&self.state);
        if state.busy_polls > 0 {
            state.busy_polls -= 1;
            return Err(MuBusy);
        }

        state.sent.push(word);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BlitterState {
    /// Rejects every request and reports itself as not idle.
    busy: bool,
    /// Number of upcoming requests to refuse while claiming to be idle.
    refuse: u32,
    active: HashMap<usize, BlitRequest>,
    /// Streams whose active request completed without raising the interrupt.
    completed: HashSet<usize>,
    started: usize,
}

/// Blitter that only records requests. Conversions complete when the test says so.
#[derive(Debug, Default)]
pub struct DummyBlitter {
    state: Mutex<BlitterState>,
}

impl DummyBlitter {
    pub fn set_busy(&self, busy: bool) {
        lock(&self.state).busy = busy;
    }

    /// Refuses the next request even though the blitter reports itself idle.
    pub fn refuse_next(&self) {
        lock(&self.state).refuse += 1;
    }

    /// Completes the request in flight for `stream` without raising the interrupt.
    pub fn complete_silently(&self, stream: usize) {
        let mut state = lock(&self.state);
        if state.active.contains_key(&stream) {
            state.completed.insert(stream);
        }
    }

    /// Completes the request in flight for `stream`, returning it.
    pub fn finish(&self, stream: usize) -> Option<BlitRequest> {
        let mut state = lock(&self.state);
        state.completed.remove(&stream);
        state.active.remove(&stream)
    }

    pub fn active(&self, stream: usize) -> Option<BlitRequest> {
        lock(&self.state).active.get(&stream).cloned()
    }

    /// Number of requests accepted so far.
    pub fn num_started(&self) -> usize {
        lock(&self.state).started
    }
}

impl Blitter for DummyBlitter {
    fn is_idle(&self, stream: usize) -> bool {
        let state = lock(&self.state);
        !state.busy && !state.active.contains_key(&stream)
    }

    fn start_blit(&self, stream: usize, request: &BlitRequest) -> BlitStatus {
        let mut state = lock(&self.state);
        if state.refuse > 0 {
            state.refuse -= 1;
            return BlitStatus::Busy;
        }
        if state.busy || state.active.contains_key(&stream) {
            return BlitStatus::Busy;
        }

        state.active.insert(stream, request.clone());
        state.started += 1;
        BlitStatus::Accepted
    }

    fn completed(&self, stream: usize) -> bool {
        lock(&self.state).completed.contains(&stream)
    }

    fn acknowledge(&self, stream: usize) {
        let mut state = lock(&self.state);
        state.completed.remove(&stream);
        state.active.remove(&stream);
    }
}

/// A decode target handed to the firmware through FS_ALLOC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GrantedFrame {
    pub index: usize,
    pub luma: u32,
    pub chroma: u32,
}

#[derive(Debug, Default)]
struct FirmwareState {
    /// Commands read from the ring and not returned by `drain_commands` yet.
    pending: VecDeque<RpcMessage>,
    /// Every command ever read from the ring.
    history: Vec<RpcMessage>,
    granted: HashMap<usize, VecDeque<GrantedFrame>>,
    wptr: HashMap<usize, u32>,
}

/// The firmware end of the RPC rings.
#[derive(Clone)]
pub struct DummyFirmware {
    rpc: FirmwareRpc,
    mailbox: Arc<DummyMailbox>,
    state: Arc<Mutex<FirmwareState>>,
}

impl DummyFirmware {
    pub fn new(rpc: FirmwareRpc, mailbox: Arc<DummyMailbox>) -> Self {
        Self {
            rpc,
            mailbox,
            state: Default::default(),
        }
    }

    /// Moves every command written by the host out of the ring.
    fn collect(&self) {
        let mut state = lock(&self.state);
        while let Some(msg) = self.rpc.take_command() {
            match VpuCommand::n(msg.id) {
                Some(VpuCommand::FsAlloc) => {
                    if let [kind, index, luma, chroma, ..] = msg.payload[..] {
                        if kind == FrameRequestKind::Frame as u32 {
                            state
                                .granted
                                .entry(msg.stream)
                                .or_default()
                                .push_back(GrantedFrame {
                                    index: index as usize,
                                    luma,
                                    chroma,
                                });
                        }
                    }
                }
                Some(VpuCommand::UpdateEsWrPtr) => {
                    if let Some(&wptr) = msg.payload.first() {
                        state.wptr.insert(msg.stream, wptr);
                    }
                }
                _ => (),
            }

            state.history.push(msg.clone());
            state.pending.push_back(msg);
        }
    }

    /// Posts `event` for `stream` and rings the mailbox.
    pub fn post(&self, stream: usize, event: VpuEvent, payload: &[u32]) -> Result<(), RpcError> {
        self.collect();
        self.rpc.post_event(stream, event, payload)?;
        self.mailbox.post(EVENT_DOORBELL);
        Ok(())
    }

    /// Posts a message with an arbitrary identifier.
    pub fn post_raw(&self, stream: usize, id: u16, payload: &[u32]) -> Result<(), RpcError> {
        self.collect();
        self.rpc.post_message(&RpcMessage {
            stream,
            id,
            payload: payload.to_vec(),
        })?;
        self.mailbox.post(EVENT_DOORBELL);
        Ok(())
    }

    /// Returns the commands received since the last call.
    pub fn drain_commands(&self) -> Vec<RpcMessage> {
        self.collect();
        lock(&self.state).pending.drain(..).collect()
    }

    /// Returns every command received so far.
    pub fn history(&self) -> Vec<RpcMessage> {
        self.collect();
        lock(&self.state).history.clone()
    }

    /// Polls for `command` until `timeout` expires, consuming it.
    pub fn wait_for_command(&self, command: VpuCommand, timeout: Duration) -> Option<RpcMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            self.collect();
            {
                let mut state = lock(&self.state);
                let pos = state.pending.iter().position(|c| c.id == command as u16);
                if let Some(pos) = pos {
                    return state.pending.remove(pos);
                }
            }

            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Pops the oldest decode target granted to `stream` that was not taken yet.
    pub fn take_granted(&self, stream: usize) -> Option<GrantedFrame> {
        self.collect();
        lock(&self.state)
            .granted
            .get_mut(&stream)
            .and_then(VecDeque::pop_front)
    }

    /// Write pointer last announced for `stream`.
    pub fn last_wptr(&self, stream: usize) -> Option<u32> {
        self.collect();
        lock(&self.state).wptr.get(&stream).copied()
    }
}

/// A device wired to scripted collaborators.
#[derive(Clone)]
pub struct DummyHarness {
    pub device: Arc<VpuDevice>,
    pub firmware: DummyFirmware,
    pub mailbox: Arc<DummyMailbox>,
    pub blitter: Arc<DummyBlitter>,
    pub allocator: Arc<HostAllocator>,
}

impl DummyHarness {
    pub fn new(config: VpuConfig) -> Result<Self, MuError> {
        Self::with_allocator(config, Arc::new(HostAllocator::default()))
    }

    pub fn with_allocator(
        config: VpuConfig,
        allocator: Arc<HostAllocator>,
    ) -> Result<Self, MuError> {
        let mailbox = Arc::new(DummyMailbox::default());
        let blitter = Arc::new(DummyBlitter::default());
        let (rpc, firmware) = SharedMemoryRpc::new(DEFAULT_RING_WORDS);

        let device = VpuDevice::new(
            config,
            allocator.clone(),
            blitter.clone(),
            mailbox.clone(),
            Box::new(rpc),
        )?;

        Ok(Self {
            device: Arc::new(device),
            firmware: DummyFirmware::new(firmware, mailbox.clone()),
            mailbox,
            blitter,
            allocator,
        })
    }

    /// Runs the interrupt for every posted mailbox word, then the deferred procedure call.
    pub fn pump(&self) {
        while self.mailbox.num_pending() > 0 {
            self.device.mu_isr();
        }
        self.device.mu_dpc();
    }

    /// Posts `event` and runs the interrupt path.
    pub fn post(&self, stream: usize, event: VpuEvent, payload: &[u32]) -> Result<(), RpcError> {
        self.firmware.post(stream, event, payload)?;
        self.pump();
        Ok(())
    }

    /// Completes the blit in flight for `stream` and notifies the device.
    pub fn finish_blit(&self, stream: usize) -> Option<BlitRequest> {
        let request = self.blitter.finish(stream)?;
        self.device.blit_complete(stream);
        Some(request)
    }

    /// Acknowledges the session commands received so far the way the firmware does and returns
    /// all of them.
    pub fn respond(&self) -> Result<Vec<RpcMessage>, RpcError> {
        let commands = self.firmware.drain_commands();
        for command in &commands {
            let event = match VpuCommand::n(command.id) {
                Some(VpuCommand::Start) => VpuEvent::StartDone,
                Some(VpuCommand::Stop) => VpuEvent::Stopped,
                Some(VpuCommand::Abort) => VpuEvent::AbortDone,
                Some(VpuCommand::RstBuf) => VpuEvent::StrBufRst,
                _ => continue,
            };
            self.post(command.stream, event, &[])?;
        }

        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::h264;
    use crate::decoder::tests::test_config;
    use crate::decoder::tests::TEST_FILE;
    use crate::decoder::SessionState;

    #[test]
    fn mailbox_busy_polls() {
        let mailbox = DummyMailbox::default();
        mailbox.set_busy_polls(2);
        assert_eq!(mailbox.try_send(7), Err(MuBusy));
        assert_eq!(mailbox.try_send(7), Err(MuBusy));
        assert_eq!(mailbox.try_send(7), Ok(()));
        assert_eq!(mailbox.sent(), vec![7]);

        mailbox.post(3);
        assert_eq!(mailbox.num_pending(), 1);
        assert_eq!(mailbox.read(), Some(3));
        assert_eq!(mailbox.read(), None);
    }

    #[test]
    fn blitter_tracks_one_request_per_stream() {
        let blitter = DummyBlitter::default();
        let request = BlitRequest {
            vfb: 1,
            ofb: 2,
            luma_addr: 0x1000,
            chroma_addr: 0x2000,
            tiled: (256, 128).into(),
            resolution: (64, 64).into(),
            dst_addr: 0x3000,
            dst_stride: 256,
        };

        assert_eq!(blitter.start_blit(0, &request), BlitStatus::Accepted);
        assert!(!blitter.is_idle(0));
        assert!(blitter.is_idle(1));
        assert_eq!(blitter.start_blit(0, &request), BlitStatus::Busy);

        blitter.complete_silently(0);
        assert!(blitter.completed(0));
        blitter.acknowledge(0);
        assert!(blitter.is_idle(0));
        assert!(blitter.finish(0).is_none());
        assert_eq!(blitter.num_started(), 1);
    }

    #[test]
    fn respond_acknowledges_session_commands() {
        let _ = env_logger::try_init();
        let h = DummyHarness::new(test_config()).unwrap();
        let stream = h.device.open(TEST_FILE, &h264()).unwrap().stream;
        h.device
            .write_bitstream(stream, &mut &[0u8; 16][..])
            .unwrap();

        // START is answered from another thread while decode waits for it.
        let responder = {
            let h = h.clone();
            std::thread::spawn(move || {
                h.firmware
                    .wait_for_command(VpuCommand::Start, Duration::from_secs(5))
                    .unwrap();
                h.post(stream, VpuEvent::StartDone, &[]).unwrap();
            })
        };
        h.device.decode(stream, &Default::default()).unwrap();
        responder.join().unwrap();

        let wptr = h.device.status(stream).unwrap().stream_buffer.wptr;
        assert_eq!(h.firmware.last_wptr(stream), Some(wptr as u32));

        h.device.stop(stream, false).unwrap();
        let commands = h.respond().unwrap();
        assert!(commands.iter().any(|c| c.id == VpuCommand::Stop as u16));
        assert_eq!(h.device.status(stream).unwrap().state, SessionState::Stopped);
    }
}
