// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared-memory RPC between the host and the decoder firmware.
//!
//! Commands and events travel through two rings of 32-bit little-endian words living in memory
//! shared with the VPU. Each message is a header word followed by its payload:
//!
//! ```text
//!  31        24 23        16 15                       0
//! +------------+------------+--------------------------+
//! |   stream   |  n. words  |       command/event      |
//! +------------+------------+--------------------------+
//! |                 payload word 0                     |
//! |                       ...                          |
//! ```
//!
//! The host writes commands to one ring and reads events from the other. The mailbox only carries
//! doorbells, see [`crate::mu`].

use std::sync::Arc;
use std::sync::Mutex;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use enumn::N;
use thiserror::Error;

use crate::utils::lock;

/// Largest payload a single message may carry, in words.
pub const MAX_PAYLOAD_WORDS: usize = 64;

/// Number of streams a message header can address.
pub const MAX_STREAMS: usize = 256;

/// Commands understood by the decoder firmware.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum VpuCommand {
    Null = 0x00,
    UpdateEsWrPtr = 0x06,
    Start = 0x10,
    Stop = 0x11,
    Abort = 0x12,
    RstBuf = 0x13,
    FsRelease = 0x15,
    FsAlloc = 0x19,
    DbgGetStatus = 0x1c,
    FirmReset = 0x40,
}

/// Events posted by the decoder firmware.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum VpuEvent {
    ResetDone = 0x01,
    SeqHdrFound = 0x02,
    PicHdrFound = 0x03,
    PicDecoded = 0x04,
    ResChange = 0x0b,
    ReqFrameBuff = 0x10,
    FrameBuffRdy = 0x11,
    RelFrameBuff = 0x12,
    StrBufRst = 0x13,
    FirmwareXcpt = 0x17,
    StartDone = 0x18,
    Stopped = 0x19,
    AbortDone = 0x1a,
    Finished = 0x1b,
}

/// Kind of buffer requested by [`VpuEvent::ReqFrameBuff`].
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameRequestKind {
    /// A decode target, served from the vfb pool.
    Frame = 0,
    /// Motion buffer info scratch memory.
    Mbi = 1,
    /// DCP scratch memory.
    Dcp = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("ring full, cannot write a message of {0} words")]
    Full(usize),
    #[error("payload of {0} words exceeds the maximum of {MAX_PAYLOAD_WORDS}")]
    PayloadTooLarge(usize),
    #[error("ring empty")]
    Empty,
    #[error("corrupted message header {0:#010x}")]
    Corrupted(u32),
}

/// Result of polling the event ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    Available,
    Empty,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcMessage {
    pub stream: usize,
    pub id: u16,
    pub payload: Vec<u32>,
}

impl RpcMessage {
    fn header(&self) -> u32 {
        (((self.stream % MAX_STREAMS) as u32) << 24)
            | ((self.payload.len() as u32 & 0xff) << 16)
            | self.id as u32
    }
}

/// A ring of little-endian words.
#[derive(Debug)]
pub struct RpcRing {
    mem: Vec<u8>,
    /// Read index, in words.
    rptr: usize,
    /// Write index, in words.
    wptr: usize,
}

impl RpcRing {
    /// Creates a ring holding up to `num_words - 1` words.
    pub fn new(num_words: usize) -> Self {
        Self {
            mem: vec![0; num_words.max(2) * 4],
            rptr: 0,
            wptr: 0,
        }
    }

    /// Wraps a copy of ring memory as found in shared memory, with the given word indices.
    pub fn from_raw(mem: &[u8], rptr: usize, wptr: usize) -> Self {
        let mut mem = mem[..mem.len() & !3].to_vec();
        if mem.len() < 8 {
            mem.resize(8, 0);
        }
        let num_words = mem.len() / 4;

        Self {
            mem,
            rptr: rptr % num_words,
            wptr: wptr % num_words,
        }
    }

    fn num_words(&self) -> usize {
        self.mem.len() / 4
    }

    /// Number of words waiting to be read.
    pub fn level(&self) -> usize {
        (self.wptr + self.num_words() - self.rptr) % self.num_words()
    }

    pub fn free_words(&self) -> usize {
        self.num_words() - 1 - self.level()
    }

    pub fn is_empty(&self) -> bool {
        self.rptr == self.wptr
    }

    fn word(&self, index: usize) -> u32 {
        let offset = (index % self.num_words()) * 4;
        LittleEndian::read_u32(&self.mem[offset..offset + 4])
    }

    fn set_word(&mut self, index: usize, value: u32) {
        let offset = (index % self.num_words()) * 4;
        LittleEndian::write_u32(&mut self.mem[offset..offset + 4], value)
    }

    /// Appends `msg` to the ring.
    pub fn write_message(&mut self, msg: &RpcMessage) -> Result<(), RpcError> {
        if msg.payload.len() > MAX_PAYLOAD_WORDS {
            return Err(RpcError::PayloadTooLarge(msg.payload.len()));
        }
        let needed = msg.payload.len() + 1;
        if needed > self.free_words() {
            return Err(RpcError::Full(needed));
        }

        self.set_word(self.wptr, msg.header());
        for (i, word) in msg.payload.iter().enumerate() {
            self.set_word(self.wptr + 1 + i, *word);
        }
        self.wptr = (self.wptr + needed) % self.num_words();

        Ok(())
    }

    /// Checks whether a well-formed message is waiting at the read pointer.
    pub fn check(&self) -> MessageStatus {
        if self.is_empty() {
            return MessageStatus::Empty;
        }

        let header = self.word(self.rptr);
        let len = ((header >> 16) & 0xff) as usize;
        if len > MAX_PAYLOAD_WORDS || len + 1 > self.level() {
            return MessageStatus::Error;
        }

        MessageStatus::Available
    }

    /// Pops the message at the read pointer.
    ///
    /// A corrupted header makes the rest of the ring unparseable, so it is discarded.
    pub fn read_message(&mut self) -> Result<RpcMessage, RpcError> {
        if self.is_empty() {
            return Err(RpcError::Empty);
        }

        let header = self.word(self.rptr);
        if self.check() == MessageStatus::Error {
            log::warn!(
                "corrupted rpc header {header:#010x}, dropping {} words",
                self.level()
            );
            self.rptr = self.wptr;
            return Err(RpcError::Corrupted(header));
        }

        let len = ((header >> 16) & 0xff) as usize;
        let payload = (0..len).map(|i| self.word(self.rptr + 1 + i)).collect();
        self.rptr = (self.rptr + len + 1) % self.num_words();

        Ok(RpcMessage {
            stream: (header >> 24) as usize,
            id: (header & 0xffff) as u16,
            payload,
        })
    }
}

/// The firmware RPC collaborator, as seen by the host.
pub trait RpcChannel: Send {
    /// Serializes a command into the command ring.
    fn send_command(
        &mut self,
        stream: usize,
        command: VpuCommand,
        data: &[u32],
    ) -> Result<(), RpcError>;

    /// Polls the event ring.
    fn check_message(&self) -> MessageStatus;

    /// Pops the next event.
    fn receive_message(&mut self) -> Result<RpcMessage, RpcError>;
}

/// Default size of each ring, in words.
pub const DEFAULT_RING_WORDS: usize = 1024;

/// Host end of the shared-memory rings.
pub struct SharedMemoryRpc {
    commands: Arc<Mutex<RpcRing>>,
    events: Arc<Mutex<RpcRing>>,
}

/// Firmware end of the shared-memory rings.
#[derive(Clone)]
pub struct FirmwareRpc {
    commands: Arc<Mutex<RpcRing>>,
    events: Arc<Mutex<RpcRing>>,
}

impl SharedMemoryRpc {
    /// Creates both ends of a pair of rings of `num_words` words each.
    pub fn new(num_words: usize) -> (Self, FirmwareRpc) {
        let commands = Arc::new(Mutex::new(RpcRing::new(num_words)));
        let events = Arc::new(Mutex::new(RpcRing::new(num_words)));

        (
            Self {
                commands: commands.clone(),
                events: events.clone(),
            },
            FirmwareRpc { commands, events },
        )
    }
}

impl RpcChannel for SharedMemoryRpc {
    fn send_command(
        &mut self,
        stream: usize,
        command: VpuCommand,
        data: &[u32],
    ) -> Result<(), RpcError> {
        log::trace!("stream {stream}: command {command:?} {data:x?}");
        lock(&self.commands).write_message(&RpcMessage {
            stream,
            id: command as u16,
            payload: data.to_vec(),
        })
    }

    fn check_message(&self) -> MessageStatus {
        lock(&self.events).check()
    }

    fn receive_message(&mut self) -> Result<RpcMessage, RpcError> {
        lock(&self.events).read_message()
    }
}

impl FirmwareRpc {
    /// Posts an event for the host to pick up on its next deferred procedure call.
    pub fn post_event(
        &self,
        stream: usize,
        event: VpuEvent,
        payload: &[u32],
    ) -> Result<(), RpcError> {
        self.post_message(&RpcMessage {
            stream,
            id: event as u16,
            payload: payload.to_vec(),
        })
    }

    /// Posts an arbitrary message, whether or not its identifier is a known event.
    pub fn post_message(&self, msg: &RpcMessage) -> Result<(), RpcError> {
        lock(&self.events).write_message(msg)
    }

    /// Pops the oldest command written by the host.
    pub fn take_command(&self) -> Option<RpcMessage> {
        let mut commands = lock(&self.commands);
        if commands.is_empty() {
            return None;
        }
        commands.read_message().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps() {
        let mut ring = RpcRing::new(8);
        for round in 0..10u32 {
            let msg = RpcMessage {
                stream: 1,
                id: VpuEvent::PicDecoded as u16,
                payload: vec![round, round * 2, round * 3],
            };
            ring.write_message(&msg).unwrap();
            assert_eq!(ring.level(), 4);
            assert_eq!(ring.check(), MessageStatus::Available);
            assert_eq!(ring.read_message().unwrap(), msg);
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn ring_full() {
        let mut ring = RpcRing::new(8);
        let msg = RpcMessage {
            stream: 0,
            id: 1,
            payload: vec![0; 4],
        };
        ring.write_message(&msg).unwrap();
        assert_eq!(ring.write_message(&msg), Err(RpcError::Full(5)));
        assert_eq!(
            ring.write_message(&RpcMessage {
                stream: 0,
                id: 1,
                payload: vec![0; MAX_PAYLOAD_WORDS + 1],
            }),
            Err(RpcError::PayloadTooLarge(MAX_PAYLOAD_WORDS + 1))
        );
    }

    #[test]
    fn corrupted_header_drops_ring() {
        let mut ring = RpcRing::new(16);
        ring.write_message(&RpcMessage {
            stream: 0,
            id: 2,
            payload: vec![1, 2],
        })
        .unwrap();
        // Claim more payload than was written.
        ring.set_word(0, (0x0a << 16) | 2);

        assert_eq!(ring.check(), MessageStatus::Error);
        assert_eq!(ring.read_message(), Err(RpcError::Corrupted((0x0a << 16) | 2)));
        assert!(ring.is_empty());
        assert_eq!(ring.read_message(), Err(RpcError::Empty));
    }

    #[test]
    fn raw_ring_memory() {
        let mut mem = Vec::new();
        for word in [0x0102_0004u32, 0x1000, 0x2000, 0xdead_beef] {
            mem.extend_from_slice(&word.to_le_bytes());
        }
        // Trailing bytes that do not form a word are ignored.
        mem.push(0xff);

        let mut ring = RpcRing::from_raw(&mem, 0, 3);
        assert_eq!(ring.level(), 3);
        let msg = ring.read_message().unwrap();
        assert_eq!(msg.stream, 1);
        assert_eq!(VpuEvent::n(msg.id), Some(VpuEvent::PicDecoded));
        assert_eq!(msg.payload, vec![0x1000, 0x2000]);
        assert!(ring.is_empty());

        let mut tiny = RpcRing::from_raw(&[], 4, 5);
        assert_eq!(tiny.level(), 1);
        assert!(tiny.read_message().is_ok());
    }

    #[test]
    fn shared_memory_endpoints() {
        let (mut host, firmware) = SharedMemoryRpc::new(64);
        assert_eq!(host.check_message(), MessageStatus::Empty);

        host.send_command(1, VpuCommand::Abort, &[128]).unwrap();
        let cmd = firmware.take_command().unwrap();
        assert_eq!(cmd.stream, 1);
        assert_eq!(VpuCommand::n(cmd.id), Some(VpuCommand::Abort));
        assert_eq!(cmd.payload, vec![128]);
        assert!(firmware.take_command().is_none());

        firmware.post_event(1, VpuEvent::AbortDone, &[]).unwrap();
        assert_eq!(host.check_message(), MessageStatus::Available);
        let event = host.receive_message().unwrap();
        assert_eq!(VpuEvent::n(event.id), Some(VpuEvent::AbortDone));
        assert_eq!(host.check_message(), MessageStatus::Empty);
    }
}
