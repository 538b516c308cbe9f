// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Message unit transport.
//!
//! The VPU signals the host through a hardware mailbox (the message unit, MU). The interrupt
//! service routine only moves the mailbox word into a circular queue; the deferred procedure call
//! then drains that queue together with the shared-memory event ring and dispatches every event.
//! Commands go the other way: they are written to the command ring under the device-wide command
//! lock, then announced to the firmware through the mailbox.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::rpc::MessageStatus;
use crate::rpc::RpcChannel;
use crate::rpc::RpcError;
use crate::rpc::RpcMessage;
use crate::rpc::VpuCommand;
use crate::rpc::MAX_STREAMS;
use crate::utils::lock;

/// Mailbox word posted by the firmware once it has booted.
pub const MU_BOOT_DONE: u32 = 0x55;
/// Mailbox word posted by the firmware once the RPC shared memory is initialized.
pub const MU_RPC_READY: u32 = 0xaa;
/// Mailbox word telling the firmware the command ring has new content.
pub const MU_CMD_DOORBELL: u32 = 0xffff;

/// Default capacity of the mailbox word queue.
pub const MU_QUEUE_SIZE: usize = 64;

/// Number of busy mailbox polls before yielding the CPU between attempts.
const SEND_SPIN_LIMIT: u32 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("mailbox busy")]
pub struct MuBusy;

#[derive(Debug, Error)]
pub enum MuError {
    #[error("failed to create EventFd for deferred procedure calls: {0}")]
    DpcEventFd(Errno),
    #[error("{0} stream slots requested, messages address at most {max}", max = MAX_STREAMS)]
    TooManyStreams(usize),
}

/// The hardware mailbox.
pub trait MessageUnit: Send + Sync {
    /// Non-blocking read of the receive register.
    fn read(&self) -> Option<u32>;

    /// Posts `word` to the transmit register, failing if the firmware has not consumed the
    /// previous one yet.
    fn try_send(&self, word: u32) -> Result<(), MuBusy>;
}

/// Fixed-capacity ring of mailbox words.
#[derive(Debug)]
pub struct MessageQueue {
    items: Box<[u32]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: vec![0; capacity.max(1)].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Appends `word`. Returns `false`, leaving the queue untouched, if it is full.
    pub fn push(&mut self, word: u32) -> bool {
        if self.count == self.items.len() {
            return false;
        }

        self.items[self.tail] = word;
        self.tail = (self.tail + 1) % self.items.len();
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<u32> {
        if self.count == 0 {
            return None;
        }

        let word = self.items[self.head];
        self.head = (self.head + 1) % self.items.len();
        self.count -= 1;
        Some(word)
    }
}

pub struct MuTransport {
    mu: Arc<dyn MessageUnit>,
    /// Words read by the ISR, waiting for the DPC.
    queue: Mutex<MessageQueue>,
    /// Words dropped because `queue` was full.
    overflows: AtomicU64,
    /// Also serializes command submission.
    rpc: Mutex<Box<dyn RpcChannel>>,
    /// Signalled by the ISR whenever a DPC must run.
    dpc_event: EventFd,
}

impl MuTransport {
    pub fn new(
        mu: Arc<dyn MessageUnit>,
        rpc: Box<dyn RpcChannel>,
        queue_size: usize,
    ) -> Result<Self, MuError> {
        let dpc_event =
            EventFd::from_flags(EfdFlags::EFD_NONBLOCK).map_err(MuError::DpcEventFd)?;

        Ok(Self {
            mu,
            queue: Mutex::new(MessageQueue::new(queue_size)),
            overflows: AtomicU64::new(0),
            rpc: Mutex::new(rpc),
            dpc_event,
        })
    }

    /// Interrupt service routine: moves one mailbox word to the queue.
    ///
    /// Always reports the interrupt as handled so the DPC gets scheduled. A word arriving while
    /// the queue is full is dropped and counted.
    pub fn isr(&self) -> bool {
        if let Some(word) = self.mu.read() {
            if !lock(&self.queue).push(word) {
                let overflows = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("mailbox queue full, dropped word {word:#x} ({overflows} total)");
            }
        }

        if let Err(e) = self.dpc_event.write(1) {
            log::warn!("failed to signal DPC: {e}");
        }

        true
    }

    /// File descriptor a hosting loop can poll to know when [`dpc`](Self::dpc) must run.
    pub fn dpc_event(&self) -> &EventFd {
        &self.dpc_event
    }

    /// Number of mailbox words lost to queue overflows.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    fn pop_word(&self) -> Option<u32> {
        lock(&self.queue).pop()
    }

    fn next_message(&self) -> Option<RpcMessage> {
        let mut rpc = lock(&self.rpc);
        match rpc.check_message() {
            MessageStatus::Empty => None,
            MessageStatus::Available | MessageStatus::Error => match rpc.receive_message() {
                Ok(msg) => Some(msg),
                Err(e) => {
                    log::warn!("dropping unreadable event: {e}");
                    None
                }
            },
        }
    }

    fn rpc_is_empty(&self) -> bool {
        lock(&self.rpc).check_message() == MessageStatus::Empty
    }

    /// Deferred procedure call: drains queued mailbox words and the event ring, passing every
    /// event to `handler`.
    ///
    /// The RPC lock is not held while `handler` runs, so it may send commands.
    pub fn dpc(&self, handler: &mut dyn FnMut(RpcMessage)) {
        // Clear the wakeup first so that an interrupt arriving while we drain schedules another
        // run. EAGAIN only means nobody signalled.
        let _ = self.dpc_event.read();

        loop {
            match self.pop_word() {
                Some(MU_BOOT_DONE) | Some(MU_RPC_READY) => continue,
                Some(word) => log::trace!("mailbox word {word:#x}"),
                None if self.rpc_is_empty() => break,
                None => (),
            }

            while let Some(msg) = self.next_message() {
                handler(msg);
            }
        }
    }

    /// Submits a command to the firmware.
    ///
    /// Commands are serialized by the RPC lock, so the firmware observes them in submission order.
    pub fn send_command(
        &self,
        stream: usize,
        command: VpuCommand,
        data: &[u32],
    ) -> Result<(), RpcError> {
        let mut rpc = lock(&self.rpc);
        rpc.send_command(stream, command, data)?;

        let mut attempts = 0u32;
        while self.mu.try_send(MU_CMD_DOORBELL).is_err() {
            attempts = attempts.saturating_add(1);
            if attempts < SEND_SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        if attempts > 0 {
            log::trace!("mailbox accepted doorbell after {attempts} busy polls");
        }

        Ok(())
    }
}
