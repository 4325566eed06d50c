//! Per-task message mailboxes
//!
//! Every task slot owns one bounded FIFO ring of fixed-maximum-size
//! messages. Send copies the payload in and stamps the sender and the
//! clock; receive is strictly non-blocking and hands back the oldest
//! message. A message that is too big for the receiver's buffer stays
//! queued so the caller can retry with a larger one.

use super::config::{MAX_MESSAGE_QUEUE_SIZE, MAX_MESSAGE_SIZE};
use super::task::TaskId;

/// One queued message.
#[derive(Clone)]
pub struct Message {
    pub from: TaskId,
    pub to: TaskId,
    data: [u8; MAX_MESSAGE_SIZE],
    pub len: usize,
    pub timestamp: u64,
    pub valid: bool,
}

impl Message {
    fn blank() -> Self {
        Self {
            from: TaskId(0),
            to: TaskId(0),
            data: [0; MAX_MESSAGE_SIZE],
            len: 0,
            timestamp: 0,
            valid: false,
        }
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Mailbox failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    /// Ring is at capacity
    Full,
    /// Nothing queued
    Empty,
    /// Payload larger than the message maximum, or larger than the
    /// receive buffer (message stays queued)
    Oversize,
    /// Head slot is marked invalid; the ring bookkeeping is broken
    Inconsistent,
}

impl std::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboxError::Full => write!(f, "mailbox full"),
            MailboxError::Empty => write!(f, "mailbox empty"),
            MailboxError::Oversize => write!(f, "message too large"),
            MailboxError::Inconsistent => write!(f, "mailbox ring inconsistent"),
        }
    }
}

/// A bounded ring of messages for one recipient task.
pub struct Mailbox {
    slots: Vec<Message>,
    head: usize,
    tail: usize,
    count: usize,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_MESSAGE_QUEUE_SIZE).map(|_| Message::blank()).collect(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Enqueue a payload at the tail.
    pub fn push(
        &mut self,
        from: TaskId,
        to: TaskId,
        payload: &[u8],
        now: u64,
    ) -> Result<(), MailboxError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(MailboxError::Oversize);
        }
        if self.count == self.slots.len() {
            return Err(MailboxError::Full);
        }

        let slot = &mut self.slots[self.tail];
        slot.from = from;
        slot.to = to;
        slot.len = payload.len();
        slot.data[..payload.len()].copy_from_slice(payload);
        slot.timestamp = now;
        slot.valid = true;

        self.tail = (self.tail + 1) % self.slots.len();
        self.count += 1;
        Ok(())
    }

    /// Dequeue the oldest message into `buf`, returning its length and
    /// sender. An oversize message is left in place.
    pub fn pop_into(&mut self, buf: &mut [u8]) -> Result<(usize, TaskId), MailboxError> {
        if self.count == 0 {
            return Err(MailboxError::Empty);
        }
        let slot = &mut self.slots[self.head];
        if !slot.valid {
            return Err(MailboxError::Inconsistent);
        }
        if slot.len > buf.len() {
            return Err(MailboxError::Oversize);
        }

        buf[..slot.len].copy_from_slice(&slot.data[..slot.len]);
        let len = slot.len;
        let from = slot.from;
        slot.valid = false;

        self.head = (self.head + 1) % self.slots.len();
        self.count -= 1;
        Ok((len, from))
    }

    /// Valid entries inside the `[head, head + count)` window. Equals
    /// `len()` whenever the ring bookkeeping is intact.
    pub fn valid_in_window(&self) -> usize {
        (0..self.count)
            .filter(|i| self.slots[(self.head + i) % self.slots.len()].valid)
            .count()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
