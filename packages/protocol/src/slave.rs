//! Slave records and their bounded outbound queues.

use std::collections::VecDeque;

use anyhow::{bail, Result};

use crate::frame;

/// Upper bound on configured slaves.
pub const MAX_SLAVES: usize = 32;

/// Bound on each slave's pending-packet FIFO. Enqueue past this is reported
/// to the caller as packet loss.
pub const QUEUE_CAPACITY: usize = 128;

/// Retry budget for queued data packets.
pub const TRIES_DATA: u8 = 10;
/// Retry budget for synthesized empty polls and ACKs.
pub const TRIES_EMPTY: u8 = 1;

/// One pending outbound application packet.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub payload: Vec<u8>,
    pub tries_left: u8,
}

impl QueuedPacket {
    pub fn data(payload: Vec<u8>) -> Self {
        QueuedPacket {
            payload,
            tries_left: TRIES_DATA,
        }
    }

    /// A one-shot empty frame, used both as poll and as ACK.
    pub fn empty() -> Self {
        QueuedPacket {
            payload: frame::empty_packet(),
            tries_left: TRIES_EMPTY,
        }
    }
}

/// One addressable peer on the bus.
#[derive(Debug)]
pub struct Slave {
    address: u8,
    sequence: u8,
    queue: VecDeque<QueuedPacket>,
}

impl Slave {
    pub fn new(address: u8) -> Self {
        Slave {
            address,
            sequence: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Per-slave exchange counter, wraps modulo 256.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn advance_sequence(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }

    pub(crate) fn push(&mut self, packet: QueuedPacket) -> Result<()> {
        if self.queue.len() >= QUEUE_CAPACITY {
            bail!("packet queue for slave {} is full", self.address);
        }
        self.queue.push_back(packet);
        Ok(())
    }

    pub(crate) fn head(&self) -> Option<&QueuedPacket> {
        self.queue.front()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut QueuedPacket> {
        self.queue.front_mut()
    }

    pub(crate) fn pop_head(&mut self) {
        self.queue.pop_front();
    }
}
