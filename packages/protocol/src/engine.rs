//! Master polling engine for the half-duplex bus.
//!
//! All engine state lives in [`MasterEngine`] and every operation runs on the
//! thread that owns it. The engine is purely event-driven: each exchange ends
//! in exactly one call back into the scheduler, and there is no free-running
//! poll timer. Because the UART echoes transmitted bytes into its own receive
//! path, the engine treats the echo as the first half of every exchange and
//! verifies it byte-for-byte against a snapshot of the sent frame.

use std::{
    io,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};

use crate::{
    config::BusConfig,
    crc::crc16,
    frame,
    slave::{QueuedPacket, Slave, MAX_SLAVES},
};

/// Linear receive buffer capacity.
pub const RECEIVE_BUFFER_SIZE: usize = 1_048_576;

/// Write half of the serial line. One call per frame; a short write is
/// reported back and the exchange abandoned, never retried.
pub trait BusWriter {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
}

/// Capability handed to the engine for pushing inbound traffic back to the
/// host: packet redispatch plus the UID-to-slave recipient registry.
pub trait HostDispatch {
    fn dispatch_response(&mut self, packet: &[u8]);
    fn add_recipient(&mut self, uid: u32, address: u8);
}

/// Response deadline for the exchange in flight.
///
/// `enabled_at` survives disarming: the timeout handler needs the arm
/// timestamp to recognize a timer source that fired early.
struct Deadline {
    enabled_at: Instant,
    fire_after: Duration,
    armed: bool,
}

impl Deadline {
    fn new() -> Self {
        Deadline {
            enabled_at: Instant::now(),
            fire_after: Duration::ZERO,
            armed: false,
        }
    }

    fn arm(&mut self, fire_after: Duration) {
        self.enabled_at = Instant::now();
        self.fire_after = fire_after;
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
        log::debug!("Disabled response deadline");
    }

    fn due(&self) -> bool {
        self.armed && self.enabled_at.elapsed() >= self.fire_after
    }
}

/// The bus master: slave table, receive parser, round-robin scheduler and
/// retry bookkeeping.
pub struct MasterEngine<B: BusWriter, H: HostDispatch> {
    slaves: Vec<Slave>,
    current: isize,
    rx: Vec<u8>,
    snapshot: Vec<u8>,
    send_verify: bool,
    sent_ack_of_data_packet: bool,
    deadline: Deadline,
    response_timeout: Duration,
    bus: B,
    host: H,
}

impl<B: BusWriter, H: HostDispatch> MasterEngine<B, H> {
    pub fn new(config: &BusConfig, bus: B, host: H) -> Result<Self> {
        if config.slave_addresses.is_empty() {
            bail!("No slaves configured");
        }
        if config.slave_addresses.len() > MAX_SLAVES {
            bail!("More than {MAX_SLAVES} slaves configured");
        }

        Ok(MasterEngine {
            slaves: config.slave_addresses.iter().map(|&a| Slave::new(a)).collect(),
            current: -1,
            rx: Vec::new(),
            snapshot: Vec::new(),
            send_verify: false,
            sent_ack_of_data_packet: false,
            deadline: Deadline::new(),
            response_timeout: config.response_timeout,
            bus,
            host,
        })
    }

    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    /// Index of the slave whose exchange is in flight, `None` before the
    /// first poll.
    pub fn current_slave_index(&self) -> Option<usize> {
        usize::try_from(self.current).ok()
    }

    /// Whether the response deadline for the exchange in flight has passed.
    pub fn deadline_due(&self) -> bool {
        self.deadline.due()
    }

    /// Kick off the polling cycle. Call once after construction.
    pub fn start(&mut self) {
        log::debug!("Starting master polling cycle");
        self.poll_next_slave();
    }

    /// Dispatch-in: queue an outbound application packet.
    ///
    /// A zero packet UID or an absent recipient broadcasts one copy to every
    /// slave; otherwise the packet goes to the slave whose address matches.
    /// An unknown recipient drops the packet silently, a full queue drops it
    /// with an error log.
    pub fn enqueue(&mut self, packet: &[u8], recipient: Option<u8>) -> Result<()> {
        if packet.len() < frame::PACKET_MIN_LEN || packet.len() > frame::PACKET_MAX_LEN {
            bail!("Application packet length {} is out of range", packet.len());
        }
        if packet[4] as usize != packet.len() {
            bail!(
                "Application packet length byte {} does not match its {} bytes",
                packet[4],
                packet.len()
            );
        }

        let uid = frame::packet_uid(packet);
        match recipient {
            Some(address) if uid != 0 => {
                if let Some(slave) = self.slaves.iter_mut().find(|s| s.address() == address) {
                    log::debug!("Packet with UID {uid:#010X} queued for slave {address}");
                    if let Err(err) = slave.push(QueuedPacket::data(packet.to_vec())) {
                        log::error!("Dropping packet for slave {address}: {err}");
                    }
                } else {
                    log::debug!("No slave with address {address}, dropping packet");
                }
            }
            _ => {
                log::debug!("Broadcasting packet with UID {uid:#010X} to all configured slaves");
                for slave in &mut self.slaves {
                    let address = slave.address();
                    if let Err(err) = slave.push(QueuedPacket::data(packet.to_vec())) {
                        log::error!("Dropping packet for slave {address}: {err}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Feed bytes read from the serial line into the receive buffer and
    /// parse whatever is complete.
    pub fn handle_rx_bytes(&mut self, bytes: &[u8]) {
        if self.current < 0 {
            log::debug!("Ignoring {} bus bytes before polling started", bytes.len());
            return;
        }

        if self.rx.len() >= RECEIVE_BUFFER_SIZE - frame::FRAME_MAX_LEN {
            log::warn!("No more space in the receive buffer, current request aborted");
            self.poll_next_slave();
            return;
        }

        let room = RECEIVE_BUFFER_SIZE - self.rx.len();
        if bytes.len() > room {
            log::warn!(
                "Discarding {} bus bytes past the receive buffer capacity",
                bytes.len() - room
            );
        }
        let take = bytes.len().min(room);
        self.rx.extend_from_slice(&bytes[..take]);
        self.parse_buffer();
    }

    /// Deadline handler.
    ///
    /// The timer source has been observed firing long before the programmed
    /// timeout on the target platform. Until the root cause is understood the
    /// handler re-arms with the remaining time instead of failing the
    /// exchange; only a fire with the full timeout elapsed counts.
    pub fn on_deadline(&mut self) {
        self.deadline.disarm();

        let elapsed = self.deadline.enabled_at.elapsed();
        if elapsed < self.response_timeout {
            log::debug!("Deadline fired early after {elapsed:?}, re-arming for the remainder");
            self.deadline.arm(self.response_timeout - elapsed);
            return;
        }

        log::debug!("Current request timed out, moving on");
        self.fail_exchange();
    }

    /// Round-robin advance: reset per-exchange state, pick the next slave,
    /// synthesize an empty poll if its queue is idle and transmit. A failed
    /// write abandons that exchange and keeps advancing.
    fn poll_next_slave(&mut self) {
        loop {
            self.sent_ack_of_data_packet = false;
            self.rx.clear();
            self.current = (self.current + 1) % self.slaves.len() as isize;

            let slave = &mut self.slaves[self.current as usize];
            if slave.head().is_none() {
                log::debug!(
                    "Sending empty packet to slave {} (sequence {})",
                    slave.address(),
                    slave.sequence()
                );
                // Queue is empty here, the push cannot overflow.
                let _ = slave.push(QueuedPacket::empty());
            } else {
                log::debug!(
                    "Sending queued packet to slave {} (sequence {})",
                    slave.address(),
                    slave.sequence()
                );
            }

            if self.send_head_frame() {
                return;
            }
        }
    }

    /// Assemble and transmit the head of the current slave's queue, then
    /// snapshot the frame, raise send-verify and arm the deadline.
    fn send_head_frame(&mut self) -> bool {
        let slave = &self.slaves[self.current as usize];
        let Some(packet) = slave.head() else {
            log::debug!("Slave packet queue empty, moving on");
            return false;
        };
        let frame = frame::assemble(slave.address(), slave.sequence(), &packet.payload);

        match self.bus.write_frame(&frame) {
            Ok(written) if written == frame.len() => {}
            Ok(written) => {
                log::error!(
                    "Short write of {written} of {} frame bytes, abandoning exchange",
                    frame.len()
                );
                return false;
            }
            Err(err) => {
                log::error!("Error sending frame on bus interface: {err}");
                return false;
            }
        }

        self.snapshot = frame;
        self.send_verify = true;
        log::debug!("Sent frame");
        self.deadline.arm(self.response_timeout);
        true
    }

    /// Parse the receive buffer: echo verification while send-verify is
    /// armed, peer-reply interpretation afterwards. Trailing bytes are
    /// shifted to the front and reparsed in the next loop turn.
    fn parse_buffer(&mut self) {
        loop {
            if self.rx.len() < 8 {
                log::debug!("Partial frame received, length byte not yet available");
                return;
            }
            let end = frame::end_index(self.rx[frame::LENGTH_INDEX]);
            if self.rx.len() <= end {
                log::debug!("Partial frame received");
                return;
            }

            if self.send_verify {
                let echo_matches =
                    end + 1 == self.snapshot.len() && self.rx[..=end] == self.snapshot[..];
                if !echo_matches {
                    self.deadline.disarm();
                    log::error!("Send verification failed");
                    self.fail_exchange();
                    return;
                }
                self.send_verify = false;
                log::debug!("Send verification done");

                if self.sent_ack_of_data_packet {
                    // The echo of our ACK closes the exchange.
                    self.deadline.disarm();
                    log::debug!("Processed current request");
                    let slave = &mut self.slaves[self.current as usize];
                    slave.advance_sequence();
                    slave.pop_head();
                    self.poll_next_slave();
                    return;
                } else if self.rx.len() == end + 1 {
                    log::debug!("No more data, waiting for response");
                    self.rx.clear();
                    return;
                } else {
                    log::debug!("Trailing data behind the echo, reparsing");
                    self.rx.drain(..=end);
                    continue;
                }
            }

            let uid = frame::uid(&self.rx);
            // A length byte below the minimum puts the discriminant past the
            // frame; an absent byte reads as zero and classifies as undefined.
            let discriminant = self.rx.get(8).copied().unwrap_or(0);

            if uid == 0 && self.rx[frame::LENGTH_INDEX] == 8 && discriminant == 0 {
                // Empty reply: the slave had nothing to send.
                if let Some(field) = self.reply_mismatch(end) {
                    self.deadline.disarm();
                    log::error!("Wrong {field} in received empty packet, moving on");
                    self.fail_exchange();
                    return;
                }
                self.deadline.disarm();
                log::debug!("Received empty packet, processed current request");
                let slave = &mut self.slaves[self.current as usize];
                slave.advance_sequence();
                slave.pop_head();
                self.poll_next_slave();
                return;
            } else if uid != 0 && discriminant != 0 {
                // Data reply: hand the packet to the host and ACK it.
                if let Some(field) = self.reply_mismatch(end) {
                    self.deadline.disarm();
                    log::error!("Wrong {field} in received data packet, moving on");
                    self.fail_exchange();
                    return;
                }
                log::debug!("Data packet received");

                let length = self.rx[frame::LENGTH_INDEX] as usize;
                self.host.dispatch_response(&self.rx[3..3 + length]);
                let address = self.rx[0];
                self.host.add_recipient(uid, address);
                log::debug!("Dispatched packet and updated recipient");

                // The ACK replaces the queue head; its echo completes the
                // exchange. The deadline stays armed across the send.
                if let Some(head) = self.slaves[self.current as usize].head_mut() {
                    *head = QueuedPacket::empty();
                }
                self.rx.clear();
                self.sent_ack_of_data_packet = true;
                log::debug!("Sending ACK of the data packet");
                if !self.send_head_frame() {
                    self.poll_next_slave();
                }
                return;
            } else {
                self.deadline.disarm();
                log::error!("Undefined packet");
                self.fail_exchange();
                return;
            }
        }
    }

    /// Validate a peer reply against the outstanding request. Address,
    /// function code and sequence come from the snapshot; the CRC is
    /// recomputed over the span the reply's own length byte describes.
    fn reply_mismatch(&self, end: usize) -> Option<&'static str> {
        if self.rx[0] != self.snapshot[0] {
            return Some("address");
        }
        if self.rx[1] != self.snapshot[1] {
            return Some("function code");
        }
        if self.rx[2] != self.snapshot[2] {
            return Some("sequence number");
        }
        let calculated = crc16(&self.rx[..end - 1]);
        let on_wire = (self.rx[end - 1] as u16) << 8 | self.rx[end] as u16;
        if calculated != on_wire {
            return Some("CRC16 checksum");
        }
        None
    }

    /// Shared failure tail: empty polls advance the sequence even on
    /// failure so a powered-off slave cannot wedge it, data packets burn one
    /// retry, and polling moves on.
    fn fail_exchange(&mut self) {
        if self.current_request_is_empty() {
            log::debug!("Updating sequence");
            self.slaves[self.current as usize].advance_sequence();
        }
        self.pop_head_if_exhausted();
        self.poll_next_slave();
    }

    /// Whether the frame in flight was a synthesized empty poll or ACK,
    /// judged from the snapshot.
    fn current_request_is_empty(&self) -> bool {
        self.snapshot.len() >= 9
            && self.snapshot[3..7] == [0, 0, 0, 0]
            && self.snapshot[frame::LENGTH_INDEX] == 8
            && self.snapshot[8] == 0
    }

    fn pop_head_if_exhausted(&mut self) {
        let slave = &mut self.slaves[self.current as usize];
        let exhausted = match slave.head_mut() {
            Some(head) => {
                head.tries_left -= 1;
                head.tries_left == 0
            }
            None => false,
        };
        if exhausted {
            slave.pop_head();
        }
    }
}
