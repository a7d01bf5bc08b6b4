use webrtc::rtp;

use crate::transport::rtc::OPUS_CLOCK_RATE;

/// One slot per 16-bit sequence number.
pub const BUFFER_SIZE: usize = 65536;
/// Packets trailing the forwarding timestamp by more than this are stale. Half a second of audio.
pub const PACKET_EXPIRATION: u32 = OPUS_CLOCK_RATE / 2;
/// At most this many losses are reported for a single sequence jump.
pub const MAX_LOST_PER_PACKET: u16 = 16;

/// Signed distance from `earlier` to `later` in RTP timestamp serial arithmetic. Positive when `later` is newer, across a wrap of the 32-bit clock.
pub fn timestamp_delta(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// A sequence number that was skipped when the stream advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostPacket {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// What [`RelayBuffer::ingest`] did with a packet.
#[derive(Debug, PartialEq, Eq)]
pub enum Ingest {
    /// The packet advanced the stream and must be forwarded. Carries the sequence numbers skipped by this jump.
    Forward(Vec<LostPacket>),
    /// A late packet within the expiration window. Kept for retransmission, never forwarded.
    Stored,
    /// The slot already holds a packet at least as new.
    Duplicate,
    Expired,
    /// Same timestamp as the last forwarded packet.
    Stalled,
}

/// Ring of the most recently relayed packets, indexed by sequence number.
pub struct RelayBuffer {
    slots: Box<[Option<Box<rtp::packet::Packet>>]>,
    timestamp: u32,
    sequence: u16,
    started: bool,
}

impl std::fmt::Debug for RelayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuffer")
            .field("timestamp", &self.timestamp)
            .field("sequence", &self.sequence)
            .field("started", &self.started)
            .finish()
    }
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBuffer {
    pub fn new() -> Self {
        let slots = (0..BUFFER_SIZE)
            .map(|_| None)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            timestamp: 0,
            sequence: 0,
            started: false,
        }
    }

    /// Highest timestamp forwarded so far.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Sequence number of the packet carrying [`Self::timestamp`].
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn ingest(&mut self, packet: &rtp::packet::Packet) -> Ingest {
        let sequence = packet.header.sequence_number;
        let timestamp = packet.header.timestamp;

        if let Some(old) = &self.slots[sequence as usize] {
            if timestamp_delta(timestamp, old.header.timestamp) <= 0 {
                return Ingest::Duplicate;
            }
        }

        if !self.started {
            self.started = true;
            self.advance(packet);
            return Ingest::Forward(vec![]);
        }

        if self.is_expired(timestamp) {
            return Ingest::Expired;
        }
        if timestamp == self.timestamp {
            return Ingest::Stalled;
        }
        if timestamp_delta(timestamp, self.timestamp) > 0 {
            let lost = self.detect_loss(packet);
            self.advance(packet);
            return Ingest::Forward(lost);
        }

        self.slots[sequence as usize] = Some(Box::new(packet.clone()));
        Ingest::Stored
    }

    /// Returns the buffered packet for `sequence` unless it has expired.
    pub fn lookup(&self, sequence: u16) -> Option<&rtp::packet::Packet> {
        self.slots[sequence as usize]
            .as_deref()
            .filter(|p| !self.is_expired(p.header.timestamp))
    }

    fn is_expired(&self, timestamp: u32) -> bool {
        timestamp_delta(self.timestamp, timestamp) > PACKET_EXPIRATION as i32
    }

    fn advance(&mut self, packet: &rtp::packet::Packet) {
        self.timestamp = packet.header.timestamp;
        self.sequence = packet.header.sequence_number;
        self.slots[self.sequence as usize] = Some(Box::new(packet.clone()));
    }

    fn detect_loss(&self, packet: &rtp::packet::Packet) -> Vec<LostPacket> {
        let timestamp = packet.header.timestamp;
        // After a long silence the skipped packets are not worth recovering.
        if timestamp_delta(timestamp, self.timestamp) > (PACKET_EXPIRATION / 2) as i32 {
            return vec![];
        }

        let gap = packet
            .header
            .sequence_number
            .wrapping_sub(self.sequence);
        if gap <= 1 {
            return vec![];
        }

        let count = (gap - 1).min(MAX_LOST_PER_PACKET);
        (0..count)
            .map(|i| LostPacket {
                sequence_number: packet.header.sequence_number.wrapping_sub(count - i),
                timestamp,
                ssrc: packet.header.ssrc,
            })
            .collect()
    }
}
