use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};

use super::buffer::{timestamp_delta, LostPacket, PACKET_EXPIRATION};

/// Flush as soon as this many losses are pending.
pub const NACK_BATCH_SIZE: usize = 16;
/// Flush once the oldest pending loss trails the forwarding timestamp by more than this.
pub const NACK_FLUSH_LAG: u32 = PACKET_EXPIRATION / 4;

/// Collects reported losses and folds them into a single NACK pair when it is time to ask for them.
#[derive(Debug, Default)]
pub struct LossBatcher {
    pending: Vec<LostPacket>,
}

impl LossBatcher {
    pub fn push(&mut self, lost: LostPacket) {
        self.pending.push(lost);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Builds a NACK when either flush condition holds for `current_timestamp`.
    ///
    /// Losses covered by the returned pair are removed. Losses beyond the 16 sequence numbers following the base stay pending for the next flush.
    pub fn poll(&mut self, current_timestamp: u32) -> Option<TransportLayerNack> {
        let first = *self.pending.first()?;
        let lagging = timestamp_delta(current_timestamp, first.timestamp) > NACK_FLUSH_LAG as i32;
        if self.pending.len() < NACK_BATCH_SIZE && !lagging {
            return None;
        }

        let base = first.sequence_number;
        let mut bitmap: u16 = 0;
        self.pending.retain(|lost| {
            let distance = lost.sequence_number.wrapping_sub(base);
            match distance {
                0 => false,
                1..=16 => {
                    bitmap |= 1 << (distance - 1);
                    false
                }
                _ => true,
            }
        });

        Some(TransportLayerNack {
            sender_ssrc: first.ssrc,
            media_ssrc: first.ssrc,
            nacks: vec![NackPair {
                packet_id: base,
                lost_packets: bitmap,
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost(sequence_number: u16, timestamp: u32) -> LostPacket {
        LostPacket {
            sequence_number,
            timestamp,
            ssrc: 1234,
        }
    }

    #[test]
    fn waits_while_below_both_thresholds() {
        let mut batcher = LossBatcher::default();
        assert!(batcher.poll(0).is_none());
        for seq in 10..25 {
            batcher.push(lost(seq, 1000));
        }
        assert!(batcher.poll(1000 + NACK_FLUSH_LAG).is_none());
        assert_eq!(batcher.len(), 15);
    }

    #[test]
    fn flushes_on_batch_size() {
        let mut batcher = LossBatcher::default();
        for seq in 10..26 {
            batcher.push(lost(seq, 1000));
        }
        let nack = batcher.poll(1000).unwrap();
        assert_eq!(nack.media_ssrc, 1234);
        assert_eq!(nack.nacks.len(), 1);
        assert_eq!(nack.nacks[0].packet_id, 10);
        assert_eq!(nack.nacks[0].packet_list(), (10..26).collect::<Vec<u16>>());
        assert!(batcher.is_empty());
    }

    #[test]
    fn flushes_on_lag() {
        let mut batcher = LossBatcher::default();
        batcher.push(lost(50, 49 * 960));
        batcher.push(lost(52, 51 * 960));
        let nack = batcher.poll(49 * 960 + NACK_FLUSH_LAG + 1).unwrap();
        assert_eq!(nack.nacks[0].packet_id, 50);
        assert_eq!(nack.nacks[0].lost_packets, 0b10);
        assert_eq!(nack.nacks[0].packet_list(), vec![50, 52]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn bitmap_wraps_around() {
        let mut batcher = LossBatcher::default();
        batcher.push(lost(65535, 1000));
        batcher.push(lost(0, 1000));
        batcher.push(lost(1, 1000));
        let nack = batcher.poll(1000 + NACK_FLUSH_LAG + 1).unwrap();
        assert_eq!(nack.nacks[0].packet_id, 65535);
        assert_eq!(nack.nacks[0].lost_packets, 0b11);
    }

    #[test]
    fn lag_is_measured_across_timestamp_wrap() {
        let mut batcher = LossBatcher::default();
        batcher.push(lost(7, u32::MAX - 1000));
        assert!(batcher.poll(u32::MAX).is_none());
        let nack = batcher.poll(NACK_FLUSH_LAG).unwrap();
        assert_eq!(nack.nacks[0].packet_list(), vec![7]);
    }

    #[test]
    fn distant_losses_stay_pending() {
        let mut batcher = LossBatcher::default();
        batcher.push(lost(100, 1000));
        batcher.push(lost(117, 1000));
        let nack = batcher.poll(1000 + NACK_FLUSH_LAG + 1).unwrap();
        assert_eq!(nack.nacks[0].packet_list(), vec![100]);
        assert_eq!(batcher.len(), 1);
    }
}
