//! Segmentation state machines (Clause 5.2-5.4).
//!
//! BACnet segmentation is strictly in order: a receiver acknowledges every
//! `actual_window_size` segments, answers duplicates with a re-ACK, and
//! answers gaps with a negative SegmentACK naming the last good sequence
//! number. A sender keeps at most one window of unacknowledged segments in
//! flight; the window is negotiated at transaction start and fixed.
//!
//! Both machines are pure state: the transaction manager drives them with
//! decoded PDUs and performs the actual sends.

/// Largest number of segments a single message may occupy; sequence numbers
/// are eight bits and must not wrap within one window cycle.
pub const MAX_SEGMENTS: usize = 256;

/// What the sender should do after an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderProgress {
    /// All segments acknowledged.
    Complete,
    /// More segments may be sent; call [`SegmentSender::next_batch`].
    Continue,
    /// The ACK did not advance the window (duplicate or stale).
    NoProgress,
}

/// Sender half: splits a service-data body into segments and tracks the
/// sliding window.
#[derive(Debug)]
pub struct SegmentSender {
    segments: Vec<Vec<u8>>,
    /// Fixed after negotiation.
    window_size: u8,
    /// Index of the first unacknowledged segment.
    base: usize,
    /// Index of the next segment to transmit.
    next: usize,
}

impl SegmentSender {
    /// Split `data` so no segment exceeds `max_segment_len`. Fails when the
    /// body would need more than [`MAX_SEGMENTS`] segments.
    pub fn new(data: &[u8], max_segment_len: usize, proposed_window: u8) -> Option<Self> {
        assert!(max_segment_len > 0);
        let count = data.len().div_ceil(max_segment_len).max(1);
        if count > MAX_SEGMENTS {
            return None;
        }
        let segments = data
            .chunks(max_segment_len)
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();
        let segments = if segments.is_empty() {
            vec![Vec::new()]
        } else {
            segments
        };
        Some(Self {
            segments,
            window_size: proposed_window.max(1),
            base: 0,
            next: 0,
        })
    }

    /// Total number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Negotiated window size.
    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// Segments to transmit now: everything unsent within the current
    /// window. Each entry is `(sequence_number, more_follows, payload)`.
    pub fn next_batch(&mut self) -> Vec<(u8, bool, Vec<u8>)> {
        let window_end = (self.base + self.window_size as usize).min(self.segments.len());
        let mut batch = Vec::new();
        while self.next < window_end {
            let seq = (self.next % 256) as u8;
            let more = self.next + 1 < self.segments.len();
            batch.push((seq, more, self.segments[self.next].clone()));
            self.next += 1;
        }
        batch
    }

    /// Apply a SegmentACK. Both polarities acknowledge every segment up
    /// through `sequence`; a negative ACK additionally rewinds transmission
    /// so the segment after `sequence` is resent.
    pub fn handle_ack(&mut self, sequence: u8, actual_window: u8, negative: bool) -> SenderProgress {
        // Map the 8-bit sequence back onto an absolute index relative to
        // the window base. A delta at or past the window is a stale ACK
        // (or a NAK of base-1, meaning nothing new was received).
        let base_seq = (self.base % 256) as u8;
        let delta = sequence.wrapping_sub(base_seq) as usize;
        let in_window = delta < self.window_size as usize
            && self.base + delta < self.segments.len();

        if negative {
            if in_window {
                self.base += delta + 1;
            }
            self.next = self.base;
            return SenderProgress::Continue;
        }

        if !in_window {
            return SenderProgress::NoProgress;
        }
        self.base += delta + 1;
        if self.next < self.base {
            self.next = self.base;
        }
        if actual_window > 0 {
            self.window_size = actual_window;
        }
        if self.base >= self.segments.len() {
            SenderProgress::Complete
        } else {
            SenderProgress::Continue
        }
    }

    /// True once every segment is acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base >= self.segments.len()
    }
}

/// What the receiver should do with an arriving segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverAction {
    /// Send a positive SegmentACK for `sequence` and wait for more.
    Ack { sequence: u8 },
    /// Send a negative SegmentACK for `sequence` (out-of-order arrival).
    Nak { sequence: u8 },
    /// Keep waiting; no ACK due yet.
    Pending,
    /// Message complete: final ACK for `sequence`, assembled body returned.
    Complete { sequence: u8, data: Vec<u8> },
}

/// Receiver half: strict in-order reassembly with windowed ACKs.
#[derive(Debug)]
pub struct SegmentReassembler {
    assembled: Vec<u8>,
    expected: usize,
    /// Negotiated as `min(proposed, own_max)` on the first segment.
    window_size: u8,
    since_last_ack: usize,
}

impl SegmentReassembler {
    pub fn new(proposed_window: u8, own_max_window: u8) -> Self {
        Self {
            assembled: Vec::new(),
            expected: 0,
            window_size: proposed_window.clamp(1, own_max_window.max(1)),
            since_last_ack: 0,
        }
    }

    /// Negotiated window size, reported back in every ACK.
    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// Accept one segment.
    pub fn accept(&mut self, sequence: u8, more_follows: bool, data: &[u8]) -> ReceiverAction {
        let expected_seq = (self.expected % 256) as u8;
        if sequence == expected_seq {
            self.assembled.extend_from_slice(data);
            self.expected += 1;
            self.since_last_ack += 1;
            if !more_follows {
                self.since_last_ack = 0;
                return ReceiverAction::Complete {
                    sequence,
                    data: std::mem::take(&mut self.assembled),
                };
            }
            if self.since_last_ack >= self.window_size as usize {
                self.since_last_ack = 0;
                return ReceiverAction::Ack { sequence };
            }
            return ReceiverAction::Pending;
        }

        // Duplicate of an already-assembled segment: re-ACK so the sender
        // advances.
        let last_good = (self.expected.wrapping_sub(1) % 256) as u8;
        if self.expected > 0 && sequence.wrapping_sub(expected_seq) as usize > MAX_SEGMENTS / 2 {
            self.since_last_ack = 0;
            return ReceiverAction::Ack { sequence: last_good };
        }

        // Gap: ask for a retransmit after the last good segment.
        self.since_last_ack = 0;
        ReceiverAction::Nak { sequence: last_good }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a complete sender/receiver exchange and return the reassembled
    /// body.
    fn pump(data: &[u8], max_segment: usize, window: u8) -> Vec<u8> {
        let mut sender = SegmentSender::new(data, max_segment, window).unwrap();
        let mut receiver = SegmentReassembler::new(window, 16);
        loop {
            let batch = sender.next_batch();
            assert!(!batch.is_empty(), "sender stalled");
            let mut done = None;
            for (seq, more, payload) in batch {
                match receiver.accept(seq, more, &payload) {
                    ReceiverAction::Pending => {}
                    ReceiverAction::Ack { sequence } => {
                        assert_ne!(
                            sender.handle_ack(sequence, receiver.window_size(), false),
                            SenderProgress::NoProgress
                        );
                    }
                    ReceiverAction::Complete { sequence, data } => {
                        sender.handle_ack(sequence, receiver.window_size(), false);
                        done = Some(data);
                    }
                    ReceiverAction::Nak { .. } => panic!("in-order pump saw a gap"),
                }
            }
            if let Some(data) = done {
                assert!(sender.is_complete());
                return data;
            }
        }
    }

    #[test]
    fn single_segment_round_trip() {
        assert_eq!(pump(b"hello", 50, 4), b"hello");
    }

    #[test]
    fn multi_segment_round_trip_various_boundaries() {
        let body: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        for max_segment in [1usize.max(body.len() / 255), 50, 64, 333, 1476] {
            for window in [1u8, 2, 4, 16] {
                assert_eq!(pump(&body, max_segment, window), body, "seg {max_segment} win {window}");
            }
        }
    }

    #[test]
    fn reassembles_at_max_segment_count() {
        // 256 segments of 4 bytes each.
        let body: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let mut sender = SegmentSender::new(&body, 4, 8).unwrap();
        assert_eq!(sender.segment_count(), 256);
        let reassembled = pump(&body, 4, 8);
        assert_eq!(reassembled, body);
        assert!(sender.next_batch().len() <= 8);
    }

    #[test]
    fn too_many_segments_refused() {
        let body = vec![0u8; MAX_SEGMENTS * 4 + 1];
        assert!(SegmentSender::new(&body, 4, 8).is_none());
    }

    #[test]
    fn window_limits_in_flight_segments() {
        let body = vec![0xAA; 100];
        let mut sender = SegmentSender::new(&body, 10, 3).unwrap();
        let batch = sender.next_batch();
        assert_eq!(batch.len(), 3);
        // Nothing more until an ACK arrives.
        assert!(sender.next_batch().is_empty());

        assert_eq!(sender.handle_ack(2, 3, false), SenderProgress::Continue);
        assert_eq!(sender.next_batch().len(), 3);
    }

    #[test]
    fn gap_produces_negative_ack_and_retransmit() {
        let body = vec![0x55; 40];
        let mut sender = SegmentSender::new(&body, 10, 4).unwrap();
        let batch = sender.next_batch();
        assert_eq!(batch.len(), 4);

        let mut receiver = SegmentReassembler::new(4, 16);
        // Deliver segment 0, skip 1, deliver 2.
        assert_eq!(
            receiver.accept(batch[0].0, batch[0].1, &batch[0].2),
            ReceiverAction::Pending
        );
        let action = receiver.accept(batch[2].0, batch[2].1, &batch[2].2);
        assert_eq!(action, ReceiverAction::Nak { sequence: 0 });

        // Sender rewinds to segment 1.
        assert_eq!(sender.handle_ack(0, 4, true), SenderProgress::Continue);
        let resent = sender.next_batch();
        assert_eq!(resent[0].0, 1);
    }

    #[test]
    fn duplicate_segment_is_reacked() {
        let mut receiver = SegmentReassembler::new(4, 16);
        assert_eq!(receiver.accept(0, true, &[1]), ReceiverAction::Pending);
        assert_eq!(receiver.accept(1, true, &[2]), ReceiverAction::Pending);
        // Segment 1 again: duplicate, re-ACK the last good sequence.
        assert_eq!(receiver.accept(1, true, &[2]), ReceiverAction::Ack { sequence: 1 });
    }

    #[test]
    fn window_negotiation_is_min_of_proposed_and_own() {
        let receiver = SegmentReassembler::new(64, 16);
        assert_eq!(receiver.window_size(), 16);
        let receiver = SegmentReassembler::new(2, 16);
        assert_eq!(receiver.window_size(), 2);
    }
}
