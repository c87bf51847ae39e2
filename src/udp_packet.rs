//! Datagram header and receive-side loss accounting for UDP streams.
//!
//! Every datagram a UDP stream sends starts with a 12-byte header:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │   Seconds    │ Microseconds │  Sequence    │   Payload    │
//! │   (4 bytes)  │  (4 bytes)   │  (4 bytes)   │  (variable)  │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! All fields are big-endian. The timestamp is the sender's wall clock and
//! the sequence starts at 1 and increases by one per datagram, as in iperf3.
//!
//! # Jitter
//!
//! Jitter follows RFC 3550:
//! ```text
//! J(i) = J(i-1) + (|D(i-1,i)| - J(i-1)) / 16
//! ```
//! where D(i-1,i) is the difference in relative transit times between
//! consecutive packets.
//!
//! # Examples
//!
//! ```
//! use tperf::udp_packet::{UdpHeader, HEADER_SIZE};
//!
//! let mut datagram = vec![0u8; 1460];
//! UdpHeader::now(42).write_to(&mut datagram);
//! let header = UdpHeader::parse(&datagram).expect("header");
//! assert_eq!(header.sequence, 42);
//! assert!(datagram.len() > HEADER_SIZE);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Size of the datagram header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Timing and sequence header carried by each datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub sec: u32,
    pub usec: u32,
    pub sequence: u32,
}

/// Wall-clock time since the UNIX epoch.
pub fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

impl UdpHeader {
    /// Creates a header stamped with the current wall-clock time.
    pub fn now(sequence: u32) -> Self {
        let now = wall_clock();
        Self {
            sec: now.as_secs() as u32,
            usec: now.subsec_micros(),
            sequence,
        }
    }

    /// Writes the header into the front of `buf`.
    ///
    /// Returns `false` if `buf` is shorter than [`HEADER_SIZE`].
    pub fn write_to(&self, buf: &mut [u8]) -> bool {
        if buf.len() < HEADER_SIZE {
            return false;
        }
        buf[0..4].copy_from_slice(&self.sec.to_be_bytes());
        buf[4..8].copy_from_slice(&self.usec.to_be_bytes());
        buf[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        true
    }

    /// Reads a header from the front of a received datagram.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            sec: u32::from_be_bytes(buf[0..4].try_into().ok()?),
            usec: u32::from_be_bytes(buf[4..8].try_into().ok()?),
            sequence: u32::from_be_bytes(buf[8..12].try_into().ok()?),
        })
    }

    /// Send time as a duration since the UNIX epoch.
    pub fn sent_at(&self) -> Duration {
        Duration::from_secs(self.sec as u64) + Duration::from_micros(self.usec as u64)
    }
}

/// Receive-side loss, reordering and jitter accounting for one stream.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    /// Highest sequence number seen so far
    highest: u64,
    packets: u64,
    lost: u64,
    out_of_order: u64,
    /// Jitter in seconds
    jitter: f64,
    prev_transit: Option<f64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts one received datagram.
    ///
    /// A gap in sequence numbers counts the missing packets as lost. A
    /// packet older than the highest seen is out of order, and it cancels
    /// one earlier loss since it was not lost after all.
    pub fn observe(&mut self, header: &UdpHeader, arrival: Duration) {
        let sequence = header.sequence as u64;
        self.packets += 1;

        if sequence > self.highest {
            self.lost += sequence - 1 - self.highest;
            self.highest = sequence;
        } else {
            self.out_of_order += 1;
            self.lost = self.lost.saturating_sub(1);
        }

        let transit = arrival.as_secs_f64() - header.sent_at().as_secs_f64();
        if let Some(prev) = self.prev_transit {
            let d = (transit - prev).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.prev_transit = Some(transit);
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter * 1000.0
    }

    /// Clears the counters at the end of the warm-up period while keeping
    /// the sequence position, so the first packet after it is not a gap.
    pub fn reset_counts(&mut self) {
        self.packets = 0;
        self.lost = 0;
        self.out_of_order = 0;
        self.jitter = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence: u32, sent_ms: u64) -> UdpHeader {
        let sent = Duration::from_millis(sent_ms);
        UdpHeader {
            sec: sent.as_secs() as u32,
            usec: sent.subsec_micros(),
            sequence,
        }
    }

    #[test]
    fn test_header_layout() {
        let mut buf = [0u8; HEADER_SIZE];
        let h = UdpHeader {
            sec: 1,
            usec: 2,
            sequence: 0x01020304,
        };
        assert!(h.write_to(&mut buf));
        assert_eq!(buf, [0, 0, 0, 1, 0, 0, 0, 2, 1, 2, 3, 4]);
        assert_eq!(UdpHeader::parse(&buf), Some(h));
    }

    #[test]
    fn test_short_buffers() {
        assert!(!UdpHeader::now(1).write_to(&mut [0u8; 8]));
        assert!(UdpHeader::parse(&[0u8; 11]).is_none());
    }

    #[test]
    fn test_in_order_no_loss() {
        let mut tracker = SequenceTracker::new();
        for seq in 1..=10 {
            tracker.observe(&header(seq, seq as u64), Duration::from_millis(seq as u64 + 5));
        }
        assert_eq!(tracker.packets(), 10);
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.out_of_order(), 0);
        assert!(tracker.jitter_ms() < 1e-6);
    }

    #[test]
    fn test_gaps_count_as_loss() {
        let mut tracker = SequenceTracker::new();
        for seq in [1, 2, 5, 6, 10] {
            tracker.observe(&header(seq, 0), Duration::ZERO);
        }
        assert_eq!(tracker.lost(), 5);
        assert_eq!(tracker.packets(), 5);
    }

    #[test]
    fn test_late_packet_cancels_loss() {
        let mut tracker = SequenceTracker::new();
        for seq in [1, 3, 2] {
            tracker.observe(&header(seq, 0), Duration::ZERO);
        }
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.out_of_order(), 1);
    }

    #[test]
    fn test_jitter_tracks_transit_variation() {
        let mut tracker = SequenceTracker::new();
        // Transit alternates between 10 ms and 30 ms.
        for seq in 1..=200u32 {
            let sent = seq as u64 * 100;
            let transit = if seq % 2 == 0 { 30 } else { 10 };
            tracker.observe(&header(seq, sent), Duration::from_millis(sent + transit));
        }
        let jitter = tracker.jitter_ms();
        assert!((jitter - 20.0).abs() < 0.5, "jitter {}", jitter);
    }

    #[test]
    fn test_reset_keeps_sequence_position() {
        let mut tracker = SequenceTracker::new();
        for seq in [1, 4] {
            tracker.observe(&header(seq, 0), Duration::ZERO);
        }
        tracker.reset_counts();
        tracker.observe(&header(5, 0), Duration::ZERO);
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.packets(), 1);
    }
}
