use crate::pacing::Pacer;
use crate::transport::DataSocket;
use crate::udp_packet::{wall_clock, SequenceTracker, UdpHeader};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

/// How a transfer is booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accounting {
    /// Official counters: the session is running and past the warm-up
    Counted,
    /// Warm-up period, reported in intervals flagged as omitted
    Omitted,
    /// Outside the running window; drained but not counted
    Uncounted,
}

/// One interval snapshot of a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalResult {
    /// Offset of the interval start from the test start
    pub start: Duration,
    pub end: Duration,
    pub bytes: u64,
    pub packets: u64,
    pub omitted: bool,
}

impl IntervalResult {
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.end.saturating_sub(self.start).as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 * 8.0 / secs
        } else {
            0.0
        }
    }
}

/// Byte counters of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_omitted: u64,
    /// Bytes drained outside the running window
    pub bytes_late: u64,
    pub interval_bytes: u64,
    pub interval_packets: u64,
}

/// One data connection of a session.
///
/// A stream either sends or receives for this endpoint. It owns a
/// reusable buffer of one block, its counters and its interval history.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    sender: bool,
    socket: DataSocket,
    buffer: Vec<u8>,
    block_size: usize,
    counters: StreamCounters,
    intervals: Vec<IntervalResult>,
    test_start: Instant,
    interval_start: Instant,
    pacer: Option<Pacer>,
    green_light: bool,
    closed: bool,
    next_sequence: u32,
    tracker: Option<SequenceTracker>,
}

impl Stream {
    /// Wraps an authenticated data socket.
    ///
    /// `rate` is the per-stream pacing target in bits per second; zero
    /// disables pacing.
    pub fn new(id: u32, socket: DataSocket, sender: bool, block_size: usize, rate: u64, now: Instant) -> Self {
        let udp = !socket.is_tcp();
        Self {
            id,
            sender,
            socket,
            buffer: vec![0u8; block_size],
            block_size,
            counters: StreamCounters::default(),
            intervals: Vec::new(),
            test_start: now,
            interval_start: now,
            pacer: (sender && rate > 0).then(|| Pacer::new(rate, now)),
            green_light: true,
            closed: false,
            next_sequence: 0,
            tracker: (udp && !sender).then(SequenceTracker::new),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_sender(&self) -> bool {
        self.sender
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_tcp(&self) -> bool {
        self.socket.is_tcp()
    }

    pub fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    pub fn intervals(&self) -> &[IntervalResult] {
        &self.intervals
    }

    pub fn tracker(&self) -> Option<&SequenceTracker> {
        self.tracker.as_ref()
    }

    pub fn blocks_sent(&self) -> u64 {
        self.counters.bytes_sent / self.block_size.max(1) as u64
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    pub fn retransmits(&self) -> Option<u64> {
        self.socket.retransmits()
    }

    pub fn pacing_rate(&self) -> Option<u64> {
        self.pacer.as_ref().map(Pacer::rate)
    }

    /// Whether the stream belongs in the readiness set right now.
    ///
    /// Receivers are always polled so late data is drained. Senders are
    /// polled only while sending is allowed and their pacing budget is open.
    pub fn wants_io(&self, sending_allowed: bool) -> bool {
        !self.closed && (!self.sender || (sending_allowed && self.green_light))
    }

    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_ready(cx, self.sender)
    }

    pub fn is_soft_error(&self, err: &io::Error) -> bool {
        self.socket.is_soft_error(err)
    }

    /// Resets the stream for the start of the test.
    pub fn start(&mut self, now: Instant) {
        self.counters = StreamCounters::default();
        self.intervals.clear();
        self.test_start = now;
        self.interval_start = now;
        self.green_light = true;
        if let Some(pacer) = &mut self.pacer {
            pacer.restart(now);
        }
    }

    /// Clears the official counters when the warm-up ends. Omitted
    /// intervals already recorded are kept.
    pub fn end_warmup(&mut self, now: Instant) {
        let omitted = self.counters.bytes_omitted;
        self.counters = StreamCounters {
            bytes_omitted: omitted,
            ..StreamCounters::default()
        };
        self.test_start = now;
        self.interval_start = now;
        self.green_light = true;
        if let Some(pacer) = &mut self.pacer {
            pacer.restart(now);
        }
        if let Some(tracker) = &mut self.tracker {
            tracker.reset_counts();
        }
    }

    /// Re-evaluates the pacing budget.
    pub fn refresh_green_light(&mut self, now: Instant) {
        if let Some(pacer) = &self.pacer {
            self.green_light = pacer.green_light(now);
        }
    }

    /// Attempts one send of up to one block.
    pub fn send(&mut self, now: Instant, accounting: Accounting) -> io::Result<usize> {
        let udp = !self.socket.is_tcp();
        let sequence = self.next_sequence.wrapping_add(1);
        if udp {
            UdpHeader::now(sequence).write_to(&mut self.buffer);
        }

        let n = self.socket.try_send(&self.buffer)?;
        if udp {
            self.next_sequence = sequence;
        }
        if let Some(pacer) = &mut self.pacer {
            pacer.record(n);
            self.green_light = pacer.green_light(now);
        }

        match accounting {
            Accounting::Counted => {
                self.counters.bytes_sent += n as u64;
                self.counters.packets_sent += 1;
                self.count_interval(n);
            }
            Accounting::Omitted => {
                self.counters.bytes_omitted += n as u64;
                self.count_interval(n);
            }
            Accounting::Uncounted => {}
        }
        Ok(n)
    }

    /// Attempts one receive of up to one block.
    ///
    /// Returns `Ok(None)` when a TCP peer closed its end; the stream then
    /// leaves the readiness set.
    pub fn recv(&mut self, accounting: Accounting) -> io::Result<Option<usize>> {
        let n = self.socket.try_recv(&mut self.buffer)?;
        if n == 0 && self.socket.is_tcp() {
            self.closed = true;
            return Ok(None);
        }

        if accounting != Accounting::Uncounted {
            if let Some(tracker) = &mut self.tracker {
                if let Some(header) = UdpHeader::parse(&self.buffer[..n]) {
                    tracker.observe(&header, wall_clock());
                }
            }
        }

        match accounting {
            Accounting::Counted => {
                self.counters.bytes_received += n as u64;
                self.count_interval(n);
            }
            Accounting::Omitted => {
                self.counters.bytes_omitted += n as u64;
                self.count_interval(n);
            }
            Accounting::Uncounted => self.counters.bytes_late += n as u64,
        }
        Ok(Some(n))
    }

    fn count_interval(&mut self, n: usize) {
        self.counters.interval_bytes += n as u64;
        self.counters.interval_packets += 1;
    }

    /// Closes the current interval and starts the next one at `now`.
    pub fn snapshot_interval(&mut self, now: Instant, test_origin: Instant, omitted: bool) -> IntervalResult {
        let snapshot = IntervalResult {
            start: self.interval_start.saturating_duration_since(test_origin),
            end: now.saturating_duration_since(test_origin),
            bytes: self.counters.interval_bytes,
            packets: self.counters.interval_packets,
            omitted,
        };
        self.intervals.push(snapshot.clone());
        self.counters.interval_bytes = 0;
        self.counters.interval_packets = 0;
        self.interval_start = now;
        snapshot
    }

    /// Time the official counters have been running.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.test_start)
    }

    /// Reads until end-of-file or until nothing arrives for `quiet`,
    /// booking everything as `accounting`.
    pub async fn drain(&mut self, quiet: Duration, accounting: Accounting) -> io::Result<()> {
        while !self.closed {
            match self.recv(accounting) {
                Ok(_) => {}
                Err(e) if self.is_soft_error(&e) => {
                    match tokio::time::timeout(quiet, self.socket.readable()).await {
                        Ok(res) => res?,
                        Err(_) => break,
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Sends FIN on a TCP sender so the peer sees end-of-file.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.socket.shutdown().await
    }
}
