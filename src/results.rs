//! End-of-test results: the exchanged payload and the merged report.
//!
//! Each endpoint only knows its own side of every stream: a sender knows
//! what it wrote, a receiver what it read. During `ExchangeResults` both
//! ends send a [`ResultsReport`] with their local figures and merge the
//! peer's figures into their [`TestResults`], matching streams by id.

use crate::config::{Mode, Protocol, Role};
use crate::error::{ErrorCode, Result};
use crate::stream::{IntervalResult, Stream};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-stream entry of the results exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamReport {
    pub id: u32,
    pub bytes: u64,
    #[serde(default)]
    pub retransmits: i64,
    /// Jitter in seconds
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
    pub errors: i64,
    #[serde(default)]
    pub omitted_errors: i64,
    #[serde(default)]
    pub packets: i64,
    #[serde(default)]
    pub omitted_packets: i64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
}

/// Results blob exchanged on the control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsReport {
    #[serde(default)]
    pub cpu_util_total: f64,
    #[serde(default)]
    pub cpu_util_user: f64,
    #[serde(default)]
    pub cpu_util_system: f64,
    #[serde(default)]
    pub sender_has_retransmits: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_used: Option<String>,
    #[serde(default)]
    pub streams: Vec<StreamReport>,
}

/// Final figures of one stream.
///
/// For a sending stream `bytes_sent` is local and `bytes_received` comes
/// from the peer once results were exchanged; the other way round for a
/// receiving stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub id: u32,
    pub sender: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: Option<u64>,
    pub packets: u64,
    pub lost_packets: u64,
    pub out_of_order: u64,
    pub jitter_ms: f64,
    pub duration: Duration,
    pub intervals: Vec<IntervalResult>,
    pub peer_reported: bool,
}

impl StreamSummary {
    pub fn from_stream(stream: &Stream, duration: Duration) -> Self {
        let counters = stream.counters();
        let tracker = stream.tracker();
        let packets = match tracker {
            Some(t) => t.packets(),
            None if !stream.is_tcp() => counters.packets_sent,
            None => 0,
        };
        Self {
            id: stream.id(),
            sender: stream.is_sender(),
            bytes_sent: counters.bytes_sent,
            bytes_received: counters.bytes_received,
            retransmits: if stream.is_sender() {
                stream.retransmits()
            } else {
                None
            },
            packets,
            lost_packets: tracker.map_or(0, |t| t.lost()),
            out_of_order: tracker.map_or(0, |t| t.out_of_order()),
            jitter_ms: tracker.map_or(0.0, |t| t.jitter_ms()),
            duration,
            intervals: stream.intervals().to_vec(),
            peer_reported: false,
        }
    }

    fn local_bytes(&self) -> u64 {
        if self.sender {
            self.bytes_sent
        } else {
            self.bytes_received
        }
    }
}

/// Outcome of one test as seen by one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResults {
    pub role: Role,
    pub protocol: Protocol,
    pub mode: Mode,
    pub cookie: String,
    /// Measured time, excluding the warm-up
    pub duration: Duration,
    pub omitted: Duration,
    /// Official bytes this endpoint sent
    pub bytes_sent: u64,
    /// Official bytes this endpoint received
    pub bytes_received: u64,
    pub streams: Vec<StreamSummary>,
    /// Whether the peer's results were merged in
    pub complete: bool,
}

impl TestResults {
    /// Builds the payload this endpoint sends during the exchange.
    pub fn to_report(&self) -> ResultsReport {
        let has_retransmits = self
            .streams
            .iter()
            .any(|s| s.sender && s.retransmits.is_some());
        let end_time = self.duration.as_secs_f64();

        let streams = self
            .streams
            .iter()
            .map(|s| StreamReport {
                id: s.id,
                bytes: s.local_bytes(),
                retransmits: s.retransmits.map_or(-1, |r| r as i64),
                jitter: s.jitter_ms / 1000.0,
                errors: s.lost_packets as i64,
                omitted_errors: 0,
                packets: s.packets as i64,
                omitted_packets: 0,
                start_time: 0.0,
                end_time,
            })
            .collect();

        ResultsReport {
            cpu_util_total: 0.0,
            cpu_util_user: 0.0,
            cpu_util_system: 0.0,
            sender_has_retransmits: has_retransmits as i32,
            congestion_used: None,
            streams,
        }
    }

    /// Merges the peer's figures into the per-stream summaries.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::StreamId`] if the peer reports a stream this
    /// endpoint does not have.
    pub fn merge_peer(&mut self, peer: &ResultsReport) -> Result<()> {
        for report in &peer.streams {
            let summary = self
                .streams
                .iter_mut()
                .find(|s| s.id == report.id)
                .ok_or(ErrorCode::StreamId)?;

            if summary.sender {
                summary.bytes_received = report.bytes;
                if self.protocol == Protocol::Udp {
                    summary.lost_packets = report.errors.max(0) as u64;
                    summary.jitter_ms = report.jitter * 1000.0;
                }
            } else {
                summary.bytes_sent = report.bytes;
                if peer.sender_has_retransmits == 1 && report.retransmits >= 0 {
                    summary.retransmits = Some(report.retransmits as u64);
                }
                if self.protocol == Protocol::Udp && report.packets > 0 {
                    let sent = report.packets as u64;
                    summary.lost_packets = sent.saturating_sub(summary.packets).max(summary.lost_packets);
                }
            }
            summary.peer_reported = true;
        }
        self.complete = true;
        Ok(())
    }

    /// Bytes the peer reported receiving on this endpoint's sending streams.
    pub fn peer_bytes_received(&self) -> u64 {
        self.streams
            .iter()
            .filter(|s| s.sender)
            .map(|s| s.bytes_received)
            .sum()
    }

    /// Bytes the peer reported sending on this endpoint's receiving streams.
    pub fn peer_bytes_sent(&self) -> u64 {
        self.streams
            .iter()
            .filter(|s| !s.sender)
            .map(|s| s.bytes_sent)
            .sum()
    }

    pub fn sent_bits_per_second(&self) -> f64 {
        bits_per_second(self.bytes_sent, self.duration)
    }

    pub fn received_bits_per_second(&self) -> f64 {
        bits_per_second(self.bytes_received, self.duration)
    }
}

fn bits_per_second(bytes: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}
