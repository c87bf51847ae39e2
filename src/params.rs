//! Test parameters: what the initiator asks for and what both ends run with.
//!
//! [`Requested`] is built by the initiator from its [`Config`] before any
//! negotiation. It is serialized to [`WireParams`] and sent over the control
//! connection. Both ends then derive the same [`Negotiated`] value from that
//! blob, so the settings a test actually runs with are immutable and
//! identical on both sides.

use crate::config::{Config, Mode, Protocol, Role, MAX_BLOCKSIZE, MAX_STREAMS, MAX_UDP_BLOCKSIZE, MIN_UDP_BLOCKSIZE};
use crate::error::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TCP block size.
pub const DEFAULT_TCP_BLKSIZE: usize = 128 * 1024;
/// Default UDP block size when the control connection's MSS is unknown.
pub const DEFAULT_UDP_BLKSIZE: usize = 1460;
/// Default per-stream UDP rate in bits per second.
pub const DEFAULT_UDP_RATE: u64 = 1024 * 1024;
/// Default pacing check period.
pub const DEFAULT_PACING_INTERVAL: Duration = Duration::from_millis(1);

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

fn one() -> u32 {
    1
}

/// Parameter blob as exchanged on the control connection.
///
/// Field names follow the iperf3 JSON keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireParams {
    #[serde(default, skip_serializing_if = "is_false")]
    pub tcp: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub udp: bool,
    #[serde(default)]
    pub omit: u64,
    #[serde(default)]
    pub time: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub blockcount: u64,
    #[serde(rename = "MSS", default, skip_serializing_if = "is_zero_u32")]
    pub mss: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub nodelay: bool,
    #[serde(default = "one")]
    pub parallel: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reverse: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bidirectional: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub window: u64,
    #[serde(default)]
    pub len: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bandwidth: u64,
    /// Pacing check period in microseconds
    #[serde(default)]
    pub pacing_timer: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

/// Settings the initiator asks for, with protocol defaults resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Requested {
    pub protocol: Protocol,
    pub mode: Mode,
    pub duration: Duration,
    pub omit: Duration,
    pub bytes: Option<u64>,
    pub blocks: Option<u64>,
    pub block_size: usize,
    pub num_streams: usize,
    pub rate: u64,
    pub pacing_interval: Duration,
    pub mss: Option<u32>,
    pub no_delay: bool,
    pub socket_buffer_size: Option<usize>,
}

impl Requested {
    /// Resolves the initiator's configuration into a parameter request.
    ///
    /// `ctrl_mss` is the MSS observed on the control connection; it becomes
    /// the default UDP block size so datagrams are not fragmented.
    pub fn from_config(config: &Config, ctrl_mss: Option<u32>) -> Self {
        let block_size = config.block_size.unwrap_or(match config.protocol {
            Protocol::Tcp => DEFAULT_TCP_BLKSIZE,
            Protocol::Udp => ctrl_mss
                .map(|m| m as usize)
                .filter(|m| (MIN_UDP_BLOCKSIZE..=MAX_UDP_BLOCKSIZE).contains(m))
                .unwrap_or(DEFAULT_UDP_BLKSIZE),
        });
        let rate = config.bandwidth.unwrap_or(match config.protocol {
            Protocol::Tcp => 0,
            Protocol::Udp => DEFAULT_UDP_RATE,
        });
        let duration = if config.bytes.is_some() || config.blocks.is_some() {
            Duration::ZERO
        } else {
            config.duration
        };

        Self {
            protocol: config.protocol,
            mode: config.mode,
            duration,
            omit: config.omit,
            bytes: config.bytes,
            blocks: config.blocks,
            block_size,
            num_streams: config.parallel,
            rate,
            pacing_interval: config.pacing_interval,
            mss: config.mss,
            no_delay: config.no_delay,
            socket_buffer_size: config.socket_buffer_size,
        }
    }

    /// Encodes the request for the parameter exchange.
    pub fn to_wire(&self) -> WireParams {
        WireParams {
            tcp: self.protocol == Protocol::Tcp,
            udp: self.protocol == Protocol::Udp,
            omit: self.omit.as_secs(),
            time: self.duration.as_secs(),
            num: self.bytes.unwrap_or(0),
            blockcount: self.blocks.unwrap_or(0),
            mss: self.mss.unwrap_or(0),
            nodelay: self.no_delay,
            parallel: self.num_streams as u32,
            reverse: self.mode == Mode::Receive,
            bidirectional: self.mode == Mode::Bidirectional,
            window: self.socket_buffer_size.unwrap_or(0) as u64,
            len: self.block_size as u64,
            bandwidth: self.rate,
            pacing_timer: self.pacing_interval.as_micros() as u64,
            client_version: Some(crate::VERSION.to_string()),
        }
    }
}

/// Settings both ends run the test with.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub protocol: Protocol,
    pub mode: Mode,
    /// Zero when the test ends on a byte or block target
    pub duration: Duration,
    pub omit: Duration,
    /// Byte target, zero for none
    pub bytes: u64,
    /// Block target, zero for none
    pub blocks: u64,
    pub block_size: usize,
    pub num_streams: usize,
    /// Per-stream rate in bits per second, zero for unlimited
    pub rate: u64,
    pub pacing_interval: Duration,
    pub mss: u32,
    pub no_delay: bool,
    pub socket_buffer_size: usize,
    pub peer_version: Option<String>,
}

impl Negotiated {
    /// Decodes and checks a received parameter blob.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the peer asks for more than the
    /// protocol limits allow.
    pub fn from_wire(wire: &WireParams) -> Result<Self> {
        let protocol = if wire.udp { Protocol::Udp } else { Protocol::Tcp };
        let mode = if wire.bidirectional {
            Mode::Bidirectional
        } else if wire.reverse {
            Mode::Receive
        } else {
            Mode::Send
        };

        let block_size = match (wire.len as usize, protocol) {
            (0, Protocol::Tcp) => DEFAULT_TCP_BLKSIZE,
            (0, Protocol::Udp) => DEFAULT_UDP_BLKSIZE,
            (len, _) => len,
        };
        match protocol {
            Protocol::Tcp if block_size > MAX_BLOCKSIZE => {
                return Err(Error::config(
                    ErrorCode::BlockSize,
                    format!("peer requested block size {}", block_size),
                ))
            }
            Protocol::Udp if !(MIN_UDP_BLOCKSIZE..=MAX_UDP_BLOCKSIZE).contains(&block_size) => {
                return Err(Error::config(
                    ErrorCode::UdpBlockSize,
                    format!("peer requested UDP block size {}", block_size),
                ))
            }
            _ => {}
        }

        let num_streams = wire.parallel as usize;
        if num_streams == 0 || num_streams > MAX_STREAMS {
            return Err(Error::config(
                ErrorCode::NumStreams,
                format!("peer requested {} streams", num_streams),
            ));
        }

        let pacing_interval = if wire.pacing_timer == 0 {
            DEFAULT_PACING_INTERVAL
        } else {
            Duration::from_micros(wire.pacing_timer)
        };

        Ok(Self {
            protocol,
            mode,
            duration: Duration::from_secs(wire.time),
            omit: Duration::from_secs(wire.omit),
            bytes: wire.num,
            blocks: wire.blockcount,
            block_size,
            num_streams,
            rate: wire.bandwidth,
            pacing_interval,
            mss: wire.mss,
            no_delay: wire.nodelay,
            socket_buffer_size: wire.window as usize,
            peer_version: wire.client_version.clone(),
        })
    }

    /// Number of data streams on which an endpoint playing `role` sends.
    pub fn send_streams(&self, role: Role) -> usize {
        if self.mode.sends(role) {
            self.num_streams
        } else {
            0
        }
    }

    /// Number of data streams on which an endpoint playing `role` receives.
    pub fn receive_streams(&self, role: Role) -> usize {
        if self.mode.receives(role) {
            self.num_streams
        } else {
            0
        }
    }

    /// Total data connections of the test.
    pub fn total_streams(&self) -> usize {
        match self.mode {
            Mode::Bidirectional => self.num_streams * 2,
            _ => self.num_streams,
        }
    }

    /// Whether bind-time socket options were requested.
    pub fn has_bind_options(&self) -> bool {
        self.no_delay || self.mss > 0 || self.socket_buffer_size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiate(config: &Config) -> Negotiated {
        let wire = Requested::from_config(config, None).to_wire();
        let json = serde_json::to_vec(&wire).unwrap();
        let decoded: WireParams = serde_json::from_slice(&json).unwrap();
        Negotiated::from_wire(&decoded).unwrap()
    }

    #[test]
    fn test_tcp_defaults() {
        let config = Config::client("127.0.0.1".to_string(), 5201);
        let requested = Requested::from_config(&config, Some(1448));
        assert_eq!(requested.block_size, DEFAULT_TCP_BLKSIZE);
        assert_eq!(requested.rate, 0);
        assert_eq!(requested.duration, Duration::from_secs(10));
    }

    #[test]
    fn test_udp_block_size_follows_control_mss() {
        let config = Config::client("127.0.0.1".to_string(), 5201).with_protocol(Protocol::Udp);
        assert_eq!(Requested::from_config(&config, Some(1448)).block_size, 1448);
        assert_eq!(
            Requested::from_config(&config, None).block_size,
            DEFAULT_UDP_BLKSIZE
        );
        assert_eq!(
            Requested::from_config(&config, Some(0)).block_size,
            DEFAULT_UDP_BLKSIZE
        );
        assert_eq!(Requested::from_config(&config, None).rate, DEFAULT_UDP_RATE);
    }

    #[test]
    fn test_byte_target_clears_duration() {
        let config = Config::client("127.0.0.1".to_string(), 5201).with_bytes(1_000_000);
        let negotiated = negotiate(&config);
        assert_eq!(negotiated.duration, Duration::ZERO);
        assert_eq!(negotiated.bytes, 1_000_000);
    }

    #[test]
    fn test_wire_keys() {
        let config = Config::client("127.0.0.1".to_string(), 5201)
            .with_mss(1400)
            .with_mode(Mode::Receive)
            .with_parallel(3);
        let value = serde_json::to_value(Requested::from_config(&config, None).to_wire()).unwrap();

        assert_eq!(value["tcp"], true);
        assert!(value.get("udp").is_none());
        assert_eq!(value["MSS"], 1400);
        assert_eq!(value["reverse"], true);
        assert_eq!(value["parallel"], 3);
        assert_eq!(value["time"], 10);
        assert!(value.get("bidirectional").is_none());
    }

    #[test]
    fn test_both_ends_agree() {
        let config = Config::client("127.0.0.1".to_string(), 5201)
            .with_protocol(Protocol::Udp)
            .with_mode(Mode::Bidirectional)
            .with_parallel(2)
            .with_bandwidth(2_000_000)
            .with_omit(Duration::from_secs(2));
        let negotiated = negotiate(&config);

        assert_eq!(negotiated.protocol, Protocol::Udp);
        assert_eq!(negotiated.mode, Mode::Bidirectional);
        assert_eq!(negotiated.rate, 2_000_000);
        assert_eq!(negotiated.omit, Duration::from_secs(2));
        assert_eq!(negotiated.total_streams(), 4);
        assert_eq!(negotiated.send_streams(Role::Initiator), 2);
        assert_eq!(negotiated.receive_streams(Role::Responder), 2);
    }

    #[test]
    fn test_from_iperf3_blob() {
        let blob = r#"{"tcp":true,"omit":0,"time":5,"parallel":2,"reverse":true,"len":131072,"pacing_timer":1000,"client_version":"3.9"}"#;
        let wire: WireParams = serde_json::from_str(blob).unwrap();
        let negotiated = Negotiated::from_wire(&wire).unwrap();

        assert_eq!(negotiated.protocol, Protocol::Tcp);
        assert_eq!(negotiated.mode, Mode::Receive);
        assert_eq!(negotiated.num_streams, 2);
        assert_eq!(negotiated.send_streams(Role::Responder), 2);
        assert_eq!(negotiated.send_streams(Role::Initiator), 0);
        assert_eq!(negotiated.pacing_interval, Duration::from_millis(1));
        assert_eq!(negotiated.peer_version.as_deref(), Some("3.9"));
        assert!(!negotiated.has_bind_options());
    }

    #[test]
    fn test_rejects_oversized_request() {
        let mut wire = Requested::from_config(&Config::client("h".to_string(), 1), None).to_wire();
        wire.parallel = 500;
        assert_eq!(
            Negotiated::from_wire(&wire).unwrap_err().code(),
            ErrorCode::NumStreams
        );

        wire.parallel = 1;
        wire.len = (MAX_BLOCKSIZE + 1) as u64;
        assert_eq!(
            Negotiated::from_wire(&wire).unwrap_err().code(),
            ErrorCode::BlockSize
        );
    }
}
