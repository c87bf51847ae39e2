use crate::error::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Longest test a peer may request.
pub const MAX_TIME: Duration = Duration::from_secs(86_400);
/// Upper bound on parallel data streams.
pub const MAX_STREAMS: usize = 128;
/// Largest TCP block size.
pub const MAX_BLOCKSIZE: usize = 1024 * 1024;
/// Smallest UDP block size; must hold the datagram header.
pub const MIN_UDP_BLOCKSIZE: usize = 16;
/// Largest UDP payload over IPv4.
pub const MAX_UDP_BLOCKSIZE: usize = 65_507;
/// Longest warm-up period.
pub const MAX_OMIT: Duration = Duration::from_secs(600);
/// Largest socket buffer that may be requested.
pub const MAX_TCP_BUFFER: usize = 512 * 1024 * 1024;
/// Largest TCP MSS that may be requested.
pub const MAX_MSS: u32 = 9 * 1024;
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Transport protocol used for the data streams.
///
/// The control connection is always TCP; this only selects how data
/// streams are listened for, connected and accounted.
///
/// # Examples
///
/// ```
/// use tperf::{Config, Protocol};
///
/// let config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(10_000_000); // 10 Mbps per stream
/// assert_eq!(config.protocol, Protocol::Udp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Reliable byte streams, one TCP connection per data stream
    Tcp,
    /// Datagrams with sequence-loss and jitter accounting
    Udp,
}

/// Which end of the control connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Opens the control connection and owns the test parameters
    Initiator,
    /// Listens, accepts one session at a time and follows the initiator
    Responder,
}

/// Direction of the data transfer, seen from the initiator.
///
/// # Examples
///
/// ```
/// use tperf::{Mode, Role};
///
/// assert!(Mode::Send.sends(Role::Initiator));
/// assert!(Mode::Send.receives(Role::Responder));
/// assert!(Mode::Receive.sends(Role::Responder));
/// assert!(Mode::Bidirectional.sends(Role::Initiator));
/// assert!(Mode::Bidirectional.receives(Role::Initiator));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Initiator sends, responder receives
    Send,
    /// Responder sends, initiator receives
    Receive,
    /// Both ends send and receive on separate streams
    Bidirectional,
}

impl Mode {
    /// Returns `true` if an endpoint playing `role` pushes bytes in this mode.
    pub fn sends(self, role: Role) -> bool {
        matches!(
            (self, role),
            (Mode::Bidirectional, _) | (Mode::Send, Role::Initiator) | (Mode::Receive, Role::Responder)
        )
    }

    /// Returns `true` if an endpoint playing `role` receives bytes in this mode.
    pub fn receives(self, role: Role) -> bool {
        self == Mode::Bidirectional || !self.sends(role)
    }
}

/// Configuration for one endpoint of a throughput test.
///
/// The initiator's configuration is the source of the test parameters; a
/// responder only uses the listener, socket-option, admission and
/// serve-loop settings and takes everything else from the initiator during
/// parameter exchange.
///
/// # Examples
///
/// ## Initiator sending for 5 seconds on 4 streams
///
/// ```
/// use tperf::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_duration(Duration::from_secs(5))
///     .with_parallel(4);
/// assert!(config.validate().is_ok());
/// ```
///
/// ## Responder with a bandwidth ceiling
///
/// ```
/// use tperf::Config;
///
/// let config = Config::server(5201)
///     .with_bitrate_limit(1_000_000_000)
///     .with_max_tests(10);
/// ```
///
/// ## Byte target instead of a duration
///
/// ```
/// use tperf::{Config, Mode};
///
/// let config = Config::client("10.0.0.2".to_string(), 5201)
///     .with_bytes(100 * 1024 * 1024)
///     .with_mode(Mode::Receive);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Initiator or responder
    pub role: Role,

    /// Data stream protocol
    pub protocol: Protocol,

    /// Control port (and TCP data port) of the responder
    pub port: u16,

    /// Responder address (initiator only)
    pub server_addr: Option<String>,

    /// Local address to bind listeners or outgoing data streams to
    pub bind_addr: Option<IpAddr>,

    /// First local port for outgoing data streams; stream `i` binds `port + i`
    pub bind_port: Option<u16>,

    /// Test duration; ignored when a byte or block target is set
    pub duration: Duration,

    /// Stop after this many bytes have been sent
    pub bytes: Option<u64>,

    /// Stop after this many blocks have been sent
    pub blocks: Option<u64>,

    /// Bytes per send/receive; protocol default when unset
    pub block_size: Option<usize>,

    /// Number of parallel data streams
    pub parallel: usize,

    /// Transfer direction
    pub mode: Mode,

    /// Per-stream rate in bits per second; UDP defaults to 1 Mbps
    pub bandwidth: Option<u64>,

    /// Warm-up period excluded from the results
    pub omit: Duration,

    /// Stats interval; zero disables interval snapshots
    pub interval: Duration,

    /// Reporter interval; zero disables periodic reports
    pub reporter_interval: Duration,

    /// How often throttled streams re-check their pacing budget
    pub pacing_interval: Duration,

    /// Bound on control and data connection establishment
    pub connect_timeout: Option<Duration>,

    /// Bound on the end-of-test exchange once `TestEnd` was sent
    pub test_end_timeout: Option<Duration>,

    /// Disable Nagle on TCP data streams
    pub no_delay: bool,

    /// TCP maximum segment size for data streams
    pub mss: Option<u32>,

    /// Send and receive socket buffer size for data streams
    pub socket_buffer_size: Option<usize>,

    /// Total bandwidth ceiling in bits per second (responder only)
    pub bitrate_limit: Option<u64>,

    /// Stop serving after this many counted tests (responder only)
    pub max_tests: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Initiator,
            protocol: Protocol::Tcp,
            port: 5201,
            server_addr: None,
            bind_addr: None,
            bind_port: None,
            duration: Duration::from_secs(10),
            bytes: None,
            blocks: None,
            block_size: None,
            parallel: 1,
            mode: Mode::Send,
            bandwidth: None,
            omit: Duration::ZERO,
            interval: Duration::from_secs(1),
            reporter_interval: Duration::from_secs(1),
            pacing_interval: Duration::from_millis(1),
            connect_timeout: None,
            test_end_timeout: None,
            no_delay: false,
            mss: None,
            socket_buffer_size: None,
            bitrate_limit: None,
            max_tests: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.port, 5201);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a responder configuration listening on `port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Config, Role};
    ///
    /// let config = Config::server(5201);
    /// assert_eq!(config.role, Role::Responder);
    /// ```
    pub fn server(port: u16) -> Self {
        Self {
            role: Role::Responder,
            port,
            ..Default::default()
        }
    }

    /// Creates an initiator configuration targeting `server_addr:port`.
    ///
    /// # Arguments
    ///
    /// * `server_addr` - IP address or hostname of the responder
    /// * `port` - Control port of the responder
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Config, Role};
    ///
    /// let config = Config::client("192.168.1.100".to_string(), 5201);
    /// assert_eq!(config.role, Role::Initiator);
    /// ```
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            role: Role::Initiator,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    /// Sets the data stream protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the test duration.
    ///
    /// The duration is exchanged in whole seconds.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_duration(Duration::from_secs(30));
    /// ```
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Stops the test once `bytes` have been sent instead of after a duration.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    /// Stops the test once `blocks` blocks have been sent.
    pub fn with_blocks(mut self, blocks: u64) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Sets the block size used for every send and receive.
    ///
    /// For UDP this is the datagram size including the 12-byte header.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::Config;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_block_size(64 * 1024);
    /// ```
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = Some(size);
        self
    }

    /// Sets the number of parallel data streams.
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets the transfer direction.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Config, Mode};
    ///
    /// // Responder sends, initiator receives
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_mode(Mode::Receive);
    /// ```
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the per-stream target rate in bits per second.
    ///
    /// Pacing is advisory: a stream that is ahead of its budget is skipped by
    /// the data-plane loop until the pacing timer lets it through again.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Config, Protocol};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_protocol(Protocol::Udp)
    ///     .with_bandwidth(100_000_000); // 100 Mbps
    /// ```
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    /// Sets the warm-up period excluded from the official counters.
    pub fn with_omit(mut self, omit: Duration) -> Self {
        self.omit = omit;
        self
    }

    /// Sets the stats interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the reporter interval.
    pub fn with_reporter_interval(mut self, interval: Duration) -> Self {
        self.reporter_interval = interval;
        self
    }

    pub fn with_pacing_interval(mut self, interval: Duration) -> Self {
        self.pacing_interval = interval;
        self
    }

    /// Bounds how long connection establishment may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_test_end_timeout(mut self, timeout: Duration) -> Self {
        self.test_end_timeout = Some(timeout);
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    /// Disables Nagle's algorithm on TCP data streams.
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_mss(mut self, mss: u32) -> Self {
        self.mss = Some(mss);
        self
    }

    pub fn with_socket_buffer_size(mut self, size: usize) -> Self {
        self.socket_buffer_size = Some(size);
        self
    }

    /// Sets the responder's total bandwidth ceiling in bits per second.
    ///
    /// A session whose `streams * rate` (doubled when bidirectional)
    /// exceeds the ceiling is rejected before it starts. Zero disables the
    /// check.
    pub fn with_bitrate_limit(mut self, limit: u64) -> Self {
        self.bitrate_limit = Some(limit);
        self
    }

    /// Makes a responder exit after `max` counted tests.
    pub fn with_max_tests(mut self, max: usize) -> Self {
        self.max_tests = Some(max);
        self
    }

    /// Checks the configuration against protocol limits.
    ///
    /// Called by the drivers before any socket is opened.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending setting.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Config, ErrorCode};
    ///
    /// let err = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_parallel(0)
    ///     .validate()
    ///     .unwrap_err();
    /// assert_eq!(err.code(), ErrorCode::NumStreams);
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.role == Role::Initiator {
            match &self.server_addr {
                Some(addr) if !addr.is_empty() => {}
                _ => {
                    return Err(Error::config(
                        ErrorCode::NoRole,
                        "an initiator needs a server address",
                    ))
                }
            }
            if self.port == 0 {
                return Err(Error::config(ErrorCode::BadPort, "port 0 cannot be connected to"));
            }
        }
        if self.duration > MAX_TIME {
            return Err(Error::config(
                ErrorCode::Duration,
                format!("test duration too long (maximum = {} seconds)", MAX_TIME.as_secs()),
            ));
        }
        if self.duration.subsec_nanos() != 0 {
            return Err(Error::config(
                ErrorCode::Duration,
                "test duration must be a whole number of seconds",
            ));
        }
        if self.parallel == 0 || self.parallel > MAX_STREAMS {
            return Err(Error::config(
                ErrorCode::NumStreams,
                format!("number of parallel streams must be 1..={}", MAX_STREAMS),
            ));
        }
        if let Some(size) = self.block_size {
            match self.protocol {
                Protocol::Tcp if size == 0 || size > MAX_BLOCKSIZE => {
                    return Err(Error::config(
                        ErrorCode::BlockSize,
                        format!("block size must be 1..={} bytes", MAX_BLOCKSIZE),
                    ))
                }
                Protocol::Udp if !(MIN_UDP_BLOCKSIZE..=MAX_UDP_BLOCKSIZE).contains(&size) => {
                    return Err(Error::config(
                        ErrorCode::UdpBlockSize,
                        format!(
                            "UDP block size must be {}..={} bytes",
                            MIN_UDP_BLOCKSIZE, MAX_UDP_BLOCKSIZE
                        ),
                    ))
                }
                _ => {}
            }
        }
        if self.omit > MAX_OMIT {
            return Err(Error::config(
                ErrorCode::Omit,
                format!("omit must be at most {} seconds", MAX_OMIT.as_secs()),
            ));
        }
        if self.omit.subsec_nanos() != 0 {
            return Err(Error::config(
                ErrorCode::Omit,
                "omit must be a whole number of seconds",
            ));
        }
        for interval in [self.interval, self.reporter_interval] {
            if !interval.is_zero() && (interval < MIN_INTERVAL || interval > MAX_INTERVAL) {
                return Err(Error::config(
                    ErrorCode::Interval,
                    format!(
                        "interval must be 0 or between {:?} and {:?}",
                        MIN_INTERVAL, MAX_INTERVAL
                    ),
                ));
            }
        }
        if self.bytes.is_some() && self.blocks.is_some() {
            return Err(Error::config(
                ErrorCode::EndConditions,
                "only one of a byte target or a block target may be set",
            ));
        }
        if self.socket_buffer_size.map_or(false, |s| s > MAX_TCP_BUFFER) {
            return Err(Error::config(
                ErrorCode::BufSize,
                format!("socket buffer size too large (maximum = {} bytes)", MAX_TCP_BUFFER),
            ));
        }
        if self.mss.map_or(false, |m| m > MAX_MSS) {
            return Err(Error::config(
                ErrorCode::Mss,
                format!("TCP MSS too large (maximum = {} bytes)", MAX_MSS),
            ));
        }
        if let Some(port) = self.bind_port {
            if port as usize + self.parallel > u16::MAX as usize {
                return Err(Error::config(
                    ErrorCode::BadPort,
                    "bind port range exceeds 65535",
                ));
            }
        }
        Ok(())
    }
}
