//! Error taxonomy for test sessions.
//!
//! Every failure carries an [`ErrorCode`] whose numeric value matches the
//! iperf3 error numbering, so it can be written verbatim after a
//! `ServerError` state byte and decoded on the other side. Codes are grouped
//! into an [`ErrorKind`] that drivers use to decide whether to keep serving.

use std::fmt;
use thiserror::Error;

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or conflicting settings, detected before any socket I/O.
    Configuration,
    /// Listen, connect, accept or cookie transfer failures.
    Connection,
    /// Unexpected control traffic, premature close or a peer-reported failure.
    Protocol,
    /// The responder refused the requested aggregate bandwidth.
    Admission,
    /// Timer or stream allocation failures during initialization.
    Resource,
}

/// Numeric error code, wire-compatible with iperf3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ServerClient,
    NoRole,
    Duration,
    NumStreams,
    BlockSize,
    BufSize,
    Interval,
    Mss,
    Omit,
    EndConditions,
    UdpBlockSize,
    BadPort,
    TotalRate,
    NewTest,
    InitTest,
    Listen,
    Connect,
    Accept,
    SendCookie,
    RecvCookie,
    CtrlWrite,
    CtrlRead,
    CtrlClose,
    Message,
    SendMessage,
    RecvMessage,
    SendParams,
    RecvParams,
    PackageResults,
    SendResults,
    RecvResults,
    Select,
    ClientTerminated,
    ServerTerminated,
    AccessDenied,
    SetNoDelay,
    SetMss,
    SetBuf,
    CreateStream,
    InitStream,
    StreamListen,
    StreamConnect,
    StreamAccept,
    StreamWrite,
    StreamRead,
    StreamClose,
    StreamId,
    NewTimer,
    UpdateTimer,
    TestEndTimeout,
    Kill,
    /// A code this crate does not know, as reported by a peer.
    Other(i32),
}

const KNOWN_CODES: &[(ErrorCode, i32)] = &[
    (ErrorCode::ServerClient, 1),
    (ErrorCode::NoRole, 2),
    (ErrorCode::Duration, 5),
    (ErrorCode::NumStreams, 6),
    (ErrorCode::BlockSize, 7),
    (ErrorCode::BufSize, 8),
    (ErrorCode::Interval, 9),
    (ErrorCode::Mss, 10),
    (ErrorCode::Omit, 12),
    (ErrorCode::EndConditions, 16),
    (ErrorCode::UdpBlockSize, 20),
    (ErrorCode::BadPort, 26),
    (ErrorCode::TotalRate, 27),
    (ErrorCode::NewTest, 100),
    (ErrorCode::InitTest, 101),
    (ErrorCode::Listen, 102),
    (ErrorCode::Connect, 103),
    (ErrorCode::Accept, 104),
    (ErrorCode::SendCookie, 105),
    (ErrorCode::RecvCookie, 106),
    (ErrorCode::CtrlWrite, 107),
    (ErrorCode::CtrlRead, 108),
    (ErrorCode::CtrlClose, 109),
    (ErrorCode::Message, 110),
    (ErrorCode::SendMessage, 111),
    (ErrorCode::RecvMessage, 112),
    (ErrorCode::SendParams, 113),
    (ErrorCode::RecvParams, 114),
    (ErrorCode::PackageResults, 115),
    (ErrorCode::SendResults, 116),
    (ErrorCode::RecvResults, 117),
    (ErrorCode::Select, 118),
    (ErrorCode::ClientTerminated, 119),
    (ErrorCode::ServerTerminated, 120),
    (ErrorCode::AccessDenied, 121),
    (ErrorCode::SetNoDelay, 122),
    (ErrorCode::SetMss, 123),
    (ErrorCode::SetBuf, 124),
    (ErrorCode::CreateStream, 200),
    (ErrorCode::InitStream, 201),
    (ErrorCode::StreamListen, 202),
    (ErrorCode::StreamConnect, 203),
    (ErrorCode::StreamAccept, 204),
    (ErrorCode::StreamWrite, 205),
    (ErrorCode::StreamRead, 206),
    (ErrorCode::StreamClose, 207),
    (ErrorCode::StreamId, 208),
    (ErrorCode::NewTimer, 300),
    (ErrorCode::UpdateTimer, 301),
    (ErrorCode::TestEndTimeout, 304),
    (ErrorCode::Kill, 305),
];

impl ErrorCode {
    /// Returns the numeric value written on the wire.
    pub fn as_i32(self) -> i32 {
        if let ErrorCode::Other(n) = self {
            return n;
        }
        KNOWN_CODES
            .iter()
            .find(|(code, _)| *code == self)
            .map(|(_, n)| *n)
            .unwrap_or(-1)
    }

    /// Decodes a numeric value received from a peer.
    pub fn from_i32(n: i32) -> Self {
        KNOWN_CODES
            .iter()
            .find(|(_, value)| *value == n)
            .map(|(code, _)| *code)
            .unwrap_or(ErrorCode::Other(n))
    }

    /// Returns the class this code belongs to.
    pub fn kind(self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            TotalRate => ErrorKind::Admission,
            ServerClient | NoRole | Duration | NumStreams | BlockSize | BufSize | Interval | Mss
            | Omit | EndConditions | UdpBlockSize | BadPort => ErrorKind::Configuration,
            Listen | Connect | Accept | SendCookie | RecvCookie | SetNoDelay | SetMss | SetBuf
            | StreamListen | StreamConnect | StreamAccept => ErrorKind::Connection,
            NewTest | InitTest | CreateStream | InitStream | NewTimer | UpdateTimer => {
                ErrorKind::Resource
            }
            _ => ErrorKind::Protocol,
        }
    }

    fn description(self) -> &'static str {
        use ErrorCode::*;
        match self {
            ServerClient => "cannot be both initiator and responder",
            NoRole => "must be either an initiator with a server address or a responder",
            Duration => "test duration invalid",
            NumStreams => "number of parallel streams invalid",
            BlockSize => "block size invalid",
            BufSize => "socket buffer size too large",
            Interval => "invalid report interval",
            Mss => "TCP MSS too large",
            Omit => "bogus value for omit",
            EndConditions => "only one test end condition may be specified",
            UdpBlockSize => "UDP block size invalid",
            BadPort => "port number invalid",
            TotalRate => "total required bandwidth is larger than server limit",
            NewTest => "unable to create a new test",
            InitTest => "test initialization failed",
            Listen => "unable to start listener for connections",
            Connect => "unable to connect to server",
            Accept => "unable to accept connection from client",
            SendCookie => "unable to send cookie to server",
            RecvCookie => "unable to receive cookie at server",
            CtrlWrite => "unable to write to the control socket",
            CtrlRead => "unable to read from the control socket",
            CtrlClose => "control socket has closed unexpectedly",
            Message => "received an unknown control message",
            SendMessage => "unable to send control message",
            RecvMessage => "unable to receive control message",
            SendParams => "unable to send parameters to server",
            RecvParams => "unable to receive parameters from client",
            PackageResults => "unable to package results",
            SendResults => "unable to send results",
            RecvResults => "unable to receive results",
            Select => "readiness wait failed",
            ClientTerminated => "the client has terminated",
            ServerTerminated => "the server has terminated",
            AccessDenied => "the server is busy running a test, try again later",
            SetNoDelay => "unable to set TCP NODELAY",
            SetMss => "unable to set TCP MSS",
            SetBuf => "unable to set socket buffer size",
            CreateStream => "unable to create a new stream",
            InitStream => "unable to initialize stream",
            StreamListen => "unable to start stream listener",
            StreamConnect => "unable to connect stream",
            StreamAccept => "unable to accept stream connection",
            StreamWrite => "unable to write to stream socket",
            StreamRead => "unable to read from stream socket",
            StreamClose => "stream socket has closed unexpectedly",
            StreamId => "stream has an invalid id",
            NewTimer => "unable to create new timer",
            UpdateTimer => "unable to update timer",
            TestEndTimeout => "test did not end in time",
            Kill => "test cancelled",
            Other(_) => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(n) => write!(f, "unknown error code {}", n),
            code => f.write_str(code.description()),
        }
    }
}

/// Error returned from every driver call.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {message}")]
    Config { code: ErrorCode, message: String },

    #[error("{0}")]
    Session(ErrorCode),

    #[error("{code}: {source}")]
    Io {
        code: ErrorCode,
        #[source]
        source: std::io::Error,
    },

    #[error("{code}: {source}")]
    Json {
        code: ErrorCode,
        #[source]
        source: serde_json::Error,
    },

    #[error("peer reported: {code} (errno {errno})")]
    Peer { code: ErrorCode, errno: i32 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Config {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn io(code: ErrorCode, source: std::io::Error) -> Self {
        Error::Io { code, source }
    }

    /// Returns the numeric code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Config { code, .. }
            | Error::Io { code, .. }
            | Error::Json { code, .. }
            | Error::Peer { code, .. } => *code,
            Error::Session(code) => *code,
        }
    }

    /// Returns the class of this error.
    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    /// Returns the errno supplied by the peer, if the peer reported this error.
    pub fn peer_errno(&self) -> Option<i32> {
        match self {
            Error::Peer { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// OS error number of the local failure, or zero.
    pub(crate) fn errno(&self) -> i32 {
        match self {
            Error::Io { source, .. } => source.raw_os_error().unwrap_or(0),
            Error::Peer { errno, .. } => *errno,
            _ => 0,
        }
    }

    /// Whether a serve-N-tests counter should count this failure.
    ///
    /// Rejected or half-open connection attempts do not consume a test slot.
    pub fn counts_toward_limit(&self) -> bool {
        !matches!(
            self.code(),
            ErrorCode::Accept | ErrorCode::RecvCookie | ErrorCode::AccessDenied
        )
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::Session(code)
    }
}

/// Attaches an [`ErrorCode`] to a foreign error.
pub(crate) trait ResultExt<T> {
    fn or_code(self, code: ErrorCode) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn or_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|source| Error::Io { code, source })
    }
}

impl<T> ResultExt<T> for std::result::Result<T, serde_json::Error> {
    fn or_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|source| Error::Json { code, source })
    }
}
