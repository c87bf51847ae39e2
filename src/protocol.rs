use crate::error::{ErrorCode, Result, ResultExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the session cookie on the wire, including the trailing NUL.
pub const COOKIE_SIZE: usize = 37;

const COOKIE_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Largest parameter or results blob accepted from a peer.
pub const MAX_BLOB_LEN: usize = 1024 * 1024;

/// Control connection states.
///
/// Each state is published to the peer as a single byte. The numeric values
/// match iperf3, so either end can talk to an iperf3 peer.
///
/// # Protocol Flow
///
/// 1. `Start`: initiator connects and writes its cookie
/// 2. `ParamExchange`: responder asks for the parameter blob
/// 3. `CreateStreams`: initiator opens the data connections
/// 4. `TestStart` then `TestRunning`: responder arms timers and starts the test
/// 5. `TestEnd`: initiator reports that its stop condition was met
/// 6. `ExchangeResults`: both ends swap per-stream results
/// 7. `DisplayResults`: final reports are produced
/// 8. `Done`: initiator acknowledges and closes
///
/// `ServerTerminate`, `ClientTerminate`, `AccessDenied` and `ServerError`
/// can arrive at any point and end the session with an error.
///
/// # Examples
///
/// ```
/// use tperf::protocol::State;
///
/// assert_eq!(State::TestEnd.to_wire(), 4);
/// assert_eq!(State::from_wire(0xFF), Some(State::AccessDenied));
/// assert_eq!(State::from_wire(3), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    TestStart,
    TestRunning,
    TestEnd,
    ParamExchange,
    CreateStreams,
    ServerTerminate,
    ClientTerminate,
    ExchangeResults,
    DisplayResults,
    Start,
    Done,
    AccessDenied,
    ServerError,
}

impl State {
    /// Returns the byte published for this state.
    pub fn to_wire(self) -> u8 {
        match self {
            State::TestStart => 1,
            State::TestRunning => 2,
            State::TestEnd => 4,
            State::ParamExchange => 9,
            State::CreateStreams => 10,
            State::ServerTerminate => 11,
            State::ClientTerminate => 12,
            State::ExchangeResults => 13,
            State::DisplayResults => 14,
            State::Start => 15,
            State::Done => 16,
            State::AccessDenied => (-1i8) as u8,
            State::ServerError => (-2i8) as u8,
        }
    }

    /// Decodes a state byte; `None` for bytes with no meaning.
    pub fn from_wire(byte: u8) -> Option<Self> {
        let state = match byte as i8 {
            1 => State::TestStart,
            2 => State::TestRunning,
            4 => State::TestEnd,
            9 => State::ParamExchange,
            10 => State::CreateStreams,
            11 => State::ServerTerminate,
            12 => State::ClientTerminate,
            13 => State::ExchangeResults,
            14 => State::DisplayResults,
            15 => State::Start,
            16 => State::Done,
            -1 => State::AccessDenied,
            -2 => State::ServerError,
            _ => return None,
        };
        Some(state)
    }

    /// Side states that end the session with an error.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            State::ServerTerminate | State::ClientTerminate | State::AccessDenied | State::ServerError
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::TestStart => "TEST_START",
            State::TestRunning => "TEST_RUNNING",
            State::TestEnd => "TEST_END",
            State::ParamExchange => "PARAM_EXCHANGE",
            State::CreateStreams => "CREATE_STREAMS",
            State::ServerTerminate => "SERVER_TERMINATE",
            State::ClientTerminate => "CLIENT_TERMINATE",
            State::ExchangeResults => "EXCHANGE_RESULTS",
            State::DisplayResults => "DISPLAY_RESULTS",
            State::Start => "IPERF_START",
            State::Done => "IPERF_DONE",
            State::AccessDenied => "ACCESS_DENIED",
            State::ServerError => "SERVER_ERROR",
        };
        f.write_str(name)
    }
}

/// Token binding data connections to the control connection that created them.
///
/// 36 random characters from a base32 alphabet followed by a NUL byte.
/// The responder compares cookies byte for byte.
///
/// # Examples
///
/// ```
/// use tperf::protocol::{Cookie, COOKIE_SIZE};
///
/// let cookie = Cookie::generate();
/// assert_eq!(cookie.as_bytes().len(), COOKIE_SIZE);
/// assert_eq!(cookie.as_bytes()[COOKIE_SIZE - 1], 0);
/// assert_eq!(Cookie::from_bytes(cookie.as_bytes()), Some(cookie));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie([u8; COOKIE_SIZE]);

impl Cookie {
    /// Generates a fresh random cookie.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; COOKIE_SIZE];
        for b in bytes.iter_mut().take(COOKIE_SIZE - 1) {
            *b = COOKIE_CHARS[rng.gen_range(0..COOKIE_CHARS.len())];
        }
        Cookie(bytes)
    }

    /// Wraps exactly [`COOKIE_SIZE`] received bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; COOKIE_SIZE] = bytes.try_into().ok()?;
        Some(Cookie(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.split(|b| *b == 0).next().unwrap_or_default();
        f.write_str(&String::from_utf8_lossy(text))
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", self)
    }
}

/// Writes the cookie as the first bytes of a connection.
pub async fn write_cookie<W: AsyncWrite + Unpin>(writer: &mut W, cookie: &Cookie) -> Result<()> {
    writer
        .write_all(cookie.as_bytes())
        .await
        .or_code(ErrorCode::SendCookie)
}

/// Reads the cookie a peer presents on a new connection.
pub async fn read_cookie<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Cookie> {
    let mut bytes = [0u8; COOKIE_SIZE];
    reader
        .read_exact(&mut bytes)
        .await
        .or_code(ErrorCode::RecvCookie)?;
    Ok(Cookie(bytes))
}

/// Publishes a state byte.
pub async fn write_state<W: AsyncWrite + Unpin>(writer: &mut W, state: State) -> Result<()> {
    writer
        .write_all(&[state.to_wire()])
        .await
        .or_code(ErrorCode::SendMessage)
}

/// Writes the error code and errno that follow a `ServerError` byte.
pub async fn write_error_code<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: ErrorCode,
    errno: i32,
) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&code.as_i32().to_be_bytes());
    buf[4..].copy_from_slice(&errno.to_be_bytes());
    writer.write_all(&buf).await.or_code(ErrorCode::CtrlWrite)
}

/// Reads the error code and errno that follow a `ServerError` byte.
pub async fn read_error_code<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(ErrorCode, i32)> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await.or_code(ErrorCode::CtrlRead)?;
    let code = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let errno = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((ErrorCode::from_i32(code), errno))
}

/// Serializes a value to a length-prefixed JSON blob.
///
/// The format is:
/// - First 4 bytes: JSON length as big-endian u32
/// - Remaining bytes: UTF-8 encoded JSON
///
/// # Examples
///
/// ```
/// use tperf::protocol::encode_blob;
///
/// let bytes = encode_blob(&serde_json::json!({"time": 10})).unwrap();
/// assert_eq!(&bytes[..4], &[0, 0, 0, 11]);
/// ```
pub fn encode_blob<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let len = json.len() as u32;
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&json);
    Ok(result)
}

/// Writes a length-prefixed JSON blob; failures carry `code`.
pub async fn write_blob<W, T>(writer: &mut W, value: &T, code: ErrorCode) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_blob(value).or_code(code)?;
    writer.write_all(&bytes).await.or_code(code)
}

/// Reads a length-prefixed JSON blob to completion.
///
/// # Errors
///
/// Fails with `code` if the stream ends early, the announced length exceeds
/// [`MAX_BLOB_LEN`], or the payload does not decode.
///
/// # Examples
///
/// ```no_run
/// use tperf::protocol::read_blob;
/// use tperf::ErrorCode;
/// use tokio::net::TcpStream;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut stream = TcpStream::connect("127.0.0.1:5201").await?;
/// let value: serde_json::Value = read_blob(&mut stream, ErrorCode::RecvResults).await?;
/// # Ok(())
/// # }
/// ```
pub async fn read_blob<R, T>(reader: &mut R, code: ErrorCode) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await.or_code(code)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_BLOB_LEN {
        return Err(crate::Error::io(
            code,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("blob of {} bytes exceeds {}", len, MAX_BLOB_LEN),
            ),
        ));
    }

    let mut json_bytes = vec![0u8; len];
    reader.read_exact(&mut json_bytes).await.or_code(code)?;
    serde_json::from_slice(&json_bytes).or_code(code)
}
