//! Per-protocol connection handling for data streams.
//!
//! [`Transport`] is chosen once per session from the negotiated protocol
//! and provides listen, connect and accept for data streams. Established
//! streams are wrapped in a [`DataSocket`], which exposes readiness polling
//! and non-blocking send/receive so the data-plane loop can multiplex every
//! stream from one task.
//!
//! Socket options are best effort: a failure to apply no-delay, MSS or
//! buffer sizes is logged and the stream is used anyway.

use crate::config::Protocol;
use crate::error::{Error, ErrorCode, Result, ResultExt};
use crate::params::Negotiated;
use crate::protocol::{read_cookie, write_cookie, write_state, Cookie, State, COOKIE_SIZE};
use log::{debug, warn};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

/// Reply a responder sends on a freshly accepted UDP stream.
pub const UDP_CONNECT_REPLY: u32 = 0x3938_3736;

/// How long a new connection may take to present its cookie.
pub const COOKIE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a UDP stream waits for the connect reply when no connect
/// timeout is configured.
pub const UDP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a denied connection may take to present its cookie.
const DENY_COOKIE_WAIT: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: u32 = 1024;

/// Socket options applied to data streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub no_delay: bool,
    pub mss: Option<u32>,
    pub buffer_size: Option<usize>,
}

impl SocketOptions {
    pub fn from_negotiated(negotiated: &Negotiated) -> Self {
        Self {
            no_delay: negotiated.no_delay,
            mss: (negotiated.mss > 0).then_some(negotiated.mss),
            buffer_size: (negotiated.socket_buffer_size > 0).then_some(negotiated.socket_buffer_size),
        }
    }
}

/// Data stream transport, selected from the negotiated protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl From<Protocol> for Transport {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => Transport::Tcp,
            Protocol::Udp => Transport::Udp,
        }
    }
}

impl Transport {
    pub fn protocol(self) -> Protocol {
        match self {
            Transport::Tcp => Protocol::Tcp,
            Transport::Udp => Protocol::Udp,
        }
    }

    /// Connects one data stream to `server` and presents the cookie.
    ///
    /// `local` pins the local address and port of the stream.
    pub async fn connect(
        self,
        server: SocketAddr,
        local: Option<SocketAddr>,
        cookie: &Cookie,
        options: &SocketOptions,
        timeout: Option<Duration>,
    ) -> Result<DataSocket> {
        match self {
            Transport::Tcp => {
                let mut stream =
                    connect_tcp(server, local, options, timeout, ErrorCode::StreamConnect).await?;
                write_cookie(&mut stream, cookie).await?;
                Ok(DataSocket::Tcp(stream))
            }
            Transport::Udp => connect_udp(server, local, cookie, options, timeout)
                .await
                .map(DataSocket::Udp),
        }
    }
}

/// Opens the responder's TCP listener.
///
/// Bind-time options are set on the listening socket so accepted streams
/// inherit them.
pub fn listen_tcp(bind: Option<IpAddr>, port: u16, options: &SocketOptions) -> Result<TcpListener> {
    let addr = SocketAddr::new(bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
    let socket = new_tcp_socket(&addr).or_code(ErrorCode::Listen)?;
    socket.set_reuseaddr(true).or_code(ErrorCode::Listen)?;
    apply_bind_options(&socket, options);
    socket.bind(addr).or_code(ErrorCode::Listen)?;
    socket.listen(LISTEN_BACKLOG).or_code(ErrorCode::Listen)
}

/// Opens the responder's UDP listener on the control port.
pub async fn listen_udp(bind: Option<IpAddr>, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
    UdpSocket::bind(addr).await.or_code(ErrorCode::StreamListen)
}

/// Resolves `host:port` and connects the control connection.
pub async fn connect_control(
    host: &str,
    port: u16,
    bind: Option<IpAddr>,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .or_code(ErrorCode::Connect)?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        let local = bind.map(|ip| SocketAddr::new(ip, 0));
        match connect_tcp(addr, local, &SocketOptions::default(), timeout, ErrorCode::Connect).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Control connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::io(
            ErrorCode::Connect,
            io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", host)),
        )
    }))
}

/// Authenticates a TCP data connection accepted on the listener.
///
/// Returns `None` after answering `AccessDenied` when the cookie does not
/// match; the connection is closed when the stream is dropped.
///
/// The cookie read runs on the caller's task. A session awaiting it moves
/// no data until the cookie arrives or [`COOKIE_TIMEOUT`] passes, so a peer
/// that connects and stays silent stalls the test for that long.
pub async fn accept_tcp(mut stream: TcpStream, cookie: &Cookie) -> Result<Option<TcpStream>> {
    let presented = with_timeout(Some(COOKIE_TIMEOUT), ErrorCode::RecvCookie, read_cookie(&mut stream)).await?;
    if presented != *cookie {
        if let Err(e) = write_state(&mut stream, State::AccessDenied).await {
            debug!("Could not deny stray connection: {}", e);
        }
        return Ok(None);
    }
    Ok(Some(stream))
}

/// Turns a cookie datagram received on the UDP listener into a dedicated
/// stream socket connected to `peer`.
///
/// Returns `None` when the datagram is not the session cookie.
pub async fn accept_udp(
    datagram: &[u8],
    peer: SocketAddr,
    cookie: &Cookie,
    options: &SocketOptions,
) -> Result<Option<UdpSocket>> {
    if datagram.len() != COOKIE_SIZE || datagram != cookie.as_bytes() {
        return Ok(None);
    }
    let socket = UdpSocket::bind(unspecified_for(&peer))
        .await
        .or_code(ErrorCode::StreamAccept)?;
    apply_udp_options(&socket, options);
    socket.connect(peer).await.or_code(ErrorCode::StreamAccept)?;
    socket
        .send(&UDP_CONNECT_REPLY.to_be_bytes())
        .await
        .or_code(ErrorCode::StreamWrite)?;
    Ok(Some(socket))
}

/// Writes `AccessDenied` to a control connection the responder cannot serve.
///
/// The cookie the peer presents is read first, so the connection closes
/// with FIN and the peer can still read the answer. Like [`accept_tcp`]
/// this blocks the calling session, for at most `DENY_COOKIE_WAIT` (1 s)
/// plus the write.
pub async fn deny(mut stream: TcpStream) {
    if tokio::time::timeout(DENY_COOKIE_WAIT, read_cookie(&mut stream))
        .await
        .is_err()
    {
        debug!("Denied connection sent no cookie");
    }
    if let Err(e) = write_state(&mut stream, State::AccessDenied).await {
        debug!("Could not deny connection: {}", e);
    }
    let _ = stream.shutdown().await;
}

async fn connect_tcp(
    addr: SocketAddr,
    local: Option<SocketAddr>,
    options: &SocketOptions,
    timeout: Option<Duration>,
    code: ErrorCode,
) -> Result<TcpStream> {
    let socket = new_tcp_socket(&addr).or_code(code)?;
    apply_bind_options(&socket, options);
    if let Some(local) = local {
        socket.set_reuseaddr(true).or_code(code)?;
        socket.bind(local).or_code(code)?;
    }
    let stream = with_timeout(timeout, code, async { socket.connect(addr).await.or_code(code) }).await?;
    apply_stream_options(&stream, options);
    Ok(stream)
}

async fn connect_udp(
    server: SocketAddr,
    local: Option<SocketAddr>,
    cookie: &Cookie,
    options: &SocketOptions,
    timeout: Option<Duration>,
) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(local.unwrap_or_else(|| unspecified_for(&server)))
        .await
        .or_code(ErrorCode::StreamConnect)?;
    apply_udp_options(&socket, options);
    socket
        .send_to(cookie.as_bytes(), server)
        .await
        .or_code(ErrorCode::StreamWrite)?;

    // The reply comes from the responder's per-stream socket, not the listener.
    let mut reply = [0u8; 16];
    let (n, from) = with_timeout(
        Some(timeout.unwrap_or(UDP_CONNECT_TIMEOUT)),
        ErrorCode::StreamConnect,
        async { socket.recv_from(&mut reply).await.or_code(ErrorCode::StreamRead) },
    )
    .await?;
    if n != 4 || reply[..4] != UDP_CONNECT_REPLY.to_be_bytes() {
        return Err(Error::io(
            ErrorCode::StreamConnect,
            io::Error::new(io::ErrorKind::InvalidData, "unexpected UDP connect reply"),
        ));
    }
    socket.connect(from).await.or_code(ErrorCode::StreamConnect)?;
    Ok(socket)
}

async fn with_timeout<T, F>(limit: Option<Duration>, code: ErrorCode, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::io(
                code,
                io::Error::new(io::ErrorKind::TimedOut, format!("timed out after {:?}", limit)),
            )),
        },
        None => fut.await,
    }
}

fn new_tcp_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

fn apply_bind_options(socket: &TcpSocket, options: &SocketOptions) {
    if let Some(size) = options.buffer_size {
        let size = size.min(u32::MAX as usize) as u32;
        if let Err(e) = socket
            .set_send_buffer_size(size)
            .and_then(|_| socket.set_recv_buffer_size(size))
        {
            warn!("{}: {}", ErrorCode::SetBuf, e);
        }
    }
    if let Some(mss) = options.mss {
        if let Err(e) = sockopt::set_mss(socket, mss) {
            warn!("{}: {}", ErrorCode::SetMss, e);
        }
    }
}

fn apply_stream_options(stream: &TcpStream, options: &SocketOptions) {
    if options.no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("{}: {}", ErrorCode::SetNoDelay, e);
        }
    }
}

fn apply_udp_options(socket: &UdpSocket, options: &SocketOptions) {
    if let Some(size) = options.buffer_size {
        if let Err(e) = sockopt::set_buffer_sizes(socket, size) {
            warn!("{}: {}", ErrorCode::SetBuf, e);
        }
    }
}

/// Applies per-connection options to an accepted TCP data stream.
pub fn configure_accepted(stream: &TcpStream, options: &SocketOptions) {
    apply_stream_options(stream, options);
}

/// MSS of the control connection, used to size UDP datagrams.
pub fn control_mss(stream: &TcpStream) -> Option<u32> {
    sockopt::get_mss(stream).ok().filter(|m| *m > 0)
}

/// One established data connection.
#[derive(Debug)]
pub enum DataSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl DataSocket {
    /// Polls for send (`sending`) or receive readiness.
    pub fn poll_ready(&self, cx: &mut Context<'_>, sending: bool) -> Poll<io::Result<()>> {
        match (self, sending) {
            (DataSocket::Tcp(s), true) => s.poll_write_ready(cx),
            (DataSocket::Tcp(s), false) => s.poll_read_ready(cx),
            (DataSocket::Udp(s), true) => s.poll_send_ready(cx),
            (DataSocket::Udp(s), false) => s.poll_recv_ready(cx),
        }
    }

    /// Attempts one non-blocking send.
    pub fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DataSocket::Tcp(s) => s.try_write(buf),
            DataSocket::Udp(s) => s.try_send(buf),
        }
    }

    /// Attempts one non-blocking receive. `Ok(0)` on TCP is end-of-file.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DataSocket::Tcp(s) => s.try_read(buf),
            DataSocket::Udp(s) => s.try_recv(buf),
        }
    }

    /// Waits until the socket may be readable.
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            DataSocket::Tcp(s) => s.readable().await,
            DataSocket::Udp(s) => s.readable().await,
        }
    }

    /// Errors the loop retries on the next readiness round.
    ///
    /// A connected UDP socket also reports ICMP port-unreachable from a
    /// peer that already closed; that is not a stream failure either.
    pub fn is_soft_error(&self, err: &io::Error) -> bool {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => true,
            io::ErrorKind::ConnectionRefused => matches!(self, DataSocket::Udp(_)),
            _ => false,
        }
    }

    /// Sends FIN on a TCP stream so the peer reads end-of-file.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            DataSocket::Tcp(s) => s.shutdown().await,
            DataSocket::Udp(_) => Ok(()),
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, DataSocket::Tcp(_))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            DataSocket::Tcp(s) => s.local_addr().ok(),
            DataSocket::Udp(s) => s.local_addr().ok(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            DataSocket::Tcp(s) => s.peer_addr().ok(),
            DataSocket::Udp(s) => s.peer_addr().ok(),
        }
    }

    /// Total retransmitted segments, where the platform reports them.
    pub fn retransmits(&self) -> Option<u64> {
        match self {
            DataSocket::Tcp(s) => sockopt::total_retransmits(s),
            DataSocket::Udp(_) => None,
        }
    }
}

#[cfg(unix)]
mod sockopt {
    use std::io;
    use std::mem;
    use std::os::unix::io::AsRawFd;

    fn set_int<S: AsRawFd>(sock: &S, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn get_int<S: AsRawFd>(sock: &S, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                sock.as_raw_fd(),
                level,
                name,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == 0 {
            Ok(value)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn set_mss<S: AsRawFd>(sock: &S, mss: u32) -> io::Result<()> {
        set_int(sock, libc::IPPROTO_TCP, libc::TCP_MAXSEG, mss as libc::c_int)
    }

    pub fn get_mss<S: AsRawFd>(sock: &S) -> io::Result<u32> {
        get_int(sock, libc::IPPROTO_TCP, libc::TCP_MAXSEG).map(|v| v.max(0) as u32)
    }

    pub fn set_buffer_sizes<S: AsRawFd>(sock: &S, size: usize) -> io::Result<()> {
        let size = size.min(libc::c_int::MAX as usize) as libc::c_int;
        set_int(sock, libc::SOL_SOCKET, libc::SO_SNDBUF, size)?;
        set_int(sock, libc::SOL_SOCKET, libc::SO_RCVBUF, size)
    }

    /// Leading part of the kernel's `struct tcp_info`: eight single-byte
    /// fields, then 32-bit counters up to `tcpi_total_retrans`.
    #[cfg(target_os = "linux")]
    #[repr(C)]
    struct TcpInfoPrefix {
        flags: [u8; 8],
        counters: [u32; 24],
    }

    #[cfg(target_os = "linux")]
    pub fn total_retransmits<S: AsRawFd>(sock: &S) -> Option<u64> {
        let mut info = TcpInfoPrefix {
            flags: [0; 8],
            counters: [0; 24],
        };
        let mut len = mem::size_of::<TcpInfoPrefix>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                sock.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut TcpInfoPrefix as *mut libc::c_void,
                &mut len,
            )
        };
        (rc == 0).then(|| info.counters[23] as u64)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn total_retransmits<S: AsRawFd>(_sock: &S) -> Option<u64> {
        None
    }
}

#[cfg(not(unix))]
mod sockopt {
    use std::io;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "socket option not supported on this platform")
    }

    pub fn set_mss<S>(_sock: &S, _mss: u32) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn get_mss<S>(_sock: &S) -> io::Result<u32> {
        Err(unsupported())
    }

    pub fn set_buffer_sizes<S>(_sock: &S, _size: usize) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn total_retransmits<S>(_sock: &S) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_tcp_stream_presents_cookie() {
        let listener = listen_tcp(Some("127.0.0.1".parse().unwrap()), 0, &SocketOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let cookie = Cookie::generate();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_tcp(stream, &cookie).await.unwrap().is_some()
        });

        let socket = Transport::Tcp
            .connect(addr, None, &cookie, &SocketOptions::default(), None)
            .await
            .unwrap();
        assert!(socket.is_tcp());
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_cookie_is_denied() {
        let listener = listen_tcp(Some("127.0.0.1".parse().unwrap()), 0, &SocketOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let cookie = Cookie::generate();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_tcp(stream, &cookie).await.unwrap().is_none()
        });

        let mut stray = TcpStream::connect(addr).await.unwrap();
        write_cookie(&mut stray, &Cookie::generate()).await.unwrap();
        let mut byte = [0u8; 1];
        stray.read_exact(&mut byte).await.unwrap();

        assert_eq!(State::from_wire(byte[0]), Some(State::AccessDenied));
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_udp_handshake() {
        let listener = listen_udp(Some("127.0.0.1".parse().unwrap()), 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cookie = Cookie::generate();

        let accept = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            // A stray datagram first, then the real cookie.
            let (n, peer) = listener.recv_from(&mut buf).await.unwrap();
            assert!(accept_udp(&buf[..n], peer, &cookie, &SocketOptions::default())
                .await
                .unwrap()
                .is_none());
            let (n, peer) = listener.recv_from(&mut buf).await.unwrap();
            let socket = accept_udp(&buf[..n], peer, &cookie, &SocketOptions::default())
                .await
                .unwrap()
                .unwrap();
            let mut data = [0u8; 16];
            let n = socket.recv(&mut data).await.unwrap();
            data[..n].to_vec()
        });

        let stray = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stray.send_to(b"not a cookie", addr).await.unwrap();

        let socket = Transport::Udp
            .connect(addr, None, &cookie, &SocketOptions::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!socket.is_tcp());
        assert_ne!(socket.peer_addr(), Some(addr));

        let sent = loop {
            match socket.try_send(b"payload") {
                Ok(n) => break n,
                Err(e) if socket.is_soft_error(&e) => tokio::task::yield_now().await,
                Err(e) => panic!("send failed: {}", e),
            }
        };
        assert_eq!(sent, 7);
        assert_eq!(accept.await.unwrap(), b"payload".to_vec());
    }

    #[test]
    fn test_options_from_negotiated() {
        let config = crate::Config::client("h".to_string(), 1).with_mss(1200).with_no_delay(true);
        let wire = crate::params::Requested::from_config(&config, None).to_wire();
        let negotiated = Negotiated::from_wire(&wire).unwrap();
        let options = SocketOptions::from_negotiated(&negotiated);

        assert!(options.no_delay);
        assert_eq!(options.mss, Some(1200));
        assert_eq!(options.buffer_size, None);
    }
}
