use crate::admission;
use crate::config::{Config, Protocol, Role};
use crate::control::{self, Flow, Incoming};
use crate::error::{Error, ErrorCode, Result, ResultExt};
use crate::events::{CallbackRef, EventCallback};
use crate::params::Negotiated;
use crate::protocol::{read_cookie, Cookie, State};
use crate::results::TestResults;
use crate::session::{Session, Wake};
use crate::transport::{self, DataSocket, SocketOptions, COOKIE_TIMEOUT};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Large enough for a cookie datagram; anything longer is not one.
const DATAGRAM_BUF: usize = 1024;

/// The responder side of a throughput test.
///
/// A `Server` listens on the control port and serves one test at a time.
/// While a test is active, every other control connection is answered
/// with `AccessDenied` and closed; data connections are bound to the
/// active test by its cookie.
///
/// # Examples
///
/// ## Serve Forever
///
/// ```no_run
/// use tperf::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new(Config::server(5201))?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Serve a Fixed Number of Tests With a Bandwidth Ceiling
///
/// ```no_run
/// use tperf::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(5201)
///     .with_bitrate_limit(1_000_000_000)
///     .with_max_tests(3);
///
/// let server = Server::new(config)?;
/// server.run().await?;
///
/// if let Some(results) = server.results() {
///     println!("last test received {} bytes", results.bytes_received);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
    results: Arc<Mutex<Option<TestResults>>>,
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::ServerClient`] for an initiator configuration
    /// and with the matching configuration error if validation fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Config, Server};
    ///
    /// let server = Server::new(Config::server(5201)).unwrap();
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.role != Role::Responder {
            return Err(Error::config(
                ErrorCode::ServerClient,
                "a server needs a responder configuration",
            ));
        }
        config.validate()?;

        Ok(Self {
            config,
            callback: None,
            cancellation_token: CancellationToken::new(),
            results: Arc::new(Mutex::new(None)),
        })
    }

    /// Attaches a callback that receives every [`SessionEvent`](crate::SessionEvent).
    pub fn with_callback<C: EventCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Token that stops the server.
    ///
    /// An active test is terminated with `ServerTerminate` so the initiator
    /// learns about it, then [`run`](Self::run) returns.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Results of the most recent test, partial if it failed.
    pub fn results(&self) -> Option<TestResults> {
        self.results.lock().clone()
    }

    /// Serves tests one after another.
    ///
    /// Returns after `max_tests` counted tests, when cancelled, or when the
    /// listener cannot be (re)opened. Refused or half-open connection
    /// attempts do not count as tests.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Listen`] if the control port cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let mut session = self.new_session();
        session.listen(&SocketOptions::default())?;
        info!(
            "Server listening on port {}",
            session.local_port().unwrap_or(self.config.port)
        );

        let mut counted = 0usize;
        loop {
            match self.serve(&mut session).await {
                Ok(results) => {
                    counted += 1;
                    info!(
                        "Test {} finished: received {} bytes, sent {} bytes in {:.2?}",
                        results.cookie, results.bytes_received, results.bytes_sent, results.duration
                    );
                }
                Err(e) if e.code() == ErrorCode::Kill => {
                    info!("Server stopped");
                    return Ok(());
                }
                Err(e) if e.code() == ErrorCode::Listen => {
                    error!("Control listener lost: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    if e.counts_toward_limit() {
                        counted += 1;
                    }
                }
            }

            if self.cancellation_token.is_cancelled() {
                info!("Server stopped");
                return Ok(());
            }
            session.reset()?;
            if let Some(max) = self.config.max_tests {
                if counted >= max {
                    info!("Served {} tests, exiting", counted);
                    return Ok(());
                }
            }
        }
    }

    /// Serves exactly one test attempt.
    pub async fn run_once(&self) -> Result<TestResults> {
        let mut session = self.new_session();
        session.listen(&SocketOptions::default())?;
        self.serve(&mut session).await
    }

    fn new_session(&self) -> Session {
        Session::new(
            self.config.clone(),
            self.callback.clone(),
            self.cancellation_token.clone(),
        )
    }

    async fn serve(&self, session: &mut Session) -> Result<TestResults> {
        let outcome = serve_one(session).await;
        if let Err(e) = &outcome {
            if control::should_report(e) {
                if let Some(ctrl) = session.ctrl.as_mut() {
                    if let Err(send_err) = control::send_error(ctrl, e).await {
                        debug!("Could not report error to the initiator: {}", send_err);
                    }
                }
            }
            if e.code() != ErrorCode::Kill {
                error!("Test failed: {}", e);
            }
            session.fail(e);
        }
        session.teardown().await;
        if let Some(results) = session.results.take() {
            *self.results.lock() = Some(results);
        }
        outcome
    }
}

async fn serve_one(session: &mut Session) -> Result<TestResults> {
    let mut datagram = vec![0u8; DATAGRAM_BUF];

    loop {
        match session.wait(&mut datagram).await? {
            Wake::Cancelled => return Err(terminate(session).await),
            Wake::Control => {
                let message = control::try_read_message(session.ctrl_mut()?)?;
                if let Some(message) = message {
                    if handle_message(session, message).await? == Flow::Finished {
                        break;
                    }
                }
            }
            Wake::Accept(stream, peer) => handle_accept(session, stream, peer).await?,
            Wake::Datagram(n, peer) => handle_datagram(session, &datagram[..n], peer).await?,
            Wake::Streams | Wake::Timer => {}
        }

        session.service_streams()?;
        session.run_timers(Instant::now())?;
    }

    session
        .results
        .clone()
        .ok_or_else(|| Error::from(ErrorCode::PackageResults))
}

/// Tells the initiator the server is going away.
async fn terminate(session: &mut Session) -> Error {
    if session.ctrl.is_some() {
        info!("Terminating the active test");
        session.report(Instant::now());
        if let Err(e) = session.publish(State::ServerTerminate).await {
            debug!("Could not send ServerTerminate: {}", e);
        }
    }
    ErrorCode::Kill.into()
}

async fn handle_accept(session: &mut Session, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    if session.ctrl.is_none() {
        info!("Accepted control connection from {}", peer);
        let cookie = read_new_cookie(&mut stream).await?;
        session.cookie = Some(cookie);
        session.ctrl = Some(stream);
        session.set_state(State::Start);
        return negotiate(session).await;
    }

    if session.state != State::CreateStreams || session.protocol() != Protocol::Tcp {
        info!("Denied connection from {}: a test is already running", peer);
        transport::deny(stream).await;
        return Ok(());
    }

    let cookie = session.cookie.ok_or(ErrorCode::Accept)?;
    match transport::accept_tcp(stream, &cookie).await {
        Ok(Some(stream)) => {
            let options = SocketOptions::from_negotiated(session.negotiated()?);
            transport::configure_accepted(&stream, &options);
            add_stream(session, DataSocket::Tcp(stream)).await
        }
        Ok(None) => {
            info!("Rejected data connection from {} with a foreign cookie", peer);
            Ok(())
        }
        Err(e) => {
            warn!("Data connection from {} failed: {}", peer, e);
            Ok(())
        }
    }
}

async fn read_new_cookie(stream: &mut TcpStream) -> Result<Cookie> {
    match tokio::time::timeout(COOKIE_TIMEOUT, read_cookie(stream)).await {
        Ok(res) => res,
        Err(elapsed) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, elapsed))
            .or_code(ErrorCode::RecvCookie),
    }
}

/// Takes the initiator's parameters and prepares the data listeners.
async fn negotiate(session: &mut Session) -> Result<()> {
    session.publish(State::ParamExchange).await?;
    let wire = control::recv_params(session.ctrl_mut()?).await?;
    let negotiated = Negotiated::from_wire(&wire)?;
    info!(
        "Test requested: {:?} {:?}, {} streams, {:?}, block size {}",
        negotiated.protocol,
        negotiated.mode,
        negotiated.num_streams,
        negotiated.duration,
        negotiated.block_size
    );

    match negotiated.protocol {
        Protocol::Udp => {
            let port = session.local_port().unwrap_or(session.config.port);
            session.udp_listener = Some(transport::listen_udp(session.config.bind_addr, port).await?);
        }
        Protocol::Tcp if negotiated.has_bind_options() => {
            session.listen(&SocketOptions::from_negotiated(&negotiated))?;
        }
        Protocol::Tcp => {}
    }

    session.apply_params(negotiated);
    session.publish(State::CreateStreams).await
}

async fn handle_datagram(session: &mut Session, datagram: &[u8], peer: SocketAddr) -> Result<()> {
    if session.state != State::CreateStreams {
        debug!("Ignoring datagram from {}", peer);
        return Ok(());
    }
    let cookie = session.cookie.ok_or(ErrorCode::StreamAccept)?;
    let options = SocketOptions::from_negotiated(session.negotiated()?);
    match transport::accept_udp(datagram, peer, &cookie, &options).await? {
        Some(socket) => add_stream(session, DataSocket::Udp(socket)).await,
        None => {
            info!("Ignoring datagram from {} without the session cookie", peer);
            Ok(())
        }
    }
}

/// Adds an accepted data stream; receiving streams come first.
async fn add_stream(session: &mut Session, socket: DataSocket) -> Result<()> {
    let (receivers, total) = {
        let negotiated = session.negotiated()?;
        (
            negotiated.receive_streams(Role::Responder),
            negotiated.total_streams(),
        )
    };
    let sender = session.streams.len() >= receivers;
    session.add_stream(socket, sender)?;

    if session.streams.len() == total {
        streams_complete(session).await?;
    }
    Ok(())
}

/// Runs admission control and starts the test once every stream is in.
async fn streams_complete(session: &mut Session) -> Result<()> {
    session.udp_listener = None;
    session.restore_listener()?;

    let (num_streams, rate, mode) = {
        let negotiated = session.negotiated()?;
        (negotiated.num_streams, negotiated.rate, negotiated.mode)
    };
    admission::admit(num_streams, rate, mode, session.config.bitrate_limit)?;

    session.publish(State::TestStart).await?;
    session.init_test(Instant::now())?;
    session.publish(State::TestRunning).await
}

async fn handle_message(session: &mut Session, message: Incoming) -> Result<Flow> {
    let state = match message {
        Incoming::State(state) => state,
        Incoming::Closed if session.state == State::DisplayResults => {
            debug!("Initiator closed the control connection after the results");
            return Ok(Flow::Finished);
        }
        Incoming::Closed => return Err(ErrorCode::CtrlClose.into()),
        Incoming::Unknown(byte) => {
            warn!("Unknown control byte {:#04x}", byte);
            return Err(ErrorCode::Message.into());
        }
    };

    match state {
        State::TestEnd if session.state == State::TestRunning => end_test(session).await?,
        State::Done => {
            session.set_state(State::Done);
            return Ok(Flow::Finished);
        }
        State::ClientTerminate => {
            session.set_state(State::ClientTerminate);
            session.report(Instant::now());
            return Err(ErrorCode::ClientTerminated.into());
        }
        other => {
            warn!("Unexpected {} from the initiator in {}", other, session.state);
            return Err(ErrorCode::Message.into());
        }
    }
    Ok(Flow::Continue)
}

/// Finishes the test after the initiator's `TestEnd`: drains what is still
/// in flight, fixes the results, exchanges them and displays them.
async fn end_test(session: &mut Session) -> Result<()> {
    session.drain_receivers().await;
    session.set_state(State::TestEnd);
    session.finish_running(Instant::now());
    session.close_streams();

    session.publish(State::ExchangeResults).await?;
    let ctrl = session.ctrl.as_mut().ok_or(ErrorCode::CtrlClose)?;
    let results = session.results.as_mut().ok_or(ErrorCode::PackageResults)?;
    control::exchange_results(ctrl, results, false).await?;

    session.publish(State::DisplayResults).await?;
    session.notify_finished();
    Ok(())
}
