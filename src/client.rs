use crate::config::{Config, Role};
use crate::control::{self, Flow, Incoming};
use crate::error::{Error, ErrorCode, Result, ResultExt};
use crate::events::{CallbackRef, EventCallback};
use crate::params::{Negotiated, Requested};
use crate::protocol::{read_error_code, write_cookie, Cookie, State};
use crate::results::TestResults;
use crate::session::{Session, Wake};
use crate::transport::{self, SocketOptions};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The initiator side of a throughput test.
///
/// A `Client` opens the control connection, sends the test parameters,
/// connects the data streams and drives the test until the responder
/// displays results. It owns the test timers: the duration timer ends the
/// test, the warm-up timer clears the counters once ramp-up is over.
///
/// # Examples
///
/// ## Basic TCP Test
///
/// ```no_run
/// use tperf::{Client, Config, Protocol};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_protocol(Protocol::Tcp)
///     .with_duration(Duration::from_secs(10));
///
/// let client = Client::new(config)?;
/// let results = client.run().await?;
///
/// println!("Sent {:.2} Mbps, peer received {} bytes",
///          results.sent_bits_per_second() / 1_000_000.0,
///          results.peer_bytes_received());
/// # Ok(())
/// # }
/// ```
///
/// ## Reverse UDP Test with Events
///
/// ```no_run
/// use tperf::{Client, Config, Mode, Protocol, SessionEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_mode(Mode::Receive)
///     .with_bandwidth(50_000_000);
///
/// let client = Client::new(config)?.with_callback(|event: SessionEvent| {
///     if let SessionEvent::Interval { bits_per_second, .. } = event {
///         println!("{:.2} Mbps", bits_per_second / 1_000_000.0);
///     }
/// });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
    results: Arc<Mutex<Option<TestResults>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::ServerClient`] for a responder configuration
    /// and with the matching configuration error if validation fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Client, Config, ErrorCode};
    ///
    /// let client = Client::new(Config::client("127.0.0.1".to_string(), 5201));
    /// assert!(client.is_ok());
    ///
    /// let err = Client::new(Config::server(5201)).err().unwrap();
    /// assert_eq!(err.code(), ErrorCode::ServerClient);
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.role != Role::Initiator {
            return Err(Error::config(
                ErrorCode::ServerClient,
                "a client needs an initiator configuration",
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
    ///
    /// # Examples
    ///
    /// ```
    /// use tperf::{Client, Config, SessionEvent};
    ///
    /// let client = Client::new(Config::client("127.0.0.1".to_string(), 5201))
    ///     .unwrap()
    ///     .with_callback(|event: SessionEvent| println!("{:?}", event));
    /// ```
    pub fn with_callback<C: EventCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Token that ends a running test early.
    ///
    /// Cancelling behaves like the duration timer firing: the client still
    /// sends `TestEnd` and exchanges results, so the responder sees a clean
    /// end of test.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tperf::{Client, Config};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = Client::new(Config::client("127.0.0.1".to_string(), 5201))?;
    /// let token = client.cancellation_token().clone();
    ///
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(2)).await;
    ///     token.cancel();
    /// });
    ///
    /// let results = client.run().await?;
    /// println!("stopped after {:?}", results.duration);
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Results of the most recent run, partial if it failed.
    pub fn results(&self) -> Option<TestResults> {
        self.results.lock().clone()
    }

    /// Runs one test against the configured responder.
    ///
    /// On failure the callback still receives the error and, if the test
    /// had started, the partial results.
    ///
    /// # Errors
    ///
    /// Returns connection errors from the control or data connections,
    /// protocol errors from the control exchange, and errors the responder
    /// reported (for example [`ErrorCode::AccessDenied`] when it is busy or
    /// [`ErrorCode::TotalRate`] when admission control rejects the test).
    pub async fn run(&self) -> Result<TestResults> {
        let mut session = Session::new(
            self.config.clone(),
            self.callback.clone(),
            self.cancellation_token.clone(),
        );

        let outcome = drive(&mut session).await;
        if let Err(e) = &outcome {
            error!("Test failed: {}", e);
            session.fail(e);
        }
        session.teardown().await;
        *self.results.lock() = session.results.take();
        outcome
    }
}

async fn drive(session: &mut Session) -> Result<TestResults> {
    let host = session
        .config
        .server_addr
        .clone()
        .ok_or_else(|| Error::config(ErrorCode::NoRole, "no server address"))?;
    let port = session.config.port;

    info!("Connecting to {}:{}", host, port);
    let mut ctrl = transport::connect_control(
        &host,
        port,
        session.config.bind_addr,
        session.config.connect_timeout,
    )
    .await?;
    let ctrl_mss = transport::control_mss(&ctrl);

    let cookie = Cookie::generate();
    write_cookie(&mut ctrl, &cookie).await?;
    info!(
        "Control connection {} -> {} (cookie {})",
        ctrl.local_addr().or_code(ErrorCode::Connect)?,
        ctrl.peer_addr().or_code(ErrorCode::Connect)?,
        cookie
    );
    session.cookie = Some(cookie);
    session.ctrl = Some(ctrl);
    session.set_state(State::Start);

    let requested = Requested::from_config(&session.config, ctrl_mss);
    let mut unused = [0u8; 0];

    loop {
        match session.wait(&mut unused).await? {
            Wake::Cancelled => {
                info!("Stop requested, ending the test");
                session.stop_requested = true;
            }
            Wake::Control => {
                let message = control::try_read_message(session.ctrl_mut()?)?;
                if let Some(message) = message {
                    if handle_message(session, message, &requested).await? == Flow::Finished {
                        break;
                    }
                }
            }
            Wake::Accept(..) | Wake::Datagram(..) | Wake::Streams | Wake::Timer => {}
        }

        session.service_streams()?;
        session.run_timers(Instant::now())?;
        if session.should_stop() {
            end_test(session).await?;
        }
    }

    session
        .results
        .clone()
        .ok_or_else(|| Error::from(ErrorCode::PackageResults))
}

async fn handle_message(session: &mut Session, message: Incoming, requested: &Requested) -> Result<Flow> {
    let state = match message {
        Incoming::State(state) => state,
        Incoming::Closed => return Err(ErrorCode::CtrlClose.into()),
        Incoming::Unknown(byte) => {
            warn!("Unknown control byte {:#04x}", byte);
            return Err(ErrorCode::Message.into());
        }
    };

    match state {
        State::ParamExchange => {
            session.set_state(State::ParamExchange);
            let wire = requested.to_wire();
            control::send_params(session.ctrl_mut()?, &wire).await?;
            let negotiated = Negotiated::from_wire(&wire)?;
            session.apply_params(negotiated);
        }
        State::CreateStreams => {
            session.set_state(State::CreateStreams);
            connect_streams(session).await?;
        }
        State::TestStart => {
            session.set_state(State::TestStart);
            session.init_test(Instant::now())?;
        }
        State::TestRunning => session.set_state(State::TestRunning),
        State::ExchangeResults => {
            session.set_state(State::ExchangeResults);
            let ctrl = session.ctrl.as_mut().ok_or(ErrorCode::CtrlClose)?;
            let results = session.results.as_mut().ok_or(ErrorCode::PackageResults)?;
            control::exchange_results(ctrl, results, true).await?;
        }
        State::DisplayResults => {
            session.set_state(State::DisplayResults);
            session.notify_finished();
            session.close_streams();
            session.publish(State::Done).await?;
            if let Some(mut ctrl) = session.ctrl.take() {
                let _ = ctrl.shutdown().await;
            }
            info!("Test complete");
            return Ok(Flow::Finished);
        }
        State::ServerTerminate => {
            session.set_state(State::ServerTerminate);
            session.report(Instant::now());
            return Err(ErrorCode::ServerTerminated.into());
        }
        State::AccessDenied => {
            session.set_state(State::AccessDenied);
            return Err(ErrorCode::AccessDenied.into());
        }
        State::ServerError => {
            session.set_state(State::ServerError);
            let (code, errno) = read_error_code(session.ctrl_mut()?).await?;
            return Err(Error::Peer { code, errno });
        }
        other => {
            warn!("Unexpected {} from the responder in {}", other, session.state);
            return Err(ErrorCode::Message.into());
        }
    }
    Ok(Flow::Continue)
}

/// Connects every data stream, sending streams first.
async fn connect_streams(session: &mut Session) -> Result<()> {
    let negotiated = session.negotiated()?.clone();
    let cookie = session.cookie.ok_or(ErrorCode::CreateStream)?;
    let peer = session
        .ctrl_mut()?
        .peer_addr()
        .or_code(ErrorCode::StreamConnect)?;
    let server = SocketAddr::new(peer.ip(), session.config.port);
    let options = SocketOptions::from_negotiated(&negotiated);
    let senders = negotiated.send_streams(Role::Initiator);
    let total = negotiated.total_streams();

    for i in 0..total {
        let local = local_stream_addr(&session.config, &server, i)?;
        let socket = session
            .transport
            .connect(server, local, &cookie, &options, session.config.connect_timeout)
            .await?;
        session.add_stream(socket, i < senders)?;
    }
    debug!("Connected {} data streams", total);
    Ok(())
}

/// Local address of the `index`-th data stream: the bind port plus the
/// stream index when a bind port is configured.
fn local_stream_addr(config: &Config, server: &SocketAddr, index: usize) -> Result<Option<SocketAddr>> {
    let ip = config.bind_addr.unwrap_or(match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    match config.bind_port {
        Some(base) => {
            let port = u16::try_from(index)
                .ok()
                .and_then(|i| base.checked_add(i))
                .ok_or_else(|| Error::config(ErrorCode::BadPort, "stream bind port out of range"))?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        None => Ok(config.bind_addr.map(|ip| SocketAddr::new(ip, 0))),
    }
}

/// Ends the running test: stops counting, closes the sending half of every
/// TCP stream so the responder can drain to end-of-file, then sends `TestEnd`.
async fn end_test(session: &mut Session) -> Result<()> {
    let now = Instant::now();
    session.finish_running(now);
    session.shutdown_senders().await;
    info!(
        "Test done: sent {} bytes, received {} bytes",
        session.bytes_sent, session.bytes_received
    );
    session.publish(State::TestEnd).await?;
    if let Some(limit) = session.config.test_end_timeout {
        session.arm_test_end_deadline(now, limit)?;
    }
    Ok(())
}
