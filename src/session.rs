//! The per-test context and its data-plane loop.
//!
//! A [`Session`] owns everything one test needs: the control connection,
//! the responder's listeners, the data streams, the timers and the
//! aggregate counters. Exactly one task drives it. Each loop iteration
//! waits for the first of: the external stop signal, a readable control
//! connection, a new connection or datagram on a listener, a ready stream,
//! or the nearest timer deadline. It then dispatches at most one control
//! message, gives every ready stream one send or receive, runs the due
//! timers and re-evaluates the stop condition.

use crate::config::{Config, Protocol, Role};
use crate::error::{Error, ErrorCode, Result, ResultExt};
use crate::events::{CallbackRef, SessionEvent};
use crate::params::Negotiated;
use crate::protocol::{write_state, Cookie, State};
use crate::results::{StreamSummary, TestResults};
use crate::stream::{Accounting, Stream};
use crate::timer::{TimerId, TimerList};
use crate::transport::{self, DataSocket, SocketOptions, Transport};
use log::{debug, info, warn};
use std::future::{pending, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Extra time a responder gives the initiator past the planned test length
/// before giving up on it.
pub const RESPONDER_GRACE: Duration = Duration::from_secs(40);

/// A receiving stream that stays silent this long after `TestEnd` is done.
pub(crate) const DRAIN_QUIET: Duration = Duration::from_millis(250);

/// Upper bound on the final drain of all receiving streams.
pub(crate) const DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    TestDuration,
    Stats,
    Reporter,
    Omit,
    Pacing,
    TestEndDeadline,
}

/// Why the readiness wait returned.
#[derive(Debug)]
pub(crate) enum Wake {
    Cancelled,
    Control,
    Accept(TcpStream, SocketAddr),
    Datagram(usize, SocketAddr),
    Streams,
    Timer,
}

pub(crate) struct Session {
    pub(crate) role: Role,
    pub(crate) config: Config,
    pub(crate) transport: Transport,
    pub(crate) cookie: Option<Cookie>,
    pub(crate) state: State,
    pub(crate) ctrl: Option<TcpStream>,
    pub(crate) listener: Option<TcpListener>,
    pub(crate) udp_listener: Option<UdpSocket>,
    listener_rebuilt: bool,
    /// Port the control listener was first bound to
    listen_port: Option<u16>,
    pub(crate) negotiated: Option<Negotiated>,
    pub(crate) streams: Vec<Stream>,
    timers: TimerList<TimerEvent>,
    stats_timer: Option<TimerId>,
    reporter_timer: Option<TimerId>,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
    pub(crate) omitting: bool,
    pub(crate) done: bool,
    pub(crate) stop_requested: bool,
    /// When the test entered `TestStart`; interval offsets count from here
    test_origin: Option<Instant>,
    /// Start of the official measurement, moved forward by the warm-up
    test_start: Option<Instant>,
    callback: Option<CallbackRef>,
    cancel: CancellationToken,
    pub(crate) results: Option<TestResults>,
    finish_notified: bool,
}

impl Session {
    pub(crate) fn new(config: Config, callback: Option<CallbackRef>, cancel: CancellationToken) -> Self {
        Self {
            role: config.role,
            transport: Transport::from(config.protocol),
            config,
            cookie: None,
            state: State::Start,
            ctrl: None,
            listener: None,
            udp_listener: None,
            listener_rebuilt: false,
            listen_port: None,
            negotiated: None,
            streams: Vec::new(),
            timers: TimerList::new(),
            stats_timer: None,
            reporter_timer: None,
            bytes_sent: 0,
            bytes_received: 0,
            omitting: false,
            done: false,
            stop_requested: false,
            test_origin: None,
            test_start: None,
            callback,
            cancel,
            results: None,
            finish_notified: false,
        }
    }

    pub(crate) fn notify(&self, event: SessionEvent) {
        if let Some(callback) = &self.callback {
            callback.on_event(event);
        }
    }

    /// Enters `state` locally.
    pub(crate) fn set_state(&mut self, state: State) {
        debug!("{:?} session: {} -> {}", self.role, self.state, state);
        self.state = state;
        self.notify(SessionEvent::StateChanged(state));
    }

    /// Enters `state` and announces it to the peer.
    pub(crate) async fn publish(&mut self, state: State) -> Result<()> {
        self.set_state(state);
        let ctrl = self.ctrl.as_mut().ok_or(ErrorCode::CtrlClose)?;
        write_state(ctrl, state).await
    }

    pub(crate) fn ctrl_mut(&mut self) -> Result<&mut TcpStream> {
        self.ctrl.as_mut().ok_or_else(|| Error::from(ErrorCode::CtrlClose))
    }

    pub(crate) fn negotiated(&self) -> Result<&Negotiated> {
        self.negotiated
            .as_ref()
            .ok_or_else(|| Error::from(ErrorCode::InitTest))
    }

    /// Applies the parameters both ends agreed on.
    pub(crate) fn apply_params(&mut self, negotiated: Negotiated) {
        self.transport = Transport::from(negotiated.protocol);
        self.notify(SessionEvent::Connected {
            cookie: self.cookie.map(|c| c.to_string()).unwrap_or_default(),
            params: negotiated.clone(),
        });
        self.negotiated = Some(negotiated);
    }

    /// Opens (or reopens) the responder's control listener.
    ///
    /// Bind-time options set here are inherited by every accepted stream.
    pub(crate) fn listen(&mut self, options: &SocketOptions) -> Result<()> {
        let port = self.listen_port.unwrap_or(self.config.port);
        // The old socket must be gone before the port can be bound again.
        self.listener = None;
        let listener = transport::listen_tcp(self.config.bind_addr, port, options)?;
        if self.listen_port.is_none() {
            self.listen_port = listener.local_addr().ok().map(|a| a.port());
        }
        self.listener = Some(listener);
        self.listener_rebuilt = *options != SocketOptions::default();
        Ok(())
    }

    /// Restores a plain listener after a rebuild for bind-time options,
    /// or after a rebuild that failed and left no listener at all.
    pub(crate) fn restore_listener(&mut self) -> Result<()> {
        if self.listener_rebuilt || (self.listener.is_none() && self.listen_port.is_some()) {
            debug!("Restoring the plain control listener");
            self.listen(&SocketOptions::default())?;
        }
        Ok(())
    }

    pub(crate) fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Wraps an authenticated data socket as the next stream.
    pub(crate) fn add_stream(&mut self, socket: DataSocket, sender: bool) -> Result<()> {
        let negotiated = self.negotiated()?;
        let id = self.streams.len() as u32 + 1;
        let rate = if sender { negotiated.rate } else { 0 };
        let stream = Stream::new(id, socket, sender, negotiated.block_size, rate, Instant::now());

        debug!(
            "Stream {} {} {:?} <-> {:?}",
            id,
            if sender { "sending" } else { "receiving" },
            stream.local_addr(),
            stream.peer_addr()
        );
        self.notify(SessionEvent::NewStream {
            id,
            sender,
            local: stream.local_addr(),
            peer: stream.peer_addr(),
        });
        self.streams.push(stream);
        Ok(())
    }

    /// Whether senders may push data right now.
    pub(crate) fn sending_allowed(&self) -> bool {
        self.state == State::TestRunning && !self.done
    }

    pub(crate) fn accounting(&self) -> Accounting {
        if !self.sending_allowed() {
            Accounting::Uncounted
        } else if self.omitting {
            Accounting::Omitted
        } else {
            Accounting::Counted
        }
    }

    /// Waits until something needs attention.
    pub(crate) async fn wait(&mut self, datagram: &mut [u8]) -> Result<Wake> {
        let deadline = self.timers.next_instant();
        let sending = self.sending_allowed();
        let cancel = self.cancel.clone();
        let streams = &self.streams;

        tokio::select! {
            biased;

            _ = cancel.cancelled(), if !self.stop_requested => Ok(Wake::Cancelled),

            res = ctrl_readable(self.ctrl.as_ref()) => {
                res.or_code(ErrorCode::CtrlRead)?;
                Ok(Wake::Control)
            }

            res = accept_on(self.listener.as_ref()) => {
                let (stream, peer) = res.or_code(ErrorCode::Accept)?;
                Ok(Wake::Accept(stream, peer))
            }

            res = recv_datagram(self.udp_listener.as_ref(), datagram) => {
                let (n, peer) = res.or_code(ErrorCode::StreamAccept)?;
                Ok(Wake::Datagram(n, peer))
            }

            res = poll_fn(|cx| poll_streams(streams, sending, cx)) => {
                res.or_code(ErrorCode::Select)?;
                Ok(Wake::Streams)
            }

            _ = sleep_until_deadline(deadline) => Ok(Wake::Timer),
        }
    }

    /// Gives every stream one send or receive attempt.
    ///
    /// Only transfers made while the test is running and past the warm-up
    /// reach the session's aggregate counters.
    pub(crate) fn service_streams(&mut self) -> Result<()> {
        let now = Instant::now();
        let sending = self.sending_allowed();
        let accounting = self.accounting();

        for stream in &mut self.streams {
            if !stream.wants_io(sending) {
                continue;
            }
            if stream.is_sender() {
                match stream.send(now, accounting) {
                    Ok(n) => {
                        if accounting == Accounting::Counted {
                            self.bytes_sent += n as u64;
                        }
                    }
                    Err(e) if stream.is_soft_error(&e) => {}
                    Err(e) => return Err(Error::io(ErrorCode::StreamWrite, e)),
                }
            } else {
                match stream.recv(accounting) {
                    Ok(Some(n)) => {
                        if accounting == Accounting::Counted {
                            self.bytes_received += n as u64;
                        }
                    }
                    Ok(None) => debug!("Stream {} reached end of file", stream.id()),
                    Err(e) if stream.is_soft_error(&e) => {}
                    Err(e) => return Err(Error::io(ErrorCode::StreamRead, e)),
                }
            }
        }
        Ok(())
    }

    /// Clears counters and arms the test timers on `TestStart`.
    pub(crate) fn init_test(&mut self, now: Instant) -> Result<()> {
        let negotiated = self.negotiated()?.clone();

        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.done = false;
        self.omitting = !negotiated.omit.is_zero();
        self.test_origin = Some(now);
        self.test_start = Some(now);
        for stream in &mut self.streams {
            stream.start(now);
        }

        self.timers.clear();
        if !negotiated.duration.is_zero() {
            let limit = match self.role {
                Role::Initiator => negotiated.duration + negotiated.omit,
                Role::Responder => negotiated.duration + negotiated.omit + RESPONDER_GRACE,
            };
            self.timers
                .create(now, limit, Duration::ZERO, TimerEvent::TestDuration)?;
        }
        if !self.config.interval.is_zero() {
            let interval = self.config.interval;
            self.stats_timer = Some(self.timers.create(now, interval, interval, TimerEvent::Stats)?);
        }
        if !self.config.reporter_interval.is_zero() {
            let interval = self.config.reporter_interval;
            self.reporter_timer = Some(self.timers.create(now, interval, interval, TimerEvent::Reporter)?);
        }
        if self.omitting {
            self.timers
                .create(now, negotiated.omit, Duration::ZERO, TimerEvent::Omit)?;
        }
        if self.streams.iter().any(|s| s.pacing_rate().is_some()) {
            let period = negotiated.pacing_interval;
            self.timers.create(now, period, period, TimerEvent::Pacing)?;
        }

        debug!(
            "{:?} test initialised: {} streams, {} timers, omitting={}",
            self.role,
            self.streams.len(),
            self.timers.len(),
            self.omitting
        );
        Ok(())
    }

    /// Fires every due timer.
    pub(crate) fn run_timers(&mut self, now: Instant) -> Result<()> {
        // Stats and reporter ticks queued behind the warm-up expiry belong
        // to timers it has just re-armed.
        let mut rearmed = false;
        for event in self.timers.run_due(now) {
            match event {
                TimerEvent::Stats | TimerEvent::Reporter if rearmed => {}
                TimerEvent::TestDuration => match self.role {
                    Role::Initiator => self.done = true,
                    Role::Responder => {
                        warn!("Initiator did not end the test in time");
                        return Err(ErrorCode::TestEndTimeout.into());
                    }
                },
                TimerEvent::Stats => self.stats_snapshot(now),
                TimerEvent::Reporter => self.report(now),
                TimerEvent::Omit => {
                    self.end_warmup(now)?;
                    rearmed = true;
                }
                TimerEvent::Pacing => {
                    for stream in &mut self.streams {
                        stream.refresh_green_light(now);
                    }
                }
                TimerEvent::TestEndDeadline => {
                    warn!("Responder did not finish the test in time");
                    return Err(ErrorCode::TestEndTimeout.into());
                }
            }
        }
        Ok(())
    }

    /// Bounds how long the initiator waits after `TestEnd`.
    pub(crate) fn arm_test_end_deadline(&mut self, now: Instant, limit: Duration) -> Result<()> {
        self.timers
            .create(now, limit, Duration::ZERO, TimerEvent::TestEndDeadline)
            .map(|_| ())
    }

    fn end_warmup(&mut self, now: Instant) -> Result<()> {
        info!("Warm-up over, counting from now on");
        self.omitting = false;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.test_start = Some(now);
        for stream in &mut self.streams {
            stream.end_warmup(now);
        }
        if let Some(id) = self.stats_timer {
            self.timers.reset(id, now)?;
        }
        if let Some(id) = self.reporter_timer {
            self.timers.reset(id, now)?;
        }
        Ok(())
    }

    pub(crate) fn stats_snapshot(&mut self, now: Instant) {
        let Some(origin) = self.test_origin else {
            return;
        };
        let omitted = self.omitting;
        let mut streams = Vec::with_capacity(self.streams.len());
        let mut bytes = 0;
        let mut bits_per_second = 0.0;
        for stream in &mut self.streams {
            let interval = stream.snapshot_interval(now, origin, omitted);
            bytes += interval.bytes;
            bits_per_second += interval.bits_per_second();
            streams.push((stream.id(), interval));
        }
        self.notify(SessionEvent::Interval {
            omitted,
            streams,
            bytes,
            bits_per_second,
        });
    }

    pub(crate) fn report(&self, now: Instant) {
        self.notify(SessionEvent::Report {
            state: self.state,
            elapsed: self.elapsed(now),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            omitting: self.omitting,
        });
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.test_start
            .map_or(Duration::ZERO, |s| now.saturating_duration_since(s))
    }

    /// Whether the initiator should end the test now.
    pub(crate) fn should_stop(&self) -> bool {
        if self.role != Role::Initiator || self.state != State::TestRunning {
            return false;
        }
        if self.stop_requested {
            return true;
        }
        if self.omitting {
            return false;
        }
        let Some(negotiated) = &self.negotiated else {
            return false;
        };
        let transferred = if negotiated.mode.sends(Role::Initiator) {
            self.bytes_sent
        } else {
            self.bytes_received
        };
        let blocks = transferred / negotiated.block_size.max(1) as u64;

        (!negotiated.duration.is_zero() && self.done)
            || (negotiated.bytes > 0 && transferred >= negotiated.bytes)
            || (negotiated.blocks > 0 && blocks >= negotiated.blocks)
    }

    /// Stops official counting, takes the final snapshot and fixes the
    /// local results.
    pub(crate) fn finish_running(&mut self, now: Instant) {
        self.stats_snapshot(now);
        self.done = true;
        self.timers.clear();
        self.stats_timer = None;
        self.reporter_timer = None;
        self.results = Some(self.build_results(now));
        self.report(now);
    }

    /// Reads the remaining data of TCP receiving streams while the test is
    /// still running, so bytes the peer counted before `TestEnd` are
    /// counted here too.
    pub(crate) async fn drain_receivers(&mut self) {
        let accounting = self.accounting();
        let drain = async {
            let mut drained = 0u64;
            for stream in self.streams.iter_mut().filter(|s| !s.is_sender() && s.is_tcp()) {
                let before = stream.counters().bytes_received;
                if let Err(e) = stream.drain(DRAIN_QUIET, accounting).await {
                    debug!("Draining stream {} failed: {}", stream.id(), e);
                }
                drained += stream.counters().bytes_received - before;
            }
            drained
        };
        let outcome = tokio::time::timeout(DRAIN_LIMIT, drain).await;
        match outcome {
            Ok(drained) => {
                debug!("Drained {} bytes after TestEnd", drained);
                if accounting == Accounting::Counted {
                    self.bytes_received += drained;
                }
            }
            Err(_) => {
                warn!("Final drain did not finish within {:?}", DRAIN_LIMIT);
                // Counters of the streams that did drain still hold the bytes.
                self.bytes_received = self
                    .streams
                    .iter()
                    .filter(|s| !s.is_sender())
                    .map(|s| s.counters().bytes_received)
                    .sum();
            }
        }
    }

    /// Sends FIN on every TCP sending stream.
    pub(crate) async fn shutdown_senders(&mut self) {
        for stream in self.streams.iter_mut().filter(|s| s.is_sender() && s.is_tcp()) {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutting down stream {} failed: {}", stream.id(), e);
            }
        }
    }

    pub(crate) fn build_results(&self, now: Instant) -> TestResults {
        let duration = self.elapsed(now);
        let (protocol, mode, omitted) = match &self.negotiated {
            Some(n) => (n.protocol, n.mode, n.omit),
            None => (self.config.protocol, self.config.mode, self.config.omit),
        };
        TestResults {
            role: self.role,
            protocol,
            mode,
            cookie: self.cookie.map(|c| c.to_string()).unwrap_or_default(),
            duration,
            omitted,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            streams: self
                .streams
                .iter()
                .map(|s| StreamSummary::from_stream(s, duration))
                .collect(),
            complete: false,
        }
    }

    /// Hands the final results to the completion hook once.
    pub(crate) fn notify_finished(&mut self) {
        if self.finish_notified {
            return;
        }
        if let Some(results) = &self.results {
            self.finish_notified = true;
            self.notify(SessionEvent::TestFinished(results.clone()));
        }
    }

    /// Records a failure: reports it and, if the test had started, hands
    /// the partial results to the completion hook.
    pub(crate) fn fail(&mut self, error: &Error) {
        self.notify(SessionEvent::Error(error.to_string()));
        if self.test_start.is_some() && self.results.is_none() {
            let now = Instant::now();
            self.stats_snapshot(now);
            self.results = Some(self.build_results(now));
        }
        self.notify_finished();
    }

    /// Closes every data stream.
    pub(crate) fn close_streams(&mut self) {
        // Dropping a stream closes its socket.
        self.streams.clear();
    }

    /// Releases the sockets of this test.
    pub(crate) async fn teardown(&mut self) {
        self.close_streams();
        self.timers.clear();
        self.udp_listener = None;
        if let Some(mut ctrl) = self.ctrl.take() {
            let _ = ctrl.shutdown().await;
        }
    }

    /// Prepares a responder session for the next test.
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.transport = Transport::from(self.config.protocol);
        self.cookie = None;
        self.state = State::Start;
        self.ctrl = None;
        self.udp_listener = None;
        self.negotiated = None;
        self.streams.clear();
        self.timers.clear();
        self.stats_timer = None;
        self.reporter_timer = None;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.omitting = false;
        self.done = false;
        self.stop_requested = false;
        self.test_origin = None;
        self.test_start = None;
        self.results = None;
        self.finish_notified = false;
        self.restore_listener()
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.transport.protocol()
    }
}

async fn ctrl_readable(ctrl: Option<&TcpStream>) -> io::Result<()> {
    match ctrl {
        Some(ctrl) => ctrl.readable().await,
        None => pending().await,
    }
}

async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

async fn recv_datagram(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Ready as soon as any stream that wants I/O is ready for it.
fn poll_streams(streams: &[Stream], sending: bool, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    for stream in streams.iter().filter(|s| s.wants_io(sending)) {
        if let Poll::Ready(res) = stream.poll_ready(cx) {
            return Poll::Ready(res);
        }
    }
    Poll::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Requested;
    use std::sync::{Arc, Mutex};

    fn negotiated(config: &Config) -> Negotiated {
        Negotiated::from_wire(&Requested::from_config(config, None).to_wire()).unwrap()
    }

    fn recording_session(config: Config) -> (Session, Arc<Mutex<Vec<SessionEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: CallbackRef = Arc::new(move |event: SessionEvent| sink.lock().unwrap().push(event));
        (Session::new(config, Some(callback), CancellationToken::new()), events)
    }

    #[test]
    fn test_accounting_follows_state() {
        let config = Config::client("h".to_string(), 1).with_omit(Duration::from_secs(1));
        let (mut session, _) = recording_session(config.clone());
        session.negotiated = Some(negotiated(&config));
        assert_eq!(session.accounting(), Accounting::Uncounted);

        session.init_test(Instant::now()).unwrap();
        session.state = State::TestRunning;
        assert!(session.omitting);
        assert_eq!(session.accounting(), Accounting::Omitted);

        session.omitting = false;
        assert_eq!(session.accounting(), Accounting::Counted);

        session.done = true;
        assert_eq!(session.accounting(), Accounting::Uncounted);
    }

    #[test]
    fn test_stop_on_duration_waits_for_warmup() {
        let config = Config::client("h".to_string(), 1)
            .with_duration(Duration::from_secs(2))
            .with_omit(Duration::from_secs(1));
        let (mut session, _) = recording_session(config.clone());
        session.negotiated = Some(negotiated(&config));
        let start = Instant::now();
        session.init_test(start).unwrap();
        session.state = State::TestRunning;

        session.run_timers(start + Duration::from_secs(2)).unwrap();
        assert!(!session.omitting);
        assert!(!session.should_stop());

        session.run_timers(start + Duration::from_secs(3)).unwrap();
        assert!(session.done);
        assert!(session.should_stop());
    }

    #[test]
    fn test_stop_on_byte_target() {
        let config = Config::client("h".to_string(), 1).with_bytes(10_000);
        let (mut session, _) = recording_session(config.clone());
        session.negotiated = Some(negotiated(&config));
        session.init_test(Instant::now()).unwrap();
        session.state = State::TestRunning;

        session.bytes_sent = 9_999;
        assert!(!session.should_stop());
        session.bytes_sent = 10_000;
        assert!(session.should_stop());
    }

    #[test]
    fn test_stop_signal_ends_running_test() {
        let config = Config::client("h".to_string(), 1);
        let (mut session, _) = recording_session(config.clone());
        session.negotiated = Some(negotiated(&config));
        session.stop_requested = true;
        assert!(!session.should_stop());
        session.state = State::TestRunning;
        assert!(session.should_stop());
    }

    #[test]
    fn test_responder_watchdog() {
        let mut config = Config::server(5201);
        config.duration = Duration::from_secs(1);
        let (mut session, _) = recording_session(config.clone());
        let mut params = negotiated(&Config::client("h".to_string(), 1).with_duration(Duration::from_secs(1)));
        params.omit = Duration::ZERO;
        session.negotiated = Some(params);
        let start = Instant::now();
        session.init_test(start).unwrap();

        assert!(session.run_timers(start + Duration::from_secs(10)).is_ok());
        let err = session
            .run_timers(start + Duration::from_secs(1) + RESPONDER_GRACE)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TestEndTimeout);
    }

    #[test]
    fn test_stats_timer_emits_intervals() {
        let config = Config::client("h".to_string(), 1)
            .with_duration(Duration::from_secs(3))
            .with_interval(Duration::from_secs(1));
        let (mut session, events) = recording_session(config.clone());
        session.negotiated = Some(negotiated(&config));
        let start = Instant::now();
        session.init_test(start).unwrap();

        for secs in 1..=3 {
            session.run_timers(start + Duration::from_secs(secs)).unwrap();
        }
        let intervals = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Interval { .. }))
            .count();
        assert_eq!(intervals, 3);
        assert!(session.done);
    }

    #[tokio::test]
    async fn test_failed_rebuild_is_restored_on_the_same_port() {
        let config = Config::server(0).with_bind_addr("127.0.0.1".parse().unwrap());
        let (mut session, _) = recording_session(config);
        session.listen(&SocketOptions::default()).unwrap();
        let port = session.local_port().unwrap();

        // An address that is not local cannot be bound.
        session.config.bind_addr = Some("192.0.2.1".parse().unwrap());
        let err = session.listen(&SocketOptions::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Listen);
        assert!(session.listener.is_none());

        session.config.bind_addr = Some("127.0.0.1".parse().unwrap());
        session.reset().unwrap();
        assert_eq!(session.local_port(), Some(port));
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    }

    /// Runs a session's timers on a fake clock until the duration timer
    /// ends the test; returns the (counted, omitted) interval snapshots.
    fn run_intervals(duration_ms: u64, warmup_ms: u64, interval_ms: u64, step_ms: u64) -> (u64, u64) {
        let ms = Duration::from_millis;
        let config = Config::client("h".to_string(), 1)
            .with_interval(ms(interval_ms))
            .with_reporter_interval(Duration::ZERO);
        let (mut session, events) = recording_session(config.clone());
        let mut params = negotiated(&config);
        params.duration = ms(duration_ms);
        params.omit = ms(warmup_ms);
        session.negotiated = Some(params);

        let start = Instant::now();
        session.init_test(start).unwrap();
        let mut now = start;
        while !session.done {
            now += ms(step_ms);
            session.run_timers(now).unwrap();
        }

        let events = events.lock().unwrap();
        let count = |want: bool| {
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::Interval { omitted, .. } if *omitted == want))
                .count() as u64
        };
        (count(false), count(true))
    }

    #[test]
    fn test_tick_behind_warmup_expiry_is_dropped() {
        let ms = Duration::from_millis;
        let config = Config::client("h".to_string(), 1)
            .with_interval(ms(600))
            .with_reporter_interval(Duration::ZERO);
        let (mut session, events) = recording_session(config.clone());
        let mut params = negotiated(&config);
        params.omit = ms(1000);
        session.negotiated = Some(params);
        let start = Instant::now();
        session.init_test(start).unwrap();

        let intervals = |events: &Arc<Mutex<Vec<SessionEvent>>>| -> Vec<bool> {
            events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::Interval { omitted, .. } => Some(*omitted),
                    _ => None,
                })
                .collect()
        };

        session.run_timers(start + ms(600)).unwrap();
        // Warm-up ends at 1000; the tick due at 1200 was armed before it.
        session.run_timers(start + ms(1300)).unwrap();
        assert!(!session.omitting);
        assert_eq!(intervals(&events), vec![true]);

        session.run_timers(start + ms(1900)).unwrap();
        assert_eq!(intervals(&events), vec![true, false]);
    }

    #[test]
    fn test_intervals_after_warmup_with_fake_clock() {
        for (d, w, s) in [(10_000, 0, 1000), (8000, 2000, 1000), (3500, 1500, 700), (3000, 0, 250)] {
            let (counted, omitted) = run_intervals(d, w, s, 7);
            let expected = d / s;
            assert!(
                counted + 1 >= expected && counted <= expected + 1,
                "d={} w={} s={}: counted {} expected {}",
                d,
                w,
                s,
                counted,
                expected
            );
            assert!(omitted <= w / s + 1, "omitted {} for w={} s={}", omitted, w, s);
            if w == 0 {
                assert_eq!(omitted, 0);
            }
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Intervals counted after the warm-up stay within one of D / S
            #[test]
            fn prop_interval_liveness(
                interval in 100u64..1000,
                warmup in 0u64..2000,
                extra in 1u64..6000,
                step in 1u64..20,
            ) {
                let duration = interval + extra;
                let expected = duration / interval;
                let (counted, _) = run_intervals(duration, warmup, interval, step);
                prop_assert!(counted + 1 >= expected && counted <= expected + 1);
            }
        }
    }

    #[test]
    fn test_failure_before_start_has_no_results() {
        let config = Config::client("h".to_string(), 1);
        let (mut session, events) = recording_session(config);
        session.fail(&Error::from(ErrorCode::TotalRate));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::Error(_)));
    }

    #[test]
    fn test_failure_after_start_reports_partial_results_once() {
        let config = Config::client("h".to_string(), 1);
        let (mut session, events) = recording_session(config.clone());
        session.negotiated = Some(negotiated(&config));
        session.init_test(Instant::now()).unwrap();
        session.bytes_sent = 1234;

        session.fail(&Error::from(ErrorCode::CtrlClose));
        session.fail(&Error::from(ErrorCode::CtrlClose));

        let finished: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::TestFinished(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].bytes_sent, 1234);
        assert!(!finished[0].complete);
    }
}
