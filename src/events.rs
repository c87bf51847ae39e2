//! Lifecycle notifications for embedders.
//!
//! A session reports what happens to it through a single [`EventCallback`].
//! Callbacks run inline on the session task, so they should return quickly;
//! [`EventChannel`] moves the handling onto another task when that is not
//! possible.

use crate::params::Negotiated;
use crate::protocol::State;
use crate::results::TestResults;
use crate::stream::IntervalResult;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Notification emitted by a running session.
///
/// # Examples
///
/// ```
/// use tperf::{SessionEvent, State};
///
/// let event = SessionEvent::StateChanged(State::TestRunning);
/// match event {
///     SessionEvent::StateChanged(state) => println!("now in {}", state),
///     SessionEvent::Interval { bits_per_second, .. } => {
///         println!("{:.2} Mbps", bits_per_second / 1_000_000.0)
///     }
///     _ => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The local session entered a new control state.
    StateChanged(State),

    /// Parameters were exchanged with the peer.
    Connected {
        cookie: String,
        params: Negotiated,
    },

    /// A data stream was authenticated and added to the session.
    NewStream {
        id: u32,
        sender: bool,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    },

    /// One stats interval closed.
    Interval {
        omitted: bool,
        streams: Vec<(u32, IntervalResult)>,
        bytes: u64,
        bits_per_second: f64,
    },

    /// Periodic progress summary, also emitted once when the test stops.
    Report {
        state: State,
        elapsed: Duration,
        bytes_sent: u64,
        bytes_received: u64,
        omitting: bool,
    },

    /// The test finished, successfully or not. On failure the results
    /// carry whatever was measured before the error.
    TestFinished(TestResults),

    /// The session failed.
    Error(String),
}

/// Receiver of session notifications.
///
/// Implemented for every `Fn(SessionEvent) + Send + Sync` closure.
///
/// # Examples
///
/// ```
/// use tperf::{EventCallback, SessionEvent};
///
/// struct Logger;
///
/// impl EventCallback for Logger {
///     fn on_event(&self, event: SessionEvent) {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub trait EventCallback: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl<F> EventCallback for F
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: SessionEvent) {
        self(event)
    }
}

pub(crate) type CallbackRef = Arc<dyn EventCallback>;

/// Forwards events into an unbounded channel.
///
/// # Examples
///
/// ```
/// use tperf::{Client, Config, EventChannel};
///
/// # #[tokio::main]
/// # async fn main() {
/// let (channel, mut events) = EventChannel::new();
/// let client = Client::new(Config::client("127.0.0.1".to_string(), 5201))
///     .unwrap()
///     .with_callback(channel);
///
/// tokio::spawn(async move {
///     while let Some(event) = events.recv().await {
///         println!("{:?}", event);
///     }
/// });
/// # drop(client);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EventChannel {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl EventChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventCallback for EventChannel {
    fn on_event(&self, event: SessionEvent) {
        // A dropped receiver only means nobody listens anymore.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: CallbackRef = Arc::new(move |event: SessionEvent| {
            if let SessionEvent::StateChanged(state) = event {
                sink.lock().unwrap().push(state);
            }
        });

        callback.on_event(SessionEvent::StateChanged(State::ParamExchange));
        callback.on_event(SessionEvent::Error("ignored".to_string()));
        callback.on_event(SessionEvent::StateChanged(State::CreateStreams));

        assert_eq!(*seen.lock().unwrap(), vec![State::ParamExchange, State::CreateStreams]);
    }

    #[tokio::test]
    async fn test_channel_forwards_in_order() {
        let (channel, mut events) = EventChannel::new();
        channel.on_event(SessionEvent::StateChanged(State::TestStart));
        channel.on_event(SessionEvent::StateChanged(State::TestRunning));

        assert!(matches!(events.recv().await, Some(SessionEvent::StateChanged(State::TestStart))));
        assert!(matches!(events.recv().await, Some(SessionEvent::StateChanged(State::TestRunning))));
    }

    #[test]
    fn test_channel_survives_dropped_receiver() {
        let (channel, events) = EventChannel::new();
        drop(events);
        channel.on_event(SessionEvent::Error("nobody listens".to_string()));
    }
}
