//! tperf - a network throughput test engine speaking the iperf3 protocol
//!
//! An initiator ([`Client`]) and a responder ([`Server`]) coordinate a test
//! over a TCP control connection driven by single-byte state messages, then
//! move data over one or more TCP or UDP streams bound to the session by a
//! random cookie. After the test both sides swap their measurements so
//! each can report what the other end actually saw.
//!
//! # Features
//!
//! - TCP and UDP data streams, send, receive or bidirectional
//! - Duration, byte or block end conditions with an optional warm-up period
//! - Per-stream pacing for rate-limited tests
//! - UDP loss, reordering and jitter accounting
//! - Responder-side aggregate bandwidth admission
//! - Progress events through callbacks or a channel
//!
//! # Example
//!
//! ```no_run
//! use tperf::{Client, Config, Server};
//! use std::time::Duration;
//!
//! # async fn demo() -> tperf::Result<()> {
//! let server = Server::new(Config::server(5201))?;
//! tokio::spawn(async move { server.run().await });
//!
//! let client = Client::new(
//!     Config::client("127.0.0.1".to_string(), 5201).with_duration(Duration::from_secs(3)),
//! )?;
//! let results = client.run().await?;
//! println!("{:.2} Mbps", results.sent_bits_per_second() / 1_000_000.0);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod client;
pub mod config;
mod control;
pub mod error;
pub mod events;
pub mod pacing;
pub mod params;
pub mod protocol;
pub mod results;
pub mod server;
mod session;
pub mod stream;
pub mod timer;
pub mod transport;
pub mod udp_packet;

pub use client::Client;
pub use config::{Config, Mode, Protocol, Role};
pub use error::{Error, ErrorCode, ErrorKind, Result};
pub use events::{EventCallback, EventChannel, SessionEvent};
pub use params::Negotiated;
pub use protocol::State;
pub use results::{StreamSummary, TestResults};
pub use server::Server;
pub use stream::IntervalResult;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
