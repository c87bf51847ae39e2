//! Control connection exchanges shared by both drivers.
//!
//! The data-plane loop only ever reads one state byte at a time from the
//! control connection, without blocking. Anything that follows a state
//! byte (a parameter or results blob, an error code) is read to completion
//! before the loop resumes.

use crate::error::{Error, ErrorCode, Result};
use crate::params::WireParams;
use crate::protocol::{read_blob, write_blob, write_error_code, write_state, State};
use crate::results::{ResultsReport, TestResults};
use log::debug;
use std::io;
use tokio::net::TcpStream;

/// What one read of the control connection produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Incoming {
    State(State),
    /// The peer closed the control connection
    Closed,
    /// A byte that is not a known state
    Unknown(u8),
}

/// Returned by message handlers to tell the loop whether the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Finished,
}

/// Reads one state byte if one is available.
///
/// Returns `Ok(None)` on a spurious wakeup.
pub(crate) fn try_read_message(ctrl: &TcpStream) -> Result<Option<Incoming>> {
    let mut byte = [0u8; 1];
    match ctrl.try_read(&mut byte) {
        Ok(0) => Ok(Some(Incoming::Closed)),
        Ok(_) => Ok(Some(match State::from_wire(byte[0]) {
            Some(state) => Incoming::State(state),
            None => Incoming::Unknown(byte[0]),
        })),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
        Err(e) => Err(Error::io(ErrorCode::CtrlRead, e)),
    }
}

pub(crate) async fn send_params(ctrl: &mut TcpStream, params: &WireParams) -> Result<()> {
    write_blob(ctrl, params, ErrorCode::SendParams).await
}

pub(crate) async fn recv_params(ctrl: &mut TcpStream) -> Result<WireParams> {
    read_blob(ctrl, ErrorCode::RecvParams).await
}

/// Swaps results with the peer and merges the peer's figures.
///
/// The initiator sends first and the responder reads first, so neither
/// side can block the other.
pub(crate) async fn exchange_results(ctrl: &mut TcpStream, local: &mut TestResults, send_first: bool) -> Result<()> {
    let ours = local.to_report();
    let peer: ResultsReport = if send_first {
        write_blob(ctrl, &ours, ErrorCode::SendResults).await?;
        read_blob(ctrl, ErrorCode::RecvResults).await?
    } else {
        let peer = read_blob(ctrl, ErrorCode::RecvResults).await?;
        write_blob(ctrl, &ours, ErrorCode::SendResults).await?;
        peer
    };
    debug!("Peer reported {} streams", peer.streams.len());
    local.merge_peer(&peer)
}

/// Reports a local failure to the peer as `ServerError` plus code and errno.
pub(crate) async fn send_error(ctrl: &mut TcpStream, error: &Error) -> Result<()> {
    write_state(ctrl, State::ServerError).await?;
    write_error_code(ctrl, error.code(), error.errno()).await
}

/// Whether a failure should be reported to the peer before teardown.
///
/// Failures the peer caused or already knows about are not echoed back.
pub(crate) fn should_report(error: &Error) -> bool {
    error.peer_errno().is_none()
        && !matches!(
            error.code(),
            ErrorCode::CtrlClose
                | ErrorCode::CtrlRead
                | ErrorCode::CtrlWrite
                | ErrorCode::SendMessage
                | ErrorCode::ClientTerminated
                | ErrorCode::Kill
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_error_code;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn ctrl_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    async fn next_message(ctrl: &TcpStream) -> Incoming {
        loop {
            ctrl.readable().await.unwrap();
            if let Some(msg) = try_read_message(ctrl).unwrap() {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_reads_states_and_unknown_bytes() {
        let (mut a, b) = ctrl_pair().await;
        a.write_all(&[State::TestEnd.to_wire(), 0x42]).await.unwrap();

        assert_eq!(next_message(&b).await, Incoming::State(State::TestEnd));
        assert_eq!(next_message(&b).await, Incoming::Unknown(0x42));

        drop(a);
        assert_eq!(next_message(&b).await, Incoming::Closed);
    }

    #[tokio::test]
    async fn test_nothing_pending_is_not_a_message() {
        let (_a, b) = ctrl_pair().await;
        assert_eq!(try_read_message(&b).unwrap(), None);
    }

    #[tokio::test]
    async fn test_params_cross_the_wire() {
        let (mut a, mut b) = ctrl_pair().await;
        let config = crate::Config::client("h".to_string(), 1).with_parallel(3);
        let wire = crate::params::Requested::from_config(&config, None).to_wire();

        send_params(&mut a, &wire).await.unwrap();
        let received = recv_params(&mut b).await.unwrap();
        assert_eq!(received.parallel, 3);
    }

    #[tokio::test]
    async fn test_error_report_layout() {
        let (mut a, mut b) = ctrl_pair().await;
        let error = Error::from(ErrorCode::TotalRate);
        send_error(&mut a, &error).await.unwrap();

        let mut byte = [0u8; 1];
        b.read_exact(&mut byte).await.unwrap();
        assert_eq!(State::from_wire(byte[0]), Some(State::ServerError));
        let (code, errno) = read_error_code(&mut b).await.unwrap();
        assert_eq!(code, ErrorCode::TotalRate);
        assert_eq!(errno, 0);
    }

    #[test]
    fn test_peer_caused_failures_are_not_echoed() {
        assert!(should_report(&Error::from(ErrorCode::TotalRate)));
        assert!(should_report(&Error::from(ErrorCode::Message)));
        assert!(!should_report(&Error::from(ErrorCode::CtrlClose)));
        assert!(!should_report(&Error::from(ErrorCode::Kill)));
        assert!(!should_report(&Error::Peer {
            code: ErrorCode::StreamId,
            errno: 0
        }));
    }
}
