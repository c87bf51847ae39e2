//! Responder-side total bandwidth ceiling.
//!
//! The decision depends only on the negotiated stream count, per-stream
//! rate and mode plus the configured ceiling. It runs once, after every
//! data connection of the session has been accepted and before `TestStart`.

use crate::config::Mode;
use crate::error::{Error, ErrorCode, Result};

/// Aggregate rate in bits per second a session asks for.
///
/// # Examples
///
/// ```
/// use tperf::admission::requested_total;
/// use tperf::Mode;
///
/// assert_eq!(requested_total(4, 1_000_000, Mode::Send), 4_000_000);
/// assert_eq!(requested_total(4, 1_000_000, Mode::Bidirectional), 8_000_000);
/// ```
pub fn requested_total(num_streams: usize, per_stream_rate: u64, mode: Mode) -> u64 {
    let directions = if mode == Mode::Bidirectional { 2 } else { 1 };
    (num_streams as u64)
        .saturating_mul(per_stream_rate)
        .saturating_mul(directions)
}

/// Checks a requested aggregate against a ceiling; zero disables the check.
///
/// # Errors
///
/// Returns [`ErrorCode::TotalRate`] when the ceiling is set and exceeded.
pub fn check(requested: u64, ceiling: u64) -> Result<()> {
    if ceiling > 0 && requested > ceiling {
        return Err(Error::from(ErrorCode::TotalRate));
    }
    Ok(())
}

/// Applies the ceiling to a negotiated session.
pub fn admit(num_streams: usize, per_stream_rate: u64, mode: Mode, ceiling: Option<u64>) -> Result<()> {
    check(
        requested_total(num_streams, per_stream_rate, mode),
        ceiling.unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_no_ceiling_admits_everything() {
        assert!(admit(128, u64::MAX, Mode::Bidirectional, None).is_ok());
        assert!(admit(128, u64::MAX, Mode::Bidirectional, Some(0)).is_ok());
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        assert!(admit(3, 1, Mode::Send, Some(3)).is_ok());
        let err = admit(4, 1, Mode::Send, Some(3)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TotalRate);
        assert_eq!(err.kind(), ErrorKind::Admission);
    }

    #[test]
    fn test_bidirectional_counts_both_directions() {
        assert!(admit(2, 10, Mode::Receive, Some(25)).is_ok());
        assert!(admit(2, 10, Mode::Bidirectional, Some(25)).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn mode() -> impl Strategy<Value = Mode> {
            prop_oneof![Just(Mode::Send), Just(Mode::Receive), Just(Mode::Bidirectional)]
        }

        proptest! {
            #[test]
            fn decision_is_pure(
                streams in 1usize..=128,
                rate in 0u64..10_000_000_000,
                mode in mode(),
                ceiling in 0u64..100_000_000_000,
            ) {
                let first = admit(streams, rate, mode, Some(ceiling)).is_ok();
                for _ in 0..3 {
                    prop_assert_eq!(admit(streams, rate, mode, Some(ceiling)).is_ok(), first);
                }
                let expected = ceiling == 0 || requested_total(streams, rate, mode) <= ceiling;
                prop_assert_eq!(first, expected);
            }

            #[test]
            fn total_is_monotonic_in_streams(
                streams in 1usize..128,
                rate in 0u64..1_000_000_000,
                mode in mode(),
            ) {
                prop_assert!(requested_total(streams + 1, rate, mode) >= requested_total(streams, rate, mode));
            }
        }
    }
}
