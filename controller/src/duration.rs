//! Parsing for duration literals such as `300ms`, `1.5h` or `2h45m`.
//!
//! A literal is a sequence of decimal numbers, each with an optional fraction and a unit suffix. Valid units are
//! `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. The unitless literal `0` is also accepted.
use snafu::ensure;
use std::time::Duration;

/// The module-wide result type.
type Result<T> = std::result::Result<T, duration_error::Error>;

/// Parses a duration literal into a `std::time::Duration`.
pub fn parse_duration<S: AsRef<str>>(literal: S) -> Result<Duration> {
    let literal = literal.as_ref();
    ensure!(!literal.is_empty(), duration_error::EmptySnafu);

    let nanos = go_parse_duration::parse_duration(literal).map_err(|err| {
        duration_error::Error::Invalid {
            literal: literal.to_string(),
            reason: format!("{:?}", err),
        }
    })?;

    // Go's ParseDuration accepts negative literals; a negative wait is meaningless here, so they are rejected.
    let nanos = u64::try_from(nanos).map_err(|_| duration_error::Error::Negative {
        literal: literal.to_string(),
    })?;
    Ok(Duration::from_nanos(nanos))
}

pub mod duration_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Duration literal is empty"))]
        Empty,

        #[snafu(display("Duration '{}' is negative", literal))]
        Negative { literal: String },

        #[snafu(display("Invalid duration '{}': {}", literal, reason))]
        Invalid { literal: String, reason: String },
    }
}
