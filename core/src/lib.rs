//! Core types shared by the probe, scan, ingestion and routing engines.

pub mod error;
pub mod model;
pub mod ratelimiter;

pub use error::{InvariantViolation, ParseError};
pub use model::*;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Current UTC time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

/// Calendar date (`YYYY-MM-DD`) of an RFC 3339 timestamp, or today's UTC date when it cannot be parsed.
pub fn date_of(timestamp: &str) -> String {
    OffsetDateTime::parse(timestamp, &Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .date()
        .to_string()
}

/// Parse an autonomous-system identifier, accepting an optional `AS` prefix.
pub fn parse_asn(raw: &str) -> Result<Asn, ParseError> {
    let s = raw.trim();
    let digits = s
        .strip_prefix("AS")
        .or_else(|| s.strip_prefix("as"))
        .or_else(|| s.strip_prefix("As"))
        .unwrap_or(s);
    digits
        .parse::<Asn>()
        .map_err(|_| ParseError::Identifier(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn parse_asn_accepts_prefix() {
        assert_eq!(parse_asn("AS13335").unwrap(), 13335);
        assert_eq!(parse_asn(" as64512 ").unwrap(), 64512);
        assert_eq!(parse_asn("4134").unwrap(), 4134);
    }

    #[test]
    fn parse_asn_rejects_non_integers() {
        assert!(parse_asn("AS").is_err());
        assert!(parse_asn("12.5").is_err());
        assert!(parse_asn("-7").is_err());
        assert!(parse_asn("AS99999999999").is_err());
    }

    #[test]
    fn date_of_extracts_calendar_day() {
        assert_eq!(date_of("2026-02-03T10:11:12Z"), "2026-02-03");
        assert_eq!(date_of("2026-02-03T23:59:00+05:30"), "2026-02-03");
    }
}
