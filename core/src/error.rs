use thiserror::Error;

/// A malformed input line or field. Jobs skip and count these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("not an integer identifier: {0:?}")]
    Identifier(String),
    #[error("malformed record ({reason}): {line:?}")]
    Record { line: String, reason: String },
    #[error("invalid number in field {field}: {value:?}")]
    Number { field: &'static str, value: String },
}

/// A record that breaks a stored invariant; rejected at the persistence boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("{field} out of range [0,100]: {value}")]
    Percentage { field: &'static str, value: f64 },
    #[error("no-data score must have zero percentage and samples (asn {0})")]
    NoDataNotEmpty(u32),
    #[error("self-referential routing edge for AS{0}")]
    SelfEdge(u32),
    #[error("{field} must be a finite, non-negative duration: {value}")]
    Rtt { field: &'static str, value: f64 },
    #[error("{field} present without a successful connection")]
    RttWithoutConnection { field: &'static str },
    #[error("status {found} does not follow from capability checks (expected {expected})")]
    Status { expected: &'static str, found: &'static str },
    #[error("empty {0}")]
    Empty(&'static str),
}
