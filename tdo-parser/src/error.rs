//! Error types for tdo-parser.

use thiserror::Error;

/// A time expression could not be resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("invalid time expression '{0}'")]
    InvalidExpression(String),

    /// Well-formed, but the instant or duration does not fit the calendar.
    #[error("time expression '{0}' is out of range")]
    OutOfRange(String),
}

/// A command token could not be turned into a structured request.
/// Always carries the offending token; nothing has been mutated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Recognised key with a value it does not accept (`pri:Q`, `status:maybe`).
    #[error("invalid value in '{token}': {message}")]
    InvalidValue { token: String, message: String },

    /// `due:` / `wait:` / filter bound whose expression did not resolve.
    #[error("invalid time in '{token}': {source}")]
    Time {
        token: String,
        #[source]
        source: TimeError,
    },

    /// `x:` token without a `NAME:value` part.
    #[error("malformed property token '{0}'; expected x:NAME:value")]
    MalformedProperty(String),

    /// `x:` naming a property that cannot be set directly.
    #[error("property {name} in '{token}' cannot be set with x:")]
    ReservedProperty { token: String, name: String },

    #[error("task summary is empty")]
    EmptySummary,

    #[error("nothing to change; give at least one field edit")]
    NoEdits,
}
