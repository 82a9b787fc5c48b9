//! Command-line token parsing for tdo.
//!
//! - [`time`]: time expressions (`eod`, `tue`, `2h30m`, ISO-8601)
//! - [`grammar`]: `add` / `modify` tokens → [`MutationRequest`]
//! - [`selector`]: index lists and metadata filters → [`Selector`]
//!
//! Every entry point takes `now` explicitly; nothing here reads the clock.
//!
//! [`MutationRequest`]: tdo_core::request::MutationRequest
//! [`Selector`]: tdo_core::request::Selector

pub mod error;
pub mod grammar;
pub mod selector;
pub mod time;

pub use error::{ParseError, TimeError};
pub use grammar::{delete, parse, parse_index_list, status_change, Mode};
pub use selector::{parse_filter, parse_selector};
pub use time::{resolve, resolve_instant, Resolved};
