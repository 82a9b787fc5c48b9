//! Selector grammar for `list`, `do`, `start`, `stop`, `del` and `move`.
//!
//! No tokens selects the visible list. Tokens that are all index lists
//! select those indices. Anything else is a metadata filter.

use chrono::{DateTime, FixedOffset};

use tdo_core::request::{Selector, TaskFilter};

use crate::error::ParseError;
use crate::grammar::{parse_index_list, priority, status};
use crate::time::resolve_instant;

pub fn parse_selector<S: AsRef<str>>(
    tokens: &[S],
    now: DateTime<FixedOffset>,
) -> Result<Selector, ParseError> {
    if tokens.is_empty() {
        return Ok(Selector::Visible);
    }
    let lists: Option<Vec<_>> = tokens
        .iter()
        .map(|t| parse_index_list(t.as_ref()))
        .collect();
    if let Some(lists) = lists {
        return Ok(Selector::Indices(lists.into_iter().flatten().collect()));
    }
    parse_filter(tokens, now).map(Selector::Filter)
}

/// Metadata predicates only; index lists are treated as words.
pub fn parse_filter<S: AsRef<str>>(
    tokens: &[S],
    now: DateTime<FixedOffset>,
) -> Result<TaskFilter, ParseError> {
    let mut filter = TaskFilter::default();
    for token in tokens {
        let token = token.as_ref();
        if let Some(tag) = token.strip_prefix('+').filter(|t| !t.is_empty()) {
            filter.tags.push(tag.to_owned());
            continue;
        }
        if let Some(tag) = token.strip_prefix('-').filter(|t| !t.is_empty()) {
            filter.without_tags.push(tag.to_owned());
            continue;
        }
        if let Some((key, value)) = token.split_once(':') {
            let value = value.trim();
            let bound = || {
                resolve_instant(value, now).map_err(|source| ParseError::Time {
                    token: token.to_owned(),
                    source,
                })
            };
            match key.to_ascii_lowercase().as_str() {
                "status" if value.eq_ignore_ascii_case("any") => filter.include_closed = true,
                "status" => filter.status = Some(status(token, value)?),
                "pri" | "priority" => filter.priority = Some(priority(token, value)?),
                "project" | "proj" => filter.project = Some(value.to_owned()),
                "due.before" => filter.due_before = Some(bound()?),
                "due.after" => filter.due_after = Some(bound()?),
                "wait.before" => filter.wait_before = Some(bound()?),
                "wait.after" => filter.wait_after = Some(bound()?),
                _ => filter.words.push(token.to_owned()),
            }
            continue;
        }
        filter.words.extend(token.split_whitespace().map(str::to_owned));
    }
    Ok(filter)
}
