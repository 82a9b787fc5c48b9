//! Token grammar for `add` and `modify`.
//!
//! Tokens may appear in any order. Free words become the summary; `+tag`,
//! `-tag` and `key:value` tokens become typed [`FieldEdit`]s. Later tokens
//! for the same field win; tag operations accumulate in order.

use chrono::{DateTime, FixedOffset, Utc};

use tdo_core::request::{EditRequest, FieldEdit, MutationRequest, Selector};
use tdo_core::types::{Priority, ReservedProperty, Status, TaskFields, TaskIndex};

use crate::error::ParseError;
use crate::time::resolve_instant;

/// Which command the tokens belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Add,
    Modify,
}

/// Parse `add` / `modify` tokens into a [`MutationRequest`].
///
/// In [`Mode::Modify`], leading index-list tokens (`1,2`, `3-5`) select the
/// tasks; without them the visible list is the target.
pub fn parse<S: AsRef<str>>(
    tokens: &[S],
    mode: Mode,
    now: DateTime<FixedOffset>,
) -> Result<MutationRequest, ParseError> {
    let mut rest = tokens;
    let mut indices = Vec::new();
    if mode == Mode::Modify {
        while let Some((first, tail)) = rest.split_first() {
            match parse_index_list(first.as_ref()) {
                Some(list) => {
                    indices.extend(list);
                    rest = tail;
                }
                None => break,
            }
        }
    }

    let mut parsed = Parsed::default();
    for token in rest {
        parsed.token(token.as_ref(), mode, now)?;
    }
    let summary = parsed.summary.take().or_else(|| {
        (!parsed.words.is_empty()).then(|| parsed.words.join(" "))
    });

    match mode {
        Mode::Add => {
            let summary = summary.unwrap_or_default();
            if summary.is_empty() {
                return Err(ParseError::EmptySummary);
            }
            Ok(MutationRequest::Create(
                parsed.edits.apply_to(&TaskFields::with_summary(summary)),
            ))
        }
        Mode::Modify => {
            let mut edits = EditRequest::new();
            if let Some(summary) = summary {
                edits.push(FieldEdit::Summary(summary));
            }
            for edit in parsed.edits.iter() {
                edits.push(edit.clone());
            }
            if edits.is_empty() {
                return Err(ParseError::NoEdits);
            }
            let selector = if indices.is_empty() {
                Selector::Visible
            } else {
                Selector::Indices(indices)
            };
            Ok(MutationRequest::Edit { selector, edits })
        }
    }
}

/// `do` / `start` / `stop`: a status edit over a selector.
pub fn status_change<S: AsRef<str>>(
    tokens: &[S],
    status: Status,
    now: DateTime<FixedOffset>,
) -> Result<MutationRequest, ParseError> {
    Ok(MutationRequest::Edit {
        selector: crate::selector::parse_selector(tokens, now)?,
        edits: [FieldEdit::Status(status)].into_iter().collect(),
    })
}

/// `del`: a deletion over a selector.
pub fn delete<S: AsRef<str>>(
    tokens: &[S],
    now: DateTime<FixedOffset>,
) -> Result<MutationRequest, ParseError> {
    crate::selector::parse_selector(tokens, now).map(MutationRequest::Delete)
}

/// `1`, `1,2`, `3-5`, `1,4-6`. `None` unless the whole token is an index list.
pub fn parse_index_list(token: &str) -> Option<Vec<TaskIndex>> {
    let mut out = Vec::new();
    for part in token.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.parse().ok()?;
                let hi: u32 = hi.parse().ok()?;
                if lo == 0 || lo > hi {
                    return None;
                }
                out.extend((lo..=hi).map(TaskIndex));
            }
            None => {
                let n: u32 = part.parse().ok()?;
                if n == 0 {
                    return None;
                }
                out.push(TaskIndex(n));
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

// ---------------------------------------------------------------------------
// Token classification
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Parsed {
    edits: EditRequest,
    words: Vec<String>,
    /// `summary:` override; beats free words regardless of position.
    summary: Option<String>,
}

impl Parsed {
    fn token(&mut self, token: &str, mode: Mode, now: DateTime<FixedOffset>) -> Result<(), ParseError> {
        if let Some(tag) = token.strip_prefix('+').filter(|t| is_tag(t)) {
            self.edits.push(FieldEdit::AddTag(tag.to_owned()));
            return Ok(());
        }
        if mode == Mode::Modify {
            if let Some(tag) = token.strip_prefix('-').filter(|t| is_tag(t)) {
                self.edits.push(FieldEdit::RemoveTag(tag.to_owned()));
                return Ok(());
            }
        }
        if let Some((key, value)) = token.split_once(':') {
            if self.key_value(token, key, value, now)? {
                return Ok(());
            }
        }
        self.words.extend(token.split_whitespace().map(str::to_owned));
        Ok(())
    }

    /// Returns `false` for an unrecognised key, which makes the token a word.
    fn key_value(
        &mut self,
        token: &str,
        key: &str,
        value: &str,
        now: DateTime<FixedOffset>,
    ) -> Result<bool, ParseError> {
        let value = value.trim();
        match key.to_ascii_lowercase().as_str() {
            "summary" | "description" => self.set_summary(value)?,
            "project" | "proj" => self
                .edits
                .push(FieldEdit::Project((!value.is_empty()).then(|| value.to_owned()))),
            "pri" | "priority" => self.edits.push(FieldEdit::Priority(priority(token, value)?)),
            "status" => self.edits.push(FieldEdit::Status(status(token, value)?)),
            "due" => self.edits.push(FieldEdit::Due(instant(token, value, now)?)),
            "wait" => self.edits.push(FieldEdit::Wait(instant(token, value, now)?)),
            "x" => self.property(token, value, now)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn set_summary(&mut self, value: &str) -> Result<(), ParseError> {
        let summary = value.split_whitespace().collect::<Vec<_>>().join(" ");
        if summary.is_empty() {
            return Err(ParseError::EmptySummary);
        }
        self.summary = Some(summary);
        Ok(())
    }

    /// `x:NAME:value`. Reserved names route to their typed field.
    fn property(&mut self, token: &str, rest: &str, now: DateTime<FixedOffset>) -> Result<(), ParseError> {
        let Some((name, value)) = rest.split_once(':') else {
            return Err(ParseError::MalformedProperty(token.to_owned()));
        };
        let name = name.trim().to_ascii_uppercase();
        if name.is_empty() {
            return Err(ParseError::MalformedProperty(token.to_owned()));
        }
        let value = value.trim();
        match ReservedProperty::from_name(&name) {
            Some(ReservedProperty::Summary) => self.set_summary(value)?,
            Some(ReservedProperty::Status) => self.edits.push(FieldEdit::Status(status(token, value)?)),
            Some(ReservedProperty::Priority) => {
                let p = match value.parse::<u8>() {
                    Ok(n) => Priority::from_ical(n),
                    Err(_) => priority(token, value)?,
                };
                self.edits.push(FieldEdit::Priority(p));
            }
            Some(ReservedProperty::Due) => self.edits.push(FieldEdit::Due(instant(token, value, now)?)),
            Some(ReservedProperty::Wait) => self.edits.push(FieldEdit::Wait(instant(token, value, now)?)),
            Some(ReservedProperty::Project) => self
                .edits
                .push(FieldEdit::Project((!value.is_empty()).then(|| value.to_owned()))),
            Some(
                reserved @ (ReservedProperty::Uid
                | ReservedProperty::Categories
                | ReservedProperty::Attach),
            ) => {
                return Err(ParseError::ReservedProperty {
                    token: token.to_owned(),
                    name: reserved.name().to_owned(),
                });
            }
            None if value.is_empty() => self.edits.push(FieldEdit::UnsetProperty(name)),
            None => self.edits.push(FieldEdit::SetProperty {
                name,
                value: value.to_owned(),
            }),
        }
        Ok(())
    }
}

fn is_tag(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}

pub(crate) fn priority(token: &str, value: &str) -> Result<Priority, ParseError> {
    value.parse().map_err(|message| ParseError::InvalidValue {
        token: token.to_owned(),
        message,
    })
}

pub(crate) fn status(token: &str, value: &str) -> Result<Status, ParseError> {
    value.parse().map_err(|message| ParseError::InvalidValue {
        token: token.to_owned(),
        message,
    })
}

/// Empty value unsets.
fn instant(
    token: &str,
    value: &str,
    now: DateTime<FixedOffset>,
) -> Result<Option<DateTime<Utc>>, ParseError> {
    if value.is_empty() {
        return Ok(None);
    }
    resolve_instant(value, now)
        .map(Some)
        .map_err(|source| ParseError::Time {
            token: token.to_owned(),
            source,
        })
}
