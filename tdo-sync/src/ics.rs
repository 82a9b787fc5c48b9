//! Minimal iCalendar (RFC 5545) codec for single-VTODO documents.
//!
//! Only the properties the task model understands are interpreted. Every
//! other content line inside the VTODO is carried through verbatim in
//! [`RemoteTaskRecord::properties`], keyed by its head (name plus
//! parameters). Nested components such as `VALARM` are carried as whole
//! blocks under a `BEGIN:<NAME>` key.
//!
//! `DTSTAMP` and `LAST-MODIFIED` are owned by the codec: dropped on decode,
//! regenerated on encode.
//!
//! `DUE` and `DTSTART` are converted to UTC instants: `TZID=` through the
//! IANA database, floating times in the local zone, dates at midnight UTC.
//! The original line is kept alongside and written back while the instant
//! is unchanged, so a record that was only touched elsewhere keeps its zone.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use tdo_core::{Attachment, Priority, Status, TaskUid};

use crate::remote::{RemoteTaskRecord, SourceLine};

pub const PRODID: &str = "-//tdo//EN";

const FOLD_OCTETS: usize = 75;
const UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DecodeError(pub String);

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Render `record` as a VCALENDAR document with CRLF line endings.
pub fn encode(record: &RemoteTaskRecord, uid: &TaskUid, now: DateTime<Utc>) -> String {
    let mut lines = vec![
        "BEGIN:VCALENDAR".to_owned(),
        "VERSION:2.0".to_owned(),
        format!("PRODID:{PRODID}"),
        "BEGIN:VTODO".to_owned(),
        format!("UID:{}", escape(&uid.0)),
        format!("DTSTAMP:{}", now.format(UTC_FORMAT)),
        format!("LAST-MODIFIED:{}", now.format(UTC_FORMAT)),
        format!("SUMMARY:{}", escape(&record.summary)),
        format!("STATUS:{}", record.status.as_str()),
    ];
    if record.priority != Priority::None {
        lines.push(format!("PRIORITY:{}", record.priority.to_ical()));
    }
    if let Some(due) = record.due {
        lines.push(time_line("DUE", due, record.due_line.as_ref()));
    }
    if let Some(wait) = record.wait {
        lines.push(time_line("DTSTART", wait, record.wait_line.as_ref()));
    }
    if !record.categories.is_empty() {
        let joined = record
            .categories
            .iter()
            .map(|c| escape(c))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("CATEGORIES:{joined}"));
    }
    for attach in &record.attach {
        let mut head = "ATTACH".to_owned();
        if let Some(fmttype) = &attach.fmttype {
            head.push_str(";FMTTYPE=");
            head.push_str(fmttype);
        }
        for param in &attach.params {
            head.push(';');
            head.push_str(param);
        }
        lines.push(format!("{head}:{}", attach.uri));
    }
    for (key, value) in &record.properties {
        if key.starts_with("BEGIN:") {
            lines.extend(value.lines().map(str::to_owned));
        } else {
            lines.push(format!("{}:{value}", strip_dup_suffix(key)));
        }
    }
    lines.push("END:VTODO".to_owned());
    lines.push("END:VCALENDAR".to_owned());

    let mut out = String::new();
    for line in &lines {
        fold_into(&mut out, line);
    }
    out
}

fn time_line(name: &str, at: DateTime<Utc>, source: Option<&SourceLine>) -> String {
    match source {
        Some(line) if line.at == at => format!("{}:{}", line.head, line.value),
        _ => format!("{name}:{}", at.format(UTC_FORMAT)),
    }
}

/// Append `line` folded at 75 octets, never splitting a UTF-8 sequence.
fn fold_into(out: &mut String, line: &str) {
    let mut budget = FOLD_OCTETS;
    let mut used = 0;
    for ch in line.chars() {
        if used + ch.len_utf8() > budget {
            out.push_str("\r\n ");
            // Continuation lines spend one octet on the leading space.
            budget = FOLD_OCTETS - 1;
            used = 0;
        }
        out.push(ch);
        used += ch.len_utf8();
    }
    out.push_str("\r\n");
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// `X-FOO#2` → `X-FOO`. Only an all-digit suffix counts.
fn strip_dup_suffix(key: &str) -> &str {
    match key.rsplit_once('#') {
        Some((head, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => key,
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Parse the first VTODO of a VCALENDAR document. The etag is left unset.
pub fn decode(text: &str) -> Result<RemoteTaskRecord, DecodeError> {
    let lines = unfold(text);
    let mut iter = lines.iter().map(String::as_str);

    // Skip to the VTODO; calendar-level lines (VERSION, VTIMEZONE, ...) are not ours.
    loop {
        match iter.next() {
            Some(line) if line.eq_ignore_ascii_case("BEGIN:VTODO") => break,
            Some(_) => continue,
            None => return Err(DecodeError("no VTODO component".into())),
        }
    }

    let mut record = RemoteTaskRecord::default();
    let mut closed = false;
    while let Some(line) = iter.next() {
        if line.eq_ignore_ascii_case("END:VTODO") {
            closed = true;
            break;
        }
        let Some((head, value)) = split_content_line(line) else {
            if line.is_empty() {
                continue;
            }
            return Err(DecodeError(format!("malformed content line '{line}'")));
        };
        let name = head.split(';').next().unwrap_or(head).to_ascii_uppercase();

        if name == "BEGIN" {
            let component = value.to_ascii_uppercase();
            let mut block = vec![line.to_owned()];
            let mut depth = 1;
            for inner in iter.by_ref() {
                block.push(inner.to_owned());
                if inner.to_ascii_uppercase().starts_with("BEGIN:") {
                    depth += 1;
                } else if inner.to_ascii_uppercase().starts_with("END:") {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
            }
            if depth != 0 {
                return Err(DecodeError(format!("unterminated {component} component")));
            }
            insert_unique(&mut record, format!("BEGIN:{component}"), block.join("\n"));
            continue;
        }

        match name.as_str() {
            "UID" => record.uid = Some(TaskUid(unescape(value))),
            "SUMMARY" => record.summary = unescape(value),
            "STATUS" => match value.parse::<Status>() {
                Ok(status) => record.status = status,
                Err(_) => insert_unique(&mut record, head.to_owned(), value.to_owned()),
            },
            "PRIORITY" => match value.trim().parse::<u8>() {
                Ok(n) => record.priority = Priority::from_ical(n),
                Err(_) => insert_unique(&mut record, head.to_owned(), value.to_owned()),
            },
            "DUE" | "DTSTART" => match parse_time(head, value) {
                Some(at) => {
                    let source = SourceLine {
                        head: head.to_owned(),
                        value: value.to_owned(),
                        at,
                    };
                    if name == "DUE" {
                        record.due = Some(at);
                        record.due_line = Some(source);
                    } else {
                        record.wait = Some(at);
                        record.wait_line = Some(source);
                    }
                }
                None => insert_unique(&mut record, head.to_owned(), value.to_owned()),
            },
            "CATEGORIES" => {
                record.categories.extend(
                    split_unescaped(value, ',')
                        .into_iter()
                        .map(|c| unescape(c.trim()))
                        .filter(|c| !c.is_empty()),
                );
            }
            "ATTACH" => record.attach.push(Attachment {
                uri: value.to_owned(),
                fmttype: param(head, "FMTTYPE"),
                params: head
                    .split(';')
                    .skip(1)
                    .filter(|p| {
                        !p.split('=')
                            .next()
                            .is_some_and(|k| k.eq_ignore_ascii_case("FMTTYPE"))
                    })
                    .map(str::to_owned)
                    .collect(),
            }),
            "DTSTAMP" | "LAST-MODIFIED" => {}
            _ => insert_unique(&mut record, head.to_owned(), value.to_owned()),
        }
    }
    if !closed {
        return Err(DecodeError("unterminated VTODO component".into()));
    }
    Ok(record)
}

fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        match raw.strip_prefix([' ', '\t']) {
            Some(rest) if !lines.is_empty() => {
                if let Some(last) = lines.last_mut() {
                    last.push_str(rest);
                }
            }
            _ => lines.push(raw.to_owned()),
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Split at the first `:` outside a quoted parameter value.
fn split_content_line(line: &str) -> Option<(&str, &str)> {
    let mut quoted = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ':' if !quoted => return Some((&line[..i], &line[i + 1..])),
            _ => {}
        }
    }
    None
}

fn param(head: &str, wanted: &str) -> Option<String> {
    head.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=')?;
        k.eq_ignore_ascii_case(wanted)
            .then(|| v.trim_matches('"').to_owned())
    })
}

fn insert_unique(record: &mut RemoteTaskRecord, head: String, value: String) {
    let mut key = head.clone();
    let mut n = 2;
    while record.properties.contains_key(&key) {
        key = format!("{head}#{n}");
        n += 1;
    }
    record.properties.insert(key, value);
}

/// `…Z` is UTC, `TZID=` names an IANA zone, anything else is floating and
/// read in the local zone. `VALUE=DATE` values (or bare dates) are midnight
/// UTC. An unknown `TZID` is read as UTC; the source line keeps the zone.
fn parse_time(head: &str, value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let is_date = param(head, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE"));
    if is_date || value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    if let Some(utc) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S").ok()?;
        return Some(naive.and_utc());
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    match param(head, "TZID") {
        Some(name) => match name.trim_start_matches('/').parse::<Tz>() {
            Ok(tz) => in_zone(&tz, naive),
            Err(_) => {
                tracing::debug!("unknown TZID '{name}', reading {value} as UTC");
                Some(naive.and_utc())
            }
        },
        None => in_zone(&Local, naive),
    }
}

/// Earliest reading of a wall-clock time; a time skipped by a DST jump
/// counts from the offset before the jump.
fn in_zone<Z: TimeZone>(zone: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(&naive).earliest() {
        Some(at) => Some(at.with_timezone(&Utc)),
        None => {
            let offset = zone.offset_from_utc_datetime(&naive).fix();
            let shift = TimeDelta::try_seconds(i64::from(offset.local_minus_utc()))?;
            Some(naive.checked_sub_signed(shift)?.and_utc())
        }
    }
}

fn split_unescaped(value: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, ch) in value.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            parts.push(&value[start..i]);
            start = i + ch.len_utf8();
        }
    }
    parts.push(&value[start..]);
    parts
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
