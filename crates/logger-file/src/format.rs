//! Line formatting for records written to the log file
//!
//! Every non-empty line of the message and the error chain becomes one output
//! line with a fixed layout prefix:
//!
//! ```text
//! 10-19 14:03:07.412 I 0012345 0012399 [my.domain]Tag: message line
//! ```

use chrono::{DateTime, Local};
use spool_logger::Level;
use std::error::Error as StdError;
use std::fmt::Write;

/// Rendered in place of a timestamp when the clock is unavailable.
pub const TIME_UNKNOWN: &str = "00-00 00:00:00.000";

/// Rendered in place of a pid or tid that is unavailable.
pub const ID_UNKNOWN: &str = "unknown";

const TIME_FORMAT: &str = "%m-%d %H:%M:%S%.3f";
const ID_WIDTH: usize = 7;

/// Inputs of a single formatted record.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// When the record was created.
    pub time: Option<DateTime<Local>>,
    /// Process id; `None` or `0` renders as unknown.
    pub pid: Option<u32>,
    /// Thread id; `None` renders as unknown.
    pub tid: Option<u64>,
    /// Level of the record.
    pub level: Level,
    /// Optional domain.
    pub domain: Option<&'a str>,
    /// Tag.
    pub tag: &'a str,
    /// Optional message.
    pub msg: Option<&'a str>,
    /// Optional error; its `source()` chain is rendered after it.
    pub err: Option<&'a (dyn StdError + 'static)>,
}

/// Formats a record, or returns `None` if it has no non-empty lines.
#[must_use]
pub fn format(record: &Record<'_>) -> Option<String> {
    format_traced(record).map(|(formatted, _)| formatted)
}

/// Like [`format`], also returning the capacity computed before rendering.
/// The capacity always equals the rendered length.
#[must_use]
pub fn format_traced(record: &Record<'_>) -> Option<(String, usize)> {
    let chain = error_chain(record.err);

    let mut capacity = 0;
    let mut lines = 0;
    for line in body_lines(record.msg, &chain) {
        lines += 1;
        capacity += line.len() + 1;
    }
    if capacity == 0 {
        return None;
    }

    let (prefix, _) = format_prefix_traced(record);
    capacity += lines * prefix.len();

    let mut out = String::with_capacity(capacity);
    for line in body_lines(record.msg, &chain) {
        out.push_str(&prefix);
        out.push_str(line);
        out.push('\n');
    }
    Some((out, capacity))
}

/// Formats only the line prefix of a record.
#[must_use]
pub fn format_prefix(record: &Record<'_>) -> String {
    format_prefix_traced(record).0
}

/// Like [`format_prefix`], also returning the precomputed capacity.
#[must_use]
pub fn format_prefix_traced(record: &Record<'_>) -> (String, usize) {
    let time = record
        .time
        .map_or_else(|| TIME_UNKNOWN.to_string(), |t| t.format(TIME_FORMAT).to_string());
    let pid = record.pid.filter(|&pid| pid > 0).map(u64::from);

    let mut capacity = time.len();
    capacity += 1; // ' '
    capacity += 1; // level initial
    capacity += 1; // ' '
    capacity += id_width(pid);
    capacity += 1; // ' '
    capacity += id_width(record.tid);
    capacity += 1; // ' '
    if let Some(domain) = record.domain {
        capacity += domain.len() + 2; // '[' domain ']'
    }
    capacity += record.tag.len();
    capacity += 2; // ": "

    let mut prefix = String::with_capacity(capacity);
    prefix.push_str(&time);
    prefix.push(' ');
    prefix.push(record.level.initial());
    prefix.push(' ');
    push_id(&mut prefix, pid);
    prefix.push(' ');
    push_id(&mut prefix, record.tid);
    prefix.push(' ');
    if let Some(domain) = record.domain {
        prefix.push('[');
        prefix.push_str(domain);
        prefix.push(']');
    }
    prefix.push_str(record.tag);
    prefix.push_str(": ");

    (prefix, capacity)
}

fn id_width(id: Option<u64>) -> usize {
    id.map_or(ID_UNKNOWN.len(), |id| {
        let digits = id.checked_ilog10().map_or(1, |d| d as usize + 1);
        digits.max(ID_WIDTH)
    })
}

fn push_id(buf: &mut String, id: Option<u64>) {
    match id {
        Some(id) => {
            let _ = write!(buf, "{id:0width$}", width = ID_WIDTH);
        }
        None => buf.push_str(ID_UNKNOWN),
    }
}

fn error_chain(err: Option<&(dyn StdError + 'static)>) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = err;
    while let Some(e) = current {
        if chain.is_empty() {
            chain.push(e.to_string());
        } else {
            chain.push(format!("Caused by: {e}"));
        }
        current = e.source();
    }
    chain
}

fn body_lines<'a>(msg: Option<&'a str>, chain: &'a [String]) -> impl Iterator<Item = &'a str> {
    msg.into_iter()
        .chain(chain.iter().map(String::as_str))
        .flat_map(|text| text.split(['\n', '\r']))
        .filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::fmt;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap() + chrono::Duration::milliseconds(42)
    }

    fn record<'a>(msg: Option<&'a str>, err: Option<&'a (dyn StdError + 'static)>) -> Record<'a> {
        Record {
            time: Some(fixed_time()),
            pid: Some(1234),
            tid: Some(56),
            level: Level::Info,
            domain: Some("my.app"),
            tag: "Main",
            msg,
            err,
        }
    }

    #[derive(Debug)]
    struct Cause;

    impl fmt::Display for Cause {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("permission denied")
        }
    }

    impl StdError for Cause {}

    #[derive(Debug)]
    struct Failure(Cause);

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("open failed\nat /var/log")
        }
    }

    impl StdError for Failure {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_layout() {
        let formatted = format(&record(Some("hello"), None)).unwrap();
        assert_eq!(
            formatted,
            "03-09 07:05:02.042 I 0001234 0000056 [my.app]Main: hello\n"
        );
    }

    #[test]
    fn test_unknown_ids_and_no_domain() {
        let mut r = record(Some("hello"), None);
        r.pid = Some(0);
        r.tid = None;
        r.domain = None;
        r.time = None;
        assert_eq!(
            format(&r).unwrap(),
            "00-00 00:00:00.000 I unknown unknown Main: hello\n"
        );
    }

    #[test]
    fn test_wide_ids_not_truncated() {
        let mut r = record(Some("x"), None);
        r.tid = Some(123_456_789);
        let (formatted, capacity) = format_traced(&r).unwrap();
        assert!(formatted.contains(" 123456789 "));
        assert_eq!(capacity, formatted.len());
    }

    #[test]
    fn test_multiline_and_error_chain() {
        let err = Failure(Cause);
        let formatted = format(&record(Some("line one\n\nline two\r\n"), Some(&err))).unwrap();
        let prefix = format_prefix(&record(None, None));
        let lines: Vec<&str> = formatted.lines().collect();
        assert_eq!(
            lines,
            vec![
                format!("{prefix}line one"),
                format!("{prefix}line two"),
                format!("{prefix}open failed"),
                format!("{prefix}at /var/log"),
                format!("{prefix}Caused by: permission denied"),
            ]
        );
    }

    #[test]
    fn test_blank_is_none() {
        assert!(format(&record(None, None)).is_none());
        assert!(format(&record(Some(""), None)).is_none());
        assert!(format(&record(Some("\n\r\n"), None)).is_none());
    }

    proptest! {
        #[test]
        fn prop_capacity_exact(
            msg in proptest::option::of(".{0,200}"),
            domain in proptest::option::of("[a-z.:-]{3,32}"),
            tag in "\\PC{1,128}",
            pid in proptest::option::of(any::<u32>()),
            tid in proptest::option::of(any::<u64>()),
            level in 0usize..6,
            with_time in any::<bool>(),
        ) {
            let r = Record {
                time: with_time.then(fixed_time),
                pid,
                tid,
                level: Level::ALL[level],
                domain: domain.as_deref(),
                tag: &tag,
                msg: msg.as_deref(),
                err: None,
            };

            let (prefix, prefix_capacity) = format_prefix_traced(&r);
            prop_assert_eq!(prefix_capacity, prefix.len());

            if let Some((formatted, capacity)) = format_traced(&r) {
                prop_assert_eq!(capacity, formatted.len());
                prop_assert!(formatted.ends_with('\n'));
            } else {
                prop_assert!(msg.unwrap_or_default().trim_matches(['\n', '\r']).is_empty());
            }
        }
    }
}
