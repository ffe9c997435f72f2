//! Simple stdout backend for development

use crate::{Level, Log};
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

#[cfg(feature = "color")]
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Uid of [`StdoutLog`].
pub const STDOUT_LOG_UID: &str = "spool.stdout.StdoutLog";

/// Backend that prints each record to stdout.
#[derive(Clone)]
pub struct StdoutLog {
    min_level: Level,
    max_level: Level,
    /// Lock for stdout (to prevent interleaving)
    #[cfg(not(feature = "color"))]
    stdout: Arc<Mutex<std::io::Stdout>>,
    #[cfg(feature = "color")]
    stdout: Arc<Mutex<StandardStream>>,
}

impl StdoutLog {
    /// Creates a backend accepting every level.
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_level: Level::Verbose,
            max_level: Level::Fatal,
            #[cfg(not(feature = "color"))]
            stdout: Arc::new(Mutex::new(std::io::stdout())),
            #[cfg(feature = "color")]
            stdout: Arc::new(Mutex::new(StandardStream::stdout(ColorChoice::Auto))),
        }
    }

    /// Sets the lowest accepted level.
    #[must_use]
    pub const fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the highest accepted level.
    #[must_use]
    pub const fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }
}

impl std::fmt::Debug for StdoutLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdoutLog")
            .field("min_level", &self.min_level)
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}

impl Default for StdoutLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the body of a record: the message, the error and its causes.
pub(crate) fn render_body(msg: Option<&str>, err: Option<&(dyn StdError + 'static)>) -> String {
    let mut body = String::new();
    if let Some(msg) = msg {
        body.push_str(msg);
    }
    let mut cause = err;
    let mut first = true;
    while let Some(e) = cause {
        if !body.is_empty() {
            body.push('\n');
        }
        if first {
            let _ = write!(body, "{e}");
        } else {
            let _ = write!(body, "Caused by: {e}");
        }
        first = false;
        cause = e.source();
    }
    body
}

impl Log for StdoutLog {
    fn uid(&self) -> &str {
        STDOUT_LOG_UID
    }

    fn min_level(&self) -> Level {
        self.min_level
    }

    fn max_level(&self) -> Level {
        self.max_level
    }

    fn log(
        &self,
        level: Level,
        domain: Option<&str>,
        tag: &str,
        msg: Option<&str>,
        err: Option<&(dyn StdError + 'static)>,
    ) -> bool {
        let body = render_body(msg, err);
        let mut stdout = self.stdout.lock();

        #[cfg(feature = "color")]
        {
            let level_color = match level {
                Level::Fatal | Level::Error => Color::Red,
                Level::Warn => Color::Yellow,
                Level::Info => Color::Green,
                Level::Debug => Color::Blue,
                Level::Verbose => Color::Magenta,
            };

            let _ = stdout.set_color(ColorSpec::new().set_fg(Some(level_color)).set_bold(true));
            let _ = write!(stdout, "{}", level.initial());
            let _ = stdout.reset();

            let _ = stdout.set_color(ColorSpec::new().set_dimmed(true));
            match domain {
                Some(domain) => {
                    let _ = write!(stdout, " [{domain}]{tag}:");
                }
                None => {
                    let _ = write!(stdout, " {tag}:");
                }
            }
            let _ = stdout.reset();

            let _ = writeln!(stdout, " {body}");
        }

        #[cfg(not(feature = "color"))]
        {
            let mut line = String::with_capacity(body.len() + tag.len() + 8);
            line.push(level.initial());
            line.push(' ');
            if let Some(domain) = domain {
                let _ = write!(line, "[{domain}]");
            }
            let _ = writeln!(line, "{tag}: {body}");
            let _ = stdout.write_all(line.as_bytes());
        }

        stdout.flush().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("disk full")
        }
    }

    impl StdError for Inner {}

    #[derive(Debug)]
    struct Outer(Inner);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("write failed")
        }
    }

    impl StdError for Outer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_render_body() {
        let err = Outer(Inner);
        assert_eq!(
            render_body(Some("oops"), Some(&err)),
            "oops\nwrite failed\nCaused by: disk full"
        );
        assert_eq!(render_body(None, Some(&Inner)), "disk full");
    }

    #[test]
    fn test_level_bounds() {
        let log = StdoutLog::new()
            .with_min_level(Level::Info)
            .with_max_level(Level::Error);
        assert_eq!(log.min_level(), Level::Info);
        assert_eq!(log.max_level(), Level::Error);
        assert!(log.log(Level::Info, Some("my.app"), "Test", Some("hello"), None));
    }
}
