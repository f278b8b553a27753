// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logging helpers: console level mapping and user-data redaction.
//!
//! When `log_redaction` is on, anything derived from user data (keys,
//! bucket names, usernames) is wrapped in `<ud>...</ud>` tags so that a
//! log post-processor can strip or hash it before the logs leave the
//! machine.

use std::fmt;

/// Console log level, as set by `console_log_level` / `LCB_LOGLEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Disabled.
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map the numeric console level (0 = off, higher = chattier).
    #[must_use]
    pub fn from_console_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    #[must_use]
    pub fn enables(self, other: LogLevel) -> bool {
        (self as u8) >= (other as u8)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(name)
    }
}

/// Wraps user data in redaction tags when enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Redactor {
    enabled: bool,
}

impl Redactor {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Render a user-supplied key for logging.
    #[must_use]
    pub fn key(&self, key: &[u8]) -> String {
        let printable = String::from_utf8_lossy(key);
        if self.enabled {
            format!("<ud>{printable}</ud>")
        } else {
            printable.into_owned()
        }
    }

    /// Render any user-data string for logging.
    #[must_use]
    pub fn user_data(&self, data: &str) -> String {
        if self.enabled {
            format!("<ud>{data}</ud>")
        } else {
            data.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_level_mapping() {
        assert_eq!(LogLevel::from_console_level(0), LogLevel::Off);
        assert_eq!(LogLevel::from_console_level(-3), LogLevel::Off);
        assert_eq!(LogLevel::from_console_level(2), LogLevel::Warn);
        assert_eq!(LogLevel::from_console_level(99), LogLevel::Trace);
    }

    #[test]
    fn test_enables_ordering() {
        assert!(LogLevel::Debug.enables(LogLevel::Error));
        assert!(!LogLevel::Error.enables(LogLevel::Debug));
        assert!(LogLevel::Warn.enables(LogLevel::Warn));
    }

    #[test]
    fn test_redaction_tags() {
        let on = Redactor::new(true);
        let off = Redactor::new(false);
        assert_eq!(on.key(b"secret-key"), "<ud>secret-key</ud>");
        assert_eq!(off.key(b"secret-key"), "secret-key");
        assert_eq!(on.user_data("bob"), "<ud>bob</ud>");
    }
}
