use std::error::Error as StdError;
use std::fmt;

/// Classifies a scrape-path error. `Config` errors are fatal at startup;
/// everything else is reported per scrape and retried on the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration: unresolved reference, reserved label, duplicate
    /// name, unknown driver scheme.
    Config,
    /// The database handle could not be opened; the target is DOWN this scrape.
    DriverOpen,
    /// The liveness ping failed; the target is DOWN this scrape.
    DriverPing,
    /// A query failed to prepare or execute; the collector is partial.
    Query,
    /// A result row could not be converted into a record; the row is dropped.
    Scan,
    /// The scrape deadline expired or the scrape was cancelled.
    Cancelled,
    /// Two metric families with the same name disagree on help text or kind.
    Merge,
}

/// An error raised somewhere on the scrape path, carrying the log context it
/// was raised in (`job=…, target=…, collector=…, metric=…, query=…`). The
/// context string grows as the error ascends.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: String,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>, message: impl fmt::Display) -> Self {
        Error {
            kind,
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// A deadline-expiry error, phrased the same everywhere.
    pub fn cancelled(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Cancelled, context, "scrape deadline exceeded")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.context, self.message)
        }
    }
}

impl StdError for Error {}

/// Appends a `key="value"` pair to a log context string.
pub fn push_context(context: &str, key: &str, value: &str) -> String {
    if context.is_empty() {
        format!("{}={:?}", key, value)
    } else {
        format!("{}, {}={:?}", context, key, value)
    }
}
