//! Error types for the image loader

use std::fmt;

/// Failure of a single fetch task.
///
/// These never reach the caller of [`Loader::request`](crate::Loader::request):
/// the task logs and counts them, and the waiters stay registered so the next
/// request for the key retries.
#[derive(Debug)]
pub enum FetchError {
    Io(Box<std::io::Error>),
    Http(Box<reqwest::Error>),
    Status(u16),
    Decode(String),
    NotFound,
    Cancelled,
    StoreClosed,
}

impl FetchError {
    /// Whether a later request for the same key may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Decode(_) | FetchError::Cancelled)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Io(err) => write!(f, "IO error: {}", err),
            FetchError::Http(err) => write!(f, "HTTP error: {}", err),
            FetchError::Status(status) => write!(f, "Remote returned status {}", status),
            FetchError::Decode(msg) => write!(f, "Decode error: {}", msg),
            FetchError::NotFound => write!(f, "Not found"),
            FetchError::Cancelled => write!(f, "Cancelled"),
            FetchError::StoreClosed => write!(f, "Disk store is closed"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Io(err) => Some(err.as_ref()),
            FetchError::Http(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(Box::new(err))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Failure of the awaitable [`Loader::load`](crate::Loader::load) surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    EmptyKey,
    Timeout,
    Cancelled,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::EmptyKey => write!(f, "Empty request key"),
            LoadError::Timeout => write!(f, "Timed out waiting for image"),
            LoadError::Cancelled => write!(f, "Request was cancelled"),
        }
    }
}

impl std::error::Error for LoadError {}
