//! Error types for the image proxy

use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    Config(String),
    Io(Box<std::io::Error>),
    Cache(aimage::FetchError),
    Load(aimage::LoadError),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Cache(err) => write!(f, "Cache error: {}", err),
            ProxyError::Load(err) => write!(f, "Load error: {}", err),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Io(err) => Some(err.as_ref()),
            ProxyError::Cache(err) => Some(err),
            ProxyError::Load(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<aimage::FetchError> for ProxyError {
    fn from(err: aimage::FetchError) -> Self {
        ProxyError::Cache(err)
    }
}

impl From<aimage::LoadError> for ProxyError {
    fn from(err: aimage::LoadError) -> Self {
        ProxyError::Load(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
