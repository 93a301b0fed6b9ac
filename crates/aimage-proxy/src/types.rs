//! Core types for the image proxy

use aimage::{CacheStats, LoaderConfig};
use serde::Serialize;

/// Configuration for the image proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub loader: LoaderConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            loader: LoaderConfig::default(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}
