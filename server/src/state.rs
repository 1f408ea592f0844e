//! Shared application state.

use unframe_proxy::{Proxy, ProxyConfig, ProxyError};

/// Read-only state shared by all requests.
#[derive(Debug)]
pub struct AppState {
    pub proxy: Proxy,
}

impl AppState {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            proxy: Proxy::new(config)?,
        })
    }
}
