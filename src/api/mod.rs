//! REST API
//!
//! Thin HTTP front-end over the planning layer: a `POST /create` endpoint
//! that turns a distribution request into a drive layout, a root health
//! endpoint, and Prometheus metrics. Binds to `0.0.0.0:8090` by default.

pub mod rest;

pub use rest::{router, ApiState, CreateStorageRequest, CreateStorageResponse};

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST bind address
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8090".parse().expect("static bind address"),
        }
    }
}

/// REST API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: Arc<ApiState>) -> Self {
        Self { config, state }
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> Result<()> {
        let app = router(self.state);
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| {
                Error::Configuration(format!("cannot bind {}: {e}", self.config.addr))
            })?;
        info!(addr = %self.config.addr, "REST API listening");
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("API server error: {e}")))?;
        Ok(())
    }
}
