//! Crate-level error taxonomy for the MQTT fleet supervisor.
//!
//! Bootstrap code (`main.rs`, `config.rs`) uses `anyhow::Result` with
//! `.context(...)`, same as the teacher. Library code that callers need to
//! match on (ingest policy, health eviction) uses this enum instead, since
//! its variants map 1:1 onto the recovery policy table.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config missing: {0}")]
    ConfigMissing(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("unresolved reference: {0}")]
    ResolveMissing(String),

    #[error("persist failed: {0}")]
    PersistFailed(#[from] sqlx::Error),

    #[error("ownership lost for node {0}")]
    OwnershipLost(String),

    #[error("health check failed: {0}")]
    HealthFail(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
