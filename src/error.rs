//! Error types for the Cloud Drive Operator
//!
//! Provides structured error types for all components: the distribution and
//! update planners, the provider ops protocol, the retry wrapper, and the
//! metadata store bindings.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Planner Errors
    // =========================================================================
    #[error("No candidate drive configuration satisfies the request")]
    NoCandidate,

    #[error("Number of zones cannot be zero")]
    NumOfZonesCannotBeZero,

    #[error("Current capacity ({current} GiB) is higher than desired capacity ({desired} GiB)")]
    CurrentCapacityHigherThanDesired { current: u64, desired: u64 },

    #[error("Current capacity is already at the desired {capacity} GiB")]
    CurrentCapacitySameAsDesired { capacity: u64 },

    #[error("Invalid storage update request: {reason}")]
    InvalidUpdateRequest { reason: String },

    #[error("Invalid max-drive-size request: {reason}")]
    InvalidMaxDriveSizeRequest { reason: String },

    #[error("No matrix row yields a max drive size for the requested drive type")]
    MaxDriveSizeCandidateNotFound,

    #[error("Drive type {drive_type} is not known to the {provider} performance model")]
    UnsupportedDriveType {
        provider: &'static str,
        drive_type: String,
    },

    // =========================================================================
    // Volume Protocol Errors
    // =========================================================================
    #[error("Volume not found: {volume_id}")]
    VolNotFound { volume_id: String },

    #[error("Invalid volume argument: {reason}")]
    VolInval { reason: String },

    #[error("Volume {volume_id} is not attached to any instance")]
    VolDetached { volume_id: String },

    #[error("Volume {volume_id} is attached on remote instance {instance_id}")]
    VolAttachedOnRemoteNode {
        volume_id: String,
        instance_id: String,
    },

    #[error("Device path unavailable or invalid: {path}")]
    InvalidDevicePath { path: String },

    #[error("Operation {operation} is not supported: {reason}")]
    NotSupported { operation: String, reason: String },

    #[error("Operation {operation} did not complete within {waited_secs}s")]
    OperationTimeout {
        operation: String,
        waited_secs: u64,
    },

    // =========================================================================
    // Provider SDK Errors
    // =========================================================================
    #[error("{provider} API error [{code}]: {message}")]
    Provider {
        provider: &'static str,
        code: String,
        status: Option<u16>,
        message: String,
        /// Structured detail payload, e.g. the disk name embedded in an
        /// Azure `AttachDiskWhileBeingDetached` service error.
        detail: Option<String>,
    },

    // =========================================================================
    // Metadata Store Errors
    // =========================================================================
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("Key already exists: {key}")]
    KeyExists { key: String },

    #[error("Lock on {key} not acquired within {waited_secs}s")]
    LockTimeout { key: String, waited_secs: u64 },

    #[error("Store leader changed: {0}")]
    StoreLeaderChanged(String),

    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Metadata service error: {0}")]
    MetadataService(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a provider SDK error with no structured detail.
    pub fn provider(
        provider: &'static str,
        code: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Error::Provider {
            provider,
            code: code.into(),
            status,
            message: message.into(),
            detail: None,
        }
    }

    /// Service-level error code reported by a provider SDK, if any.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Error::Provider { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// HTTP status reported by a provider SDK, if any.
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            Error::Provider { status, .. } => *status,
            _ => None,
        }
    }

    /// Structured detail payload of a provider SDK error, if any.
    pub fn provider_detail(&self) -> Option<&str> {
        match self {
            Error::Provider { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }

    /// Whether this error terminates a planner run (purely computational,
    /// never retried).
    pub fn is_planner(&self) -> bool {
        matches!(
            self,
            Error::NoCandidate
                | Error::NumOfZonesCannotBeZero
                | Error::CurrentCapacityHigherThanDesired { .. }
                | Error::CurrentCapacitySameAsDesired { .. }
                | Error::InvalidUpdateRequest { .. }
                | Error::InvalidMaxDriveSizeRequest { .. }
                | Error::MaxDriveSizeCandidateNotFound
                | Error::UnsupportedDriveType { .. }
        )
    }

    /// Whether callers should skip the operation rather than propagate.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
