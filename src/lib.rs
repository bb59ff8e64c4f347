//! Cloud Drive Operator - Block-Volume Control Plane
//!
//! A cloud-storage control library managing the lifecycle of block-storage
//! volumes attached to compute instances across AWS EBS, Azure Managed
//! Disks, GCE Persistent Disks, Oracle Block Volumes and vSphere VMDKs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            REST API (POST /create)                           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Decision Matrix │  │  Distribution   │  │       Update Planner        │  │
//! │  │  (filter/sort)  │─▶│    Planner      │  │     (resize vs. add)        │  │
//! │  └─────────────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │                                │      IOPS models        │                   │
//! │                    ┌───────────┴─────────────────────────┴──────┐           │
//! │                    │       Storage Manager Registry             │           │
//! │                    └────────────────────────────────────────────┘           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                       Provider Ops Protocol (CloudOps)                       │
//! │        retry/backoff ── poll waiters ── device-path resolution               │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌──────────────────┐   │
//! │  │   EBS   │  │ Managed │  │   PD    │  │  Block  │  │      VMDK        │   │
//! │  │  (AWS)  │  │ (Azure) │  │  (GCE)  │  │(Oracle) │  │    (vSphere)     │   │
//! │  └─────────┘  └─────────┘  └─────────┘  └─────────┘  └──────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │              Metadata Store (KV binding / ConfigMap binding)                 │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`matrix`]: Storage decision matrix and YAML loader
//! - [`perf`]: Per-provider IOPS/throughput models
//! - [`planner`]: Distribution and update planners, manager registry
//! - [`ops`]: The uniform provider ops protocol and its plumbing
//! - [`providers`]: Per-provider adapters
//! - [`metastore`]: Locked key/value store bindings
//! - [`api`]: REST front-end
//! - [`error`]: Error types and handling

pub mod api;
pub mod error;
pub mod matrix;
pub mod metastore;
pub mod ops;
pub mod perf;
pub mod planner;
pub mod providers;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, ApiState};

pub use error::{Error, Result};

pub use matrix::{load_matrix, parse_matrix, StorageDecisionMatrix, StorageDecisionMatrixRow};

pub use perf::DrivePerformance;

pub use planner::{
    MaxDriveSizeRequest, ProviderKind, ResizeOperation, StorageDistributionRequest,
    StorageDistributionResponse, StorageManager, StorageManagerRegistry, StoragePoolSpec,
    StoragePoolUpdateRequest, StoragePoolUpdateResponse, StorageSpec,
};

pub use ops::{
    Attachment, AttachmentState, CloudOps, CloudOpsRef, InstanceGroupInfo, InstanceInfo, Labels,
    OpsConfig, Snapshot, Volume, VolumeState, VolumeTemplate,
};

pub use ops::retry::{OpName, RetryOps, RetryPolicy};

pub use metastore::{KvMetadataStore, LockHandle, MemoryKv, MetadataStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
