//! Provider Adapters
//!
//! One adapter per cloud implements the uniform [`crate::ops::CloudOps`]
//! protocol over an opaque SDK-client trait:
//! - AWS: EBS volumes
//! - Azure: Managed Disks
//! - GCE: Persistent Disks
//! - Oracle: Block Volumes
//! - vSphere: VMDKs
//!
//! SDK wire clients and credential discovery stay behind the per-provider
//! client traits; the adapters own the protocol semantics (validation,
//! polling, rollback, device slot selection, device-path resolution).

pub mod aws;
pub mod azure;
pub mod gce;
pub mod oracle;
pub mod vsphere;
