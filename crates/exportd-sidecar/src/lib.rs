//! Driver-facing sidecar for the exportd control plane.
//!
//! Watches NfsExportContent objects whose driver matches this process and
//! drives the storage driver over gRPC to create, probe and delete the
//! backing exports.

/// Generated protobuf types for the driver protocol.
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("exportd.v1");
}

pub mod controller;
pub mod exporter;
pub mod handler;
pub mod runner;

#[cfg(test)]
pub(crate) mod fake_driver;
