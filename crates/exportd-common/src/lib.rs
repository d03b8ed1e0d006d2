//! Shared types and utilities for the exportd control plane.
//!
//! exportd drives an external storage driver (over gRPC) to make reality
//! match user-declared NfsExport objects, maintaining a bidirectional binding
//! between the namespaced request and the cluster-scoped NfsExportContent.
//! This crate holds everything both reconcilers and the webhook share: the
//! CRD types, well-known keys, the error taxonomy, the event publisher, the
//! work queue and versioned store, patch builders, secret-template
//! resolution, admission rules, and the cluster API seam with its in-memory
//! test double.

#![warn(missing_docs)]

pub mod api;
pub mod crd;
pub mod error;
pub mod events;
pub mod keys;
pub mod leader_election;
pub mod patch;
pub mod queue;
pub mod secret;
pub mod store;
pub mod telemetry;
pub mod testing;
pub mod validation;

pub use error::Error;

/// Namespace the controllers' leases and webhook live in by default.
pub const EXPORTD_SYSTEM_NAMESPACE: &str = "exportd-system";
