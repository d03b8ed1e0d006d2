//! Common reconciler for the exportd control plane.
//!
//! Owns the user-facing NfsExport lifecycle: bidirectional binding to
//! NfsExportContent, finalizer-based deletion ordering, class defaulting,
//! source-PVC protection and status mirroring. The driver-facing side lives
//! in `exportd-sidecar`; the two communicate only through object fields and
//! annotations.

pub mod controller;
pub mod runner;
