//! Admission webhook for the exportd resources.
//!
//! Enforces the rules the CRD schema cannot: immutable source fields,
//! non-empty className, required exportRef identity, and one default class
//! per driver.

pub mod server;
