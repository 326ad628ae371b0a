//! Sentinel: certifies untrusted programs by running them in a
//! resource-limited chamber, scoring their behavior against a stability
//! envelope, and recording accepted units in an append-only ledger.
//!
//! - [`chamber`]: isolated execution with OS containment backends
//! - [`metrics`]: Violation Potential scoring
//! - [`sentinel`]: certification, monitoring and ejection
//! - [`ledger`]: versioned, pointer-selected identifier snapshots
//! - [`identity`]: content-derived unit identifiers
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chamber;
pub mod config;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod narrator;
pub mod sentinel;
pub mod unit;
