//! Content fingerprinting for change-triggered redeploys.
//!
//! A snapshot maps every watched file under a root to a SHA-256 digest of its
//! relative path, size and bytes. Two snapshots are compared wholesale with
//! [`diff`]; nothing is tracked incrementally between scans.

mod diff;
mod snapshot;

pub use diff::{diff, Diff};
pub use snapshot::{snapshot, FingerprintMap, ScanOptions};
