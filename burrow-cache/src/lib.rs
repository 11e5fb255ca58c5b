//! Cache database and view.
//!
//! The cache is a concurrent map from owner name to node; each node holds
//! positive rdatasets keyed by type plus at most one negative entry. Writes
//! are trust-monotone: an insert at equal-or-lower trust than what is
//! already cached returns `Unchanged`. The [`View`] layers zone-cut lookup,
//! root hints, and the security-root set on top.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod db;
pub mod view;

pub use db::{AddOutcome, CacheDb, CacheEntry, CacheNode, NcacheOutcome, NegativeEntry, NodeRef};
pub use view::View;

use burrow_proto::Name;
use thiserror::Error;

/// Cache-layer errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No NS set exists in the cache or hints at or above the name.
    #[error("no zone cut found at or above {0}")]
    NoZoneCut(Name),

    /// A negative answer carried no usable SOA.
    #[error("negative response for {0} carries no SOA")]
    NoSoa(Name),
}

/// Seconds since the Unix epoch.
///
/// The cache tracks expiry in wall-clock seconds, matching record TTLs.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
