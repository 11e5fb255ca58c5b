//! The fetch engine of an iterative, caching DNS resolver.
//!
//! A [`Resolver`] owns a set of hash-sharded buckets, each with its own
//! worker task. A fetch hashes its question name to a bucket, joins an
//! existing fetch context for the same question or creates one, and drives
//! the iterative query process from there: nameserver address lookup
//! through the address database, query issuance through the shared
//! dispatchers, response classification, delegation and CNAME/DNAME chain
//! following, and finally a cache commit and one completion event per
//! subscriber.
//!
//! The engine is a library; it opens sockets but ships no binary and
//! persists nothing.

mod cache;
mod events;
mod fctx;
mod fetch;
mod query;
mod resolver;
mod response;
mod timer;

pub use fetch::{Fetch, FetchDone};
pub use resolver::Resolver;

use serde::Deserialize;
use thiserror::Error;

/// Options modifying how a fetch runs. Part of the fetch identity: two
/// fetches share a context only when their options match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FetchOpts(u32);

impl FetchOpts {
    /// Query over TCP instead of UDP.
    pub const TCP: Self = Self(0x01);
    /// Never share a fetch context with another caller.
    pub const UNSHARED: Self = Self(0x02);
    /// Set RD on queries, asking servers to recurse for us.
    pub const RECURSIVE: Self = Self(0x04);
    /// Do not advertise EDNS0.
    pub const NOEDNS0: Self = Self(0x08);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// The result a subscriber's completion event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A positive answer was found and cached.
    Success,
    /// Retries exhausted, the loop guard tripped, or no nameserver could
    /// be resolved.
    ServFail,
    /// The fetch lifetime deadline passed.
    TimedOut,
    /// The subscriber (or the resolver) canceled the fetch.
    Canceled,
    /// The chain ended at a CNAME the subscriber must follow.
    Cname,
    /// The chain ended at a DNAME the subscriber must follow.
    Dname,
    /// An authoritative "name does not exist", now negatively cached.
    NcacheNxDomain,
    /// An authoritative "no data of this type", now negatively cached.
    NcacheNxRrset,
    /// Peer misbehavior outlasted every retry option.
    FormErr,
}

/// Forwarding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardPolicy {
    /// Never forward.
    #[default]
    None,
    /// Try forwarders first, then iterate normally.
    First,
    /// Only use forwarders.
    Only,
}

/// Errors surfaced by resolver construction and fetch creation.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The resolver must be frozen before fetches are created.
    #[error("resolver is not frozen")]
    NotFrozen,

    /// Mutating configuration after freeze.
    #[error("resolver is frozen")]
    Frozen,

    /// The resolver (or the target bucket) is shutting down.
    #[error("resolver is shutting down")]
    ShuttingDown,

    /// No zone cut could be found to start iteration from.
    #[error(transparent)]
    Cache(#[from] burrow_cache::CacheError),

    /// Socket or dispatcher failure.
    #[error(transparent)]
    Dispatch(#[from] burrow_dispatch::DispatchError),
}

const fn default_buckets() -> usize {
    8
}

const fn default_udp_port_start() -> u16 {
    5353
}

const fn default_udp_port_end() -> u16 {
    5400
}

const fn default_server_port() -> u16 {
    53
}

const fn default_lifetime_secs() -> u64 {
    90
}

const fn default_lame_ttl_secs() -> u64 {
    600
}

const fn default_edns_udp_size() -> u16 {
    2048
}

/// Resolver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Number of buckets (and worker tasks) fetch contexts shard over.
    #[serde(default = "default_buckets")]
    pub buckets: usize,

    /// First port tried when binding the shared IPv4 UDP socket.
    #[serde(default = "default_udp_port_start")]
    pub udp_port_start: u16,

    /// One past the last port tried for the IPv4 UDP socket.
    #[serde(default = "default_udp_port_end")]
    pub udp_port_end: u16,

    /// Port queried on resolved nameserver addresses.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Total lifetime of a fetch before it fails with `TimedOut`.
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,

    /// How long a misbehaving server stays marked lame for a zone.
    #[serde(default = "default_lame_ttl_secs")]
    pub lame_ttl_secs: u64,

    /// Receive buffer size advertised through EDNS0.
    #[serde(default = "default_edns_udp_size")]
    pub edns_udp_size: u16,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            buckets: default_buckets(),
            udp_port_start: default_udp_port_start(),
            udp_port_end: default_udp_port_end(),
            server_port: default_server_port(),
            lifetime_secs: default_lifetime_secs(),
            lame_ttl_secs: default_lame_ttl_secs(),
            edns_udp_size: default_edns_udp_size(),
        }
    }
}

/// Queries render into a fixed-size buffer; the first two bytes are
/// reserved for the length prefix when the transport is TCP.
pub(crate) const SEND_BUFFER_SIZE: usize = 512;

/// A fetch restarts (reissues `fctx_getaddresses`) at most this many
/// times before failing with `ServFail`.
pub(crate) const MAX_RESTARTS: u32 = 10;

/// Ceiling on the no-response RTT penalty, in microseconds.
pub(crate) const MAX_NO_RESPONSE_RTT_US: u32 = 10_000_000;
