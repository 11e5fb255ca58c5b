//! The cache database: nodes, trust-monotone inserts, negative entries.

use std::{collections::HashMap, sync::Arc};

use burrow_proto::{
    Message, Name, NameAttrs, Rdata, RdataType, Rdataset, RdatasetAttrs, Section, Trust,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::CacheError;

/// A shared handle onto a cache node.
///
/// Subscribers joined to one fetch all receive clones of the same node
/// handle when the answer is committed.
pub type NodeRef = Arc<CacheNode>;

/// What the cache holds for a (name, type) at a point in time.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    Positive(Rdataset),
    Negative(NegativeEntry),
}

/// Result of a positive insert.
#[derive(Debug)]
pub enum AddOutcome {
    /// The data was stored; the view of what is now cached is returned.
    Added(Rdataset),
    /// Equal-or-better data was already cached.
    Unchanged(CacheEntry),
}

/// Result of a negative insert.
#[derive(Debug)]
pub enum NcacheOutcome {
    Added,
    /// Equal-or-better data was already cached.
    Unchanged(CacheEntry),
}

/// A negative-cache entry: the fact of a NXDOMAIN or NXRRSET, with the SOA
/// that authorized it.
#[derive(Debug, Clone)]
pub struct NegativeEntry {
    /// `ANY` for NXDOMAIN, the query type for NXRRSET.
    pub covers: RdataType,
    pub soa_name: Option<Name>,
    pub soa: Option<Rdataset>,
    pub trust: Trust,
    expires_at: u64,
}

#[derive(Debug)]
struct StoredRdataset {
    rdataset: Rdataset,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct NodeInner {
    rdatasets: HashMap<(RdataType, Option<RdataType>), StoredRdataset>,
    negative: Option<NegativeEntry>,
}

/// One owner name's worth of cached data.
#[derive(Debug)]
pub struct CacheNode {
    name: Name,
    inner: Mutex<NodeInner>,
}

impl CacheNode {
    /// The owner name of this node.
    #[must_use]
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Looks up the entry for `rtype`, honoring expiry and any negative
    /// entry covering the type.
    #[must_use]
    pub fn get(&self, rtype: RdataType, now: u64) -> Option<CacheEntry> {
        let inner = self.inner.lock();
        if let Some(neg) = &inner.negative
            && neg.expires_at > now
            && (neg.covers == RdataType::Any || neg.covers == rtype)
        {
            return Some(CacheEntry::Negative(neg.clone()));
        }
        inner
            .rdatasets
            .get(&(rtype, None))
            .filter(|stored| stored.expires_at > now)
            .map(|stored| CacheEntry::Positive(stored.rdataset.clone()))
    }

    /// Inserts `rdataset`, keeping whichever of old and new carries more
    /// trust.
    pub fn add_rdataset(&self, now: u64, rdataset: &Rdataset) -> AddOutcome {
        let mut inner = self.inner.lock();

        let rtype = rdataset.effective_type();
        if let Some(neg) = &inner.negative {
            if neg.expires_at <= now {
                inner.negative = None;
            } else if (neg.covers == RdataType::Any || neg.covers == rtype)
                && neg.trust >= rdataset.trust
            {
                return AddOutcome::Unchanged(CacheEntry::Negative(neg.clone()));
            }
        }

        let key = (rdataset.rtype, rdataset.covers);
        if let Some(existing) = inner.rdatasets.get(&key)
            && existing.expires_at > now
            && existing.rdataset.trust >= rdataset.trust
        {
            return AddOutcome::Unchanged(CacheEntry::Positive(existing.rdataset.clone()));
        }

        // Better data displaces a weaker negative entry for the same type.
        if inner
            .negative
            .as_ref()
            .is_some_and(|neg| neg.covers == rtype && neg.trust < rdataset.trust)
        {
            inner.negative = None;
        }

        let mut stored = rdataset.clone();
        stored.attributes = RdatasetAttrs::default();
        trace!(name = %self.name, rtype = %stored.rtype, trust = ?stored.trust, "cache add");
        inner.rdatasets.insert(
            key,
            StoredRdataset {
                rdataset: stored.clone(),
                expires_at: now + u64::from(rdataset.ttl),
            },
        );
        AddOutcome::Added(stored)
    }

    fn add_negative(&self, now: u64, entry: NegativeEntry, qtype: RdataType) -> NcacheOutcome {
        let mut inner = self.inner.lock();

        if let Some(neg) = &inner.negative {
            if neg.expires_at <= now {
                inner.negative = None;
            } else if neg.trust >= entry.trust {
                return NcacheOutcome::Unchanged(CacheEntry::Negative(neg.clone()));
            }
        }

        if entry.covers != RdataType::Any
            && let Some(existing) = inner.rdatasets.get(&(qtype, None))
            && existing.expires_at > now
            && existing.rdataset.trust >= entry.trust
        {
            return NcacheOutcome::Unchanged(CacheEntry::Positive(existing.rdataset.clone()));
        }

        trace!(name = %self.name, covers = %entry.covers, "negative cache add");
        inner.negative = Some(entry);
        NcacheOutcome::Added
    }
}

/// The shared cache database.
#[derive(Debug, Default)]
pub struct CacheDb {
    nodes: DashMap<Name, NodeRef>,
}

impl CacheDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the node for `name`, creating it when asked to.
    #[must_use]
    pub fn find_node(&self, name: &Name, create: bool) -> Option<NodeRef> {
        if create {
            return Some(
                self.nodes
                    .entry(name.clone())
                    .or_insert_with(|| {
                        Arc::new(CacheNode {
                            name: name.clone(),
                            inner: Mutex::new(NodeInner::default()),
                        })
                    })
                    .clone(),
            );
        }
        self.nodes.get(name).map(|node| node.clone())
    }

    /// Convenience lookup of a (name, type) entry.
    #[must_use]
    pub fn get(&self, name: &Name, rtype: RdataType, now: u64) -> Option<CacheEntry> {
        self.find_node(name, false)?.get(rtype, now)
    }

    /// Builds and stores a negative entry for the response in `message`.
    ///
    /// The SOA marked for negative caching in the authority section
    /// supplies the TTL (capped by its MINIMUM field) and trust.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NoSoa`] when the message carries no
    /// negative-cache-marked SOA and the rcode alone cannot justify an
    /// entry.
    pub fn ncache_add(
        &self,
        message: &Message,
        node: &NodeRef,
        covers: RdataType,
        qtype: RdataType,
        now: u64,
    ) -> Result<NcacheOutcome, CacheError> {
        let mut soa_name = None;
        let mut soa = None;
        let mut trust = Trust::Additional;
        let mut ttl = 0u32;

        for entry in message.section(Section::Authority) {
            if !entry.attributes.contains(NameAttrs::NCACHE) {
                continue;
            }
            for rs in &entry.rdatasets {
                if !rs.attributes.contains(RdatasetAttrs::NCACHE) || rs.rtype != RdataType::Soa {
                    continue;
                }
                let minimum = rs
                    .rdatas
                    .iter()
                    .find_map(|rdata| match rdata {
                        Rdata::Soa { minimum, .. } => Some(*minimum),
                        _ => None,
                    })
                    .unwrap_or(0);
                ttl = rs.ttl.min(minimum);
                trust = rs.trust;
                soa_name = Some(entry.name.clone());
                soa = Some(rs.clone());
            }
        }

        if soa.is_none() {
            if message.rcode != burrow_proto::Rcode::NxDomain
                && !(message.answers.is_empty() && message.authority.is_empty())
            {
                return Err(CacheError::NoSoa(node.name().clone()));
            }
            // An empty NOERROR/NXDOMAIN without SOA is cacheable only
            // briefly.
            ttl = 0;
        }

        Ok(node.add_negative(
            now,
            NegativeEntry {
                covers,
                soa_name,
                soa,
                trust,
                expires_at: now + u64::from(ttl),
            },
            qtype,
        ))
    }
}
