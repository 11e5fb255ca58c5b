//! The view: cache, hints, zone cuts, and security roots.

use std::{net::IpAddr, sync::Arc};

use burrow_proto::{Name, Rclass, Rdata, RdataType, Rdataset, Trust};
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    CacheError,
    db::{CacheDb, CacheEntry},
};

/// A resolver's window onto cached data: the shared cache, the root hints,
/// and the set of names under which DNSSEC validation is required.
#[derive(Debug)]
pub struct View {
    rdclass: Rclass,
    cache: Arc<CacheDb>,
    hints: CacheDb,
    secroots: RwLock<Vec<Name>>,
}

impl View {
    #[must_use]
    pub fn new(rdclass: Rclass) -> Self {
        Self {
            rdclass,
            cache: Arc::new(CacheDb::new()),
            hints: CacheDb::new(),
            secroots: RwLock::new(Vec::new()),
        }
    }

    /// The record class this view resolves in.
    #[must_use]
    pub const fn rdclass(&self) -> Rclass {
        self.rdclass
    }

    /// The shared cache database.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheDb> {
        &self.cache
    }

    /// Installs a hint rdataset (root NS sets and their glue).
    ///
    /// Hints carry ultimate trust and do not expire.
    pub fn load_hint(&self, name: &Name, mut rdataset: Rdataset) {
        rdataset.trust = Trust::Ultimate;
        rdataset.ttl = u32::MAX;
        if let Some(node) = self.hints.find_node(name, true) {
            node.add_rdataset(0, &rdataset);
        }
    }

    /// Adds a security root; names at or below it require validation.
    pub fn add_secroot(&self, name: Name) {
        self.secroots.write().push(name);
    }

    /// Whether `name` falls under any security root.
    #[must_use]
    pub fn is_secure(&self, name: &Name) -> bool {
        self.secroots
            .read()
            .iter()
            .any(|root| name.is_subdomain(root))
    }

    /// Finds the deepest zone cut at or above `name`: the closest NS set we
    /// believe, from the cache first and the hints as a last resort.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NoZoneCut`] when neither cache nor hints hold
    /// a usable NS set.
    pub fn find_zonecut(&self, name: &Name, now: u64) -> Result<(Name, Rdataset), CacheError> {
        let mut cursor = Some(name.clone());
        while let Some(candidate) = cursor {
            if let Some(CacheEntry::Positive(rs)) = self.cache.get(&candidate, RdataType::Ns, now)
            {
                debug!(name = %name, cut = %candidate, "zone cut from cache");
                return Ok((candidate, rs));
            }
            cursor = candidate.parent();
        }

        let mut cursor = Some(name.clone());
        while let Some(candidate) = cursor {
            if let Some(CacheEntry::Positive(rs)) = self.hints.get(&candidate, RdataType::Ns, now)
            {
                debug!(name = %name, cut = %candidate, "zone cut from hints");
                return Ok((candidate, rs));
            }
            cursor = candidate.parent();
        }

        Err(CacheError::NoZoneCut(name.clone()))
    }

    /// The addresses known for `name`, cache entries first, hints as
    /// fallback glue.
    #[must_use]
    pub fn find_addresses(
        &self,
        name: &Name,
        now: u64,
        want_v4: bool,
        want_v6: bool,
    ) -> Vec<IpAddr> {
        let mut out = Vec::new();
        for db in [self.cache.as_ref(), &self.hints] {
            if want_v4 && let Some(CacheEntry::Positive(rs)) = db.get(name, RdataType::A, now) {
                out.extend(rs.rdatas.iter().filter_map(|rdata| match rdata {
                    Rdata::A(addr) => Some(IpAddr::V4(*addr)),
                    _ => None,
                }));
            }
            if want_v6 && let Some(CacheEntry::Positive(rs)) = db.get(name, RdataType::Aaaa, now) {
                out.extend(rs.rdatas.iter().filter_map(|rdata| match rdata {
                    Rdata::Aaaa(addr) => Some(IpAddr::V6(*addr)),
                    _ => None,
                }));
            }
            if !out.is_empty() {
                break;
            }
        }
        out
    }
}
