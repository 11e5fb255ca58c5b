//! Rdatasets and the trust lattice.

use crate::rdata::{Rdata, RdataType};

/// Provenance label on cached data.
///
/// The ordering is the cache-write lattice: an insert with equal-or-lower
/// trust than what is already cached leaves the cache unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trust {
    /// From the additional section of a response.
    Additional,
    /// Glue learned while following a referral.
    Glue,
    /// From the answer section of a non-authoritative response.
    Answer,
    /// From the authority section of an authoritative response.
    AuthAuthority,
    /// From the answer section of an authoritative response.
    AuthAnswer,
    /// Locally configured (hints, trust anchors).
    Ultimate,
}

/// Classifier attribute bits carried on a message rdataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdatasetAttrs(u8);

impl RdatasetAttrs {
    /// Marked for insertion into the cache.
    pub const CACHE: Self = Self(0x01);
    /// The rdataset answering the question.
    pub const ANSWER: Self = Self(0x02);
    /// A signature covering the answer.
    pub const ANSWERSIG: Self = Self(0x04);
    /// Outside the current query domain; only cacheable after validation.
    pub const EXTERNAL: Self = Self(0x08);
    /// A CNAME/DNAME link in the chain being followed.
    pub const CHAINING: Self = Self(0x10);
    /// Part of a negative answer, destined for the negative cache.
    pub const NCACHE: Self = Self(0x20);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// A set of records sharing owner name, type, class, and TTL.
///
/// The owner name lives one level up (on the message name or cache node);
/// an `Rdataset` is just the typed payload plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdataset {
    pub rtype: RdataType,
    /// For SIG rdatasets, the type the signatures cover.
    pub covers: Option<RdataType>,
    pub ttl: u32,
    pub rdatas: Vec<Rdata>,
    pub trust: Trust,
    pub attributes: RdatasetAttrs,
}

impl Rdataset {
    /// A new rdataset with the given type and TTL, no records yet.
    #[must_use]
    pub const fn new(rtype: RdataType, ttl: u32) -> Self {
        Self {
            rtype,
            covers: None,
            ttl,
            rdatas: Vec::new(),
            trust: Trust::Additional,
            attributes: RdatasetAttrs(0),
        }
    }

    /// The effective type for classification: SIG rdatasets classify as the
    /// type they cover.
    #[must_use]
    pub fn effective_type(&self) -> RdataType {
        if self.rtype == RdataType::Sig {
            self.covers.unwrap_or(RdataType::Sig)
        } else {
            self.rtype
        }
    }

    /// Names referenced by this rdataset whose addresses may appear as
    /// related data in the additional section.
    pub fn additional_names(&self) -> impl Iterator<Item = &crate::name::Name> {
        self.rdatas.iter().filter_map(Rdata::additional_name)
    }
}
