//! The message model: header, question, and per-name section entries.
//!
//! Responses are held in parsed form: every section is a list of owner
//! names, each carrying the rdatasets seen under it. The classifier works
//! on this representation, marking names and rdatasets with attribute bits
//! before the cache hand-off walks them.

use std::fmt::{self, Display};

use crate::{
    name::Name,
    rdata::{Rclass, RdataType},
    rdataset::Rdataset,
};

/// Message opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Query,
    IQuery,
    Status,
    Other(u8),
}

impl Opcode {
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Query => 0,
            Self::IQuery => 1,
            Self::Status => 2,
            Self::Other(v) => v,
        }
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Query,
            1 => Self::IQuery,
            2 => Self::Status,
            v => Self::Other(v),
        }
    }
}

/// Response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    YxDomain,
    Other(u8),
}

impl Rcode {
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::FormErr => 1,
            Self::ServFail => 2,
            Self::NxDomain => 3,
            Self::NotImp => 4,
            Self::Refused => 5,
            Self::YxDomain => 6,
            Self::Other(v) => v,
        }
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            4 => Self::NotImp,
            5 => Self::Refused,
            6 => Self::YxDomain,
            v => Self::Other(v),
        }
    }
}

impl Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "NOERROR"),
            Self::FormErr => write!(f, "FORMERR"),
            Self::ServFail => write!(f, "SERVFAIL"),
            Self::NxDomain => write!(f, "NXDOMAIN"),
            Self::NotImp => write!(f, "NOTIMP"),
            Self::Refused => write!(f, "REFUSED"),
            Self::YxDomain => write!(f, "YXDOMAIN"),
            Self::Other(v) => write!(f, "RCODE{v}"),
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// This is a response.
    pub qr: bool,
    /// Authoritative answer.
    pub aa: bool,
    /// Truncated.
    pub tc: bool,
    /// Recursion desired.
    pub rd: bool,
    /// Recursion available.
    pub ra: bool,
}

/// The question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub rtype: RdataType,
    pub rclass: Rclass,
}

/// Classifier attribute bits carried on a message owner name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameAttrs(u8);

impl NameAttrs {
    /// At least one rdataset under this name is marked for the cache.
    pub const CACHE: Self = Self(0x01);
    /// This name carries part of a negative answer.
    pub const NCACHE: Self = Self(0x02);
    /// This name owns the answer to the question.
    pub const ANSWER: Self = Self(0x04);

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

/// An owner name within a message section and the rdatasets under it.
#[derive(Debug, Clone)]
pub struct MessageName {
    pub name: Name,
    pub attributes: NameAttrs,
    pub rdatasets: Vec<Rdataset>,
}

impl MessageName {
    #[must_use]
    pub const fn new(name: Name) -> Self {
        Self {
            name,
            attributes: NameAttrs(0),
            rdatasets: Vec::new(),
        }
    }

    /// Finds the rdataset of the given type (and covered type, for SIGs).
    #[must_use]
    pub fn find_type(&self, rtype: RdataType, covers: Option<RdataType>) -> Option<&Rdataset> {
        self.rdatasets
            .iter()
            .find(|rs| rs.rtype == rtype && rs.covers == covers)
    }
}

/// A message section holding resource records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

impl Section {
    /// All record-bearing sections, in wire order.
    pub const ALL: [Self; 3] = [Self::Answer, Self::Authority, Self::Additional];
}

/// A parsed or to-be-rendered DNS message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: u16,
    pub flags: Flags,
    pub opcode: Opcode,
    pub rcode: Rcode,
    pub questions: Vec<Question>,
    pub answers: Vec<MessageName>,
    pub authority: Vec<MessageName>,
    pub additional: Vec<MessageName>,
    /// Advertised receive buffer size from an EDNS0 OPT record, when one
    /// was present.
    pub edns_udp_size: Option<u16>,
}

impl Default for Opcode {
    fn default() -> Self {
        Self::Query
    }
}

impl Default for Rcode {
    fn default() -> Self {
        Self::NoError
    }
}

impl Message {
    /// Builds a query message for a single question.
    #[must_use]
    pub fn query(id: u16, name: Name, rtype: RdataType, rclass: Rclass) -> Self {
        Self {
            id,
            questions: vec![Question {
                name,
                rtype,
                rclass,
            }],
            ..Self::default()
        }
    }

    /// The records in `section`.
    #[must_use]
    pub fn section(&self, section: Section) -> &[MessageName] {
        match section {
            Section::Answer => &self.answers,
            Section::Authority => &self.authority,
            Section::Additional => &self.additional,
        }
    }

    /// Mutable access to the records in `section`.
    pub fn section_mut(&mut self, section: Section) -> &mut Vec<MessageName> {
        match section {
            Section::Answer => &mut self.answers,
            Section::Authority => &mut self.authority,
            Section::Additional => &mut self.additional,
        }
    }

    /// Finds the entry for `name` in `section`.
    #[must_use]
    pub fn find_name(&self, section: Section, name: &Name) -> Option<usize> {
        self.section(section).iter().position(|mn| &mn.name == name)
    }

    /// Finds or creates the entry for `name` in `section`, returning its
    /// index.
    pub fn entry_for(&mut self, section: Section, name: &Name) -> usize {
        if let Some(idx) = self.find_name(section, name) {
            return idx;
        }
        let entries = self.section_mut(section);
        entries.push(MessageName::new(name.clone()));
        entries.len() - 1
    }
}
