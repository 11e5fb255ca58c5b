//! Record types, classes, and typed rdata.

use std::{
    fmt::{self, Display},
    net::{Ipv4Addr, Ipv6Addr},
};

use serde::{Deserialize, Serialize};

use crate::name::Name;

/// A DNS record type.
///
/// The variants cover what the fetch engine classifies specially; anything
/// else round-trips through [`RdataType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RdataType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Sig,
    Key,
    Aaaa,
    Nxt,
    Opt,
    Dname,
    Any,
    Other(u16),
}

impl RdataType {
    /// The wire value of this type.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Soa => 6,
            Self::Ptr => 12,
            Self::Mx => 15,
            Self::Txt => 16,
            Self::Sig => 24,
            Self::Key => 25,
            Self::Aaaa => 28,
            Self::Nxt => 30,
            Self::Opt => 41,
            Self::Dname => 39,
            Self::Any => 255,
            Self::Other(v) => v,
        }
    }

    /// Maps a wire value onto a type.
    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::A,
            2 => Self::Ns,
            5 => Self::Cname,
            6 => Self::Soa,
            12 => Self::Ptr,
            15 => Self::Mx,
            16 => Self::Txt,
            24 => Self::Sig,
            25 => Self::Key,
            28 => Self::Aaaa,
            30 => Self::Nxt,
            39 => Self::Dname,
            41 => Self::Opt,
            255 => Self::Any,
            v => Self::Other(v),
        }
    }
}

impl Display for RdataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Ns => write!(f, "NS"),
            Self::Cname => write!(f, "CNAME"),
            Self::Soa => write!(f, "SOA"),
            Self::Ptr => write!(f, "PTR"),
            Self::Mx => write!(f, "MX"),
            Self::Txt => write!(f, "TXT"),
            Self::Sig => write!(f, "SIG"),
            Self::Key => write!(f, "KEY"),
            Self::Aaaa => write!(f, "AAAA"),
            Self::Nxt => write!(f, "NXT"),
            Self::Opt => write!(f, "OPT"),
            Self::Dname => write!(f, "DNAME"),
            Self::Any => write!(f, "ANY"),
            Self::Other(v) => write!(f, "TYPE{v}"),
        }
    }
}

/// A DNS record class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rclass {
    In,
    Ch,
    Hs,
    Any,
    Other(u16),
}

impl Rclass {
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::In => 1,
            Self::Ch => 3,
            Self::Hs => 4,
            Self::Any => 255,
            Self::Other(v) => v,
        }
    }

    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::In,
            3 => Self::Ch,
            4 => Self::Hs,
            255 => Self::Any,
            v => Self::Other(v),
        }
    }
}

impl Default for Rclass {
    fn default() -> Self {
        Self::In
    }
}

/// Typed record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(Name),
    Cname(Name),
    Dname(Name),
    Ptr(Name),
    Mx {
        preference: u16,
        exchange: Name,
    },
    Soa {
        mname: Name,
        rname: Name,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    /// A SIG record, reduced to what the classifier needs: the covered
    /// type and the opaque remainder.
    Sig {
        covers: RdataType,
        data: Vec<u8>,
    },
    /// Uninterpreted rdata for any other type.
    Other(Vec<u8>),
}

impl Rdata {
    /// The name this rdata refers other resolutions to, if any.
    ///
    /// NS and MX targets are the names whose addresses the additional
    /// section may carry as glue.
    #[must_use]
    pub fn additional_name(&self) -> Option<&Name> {
        match self {
            Self::Ns(name) | Self::Mx { exchange: name, .. } => Some(name),
            _ => None,
        }
    }
}
