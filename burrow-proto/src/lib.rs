//! DNS data model and wire codec.
//!
//! This crate holds the types the rest of the workspace speaks in: domain
//! names, record types, rdata, rdatasets carrying a trust level, and the
//! message model with its classifier attribute bits. The wire codec covers
//! RFC 1035 framing with EDNS0 (RFC 2671) OPT handling; rendering never
//! uses compression, parsing accepts it.

pub mod message;
pub mod name;
pub mod rdata;
pub mod rdataset;
pub mod wire;

pub use message::{Flags, Message, MessageName, NameAttrs, Opcode, Question, Rcode, Section};
pub use name::{Name, NameError};
pub use rdata::{Rclass, Rdata, RdataType};
pub use rdataset::{Rdataset, RdatasetAttrs, Trust};
pub use wire::WireError;
