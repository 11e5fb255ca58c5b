//! Domain names as normalized label sequences.
//!
//! Names are stored fully qualified, one boxed slice per label, with ASCII
//! letters folded to lowercase so that equality and hashing follow DNS
//! comparison rules. The root name has zero labels.

use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a single label, per RFC 1035.
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum wire length of a full name, per RFC 1035.
pub const MAX_NAME_LEN: usize = 255;

/// Errors produced while building or combining names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    /// A label exceeded 63 octets.
    #[error("label exceeds {MAX_LABEL_LEN} octets")]
    LabelTooLong,

    /// The assembled name exceeded 255 octets on the wire.
    #[error("name exceeds {MAX_NAME_LEN} octets")]
    NameTooLong,

    /// An empty label appeared somewhere other than the root position.
    #[error("empty non-terminal label")]
    EmptyLabel,

    /// The name being split is not a subdomain of the given suffix.
    #[error("name is not a subdomain of the suffix")]
    NotSubdomain,
}

/// A fully-qualified domain name.
///
/// Labels are kept in presentation order (leftmost label first) and are
/// case-folded at construction, so `Eq`/`Hash` give case-insensitive DNS
/// semantics. Cloning is cheap: the label storage is shared.
#[derive(Clone, Eq)]
pub struct Name {
    labels: Arc<[Box<[u8]>]>,
}

impl Name {
    /// The root name (zero labels).
    #[must_use]
    pub fn root() -> Self {
        Self {
            labels: Arc::from([]),
        }
    }

    /// Builds a name from raw labels, folding case and checking limits.
    ///
    /// # Errors
    ///
    /// Returns an error when a label is too long, empty, or the total wire
    /// length would exceed 255 octets.
    pub fn from_labels<I, L>(labels: I) -> Result<Self, NameError>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        let mut out: Vec<Box<[u8]>> = Vec::new();
        let mut wire_len = 1usize;
        for label in labels {
            let label = label.as_ref();
            if label.is_empty() {
                return Err(NameError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(NameError::LabelTooLong);
            }
            wire_len += label.len() + 1;
            if wire_len > MAX_NAME_LEN {
                return Err(NameError::NameTooLong);
            }
            out.push(label.iter().map(u8::to_ascii_lowercase).collect());
        }
        Ok(Self { labels: out.into() })
    }

    /// Number of labels; zero for the root.
    #[must_use]
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    /// Whether this is the root name.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// The labels, leftmost first.
    #[must_use]
    pub fn labels(&self) -> &[Box<[u8]>] {
        &self.labels
    }

    /// Wire length of the name, including the terminating root octet.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        1 + self
            .labels
            .iter()
            .map(|l| l.len() + 1)
            .sum::<usize>()
    }

    /// Whether `self` is equal to or a subdomain of `other`.
    ///
    /// Everything is a subdomain of the root.
    #[must_use]
    pub fn is_subdomain(&self, other: &Self) -> bool {
        if other.labels.len() > self.labels.len() {
            return false;
        }
        let skip = self.labels.len() - other.labels.len();
        self.labels[skip..] == other.labels[..]
    }

    /// The name with its leftmost label removed, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            labels: self.labels[1..].into(),
        })
    }

    /// The labels of `self` in front of the suffix `suffix`.
    ///
    /// # Errors
    ///
    /// Returns [`NameError::NotSubdomain`] when `self` is not at or below
    /// `suffix`.
    pub fn prefix_of(&self, suffix: &Self) -> Result<Vec<Box<[u8]>>, NameError> {
        if !self.is_subdomain(suffix) {
            return Err(NameError::NotSubdomain);
        }
        let keep = self.labels.len() - suffix.labels.len();
        Ok(self.labels[..keep].to_vec())
    }

    /// Concatenates a label prefix onto `suffix`, re-checking length limits.
    ///
    /// Used to synthesize DNAME targets: the query name's prefix relative
    /// to the DNAME owner, joined with the DNAME's target.
    ///
    /// # Errors
    ///
    /// Returns [`NameError::NameTooLong`] when the combined name does not
    /// fit in 255 octets.
    pub fn concatenate(prefix: &[Box<[u8]>], suffix: &Self) -> Result<Self, NameError> {
        Self::from_labels(prefix.iter().map(AsRef::as_ref).chain(
            suffix.labels.iter().map(AsRef::as_ref),
        ))
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
    }
}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in self.labels.iter() {
            label.hash(state);
        }
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Self::root());
        }
        Self::from_labels(s.split('.').map(str::as_bytes))
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, ".");
        }
        for label in self.labels.iter() {
            for &b in label.iter() {
                if b.is_ascii_graphic() && b != b'.' && b != b'\\' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{b:03}")?;
                }
            }
            write!(f, ".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl Serialize for Name {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
