//! Entity and site identifiers.
//!
//! An [`EntityId`] names exactly one entity within one site. Sites are the
//! coarse-grained storage partitions that can be deleted as a unit.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a storage partition ("site").
///
/// # Examples
///
/// ```
/// use kyrocommit::SiteId;
///
/// let site = SiteId::new(7);
/// assert_eq!(site.get(), 7);
/// assert_eq!(site.to_string(), "7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(u32);

impl SiteId {
    /// Creates a site ID from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SiteId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Stable entity identifier.
///
/// Totally ordered by site first, then by the site-local number, so all
/// entities of a site are contiguous in ordered containers.
///
/// # Examples
///
/// ```
/// use kyrocommit::{EntityId, SiteId};
///
/// let id = EntityId::new(SiteId::new(1), 42);
/// assert_eq!(id.site(), SiteId::new(1));
/// assert_eq!(id.to_string(), "#1-42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    site: SiteId,
    local: u64,
}

impl EntityId {
    /// Creates an entity ID within the given site.
    #[must_use]
    pub const fn new(site: SiteId, local: u64) -> Self {
        Self { site, local }
    }

    /// Returns the site this entity lives in.
    #[must_use]
    pub const fn site(&self) -> SiteId {
        self.site
    }

    /// Returns the site-local entity number.
    #[must_use]
    pub const fn local(&self) -> u64 {
        self.local
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}-{}", self.site, self.local)
    }
}

/// Name of an entity field.
///
/// Scalar fields and ID-valued fields share one namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Field(String);

impl Field {
    /// Creates a field name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the field name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Field {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Name of a boolean entity flag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flag(String);

impl Flag {
    /// Creates a flag name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the flag name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Flag {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}
