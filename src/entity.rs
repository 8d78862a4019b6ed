//! Entity Keys and Raw Payloads
//!
//! The commit log tracks business entities as opaque byte payloads keyed by
//! hierarchical entity keys. An entity group is the unit of transactional
//! consistency in the backing store; every key names the group it belongs to.

use serde::{Deserialize, Serialize};

/// Identifier of a top-level entity group (e.g. a domain and its history).
///
/// All entities in a group share strong-consistency transactional guarantees;
/// the group id is also the input to bucket assignment, so it must be stable
/// for the lifetime of the group.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        GroupId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error constructing or parsing an entity key
#[derive(Debug, PartialEq, Eq)]
pub enum KeyError {
    /// A key component was empty
    EmptyComponent(&'static str),
    /// Group or kind contained the reserved separator
    ReservedSeparator(&'static str),
    /// A stringified key did not have group/kind/id form
    Malformed(String),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::EmptyComponent(part) => write!(f, "Empty key component: {}", part),
            KeyError::ReservedSeparator(part) => {
                write!(f, "Key component {} may not contain '/'", part)
            }
            KeyError::Malformed(s) => write!(f, "Malformed entity key: {:?}", s),
        }
    }
}

impl std::error::Error for KeyError {}

/// Key of a single business entity: the owning group, a kind, and an id.
///
/// The canonical stringified form `group/kind/id` is used as the mutation
/// record key. Group and kind may not contain `/`; the id may.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityKey {
    pub group: GroupId,
    pub kind: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(
        group: GroupId,
        kind: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let kind = kind.into();
        let id = id.into();
        if group.0.is_empty() {
            return Err(KeyError::EmptyComponent("group"));
        }
        if kind.is_empty() {
            return Err(KeyError::EmptyComponent("kind"));
        }
        if id.is_empty() {
            return Err(KeyError::EmptyComponent("id"));
        }
        if group.0.contains('/') {
            return Err(KeyError::ReservedSeparator("group"));
        }
        if kind.contains('/') {
            return Err(KeyError::ReservedSeparator("kind"));
        }
        Ok(EntityKey { group, kind, id })
    }

    /// Canonical stringified form: `group/kind/id`.
    pub fn encode(&self) -> String {
        format!("{}/{}/{}", self.group.0, self.kind, self.id)
    }

    /// Parse the canonical stringified form.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let mut parts = s.splitn(3, '/');
        let group = parts.next().filter(|p| !p.is_empty());
        let kind = parts.next().filter(|p| !p.is_empty());
        let id = parts.next().filter(|p| !p.is_empty());
        match (group, kind, id) {
            (Some(group), Some(kind), Some(id)) => Ok(EntityKey {
                group: GroupId::new(group),
                kind: kind.to_string(),
                id: id.to_string(),
            }),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// An entity snapshot in its raw protocol-level encoding.
///
/// The commit log never interprets the bytes. Restores re-save the payload
/// verbatim, so schema changes between write time and restore time do not
/// invalidate old diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntity {
    pub key: EntityKey,
    pub bytes: Vec<u8>,
}

impl RawEntity {
    pub fn new(key: EntityKey, bytes: Vec<u8>) -> Self {
        RawEntity { key, bytes }
    }
}
