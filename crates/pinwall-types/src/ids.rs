//! Typed identifiers for boards, objects, users, and agent commands.
//!
//! Object, board, and user ids are opaque strings on the wire: they are
//! allocated by the document store or the identity provider and must round-trip
//! unchanged for interoperability with existing clients. Freshly minted ids are
//! UUIDv7 so they sort by creation time in logs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A board object identifier (document id in the durable store).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

/// A board identifier (collection key in both stores).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardId(String);

/// A user identifier (stable across sessions).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// An agent command identifier. Minted locally as a UUIDv7 by default, but any
/// string coming back from the store is accepted.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

// ── String-backed ids ───────────────────────────────────────────────────────

macro_rules! impl_string_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Wrap an existing id string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Allocate a fresh random id (UUIDv7 rendered without hyphens).
            pub fn generate() -> Self {
                Self(uuid::Uuid::now_v7().as_simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<&str> for $T {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $T {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $T {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.0)
            }
        }
    };
}

impl_string_id!(ObjectId, "ObjectId");
impl_string_id!(BoardId, "BoardId");
impl_string_id!(UserId, "UserId");

impl_string_id!(CommandId, "CommandId");

impl CommandId {
    /// First 8 characters, for human display only, not lookup.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}
