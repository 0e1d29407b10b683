//! Core data model.
//!
//! A work unit has identity (the entity it affects) and a priority. A unit
//! of work moves through a one-shot lifecycle: idle, active, completed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity of a work unit: the entity it represents (e.g. `"order/42"`).
///
/// Two work units with the same key are the same pending change; the later
/// registration replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkKey(String);

impl WorkKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for WorkKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for WorkKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Ordering key of a work unit. Lower runs earlier.
pub type Priority = i32;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Short display: first 8 chars of UUID
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Identifies one unit of work instance in logs and spans.
    UowId
);
uuid_id!(
    /// Identifies an open transaction handle.
    TxId
);
uuid_id!(
    /// Identifies a store instance, so a store can recognise its own handles.
    StoreId
);

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, not yet started.
    Idle,
    /// Collecting work units.
    Active,
    /// Committed or aborted. Terminal.
    Completed,
}

impl Phase {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!((self, to), (Idle, Active) | (Active, Completed))
    }

    /// Is this a terminal phase?
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Active => "active",
            Phase::Completed => "completed",
        };
        write!(f, "{s}")
    }
}
