//! Status record data model shared by both processes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operational state of an instrument module.
///
/// The set is closed; the wire and the store use the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ModuleState {
    /// Powered and idle.
    #[default]
    Online,
    /// Executing a run.
    Run,
    /// Powered but not ready to run.
    NotReady,
    /// Not reachable.
    Offline,
}

impl ModuleState {
    /// All states, in declaration order.
    pub const ALL: [ModuleState; 4] = [Self::Online, Self::Run, Self::NotReady, Self::Offline];

    /// The textual form used on the wire and in the store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "Online",
            Self::Run => "Run",
            Self::NotReady => "NotReady",
            Self::Offline => "Offline",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no [`ModuleState`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown module state '{0}'")]
pub struct UnknownModuleState(pub String);

impl FromStr for ModuleState {
    type Err = UnknownModuleState;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownModuleState(s.to_string()))
    }
}

/// One module inside a [`StatusRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    /// Natural key of the module.
    pub module_id: String,
    /// Position of the module within its role.
    #[serde(default)]
    pub index_within_role: i32,
    /// Operational state after enrichment.
    #[serde(default)]
    pub state: ModuleState,
    /// Embedded status fragment from the snapshot; consumed by enrichment
    /// and never put on the wire.
    #[serde(skip)]
    pub status_fragment: Option<String>,
}

impl ModuleEntry {
    /// Create an entry with a known state and no fragment.
    #[must_use]
    pub fn new(module_id: impl Into<String>, state: ModuleState) -> Self {
        Self {
            module_id: module_id.into(),
            index_within_role: 0,
            state,
            status_fragment: None,
        }
    }
}

/// Normalized status of one instrument snapshot.
///
/// Produced fresh for every detected file and never mutated after it has
/// been published.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Opaque batch identifier from the snapshot.
    #[serde(default)]
    pub package_id: Option<String>,
    /// Module entries in document order.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl StatusRecord {
    /// Create a record.
    #[must_use]
    pub fn new(package_id: Option<String>, modules: Vec<ModuleEntry>) -> Self {
        Self {
            package_id,
            modules,
        }
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns the serde_json error if serialization fails.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns the serde_json error for malformed payloads.
    pub fn from_wire(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
