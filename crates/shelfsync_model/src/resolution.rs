//! Conflict resolutions and policies.

use crate::conflict::{ConflictType, SyncConflict};
use crate::error::{ModelError, ModelResult};
use std::fmt;
use std::str::FromStr;

/// Outcome chosen for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local version wins and is pushed.
    KeepLocal,
    /// Remote version wins and is applied locally.
    KeepRemote,
    /// Leave both sides untouched for now.
    Skip,
}

impl Resolution {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::KeepLocal => "keep_local",
            Resolution::KeepRemote => "keep_remote",
            Resolution::Skip => "skip",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides how a conflict is resolved.
///
/// The engine never prompts; interactive resolution is a policy supplied by
/// the caller. Closures of type `Fn(&SyncConflict) -> Resolution` implement
/// this trait.
pub trait ResolutionPolicy {
    /// Chooses a resolution for `conflict`.
    fn resolve(&self, conflict: &SyncConflict) -> Resolution;
}

impl<F> ResolutionPolicy for F
where
    F: Fn(&SyncConflict) -> Resolution,
{
    fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        self(conflict)
    }
}

/// Non-interactive resolution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Remote always wins.
    #[default]
    RemoteWins,
    /// Local always wins.
    LocalWins,
    /// The side with the later modification time wins; ties go to remote.
    NewestWins,
    /// Leave every conflict for a later run.
    Skip,
}

impl ConflictPolicy {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::RemoteWins => "remote-wins",
            ConflictPolicy::LocalWins => "local-wins",
            ConflictPolicy::NewestWins => "newest-wins",
            ConflictPolicy::Skip => "skip",
        }
    }
}

impl ResolutionPolicy for ConflictPolicy {
    fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        match self {
            ConflictPolicy::RemoteWins => Resolution::KeepRemote,
            ConflictPolicy::LocalWins => Resolution::KeepLocal,
            ConflictPolicy::Skip => Resolution::Skip,
            ConflictPolicy::NewestWins => {
                if conflict.conflict_type == ConflictType::RemoteDeleted {
                    return Resolution::KeepRemote;
                }
                match (conflict.local_modified_at, conflict.remote_modified_at) {
                    (Some(local), Some(remote)) if local > remote => Resolution::KeepLocal,
                    (Some(_), None) => Resolution::KeepLocal,
                    _ => Resolution::KeepRemote,
                }
            }
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        match s {
            "remote-wins" => Ok(ConflictPolicy::RemoteWins),
            "local-wins" => Ok(ConflictPolicy::LocalWins),
            "newest-wins" => Ok(ConflictPolicy::NewestWins),
            "skip" => Ok(ConflictPolicy::Skip),
            other => Err(ModelError::UnknownPolicy(other.to_string())),
        }
    }
}
