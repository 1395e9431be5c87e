// ABOUTME: The error taxonomy shared across the revkv workspace.
// ABOUTME: Conflicts and compaction are domain results; everything else is an opaque backend error.

use thiserror::Error;

/// Errors returned by the event log, the KV store, and dialects.
///
/// `KeyExists` and `Compacted` are expected, recoverable outcomes the
/// caller reacts to (retry a read-modify-write, re-snapshot at a newer
/// revision). A CAS mismatch is deliberately *not* an error: Update and
/// Delete report it as `updated = false` / `deleted = false`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key exists")]
    KeyExists,

    #[error("revision has been compacted")]
    Compacted,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Error {
    /// True for the domain conditions a caller is expected to handle.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KeyExists)
    }
}
