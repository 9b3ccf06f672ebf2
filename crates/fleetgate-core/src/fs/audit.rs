//! Append-only per-user audit log under `audit/users-<id>`.
//!
//! Lines are `"<RFC3339>: <message>\n"` and are never mutated. Append
//! failures are logged rather than propagated so that an audit hiccup never
//! fails the user-facing operation it records.

use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use tracing::error;

use super::{BaseFsHandle, FsError};

#[derive(Debug, Clone)]
pub struct AuditFsHandle {
    base: BaseFsHandle,
}

impl AuditFsHandle {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            base: BaseFsHandle::new(root),
        }
    }

    pub fn append_event(&self, user_id: i64, event: &str) {
        let msg = format!(
            "{}: {event}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if let Err(e) = self
            .base
            .append_file(&format!("users-{user_id}"), &msg, 0o740)
        {
            error!(user_id, error = %e, "failed to append audit log");
        }
    }

    pub fn read_events(&self, user_id: i64) -> Result<String, FsError> {
        self.base.read_file(&format!("users-{user_id}"), false)
    }
}
