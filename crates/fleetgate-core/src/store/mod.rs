//! Domain views over the catalog and the on-disk tree.
//!
//! - [`gateway`]: what an authenticated device may do (check in, upload
//!   events and inventory).
//! - [`operator`]: what the operator API reads and writes (device listing,
//!   labels, rollouts and their journal).
//! - [`users`]: users, API tokens, and web sessions.

pub mod gateway;
pub mod operator;
pub mod users;

use crate::db::DbError;
use crate::fs::FsError;

/// Unified error of the storage views.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    /// True when the underlying failure is a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fs(e) if e.is_not_found())
    }

    /// True when the underlying failure is a catalog UNIQUE violation
    /// (duplicate device `name` label).
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Db(e) if crate::db::is_unique_violation(e))
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
