//! Crash-safe filesystem substrate for the fleetgate data directory.
//!
//! Every destructive write goes through one of two disciplines:
//!
//! 1. **Atomic replace** ([`BaseFsHandle::write_file`]): content is written
//!    to a `name..part` sibling, fsynced, closed, and renamed over `name`.
//!    A crash at any point leaves either the old complete file or a partial
//!    file that every listing filters out.
//! 2. **Durable append** ([`BaseFsHandle::append_file`]): the file is opened
//!    with `O_CREATE | O_APPEND | O_SYNC | O_WRONLY`. Under POSIX, appends
//!    up to 1 MiB are atomic relative to other appenders; the event buckets
//!    and the rollouts journal rely on exactly this contract.
//!
//! Listings are ordered by file modification time. Callers that need two
//! consecutive writes to land on distinct timestamps space them by at least
//! 4 ms (millisecond timestamp filesystems are assumed).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

pub mod audit;
pub mod auth_config;
pub mod certs;
pub mod devices;
pub mod updates;

pub use audit::AuditFsHandle;
pub use auth_config::{AuthConfig, AuthFsHandle};
pub use certs::CertsFsHandle;
pub use devices::DevicesFsHandle;
pub use updates::{JournalEntry, RolloutsFsHandle, UpdatesFsHandle};

/// Suffix of files mid-replacement. Never visible to listings.
pub const PARTIAL_FILE_SUFFIX: &str = "..part";

pub const AUDIT_DIR: &str = "audit";
pub const AUTH_DIR: &str = "auth";
pub const CERTS_DIR: &str = "certs";
pub const DB_FILE: &str = "db.sqlite";
pub const DEVICES_DIR: &str = "devices";
pub const UPDATES_DIR: &str = "updates";

pub const CERTS_CAS_PEM_FILE: &str = "cas.pem";
pub const CERTS_TLS_CSR_FILE: &str = "tls.csr";
pub const CERTS_TLS_KEY_FILE: &str = "tls.key";
pub const CERTS_TLS_PEM_FILE: &str = "tls.pem";
pub const HMAC_SECRET_FILE: &str = "hmac.secret";
pub const AUTH_CONFIG_FILE: &str = "auth-config.json";

pub const AKTOML_FILE: &str = "aktoml";
pub const HW_INFO_FILE: &str = "hardware-info";
pub const NET_INFO_FILE: &str = "network-info";
pub const EVENTS_PREFIX: &str = "events";
pub const STATES_PREFIX: &str = "apps-states";

pub const UPDATES_CI_DIR: &str = "ci";
pub const UPDATES_PROD_DIR: &str = "prod";
pub const UPDATES_TUF_DIR: &str = "tuf";
pub const UPDATES_OSTREE_DIR: &str = "ostree_repo";
pub const UPDATES_APPS_DIR: &str = "apps";
pub const UPDATES_ROLLOUTS_DIR: &str = "rollouts";
pub const UPDATES_LOGS_DIR: &str = "logs";

pub const TUF_ROOT_FILE: &str = "root.json";
pub const TUF_TIMESTAMP_FILE: &str = "timestamp.json";
pub const TUF_SNAPSHOT_FILE: &str = "snapshot.json";
pub const TUF_TARGETS_FILE: &str = "targets.json";
pub const LOG_ROLLOUTS_FILE: &str = "rollouts.log";

pub(crate) const ROLLOUT_JOURNAL_FILE: &str = "rollouts.journal";

/// Poll interval of the line tailer once a file is drained.
pub const TAIL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(5);

/// Errors from the filesystem substrate.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// The requested file or directory does not exist.
    #[error("not found: {}", path.display())]
    NotFound {
        /// Path that was missing.
        path: PathBuf,
    },

    /// Stored content failed to parse (corrupted state files, journal
    /// lines, event logs).
    #[error("malformed content in {}: {detail}", path.display())]
    Malformed {
        /// Path of the offending file.
        path: PathBuf,
        /// Human-readable description of the corruption.
        detail: String,
    },

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error represents a missing file or directory.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::Malformed { .. } => false,
        }
    }
}

/// Path map of the data directory. Cheap to clone; everything derives from
/// the root.
#[derive(Debug, Clone)]
pub struct FsConfig {
    root: PathBuf,
}

impl FsConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join(AUDIT_DIR)
    }

    #[must_use]
    pub fn auth_dir(&self) -> PathBuf {
        self.root.join(AUTH_DIR)
    }

    #[must_use]
    pub fn certs_dir(&self) -> PathBuf {
        self.root.join(CERTS_DIR)
    }

    #[must_use]
    pub fn db_file(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    #[must_use]
    pub fn devices_dir(&self) -> PathBuf {
        self.root.join(DEVICES_DIR)
    }

    #[must_use]
    pub fn updates_dir(&self) -> PathBuf {
        self.root.join(UPDATES_DIR)
    }

    #[must_use]
    pub fn updates_ci_dir(&self) -> PathBuf {
        self.updates_dir().join(UPDATES_CI_DIR)
    }

    #[must_use]
    pub fn updates_prod_dir(&self) -> PathBuf {
        self.updates_dir().join(UPDATES_PROD_DIR)
    }
}

/// Per-branch bundle of update category handles.
#[derive(Debug, Clone)]
pub struct UpdatesBranchHandles {
    pub apps: UpdatesFsHandle,
    pub ostree: UpdatesFsHandle,
    pub tuf: UpdatesFsHandle,
    pub rollouts: RolloutsFsHandle,
    pub logs: UpdatesFsHandle,
}

impl UpdatesBranchHandles {
    fn new(root: PathBuf) -> Self {
        Self {
            apps: UpdatesFsHandle::new(root.clone(), UPDATES_APPS_DIR),
            ostree: UpdatesFsHandle::new(root.clone(), UPDATES_OSTREE_DIR),
            tuf: UpdatesFsHandle::new(root.clone(), UPDATES_TUF_DIR),
            rollouts: RolloutsFsHandle::new(root.clone()),
            logs: UpdatesFsHandle::new(root, UPDATES_LOGS_DIR),
        }
    }
}

/// Root handle over the whole data directory tree.
#[derive(Debug, Clone)]
pub struct FsHandle {
    pub config: FsConfig,

    pub audit: AuditFsHandle,
    pub auth: AuthFsHandle,
    pub certs: CertsFsHandle,
    pub devices: DevicesFsHandle,
    pub updates_ci: UpdatesBranchHandles,
    pub updates_prod: UpdatesBranchHandles,
}

impl FsHandle {
    /// Opens the data directory rooted at `root`, creating the top-level
    /// layout on first use.
    ///
    /// # Errors
    ///
    /// Returns [`FsError`] when any of the top-level directories cannot be
    /// created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        let config = FsConfig::new(root);
        let handle = Self {
            audit: AuditFsHandle::new(config.audit_dir()),
            auth: AuthFsHandle::new(config.auth_dir()),
            certs: CertsFsHandle::new(config.certs_dir()),
            devices: DevicesFsHandle::new(config.devices_dir()),
            updates_ci: UpdatesBranchHandles::new(config.updates_ci_dir()),
            updates_prod: UpdatesBranchHandles::new(config.updates_prod_dir()),
            config,
        };

        for (dir, mode) in [
            (handle.config.audit_dir(), 0o744),
            (handle.config.auth_dir(), 0o740),
            (handle.config.certs_dir(), 0o744),
            (handle.config.devices_dir(), 0o740),
            (handle.config.updates_ci_dir(), 0o744),
            (handle.config.updates_prod_dir(), 0o744),
        ] {
            mkdirs(&dir, mode)?;
        }
        Ok(handle)
    }

    /// Branch selector used throughout the update storage.
    #[must_use]
    pub fn updates(&self, is_prod: bool) -> &UpdatesBranchHandles {
        if is_prod {
            &self.updates_prod
        } else {
            &self.updates_ci
        }
    }
}

pub(crate) fn mkdirs(path: &Path, mode: u32) -> Result<(), FsError> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| FsError::io(format!("create directory {}", path.display()), e))
}

/// Directory-scoped file primitives. Every higher-level handle wraps one of
/// these around its own root.
#[derive(Debug, Clone)]
pub(crate) struct BaseFsHandle {
    pub(crate) root: PathBuf,
}

impl BaseFsHandle {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Reads a whole file as a string. With `ignore_not_exist`, a missing
    /// file reads as empty, which is the contract for optional inventory
    /// files.
    pub(crate) fn read_file(&self, name: &str, ignore_not_exist: bool) -> Result<String, FsError> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if ignore_not_exist {
                    Ok(String::new())
                } else {
                    Err(FsError::NotFound { path })
                }
            }
            Err(e) => Err(FsError::io(format!("read {}", path.display()), e)),
        }
    }

    pub(crate) fn read_file_bytes(&self, name: &str) -> Result<Vec<u8>, FsError> {
        let path = self.path(name);
        match fs::read(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FsError::NotFound { path }),
            Err(e) => Err(FsError::io(format!("read {}", path.display()), e)),
        }
    }

    pub(crate) fn file_exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Atomic replace: write to `name..part`, fsync, close, rename.
    pub(crate) fn write_file(&self, name: &str, content: &[u8], mode: u32) -> Result<(), FsError> {
        let path = self.path(name);
        let partial = self.path(&format!("{name}{PARTIAL_FILE_SUFFIX}"));

        let mut fd = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(mode)
            .open(&partial)
            .map_err(|e| FsError::io(format!("open {}", partial.display()), e))?;
        fd.write_all(content)
            .map_err(|e| FsError::io(format!("write {}", partial.display()), e))?;
        fd.sync_all()
            .map_err(|e| FsError::io(format!("fsync {}", partial.display()), e))?;
        drop(fd);

        fs::rename(&partial, &path)
            .map_err(|e| FsError::io(format!("rename {} into place", partial.display()), e))
    }

    /// Durable append. `O_APPEND | O_SYNC` serializes concurrent appends of
    /// up to 1 MiB on Linux.
    pub(crate) fn append_file(&self, name: &str, content: &str, mode: u32) -> Result<(), FsError> {
        let path = self.path(name);
        let mut fd = OpenOptions::new()
            .create(true)
            .append(true)
            .write(true)
            .mode(mode)
            .custom_flags(libc::O_SYNC)
            .open(&path)
            .map_err(|e| FsError::io(format!("open {} for append", path.display()), e))?;
        fd.write_all(content.as_bytes())
            .map_err(|e| FsError::io(format!("append to {}", path.display()), e))
    }

    /// Deletes the oldest matching files until at most `max` remain.
    pub(crate) fn rollover_files(&self, prefix: &str, max: usize) -> Result<(), FsError> {
        let names = self.match_files(prefix, true)?;
        for name in names.iter().take(names.len().saturating_sub(max)) {
            let path = self.path(name);
            fs::remove_file(&path)
                .map_err(|e| FsError::io(format!("remove {}", path.display()), e))?;
        }
        Ok(())
    }

    /// Lists file names under the root, filtered by prefix, with partial
    /// files hidden. With `sort_by_mod_time`, names come back oldest first;
    /// otherwise lexicographically. A missing root lists as empty.
    pub(crate) fn match_files(
        &self,
        prefix: &str,
        sort_by_mod_time: bool,
    ) -> Result<Vec<String>, FsError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::io(format!("list {}", self.root.display()), e)),
        };

        let mut infos: Vec<(String, i64)> = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| FsError::io(format!("list {}", self.root.display()), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_FILE_SUFFIX) {
                // Uploads in progress or data corruptions.
                continue;
            }
            if !prefix.is_empty() && !name.starts_with(prefix) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(|e| FsError::io(format!("stat {}", name.clone()), e))?;
            let millis = modified
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                .unwrap_or(0);
            infos.push((name, millis));
        }

        if sort_by_mod_time {
            infos.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        } else {
            infos.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Ok(infos.into_iter().map(|(name, _)| name).collect())
    }

    /// Follows a file line by line. Lines are delivered through the returned
    /// channel; once the file drains, the reader re-scans every
    /// [`TAIL_POLL_INTERVAL`] without reopening, so the offset persists and
    /// later appends keep flowing. The task stops when the receiver is
    /// dropped. A missing file delivers nothing and stops immediately.
    pub(crate) fn tail_file_lines(&self, name: &str) -> mpsc::Receiver<Result<String, FsError>> {
        let path = self.path(name);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    let _ = tx
                        .send(Err(FsError::io(format!("open {}", path.display()), e)))
                        .await;
                    return;
                }
            };
            let mut reader = tokio::io::BufReader::new(file);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        if tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                    }
                    Ok(_) => {
                        let trimmed = line.trim_end_matches('\n').to_string();
                        if tx.send(Ok(trimmed)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(FsError::io(format!("read {}", path.display()), e)))
                            .await;
                        return;
                    }
                }
            }
        });
        rx
    }
}
