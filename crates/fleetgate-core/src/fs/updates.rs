//! Per-update artifact storage under `updates/<ci|prod>/<tag>/<update>/`
//! and the per-branch rollouts journal.
//!
//! One [`UpdatesFsHandle`] exists per category (`tuf`, `ostree_repo`,
//! `apps`, `rollouts`, `logs`); all of them share a branch root.
//! [`RolloutsFsHandle`] adds update listing and the journal, whose lines
//! record rollout intent before any catalog mutation (see the rollout
//! watchdog).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tokio::sync::mpsc;

use super::{mkdirs, BaseFsHandle, FsError, PARTIAL_FILE_SUFFIX, ROLLOUT_JOURNAL_FILE};

#[derive(Debug, Clone)]
pub struct UpdatesFsHandle {
    root: PathBuf,
    category: &'static str,
}

impl UpdatesFsHandle {
    pub(crate) fn new(root: PathBuf, category: &'static str) -> Self {
        Self { root, category }
    }

    fn update_handle(
        &self,
        tag: &str,
        update: &str,
        for_update: bool,
    ) -> Result<BaseFsHandle, FsError> {
        let handle = BaseFsHandle::new(self.root.join(tag).join(update).join(self.category));
        if for_update {
            mkdirs(&handle.root, 0o744)?;
        }
        Ok(handle)
    }

    /// Full path of a category file; used by collaborators that hand paths
    /// to external tooling.
    #[must_use]
    pub fn file_path(&self, tag: &str, update: &str, name: &str) -> PathBuf {
        self.root.join(tag).join(update).join(self.category).join(name)
    }

    pub fn read_file(&self, tag: &str, update: &str, name: &str) -> Result<String, FsError> {
        self.update_handle(tag, update, false)?.read_file(name, false)
    }

    pub fn write_file(
        &self,
        tag: &str,
        update: &str,
        name: &str,
        content: &str,
    ) -> Result<(), FsError> {
        self.update_handle(tag, update, true)?
            .write_file(name, content.as_bytes(), 0o644)
    }

    pub fn append_file(
        &self,
        tag: &str,
        update: &str,
        name: &str,
        content: &str,
    ) -> Result<(), FsError> {
        self.update_handle(tag, update, true)?
            .append_file(name, content, 0o644)
    }

    #[must_use]
    pub fn file_exists(&self, tag: &str, update: &str, name: &str) -> bool {
        self.file_path(tag, update, name).exists()
    }

    /// Follows a category file (the rollouts log). See
    /// [`BaseFsHandle::tail_file_lines`] for delivery semantics.
    pub fn tail_file_lines(
        &self,
        tag: &str,
        update: &str,
        name: &str,
    ) -> Result<mpsc::Receiver<Result<String, FsError>>, FsError> {
        Ok(self.update_handle(tag, update, false)?.tail_file_lines(name))
    }
}

/// Journal line: one rollout intent per line, `tag|update|rollout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub tag: String,
    pub update: String,
    pub rollout: String,
}

impl JournalEntry {
    fn parse(line: &str, path: &std::path::Path) -> Result<Self, FsError> {
        let mut parts = line.split('|');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(tag), Some(update), Some(rollout), None) => Ok(Self {
                tag: tag.to_string(),
                update: update.to_string(),
                rollout: rollout.to_string(),
            }),
            _ => Err(FsError::Malformed {
                path: path.to_path_buf(),
                detail: format!("corrupted journal line: {line}"),
            }),
        }
    }

    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{}|{}|{}", self.tag, self.update, self.rollout)
    }
}

#[derive(Debug, Clone)]
pub struct RolloutsFsHandle {
    inner: UpdatesFsHandle,
    branch: BaseFsHandle,
}

impl RolloutsFsHandle {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            inner: UpdatesFsHandle::new(root.clone(), super::UPDATES_ROLLOUTS_DIR),
            branch: BaseFsHandle::new(root),
        }
    }

    pub fn read_file(&self, tag: &str, update: &str, name: &str) -> Result<String, FsError> {
        self.inner.read_file(tag, update, name)
    }

    pub fn write_file(
        &self,
        tag: &str,
        update: &str,
        name: &str,
        content: &str,
    ) -> Result<(), FsError> {
        self.inner.write_file(tag, update, name, content)
    }

    #[must_use]
    pub fn file_exists(&self, tag: &str, update: &str, name: &str) -> bool {
        self.inner.file_exists(tag, update, name)
    }

    /// Maps tag → update names. With a `tag` filter only that tag's subtree
    /// is listed; unknown tags yield an empty map. The fleet is expected to
    /// carry few tags, so listing everything at once stays cheap.
    pub fn list_updates(&self, tag: &str) -> Result<BTreeMap<String, Vec<String>>, FsError> {
        let tag_dirs: Vec<String> = if tag.is_empty() {
            list_dirs(&self.branch.root)?
        } else {
            vec![tag.to_string()]
        };

        let mut res = BTreeMap::new();
        for tag in tag_dirs {
            let updates = list_dirs(&self.branch.root.join(&tag))?;
            if !updates.is_empty() || self.branch.root.join(&tag).is_dir() {
                res.insert(tag, updates);
            }
        }
        Ok(res)
    }

    /// Lists rollout names of an update, oldest first. Unknown tag/update
    /// pairs list as empty.
    pub fn list_files(&self, tag: &str, update: &str) -> Result<Vec<String>, FsError> {
        self.inner.update_handle(tag, update, false)?.match_files("", true)
    }

    /// Appends a journal line to the journal's partial sibling. Intents
    /// accumulate there until the watchdog's rollover.
    pub fn append_journal(&self, entry: &JournalEntry) -> Result<(), FsError> {
        let name = format!("{ROLLOUT_JOURNAL_FILE}{PARTIAL_FILE_SUFFIX}");
        self.branch
            .append_file(&name, &format!("{}\n", entry.to_line()), 0o664)
    }

    /// Renames the partial journal over the processed one. A missing
    /// partial means no new intents since the last rollover.
    pub fn rollover_journal(&self) -> Result<(), FsError> {
        let from = self
            .branch
            .path(&format!("{ROLLOUT_JOURNAL_FILE}{PARTIAL_FILE_SUFFIX}"));
        let to = self.branch.path(ROLLOUT_JOURNAL_FILE);
        match fs::rename(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::io(format!("rename {}", from.display()), e)),
        }
    }

    /// Reads every line of the non-partial journal. A missing journal reads
    /// as empty; a corrupted line fails the whole read so the watchdog can
    /// retry the pass later.
    pub fn read_journal(&self) -> Result<Vec<JournalEntry>, FsError> {
        let path = self.branch.path(ROLLOUT_JOURNAL_FILE);
        let content = self.branch.read_file(ROLLOUT_JOURNAL_FILE, true)?;
        content
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| JournalEntry::parse(line, &path))
            .collect()
    }
}

fn list_dirs(path: &std::path::Path) -> Result<Vec<String>, FsError> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FsError::io(format!("list {}", path.display()), e)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| FsError::io(format!("list {}", path.display()), e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    dirs.sort();
    Ok(dirs)
}
