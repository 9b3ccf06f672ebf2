//! Per-device directory storage: inventory files, event buckets, and
//! apps-state snapshots under `devices/<uuid>/`.

use std::path::PathBuf;

use super::{mkdirs, BaseFsHandle, FsError};

#[derive(Debug, Clone)]
pub struct DevicesFsHandle {
    base: BaseFsHandle,
}

impl DevicesFsHandle {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            base: BaseFsHandle::new(root),
        }
    }

    fn device_handle(&self, uuid: &str, for_update: bool) -> Result<BaseFsHandle, FsError> {
        let handle = BaseFsHandle::new(self.base.path(uuid));
        if for_update {
            mkdirs(&handle.root, 0o740)?;
        }
        Ok(handle)
    }

    /// Reads a device file; missing files read as empty (optional inventory
    /// contract).
    pub fn read_file(&self, uuid: &str, name: &str) -> Result<String, FsError> {
        self.device_handle(uuid, false)?.read_file(name, true)
    }

    /// Atomic replace of a device file.
    pub fn write_file(&self, uuid: &str, name: &str, content: &str) -> Result<(), FsError> {
        self.device_handle(uuid, true)?
            .write_file(name, content.as_bytes(), 0o640)
    }

    /// Durable append to a device file (event buckets).
    pub fn append_file(&self, uuid: &str, name: &str, content: &str) -> Result<(), FsError> {
        self.device_handle(uuid, true)?
            .append_file(name, content, 0o640)
    }

    /// Caps the number of `prefix`-named files, dropping the oldest.
    pub fn rollover_files(&self, uuid: &str, prefix: &str, max: usize) -> Result<(), FsError> {
        self.device_handle(uuid, false)?.rollover_files(prefix, max)
    }

    /// Lists device files by prefix; optionally mod-time ordered (oldest
    /// first). Missing device directories list as empty.
    pub fn list_files(
        &self,
        uuid: &str,
        prefix: &str,
        sort_by_mod_time: bool,
    ) -> Result<Vec<String>, FsError> {
        self.device_handle(uuid, false)?
            .match_files(prefix, sort_by_mod_time)
    }

    /// True when a file with this exact name exists for the device.
    #[must_use]
    pub fn file_exists(&self, uuid: &str, name: &str) -> bool {
        self.base.path(uuid).join(name).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{EVENTS_PREFIX, PARTIAL_FILE_SUFFIX};
    use super::*;

    fn devices(dir: &tempfile::TempDir) -> DevicesFsHandle {
        DevicesFsHandle::new(dir.path().join("devices"))
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let d = devices(&dir);

        d.write_file("dev-1", "aktoml", "[config]\nkey=value").unwrap();
        assert_eq!(d.read_file("dev-1", "aktoml").unwrap(), "[config]\nkey=value");
    }

    #[test]
    fn missing_inventory_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let d = devices(&dir);
        assert_eq!(d.read_file("dev-1", "hardware-info").unwrap(), "");
    }

    #[test]
    fn listing_filters_partials() {
        let dir = tempfile::tempdir().unwrap();
        let d = devices(&dir);

        d.append_file("dev-1", "events-c1", "{}\n").unwrap();
        std::fs::write(
            dir.path()
                .join("devices/dev-1")
                .join(format!("events-c2{PARTIAL_FILE_SUFFIX}")),
            "{}",
        )
        .unwrap();

        let names = d.list_files("dev-1", EVENTS_PREFIX, true).unwrap();
        assert_eq!(names, vec!["events-c1".to_string()]);
    }

    #[test]
    fn listing_unknown_device_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let d = devices(&dir);
        assert!(d.list_files("ghost", EVENTS_PREFIX, true).unwrap().is_empty());
    }
}
