//! Operator-facing storage: device listing and labels, update browsing,
//! rollouts with their journal, and the rollout log tailer.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::StoreError;
use crate::db::{device_list_sql, sql, Db, ORDER_BY_DEVICE};
use crate::events::DeviceUpdateEvent;
use crate::fs::{
    FsError, FsHandle, JournalEntry, AKTOML_FILE, EVENTS_PREFIX, HW_INFO_FILE,
    LOG_ROLLOUTS_FILE, NET_INFO_FILE, STATES_PREFIX, TUF_ROOT_FILE, TUF_SNAPSHOT_FILE,
    TUF_TARGETS_FILE, TUF_TIMESTAMP_FILE,
};

/// Sort order accepted by the device list API, resolved to its SQL form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    sql: &'static str,
}

impl OrderBy {
    /// Default used by operator listings: named devices first,
    /// alphabetically.
    pub const NAME_ASC: &'static str = "name-asc";
    pub const LAST_SEEN_DESC: &'static str = "last-seen-desc";

    /// Resolves an `order-by` query value. Unknown spellings are a caller
    /// error.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        ORDER_BY_DEVICE
            .iter()
            .find(|(name, _)| *name == value)
            .map(|(_, sql)| Self { sql })
            .ok_or_else(|| StoreError::Invalid(format!("invalid order by arg: {value}")))
    }
}

/// List pagination and ordering options.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceListOpts {
    #[serde(rename = "order-by", default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl Default for DeviceListOpts {
    fn default() -> Self {
        Self {
            order_by: None,
            limit: None,
            offset: None,
        }
    }
}

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListItem {
    pub uuid: String,
    #[serde(rename = "created-at")]
    pub created_at: i64,
    #[serde(rename = "last-seen")]
    pub last_seen: i64,
    pub target: String,
    pub tag: String,
    #[serde(rename = "is-prod")]
    pub is_prod: bool,
    pub labels: Labels,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(flatten)]
    pub item: DeviceListItem,

    pub apps: Vec<String>,
    #[serde(rename = "ostree-hash")]
    pub ostree_hash: String,
    pub pubkey: String,
    #[serde(rename = "update-name")]
    pub update_name: String,

    #[serde(rename = "aktualizr-toml")]
    pub aktoml: String,
    #[serde(rename = "hardware-info")]
    pub hw_info: String,
    #[serde(rename = "network-info")]
    pub net_info: String,
}

/// A rollout document as stored on disk: the source of truth for one
/// staged update push. `committed` flips to true only after the catalog
/// update returned the effective uuid set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rollout {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uuids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(
        rename = "effective-uuids",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub effective_uuids: Vec<String>,
    #[serde(rename = "committed", default)]
    pub committed: bool,
}

#[derive(Debug, Clone)]
pub struct OperatorStore {
    db: Db,
    fs: FsHandle,
}

impl OperatorStore {
    #[must_use]
    pub fn new(db: Db, fs: FsHandle) -> Self {
        Self { db, fs }
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Lists non-deleted devices. Defaults: named devices first, limit
    /// 1000, offset 0.
    pub fn devices_list(&self, opts: &DeviceListOpts) -> Result<Vec<DeviceListItem>, StoreError> {
        let order_by = OrderBy::parse(
            opts.order_by.as_deref().unwrap_or(OrderBy::NAME_ASC),
        )?;
        let limit = opts.limit.unwrap_or(1000);
        let offset = opts.offset.unwrap_or(0);

        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(&device_list_sql(order_by.sql))
            .map_err(crate::db::DbError::from)?;
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                let labels: String = row.get(6)?;
                Ok((
                    DeviceListItem {
                        uuid: row.get(0)?,
                        created_at: row.get(1)?,
                        last_seen: row.get(2)?,
                        target: row.get(3)?,
                        tag: row.get(4)?,
                        is_prod: row.get(5)?,
                        labels: Labels::new(),
                    },
                    labels,
                ))
            })
            .map_err(crate::db::DbError::from)?;

        let mut devices = Vec::new();
        for row in rows {
            let (mut item, labels) = row.map_err(crate::db::DbError::from)?;
            item.labels = serde_json::from_str(&labels)?;
            devices.push(item);
        }
        Ok(devices)
    }

    /// Fetches one non-deleted device together with its last-known
    /// inventory files. Missing inventory reads as empty.
    pub fn device_get(&self, uuid: &str) -> Result<Option<Device>, StoreError> {
        let row = {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::API_DEVICE_GET)
                .and_then(|mut stmt| {
                    stmt.query_row(params![uuid], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, String>(8)?,
                            row.get::<_, bool>(9)?,
                        ))
                    })
                    .optional()
                })
                .map_err(crate::db::DbError::from)?
        };
        let Some((
            created_at,
            last_seen,
            pubkey,
            update_name,
            tag,
            target,
            ostree_hash,
            apps,
            labels,
            is_prod,
        )) = row
        else {
            return Ok(None);
        };

        let apps = apps
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Some(Device {
            item: DeviceListItem {
                uuid: uuid.to_string(),
                created_at,
                last_seen,
                target,
                tag,
                is_prod,
                labels: serde_json::from_str(&labels)?,
            },
            apps,
            ostree_hash,
            pubkey,
            update_name,
            aktoml: self.fs.devices.read_file(uuid, AKTOML_FILE)?,
            hw_info: self.fs.devices.read_file(uuid, HW_INFO_FILE)?,
            net_info: self.fs.devices.read_file(uuid, NET_INFO_FILE)?,
        }))
    }

    /// Soft-deletes a device; it disappears from every operator read and
    /// its next check-in is refused. Returns false for unknown devices.
    pub fn device_delete(&self, uuid: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn
            .prepare_cached(sql::API_DEVICE_DELETE)
            .and_then(|mut stmt| stmt.execute(params![uuid]))
            .map_err(crate::db::DbError::from)?;
        Ok(changed > 0)
    }

    /// Correlation ids of a device's update attempts, newest first.
    pub fn device_updates(&self, uuid: &str) -> Result<Vec<String>, StoreError> {
        let mut names = self.fs.devices.list_files(uuid, EVENTS_PREFIX, true)?;
        for name in &mut names {
            *name = name[EVENTS_PREFIX.len() + 1..].to_string();
        }
        names.reverse();
        Ok(names)
    }

    /// Events of one update attempt, in upload order. Empty when the
    /// bucket does not exist.
    pub fn device_events(
        &self,
        uuid: &str,
        update_id: &str,
    ) -> Result<Vec<DeviceUpdateEvent>, StoreError> {
        let name = format!("{EVENTS_PREFIX}-{update_id}");
        let content = self.fs.devices.read_file(uuid, &name)?;
        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.is_empty()) {
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    /// Apps-state snapshots, newest first.
    pub fn device_apps_states(&self, uuid: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        let names = self.fs.devices.list_files(uuid, STATES_PREFIX, true)?;
        let mut states = Vec::with_capacity(names.len());
        for name in names.iter().rev() {
            let content = self.fs.devices.read_file(uuid, name)?;
            states.push(serde_json::from_str(&content)?);
        }
        Ok(states)
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Applies a merge-patch on top of existing labels: present values
    /// replace, `None` deletes, absent keys are preserved. The catalog's
    /// unique index on the generated `name` column turns a duplicate name
    /// into [`StoreError::is_unique_violation`].
    pub fn patch_device_labels(
        &self,
        labels: &BTreeMap<String, Option<String>>,
        uuids: &[String],
    ) -> Result<(), StoreError> {
        let labels_json = serde_json::to_string(labels)?;
        let uuids_json = serde_json::to_string(uuids)?;
        let conn = self.db.lock()?;
        conn.prepare_cached(sql::API_DEVICE_SET_LABELS)
            .and_then(|mut stmt| stmt.execute(params![labels_json, uuids_json]))
            .map_err(crate::db::DbError::from)?;
        Ok(())
    }

    /// Every label key ever applied to a device.
    pub fn known_device_label_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(sql::API_DEVICE_KNOWN_LABELS)
            .map_err(crate::db::DbError::from)?;
        let labels = stmt
            .query_map([], |row| row.get(0))
            .map_err(crate::db::DbError::from)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(crate::db::DbError::from)?;
        Ok(labels)
    }

    /// Group names currently in use by non-deleted devices.
    pub fn known_device_group_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(sql::API_DEVICE_KNOWN_GROUPS)
            .map_err(crate::db::DbError::from)?;
        let groups = stmt
            .query_map([], |row| row.get(0))
            .map_err(crate::db::DbError::from)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(crate::db::DbError::from)?;
        Ok(groups)
    }

    // ------------------------------------------------------------------
    // Updates & rollouts
    // ------------------------------------------------------------------

    /// Maps tag → staged update names for a branch.
    pub fn list_updates(
        &self,
        tag: &str,
        is_prod: bool,
    ) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        Ok(self.fs.updates(is_prod).rollouts.list_updates(tag)?)
    }

    /// Rollout names of one update, oldest first.
    pub fn list_rollouts(
        &self,
        tag: &str,
        update: &str,
        is_prod: bool,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.fs.updates(is_prod).rollouts.list_files(tag, update)?)
    }

    /// Reads a rollout file. [`FsError::NotFound`] maps to 404 upstream.
    pub fn get_rollout(
        &self,
        tag: &str,
        update: &str,
        rollout: &str,
        is_prod: bool,
    ) -> Result<Rollout, StoreError> {
        let content = self
            .fs
            .updates(is_prod)
            .rollouts
            .read_file(tag, update, rollout)?;
        Ok(serde_json::from_str(&content)?)
    }

    #[must_use]
    pub fn rollout_exists(&self, tag: &str, update: &str, rollout: &str, is_prod: bool) -> bool {
        self.fs
            .updates(is_prod)
            .rollouts
            .file_exists(tag, update, rollout)
    }

    /// Atomic replace of a rollout file.
    pub fn save_rollout(
        &self,
        tag: &str,
        update: &str,
        rollout: &str,
        is_prod: bool,
        body: &Rollout,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(body)?;
        Ok(self
            .fs
            .updates(is_prod)
            .rollouts
            .write_file(tag, update, rollout, &data)?)
    }

    /// Phase A of the rollout protocol: journal the intent, then write the
    /// uncommitted rollout file. Crash anywhere after the journal append
    /// leaves a record the watchdog reconciles.
    pub fn create_rollout(
        &self,
        tag: &str,
        update: &str,
        rollout: &str,
        is_prod: bool,
        body: &Rollout,
    ) -> Result<(), StoreError> {
        let entry = JournalEntry {
            tag: tag.to_string(),
            update: update.to_string(),
            rollout: rollout.to_string(),
        };
        self.fs.updates(is_prod).rollouts.append_journal(&entry)?;
        self.save_rollout(tag, update, rollout, is_prod, body)
    }

    /// Phase B: run the constrained bulk catalog update and persist the
    /// committed marker with the effective uuid set. Idempotent: the
    /// UPDATE converges, so re-running after a crash produces the same
    /// file.
    pub fn commit_rollout(
        &self,
        tag: &str,
        update: &str,
        rollout: &str,
        is_prod: bool,
        mut body: Rollout,
    ) -> Result<Rollout, StoreError> {
        body.effective_uuids =
            self.set_update_name(tag, update, is_prod, &body.uuids, &body.groups)?;
        body.committed = true;
        self.save_rollout(tag, update, rollout, is_prod, &body)?;
        Ok(body)
    }

    /// Bulk-assigns `update` to every non-deleted device matching the
    /// branch and tag whose uuid or group was requested, returning the
    /// uuids actually hit. Unknown uuids silently drop out.
    pub fn set_update_name(
        &self,
        tag: &str,
        update: &str,
        is_prod: bool,
        uuids: &[String],
        groups: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let uuids_json = serde_json::to_string(uuids)?;
        let groups_json = serde_json::to_string(groups)?;
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(sql::API_DEVICE_SET_UPDATE)
            .map_err(crate::db::DbError::from)?;
        let effective = stmt
            .query_map(
                params![update, tag, is_prod, uuids_json, groups_json],
                |row| row.get(0),
            )
            .map_err(crate::db::DbError::from)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(crate::db::DbError::from)?;
        Ok(effective)
    }

    /// Reads the journaled rollout intents of a branch.
    pub fn read_rollout_journal(&self, is_prod: bool) -> Result<Vec<JournalEntry>, StoreError> {
        Ok(self.fs.updates(is_prod).rollouts.read_journal()?)
    }

    /// Promotes the partial journal after a clean watchdog pass.
    pub fn rollover_rollout_journal(&self, is_prod: bool) -> Result<(), StoreError> {
        Ok(self.fs.updates(is_prod).rollouts.rollover_journal()?)
    }

    // ------------------------------------------------------------------
    // TUF metadata & rollout log
    // ------------------------------------------------------------------

    /// The four TUF role documents of an update, keyed by role name.
    /// Absent roles are omitted.
    pub fn update_tuf_metadata(
        &self,
        tag: &str,
        update: &str,
        is_prod: bool,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let tuf = &self.fs.updates(is_prod).tuf;
        let mut metas = BTreeMap::new();
        for name in [
            TUF_ROOT_FILE,
            TUF_TIMESTAMP_FILE,
            TUF_SNAPSHOT_FILE,
            TUF_TARGETS_FILE,
        ] {
            match tuf.read_file(tag, update, name) {
                Ok(content) => {
                    let role = name.trim_end_matches(".json").to_string();
                    metas.insert(role, serde_json::from_str(&content)?);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(metas)
    }

    #[must_use]
    pub fn rollout_log_exists(&self, tag: &str, update: &str, is_prod: bool) -> bool {
        self.fs
            .updates(is_prod)
            .logs
            .file_exists(tag, update, LOG_ROLLOUTS_FILE)
    }

    /// Follows `logs/rollouts.log` of an update. Lines stream through the
    /// receiver; the follower stops when the receiver is dropped.
    pub fn tail_rollouts_log(
        &self,
        tag: &str,
        update: &str,
        is_prod: bool,
    ) -> Result<mpsc::Receiver<Result<String, FsError>>, StoreError> {
        Ok(self
            .fs
            .updates(is_prod)
            .logs
            .tail_file_lines(tag, update, LOG_ROLLOUTS_FILE)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::gateway::{CheckIn, GatewayStore};

    fn stores() -> (tempfile::TempDir, OperatorStore, GatewayStore) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsHandle::new(dir.path()).unwrap();
        let db = Db::open(&fs.config.db_file()).unwrap();
        (
            dir,
            OperatorStore::new(db.clone(), fs.clone()),
            GatewayStore::new(db, fs),
        )
    }

    fn checked_in_device(gw: &GatewayStore, uuid: &str, tag: &str, is_prod: bool) {
        let mut d = gw.device_create(uuid, &format!("pk-{uuid}"), is_prod).unwrap();
        gw.device_check_in(
            &mut d,
            CheckIn {
                tag: Some(tag.into()),
                ..CheckIn::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn list_respects_order_and_soft_delete() {
        let (_dir, api, gw) = stores();

        gw.device_create("uuid-1", "pk1", false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        gw.device_create("uuid-2", "pk2", false).unwrap();

        let opts = DeviceListOpts {
            order_by: Some("created-at-asc".into()),
            ..DeviceListOpts::default()
        };
        let devices = api.devices_list(&opts).unwrap();
        assert_eq!(devices[0].uuid, "uuid-1");
        assert_eq!(devices[1].uuid, "uuid-2");

        let opts = DeviceListOpts {
            order_by: Some("created-at-desc".into()),
            ..DeviceListOpts::default()
        };
        assert_eq!(api.devices_list(&opts).unwrap()[0].uuid, "uuid-2");

        assert!(api.device_delete("uuid-1").unwrap());
        let remaining = api.devices_list(&DeviceListOpts::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(api.device_get("uuid-1").unwrap().is_none());
    }

    #[test]
    fn named_devices_sort_before_unnamed() {
        let (_dir, api, gw) = stores();
        for uuid in ["a", "b", "c"] {
            gw.device_create(uuid, "pk", false).unwrap();
        }
        api.patch_device_labels(
            &BTreeMap::from([("name".to_string(), Some("zeta".to_string()))]),
            &["a".to_string()],
        )
        .unwrap();

        let opts = DeviceListOpts {
            order_by: Some("name-asc".into()),
            ..DeviceListOpts::default()
        };
        let devices = api.devices_list(&opts).unwrap();
        assert_eq!(devices[0].uuid, "a"); // named comes first
        assert_eq!(devices[1].uuid, "b");
    }

    #[test]
    fn device_get_joins_inventory_files() {
        let (_dir, api, gw) = stores();
        let d = gw.device_create("uuid-1", "pubkey-value-1", false).unwrap();
        gw.put_file(&d, AKTOML_FILE, "aktoml content").unwrap();

        api.set_update_for_test(&["uuid-1"], "update42");

        let device = api.device_get("uuid-1").unwrap().unwrap();
        assert!(!device.item.is_prod);
        assert_eq!(device.ostree_hash, "");
        assert_eq!(device.pubkey, "pubkey-value-1");
        assert_eq!(device.update_name, "update42");
        assert_eq!(device.aktoml, "aktoml content");
        assert_eq!(device.hw_info, "");
    }

    #[test]
    fn duplicate_name_label_is_unique_violation() {
        let (_dir, api, gw) = stores();
        gw.device_create("a", "pk", false).unwrap();
        gw.device_create("b", "pk", false).unwrap();

        let name_x = BTreeMap::from([("name".to_string(), Some("x".to_string()))]);
        api.patch_device_labels(&name_x, &["a".to_string()]).unwrap();

        let err = api
            .patch_device_labels(&name_x, &["b".to_string()])
            .unwrap_err();
        assert!(err.is_unique_violation());

        let name_y = BTreeMap::from([("name".to_string(), Some("y".to_string()))]);
        api.patch_device_labels(&name_y, &["b".to_string()]).unwrap();
    }

    #[test]
    fn label_patch_merges_and_deletes() {
        let (_dir, api, gw) = stores();
        gw.device_create("a", "pk", false).unwrap();

        api.patch_device_labels(
            &BTreeMap::from([
                ("group".to_string(), Some("g1".to_string())),
                ("rack".to_string(), Some("r1".to_string())),
            ]),
            &["a".to_string()],
        )
        .unwrap();
        api.patch_device_labels(
            &BTreeMap::from([("rack".to_string(), None)]),
            &["a".to_string()],
        )
        .unwrap();

        let device = api.device_get("a").unwrap().unwrap();
        assert_eq!(device.item.labels.get("group").unwrap(), "g1");
        assert!(!device.item.labels.contains_key("rack"));

        // Known labels accumulate even after deletion.
        let known = api.known_device_label_names().unwrap();
        assert!(known.contains(&"rack".to_string()));
        assert_eq!(api.known_device_group_names().unwrap(), vec!["g1".to_string()]);
    }

    #[test]
    fn set_update_name_filters_by_tag_branch_and_group() {
        let (_dir, api, gw) = stores();
        checked_in_device(&gw, "ci1", "tag1", false);
        checked_in_device(&gw, "ci2", "tag1", false);
        checked_in_device(&gw, "ci3", "tag2", false);
        checked_in_device(&gw, "prod1", "tag1", true);
        checked_in_device(&gw, "grp-dev", "tag1", false);
        api.patch_device_labels(
            &BTreeMap::from([("group".to_string(), Some("grp1".to_string()))]),
            &["grp-dev".to_string()],
        )
        .unwrap();

        let effective = api
            .set_update_name(
                "tag1",
                "update1",
                false,
                &["ci1".to_string(), "ci2".to_string(), "ci3".to_string(), "ghost".to_string()],
                &["grp1".to_string()],
            )
            .unwrap();

        let mut sorted = effective.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["ci1", "ci2", "grp-dev"]);

        // Re-running converges to the same set.
        let again = api
            .set_update_name(
                "tag1",
                "update1",
                false,
                &["ci1".to_string(), "ci2".to_string(), "ci3".to_string(), "ghost".to_string()],
                &["grp1".to_string()],
            )
            .unwrap();
        let mut again_sorted = again;
        again_sorted.sort();
        assert_eq!(again_sorted, sorted);
    }

    #[test]
    fn rollout_create_then_commit() {
        let (_dir, api, gw) = stores();
        checked_in_device(&gw, "ci1", "tag1", false);

        let body = Rollout {
            uuids: vec!["ci1".to_string()],
            ..Rollout::default()
        };
        api.create_rollout("tag1", "update1", "r1", false, &body).unwrap();

        let stored = api.get_rollout("tag1", "update1", "r1", false).unwrap();
        assert!(!stored.committed);
        assert!(stored.effective_uuids.is_empty());

        let committed = api
            .commit_rollout("tag1", "update1", "r1", false, stored)
            .unwrap();
        assert!(committed.committed);
        assert_eq!(committed.effective_uuids, vec!["ci1"]);

        let reread = api.get_rollout("tag1", "update1", "r1", false).unwrap();
        assert_eq!(reread, committed);

        // The intent is only visible after the journal rollover.
        assert!(api.read_rollout_journal(false).unwrap().is_empty());
        api.rollover_rollout_journal(false).unwrap();
        let journal = api.read_rollout_journal(false).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].rollout, "r1");
    }

    #[test]
    fn missing_rollout_is_not_found() {
        let (_dir, api, _gw) = stores();
        let err = api.get_rollout("tag1", "update1", "ghost", false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn device_updates_are_newest_first() {
        let (_dir, api, gw) = stores();
        let d = gw.device_create("dev-1", "pk", false).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            for corr in ["c1", "c2"] {
                gw.process_events(
                    &d,
                    &[crate::events::DeviceUpdateEvent {
                        id: format!("1_{corr}"),
                        device_time: "2023-12-12T12:00:00Z".into(),
                        event: crate::events::DeviceEvent {
                            correlation_id: corr.to_string(),
                            ..crate::events::DeviceEvent::default()
                        },
                        event_type: crate::events::DeviceEventType::default(),
                    }],
                )
                .await
                .unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        assert_eq!(api.device_updates("dev-1").unwrap(), vec!["c2", "c1"]);
        assert_eq!(api.device_events("dev-1", "c1").unwrap().len(), 1);
        assert!(api.device_events("dev-1", "nope").unwrap().is_empty());
    }

    impl OperatorStore {
        fn set_update_for_test(&self, uuids: &[&str], update: &str) {
            let conn = self.db.lock().unwrap();
            for uuid in uuids {
                conn.execute(
                    "UPDATE devices SET update_name = ?1 WHERE uuid = ?2",
                    params![update, uuid],
                )
                .unwrap();
            }
        }
    }
}
