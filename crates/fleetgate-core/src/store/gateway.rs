//! Device-facing storage: lazy creation on first mTLS check-in,
//! deduplicated inventory updates, correlation-bucketed event logs, and
//! bounded apps-state snapshots.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::warn;

use super::{now_unix, StoreError};
use crate::db::{sql, Db};
use crate::events::{parse_status, DeviceStatus, DeviceUpdateEvent};
use crate::fs::{FsHandle, EVENTS_PREFIX, LOG_ROLLOUTS_FILE, STATES_PREFIX};

/// Maximum `events-*` buckets kept per device.
pub const MAX_EVENT_FILES: usize = 20;
/// Maximum `apps-states-*` snapshots kept per device.
pub const MAX_STATE_FILES: usize = 10;

/// A repeat check-in inside this window with unchanged inventory skips the
/// catalog update entirely.
pub const CHECK_IN_DEDUP_WINDOW_SECS: i64 = 60;

/// Event files are ordered by file mod-time; two consecutive buckets are
/// spaced by at least this much so a later file always carries a later
/// timestamp (assumes millisecond filesystem timestamps).
pub const MODTIME_SPACING: std::time::Duration = std::time::Duration::from_millis(4);

/// Catalog row of a device, as the gateway sees it.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub uuid: String,
    pub pubkey: String,
    #[serde(skip_serializing)]
    pub deleted: bool,
    #[serde(rename = "is-prod")]
    pub is_prod: bool,
    #[serde(rename = "created-at")]
    pub created_at: i64,
    #[serde(rename = "last-seen")]
    pub last_seen: i64,
    pub tag: String,
    #[serde(rename = "update-name")]
    pub update_name: String,
    #[serde(rename = "target-name")]
    pub target_name: String,
    #[serde(rename = "ostree-hash")]
    pub ostree_hash: String,
    /// Comma-joined, exactly as reported in `x-ats-dockerapps`.
    pub apps: String,
}

/// Inventory carried by the `x-ats-*` check-in headers. Absent headers
/// leave the stored columns untouched.
#[derive(Debug, Clone, Default)]
pub struct CheckIn {
    pub target_name: Option<String>,
    pub tag: Option<String>,
    pub ostree_hash: Option<String>,
    pub apps: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayStore {
    db: Db,
    fs: FsHandle,
    max_events: usize,
    max_states: usize,
}

impl GatewayStore {
    #[must_use]
    pub fn new(db: Db, fs: FsHandle) -> Self {
        Self {
            db,
            fs,
            max_events: MAX_EVENT_FILES,
            max_states: MAX_STATE_FILES,
        }
    }

    /// Creates a device row on first check-in.
    pub fn device_create(
        &self,
        uuid: &str,
        pubkey: &str,
        is_prod: bool,
    ) -> Result<Device, StoreError> {
        let now = now_unix();
        let conn = self.db.lock()?;
        conn.prepare_cached(sql::DEVICE_CREATE)
            .and_then(|mut stmt| stmt.execute(params![uuid, pubkey, now, now, is_prod]))
            .map_err(crate::db::DbError::from)?;
        Ok(Device {
            uuid: uuid.to_string(),
            pubkey: pubkey.to_string(),
            deleted: false,
            is_prod,
            created_at: now,
            last_seen: now,
            tag: String::new(),
            update_name: String::new(),
            target_name: String::new(),
            ostree_hash: String::new(),
            apps: String::new(),
        })
    }

    /// Looks a device up by uuid, including soft-deleted rows (the auth
    /// middleware needs to distinguish "unknown" from "deleted").
    pub fn device_get(&self, uuid: &str) -> Result<Option<Device>, StoreError> {
        let conn = self.db.lock()?;
        let device = conn
            .prepare_cached(sql::DEVICE_GET)
            .and_then(|mut stmt| {
                stmt.query_row(params![uuid], |row| {
                    Ok(Device {
                        uuid: uuid.to_string(),
                        pubkey: row.get(0)?,
                        deleted: row.get(1)?,
                        is_prod: row.get(2)?,
                        created_at: row.get(3)?,
                        last_seen: row.get(4)?,
                        tag: row.get(5)?,
                        update_name: row.get(6)?,
                        target_name: row.get(7)?,
                        ostree_hash: row.get(8)?,
                        apps: row.get(9)?,
                    })
                })
                .optional()
            })
            .map_err(crate::db::DbError::from)?;
        Ok(device)
    }

    /// Applies a check-in. Headers that were absent keep their stored
    /// values; when nothing changed and the device was seen less than
    /// [`CHECK_IN_DEDUP_WINDOW_SECS`] ago, the catalog is left alone.
    /// Returns whether the catalog was touched.
    pub fn device_check_in(
        &self,
        device: &mut Device,
        update: CheckIn,
    ) -> Result<bool, StoreError> {
        let target_name = update.target_name.unwrap_or_else(|| device.target_name.clone());
        let tag = update.tag.unwrap_or_else(|| device.tag.clone());
        let ostree_hash = update.ostree_hash.unwrap_or_else(|| device.ostree_hash.clone());
        let apps = update.apps.unwrap_or_else(|| device.apps.clone());

        let now = now_unix();
        let unchanged = target_name == device.target_name
            && tag == device.tag
            && ostree_hash == device.ostree_hash
            && apps == device.apps;
        if unchanged && now - device.last_seen < CHECK_IN_DEDUP_WINDOW_SECS {
            return Ok(false);
        }

        {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::DEVICE_CHECK_IN)
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        target_name,
                        tag,
                        ostree_hash,
                        apps,
                        now,
                        device.uuid
                    ])
                })
                .map_err(crate::db::DbError::from)?;
        }

        device.target_name = target_name;
        device.tag = tag;
        device.ostree_hash = ostree_hash;
        device.apps = apps;
        device.last_seen = now;
        Ok(true)
    }

    /// Atomic replace of a device inventory file (`aktoml`,
    /// `hardware-info`, `network-info`).
    pub fn put_file(&self, device: &Device, name: &str, content: &str) -> Result<(), StoreError> {
        Ok(self.fs.devices.write_file(&device.uuid, name, content)?)
    }

    /// Appends validated events into per-correlation-id buckets and feeds
    /// the rollout log of the device's current update.
    ///
    /// Bucket files are ordered by mod-time, so whenever the correlation id
    /// changes between consecutive events the write is delayed by
    /// [`MODTIME_SPACING`] to guarantee the next file lands on a strictly
    /// later timestamp. Afterwards the bucket set rolls over to at most
    /// [`MAX_EVENT_FILES`] files.
    pub async fn process_events(
        &self,
        device: &Device,
        events: &[DeviceUpdateEvent],
    ) -> Result<(), StoreError> {
        let mut corr_id: Option<&str> = None;
        for event in events {
            if let Some(prev) = corr_id {
                if prev != event.event.correlation_id {
                    tokio::time::sleep(MODTIME_SPACING).await;
                }
            }
            corr_id = Some(&event.event.correlation_id);

            let name = format!("{EVENTS_PREFIX}-{}", event.event.correlation_id);
            let line = serde_json::to_string(event)?;
            self.fs
                .devices
                .append_file(&device.uuid, &name, &format!("{line}\n"))?;

            self.append_rollout_status(device, event)?;
        }
        self.fs
            .devices
            .rollover_files(&device.uuid, EVENTS_PREFIX, self.max_events)?;
        Ok(())
    }

    fn append_rollout_status(
        &self,
        device: &Device,
        event: &DeviceUpdateEvent,
    ) -> Result<(), StoreError> {
        if device.update_name.is_empty() || device.tag.is_empty() {
            return Ok(());
        }
        let Some(status) = parse_status(event) else {
            return Ok(());
        };
        let line = serde_json::to_string(&DeviceStatus {
            uuid: device.uuid.clone(),
            correlation_id: event.event.correlation_id.clone(),
            target_name: event.event.target_name.clone(),
            status: status.to_string(),
        })?;
        self.fs.updates(device.is_prod).logs.append_file(
            &device.tag,
            &device.update_name,
            LOG_ROLLOUTS_FILE,
            &format!("{line}\n"),
        )?;
        Ok(())
    }

    /// Stores one apps-state snapshot under `apps-states-<unixMilli>` and
    /// caps the set at [`MAX_STATE_FILES`]. Snapshot names must be unique
    /// and increasing, so a same-millisecond collision waits out the
    /// spacing interval.
    pub async fn save_apps_states(&self, device: &Device, raw: &str) -> Result<(), StoreError> {
        let mut name = format!("{STATES_PREFIX}-{}", chrono::Utc::now().timestamp_millis());
        while self.fs.devices.file_exists(&device.uuid, &name) {
            tokio::time::sleep(MODTIME_SPACING).await;
            name = format!("{STATES_PREFIX}-{}", chrono::Utc::now().timestamp_millis());
        }
        self.fs.devices.write_file(&device.uuid, &name, raw)?;
        self.fs
            .devices
            .rollover_files(&device.uuid, STATES_PREFIX, self.max_states)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_max_events(mut self, max: usize) -> Self {
        self.max_events = max;
        self
    }
}

/// Drops events that cannot be stored, warning for each. Invalid events
/// never fail the upload; devices retry aggressively and a poison event
/// would wedge them.
#[must_use]
pub fn sanitize_events(events: Vec<DeviceUpdateEvent>) -> Vec<DeviceUpdateEvent> {
    let mut valid = Vec::with_capacity(events.len());
    for mut event in events {
        if event.id.is_empty() {
            warn!(corr_id = %event.event.correlation_id, "missing event ID - skip it");
            continue;
        }
        if event.event.correlation_id.is_empty() {
            warn!(event = %event.id, "missing event correlation ID - skip it");
            continue;
        }
        if chrono::DateTime::parse_from_rfc3339(&event.device_time).is_err() {
            // Operator tooling needs this to be a valid datetime. Normally
            // the clock skew is within seconds, so substituting the server
            // time keeps the timeline usable.
            warn!(
                event = %event.id,
                corr_id = %event.event.correlation_id,
                value = %event.device_time,
                "invalid event deviceTime, must be RFC3339 - use current time"
            );
            event.device_time = chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        }
        valid.push(event);
    }
    valid
}
