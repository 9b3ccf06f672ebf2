//! The relational catalog: devices, users, tokens, sessions, and the label
//! index, backed by a single SQLite file.
//!
//! One opener creates the schema on first use. All named statements are
//! validated when the catalog opens, so a typo in any SQL is fatal at
//! startup rather than a latent 500. At run time statements execute through
//! the connection's statement cache, which re-uses the compiled form.
//!
//! Labels are stored as a JSON document; `name` and `group_name` are
//! virtual generated columns so the catalog itself enforces `name`
//! uniqueness (across non-deleted devices) and indexes group membership.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

/// Errors from the catalog layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("unable to open catalog at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("unable to prepare '{name}' statement: {source}")]
    Prepare {
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("catalog lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed stored data: {0}")]
    Malformed(String),
}

/// True when the error is a UNIQUE constraint violation. Handlers map this
/// to 409 (duplicate device `name` label).
#[must_use]
pub fn is_unique_violation(err: &DbError) -> bool {
    match err {
        DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

const SCHEMA: &str = r#"
CREATE TABLE devices (
    uuid        TEXT NOT NULL PRIMARY KEY,
    pubkey      TEXT,
    deleted     INT DEFAULT 0,
    is_prod     INT DEFAULT 0,
    created_at  INT DEFAULT 0,
    last_seen   INT DEFAULT 0,
    tag         TEXT DEFAULT '',
    update_name TEXT DEFAULT '',
    target_name TEXT DEFAULT '',
    ostree_hash TEXT DEFAULT '',
    apps        TEXT DEFAULT '',
    labels      TEXT NOT NULL DEFAULT '{}',
    name        TEXT GENERATED ALWAYS AS (labels ->> '$.name') VIRTUAL,
    group_name  TEXT GENERATED ALWAYS AS (labels ->> '$.group') VIRTUAL
) WITHOUT ROWID;

CREATE UNIQUE INDEX devices_name_unique ON devices(name)
    WHERE name IS NOT NULL AND deleted = 0;
CREATE INDEX devices_group_name ON devices(group_name);

CREATE TABLE device_labels (
    label TEXT NOT NULL PRIMARY KEY
) WITHOUT ROWID;

CREATE TRIGGER devices_collect_label_keys AFTER UPDATE OF labels ON devices
BEGIN
    INSERT OR IGNORE INTO device_labels SELECT key FROM json_each(NEW.labels);
END;

CREATE TABLE users (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    username       TEXT NOT NULL UNIQUE,
    password       TEXT,
    email          TEXT,
    created_at     INT DEFAULT 0,
    deleted        INT DEFAULT 0,
    allowed_scopes TEXT DEFAULT ''
);

CREATE TABLE tokens (
    public_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INT,
    created_at  INT,
    expires_at  INT,
    description TEXT,
    scopes      TEXT,
    value       TEXT NOT NULL UNIQUE,

    FOREIGN KEY(user_id) REFERENCES users(id)
);

CREATE TABLE session (
    id         TEXT NOT NULL PRIMARY KEY,
    user_id    INT,
    remote_ip  TEXT,
    created_at INT,
    expires_at INT,
    scopes     TEXT,

    FOREIGN KEY(user_id) REFERENCES users(id)
) WITHOUT ROWID;
"#;

/// Named SQL used by the storage views. Kept in one place so the open path
/// can validate every statement eagerly.
pub(crate) mod sql {
    // Gateway view.
    pub const DEVICE_CREATE: &str = "\
        INSERT INTO devices (uuid, pubkey, created_at, last_seen, is_prod, deleted)
        VALUES (?1, ?2, ?3, ?4, ?5, 0)";
    pub const DEVICE_GET: &str = "\
        SELECT pubkey, deleted, is_prod, created_at, last_seen,
               tag, update_name, target_name, ostree_hash, apps
        FROM devices
        WHERE uuid = ?1";
    pub const DEVICE_CHECK_IN: &str = "\
        UPDATE devices
        SET target_name = ?1, tag = ?2, ostree_hash = ?3, apps = ?4, last_seen = ?5
        WHERE uuid = ?6";

    // Operator view.
    pub const API_DEVICE_GET: &str = "\
        SELECT created_at, last_seen, pubkey, update_name, tag, target_name,
               ostree_hash, apps, json(labels), is_prod
        FROM devices
        WHERE uuid = ?1 AND deleted = 0";
    pub const API_DEVICE_LIST: &str = "\
        SELECT uuid, created_at, last_seen, target_name, tag, is_prod, json(labels)
        FROM devices
        WHERE deleted = 0
        ORDER BY {order_by} LIMIT ?1 OFFSET ?2";
    pub const API_DEVICE_DELETE: &str = "\
        UPDATE devices SET deleted = 1 WHERE uuid = ?1 AND deleted = 0";
    pub const API_DEVICE_SET_LABELS: &str = "\
        UPDATE devices
        SET labels = json_patch(labels, ?1)
        WHERE uuid IN (SELECT value FROM json_each(?2))";
    pub const API_DEVICE_KNOWN_LABELS: &str =
        "SELECT label FROM device_labels ORDER BY label";
    pub const API_DEVICE_KNOWN_GROUPS: &str = "\
        SELECT DISTINCT group_name FROM devices
        WHERE group_name IS NOT NULL AND deleted = 0
        ORDER BY group_name";
    pub const API_DEVICE_SET_UPDATE: &str = "\
        UPDATE devices
        SET update_name = ?1
        WHERE tag = ?2 AND is_prod = ?3 AND deleted = 0 AND (
            uuid IN (SELECT value FROM json_each(?4))
            OR
            group_name IN (SELECT value FROM json_each(?5))
        ) RETURNING uuid";

    // Users.
    pub const USER_CREATE: &str = "\
        INSERT INTO users (username, password, email, created_at, deleted, allowed_scopes)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
    pub const USER_GET_BY_ID: &str = "\
        SELECT id, username, password, email, created_at, allowed_scopes
        FROM users
        WHERE id = ?1 AND deleted = 0";
    pub const USER_GET_BY_NAME: &str = "\
        SELECT id, username, password, email, created_at, allowed_scopes
        FROM users
        WHERE username = ?1 AND deleted = 0";
    pub const USER_LIST: &str = "\
        SELECT id, username, password, email, created_at, allowed_scopes
        FROM users
        WHERE deleted = 0";
    pub const USER_UPDATE: &str = "\
        UPDATE users
        SET username = ?1, password = ?2, email = ?3, allowed_scopes = ?4, deleted = ?5
        WHERE id = ?6";

    // Tokens.
    pub const TOKEN_CREATE: &str = "\
        INSERT INTO tokens (user_id, created_at, expires_at, description, scopes, value)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
    pub const TOKEN_DELETE: &str =
        "DELETE FROM tokens WHERE user_id = ?1 AND public_id = ?2";
    pub const TOKEN_DELETE_ALL: &str = "DELETE FROM tokens WHERE user_id = ?1";
    pub const TOKEN_DELETE_EXPIRED: &str = "DELETE FROM tokens WHERE expires_at < ?1";
    pub const TOKEN_LIST: &str = "\
        SELECT public_id, created_at, expires_at, description, scopes
        FROM tokens
        WHERE user_id = ?1
        ORDER BY created_at ASC";
    pub const TOKEN_LOOKUP: &str = "\
        SELECT user_id, public_id, created_at, expires_at, scopes
        FROM tokens
        WHERE value = ?1";

    // Sessions.
    pub const SESSION_CREATE: &str = "\
        INSERT INTO session (id, user_id, remote_ip, created_at, expires_at, scopes)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
    pub const SESSION_DELETE: &str = "DELETE FROM session WHERE id = ?1";
    pub const SESSION_DELETE_EXPIRED: &str = "DELETE FROM session WHERE expires_at < ?1";
    pub const SESSION_GET: &str = "\
        SELECT user_id, expires_at, scopes
        FROM session
        WHERE id = ?1";
}

/// Statements that go through `{order_by}` substitution; every variant is
/// validated at open time.
pub(crate) fn device_list_sql(order_by: &str) -> String {
    sql::API_DEVICE_LIST.replace("{order_by}", order_by)
}

/// The `order-by` spellings accepted by the device list API, with their SQL
/// translations. Devices with a name always sort before devices without.
pub const ORDER_BY_DEVICE: [(&str, &str); 8] = [
    ("created-at-asc", "created_at ASC"),
    ("created-at-desc", "created_at DESC"),
    ("last-seen-asc", "last_seen ASC"),
    ("last-seen-desc", "last_seen DESC"),
    ("name-asc", "name ASC NULLS LAST, uuid ASC"),
    ("name-desc", "name DESC NULLS LAST, uuid DESC"),
    ("uuid-asc", "uuid ASC"),
    ("uuid-desc", "uuid DESC"),
];

const STATEMENTS: [(&'static str, &'static str); 24] = [
    ("DeviceCreate", sql::DEVICE_CREATE),
    ("DeviceGet", sql::DEVICE_GET),
    ("DeviceCheckIn", sql::DEVICE_CHECK_IN),
    ("apiDeviceGet", sql::API_DEVICE_GET),
    ("apiDeviceDelete", sql::API_DEVICE_DELETE),
    ("apiDeviceSetLabels", sql::API_DEVICE_SET_LABELS),
    ("apiDeviceKnownLabels", sql::API_DEVICE_KNOWN_LABELS),
    ("apiDeviceKnownGroups", sql::API_DEVICE_KNOWN_GROUPS),
    ("apiDeviceSetUpdate", sql::API_DEVICE_SET_UPDATE),
    ("userCreate", sql::USER_CREATE),
    ("userGetById", sql::USER_GET_BY_ID),
    ("userGetByName", sql::USER_GET_BY_NAME),
    ("userList", sql::USER_LIST),
    ("userUpdate", sql::USER_UPDATE),
    ("tokenCreate", sql::TOKEN_CREATE),
    ("tokenDelete", sql::TOKEN_DELETE),
    ("tokenDeleteAll", sql::TOKEN_DELETE_ALL),
    ("tokenDeleteExpired", sql::TOKEN_DELETE_EXPIRED),
    ("tokenList", sql::TOKEN_LIST),
    ("tokenLookup", sql::TOKEN_LOOKUP),
    ("sessionCreate", sql::SESSION_CREATE),
    ("sessionDelete", sql::SESSION_DELETE),
    ("sessionDeleteExpired", sql::SESSION_DELETE_EXPIRED),
    ("sessionGet", sql::SESSION_GET),
];

/// Handle over the opened catalog. Clones share one connection; SQLite
/// serializes writes underneath.
#[derive(Debug, Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Opens (or creates) the catalog at `path` and validates the schema
    /// and every named statement.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the file cannot be opened, the schema cannot
    /// be created, or any named statement fails to prepare.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let is_new = !path.exists();
        let conn = Connection::open(path).map_err(|e| DbError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        if is_new {
            conn.execute_batch(SCHEMA)?;
        }
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.prepare_all()?;
        Ok(db)
    }

    /// In-memory catalog for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on schema or statement failures.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().map_err(|e| DbError::Open {
            path: ":memory:".to_string(),
            source: e,
        })?;
        conn.execute_batch(SCHEMA)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.prepare_all()?;
        Ok(db)
    }

    fn prepare_all(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        for (name, statement) in STATEMENTS {
            conn.prepare_cached(statement)
                .map(|_| ())
                .map_err(|source| DbError::Prepare { name, source })?;
        }
        for (_, order_by) in ORDER_BY_DEVICE {
            conn.prepare_cached(&device_list_sql(order_by))
                .map(|_| ())
                .map_err(|source| DbError::Prepare {
                    name: "apiDeviceList",
                    source,
                })?;
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }
}
