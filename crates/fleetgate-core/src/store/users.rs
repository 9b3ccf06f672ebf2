//! Users, API tokens, and web sessions.
//!
//! Tokens are never stored raw. The stored value is
//! `hex(hmac_sha256(key, token))` where `key` is derived per token:
//! a 14-byte window of the raw token (`token[3..17]`) salts an
//! HKDF-SHA256 expansion of the server's HMAC secret. Lookup re-derives
//! the key from the presented token, so the catalog only ever holds
//! one-way values.
//!
//! Both token and session lookups intersect the stored scopes with the
//! owner's *current* allowed scopes: downgrading a user immediately
//! downscopes every live credential without rewriting rows.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rusqlite::{params, OptionalExtension};
use sha2::Sha256;
use tracing::{error, info};

use super::{now_unix, StoreError};
use crate::db::{sql, Db};
use crate::fs::FsHandle;
use crate::random_text;
use crate::scopes::Scopes;

/// Length of generated raw tokens and session ids.
const CREDENTIAL_LEN: usize = 26;
/// Byte window of the raw token used as the per-token HKDF salt.
const TOKEN_SALT_RANGE: std::ops::Range<usize> = 3..17;

/// A catalog user. Plain record; all mutations go through
/// [`UserStore::update`] so the audit trail stays complete.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub email: String,
    pub created_at: i64,
    pub deleted: bool,
    pub allowed_scopes: Scopes,
}

/// Metadata of an issued token. `value` is the raw secret only in the
/// [`UserStore::generate_token`] result; listings leave it empty.
#[derive(Debug, Clone)]
pub struct Token {
    pub public_id: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub description: String,
    pub scopes: Scopes,
    pub value: String,
}

/// Details of a new user; id is assigned by the catalog.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub email: String,
    pub allowed_scopes: Scopes,
}

#[derive(Debug, Clone)]
pub struct UserStore {
    db: Db,
    fs: FsHandle,
    hmac_secret: Vec<u8>,
}

impl UserStore {
    /// Opens the user storage. Fails when the HMAC secret has not been
    /// initialized (`auth-init`).
    pub fn new(db: Db, fs: FsHandle) -> Result<Self, StoreError> {
        let hmac_secret = fs.certs.hmac_secret().map_err(|e| {
            StoreError::Invalid(format!("unable to read HMAC secret for API tokens: {e}"))
        })?;
        Ok(Self {
            db,
            fs,
            hmac_secret,
        })
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub fn create(&self, new: &NewUser) -> Result<User, StoreError> {
        let created_at = now_unix();
        let id = {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::USER_CREATE)
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        new.username,
                        new.password,
                        new.email,
                        created_at,
                        false,
                        new.allowed_scopes
                    ])
                })
                .map_err(crate::db::DbError::from)?;
            conn.last_insert_rowid()
        };
        self.fs.audit.append_event(id, "User created");
        Ok(User {
            id,
            username: new.username.clone(),
            password: new.password.clone(),
            email: new.email.clone(),
            created_at,
            deleted: false,
            allowed_scopes: new.allowed_scopes,
        })
    }

    pub fn get(&self, username: &str) -> Result<Option<User>, StoreError> {
        let conn = self.db.lock()?;
        let user = conn
            .prepare_cached(sql::USER_GET_BY_NAME)
            .and_then(|mut stmt| {
                stmt.query_row(params![username], row_to_user).optional()
            })
            .map_err(crate::db::DbError::from)?;
        Ok(user)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let conn = self.db.lock()?;
        let user = conn
            .prepare_cached(sql::USER_GET_BY_ID)
            .and_then(|mut stmt| stmt.query_row(params![id], row_to_user).optional())
            .map_err(crate::db::DbError::from)?;
        Ok(user)
    }

    pub fn list(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(sql::USER_LIST)
            .map_err(crate::db::DbError::from)?;
        let users = stmt
            .query_map([], row_to_user)
            .map_err(crate::db::DbError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(crate::db::DbError::from)?;
        Ok(users)
    }

    /// Persists the user's mutable fields and records `reason` in the
    /// audit log.
    pub fn update(&self, user: &User, reason: &str) -> Result<(), StoreError> {
        {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::USER_UPDATE)
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        user.username,
                        user.password,
                        user.email,
                        user.allowed_scopes,
                        user.deleted,
                        user.id
                    ])
                })
                .map_err(crate::db::DbError::from)?;
        }
        self.fs.audit.append_event(user.id, reason);
        Ok(())
    }

    /// Soft-deletes a user; every token they own is revoked first.
    pub fn delete(&self, user: &User) -> Result<(), StoreError> {
        {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::TOKEN_DELETE_ALL)
                .and_then(|mut stmt| stmt.execute(params![user.id]))
                .map_err(crate::db::DbError::from)?;
        }
        let mut deleted = user.clone();
        deleted.deleted = true;
        self.update(&deleted, "User deleted")
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    fn gen_token_key(&self, token: &str) -> Result<[u8; 32], StoreError> {
        if token.len() < TOKEN_SALT_RANGE.end {
            return Err(StoreError::Invalid(
                "token too short to derive key".to_string(),
            ));
        }
        let salt = &token.as_bytes()[TOKEN_SALT_RANGE];
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.hmac_secret);
        let mut key = [0u8; 32];
        hk.expand(&[], &mut key)
            .map_err(|e| StoreError::Invalid(format!("unable to derive token key: {e}")))?;
        Ok(key)
    }

    fn hash_token(&self, token: &str) -> Result<String, StoreError> {
        let key = self.gen_token_key(token)?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|e| StoreError::Invalid(format!("unable to hash token value: {e}")))?;
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Issues a token for `user`. The requested scopes must be a subset of
    /// the user's current scopes. Returns the token row with `value` set
    /// to the raw secret, the only time it is ever visible.
    pub fn generate_token(
        &self,
        user: &User,
        description: &str,
        expires_at: i64,
        scopes: Scopes,
    ) -> Result<Token, StoreError> {
        if !user.allowed_scopes.allows(scopes) {
            return Err(StoreError::Invalid(format!(
                "requested scopes {scopes} exceed allowed scopes {}",
                user.allowed_scopes
            )));
        }

        let raw = random_text(CREDENTIAL_LEN);
        let hashed = self.hash_token(&raw)?;
        let created_at = now_unix();

        let public_id = {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::TOKEN_CREATE)
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        user.id,
                        created_at,
                        expires_at,
                        description,
                        scopes,
                        hashed
                    ])
                })
                .map_err(crate::db::DbError::from)?;
            conn.last_insert_rowid()
        };
        self.fs.audit.append_event(
            user.id,
            &format!("Token created (id={public_id}, expires={expires_at}, scopes={scopes})"),
        );
        Ok(Token {
            public_id,
            created_at,
            expires_at,
            description: description.to_string(),
            scopes,
            value: raw,
        })
    }

    /// Resolves a raw bearer token to its owner. Expired or unknown
    /// tokens resolve to `None`. The returned user's scopes are the
    /// token's scopes intersected with the owner's current scopes.
    pub fn get_by_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let hashed = self.hash_token(token)?;

        let row = {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::TOKEN_LOOKUP)
                .and_then(|mut stmt| {
                    stmt.query_row(params![hashed], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, Scopes>(4)?,
                        ))
                    })
                    .optional()
                })
                .map_err(crate::db::DbError::from)?
        };
        let Some((user_id, expires_at, token_scopes)) = row else {
            return Ok(None);
        };
        if expires_at < now_unix() {
            return Ok(None);
        }
        Ok(self.get_by_id(user_id)?.map(|mut user| {
            user.allowed_scopes = token_scopes.intersect(user.allowed_scopes);
            user
        }))
    }

    pub fn delete_token(&self, user: &User, public_id: i64) -> Result<(), StoreError> {
        {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::TOKEN_DELETE)
                .and_then(|mut stmt| stmt.execute(params![user.id, public_id]))
                .map_err(crate::db::DbError::from)?;
        }
        self.fs
            .audit
            .append_event(user.id, &format!("Token deleted id={public_id}"));
        Ok(())
    }

    pub fn list_tokens(&self, user: &User) -> Result<Vec<Token>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare_cached(sql::TOKEN_LIST)
            .map_err(crate::db::DbError::from)?;
        let tokens = stmt
            .query_map(params![user.id], |row| {
                Ok(Token {
                    public_id: row.get(0)?,
                    created_at: row.get(1)?,
                    expires_at: row.get(2)?,
                    description: row.get(3)?,
                    scopes: row.get(4)?,
                    value: String::new(),
                })
            })
            .map_err(crate::db::DbError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(crate::db::DbError::from)?;
        Ok(tokens)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Creates a session downscoped to the issuer's current scopes and
    /// returns its opaque id.
    pub fn create_session(
        &self,
        user: &User,
        remote_ip: &str,
        expires_at: i64,
        scopes: Scopes,
    ) -> Result<String, StoreError> {
        if !user.allowed_scopes.allows(scopes) {
            return Err(StoreError::Invalid(format!(
                "requested scopes {scopes} exceed allowed scopes {}",
                user.allowed_scopes
            )));
        }
        let id = random_text(CREDENTIAL_LEN);
        {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::SESSION_CREATE)
                .and_then(|mut stmt| {
                    stmt.execute(params![id, user.id, remote_ip, now_unix(), expires_at, scopes])
                })
                .map_err(crate::db::DbError::from)?;
        }
        self.fs.audit.append_event(
            user.id,
            &format!("Session created (ip={remote_ip}, expires={expires_at}, scopes={scopes})"),
        );
        Ok(id)
    }

    /// Resolves a session cookie value, downscoping like token lookup.
    pub fn get_by_session(&self, id: &str) -> Result<Option<User>, StoreError> {
        let row = {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::SESSION_GET)
                .and_then(|mut stmt| {
                    stmt.query_row(params![id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Scopes>(2)?,
                        ))
                    })
                    .optional()
                })
                .map_err(crate::db::DbError::from)?
        };
        let Some((user_id, expires_at, session_scopes)) = row else {
            return Ok(None);
        };
        if expires_at < now_unix() {
            return Ok(None);
        }
        Ok(self.get_by_id(user_id)?.map(|mut user| {
            user.allowed_scopes = session_scopes.intersect(user.allowed_scopes);
            user
        }))
    }

    pub fn delete_session(&self, user: &User, id: &str) -> Result<(), StoreError> {
        {
            let conn = self.db.lock()?;
            conn.prepare_cached(sql::SESSION_DELETE)
                .and_then(|mut stmt| stmt.execute(params![id]))
                .map_err(crate::db::DbError::from)?;
        }
        self.fs
            .audit
            .append_event(user.id, &format!("Session deleted id={id}"));
        Ok(())
    }

    /// Purges expired tokens and sessions. Runs from the GC daemon; errors
    /// are logged and retried on the next interval.
    pub fn run_gc(&self) {
        info!("running user token and session GC");
        let now = now_unix();
        let result = self.db.lock().map(|conn| {
            conn.prepare_cached(sql::TOKEN_DELETE_EXPIRED)
                .and_then(|mut stmt| stmt.execute(params![now]))
                .and_then(|_| {
                    conn.prepare_cached(sql::SESSION_DELETE_EXPIRED)
                        .and_then(|mut stmt| stmt.execute(params![now]))
                })
        });
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "unable to run credential GC"),
            Err(e) => error!(error = %e, "unable to run credential GC"),
        }
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        email: row.get(3)?,
        created_at: row.get(4)?,
        deleted: false,
        allowed_scopes: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::{self, Scopes};

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsHandle::new(dir.path()).unwrap();
        fs.certs.init_hmac_secret().unwrap();
        let db = Db::open(&fs.config.db_file()).unwrap();
        (dir, UserStore::new(db, fs).unwrap())
    }

    fn new_user(scopes: Scopes) -> NewUser {
        NewUser {
            username: "alice".into(),
            password: "<hash>".into(),
            email: "alice@example.org".into(),
            allowed_scopes: scopes,
        }
    }

    #[test]
    fn create_get_update_delete() {
        let (_dir, s) = store();
        let mut user = s.create(&new_user(scopes::DEVICES_READ)).unwrap();
        assert!(user.id > 0);

        assert!(s.get("nobody").unwrap().is_none());
        let loaded = s.get("alice").unwrap().unwrap();
        assert_eq!(loaded.id, user.id);

        user.email = "new@example.org".into();
        s.update(&user, "Email changed").unwrap();
        assert_eq!(s.get("alice").unwrap().unwrap().email, "new@example.org");

        s.delete(&user).unwrap();
        assert!(s.get("alice").unwrap().is_none());

        let audit = s.fs.audit.read_events(user.id).unwrap();
        assert!(audit.contains("User created"));
        assert!(audit.contains("Email changed"));
        assert!(audit.contains("User deleted"));
    }

    #[test]
    fn token_round_trip_and_expiry() {
        let (_dir, s) = store();
        let user = s.create(&new_user(scopes::DEVICES_READ)).unwrap();

        let token = s
            .generate_token(&user, "ci", now_unix() + 3600, scopes::DEVICES_READ)
            .unwrap();
        assert_eq!(token.value.len(), 26);

        let resolved = s.get_by_token(&token.value).unwrap().unwrap();
        assert_eq!(resolved.id, user.id);
        assert_eq!(resolved.allowed_scopes, scopes::DEVICES_READ);

        // The raw value never hits the catalog.
        let listed = s.list_tokens(&user).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].value.is_empty());

        let expired = s
            .generate_token(&user, "old", now_unix() - 1, scopes::DEVICES_READ)
            .unwrap();
        assert!(s.get_by_token(&expired.value).unwrap().is_none());
    }

    #[test]
    fn token_scopes_cannot_exceed_allowed() {
        let (_dir, s) = store();
        let user = s.create(&new_user(scopes::DEVICES_READ)).unwrap();
        assert!(s
            .generate_token(&user, "t", now_unix() + 3600, scopes::DEVICES_READ_UPDATE)
            .is_err());
    }

    #[test]
    fn user_downgrade_downscopes_live_tokens() {
        let (_dir, s) = store();
        let mut user = s
            .create(&new_user(scopes::DEVICES_READ | scopes::DEVICES_READ_UPDATE))
            .unwrap();
        let token = s
            .generate_token(
                &user,
                "rw",
                now_unix() + 3600,
                scopes::DEVICES_READ | scopes::DEVICES_READ_UPDATE,
            )
            .unwrap();

        user.allowed_scopes = scopes::DEVICES_READ;
        s.update(&user, "Scopes reduced").unwrap();

        let resolved = s.get_by_token(&token.value).unwrap().unwrap();
        assert!(resolved.allowed_scopes.has(scopes::SCOPE_DEVICES_R));
        assert!(!resolved.allowed_scopes.has(scopes::SCOPE_DEVICES_RU));
    }

    #[test]
    fn short_tokens_are_rejected_not_hashed() {
        let (_dir, s) = store();
        assert!(s.get_by_token("tooshort").is_err());
    }

    #[test]
    fn deleting_user_revokes_tokens() {
        let (_dir, s) = store();
        let user = s.create(&new_user(scopes::DEVICES_READ)).unwrap();
        let token = s
            .generate_token(&user, "t", now_unix() + 3600, scopes::DEVICES_READ)
            .unwrap();

        s.delete(&user).unwrap();
        assert!(s.get_by_token(&token.value).unwrap().is_none());
    }

    #[test]
    fn session_round_trip_and_downscope() {
        let (_dir, s) = store();
        let mut user = s
            .create(&new_user(scopes::DEVICES_READ | scopes::UPDATES_READ))
            .unwrap();

        let id = s
            .create_session(&user, "10.0.0.1", now_unix() + 3600, user.allowed_scopes)
            .unwrap();
        let resolved = s.get_by_session(&id).unwrap().unwrap();
        assert_eq!(resolved.id, user.id);

        user.allowed_scopes = scopes::DEVICES_READ;
        s.update(&user, "Scopes reduced").unwrap();
        let resolved = s.get_by_session(&id).unwrap().unwrap();
        assert_eq!(resolved.allowed_scopes, scopes::DEVICES_READ);

        s.delete_session(&user, &id).unwrap();
        assert!(s.get_by_session(&id).unwrap().is_none());
    }

    #[test]
    fn gc_purges_expired_credentials() {
        let (_dir, s) = store();
        let user = s.create(&new_user(scopes::DEVICES_READ)).unwrap();
        let live = s
            .generate_token(&user, "live", now_unix() + 3600, scopes::DEVICES_READ)
            .unwrap();
        s.generate_token(&user, "dead", now_unix() - 10, scopes::DEVICES_READ)
            .unwrap();

        s.run_gc();
        let tokens = s.list_tokens(&user).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].public_id, live.public_id);
    }
}
