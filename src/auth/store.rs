//! SQLite-backed credential store.
//!
//! Tables:
//! - `users`: email (login handle), phone_number, names, password_hash, salt,
//!   is_active, is_staff, date_joined
//!
//! Identities are never deleted; `deactivate` flips `is_active` instead.

use crate::error::RegisterError;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// Minimum password length for registration and password change.
pub const MIN_PASSWORD_LEN: usize = 8;
const MAX_HANDLE_LEN: usize = 254;
const MAX_PHONE_LEN: usize = 15;

/// A stored user account.
#[derive(Clone)]
pub struct Identity {
    pub id: i64,
    /// Login handle (email), normalized to lowercase.
    pub email: String,
    pub phone_number: String,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub date_joined: DateTime<Utc>,
    password_hash: String,
    salt: String,
}

impl Identity {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Active, non-staff identity with no usable password, for tests that do
    /// not need SQLite.
    #[cfg(test)]
    pub(crate) fn stub(id: i64, email: &str) -> Self {
        Self {
            id,
            email: email.to_string(),
            phone_number: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            is_active: true,
            is_staff: false,
            date_joined: Utc::now(),
            password_hash: String::new(),
            salt: String::new(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("is_active", &self.is_active)
            .field("is_staff", &self.is_staff)
            .finish_non_exhaustive()
    }
}

/// Registration input.
#[derive(Debug, Clone, Default)]
pub struct NewIdentity {
    pub email: String,
    pub phone_number: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub is_staff: bool,
}

/// Read side of the store that token verification depends on.
pub trait IdentityDirectory: Send + Sync {
    /// `Ok(None)` is a normal miss.
    fn find_by_id(&self, id: i64) -> Result<Option<Identity>>;
}

/// SQLite-backed credential store.
pub struct CredentialStore {
    conn: Mutex<rusqlite::Connection>,
}

const IDENTITY_COLUMNS: &str = "id, email, phone_number, first_name, last_name, \
     password_hash, salt, is_active, is_staff, date_joined";

impl CredentialStore {
    /// Open (or create) the credential database at the given path.
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                phone_number TEXT NOT NULL UNIQUE,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_staff INTEGER NOT NULL DEFAULT 0,
                date_joined INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_joined ON users(date_joined);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a new identity.
    ///
    /// Validation failures and duplicates come back as distinct variants so
    /// callers never have to inspect the message.
    pub fn register(&self, new: &NewIdentity) -> Result<Identity, RegisterError> {
        let email = normalize_handle(&new.email);
        let phone = new.phone_number.trim();
        let invalid = |msg: String| Err(RegisterError::Invalid(msg));
        if email.is_empty() {
            return invalid("The email field must be set".into());
        }
        if email.len() > MAX_HANDLE_LEN || !email.contains('@') {
            return invalid("Invalid email address".into());
        }
        if phone.is_empty() {
            return invalid("The phone number field must be set".into());
        }
        if phone.len() > MAX_PHONE_LEN {
            return invalid(format!(
                "Phone number too long (max {MAX_PHONE_LEN} characters)"
            ));
        }
        if new.password.len() < MIN_PASSWORD_LEN {
            return invalid(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            ));
        }

        let salt = generate_salt();
        let password_hash = hash_password(&new.password, &salt);
        let now = Utc::now().timestamp();

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (email, phone_number, first_name, last_name,
                                password_hash, salt, is_staff, date_joined)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                email,
                phone,
                new.first_name.trim(),
                new.last_name.trim(),
                password_hash,
                salt,
                new.is_staff,
                now,
            ],
        );

        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                tracing::info!(user_id = id, "Identity registered");
                Ok(Identity {
                    id,
                    email,
                    phone_number: phone.to_string(),
                    first_name: new.first_name.trim().to_string(),
                    last_name: new.last_name.trim().to_string(),
                    is_active: true,
                    is_staff: new.is_staff,
                    date_joined: DateTime::from_timestamp(now, 0).unwrap_or_default(),
                    password_hash,
                    salt,
                })
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(RegisterError::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────

    /// Look up an identity by login handle (case-insensitive).
    pub fn find_by_handle(&self, handle: &str) -> Result<Option<Identity>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE email = ?1 COLLATE NOCASE"),
            rusqlite::params![normalize_handle(handle)],
            identity_from_row,
        );
        optional(row)
    }

    /// Look up an identity by ID.
    pub fn find_by_id(&self, id: i64) -> Result<Option<Identity>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE id = ?1"),
            rusqlite::params![id],
            identity_from_row,
        );
        optional(row)
    }

    /// Check `plaintext` against the identity's stored hash.
    pub fn verify_password(&self, identity: &Identity, plaintext: &str) -> bool {
        let attempt = hash_password(plaintext, &identity.salt);
        constant_time_eq(identity.password_hash.as_bytes(), attempt.as_bytes())
    }

    /// Lookup + password check. Inactive identities never authenticate.
    pub fn authenticate(&self, handle: &str, password: &str) -> Result<Option<Identity>> {
        match self.find_by_handle(handle)? {
            Some(identity) => {
                if identity.is_active && self.verify_password(&identity, password) {
                    Ok(Some(identity))
                } else {
                    Ok(None)
                }
            }
            None => {
                // Perform dummy hash to prevent timing side-channel
                let _ = hash_password(password, "0000000000000000");
                Ok(None)
            }
        }
    }

    // ── Mutation ────────────────────────────────────────────────────

    /// Replace the password of an identity. Returns `false` if it does not exist.
    pub fn change_password(&self, id: i64, new_password: &str) -> Result<bool> {
        if new_password.len() < MIN_PASSWORD_LEN {
            bail!("Password must be at least {MIN_PASSWORD_LEN} characters");
        }
        let salt = generate_salt();
        let password_hash = hash_password(new_password, &salt);
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET password_hash = ?1, salt = ?2 WHERE id = ?3",
            rusqlite::params![password_hash, salt, id],
        )?;
        Ok(updated > 0)
    }

    /// Soft-delete. Returns `false` if the identity does not exist.
    pub fn deactivate(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET is_active = 0 WHERE id = ?1",
            rusqlite::params![id],
        )?;
        if updated > 0 {
            tracing::info!(user_id = id, "Identity deactivated");
        }
        Ok(updated > 0)
    }

    pub fn set_staff(&self, id: i64, is_staff: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET is_staff = ?1 WHERE id = ?2",
            rusqlite::params![is_staff, id],
        )?;
        Ok(updated > 0)
    }

    // ── Reporting ───────────────────────────────────────────────────

    /// Count registered identities, active or not.
    pub fn identity_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Active identities that joined at or after `since`, oldest first.
    pub fn active_joined_since(&self, since: DateTime<Utc>) -> Result<Vec<Identity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM users
             WHERE is_active = 1 AND date_joined >= ?1
             ORDER BY date_joined ASC, id ASC"
        ))?;
        let identities = stmt
            .query_map(rusqlite::params![since.timestamp()], identity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(identities)
    }
}

impl IdentityDirectory for CredentialStore {
    fn find_by_id(&self, id: i64) -> Result<Option<Identity>> {
        CredentialStore::find_by_id(self, id)
    }
}

fn identity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    let joined: i64 = row.get(9)?;
    Ok(Identity {
        id: row.get(0)?,
        email: row.get(1)?,
        phone_number: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        password_hash: row.get(5)?,
        salt: row.get(6)?,
        is_active: row.get(7)?,
        is_staff: row.get(8)?,
        date_joined: DateTime::from_timestamp(joined, 0).unwrap_or_default(),
    })
}

fn optional<T>(row: rusqlite::Result<T>) -> Result<Option<T>> {
    match row {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn normalize_handle(handle: &str) -> String {
    handle.trim().to_lowercase()
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    // Iterated hashing for key stretching
    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, CredentialStore) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("coursegate.db");
        let store = CredentialStore::new(&db_path).unwrap();
        (tmp, store)
    }

    fn alice() -> NewIdentity {
        NewIdentity {
            email: "Alice@Example.com".into(),
            phone_number: "+380501112233".into(),
            password: "securepassword123".into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
            is_staff: false,
        }
    }

    #[test]
    fn register_and_authenticate() {
        let (_tmp, store) = test_store();

        let identity = store.register(&alice()).unwrap();
        assert!(identity.id > 0);
        assert_eq!(identity.email, "alice@example.com");
        assert!(identity.is_active);

        let found = store
            .authenticate("alice@example.com", "securepassword123")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, identity.id);
        assert_eq!(found.full_name(), "Alice Liddell");
    }

    #[test]
    fn handle_lookup_is_case_insensitive() {
        let (_tmp, store) = test_store();
        let identity = store.register(&alice()).unwrap();

        let found = store.find_by_handle("  ALICE@example.COM ").unwrap().unwrap();
        assert_eq!(found.id, identity.id);
    }

    #[test]
    fn register_duplicate_handle_fails() {
        let (_tmp, store) = test_store();
        store.register(&alice()).unwrap();

        let mut dup = alice();
        dup.email = "alice@EXAMPLE.com".into();
        dup.phone_number = "+10000000000".into();
        let err = store.register(&dup).unwrap_err();
        assert!(matches!(err, RegisterError::Duplicate));
    }

    #[test]
    fn register_duplicate_phone_fails() {
        let (_tmp, store) = test_store();
        store.register(&alice()).unwrap();

        let mut dup = alice();
        dup.email = "other@example.com".into();
        assert!(matches!(
            store.register(&dup).unwrap_err(),
            RegisterError::Duplicate
        ));
    }

    #[test]
    fn register_validates_fields() {
        let (_tmp, store) = test_store();

        let mut no_email = alice();
        no_email.email = "   ".into();
        assert!(matches!(
            store.register(&no_email).unwrap_err(),
            RegisterError::Invalid(msg) if msg.contains("email")
        ));

        let mut bad_email = alice();
        bad_email.email = "not-an-email".into();
        assert!(matches!(
            store.register(&bad_email).unwrap_err(),
            RegisterError::Invalid(_)
        ));

        let mut no_phone = alice();
        no_phone.phone_number = String::new();
        assert!(matches!(
            store.register(&no_phone).unwrap_err(),
            RegisterError::Invalid(msg) if msg.contains("phone")
        ));

        let mut short = alice();
        short.password = "short".into();
        assert!(matches!(
            store.register(&short).unwrap_err(),
            RegisterError::Invalid(msg) if msg.contains("8 characters")
        ));
    }

    #[test]
    fn authenticate_wrong_password_returns_none() {
        let (_tmp, store) = test_store();
        store.register(&alice()).unwrap();

        assert!(store
            .authenticate("alice@example.com", "wrong_password")
            .unwrap()
            .is_none());
    }

    #[test]
    fn authenticate_unknown_handle_returns_none() {
        let (_tmp, store) = test_store();
        assert!(store
            .authenticate("ghost@example.com", "anypassword1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn find_by_id_miss_is_not_an_error() {
        let (_tmp, store) = test_store();
        assert!(store.find_by_id(42).unwrap().is_none());
    }

    #[test]
    fn deactivated_identity_cannot_authenticate() {
        let (_tmp, store) = test_store();
        let identity = store.register(&alice()).unwrap();

        assert!(store.deactivate(identity.id).unwrap());
        assert!(store
            .authenticate("alice@example.com", "securepassword123")
            .unwrap()
            .is_none());

        // Soft delete: the row is still there.
        let kept = store.find_by_id(identity.id).unwrap().unwrap();
        assert!(!kept.is_active);
        assert_eq!(store.identity_count().unwrap(), 1);
    }

    #[test]
    fn deactivate_unknown_returns_false() {
        let (_tmp, store) = test_store();
        assert!(!store.deactivate(99).unwrap());
    }

    #[test]
    fn change_password_replaces_hash() {
        let (_tmp, store) = test_store();
        let identity = store.register(&alice()).unwrap();

        assert!(store.change_password(identity.id, "brand-new-pass").unwrap());
        assert!(store
            .authenticate("alice@example.com", "securepassword123")
            .unwrap()
            .is_none());
        assert!(store
            .authenticate("alice@example.com", "brand-new-pass")
            .unwrap()
            .is_some());
        assert!(store.change_password(identity.id, "short").is_err());
    }

    #[test]
    fn set_staff_toggles_flag() {
        let (_tmp, store) = test_store();
        let identity = store.register(&alice()).unwrap();
        assert!(store.set_staff(identity.id, true).unwrap());
        assert!(store.find_by_id(identity.id).unwrap().unwrap().is_staff);
    }

    #[test]
    fn active_joined_since_skips_inactive() {
        let (_tmp, store) = test_store();
        let a = store.register(&alice()).unwrap();
        let b = store
            .register(&NewIdentity {
                email: "bob@example.com".into(),
                phone_number: "+10000000001".into(),
                password: "password456!".into(),
                ..NewIdentity::default()
            })
            .unwrap();
        store.deactivate(b.id).unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let recent = store.active_joined_since(since).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, a.id);

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(store.active_joined_since(future).unwrap().is_empty());
    }

    #[test]
    fn debug_output_omits_password_material() {
        let (_tmp, store) = test_store();
        let identity = store.register(&alice()).unwrap();
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains(&identity.password_hash));
        assert!(!rendered.contains(&identity.salt));
    }

    #[test]
    fn password_hash_is_deterministic_with_same_salt() {
        let h1 = hash_password("test_password", "fixed_salt_value");
        let h2 = hash_password("test_password", "fixed_salt_value");
        assert_eq!(h1, h2);
    }

    #[test]
    fn password_hash_differs_with_different_salt() {
        let h1 = hash_password("test_password", "salt_a");
        let h2 = hash_password("test_password", "salt_b");
        assert_ne!(h1, h2);
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
