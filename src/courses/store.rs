//! SQLite-backed course catalog and enrollments.
//!
//! Tables:
//! - `courses`: title, description, created_by, created_at, updated_at
//! - `enrollments`: (user_id, course_id) unique, enrolled_at

use crate::error::CourseError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use serde::Serialize;
use std::path::Path;

/// Courses per listing page.
pub const PAGE_SIZE: u32 = 10;

const MAX_TITLE_LEN: usize = 200;

const FOLD_CASE_FN: &str = "fold_case";

#[derive(Debug, Clone, Serialize)]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub course_id: i64,
    pub course_title: String,
    pub enrolled_at: DateTime<Utc>,
}

/// Listing filter: case-insensitive search over title/description, 1-based page.
#[derive(Debug, Clone, Default)]
pub struct CourseQuery {
    pub search: Option<String>,
    pub page: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoursePage {
    pub items: Vec<Course>,
    pub page: u32,
    pub total: u64,
}

/// Result of an update/delete that is restricted to the course owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnedChange {
    Applied,
    NotFound,
    NotOwner,
}

/// Whether `enroll` created a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled,
    AlreadyEnrolled,
    CourseNotFound,
}

pub struct CourseStore {
    conn: Mutex<rusqlite::Connection>,
}

impl CourseStore {
    /// Open the catalog in the same database file as the credential store.
    ///
    /// The `users` table must already exist (open `CredentialStore` first).
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        register_fold_case(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS courses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_by INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_courses_owner ON courses(created_by);

            CREATE TABLE IF NOT EXISTS enrollments (
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                course_id INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                enrolled_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, course_id)
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create(
        &self,
        owner_id: i64,
        title: &str,
        description: &str,
    ) -> Result<Course, CourseError> {
        let title = validate_title(title)?;
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO courses (title, description, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![title, description, owner_id, now],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(course_id = id, owner_id, "Course created");
        Ok(Course {
            id,
            title: title.to_string(),
            description: description.to_string(),
            created_by: owner_id,
            created_at: from_epoch(now),
            updated_at: from_epoch(now),
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Course>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, title, description, created_by, created_at, updated_at
             FROM courses WHERE id = ?1",
            rusqlite::params![id],
            course_from_row,
        );
        match row {
            Ok(course) => Ok(Some(course)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Newest first. Page 0 is treated as page 1.
    pub fn list(&self, query: &CourseQuery) -> Result<CoursePage> {
        let page = query.page.max(1);
        let pattern = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(&s.to_lowercase())));
        let offset = i64::from(page - 1) * i64::from(PAGE_SIZE);

        let conn = self.conn.lock();
        // Pattern and columns go through the same Unicode fold.
        let filter = format!(
            "(?1 IS NULL
              OR {FOLD_CASE_FN}(title) LIKE ?1 ESCAPE '\\'
              OR {FOLD_CASE_FN}(description) LIKE ?1 ESCAPE '\\')"
        );
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM courses WHERE {filter}"),
            rusqlite::params![pattern],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, title, description, created_by, created_at, updated_at
             FROM courses WHERE {filter}
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(
                rusqlite::params![pattern, i64::from(PAGE_SIZE), offset],
                course_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CoursePage {
            items,
            page,
            total: total as u64,
        })
    }

    /// Owner-only update of title and/or description.
    pub fn update(
        &self,
        id: i64,
        requester_id: i64,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<OwnedChange, CourseError> {
        let title = title.map(validate_title).transpose()?;
        let conn = self.conn.lock();
        let Some(owner) = owner_of(&conn, id)? else {
            return Ok(OwnedChange::NotFound);
        };
        if owner != requester_id {
            return Ok(OwnedChange::NotOwner);
        }
        conn.execute(
            "UPDATE courses SET
                title = COALESCE(?1, title),
                description = COALESCE(?2, description),
                updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![title, description, Utc::now().timestamp(), id],
        )?;
        Ok(OwnedChange::Applied)
    }

    /// Owner-only delete. Enrollments go with the course.
    pub fn delete(&self, id: i64, requester_id: i64) -> Result<OwnedChange> {
        let conn = self.conn.lock();
        let Some(owner) = owner_of(&conn, id)? else {
            return Ok(OwnedChange::NotFound);
        };
        if owner != requester_id {
            return Ok(OwnedChange::NotOwner);
        }
        conn.execute("DELETE FROM courses WHERE id = ?1", rusqlite::params![id])?;
        tracing::info!(course_id = id, "Course deleted");
        Ok(OwnedChange::Applied)
    }

    /// Enroll `user_id`, creating the enrollment only if it does not exist yet.
    pub fn enroll(&self, user_id: i64, course_id: i64) -> Result<EnrollOutcome> {
        let conn = self.conn.lock();
        if owner_of(&conn, course_id)?.is_none() {
            return Ok(EnrollOutcome::CourseNotFound);
        }
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO enrollments (user_id, course_id, enrolled_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, course_id, Utc::now().timestamp()],
        )?;
        Ok(if inserted > 0 {
            EnrollOutcome::Enrolled
        } else {
            EnrollOutcome::AlreadyEnrolled
        })
    }

    pub fn is_enrolled(&self, user_id: i64, course_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM enrollments WHERE user_id = ?1 AND course_id = ?2",
            rusqlite::params![user_id, course_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Enrollments of `user_id`, most recent first.
    pub fn enrollments_for(&self, user_id: i64) -> Result<Vec<Enrollment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.course_id, c.title, e.enrolled_at
             FROM enrollments e JOIN courses c ON c.id = e.course_id
             WHERE e.user_id = ?1
             ORDER BY e.enrolled_at DESC, e.course_id DESC",
        )?;
        let enrollments = stmt
            .query_map(rusqlite::params![user_id], |row| {
                Ok(Enrollment {
                    course_id: row.get(0)?,
                    course_title: row.get(1)?,
                    enrolled_at: from_epoch(row.get(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(enrollments)
    }
}

fn owner_of(conn: &rusqlite::Connection, course_id: i64) -> Result<Option<i64>> {
    match conn.query_row(
        "SELECT created_by FROM courses WHERE id = ?1",
        rusqlite::params![course_id],
        |row| row.get(0),
    ) {
        Ok(owner) => Ok(Some(owner)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn validate_title(title: &str) -> Result<&str, CourseError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(CourseError::Invalid("Course title cannot be empty".into()));
    }
    if trimmed.chars().count() > MAX_TITLE_LEN {
        return Err(CourseError::Invalid(format!(
            "Course title too long (max {MAX_TITLE_LEN} characters)"
        )));
    }
    Ok(trimmed)
}

/// `fold_case(text)`: Unicode lowercase. SQLite's own `lower()` only folds ASCII.
fn register_fold_case(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        FOLD_CASE_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|text| text.to_lowercase())),
    )
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn course_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        created_by: row.get(3)?,
        created_at: from_epoch(row.get(4)?),
        updated_at: from_epoch(row.get(5)?),
    })
}
