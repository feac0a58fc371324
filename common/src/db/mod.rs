//! Job and part documents, stored as JSON in SQLite.
//!
//! All access goes through a single `Mutex<Connection>`; the handle is
//! cheap to clone.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub use crate::data::*;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database row not found")]
    NotFound,
    #[error("database write failed")]
    WriteFailed,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored document is not valid: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
}

/// Document store for jobs and their parts.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<Job, DbError>;
    /// Upsert; the stored document is fully overwritten.
    async fn put_job(&self, job: &Job) -> Result<(), DbError>;
    /// Removes the job together with all of its parts.
    async fn delete_job(&self, id: &str) -> Result<(), DbError>;
    async fn list_jobs(&self) -> Result<Vec<Job>, DbError>;

    async fn put_part(&self, part: &Part) -> Result<(), DbError>;
    /// Writes all parts or none of them.
    async fn put_parts(&self, parts: &[Part]) -> Result<(), DbError>;
    async fn get_part(&self, job_id: &str, part_id: u32) -> Result<Part, DbError>;
    /// Parts of a job in ascending id (and so byte range) order.
    async fn list_parts(&self, job_id: &str) -> Result<Vec<Part>, DbError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY NOT NULL,
    doc TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS parts (
    job_id TEXT NOT NULL,
    part_id INTEGER NOT NULL,
    doc TEXT NOT NULL,
    PRIMARY KEY (job_id, part_id)
);
";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        f(&conn)
    }
}

fn upsert_part(conn: &Connection, part: &Part) -> Result<(), DbError> {
    let doc = serde_json::to_string(part)?;
    let written = conn.execute(
        "INSERT INTO parts (job_id, part_id, doc) VALUES (?1, ?2, ?3)
         ON CONFLICT (job_id, part_id) DO UPDATE SET doc = excluded.doc",
        params![part.job_id, part.id, doc],
    )?;
    if written != 1 {
        return Err(DbError::WriteFailed);
    }
    Ok(())
}

#[async_trait]
impl Repository for Database {
    async fn get_job(&self, id: &str) -> Result<Job, DbError> {
        self.with_conn(|conn| {
            let doc: Option<String> = conn
                .query_row("SELECT doc FROM jobs WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .optional()?;
            match doc {
                Some(doc) => Ok(serde_json::from_str(&doc)?),
                None => Err(DbError::NotFound),
            }
        })
    }

    async fn put_job(&self, job: &Job) -> Result<(), DbError> {
        let doc = serde_json::to_string(job)?;
        self.with_conn(|conn| {
            let written = conn.execute(
                "INSERT INTO jobs (id, doc) VALUES (?1, ?2)
                 ON CONFLICT (id) DO UPDATE SET doc = excluded.doc",
                params![job.id, doc],
            )?;
            if written != 1 {
                return Err(DbError::WriteFailed);
            }
            Ok(())
        })
    }

    async fn delete_job(&self, id: &str) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM parts WHERE job_id = ?1", params![id])?;
            let deleted = tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(DbError::NotFound);
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT doc FROM jobs ORDER BY id")?;
            let docs = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            docs.iter()
                .map(|doc| serde_json::from_str(doc).map_err(DbError::from))
                .collect()
        })
    }

    async fn put_part(&self, part: &Part) -> Result<(), DbError> {
        self.with_conn(|conn| upsert_part(conn, part))
    }

    async fn put_parts(&self, parts: &[Part]) -> Result<(), DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for part in parts {
                upsert_part(&tx, part)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn get_part(&self, job_id: &str, part_id: u32) -> Result<Part, DbError> {
        self.with_conn(|conn| {
            let doc: Option<String> = conn
                .query_row(
                    "SELECT doc FROM parts WHERE job_id = ?1 AND part_id = ?2",
                    params![job_id, part_id],
                    |r| r.get(0),
                )
                .optional()?;
            match doc {
                Some(doc) => Ok(serde_json::from_str(&doc)?),
                None => Err(DbError::NotFound),
            }
        })
    }

    async fn list_parts(&self, job_id: &str) -> Result<Vec<Part>, DbError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT doc FROM parts WHERE job_id = ?1 ORDER BY part_id")?;
            let docs = stmt
                .query_map(params![job_id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            docs.iter()
                .map(|doc| serde_json::from_str(doc).map_err(DbError::from))
                .collect()
        })
    }
}
