//! SQLite backend for note storage.
//!
//! This module provides:
//! - `NoteStore`: durable keyed storage of notes, including their embeddings
//! - `NoteUpdate`: partial, atomically applied field update
//! - `embedding`: BLOB conversion and vector similarity

pub mod embedding;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::Error;
use crate::note::{EnrichmentStatus, Note};

pub use self::embedding::{blob_to_vec, cosine_similarity, l2_distance, vec_to_blob};

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum allowed limit for list operations.
const MAX_LIST_LIMIT: usize = 10_000;

const NOTE_COLUMNS: &str = "id, content, embedding, tags, category, context, links, \
                            revision, enrichment, created_at, updated_at";

/// Partial update applied by [`NoteStore::update_fields`].
///
/// `None` leaves a field untouched. `category`/`context` use a nested option so
/// a caller can clear them.
#[derive(Debug, Clone, Default)]
pub struct NoteUpdate {
    /// New content; must be accompanied by `embedding`.
    pub content: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub tags: Option<Vec<String>>,
    pub category: Option<Option<String>>,
    pub context: Option<Option<String>>,
    pub links: Option<Vec<String>>,
    pub enrichment: Option<EnrichmentStatus>,
}

impl NoteUpdate {
    pub fn status(status: EnrichmentStatus) -> Self {
        NoteUpdate {
            enrichment: Some(status),
            ..Default::default()
        }
    }
}

/// Row as stored, before JSON and timestamp decoding.
struct RawNote {
    id: String,
    content: String,
    embedding: Vec<u8>,
    tags: String,
    category: Option<String>,
    context: Option<String>,
    links: String,
    revision: i64,
    enrichment: String,
    created_at: String,
    updated_at: String,
}

impl RawNote {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawNote {
            id: row.get(0)?,
            content: row.get(1)?,
            embedding: row.get(2)?,
            tags: row.get(3)?,
            category: row.get(4)?,
            context: row.get(5)?,
            links: row.get(6)?,
            revision: row.get(7)?,
            enrichment: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_note(self) -> Result<Note> {
        if self.embedding.len() % 4 != 0 {
            return Err(Error::InvalidEmbedding(format!(
                "stored embedding for {} has {} bytes, not a multiple of 4",
                self.id,
                self.embedding.len()
            )));
        }
        let dims = self.embedding.len() / 4;
        Ok(Note {
            embedding: blob_to_vec(&self.embedding, dims)?,
            tags: serde_json::from_str(&self.tags)?,
            links: serde_json::from_str(&self.links)?,
            revision: self.revision.max(1) as u64,
            enrichment: self.enrichment.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            content: self.content,
            category: self.category,
            context: self.context,
            similarity: None,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Validate list limit is within acceptable bounds.
pub fn validate_limit(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(Error::InvalidLimit(
            "Limit must be greater than 0".to_string(),
        ));
    }
    if limit > MAX_LIST_LIMIT {
        return Err(Error::InvalidLimit(format!(
            "Limit {} exceeds maximum allowed ({})",
            limit, MAX_LIST_LIMIT
        )));
    }
    Ok(())
}

/// Initialize database schema.
fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            category TEXT,
            context TEXT,
            links TEXT NOT NULL DEFAULT '[]',
            revision INTEGER NOT NULL DEFAULT 1,
            enrichment TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notes_enrichment ON notes(enrichment);
        CREATE INDEX IF NOT EXISTS idx_notes_created ON notes(created_at);

        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Durable note storage backed by a single SQLite connection.
///
/// The connection sits behind a mutex, so every call (and every partial
/// update, which runs in its own transaction) is serialized.
pub struct NoteStore {
    conn: Mutex<Connection>,
}

impl NoteStore {
    /// Open or create a note store at the given path.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or schema initialization fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory store (nothing survives the process).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new note.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateId` if a note with the same id exists; the
    /// existing row is left untouched.
    pub fn put(&self, note: &Note) -> Result<()> {
        let blob = vec_to_blob(&note.embedding, note.embedding.len())?;
        let tags = serde_json::to_string(&note.tags)?;
        let links = serde_json::to_string(&note.links)?;

        let conn = self.conn.lock();
        let result = conn.execute(
            r#"
            INSERT INTO notes (id, content, embedding, tags, category, context, links,
                               revision, enrichment, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                &note.id,
                &note.content,
                &blob,
                &tags,
                &note.category,
                &note.context,
                &links,
                note.revision as i64,
                note.enrichment.as_str(),
                format_timestamp(&note.created_at),
                format_timestamp(&note.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::DuplicateId(note.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retrieve a single note by ID.
    ///
    /// Returns None if the note does not exist.
    pub fn get(&self, id: &str) -> Result<Option<Note>> {
        let conn = self.conn.lock();
        Self::get_locked(&conn, id)
    }

    fn get_locked(conn: &Connection, id: &str) -> Result<Option<Note>> {
        let raw = conn
            .query_row(
                &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"),
                [id],
                RawNote::from_row,
            )
            .optional()?;
        raw.map(RawNote::into_note).transpose()
    }

    /// Delete a note by ID.
    ///
    /// Returns true if a note was deleted, false if it didn't exist.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .execute("DELETE FROM notes WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    /// Apply a partial update atomically and return the merged note.
    ///
    /// Only supplied fields change; `updated_at` is always refreshed and
    /// `revision` is bumped when content changes. Returns `None` if the note
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if content is supplied without an embedding.
    pub fn update_fields(&self, id: &str, update: NoteUpdate) -> Result<Option<Note>> {
        if update.content.is_some() != update.embedding.is_some() {
            return Err(Error::Validation(
                "content and embedding must be updated together".to_string(),
            ));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(mut note) = Self::get_locked(&tx, id)? else {
            return Ok(None);
        };

        if let (Some(content), Some(embedding)) = (update.content, update.embedding) {
            note.content = content;
            note.embedding = embedding;
            note.revision += 1;
        }
        if let Some(tags) = update.tags {
            note.tags = tags;
        }
        if let Some(category) = update.category {
            note.category = category;
        }
        if let Some(context) = update.context {
            note.context = context;
        }
        if let Some(links) = update.links {
            note.links = links;
        }
        if let Some(status) = update.enrichment {
            note.enrichment = status;
        }
        note.updated_at = Utc::now()
            .trunc_subsecs(6)
            .max(note.updated_at + Duration::microseconds(1));

        let blob = vec_to_blob(&note.embedding, note.embedding.len())?;
        tx.execute(
            r#"
            UPDATE notes
            SET content = ?1, embedding = ?2, tags = ?3, category = ?4, context = ?5,
                links = ?6, revision = ?7, enrichment = ?8, updated_at = ?9
            WHERE id = ?10
            "#,
            params![
                &note.content,
                &blob,
                serde_json::to_string(&note.tags)?,
                &note.category,
                &note.context,
                serde_json::to_string(&note.links)?,
                note.revision as i64,
                note.enrichment.as_str(),
                format_timestamp(&note.updated_at),
                id,
            ],
        )?;
        tx.commit()?;

        Ok(Some(note))
    }

    /// All notes, oldest first.
    pub fn list(&self) -> Result<Vec<Note>> {
        self.query_notes(
            &format!("SELECT {NOTE_COLUMNS} FROM notes ORDER BY created_at ASC, rowid ASC"),
            params![],
        )
    }

    /// Most recent notes, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the limit is invalid or the query fails.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Note>> {
        validate_limit(limit)?;
        self.query_notes(
            &format!(
                "SELECT {NOTE_COLUMNS} FROM notes ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    fn query_notes<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Note>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawNote::from_row)?
            .collect::<rusqlite::Result<Vec<RawNote>>>()?;
        raws.into_iter().map(RawNote::into_note).collect()
    }

    /// Number of stored notes.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Current revision of every note, keyed by id.
    pub fn revisions(&self) -> Result<HashMap<String, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, revision FROM notes")?;
        let revisions = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(1) as u64))
            })?
            .collect::<rusqlite::Result<HashMap<String, u64>>>()?;
        Ok(revisions)
    }

    /// Subset of `ids` that exist in the store.
    pub fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        // One JSON parameter keeps large link sets under SQLite's variable limit.
        let ids = serde_json::to_string(ids)?;
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id FROM notes WHERE id IN (SELECT value FROM json_each(?1))")?;
        let found = stmt
            .query_map([ids], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(found)
    }

    /// `(id, revision, embedding)` for every note, used to rebuild the index.
    pub fn embeddings(&self) -> Result<Vec<(String, u64, Vec<f32>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, revision, embedding FROM notes ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, revision, blob)| {
                let vec = blob_to_vec(&blob, blob.len() / 4)?;
                Ok((id, revision.max(1) as u64, vec))
            })
            .collect()
    }

    /// Ids of notes whose enrichment never reached a terminal state.
    pub fn pending_enrichment(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM notes WHERE enrichment IN ('pending', 'enriching') ORDER BY rowid",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Read a store-level metadata value.
    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Write a store-level metadata value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, NoteStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let store = NoteStore::open(&path).unwrap();
        (dir, store)
    }

    fn note(content: &str) -> Note {
        Note::new(content.to_string(), vec![0.1f32; 8], Vec::new(), None)
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, store) = create_test_store();
        let mut n = note("test content");
        n.tags = vec!["a".to_string(), "b".to_string()];
        n.category = Some("Principles".to_string());
        store.put(&n).unwrap();

        let stored = store.get(&n.id).unwrap().unwrap();
        assert_eq!(stored.content, "test content");
        assert_eq!(stored.embedding, vec![0.1f32; 8]);
        assert_eq!(stored.tags, n.tags);
        assert_eq!(stored.category.as_deref(), Some("Principles"));
        assert_eq!(stored.enrichment, EnrichmentStatus::Pending);
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.created_at, n.created_at);
    }

    #[test]
    fn test_put_duplicate_id_fails_without_overwrite() {
        let (_dir, store) = create_test_store();
        let n = note("original");
        store.put(&n).unwrap();

        let mut dup = note("impostor");
        dup.id = n.id.clone();
        assert!(matches!(store.put(&dup), Err(Error::DuplicateId(_))));
        assert_eq!(store.get(&n.id).unwrap().unwrap().content, "original");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let (_dir, store) = create_test_store();
        assert!(store.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_update_fields_is_partial() {
        let (_dir, store) = create_test_store();
        let mut n = note("content");
        n.tags = vec!["keep".to_string()];
        store.put(&n).unwrap();

        let updated = store
            .update_fields(
                &n.id,
                NoteUpdate {
                    context: Some(Some("summary".to_string())),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        assert_eq!(updated.context.as_deref(), Some("summary"));
        assert_eq!(updated.tags, vec!["keep".to_string()]);
        assert_eq!(updated.content, "content");
        assert_eq!(updated.revision, 1);
        assert!(updated.updated_at > n.updated_at);
        assert_eq!(updated.created_at, n.created_at);

        let stored = store.get(&n.id).unwrap().unwrap();
        assert_eq!(stored.context.as_deref(), Some("summary"));
    }

    #[test]
    fn test_update_content_bumps_revision() {
        let (_dir, store) = create_test_store();
        let n = note("before");
        store.put(&n).unwrap();

        let updated = store
            .update_fields(
                &n.id,
                NoteUpdate {
                    content: Some("after".to_string()),
                    embedding: Some(vec![0.9f32; 8]),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.embedding, vec![0.9f32; 8]);
    }

    #[test]
    fn test_update_content_without_embedding_rejected() {
        let (_dir, store) = create_test_store();
        let n = note("before");
        store.put(&n).unwrap();

        let result = store.update_fields(
            &n.id,
            NoteUpdate {
                content: Some("after".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(store.get(&n.id).unwrap().unwrap().content, "before");
    }

    #[test]
    fn test_update_nonexistent() {
        let (_dir, store) = create_test_store();
        let result = store
            .update_fields("nonexistent", NoteUpdate::status(EnrichmentStatus::Enriched))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = create_test_store();
        let n = note("content");
        store.put(&n).unwrap();

        assert!(store.delete(&n.id).unwrap());
        assert!(store.get(&n.id).unwrap().is_none());
        assert!(!store.delete(&n.id).unwrap());
    }

    #[test]
    fn test_list_ordering() {
        let (_dir, store) = create_test_store();
        let mut first = note("first");
        first.created_at = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let mut second = note("second");
        second.created_at = parse_timestamp("2024-01-02T00:00:00Z").unwrap();
        store.put(&second).unwrap();
        store.put(&first).unwrap();

        let all = store.list().unwrap();
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);

        let recent = store.list_recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, second.id);
    }

    #[test]
    fn test_list_recent_limit_validated() {
        let (_dir, store) = create_test_store();
        assert!(matches!(store.list_recent(0), Err(Error::InvalidLimit(_))));
        assert!(matches!(
            store.list_recent(MAX_LIST_LIMIT + 1),
            Err(Error::InvalidLimit(_))
        ));
    }

    #[test]
    fn test_existing_ids_and_embeddings() {
        let (_dir, store) = create_test_store();
        let a = note("a");
        let b = note("b");
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        let found = store
            .existing_ids(&[a.id.clone(), "missing".to_string()])
            .unwrap();
        assert!(found.contains(&a.id));
        assert_eq!(found.len(), 1);

        let embeddings = store.embeddings().unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].0, a.id);
        assert_eq!(embeddings[0].1, 1);

        let revisions = store.revisions().unwrap();
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions.get(&b.id), Some(&1));
    }

    #[test]
    fn test_existing_ids_beyond_sql_variable_limit() {
        let (_dir, store) = create_test_store();
        let a = note("a");
        store.put(&a).unwrap();

        let mut ids: Vec<String> = (0..40_000).map(|i| format!("missing-{i}")).collect();
        ids.push(a.id.clone());
        let found = store.existing_ids(&ids).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains(&a.id));
    }

    #[test]
    fn test_pending_enrichment() {
        let (_dir, store) = create_test_store();
        let a = note("a");
        let b = note("b");
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        store
            .update_fields(&b.id, NoteUpdate::status(EnrichmentStatus::Enriched))
            .unwrap();

        assert_eq!(store.pending_enrichment().unwrap(), vec![a.id]);
    }

    #[test]
    fn test_meta_upsert() {
        let (_dir, store) = create_test_store();
        assert!(store.meta("dimensions").unwrap().is_none());
        store.set_meta("dimensions", "384").unwrap();
        store.set_meta("dimensions", "768").unwrap();
        assert_eq!(store.meta("dimensions").unwrap().as_deref(), Some("768"));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let n = note("durable");
        {
            let store = NoteStore::open(&path).unwrap();
            store.put(&n).unwrap();
        }
        let store = NoteStore::open(&path).unwrap();
        assert_eq!(store.get(&n.id).unwrap().unwrap().content, "durable");
    }
}
