//! Document store: one SQLite file plus a sibling `files/` directory
//! for binary blobs named `{id}{ext}`.
//!
//! Errors are three-valued at the API: `Err` is a storage failure
//! (HTTP 500), `Ok(None)` / `Ok(false)` is an absent document or a key
//! mismatch (404/403), `Ok(Some(..))` / `Ok(true)` is success.
//!
//! The schema is migrated at open: older databases may lack the
//! `type`/`key`/`created`/`modified` columns; missing ones are added
//! and backfilled, and a trigger keeps `modified` current on update.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("file storage error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A shared-writer grant on a document.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Writer {
    pub token: String,
    pub timestamp: String,
    pub hint: String,
}

#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
    files_dir: PathBuf,
}

impl Storage {
    /// Open (creating and migrating as needed) the database at
    /// `db_path`, with blobs in `files_dir_name` next to it unless the
    /// name is an absolute or explicitly relative path.
    pub fn open(db_path: impl Into<PathBuf>, files_dir_name: &str) -> StorageResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let files_dir = resolve_files_dir(&db_path, files_dir_name);
        std::fs::create_dir_all(&files_dir)?;

        let storage = Self { db_path, files_dir };
        storage.init_schema()?;
        info!(
            db = %storage.db_path.display(),
            files = %storage.files_dir.display(),
            "document store ready"
        );
        Ok(storage)
    }

    fn conn(&self) -> StorageResult<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS documents (
              id TEXT PRIMARY KEY,
              key TEXT,
              type TEXT,
              created TEXT DEFAULT CURRENT_TIMESTAMP,
              modified TEXT DEFAULT CURRENT_TIMESTAMP,
              data TEXT
            );
            "#,
        )?;

        let columns = table_columns(&conn, "documents")?;

        if !columns.iter().any(|c| c == "type") {
            info!("upgrading database: documents(type)");
            conn.execute_batch("ALTER TABLE documents ADD COLUMN type TEXT;")?;
        }

        if !columns.iter().any(|c| c == "key") {
            info!("upgrading database: documents(key)");
            conn.execute_batch("ALTER TABLE documents ADD COLUMN key TEXT;")?;
        }

        if !columns.iter().any(|c| c == "created") {
            info!("upgrading database: documents(created)");
            conn.execute_batch(
                r#"
                ALTER TABLE documents ADD COLUMN created TEXT;
                UPDATE documents SET created = CURRENT_TIMESTAMP WHERE created IS NULL;
                CREATE TRIGGER set_document_created_timestamp
                AFTER INSERT ON documents
                FOR EACH ROW
                WHEN (NEW.created IS NULL)
                BEGIN
                    UPDATE documents SET created = CURRENT_TIMESTAMP WHERE rowid = NEW.rowid;
                END;
                "#,
            )?;
        }

        if !columns.iter().any(|c| c == "modified") {
            info!("upgrading database: documents(modified)");
            conn.execute_batch(
                r#"
                ALTER TABLE documents ADD COLUMN modified TEXT;
                UPDATE documents SET modified = created WHERE modified IS NULL;
                "#,
            )?;
        }

        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS documents_index ON documents (id);

            -- Fires on every update; writers never touch `modified`
            -- themselves. SQLite runs without recursive triggers, so
            -- the inner UPDATE does not re-enter.
            CREATE TRIGGER IF NOT EXISTS update_documents_modified
            AFTER UPDATE ON documents
            FOR EACH ROW
            BEGIN
                UPDATE documents SET modified = CURRENT_TIMESTAMP WHERE id = OLD.id;
            END;

            CREATE TABLE IF NOT EXISTS shared_document_writers (
              document_id TEXT,
              token TEXT,
              timestamp TEXT DEFAULT CURRENT_TIMESTAMP,
              hint TEXT
            );

            CREATE INDEX IF NOT EXISTS shared_document_writers_index_document_id
              ON shared_document_writers (document_id);
            CREATE INDEX IF NOT EXISTS shared_document_writers_index_token
              ON shared_document_writers (document_id, token);
            "#,
        )?;

        Ok(())
    }

    // ── Documents ───────────────────────────────────────────────────

    /// Upsert a document. The key stored with the document is its
    /// owner key. Re-putting an existing id replaces type/key/data but
    /// keeps the original `created` timestamp.
    pub fn put(&self, id: &str, data: &str, key: &str, doc_type: &str) -> StorageResult<()> {
        debug!(id, "storing document");
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO documents (id, type, key, data) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                key = excluded.key,
                data = excluded.data
            "#,
            params![id, doc_type, key, data],
        )?;
        Ok(())
    }

    /// Fetch `(type, data)`.
    pub fn get(&self, id: &str) -> StorageResult<Option<(String, String)>> {
        debug!(id, "getting document");
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT type, data FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    let doc_type: Option<String> = row.get(0)?;
                    let data: Option<String> = row.get(1)?;
                    Ok((
                        doc_type.unwrap_or_else(|| "json".into()),
                        data.unwrap_or_default(),
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    fn owner_key(&self, id: &str) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                "SELECT coalesce(key, '') FROM documents WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(key)
    }

    /// String equality of `key` against the stored owner key;
    /// `Ok(None)` when the document does not exist.
    pub fn check_owner(&self, id: &str, key: &str) -> StorageResult<Option<bool>> {
        debug!(id, "checking owner key");
        Ok(self.owner_key(id)?.map(|owner| owner == key))
    }

    /// Delete iff the owner key matches, then delete all companion
    /// files with stem = id. `Ok(false)` when nothing matched.
    pub fn remove(&self, id: &str, key: &str) -> StorageResult<bool> {
        debug!(id, "removing document");
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM documents WHERE id = ?1 AND coalesce(key, '') = ?2",
            params![id, key],
        )?;
        if deleted == 0 {
            return Ok(false);
        }
        conn.execute(
            "DELETE FROM shared_document_writers WHERE document_id = ?1",
            params![id],
        )?;
        self.remove_files(id)?;
        Ok(true)
    }

    /// Update the data of a document on behalf of a shared writer.
    /// `access_token` must equal `sha256_hex(id ‖ owner_key)`.
    pub fn update(&self, id: &str, data: &str, access_token: &str) -> StorageResult<Option<bool>> {
        debug!(id, "updating document");
        let Some(owner) = self.owner_key(id)? else {
            return Ok(None);
        };
        if access_token != access_token_for(id, &owner) {
            return Ok(Some(false));
        }
        let conn = self.conn()?;
        conn.execute(
            "UPDATE documents SET data = ?1 WHERE id = ?2",
            params![data, id],
        )?;
        Ok(Some(true))
    }

    // ── Shared writers ──────────────────────────────────────────────

    /// Grant write access to the holder of `new_key`. The caller
    /// proves ownership with `access_token = sha256_hex(id ‖ owner_key)`.
    pub fn add_writer(
        &self,
        id: &str,
        access_token: &str,
        new_key: &str,
        hint: &str,
    ) -> StorageResult<Option<bool>> {
        let Some(owner) = self.owner_key(id)? else {
            return Ok(None);
        };
        if access_token != access_token_for(id, &owner) {
            return Ok(Some(false));
        }

        let token = access_token_for(id, new_key);
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO shared_document_writers (document_id, token, hint)
             VALUES (?1, ?2, ?3)",
            params![id, token, hint],
        )?;
        Ok(Some(true))
    }

    /// Whether `key` is a granted writer key for the document.
    pub fn check_writer(&self, id: &str, key: &str) -> StorageResult<bool> {
        debug!(id, "checking writer key");
        let token = access_token_for(id, key);
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM shared_document_writers WHERE document_id = ?1 AND token = ?2",
            params![id, token],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All writer grants; requires the owner key. `Ok(None)` covers
    /// both an absent document and a key mismatch, so callers cannot
    /// probe for document existence.
    pub fn list_writers(&self, id: &str, owner_key: &str) -> StorageResult<Option<Vec<Writer>>> {
        let Some(owner) = self.owner_key(id)? else {
            return Ok(None);
        };
        if owner != owner_key {
            return Ok(None);
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT token, timestamp, hint FROM shared_document_writers WHERE document_id = ?1",
        )?;
        let writers = stmt
            .query_map(params![id], |row| {
                Ok(Writer {
                    token: row.get(0)?,
                    timestamp: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    hint: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(writers))
    }

    /// Revoke a writer grant; requires the owner key.
    pub fn remove_writer(
        &self,
        id: &str,
        token: &str,
        owner_key: &str,
    ) -> StorageResult<Option<bool>> {
        let Some(owner) = self.owner_key(id)? else {
            return Ok(None);
        };
        if owner != owner_key {
            return Ok(Some(false));
        }
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM shared_document_writers WHERE document_id = ?1 AND token = ?2",
            params![id, token],
        )?;
        Ok(Some(true))
    }

    /// Re-label a writer grant; requires the owner key.
    pub fn update_writer_hint(
        &self,
        id: &str,
        token: &str,
        owner_key: &str,
        hint: &str,
    ) -> StorageResult<Option<bool>> {
        let Some(owner) = self.owner_key(id)? else {
            return Ok(None);
        };
        if owner != owner_key {
            return Ok(Some(false));
        }
        let conn = self.conn()?;
        conn.execute(
            "UPDATE shared_document_writers SET hint = ?1 WHERE document_id = ?2 AND token = ?3",
            params![hint, id, token],
        )?;
        Ok(Some(true))
    }

    // ── Companion files ─────────────────────────────────────────────

    pub fn put_file(&self, id: &str, data: &[u8], extension: &str) -> StorageResult<()> {
        let path = self.file_path(id, extension);
        debug!(path = %path.display(), "storing file");
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn get_file(&self, id: &str, extension: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.file_path(id, extension);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// `Ok(false)` when the file did not exist.
    pub fn remove_file(&self, id: &str, extension: &str) -> StorageResult<bool> {
        let path = self.file_path(id, extension);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every file whose stem equals `id`, regardless of
    /// extension. Succeeds when there is nothing to delete; fails only
    /// when a deletion errors.
    pub fn remove_files(&self, id: &str) -> StorageResult<()> {
        for entry in std::fs::read_dir(&self.files_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let stem_matches = path
                .file_stem()
                .map(|stem| stem.to_string_lossy() == id)
                .unwrap_or(false);
            if stem_matches {
                debug!(path = %path.display(), "removing companion file");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to remove companion file: {e}");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn file_path(&self, id: &str, extension: &str) -> PathBuf {
        // Ids are opaque tokens; never let one escape the files dir.
        let safe: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect();
        self.files_dir.join(format!("{safe}{extension}"))
    }
}

/// `sha256_hex(id ‖ key)` — both the owner access token and the stored
/// writer token.
pub fn access_token_for(id: &str, key: &str) -> String {
    use std::fmt::Write;

    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn table_columns(conn: &Connection, table: &str) -> StorageResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn resolve_files_dir(db_path: &Path, files_dir_name: &str) -> PathBuf {
    let as_path = Path::new(files_dir_name);
    if as_path.is_absolute()
        || files_dir_name.starts_with("./")
        || files_dir_name.starts_with("../")
    {
        return as_path.to_path_buf();
    }
    db_path
        .parent()
        .map(|parent| parent.join(files_dir_name))
        .unwrap_or_else(|| as_path.to_path_buf())
}
