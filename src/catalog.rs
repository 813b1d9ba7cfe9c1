//! SQLite catalog of screenshots and user collections.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::prompt::StructuredAnalysis;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Structured,
    /// Raw OCR/description text only; the LLM was not available.
    Fallback,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Structured => "structured",
            AnalysisStatus::Fallback => "fallback",
        }
    }

    fn from_db(value: &str) -> Self {
        match value {
            "structured" => AnalysisStatus::Structured,
            "fallback" => AnalysisStatus::Fallback,
            _ => AnalysisStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub uri: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Vec<String>,
    pub source_app: Option<String>,
    pub ignored: bool,
    pub analysis: AnalysisStatus,
    /// Milliseconds since the epoch, as reported by the media index.
    pub last_modified: i64,
    pub added_at: i64,
}

impl ImageRecord {
    /// A freshly discovered, unanalyzed screenshot.
    pub fn new(uri: impl Into<String>, last_modified: i64) -> Self {
        Self {
            uri: uri.into(),
            title: None,
            content: None,
            tags: Vec::new(),
            source_app: None,
            ignored: false,
            analysis: AnalysisStatus::Pending,
            last_modified,
            added_at: now_millis(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub image_count: usize,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS images (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        uri             TEXT NOT NULL UNIQUE,
        title           TEXT,
        content         TEXT,
        tags            TEXT NOT NULL DEFAULT '[]',
        source_app      TEXT,
        ignored         INTEGER NOT NULL DEFAULT 0,
        analysis        TEXT NOT NULL DEFAULT 'pending',
        last_modified   INTEGER NOT NULL,
        added_at        INTEGER NOT NULL,
        analyzed_at     INTEGER
    );

    CREATE TABLE IF NOT EXISTS collections (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        name            TEXT NOT NULL UNIQUE,
        created_at      INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS image_collections (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        image_uri       TEXT NOT NULL REFERENCES images(uri) ON DELETE CASCADE ON UPDATE CASCADE,
        collection_id   INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
        added_at        INTEGER NOT NULL,
        UNIQUE(image_uri, collection_id)
    );

    CREATE INDEX IF NOT EXISTS idx_images_analysis ON images(analysis, ignored);
    CREATE INDEX IF NOT EXISTS idx_image_collections_collection
        ON image_collections(collection_id, seq);
";

const IMAGE_COLUMNS: &str =
    "i.uri, i.title, i.content, i.tags, i.source_app, i.ignored, i.analysis, i.last_modified, i.added_at";

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let tags: String = row.get(3)?;
    let analysis: String = row.get(6)?;
    Ok(ImageRecord {
        uri: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        source_app: row.get(4)?,
        ignored: row.get(5)?,
        analysis: AnalysisStatus::from_db(&analysis),
        last_modified: row.get(7)?,
        added_at: row.get(8)?,
    })
}

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<Collection> {
    let count: i64 = row.get(3)?;
    Ok(Collection {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        image_count: count as usize,
    })
}

fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

/// Durable, URI-keyed store of screenshots. Writes are last-writer-wins.
pub struct Catalog {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Catalog {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        info!("catalog opened at {}", db_path.display());
        Self::init(conn, Some(db_path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn query_images(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ImageRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, record_from_row)?;
        let mut images = Vec::new();
        for image in rows {
            images.push(image?);
        }
        Ok(images)
    }

    fn ensure_image(conn: &Connection, uri: &str) -> Result<()> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM images WHERE uri = ?1)",
            [uri],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(Error::NotFound(format!("image {uri}")))
        }
    }

    fn ensure_collection(conn: &Connection, collection_id: i64) -> Result<()> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM collections WHERE id = ?1)",
            [collection_id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(Error::NotFound(format!("collection {collection_id}")))
        }
    }

    pub fn image_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Inserts a default record unless the URI is already known. Existing
    /// rows, ignored ones included, are left exactly as they are.
    pub fn insert_if_absent(&self, uri: &str, last_modified: i64) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO images (uri, last_modified, added_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(uri) DO NOTHING",
            params![uri, last_modified, now_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Writes every field of `record`, creating the row if needed.
    pub fn upsert(&self, record: &ImageRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO images (uri, title, content, tags, source_app, ignored, analysis, last_modified, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(uri) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                tags = excluded.tags,
                source_app = excluded.source_app,
                ignored = excluded.ignored,
                analysis = excluded.analysis,
                last_modified = excluded.last_modified",
            params![
                record.uri,
                record.title,
                record.content,
                encode_tags(&record.tags),
                record.source_app,
                record.ignored,
                record.analysis.as_str(),
                record.last_modified,
                record.added_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, uri: &str) -> Result<Option<ImageRecord>> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images i WHERE i.uri = ?1");
        let record = self
            .conn()
            .query_row(&sql, [uri], record_from_row)
            .optional()?;
        Ok(record)
    }

    /// Visible (not ignored) records, newest insertion first.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images i WHERE i.ignored = 0 ORDER BY i.id DESC");
        self.query_images(&sql, [])
    }

    /// Every record including ignored ones, newest insertion first.
    pub fn list_all(&self) -> Result<Vec<ImageRecord>> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images i ORDER BY i.id DESC");
        self.query_images(&sql, [])
    }

    /// Records still waiting for analysis. Fallback results are included when
    /// `include_fallback` is set, so they can be upgraded once an LLM exists.
    pub fn list_unanalyzed(&self, include_fallback: bool) -> Result<Vec<ImageRecord>> {
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM images i
             WHERE i.ignored = 0 AND (i.analysis = 'pending' OR (?1 AND i.analysis = 'fallback'))
             ORDER BY i.id DESC"
        );
        self.query_images(&sql, [include_fallback])
    }

    /// Case-insensitive match over title, content, source app and tags.
    pub fn search(&self, query: &str) -> Result<Vec<ImageRecord>> {
        let needle = query.trim();
        if needle.is_empty() {
            return self.list();
        }
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM images i
             WHERE i.ignored = 0 AND (
                instr(lower(coalesce(i.title, '')), lower(?1)) > 0
                OR instr(lower(coalesce(i.content, '')), lower(?1)) > 0
                OR instr(lower(coalesce(i.source_app, '')), lower(?1)) > 0
                OR instr(lower(i.tags), lower(?1)) > 0
             )
             ORDER BY i.id DESC"
        );
        self.query_images(&sql, [needle])
    }

    /// Stores an LLM result, overwriting whatever an earlier pass left.
    pub fn apply_structured(&self, uri: &str, analysis: &StructuredAnalysis) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE images SET title = ?1, content = ?2, tags = ?3, source_app = ?4,
                analysis = 'structured', analyzed_at = ?5
             WHERE uri = ?6",
            params![
                analysis.title,
                analysis.summary,
                encode_tags(&analysis.tags),
                analysis.source_app,
                now_millis(),
                uri,
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("image {uri}")));
        }
        debug!("stored structured analysis for {uri}");
        Ok(())
    }

    /// Stores raw text without title or tags. Returns `false` when the record
    /// already holds a structured result, which a fallback never replaces.
    pub fn apply_fallback(&self, uri: &str, content: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE images SET content = ?1, analysis = 'fallback', analyzed_at = ?2
             WHERE uri = ?3 AND analysis != 'structured'",
            params![content, now_millis(), uri],
        )?;
        if changed == 0 {
            Self::ensure_image(&conn, uri)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Clears derived fields so the next batch run analyzes the record again.
    pub fn reset_analysis(&self, uri: &str) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE images SET title = NULL, content = NULL, tags = '[]', source_app = NULL,
                analysis = 'pending', analyzed_at = NULL
             WHERE uri = ?1",
            [uri],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("image {uri}")));
        }
        Ok(())
    }

    /// Logical delete: the file on the device is never touched.
    pub fn set_ignored(&self, uri: &str, ignored: bool) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE images SET ignored = ?1 WHERE uri = ?2",
            params![ignored, uri],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("image {uri}")));
        }
        Ok(())
    }

    pub fn create_collection(&self, name: &str) -> Result<Collection> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("collection name is empty".to_string()));
        }
        if self.find_collection(name)?.is_some() {
            return Err(Error::InvalidInput(format!("collection {name:?} already exists")));
        }

        let created_at = now_millis();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO collections (name, created_at) VALUES (?1, ?2)",
            params![name, created_at],
        )?;
        Ok(Collection {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            created_at,
            image_count: 0,
        })
    }

    pub fn rename_collection(&self, collection_id: i64, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("collection name is empty".to_string()));
        }
        if let Some(existing) = self.find_collection(name)? {
            if existing.id != collection_id {
                return Err(Error::InvalidInput(format!("collection {name:?} already exists")));
            }
        }
        let changed = self.conn().execute(
            "UPDATE collections SET name = ?1 WHERE id = ?2",
            params![name, collection_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("collection {collection_id}")));
        }
        Ok(())
    }

    /// Removes the grouping only; member images stay in the catalog.
    pub fn delete_collection(&self, collection_id: i64) -> Result<()> {
        let changed = self
            .conn()
            .execute("DELETE FROM collections WHERE id = ?1", [collection_id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("collection {collection_id}")));
        }
        Ok(())
    }

    pub fn find_collection(&self, name: &str) -> Result<Option<Collection>> {
        let collection = self
            .conn()
            .query_row(
                "SELECT c.id, c.name, c.created_at, COUNT(ic.seq)
                 FROM collections c LEFT JOIN image_collections ic ON ic.collection_id = c.id
                 WHERE c.name = ?1
                 GROUP BY c.id",
                [name.trim()],
                collection_from_row,
            )
            .optional()?;
        Ok(collection)
    }

    pub fn list_collections(&self) -> Result<Vec<Collection>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.created_at, COUNT(ic.seq)
             FROM collections c LEFT JOIN image_collections ic ON ic.collection_id = c.id
             GROUP BY c.id
             ORDER BY c.id",
        )?;
        let rows = stmt.query_map([], collection_from_row)?;
        let mut collections = Vec::new();
        for collection in rows {
            collections.push(collection?);
        }
        Ok(collections)
    }

    /// Returns `false` if the image was already a member.
    pub fn add_to_collection(&self, collection_id: i64, uri: &str) -> Result<bool> {
        let conn = self.conn();
        Self::ensure_collection(&conn, collection_id)?;
        Self::ensure_image(&conn, uri)?;
        let changed = conn.execute(
            "INSERT INTO image_collections (image_uri, collection_id, added_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(image_uri, collection_id) DO NOTHING",
            params![uri, collection_id, now_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Returns `false` if the image was not a member.
    pub fn remove_from_collection(&self, collection_id: i64, uri: &str) -> Result<bool> {
        let conn = self.conn();
        Self::ensure_collection(&conn, collection_id)?;
        let changed = conn.execute(
            "DELETE FROM image_collections WHERE collection_id = ?1 AND image_uri = ?2",
            params![collection_id, uri],
        )?;
        Ok(changed == 1)
    }

    /// Members of a collection in the order they were added.
    pub fn collection_images(&self, collection_id: i64) -> Result<Vec<ImageRecord>> {
        Self::ensure_collection(&self.conn(), collection_id)?;
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM image_collections ic
             JOIN images i ON i.uri = ic.image_uri
             WHERE ic.collection_id = ?1 AND i.ignored = 0
             ORDER BY ic.seq"
        );
        self.query_images(&sql, [collection_id])
    }

    pub fn collections_for_image(&self, uri: &str) -> Result<Vec<Collection>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.created_at,
                (SELECT COUNT(*) FROM image_collections x WHERE x.collection_id = c.id)
             FROM image_collections ic JOIN collections c ON c.id = ic.collection_id
             WHERE ic.image_uri = ?1
             ORDER BY c.id",
        )?;
        let rows = stmt.query_map([uri], collection_from_row)?;
        let mut collections = Vec::new();
        for collection in rows {
            collections.push(collection?);
        }
        Ok(collections)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis() -> StructuredAnalysis {
        StructuredAnalysis {
            title: "Boarding pass".to_string(),
            summary: "Flight LIS-BER".to_string(),
            source_app: Some("Wallet".to_string()),
            tags: vec!["travel".into(), "flight".into(), "ticket".into()],
        }
    }

    #[test]
    fn insert_if_absent_is_idempotent() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        assert!(catalog.insert_if_absent("content://media/1", 10).expect("insert"));
        assert!(!catalog.insert_if_absent("content://media/1", 99).expect("insert"));
        assert_eq!(catalog.image_count().expect("count"), 1);

        let record = catalog.get("content://media/1").expect("get").expect("record");
        assert_eq!(record.last_modified, 10);
        assert_eq!(record.title, None);
        assert_eq!(record.analysis, AnalysisStatus::Pending);
    }

    #[test]
    fn list_is_newest_first_and_hides_ignored() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        for n in 1..=3 {
            catalog
                .insert_if_absent(&format!("content://media/{n}"), n)
                .expect("insert");
        }
        catalog.set_ignored("content://media/2", true).expect("ignore");

        let uris: Vec<String> = catalog.list().expect("list").into_iter().map(|r| r.uri).collect();
        assert_eq!(uris, vec!["content://media/3", "content://media/1"]);
        assert_eq!(catalog.list_all().expect("list all").len(), 3);
    }

    #[test]
    fn upsert_is_last_writer_wins() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        let mut record = ImageRecord::new("content://media/5", 1);
        record.title = Some("first".into());
        catalog.upsert(&record).expect("upsert");
        record.title = Some("second".into());
        record.tags = vec!["x".into()];
        catalog.upsert(&record).expect("upsert");

        let stored = catalog.get("content://media/5").expect("get").expect("record");
        assert_eq!(stored.title.as_deref(), Some("second"));
        assert_eq!(stored.tags, vec!["x"]);
        assert_eq!(catalog.image_count().expect("count"), 1);
    }

    #[test]
    fn fallback_never_replaces_structured_result() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        catalog.insert_if_absent("content://media/7", 1).expect("insert");

        assert!(catalog.apply_fallback("content://media/7", "raw text").expect("fallback"));
        assert_eq!(catalog.list_unanalyzed(false).expect("pending").len(), 0);
        assert_eq!(catalog.list_unanalyzed(true).expect("pending").len(), 1);

        catalog.apply_structured("content://media/7", &analysis()).expect("structured");
        assert!(!catalog.apply_fallback("content://media/7", "other").expect("fallback"));

        let stored = catalog.get("content://media/7").expect("get").expect("record");
        assert_eq!(stored.analysis, AnalysisStatus::Structured);
        assert_eq!(stored.content.as_deref(), Some("Flight LIS-BER"));
        assert_eq!(stored.source_app.as_deref(), Some("Wallet"));
    }

    #[test]
    fn updates_on_unknown_uri_are_not_found() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        assert!(matches!(
            catalog.apply_structured("content://media/404", &analysis()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            catalog.apply_fallback("content://media/404", "x"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            catalog.set_ignored("content://media/404", true),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn reset_analysis_returns_record_to_pending() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        catalog.insert_if_absent("content://media/8", 1).expect("insert");
        catalog.apply_structured("content://media/8", &analysis()).expect("structured");
        catalog.reset_analysis("content://media/8").expect("reset");

        let stored = catalog.get("content://media/8").expect("get").expect("record");
        assert_eq!(stored.analysis, AnalysisStatus::Pending);
        assert!(stored.tags.is_empty());
        assert_eq!(stored.title, None);
    }

    #[test]
    fn search_matches_tags_and_title() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        catalog.insert_if_absent("content://media/1", 1).expect("insert");
        catalog.insert_if_absent("content://media/2", 2).expect("insert");
        catalog.apply_structured("content://media/1", &analysis()).expect("structured");

        assert_eq!(catalog.search("FLIGHT").expect("search").len(), 1);
        assert_eq!(catalog.search("boarding").expect("search").len(), 1);
        assert_eq!(catalog.search("pizza").expect("search").len(), 0);
        assert_eq!(catalog.search("  ").expect("search").len(), 2);
    }

    #[test]
    fn collection_membership_requires_both_rows() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        let travel = catalog.create_collection("Travel").expect("create");
        assert!(matches!(
            catalog.add_to_collection(travel.id, "content://media/missing"),
            Err(Error::NotFound(_))
        ));
        catalog.insert_if_absent("content://media/1", 1).expect("insert");
        assert!(matches!(
            catalog.add_to_collection(travel.id + 100, "content://media/1"),
            Err(Error::NotFound(_))
        ));
        assert!(catalog.add_to_collection(travel.id, "content://media/1").expect("add"));
        assert!(!catalog.add_to_collection(travel.id, "content://media/1").expect("add again"));
    }

    #[test]
    fn collection_names_are_unique_and_non_empty() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        let work = catalog.create_collection(" Work ").expect("create");
        assert_eq!(work.name, "Work");
        assert!(matches!(catalog.create_collection("Work"), Err(Error::InvalidInput(_))));
        assert!(matches!(catalog.create_collection("   "), Err(Error::InvalidInput(_))));

        let memes = catalog.create_collection("Memes").expect("create");
        assert!(matches!(
            catalog.rename_collection(memes.id, "Work"),
            Err(Error::InvalidInput(_))
        ));
        catalog.rename_collection(memes.id, "Funny").expect("rename");
        assert!(catalog.find_collection("Funny").expect("find").is_some());
    }

    #[test]
    fn deleting_collection_keeps_images() {
        let catalog = Catalog::open_in_memory().expect("catalog");
        catalog.insert_if_absent("content://media/1", 1).expect("insert");
        let c = catalog.create_collection("Receipts").expect("create");
        catalog.add_to_collection(c.id, "content://media/1").expect("add");
        assert_eq!(catalog.collections_for_image("content://media/1").expect("for image").len(), 1);

        catalog.delete_collection(c.id).expect("delete");
        assert!(catalog.list_collections().expect("list").is_empty());
        assert!(catalog.collections_for_image("content://media/1").expect("for image").is_empty());
        assert_eq!(catalog.image_count().expect("count"), 1);
        assert!(matches!(catalog.delete_collection(c.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn open_persists_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("catalog.db");
        {
            let catalog = Catalog::open(&db_path).expect("open");
            catalog.insert_if_absent("content://media/1", 1).expect("insert");
        }
        let reopened = Catalog::open(&db_path).expect("reopen");
        assert_eq!(reopened.image_count().expect("count"), 1);
        assert_eq!(reopened.path(), Some(db_path.as_path()));
    }
}
