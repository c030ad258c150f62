use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

mod memory;
mod record;

pub use memory::MemoryStore;
pub use record::{
    Credentials, Field, FieldError, ImageBlob, ImageSize, ProjectId, ProjectRecord,
    ProjectSummary, RecordError, ValidationErrors,
};

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("nextframe")
}

/// Durable key-value storage of project records, keyed by [`ProjectId`].
///
/// `put` must be atomic: a reader never observes frames from one save mixed
/// with the watermark of another.
pub trait ProjectStore: Send + Sync {
    fn put(&self, id: &ProjectId, record: &ProjectRecord) -> Result<()>;

    fn get(&self, id: &ProjectId) -> Result<Option<ProjectRecord>>;

    /// Returns whether a record was removed.
    fn delete(&self, id: &ProjectId) -> Result<bool>;

    fn list(&self) -> Result<Vec<ProjectSummary>>;
}

/// Rejects records the store must never hold.
pub(crate) fn check_put(id: &ProjectId, record: &ProjectRecord) -> Result<()> {
    if record.id.as_ref() != Some(id) {
        return Err(RecordError::IdMismatch {
            key: id.clone(),
            record: record.id.clone(),
        }
        .into());
    }
    record.check_invariants()?;
    Ok(())
}

/// SQLite-backed project store. Frames are stored inline as BLOBs.
pub struct ProjectDb {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl ProjectDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        let _ = conn.pragma_update(None, "cache_size", &"-20000"); // ~20MB page cache
        apply_migrations(&conn)?;
        debug!(path = %path.display(), "opened project database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Database in the default application data directory.
    pub fn open_default() -> Result<Self> {
        Self::open_or_create(&app_data_dir().join("projects.db"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(tx: &Transaction<'_>, id: &ProjectId, record: &ProjectRecord) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO projects(id, name, credentials, prompt_template, frame_count, width, height, reference_image, last_success_frame, created_at, updated_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, credentials = excluded.credentials, prompt_template = excluded.prompt_template, frame_count = excluded.frame_count, width = excluded.width, height = excluded.height, reference_image = excluded.reference_image, last_success_frame = excluded.last_success_frame, updated_at = excluded.updated_at",
            params![
                id.as_str(),
                record.name,
                record.credentials.expose(),
                record.prompt_template,
                record.frame_count,
                record.size.width,
                record.size.height,
                record.reference_image.as_ref().map(|b| b.as_bytes()),
                record.last_success_frame,
                now,
            ],
        )?;
        tx.execute(
            "DELETE FROM frames WHERE project_id = ?1",
            params![id.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO frames(project_id, frame_index, data, created_at) VALUES(?1, ?2, ?3, ?4)",
            )?;
            for (idx, frame) in record.frames.iter().enumerate() {
                stmt.execute(params![id.as_str(), idx as i64 + 1, frame.as_bytes(), now])?;
            }
        }
        Ok(())
    }

    fn read_frames(conn: &Connection, id: &ProjectId) -> Result<Vec<ImageBlob>> {
        let mut stmt = conn.prepare(
            "SELECT data FROM frames WHERE project_id = ?1 ORDER BY frame_index ASC",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            let data: Vec<u8> = row.get(0)?;
            Ok(ImageBlob::from_bytes(data))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

impl ProjectStore for ProjectDb {
    fn put(&self, id: &ProjectId, record: &ProjectRecord) -> Result<()> {
        check_put(id, record)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::write_record(&tx, id, record)?;
        tx.commit()?;
        debug!(project = %id, frames = record.frames.len(), "saved project");
        Ok(())
    }

    fn get(&self, id: &ProjectId) -> Result<Option<ProjectRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, credentials, prompt_template, frame_count, width, height, reference_image, last_success_frame \
                 FROM projects WHERE id = ?1 LIMIT 1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, Option<Vec<u8>>>(6)?,
                        row.get::<_, u32>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((name, credentials, prompt_template, frame_count, width, height, reference, watermark)) =
            row
        else {
            return Ok(None);
        };
        let frames = Self::read_frames(&conn, id)?;
        Ok(Some(ProjectRecord {
            id: Some(id.clone()),
            name,
            credentials: Credentials::new(credentials),
            prompt_template,
            frame_count,
            size: ImageSize::new(width, height),
            reference_image: reference.map(ImageBlob::from_bytes),
            frames,
            last_success_frame: watermark,
        }))
    }

    fn delete(&self, id: &ProjectId) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM frames WHERE project_id = ?1",
            params![id.as_str()],
        )?;
        let removed = tx.execute("DELETE FROM projects WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        debug!(project = %id, removed, "deleted project");
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<ProjectSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, frame_count, last_success_frame, updated_at FROM projects ORDER BY updated_at DESC, created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProjectSummary {
                id: ProjectId::from(row.get::<_, String>(0)?),
                name: row.get(1)?,
                frame_count: row.get(2)?,
                last_success_frame: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__init"],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ProjectRecord {
        let mut record = ProjectRecord {
            name: "sunrise".to_string(),
            credentials: Credentials::new("sk-abc"),
            prompt_template: "sun rising over hills".to_string(),
            frame_count: 4,
            size: ImageSize::new(512, 512),
            reference_image: Some(ImageBlob::from_bytes(vec![0x89, b'P', b'N', b'G', 0, 1])),
            frames: vec![
                ImageBlob::from_bytes(vec![1, 2, 3]),
                ImageBlob::from_bytes(vec![4, 5, 6, 7]),
            ],
            last_success_frame: 2,
            ..Default::default()
        };
        record.ensure_id();
        record
    }

    fn open_temp() -> (tempfile::TempDir, ProjectDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = ProjectDb::open_or_create(&dir.path().join("nested/projects.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, db) = open_temp();
        let record = sample_record();
        let id = record.id.clone().unwrap();
        db.put(&id, &record).unwrap();
        let loaded = db.get(&id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.credentials.expose(), "sk-abc");
    }

    #[test]
    fn test_put_replaces_frames() {
        let (_dir, db) = open_temp();
        let mut record = sample_record();
        let id = record.id.clone().unwrap();
        db.put(&id, &record).unwrap();

        record.reset_progress();
        record.frames.push(ImageBlob::from_bytes(vec![42]));
        record.last_success_frame = 1;
        db.put(&id, &record).unwrap();

        let loaded = db.get(&id).unwrap().unwrap();
        assert_eq!(loaded.frames, vec![ImageBlob::from_bytes(vec![42])]);
        assert_eq!(loaded.last_success_frame, 1);
    }

    #[test]
    fn test_put_rejects_invalid_records() {
        let (_dir, db) = open_temp();
        let mut record = sample_record();
        let id = record.id.clone().unwrap();

        assert!(db.put(&ProjectId::new(), &record).is_err());

        record.last_success_frame = 3;
        assert!(db.put(&id, &record).is_err());
        assert!(db.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_delete_and_list() {
        let (_dir, db) = open_temp();
        let first = sample_record();
        let mut second = sample_record();
        second.id = None;
        second.name = "sunset".to_string();
        second.ensure_id();

        db.put(first.id.as_ref().unwrap(), &first).unwrap();
        db.put(second.id.as_ref().unwrap(), &second).unwrap();
        let names: Vec<_> = db.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"sunrise".to_string()));

        assert!(db.delete(first.id.as_ref().unwrap()).unwrap());
        assert!(!db.delete(first.id.as_ref().unwrap()).unwrap());
        assert!(db.get(first.id.as_ref().unwrap()).unwrap().is_none());

        let listed = db.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "sunset");
        assert_eq!(listed[0].last_success_frame, 2);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.db");
        let record = sample_record();
        let id = record.id.clone().unwrap();
        {
            let db = ProjectDb::open_or_create(&path).unwrap();
            db.put(&id, &record).unwrap();
        }
        let db = ProjectDb::open_or_create(&path).unwrap();
        assert_eq!(db.get(&id).unwrap(), Some(record));
    }
}
