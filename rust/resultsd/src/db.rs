use crate::error::Result;
use crate::model::{Index, UploadBatch};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, warn};

pub const DB_FILE_NAME: &str = "results.sqlite3";
pub const STUDENT_DATA_KEY: &str = "studentData";
pub const RESULT_UPLOADS_KEY: &str = "resultUploads";

/// Durable home of the identifier index and the upload history.
///
/// Loads never fail on a corrupt payload: they log and return empty data.
/// Saves overwrite the whole entry in one statement; `save_state` writes both
/// entries or neither.
pub trait RecordStore {
    fn load_batches(&self) -> Result<Vec<UploadBatch>>;
    fn save_batches(&mut self, batches: &[UploadBatch]) -> Result<()>;
    fn load_index(&self) -> Result<Index>;
    #[allow(dead_code)]
    fn save_index(&mut self, index: &Index) -> Result<()>;
    fn save_state(&mut self, index: &Index, batches: &[UploadBatch]) -> Result<()>;
}

pub struct SqliteStore {
    conn: Connection,
}

pub fn open_db(workspace: &Path) -> anyhow::Result<SqliteStore> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    SqliteStore::init(conn)
}

impl SqliteStore {
    #[allow(dead_code)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv(
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    pub fn close(self) -> anyhow::Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| anyhow::anyhow!("failed to close database: {e}"))
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let v = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        write_kv(&self.conn, key, value)
    }

    fn load_json<T: serde::de::DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(T::default());
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(key, error = %e, "stored payload is not parseable; treating as empty");
                Ok(T::default())
            }
        }
    }
}

fn write_kv(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kv(key, value, updated_at) VALUES(?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        (key, value, chrono::Utc::now().to_rfc3339()),
    )?;
    debug!(key, bytes = value.len(), "kv entry written");
    Ok(())
}

impl RecordStore for SqliteStore {
    fn load_batches(&self) -> Result<Vec<UploadBatch>> {
        self.load_json(RESULT_UPLOADS_KEY)
    }

    fn save_batches(&mut self, batches: &[UploadBatch]) -> Result<()> {
        let raw = serde_json::to_string(batches)?;
        self.set_raw(RESULT_UPLOADS_KEY, &raw)
    }

    fn load_index(&self) -> Result<Index> {
        self.load_json(STUDENT_DATA_KEY)
    }

    fn save_index(&mut self, index: &Index) -> Result<()> {
        let raw = serde_json::to_string(index)?;
        self.set_raw(STUDENT_DATA_KEY, &raw)
    }

    fn save_state(&mut self, index: &Index, batches: &[UploadBatch]) -> Result<()> {
        let index_raw = serde_json::to_string(index)?;
        let batches_raw = serde_json::to_string(batches)?;
        let tx = self.conn.unchecked_transaction()?;
        write_kv(&tx, STUDENT_DATA_KEY, &index_raw)?;
        write_kv(&tx, RESULT_UPLOADS_KEY, &batches_raw)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultsError;
    use crate::model::{BatchStatus, StudentRecord};
    use crate::results::ResultService;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn record() -> StudentRecord {
        StudentRecord {
            sol_roll_no: "00-0-00-123456".into(),
            exam_roll_no: "987654321098".into(),
            name: "Rahul Sharma".into(),
            course: "B.Com (Hons)".into(),
            semester: None,
            session: None,
            subjects: vec![],
        }
    }

    #[test]
    fn empty_store_loads_empty() {
        let store = SqliteStore::open_in_memory().expect("open store");
        assert!(store.load_index().expect("load index").is_empty());
        assert!(store.load_batches().expect("load batches").is_empty());
    }

    #[test]
    fn corrupt_payload_is_treated_as_empty() {
        let store = SqliteStore::open_in_memory().expect("open store");
        store.set_raw(STUDENT_DATA_KEY, "{not json").expect("write");
        store.set_raw(RESULT_UPLOADS_KEY, "[1,2,").expect("write");
        assert!(store.load_index().expect("load index").is_empty());
        assert!(store.load_batches().expect("load batches").is_empty());
    }

    #[test]
    fn index_is_stored_as_pair_sequence() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut index = Index::new();
        index.insert_record(&record());
        store.save_index(&index).expect("save index");

        let raw = store
            .get_raw(STUDENT_DATA_KEY)
            .expect("read")
            .expect("present");
        let v: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(v.as_array().map(|a| a.len()), Some(2));
        assert_eq!(store.load_index().expect("load index"), index);
    }

    fn batch(id: &str) -> UploadBatch {
        UploadBatch {
            id: id.into(),
            filename: format!("{id}.csv"),
            uploaded_at: chrono::Utc::now(),
            records: 1,
            status: BatchStatus::Complete,
            batch_name: "BA 2023-24".into(),
            course_type: "Internal Assessment".into(),
            sha256: None,
            message: None,
            student_records: vec![record()],
        }
    }

    fn reject_history_writes(store: &SqliteStore) {
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_history_insert BEFORE INSERT ON kv
                 WHEN NEW.key = 'resultUploads'
                 BEGIN SELECT RAISE(ABORT, 'history write rejected'); END;
                 CREATE TRIGGER reject_history_update BEFORE UPDATE ON kv
                 WHEN NEW.key = 'resultUploads'
                 BEGIN SELECT RAISE(ABORT, 'history write rejected'); END;",
            )
            .expect("create triggers");
    }

    #[test]
    fn failed_history_write_leaves_index_untouched_on_merge() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        reject_history_writes(&store);

        let res = ResultService::new(&mut store).merge_batch(batch("a"));
        assert!(matches!(res, Err(ResultsError::Storage(_))));
        assert!(store.load_index().expect("load index").is_empty());
        assert!(store.load_batches().expect("load batches").is_empty());
        assert!(matches!(
            ResultService::new(&mut store).lookup(Some("00-0-00-123456"), None),
            Err(ResultsError::NotFound)
        ));
    }

    #[test]
    fn failed_history_write_leaves_index_untouched_on_remove() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        ResultService::new(&mut store)
            .merge_batch(batch("a"))
            .expect("merge");
        reject_history_writes(&store);

        let res = ResultService::new(&mut store).remove_batch("a");
        assert!(matches!(res, Err(ResultsError::Storage(_))));
        assert!(store.load_index().expect("load index").contains("00-0-00-123456"));
        assert_eq!(store.load_batches().expect("load batches").len(), 1);
    }

    #[test]
    fn data_survives_reopen() {
        let workspace = temp_dir("resultsd-db-reopen");
        {
            let mut store = open_db(&workspace).expect("open db");
            let batch = UploadBatch {
                id: "b1".into(),
                filename: "ba.csv".into(),
                uploaded_at: chrono::Utc::now(),
                records: 1,
                status: BatchStatus::Complete,
                batch_name: "BA 2023-24".into(),
                course_type: "Internal Assessment".into(),
                sha256: None,
                message: None,
                student_records: vec![record()],
            };
            store.save_batches(&[batch]).expect("save batches");
            store.close().expect("close");
        }
        let store = open_db(&workspace).expect("reopen db");
        let batches = store.load_batches().expect("load batches");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].student_records[0], record());
        let _ = std::fs::remove_dir_all(workspace);
    }
}
