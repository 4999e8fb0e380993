use crate::db::RecordStore;
use crate::error::{Result, ResultsError};
use crate::model::{Index, StudentRecord, UploadBatch};
use tracing::info;

/// Keeps the identifier index consistent with the upload history and answers
/// roll-number lookups.
///
/// Deletion rebuilds the index from the batches that remain, replaying them
/// oldest first. An identifier therefore stays resolvable while any remaining
/// batch maps it, and resolves to the newest such batch's record.
pub struct ResultService<'a, S: RecordStore> {
    store: &'a mut S,
}

impl<'a, S: RecordStore> ResultService<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    pub fn merge_batch(&mut self, batch: UploadBatch) -> Result<Index> {
        let mut index = self.store.load_index()?;
        for record in &batch.student_records {
            index.insert_record(record);
        }
        let mut batches = self.store.load_batches()?;
        batches.retain(|b| b.id != batch.id);
        let (batch_id, filename, records) =
            (batch.id.clone(), batch.filename.clone(), batch.student_records.len());
        batches.insert(0, batch);

        self.store.save_state(&index, &batches)?;
        info!(
            batch_id = %batch_id,
            filename = %filename,
            records,
            index_size = index.len(),
            "batch merged"
        );
        Ok(index)
    }

    /// History entry for an upload that never produced records.
    pub fn record_failed_upload(&mut self, batch: UploadBatch) -> Result<()> {
        let mut batches = self.store.load_batches()?;
        batches.retain(|b| b.id != batch.id);
        batches.insert(0, batch);
        self.store.save_batches(&batches)
    }

    pub fn remove_batch(&mut self, batch_id: &str) -> Result<Index> {
        let mut batches = self.store.load_batches()?;
        let Some(pos) = batches.iter().position(|b| b.id == batch_id) else {
            return Err(ResultsError::BatchNotFound(batch_id.to_string()));
        };
        let removed = batches.remove(pos);

        let index = rebuild_index(&batches);
        self.store.save_state(&index, &batches)?;
        info!(
            batch_id,
            filename = %removed.filename,
            remaining_batches = batches.len(),
            index_size = index.len(),
            "batch removed"
        );
        Ok(index)
    }

    /// SOL roll number wins over exam roll number when both resolve.
    pub fn lookup(&self, sol_roll_no: Option<&str>, exam_roll_no: Option<&str>) -> Result<StudentRecord> {
        if sol_roll_no.is_none() && exam_roll_no.is_none() {
            return Err(ResultsError::Validation(
                "enter at least one roll number".to_string(),
            ));
        }
        let index = self.store.load_index()?;
        sol_roll_no
            .and_then(|k| index.get(k))
            .or_else(|| exam_roll_no.and_then(|k| index.get(k)))
            .cloned()
            .ok_or(ResultsError::NotFound)
    }

    /// Upload history, newest first.
    pub fn batches(&self) -> Result<Vec<UploadBatch>> {
        self.store.load_batches()
    }

    pub fn batch_records(&self, batch_id: &str) -> Result<Vec<StudentRecord>> {
        self.store
            .load_batches()?
            .into_iter()
            .find(|b| b.id == batch_id)
            .map(|b| b.student_records)
            .ok_or_else(|| ResultsError::BatchNotFound(batch_id.to_string()))
    }
}

/// History is newest first; replay it in reverse so later uploads win.
pub fn rebuild_index(batches: &[UploadBatch]) -> Index {
    let mut index = Index::new();
    for batch in batches.iter().rev() {
        for record in &batch.student_records {
            index.insert_record(record);
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::model::BatchStatus;
    use std::cell::Cell;

    fn record(sol: &str, exam: &str, name: &str) -> StudentRecord {
        StudentRecord {
            sol_roll_no: sol.into(),
            exam_roll_no: exam.into(),
            name: name.into(),
            course: "BA Programme".into(),
            semester: None,
            session: None,
            subjects: vec![],
        }
    }

    fn batch(id: &str, records: Vec<StudentRecord>) -> UploadBatch {
        UploadBatch {
            id: id.into(),
            filename: format!("{id}.csv"),
            uploaded_at: chrono::Utc::now(),
            records: records.len(),
            status: BatchStatus::Complete,
            batch_name: "BA 2023-24".into(),
            course_type: "Internal Assessment".into(),
            sha256: None,
            message: None,
            student_records: records,
        }
    }

    #[test]
    fn merged_record_resolves_by_either_identifier() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        let r = record("00-0-00-123456", "987654321098", "Rahul");
        svc.merge_batch(batch("a", vec![r.clone()])).expect("merge");

        assert_eq!(svc.lookup(Some("00-0-00-123456"), None).expect("by sol"), r);
        assert_eq!(svc.lookup(None, Some("987654321098")).expect("by exam"), r);
        assert!(matches!(
            svc.lookup(None, Some("000000000000")),
            Err(ResultsError::NotFound)
        ));
    }

    #[test]
    fn sol_roll_no_takes_precedence_then_falls_back_to_exam() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        let x = record("00-0-00-000001", "100000000001", "X");
        let y = record("00-0-00-000002", "100000000002", "Y");
        svc.merge_batch(batch("a", vec![x.clone(), y.clone()]))
            .expect("merge");

        let got = svc
            .lookup(Some("00-0-00-000001"), Some("100000000002"))
            .expect("lookup");
        assert_eq!(got, x);
        let got = svc
            .lookup(Some("99-9-99-999999"), Some("100000000002"))
            .expect("lookup");
        assert_eq!(got, y);
    }

    #[test]
    fn merging_same_batch_twice_is_idempotent() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        let b = batch("a", vec![record("00-0-00-123456", "987654321098", "R")]);
        let once = svc.merge_batch(b.clone()).expect("merge once");
        let twice = svc.merge_batch(b).expect("merge twice");
        assert_eq!(once, twice);
        assert_eq!(svc.batches().expect("batches").len(), 1);
    }

    #[test]
    fn removing_exclusive_owner_makes_identifier_unresolvable() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        svc.merge_batch(batch("a", vec![record("00-0-00-000001", "100000000001", "X")]))
            .expect("merge a");
        svc.merge_batch(batch("b", vec![record("00-0-00-000002", "100000000002", "Y")]))
            .expect("merge b");

        let index = svc.remove_batch("b").expect("remove b");
        assert!(!index.contains("00-0-00-000002"));
        assert!(matches!(
            svc.lookup(Some("00-0-00-000002"), None),
            Err(ResultsError::NotFound)
        ));
        assert!(matches!(
            svc.lookup(None, Some("100000000002")),
            Err(ResultsError::NotFound)
        ));
        assert!(svc.lookup(Some("00-0-00-000001"), None).is_ok());
        assert_eq!(svc.batches().expect("batches").len(), 1);
    }

    #[test]
    fn shared_identifier_falls_back_to_remaining_batch_on_removal() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        let x = record("00-0-00-000001", "100000000001", "X");
        let y = record("00-0-00-000001", "100000000003", "Y");
        svc.merge_batch(batch("a", vec![x.clone()])).expect("merge a");
        svc.merge_batch(batch("b", vec![y.clone()])).expect("merge b");

        assert_eq!(svc.lookup(Some("00-0-00-000001"), None).expect("id1"), y);

        svc.remove_batch("b").expect("remove b");
        assert_eq!(svc.lookup(Some("00-0-00-000001"), None).expect("id1"), x);
        assert_eq!(svc.lookup(None, Some("100000000001")).expect("id2"), x);
        assert!(matches!(
            svc.lookup(None, Some("100000000003")),
            Err(ResultsError::NotFound)
        ));
    }

    #[test]
    fn removing_older_batch_keeps_newer_winner() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        let x = record("00-0-00-000001", "100000000001", "X");
        let y = record("00-0-00-000001", "100000000003", "Y");
        svc.merge_batch(batch("a", vec![x])).expect("merge a");
        svc.merge_batch(batch("b", vec![y.clone()])).expect("merge b");

        svc.remove_batch("a").expect("remove a");
        assert_eq!(svc.lookup(Some("00-0-00-000001"), None).expect("id1"), y);
        assert!(svc.lookup(None, Some("100000000001")).is_err());
    }

    #[test]
    fn removing_unknown_batch_is_reported() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        assert!(matches!(
            svc.remove_batch("missing"),
            Err(ResultsError::BatchNotFound(_))
        ));
    }

    #[test]
    fn failed_upload_enters_history_without_touching_index() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let mut svc = ResultService::new(&mut store);
        let mut b = batch("bad", vec![]);
        b.status = BatchStatus::Error;
        b.message = Some("missing column: SOL Roll No".into());
        svc.record_failed_upload(b).expect("record failure");

        let history = svc.batches().expect("batches");
        assert_eq!(history[0].status, BatchStatus::Error);
        assert!(svc.batch_records("bad").expect("records").is_empty());
        assert!(store.load_index().expect("index").is_empty());
    }

    struct CountingStore {
        reads: Cell<usize>,
    }

    impl RecordStore for CountingStore {
        fn load_batches(&self) -> Result<Vec<UploadBatch>> {
            self.reads.set(self.reads.get() + 1);
            Ok(Vec::new())
        }
        fn save_batches(&mut self, _batches: &[UploadBatch]) -> Result<()> {
            Ok(())
        }
        fn load_index(&self) -> Result<Index> {
            self.reads.set(self.reads.get() + 1);
            Ok(Index::new())
        }
        fn save_index(&mut self, _index: &Index) -> Result<()> {
            Ok(())
        }
        fn save_state(&mut self, _index: &Index, _batches: &[UploadBatch]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_without_identifiers_is_rejected_before_store_access() {
        let mut store = CountingStore {
            reads: Cell::new(0),
        };
        let svc = ResultService::new(&mut store);
        assert!(matches!(
            svc.lookup(None, None),
            Err(ResultsError::Validation(_))
        ));
        drop(svc);
        assert_eq!(store.reads.get(), 0);
    }
}
