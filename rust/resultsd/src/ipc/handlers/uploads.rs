use crate::error::ResultsError;
use crate::ipc::error::{err, from_results_error, ok};
use crate::ipc::types::{AppState, Request};
use crate::results::ResultService;
use crate::upload::{self, UploadEvent, UploadJob};
use serde_json::json;
use std::path::PathBuf;
use std::sync::mpsc;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{key} must not be empty"),
            None,
        )),
        None => Err(err(&req.id, "bad_params", format!("missing {key}"), None)),
    }
}

fn handle_uploads_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.store.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    let path = match required_str(req, "path") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };
    let batch_name = match required_str(req, "batchName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let course_type = match required_str(req, "courseType") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // Rejected before anything is recorded; the user just picks another file.
    if !upload::is_supported_file(&path) {
        return err(
            &req.id,
            "bad_params",
            "unsupported file type; upload .xlsx, .xls or .csv",
            None,
        );
    }

    let (tx, rx) = mpsc::channel();
    let job = UploadJob {
        path: path.clone(),
        default_course: String::new(),
        pass_percent: state.config.pass_percent,
        tick: state.config.upload_tick,
    };
    let handle = match job.spawn(tx) {
        Ok(h) => h,
        Err(e) => return from_results_error(&req.id, &e),
    };
    for event in rx {
        let line = match event {
            UploadEvent::Progress(percent) => json!({
                "event": "uploads.progress",
                "requestId": req.id,
                "percent": percent,
            }),
            UploadEvent::Finished { records } => json!({
                "event": "uploads.finished",
                "requestId": req.id,
                "records": records,
            }),
            UploadEvent::Failed(message) => json!({
                "event": "uploads.failed",
                "requestId": req.id,
                "message": message,
            }),
        };
        state.notify(&line);
    }
    let parsed = handle.join();

    let Some(store) = state.store.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut service = ResultService::new(store);
    match parsed {
        Ok(parsed) => {
            let (batch, warnings) = parsed.into_batch(&batch_name, &course_type);
            let summary = batch.summary_json();
            match service.merge_batch(batch) {
                Ok(index) => ok(
                    &req.id,
                    json!({
                        "batch": summary,
                        "warnings": warnings,
                        "indexSize": index.len(),
                    }),
                ),
                Err(e) => from_results_error(&req.id, &e),
            }
        }
        Err(e @ ResultsError::UploadParse(_)) => {
            let failed = upload::failed_batch(&path, &batch_name, &course_type, e.to_string());
            let summary = failed.summary_json();
            if let Err(store_err) = service.record_failed_upload(failed) {
                return from_results_error(&req.id, &store_err);
            }
            err(
                &req.id,
                e.code(),
                e.to_string(),
                Some(json!({ "batch": summary })),
            )
        }
        Err(e) => from_results_error(&req.id, &e),
    }
}

fn handle_uploads_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match ResultService::new(store).batches() {
        Ok(batches) => {
            let uploads: Vec<serde_json::Value> =
                batches.iter().map(|b| b.summary_json()).collect();
            ok(&req.id, json!({ "uploads": uploads }))
        }
        Err(e) => from_results_error(&req.id, &e),
    }
}

fn handle_uploads_records(state: &mut AppState, req: &Request) -> serde_json::Value {
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(store) = state.store.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match ResultService::new(store).batch_records(&batch_id) {
        Ok(records) => ok(&req.id, json!({ "batchId": batch_id, "records": records })),
        Err(e) => from_results_error(&req.id, &e),
    }
}

fn handle_uploads_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(store) = state.store.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match ResultService::new(store).remove_batch(&batch_id) {
        Ok(index) => ok(
            &req.id,
            json!({ "removed": batch_id, "indexSize": index.len() }),
        ),
        Err(e) => from_results_error(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "uploads.import" => Some(handle_uploads_import(state, req)),
        "uploads.list" => Some(handle_uploads_list(state, req)),
        "uploads.records" => Some(handle_uploads_records(state, req)),
        "uploads.delete" => Some(handle_uploads_delete(state, req)),
        _ => None,
    }
}
