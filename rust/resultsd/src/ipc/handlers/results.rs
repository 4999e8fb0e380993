use crate::ipc::error::{err, from_results_error, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::summarize;
use crate::results::ResultService;
use crate::search::{SearchSession, SearchState};
use serde_json::json;

fn param_str<'a>(req: &'a Request, key: &str) -> Option<&'a str> {
    req.params.get(key).and_then(|v| v.as_str())
}

fn handle_results_lookup(state: &mut AppState, req: &Request) -> serde_json::Value {
    let pass_percent = state.config.pass_percent;
    let Some(store) = state.store.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let service = ResultService::new(store);
    let mut session = SearchSession::default();

    let outcome = session.submit(&service, param_str(req, "sol"), param_str(req, "exam"));
    match outcome {
        Ok(SearchState::Found(record)) => {
            let summary = summarize(record, pass_percent);
            ok(
                &req.id,
                json!({
                    "state": "found",
                    "record": record,
                    "summary": summary,
                }),
            )
        }
        Ok(SearchState::NotFound) => err(
            &req.id,
            "not_found",
            "no result found for the given roll number",
            Some(json!({ "state": "notFound" })),
        ),
        Ok(other) => err(
            &req.id,
            "internal",
            format!("search ended in non-terminal state {}", other.name()),
            None,
        ),
        Err(e) => from_results_error(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.lookup" => Some(handle_results_lookup(state, req)),
        _ => None,
    }
}
