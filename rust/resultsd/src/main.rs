mod config;
mod db;
mod error;
mod ipc;
mod model;
mod results;
mod search;
mod upload;

use std::io::{self, BufRead, Write};
use tracing::{error, info};

fn init_tracing() {
    // stdout carries the protocol; logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("resultsd=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    init_tracing();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %format!("{e:#}"), "invalid configuration");
            std::process::exit(2);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pass_percent = config.pass_percent,
        "resultsd starting"
    );

    // Notifications are flushed one by one so a client sees upload progress
    // while the request is still running.
    let notifier: ipc::Notifier = Box::new(|line: &serde_json::Value| {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    });
    let mut state = ipc::AppState::new(config, notifier);
    if let Some(path) = state.config.workspace.clone() {
        if let Err(e) = ipc::select_workspace(&mut state, &path) {
            error!(workspace = %path.display(), error = %format!("{e:#}"), "failed to open workspace");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(stdout, "{}", resp);
        let _ = stdout.flush();
    }

    if let Some(store) = state.store.take() {
        if let Err(e) = store.close() {
            error!(error = %format!("{e:#}"), "failed to close workspace");
        }
    }
    info!("stdin closed; shutting down");
}
