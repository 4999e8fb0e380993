use std::path::PathBuf;

use serde::Deserialize;

use crate::config::Config;
use crate::db::SqliteStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Writes one notification line to the client as soon as it is produced.
pub type Notifier = Box<dyn FnMut(&serde_json::Value)>;

pub struct AppState {
    pub config: Config,
    pub workspace: Option<PathBuf>,
    pub store: Option<SqliteStore>,
    notifier: Notifier,
}

impl AppState {
    pub fn new(config: Config, notifier: Notifier) -> Self {
        Self {
            config,
            workspace: None,
            store: None,
            notifier,
        }
    }

    pub fn notify(&mut self, line: &serde_json::Value) {
        (self.notifier)(line)
    }
}
