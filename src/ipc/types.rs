use std::collections::HashSet;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Students whose raw records changed since the last stats refresh.
    /// Writes enqueue here; `stats.refresh` drains and recomputes.
    pub dirty_students: HashSet<String>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            dirty_students: HashSet::new(),
        }
    }
}
