use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::engine::Engine;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub engine: Option<Engine>,
}

impl AppState {
    /// Stop the engine (draining in-flight units) and release the workspace.
    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown();
        }
        self.db = None;
        self.workspace = None;
    }
}
