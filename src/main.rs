mod aggregator;
mod calc;
mod clock;
mod config;
mod db;
mod detectors;
mod engine;
mod error;
mod event_store;
mod ipc;
mod logging;
mod model;
mod publisher;
mod read_model;
mod risk;
mod runner;
mod scanner;
mod scheduler;
mod store;
mod sweep;
mod unit;

use std::io::{self, BufRead, Write};

fn main() {
    if let Err(e) = logging::init() {
        eprintln!("saed: logging disabled: {e:#}");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "saed starting");

    let mut state = ipc::AppState::default();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
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
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    state.close();
    tracing::info!("saed stopped");
}
