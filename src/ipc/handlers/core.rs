use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "workspaceOpen": state.db.is_some()
        }),
    )
}

/// Opens (creating if needed) the workspace database and makes it current.
fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match required_str(req, "path") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    state.db = None;
    state.workspace = None;
    let conn = match db::open_db(&path) {
        Ok(c) => c,
        Err(e) => {
            return err(
                &req.id,
                "db_open_failed",
                format!("{:#}", e),
                Some(json!({ "path": path.to_string_lossy() })),
            )
        }
    };
    tracing::info!(workspace = %path.display(), "workspace opened");
    let resp = json!({
        "workspacePath": path.to_string_lossy(),
        "dbFile": db::DB_FILE_NAME
    });
    state.workspace = Some(path);
    state.db = Some(conn);
    ok(&req.id, resp)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
