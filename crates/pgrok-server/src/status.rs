//! Status page: HTML snapshot of the registry

use crate::server::AppState;
use axum::extract::State;
use axum::response::Html;
use chrono::Utc;

pub(crate) async fn status_page(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.registry.snapshot();
    let now = Utc::now();

    let mut rows = String::new();
    for summary in &snapshot {
        let idle_secs = (now - summary.last_activity).num_seconds().max(0);
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}s ago</td><td>{}</td><td>{}</td></tr>\n",
            summary.id,
            summary.kind.as_str(),
            summary.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            idle_secs,
            summary.request_count,
            summary.pending_requests,
        ));
    }

    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>pgrok status</title></head>\n<body>\n\
         <h1>pgrok</h1>\n<p>{} tunnel(s) registered{}</p>\n\
         <table border=\"1\" cellpadding=\"4\">\n\
         <tr><th>Tunnel</th><th>Kind</th><th>Created</th><th>Last activity</th>\
         <th>Requests</th><th>Pending</th></tr>\n{}</table>\n</body>\n</html>\n",
        snapshot.len(),
        if state.registry.single_tunnel_mode() {
            " (single-tunnel mode)"
        } else {
            ""
        },
        rows,
    ))
}
