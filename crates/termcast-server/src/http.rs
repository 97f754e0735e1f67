//! HTTP front-end: the viewer bootstrap page and static assets.
//!
//! Not part of the session core — it talks to the core exclusively
//! through `SessionRegistry::get_or_create`, the same entry point the
//! WebSocket path uses. Visiting `/session/{id}` therefore also counts
//! as the first reference that spawns the session's process.

use crate::session::SessionRegistry;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::warn;

#[derive(Clone)]
struct HttpState {
    registry: Arc<SessionRegistry>,
    ws_port: u16,
}

/// Build the front-end router. When no assets directory is configured,
/// only the bootstrap page is served and the page's asset references
/// will 404 — useful for headless/protocol-only deployments.
pub fn router(
    registry: Arc<SessionRegistry>,
    assets_dir: Option<PathBuf>,
    ws_port: u16,
) -> Router {
    let state = HttpState { registry, ws_port };
    let mut router = Router::new()
        .route("/session/:id", get(session_page))
        .with_state(state);
    if let Some(dir) = assets_dir {
        router = router.nest_service("/assets", ServeDir::new(dir));
    }
    router
}

/// `GET /session/{id}` — ensure the session exists, then hand the
/// browser a page that attaches to it over WebSocket.
async fn session_page(
    State(state): State<HttpState>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    match state.registry.get_or_create(&id).await {
        Ok(_) => Html(render_page(&id, state.ws_port)).into_response(),
        Err(e) => {
            warn!(session_id = %id, error = %e, "session page failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn render_page(id: &str, ws_port: u16) -> String {
    // A JSON string literal is also a valid, properly escaped JS string
    // literal; `<` is additionally escaped so an id containing
    // `</script>` cannot terminate the inline script element.
    let id_literal = serde_json::to_string(id)
        .unwrap_or_else(|_| "\"session\"".to_string())
        .replace('<', "\\u003c");
    PAGE_TEMPLATE
        .replace("__SESSION_ID__", &id_literal)
        .replace("__WS_PORT__", &ws_port.to_string())
}

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>termcast</title>
<link rel="stylesheet" href="/assets/xterm.css">
<style>html,body{height:100%;margin:0;background:#000}#terminal{height:100%}</style>
</head>
<body>
<div id="terminal"></div>
<script src="/assets/xterm.js"></script>
<script src="/assets/xterm-addon-fit.js"></script>
<script>
  const sessionId = __SESSION_ID__;
  const term = new Terminal();
  const fitAddon = new FitAddon.FitAddon();
  term.loadAddon(fitAddon);
  term.open(document.getElementById('terminal'));
  fitAddon.fit();

  const ws = new WebSocket('ws://' + location.hostname + ':__WS_PORT__/');
  ws.onopen = () => {
    ws.send(JSON.stringify({ id: sessionId }));
    ws.send(JSON.stringify({ id: sessionId, size: { cols: term.cols, rows: term.rows } }));
  };
  ws.onmessage = (event) => {
    const msg = JSON.parse(event.data);
    if (msg.id === sessionId) term.write(msg.data);
  };
  term.onData((data) => ws.send(JSON.stringify({ id: sessionId, data: data })));
  window.addEventListener('resize', () => {
    fitAddon.fit();
    ws.send(JSON.stringify({ id: sessionId, size: { cols: term.cols, rows: term.rows } }));
  });
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_embeds_escaped_session_id_and_port() {
        let page = render_page(r#"abc"</script>"#, 3002);
        assert!(page.contains("\"abc\\\"\\u003c/script>\""));
        assert!(!page.contains(r#"abc"</script>"#), "id must not appear raw");
        assert!(page.contains(":3002/"));
        assert!(!page.contains("__SESSION_ID__"));
        assert!(!page.contains("__WS_PORT__"));
    }
}
