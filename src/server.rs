//! HTTP surface for the flat-file deployment.
//!
//! `GET /api/posts` returns the posts file as-is; every other path is served
//! from the static frontend directory.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub data_file: PathBuf,
}

pub fn router(data_file: PathBuf, static_dir: PathBuf) -> Router {
    let state = Arc::new(ServerState { data_file });
    Router::new()
        .route("/api/posts", get(api_posts))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the server until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Serving posts");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// A missing file means nothing has been scraped yet and yields `[]`.
async fn api_posts(State(state): State<Arc<ServerState>>) -> Response {
    let bytes = match tokio::fs::read(&state.data_file).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %state.data_file.display(), "Posts file not found, returning empty list");
            return Json(json!([])).into_response();
        }
        Err(e) => {
            tracing::error!(path = %state.data_file.display(), error = %e, "Failed to read posts file");
            return error_response("Failed to load posts");
        }
    };

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(posts) => Json(posts).into_response(),
        Err(e) => {
            tracing::error!(path = %state.data_file.display(), error = %e, "Failed to parse posts file");
            error_response("Failed to parse posts")
        }
    }
}

fn error_response(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::path::Path;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("postfeed_server_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("frontend")).unwrap();
        dir
    }

    /// Starts the server on an ephemeral port and returns its base URL.
    async fn start(dir: &Path) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(dir.join("posts.json"), dir.join("frontend"));
        tokio::spawn(serve(listener, app, std::future::pending()));
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_posts_passthrough() {
        let dir = temp_dir("passthrough");
        std::fs::write(
            dir.join("posts.json"),
            r#"[{"id": "1", "author": "alice", "extra": true}]"#,
        )
        .unwrap();
        let base = start(&dir).await;

        let response = reqwest::get(format!("{base}/api/posts")).await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body[0]["author"], "alice");
        assert_eq!(body[0]["extra"], true);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_posts_file_is_empty_list() {
        let dir = temp_dir("missing");
        let base = start(&dir).await;

        let response = reqwest::get(format!("{base}/api/posts")).await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body, json!([]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_malformed_posts_file_is_500() {
        let dir = temp_dir("malformed");
        std::fs::write(dir.join("posts.json"), "[{").unwrap();
        let base = start(&dir).await;

        let response = reqwest::get(format!("{base}/api/posts")).await.unwrap();
        assert_eq!(response.status(), 500);
        let body: Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body, json!({ "error": "Failed to parse posts" }));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_unreadable_posts_path_is_500() {
        let dir = temp_dir("unreadable");
        // A directory where the file should be cannot be read as one
        std::fs::create_dir_all(dir.join("posts.json")).unwrap();
        let base = start(&dir).await;

        let response = reqwest::get(format!("{base}/api/posts")).await.unwrap();
        assert_eq!(response.status(), 500);
        let body: Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body, json!({ "error": "Failed to load posts" }));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_static_frontend_served() {
        let dir = temp_dir("static");
        std::fs::write(dir.join("frontend").join("index.html"), "<h1>feed</h1>").unwrap();
        let base = start(&dir).await;

        let body = reqwest::get(format!("{base}/index.html"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "<h1>feed</h1>");

        let missing = reqwest::get(format!("{base}/nope.js")).await.unwrap();
        assert_eq!(missing.status(), 404);

        std::fs::remove_dir_all(&dir).ok();
    }
}
