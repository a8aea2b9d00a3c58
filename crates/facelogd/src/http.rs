//! HTTP surface: index page, detections JSON, MJPEG feed, status.

use crate::context::AppContext;
use crate::stream;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use facelog_store::RecentDetection;
use serde::Serialize;
use tower_http::trace::TraceLayer;

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Face Recognition</title>
<style>
  body { font-family: sans-serif; margin: 2em; display: flex; gap: 2em; }
  img { border: 1px solid #ccc; }
  li { margin: 0.3em 0; }
  .time { color: #666; font-size: 0.9em; }
</style>
</head>
<body>
<div><img src="/video_feed" width="640" height="480" alt="live camera"></div>
<div>
<h2>Latest detections</h2>
<ul id="detections">
{{ROWS}}</ul>
</div>
<script>
async function refresh() {
  try {
    const res = await fetch('/get_latest_detections');
    const rows = await res.json();
    const list = document.getElementById('detections');
    list.replaceChildren(...rows.map(d => {
      const li = document.createElement('li');
      li.textContent = d.name + ' ';
      const t = document.createElement('span');
      t.className = 'time';
      t.textContent = d.detection_time;
      li.appendChild(t);
      return li;
    }));
  } catch (e) {}
}
setInterval(refresh, 2000);
</script>
</body>
</html>
"#;

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    recognizer_trained: bool,
    detector_stages: usize,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/get_latest_detections", get(latest_detections))
        .route("/video_feed", get(video_feed))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Recent detections, or an empty list if the store cannot be read.
async fn recent_or_empty(ctx: &AppContext) -> Vec<RecentDetection> {
    let store = ctx.store.clone();
    let limit = ctx.config.recent_limit;
    match tokio::task::spawn_blocking(move || store.recent(limit)).await {
        Ok(Ok(rows)) => rows,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to read recent detections");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "recent detections task failed");
            Vec::new()
        }
    }
}

async fn index(State(ctx): State<AppContext>) -> Html<String> {
    let rows = recent_or_empty(&ctx).await;
    Html(render_index(&rows))
}

async fn latest_detections(State(ctx): State<AppContext>) -> Json<Vec<RecentDetection>> {
    Json(recent_or_empty(&ctx).await)
}

async fn video_feed(State(ctx): State<AppContext>) -> Response {
    let rx = stream::spawn_session(&ctx);
    (
        [
            (header::CONTENT_TYPE, stream::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        stream::mjpeg_body(rx),
    )
        .into_response()
}

async fn status(State(ctx): State<AppContext>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        recognizer_trained: ctx.recognizer.is_trained(),
        detector_stages: ctx.detector_stages,
    })
}

fn render_index(rows: &[RecentDetection]) -> String {
    let items: String = rows
        .iter()
        .map(|d| {
            format!(
                "<li>{} <span class=\"time\">{}</span></li>\n",
                html_escape(&d.name),
                html_escape(&d.detection_time)
            )
        })
        .collect();
    INDEX_TEMPLATE.replace("{{ROWS}}", &items)
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{Local, TimeZone};
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body.to_vec())
    }

    #[tokio::test]
    async fn test_latest_detections_json() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), vec![], None, 0);
        let alice = ctx.store.add_identity("Alice").unwrap();
        let at = Local.with_ymd_and_hms(2024, 5, 2, 14, 30, 0).unwrap();
        ctx.store.record(alice, at).unwrap();

        let (status, _, body) = get_body(router(ctx), "/get_latest_detections").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"name": "Alice", "detection_time": "2024-05-02 14:30:00.000000"}])
        );
    }

    #[tokio::test]
    async fn test_latest_detections_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), vec![], None, 0);
        let (_, _, body) = get_body(router(ctx), "/get_latest_detections").await;
        assert_eq!(body, b"[]");
    }

    #[tokio::test]
    async fn test_storage_error_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), vec![], None, 0);
        let path = ctx.store.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let (status, _, body) = get_body(router(ctx.clone()), "/get_latest_detections").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");

        let (status, _, _) = get_body(router(ctx), "/").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_index_lists_escaped_names() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), vec![], None, 0);
        let id = ctx.store.add_identity("<b>Eve</b>").unwrap();
        ctx.store.record(id, Local::now()).unwrap();

        let (status, content_type, body) = get_body(router(ctx), "/").await;
        let html = String::from_utf8(body).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        assert!(html.contains("&lt;b&gt;Eve&lt;/b&gt;"));
        assert!(!html.contains("<b>Eve</b>"));
        assert!(html.contains("src=\"/video_feed\""));
    }

    #[tokio::test]
    async fn test_index_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), vec![], None, 0);
        let id = ctx.store.add_identity("Alice").unwrap();
        for _ in 0..15 {
            ctx.store.record(id, Local::now()).unwrap();
        }
        let (_, _, body) = get_body(router(ctx), "/").await;
        let html = String::from_utf8(body).unwrap();
        assert_eq!(html.matches("<li>Alice").count(), 10);
    }

    #[tokio::test]
    async fn test_video_feed_streams_frames() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), vec![], None, 2);
        let (status, content_type, body) = get_body(router(ctx), "/video_feed").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("multipart/x-mixed-replace; boundary=frame"));
        assert!(body.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        let parts = body.windows(9).filter(|w| *w == b"--frame\r\n").count();
        assert_eq!(parts, 2);
    }

    #[tokio::test]
    async fn test_video_feed_without_camera_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_support::context(dir.path(), vec![], None, 0);
        let (status, _, body) = get_body(router(ctx), "/video_feed").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let dir = tempfile::tempdir().unwrap();
        let prediction = Some(facelog_core::Prediction {
            identity: Some(1),
            distance: 50.0,
        });
        let ctx = test_support::context(dir.path(), vec![], prediction, 0);
        let (_, _, body) = get_body(router(ctx), "/status").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["recognizer_trained"], true);
        assert_eq!(json["detector_stages"], 1);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape(r#"a&b<"c">'"#), "a&amp;b&lt;&quot;c&quot;&gt;&#39;");
    }
}
