use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use recorder_sdk::types::{
    CalloutAck, CalloutQuery, EventBatch, EventKind, NavigationEvent, PageAppend, PageScope,
};
use recorder_sdk::{ApiError, RecorderApi, RecorderClient};
use serde_json::{json, Value};
use tokio::sync::Mutex;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Clone, Default)]
struct Backend {
    saved: Arc<Mutex<Vec<Value>>>,
    appended: Arc<Mutex<Vec<(String, String, Value)>>>,
    callout_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn spawn_backend(backend: Backend) -> String {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/recordings/:session_code/events",
            post(
                |State(backend): State<Backend>, Json(body): Json<Value>| async move {
                    backend.saved.lock().await.push(body);
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .route(
            "/callouts",
            get(
                |State(backend): State<Backend>,
                 Query(params): Query<HashMap<String, String>>| async move {
                    backend.callout_queries.lock().await.push(params);
                    Json(json!({
                        "callouts": [{
                            "id": 7,
                            "message": "look at the pricing tab",
                            "createdAt": "2026-03-01T10:00:00Z",
                            "authorName": "Dana"
                        }]
                    }))
                },
            ),
        )
        .route(
            "/callouts/:id/acknowledge",
            post(|Path(id): Path<String>| async move { Json(json!({ "acknowledged": id })) }),
        )
        .route(
            "/team",
            get(|| async { Json(json!([{ "id": "p1", "title": "Roadmap" }])) })
                .post(|Json(body): Json<Value>| async move {
                    Json(json!({ "id": 99, "title": body["title"] }))
                }),
        )
        .route(
            "/private/:user_code",
            get(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "message": "private pages are disabled" })),
                )
            }),
        )
        .route(
            "/team/:id/append",
            post(
                |State(backend): State<Backend>,
                 Path(id): Path<String>,
                 Json(body): Json<Value>| async move {
                    backend
                        .appended
                        .lock()
                        .await
                        .push(("team".into(), id, body));
                    Json(json!({ "ok": true }))
                },
            ),
        )
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn saves_batches_and_reaches_health() -> TestResult {
    let backend = Backend::default();
    let base = spawn_backend(backend.clone()).await;
    let client = RecorderClient::new(base);

    client.ping().await?;

    let batch = EventBatch::new(
        "AB12",
        "99",
        vec![
            NavigationEvent::new(EventKind::PageVisit, serde_json::Map::new()),
            NavigationEvent::new(EventKind::Click, serde_json::Map::new()),
        ],
    );
    client.save_events(&batch).await?;

    let saved = backend.saved.lock().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0]["batchId"], batch.batch_id.to_string());
    assert_eq!(saved[0]["events"][0]["type"], "PAGE_VISIT");
    assert_eq!(saved[0]["events"][1]["type"], "CLICK");
    Ok(())
}

#[tokio::test]
async fn fetches_callouts_with_watermark() -> TestResult {
    let backend = Backend::default();
    let base = spawn_backend(backend.clone()).await;
    let client = RecorderClient::new(base);

    let since = Utc::now();
    let callouts = client
        .fetch_callouts(&CalloutQuery {
            user_code: "AB12".into(),
            session_code: "99".into(),
            since: Some(since),
        })
        .await?;
    assert_eq!(callouts.len(), 1);
    assert_eq!(callouts[0].id, "7");
    assert_eq!(callouts[0].author_name.as_deref(), Some("Dana"));

    let queries = backend.callout_queries.lock().await;
    assert_eq!(queries[0]["sessionCode"], "99");
    assert!(queries[0].contains_key("since"));

    let ack = client
        .acknowledge_callout(&CalloutAck {
            callout_id: "7".into(),
            actor_code: "AB12".into(),
            actor_name: "AB12".into(),
        })
        .await?;
    assert_eq!(ack["acknowledged"], "7");
    Ok(())
}

#[tokio::test]
async fn pages_round_trip_and_errors_carry_message() -> TestResult {
    let backend = Backend::default();
    let base = spawn_backend(backend.clone()).await;
    let client = RecorderClient::new(base);

    let pages = client.list_pages(&PageScope::Team).await?;
    assert_eq!(pages[0].title, "Roadmap");

    let created = client.create_page(&PageScope::Team, "Research").await?;
    assert_eq!(created.id, "99");
    assert_eq!(created.title, "Research");

    client
        .append_to_page(
            &PageScope::Team,
            "p1",
            &PageAppend {
                text: Some("quoted text".into()),
                image_url: None,
                source_url: Some("https://example.com".into()),
                source_title: None,
                captured_at: Utc::now(),
            },
        )
        .await?;
    let appended = backend.appended.lock().await;
    assert_eq!(appended[0].1, "p1");
    assert_eq!(appended[0].2["text"], "quoted text");
    assert!(appended[0].2.get("imageUrl").is_none());

    let err = client
        .list_pages(&PageScope::Private {
            user_code: "AB12".into(),
        })
        .await
        .unwrap_err();
    match err {
        ApiError::UnexpectedStatus { status, message } => {
            assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
            assert_eq!(message, "private pages are disabled");
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}
