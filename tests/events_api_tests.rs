// SPDX-License-Identifier: MIT

//! Integration tests for the /events long-polling endpoint.

use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;

mod common;

fn events_request(uri: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn requires_api_key() {
    let (app, _db) = common::test_app().await;

    let response = app
        .clone()
        .oneshot(events_request("/events?cursor=0", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(events_request("/events?cursor=0", Some("wrong_key")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rejects_out_of_range_limit() {
    let (app, _db) = common::test_app().await;

    for uri in ["/events?limit=0", "/events?limit=1001"] {
        let response = app
            .clone()
            .oneshot(events_request(uri, Some("test_api_key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn rejects_malformed_parameters() {
    let (app, _db) = common::test_app().await;

    let response = app
        .oneshot(events_request("/events?cursor=abc", Some("test_api_key")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn returns_events_and_advances_cursor() {
    let (app, db) = common::test_app().await;

    db.append_athlete_connected_event(12345, r#"{"id":12345}"#)
        .await
        .unwrap();
    db.append_webhook_event(12345, Some(1), Some(r#"{"id":1}"#), r#"{"object_id":1}"#)
        .await
        .unwrap();

    let response = app
        .oneshot(events_request("/events?cursor=0&limit=10", Some("test_api_key")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["cursor"], 2);
    let events = json["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["event_id"], 1);
    assert_eq!(events[0]["event_type"], "athlete_connected");
    assert_eq!(events[0]["athlete_id"], 12345);
    assert_eq!(events[0]["athlete_summary"]["id"], 12345);
    assert_eq!(events[1]["event_type"], "webhook");
    assert_eq!(events[1]["activity_id"], 1);
    assert_eq!(events[1]["activity"]["id"], 1);
    assert_eq!(events[1]["event"]["object_id"], 1);
    // Empty slots are omitted, not null
    assert!(events[1].get("athlete_summary").is_none());
}

#[tokio::test]
async fn empty_read_echoes_request_cursor() {
    let (app, _db) = common::test_app().await;

    let response = app
        .oneshot(events_request("/events?cursor=7", Some("test_api_key")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["cursor"], 7);
    assert_eq!(json["events"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn long_poll_wakes_on_new_event() {
    let (app, db) = common::test_app().await;

    let started = Instant::now();
    let request_handle = tokio::spawn(
        app.oneshot(events_request(
            "/events?cursor=0&long_poll=true",
            Some("test_api_key"),
        )),
    );

    // Publish while the reader is parked
    tokio::time::sleep(Duration::from_millis(50)).await;
    db.append_athlete_connected_event(12345, r#"{"id":12345}"#)
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), request_handle)
        .await
        .expect("long-poll did not wake up")
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(1));

    let json = body_json(response).await;
    assert_eq!(json["cursor"], 1);
    assert_eq!(json["events"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn non_long_poll_returns_immediately_when_empty() {
    let (app, _db) = common::test_app().await;

    let started = Instant::now();
    let response = app
        .oneshot(events_request(
            "/events?cursor=0&long_poll=false",
            Some("test_api_key"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(started.elapsed() < Duration::from_millis(400));
}
