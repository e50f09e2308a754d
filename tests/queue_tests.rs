// SPDX-License-Identifier: MIT

//! Queue claim/release properties shared by both durable queues.

use strava_relay::db::{BackfillJobKind, ReleaseOutcome, MAX_RETRIES};

mod common;

#[tokio::test]
async fn concurrent_webhook_claims_yield_one_winner() {
    let db = common::test_store().await;
    db.enqueue_webhook(r#"{"object_type":"activity"}"#).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let db = db.clone();
        handles.push(tokio::spawn(async move { db.claim_next_webhook().await.unwrap() }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn concurrent_backfill_claims_yield_one_winner() {
    let db = common::test_store().await;
    db.enqueue_backfill(12345, BackfillJobKind::ListActivities, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let db = db.clone();
        handles.push(tokio::spawn(async move { db.claim_next_backfill().await.unwrap() }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn concurrent_claims_on_many_items_are_distinct() {
    let db = common::test_store().await;
    for n in 0..4 {
        db.enqueue_webhook(&format!(r#"{{"n":{n}}}"#)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(tokio::spawn(async move { db.claim_next_webhook().await.unwrap() }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().expect("four items for four claimers").id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn backoff_follows_schedule() {
    let db = common::test_store().await;
    let id = db.enqueue_webhook(r#"{"n":1}"#).await.unwrap();

    // (current retry count, expected backoff minutes for the new count)
    let expectations = [(0, 1), (1, 5), (2, 15), (3, 30), (4, 60), (5, 120), (6, 240), (7, 240)];

    for (retry_count, minutes) in expectations {
        let before = chrono::Utc::now().timestamp();
        let outcome = db.release_webhook(id, retry_count, "err").await.unwrap();
        let ReleaseOutcome::Released { next_retry_at } = outcome else {
            panic!("retry {retry_count} must not drop");
        };
        let delta = next_retry_at - before;
        assert!(
            (delta - minutes * 60).abs() <= 2,
            "retry {retry_count}: expected ~{minutes}min, got {delta}s"
        );
    }
}

#[tokio::test]
async fn webhook_dropped_after_retry_budget() {
    let db = common::test_store().await;
    let id = db.enqueue_webhook(r#"{"n":1}"#).await.unwrap();

    for retry_count in 0..MAX_RETRIES {
        assert!(!db
            .release_webhook(id, retry_count, "err")
            .await
            .unwrap()
            .is_dropped());
    }

    assert!(db
        .release_webhook(id, MAX_RETRIES, "err")
        .await
        .unwrap()
        .is_dropped());
    assert_eq!(db.webhook_queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn backfill_dropped_after_retry_budget() {
    let db = common::test_store().await;
    let id = db
        .enqueue_backfill(12345, BackfillJobKind::SyncActivity, Some(42))
        .await
        .unwrap();

    for retry_count in 0..MAX_RETRIES {
        assert!(!db
            .release_backfill(id, retry_count, "err")
            .await
            .unwrap()
            .is_dropped());
    }

    assert!(db
        .release_backfill(id, MAX_RETRIES, "err")
        .await
        .unwrap()
        .is_dropped());
    assert_eq!(db.backfill_queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn backing_off_item_not_claimable() {
    let db = common::test_store().await;
    let id = db.enqueue_webhook(r#"{"n":1}"#).await.unwrap();

    db.claim_next_webhook().await.unwrap().unwrap();
    db.release_webhook(id, 0, "err").await.unwrap();

    // One minute of backoff: nothing is ready
    assert!(db.claim_next_webhook().await.unwrap().is_none());
    assert_eq!(db.ready_webhook_queue_len().await.unwrap(), 0);
    assert_eq!(db.webhook_queue_len().await.unwrap(), 1);
}
