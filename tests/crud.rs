//! CRUD endpoints against a live database. Set `TEST_DATABASE_URL` to run.

mod common;

use pgcrud::{AppError, ConstraintKind, FilterExpression, OrderBy, Page};
use serde_json::Number;
use serde_json::{json, Map, Value};

fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => panic!("not an object"),
    }
}

#[tokio::test]
async fn created_user_is_listed_with_server_defaults() {
    let Some(db) = common::setup("crud_create").await else { return };
    let state = db.migrated_state().await;
    let users = state.endpoints.endpoint("users").await.unwrap();

    let created = users
        .create(&obj(json!({"user_id": "u1", "firebase_data": {}})))
        .await
        .unwrap();
    assert_eq!(created["user_id"], json!("u1"));

    let listing = users
        .list(&[FilterExpression::eq("user_id", json!("u1"))], &[], Page::default())
        .await
        .unwrap();
    assert_eq!(listing.total, 1);
    assert_eq!(listing.items.len(), 1);
    let row = &listing.items[0];
    assert_eq!(row["firebase_data"], json!({}));
    assert!(row["created_at"].as_str().is_some_and(|ts| ts.ends_with('Z')));

    db.teardown().await;
}

#[tokio::test]
async fn update_touches_updated_at_and_missing_rows_are_not_found() {
    let Some(db) = common::setup("crud_update").await else { return };
    let state = db.migrated_state().await;
    let users = state.endpoints.endpoint("users").await.unwrap();
    users.create(&obj(json!({"user_id": "u1"}))).await.unwrap();

    let updated = users
        .update(&json!("u1"), &obj(json!({"body_data": {"height": 180}})))
        .await
        .unwrap();
    assert_eq!(updated["body_data"], json!({"height": 180}));

    let err = users
        .update(&json!("nobody"), &obj(json!({"body_data": {}})))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { ref id, .. } if id == "nobody"));

    let err = users.delete(&json!("nobody")).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));

    let removed = users.delete(&json!("u1")).await.unwrap();
    assert_eq!(removed["user_id"], json!("u1"));
    assert!(matches!(users.get(&json!("u1")).await, Err(AppError::NotFound { .. })));

    db.teardown().await;
}

#[tokio::test]
async fn foreign_key_violation_is_classified() {
    let Some(db) = common::setup("crud_fk").await else { return };
    let state = db.migrated_state().await;
    let sessions = state.endpoints.endpoint("sessions").await.unwrap();

    let err = sessions
        .create(&obj(json!({
            "session_id": "s1",
            "user_id": "ghost",
            "ts_start": "2024-01-01T00:00:00Z"
        })))
        .await
        .unwrap_err();
    match err {
        AppError::ConstraintViolation { kind, table, .. } => {
            assert_eq!(kind, ConstraintKind::ForeignKey);
            assert_eq!(table, "sessions");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    db.teardown().await;
}

#[tokio::test]
async fn totals_do_not_depend_on_the_page() {
    let Some(db) = common::setup("crud_pages").await else { return };
    let state = db.migrated_state().await;
    state
        .endpoints
        .endpoint("users")
        .await
        .unwrap()
        .create(&obj(json!({"user_id": "u1"})))
        .await
        .unwrap();
    let events = state.endpoints.endpoint("event_log").await.unwrap();
    let batch: Vec<_> = (0..25)
        .map(|i| obj(json!({"user_id": "u1", "event_type": if i % 5 == 0 { "login" } else { "tap" }})))
        .collect();
    let created = events.create_many(&batch).await.unwrap();
    assert_eq!(created.len(), 25);

    let order = [OrderBy::asc("event_id")];
    let first = events.list(&[], &order, Page::new(1, 10).unwrap()).await.unwrap();
    let last = events.list(&[], &order, Page::new(3, 10).unwrap()).await.unwrap();
    assert_eq!((first.total, last.total), (25, 25));
    assert_eq!((first.items.len(), last.items.len()), (10, 5));
    assert!(first.items[0]["event_id"].as_i64() < last.items[0]["event_id"].as_i64());

    let logins = events
        .list(&[FilterExpression::eq("event_type", json!("login"))], &[], Page::new(1, 2).unwrap())
        .await
        .unwrap();
    assert_eq!(logins.total, 5);
    assert_eq!(logins.items.len(), 2);

    db.teardown().await;
}

#[tokio::test]
async fn failed_bulk_create_persists_nothing() {
    let Some(db) = common::setup("crud_bulk").await else { return };
    let state = db.migrated_state().await;
    let users = state.endpoints.endpoint("users").await.unwrap();

    let err = users
        .create_many(&[obj(json!({"user_id": "dup"})), obj(json!({"user_id": "dup"}))])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::ConstraintViolation {
            kind: ConstraintKind::Unique,
            ..
        }
    ));
    let listing = users.list(&[], &[], Page::default()).await.unwrap();
    assert_eq!(listing.total, 0);

    db.teardown().await;
}

#[tokio::test]
async fn unknown_table_is_rejected() {
    let Some(db) = common::setup("crud_unknown").await else { return };
    let state = db.migrated_state().await;
    assert!(matches!(
        state.endpoints.endpoint("nope").await,
        Err(AppError::UnknownTable(_))
    ));
    db.teardown().await;
}

#[tokio::test]
async fn created_rows_read_back_unchanged() {
    let Some(db) = common::setup("crud_roundtrip").await else { return };
    let state = db.migrated_state().await;
    let users = state.endpoints.endpoint("users").await.unwrap();
    let events = state.endpoints.endpoint("event_log").await.unwrap();

    let created = users
        .create(&obj(json!({"user_id": "u1", "body_data": {"height": 180, "tags": ["a"]}})))
        .await
        .unwrap();
    let fetched = users.get(&json!("u1")).await.unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched["body_data"], json!({"height": 180, "tags": ["a"]}));
    assert!(fetched["created_at"].is_string());
    assert!(fetched["updated_at"].is_string());

    let event = events
        .create(&obj(json!({"user_id": "u1", "event_type": "login", "event_data": {"ok": true}})))
        .await
        .unwrap();
    let event_id = event["event_id"].as_i64().expect("serial id is filled in");
    let fetched = events.get(&json!(event_id)).await.unwrap();
    assert_eq!(fetched, event);
    assert_eq!(fetched["log_level"], json!("info"));

    db.teardown().await;
}

#[tokio::test]
async fn warm_cache_sees_tables_from_later_migrations() {
    let Some(db) = common::setup("crud_cache").await else { return };
    let state = db.migrated_state().await;
    state.endpoints.endpoint("users").await.unwrap();
    assert_eq!(state.schema.cached_version(), Some(3));

    db.write_script(
        "004_create_notes.sql",
        "CREATE TABLE IF NOT EXISTS notes (note_id BIGSERIAL PRIMARY KEY, body TEXT);\n\
         -- rollback:\n-- DROP TABLE IF EXISTS notes;\n",
    );
    // A migrator with no cache attached stands in for another process.
    db.migrator().apply().await.unwrap();

    let notes = state.endpoints.endpoint("notes").await.unwrap();
    assert_eq!(state.schema.cached_version(), Some(4));
    let note = notes.create(&obj(json!({"body": "hello"}))).await.unwrap();
    assert_eq!(note["body"], json!("hello"));

    db.teardown().await;
}

#[tokio::test]
async fn reapplying_an_edited_version_refreshes_the_cache() {
    let Some(db) = common::setup("crud_reapply").await else { return };
    let state = db.migrated_state().await;
    state
        .endpoints
        .endpoint("users")
        .await
        .unwrap()
        .create(&obj(json!({"user_id": "u1"})))
        .await
        .unwrap();
    let before = state.endpoints.endpoint("event_log").await.unwrap();
    assert!(before.table().column("note").is_none());

    let other = db.migrator();
    assert_eq!(other.rollback_last().await.unwrap(), Some(3));
    db.write_script(
        "003_create_event_log.sql",
        "CREATE TABLE IF NOT EXISTS event_log (\n\
             event_id BIGSERIAL PRIMARY KEY,\n\
             user_id TEXT NOT NULL REFERENCES users (user_id),\n\
             event_type TEXT NOT NULL,\n\
             note TEXT\n\
         );\n\
         -- rollback:\n-- DROP TABLE IF EXISTS event_log;\n",
    );
    assert_eq!(other.apply().await.unwrap().applied, vec![3]);

    let events = state.endpoints.endpoint("event_log").await.unwrap();
    assert_eq!(state.schema.cached_version(), Some(3));
    let row = events
        .create(&obj(json!({"user_id": "u1", "event_type": "x", "note": "hi"})))
        .await
        .unwrap();
    assert_eq!(row["note"], json!("hi"));

    db.teardown().await;
}

const PRICES: &str = "CREATE TABLE IF NOT EXISTS prices (\n\
    price_id BIGSERIAL PRIMARY KEY,\n\
    code VARCHAR(3),\n\
    amount NUMERIC(30, 20),\n\
    ratio REAL\n\
);\n\
-- rollback:\n-- DROP TABLE IF EXISTS prices;\n";

#[tokio::test]
async fn decimals_and_reals_keep_their_written_digits() {
    let Some(db) = common::setup("crud_numeric").await else { return };
    db.write_script("004_create_prices.sql", PRICES);
    let state = db.migrated_state().await;
    let prices = state.endpoints.endpoint("prices").await.unwrap();

    let amount: Number = serde_json::from_str("1.23456789012345678901").unwrap();
    let row = prices
        .create(&obj(json!({"amount": amount.clone(), "ratio": 0.1})))
        .await
        .unwrap();
    assert_eq!(row["amount"], json!("1.23456789012345678901"));
    assert_eq!(row["ratio"].to_string(), "0.1");

    let listing = prices
        .list(&[FilterExpression::eq("amount", json!(amount))], &[], Page::default())
        .await
        .unwrap();
    assert_eq!(listing.total, 1);

    db.teardown().await;
}

#[tokio::test]
async fn value_too_long_is_a_type_mismatch() {
    let Some(db) = common::setup("crud_too_long").await else { return };
    db.write_script("004_create_prices.sql", PRICES);
    let state = db.migrated_state().await;
    let prices = state.endpoints.endpoint("prices").await.unwrap();

    let err = prices.create(&obj(json!({"code": "abcd"}))).await.unwrap_err();
    assert!(matches!(err, AppError::TypeMismatch { ref table, .. } if table == "prices"));
    assert!(prices.create(&obj(json!({"code": "abc"}))).await.is_ok());

    db.teardown().await;
}
