// Licensed under the MIT License.

//! Integration tests driven entirely through the public API, against
//! [`InMemoryStore`].

use std::time::Duration;

use dlm_core::store::StoreAdapter;
use dlm_core::store::memory::InMemoryStore;
use dlm_core::{ErrorKind, FakeClock, LockParamsBuilder, Session};

fn session() -> Session<InMemoryStore, FakeClock> {
    Session::with_clock("table-a", InMemoryStore::new(), FakeClock::new(0, "test-host"))
}

#[tokio::test]
async fn uncontended_acquire_then_release_round_trips() {
    let session = session();
    let params = LockParamsBuilder::default()
        .lease(Duration::from_secs(20))
        .refresh_period(Duration::from_secs(5))
        .build()
        .unwrap();
    let handle = session.create_lock("lock-a", params);

    handle.acquire().await.unwrap();
    assert!(handle.is_held().await);

    handle.release().await;
    assert!(!handle.is_held().await);

    session.close().await;
}

#[tokio::test]
async fn second_acquirer_waits_then_succeeds_after_release() {
    let session = session();
    let params = LockParamsBuilder::default()
        .lease(Duration::from_secs(1))
        .refresh_period(Duration::from_millis(400))
        .build()
        .unwrap();

    let first = session.create_lock("lock-a", params.clone());
    let second = session.create_lock("lock-a", params);

    first.acquire().await.unwrap();

    let release_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.release().await;
    });

    second.acquire().await.unwrap();
    assert!(second.is_held().await);

    release_task.await.unwrap();
    session.close().await;
}

#[tokio::test]
async fn serialize_detaches_and_deserialize_succeeds_exactly_once() {
    let session = session();
    let params = LockParamsBuilder::default().build().unwrap();
    let source = session.create_lock("lock-a", params);
    source.acquire().await.unwrap();

    let token = source.serialize().await.unwrap();

    let first_deserialize = session.deserialize_lock(&token).await;
    assert!(first_deserialize.is_ok());
    let target = first_deserialize.unwrap();
    assert!(target.is_held().await);

    let second_deserialize = session.deserialize_lock(&token).await;
    let err = second_deserialize.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::AlreadyInUse(_)));

    target.release().await;
    session.close().await;
}

#[tokio::test]
async fn deserialize_rejects_a_token_for_another_table() {
    let source_session = session();
    let params = LockParamsBuilder::default().build().unwrap();
    let source = source_session.create_lock("lock-a", params);
    source.acquire().await.unwrap();
    let token = source.serialize().await.unwrap();

    let other_store = InMemoryStore::new();
    let other_clock = FakeClock::new(0, "test-host");
    let other_session = Session::with_clock("table-b", other_store, other_clock);

    let err = other_session.deserialize_lock(&token).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::WrongTable {
            expected,
            actual,
        } if expected == "table-b" && actual == "table-a"
    ));

    source_session.close().await;
    other_session.close().await;
}

#[tokio::test]
async fn deserialize_rejects_malformed_tokens() {
    let session = session();

    let not_json = session.deserialize_lock("not json at all").await.unwrap_err();
    assert!(matches!(not_json.kind(), ErrorKind::MalformedToken(_)));

    let missing_fields = session
        .deserialize_lock(r#"{"table":"table-a","name":"lock-a"}"#)
        .await
        .unwrap_err();
    assert!(matches!(missing_fields.kind(), ErrorKind::MalformedToken(_)));

    let unknown_field = session
        .deserialize_lock(
            r#"{"table":"table-a","name":"lock-a","version":"v1","lease":20,"refresh_period":5,"extra":true}"#,
        )
        .await
        .unwrap_err();
    assert!(matches!(unknown_field.kind(), ErrorKind::MalformedToken(_)));

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn acquire_times_out_against_a_lock_that_is_never_released() {
    let store = InMemoryStore::new();
    let clock = FakeClock::new(0, "test-host");
    store
        .put_if_absent(
            "lock-a",
            dlm_core::store::LockRecord {
                lease_duration: 3600,
                version_number: "held-forever".to_string(),
                host_identifier: "other-host".to_string(),
            },
        )
        .await
        .unwrap();

    let session = Session::with_clock("table-a", store, clock);
    let params = LockParamsBuilder::default()
        .lease(Duration::from_secs(20))
        .refresh_period(Duration::from_secs(5))
        .acquire_timeout(Some(Duration::from_secs(30)))
        .build()
        .unwrap();
    let handle = session.create_lock("lock-a", params);

    let err = handle.acquire().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::AcquireTimeout(_)));

    session.close().await;
}
