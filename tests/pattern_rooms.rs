//! Integration tests for pattern rooms: aggregation and live updates.

mod common;

use common::{Recorder, TestBackend};
use roomsync::{RoomError, RoomOptions};
use serde_json::json;

#[tokio::test]
async fn test_pattern_room_aggregates_snapshots() {
    let backend = TestBackend::new();

    backend
        .service
        .publish("p:a", json!({"val1": 100}), None)
        .await
        .expect("publish to p:a failed");
    backend
        .service
        .publish("p:b", json!({"val2": 200}), None)
        .await
        .expect("publish to p:b failed");

    let room = backend
        .service
        .get_room("p:*", RoomOptions::default())
        .expect("get_room failed");
    let recorder = Recorder::new();
    room.join("watcher", recorder.callback(), None).await.expect("join failed");

    assert_eq!(recorder.len(), 1);
    let (full_data, update) = recorder.calls().remove(0);
    assert!(update.is_none());
    assert_eq!(full_data["val1"], json!("100"));
    assert_eq!(full_data["val2"], json!("200"));

    // A later publish to one matching literal room flows through the
    // pattern subscription.
    backend
        .service
        .publish("p:a", json!({"val1": 111}), None)
        .await
        .expect("second publish failed");

    assert!(common::wait_for(|| recorder.len() == 2).await, "pattern update missed");
    let calls = recorder.calls();
    let update = calls[1].1.clone().expect("live update missing");
    assert_eq!(update["val1"], json!(111));
}

#[tokio::test]
async fn test_pattern_room_aggregates_history_sorted_by_timestamp() {
    let backend = TestBackend::new();
    let opts = Some(roomsync::manager::PublishOptions {
        enable_full_data: true,
        history_length: 10,
    });

    backend
        .service
        .publish("p:a", json!({"timestamp": 100, "ev": "first"}), opts)
        .await
        .unwrap();
    backend
        .service
        .publish("p:b", json!({"timestamp": 300, "ev": "third"}), opts)
        .await
        .unwrap();
    backend
        .service
        .publish("p:a", json!({"timestamp": 200, "ev": "second"}), opts)
        .await
        .unwrap();

    let room = backend
        .service
        .get_room(
            "p:*",
            RoomOptions {
                history_length: 10,
                ..RoomOptions::default()
            },
        )
        .expect("get_room failed");

    let history = room.get_history_data().await.expect("history read failed");
    assert_eq!(history.len(), 3);
    assert_eq!(history[0]["ev"], json!("third"));
    assert_eq!(history[1]["ev"], json!("second"));
    assert_eq!(history[2]["ev"], json!("first"));
}

#[tokio::test]
async fn test_pattern_history_respects_cap() {
    let backend = TestBackend::new();
    let opts = Some(roomsync::manager::PublishOptions {
        enable_full_data: true,
        history_length: 10,
    });

    for i in 0..4 {
        backend
            .service
            .publish("p:a", json!({"timestamp": i, "seq": i}), opts)
            .await
            .unwrap();
    }

    let room = backend
        .service
        .get_room(
            "p:*",
            RoomOptions {
                history_length: 2,
                ..RoomOptions::default()
            },
        )
        .expect("get_room failed");

    let history = room.get_history_data().await.expect("history read failed");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["seq"], json!(3));
    assert_eq!(history[1]["seq"], json!(2));
}

#[tokio::test]
async fn test_pattern_room_cannot_be_producer() {
    let backend = TestBackend::new();

    let err = backend
        .service
        .create_room("x*", RoomOptions::default())
        .unwrap_err();
    assert!(matches!(err, RoomError::PatternNotAllowedForProducer(_)));

    // A pattern consumer cannot publish either.
    let room = backend
        .service
        .get_room("x*", RoomOptions::default())
        .expect("get_room failed");
    let err = room.publish(json!({"a": 1}), None).await.unwrap_err();
    assert!(matches!(err, RoomError::NotAProducer(_)));
}

#[tokio::test]
async fn test_unreadable_key_is_skipped_during_aggregation() {
    let backend = TestBackend::new();

    backend
        .service
        .publish("p:a", json!({"val1": 1}), None)
        .await
        .unwrap();
    backend
        .service
        .publish("p:b", json!({"val2": 2}), None)
        .await
        .unwrap();

    // One of the two snapshot reads fails; the aggregation keeps going and
    // the surviving key is still merged.
    backend.store.fail_next_hash_read();

    let room = backend
        .service
        .get_room("p:*", RoomOptions::default())
        .expect("get_room failed");
    let full_data = room.get_full_data().await.expect("aggregation should survive");
    assert_eq!(full_data.len(), 1);
}
