use super::harness::{build_backend, next_json};
use crate::app::{RegisterRequest, router};
use serde_json::json;
use sotto_storage::CredentialStore;

#[tokio::test]
async fn offline_receiver_gets_store_and_forward() {
    let backend = build_backend();
    let app = backend.app();
    let (alice, _) = backend.register("alice", "Sup3rSecret").await;
    let (bob, _) = backend
        .register_with(RegisterRequest {
            name: "bob".to_string(),
            password: "Sup3rSecret".to_string(),
            identity_key: None,
            registration_id: None,
            notification_token: Some("bob-device".to_string()),
        })
        .await;
    let alice_record = backend.store.find_user_by_id(&alice.id).await.unwrap();
    let (alice_tx, mut alice_rx) = backend.connect_user(&alice.id, "s-alice").await;

    let frame = json!({"id": "m1", "content": "hi", "receiver": "bob"}).to_string();
    router::handle_frame(&backend.state, &alice_record, frame.as_bytes(), &alice_tx)
        .await
        .unwrap();

    let sent = next_json(&mut alice_rx).await;
    assert_eq!(sent, json!({"messageId": "m1", "state": "sent"}));
    let received = next_json(&mut alice_rx).await;
    assert_eq!(received, json!({"messageId": "m1", "state": "received"}));

    let pending = backend
        .store
        .find_pending_messages_for_user(&bob.id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, "m1");
    assert_eq!(pending[0].content, "hi");
    assert_eq!(pending[0].sender_name, "alice");

    let statuses = backend
        .store
        .find_message_statuses_for_user(&alice.id)
        .await
        .unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, "received");

    // Push fallback fired for the offline receiver.
    for _ in 0..64 {
        if !backend.push.notifications().await.is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let pushes = backend.push.notifications().await;
    assert_eq!(pushes, vec![("bob-device".to_string(), "alice".to_string())]);

    // The HTTP-side fetch drains the queue exactly once.
    let outcome = app.issue_tokens("bob", "Sup3rSecret", None).await.unwrap();
    let crate::app::LoginOutcome::Tokens(bob_grant) = outcome else {
        panic!("expected tokens");
    };
    let bob_context = app.authenticate(Some(&bob_grant.access_token)).await.unwrap();
    let fetched = app.fetch_pending_messages(&bob_context, "bob").await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].sender, "alice");
    let again = app.fetch_pending_messages(&bob_context, "bob").await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn online_receiver_gets_direct_delivery() {
    let backend = build_backend();
    let (alice, _) = backend.register("alice", "Sup3rSecret").await;
    let (bob, _) = backend.register("bob", "Sup3rSecret").await;
    let alice_record = backend.store.find_user_by_id(&alice.id).await.unwrap();
    let (alice_tx, mut alice_rx) = backend.connect_user(&alice.id, "s-alice").await;
    let (_bob_tx, mut bob_rx) = backend.connect_user(&bob.id, "s-bob").await;

    let frame = json!({"id": "m2", "content": "hi", "receiver": "bob"}).to_string();
    router::handle_frame(&backend.state, &alice_record, frame.as_bytes(), &alice_tx)
        .await
        .unwrap();

    let delivered = next_json(&mut bob_rx).await;
    assert_eq!(
        delivered,
        json!({"id": "m2", "content": "hi", "sender": "alice"})
    );
    assert!(delivered.get("receiver").is_none());

    let sent = next_json(&mut alice_rx).await;
    assert_eq!(sent["state"], json!("sent"));
    let done = next_json(&mut alice_rx).await;
    assert_eq!(done, json!({"messageId": "m2", "state": "delivered"}));

    // Low-latency path writes nothing durable.
    let pending = backend
        .store
        .find_pending_messages_for_user(&bob.id)
        .await
        .unwrap();
    assert!(pending.is_empty());
    let statuses = backend
        .store
        .find_message_statuses_for_user(&alice.id)
        .await
        .unwrap();
    assert!(statuses.is_empty());
}

#[tokio::test]
async fn unknown_receiver_answers_error_status() {
    let backend = build_backend();
    let (alice, _) = backend.register("alice", "Sup3rSecret").await;
    let alice_record = backend.store.find_user_by_id(&alice.id).await.unwrap();
    let (alice_tx, mut alice_rx) = backend.connect_user(&alice.id, "s-alice").await;

    let frame = json!({"id": "m3", "content": "hi", "receiver": "nobody"}).to_string();
    router::handle_frame(&backend.state, &alice_record, frame.as_bytes(), &alice_tx)
        .await
        .unwrap();

    let sent = next_json(&mut alice_rx).await;
    assert_eq!(sent["state"], json!("sent"));
    let error = next_json(&mut alice_rx).await;
    assert_eq!(error["messageId"], json!("m3"));
    assert_eq!(error["state"], json!("error"));
    assert_eq!(error["error"], json!("Receiver not found"));
}

#[tokio::test]
async fn malformed_frame_keeps_connection_usable() {
    let backend = build_backend();
    backend.register("bob", "Sup3rSecret").await;
    let (alice, _) = backend.register("alice", "Sup3rSecret").await;
    let alice_record = backend.store.find_user_by_id(&alice.id).await.unwrap();
    let (alice_tx, mut alice_rx) = backend.connect_user(&alice.id, "s-alice").await;

    router::handle_frame(&backend.state, &alice_record, b"{not json", &alice_tx)
        .await
        .unwrap();
    let error = next_json(&mut alice_rx).await;
    assert_eq!(error, json!({"error": "Invalid message payload"}));

    // The same connection still routes messages afterwards.
    let frame = json!({"id": "m4", "content": "still here", "receiver": "bob"}).to_string();
    router::handle_frame(&backend.state, &alice_record, frame.as_bytes(), &alice_tx)
        .await
        .unwrap();
    let sent = next_json(&mut alice_rx).await;
    assert_eq!(sent["state"], json!("sent"));
}

#[tokio::test]
async fn status_updates_route_to_observer() {
    let backend = build_backend();
    let (alice, _) = backend.register("alice", "Sup3rSecret").await;
    let (bob, _) = backend.register("bob", "Sup3rSecret").await;
    let bob_record = backend.store.find_user_by_id(&bob.id).await.unwrap();
    let (_alice_tx, mut alice_rx) = backend.connect_user(&alice.id, "s-alice").await;
    let (bob_tx, _bob_rx) = backend.connect_user(&bob.id, "s-bob").await;

    // Bob acknowledges having read m2; alice is live and sees it directly.
    let update = json!({"id": "m2", "receiver": "alice", "state": "read"}).to_string();
    router::handle_frame(&backend.state, &bob_record, update.as_bytes(), &bob_tx)
        .await
        .unwrap();
    let observed = next_json(&mut alice_rx).await;
    assert_eq!(observed, json!({"messageId": "m2", "state": "read"}));
    let stored = backend
        .store
        .find_message_statuses_for_user(&alice.id)
        .await
        .unwrap();
    assert!(stored.is_empty());

    // With alice offline the observation is persisted for her next fetch.
    backend.state.presence.disconnect(&alice.id, "s-alice").await;
    let update = json!({"id": "m5", "receiver": "alice", "state": "read"}).to_string();
    router::handle_frame(&backend.state, &bob_record, update.as_bytes(), &bob_tx)
        .await
        .unwrap();
    let stored = backend
        .store
        .find_message_statuses_for_user(&alice.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message_id, "m5");
    assert_eq!(stored[0].state, "read");
}

#[tokio::test]
async fn stale_handle_falls_back_to_storage() {
    let backend = build_backend();
    let (alice, _) = backend.register("alice", "Sup3rSecret").await;
    let (bob, _) = backend.register("bob", "Sup3rSecret").await;
    let alice_record = backend.store.find_user_by_id(&alice.id).await.unwrap();
    let (alice_tx, mut alice_rx) = backend.connect_user(&alice.id, "s-alice").await;
    let (_bob_tx, bob_rx) = backend.connect_user(&bob.id, "s-bob").await;
    drop(bob_rx);

    let frame = json!({"id": "m6", "content": "hi", "receiver": "bob"}).to_string();
    router::handle_frame(&backend.state, &alice_record, frame.as_bytes(), &alice_tx)
        .await
        .unwrap();

    let sent = next_json(&mut alice_rx).await;
    assert_eq!(sent["state"], json!("sent"));
    let received = next_json(&mut alice_rx).await;
    assert_eq!(received["state"], json!("received"));
    let pending = backend
        .store
        .find_pending_messages_for_user(&bob.id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, "m6");
}

#[tokio::test]
async fn duplicate_message_id_stores_once() {
    let backend = build_backend();
    let (alice, _) = backend.register("alice", "Sup3rSecret").await;
    let (bob, _) = backend.register("bob", "Sup3rSecret").await;
    let alice_record = backend.store.find_user_by_id(&alice.id).await.unwrap();
    let (alice_tx, _alice_rx) = backend.connect_user(&alice.id, "s-alice").await;

    let frame = json!({"id": "m7", "content": "hi", "receiver": "bob"}).to_string();
    router::handle_frame(&backend.state, &alice_record, frame.as_bytes(), &alice_tx)
        .await
        .unwrap();
    router::handle_frame(&backend.state, &alice_record, frame.as_bytes(), &alice_tx)
        .await
        .unwrap();

    let pending = backend
        .store
        .find_pending_messages_for_user(&bob.id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}
