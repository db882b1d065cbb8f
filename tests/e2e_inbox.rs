//! E2E tests for the ActivityPub inbox and actor endpoints

mod common;

use common::{RemoteServer, TestServer, create_note};
use serde_json::{Value, json};
use tusker::data::ActorRefreshRequest;

#[tokio::test]
async fn test_actor_endpoint() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/users/testuser"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("activitystreams"))
    );

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Person");
    assert_eq!(json["id"], "http://localhost/users/testuser");
    assert_eq!(json["preferredUsername"], "testuser");
    assert_eq!(json["endpoints"]["sharedInbox"], "http://localhost/inbox");
    assert_eq!(
        json["publicKey"]["id"],
        "http://localhost/users/testuser#main-key"
    );
    assert!(
        json["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY")
    );
}

#[tokio::test]
async fn test_actor_endpoint_unknown_user() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/users/nobody"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_signed_create_is_accepted_and_stored() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");

    let note_uri = remote.uri("/notes/1");
    let activity = create_note(&alice.uri, &note_uri, "<p>hello from afar</p>");
    let response = server
        .post_signed("/inbox", &activity, &alice.key_id, &alice.private_key)
        .await;

    assert_eq!(response.status(), 202);

    let status = server
        .state
        .db
        .get_status_by_uri(&note_uri)
        .await
        .unwrap()
        .expect("status should be materialized");
    assert!(status.content.contains("hello from afar"));

    let author = server
        .state
        .db
        .get_actor_by_uri(&alice.uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.actor_id, author.id);
    assert_eq!(author.statuses_count, 1);
}

#[tokio::test]
async fn test_signed_follow_to_personal_inbox() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}#follows/1", alice.uri),
        "type": "Follow",
        "actor": alice.uri,
        "object": "http://localhost/users/testuser"
    });
    let response = server
        .post_signed(
            "/users/testuser/inbox",
            &activity,
            &alice.key_id,
            &alice.private_key,
        )
        .await;
    assert_eq!(response.status(), 202);

    let db = &server.state.db;
    let follower = db.get_actor_by_uri(&alice.uri).await.unwrap().unwrap();
    let admin = db.get_local_actor("testuser").await.unwrap().unwrap();
    assert!(db.get_relationship(follower.id, admin.id).await.unwrap().following);
    assert!(db.get_relationship(admin.id, follower.id).await.unwrap().followed_by);
    assert_eq!(admin.followers_count, 1);
}

#[tokio::test]
async fn test_inbox_rejects_unsigned_activity() {
    let server = TestServer::new().await;

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Follow",
        "actor": "https://remote.example.com/users/alice",
        "object": "http://localhost/users/testuser"
    });

    let response = server
        .client
        .post(server.url("/users/testuser/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&activity)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_inbox_rejects_wrong_key_and_queues_refresh() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");
    let impostor = remote.publish_actor("impostor");

    let activity = create_note(&alice.uri, &remote.uri("/notes/1"), "forged");
    let response = server
        .post_signed("/inbox", &activity, &alice.key_id, &impostor.private_key)
        .await;

    assert_eq!(response.status(), 401);
    assert!(
        server
            .state
            .db
            .get_status_by_uri(&remote.uri("/notes/1"))
            .await
            .unwrap()
            .is_none()
    );

    // The key may have rotated: alice is re-fetched by the refresh processor.
    let refreshes = server
        .state
        .db
        .list_requests::<ActorRefreshRequest>()
        .await
        .unwrap();
    assert_eq!(refreshes.len(), 1);
}

#[tokio::test]
async fn test_inbox_rejects_signature_key_id_actor_mismatch() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");
    let bob = remote.publish_actor("bob");

    // Valid signature by bob over an activity claiming to be from alice.
    let activity = create_note(&alice.uri, &remote.uri("/notes/1"), "spoofed");
    let response = server
        .post_signed("/inbox", &activity, &bob.key_id, &bob.private_key)
        .await;

    assert_eq!(response.status(), 401);
    assert!(
        server
            .state
            .db
            .get_status_by_uri(&remote.uri("/notes/1"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_inbox_for_unknown_user_is_not_found() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");

    let activity = create_note(&alice.uri, &remote.uri("/notes/1"), "hello");
    let response = server
        .post_signed(
            "/users/nobody/inbox",
            &activity,
            &alice.key_id,
            &alice.private_key,
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_unprocessable_activity_is_still_acknowledged() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/flags/1", alice.uri),
        "type": "Flag",
        "actor": alice.uri,
        "object": "http://localhost/users/testuser"
    });
    let response = server
        .post_signed("/inbox", &activity, &alice.key_id, &alice.private_key)
        .await;

    assert_eq!(response.status(), 202);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = TestServer::new().await;

    let health = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // Touch a counted endpoint so the vector has a sample.
    server
        .client
        .get(server.url("/users/testuser"))
        .send()
        .await
        .unwrap();

    let metrics = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);
    let text = metrics.text().await.unwrap();
    assert!(text.contains("tusker_http_requests_total"));
}
