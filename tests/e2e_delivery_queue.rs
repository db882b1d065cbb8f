//! E2E tests for the delivery queue processors

mod common;

use std::time::Duration;

use common::{RemoteServer, TestServer};
use tokio_util::sync::CancellationToken;
use tusker::data::{ReactionRequest, RelationshipRequest};
use tusker::federation::{self, RelationshipDelivery, Scope};
use tusker::service::{ReactionService, RelationshipService};

#[tokio::test]
async fn test_follow_is_delivered_to_remote_inbox() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");

    let db = server.state.db.clone();
    let target = server.state.resolver.resolve_actor(&alice.uri).await.unwrap();
    let admin = db.get_local_actor("testuser").await.unwrap().unwrap();

    RelationshipService::new(db.clone())
        .follow(admin.id, target.id)
        .await
        .unwrap();

    let handler = RelationshipDelivery::new(db.clone(), server.state.delivery.clone());
    let report = federation::process::<RelationshipRequest, _>(&db, &handler, Scope::default())
        .await
        .unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.delivered, 1);

    let received = remote.received();
    assert_eq!(received.len(), 1);
    let (path, activity) = &received[0];
    assert_eq!(path, "/users/alice/inbox");
    assert_eq!(activity["type"], "Follow");
    assert_eq!(activity["actor"], admin.uri);
    assert_eq!(activity["object"], alice.uri);

    assert!(
        db.list_requests::<RelationshipRequest>()
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_spawned_processors_drain_queues() {
    let server = TestServer::new().await;
    let remote = RemoteServer::start().await;
    let alice = remote.publish_actor("alice");

    let db = server.state.db.clone();
    let author = server.state.resolver.resolve_actor(&alice.uri).await.unwrap();
    let admin = db.get_local_actor("testuser").await.unwrap().unwrap();

    // A remote status to favourite, as if it had arrived in the inbox.
    let note_uri = remote.uri("/notes/1");
    let activity = common::create_note(&alice.uri, &note_uri, "like me");
    let response = server
        .post_signed("/inbox", &activity, &alice.key_id, &alice.private_key)
        .await;
    assert_eq!(response.status(), 202);
    let status = db.get_status_by_uri(&note_uri).await.unwrap().unwrap();

    RelationshipService::new(db.clone())
        .follow(admin.id, author.id)
        .await
        .unwrap();
    ReactionService::new(db.clone())
        .favourite(admin.id, status.id)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handles = federation::spawn_all(&server.state.queue_context(), &cancel);

    let mut drained = false;
    for _ in 0..50 {
        let relationships = db.list_requests::<RelationshipRequest>().await.unwrap();
        let reactions = db.list_requests::<ReactionRequest>().await.unwrap();
        if relationships.is_empty() && reactions.is_empty() {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(drained, "queues should be drained by the processors");
    let types: Vec<String> = remote
        .received()
        .iter()
        .map(|(_, activity)| activity["type"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(types.contains(&"Follow".to_string()));
    assert!(types.contains(&"Like".to_string()));
}
