//! Shared fixtures for federation unit tests

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

use super::delivery::{ActivityDelivery, Signer};
use super::resolver::RemoteResolver;
use super::vocab::PUBLIC_COLLECTION;
use crate::data::{Account, Actor, ActorType, Database, EntityId};

#[derive(Clone, Default)]
struct RemoteState {
    docs: Arc<Mutex<HashMap<String, Value>>>,
    media: Arc<Mutex<HashMap<String, (String, Vec<u8>)>>>,
    fetches: Arc<AtomicUsize>,
    inbox: Arc<Mutex<Vec<(String, Value)>>>,
    inbox_status: Arc<Mutex<Option<StatusCode>>>,
}

async fn handle(State(state): State<RemoteState>, method: Method, uri: Uri, body: Bytes) -> Response {
    if method == Method::POST {
        let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);
        state
            .inbox
            .lock()
            .unwrap()
            .push((uri.path().to_string(), payload));
        let status = state.inbox_status.lock().unwrap().unwrap_or(StatusCode::ACCEPTED);
        return status.into_response();
    }

    state.fetches.fetch_add(1, Ordering::SeqCst);
    let media = state.media.lock().unwrap().get(uri.path()).cloned();
    if let Some((content_type, bytes)) = media {
        return ([(header::CONTENT_TYPE, content_type)], bytes).into_response();
    }
    let doc = state.docs.lock().unwrap().get(uri.path()).cloned();
    match doc {
        Some(doc) => Json(doc).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// In-process stand-in for a remote fediverse server
///
/// Serves published documents on GET and records every POST.
pub struct FakeRemote {
    pub addr: SocketAddr,
    state: RemoteState,
}

impl FakeRemote {
    pub async fn start() -> Self {
        let state = RemoteState::default();
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn uri(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn publish(&self, path: &str, doc: Value) {
        self.state
            .docs
            .lock()
            .unwrap()
            .insert(path.to_string(), doc);
    }

    pub fn publish_media(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> String {
        self.state
            .media
            .lock()
            .unwrap()
            .insert(path.to_string(), (content_type.to_string(), bytes));
        self.uri(path)
    }

    pub fn unpublish(&self, path: &str) {
        self.state.docs.lock().unwrap().remove(path);
    }

    pub fn publish_actor(&self, name: &str) -> String {
        let path = format!("/users/{}", name);
        let uri = self.uri(&path);
        self.publish(
            &path,
            json!({
                "id": uri,
                "type": "Person",
                "preferredUsername": name,
                "name": name.to_uppercase(),
                "summary": "<p>bio</p><script>alert(1)</script>",
                "inbox": format!("{}/inbox", uri),
                "followers": format!("{}/followers", uri),
                "publicKey": {
                    "id": format!("{}#main-key", uri),
                    "owner": uri,
                    "publicKeyPem": test_public_key_pem()
                }
            }),
        );
        uri
    }

    pub fn publish_note(&self, path: &str, author: &str, in_reply_to: Option<String>) -> String {
        let uri = self.uri(path);
        self.publish(path, note_document(&uri, author, in_reply_to));
        uri
    }

    pub fn fetches(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<(String, Value)> {
        self.state.inbox.lock().unwrap().clone()
    }

    /// Status code answered to POSTs from now on
    pub fn fail_inbox_with(&self, status: StatusCode) {
        *self.state.inbox_status.lock().unwrap() = Some(status);
    }
}

pub fn note_document(uri: &str, author: &str, in_reply_to: Option<String>) -> Value {
    json!({
        "id": uri,
        "type": "Note",
        "attributedTo": author,
        "inReplyTo": in_reply_to,
        "published": "2024-01-01T00:00:00Z",
        "content": "<p>hello</p>",
        "to": [PUBLIC_COLLECTION],
    })
}

fn test_private_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
}

fn test_public_key_pem() -> String {
    rsa::RsaPublicKey::from(&test_private_key())
        .to_public_key_pem(LineEnding::LF)
        .unwrap()
}

pub async fn create_test_db() -> (Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::connect(&temp_dir.path().join("federation_test.db"))
        .await
        .unwrap();
    (Arc::new(db), temp_dir)
}

pub fn test_delivery() -> ActivityDelivery {
    ActivityDelivery::new(Arc::new(reqwest::Client::new()), Duration::from_secs(5))
}

pub fn test_signer() -> Signer {
    Signer::new("http://localhost/users/admin", test_private_key())
}

pub fn test_resolver(db: Arc<Database>) -> Arc<RemoteResolver> {
    Arc::new(RemoteResolver::new(db, test_delivery(), test_signer()))
}

fn actor_row(actor_type: ActorType, domain: &str, name: &str, public_key_pem: String) -> Actor {
    let uri = format!("http://{}/users/{}", domain, name);
    let now = Utc::now();
    Actor {
        id: EntityId::new().0,
        actor_type,
        name: name.to_string(),
        domain: domain.to_string(),
        uri: uri.clone(),
        url: Some(uri.clone()),
        display_name: name.to_string(),
        note: String::new(),
        avatar: None,
        header: None,
        locked: false,
        followers_count: 0,
        following_count: 0,
        statuses_count: 0,
        last_status_at: None,
        public_key_pem,
        inbox: format!("{}/inbox", uri),
        shared_inbox: Some(format!("http://{}/inbox", domain)),
        outbox: None,
        followers: Some(format!("{}/followers", uri)),
        following: Some(format!("{}/following", uri)),
        featured: None,
        attributes: "[]".to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// Insert a local actor with a fresh signing key
pub async fn insert_local_actor(db: &Database, name: &str) -> (Actor, Account) {
    let private_key = test_private_key();
    let public_key_pem = rsa::RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    let actor = actor_row(ActorType::LocalPerson, "localhost", name, public_key_pem);
    let now = Utc::now();
    let account = Account {
        actor_id: actor.id,
        private_key_pem: private_key
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap()
            .to_string(),
        created_at: now,
    };
    db.create_local_actor(&actor, &account).await.unwrap();
    (actor, account)
}

/// Insert a remote actor row without any network round-trip
pub async fn insert_remote_actor(db: &Database, domain: &str, name: &str) -> Actor {
    let actor = actor_row(ActorType::Person, domain, name, test_public_key_pem());
    db.insert_actor(&actor).await.unwrap();
    actor
}
