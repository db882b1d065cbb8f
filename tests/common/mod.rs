//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tusker::{AppState, config};

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            admin: config::AdminConfig {
                username: "testuser".to_string(),
                display_name: "Test User".to_string(),
                note: Some("Test account".to_string()),
            },
            federation: config::FederationConfig {
                delivery_interval_seconds: 1,
                batch_size: 50,
                max_attempts: 3,
                request_timeout_seconds: 5,
                key_bits: 1024,
                key_cache_ttl_seconds: 3600,
                send_accept: false,
                user_agent: "Tusker/test".to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        tusker::metrics::init_metrics();

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = tusker::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// POST an activity signed with `key_id` / `private_key`
    pub async fn post_signed(
        &self,
        path: &str,
        activity: &Value,
        key_id: &str,
        private_key: &RsaPrivateKey,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(self.url(path))
            .header(http::header::CONTENT_TYPE, "application/activity+json")
            .body(body)
            .unwrap();
        tusker::federation::sign_request(&mut request, key_id, private_key).unwrap();

        let (parts, body) = request.into_parts();
        self.client
            .post(self.url(path))
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

#[derive(Clone, Default)]
struct RemoteState {
    docs: Arc<Mutex<HashMap<String, Value>>>,
    inbox: Arc<Mutex<Vec<(String, Value)>>>,
}

async fn handle(State(state): State<RemoteState>, method: Method, uri: Uri, body: Bytes) -> Response {
    if method == Method::POST {
        let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);
        state
            .inbox
            .lock()
            .unwrap()
            .push((uri.path().to_string(), payload));
        return StatusCode::ACCEPTED.into_response();
    }

    let doc = state.docs.lock().unwrap().get(uri.path()).cloned();
    match doc {
        Some(doc) => Json(doc).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A remote fediverse server with one signing actor
pub struct RemoteServer {
    pub addr: SocketAddr,
    state: RemoteState,
}

/// Remote actor published by a [`RemoteServer`]
pub struct RemoteActor {
    pub uri: String,
    pub key_id: String,
    pub private_key: RsaPrivateKey,
}

impl RemoteServer {
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

    /// Publish a Person with a freshly generated keypair
    pub fn publish_actor(&self, name: &str) -> RemoteActor {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public_key_pem = rsa::RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();

        let path = format!("/users/{}", name);
        let uri = self.uri(&path);
        let key_id = format!("{}#main-key", uri);
        self.state.docs.lock().unwrap().insert(
            path,
            json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "id": uri,
                "type": "Person",
                "preferredUsername": name,
                "name": name,
                "inbox": format!("{}/inbox", uri),
                "followers": format!("{}/followers", uri),
                "publicKey": {
                    "id": key_id,
                    "owner": uri,
                    "publicKeyPem": public_key_pem
                }
            }),
        );

        RemoteActor {
            uri,
            key_id,
            private_key,
        }
    }

    /// Every POST this server received, as (path, body)
    pub fn received(&self) -> Vec<(String, Value)> {
        self.state.inbox.lock().unwrap().clone()
    }
}

/// A public Create{Note} authored by `actor`
pub fn create_note(actor: &str, note_uri: &str, content: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/activity", note_uri),
        "type": "Create",
        "actor": actor,
        "object": {
            "id": note_uri,
            "type": "Note",
            "attributedTo": actor,
            "content": content,
            "published": "2024-01-01T00:00:00Z",
            "to": ["https://www.w3.org/ns/activitystreams#Public"]
        }
    })
}
