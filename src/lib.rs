//! Tusker - an ActivityPub federation engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor documents, inboxes                                 │
//! │  - Metrics, health                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Federation / Service Layer                      │
//! │  - HTTP signatures, remote resolution                       │
//! │  - Inbox processing, delivery queue processors              │
//! │  - Local follow/reaction/status actions                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and operations
//! - `service`: Local actions
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer and entity IDs
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like database pool, key cache, and HTTP client.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,

    /// Signed outbound requests
    pub delivery: federation::ActivityDelivery,

    /// Find-or-create for remote actors and statuses
    pub resolver: Arc<federation::RemoteResolver>,

    /// Signature keyId -> public key
    pub key_cache: Arc<federation::PublicKeyCache>,

    /// Inbox state machine
    pub processor: Arc<federation::ActivityProcessor>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Initialize HTTP client
    /// 3. Ensure the admin actor exists
    /// 4. Wire resolver, key cache and processor
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let timeout = Duration::from_secs(config.federation.request_timeout_seconds);
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(config.federation.user_agent.clone())
                .timeout(timeout * 3)
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );
        let delivery = federation::ActivityDelivery::new(http_client.clone(), timeout);

        // 3. Initialize admin actor
        let accounts = service::AccountService::new(
            db.clone(),
            config.server.clone(),
            config.federation.key_bits,
        );
        let admin = accounts.ensure_admin(&config.admin).await?;
        let signer = accounts.signer(&admin.name).await?;

        // 4. Federation components
        let resolver = Arc::new(federation::RemoteResolver::new(
            db.clone(),
            delivery.clone(),
            signer,
        ));
        let key_cache = Arc::new(federation::PublicKeyCache::new(
            resolver.clone(),
            Some(Duration::from_secs(config.federation.key_cache_ttl_seconds)),
        ));
        let mut processor = federation::ActivityProcessor::new(db.clone(), resolver.clone());
        if config.federation.send_accept {
            processor = processor.with_delivery(delivery.clone(), timeout);
        }

        tracing::info!(admin = %admin.uri, "Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            delivery,
            resolver,
            key_cache,
            processor: Arc::new(processor),
        })
    }

    /// Shared context for the delivery queue processors
    pub fn queue_context(&self) -> federation::QueueContext {
        federation::QueueContext::new(
            self.db.clone(),
            self.delivery.clone(),
            self.resolver.clone(),
            &self.config.federation,
        )
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    Router::new()
        .merge(api::activitypub_router())
        .merge(api::operations_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn create_test_state() -> (AppState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: temp_dir.path().join("router.db"),
            },
            admin: config::AdminConfig {
                username: "admin".to_string(),
                display_name: "Admin".to_string(),
                note: None,
            },
            federation: config::FederationConfig {
                delivery_interval_seconds: 30,
                batch_size: 50,
                max_attempts: 3,
                request_timeout_seconds: 5,
                key_bits: 1024,
                key_cache_ttl_seconds: 60,
                send_accept: true,
                user_agent: "Tusker/test".to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        (AppState::new(config).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn router_serves_health_and_admin_actor() {
        let (state, _temp_dir) = create_test_state().await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/users/admin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/users/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn restart_keeps_admin_identity() {
        let (state, _temp_dir) = create_test_state().await;
        let first = state.db.get_local_actor("admin").await.unwrap().unwrap();

        let again = AppState::new((*state.config).clone()).await.unwrap();
        let second = again.db.get_local_actor("admin").await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.public_key_pem, second.public_key_pem);
    }
}
