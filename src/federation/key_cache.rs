//! Public Key Caching
//!
//! Caches resolved public keys to avoid a database round-trip and key
//! parse on every inbound request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rsa::RsaPublicKey;
use tokio::sync::RwLock;

use super::resolver::RemoteResolver;
use super::signature::{KeyResolver, actor_uri_from_key_id, parse_public_key_pem};
use crate::error::AppError;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    key: RsaPublicKey,
    /// When this entry was cached
    cached_at: Instant,
    ttl: Duration,
}

impl CachedKey {
    /// Check if this cache entry is still valid
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Public key cache
///
/// Thread-safe cache keyed by signature `keyId`. Misses go through the
/// Remote Resolver, so the first signed request from an unknown actor
/// materializes that actor.
pub struct PublicKeyCache {
    /// Cache storage: key_id -> cached key
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    resolver: Arc<RemoteResolver>,
    default_ttl: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `resolver` - Resolver used for actors not yet known locally
    /// * `default_ttl` - TTL for cached keys (default: 1 hour)
    pub fn new(resolver: Arc<RemoteResolver>, default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            resolver,
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get the public key for a key ID
    ///
    /// Checks cache first, resolves the owning actor if not cached or
    /// expired.
    ///
    /// # Arguments
    /// * `key_id` - Full URL to the key (e.g., actor#main-key)
    pub async fn get(&self, key_id: &str) -> Result<RsaPublicKey, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if cached.is_valid() {
                    tracing::debug!(key_id, "Public key cache hit");
                    return Ok(cached.key.clone());
                }
                tracing::debug!(key_id, "Public key cache expired");
            }
        }

        let actor_uri = actor_uri_from_key_id(key_id);
        let actor = self.resolver.resolve_actor(actor_uri).await?;
        if actor.public_key_pem.is_empty() {
            return Err(AppError::Signature(format!(
                "Actor {} publishes no public key",
                actor.uri
            )));
        }
        let key = parse_public_key_pem(&actor.public_key_pem)?;

        {
            let mut cache = self.cache.write().await;
            // Sweep expired entries on every insert
            let before = cache.len();
            cache.retain(|_, v| v.is_valid());
            let evicted = before - cache.len();
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted expired public key cache entries");
            }
            cache.insert(
                key_id.to_string(),
                CachedKey {
                    key: key.clone(),
                    cached_at: Instant::now(),
                    ttl: self.default_ttl,
                },
            );
        }

        Ok(key)
    }

    /// Invalidate a cached key
    ///
    /// Called when a signature fails against the cached key, which usually
    /// means the remote actor rotated it.
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!(key_id, "Invalidated public key cache entry");
    }
}

#[async_trait]
impl KeyResolver for PublicKeyCache {
    async fn public_key(&self, key_id: &str) -> Result<RsaPublicKey, AppError> {
        self.get(key_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Database;
    use crate::federation::test_support::FakeRemote;
    use crate::federation::{ActivityDelivery, Signer};
    use rsa::RsaPrivateKey;
    use tempfile::TempDir;

    async fn create_test_cache(ttl: Duration) -> (PublicKeyCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("key_cache_test.db"))
                .await
                .unwrap(),
        );
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let delivery = ActivityDelivery::new(
            Arc::new(reqwest::Client::new()),
            Duration::from_secs(1),
        );
        let signer = Signer::new("http://localhost/users/admin", private_key);
        let resolver = Arc::new(RemoteResolver::new(db, delivery, signer));
        (PublicKeyCache::new(resolver, Some(ttl)), temp_dir)
    }

    async fn insert_entry(cache: &PublicKeyCache, key_id: &str) {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let mut entries = cache.cache.write().await;
        entries.insert(
            key_id.to_string(),
            CachedKey {
                key: RsaPublicKey::from(&private_key),
                cached_at: Instant::now(),
                ttl: cache.default_ttl,
            },
        );
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let remote = FakeRemote::start().await;
        let alice = remote.publish_actor("alice");
        let (cache, _temp_dir) = create_test_cache(Duration::from_millis(100)).await;
        insert_entry(&cache, "stale-key").await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        // A miss that inserts also sweeps out what has expired
        let key_id = format!("{}#main-key", alice);
        cache.get(&key_id).await.unwrap();
        let entries = cache.cache.read().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&key_id));
    }

    #[tokio::test]
    async fn cached_key_is_served_without_resolving() {
        let (cache, _temp_dir) = create_test_cache(Duration::from_secs(60)).await;
        // Unroutable owner: a resolve attempt would fail.
        let key_id = "http://127.0.0.1:9/users/alice#main-key";
        insert_entry(&cache, key_id).await;

        assert!(cache.public_key(key_id).await.is_ok());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let (cache, _temp_dir) = create_test_cache(Duration::from_secs(60)).await;
        insert_entry(&cache, "key-a").await;
        insert_entry(&cache, "key-b").await;

        cache.invalidate("key-a").await;
        let entries = cache.cache.read().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("key-b"));
    }
}
