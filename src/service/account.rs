//! Account service
//!
//! Provisions local actors and their signing keys.

use std::sync::Arc;

use chrono::Utc;

use crate::config::{AdminConfig, ServerConfig};
use crate::data::{Account, Actor, ActorType, Database, EntityId, is_unique_violation};
use crate::error::AppError;
use crate::federation::Signer;

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() {
        return Err(AppError::Validation("username cannot be empty".to_string()));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::Validation(format!(
            "username {:?} may only contain letters, digits and underscores",
            username
        )));
    }
    Ok(())
}

/// Account service
pub struct AccountService {
    db: Arc<Database>,
    server: ServerConfig,
    key_bits: usize,
}

impl AccountService {
    /// Create new account service
    ///
    /// # Arguments
    /// * `server` - Used to mint actor URIs
    /// * `key_bits` - RSA modulus size for new keypairs
    pub fn new(db: Arc<Database>, server: ServerConfig, key_bits: usize) -> Self {
        Self {
            db,
            server,
            key_bits,
        }
    }

    /// Make sure the configured admin actor exists
    ///
    /// Created on first start; later starts only sync the display name and
    /// note from config.
    pub async fn ensure_admin(&self, admin: &AdminConfig) -> Result<Actor, AppError> {
        let note = admin.note.clone().unwrap_or_default();

        if let Some(mut actor) = self.db.get_local_actor(&admin.username).await? {
            if actor.display_name != admin.display_name || actor.note != note {
                actor.display_name = admin.display_name.clone();
                actor.note = note;
                self.db.update_actor_profile(&actor).await?;
                tracing::info!(username = %actor.name, "Updated admin profile from config");
            }
            return Ok(actor);
        }

        let actor = self
            .provision(&admin.username, ActorType::LocalPerson, &admin.display_name, &note)
            .await?;
        tracing::info!(username = %actor.name, actor_uri = %actor.uri, "Created admin actor");
        Ok(actor)
    }

    /// Provision another local actor with its own keypair
    ///
    /// # Errors
    /// `Validation` for a malformed or taken username, or a non-local kind
    pub async fn create_local_actor(
        &self,
        username: &str,
        kind: ActorType,
    ) -> Result<Actor, AppError> {
        if !kind.is_local() {
            return Err(AppError::Validation(format!(
                "{:?} is not a local actor type",
                kind
            )));
        }
        self.provision(username, kind, username, "").await
    }

    /// Signing identity of a local actor
    pub async fn signer(&self, username: &str) -> Result<Signer, AppError> {
        let actor = self
            .db
            .get_local_actor(username)
            .await?
            .ok_or(AppError::NotFound)?;
        let account = self
            .db
            .get_account(actor.id)
            .await?
            .ok_or(AppError::NotFound)?;
        Signer::for_actor(&actor, &account)
    }

    /// Queue a re-fetch of a remote actor's document
    pub async fn request_actor_refresh(&self, actor_id: i64) -> Result<(), AppError> {
        let actor = self.db.get_actor(actor_id).await?.ok_or(AppError::NotFound)?;
        if actor.is_local() {
            return Err(AppError::Validation(format!(
                "{} is a local actor",
                actor.uri
            )));
        }
        self.db.upsert_actor_refresh_request(actor.id).await
    }

    async fn provision(
        &self,
        username: &str,
        kind: ActorType,
        display_name: &str,
        note: &str,
    ) -> Result<Actor, AppError> {
        let username = username.trim();
        validate_username(username)?;

        // Fast-path guard before expensive key generation.
        if self.db.get_local_actor(username).await?.is_some() {
            return Err(AppError::Validation(format!(
                "local actor {} already exists",
                username
            )));
        }

        let key_bits = self.key_bits;
        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(move || -> Result<(String, String), anyhow::Error> {
                use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
                use rsa::{RsaPrivateKey, RsaPublicKey};

                let mut rng = rand::thread_rng();
                let private_key = RsaPrivateKey::new(&mut rng, key_bits)?;
                let public_key = RsaPublicKey::from(&private_key);
                let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
                let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
                Ok((private_key_pem, public_key_pem))
            })
            .await
            .map_err(|e| AppError::Internal(e.into()))?
            .map_err(AppError::Internal)?;

        let uri = self.server.actor_uri(username);
        let now = Utc::now();
        let actor = Actor {
            id: EntityId::new().0,
            actor_type: kind,
            name: username.to_string(),
            domain: self.server.domain.clone(),
            uri: uri.clone(),
            url: Some(uri.clone()),
            display_name: display_name.to_string(),
            note: note.to_string(),
            avatar: None,
            header: None,
            locked: false,
            followers_count: 0,
            following_count: 0,
            statuses_count: 0,
            last_status_at: None,
            public_key_pem,
            inbox: format!("{}/inbox", uri),
            shared_inbox: Some(format!("{}/inbox", self.server.base_url())),
            outbox: Some(format!("{}/outbox", uri)),
            followers: Some(format!("{}/followers", uri)),
            following: Some(format!("{}/following", uri)),
            featured: Some(format!("{}/collections/featured", uri)),
            attributes: "[]".to_string(),
            created_at: now,
            updated_at: now,
        };
        let account = Account {
            actor_id: actor.id,
            private_key_pem,
            created_at: now,
        };

        match self.db.create_local_actor(&actor, &account).await {
            Ok(()) => Ok(actor),
            Err(error) if is_unique_violation(&error) => Err(AppError::Validation(format!(
                "local actor {} already exists",
                username
            ))),
            Err(error) => Err(error),
        }
    }
}
