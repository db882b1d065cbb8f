//! Reaction service
//!
//! Favourite, bookmark and pin for local actors.

use std::sync::Arc;

use crate::data::{Actor, Database, Reaction, ReactionAction, ReactionFlag, Status};
use crate::error::AppError;

/// Reaction service
pub struct ReactionService {
    db: Arc<Database>,
}

impl ReactionService {
    /// Create new reaction service
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn load(&self, actor_id: i64, status_id: i64) -> Result<(Actor, Status), AppError> {
        let actor = self.db.get_actor(actor_id).await?.ok_or(AppError::NotFound)?;
        if !actor.is_local() {
            return Err(AppError::Forbidden);
        }
        let status = self
            .db
            .get_status(status_id)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok((actor, status))
    }

    async fn author_is_remote(&self, status: &Status) -> Result<bool, AppError> {
        let author = self
            .db
            .get_actor(status.actor_id)
            .await?
            .ok_or(AppError::NotFound)?;
        Ok(!author.is_local())
    }

    /// Favourite a status
    ///
    /// Statuses by remote authors also get a pending Like delivery.
    pub async fn favourite(&self, actor_id: i64, status_id: i64) -> Result<Reaction, AppError> {
        self.set_favourite(actor_id, status_id, true).await
    }

    pub async fn unfavourite(&self, actor_id: i64, status_id: i64) -> Result<Reaction, AppError> {
        self.set_favourite(actor_id, status_id, false).await
    }

    async fn set_favourite(
        &self,
        actor_id: i64,
        status_id: i64,
        value: bool,
    ) -> Result<Reaction, AppError> {
        let (actor, status) = self.load(actor_id, status_id).await?;

        self.db
            .set_reaction(actor.id, status.id, ReactionFlag::Favourited, value)
            .await?;
        if self.author_is_remote(&status).await? {
            let action = if value {
                ReactionAction::Like
            } else {
                ReactionAction::Unlike
            };
            self.db
                .upsert_reaction_request(actor.id, status.id, action)
                .await?;
        }

        self.db.get_reaction(actor.id, status.id).await
    }

    /// Bookmark a status (private, never federated)
    pub async fn bookmark(&self, actor_id: i64, status_id: i64) -> Result<Reaction, AppError> {
        let (actor, status) = self.load(actor_id, status_id).await?;
        self.db
            .set_reaction(actor.id, status.id, ReactionFlag::Bookmarked, true)
            .await?;
        self.db.get_reaction(actor.id, status.id).await
    }

    pub async fn unbookmark(&self, actor_id: i64, status_id: i64) -> Result<Reaction, AppError> {
        let (actor, status) = self.load(actor_id, status_id).await?;
        self.db
            .set_reaction(actor.id, status.id, ReactionFlag::Bookmarked, false)
            .await?;
        self.db.get_reaction(actor.id, status.id).await
    }

    /// Pin one of the actor's own statuses to its profile
    pub async fn pin(&self, actor_id: i64, status_id: i64) -> Result<Reaction, AppError> {
        self.set_pin(actor_id, status_id, true).await
    }

    pub async fn unpin(&self, actor_id: i64, status_id: i64) -> Result<Reaction, AppError> {
        self.set_pin(actor_id, status_id, false).await
    }

    async fn set_pin(&self, actor_id: i64, status_id: i64, value: bool) -> Result<Reaction, AppError> {
        let (actor, status) = self.load(actor_id, status_id).await?;
        if status.actor_id != actor.id {
            return Err(AppError::Forbidden);
        }
        if status.reblog_of_id.is_some() {
            return Err(AppError::Validation("reblogs cannot be pinned".to_string()));
        }

        self.db
            .set_reaction(actor.id, status.id, ReactionFlag::Pinned, value)
            .await?;
        self.db.get_reaction(actor.id, status.id).await
    }
}
