//! Relationship service
//!
//! Local follow, mute and block actions. Changes toward remote actors are
//! queued as relationship requests for the delivery processor.

use std::sync::Arc;

use crate::data::{Actor, Database, Relationship, RelationshipAction, RelationshipEdge};
use crate::error::AppError;

/// Load a local actor and a distinct target
pub(super) async fn load_pair(
    db: &Database,
    actor_id: i64,
    target_id: i64,
) -> Result<(Actor, Actor), AppError> {
    let actor = db.get_actor(actor_id).await?.ok_or(AppError::NotFound)?;
    if !actor.is_local() {
        return Err(AppError::Forbidden);
    }
    if actor_id == target_id {
        return Err(AppError::Validation(
            "an actor cannot target itself".to_string(),
        ));
    }
    let target = db.get_actor(target_id).await?.ok_or(AppError::NotFound)?;
    Ok((actor, target))
}

/// Relationship service
pub struct RelationshipService {
    db: Arc<Database>,
}

impl RelationshipService {
    /// Create new relationship service
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Follow an actor
    ///
    /// The pair is written immediately; remote targets also get a pending
    /// Follow delivery. Following an already-followed actor re-queues the
    /// delivery.
    pub async fn follow(&self, actor_id: i64, target_id: i64) -> Result<Relationship, AppError> {
        let (actor, target) = load_pair(&self.db, actor_id, target_id).await?;

        let current = self.db.get_relationship(actor.id, target.id).await?;
        if current.blocking || current.blocked_by {
            return Err(AppError::Forbidden);
        }

        let request = (!target.is_local()).then_some(RelationshipAction::Follow);
        self.db
            .set_relationship_with_request(actor.id, target.id, RelationshipEdge::Follow, true, request)
            .await?;

        tracing::info!(actor = %actor.uri, target = %target.uri, "Followed");
        self.db.get_relationship(actor.id, target.id).await
    }

    /// Unfollow an actor
    pub async fn unfollow(&self, actor_id: i64, target_id: i64) -> Result<Relationship, AppError> {
        let (actor, target) = load_pair(&self.db, actor_id, target_id).await?;

        let request = (!target.is_local()).then_some(RelationshipAction::Unfollow);
        self.db
            .set_relationship_with_request(actor.id, target.id, RelationshipEdge::Follow, false, request)
            .await?;

        tracing::info!(actor = %actor.uri, target = %target.uri, "Unfollowed");
        self.db.get_relationship(actor.id, target.id).await
    }

    /// Mute an actor (one-sided, never federated)
    pub async fn mute(&self, actor_id: i64, target_id: i64) -> Result<Relationship, AppError> {
        self.set_mute(actor_id, target_id, true).await
    }

    pub async fn unmute(&self, actor_id: i64, target_id: i64) -> Result<Relationship, AppError> {
        self.set_mute(actor_id, target_id, false).await
    }

    async fn set_mute(
        &self,
        actor_id: i64,
        target_id: i64,
        value: bool,
    ) -> Result<Relationship, AppError> {
        let (actor, target) = load_pair(&self.db, actor_id, target_id).await?;
        self.db
            .set_relationship(actor.id, target.id, RelationshipEdge::Mute, value)
            .await?;
        self.db.get_relationship(actor.id, target.id).await
    }

    /// Block an actor
    ///
    /// Drops the follow pair in both directions. If we were following a
    /// remote target, an Unfollow is queued for it.
    pub async fn block(&self, actor_id: i64, target_id: i64) -> Result<Relationship, AppError> {
        let (actor, target) = load_pair(&self.db, actor_id, target_id).await?;
        let before = self.db.get_relationship(actor.id, target.id).await?;

        let request =
            (before.following && !target.is_local()).then_some(RelationshipAction::Unfollow);
        self.db
            .set_relationship_with_request(actor.id, target.id, RelationshipEdge::Block, true, request)
            .await?;

        tracing::info!(actor = %actor.uri, target = %target.uri, "Blocked");
        self.db.get_relationship(actor.id, target.id).await
    }

    pub async fn unblock(&self, actor_id: i64, target_id: i64) -> Result<Relationship, AppError> {
        let (actor, target) = load_pair(&self.db, actor_id, target_id).await?;
        self.db
            .set_relationship(actor.id, target.id, RelationshipEdge::Block, false)
            .await?;
        self.db.get_relationship(actor.id, target.id).await
    }
}
