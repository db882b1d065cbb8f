//! Activity processing
//!
//! Handles incoming ActivityPub activities. Each activity type is a state;
//! the nested object type selects the transition.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::delivery::{ActivityDelivery, Signer, builder, spawn_best_effort_delivery};
use super::resolver::RemoteResolver;
use super::vocab::{ACTOR_TYPES, ActivityMeta, InboundActivity, ObjectRef, STATUS_TYPES, id_of};
use crate::data::{Actor, Database, EntityId, ReactionFlag, RelationshipEdge};
use crate::error::AppError;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

/// Our outbound Follow ids are `{actor}#follows/{target_id}`
fn follower_from_follow_id(follow_id: &str) -> Option<&str> {
    follow_id.split_once("#follows/").map(|(actor, _)| actor)
}

/// Activity processor
///
/// Processes incoming ActivityPub activities from inbox.
pub struct ActivityProcessor {
    db: Arc<Database>,
    resolver: Arc<RemoteResolver>,
    /// Activity delivery service for sending Accept responses
    delivery: Option<ActivityDelivery>,
    delivery_timeout: Duration,
}

impl ActivityProcessor {
    /// Create new activity processor
    pub fn new(db: Arc<Database>, resolver: Arc<RemoteResolver>) -> Self {
        Self {
            db,
            resolver,
            delivery: None,
            delivery_timeout: Duration::from_secs(10),
        }
    }

    /// Set activity delivery service
    ///
    /// This allows the processor to answer inbound Follows with an Accept.
    pub fn with_delivery(mut self, delivery: ActivityDelivery, timeout: Duration) -> Self {
        self.delivery = Some(delivery);
        self.delivery_timeout = timeout;
        self
    }

    /// Process an incoming activity
    ///
    /// # Arguments
    /// * `activity` - Raw JSON-LD activity
    /// * `actor_uri` - Verified actor URI (owner of the signing key)
    ///
    /// # Returns
    /// Ok if processed, Err if rejected. Redelivered activities and
    /// targets that are already gone succeed.
    pub async fn process(&self, activity: &Value, actor_uri: &str) -> Result<(), AppError> {
        let parsed = InboundActivity::parse(activity)?;
        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[parsed.type_name()])
            .inc();

        if parsed.meta().actor != actor_uri {
            return Err(AppError::Forbidden);
        }

        let actor = match self.resolver.resolve_actor(actor_uri).await {
            Ok(actor) => actor,
            // Nothing of a vanished actor is left to delete
            Err(e) if matches!(parsed, InboundActivity::Delete(..)) && e.is_remote_gone() => {
                tracing::debug!(actor_uri, error = %e, "Delete from an actor that is gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if actor.is_local() {
            return Err(AppError::Forbidden);
        }

        tracing::debug!(
            activity_type = parsed.type_name(),
            actor_uri,
            activity_id = ?parsed.meta().id,
            "Processing activity"
        );

        match parsed {
            InboundActivity::Create(meta, object) => self.handle_create(&actor, &meta, object).await,
            InboundActivity::Update(_, object) => self.handle_update(&actor, object).await,
            InboundActivity::Delete(_, object) => self.handle_delete(&actor, object).await,
            InboundActivity::Follow(_, target) => {
                self.handle_follow(&actor, &target, activity).await
            }
            InboundActivity::Accept(_, object) => self.handle_accept(&actor, object).await,
            InboundActivity::Reject(_, object) => self.handle_reject(&actor, object).await,
            InboundActivity::Undo(_, object) => self.handle_undo(&actor, object).await,
            InboundActivity::Announce(..) => self.handle_announce(activity).await,
            InboundActivity::Like(_, object) => self.handle_like(&actor, &object, true).await,
            InboundActivity::Add { object, target, .. } => {
                self.handle_featured(&actor, &object, target.as_deref(), true)
                    .await
            }
            InboundActivity::Remove { object, target, .. } => {
                self.handle_featured(&actor, &object, target.as_deref(), false)
                    .await
            }
        }
    }

    /// Create: materialize a note-like object
    async fn handle_create(
        &self,
        actor: &Actor,
        meta: &ActivityMeta,
        object: ObjectRef,
    ) -> Result<(), AppError> {
        let mut doc = match object {
            ObjectRef::Uri(uri) => {
                self.resolver.resolve_status(&uri).await?;
                return Ok(());
            }
            ObjectRef::Embedded(doc) => doc,
        };

        let object_type = doc.get("type").and_then(Value::as_str).unwrap_or_default();
        if !STATUS_TYPES.contains(&object_type) {
            return Err(AppError::UnknownObjectType(object_type.to_string()));
        }

        match doc.get("attributedTo").and_then(id_of) {
            Some(author) if author != actor.uri => return Err(AppError::Forbidden),
            Some(_) => {}
            None => {
                if let Some(map) = doc.as_object_mut() {
                    map.insert("attributedTo".to_string(), Value::String(actor.uri.clone()));
                }
            }
        }

        if doc.get("published").is_none() {
            if let (Some(published), Some(map)) = (meta.published.as_ref(), doc.as_object_mut()) {
                map.insert("published".to_string(), Value::String(published.clone()));
            }
        }

        self.resolver.ingest_object(&doc).await?;
        Ok(())
    }

    /// Update: overwrite an actor profile or a status
    async fn handle_update(&self, actor: &Actor, object: ObjectRef) -> Result<(), AppError> {
        let ObjectRef::Embedded(doc) = object else {
            return Err(AppError::Validation(
                "Update must embed the updated object".to_string(),
            ));
        };
        let object_type = doc.get("type").and_then(Value::as_str).unwrap_or_default();
        let object_id = doc.get("id").and_then(Value::as_str).unwrap_or_default();

        if ACTOR_TYPES.contains(&object_type) {
            if object_id != actor.uri {
                return Err(AppError::Forbidden);
            }
            self.resolver.upsert_actor(&doc).await?;
            return Ok(());
        }

        if STATUS_TYPES.contains(&object_type) {
            let owner = match self.db.get_status_by_uri(object_id).await? {
                Some(status) => status.actor_id == actor.id,
                None => doc.get("attributedTo").and_then(id_of) == Some(actor.uri.as_str()),
            };
            if !owner {
                return Err(AppError::Forbidden);
            }
            self.resolver.upsert_status(&doc).await?;
            return Ok(());
        }

        Err(AppError::UnknownObjectType(object_type.to_string()))
    }

    /// Delete: remove a status or the actor itself; absence is success
    async fn handle_delete(&self, actor: &Actor, object: ObjectRef) -> Result<(), AppError> {
        let uri = object.require_id()?;

        if let Some(status) = self.db.get_status_by_uri(uri).await? {
            if status.actor_id != actor.id {
                return Err(AppError::Forbidden);
            }
            self.db.delete_status(&status).await?;
            tracing::info!(status_uri = uri, "Deleted remote status");
            return Ok(());
        }

        if let Some(target) = self.db.get_actor_by_uri(uri).await? {
            if target.id != actor.id {
                return Err(AppError::Forbidden);
            }
            self.db.delete_actor(target.id).await?;
            tracing::info!(actor_uri = uri, "Deleted remote actor");
            return Ok(());
        }

        tracing::debug!(uri, "Delete for unknown object, nothing to do");
        Ok(())
    }

    /// Follow: the target must already exist locally
    async fn handle_follow(
        &self,
        actor: &Actor,
        target_uri: &str,
        follow: &Value,
    ) -> Result<(), AppError> {
        let target = self
            .db
            .get_actor_by_uri(target_uri)
            .await?
            .ok_or(AppError::NotFound)?;

        self.db
            .set_relationship(actor.id, target.id, RelationshipEdge::Follow, true)
            .await?;
        tracing::info!(follower = %actor.uri, target = %target.uri, "Follow recorded");

        if target.is_local() {
            self.send_accept(actor, &target, follow).await?;
        }
        Ok(())
    }

    async fn send_accept(
        &self,
        follower: &Actor,
        target: &Actor,
        follow: &Value,
    ) -> Result<(), AppError> {
        let Some(delivery) = self.delivery.clone() else {
            return Ok(());
        };
        let Some(account) = self.db.get_account(target.id).await? else {
            tracing::warn!(actor_uri = %target.uri, "Local actor has no signing key, not sending Accept");
            return Ok(());
        };

        let signer = Signer::for_actor(target, &account)?;
        let mut object = follow.clone();
        if let Some(map) = object.as_object_mut() {
            map.remove("@context");
        }
        let accept = builder::accept(
            &format!("{}#accepts/{}", target.uri, EntityId::new()),
            &target.uri,
            object,
        );
        let inbox = follower.delivery_inbox().to_string();

        spawn_best_effort_delivery("accept_follow", self.delivery_timeout, async move {
            delivery.deliver_to_inbox(&signer, &inbox, &accept).await
        });
        Ok(())
    }

    /// Accept: acknowledgement only, the follow was set on send
    async fn handle_accept(&self, actor: &Actor, object: ObjectRef) -> Result<(), AppError> {
        match object.object_type() {
            None | Some("Follow") => {
                tracing::info!(actor_uri = %actor.uri, follow = ?object.id(), "Follow accepted");
                Ok(())
            }
            Some(other) => Err(AppError::UnknownObjectType(other.to_string())),
        }
    }

    /// Reject: reverse the optimistic follow pair
    async fn handle_reject(&self, actor: &Actor, object: ObjectRef) -> Result<(), AppError> {
        let follower_uri = match &object {
            ObjectRef::Embedded(doc) => {
                let object_type = doc.get("type").and_then(Value::as_str).unwrap_or_default();
                if object_type != "Follow" {
                    return Err(AppError::UnknownObjectType(object_type.to_string()));
                }
                doc.get("actor").and_then(id_of)
            }
            ObjectRef::Uri(uri) => follower_from_follow_id(uri),
        };
        let Some(follower_uri) = follower_uri else {
            return Err(AppError::Validation(
                "Reject does not identify the follower".to_string(),
            ));
        };

        let Some(follower) = self.db.get_actor_by_uri(follower_uri).await? else {
            return Ok(());
        };
        self.db
            .set_relationship(follower.id, actor.id, RelationshipEdge::Follow, false)
            .await?;
        tracing::info!(follower = %follower.uri, target = %actor.uri, "Follow rejected");
        Ok(())
    }

    /// Undo: reverse a Follow, Announce or Like
    async fn handle_undo(&self, actor: &Actor, object: ObjectRef) -> Result<(), AppError> {
        let doc = match object {
            ObjectRef::Uri(uri) => return self.undo_reblog(actor, &uri).await,
            ObjectRef::Embedded(doc) => doc,
        };

        let inner_actor = doc.get("actor").and_then(id_of);
        if inner_actor.is_some_and(|inner| inner != actor.uri) {
            return Err(AppError::Forbidden);
        }

        let object_type = doc.get("type").and_then(Value::as_str).unwrap_or_default();
        match object_type {
            "Follow" => {
                let target_uri = doc
                    .get("object")
                    .and_then(id_of)
                    .ok_or_else(|| AppError::Validation("Follow without object".to_string()))?;
                let Some(target) = self.db.get_actor_by_uri(target_uri).await? else {
                    return Ok(());
                };
                self.db
                    .set_relationship(actor.id, target.id, RelationshipEdge::Follow, false)
                    .await?;
                tracing::info!(follower = %actor.uri, target = target_uri, "Follow undone");
                Ok(())
            }
            "Announce" => {
                let uri = doc
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::Validation("Announce without id".to_string()))?;
                self.undo_reblog(actor, uri).await
            }
            "Like" => {
                let status_uri = doc
                    .get("object")
                    .and_then(id_of)
                    .ok_or_else(|| AppError::Validation("Like without object".to_string()))?;
                self.handle_like(actor, status_uri, false).await
            }
            other => Err(AppError::UnknownObjectType(other.to_string())),
        }
    }

    async fn undo_reblog(&self, actor: &Actor, uri: &str) -> Result<(), AppError> {
        let Some(reblog) = self.db.get_status_by_uri(uri).await? else {
            return Ok(());
        };
        if reblog.reblog_of_id.is_none() || reblog.actor_id != actor.id {
            return Ok(());
        }
        self.db.delete_status(&reblog).await?;
        tracing::info!(reblog_uri = uri, "Reblog undone");
        Ok(())
    }

    /// Announce: create the reblog through the ingestion funnel
    async fn handle_announce(&self, activity: &Value) -> Result<(), AppError> {
        self.resolver.ingest_object(activity).await?;
        Ok(())
    }

    /// Like / Undo-Like on a status we know about
    async fn handle_like(&self, actor: &Actor, status_uri: &str, value: bool) -> Result<(), AppError> {
        let Some(status) = self.db.get_status_by_uri(status_uri).await? else {
            tracing::debug!(status_uri, "Like for unknown status, ignoring");
            return Ok(());
        };
        self.db
            .set_reaction(actor.id, status.id, ReactionFlag::Favourited, value)
            .await
    }

    /// Add/Remove on the featured collection: pin or unpin
    async fn handle_featured(
        &self,
        actor: &Actor,
        status_uri: &str,
        target: Option<&str>,
        pinned: bool,
    ) -> Result<(), AppError> {
        if let Some(target) = target {
            if actor.featured.as_deref() != Some(target) {
                tracing::debug!(target, "Add/Remove on a collection other than featured");
                return Ok(());
            }
        }

        let status = self.resolver.resolve_status(status_uri).await?;
        if status.actor_id != actor.id {
            return Err(AppError::Forbidden);
        }
        self.db
            .set_reaction(actor.id, status.id, ReactionFlag::Pinned, pinned)
            .await
    }
}
