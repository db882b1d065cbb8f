//! Remote entity resolution
//!
//! Find-or-create by URI for remote actors and statuses. The unique
//! indexes on `actors.uri` and `statuses.uri` are the decision point when
//! two resolutions race: the loser re-reads the winner's row.

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use super::delivery::{ActivityDelivery, Signer};
use super::vocab::{
    ACTOR_TYPES, ActorObject, NoteObject, STATUS_TYPES, classify_visibility,
};
use crate::data::{
    Actor, ActorType, Conversation, Database, EntityId, NewAttachment, ReactionFlag, Status,
    StatusExtras, Visibility, is_unique_violation,
};
use crate::error::AppError;

/// Reply chains deeper than this are stored without a parent link
const MAX_REPLY_DEPTH: usize = 16;

/// Fresh IDs tried when an insert collides on the primary key
const INSERT_ATTEMPTS: usize = 3;

/// Entity materialized from an ingested payload
#[derive(Debug, Clone)]
pub enum Ingested {
    Actor(Actor),
    Status(Status),
}

fn type_of(doc: &Value) -> &str {
    doc.get("type").and_then(Value::as_str).unwrap_or_default()
}

/// `host[:port]` of a URI
fn authority_of(uri: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// A fetched document must live on the host we fetched it from
fn check_origin(requested_uri: &str, doc: &Value) -> Result<(), AppError> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation(format!("Document at {} has no id", requested_uri)))?;

    if authority_of(id) != authority_of(requested_uri) {
        return Err(AppError::Validation(format!(
            "Document at {} claims foreign id {}",
            requested_uri, id
        )));
    }
    Ok(())
}

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

fn map_actor_type(kind: &str) -> ActorType {
    match kind {
        "Service" | "Application" => ActorType::Service,
        "Group" | "Organization" => ActorType::Group,
        _ => ActorType::Person,
    }
}

/// Overwrite every mutable profile field from a fetched document
fn apply_actor_object(actor: &mut Actor, object: &ActorObject) -> Result<(), AppError> {
    let inbox = object
        .inbox
        .clone()
        .ok_or_else(|| AppError::Validation(format!("Actor {} has no inbox", object.id)))?;

    let fields: Vec<Value> = object
        .profile_fields()
        .into_iter()
        .map(|(name, value)| {
            serde_json::json!({
                "name": name,
                "value": sanitize_remote_html(&value),
            })
        })
        .collect();

    actor.actor_type = map_actor_type(&object.kind);
    actor.url = object.url.clone();
    actor.display_name = object.name.clone().unwrap_or_default();
    actor.note = sanitize_remote_html(object.summary.as_deref().unwrap_or_default());
    actor.avatar = object.icon.clone();
    actor.header = object.image.clone();
    actor.locked = object.manually_approves_followers;
    actor.public_key_pem = object
        .public_key
        .as_ref()
        .map(|key| key.public_key_pem.clone())
        .unwrap_or_default();
    actor.inbox = inbox;
    actor.shared_inbox = object.shared_inbox().map(str::to_string);
    actor.outbox = object.outbox.clone();
    actor.followers = object.followers.clone();
    actor.following = object.following.clone();
    actor.featured = object.featured.clone();
    actor.attributes = Value::Array(fields).to_string();
    actor.updated_at = Utc::now();
    Ok(())
}

/// Build a new remote actor row from a fetched document
fn actor_from_object(object: &ActorObject) -> Result<Actor, AppError> {
    let domain = authority_of(&object.id)
        .ok_or_else(|| AppError::Validation(format!("Invalid actor id {}", object.id)))?;
    let name = object
        .preferred_username
        .clone()
        .or_else(|| {
            url::Url::parse(&object.id).ok().and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
        })
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::Validation(format!("Actor {} has no username", object.id)))?;

    let id = EntityId::from_published(object.published.as_deref());
    let now = Utc::now();
    let mut actor = Actor {
        id: id.0,
        actor_type: ActorType::Person,
        name,
        domain,
        uri: object.id.clone(),
        url: None,
        display_name: String::new(),
        note: String::new(),
        avatar: None,
        header: None,
        locked: false,
        followers_count: 0,
        following_count: 0,
        statuses_count: 0,
        last_status_at: None,
        public_key_pem: String::new(),
        inbox: String::new(),
        shared_inbox: None,
        outbox: None,
        followers: None,
        following: None,
        featured: None,
        attributes: "[]".to_string(),
        created_at: id.created_at(),
        updated_at: now,
    };
    apply_actor_object(&mut actor, object)?;
    Ok(actor)
}

/// Remote resolver
///
/// Fetches are signed as the instance admin.
pub struct RemoteResolver {
    db: Arc<Database>,
    delivery: ActivityDelivery,
    signer: Signer,
}

impl RemoteResolver {
    pub fn new(db: Arc<Database>, delivery: ActivityDelivery, signer: Signer) -> Self {
        Self {
            db,
            delivery,
            signer,
        }
    }

    /// Signing identity used for outbound system traffic
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    async fn fetch(&self, uri: &str) -> Result<Value, AppError> {
        let doc = self.delivery.fetch_object(&self.signer, uri).await?;
        check_origin(uri, &doc)?;
        Ok(doc)
    }

    async fn store_receipt(&self, doc: &Value) -> Result<(), AppError> {
        let uri = doc.get("id").and_then(Value::as_str);
        self.db.upsert_object(uri, type_of(doc), doc).await?;
        Ok(())
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Return the local row for an actor URI, fetching it on first sight
    ///
    /// # Errors
    /// `UnsupportedObjectType` if the URI does not name an actor; transport
    /// and signature errors from the fetch are propagated.
    pub async fn resolve_actor(&self, uri: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.db.get_actor_by_uri(uri).await? {
            return Ok(actor);
        }

        let doc = self.fetch(uri).await?;
        let found = type_of(&doc);
        if !ACTOR_TYPES.contains(&found) {
            return Err(AppError::UnsupportedObjectType {
                expected: "Actor",
                found: found.to_string(),
            });
        }

        self.store_receipt(&doc).await?;
        self.create_actor(&doc).await
    }

    async fn create_actor(&self, doc: &Value) -> Result<Actor, AppError> {
        let object = ActorObject::from_value(doc)?;
        if let Some(existing) = self.db.get_actor_by_uri(&object.id).await? {
            return Ok(existing);
        }

        let mut actor = actor_from_object(&object)?;
        for _ in 0..INSERT_ATTEMPTS {
            match self.db.insert_actor(&actor).await {
                Ok(()) => {
                    tracing::info!(actor_uri = %actor.uri, actor_id = actor.id, "Resolved remote actor");
                    return Ok(actor);
                }
                Err(error) if is_unique_violation(&error) => {
                    if let Some(winner) = self.db.get_actor_by_uri(&actor.uri).await? {
                        tracing::debug!(actor_uri = %actor.uri, "Lost actor insert race");
                        return Ok(winner);
                    }
                    actor.id = EntityId::from_time(actor.created_at).0;
                }
                Err(error) => return Err(error),
            }
        }

        Err(AppError::Federation(format!(
            "Could not allocate a row for actor {}",
            actor.uri
        )))
    }

    /// Resolve-or-create an actor from a pushed document, overwriting the
    /// profile of a known one
    pub async fn upsert_actor(&self, doc: &Value) -> Result<Actor, AppError> {
        let object = ActorObject::from_value(doc)?;
        match self.db.get_actor_by_uri(&object.id).await? {
            Some(mut actor) if !actor.is_local() => {
                apply_actor_object(&mut actor, &object)?;
                self.db.update_actor_profile(&actor).await?;
                tracing::info!(actor_uri = %actor.uri, "Updated remote actor profile");
                Ok(actor)
            }
            Some(_) => Err(AppError::Forbidden),
            None => self.create_actor(doc).await,
        }
    }

    /// Re-fetch a remote actor and overwrite its mutable fields
    pub async fn refresh_actor(&self, actor: &Actor) -> Result<Actor, AppError> {
        if actor.is_local() {
            return Ok(actor.clone());
        }

        let doc = self.fetch(&actor.uri).await?;
        let found = type_of(&doc);
        if !ACTOR_TYPES.contains(&found) {
            return Err(AppError::UnsupportedObjectType {
                expected: "Actor",
                found: found.to_string(),
            });
        }
        self.store_receipt(&doc).await?;

        let object = ActorObject::from_value(&doc)?;
        if object.id != actor.uri {
            return Err(AppError::Validation(format!(
                "Actor {} moved to {}",
                actor.uri, object.id
            )));
        }

        let mut refreshed = actor.clone();
        apply_actor_object(&mut refreshed, &object)?;
        self.db.update_actor_profile(&refreshed).await?;
        tracing::info!(actor_uri = %actor.uri, "Refreshed remote actor");
        Ok(refreshed)
    }

    // =========================================================================
    // Statuses
    // =========================================================================

    /// Return the local row for a status URI, fetching it on first sight
    ///
    /// Parents are resolved recursively; a parent that is gone or hidden
    /// (401/403/404/410) leaves the status without a parent link.
    pub async fn resolve_status(&self, uri: &str) -> Result<Status, AppError> {
        self.resolve_status_at(uri.to_string(), 0).await
    }

    fn resolve_status_at(&self, uri: String, depth: usize) -> BoxFuture<'_, Result<Status, AppError>> {
        async move {
            if let Some(status) = self.db.get_status_by_uri(&uri).await? {
                return Ok(status);
            }

            let doc = self.fetch(&uri).await?;
            let found = type_of(&doc);
            if !STATUS_TYPES.contains(&found) {
                return Err(AppError::UnsupportedObjectType {
                    expected: "Note",
                    found: found.to_string(),
                });
            }

            self.store_receipt(&doc).await?;
            self.create_status(&doc, depth).await
        }
        .boxed()
    }

    async fn resolve_parent(
        &self,
        parent_uri: &str,
        depth: usize,
    ) -> Result<Option<Status>, AppError> {
        if depth >= MAX_REPLY_DEPTH {
            tracing::warn!(parent_uri, depth, "Reply chain too deep, dropping parent link");
            return Ok(None);
        }

        match self.resolve_status_at(parent_uri.to_string(), depth + 1).await {
            Ok(parent) => Ok(Some(parent)),
            Err(error) if error.is_remote_gone() => {
                tracing::debug!(parent_uri, %error, "Reply parent unavailable");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn create_status(&self, doc: &Value, depth: usize) -> Result<Status, AppError> {
        let note = NoteObject::from_value(doc)?;
        if let Some(existing) = self.db.get_status_by_uri(&note.id).await? {
            return Ok(existing);
        }

        let author_uri = note
            .attributed_to
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("{} has no attributedTo", note.id)))?;
        let author = self.resolve_actor(author_uri).await?;

        let parent = match note.in_reply_to.as_deref() {
            Some(parent_uri) => self.resolve_parent(parent_uri, depth).await?,
            None => None,
        };

        let followers = author
            .followers
            .clone()
            .unwrap_or_else(|| format!("{}/followers", author.uri));
        let visibility = classify_visibility(&note.to, &note.cc, &followers);

        let id = EntityId::from_published(note.published.as_deref());
        let created_at = id.created_at();

        let conversation_id = match &parent {
            Some(parent) => parent.conversation_id,
            None => self.new_conversation(visibility, created_at).await?,
        };

        let mut mentions = Vec::new();
        for href in note.mentions() {
            match self.resolve_actor(href).await {
                Ok(actor) => mentions.push(actor.id),
                Err(error) => {
                    tracing::warn!(status_uri = %note.id, mention = href, %error, "Skipping unresolvable mention");
                }
            }
        }
        mentions.sort_unstable();
        mentions.dedup();

        let extras = StatusExtras {
            mentions,
            tags: note.hashtags(),
            attachments: note
                .attachments()
                .into_iter()
                .map(|attachment| NewAttachment {
                    url: attachment.url,
                    media_type: attachment.media_type,
                    description: attachment.description,
                })
                .collect(),
        };

        let status = Status {
            id: id.0,
            uri: note.id.clone(),
            actor_id: author.id,
            conversation_id,
            in_reply_to_id: parent.as_ref().map(|parent| parent.id),
            in_reply_to_actor_id: parent.as_ref().map(|parent| parent.actor_id),
            reblog_of_id: None,
            visibility,
            sensitive: note.sensitive,
            spoiler_text: note.summary.clone().unwrap_or_default(),
            content: sanitize_remote_html(note.body()),
            language: note.language(),
            url: note.url.clone(),
            replies_count: 0,
            reblogs_count: 0,
            favourites_count: 0,
            created_at,
            updated_at: Utc::now(),
        };

        let status = self.insert_status(status, &extras).await?;
        tracing::info!(status_uri = %status.uri, status_id = status.id, "Materialized remote status");
        Ok(status)
    }

    async fn new_conversation(
        &self,
        visibility: Visibility,
        created_at: chrono::DateTime<Utc>,
    ) -> Result<i64, AppError> {
        for _ in 0..INSERT_ATTEMPTS {
            let conversation = Conversation {
                id: EntityId::from_time(created_at).0,
                visibility,
                created_at,
            };
            match self.db.insert_conversation(&conversation).await {
                Ok(()) => return Ok(conversation.id),
                Err(error) if is_unique_violation(&error) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(AppError::Federation(
            "Could not allocate a conversation id".to_string(),
        ))
    }

    async fn insert_status(
        &self,
        mut status: Status,
        extras: &StatusExtras,
    ) -> Result<Status, AppError> {
        for _ in 0..INSERT_ATTEMPTS {
            match self.db.insert_status(&status, extras).await {
                Ok(_) => return Ok(status),
                Err(error) if is_unique_violation(&error) => {
                    if let Some(winner) = self.db.get_status_by_uri(&status.uri).await? {
                        tracing::debug!(status_uri = %status.uri, "Lost status insert race");
                        return Ok(winner);
                    }
                    status.id = EntityId::from_time(status.created_at).0;
                }
                Err(error) => return Err(error),
            }
        }
        Err(AppError::Federation(format!(
            "Could not allocate a row for status {}",
            status.uri
        )))
    }

    /// Overwrite the content of a known status from a pushed document,
    /// creating it if we have never seen it
    pub async fn upsert_status(&self, doc: &Value) -> Result<Status, AppError> {
        let note = NoteObject::from_value(doc)?;
        let Some(mut status) = self.db.get_status_by_uri(&note.id).await? else {
            return self.create_status(doc, 0).await;
        };

        status.content = sanitize_remote_html(note.body());
        status.spoiler_text = note.summary.clone().unwrap_or_default();
        status.sensitive = note.sensitive;
        status.language = note.language();
        status.url = note.url.clone();
        self.db.update_status_content(&status).await?;
        tracing::info!(status_uri = %status.uri, "Updated remote status");
        Ok(status)
    }

    /// Create the reblog row for an Announce
    ///
    /// An actor has at most one reblog per target; a redelivered Announce
    /// returns the existing row.
    pub async fn materialize_reblog(
        &self,
        announce_uri: &str,
        actor: &Actor,
        target: &Status,
        published: Option<&str>,
        to: &[String],
        cc: &[String],
    ) -> Result<Status, AppError> {
        if let Some(existing) = self.db.get_status_by_uri(announce_uri).await? {
            return Ok(existing);
        }
        if let Some(existing) = self.db.get_reblog(actor.id, target.id).await? {
            return Ok(existing);
        }

        let followers = actor
            .followers
            .clone()
            .unwrap_or_else(|| format!("{}/followers", actor.uri));
        let id = EntityId::from_published(published);

        let status = Status {
            id: id.0,
            uri: announce_uri.to_string(),
            actor_id: actor.id,
            conversation_id: target.conversation_id,
            in_reply_to_id: None,
            in_reply_to_actor_id: None,
            reblog_of_id: Some(target.id),
            visibility: classify_visibility(to, cc, &followers),
            sensitive: false,
            spoiler_text: String::new(),
            content: String::new(),
            language: None,
            url: None,
            replies_count: 0,
            reblogs_count: 0,
            favourites_count: 0,
            created_at: id.created_at(),
            updated_at: Utc::now(),
        };

        let reblog = self.insert_status(status, &StatusExtras::default()).await?;
        self.db
            .set_reaction(actor.id, target.id, ReactionFlag::Reblogged, true)
            .await?;
        tracing::info!(reblog_uri = %reblog.uri, target_id = target.id, "Materialized reblog");
        Ok(reblog)
    }

    // =========================================================================
    // Ingestion funnel
    // =========================================================================

    /// Store a pushed payload as a receipt and materialize its typed entity
    ///
    /// Actor documents upsert the actor, note-like objects create the
    /// status if absent, Announces create the reblog.
    pub async fn ingest_object(&self, doc: &Value) -> Result<Ingested, AppError> {
        self.store_receipt(doc).await?;

        let object_type = type_of(doc);
        if ACTOR_TYPES.contains(&object_type) {
            return self.upsert_actor(doc).await.map(Ingested::Actor);
        }
        if STATUS_TYPES.contains(&object_type) {
            return self.create_status(doc, 0).await.map(Ingested::Status);
        }
        if object_type == "Announce" {
            let actor_uri = doc
                .get("actor")
                .and_then(super::vocab::id_of)
                .ok_or_else(|| AppError::Validation("Announce without actor".to_string()))?;
            let object_uri = doc
                .get("object")
                .and_then(super::vocab::id_of)
                .ok_or_else(|| AppError::Validation("Announce without object".to_string()))?;
            let announce_uri = doc
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::Validation("Announce without id".to_string()))?;

            let actor = self.resolve_actor(actor_uri).await?;
            let target = self.resolve_status(object_uri).await?;
            let published = doc.get("published").and_then(Value::as_str);
            let audience = |field: &str| -> Vec<String> {
                match doc.get(field) {
                    Some(Value::String(address)) => vec![address.clone()],
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(super::vocab::id_of)
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                }
            };
            return self
                .materialize_reblog(
                    announce_uri,
                    &actor,
                    &target,
                    published,
                    &audience("to"),
                    &audience("cc"),
                )
                .await
                .map(Ingested::Status);
        }

        Err(AppError::UnknownObjectType(object_type.to_string()))
    }
}
