//! Data models
//!
//! Rust structs representing database entities.
//! All primary keys are time-ordered [`EntityId`] values stored as INTEGER,
//! timestamps are chrono UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use super::id::EntityId;

// =============================================================================
// Actor
// =============================================================================

/// Kind of federated identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Person,
    Service,
    Group,
    LocalPerson,
    LocalService,
}

impl ActorType {
    pub fn is_local(&self) -> bool {
        matches!(self, ActorType::LocalPerson | ActorType::LocalService)
    }

    /// ActivityStreams type name used in actor documents
    pub fn as_activity_type(&self) -> &'static str {
        match self {
            ActorType::Person | ActorType::LocalPerson => "Person",
            ActorType::Service | ActorType::LocalService => "Service",
            ActorType::Group => "Group",
        }
    }
}

/// A local or remote identity
///
/// Unique by `uri`, and separately by `(name, domain)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: i64,
    pub actor_type: ActorType,
    /// preferredUsername
    pub name: String,
    pub domain: String,
    pub uri: String,
    /// Human-facing profile URL
    pub url: Option<String>,
    pub display_name: String,
    /// Sanitized HTML bio
    pub note: String,
    pub avatar: Option<String>,
    pub header: Option<String>,
    /// manuallyApprovesFollowers
    pub locked: bool,
    pub followers_count: i64,
    pub following_count: i64,
    pub statuses_count: i64,
    pub last_status_at: Option<DateTime<Utc>>,
    pub public_key_pem: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub featured: Option<String>,
    /// Profile fields as a JSON array of `{name, value}`
    pub attributes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.actor_type.is_local()
    }

    /// Key ID advertised in this actor's document
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    /// Inbox to deliver to, preferring the shared inbox
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox.as_deref().unwrap_or(&self.inbox)
    }
}

/// Signing material for a local actor
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub actor_id: i64,
    /// RSA private key (PKCS#8 PEM)
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
    Limited,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
            Visibility::Direct => "direct",
            Visibility::Limited => "limited",
        }
    }
}

/// A reply thread
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: i64,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

/// A federated message or reblog
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: i64,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    pub actor_id: i64,
    pub conversation_id: i64,
    pub in_reply_to_id: Option<i64>,
    /// Denormalized author of the parent
    pub in_reply_to_actor_id: Option<i64>,
    pub reblog_of_id: Option<i64>,
    pub visibility: Visibility,
    pub sensitive: bool,
    pub spoiler_text: String,
    /// Sanitized HTML content
    pub content: String,
    pub language: Option<String>,
    pub url: Option<String>,
    pub replies_count: i64,
    pub reblogs_count: i64,
    pub favourites_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Media attached to a status
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusAttachment {
    pub id: i64,
    pub status_id: i64,
    pub url: String,
    pub media_type: Option<String>,
    pub description: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Children of a status written in the same transaction as the status row
#[derive(Debug, Clone, Default)]
pub struct StatusExtras {
    pub mentions: Vec<i64>,
    pub tags: Vec<String>,
    pub attachments: Vec<NewAttachment>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub url: String,
    pub media_type: Option<String>,
    pub description: Option<String>,
}

// =============================================================================
// Relationship / Reaction
// =============================================================================

/// Directed edge between two actors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relationship {
    pub actor_id: i64,
    pub target_id: i64,
    pub following: bool,
    pub followed_by: bool,
    pub muting: bool,
    pub blocking: bool,
    pub blocked_by: bool,
}

/// Flag on a relationship edge that can be written
///
/// Follow and Block are mirrored onto the reverse edge as followed_by and
/// blocked_by. Mute is one-sided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipEdge {
    Follow,
    Mute,
    Block,
}

/// An actor's stance toward a status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reaction {
    pub actor_id: i64,
    pub status_id: i64,
    pub favourited: bool,
    pub reblogged: bool,
    pub muted: bool,
    pub bookmarked: bool,
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionFlag {
    Favourited,
    Reblogged,
    Muted,
    Bookmarked,
    Pinned,
}

impl ReactionFlag {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            ReactionFlag::Favourited => "favourited",
            ReactionFlag::Reblogged => "reblogged",
            ReactionFlag::Muted => "muted",
            ReactionFlag::Bookmarked => "bookmarked",
            ReactionFlag::Pinned => "pinned",
        }
    }
}

// =============================================================================
// Object receipts
// =============================================================================

/// Raw federated payload as received
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObjectRecord {
    pub id: i64,
    pub uri: Option<String>,
    pub object_type: String,
    /// Full JSON document
    pub properties: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Delivery requests
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RelationshipAction {
    Follow,
    Unfollow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Like,
    Unlike,
}

/// Pending follow/unfollow to deliver
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RelationshipRequest {
    pub id: i64,
    pub actor_id: i64,
    pub target_id: i64,
    pub action: RelationshipAction,
    pub attempts: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

/// Pending like/unlike to deliver
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReactionRequest {
    pub id: i64,
    pub actor_id: i64,
    pub status_id: i64,
    pub action: ReactionAction,
    pub attempts: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

/// Pending re-fetch of a remote actor document
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActorRefreshRequest {
    pub id: i64,
    pub actor_id: i64,
    pub attempts: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

/// Pending metadata fetch of a remote attachment
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusAttachmentRequest {
    pub id: i64,
    pub attachment_id: i64,
    pub attempts: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

/// A row in one of the delivery request tables
///
/// The generic queue operations in [`crate::data::Database`] select, delete
/// and annotate rows through this trait.
pub trait QueueRow:
    for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Sync + Unpin + 'static
{
    /// Backing table
    const TABLE: &'static str;
    /// Short name used in logs and metrics
    const KIND: &'static str;

    fn id(&self) -> i64;
    fn revision(&self) -> i64;
    fn attempts(&self) -> i64;
}

macro_rules! impl_queue_row {
    ($ty:ty, $table:literal, $kind:literal) => {
        impl QueueRow for $ty {
            const TABLE: &'static str = $table;
            const KIND: &'static str = $kind;

            fn id(&self) -> i64 {
                self.id
            }

            fn revision(&self) -> i64 {
                self.revision
            }

            fn attempts(&self) -> i64 {
                self.attempts
            }
        }
    };
}

impl_queue_row!(RelationshipRequest, "relationship_requests", "relationship");
impl_queue_row!(ReactionRequest, "reaction_requests", "reaction");
impl_queue_row!(ActorRefreshRequest, "actor_refresh_requests", "actor_refresh");
impl_queue_row!(
    StatusAttachmentRequest,
    "status_attachment_requests",
    "status_attachment"
);
