//! ActivityStreams vocabulary at the ingestion edge
//!
//! Inbound payloads are decoded leniently into these types: every field
//! that federated software is known to send in more than one shape
//! (string, object with `id`, or array) goes through the helpers below.
//! Business logic only ever sees the typed variants.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::data::Visibility;
use crate::error::AppError;

/// Public addressing collection
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Actor document types we accept
pub const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application", "Group", "Organization"];

/// Object types materialized as statuses
pub const STATUS_TYPES: &[&str] = &["Note", "Article", "Question", "Page"];

fn is_public_address(address: &str) -> bool {
    matches!(address, PUBLIC_COLLECTION | "as:Public" | "Public")
}

// =============================================================================
// Lenient field helpers
// =============================================================================

/// ID of a reference: a bare string, an object with `id`, or the first
/// usable element of an array
pub fn id_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        Value::Array(items) => items.iter().find_map(id_of),
        _ => None,
    }
}

/// URL of an `icon`/`image`/`url` field, which may be a Link, an Image or
/// a plain string
fn url_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map
            .get("url")
            .and_then(url_of)
            .or_else(|| map.get("href").and_then(Value::as_str)),
        Value::Array(items) => items.iter().find_map(url_of),
        _ => None,
    }
}

fn one_or_many(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(id_of(&value).map(str::to_string))
}

fn de_url<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(url_of(&value).map(str::to_string))
}

fn de_audience<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(one_or_many(value)
        .iter()
        .filter_map(id_of)
        .map(str::to_string)
        .collect())
}

fn de_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Value>, D::Error> {
    Ok(one_or_many(Value::deserialize(deserializer)?))
}

/// `attributedTo` may list several actors (PeerTube sends a Person and a
/// Group); the first Person wins, otherwise the first reference
fn de_attributed_to<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let items = one_or_many(Value::deserialize(deserializer)?);
    let person = items
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("Person"))
        .and_then(id_of);
    Ok(person
        .or_else(|| items.iter().find_map(id_of))
        .map(str::to_string))
}

fn de_lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(matches!(Value::deserialize(deserializer)?, Value::Bool(true)))
}

fn from_document<T: for<'de> Deserialize<'de>>(doc: &Value, what: &str) -> Result<T, AppError> {
    T::deserialize(doc).map_err(|e| AppError::Validation(format!("Invalid {}: {}", what, e)))
}

// =============================================================================
// Objects
// =============================================================================

/// Note-like object (Note, Article, Question, Page)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "de_attributed_to")]
    pub attributed_to: Option<String>,
    #[serde(default, deserialize_with = "de_id")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_map: Option<serde_json::Map<String, Value>>,
    /// Content warning
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_bool")]
    pub sensitive: bool,
    #[serde(default, deserialize_with = "de_url")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "de_audience")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "de_audience")]
    pub cc: Vec<String>,
    #[serde(default, deserialize_with = "de_list")]
    pub tag: Vec<Value>,
    #[serde(default, deserialize_with = "de_list")]
    pub attachment: Vec<Value>,
}

impl NoteObject {
    pub fn from_value(doc: &Value) -> Result<Self, AppError> {
        from_document(doc, "note")
    }

    /// First language key of `contentMap`, if any
    pub fn language(&self) -> Option<String> {
        self.content_map
            .as_ref()
            .and_then(|map| map.keys().next().cloned())
    }

    /// Content, falling back to the first `contentMap` entry
    pub fn body(&self) -> &str {
        self.content
            .as_deref()
            .or_else(|| {
                self.content_map
                    .as_ref()
                    .and_then(|map| map.values().find_map(Value::as_str))
            })
            .unwrap_or_default()
    }

    pub fn mentions(&self) -> impl Iterator<Item = &str> {
        self.tag
            .iter()
            .filter(|tag| tag.get("type").and_then(Value::as_str) == Some("Mention"))
            .filter_map(|tag| tag.get("href").and_then(Value::as_str))
    }

    /// Normalized hashtag names: no leading `#`, lowercase, deduplicated
    pub fn hashtags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tag
            .iter()
            .filter(|tag| tag.get("type").and_then(Value::as_str) == Some("Hashtag"))
            .filter_map(|tag| tag.get("name").and_then(Value::as_str))
            .map(normalize_hashtag)
            .filter(|name| !name.is_empty())
            .collect();
        tags.sort();
        tags.dedup();
        tags
    }

    pub fn attachments(&self) -> Vec<AttachmentObject> {
        self.attachment
            .iter()
            .filter_map(AttachmentObject::from_value)
            .collect()
    }
}

pub fn normalize_hashtag(name: &str) -> String {
    name.trim().trim_start_matches('#').to_lowercase()
}

/// Media attached to a note
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentObject {
    pub url: String,
    pub media_type: Option<String>,
    pub description: Option<String>,
}

impl AttachmentObject {
    fn from_value(value: &Value) -> Option<Self> {
        let kind = value.get("type").and_then(Value::as_str)?;
        if !matches!(kind, "Document" | "Image" | "Video" | "Audio") {
            return None;
        }
        let url = value.get("url").and_then(url_of)?;
        Some(Self {
            url: url.to_string(),
            media_type: value
                .get("mediaType")
                .and_then(Value::as_str)
                .map(str::to_string),
            description: value
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default)]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBlock {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    pub public_key_pem: String,
}

fn de_public_key<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<PublicKeyBlock>, D::Error> {
    let items = one_or_many(Value::deserialize(deserializer)?);
    Ok(items
        .into_iter()
        .find_map(|item| PublicKeyBlock::deserialize(item).ok()))
}

/// Actor document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "de_url")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "de_url")]
    pub icon: Option<String>,
    #[serde(default, deserialize_with = "de_url")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_bool")]
    pub manually_approves_followers: bool,
    #[serde(default, deserialize_with = "de_id")]
    pub inbox: Option<String>,
    #[serde(default, deserialize_with = "de_id")]
    pub outbox: Option<String>,
    #[serde(default, deserialize_with = "de_id")]
    pub followers: Option<String>,
    #[serde(default, deserialize_with = "de_id")]
    pub following: Option<String>,
    #[serde(default, deserialize_with = "de_id")]
    pub featured: Option<String>,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
    #[serde(default, deserialize_with = "de_public_key")]
    pub public_key: Option<PublicKeyBlock>,
    #[serde(default, deserialize_with = "de_list")]
    pub attachment: Vec<Value>,
    #[serde(default)]
    pub published: Option<String>,
}

impl ActorObject {
    pub fn from_value(doc: &Value) -> Result<Self, AppError> {
        from_document(doc, "actor")
    }

    pub fn shared_inbox(&self) -> Option<&str> {
        self.endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.shared_inbox.as_deref())
    }

    /// `PropertyValue` attachments as `(name, value)` pairs
    pub fn profile_fields(&self) -> Vec<(String, String)> {
        self.attachment
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("PropertyValue"))
            .filter_map(|item| {
                let name = item.get("name").and_then(Value::as_str)?;
                let value = item.get("value").and_then(Value::as_str).unwrap_or_default();
                Some((name.to_string(), value.to_string()))
            })
            .collect()
    }
}

// =============================================================================
// References and activities
// =============================================================================

/// The `object` of an activity: a bare URI or an embedded document
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Uri(String),
    Embedded(Value),
}

impl ObjectRef {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(uri) => Some(ObjectRef::Uri(uri.clone())),
            Value::Object(_) => Some(ObjectRef::Embedded(value.clone())),
            Value::Array(items) => items.first().and_then(ObjectRef::from_value),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ObjectRef::Uri(uri) => Some(uri.as_str()),
            ObjectRef::Embedded(doc) => doc.get("id").and_then(Value::as_str),
        }
    }

    /// Type of an embedded object; `None` for bare URIs
    pub fn object_type(&self) -> Option<&str> {
        match self {
            ObjectRef::Uri(_) => None,
            ObjectRef::Embedded(doc) => doc.get("type").and_then(Value::as_str),
        }
    }

    pub fn require_id(&self) -> Result<&str, AppError> {
        self.id()
            .ok_or_else(|| AppError::Validation("Object has no id".to_string()))
    }
}

/// Wire shape shared by every activity
#[derive(Debug, Deserialize)]
struct RawActivity {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, deserialize_with = "de_id")]
    actor: Option<String>,
    #[serde(default)]
    object: Option<Value>,
    #[serde(default, deserialize_with = "de_id")]
    target: Option<String>,
    #[serde(default)]
    published: Option<String>,
    #[serde(default, deserialize_with = "de_audience")]
    to: Vec<String>,
    #[serde(default, deserialize_with = "de_audience")]
    cc: Vec<String>,
}

/// Header fields common to every inbound activity
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityMeta {
    pub id: Option<String>,
    pub actor: String,
    pub published: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

/// Inbound activity, one variant per interpreted type
#[derive(Debug, Clone, PartialEq)]
pub enum InboundActivity {
    Create(ActivityMeta, ObjectRef),
    Update(ActivityMeta, ObjectRef),
    Delete(ActivityMeta, ObjectRef),
    Follow(ActivityMeta, String),
    Accept(ActivityMeta, ObjectRef),
    Reject(ActivityMeta, ObjectRef),
    Undo(ActivityMeta, ObjectRef),
    Announce(ActivityMeta, String),
    Like(ActivityMeta, String),
    Add {
        meta: ActivityMeta,
        object: String,
        target: Option<String>,
    },
    Remove {
        meta: ActivityMeta,
        object: String,
        target: Option<String>,
    },
}

impl InboundActivity {
    /// Decode an activity document
    ///
    /// # Errors
    /// `UnknownActivityType` for types outside the interpreted subset,
    /// `Validation` for a missing `type`, `actor` or `object`.
    pub fn parse(doc: &Value) -> Result<Self, AppError> {
        let raw: RawActivity = from_document(doc, "activity")?;

        let actor = raw
            .actor
            .ok_or_else(|| AppError::Validation(format!("{} without actor", raw.kind)))?;
        let meta = ActivityMeta {
            id: raw.id,
            actor,
            published: raw.published,
            to: raw.to,
            cc: raw.cc,
        };

        let kind = raw.kind;
        let object = raw
            .object
            .as_ref()
            .and_then(ObjectRef::from_value)
            .ok_or_else(|| AppError::Validation(format!("{} without object", kind)));
        let object_uri = || -> Result<String, AppError> {
            raw.object
                .as_ref()
                .and_then(id_of)
                .map(str::to_string)
                .ok_or_else(|| AppError::Validation(format!("{} without object id", kind)))
        };

        let activity = match kind.as_str() {
            "Create" => InboundActivity::Create(meta, object?),
            "Update" => InboundActivity::Update(meta, object?),
            "Delete" => InboundActivity::Delete(meta, object?),
            "Follow" => InboundActivity::Follow(meta, object_uri()?),
            "Accept" => InboundActivity::Accept(meta, object?),
            "Reject" => InboundActivity::Reject(meta, object?),
            "Undo" => InboundActivity::Undo(meta, object?),
            "Announce" => InboundActivity::Announce(meta, object_uri()?),
            "Like" => InboundActivity::Like(meta, object_uri()?),
            "Add" => InboundActivity::Add {
                meta,
                object: object_uri()?,
                target: raw.target,
            },
            "Remove" => InboundActivity::Remove {
                meta,
                object: object_uri()?,
                target: raw.target,
            },
            _ => return Err(AppError::UnknownActivityType(kind)),
        };
        Ok(activity)
    }

    pub fn meta(&self) -> &ActivityMeta {
        match self {
            InboundActivity::Create(meta, _)
            | InboundActivity::Update(meta, _)
            | InboundActivity::Delete(meta, _)
            | InboundActivity::Follow(meta, _)
            | InboundActivity::Accept(meta, _)
            | InboundActivity::Reject(meta, _)
            | InboundActivity::Undo(meta, _)
            | InboundActivity::Announce(meta, _)
            | InboundActivity::Like(meta, _)
            | InboundActivity::Add { meta, .. }
            | InboundActivity::Remove { meta, .. } => meta,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            InboundActivity::Create(..) => "Create",
            InboundActivity::Update(..) => "Update",
            InboundActivity::Delete(..) => "Delete",
            InboundActivity::Follow(..) => "Follow",
            InboundActivity::Accept(..) => "Accept",
            InboundActivity::Reject(..) => "Reject",
            InboundActivity::Undo(..) => "Undo",
            InboundActivity::Announce(..) => "Announce",
            InboundActivity::Like(..) => "Like",
            InboundActivity::Add { .. } => "Add",
            InboundActivity::Remove { .. } => "Remove",
        }
    }
}

/// Classify addressing into a visibility
///
/// Public when either list carries the public collection, limited when
/// either carries the author's followers collection, direct otherwise.
pub fn classify_visibility(to: &[String], cc: &[String], followers: &str) -> Visibility {
    let mut addresses = to.iter().chain(cc.iter());
    if addresses.clone().any(|address| is_public_address(address)) {
        return Visibility::Public;
    }
    if addresses.any(|address| address == followers) {
        return Visibility::Limited;
    }
    Visibility::Direct
}
