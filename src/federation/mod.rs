//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - Remote actor/status resolution
//! - Activity processing (inbox)
//! - Activity delivery (outbound client)
//! - Delivery queue processors
//! - Public key caching

mod activity;
mod delivery;
mod key_cache;
mod queue;
mod resolver;
mod signature;
pub mod vocab;

#[cfg(test)]
pub(crate) mod test_support;

pub use activity::ActivityProcessor;
pub use delivery::{
    ACTIVITY_CONTENT_TYPE, ActivityDelivery, Signer, builder, spawn_best_effort_delivery,
};
pub use key_cache::PublicKeyCache;
pub use queue::{
    ActorRefresh, AttachmentFetcher, CycleReport, QueueContext, ReactionDelivery,
    RelationshipDelivery, RequestHandler, RequestKind, Scope, process, spawn_all,
    spawn_delivery_processor,
};
pub use resolver::{Ingested, RemoteResolver};
pub use signature::{
    ACTIVITY_ACCEPT, KeyResolver, actor_uri_from_key_id, generate_digest, key_id_matches_actor,
    parse_private_key_pem, parse_public_key_pem, parse_signature_header, sign_request,
    verify_request,
};
