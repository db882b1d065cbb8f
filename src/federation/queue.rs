//! Delivery queue processors
//!
//! Four request tables share one at-least-once loop: select rows under the
//! attempt ceiling, run the kind-specific handler, delete on success,
//! annotate on failure. Rows past the ceiling stay in place as a record of
//! what went wrong.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::delivery::{ActivityDelivery, Signer, builder};
use super::resolver::RemoteResolver;
use crate::config::FederationConfig;
use crate::data::{
    ActorRefreshRequest, Database, QueueRow, ReactionAction, ReactionRequest,
    RelationshipAction, RelationshipRequest, StatusAttachmentRequest,
};
use crate::error::AppError;
use crate::metrics::DELIVERY_QUEUE_OUTCOMES;

/// Which rows a cycle may pick up
#[derive(Debug, Clone, Copy)]
pub struct Scope {
    /// Rows with this many attempts or more are dead-lettered
    pub max_attempts: i64,
    pub batch_size: i64,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            batch_size: 50,
        }
    }
}

/// Outcome of one processing cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Kind-specific action for one request row
#[async_trait]
pub trait RequestHandler<R: QueueRow>: Send + Sync {
    /// Perform the action
    ///
    /// `AppError::NotFound` marks the row as terminally failed; every
    /// other error is retried on a later cycle.
    async fn handle(&self, row: &R) -> Result<(), AppError>;
}

/// Run one cycle over the rows of `R` selected by `scope`
pub async fn process<R, H>(db: &Database, handler: &H, scope: Scope) -> Result<CycleReport, AppError>
where
    R: QueueRow,
    H: RequestHandler<R> + ?Sized,
{
    let rows = db
        .pending_requests::<R>(scope.max_attempts, scope.batch_size)
        .await?;
    let mut report = CycleReport {
        selected: rows.len(),
        ..CycleReport::default()
    };

    for row in &rows {
        match handler.handle(row).await {
            Ok(()) => {
                if !db.complete_request(row).await? {
                    tracing::debug!(
                        kind = R::KIND,
                        request_id = row.id(),
                        "Request was replaced while in flight, keeping newer intent"
                    );
                }
                report.delivered += 1;
                DELIVERY_QUEUE_OUTCOMES
                    .with_label_values(&[R::KIND, "delivered"])
                    .inc();
            }
            Err(error) => {
                let terminal = matches!(error, AppError::NotFound);
                let attempts_floor = if terminal { scope.max_attempts } else { 0 };
                db.record_request_failure(row, &error.to_string(), attempts_floor)
                    .await?;
                report.failed += 1;

                let outcome = if terminal { "terminal" } else { "failed" };
                DELIVERY_QUEUE_OUTCOMES
                    .with_label_values(&[R::KIND, outcome])
                    .inc();
                tracing::warn!(
                    kind = R::KIND,
                    request_id = row.id(),
                    attempts = row.attempts() + 1,
                    terminal,
                    error = %error,
                    "Request delivery failed"
                );
            }
        }
    }

    Ok(report)
}

// =============================================================================
// Handlers
// =============================================================================

async fn local_signer(db: &Database, actor: &crate::data::Actor) -> Result<Signer, AppError> {
    let account = db.get_account(actor.id).await?.ok_or(AppError::NotFound)?;
    Signer::for_actor(actor, &account)
}

/// Sends Follow / Undo(Follow) for relationship requests
pub struct RelationshipDelivery {
    db: Arc<Database>,
    delivery: ActivityDelivery,
}

impl RelationshipDelivery {
    pub fn new(db: Arc<Database>, delivery: ActivityDelivery) -> Self {
        Self { db, delivery }
    }
}

#[async_trait]
impl RequestHandler<RelationshipRequest> for RelationshipDelivery {
    async fn handle(&self, row: &RelationshipRequest) -> Result<(), AppError> {
        let actor = self.db.get_actor(row.actor_id).await?.ok_or(AppError::NotFound)?;
        let target = self
            .db
            .get_actor(row.target_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if target.is_local() {
            return Ok(());
        }

        let signer = local_signer(&self.db, &actor).await?;
        let follow_id = format!("{}#follows/{}", actor.uri, target.id);
        let follow = builder::follow(&follow_id, &actor.uri, &target.uri);
        let activity = match row.action {
            RelationshipAction::Follow => follow,
            RelationshipAction::Unfollow => {
                builder::undo(&format!("{}/undo", follow_id), &actor.uri, follow)
            }
        };

        self.delivery
            .deliver_to_inbox(&signer, target.delivery_inbox(), &activity)
            .await
    }
}

/// Sends Like / Undo(Like) for reaction requests
pub struct ReactionDelivery {
    db: Arc<Database>,
    delivery: ActivityDelivery,
}

impl ReactionDelivery {
    pub fn new(db: Arc<Database>, delivery: ActivityDelivery) -> Self {
        Self { db, delivery }
    }
}

#[async_trait]
impl RequestHandler<ReactionRequest> for ReactionDelivery {
    async fn handle(&self, row: &ReactionRequest) -> Result<(), AppError> {
        let actor = self.db.get_actor(row.actor_id).await?.ok_or(AppError::NotFound)?;
        let status = self
            .db
            .get_status(row.status_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let author = self
            .db
            .get_actor(status.actor_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if author.is_local() {
            return Ok(());
        }

        let signer = local_signer(&self.db, &actor).await?;
        let like_id = format!("{}#likes/{}", actor.uri, status.id);
        let like = builder::like(&like_id, &actor.uri, &status.uri);
        let activity = match row.action {
            ReactionAction::Like => like,
            ReactionAction::Unlike => builder::undo(&format!("{}/undo", like_id), &actor.uri, like),
        };

        self.delivery
            .deliver_to_inbox(&signer, author.delivery_inbox(), &activity)
            .await
    }
}

/// Re-fetches remote actor documents
pub struct ActorRefresh {
    db: Arc<Database>,
    resolver: Arc<RemoteResolver>,
}

impl ActorRefresh {
    pub fn new(db: Arc<Database>, resolver: Arc<RemoteResolver>) -> Self {
        Self { db, resolver }
    }
}

#[async_trait]
impl RequestHandler<ActorRefreshRequest> for ActorRefresh {
    async fn handle(&self, row: &ActorRefreshRequest) -> Result<(), AppError> {
        let actor = self.db.get_actor(row.actor_id).await?.ok_or(AppError::NotFound)?;
        if actor.is_local() {
            return Ok(());
        }

        match self.resolver.refresh_actor(&actor).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_remote_gone() => Err(AppError::NotFound),
            Err(error) => Err(error),
        }
    }
}

/// Downloads remote attachments and records their type and dimensions
pub struct AttachmentFetcher {
    db: Arc<Database>,
    delivery: ActivityDelivery,
}

impl AttachmentFetcher {
    pub fn new(db: Arc<Database>, delivery: ActivityDelivery) -> Self {
        Self { db, delivery }
    }
}

#[async_trait]
impl RequestHandler<StatusAttachmentRequest> for AttachmentFetcher {
    async fn handle(&self, row: &StatusAttachmentRequest) -> Result<(), AppError> {
        let attachment = self
            .db
            .get_attachment(row.attachment_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let (content_type, bytes) = match self.delivery.fetch_media(&attachment.url).await {
            Ok(media) => media,
            Err(error) if error.is_remote_gone() => return Err(AppError::NotFound),
            Err(error) => return Err(error),
        };

        let reader = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|e| AppError::Validation(format!("Unreadable attachment: {}", e)))?;
        let format = reader.format().ok_or_else(|| {
            AppError::Validation(format!("Unrecognized media format at {}", attachment.url))
        })?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| AppError::Validation(format!("Undecodable attachment: {}", e)))?;

        let media_type = content_type
            .filter(|declared| declared.starts_with("image/"))
            .unwrap_or_else(|| format.to_mime_type().to_string());

        self.db
            .update_attachment_metadata(attachment.id, &media_type, i64::from(width), i64::from(height))
            .await?;
        tracing::debug!(
            attachment_id = attachment.id,
            media_type = %media_type,
            width,
            height,
            "Recorded attachment metadata"
        );
        Ok(())
    }
}

// =============================================================================
// Background tasks
// =============================================================================

/// The four request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Relationship,
    Reaction,
    ActorRefresh,
    StatusAttachment,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::Relationship,
        RequestKind::Reaction,
        RequestKind::ActorRefresh,
        RequestKind::StatusAttachment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Relationship => RelationshipRequest::KIND,
            RequestKind::Reaction => ReactionRequest::KIND,
            RequestKind::ActorRefresh => ActorRefreshRequest::KIND,
            RequestKind::StatusAttachment => StatusAttachmentRequest::KIND,
        }
    }
}

/// Everything the processors need, shared by all four
#[derive(Clone)]
pub struct QueueContext {
    pub db: Arc<Database>,
    pub delivery: ActivityDelivery,
    pub resolver: Arc<RemoteResolver>,
    pub scope: Scope,
    /// Sleep between cycles
    pub interval: Duration,
}

impl QueueContext {
    pub fn new(
        db: Arc<Database>,
        delivery: ActivityDelivery,
        resolver: Arc<RemoteResolver>,
        config: &FederationConfig,
    ) -> Self {
        Self {
            db,
            delivery,
            resolver,
            scope: Scope {
                max_attempts: config.max_attempts,
                batch_size: config.batch_size,
            },
            interval: Duration::from_secs(config.delivery_interval_seconds),
        }
    }
}

async fn run_processor<R, H>(db: Arc<Database>, handler: H, scope: Scope, interval: Duration, cancel: CancellationToken)
where
    R: QueueRow,
    H: RequestHandler<R>,
{
    tracing::info!(kind = R::KIND, interval_secs = interval.as_secs(), "Delivery processor started");

    while !cancel.is_cancelled() {
        match process::<R, H>(&db, &handler, scope).await {
            Ok(report) if report.selected > 0 => {
                tracing::info!(
                    kind = R::KIND,
                    selected = report.selected,
                    delivered = report.delivered,
                    failed = report.failed,
                    "Delivery cycle finished"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::error!(kind = R::KIND, error = %error, "Delivery cycle failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::info!(kind = R::KIND, "Delivery processor stopped");
}

/// Spawn the long-lived processor for one request kind
pub fn spawn_delivery_processor(
    kind: RequestKind,
    ctx: QueueContext,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let QueueContext {
        db,
        delivery,
        resolver,
        scope,
        interval,
    } = ctx;

    match kind {
        RequestKind::Relationship => {
            let handler = RelationshipDelivery::new(db.clone(), delivery);
            tokio::spawn(run_processor::<RelationshipRequest, _>(db, handler, scope, interval, cancel))
        }
        RequestKind::Reaction => {
            let handler = ReactionDelivery::new(db.clone(), delivery);
            tokio::spawn(run_processor::<ReactionRequest, _>(db, handler, scope, interval, cancel))
        }
        RequestKind::ActorRefresh => {
            let handler = ActorRefresh::new(db.clone(), resolver);
            tokio::spawn(run_processor::<ActorRefreshRequest, _>(db, handler, scope, interval, cancel))
        }
        RequestKind::StatusAttachment => {
            let handler = AttachmentFetcher::new(db.clone(), delivery);
            tokio::spawn(run_processor::<StatusAttachmentRequest, _>(
                db, handler, scope, interval, cancel,
            ))
        }
    }
}

/// Start all four processors
pub fn spawn_all(ctx: &QueueContext, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    RequestKind::ALL
        .iter()
        .map(|kind| spawn_delivery_processor(*kind, ctx.clone(), cancel.clone()))
        .collect()
}
