//! Status service
//!
//! Handles statuses authored by local actors.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{
    Conversation, Database, EntityId, Status, StatusExtras, Visibility, is_unique_violation,
};
use crate::error::AppError;

const MAX_STATUS_CHARS: usize = 5000;

/// Turn plain text into the HTML stored for statuses
///
/// Blank lines separate paragraphs; single newlines become `<br>`.
fn render_plain_text(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| {
            let escaped = html_escape::encode_text(paragraph);
            format!("<p>{}</p>", escaped.replace('\n', "<br>"))
        })
        .collect()
}

/// Status service
pub struct StatusService {
    db: Arc<Database>,
}

impl StatusService {
    /// Create new status service
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a new status for a local actor
    ///
    /// # Arguments
    /// * `actor_id` - Local author
    /// * `text` - Plain text body
    /// * `spoiler_text` - Optional content warning
    /// * `visibility` - public, unlisted, private, direct
    /// * `in_reply_to_id` - Parent status, whose conversation is joined
    ///
    /// # Returns
    /// Created status with counters of the author and parent recomputed
    pub async fn create_local(
        &self,
        actor_id: i64,
        text: &str,
        spoiler_text: Option<String>,
        visibility: Visibility,
        in_reply_to_id: Option<i64>,
    ) -> Result<Status, AppError> {
        let actor = self.db.get_actor(actor_id).await?.ok_or(AppError::NotFound)?;
        if !actor.is_local() {
            return Err(AppError::Forbidden);
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("status text is required".to_string()));
        }
        if text.chars().count() > MAX_STATUS_CHARS {
            return Err(AppError::Validation(format!(
                "status text exceeds {} characters",
                MAX_STATUS_CHARS
            )));
        }

        let parent = match in_reply_to_id {
            Some(parent_id) => Some(
                self.db
                    .get_status(parent_id)
                    .await?
                    .ok_or(AppError::NotFound)?,
            ),
            None => None,
        };

        let now = Utc::now();
        let conversation_id = match &parent {
            Some(parent) => parent.conversation_id,
            None => {
                let conversation = Conversation {
                    id: EntityId::new().0,
                    visibility,
                    created_at: now,
                };
                self.db.insert_conversation(&conversation).await?;
                conversation.id
            }
        };

        let mut status = Status {
            id: EntityId::new().0,
            uri: String::new(),
            actor_id: actor.id,
            conversation_id,
            in_reply_to_id: parent.as_ref().map(|p| p.id),
            in_reply_to_actor_id: parent.as_ref().map(|p| p.actor_id),
            reblog_of_id: None,
            visibility,
            sensitive: spoiler_text.as_deref().is_some_and(|s| !s.trim().is_empty()),
            spoiler_text: spoiler_text.unwrap_or_default().trim().to_string(),
            content: render_plain_text(text),
            language: None,
            url: None,
            replies_count: 0,
            reblogs_count: 0,
            favourites_count: 0,
            created_at: now,
            updated_at: now,
        };

        let mentions = parent
            .as_ref()
            .map(|p| vec![p.actor_id])
            .unwrap_or_default();
        let extras = StatusExtras {
            mentions,
            ..StatusExtras::default()
        };

        loop {
            status.uri = format!("{}/statuses/{}", actor.uri, status.id);
            status.url = Some(status.uri.clone());
            match self.db.insert_status(&status, &extras).await {
                Ok(_) => break,
                Err(error) if is_unique_violation(&error) => {
                    status.id = EntityId::new().0;
                }
                Err(error) => return Err(error),
            }
        }

        tracing::info!(status_id = status.id, actor = %actor.uri, "Created local status");
        self.db.get_status(status.id).await?.ok_or(AppError::NotFound)
    }

    /// Delete a status authored by a local actor
    pub async fn delete_local(&self, actor_id: i64, status_id: i64) -> Result<(), AppError> {
        let status = self
            .db
            .get_status(status_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if status.actor_id != actor_id {
            return Err(AppError::Forbidden);
        }
        self.db.delete_status(&status).await?;
        Ok(())
    }
}
