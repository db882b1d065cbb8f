//! SQLite database operations
//!
//! All database access goes through this module.
//! Multi-row invariants (relationship pairs, status children, counters) are
//! written through a single method each so no caller can write half of them.

use chrono::Utc;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

/// True when the error is a UNIQUE or PRIMARY KEY constraint violation
pub fn is_unique_violation(error: &AppError) -> bool {
    match error {
        AppError::Database(sqlx::Error::Database(db_error)) => db_error.is_unique_violation(),
        _ => false,
    }
}

fn relationship_columns(edge: RelationshipEdge) -> (&'static str, Option<&'static str>) {
    match edge {
        RelationshipEdge::Follow => ("following", Some("followed_by")),
        RelationshipEdge::Block => ("blocking", Some("blocked_by")),
        RelationshipEdge::Mute => ("muting", None),
    }
}

async fn upsert_relationship_flag(
    conn: &mut sqlx::SqliteConnection,
    actor_id: i64,
    target_id: i64,
    column: &str,
    value: bool,
) -> Result<(), AppError> {
    let now = Utc::now();
    let sql = format!(
        r#"
        INSERT INTO relationships (actor_id, target_id, {column}, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(actor_id, target_id) DO UPDATE
        SET {column} = excluded.{column}, updated_at = excluded.updated_at
        "#
    );
    sqlx::query(&sql)
        .bind(actor_id)
        .bind(target_id)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Raw pool access for ad-hoc queries in tests and diagnostics
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Actors
    // =========================================================================

    pub async fn get_actor(&self, id: i64) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    /// Look up a local actor by username
    pub async fn get_local_actor(&self, name: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE name = ? AND actor_type IN ('local_person', 'local_service')",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    /// Insert a new actor row
    ///
    /// Unique violations on `uri`, `(name, domain)` or `id` are returned
    /// unchanged; see [`is_unique_violation`].
    pub async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_actor_row(&mut conn, actor).await
    }

    /// Overwrite the mutable profile fields of an actor
    pub async fn update_actor_profile(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE actors SET
                actor_type = ?, url = ?, display_name = ?, note = ?, avatar = ?, header = ?,
                locked = ?, public_key_pem = ?, inbox = ?, shared_inbox = ?, outbox = ?,
                followers = ?, following = ?, featured = ?, attributes = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(actor.actor_type)
        .bind(&actor.url)
        .bind(&actor.display_name)
        .bind(&actor.note)
        .bind(&actor.avatar)
        .bind(&actor.header)
        .bind(actor.locked)
        .bind(&actor.public_key_pem)
        .bind(&actor.inbox)
        .bind(&actor.shared_inbox)
        .bind(&actor.outbox)
        .bind(&actor.followers)
        .bind(&actor.following)
        .bind(&actor.featured)
        .bind(&actor.attributes)
        .bind(Utc::now())
        .bind(actor.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete an actor and everything that cascades from it
    ///
    /// Counters of the actors it had relationships with and of the
    /// statuses it replied to, reblogged or reacted to are recomputed.
    /// Returns whether a row was removed.
    pub async fn delete_actor(&self, id: i64) -> Result<bool, AppError> {
        let related_actors = sqlx::query_scalar::<_, i64>(
            "SELECT target_id FROM relationships WHERE actor_id = ? AND target_id != ?",
        )
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let related_statuses = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT in_reply_to_id FROM statuses WHERE actor_id = ? AND in_reply_to_id IS NOT NULL
            UNION
            SELECT reblog_of_id FROM statuses WHERE actor_id = ? AND reblog_of_id IS NOT NULL
            UNION
            SELECT status_id FROM reactions WHERE actor_id = ?
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        // Reblogs of its statuses by other actors go with it.
        let rebloggers = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT actor_id FROM statuses
            WHERE reblog_of_id IN (SELECT id FROM statuses WHERE actor_id = ?) AND actor_id != ?
            "#,
        )
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let result = sqlx::query("DELETE FROM actors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for actor_id in related_actors.into_iter().chain(rebloggers) {
            self.recompute_actor_counters(actor_id).await?;
        }
        for status_id in related_statuses {
            self.recompute_status_counters(status_id).await?;
        }
        Ok(true)
    }

    // =========================================================================
    // Accounts (local signing identities)
    // =========================================================================

    /// Create a local actor together with its signing key
    pub async fn create_local_actor(
        &self,
        actor: &Actor,
        account: &Account,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            insert_actor_row(&mut conn, actor).await?;
            sqlx::query(
                "INSERT INTO accounts (actor_id, private_key_pem, created_at) VALUES (?, ?, ?)",
            )
            .bind(account.actor_id)
            .bind(&account.private_key_pem)
            .bind(account.created_at)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    pub async fn get_account(&self, actor_id: i64) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), AppError> {
        sqlx::query("INSERT INTO conversations (id, visibility, created_at) VALUES (?, ?, ?)")
            .bind(conversation.id)
            .bind(conversation.visibility)
            .bind(conversation.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, AppError> {
        let conversation =
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(conversation)
    }

    // =========================================================================
    // Statuses
    // =========================================================================

    pub async fn get_status(&self, id: i64) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    pub async fn get_status_by_uri(&self, uri: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }

    /// Find an actor's reblog of a status
    pub async fn get_reblog(
        &self,
        actor_id: i64,
        reblog_of_id: i64,
    ) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>(
            "SELECT * FROM statuses WHERE actor_id = ? AND reblog_of_id = ? LIMIT 1",
        )
        .bind(actor_id)
        .bind(reblog_of_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }

    /// Insert a status with its mentions, tags and attachments
    ///
    /// Every attachment also gets a pending metadata request. After commit
    /// the author's counters and the parent/reblog target counters are
    /// recomputed.
    ///
    /// # Returns
    /// IDs of the inserted attachment rows
    pub async fn insert_status(
        &self,
        status: &Status,
        extras: &StatusExtras,
    ) -> Result<Vec<i64>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Vec<i64>, AppError> = async {
            sqlx::query(
                r#"
                INSERT INTO statuses (
                    id, uri, actor_id, conversation_id, in_reply_to_id, in_reply_to_actor_id,
                    reblog_of_id, visibility, sensitive, spoiler_text, content, language, url,
                    replies_count, reblogs_count, favourites_count, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?)
                "#,
            )
            .bind(status.id)
            .bind(&status.uri)
            .bind(status.actor_id)
            .bind(status.conversation_id)
            .bind(status.in_reply_to_id)
            .bind(status.in_reply_to_actor_id)
            .bind(status.reblog_of_id)
            .bind(status.visibility)
            .bind(status.sensitive)
            .bind(&status.spoiler_text)
            .bind(&status.content)
            .bind(&status.language)
            .bind(&status.url)
            .bind(status.created_at)
            .bind(status.updated_at)
            .execute(&mut *conn)
            .await?;

            for actor_id in &extras.mentions {
                sqlx::query(
                    "INSERT OR IGNORE INTO status_mentions (status_id, actor_id) VALUES (?, ?)",
                )
                .bind(status.id)
                .bind(actor_id)
                .execute(&mut *conn)
                .await?;
            }

            for tag in &extras.tags {
                sqlx::query("INSERT OR IGNORE INTO tags (name, created_at) VALUES (?, ?)")
                    .bind(tag)
                    .bind(Utc::now())
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(
                    "INSERT OR IGNORE INTO status_tags (status_id, tag_name) VALUES (?, ?)",
                )
                .bind(status.id)
                .bind(tag)
                .execute(&mut *conn)
                .await?;
            }

            let mut attachment_ids = Vec::with_capacity(extras.attachments.len());
            for attachment in &extras.attachments {
                let attachment_id = EntityId::new().0;
                let now = Utc::now();
                sqlx::query(
                    r#"
                    INSERT INTO status_attachments (id, status_id, url, media_type, description, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(attachment_id)
                .bind(status.id)
                .bind(&attachment.url)
                .bind(&attachment.media_type)
                .bind(&attachment.description)
                .bind(now)
                .execute(&mut *conn)
                .await?;

                upsert_attachment_request_row(&mut conn, attachment_id).await?;

                attachment_ids.push(attachment_id);
            }

            Ok(attachment_ids)
        }
        .await;

        let attachment_ids = match result {
            Ok(ids) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                ids
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(error);
            }
        };
        drop(conn);

        self.recompute_status_dependents(status).await?;
        Ok(attachment_ids)
    }

    /// Overwrite the mutable content fields of a status
    pub async fn update_status_content(&self, status: &Status) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE statuses SET
                content = ?, spoiler_text = ?, sensitive = ?, language = ?, url = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&status.content)
        .bind(&status.spoiler_text)
        .bind(status.sensitive)
        .bind(&status.language)
        .bind(&status.url)
        .bind(Utc::now())
        .bind(status.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a status and recompute the counters it contributed to
    ///
    /// Returns whether a row was removed.
    pub async fn delete_status(&self, status: &Status) -> Result<bool, AppError> {
        // Reblog rows of this status cascade away with it.
        let rebloggers = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT actor_id FROM statuses WHERE reblog_of_id = ?",
        )
        .bind(status.id)
        .fetch_all(&self.pool)
        .await?;

        let result = sqlx::query("DELETE FROM statuses WHERE id = ?")
            .bind(status.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for actor_id in rebloggers {
            if actor_id != status.actor_id {
                self.recompute_actor_counters(actor_id).await?;
            }
        }

        if let Some(reblog_of_id) = status.reblog_of_id {
            self.set_reaction(status.actor_id, reblog_of_id, ReactionFlag::Reblogged, false)
                .await?;
        }
        self.recompute_status_dependents(status).await?;
        Ok(true)
    }

    async fn recompute_status_dependents(&self, status: &Status) -> Result<(), AppError> {
        self.recompute_actor_counters(status.actor_id).await?;
        if let Some(parent_id) = status.in_reply_to_id {
            self.recompute_status_counters(parent_id).await?;
        }
        if let Some(reblog_of_id) = status.reblog_of_id {
            self.recompute_status_counters(reblog_of_id).await?;
        }
        Ok(())
    }

    pub async fn get_status_mentions(&self, status_id: i64) -> Result<Vec<i64>, AppError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT actor_id FROM status_mentions WHERE status_id = ? ORDER BY actor_id",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn get_status_tags(&self, status_id: i64) -> Result<Vec<String>, AppError> {
        let tags = sqlx::query_scalar::<_, String>(
            "SELECT tag_name FROM status_tags WHERE status_id = ? ORDER BY tag_name",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    pub async fn get_attachment(&self, id: i64) -> Result<Option<StatusAttachment>, AppError> {
        let attachment =
            sqlx::query_as::<_, StatusAttachment>("SELECT * FROM status_attachments WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(attachment)
    }

    pub async fn update_attachment_metadata(
        &self,
        id: i64,
        media_type: &str,
        width: i64,
        height: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE status_attachments SET media_type = ?, width = ?, height = ? WHERE id = ?",
        )
        .bind(media_type)
        .bind(width)
        .bind(height)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Get the `(actor, target)` edge, all flags false if never written
    pub async fn get_relationship(
        &self,
        actor_id: i64,
        target_id: i64,
    ) -> Result<Relationship, AppError> {
        let relationship = sqlx::query_as::<_, Relationship>(
            r#"
            SELECT actor_id, target_id, following, followed_by, muting, blocking, blocked_by
            FROM relationships WHERE actor_id = ? AND target_id = ?
            "#,
        )
        .bind(actor_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relationship.unwrap_or(Relationship {
            actor_id,
            target_id,
            ..Relationship::default()
        }))
    }

    /// Set one relationship flag, writing the mirrored side in the same transaction
    ///
    /// Setting a block also clears the follow pair in both directions.
    /// Counters of both actors are recomputed afterwards.
    pub async fn set_relationship(
        &self,
        actor_id: i64,
        target_id: i64,
        edge: RelationshipEdge,
        value: bool,
    ) -> Result<(), AppError> {
        self.set_relationship_with_request(actor_id, target_id, edge, value, None)
            .await
    }

    /// Like [`Self::set_relationship`], also queueing `request` for delivery
    ///
    /// The flag change and the request row commit together or not at all.
    pub async fn set_relationship_with_request(
        &self,
        actor_id: i64,
        target_id: i64,
        edge: RelationshipEdge,
        value: bool,
        request: Option<RelationshipAction>,
    ) -> Result<(), AppError> {
        let (column, mirror) = relationship_columns(edge);

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            upsert_relationship_flag(&mut conn, actor_id, target_id, column, value).await?;
            if let Some(mirror) = mirror {
                upsert_relationship_flag(&mut conn, target_id, actor_id, mirror, value).await?;
            }

            if edge == RelationshipEdge::Block && value {
                for (from, to) in [(actor_id, target_id), (target_id, actor_id)] {
                    upsert_relationship_flag(&mut conn, from, to, "following", false).await?;
                    upsert_relationship_flag(&mut conn, from, to, "followed_by", false).await?;
                }
            }

            if let Some(action) = request {
                upsert_relationship_request_row(&mut conn, actor_id, target_id, action).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(error);
            }
        }
        drop(conn);

        self.recompute_actor_counters(actor_id).await?;
        if target_id != actor_id {
            self.recompute_actor_counters(target_id).await?;
        }
        Ok(())
    }

    /// Recompute follower/following/status counters from source rows
    pub async fn recompute_actor_counters(&self, actor_id: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE actors SET
                followers_count = (
                    SELECT COUNT(*) FROM relationships r
                    WHERE r.actor_id = actors.id AND r.followed_by = 1
                ),
                following_count = (
                    SELECT COUNT(*) FROM relationships r
                    WHERE r.actor_id = actors.id AND r.following = 1
                ),
                statuses_count = (SELECT COUNT(*) FROM statuses s WHERE s.actor_id = actors.id),
                last_status_at = (SELECT MAX(s.created_at) FROM statuses s WHERE s.actor_id = actors.id)
            WHERE id = ?
            "#,
        )
        .bind(actor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Reactions
    // =========================================================================

    /// Get the `(actor, status)` reaction, all flags false if never written
    pub async fn get_reaction(&self, actor_id: i64, status_id: i64) -> Result<Reaction, AppError> {
        let reaction = sqlx::query_as::<_, Reaction>(
            r#"
            SELECT actor_id, status_id, favourited, reblogged, muted, bookmarked, pinned
            FROM reactions WHERE actor_id = ? AND status_id = ?
            "#,
        )
        .bind(actor_id)
        .bind(status_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(reaction.unwrap_or(Reaction {
            actor_id,
            status_id,
            ..Reaction::default()
        }))
    }

    /// Set one reaction flag and recompute the status counters
    pub async fn set_reaction(
        &self,
        actor_id: i64,
        status_id: i64,
        flag: ReactionFlag,
        value: bool,
    ) -> Result<(), AppError> {
        let column = flag.column();
        let now = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO reactions (actor_id, status_id, {column}, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(actor_id, status_id) DO UPDATE
            SET {column} = excluded.{column}, updated_at = excluded.updated_at
            "#
        );
        sqlx::query(&sql)
            .bind(actor_id)
            .bind(status_id)
            .bind(value)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        self.recompute_status_counters(status_id).await
    }

    /// Recompute reply/reblog/favourite counters from source rows
    pub async fn recompute_status_counters(&self, status_id: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE statuses SET
                replies_count = (SELECT COUNT(*) FROM statuses s WHERE s.in_reply_to_id = statuses.id),
                reblogs_count = (SELECT COUNT(*) FROM statuses s WHERE s.reblog_of_id = statuses.id),
                favourites_count = (
                    SELECT COUNT(*) FROM reactions r
                    WHERE r.status_id = statuses.id AND r.favourited = 1
                )
            WHERE id = ?
            "#,
        )
        .bind(status_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Object receipts
    // =========================================================================

    /// Store the raw payload, replacing any earlier receipt for the same URI
    ///
    /// # Returns
    /// Row ID of the receipt
    pub async fn upsert_object(
        &self,
        uri: Option<&str>,
        object_type: &str,
        properties: &serde_json::Value,
    ) -> Result<i64, AppError> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO objects (id, uri, object_type, properties, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                object_type = excluded.object_type,
                properties = excluded.properties,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(EntityId::new().0)
        .bind(uri)
        .bind(object_type)
        .bind(properties.to_string())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_object_by_uri(&self, uri: &str) -> Result<Option<ObjectRecord>, AppError> {
        let object = sqlx::query_as::<_, ObjectRecord>("SELECT * FROM objects WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(object)
    }

    // =========================================================================
    // Delivery requests
    // =========================================================================

    /// Record the latest follow/unfollow intent for a pair
    ///
    /// An existing pending row for the same pair is overwritten and its
    /// attempts reset, so rapid follow/unfollow collapses to one row.
    pub async fn upsert_relationship_request(
        &self,
        actor_id: i64,
        target_id: i64,
        action: RelationshipAction,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        upsert_relationship_request_row(&mut conn, actor_id, target_id, action).await
    }

    /// Record the latest like/unlike intent for an `(actor, status)` pair
    pub async fn upsert_reaction_request(
        &self,
        actor_id: i64,
        status_id: i64,
        action: ReactionAction,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reaction_requests (id, actor_id, status_id, action, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(actor_id, status_id) DO UPDATE SET
                action = excluded.action,
                attempts = 0,
                last_attempt = NULL,
                last_result = NULL,
                revision = reaction_requests.revision + 1
            "#,
        )
        .bind(EntityId::new().0)
        .bind(actor_id)
        .bind(status_id)
        .bind(action)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_actor_refresh_request(&self, actor_id: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actor_refresh_requests (id, actor_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(actor_id) DO UPDATE SET
                attempts = 0,
                last_attempt = NULL,
                last_result = NULL,
                revision = actor_refresh_requests.revision + 1
            "#,
        )
        .bind(EntityId::new().0)
        .bind(actor_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Select rows still under the attempt ceiling, oldest first
    pub async fn pending_requests<R: QueueRow>(
        &self,
        max_attempts: i64,
        limit: i64,
    ) -> Result<Vec<R>, AppError> {
        let sql = format!(
            "SELECT * FROM {} WHERE attempts < ? ORDER BY id LIMIT ?",
            R::TABLE
        );
        let rows = sqlx::query_as::<_, R>(&sql)
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// All rows of a request table, including dead-lettered ones
    pub async fn list_requests<R: QueueRow>(&self) -> Result<Vec<R>, AppError> {
        let sql = format!("SELECT * FROM {} ORDER BY id", R::TABLE);
        let rows = sqlx::query_as::<_, R>(&sql).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    /// Consume a delivered request
    ///
    /// Only deletes the row if it still carries the revision that was
    /// processed; a newer intent upserted meanwhile is kept.
    pub async fn complete_request<R: QueueRow>(&self, row: &R) -> Result<bool, AppError> {
        let sql = format!("DELETE FROM {} WHERE id = ? AND revision = ?", R::TABLE);
        let result = sqlx::query(&sql)
            .bind(row.id())
            .bind(row.revision())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Annotate a failed attempt
    ///
    /// `attempts_floor` lets terminal failures jump straight to the
    /// ceiling; pass 0 for an ordinary retryable failure.
    pub async fn record_request_failure<R: QueueRow>(
        &self,
        row: &R,
        error: &str,
        attempts_floor: i64,
    ) -> Result<(), AppError> {
        let sql = format!(
            r#"
            UPDATE {} SET attempts = MAX(attempts + 1, ?), last_attempt = ?, last_result = ?
            WHERE id = ? AND revision = ?
            "#,
            R::TABLE
        );
        sqlx::query(&sql)
            .bind(attempts_floor)
            .bind(Utc::now())
            .bind(error)
            .bind(row.id())
            .bind(row.revision())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_actor_row(
    conn: &mut sqlx::SqliteConnection,
    actor: &Actor,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO actors (
            id, actor_type, name, domain, uri, url, display_name, note, avatar, header, locked,
            followers_count, following_count, statuses_count, last_status_at, public_key_pem,
            inbox, shared_inbox, outbox, followers, following, featured, attributes,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(actor.id)
    .bind(actor.actor_type)
    .bind(&actor.name)
    .bind(&actor.domain)
    .bind(&actor.uri)
    .bind(&actor.url)
    .bind(&actor.display_name)
    .bind(&actor.note)
    .bind(&actor.avatar)
    .bind(&actor.header)
    .bind(actor.locked)
    .bind(&actor.public_key_pem)
    .bind(&actor.inbox)
    .bind(&actor.shared_inbox)
    .bind(&actor.outbox)
    .bind(&actor.followers)
    .bind(&actor.following)
    .bind(&actor.featured)
    .bind(&actor.attributes)
    .bind(actor.created_at)
    .bind(actor.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Queue a metadata fetch for an attachment, resetting an exhausted one
async fn upsert_attachment_request_row(
    conn: &mut sqlx::SqliteConnection,
    attachment_id: i64,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO status_attachment_requests (id, attachment_id, created_at)
        VALUES (?, ?, ?)
        ON CONFLICT(attachment_id) DO UPDATE SET
            attempts = 0,
            last_attempt = NULL,
            last_result = NULL,
            revision = status_attachment_requests.revision + 1
        "#,
    )
    .bind(EntityId::new().0)
    .bind(attachment_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_relationship_request_row(
    conn: &mut sqlx::SqliteConnection,
    actor_id: i64,
    target_id: i64,
    action: RelationshipAction,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO relationship_requests (id, actor_id, target_id, action, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(actor_id, target_id) DO UPDATE SET
            action = excluded.action,
            attempts = 0,
            last_attempt = NULL,
            last_result = NULL,
            revision = relationship_requests.revision + 1
        "#,
    )
    .bind(EntityId::new().0)
    .bind(actor_id)
    .bind(target_id)
    .bind(action)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
