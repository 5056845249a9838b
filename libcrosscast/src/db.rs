//! SQLite persistence for posts, targets and social accounts

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{CrosscastError, DbError, Result};
use crate::repository::{AccountRepository, PostRepository, TargetUpdate};
use crate::types::{
    aggregate_status, Platform, Post, PostStatus, PostWithTargets, SocialAccount, Target,
    TargetKey, TargetStatus, TokenGrant,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn targets_for(&self, post_id: &str) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT post_id, platform, social_account_id, status, error_message, text, title,
                   options, platform_post_id, position, updated_at
            FROM targets
            WHERE post_id = ?
            ORDER BY position ASC, platform ASC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(target_from_row).collect()
    }
}

fn corrupt(table: &'static str, reason: impl Into<String>) -> CrosscastError {
    DbError::CorruptRow {
        table,
        reason: reason.into(),
    }
    .into()
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let status: String = row.get("status");
    Ok(Post {
        id: row.get("id"),
        user_id: row.get("user_id"),
        workspace_id: row.get("workspace_id"),
        main_caption: row.get("main_caption"),
        scheduled_time: row.get("scheduled_time"),
        status: status.parse().map_err(|e: String| corrupt("posts", e))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn target_from_row(row: &SqliteRow) -> Result<Target> {
    let platform: String = row.get("platform");
    let status: String = row.get("status");
    let options: String = row.get("options");

    Ok(Target {
        post_id: row.get("post_id"),
        platform: platform
            .parse::<Platform>()
            .map_err(|e| corrupt("targets", e.to_string()))?,
        social_account_id: row.get("social_account_id"),
        status: status.parse().map_err(|e: String| corrupt("targets", e))?,
        error_message: row.get("error_message"),
        text: row.get("text"),
        title: row.get("title"),
        options: serde_json::from_str::<BTreeMap<String, String>>(&options)
            .map_err(|e| corrupt("targets", format!("invalid options: {}", e)))?,
        platform_post_id: row.get("platform_post_id"),
        position: row.get("position"),
        updated_at: row.get("updated_at"),
    })
}

fn account_from_row(row: &SqliteRow) -> Result<SocialAccount> {
    let platform: String = row.get("platform");
    let workspace_id: String = row.get("workspace_id");

    Ok(SocialAccount {
        id: row.get("id"),
        user_id: row.get("user_id"),
        workspace_id: (!workspace_id.is_empty()).then_some(workspace_id),
        platform: platform
            .parse::<Platform>()
            .map_err(|e| corrupt("social_accounts", e.to_string()))?,
        external_page_id: row.get("external_page_id"),
        display_name: row.get("display_name"),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        expires_at: row.get("expires_at"),
        refresh_expires_at: row.get("refresh_expires_at"),
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl PostRepository for Database {
    async fn create_post(&self, post: &Post, targets: &[Target]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, user_id, workspace_id, main_caption, scheduled_time, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(post.workspace_id.as_deref())
        .bind(&post.main_caption)
        .bind(post.scheduled_time)
        .bind(post.status.as_str())
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        for target in targets {
            let options = serde_json::to_string(&target.options)
                .map_err(|e| corrupt("targets", format!("invalid options: {}", e)))?;

            sqlx::query(
                r#"
                INSERT INTO targets (post_id, platform, social_account_id, status, error_message,
                                     text, title, options, platform_post_id, position, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&target.post_id)
            .bind(target.platform.as_str())
            .bind(&target.social_account_id)
            .bind(target.status.as_str())
            .bind(target.error_message.as_deref())
            .bind(target.text.as_deref())
            .bind(target.title.as_deref())
            .bind(options)
            .bind(target.platform_post_id.as_deref())
            .bind(target.position)
            .bind(target.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    async fn find_post(&self, post_id: &str) -> Result<Option<PostWithTargets>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, workspace_id, main_caption, scheduled_time, status, created_at, updated_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let post = post_from_row(&row)?;
        let targets = self.targets_for(post_id).await?;
        Ok(Some(PostWithTargets { post, targets }))
    }

    async fn update_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE posts SET main_caption = ?, scheduled_time = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(&post.main_caption)
        .bind(post.scheduled_time)
        .bind(now())
        .bind(&post.id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn update_post_status(&self, post_id: &str, status: PostStatus) -> Result<()> {
        sqlx::query("UPDATE posts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn mark_posting(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET status = 'posting', updated_at = ?
            WHERE id = ? AND status NOT IN ('posting', 'draft')
            "#,
        )
        .bind(now())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_post(&self, post_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM targets WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let result = sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_target(&self, key: &TargetKey, update: &TargetUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE targets SET status = ?, error_message = ?, platform_post_id = ?, updated_at = ?
            WHERE post_id = ? AND platform = ? AND social_account_id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.error_message.as_deref())
        .bind(update.platform_post_id.as_deref())
        .bind(now())
        .bind(&key.post_id)
        .bind(key.platform.as_str())
        .bind(&key.social_account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(CrosscastError::not_found(format!(
                "Target {}/{} of post {}",
                key.platform, key.social_account_id, key.post_id
            )));
        }
        Ok(())
    }

    async fn fail_if_in_flight(&self, key: &TargetKey, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets SET status = 'failed', error_message = ?, updated_at = ?
            WHERE post_id = ? AND platform = ? AND social_account_id = ?
              AND status IN ('pending', 'posting')
            "#,
        )
        .bind(error_message)
        .bind(now())
        .bind(&key.post_id)
        .bind(key.platform.as_str())
        .bind(&key.social_account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_target(&self, key: &TargetKey) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM targets WHERE post_id = ? AND platform = ? AND social_account_id = ?",
        )
        .bind(&key.post_id)
        .bind(key.platform.as_str())
        .bind(&key.social_account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn recompute_post_status(&self, post_id: &str) -> Result<Option<PostStatus>> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        // Leading write: takes the database write lock before any row is read
        let touched = sqlx::query("UPDATE posts SET updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        if touched.rows_affected() == 0 {
            return Ok(None);
        }

        let current: String = sqlx::query_scalar("SELECT status FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        let current: PostStatus = current.parse().map_err(|e: String| corrupt("posts", e))?;

        if current == PostStatus::Draft {
            tx.commit().await.map_err(DbError::SqlxError)?;
            return Ok(Some(current));
        }

        let rows: Vec<String> = sqlx::query_scalar("SELECT status FROM targets WHERE post_id = ?")
            .bind(post_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let statuses = rows
            .iter()
            .map(|s| s.parse::<TargetStatus>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| corrupt("targets", e))?;

        let next = aggregate_status(&statuses).unwrap_or(current);
        if next != current {
            sqlx::query("UPDATE posts SET status = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(Some(next))
    }

    async fn due_posts(&self, now: i64, limit: usize) -> Result<Vec<PostWithTargets>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM posts
            WHERE status = 'pending' AND (scheduled_time IS NULL OR scheduled_time <= ?)
              AND EXISTS (SELECT 1 FROM targets t WHERE t.post_id = posts.id)
            ORDER BY COALESCE(scheduled_time, created_at) ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut posts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(post) = self.find_post(&id).await? {
                posts.push(post);
            }
        }
        Ok(posts)
    }

    async fn failed_targets(&self, user_id: &str) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT t.post_id, t.platform, t.social_account_id, t.status, t.error_message, t.text,
                   t.title, t.options, t.platform_post_id, t.position, t.updated_at
            FROM targets t
            JOIN posts p ON p.id = t.post_id
            WHERE p.user_id = ? AND t.status = 'failed'
            ORDER BY t.updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(target_from_row).collect()
    }

    async fn count_failed_targets(&self, user_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM targets t
            JOIN posts p ON p.id = t.post_id
            WHERE p.user_id = ? AND t.status = 'failed'
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl AccountRepository for Database {
    async fn upsert_account(&self, account: &SocialAccount) -> Result<SocialAccount> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO social_accounts (id, user_id, workspace_id, platform, external_page_id,
                                         display_name, access_token, refresh_token, expires_at,
                                         refresh_expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, workspace_id, platform, external_page_id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, social_accounts.display_name),
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, social_accounts.refresh_token),
                expires_at = excluded.expires_at,
                refresh_expires_at = COALESCE(excluded.refresh_expires_at, social_accounts.refresh_expires_at)
            RETURNING id
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(account.workspace_id.as_deref().unwrap_or(""))
        .bind(account.platform.as_str())
        .bind(&account.external_page_id)
        .bind(account.display_name.as_deref())
        .bind(&account.access_token)
        .bind(account.refresh_token.as_deref())
        .bind(account.expires_at)
        .bind(account.refresh_expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.get_account(&id)
            .await?
            .ok_or_else(|| CrosscastError::not_found(format!("Social account {}", id)))
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, workspace_id, platform, external_page_id, display_name,
                   access_token, refresh_token, expires_at, refresh_expires_at
            FROM social_accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn accounts_expiring_before(&self, cutoff: i64) -> Result<Vec<SocialAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, workspace_id, platform, external_page_id, display_name,
                   access_token, refresh_token, expires_at, refresh_expires_at
            FROM social_accounts
            WHERE expires_at IS NOT NULL AND expires_at <= ?
            ORDER BY expires_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(account_from_row).collect()
    }

    async fn save_tokens(&self, account_id: &str, grant: &TokenGrant) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE social_accounts SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                refresh_expires_at = COALESCE(?, refresh_expires_at)
            WHERE id = ?
            "#,
        )
        .bind(&grant.access_token)
        .bind(grant.refresh_token.as_deref())
        .bind(grant.expires_at)
        .bind(grant.refresh_expires_at)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(CrosscastError::not_found(format!("Social account {}", account_id)));
        }
        Ok(())
    }
}
