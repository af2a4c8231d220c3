use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};

use crate::{
    domain::{ChatId, PostId, UserId},
    store::{NewScheduledPost, ScheduledPost, Storage, UserAccount},
    Result,
};

/// SQLite-backed storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.replace('\\', "/"));
        let pool = SqlitePoolOptions::new().connect(&url).await?;
        Self::with_pool(pool).await
    }

    /// Private-memory database, single connection so all queries see one db.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn row_to_post(row: &SqliteRow) -> ScheduledPost {
    ScheduledPost {
        id: PostId(row.get::<i64, _>("id")),
        telegram_id: UserId(row.get::<i64, _>("telegram_id")),
        chat_id: ChatId(row.get::<i64, _>("chat_id")),
        caption: row.get::<String, _>("caption"),
        photo_path: row.get::<Option<String>, _>("photo_path"),
        scheduled_at: row.get::<DateTime<Utc>, _>("scheduled_at"),
        posted: row.get::<bool, _>("posted"),
        attempts: row.get::<i64, _>("attempts") as u32,
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn find_account(&self, telegram_id: UserId) -> Result<Option<UserAccount>> {
        let row = sqlx::query(
            "SELECT telegram_id, instagram_username, session_blob, two_factor_enabled \
             FROM accounts WHERE telegram_id = ?",
        )
        .bind(telegram_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| UserAccount {
            telegram_id: UserId(r.get::<i64, _>("telegram_id")),
            instagram_username: r.get::<Option<String>, _>("instagram_username"),
            session_blob: r.get::<Option<Vec<u8>>, _>("session_blob"),
            two_factor_enabled: r.get::<bool, _>("two_factor_enabled"),
        }))
    }

    async fn upsert_account(&self, account: &UserAccount) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (telegram_id, instagram_username, session_blob, two_factor_enabled) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(telegram_id) DO UPDATE SET \
               instagram_username = excluded.instagram_username, \
               session_blob = excluded.session_blob, \
               two_factor_enabled = excluded.two_factor_enabled",
        )
        .bind(account.telegram_id.0)
        .bind(&account.instagram_username)
        .bind(&account.session_blob)
        .bind(account.two_factor_enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_session(&self, telegram_id: UserId) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET session_blob = NULL, two_factor_enabled = 0 \
             WHERE telegram_id = ?",
        )
        .bind(telegram_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_scheduled_post(&self, post: NewScheduledPost) -> Result<ScheduledPost> {
        let res = sqlx::query(
            "INSERT INTO scheduled_posts (telegram_id, chat_id, caption, photo_path, scheduled_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(post.telegram_id.0)
        .bind(post.chat_id.0)
        .bind(&post.caption)
        .bind(&post.photo_path)
        .bind(post.scheduled_at)
        .execute(&self.pool)
        .await?;

        Ok(ScheduledPost {
            id: PostId(res.last_insert_rowid()),
            telegram_id: post.telegram_id,
            chat_id: post.chat_id,
            caption: post.caption,
            photo_path: post.photo_path,
            scheduled_at: post.scheduled_at,
            posted: false,
            attempts: 0,
        })
    }

    async fn pending_posts(&self, max_attempts: u32) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(
            "SELECT id, telegram_id, chat_id, caption, photo_path, scheduled_at, posted, attempts \
             FROM scheduled_posts \
             WHERE posted = 0 AND attempts < ? \
             ORDER BY scheduled_at ASC",
        )
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_post).collect())
    }

    async fn mark_posted(&self, id: PostId) -> Result<bool> {
        let res = sqlx::query("UPDATE scheduled_posts SET posted = 1 WHERE id = ? AND posted = 0")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn bump_attempts(&self, id: PostId) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE scheduled_posts SET attempts = attempts + 1 WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        let attempts: i64 = sqlx::query("SELECT attempts FROM scheduled_posts WHERE id = ?")
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?
            .get("attempts");

        tx.commit().await?;
        Ok(attempts as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn account_upsert_find_clear() {
        let store = SqliteStorage::connect_in_memory().await.unwrap();

        assert!(store.find_account(UserId(1)).await.unwrap().is_none());

        let mut account = UserAccount::new(UserId(1));
        account.instagram_username = Some("alice".to_string());
        account.session_blob = Some(vec![1, 2, 3]);
        account.two_factor_enabled = true;
        store.upsert_account(&account).await.unwrap();

        let found = store.find_account(UserId(1)).await.unwrap().unwrap();
        assert_eq!(found, account);

        // Upsert overwrites in place, no duplicate row.
        account.instagram_username = Some("alice2".to_string());
        store.upsert_account(&account).await.unwrap();
        let found = store.find_account(UserId(1)).await.unwrap().unwrap();
        assert_eq!(found.instagram_username.as_deref(), Some("alice2"));

        store.clear_session(UserId(1)).await.unwrap();
        let cleared = store.find_account(UserId(1)).await.unwrap().unwrap();
        assert!(cleared.session_blob.is_none());
        assert!(!cleared.two_factor_enabled);
        assert_eq!(cleared.instagram_username.as_deref(), Some("alice2"));
    }

    #[tokio::test]
    async fn scheduled_post_lifecycle() {
        let store = SqliteStorage::connect_in_memory().await.unwrap();

        let created = store
            .create_scheduled_post(NewScheduledPost {
                telegram_id: UserId(7),
                chat_id: ChatId(7),
                caption: "hello".to_string(),
                photo_path: Some("/tmp/a.jpg".to_string()),
                scheduled_at: Utc::now() - Duration::minutes(1),
            })
            .await
            .unwrap();
        assert!(!created.posted);
        assert_eq!(created.attempts, 0);

        let pending = store.pending_posts(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, created.id);
        assert_eq!(pending[0].caption, "hello");

        // First mark wins, the second sees an already-posted row.
        assert!(store.mark_posted(created.id).await.unwrap());
        assert!(!store.mark_posted(created.id).await.unwrap());
        assert!(store.pending_posts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attempts_cap_hides_exhausted_posts() {
        let store = SqliteStorage::connect_in_memory().await.unwrap();

        let post = store
            .create_scheduled_post(NewScheduledPost {
                telegram_id: UserId(1),
                chat_id: ChatId(1),
                caption: "x".to_string(),
                photo_path: None,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(store.bump_attempts(post.id).await.unwrap(), 1);
        assert_eq!(store.bump_attempts(post.id).await.unwrap(), 2);

        assert_eq!(store.pending_posts(3).await.unwrap().len(), 1);
        assert!(store.pending_posts(2).await.unwrap().is_empty());
    }
}
