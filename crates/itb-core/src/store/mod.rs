//! Persistence port and records.
//!
//! The bot stores two kinds of rows: one account per Telegram user (with the
//! encrypted Instagram session blob) and the scheduled-post queue. SQLite is
//! the production backend; tests run against the in-memory implementation.

pub mod memory;
pub mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, PostId, UserId},
    Result,
};

/// Persisted per-user account record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAccount {
    pub telegram_id: UserId,
    pub instagram_username: Option<String>,
    /// Encrypted session settings dump; opaque at this layer.
    pub session_blob: Option<Vec<u8>>,
    pub two_factor_enabled: bool,
}

impl UserAccount {
    pub fn new(telegram_id: UserId) -> Self {
        Self {
            telegram_id,
            instagram_username: None,
            session_blob: None,
            two_factor_enabled: false,
        }
    }
}

/// Persisted scheduled post.
///
/// `posted` transitions false -> true at most once; `attempts` counts failed
/// publish attempts so the runner can stop retrying at the configured cap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledPost {
    pub id: PostId,
    pub telegram_id: UserId,
    pub chat_id: ChatId,
    pub caption: String,
    pub photo_path: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub posted: bool,
    pub attempts: u32,
}

/// Fields for creating a scheduled post.
#[derive(Clone, Debug)]
pub struct NewScheduledPost {
    pub telegram_id: UserId,
    pub chat_id: ChatId,
    pub caption: String,
    pub photo_path: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Storage port. All operations are transactional per call: a single logical
/// write (e.g. "upsert account including credentials blob") either lands
/// completely or not at all.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn find_account(&self, telegram_id: UserId) -> Result<Option<UserAccount>>;

    /// Insert or update the whole account row in one unit.
    async fn upsert_account(&self, account: &UserAccount) -> Result<()>;

    /// Drop the credentials blob and two-factor flag, keeping the row.
    async fn clear_session(&self, telegram_id: UserId) -> Result<()>;

    async fn create_scheduled_post(&self, post: NewScheduledPost) -> Result<ScheduledPost>;

    /// Unposted rows that have not exhausted their attempts, oldest first.
    async fn pending_posts(&self, max_attempts: u32) -> Result<Vec<ScheduledPost>>;

    /// Flip `posted` to true. Returns false when the row was already posted
    /// (or missing), so overlapping scans cannot publish a row twice.
    async fn mark_posted(&self, id: PostId) -> Result<bool>;

    /// Record a failed publish attempt, returning the new attempt count.
    async fn bump_attempts(&self, id: PostId) -> Result<u32>;
}
