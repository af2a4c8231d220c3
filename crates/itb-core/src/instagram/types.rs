use serde::{Deserialize, Serialize};

/// Closed set of Instagram API failure conditions.
///
/// The adapter maps HTTP/status failures onto these; the core classifies them
/// into user-facing outcomes and never lets them cross into the Telegram layer
/// as raw errors (publish operations excepted).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad credentials")]
    BadCredentials,

    #[error("two-factor authentication required")]
    TwoFactorRequired,

    #[error("identity challenge required")]
    ChallengeRequired,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("forbidden")]
    Forbidden,

    #[error("throttled")]
    Throttled,

    #[error("not found")]
    NotFound,

    #[error("private account")]
    PrivateAccount,

    #[error("unexpected api error: {0}")]
    Unexpected(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Remote profile info, as much of it as the bot cares about.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    pub follower_count: u64,
    pub following_count: u64,
    pub media_count: u64,
}

/// A single media item from the account feed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Media {
    pub media_id: String,
    pub like_count: u64,
    pub comment_count: u64,
    pub view_count: u64,
}

/// Whole-account counters shown by `/stats`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountStats {
    pub total_likes: u64,
    pub followers: u64,
    pub following: u64,
    pub media_count: u64,
}

/// Counters for the most recent post, shown by `/last`.
///
/// All-zero when the account has no media yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostStats {
    pub likes: u64,
    pub comments: u64,
    pub views: u64,
}
