use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::instagram::types::{ApiResult, Media, UserInfo};

/// Hexagonal port for the Instagram private API.
///
/// One instance wraps one logged-in (or logging-in) device session. Settings
/// dump/load carry the opaque credential blob that the core persists between
/// process restarts; the core never looks inside it.
#[async_trait]
pub trait InstagramClient: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> ApiResult<()>;

    /// Complete a login that returned [`ApiError::TwoFactorRequired`].
    async fn two_factor_login(&self, code: &str) -> ApiResult<()>;

    async fn logout(&self) -> ApiResult<()>;

    /// Serialize the device/session state for persistence.
    async fn dump_settings(&self) -> ApiResult<String>;

    /// Restore a previously dumped session without a password.
    async fn load_settings(&self, blob: &str) -> ApiResult<()>;

    async fn user_id_from_username(&self, username: &str) -> ApiResult<String>;
    async fn user_info(&self, user_id: &str) -> ApiResult<UserInfo>;

    /// List account media, newest first. `limit == 0` means "all".
    async fn user_medias(&self, user_id: &str, limit: u32) -> ApiResult<Vec<Media>>;

    async fn photo_upload(&self, path: &Path, caption: &str) -> ApiResult<()>;
    async fn story_upload(&self, path: &Path) -> ApiResult<()>;
}

/// Constructs isolated client instances.
///
/// The session manager builds one client per Telegram user, and the schedule
/// runner builds a throwaway client per publish attempt so a user logging out
/// interactively cannot invalidate an in-flight scheduled publish.
pub trait ClientFactory: Send + Sync {
    fn make(&self) -> Arc<dyn InstagramClient>;
}
