//! Per-user Instagram session management.
//!
//! The manager owns exactly one [`SessionHandle`] per Telegram user. A handle
//! wraps one Instagram client instance plus the authentication state machine:
//!
//! ```text
//! Anonymous -> Authenticating -> Authenticated | AwaitingTwoFactor | Rejected
//! AwaitingTwoFactor -> Authenticated | Anonymous
//! Authenticated -> Anonymous (logout)
//! ```
//!
//! Only the encrypted credentials blob survives a restart; everything else is
//! rebuilt lazily by `resolve`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    domain::UserId,
    instagram::{
        port::{ClientFactory, InstagramClient},
        types::{AccountStats, ApiError, PostStats},
    },
    store::{Storage, UserAccount},
    vault::SessionVault,
    Error, Result,
};

/// Authentication state of one handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated,
    AwaitingTwoFactor,
    Rejected,
}

/// Classified result of a login attempt.
///
/// Rate-limited / blocked / private / not-found all surface as
/// `InvalidCredentials` ("try again"); the distinction is logged, not shown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    InvalidCredentials,
    TwoFactorRequired,
    /// Identity challenge flows are not solvable in this version.
    ChallengeRequired,
    /// Unexpected remote failure, or login succeeded remotely but credentials
    /// could not be persisted.
    Failed,
}

/// Conversation step of one user, attached to their handle so it cannot leak
/// across users or outlive the session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConversationState {
    #[default]
    Idle,
    /// A photo arrived; waiting for its caption.
    AwaitingCaption { photo_path: PathBuf },
    /// "Post story" selected; waiting for the photo.
    AwaitingStoryPhoto,
    /// Login returned two-factor-required; waiting for the code.
    AwaitingTwoFactorCode,
}

#[derive(Debug, Default)]
struct HandleState {
    auth: AuthState,
    username: Option<String>,
    last_login: Option<LoginOutcome>,
    conversation: ConversationState,
}

/// In-memory session of one Telegram user.
pub struct SessionHandle {
    client: Arc<dyn InstagramClient>,
    state: Mutex<HandleState>,
    /// Serializes remote calls: at most one in flight per handle.
    op: Mutex<()>,
}

impl SessionHandle {
    fn new(client: Arc<dyn InstagramClient>) -> Self {
        Self {
            client,
            state: Mutex::new(HandleState::default()),
            op: Mutex::new(()),
        }
    }

    pub async fn auth_state(&self) -> AuthState {
        self.state.lock().await.auth
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.auth == AuthState::Authenticated
    }

    pub async fn username(&self) -> Option<String> {
        self.state.lock().await.username.clone()
    }

    pub async fn last_login(&self) -> Option<LoginOutcome> {
        self.state.lock().await.last_login
    }

    pub async fn conversation(&self) -> ConversationState {
        self.state.lock().await.conversation.clone()
    }

    pub async fn set_conversation(&self, next: ConversationState) {
        self.state.lock().await.conversation = next;
    }
}

/// Owns all session handles, keyed by Telegram user id.
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    factory: Arc<dyn ClientFactory>,
    vault: Arc<SessionVault>,
    handles: Mutex<HashMap<i64, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        factory: Arc<dyn ClientFactory>,
        vault: Arc<SessionVault>,
    ) -> Self {
        Self {
            storage,
            factory,
            vault,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Create-or-fetch the handle for `user`.
    ///
    /// On first creation this tries to restore the persisted session blob; a
    /// missing account or blob is a normal outcome (the handle stays
    /// `Anonymous`), and restore failures are logged, never surfaced.
    pub async fn resolve(&self, user: UserId) -> Arc<SessionHandle> {
        {
            let handles = self.handles.lock().await;
            if let Some(handle) = handles.get(&user.0) {
                return handle.clone();
            }
        }

        let handle = Arc::new(SessionHandle::new(self.factory.make()));
        if let Err(e) = self.try_restore(user, &handle).await {
            warn!(user = user.0, "session restore failed: {e}");
        }

        let mut handles = self.handles.lock().await;
        // Another caller may have raced us here; keep the first one in.
        handles
            .entry(user.0)
            .or_insert_with(|| handle.clone())
            .clone()
    }

    async fn try_restore(&self, user: UserId, handle: &SessionHandle) -> Result<()> {
        let Some(account) = self.storage.find_account(user).await? else {
            return Ok(());
        };
        let Some(blob) = account.session_blob else {
            return Ok(());
        };

        let settings = self.vault.open(&blob)?;
        handle.client.load_settings(&settings).await?;

        let mut st = handle.state.lock().await;
        st.auth = AuthState::Authenticated;
        st.username = account.instagram_username;
        info!(user = user.0, "session restored from storage");
        Ok(())
    }

    pub async fn is_authenticated(&self, user: UserId) -> bool {
        self.resolve(user).await.is_authenticated().await
    }

    /// Log in with username/password, classifying every remote failure.
    pub async fn login(&self, user: UserId, username: &str, password: &str) -> LoginOutcome {
        let handle = self.resolve(user).await;
        let _op = handle.op.lock().await;

        handle.state.lock().await.auth = AuthState::Authenticating;

        let outcome = match handle.client.login(username, password).await {
            Ok(()) => {
                // Account upsert + credentials blob is one storage write; if it
                // fails the login is reported as not fully successful.
                match self.persist_session(user, &handle, username, None).await {
                    Ok(()) => {
                        let mut st = handle.state.lock().await;
                        st.auth = AuthState::Authenticated;
                        st.username = Some(username.to_string());
                        info!(user = user.0, username, "instagram login ok");
                        LoginOutcome::Success
                    }
                    Err(e) => {
                        warn!(user = user.0, "login succeeded but persist failed: {e}");
                        handle.state.lock().await.auth = AuthState::Anonymous;
                        LoginOutcome::Failed
                    }
                }
            }
            Err(ApiError::TwoFactorRequired) => {
                let mut st = handle.state.lock().await;
                st.auth = AuthState::AwaitingTwoFactor;
                st.username = Some(username.to_string());
                st.conversation = ConversationState::AwaitingTwoFactorCode;
                info!(user = user.0, "login needs two-factor code");
                LoginOutcome::TwoFactorRequired
            }
            Err(ApiError::ChallengeRequired) => {
                warn!(user = user.0, "login hit an identity challenge");
                handle.state.lock().await.auth = AuthState::Rejected;
                LoginOutcome::ChallengeRequired
            }
            Err(
                e @ (ApiError::BadCredentials
                | ApiError::Throttled
                | ApiError::Forbidden
                | ApiError::NotFound
                | ApiError::PrivateAccount
                | ApiError::Connection(_)),
            ) => {
                warn!(user = user.0, "login rejected: {e}");
                handle.state.lock().await.auth = AuthState::Rejected;
                LoginOutcome::InvalidCredentials
            }
            Err(e) => {
                warn!(user = user.0, "unexpected login failure: {e}");
                handle.state.lock().await.auth = AuthState::Rejected;
                LoginOutcome::Failed
            }
        };

        let mut st = handle.state.lock().await;
        st.last_login = Some(outcome);
        // Any outcome other than "send me the code" ends a code prompt that
        // may be left over from an abandoned two-factor login.
        if outcome != LoginOutcome::TwoFactorRequired {
            st.conversation = ConversationState::Idle;
        }
        outcome
    }

    /// Submit a two-factor code for a pending login.
    ///
    /// Only meaningful in `AwaitingTwoFactor`; a failed code drops the pending
    /// state entirely so the user restarts `/login` (codes go stale, there is
    /// no bounded-retry loop to get wrong).
    pub async fn complete_two_factor(&self, user: UserId, code: &str) -> bool {
        let handle = self.resolve(user).await;
        let _op = handle.op.lock().await;

        let username = {
            let mut st = handle.state.lock().await;
            if st.auth != AuthState::AwaitingTwoFactor {
                // No login is pending; a leftover code prompt must not keep
                // swallowing free text.
                if st.conversation == ConversationState::AwaitingTwoFactorCode {
                    st.conversation = ConversationState::Idle;
                }
                return false;
            }
            st.username.clone().unwrap_or_default()
        };

        match handle.client.two_factor_login(code).await {
            Ok(()) => {
                if let Err(e) = self
                    .persist_session(user, &handle, &username, Some(true))
                    .await
                {
                    warn!(user = user.0, "2fa succeeded but persist failed: {e}");
                    handle.state.lock().await.auth = AuthState::Anonymous;
                    return false;
                }
                let mut st = handle.state.lock().await;
                st.auth = AuthState::Authenticated;
                st.conversation = ConversationState::Idle;
                info!(user = user.0, "two-factor login ok");
                true
            }
            Err(e) => {
                warn!(user = user.0, "two-factor login failed: {e}");
                let mut st = handle.state.lock().await;
                st.auth = AuthState::Anonymous;
                st.conversation = ConversationState::Idle;
                false
            }
        }
    }

    /// Log out. Remote failure never blocks the local clear-down: the handle
    /// is dropped and the stored blob cleared regardless.
    pub async fn logout(&self, user: UserId) -> bool {
        let handle = self.resolve(user).await;
        {
            let _op = handle.op.lock().await;

            if !handle.is_authenticated().await {
                return false;
            }

            if let Err(e) = handle.client.logout().await {
                warn!(user = user.0, "remote logout failed (ignored): {e}");
            }
            if let Err(e) = self.storage.clear_session(user).await {
                warn!(user = user.0, "failed to clear stored session: {e}");
            }

            let mut st = handle.state.lock().await;
            st.auth = AuthState::Anonymous;
            st.username = None;
            st.conversation = ConversationState::Idle;
        }

        // The handle itself dies with the logout; the next interaction builds
        // a fresh client.
        self.handles.lock().await.remove(&user.0);
        info!(user = user.0, "logged out");
        true
    }

    /// Whole-account counters. `None` on any remote failure (logged); an empty
    /// media list is zero likes, not an error.
    pub async fn account_stats(&self, user: UserId) -> Option<AccountStats> {
        let handle = self.resolve(user).await;
        let _op = handle.op.lock().await;

        let username = {
            let st = handle.state.lock().await;
            if st.auth != AuthState::Authenticated {
                return None;
            }
            st.username.clone()?
        };

        let stats = async {
            let user_id = handle.client.user_id_from_username(&username).await?;
            let info = handle.client.user_info(&user_id).await?;
            let medias = handle.client.user_medias(&user_id, 0).await?;

            Ok::<_, ApiError>(AccountStats {
                total_likes: medias.iter().map(|m| m.like_count).sum(),
                followers: info.follower_count,
                following: info.following_count,
                media_count: info.media_count,
            })
        }
        .await;

        match stats {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(user = user.0, "account stats failed: {e}");
                None
            }
        }
    }

    /// Counters for the newest post. Zero-valued when the account has no
    /// media; `None` on remote failure.
    pub async fn last_post_stats(&self, user: UserId) -> Option<PostStats> {
        let handle = self.resolve(user).await;
        let _op = handle.op.lock().await;

        let username = {
            let st = handle.state.lock().await;
            if st.auth != AuthState::Authenticated {
                return None;
            }
            st.username.clone()?
        };

        let stats = async {
            let user_id = handle.client.user_id_from_username(&username).await?;
            let medias = handle.client.user_medias(&user_id, 1).await?;

            Ok::<_, ApiError>(match medias.first() {
                Some(m) => PostStats {
                    likes: m.like_count,
                    comments: m.comment_count,
                    views: m.view_count,
                },
                None => PostStats::default(),
            })
        }
        .await;

        match stats {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(user = user.0, "last post stats failed: {e}");
                None
            }
        }
    }

    /// Publish a photo. Unlike the query operations this propagates: calling
    /// it unauthenticated is a caller bug, and remote failures bubble up so
    /// the caller can clean up its temp file.
    pub async fn publish_photo(&self, user: UserId, path: &Path, caption: &str) -> Result<()> {
        let handle = self.resolve(user).await;
        let _op = handle.op.lock().await;

        if !handle.is_authenticated().await {
            return Err(Error::NotAuthenticated);
        }

        handle.client.photo_upload(path, caption).await?;
        info!(user = user.0, "photo published");
        Ok(())
    }

    /// Publish a story photo. Same propagation contract as `publish_photo`.
    pub async fn publish_story(&self, user: UserId, path: &Path) -> Result<()> {
        let handle = self.resolve(user).await;
        let _op = handle.op.lock().await;

        if !handle.is_authenticated().await {
            return Err(Error::NotAuthenticated);
        }

        handle.client.story_upload(path).await?;
        info!(user = user.0, "story published");
        Ok(())
    }

    async fn persist_session(
        &self,
        user: UserId,
        handle: &SessionHandle,
        username: &str,
        two_factor: Option<bool>,
    ) -> Result<()> {
        let settings = handle.client.dump_settings().await?;
        let blob = self.vault.seal(&settings)?;

        let mut account = self
            .storage
            .find_account(user)
            .await?
            .unwrap_or_else(|| UserAccount::new(user));
        account.instagram_username = Some(username.to_string());
        account.session_blob = Some(blob);
        if let Some(tf) = two_factor {
            account.two_factor_enabled = tf;
        }

        self.storage.upsert_account(&account).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Script-driven Instagram fake shared by the session and scheduler tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::instagram::types::{ApiResult, Media, UserInfo};

    /// What the next `login` call should do.
    #[derive(Clone, Debug)]
    pub enum LoginScript {
        Ok,
        TwoFactor,
        Challenge,
        BadPassword,
        Throttled,
        Explode,
    }

    pub struct FakeInstagram {
        pub login_script: StdMutex<LoginScript>,
        pub two_factor_ok: StdMutex<bool>,
        pub logout_fails: StdMutex<bool>,
        pub medias: StdMutex<Vec<Media>>,
        pub uploads: StdMutex<Vec<(String, String)>>,
        pub story_uploads: StdMutex<Vec<String>>,
        pub loaded_settings: StdMutex<Option<String>>,
        pub upload_fails: StdMutex<bool>,
        pub logins: AtomicUsize,
    }

    impl Default for FakeInstagram {
        fn default() -> Self {
            Self {
                login_script: StdMutex::new(LoginScript::Ok),
                two_factor_ok: StdMutex::new(true),
                logout_fails: StdMutex::new(false),
                medias: StdMutex::new(vec![]),
                uploads: StdMutex::new(vec![]),
                story_uploads: StdMutex::new(vec![]),
                loaded_settings: StdMutex::new(None),
                upload_fails: StdMutex::new(false),
                logins: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl InstagramClient for FakeInstagram {
        async fn login(&self, _username: &str, _password: &str) -> ApiResult<()> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            match self.login_script.lock().unwrap().clone() {
                LoginScript::Ok => Ok(()),
                LoginScript::TwoFactor => Err(ApiError::TwoFactorRequired),
                LoginScript::Challenge => Err(ApiError::ChallengeRequired),
                LoginScript::BadPassword => Err(ApiError::BadCredentials),
                LoginScript::Throttled => Err(ApiError::Throttled),
                LoginScript::Explode => Err(ApiError::Unexpected("boom".to_string())),
            }
        }

        async fn two_factor_login(&self, _code: &str) -> ApiResult<()> {
            if *self.two_factor_ok.lock().unwrap() {
                Ok(())
            } else {
                Err(ApiError::BadCredentials)
            }
        }

        async fn logout(&self) -> ApiResult<()> {
            if *self.logout_fails.lock().unwrap() {
                Err(ApiError::Connection("reset by peer".to_string()))
            } else {
                Ok(())
            }
        }

        async fn dump_settings(&self) -> ApiResult<String> {
            Ok(r#"{"uuid":"fake-device","cookies":{"sessionid":"s3cr3t"}}"#.to_string())
        }

        async fn load_settings(&self, blob: &str) -> ApiResult<()> {
            *self.loaded_settings.lock().unwrap() = Some(blob.to_string());
            Ok(())
        }

        async fn user_id_from_username(&self, _username: &str) -> ApiResult<String> {
            Ok("123".to_string())
        }

        async fn user_info(&self, _user_id: &str) -> ApiResult<UserInfo> {
            Ok(UserInfo {
                user_id: "123".to_string(),
                username: "fake".to_string(),
                follower_count: 42,
                following_count: 7,
                media_count: self.medias.lock().unwrap().len() as u64,
            })
        }

        async fn user_medias(&self, _user_id: &str, limit: u32) -> ApiResult<Vec<Media>> {
            let medias = self.medias.lock().unwrap().clone();
            if limit == 0 {
                Ok(medias)
            } else {
                Ok(medias.into_iter().take(limit as usize).collect())
            }
        }

        async fn photo_upload(&self, path: &Path, caption: &str) -> ApiResult<()> {
            if *self.upload_fails.lock().unwrap() {
                return Err(ApiError::Connection("upload failed".to_string()));
            }
            self.uploads
                .lock()
                .unwrap()
                .push((path.to_string_lossy().to_string(), caption.to_string()));
            Ok(())
        }

        async fn story_upload(&self, path: &Path) -> ApiResult<()> {
            if *self.upload_fails.lock().unwrap() {
                return Err(ApiError::Connection("upload failed".to_string()));
            }
            self.story_uploads
                .lock()
                .unwrap()
                .push(path.to_string_lossy().to_string());
            Ok(())
        }
    }

    /// Factory handing out the same shared fake, or fresh ones per call.
    pub struct FakeFactory {
        pub shared: StdMutex<Vec<Arc<FakeInstagram>>>,
        pub made: AtomicUsize,
    }

    impl Default for FakeFactory {
        fn default() -> Self {
            Self {
                shared: StdMutex::new(vec![]),
                made: AtomicUsize::new(0),
            }
        }
    }

    impl FakeFactory {
        /// The nth client this factory handed out.
        pub fn client(&self, n: usize) -> Arc<FakeInstagram> {
            self.shared.lock().unwrap()[n].clone()
        }

        pub fn made_count(&self) -> usize {
            self.made.load(Ordering::SeqCst)
        }
    }

    impl ClientFactory for FakeFactory {
        fn make(&self) -> Arc<dyn InstagramClient> {
            let client = Arc::new(FakeInstagram::default());
            self.shared.lock().unwrap().push(client.clone());
            self.made.fetch_add(1, Ordering::SeqCst);
            client
        }
    }
}
