//! Background publisher for scheduled posts.
//!
//! A fixed-interval loop scans the queue and publishes every due post with a
//! throwaway Instagram client restored from the owner's stored session blob.
//! The interactive session manager is never involved: a user logging out in
//! chat cannot invalidate an in-flight scheduled publish, and a publish
//! failure cannot corrupt the interactive session. The cost is one redundant
//! re-login per post, accepted for the isolation.
//!
//! Failures are retried on later ticks until the per-post attempt cap, then
//! the post is dropped from scanning and its owner told to reschedule.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    domain::UserId,
    instagram::port::ClientFactory,
    messaging::Notifier,
    store::{NewScheduledPost, ScheduledPost, Storage},
    vault::SessionVault,
    Error, Result,
};

#[derive(Clone)]
pub struct ScheduleRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    interval: Duration,
    max_attempts: u32,
    storage: Arc<dyn Storage>,
    factory: Arc<dyn ClientFactory>,
    vault: Arc<SessionVault>,
    notifier: Arc<dyn Notifier>,
    /// Overlap guard: a tick that starts while the previous one still runs is
    /// skipped, so a slow upload cannot cause a double scan.
    tick_lock: Mutex<()>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleRunner {
    pub fn new(
        interval: Duration,
        max_attempts: u32,
        storage: Arc<dyn Storage>,
        factory: Arc<dyn ClientFactory>,
        vault: Arc<SessionVault>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                interval,
                max_attempts: max_attempts.max(1),
                storage,
                factory,
                vault,
                notifier,
                tick_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawn the background loop. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let runner = self.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(runner.inner.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  _ = tick.tick() => {
                    if let Err(e) = runner.tick().await {
                      warn!("scheduler tick failed: {e}");
                    }
                  }
                }
            }
        });

        *worker = Some(handle);
        info!(interval_secs = self.inner.interval.as_secs(), "scheduler started");
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Queue a post. The scheduled time must not be in the past; callers that
    /// want "now" pass `Utc::now()` explicitly.
    pub async fn schedule_post(&self, post: NewScheduledPost) -> Result<ScheduledPost> {
        if post.scheduled_at < Utc::now() - chrono::Duration::minutes(1) {
            return Err(Error::External(
                "scheduled time is in the past".to_string(),
            ));
        }
        self.inner.storage.create_scheduled_post(post).await
    }

    /// One scan over the queue. Public so tests (and a future `/flush`
    /// command) can drive it without waiting for the interval.
    pub async fn tick(&self) -> Result<()> {
        let Ok(_guard) = self.inner.tick_lock.try_lock() else {
            return Ok(());
        };

        let pending = self
            .inner
            .storage
            .pending_posts(self.inner.max_attempts)
            .await?;
        let now = Utc::now();

        for post in pending {
            if post.scheduled_at > now {
                continue;
            }
            if let Err(e) = self.publish(&post).await {
                warn!(post = post.id.0, "scheduled publish failed: {e}");
                self.report_failure(&post, &e).await;
            }
        }

        Ok(())
    }

    async fn publish(&self, post: &ScheduledPost) -> Result<()> {
        let account = self
            .inner
            .storage
            .find_account(post.telegram_id)
            .await?
            .ok_or_else(|| Error::External("owner account not found".to_string()))?;
        let blob = account
            .session_blob
            .ok_or_else(|| Error::NotAuthenticated)?;
        let photo_path = post
            .photo_path
            .as_deref()
            .ok_or_else(|| Error::External("post has no photo".to_string()))?;

        // Isolated client per publish; see module docs.
        let client = self.inner.factory.make();
        let settings = self.inner.vault.open(&blob)?;
        client.load_settings(&settings).await?;

        client.photo_upload(Path::new(photo_path), &post.caption).await?;

        // The upload precedes the mark, so a storage error on `mark_posted`
        // is reported as a publish failure and re-uploads the same photo on
        // a later tick. Exactly-once holds only up to storage errors here.
        if !self.inner.storage.mark_posted(post.id).await? {
            // A concurrent scan got here first; nothing more to do.
            warn!(post = post.id.0, "post already marked as published");
            return Ok(());
        }

        info!(post = post.id.0, user = post.telegram_id.0, "scheduled post published");
        let _ = self
            .inner
            .notifier
            .notify(post.chat_id, "✅ Scheduled post published!")
            .await;
        Ok(())
    }

    async fn report_failure(&self, post: &ScheduledPost, err: &Error) {
        let attempts = match self.inner.storage.bump_attempts(post.id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(post = post.id.0, "failed to record publish attempt: {e}");
                post.attempts + 1
            }
        };

        let text = if attempts >= self.inner.max_attempts {
            format!(
                "❌ Failed to publish scheduled post after {attempts} attempts, giving up: {err}\n\
                 Please schedule it again."
            )
        } else {
            format!("❌ Failed to publish scheduled post (will retry): {err}")
        };

        if let Err(e) = self.inner.notifier.notify(post.chat_id, &text).await {
            warn!(post = post.id.0, "failure notification not delivered: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatId;
    use crate::session::testing::FakeFactory;
    use crate::session::SessionManager;
    use crate::store::memory::MemoryStorage;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeNotifier {
        sent: StdMutex<Vec<(i64, String)>>,
    }

    impl FakeNotifier {
        fn messages(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, chat_id: ChatId, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push((chat_id.0, text.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        runner: ScheduleRunner,
        storage: Arc<MemoryStorage>,
        factory: Arc<FakeFactory>,
        notifier: Arc<FakeNotifier>,
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let storage = Arc::new(MemoryStorage::default());
        let factory = Arc::new(FakeFactory::default());
        let notifier = Arc::new(FakeNotifier::default());
        let vault = Arc::new(SessionVault::new("test-passphrase"));

        // Seed a logged-in account the scheduler can draw credentials from.
        let mgr = SessionManager::new(storage.clone(), factory.clone(), vault.clone());
        mgr.login(UserId(1), "alice", "pw").await;

        let runner = ScheduleRunner::new(
            Duration::from_secs(300),
            max_attempts,
            storage.clone(),
            factory.clone(),
            vault,
            notifier.clone(),
        );
        Fixture {
            runner,
            storage,
            factory,
            notifier,
        }
    }

    fn due_post(minutes_ago: i64) -> NewScheduledPost {
        NewScheduledPost {
            telegram_id: UserId(1),
            chat_id: ChatId(10),
            caption: "scheduled caption".to_string(),
            photo_path: Some("/tmp/post.jpg".to_string()),
            scheduled_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn due_post_is_published_exactly_once() {
        let fx = fixture(10).await;
        let post = fx.storage.create_scheduled_post(due_post(5)).await.unwrap();

        fx.runner.tick().await.unwrap();
        fx.runner.tick().await.unwrap();
        fx.runner.tick().await.unwrap();

        // Client 0 is the seeding session; every publish makes a fresh client.
        assert_eq!(fx.factory.made_count(), 2);
        let uploads = fx.factory.client(1).uploads.lock().unwrap().clone();
        assert_eq!(
            uploads,
            vec![("/tmp/post.jpg".to_string(), "scheduled caption".to_string())]
        );

        assert!(fx.storage.pending_posts(10).await.unwrap().is_empty());
        let _ = post;

        let messages = fx.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 10);
        assert!(messages[0].1.contains("published"));
    }

    #[tokio::test]
    async fn overlapping_ticks_publish_exactly_once() {
        let fx = fixture(10).await;
        fx.storage.create_scheduled_post(due_post(5)).await.unwrap();

        // Concurrent scans of the same queue: the tick lock turns the
        // overlapping calls into no-ops, and `mark_posted` guards the row
        // itself should a scan slip past anyway.
        let (a, b, c) = tokio::join!(fx.runner.tick(), fx.runner.tick(), fx.runner.tick());
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let uploads: usize = (1..fx.factory.made_count())
            .map(|n| fx.factory.client(n).uploads.lock().unwrap().len())
            .sum();
        assert_eq!(uploads, 1);
        assert!(fx.storage.pending_posts(10).await.unwrap().is_empty());
        assert_eq!(fx.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn publisher_uses_a_fresh_client_with_restored_settings() {
        let fx = fixture(10).await;
        fx.storage.create_scheduled_post(due_post(1)).await.unwrap();

        fx.runner.tick().await.unwrap();

        let publish_client = fx.factory.client(1);
        let loaded = publish_client.loaded_settings.lock().unwrap().clone();
        assert!(loaded.unwrap().contains("sessionid"));
        // The interactive client did no uploading.
        assert!(fx.factory.client(0).uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_post_is_not_published_early() {
        let fx = fixture(10).await;
        fx.storage
            .create_scheduled_post(NewScheduledPost {
                scheduled_at: Utc::now() + ChronoDuration::hours(1),
                ..due_post(0)
            })
            .await
            .unwrap();

        fx.runner.tick().await.unwrap();

        assert_eq!(fx.factory.made_count(), 1); // no publish client was built
        assert_eq!(fx.storage.pending_posts(10).await.unwrap().len(), 1);
        assert!(fx.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn one_tick_publishes_only_the_due_post() {
        let fx = fixture(10).await;
        fx.storage.create_scheduled_post(due_post(5)).await.unwrap();
        let future = fx
            .storage
            .create_scheduled_post(NewScheduledPost {
                scheduled_at: Utc::now() + ChronoDuration::hours(2),
                ..due_post(0)
            })
            .await
            .unwrap();

        fx.runner.tick().await.unwrap();

        let remaining = fx.storage.pending_posts(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, future.id);
        assert!(!remaining[0].posted);
    }

    #[tokio::test]
    async fn failure_leaves_post_pending_and_notifies() {
        let fx = fixture(10).await;
        fx.storage.create_scheduled_post(due_post(1)).await.unwrap();

        // Dropping the stored blob makes the publish attempt fail.
        fx.storage.clear_session(UserId(1)).await.unwrap();

        fx.runner.tick().await.unwrap();

        let pending = fx.storage.pending_posts(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);

        let messages = fx.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("will retry"));
    }

    #[tokio::test]
    async fn attempt_cap_dead_letters_the_post() {
        let fx = fixture(2).await;
        fx.storage.create_scheduled_post(due_post(1)).await.unwrap();
        fx.storage.clear_session(UserId(1)).await.unwrap();

        fx.runner.tick().await.unwrap();
        fx.runner.tick().await.unwrap();
        // Attempts exhausted: the row is no longer scanned.
        fx.runner.tick().await.unwrap();

        assert!(fx.storage.pending_posts(2).await.unwrap().is_empty());
        let messages = fx.notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].1.contains("will retry"));
        assert!(messages[1].1.contains("giving up"));
    }

    #[tokio::test]
    async fn schedule_post_rejects_past_times() {
        let fx = fixture(10).await;
        let err = fx
            .runner
            .schedule_post(NewScheduledPost {
                scheduled_at: Utc::now() - ChronoDuration::hours(1),
                ..due_post(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::External(_)));

        fx.runner
            .schedule_post(NewScheduledPost {
                scheduled_at: Utc::now() + ChronoDuration::minutes(5),
                ..due_post(0)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_do_not_hang() {
        let fx = fixture(10).await;
        fx.runner.start().await;
        fx.runner.start().await; // idempotent
        fx.runner.stop().await;
    }
}
