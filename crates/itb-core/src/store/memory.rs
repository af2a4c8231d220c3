//! In-memory storage, used by tests across the workspace.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    domain::{PostId, UserId},
    store::{NewScheduledPost, ScheduledPost, Storage, UserAccount},
    Result,
};

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<i64, UserAccount>,
    posts: Vec<ScheduledPost>,
    next_post_id: i64,
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find_account(&self, telegram_id: UserId) -> Result<Option<UserAccount>> {
        Ok(self.inner.lock().unwrap().accounts.get(&telegram_id.0).cloned())
    }

    async fn upsert_account(&self, account: &UserAccount) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .insert(account.telegram_id.0, account.clone());
        Ok(())
    }

    async fn clear_session(&self, telegram_id: UserId) -> Result<()> {
        if let Some(acc) = self.inner.lock().unwrap().accounts.get_mut(&telegram_id.0) {
            acc.session_blob = None;
            acc.two_factor_enabled = false;
        }
        Ok(())
    }

    async fn create_scheduled_post(&self, post: NewScheduledPost) -> Result<ScheduledPost> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_post_id += 1;
        let created = ScheduledPost {
            id: PostId(inner.next_post_id),
            telegram_id: post.telegram_id,
            chat_id: post.chat_id,
            caption: post.caption,
            photo_path: post.photo_path,
            scheduled_at: post.scheduled_at,
            posted: false,
            attempts: 0,
        };
        inner.posts.push(created.clone());
        Ok(created)
    }

    async fn pending_posts(&self, max_attempts: u32) -> Result<Vec<ScheduledPost>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .posts
            .iter()
            .filter(|p| !p.posted && p.attempts < max_attempts)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.scheduled_at);
        Ok(out)
    }

    async fn mark_posted(&self, id: PostId) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.posts.iter_mut().find(|p| p.id == id && !p.posted) {
            Some(p) => {
                p.posted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bump_attempts(&self, id: PostId) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        match inner.posts.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.attempts += 1;
                Ok(p.attempts)
            }
            None => Ok(0),
        }
    }
}
