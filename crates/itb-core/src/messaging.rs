use async_trait::async_trait;

use crate::{domain::ChatId, Result};

/// Outbound notification port.
///
/// Telegram is the only implementation today; the schedule runner uses this to
/// report publish outcomes without depending on the transport crate.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<()>;
}
