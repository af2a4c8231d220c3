use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use teloxide::{net::Download, prelude::*};

use itb_core::{domain::UserId, session::ConversationState, Error};
use tracing::warn;

use crate::router::AppState;

use super::commands::NOT_LOGGED_IN;

static PHOTO_COUNTER: AtomicUsize = AtomicUsize::new(1);

async fn download_photo(
    bot: &Bot,
    state: &AppState,
    photos: &[teloxide::types::PhotoSize],
) -> anyhow::Result<PathBuf> {
    // Telegram sends several sizes; the last is the largest.
    let best = photos
        .last()
        .ok_or_else(|| anyhow::anyhow!("no photo sizes"))?;
    let file = bot.get_file(best.file.id.clone()).await?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = PHOTO_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = state.cfg.temp_dir.join(format!("photo_{ts}_{n}.jpg"));

    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;

    Ok(path)
}

pub async fn handle_photo(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let Some(photos) = msg.photo() else {
        return Ok(());
    };
    let user = UserId(from.id.0 as i64);
    let chat = msg.chat.id;

    let handle = state.sessions.resolve(user).await;
    if !handle.is_authenticated().await {
        bot.send_message(chat, NOT_LOGGED_IN).await?;
        return Ok(());
    }

    let path = match download_photo(&bot, &state, photos).await {
        Ok(p) => p,
        Err(e) => {
            warn!("photo download failed: {e}");
            bot.send_message(chat, "❌ Could not download the photo. Try again.")
                .await?;
            return Ok(());
        }
    };

    match handle.conversation().await {
        ConversationState::AwaitingStoryPhoto => {
            bot.send_message(chat, "Publishing your story...").await?;

            let result = state.sessions.publish_story(user, &path).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("failed to remove temp photo {}: {e}", path.display());
            }
            let reply = match result {
                Ok(()) => "✅ Story published!".to_string(),
                Err(Error::NotAuthenticated) => NOT_LOGGED_IN.to_string(),
                Err(e) => format!("❌ Failed to publish the story: {e}"),
            };
            bot.send_message(chat, reply).await?;
            handle.set_conversation(ConversationState::Idle).await;
        }
        prior => {
            // A new photo replaces an earlier one still waiting for a caption.
            if let ConversationState::AwaitingCaption { photo_path } = prior {
                if let Err(e) = tokio::fs::remove_file(&photo_path).await {
                    warn!("failed to remove temp photo {}: {e}", photo_path.display());
                }
            }
            handle
                .set_conversation(ConversationState::AwaitingCaption { photo_path: path })
                .await;
            bot.send_message(
                chat,
                "Send a caption to publish now, or queue it with /schedule YYYY-MM-DD HH:MM <caption>.",
            )
            .await?;
        }
    }

    Ok(())
}
