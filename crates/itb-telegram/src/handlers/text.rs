use std::path::Path;
use std::sync::Arc;

use teloxide::prelude::*;

use itb_core::{domain::UserId, session::ConversationState, Error};
use tracing::warn;

use crate::router::AppState;

use super::commands::NOT_LOGGED_IN;

pub async fn handle_text(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let user = UserId(from.id.0 as i64);
    let chat = msg.chat.id;
    let text = msg.text().unwrap_or("").trim();

    let handle = state.sessions.resolve(user).await;
    match handle.conversation().await {
        ConversationState::AwaitingTwoFactorCode => {
            let reply = if state.sessions.complete_two_factor(user, text).await {
                "✅ Logged in with 2FA!"
            } else {
                "❌ Wrong 2FA code. Start over with /login."
            };
            bot.send_message(chat, reply).await?;
        }
        ConversationState::AwaitingCaption { photo_path } => {
            publish_with_caption(&bot, chat, user, &photo_path, text, &state).await?;
            handle.set_conversation(ConversationState::Idle).await;
        }
        ConversationState::AwaitingStoryPhoto => {
            bot.send_message(chat, "I am waiting for a story photo. Send one, or /start to cancel.")
                .await?;
        }
        ConversationState::Idle => {
            let reply = match &state.assistant {
                Some(assistant) => match assistant.reply(text).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!("assistant request failed: {e}");
                        "❌ Could not process your request. Please try again.".to_string()
                    }
                },
                None => "I did not recognize that. Use /start for the menu.".to_string(),
            };
            bot.send_message(chat, reply).await?;
        }
    }

    Ok(())
}

async fn publish_with_caption(
    bot: &Bot,
    chat: teloxide::types::ChatId,
    user: UserId,
    photo_path: &Path,
    caption: &str,
    state: &AppState,
) -> ResponseResult<()> {
    let result = state.sessions.publish_photo(user, photo_path, caption).await;

    // The downloaded photo is single-use either way.
    if let Err(e) = tokio::fs::remove_file(photo_path).await {
        warn!("failed to remove temp photo {}: {e}", photo_path.display());
    }

    let reply = match result {
        Ok(()) => "✅ Photo published!".to_string(),
        Err(Error::NotAuthenticated) => NOT_LOGGED_IN.to_string(),
        Err(e) => format!("❌ Failed to publish: {e}"),
    };
    bot.send_message(chat, reply).await?;
    Ok(())
}
