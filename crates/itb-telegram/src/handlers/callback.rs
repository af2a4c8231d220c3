use std::sync::Arc;

use teloxide::prelude::*;

use itb_core::{domain::UserId, session::ConversationState};

use crate::router::AppState;

use super::commands::{do_logout, stats_text, HELP_TEXT, LOGIN_HINT, NOT_LOGGED_IN};

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone()).await?;

    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let chat = message.chat.id;
    let user = UserId(q.from.id.0 as i64);
    let data = q.data.as_deref().unwrap_or("");

    match data {
        "login" => {
            bot.send_message(chat, LOGIN_HINT).await?;
        }
        "logout" => {
            let reply = do_logout(&state.sessions, user).await;
            bot.send_message(chat, reply).await?;
        }
        "get_stats" => {
            let reply = stats_text(&state, user).await;
            bot.send_message(chat, reply).await?;
        }
        "post_photo" => {
            let handle = state.sessions.resolve(user).await;
            let reply = if handle.is_authenticated().await {
                "Send me the photo to publish:"
            } else {
                NOT_LOGGED_IN
            };
            bot.send_message(chat, reply).await?;
        }
        "post_story" => {
            let handle = state.sessions.resolve(user).await;
            if handle.is_authenticated().await {
                handle
                    .set_conversation(ConversationState::AwaitingStoryPhoto)
                    .await;
                bot.send_message(chat, "Send me the photo for your story:")
                    .await?;
            } else {
                bot.send_message(chat, NOT_LOGGED_IN).await?;
            }
        }
        "help" => {
            bot.send_message(chat, HELP_TEXT).await?;
        }
        _ => {}
    }

    Ok(())
}
