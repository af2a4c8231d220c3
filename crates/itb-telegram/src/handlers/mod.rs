//! Telegram update handlers.
//!
//! Each handler resolves the sender's session handle and routes the update
//! through the per-user conversation state machine: commands and menu
//! buttons set the state, photos and free text advance it.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use crate::router::AppState;

mod callback;
mod commands;
mod photo;
mod text;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }
        return text::handle_text(bot, msg, state).await;
    }

    if msg.photo().is_some() {
        return photo::handle_photo(bot, msg, state).await;
    }

    let _ = bot
        .send_message(
            msg.chat.id,
            "I can work with text and photos. Use /start for the menu.",
        )
        .await;

    Ok(())
}
