use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
};

use itb_core::{
    domain::{ChatId, UserId},
    instagram::types::{AccountStats, PostStats},
    session::{ConversationState, LoginOutcome, SessionManager},
    store::NewScheduledPost,
};

use crate::router::AppState;

pub(super) const LOGIN_HINT: &str =
    "To log in, send: /login user:<username> password:<password>";

pub(super) const NOT_LOGGED_IN: &str =
    "Log in to Instagram first (/start -> Log in, or /login).";

pub(super) const HELP_TEXT: &str = "Available commands:\n\
    /start - open the menu\n\
    /help - this message\n\
    /login user:<username> password:<password> - log in to Instagram\n\
    /logout - log out of Instagram\n\
    /stats - account statistics\n\
    /last - statistics of your latest post\n\
    /schedule YYYY-MM-DD HH:MM <caption> - queue the photo you just sent";

pub(super) fn menu_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([
        [InlineKeyboardButton::callback("Log in to Instagram", "login")],
        [InlineKeyboardButton::callback("Log out of Instagram", "logout")],
        [InlineKeyboardButton::callback("Get statistics", "get_stats")],
        [InlineKeyboardButton::callback("Post a photo", "post_photo")],
        [InlineKeyboardButton::callback("Post a story", "post_story")],
        [InlineKeyboardButton::callback("Help", "help")],
    ])
}

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// Parses `user:<username> password:<password>` login arguments.
fn parse_login_args(rest: &str) -> Option<(String, String)> {
    let mut parts = rest.split_whitespace();
    let user = parts.next()?.strip_prefix("user:")?.trim();
    let pass = parts.next()?.strip_prefix("password:")?.trim();
    if user.is_empty() || pass.is_empty() {
        return None;
    }
    Some((user.to_string(), pass.to_string()))
}

/// Parses `YYYY-MM-DD HH:MM <caption>`; the timestamp is taken as UTC.
fn parse_schedule_args(rest: &str) -> Option<(DateTime<Utc>, String)> {
    let mut parts = rest.splitn(3, char::is_whitespace);
    let date = parts.next()?;
    let time = parts.next()?;
    let caption = parts.next().unwrap_or("").trim().to_string();

    let naive = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").ok()?;
    Some((naive.and_utc(), caption))
}

pub(super) fn format_account_stats(stats: &AccountStats) -> String {
    format!(
        "📊 Your statistics:\nFollowers: {}\nFollowing: {}\nPosts: {}\nTotal likes: {}",
        stats.followers, stats.following, stats.media_count, stats.total_likes
    )
}

pub(super) fn format_post_stats(stats: &PostStats) -> String {
    format!(
        "📈 Latest post:\nLikes: {}\nComments: {}\nViews: {}",
        stats.likes, stats.comments, stats.views
    )
}

pub(super) fn login_outcome_text(outcome: LoginOutcome) -> &'static str {
    match outcome {
        LoginOutcome::Success => "✅ Logged in!",
        LoginOutcome::InvalidCredentials => "❌ Wrong username or password. Please try again.",
        LoginOutcome::TwoFactorRequired => {
            "🔐 Two-factor authentication is enabled. Send me the code from your app."
        }
        LoginOutcome::ChallengeRequired => {
            "⛔ Instagram requires an identity check that I cannot complete. \
             Confirm the login in the Instagram app, then try again."
        }
        LoginOutcome::Failed => "❌ Could not log in. Check your details and try again.",
    }
}

pub(super) async fn do_logout(sessions: &SessionManager, user: UserId) -> &'static str {
    if sessions.logout(user).await {
        "✅ Logged out of Instagram."
    } else {
        "You are not logged in."
    }
}

pub(super) async fn stats_text(state: &AppState, user: UserId) -> String {
    let handle = state.sessions.resolve(user).await;
    if !handle.is_authenticated().await {
        return NOT_LOGGED_IN.to_string();
    }
    match state.sessions.account_stats(user).await {
        Some(stats) => format_account_stats(&stats),
        None => "Could not fetch statistics. Try again later.".to_string(),
    }
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let user = UserId(from.id.0 as i64);
    let chat = msg.chat.id;
    let (cmd, rest) = parse_command(msg.text().unwrap_or(""));

    match cmd.as_str() {
        "start" => {
            // Restores a persisted Instagram session on first contact.
            let _ = state.sessions.resolve(user).await;
            bot.send_message(
                chat,
                "Hi! I manage your Instagram account. What would you like to do?",
            )
            .reply_markup(menu_keyboard())
            .await?;
        }
        "help" => {
            bot.send_message(chat, HELP_TEXT).await?;
        }
        "login" => {
            let Some((username, password)) = parse_login_args(&rest) else {
                bot.send_message(chat, LOGIN_HINT).await?;
                return Ok(());
            };
            let outcome = state.sessions.login(user, &username, &password).await;
            bot.send_message(chat, login_outcome_text(outcome)).await?;
        }
        "logout" => {
            let reply = do_logout(&state.sessions, user).await;
            bot.send_message(chat, reply).await?;
        }
        "stats" => {
            let reply = stats_text(&state, user).await;
            bot.send_message(chat, reply).await?;
        }
        "last" => {
            let handle = state.sessions.resolve(user).await;
            if !handle.is_authenticated().await {
                bot.send_message(chat, NOT_LOGGED_IN).await?;
                return Ok(());
            }
            let reply = match state.sessions.last_post_stats(user).await {
                Some(stats) => format_post_stats(&stats),
                None => "Could not fetch post statistics. Try again later.".to_string(),
            };
            bot.send_message(chat, reply).await?;
        }
        "schedule" => {
            handle_schedule(&bot, chat, user, &rest, &state).await?;
        }
        _ => {
            bot.send_message(chat, "Unknown command. Use /help for the list.")
                .await?;
        }
    }

    Ok(())
}

async fn handle_schedule(
    bot: &Bot,
    chat: teloxide::types::ChatId,
    user: UserId,
    rest: &str,
    state: &AppState,
) -> ResponseResult<()> {
    let handle = state.sessions.resolve(user).await;

    let ConversationState::AwaitingCaption { photo_path } = handle.conversation().await else {
        bot.send_message(
            chat,
            "Send me the photo first, then /schedule YYYY-MM-DD HH:MM <caption>.",
        )
        .await?;
        return Ok(());
    };

    let Some((scheduled_at, caption)) = parse_schedule_args(rest) else {
        bot.send_message(chat, "Format: /schedule YYYY-MM-DD HH:MM <caption> (UTC).")
            .await?;
        return Ok(());
    };

    let queued = state
        .scheduler
        .schedule_post(NewScheduledPost {
            telegram_id: user,
            chat_id: ChatId(chat.0),
            caption,
            photo_path: Some(photo_path.to_string_lossy().to_string()),
            scheduled_at,
        })
        .await;

    match queued {
        Ok(post) => {
            handle.set_conversation(ConversationState::Idle).await;
            bot.send_message(
                chat,
                format!(
                    "🗓 Scheduled for {} UTC.",
                    post.scheduled_at.format("%Y-%m-%d %H:%M")
                ),
            )
            .await?;
        }
        Err(e) => {
            bot.send_message(chat, format!("❌ Could not schedule: {e}"))
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing_strips_bot_mention() {
        assert_eq!(
            parse_command("/login@my_bot user:a password:b"),
            ("login".to_string(), "user:a password:b".to_string())
        );
        assert_eq!(parse_command("/start"), ("start".to_string(), String::new()));
    }

    #[test]
    fn login_args_require_both_parts() {
        assert_eq!(
            parse_login_args("user:alice password:s3cret"),
            Some(("alice".to_string(), "s3cret".to_string()))
        );
        assert_eq!(parse_login_args("user:alice"), None);
        assert_eq!(parse_login_args("alice s3cret"), None);
        assert_eq!(parse_login_args("user: password:x"), None);
    }

    #[test]
    fn schedule_args_parse_utc_timestamp() {
        let (at, caption) = parse_schedule_args("2026-09-01 18:30 summer recap").unwrap();
        assert_eq!(at.format("%Y-%m-%d %H:%M").to_string(), "2026-09-01 18:30");
        assert_eq!(caption, "summer recap");

        let (_, empty) = parse_schedule_args("2026-09-01 18:30").unwrap();
        assert_eq!(empty, "");

        assert!(parse_schedule_args("tomorrow noon hi").is_none());
    }
}
