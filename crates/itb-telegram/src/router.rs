use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use itb_assistant::AssistantClient;
use itb_core::{
    config::Config,
    instagram::port::ClientFactory,
    messaging::Notifier,
    scheduler::ScheduleRunner,
    session::SessionManager,
    store::Storage,
    vault::SessionVault,
};
use tracing::{info, warn};

use crate::handlers;
use crate::TelegramNotifier;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub scheduler: ScheduleRunner,
    pub assistant: Option<Arc<AssistantClient>>,
}

/// Wire the bot, the session manager and the background scheduler, then run
/// long polling until the process is stopped.
pub async fn run_polling(
    cfg: Arc<Config>,
    storage: Arc<dyn Storage>,
    factory: Arc<dyn ClientFactory>,
    vault: Arc<SessionVault>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    if let Ok(me) = bot.get_me().await {
        info!("itb started: @{}", me.username());
    }

    tokio::fs::create_dir_all(&cfg.temp_dir).await?;

    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone()));
    let sessions = Arc::new(SessionManager::new(
        storage.clone(),
        factory.clone(),
        vault.clone(),
    ));
    let scheduler = ScheduleRunner::new(
        cfg.scheduler_interval,
        cfg.max_publish_attempts,
        storage,
        factory,
        vault,
        notifier,
    );
    scheduler.start().await;

    let assistant = match cfg.assistant_api_key.as_deref() {
        Some(key) => Some(Arc::new(AssistantClient::new(
            cfg.assistant_api_url.clone(),
            key.to_string(),
            cfg.assistant_model.clone(),
        ))),
        None => {
            warn!("no assistant api key configured; free-text fallback disabled");
            None
        }
    };

    let state = Arc::new(AppState {
        cfg,
        sessions,
        scheduler: scheduler.clone(),
        assistant,
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    scheduler.stop().await;
    Ok(())
}
