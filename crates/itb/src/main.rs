use std::sync::Arc;

use itb_core::{
    config::Config,
    instagram::port::ClientFactory,
    store::{SqliteStorage, Storage},
    vault::SessionVault,
};
use itb_instagram::InstagramHttpFactory;

#[tokio::main]
async fn main() -> Result<(), itb_core::Error> {
    itb_core::logging::init("itb");

    let cfg = Arc::new(Config::load()?);

    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect(&cfg.database_path).await?);
    let factory: Arc<dyn ClientFactory> =
        Arc::new(InstagramHttpFactory::new(cfg.http_proxy.clone()));
    let vault = Arc::new(SessionVault::new(cfg.vault_passphrase.clone()));

    itb_telegram::router::run_polling(cfg, storage, factory, vault)
        .await
        .map_err(|e| itb_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
