use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, Result};

/// Typed configuration, loaded from the environment (with `.env` support).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub database_path: String,

    /// Passphrase for the at-rest encryption of Instagram session blobs.
    pub vault_passphrase: String,

    // Scheduler
    pub scheduler_interval: Duration,
    pub max_publish_attempts: u32,

    // Instagram client
    pub http_proxy: Option<String>,

    // Assistant fallback (optional)
    pub assistant_api_key: Option<String>,
    pub assistant_api_url: String,
    pub assistant_model: String,

    // Runtime
    pub temp_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let vault_passphrase = env_str("SESSION_VAULT_KEY").unwrap_or_default();
        if vault_passphrase.trim().is_empty() {
            return Err(Error::Config(
                "SESSION_VAULT_KEY environment variable is required".to_string(),
            ));
        }

        let database_path = env_str("DATABASE_PATH").unwrap_or_else(|| "itb.db".to_string());

        let scheduler_interval =
            Duration::from_secs(env_u64("SCHEDULER_INTERVAL_SECS").unwrap_or(300));
        let max_publish_attempts = env_u32("MAX_PUBLISH_ATTEMPTS").unwrap_or(10).max(1);

        // Same convention as the usual CLI tooling: lowercase proxy var wins.
        let http_proxy = env_str("http_proxy")
            .or_else(|| env_str("HTTP_PROXY"))
            .and_then(non_empty);

        let assistant_api_key = env_str("ASSISTANT_API_KEY").and_then(non_empty);
        let assistant_api_url = env_str("ASSISTANT_API_URL")
            .unwrap_or_else(|| "https://openrouter.ai/api/v1/chat/completions".to_string());
        let assistant_model =
            env_str("ASSISTANT_MODEL").unwrap_or_else(|| "deepseek/deepseek-r1:free".to_string());

        let temp_dir = PathBuf::from(env_str("TEMP_DIR").unwrap_or("/tmp/itb".to_string()));
        fs::create_dir_all(&temp_dir)?;

        Ok(Self {
            telegram_bot_token,
            database_path,
            vault_passphrase,
            scheduler_interval,
            max_publish_attempts,
            http_proxy,
            assistant_api_key,
            assistant_api_url,
            assistant_model,
            temp_dir,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}
