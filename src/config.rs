//! Configuration loading from environment variables and `.env` files.

use std::{env, path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// TCP port for the combined HTTP/WebSocket listener.
    pub port: u16,
    /// Directory holding `relay.db`.
    pub data_dir: PathBuf,
    /// Restrict EVENT acceptance to the owner pubkey.
    pub owner_only: bool,
    /// Owner public key (hex); required when `owner_only` is set.
    pub owner_pubkey: Option<String>,
    /// Relay name advertised in the NIP-11 document.
    pub name: String,
    pub description: String,
    pub contact: String,
    /// Public WebSocket URL, checked against the NIP-42 `relay` tag when set.
    pub relay_url: Option<String>,
    /// Minimum NIP-13 difficulty in leading zero bits; 0 disables the check.
    pub min_pow: u32,
    /// Reject events older than this many seconds.
    pub created_at_past_limit: i64,
    /// Reject events more than this many seconds in the future.
    pub created_at_future_limit: i64,
    /// Per-session inbound frames allowed per minute; 0 disables rate limiting.
    pub max_frames_per_minute: u32,
}

impl Settings {
    /// Load settings, reading `path` as a dotenv file when it exists.
    pub fn from_env(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            dotenvy::from_filename(path).context("reading env file")?;
        }
        let owner_only = env_bool("RELAY_OWNER_ONLY")?;
        let owner_pubkey = env::var("NOSTR_OWNER_PUBKEY").ok().filter(|s| !s.is_empty());
        if owner_only {
            match &owner_pubkey {
                None => bail!("RELAY_OWNER_ONLY=true requires NOSTR_OWNER_PUBKEY"),
                Some(pk) if pk.len() != 64 || !pk.chars().all(|c| c.is_ascii_hexdigit()) => {
                    bail!("NOSTR_OWNER_PUBKEY must be 64 hex chars")
                }
                Some(_) => {}
            }
        }
        Ok(Settings {
            port: env_parse("RELAY_PORT", 8080)?,
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".into())),
            owner_only,
            owner_pubkey: owner_pubkey.map(|pk| pk.to_lowercase()),
            name: env::var("RELAY_NAME").unwrap_or_else(|_| "homestr".into()),
            description: env::var("RELAY_DESCRIPTION")
                .unwrap_or_else(|_| "Personal Nostr relay".into()),
            contact: env::var("RELAY_CONTACT").unwrap_or_default(),
            relay_url: env::var("RELAY_URL").ok().filter(|s| !s.is_empty()),
            min_pow: env_parse("RELAY_MIN_POW", 0)?,
            created_at_past_limit: env_parse("RELAY_CREATED_AT_PAST_LIMIT_SECONDS", 2_592_000)?,
            created_at_future_limit: env_parse("RELAY_CREATED_AT_FUTURE_LIMIT_SECONDS", 600)?,
            max_frames_per_minute: env_parse("RELAY_MAX_FRAMES_PER_MINUTE", 0)?,
        })
    }
}

/// Parse an optional env var, falling back to `default` when unset or empty.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(s) if !s.is_empty() => s.parse().with_context(|| format!("parsing {key}")),
        _ => Ok(default),
    }
}

fn env_bool(key: &str) -> Result<bool> {
    match env::var(key) {
        Ok(s) if !s.is_empty() => match s.to_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => bail!("{key} must be true or false, got {other:?}"),
        },
        _ => Ok(false),
    }
}

/// Serializes tests that mutate process environment variables.
#[cfg(test)]
pub(crate) static ENV_TEST_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
