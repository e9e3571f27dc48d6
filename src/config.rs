use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ulid::Ulid;

/// Process configuration, read once at startup and handed to each collaborator.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Bearer token for `/api/admin`. Unset locks the admin API.
    pub admin_token: Option<String>,
    /// Property group definitions (JSON).
    pub groups_file: PathBuf,
    pub sync_interval: Duration,
    pub fetch_timeout: Duration,
    /// Worker count of the deployment. The sync loop only runs when this is 1.
    pub web_concurrency: u32,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub default_currency: String,
    /// Units hidden from public listings.
    pub ignore_public_unit_ids: Vec<Ulid>,
    pub mail: MailConfig,
    pub stripe: StripeConfig,
}

#[derive(Debug, Clone, Default)]
pub struct MailConfig {
    pub resend_api_key: Option<String>,
    pub from: String,
    /// Admin alert recipient. Unset skips admin alerts.
    pub alert_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StripeConfig {
    pub secret_key: Option<String>,
    pub publishable_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            bind: var("ROOMSYNC_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(var("ROOMSYNC_PORT"), "ROOMSYNC_PORT", 8080),
            data_dir: var("ROOMSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            admin_token: var("ROOMSYNC_ADMIN_TOKEN"),
            groups_file: var("ROOMSYNC_GROUPS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./unit_meta.json")),
            sync_interval: Duration::from_secs(parse_or(
                var("ROOMSYNC_SYNC_INTERVAL_SECS"),
                "ROOMSYNC_SYNC_INTERVAL_SECS",
                600,
            )),
            fetch_timeout: Duration::from_secs(parse_or(
                var("ROOMSYNC_FETCH_TIMEOUT_SECS"),
                "ROOMSYNC_FETCH_TIMEOUT_SECS",
                15,
            )),
            web_concurrency: parse_or(var("WEB_CONCURRENCY"), "WEB_CONCURRENCY", 1),
            metrics_port: var("ROOMSYNC_METRICS_PORT").and_then(|p| {
                p.parse()
                    .inspect_err(|_| tracing::warn!("ROOMSYNC_METRICS_PORT '{p}' is not a port, metrics disabled"))
                    .ok()
            }),
            compact_threshold: parse_or(var("ROOMSYNC_COMPACT_THRESHOLD"), "ROOMSYNC_COMPACT_THRESHOLD", 1000),
            default_currency: var("ROOMSYNC_DEFAULT_CURRENCY")
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_else(|| crate::engine::DEFAULT_CURRENCY.into()),
            ignore_public_unit_ids: var("IGNORE_PUBLIC_UNIT_IDS")
                .map(|raw| parse_id_list(&raw))
                .unwrap_or_default(),
            mail: MailConfig {
                resend_api_key: var("RESEND_API_KEY"),
                from: var("EMAIL_FROM").unwrap_or_else(|| "RoomSync <noreply@roomsync.local>".into()),
                alert_to: var("ALERT_TO"),
            },
            stripe: StripeConfig {
                secret_key: var("STRIPE_SECRET_KEY"),
                publishable_key: var("STRIPE_PUBLISHABLE_KEY"),
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomsync.wal")
    }

    /// The background sync loop may only run in a single-worker deployment.
    pub fn is_single_worker(&self) -> bool {
        self.web_concurrency == 1
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("{key}: invalid value '{raw}', using {default}");
            default
        }),
    }
}

fn parse_id_list(raw: &str) -> Vec<Ulid> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match Ulid::from_string(s) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!("IGNORE_PUBLIC_UNIT_IDS: skipping invalid id '{s}'");
                None
            }
        })
        .collect()
}
