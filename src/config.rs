use crate::normalize::TargetZone;
use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use dotenvy::dotenv;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "BRIDGE_";
const SETUP_CONFIG_PATH_VAR: &str = "BRIDGE_SETUP_CONFIG_PATH";

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic: String,
    pub mqtt_qos: u8,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub mqtt_reconnect_base_ms: u64,
    pub mqtt_reconnect_max_ms: u64,
    /// Consecutive failed connects before first contact that count as a
    /// startup failure. 0 retries forever.
    pub mqtt_max_connect_failures: u32,
    pub database_url: String,
    pub db_pool_size: u32,
    pub collection: String,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub store_max_attempts: u32,
    pub store_retry_base_ms: u64,
    pub store_retry_max_ms: u64,
    pub drain_timeout_ms: u64,
    pub timezone: TargetZone,
    pub dead_letter_path: PathBuf,
    pub status_log_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

/// Env first, then values from the optional JSON setup file.
struct Lookup<F> {
    env: F,
    setup: HashMap<String, String>,
}

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.env)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| self.setup.get(key).cloned())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|err| anyhow!("invalid {key}={raw:?}: {err}")),
            None => Ok(default),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup = match env::var(SETUP_CONFIG_PATH_VAR) {
            Ok(path) if !path.trim().is_empty() => load_setup_config(Path::new(path.trim()))?,
            _ => HashMap::new(),
        };
        Self::from_lookup(|key| env::var(key).ok(), setup)
    }

    fn from_lookup<F>(env: F, setup: HashMap<String, String>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = Lookup { env, setup };

        let database_url = lookup
            .get("BRIDGE_DATABASE_URL")
            .or_else(|| lookup.get("DATABASE_URL"))
            .context("BRIDGE_DATABASE_URL or DATABASE_URL is required (or database_url in the setup config)")?;

        let mqtt_qos = lookup.parse("BRIDGE_MQTT_QOS", 1u8)?;
        if mqtt_qos > 2 {
            bail!("invalid BRIDGE_MQTT_QOS={mqtt_qos}: expected 0, 1 or 2");
        }
        let queue_capacity = lookup.parse("BRIDGE_QUEUE_CAPACITY", 256usize)?;
        if queue_capacity == 0 {
            bail!("BRIDGE_QUEUE_CAPACITY must be at least 1");
        }
        let store_max_attempts = lookup.parse("BRIDGE_STORE_MAX_ATTEMPTS", 5u32)?;
        if store_max_attempts == 0 {
            bail!("BRIDGE_STORE_MAX_ATTEMPTS must be at least 1");
        }
        let timezone = lookup.parse("BRIDGE_TIMEZONE", TargetZone::Named(Tz::Asia__Kuala_Lumpur))?;

        Ok(Self {
            mqtt_host: lookup.string("BRIDGE_MQTT_HOST", "127.0.0.1"),
            mqtt_port: lookup.parse("BRIDGE_MQTT_PORT", 1883u16)?,
            mqtt_username: lookup.get("BRIDGE_MQTT_USERNAME"),
            mqtt_password: lookup.get("BRIDGE_MQTT_PASSWORD"),
            mqtt_topic: lookup.string("BRIDGE_MQTT_TOPIC", "dry-rack"),
            mqtt_qos,
            mqtt_keepalive_secs: lookup.parse("BRIDGE_MQTT_KEEPALIVE_SECS", 60u64)?,
            mqtt_client_id: lookup.string(
                "BRIDGE_MQTT_CLIENT_ID",
                &format!("sensor-bridge-{}", std::process::id()),
            ),
            mqtt_reconnect_base_ms: lookup.parse("BRIDGE_MQTT_RECONNECT_BASE_MS", 500u64)?,
            mqtt_reconnect_max_ms: lookup.parse("BRIDGE_MQTT_RECONNECT_MAX_MS", 30_000u64)?,
            mqtt_max_connect_failures: lookup.parse("BRIDGE_MQTT_MAX_CONNECT_FAILURES", 0u32)?,
            database_url,
            db_pool_size: lookup.parse("BRIDGE_DB_POOL_SIZE", 5u32)?,
            collection: lookup.string("BRIDGE_COLLECTION", "sensors_data"),
            queue_capacity,
            enqueue_timeout_ms: lookup.parse("BRIDGE_ENQUEUE_TIMEOUT_MS", 2_000u64)?,
            store_timeout_ms: lookup.parse("BRIDGE_STORE_TIMEOUT_MS", 5_000u64)?,
            store_max_attempts,
            store_retry_base_ms: lookup.parse("BRIDGE_STORE_RETRY_BASE_MS", 200u64)?,
            store_retry_max_ms: lookup.parse("BRIDGE_STORE_RETRY_MAX_MS", 5_000u64)?,
            drain_timeout_ms: lookup.parse("BRIDGE_DRAIN_TIMEOUT_MS", 10_000u64)?,
            timezone,
            dead_letter_path: PathBuf::from(
                lookup.string("BRIDGE_DEAD_LETTER_PATH", "dead-letter.jsonl"),
            ),
            status_log_interval_ms: lookup.parse("BRIDGE_STATUS_LOG_INTERVAL_MS", 30_000u64)?,
            otlp_endpoint: lookup.get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn mqtt_reconnect_base(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_base_ms)
    }

    pub fn mqtt_reconnect_max(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_max_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn store_retry_base(&self) -> Duration {
        Duration::from_millis(self.store_retry_base_ms)
    }

    pub fn store_retry_max(&self) -> Duration {
        Duration::from_millis(self.store_retry_max_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_millis(self.status_log_interval_ms.max(1))
    }
}

/// Reads a flat JSON object such as `{"mqtt_host": "10.0.0.5", "queue_capacity": 512}`.
/// Keys map onto the env names (`mqtt_host` -> `BRIDGE_MQTT_HOST`); `database_url`
/// also maps to `BRIDGE_DATABASE_URL`.
fn load_setup_config(path: &Path) -> Result<HashMap<String, String>> {
    let mut bytes = std::fs::read(path)
        .with_context(|| format!("failed to read setup config {}", path.display()))?;
    let value: Value = simd_json::serde::from_slice(&mut bytes)
        .with_context(|| format!("failed to parse setup config {}", path.display()))?;
    setup_pairs(value).with_context(|| format!("invalid setup config {}", path.display()))
}

fn setup_pairs(value: Value) -> Result<HashMap<String, String>> {
    let Value::Object(entries) = value else {
        bail!("setup config must be a JSON object");
    };
    let mut pairs = HashMap::new();
    for (key, value) in entries {
        let rendered = match value {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Null => continue,
            other => {
                tracing::warn!(key = %key, value = %other, "ignoring non-scalar setup config value");
                continue;
            }
        };
        if rendered.is_empty() {
            continue;
        }
        pairs.insert(format!("{ENV_PREFIX}{}", key.trim().to_ascii_uppercase()), rendered);
    }
    Ok(pairs)
}
